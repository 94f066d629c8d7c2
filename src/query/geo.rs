//! Geo primitives used by `$nearSphere`, `$within`, `$geoWithin` and
//! `$geoIntersects`.

use serde_json::Value;

/// A latitude/longitude pair in degrees.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct GeoPoint {
    /// Latitude in degrees.
    pub latitude: f64,
    /// Longitude in degrees.
    pub longitude: f64,
}

impl GeoPoint {
    /// Creates a point.
    #[must_use]
    pub const fn new(latitude: f64, longitude: f64) -> Self {
        Self {
            latitude,
            longitude,
        }
    }

    /// Decodes `{"latitude": .., "longitude": ..}` (optionally tagged
    /// `__type: "GeoPoint"`) or a `[latitude, longitude]` pair.
    #[must_use]
    pub fn from_value(value: &Value) -> Option<Self> {
        match value {
            Value::Object(map) => {
                let latitude = map.get("latitude")?.as_f64()?;
                let longitude = map.get("longitude")?.as_f64()?;
                Some(Self::new(latitude, longitude))
            }
            Value::Array(pair) => match pair.as_slice() {
                [lat, lng] => Some(Self::new(lat.as_f64()?, lng.as_f64()?)),
                _ => None,
            },
            _ => None,
        }
    }

    /// Great-circle distance to `other` in radians (haversine).
    #[must_use]
    pub fn radians_to(&self, other: &Self) -> f64 {
        let lat1 = self.latitude.to_radians();
        let lat2 = other.latitude.to_radians();
        let lng1 = self.longitude.to_radians();
        let lng2 = other.longitude.to_radians();
        let sin_dlat = ((lat1 - lat2) / 2.0).sin();
        let sin_dlng = ((lng1 - lng2) / 2.0).sin();
        let a = sin_dlat
            .mul_add(sin_dlat, lat1.cos() * lat2.cos() * sin_dlng * sin_dlng)
            .min(1.0);
        2.0 * a.sqrt().asin()
    }
}

/// Decodes a list of points (objects or `[lat, lng]` pairs).
#[must_use]
pub fn points_from_value(value: &Value) -> Option<Vec<GeoPoint>> {
    value
        .as_array()?
        .iter()
        .map(GeoPoint::from_value)
        .collect()
}

/// Decodes a stored `Polygon` (`{"__type": "Polygon", "coordinates": [[lat, lng], ..]}`).
#[must_use]
pub fn polygon_from_value(value: &Value) -> Option<Vec<GeoPoint>> {
    points_from_value(value.get("coordinates")?)
}

/// Returns `true` if `point` lies strictly inside the box spanned by
/// `south_west` and `north_east`. Inverted or degenerate boxes contain
/// nothing.
#[must_use]
pub fn box_contains(south_west: GeoPoint, north_east: GeoPoint, point: GeoPoint) -> bool {
    if south_west.latitude >= north_east.latitude || south_west.longitude >= north_east.longitude {
        return false;
    }
    point.latitude > south_west.latitude
        && point.latitude < north_east.latitude
        && point.longitude > south_west.longitude
        && point.longitude < north_east.longitude
}

/// Ray-casting point-in-polygon test. Polygons need at least three
/// vertices.
#[must_use]
pub fn polygon_contains(polygon: &[GeoPoint], point: GeoPoint) -> bool {
    let Some(mut previous) = polygon.last().copied() else {
        return false;
    };
    if polygon.len() < 3 {
        return false;
    }

    let (min_lat, max_lat, min_lng, max_lng) = polygon.iter().fold(
        (f64::INFINITY, f64::NEG_INFINITY, f64::INFINITY, f64::NEG_INFINITY),
        |(a, b, c, d), p| {
            (
                a.min(p.latitude),
                b.max(p.latitude),
                c.min(p.longitude),
                d.max(p.longitude),
            )
        },
    );
    if point.latitude < min_lat
        || point.latitude > max_lat
        || point.longitude < min_lng
        || point.longitude > max_lng
    {
        return false;
    }

    let mut inside = false;
    for current in polygon {
        let crosses = (current.longitude > point.longitude)
            != (previous.longitude > point.longitude)
            && point.latitude
                < (previous.latitude - current.latitude) * (point.longitude - current.longitude)
                    / (previous.longitude - current.longitude)
                    + current.latitude;
        if crosses {
            inside = !inside;
        }
        previous = *current;
    }
    inside
}

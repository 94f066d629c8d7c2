//! Pure in-memory evaluation of where-clauses against object snapshots.
//!
//! Matching never touches storage. Constraints that can't be decided
//! locally (`$select`, `$dontSelect`, `$relatedTo`) and unknown operators
//! evaluate to non-match, as do comparisons between incompatible types.

use std::cmp::Ordering;
use std::sync::LazyLock;

use chrono::{DateTime, FixedOffset};
use moka::sync::Cache;
use regex::{Regex, RegexBuilder};
use serde_json::{Map, Value};

use super::geo::{self, GeoPoint};

/// Distinct `$regex` patterns kept compiled across evaluations.
const REGEX_CACHE_CAPACITY: u64 = 1_024;

/// Compiled `$regex` operands keyed by `(pattern, options)`. Invalid
/// patterns are cached as `None`.
static REGEX_CACHE: LazyLock<Cache<(String, String), Option<Regex>>> =
    LazyLock::new(|| Cache::new(REGEX_CACHE_CAPACITY));

/// Returns `true` if `object` satisfies every constraint of `where_clause`.
///
/// A where-clause that is not a JSON object matches nothing.
#[must_use]
pub fn matches_query(object: &Map<String, Value>, where_clause: &Value) -> bool {
    let Some(query) = where_clause.as_object() else {
        return false;
    };
    query
        .iter()
        .all(|(key, constraints)| matches_key_constraints(object, key, constraints))
}

fn matches_key_constraints(object: &Map<String, Value>, key: &str, constraints: &Value) -> bool {
    if constraints.is_null() {
        return false;
    }
    if let Some((head, rest)) = key.split_once('.') {
        let empty = Map::new();
        let sub_object = object.get(head).and_then(Value::as_object).unwrap_or(&empty);
        return matches_key_constraints(sub_object, rest, constraints);
    }

    match key {
        "$or" => return branches(constraints).any(|q| matches_query(object, q)),
        "$and" => return branches(constraints).all(|q| matches_query(object, q)),
        "$nor" => return !branches(constraints).any(|q| matches_query(object, q)),
        "$relatedTo" => return false,
        _ => {}
    }

    let field = object.get(key);
    match constraints {
        Value::Object(ops) => match ops.get("__type").and_then(Value::as_str) {
            Some("Pointer") => any_element(field, |v| same_pointer(v, constraints)),
            Some(_) => any_element(field, |v| values_equal(v, constraints)),
            None => ops
                .iter()
                .all(|(op, operand)| matches_operator(field, op, operand, ops)),
        },
        Value::Array(_) => field.is_some_and(|v| values_equal(v, constraints)),
        scalar => any_element(field, |v| values_equal(v, scalar)),
    }
}

fn branches(constraints: &Value) -> impl Iterator<Item = &Value> {
    constraints.as_array().into_iter().flatten()
}

/// Applies `eq` to the field, or to each element if the field is an array.
fn any_element(field: Option<&Value>, eq: impl Fn(&Value) -> bool) -> bool {
    match field {
        Some(Value::Array(items)) => items.iter().any(eq),
        Some(value) => eq(value),
        None => false,
    }
}

fn matches_operator(
    field: Option<&Value>,
    op: &str,
    operand: &Value,
    siblings: &Map<String, Value>,
) -> bool {
    match op {
        "$lt" => compare(field, operand) == Some(Ordering::Less),
        "$lte" => matches!(
            compare(field, operand),
            Some(Ordering::Less | Ordering::Equal)
        ),
        "$gt" => compare(field, operand) == Some(Ordering::Greater),
        "$gte" => matches!(
            compare(field, operand),
            Some(Ordering::Greater | Ordering::Equal)
        ),
        "$eq" => field.is_some_and(|v| values_equal(v, operand)),
        "$ne" => !field.is_some_and(|v| values_equal(v, operand)),
        "$in" => field.is_some_and(|v| contains(operand, v)),
        "$nin" => !field.is_some_and(|v| contains(operand, v)),
        "$all" => match (field, operand) {
            (Some(Value::Array(items)), Value::Array(required)) => required
                .iter()
                .all(|r| items.iter().any(|i| values_equal(i, r))),
            _ => false,
        },
        "$containedBy" => match (field, operand) {
            (Some(Value::Array(items)), Value::Array(allowed)) => items
                .iter()
                .all(|i| allowed.iter().any(|a| values_equal(a, i))),
            _ => false,
        },
        "$exists" => match operand.as_bool() {
            Some(required) => field.is_some() == required,
            None => true,
        },
        "$regex" => matches_regex(field, operand, siblings.get("$options")),
        "$options" | "$maxDistance" => true,
        "$nearSphere" => near_sphere(field, operand, siblings.get("$maxDistance")),
        "$within" => within_box(field, operand),
        "$geoWithin" => geo_within(field, operand),
        "$geoIntersects" => geo_intersects(field, operand),
        // Sub-queries need storage access: fail closed.
        "$select" | "$dontSelect" => false,
        other => {
            tracing::debug!(operator = other, "unsupported operator in live query");
            false
        }
    }
}

/// Structural equality with numeric, Date and Pointer awareness.
fn values_equal(a: &Value, b: &Value) -> bool {
    if let (Some(x), Some(y)) = (as_tagged_date(a), as_date(b)) {
        return x == y;
    }
    if let (Some(x), Some(y)) = (as_date(a), as_tagged_date(b)) {
        return x == y;
    }
    match (a, b) {
        (Value::Number(x), Value::Number(y)) => x.as_f64() == y.as_f64(),
        (Value::Array(xs), Value::Array(ys)) => {
            xs.len() == ys.len() && xs.iter().zip(ys).all(|(x, y)| values_equal(x, y))
        }
        (Value::Object(xs), Value::Object(ys)) => {
            if is_pointer(a) || is_pointer(b) {
                return same_pointer(a, b);
            }
            xs.len() == ys.len()
                && xs
                    .iter()
                    .all(|(k, x)| ys.get(k).is_some_and(|y| values_equal(x, y)))
        }
        _ => a == b,
    }
}

fn is_pointer(value: &Value) -> bool {
    value.get("__type").and_then(Value::as_str) == Some("Pointer")
}

/// Pointer identity: same `className` and `objectId`. Works for pointers
/// and for included (full) objects.
fn same_pointer(a: &Value, b: &Value) -> bool {
    let id = |v: &Value| {
        Some((
            v.get("className")?.as_str()?.to_string(),
            v.get("objectId")?.as_str()?.to_string(),
        ))
    };
    match (id(a), id(b)) {
        (Some(x), Some(y)) => x == y,
        _ => false,
    }
}

/// `$in` semantics: a pointer needle matches by identity, an array needle
/// matches if any of its elements is in the haystack.
fn contains(haystack: &Value, needle: &Value) -> bool {
    let Some(items) = haystack.as_array() else {
        return false;
    };
    if is_pointer(needle) {
        return items.iter().any(|item| same_pointer(item, needle));
    }
    if let Value::Array(needles) = needle {
        return needles.iter().any(|n| contains(haystack, n));
    }
    items.iter().any(|item| values_equal(item, needle))
}

fn compare(field: Option<&Value>, operand: &Value) -> Option<Ordering> {
    let field = field?;
    if let (Some(a), Some(b)) = (as_date(field), as_date(operand)) {
        return Some(a.cmp(&b));
    }
    match (field, operand) {
        (Value::Number(a), Value::Number(b)) => a.as_f64()?.partial_cmp(&b.as_f64()?),
        (Value::String(a), Value::String(b)) => Some(a.cmp(b)),
        _ => None,
    }
}

/// Decodes `{"__type": "Date", "iso": ..}` only.
fn as_tagged_date(value: &Value) -> Option<DateTime<FixedOffset>> {
    if value.get("__type").and_then(Value::as_str) != Some("Date") {
        return None;
    }
    DateTime::parse_from_rfc3339(value.get("iso")?.as_str()?).ok()
}

/// Decodes a tagged Date or an RFC 3339 string.
fn as_date(value: &Value) -> Option<DateTime<FixedOffset>> {
    match value {
        Value::String(s) => DateTime::parse_from_rfc3339(s).ok(),
        Value::Object(_) => as_tagged_date(value),
        _ => None,
    }
}

fn matches_regex(field: Option<&Value>, pattern: &Value, options: Option<&Value>) -> bool {
    let (Some(subject), Some(pattern)) = (field.and_then(Value::as_str), pattern.as_str()) else {
        return false;
    };
    let options = options.and_then(Value::as_str).unwrap_or_default();
    compiled_regex(pattern, options).is_some_and(|re| re.is_match(subject))
}

/// Returns the compiled form of a `$regex` operand, building it on first
/// use.
fn compiled_regex(pattern: &str, options: &str) -> Option<Regex> {
    REGEX_CACHE.get_with((pattern.to_string(), options.to_string()), || {
        build_regex(pattern, options)
    })
}

fn build_regex(pattern: &str, options: &str) -> Option<Regex> {
    let mut builder = RegexBuilder::new(&translate_quoted(pattern));
    for flag in options.chars() {
        match flag {
            'i' => builder.case_insensitive(true),
            'm' => builder.multi_line(true),
            's' => builder.dot_matches_new_line(true),
            'x' => builder.ignore_whitespace(true),
            _ => &mut builder,
        };
    }
    match builder.build() {
        Ok(re) => Some(re),
        Err(err) => {
            tracing::debug!(error = %err, "invalid $regex in live query");
            None
        }
    }
}

/// Rewrites Perl-style `\Q...\E` literal sections into escaped regex text.
/// An unterminated `\Q` quotes to the end of the pattern.
fn translate_quoted(pattern: &str) -> String {
    let mut out = String::with_capacity(pattern.len());
    let mut rest = pattern;
    while let Some((before, after)) = rest.split_once("\\Q") {
        out.push_str(before);
        match after.split_once("\\E") {
            Some((quoted, tail)) => {
                out.push_str(&regex::escape(quoted));
                rest = tail;
            }
            None => {
                out.push_str(&regex::escape(after));
                rest = "";
            }
        }
    }
    out.push_str(rest);
    out
}

fn near_sphere(field: Option<&Value>, operand: &Value, max_distance: Option<&Value>) -> bool {
    let (Some(point), Some(center)) = (
        field.and_then(GeoPoint::from_value),
        GeoPoint::from_value(operand),
    ) else {
        return false;
    };
    let max = max_distance
        .and_then(Value::as_f64)
        .unwrap_or(f64::INFINITY);
    center.radians_to(&point) <= max
}

fn within_box(field: Option<&Value>, operand: &Value) -> bool {
    let Some(point) = field.and_then(GeoPoint::from_value) else {
        return false;
    };
    let Some(corners) = operand.get("$box").and_then(geo::points_from_value) else {
        return false;
    };
    match corners.as_slice() {
        [south_west, north_east] => geo::box_contains(*south_west, *north_east, point),
        _ => false,
    }
}

fn geo_within(field: Option<&Value>, operand: &Value) -> bool {
    let Some(point) = field.and_then(GeoPoint::from_value) else {
        return false;
    };
    if let Some(polygon) = operand.get("$polygon") {
        return geo::points_from_value(polygon)
            .is_some_and(|vertices| geo::polygon_contains(&vertices, point));
    }
    if let Some(Value::Array(sphere)) = operand.get("$centerSphere") {
        return match sphere.as_slice() {
            [center, radius] => match (GeoPoint::from_value(center), radius.as_f64()) {
                (Some(center), Some(radius)) => point.radians_to(&center) <= radius,
                _ => false,
            },
            _ => false,
        };
    }
    false
}

fn geo_intersects(field: Option<&Value>, operand: &Value) -> bool {
    let Some(point) = operand.get("$point").and_then(GeoPoint::from_value) else {
        return false;
    };
    field
        .and_then(geo::polygon_from_value)
        .is_some_and(|vertices| geo::polygon_contains(&vertices, point))
}

#[cfg(test)]
#[allow(clippy::panic)]
mod tests {
    use super::*;
    use serde_json::json;

    fn obj(value: Value) -> Map<String, Value> {
        let Value::Object(map) = value else {
            panic!("fixture must be an object");
        };
        map
    }

    fn matches(object: Value, query: Value) -> bool {
        matches_query(&obj(object), &query)
    }

    #[test]
    fn empty_query_matches_everything() {
        assert!(matches(json!({ "a": 1 }), json!({})));
        assert!(!matches(json!({ "a": 1 }), json!([])));
    }

    #[test]
    fn equality_and_array_containment() {
        let o = json!({ "name": "ann", "score": 12, "tags": ["red", "blue"] });
        assert!(matches(o.clone(), json!({ "name": "ann" })));
        assert!(!matches(o.clone(), json!({ "name": "bob" })));
        assert!(matches(o.clone(), json!({ "score": 12.0 })));
        assert!(!matches(o.clone(), json!({ "score": "12" })));
        assert!(matches(o.clone(), json!({ "tags": "red" })));
        assert!(!matches(o.clone(), json!({ "tags": "green" })));
        assert!(!matches(o.clone(), json!({ "missing": 1 })));
        assert!(!matches(o, json!({ "name": null })));
    }

    #[test]
    fn range_operators() {
        let o = json!({ "n": 10, "s": "m" });
        assert!(matches(o.clone(), json!({ "n": { "$lt": 11 } })));
        assert!(!matches(o.clone(), json!({ "n": { "$lt": 10 } })));
        assert!(matches(o.clone(), json!({ "n": { "$lte": 10 } })));
        assert!(matches(o.clone(), json!({ "n": { "$gt": 9, "$lt": 11 } })));
        assert!(!matches(o.clone(), json!({ "n": { "$gte": 11 } })));
        assert!(matches(o.clone(), json!({ "s": { "$gt": "a" } })));
        assert!(!matches(o.clone(), json!({ "n": { "$gt": "a" } })));
        assert!(!matches(o, json!({ "missing": { "$lt": 5 } })));
    }

    #[test]
    fn date_comparisons() {
        let o = json!({
            "when": { "__type": "Date", "iso": "2024-05-01T00:00:00.000Z" },
            "updatedAt": "2024-05-02T10:00:00.000Z"
        });
        assert!(matches(
            o.clone(),
            json!({ "when": { "$gt": { "__type": "Date", "iso": "2024-04-30T00:00:00.000Z" } } })
        ));
        assert!(matches(
            o.clone(),
            json!({
                "updatedAt": { "$lt": { "__type": "Date", "iso": "2024-06-01T00:00:00.000Z" } }
            })
        ));
        assert!(matches(
            o,
            json!({ "when": { "__type": "Date", "iso": "2024-05-01T00:00:00Z" } })
        ));
    }

    #[test]
    fn ne_in_nin() {
        let o = json!({ "n": 3, "tags": ["a", "b"] });
        assert!(matches(o.clone(), json!({ "n": { "$ne": 4 } })));
        assert!(!matches(o.clone(), json!({ "n": { "$ne": 3 } })));
        assert!(matches(o.clone(), json!({ "missing": { "$ne": 3 } })));
        assert!(matches(o.clone(), json!({ "n": { "$in": [1, 2, 3] } })));
        assert!(!matches(o.clone(), json!({ "n": { "$in": [1, 2] } })));
        assert!(matches(o.clone(), json!({ "tags": { "$in": ["b", "z"] } })));
        assert!(matches(o.clone(), json!({ "n": { "$nin": [1, 2] } })));
        assert!(!matches(o.clone(), json!({ "n": { "$nin": [3] } })));
        assert!(matches(o, json!({ "missing": { "$nin": [3] } })));
    }

    #[test]
    fn all_and_contained_by() {
        let o = json!({ "tags": ["a", "b", "c"] });
        assert!(matches(o.clone(), json!({ "tags": { "$all": ["c", "a"] } })));
        assert!(!matches(o.clone(), json!({ "tags": { "$all": ["a", "z"] } })));
        assert!(matches(
            o.clone(),
            json!({ "tags": { "$containedBy": ["a", "b", "c", "d"] } })
        ));
        assert!(!matches(o.clone(), json!({ "tags": { "$containedBy": ["a"] } })));
        assert!(!matches(json!({ "tags": "a" }), json!({ "tags": { "$all": ["a"] } })));
        assert!(matches(o, json!({ "tags": ["a", "b", "c"] })));
    }

    #[test]
    fn exists() {
        let o = json!({ "a": 1, "n": null });
        assert!(matches(o.clone(), json!({ "a": { "$exists": true } })));
        assert!(!matches(o.clone(), json!({ "a": { "$exists": false } })));
        assert!(matches(o.clone(), json!({ "b": { "$exists": false } })));
        assert!(!matches(o.clone(), json!({ "b": { "$exists": true } })));
        assert!(matches(o, json!({ "n": { "$exists": true } })));
    }

    #[test]
    fn regex_with_options_and_quoting() {
        let o = json!({ "name": "Hello.World (v2)" });
        assert!(matches(o.clone(), json!({ "name": { "$regex": "^Hello" } })));
        assert!(!matches(o.clone(), json!({ "name": { "$regex": "^hello" } })));
        assert!(matches(
            o.clone(),
            json!({ "name": { "$regex": "^hello", "$options": "i" } })
        ));
        assert!(matches(o.clone(), json!({ "name": { "$regex": "\\Q.World (\\E" } })));
        assert!(!matches(
            json!({ "name": "HelloxWorld (v2)" }),
            json!({ "name": { "$regex": "\\Q.World\\E" } })
        ));
        assert!(matches(o.clone(), json!({ "name": { "$regex": "^\\QHello.\\EWorld" } })));
        assert!(matches(o.clone(), json!({ "name": { "$regex": "\\Q(v2)" } })));
        assert!(!matches(o.clone(), json!({ "name": { "$regex": "(" } })));
        assert!(!matches(json!({ "name": 5 }), json!({ "name": { "$regex": "5" } })));
    }

    #[test]
    fn regex_operands_are_compiled_once() {
        let pattern = "^cached-[0-9]+$";
        let key = (pattern.to_string(), "i".to_string());
        assert!(!REGEX_CACHE.contains_key(&key));

        let where_clause = json!({ "code": { "$regex": pattern, "$options": "i" } });
        assert!(matches(json!({ "code": "CACHED-42" }), where_clause.clone()));
        assert!(REGEX_CACHE.contains_key(&key));
        assert!(!matches(json!({ "code": "cached-x" }), where_clause));

        let invalid = ("(cached".to_string(), String::new());
        assert!(!matches(
            json!({ "code": "(cached" }),
            json!({ "code": { "$regex": "(cached" } })
        ));
        assert!(matches!(REGEX_CACHE.get(&invalid), Some(None)));
    }

    #[test]
    fn translate_quoted_escapes_specials() {
        assert_eq!(translate_quoted("a\\Q.*\\Eb"), "a\\.\\*b");
        assert_eq!(translate_quoted("plain"), "plain");
        assert_eq!(translate_quoted("\\Q[x]"), "\\[x\\]");
    }

    #[test]
    fn pointer_equality() {
        let o = json!({
            "owner": { "__type": "Pointer", "className": "_User", "objectId": "u1" },
            "members": [
                { "__type": "Pointer", "className": "_User", "objectId": "u2" },
                { "__type": "Pointer", "className": "_User", "objectId": "u3" }
            ]
        });
        let u1 = json!({ "__type": "Pointer", "className": "_User", "objectId": "u1" });
        let u3 = json!({ "__type": "Pointer", "className": "_User", "objectId": "u3" });
        let other = json!({ "__type": "Pointer", "className": "Team", "objectId": "u1" });
        assert!(matches(o.clone(), json!({ "owner": u1.clone() })));
        assert!(!matches(o.clone(), json!({ "owner": other })));
        assert!(matches(o.clone(), json!({ "members": u3.clone() })));
        assert!(matches(o.clone(), json!({ "owner": { "$in": [u3, u1] } })));
    }

    #[test]
    fn or_and_nor() {
        let o = json!({ "a": 1, "b": 2 });
        assert!(matches(o.clone(), json!({ "$or": [{ "a": 5 }, { "b": 2 }] })));
        assert!(!matches(o.clone(), json!({ "$or": [{ "a": 5 }, { "b": 5 }] })));
        assert!(matches(o.clone(), json!({ "$and": [{ "a": 1 }, { "b": 2 }] })));
        assert!(!matches(o.clone(), json!({ "$and": [{ "a": 1 }, { "b": 3 }] })));
        assert!(matches(o.clone(), json!({ "$nor": [{ "a": 5 }] })));
        assert!(!matches(o.clone(), json!({ "$nor": [{ "a": 1 }] })));
        assert!(matches(
            o,
            json!({ "$or": [{ "$or": [{ "a": 9 }, { "a": 1 }] }], "b": { "$gt": 1 } })
        ));
    }

    #[test]
    fn dotted_paths() {
        let o = json!({ "profile": { "address": { "city": "Oslo" }, "age": 30 } });
        assert!(matches(o.clone(), json!({ "profile.address.city": "Oslo" })));
        assert!(matches(o.clone(), json!({ "profile.age": { "$gte": 30 } })));
        assert!(!matches(o.clone(), json!({ "profile.address.zip": "0150" })));
        assert!(!matches(o, json!({ "nothing.here": 1 })));
    }

    #[test]
    fn near_sphere() {
        let o = json!({ "loc": { "__type": "GeoPoint", "latitude": 10.0, "longitude": 10.0 } });
        let here = json!({ "__type": "GeoPoint", "latitude": 10.0, "longitude": 10.1 });
        assert!(matches(o.clone(), json!({ "loc": { "$nearSphere": here.clone() } })));
        assert!(matches(
            o.clone(),
            json!({ "loc": { "$nearSphere": here.clone(), "$maxDistance": 0.01 } })
        ));
        assert!(!matches(
            o.clone(),
            json!({ "loc": { "$nearSphere": here, "$maxDistance": 0.0001 } })
        ));
        assert!(!matches(
            json!({}),
            json!({ "loc": { "$nearSphere": { "latitude": 0, "longitude": 0 } } })
        ));
    }

    #[test]
    fn within_box() {
        let o = json!({ "loc": { "__type": "GeoPoint", "latitude": 5.0, "longitude": 5.0 } });
        let sw = json!({ "__type": "GeoPoint", "latitude": 0, "longitude": 0 });
        let ne = json!({ "__type": "GeoPoint", "latitude": 10, "longitude": 10 });
        assert!(matches(
            o.clone(),
            json!({ "loc": { "$within": { "$box": [sw.clone(), ne.clone()] } } })
        ));
        assert!(!matches(o.clone(), json!({ "loc": { "$within": { "$box": [ne, sw.clone()] } } })));
        assert!(!matches(o, json!({ "loc": { "$within": { "$box": [sw.clone(), sw] } } })));
    }

    #[test]
    fn geo_within_and_intersects() {
        let o = json!({
            "loc": { "__type": "GeoPoint", "latitude": 5.0, "longitude": 5.0 },
            "area": { "__type": "Polygon", "coordinates": [[0, 0], [0, 10], [10, 10], [10, 0]] }
        });
        assert!(matches(
            o.clone(),
            json!({ "loc": { "$geoWithin": { "$polygon": [[0, 0], [0, 10], [10, 10], [10, 0]] } } })
        ));
        assert!(!matches(
            o.clone(),
            json!({ "loc": { "$geoWithin": { "$polygon": [[20, 20], [20, 30], [30, 30]] } } })
        ));
        assert!(matches(
            o.clone(),
            json!({ "loc": { "$geoWithin": { "$centerSphere": [[5, 5.1], 0.01] } } })
        ));
        assert!(matches(
            o.clone(),
            json!({ "area": { "$geoIntersects": { "$point": { "latitude": 1, "longitude": 1 } } } })
        ));
        assert!(!matches(
            o,
            json!({
                "area": { "$geoIntersects": { "$point": { "latitude": 11, "longitude": 1 } } }
            })
        ));
    }

    #[test]
    fn unresolvable_and_unknown_operators_fail_closed() {
        let o = json!({ "a": 1 });
        assert!(!matches(
            o.clone(),
            json!({ "a": { "$select": { "query": { "className": "B" }, "key": "x" } } })
        ));
        assert!(!matches(o.clone(), json!({ "a": { "$dontSelect": {} } })));
        assert!(!matches(o.clone(), json!({ "a": { "$bogus": 1 } })));
        assert!(!matches(o, json!({ "$relatedTo": { "key": "x" } })));
    }
}

//! Object snapshots carried by the change feed.

use serde_json::{Map, Value};

use super::Acl;
use crate::error::LiveQueryError;

/// Fields always kept when an event is reduced to a field selection.
pub const DEFAULT_FIELDS: [&str; 5] = ["className", "objectId", "updatedAt", "createdAt", "ACL"];

/// Fields never shown to non-master clients on `_User` / `_Session`.
const SENSITIVE_FIELDS: [&str; 2] = ["sessionToken", "authData"];

/// Full JSON snapshot of a stored object (`className`, `objectId`, `ACL`
/// plus arbitrary fields).
#[derive(Debug, Clone, PartialEq)]
pub struct LiveObject {
    fields: Map<String, Value>,
}

impl LiveObject {
    /// Inflates an object from its JSON form.
    ///
    /// # Errors
    ///
    /// Returns [`LiveQueryError::InvalidRequest`] if the value is not an
    /// object or lacks a string `className` / `objectId`.
    pub fn from_value(value: Value) -> Result<Self, LiveQueryError> {
        let Value::Object(fields) = value else {
            return Err(LiveQueryError::InvalidRequest(
                "object snapshot must be a JSON object".to_string(),
            ));
        };
        for required in ["className", "objectId"] {
            if !fields.get(required).is_some_and(Value::is_string) {
                return Err(LiveQueryError::InvalidRequest(format!(
                    "object snapshot is missing {required}"
                )));
            }
        }
        Ok(Self { fields })
    }

    /// Returns the object's class name.
    #[must_use]
    pub fn class_name(&self) -> &str {
        self.fields
            .get("className")
            .and_then(Value::as_str)
            .unwrap_or_default()
    }

    /// Returns the object's id.
    #[must_use]
    pub fn object_id(&self) -> &str {
        self.fields
            .get("objectId")
            .and_then(Value::as_str)
            .unwrap_or_default()
    }

    /// Returns the decoded ACL, or `None` if the object carries none.
    #[must_use]
    pub fn acl(&self) -> Option<Acl> {
        match self.fields.get("ACL") {
            None | Some(Value::Null) => None,
            Some(value) => Some(Acl::from_json(value)),
        }
    }

    /// Returns a field value.
    #[must_use]
    pub fn get(&self, field: &str) -> Option<&Value> {
        self.fields.get(field)
    }

    /// Returns the underlying field map.
    #[must_use]
    pub fn as_map(&self) -> &Map<String, Value> {
        &self.fields
    }

    /// Returns a mutable handle on the field map (used by `afterEvent` hooks).
    pub fn as_map_mut(&mut self) -> &mut Map<String, Value> {
        &mut self.fields
    }

    /// Serializes the object, reduced to [`DEFAULT_FIELDS`] plus `fields`
    /// when a selection is given. The snapshot itself is left untouched.
    #[must_use]
    pub fn to_json_with_fields(&self, fields: Option<&[String]>) -> Value {
        let Some(fields) = fields else {
            return Value::Object(self.fields.clone());
        };
        let mut limited = Map::new();
        let wanted = DEFAULT_FIELDS
            .iter()
            .copied()
            .chain(fields.iter().map(String::as_str));
        for field in wanted {
            if let Some(value) = self.fields.get(field) {
                limited.insert(field.to_string(), value.clone());
            }
        }
        Value::Object(limited)
    }

    /// Removes credentials from `_User` and `_Session` snapshots.
    pub fn strip_sensitive_fields(&mut self) {
        if matches!(self.class_name(), "_User" | "_Session") {
            for field in SENSITIVE_FIELDS {
                self.fields.remove(field);
            }
        }
    }
}

#[cfg(test)]
#[allow(clippy::panic)]
mod tests {
    use super::*;
    use serde_json::json;

    fn note() -> LiveObject {
        let Ok(obj) = LiveObject::from_value(json!({
            "className": "Note",
            "objectId": "N1",
            "createdAt": "2024-01-01T00:00:00.000Z",
            "ACL": { "*": { "read": true } },
            "title": "hello",
            "body": "world"
        })) else {
            panic!("valid object");
        };
        obj
    }

    #[test]
    fn rejects_missing_class_name() {
        assert!(LiveObject::from_value(json!({ "objectId": "x" })).is_err());
        assert!(LiveObject::from_value(json!([1, 2])).is_err());
    }

    #[test]
    fn projection_keeps_defaults_and_selection() {
        let obj = note();
        let fields = vec!["title".to_string(), "missing".to_string()];
        let projected = obj.to_json_with_fields(Some(&fields));
        assert_eq!(
            projected,
            json!({
                "className": "Note",
                "objectId": "N1",
                "createdAt": "2024-01-01T00:00:00.000Z",
                "ACL": { "*": { "read": true } },
                "title": "hello"
            })
        );
        // projection must not touch the shared snapshot
        assert_eq!(obj.get("body"), Some(&json!("world")));
    }

    #[test]
    fn strips_session_token_from_users() {
        let Ok(mut user) = LiveObject::from_value(json!({
            "className": "_User",
            "objectId": "u1",
            "sessionToken": "r:abc",
            "authData": {},
            "username": "ann"
        })) else {
            panic!("valid object");
        };
        user.strip_sensitive_fields();
        assert!(user.get("sessionToken").is_none());
        assert!(user.get("authData").is_none());
        assert_eq!(user.get("username"), Some(&json!("ann")));
    }

    #[test]
    fn acl_absent_is_none() {
        let Ok(obj) = LiveObject::from_value(json!({ "className": "A", "objectId": "1" })) else {
            panic!("valid object");
        };
        assert!(obj.acl().is_none());
        assert!(note().acl().is_some_and(|acl| acl.public_read_access()));
    }
}

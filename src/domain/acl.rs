//! Per-object access control lists.
//!
//! An ACL maps `"*"`, a user id, or `"role:<name>"` to a read/write pair.
//! Only read access matters for live-query delivery.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

/// Key granting access to everyone.
pub const PUBLIC_KEY: &str = "*";

/// Prefix of role entries.
pub const ROLE_PREFIX: &str = "role:";

/// Read/write permission pair for a single ACL entry.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Permission {
    /// Whether the entry grants read access.
    #[serde(default)]
    pub read: bool,
    /// Whether the entry grants write access.
    #[serde(default)]
    pub write: bool,
}

/// Access control list attached to an object.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Acl {
    entries: HashMap<String, Permission>,
}

impl Acl {
    /// Creates an empty (fully private) ACL.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Decodes an ACL from its JSON form.
    ///
    /// A value that doesn't decode yields an empty ACL, which grants read
    /// access to nobody but master-key clients.
    #[must_use]
    pub fn from_json(value: &serde_json::Value) -> Self {
        match serde_json::from_value::<Self>(value.clone()) {
            Ok(acl) => acl,
            Err(err) => {
                tracing::warn!(error = %err, "malformed ACL treated as private");
                Self::default()
            }
        }
    }

    /// Sets read access for an entry key.
    pub fn set_read_access(&mut self, key: impl Into<String>, allowed: bool) {
        self.entries.entry(key.into()).or_default().read = allowed;
    }

    /// Sets read access for a role.
    pub fn set_role_read_access(&mut self, role: &str, allowed: bool) {
        self.set_read_access(format!("{ROLE_PREFIX}{role}"), allowed);
    }

    /// Returns `true` if the ACL grants public read access.
    #[must_use]
    pub fn public_read_access(&self) -> bool {
        self.read_access(PUBLIC_KEY)
    }

    /// Returns `true` if the entry key (user id or `role:` key) may read.
    #[must_use]
    pub fn read_access(&self, key: &str) -> bool {
        self.entries.get(key).is_some_and(|p| p.read)
    }

    /// Returns `true` if the named role may read. Accepts the name with or
    /// without the `role:` prefix.
    #[must_use]
    pub fn role_read_access(&self, role: &str) -> bool {
        if role.starts_with(ROLE_PREFIX) {
            self.read_access(role)
        } else {
            self.read_access(&format!("{ROLE_PREFIX}{role}"))
        }
    }

    /// Returns `true` if any entry refers to a role.
    #[must_use]
    pub fn has_role_entries(&self) -> bool {
        self.entries.keys().any(|k| k.starts_with(ROLE_PREFIX))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn decodes_partial_permissions() {
        let acl = Acl::from_json(&json!({
            "*": { "read": true },
            "u1": { "write": true },
            "role:admin": { "read": true, "write": true }
        }));
        assert!(acl.public_read_access());
        assert!(!acl.read_access("u1"));
        assert!(acl.role_read_access("admin"));
        assert!(acl.role_read_access("role:admin"));
        assert!(acl.has_role_entries());
    }

    #[test]
    fn malformed_acl_is_private() {
        let acl = Acl::from_json(&json!("not an acl"));
        assert!(!acl.public_read_access());
        assert!(!acl.has_role_entries());
    }

    #[test]
    fn setters_grant_access() {
        let mut acl = Acl::new();
        acl.set_read_access("u1", true);
        acl.set_role_read_access("mods", true);
        assert!(acl.read_access("u1"));
        assert!(acl.role_read_access("mods"));
        assert!(!acl.public_read_access());
    }
}

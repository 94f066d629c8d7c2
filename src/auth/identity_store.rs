//! Identity lookups behind the ACL resolver.
//!
//! [`IdentityStore`] is the seam between the live-query engine and the
//! backend's user database: it resolves session tokens to user ids and
//! walks role memberships. [`InMemoryIdentityStore`] backs tests and
//! single-process deployments; the PostgreSQL store lives in
//! [`super::postgres`].

use std::collections::HashMap;

use async_trait::async_trait;
use tokio::sync::RwLock;

use crate::error::LiveQueryError;

/// A role row: object id plus display name (used in `role:<name>` ACL keys).
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RoleRef {
    /// Role object id.
    pub id: String,
    /// Role name.
    pub name: String,
}

impl RoleRef {
    /// Creates a role reference.
    #[must_use]
    pub fn new(id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
        }
    }
}

/// Read-only access to sessions and roles.
#[async_trait]
pub trait IdentityStore: Send + Sync + std::fmt::Debug {
    /// Resolves a session token to its user id. Unknown or expired
    /// sessions resolve to `None`.
    ///
    /// # Errors
    ///
    /// Returns [`LiveQueryError::IdentityStore`] if the backend fails.
    async fn user_for_session(&self, session_token: &str) -> Result<Option<String>, LiveQueryError>;

    /// Returns the roles a user is a direct member of.
    ///
    /// # Errors
    ///
    /// Returns [`LiveQueryError::IdentityStore`] if the backend fails.
    async fn roles_for_user(&self, user_id: &str) -> Result<Vec<RoleRef>, LiveQueryError>;

    /// Returns the roles that list any of `role_ids` as a child role, i.e.
    /// the roles whose permissions members of `role_ids` inherit.
    ///
    /// # Errors
    ///
    /// Returns [`LiveQueryError::IdentityStore`] if the backend fails.
    async fn parent_roles(&self, role_ids: &[String]) -> Result<Vec<RoleRef>, LiveQueryError>;
}

#[derive(Debug, Default)]
struct Directory {
    sessions: HashMap<String, String>,
    roles: HashMap<String, String>,
    user_roles: HashMap<String, Vec<String>>,
    // child role id -> parent role ids
    parents: HashMap<String, Vec<String>>,
}

impl Directory {
    fn role_refs<'a>(&self, ids: impl Iterator<Item = &'a String>) -> Vec<RoleRef> {
        ids.filter_map(|id| {
            self.roles
                .get(id)
                .map(|name| RoleRef::new(id.clone(), name.clone()))
        })
        .collect()
    }
}

/// Process-local identity directory.
#[derive(Debug, Default)]
pub struct InMemoryIdentityStore {
    inner: RwLock<Directory>,
}

impl InMemoryIdentityStore {
    /// Creates an empty directory.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a session token for a user.
    pub async fn insert_session(
        &self,
        session_token: impl Into<String>,
        user_id: impl Into<String>,
    ) {
        let mut dir = self.inner.write().await;
        dir.sessions.insert(session_token.into(), user_id.into());
    }

    /// Revokes a session token.
    pub async fn revoke_session(&self, session_token: &str) {
        let mut dir = self.inner.write().await;
        dir.sessions.remove(session_token);
    }

    /// Creates (or renames) a role.
    pub async fn insert_role(&self, role_id: impl Into<String>, name: impl Into<String>) {
        let mut dir = self.inner.write().await;
        dir.roles.insert(role_id.into(), name.into());
    }

    /// Adds a user to a role.
    pub async fn add_user_to_role(&self, user_id: impl Into<String>, role_id: impl Into<String>) {
        let mut dir = self.inner.write().await;
        dir.user_roles
            .entry(user_id.into())
            .or_default()
            .push(role_id.into());
    }

    /// Makes `child_id` a member of `parent_id`: members of the child
    /// inherit the parent's permissions.
    pub async fn add_child_role(&self, parent_id: impl Into<String>, child_id: impl Into<String>) {
        let mut dir = self.inner.write().await;
        dir.parents
            .entry(child_id.into())
            .or_default()
            .push(parent_id.into());
    }
}

#[async_trait]
impl IdentityStore for InMemoryIdentityStore {
    async fn user_for_session(
        &self,
        session_token: &str,
    ) -> Result<Option<String>, LiveQueryError> {
        Ok(self.inner.read().await.sessions.get(session_token).cloned())
    }

    async fn roles_for_user(&self, user_id: &str) -> Result<Vec<RoleRef>, LiveQueryError> {
        let dir = self.inner.read().await;
        Ok(dir
            .user_roles
            .get(user_id)
            .map(|ids| dir.role_refs(ids.iter()))
            .unwrap_or_default())
    }

    async fn parent_roles(&self, role_ids: &[String]) -> Result<Vec<RoleRef>, LiveQueryError> {
        let dir = self.inner.read().await;
        Ok(dir.role_refs(
            role_ids
                .iter()
                .filter_map(|id| dir.parents.get(id))
                .flatten(),
        ))
    }
}

#[cfg(test)]
#[allow(clippy::panic)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn sessions_resolve_and_revoke() {
        let store = InMemoryIdentityStore::new();
        store.insert_session("r:abc", "u1").await;

        let Ok(user) = store.user_for_session("r:abc").await else {
            panic!("lookup failed");
        };
        assert_eq!(user.as_deref(), Some("u1"));

        store.revoke_session("r:abc").await;
        let Ok(user) = store.user_for_session("r:abc").await else {
            panic!("lookup failed");
        };
        assert!(user.is_none());
    }

    #[tokio::test]
    async fn roles_and_parents() {
        let store = InMemoryIdentityStore::new();
        store.insert_role("r1", "editors").await;
        store.insert_role("r2", "staff").await;
        store.add_user_to_role("u1", "r1").await;
        store.add_child_role("r2", "r1").await;

        let Ok(direct) = store.roles_for_user("u1").await else {
            panic!("lookup failed");
        };
        assert_eq!(direct, vec![RoleRef::new("r1", "editors")]);

        let Ok(parents) = store.parent_roles(&["r1".to_string()]).await else {
            panic!("lookup failed");
        };
        assert_eq!(parents, vec![RoleRef::new("r2", "staff")]);

        let Ok(none) = store.roles_for_user("nobody").await else {
            panic!("lookup failed");
        };
        assert!(none.is_empty());
    }
}

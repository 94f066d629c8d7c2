//! Cached session and role resolution, and per-delivery ACL checks.

use std::collections::HashSet;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use moka::future::Cache;

use super::identity_store::IdentityStore;
use crate::domain::Acl;
use crate::error::LiveQueryError;

/// Cached outcome of a session-token lookup. A cache miss is the third
/// state: nothing is known yet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionState {
    /// The token resolves to this user id.
    Valid(String),
    /// The store has no live session for the token.
    KnownInvalid,
}

/// Credentials of one fan-out target.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AccessContext {
    /// The client connected with the master key.
    pub has_master_key: bool,
    /// Token supplied with `subscribe`.
    pub subscription_token: Option<String>,
    /// Token supplied with `connect`.
    pub connection_token: Option<String>,
}

/// Resolves session tokens and role memberships through an
/// [`IdentityStore`], caching both.
#[derive(Clone)]
pub struct SessionResolver {
    store: Arc<dyn IdentityStore>,
    sessions: Cache<String, SessionState>,
    roles: Cache<String, Arc<Vec<String>>>,
}

impl fmt::Debug for SessionResolver {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionResolver")
            .field("store", &self.store)
            .field("cached_sessions", &self.sessions.entry_count())
            .field("cached_roles", &self.roles.entry_count())
            .finish()
    }
}

impl SessionResolver {
    /// Creates a resolver whose caches hold at most `max_size` entries
    /// each, for `ttl`.
    #[must_use]
    pub fn new(store: Arc<dyn IdentityStore>, ttl: Duration, max_size: u64) -> Self {
        let sessions = Cache::builder()
            .max_capacity(max_size)
            .time_to_live(ttl)
            .build();
        let roles = Cache::builder()
            .max_capacity(max_size)
            .time_to_live(ttl)
            .build();
        Self {
            store,
            sessions,
            roles,
        }
    }

    /// Resolves a session token to a user id.
    ///
    /// Both outcomes are cached; store failures are not.
    ///
    /// # Errors
    ///
    /// Propagates [`LiveQueryError::IdentityStore`] from the store.
    pub async fn user_id(&self, session_token: &str) -> Result<Option<String>, LiveQueryError> {
        if let Some(state) = self.sessions.get(session_token).await {
            return Ok(match state {
                SessionState::Valid(user_id) => Some(user_id),
                SessionState::KnownInvalid => None,
            });
        }

        let user_id = self.store.user_for_session(session_token).await?;
        let state = user_id
            .clone()
            .map_or(SessionState::KnownInvalid, SessionState::Valid);
        self.sessions.insert(session_token.to_string(), state).await;
        Ok(user_id)
    }

    /// Returns the names of every role the user holds, directly or through
    /// inheritance.
    ///
    /// # Errors
    ///
    /// Propagates [`LiveQueryError::IdentityStore`] from the store.
    pub async fn role_names(&self, user_id: &str) -> Result<Arc<Vec<String>>, LiveQueryError> {
        if let Some(names) = self.roles.get(user_id).await {
            return Ok(names);
        }

        let mut visited: HashSet<String> = HashSet::new();
        let mut names = Vec::new();
        let mut frontier = self.store.roles_for_user(user_id).await?;
        while !frontier.is_empty() {
            let fresh: Vec<String> = frontier
                .into_iter()
                .filter(|role| visited.insert(role.id.clone()))
                .map(|role| {
                    names.push(role.name);
                    role.id
                })
                .collect();
            if fresh.is_empty() {
                break;
            }
            frontier = self.store.parent_roles(&fresh).await?;
        }

        let names = Arc::new(names);
        self.roles
            .insert(user_id.to_string(), Arc::clone(&names))
            .await;
        Ok(names)
    }

    /// Drops the cached roles of a user.
    pub async fn clear_cached_roles(&self, user_id: &str) {
        self.roles.invalidate(user_id).await;
        tracing::debug!(user_id, "role cache cleared");
    }

    /// Checks whether the user behind `session_token` may read under `acl`,
    /// directly or through a role.
    ///
    /// # Errors
    ///
    /// Propagates [`LiveQueryError::IdentityStore`] from the store.
    pub async fn verify_acl(&self, acl: &Acl, session_token: &str) -> Result<bool, LiveQueryError> {
        let Some(user_id) = self.user_id(session_token).await? else {
            return Ok(false);
        };
        if acl.read_access(&user_id) {
            return Ok(true);
        }
        if !acl.has_role_entries() {
            return Ok(false);
        }
        let roles = self.role_names(&user_id).await?;
        Ok(roles.iter().any(|name| acl.role_read_access(name)))
    }

    /// Decides whether one delivery may proceed.
    ///
    /// Tries the subscription token first, then the connection token.
    /// Resolver failures count as a denial.
    pub async fn authorize(&self, acl: Option<&Acl>, ctx: &AccessContext) -> bool {
        let Some(acl) = acl else {
            return true;
        };
        if acl.public_read_access() || ctx.has_master_key {
            return true;
        }
        for token in [&ctx.subscription_token, &ctx.connection_token]
            .into_iter()
            .flatten()
        {
            match self.verify_acl(acl, token).await {
                Ok(true) => return true,
                Ok(false) => {}
                Err(err) => tracing::warn!(error = %err, "ACL resolution failed, denying"),
            }
        }
        false
    }
}

//! PostgreSQL implementation of [`IdentityStore`].
//!
//! Reads the backend's own tables: `_Session` for tokens, `_Role` for
//! role names and the `_Join:users:_Role` / `_Join:roles:_Role` relation
//! tables for memberships (`owningId` is the role, `relatedId` the member).

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::PgPool;
use sqlx::postgres::PgPoolOptions;

use super::identity_store::{IdentityStore, RoleRef};
use crate::error::LiveQueryError;

/// PostgreSQL-backed identity store using `sqlx::PgPool`.
#[derive(Debug, Clone)]
pub struct PostgresIdentityStore {
    pool: PgPool,
}

impl PostgresIdentityStore {
    /// Creates a store over an existing connection pool.
    #[must_use]
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Opens a connection pool and wraps it.
    ///
    /// # Errors
    ///
    /// Returns a [`LiveQueryError::IdentityStore`] if the database is
    /// unreachable.
    pub async fn connect(
        database_url: &str,
        max_connections: u32,
        connect_timeout: Duration,
    ) -> Result<Self, LiveQueryError> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .acquire_timeout(connect_timeout)
            .connect(database_url)
            .await
            .map_err(|e| LiveQueryError::IdentityStore(e.to_string()))?;
        tracing::info!(max_connections, "identity store connected");
        Ok(Self::new(pool))
    }
}

/// A session without `expiresAt` never expires.
fn session_is_live(expires_at: Option<DateTime<Utc>>, now: DateTime<Utc>) -> bool {
    expires_at.is_none_or(|at| at > now)
}

#[async_trait]
impl IdentityStore for PostgresIdentityStore {
    async fn user_for_session(
        &self,
        session_token: &str,
    ) -> Result<Option<String>, LiveQueryError> {
        let row = sqlx::query_as::<_, (Option<String>, Option<DateTime<Utc>>)>(
            r#"SELECT "user", "expiresAt" FROM "_Session" WHERE "sessionToken" = $1 LIMIT 1"#,
        )
        .bind(session_token)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| LiveQueryError::IdentityStore(e.to_string()))?;

        Ok(match row {
            Some((user, expires_at)) if session_is_live(expires_at, Utc::now()) => user,
            Some(_) => {
                tracing::debug!("session token expired");
                None
            }
            None => None,
        })
    }

    async fn roles_for_user(&self, user_id: &str) -> Result<Vec<RoleRef>, LiveQueryError> {
        let rows = sqlx::query_as::<_, (String, String)>(
            r#"SELECT r."objectId", r."name" FROM "_Role" r
               JOIN "_Join:users:_Role" j ON j."owningId" = r."objectId"
               WHERE j."relatedId" = $1"#,
        )
        .bind(user_id)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| LiveQueryError::IdentityStore(e.to_string()))?;

        Ok(rows
            .into_iter()
            .map(|(id, name)| RoleRef { id, name })
            .collect())
    }

    async fn parent_roles(&self, role_ids: &[String]) -> Result<Vec<RoleRef>, LiveQueryError> {
        if role_ids.is_empty() {
            return Ok(Vec::new());
        }
        let rows = sqlx::query_as::<_, (String, String)>(
            r#"SELECT DISTINCT r."objectId", r."name" FROM "_Role" r
               JOIN "_Join:roles:_Role" j ON j."owningId" = r."objectId"
               WHERE j."relatedId" = ANY($1)"#,
        )
        .bind(role_ids)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| LiveQueryError::IdentityStore(e.to_string()))?;

        Ok(rows
            .into_iter()
            .map(|(id, name)| RoleRef { id, name })
            .collect())
    }
}

//! DTOs of the system endpoints.

use serde::Serialize;
use utoipa::ToSchema;

use crate::service::LiveQueryStats;

/// Health check response.
#[derive(Debug, Serialize, ToSchema)]
pub struct HealthResponse {
    /// Always `"healthy"` when the server answers.
    pub status: String,
    /// Current server time (RFC 3339).
    pub timestamp: String,
    /// Crate version.
    pub version: String,
}

/// Registry counters of the live-query server.
#[derive(Debug, Serialize, ToSchema)]
pub struct StatsResponse {
    /// Application id of the change feed.
    pub application_id: String,
    /// Backend URL.
    pub server_url: String,
    /// Connected clients.
    pub clients: usize,
    /// Live subscriptions.
    pub subscriptions: usize,
    /// Classes with at least one subscription.
    pub classes: usize,
}

impl StatsResponse {
    /// Builds the response from registry counters.
    #[must_use]
    pub fn new(application_id: &str, server_url: &str, stats: LiveQueryStats) -> Self {
        Self {
            application_id: application_id.to_string(),
            server_url: server_url.to_string(),
            clients: stats.clients,
            subscriptions: stats.subscriptions,
            classes: stats.classes,
        }
    }
}

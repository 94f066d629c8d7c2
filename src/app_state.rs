//! Shared application state injected into all Axum handlers.

use std::sync::Arc;

use crate::config::LiveQueryConfig;
use crate::pubsub::Publisher;
use crate::service::LiveQueryService;

/// Shared application state available to all handlers via Axum's
/// `State` extractor.
#[derive(Debug, Clone)]
pub struct AppState {
    /// Live-query orchestrator.
    pub service: LiveQueryService,
    /// Publisher onto the change-feed bus (REST ingress).
    pub publisher: Arc<dyn Publisher>,
    /// Loaded configuration.
    pub config: Arc<LiveQueryConfig>,
}

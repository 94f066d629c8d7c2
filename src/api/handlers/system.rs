//! System endpoints: health check and registry stats.

use axum::extract::State;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::get;
use axum::{Json, Router};
use chrono::Utc;

use crate::api::dto::{HealthResponse, StatsResponse};
use crate::app_state::AppState;

/// `GET /health`: Service health status.
#[utoipa::path(
    get,
    path = "/health",
    tag = "System",
    summary = "Health check",
    description = "Returns service health status, version, and current timestamp.",
    responses(
        (status = 200, description = "Service is healthy", body = HealthResponse),
    )
)]
pub async fn health_handler() -> impl IntoResponse {
    (
        StatusCode::OK,
        Json(HealthResponse {
            status: "healthy".to_string(),
            timestamp: Utc::now().to_rfc3339(),
            version: env!("CARGO_PKG_VERSION").to_string(),
        }),
    )
}

/// `GET /stats`: Connected clients and live subscriptions.
#[utoipa::path(
    get,
    path = "/api/v1/stats",
    tag = "System",
    summary = "Registry statistics",
    description = "Returns the number of connected clients, live subscriptions and subscribed classes.",
    responses(
        (status = 200, description = "Current counters", body = StatsResponse),
    )
)]
pub async fn stats_handler(State(state): State<AppState>) -> impl IntoResponse {
    let stats = state.service.stats().await;
    (
        StatusCode::OK,
        Json(StatsResponse::new(
            &state.config.application_id,
            &state.config.server_url,
            stats,
        )),
    )
}

/// System routes mounted at the root level (not under /api/v1).
pub fn routes() -> Router<AppState> {
    Router::new().route("/health", get(health_handler))
}

/// System routes mounted under `/api/v1`.
pub fn api_routes() -> Router<AppState> {
    Router::new().route("/stats", get(stats_handler))
}

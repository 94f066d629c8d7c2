//! # livequery-gateway
//!
//! Real-time live-query server for backend-as-a-service object change
//! feeds.
//!
//! Clients open a WebSocket, authenticate with application keys, and
//! register queries over a class. The write pipeline publishes every save
//! and delete on a pub/sub bus; the server matches each change against
//! the registered queries, checks the object's ACL for every subscriber,
//! and pushes `create`, `enter`, `update`, `leave` or `delete` events.
//!
//! ## Architecture
//!
//! ```text
//! Clients (WebSocket)          Write pipeline (pub/sub, REST feed)
//!     │                                │
//!     ├── WS Handler (ws/)             ├── Change feed consumer (service/)
//!     │                                │
//!     └────── LiveQueryService (service/) ──────┘
//!                 │
//!                 ├── Client / Subscription registries (domain/)
//!                 ├── Query matcher + hash (query/)
//!                 ├── SessionResolver + IdentityStore (auth/)
//!                 └── Lifecycle hooks (hooks)
//! ```

use axum::Router;
use axum::http::StatusCode;
use axum::routing::get;
use tower::ServiceBuilder;
use tower_http::cors::CorsLayer;
use tower_http::timeout::TimeoutLayer;
use tower_http::trace::TraceLayer;

pub mod api;
pub mod app_state;
pub mod auth;
pub mod config;
pub mod domain;
pub mod error;
pub mod hooks;
pub mod pubsub;
pub mod query;
pub mod service;
pub mod ws;

use app_state::AppState;

/// Builds the full HTTP application: REST endpoints, the `/ws` upgrade
/// route and the middleware stack (tracing, request timeout, CORS).
///
/// The timeout bounds producing a response; an upgraded WebSocket lives
/// on after its `101` response and is not cut by it.
pub fn build_app(state: AppState) -> Router {
    let middleware = ServiceBuilder::new()
        .layer(TraceLayer::new_for_http())
        .layer(TimeoutLayer::with_status_code(
            StatusCode::REQUEST_TIMEOUT,
            state.config.request_timeout(),
        ))
        .layer(CorsLayer::permissive());

    Router::new()
        .merge(api::build_router())
        .route("/ws", get(ws::handler::ws_handler))
        .layer(middleware)
        .with_state(state)
}

//! Service layer: the live-query orchestrator and its change-feed consumer.

pub mod change_feed;
pub mod live_query_service;

pub use change_feed::run_change_feed;
pub use live_query_service::{ConnectionContext, FanOut, LiveQueryService, LiveQueryStats};

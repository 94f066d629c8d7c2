//! WebSocket layer: wire messages, upgrade handler and connection loop.
//!
//! The WebSocket endpoint at `/ws` speaks the live-query protocol:
//! `connect`, `subscribe`, `update` and `unsubscribe` in, `connected`,
//! `subscribed`, `unsubscribed`, `error` and live events out.

pub mod connection;
pub mod handler;
pub mod messages;

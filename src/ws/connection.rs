//! WebSocket connection loop.
//!
//! Handles the read/write loop for a single WebSocket connection: inbound
//! text frames go to the [`LiveQueryService`], pushes queued by the
//! service are written out, and a keepalive ping runs on a fixed interval.

use std::time::Duration;

use axum::body::Bytes;
use axum::extract::ws::{Message, WebSocket};
use futures_util::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio::time::MissedTickBehavior;

use crate::service::{ConnectionContext, LiveQueryService};

/// Runs the read/write loop for a single WebSocket connection until the
/// peer closes, the transport fails or a keepalive ping goes unanswered.
pub async fn run_connection(socket: WebSocket, service: LiveQueryService, keepalive: Duration) {
    let (mut ws_tx, mut ws_rx) = socket.split();
    let (push_tx, mut push_rx) = mpsc::unbounded_channel::<String>();
    let mut ctx = ConnectionContext::new(push_tx);
    service.on_socket_open().await;

    let mut ticker = tokio::time::interval(keepalive);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    // first tick completes immediately
    ticker.tick().await;
    let mut awaiting_pong = false;

    loop {
        tokio::select! {
            // Incoming frame from client
            frame = ws_rx.next() => {
                awaiting_pong = false;
                match frame {
                    Some(Ok(Message::Text(text))) => {
                        service.handle_message(&mut ctx, text.as_str()).await;
                    }
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Ok(_)) => {}
                    Some(Err(err)) => {
                        tracing::debug!(error = %err, "websocket read failed");
                        break;
                    }
                }
            }
            // Push queued by the service
            Some(text) = push_rx.recv() => {
                if ws_tx.send(Message::text(text)).await.is_err() {
                    break;
                }
            }
            _ = ticker.tick() => {
                if awaiting_pong {
                    tracing::info!(client_id = ?ctx.client_id(), "keepalive timed out");
                    break;
                }
                awaiting_pong = true;
                if ws_tx.send(Message::Ping(Bytes::new())).await.is_err() {
                    break;
                }
            }
        }
    }

    service.disconnect(&ctx).await;
    tracing::debug!(client_id = ?ctx.client_id(), "ws connection closed");
}

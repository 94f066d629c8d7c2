//! Extension points around the live-query protocol.
//!
//! An embedding application implements [`LiveQueryHooks`] to veto or
//! rewrite connects and subscriptions, to filter or rewrite individual
//! deliveries, and to observe lifecycle events. A hook error becomes a
//! scoped `error` push to the triggering client; it never affects other
//! clients.

use async_trait::async_trait;
use serde::Serialize;

use crate::domain::{ClientId, LiveEventKind, LiveObject, RequestId};
use crate::error::HookError;
use crate::ws::messages::QueryDescriptor;

/// Identity of the client a hook runs for.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HookContext {
    /// Client id, once allocated.
    pub client_id: Option<ClientId>,
    /// Installation id supplied at connect.
    pub installation_id: Option<String>,
    /// Session token in effect for the request.
    pub session_token: Option<String>,
    /// User the session token resolves to, if any.
    pub user_id: Option<String>,
    /// Whether the client holds the master key.
    pub has_master_key: bool,
}

/// Input of [`LiveQueryHooks::before_connect`].
#[derive(Debug, Clone)]
pub struct ConnectTrigger {
    /// Who is connecting.
    pub context: HookContext,
    /// Connected clients before this one.
    pub clients: usize,
    /// Live subscriptions.
    pub subscriptions: usize,
}

/// Input of [`LiveQueryHooks::before_subscribe`]. The query may be
/// rewritten in place.
#[derive(Debug, Clone)]
pub struct SubscribeTrigger {
    /// Who is subscribing.
    pub context: HookContext,
    /// Request id of the subscription.
    pub request_id: RequestId,
    /// Query to register.
    pub query: QueryDescriptor,
}

/// Input of [`LiveQueryHooks::after_event`]. Object snapshots may be
/// rewritten and `send_event` cleared to drop this one delivery.
#[derive(Debug, Clone)]
pub struct AfterEventTrigger {
    /// Recipient.
    pub context: HookContext,
    /// Subscription the event is delivered for.
    pub request_id: RequestId,
    /// Event kind.
    pub event: LiveEventKind,
    /// Object after the change.
    pub object: LiveObject,
    /// Object before the change.
    pub original: Option<LiveObject>,
    /// Set to `false` to suppress the delivery.
    pub send_event: bool,
    /// Connected clients.
    pub clients: usize,
    /// Live subscriptions.
    pub subscriptions: usize,
}

impl AfterEventTrigger {
    /// Class of the changed object.
    #[must_use]
    pub fn class_name(&self) -> &str {
        self.object.class_name()
    }
}

/// Lifecycle transitions reported to [`LiveQueryHooks::on_lifecycle_event`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum LifecycleEventKind {
    /// A client completed `connect`.
    Connect,
    /// A subscription was registered.
    Subscribe,
    /// A subscription was removed by the client.
    Unsubscribe,
    /// A socket opened.
    WsConnect,
    /// A connected client's socket closed.
    WsDisconnect,
    /// A socket closed before (or without) a registered client.
    WsDisconnectError,
}

/// Lifecycle notification with registry counts after the transition.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LifecycleEvent {
    /// Transition.
    pub event: LifecycleEventKind,
    /// Client involved, if any.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub client_id: Option<ClientId>,
    /// Installation id of the client, if any.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub installation_id: Option<String>,
    /// Whether the client holds the master key.
    pub use_master_key: bool,
    /// Connected clients.
    pub clients: usize,
    /// Live subscriptions.
    pub subscriptions: usize,
}

/// Hooks invoked by the live-query service. Every method defaults to a
/// no-op.
#[async_trait]
pub trait LiveQueryHooks: Send + Sync + std::fmt::Debug {
    /// Whether any request hook is installed. When `false` the service
    /// skips building triggers and resolving users for them.
    fn is_active(&self) -> bool {
        true
    }

    /// Runs before a client is registered.
    ///
    /// # Errors
    ///
    /// An error rejects the connect.
    async fn before_connect(&self, _trigger: &mut ConnectTrigger) -> Result<(), HookError> {
        Ok(())
    }

    /// Runs before a subscription is registered.
    ///
    /// # Errors
    ///
    /// An error rejects the subscription.
    async fn before_subscribe(&self, _trigger: &mut SubscribeTrigger) -> Result<(), HookError> {
        Ok(())
    }

    /// Runs before each delivery.
    ///
    /// # Errors
    ///
    /// An error replaces the delivery with an `error` push.
    async fn after_event(&self, _trigger: &mut AfterEventTrigger) -> Result<(), HookError> {
        Ok(())
    }

    /// Observes lifecycle transitions.
    async fn on_lifecycle_event(&self, _event: &LifecycleEvent) {}
}

/// Hooks that do nothing.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopHooks;

#[async_trait]
impl LiveQueryHooks for NoopHooks {
    fn is_active(&self) -> bool {
        false
    }
}

#[cfg(test)]
#[allow(clippy::panic)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn lifecycle_event_serializes_snake_case() {
        let event = LifecycleEvent {
            event: LifecycleEventKind::WsDisconnectError,
            client_id: None,
            installation_id: None,
            use_master_key: false,
            clients: 0,
            subscriptions: 0,
        };
        let Ok(value) = serde_json::to_value(&event) else {
            panic!("serializable");
        };
        assert_eq!(value["event"], "ws_disconnect_error");
        assert!(value.get("client_id").is_none());
    }

    #[tokio::test]
    async fn noop_hooks_pass_everything() {
        let hooks = NoopHooks;
        assert!(!hooks.is_active());
        let Ok(object) = LiveObject::from_value(json!({ "className": "A", "objectId": "1" })) else {
            panic!("valid object");
        };
        let mut trigger = AfterEventTrigger {
            context: HookContext::default(),
            request_id: 1,
            event: LiveEventKind::Create,
            object,
            original: None,
            send_event: true,
            clients: 1,
            subscriptions: 1,
        };
        assert!(hooks.after_event(&mut trigger).await.is_ok());
        assert!(trigger.send_event);
        assert_eq!(trigger.class_name(), "A");
    }
}

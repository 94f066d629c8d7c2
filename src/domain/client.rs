//! Per-connection client state and outbound serialization.

use std::collections::HashMap;
use std::collections::hash_map::Entry;

use tokio::sync::mpsc;

use super::{ClientId, LiveEventKind, LiveObject, RequestId, SubscriptionKey};
use crate::error::LiveQueryError;
use crate::ws::messages::{EventPayload, ServerMessage};

/// Outbound half of a client's transport: serialized text frames.
pub type ClientSender = mpsc::UnboundedSender<String>;

/// What a client registered under one request id.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubscriptionInfo {
    /// Shared subscription the request is attached to.
    pub subscription: SubscriptionKey,
    /// Field selection applied to pushed objects.
    pub fields: Option<Vec<String>>,
    /// Fields whose change gates `update` / `create` events.
    pub watch: Option<Vec<String>>,
    /// Subscription-level session token.
    pub session_token: Option<String>,
}

/// A connected live-query client.
#[derive(Debug)]
pub struct Client {
    id: ClientId,
    sender: ClientSender,
    has_master_key: bool,
    session_token: Option<String>,
    installation_id: Option<String>,
    subscription_infos: HashMap<RequestId, SubscriptionInfo>,
}

impl Client {
    /// Creates a client bound to a transport sender.
    #[must_use]
    pub fn new(
        id: ClientId,
        sender: ClientSender,
        has_master_key: bool,
        session_token: Option<String>,
        installation_id: Option<String>,
    ) -> Self {
        Self {
            id,
            sender,
            has_master_key,
            session_token,
            installation_id,
            subscription_infos: HashMap::new(),
        }
    }

    /// Client identifier.
    #[must_use]
    pub const fn id(&self) -> ClientId {
        self.id
    }

    /// Whether the client authenticated with the master key.
    #[must_use]
    pub const fn has_master_key(&self) -> bool {
        self.has_master_key
    }

    /// Connection-level session token.
    #[must_use]
    pub fn session_token(&self) -> Option<&str> {
        self.session_token.as_deref()
    }

    /// Installation id supplied at connect.
    #[must_use]
    pub fn installation_id(&self) -> Option<&str> {
        self.installation_id.as_deref()
    }

    /// Stores the subscription info for a request id.
    ///
    /// # Errors
    ///
    /// Returns [`LiveQueryError::DuplicateRequestId`] if the id is taken.
    pub fn add_subscription_info(
        &mut self,
        request_id: RequestId,
        info: SubscriptionInfo,
    ) -> Result<(), LiveQueryError> {
        match self.subscription_infos.entry(request_id) {
            Entry::Occupied(_) => Err(LiveQueryError::DuplicateRequestId(request_id)),
            Entry::Vacant(slot) => {
                slot.insert(info);
                Ok(())
            }
        }
    }

    /// Returns `true` if the request id is in use.
    #[must_use]
    pub fn has_subscription_info(&self, request_id: RequestId) -> bool {
        self.subscription_infos.contains_key(&request_id)
    }

    /// Returns the subscription info for a request id.
    #[must_use]
    pub fn subscription_info(&self, request_id: RequestId) -> Option<&SubscriptionInfo> {
        self.subscription_infos.get(&request_id)
    }

    /// Removes and returns the subscription info for a request id.
    pub fn remove_subscription_info(&mut self, request_id: RequestId) -> Option<SubscriptionInfo> {
        self.subscription_infos.remove(&request_id)
    }

    /// Consumes every retained subscription info (used on disconnect).
    pub fn drain_subscription_infos(
        &mut self,
    ) -> impl Iterator<Item = (RequestId, SubscriptionInfo)> + '_ {
        self.subscription_infos.drain()
    }

    /// Number of active subscription infos.
    #[must_use]
    pub fn subscription_count(&self) -> usize {
        self.subscription_infos.len()
    }

    /// Pushes `connected`.
    pub fn push_connect(&self) {
        self.push(&ServerMessage::Connected {
            client_id: self.id,
            installation_id: self.installation_id.clone(),
        });
    }

    /// Pushes `subscribed`.
    pub fn push_subscribe(&self, request_id: RequestId) {
        self.push(&ServerMessage::Subscribed {
            client_id: self.id,
            installation_id: self.installation_id.clone(),
            request_id,
        });
    }

    /// Pushes `unsubscribed`.
    pub fn push_unsubscribe(&self, request_id: RequestId) {
        self.push(&ServerMessage::Unsubscribed {
            client_id: self.id,
            installation_id: self.installation_id.clone(),
            request_id,
        });
    }

    /// Pushes a live event, reducing both snapshots to the request's field
    /// selection.
    pub fn push_event(
        &self,
        kind: LiveEventKind,
        request_id: RequestId,
        object: &LiveObject,
        original: Option<&LiveObject>,
    ) {
        let fields = self
            .subscription_infos
            .get(&request_id)
            .and_then(|info| info.fields.as_deref());
        let payload = EventPayload {
            client_id: self.id,
            installation_id: self.installation_id.clone(),
            request_id,
            object: object.to_json_with_fields(fields),
            original: original.map(|o| o.to_json_with_fields(fields)),
        };
        let message = match kind {
            LiveEventKind::Create => ServerMessage::Create(payload),
            LiveEventKind::Enter => ServerMessage::Enter(payload),
            LiveEventKind::Update => ServerMessage::Update(payload),
            LiveEventKind::Leave => ServerMessage::Leave(payload),
            LiveEventKind::Delete => ServerMessage::Delete(payload),
        };
        self.push(&message);
    }

    /// Pushes an error scoped to this client.
    pub fn push_error(&self, err: &LiveQueryError, request_id: Option<RequestId>) {
        push_error(&self.sender, err, request_id);
    }

    fn push(&self, message: &ServerMessage) {
        push_message(&self.sender, message);
    }
}

/// Serializes and sends a push. A closed transport is logged, never fatal.
pub fn push_message(sender: &ClientSender, message: &ServerMessage) {
    match message.to_json() {
        Ok(text) => {
            if sender.send(text).is_err() {
                tracing::debug!("push dropped: transport closed");
            }
        }
        Err(err) => tracing::error!(error = %err, "failed to serialize push"),
    }
}

/// Sends an `error` push on a raw transport (no client needed).
pub fn push_error(sender: &ClientSender, err: &LiveQueryError, request_id: Option<RequestId>) {
    push_message(sender, &ServerMessage::from_error(err, request_id));
}

//! One distinct `(className, where)` pair and the clients interested in it.

use std::collections::HashMap;

use serde_json::Value;

use super::{ClientId, RequestId};

/// Identity of a [`Subscription`] inside the registry.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SubscriptionKey {
    /// Class the query runs against.
    pub class_name: String,
    /// Canonical query hash.
    pub hash: String,
}

/// Server-side record of a live query shared by every client that
/// subscribed with an identical `(className, where)`.
#[derive(Debug, Clone)]
pub struct Subscription {
    class_name: String,
    where_clause: Value,
    hash: String,
    client_request_ids: HashMap<ClientId, Vec<RequestId>>,
}

impl Subscription {
    /// Creates a subscription with no subscribers.
    #[must_use]
    pub fn new(
        class_name: impl Into<String>,
        where_clause: Value,
        hash: impl Into<String>,
    ) -> Self {
        Self {
            class_name: class_name.into(),
            where_clause,
            hash: hash.into(),
            client_request_ids: HashMap::new(),
        }
    }

    /// Class the query runs against.
    #[must_use]
    pub fn class_name(&self) -> &str {
        &self.class_name
    }

    /// The where-clause every event is matched against.
    #[must_use]
    pub fn where_clause(&self) -> &Value {
        &self.where_clause
    }

    /// Canonical query hash.
    #[must_use]
    pub fn hash(&self) -> &str {
        &self.hash
    }

    /// Returns the registry key of this subscription.
    #[must_use]
    pub fn key(&self) -> SubscriptionKey {
        SubscriptionKey {
            class_name: self.class_name.clone(),
            hash: self.hash.clone(),
        }
    }

    /// Registers `request_id` of `client_id` as interested in this query.
    pub fn add_client(&mut self, client_id: ClientId, request_id: RequestId) {
        self.client_request_ids
            .entry(client_id)
            .or_default()
            .push(request_id);
    }

    /// Removes one request of a client. Drops the client entry once its
    /// last request is gone. Unknown clients or requests are logged and
    /// otherwise ignored.
    pub fn remove_client(&mut self, client_id: ClientId, request_id: RequestId) {
        let Some(request_ids) = self.client_request_ids.get_mut(&client_id) else {
            tracing::error!(
                %client_id,
                request_id,
                hash = %self.hash,
                "client not registered on subscription"
            );
            return;
        };
        let Some(pos) = request_ids.iter().position(|id| *id == request_id) else {
            tracing::error!(
                %client_id,
                request_id,
                hash = %self.hash,
                "request not registered on subscription"
            );
            return;
        };
        request_ids.remove(pos);
        if request_ids.is_empty() {
            self.client_request_ids.remove(&client_id);
        }
    }

    /// Returns `true` while at least one client remains.
    #[must_use]
    pub fn has_subscribers(&self) -> bool {
        !self.client_request_ids.is_empty()
    }

    /// Fan-out list: every `(client, request ids)` pair.
    pub fn fanout(&self) -> impl Iterator<Item = (ClientId, &[RequestId])> {
        self.client_request_ids
            .iter()
            .map(|(client_id, ids)| (*client_id, ids.as_slice()))
    }

    /// Request ids registered by one client.
    #[must_use]
    pub fn request_ids(&self, client_id: ClientId) -> &[RequestId] {
        self.client_request_ids
            .get(&client_id)
            .map_or(&[], Vec::as_slice)
    }
}

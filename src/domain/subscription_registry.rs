//! Two-level subscription index: `className -> hash -> Subscription`.
//!
//! [`SubscriptionRegistry`] guarantees that a `(className, where)` pair is
//! backed by exactly one [`Subscription`], and garbage-collects empty
//! subscriptions and empty class buckets as clients leave.

use std::collections::HashMap;

use serde_json::Value;

use super::{ClientId, RequestId, Subscription, SubscriptionKey};

/// Process-local index of all live subscriptions.
///
/// Not synchronized on its own: the orchestrator owns it together with the
/// client registry behind a single lock so cascading removals are atomic.
#[derive(Debug, Default)]
pub struct SubscriptionRegistry {
    classes: HashMap<String, HashMap<String, Subscription>>,
}

impl SubscriptionRegistry {
    /// Creates an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the subscription for `(class_name, hash)`, creating it with
    /// `where_clause` on first use.
    pub fn get_or_create(
        &mut self,
        class_name: &str,
        where_clause: Value,
        hash: &str,
    ) -> &mut Subscription {
        self.classes
            .entry(class_name.to_string())
            .or_default()
            .entry(hash.to_string())
            .or_insert_with(|| {
                tracing::debug!(class_name, hash, "subscription created");
                Subscription::new(class_name, where_clause, hash)
            })
    }

    /// Returns a subscription by key.
    #[must_use]
    pub fn get(&self, key: &SubscriptionKey) -> Option<&Subscription> {
        self.classes.get(&key.class_name)?.get(&key.hash)
    }

    /// Subscriptions registered under a class.
    pub fn for_class(&self, class_name: &str) -> impl Iterator<Item = &Subscription> {
        self.classes
            .get(class_name)
            .into_iter()
            .flat_map(HashMap::values)
    }

    /// Removes one client request from a subscription and garbage-collects
    /// the subscription and its class bucket if they become empty.
    pub fn remove_client(
        &mut self,
        key: &SubscriptionKey,
        client_id: ClientId,
        request_id: RequestId,
    ) {
        let Some(bucket) = self.classes.get_mut(&key.class_name) else {
            tracing::error!(class_name = %key.class_name, "no subscriptions under class");
            return;
        };
        let Some(subscription) = bucket.get_mut(&key.hash) else {
            tracing::error!(
                class_name = %key.class_name,
                hash = %key.hash,
                "subscription not found"
            );
            return;
        };
        subscription.remove_client(client_id, request_id);
        if !subscription.has_subscribers() {
            bucket.remove(&key.hash);
            tracing::debug!(class_name = %key.class_name, hash = %key.hash, "subscription removed");
        }
        if bucket.is_empty() {
            self.classes.remove(&key.class_name);
        }
    }

    /// Total number of subscriptions across all classes.
    #[must_use]
    pub fn len(&self) -> usize {
        self.classes.values().map(HashMap::len).sum()
    }

    /// Returns `true` if there are no subscriptions.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.classes.is_empty()
    }

    /// Number of classes with at least one subscription.
    #[must_use]
    pub fn class_count(&self) -> usize {
        self.classes.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn identical_hash_shares_one_subscription() {
        let mut registry = SubscriptionRegistry::new();
        let a = ClientId::new();
        let b = ClientId::new();
        registry.get_or_create("Note", json!({}), "h1").add_client(a, 1);
        registry.get_or_create("Note", json!({}), "h1").add_client(b, 1);

        assert_eq!(registry.len(), 1);
        let key = SubscriptionKey {
            class_name: "Note".to_string(),
            hash: "h1".to_string(),
        };
        let sub = registry.get(&key);
        assert!(sub.is_some_and(|s| s.fanout().count() == 2));
    }

    #[test]
    fn removing_last_client_collects_subscription_and_class() {
        let mut registry = SubscriptionRegistry::new();
        let a = ClientId::new();
        let b = ClientId::new();
        let key = registry.get_or_create("Note", json!({}), "h1").key();
        registry.get_or_create("Note", json!({}), "h1").add_client(a, 1);
        registry.get_or_create("Note", json!({}), "h1").add_client(b, 2);

        registry.remove_client(&key, a, 1);
        assert_eq!(registry.len(), 1);
        assert!(registry.get(&key).is_some_and(|s| s.request_ids(b) == [2]));

        registry.remove_client(&key, b, 2);
        assert!(registry.is_empty());
        assert_eq!(registry.class_count(), 0);
        assert_eq!(registry.for_class("Note").count(), 0);
    }

    #[test]
    fn class_bucket_survives_while_other_hash_remains() {
        let mut registry = SubscriptionRegistry::new();
        let a = ClientId::new();
        let k1 = registry.get_or_create("Note", json!({}), "h1").key();
        registry.get_or_create("Note", json!({}), "h1").add_client(a, 1);
        registry
            .get_or_create("Note", json!({ "x": 1 }), "h2")
            .add_client(a, 2);

        registry.remove_client(&k1, a, 1);
        assert_eq!(registry.class_count(), 1);
        assert_eq!(registry.for_class("Note").count(), 1);
    }

    #[test]
    fn removing_from_unknown_key_is_noop() {
        let mut registry = SubscriptionRegistry::new();
        let key = SubscriptionKey {
            class_name: "Ghost".to_string(),
            hash: "h".to_string(),
        };
        registry.remove_client(&key, ClientId::new(), 1);
        assert!(registry.is_empty());
    }
}

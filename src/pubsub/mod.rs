//! Pub/sub capability used to receive the change feed.
//!
//! The live-query engine only needs two capabilities from a message bus:
//! a [`Publisher`] that sends a payload on a named channel, and a
//! [`Subscriber`] that yields messages for the channels it joined. The
//! adapter is chosen once at startup through [`PubSubConfig`].

pub mod in_process;

use std::sync::Arc;

use async_trait::async_trait;

use crate::error::LiveQueryError;

pub use in_process::InProcessPubSub;

/// A message received on a channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChannelMessage {
    /// Channel the message was published on.
    pub channel: String,
    /// Raw payload (JSON text for change-feed topics).
    pub payload: String,
}

/// Sending half of a bus.
#[async_trait]
pub trait Publisher: Send + Sync + std::fmt::Debug {
    /// Publishes a payload on a channel.
    ///
    /// # Errors
    ///
    /// Returns [`LiveQueryError::Internal`] if the bus rejects the message.
    async fn publish(&self, channel: &str, payload: String) -> Result<(), LiveQueryError>;
}

/// Receiving half of a bus.
#[async_trait]
pub trait Subscriber: Send + std::fmt::Debug {
    /// Starts receiving messages published on `channel`.
    fn subscribe(&mut self, channel: &str);

    /// Waits for the next message on a subscribed channel. Returns `None`
    /// once the bus is closed.
    async fn recv(&mut self) -> Option<ChannelMessage>;
}

/// Factory for publishers and subscribers.
pub trait PubSubAdapter: Send + Sync + std::fmt::Debug {
    /// Creates a publisher.
    fn create_publisher(&self) -> Box<dyn Publisher>;

    /// Creates a subscriber with no channels joined.
    fn create_subscriber(&self) -> Box<dyn Subscriber>;
}

/// Adapter selection, resolved once at startup.
#[derive(Debug, Clone)]
pub enum PubSubConfig {
    /// In-process broadcast channel with the given capacity.
    InProcess {
        /// Ring-buffer size of the channel.
        capacity: usize,
    },
    /// An adapter supplied by the embedding application.
    Custom(Arc<dyn PubSubAdapter>),
}

impl PubSubConfig {
    /// Parses the adapter selector used in configuration.
    ///
    /// # Errors
    ///
    /// Returns [`LiveQueryError::InvalidRequest`] for an adapter name this
    /// build can't construct on its own.
    pub fn from_name(name: &str, capacity: usize) -> Result<Self, LiveQueryError> {
        match name {
            "in_process" | "in-process" | "memory" => Ok(Self::InProcess { capacity }),
            other => Err(LiveQueryError::InvalidRequest(format!(
                "unsupported pub/sub adapter '{other}'"
            ))),
        }
    }

    /// Builds the adapter.
    #[must_use]
    pub fn resolve(&self) -> Arc<dyn PubSubAdapter> {
        match self {
            Self::InProcess { capacity } => Arc::new(InProcessPubSub::new(*capacity)),
            Self::Custom(adapter) => Arc::clone(adapter),
        }
    }
}

#[cfg(test)]
#[allow(clippy::panic)]
mod tests {
    use super::*;

    #[test]
    fn parses_known_adapters() {
        assert!(matches!(
            PubSubConfig::from_name("in_process", 8),
            Ok(PubSubConfig::InProcess { capacity: 8 })
        ));
        assert!(PubSubConfig::from_name("redis", 8).is_err());
    }

    #[tokio::test]
    async fn custom_adapter_is_shared() {
        let adapter: Arc<dyn PubSubAdapter> = Arc::new(InProcessPubSub::new(8));
        let config = PubSubConfig::Custom(Arc::clone(&adapter));
        let resolved = config.resolve();

        let mut sub = adapter.create_subscriber();
        sub.subscribe("appafterSave");
        let Ok(()) = resolved
            .create_publisher()
            .publish("appafterSave", "{}".to_string())
            .await
        else {
            panic!("publish failed");
        };
        let Some(msg) = sub.recv().await else {
            panic!("expected a message");
        };
        assert_eq!(msg.payload, "{}");
    }
}

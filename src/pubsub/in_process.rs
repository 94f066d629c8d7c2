//! In-process pub/sub over a broadcast channel.
//!
//! [`InProcessPubSub`] wraps a [`tokio::sync::broadcast`] channel. Every
//! subscriber sees every message and filters by the channels it joined.
//! When the ring buffer is full the oldest messages are dropped for
//! lagging subscribers.

use std::collections::HashSet;

use async_trait::async_trait;
use tokio::sync::broadcast;

use super::{ChannelMessage, PubSubAdapter, Publisher, Subscriber};
use crate::error::LiveQueryError;

/// Broadcast-backed bus shared by publishers and subscribers of one process.
#[derive(Debug, Clone)]
pub struct InProcessPubSub {
    sender: broadcast::Sender<ChannelMessage>,
}

impl InProcessPubSub {
    /// Creates a bus with the given channel capacity.
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender }
    }

    /// Returns the current number of active subscribers.
    #[must_use]
    pub fn receiver_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

impl PubSubAdapter for InProcessPubSub {
    fn create_publisher(&self) -> Box<dyn Publisher> {
        Box::new(InProcessPublisher {
            sender: self.sender.clone(),
        })
    }

    fn create_subscriber(&self) -> Box<dyn Subscriber> {
        Box::new(InProcessSubscriber {
            receiver: self.sender.subscribe(),
            channels: HashSet::new(),
        })
    }
}

#[derive(Debug)]
struct InProcessPublisher {
    sender: broadcast::Sender<ChannelMessage>,
}

#[async_trait]
impl Publisher for InProcessPublisher {
    async fn publish(&self, channel: &str, payload: String) -> Result<(), LiveQueryError> {
        let message = ChannelMessage {
            channel: channel.to_string(),
            payload,
        };
        // No receivers is not an error: nobody is listening yet.
        let delivered = self.sender.send(message).unwrap_or(0);
        tracing::trace!(channel, delivered, "published");
        Ok(())
    }
}

#[derive(Debug)]
struct InProcessSubscriber {
    receiver: broadcast::Receiver<ChannelMessage>,
    channels: HashSet<String>,
}

#[async_trait]
impl Subscriber for InProcessSubscriber {
    fn subscribe(&mut self, channel: &str) {
        self.channels.insert(channel.to_string());
    }

    async fn recv(&mut self) -> Option<ChannelMessage> {
        loop {
            match self.receiver.recv().await {
                Ok(message) if self.channels.contains(&message.channel) => return Some(message),
                Ok(_) => {}
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    tracing::warn!(skipped, "change feed subscriber lagged");
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }
}

#[cfg(test)]
#[allow(clippy::panic)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn publish_without_subscribers_is_ok() {
        let bus = InProcessPubSub::new(16);
        let publisher = bus.create_publisher();
        assert!(publisher.publish("x", "1".to_string()).await.is_ok());
    }

    #[tokio::test]
    async fn subscriber_only_sees_joined_channels() {
        let bus = InProcessPubSub::new(16);
        let mut sub = bus.create_subscriber();
        sub.subscribe("appafterSave");

        let publisher = bus.create_publisher();
        let _ = publisher.publish("appafterDelete", "skip".to_string()).await;
        let _ = publisher.publish("appafterSave", "keep".to_string()).await;

        let Some(msg) = sub.recv().await else {
            panic!("expected a message");
        };
        assert_eq!(msg.channel, "appafterSave");
        assert_eq!(msg.payload, "keep");
    }

    #[tokio::test]
    async fn multiple_subscribers_receive_same_message() {
        let bus = InProcessPubSub::new(16);
        let mut a = bus.create_subscriber();
        let mut b = bus.create_subscriber();
        a.subscribe("c");
        b.subscribe("c");
        assert_eq!(bus.receiver_count(), 2);

        let _ = bus.create_publisher().publish("c", "hi".to_string()).await;
        let (Some(x), Some(y)) = (a.recv().await, b.recv().await) else {
            panic!("both subscribers should receive");
        };
        assert_eq!(x, y);
    }

    #[tokio::test]
    async fn lagged_subscriber_keeps_receiving() {
        let bus = InProcessPubSub::new(2);
        let mut sub = bus.create_subscriber();
        sub.subscribe("c");
        let publisher = bus.create_publisher();
        for i in 0..5 {
            let _ = publisher.publish("c", i.to_string()).await;
        }
        let Some(msg) = sub.recv().await else {
            panic!("expected a message after lag");
        };
        assert_eq!(msg.payload, "3");
    }
}

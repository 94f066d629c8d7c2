//! Change-feed consumer: turns pub/sub messages into fan-outs.

use crate::domain::{ChangeEvent, ChangeTopic, ClearCacheMessage};
use crate::pubsub::{ChannelMessage, Subscriber};

use super::LiveQueryService;

/// Subscribes to every change-feed topic of `application_id` and
/// processes messages until the bus closes.
///
/// Matching runs in arrival order; authorization and pushes of each
/// change run on their own task so one slow lookup doesn't stall the feed.
pub async fn run_change_feed(
    service: LiveQueryService,
    mut subscriber: Box<dyn Subscriber>,
    application_id: String,
) {
    for topic in ChangeTopic::ALL {
        subscriber.subscribe(&topic.channel(&application_id));
    }
    tracing::info!(application_id = %application_id, "change feed consumer started");

    while let Some(message) = subscriber.recv().await {
        dispatch(&service, &application_id, message).await;
    }
    tracing::info!("change feed closed");
}

async fn dispatch(service: &LiveQueryService, application_id: &str, message: ChannelMessage) {
    let Some(topic) = ChangeTopic::from_channel(application_id, &message.channel) else {
        tracing::warn!(channel = %message.channel, "message on unknown channel dropped");
        return;
    };

    match topic {
        ChangeTopic::AfterSave | ChangeTopic::AfterDelete => {
            let event = match ChangeEvent::from_payload(&message.payload) {
                Ok(event) => event,
                Err(err) => {
                    tracing::warn!(
                        topic = topic.as_str(),
                        error = %err,
                        "malformed change message dropped"
                    );
                    return;
                }
            };
            let fan_out = if topic == ChangeTopic::AfterSave {
                service.plan_after_save(event).await
            } else {
                service.plan_after_delete(event).await
            };
            if fan_out.target_count() == 0 {
                return;
            }
            let service = service.clone();
            tokio::spawn(async move {
                let delivered = service.deliver(fan_out).await;
                tracing::debug!(topic = topic.as_str(), delivered, "change delivered");
            });
        }
        ChangeTopic::ClearCache => {
            match serde_json::from_str::<ClearCacheMessage>(&message.payload) {
                Ok(clear) => service.handle_clear_cache(clear).await,
                Err(err) => tracing::warn!(error = %err, "malformed clearCache message dropped"),
            }
        }
    }
}

#[cfg(test)]
#[allow(clippy::panic)]
mod tests {
    use std::collections::HashMap;
    use std::sync::Arc;
    use std::time::Duration;

    use serde_json::{Value, json};
    use tokio::sync::mpsc;

    use super::*;
    use crate::auth::{InMemoryIdentityStore, SessionResolver};
    use crate::hooks::NoopHooks;
    use crate::pubsub::{InProcessPubSub, PubSubAdapter};
    use crate::service::ConnectionContext;

    async fn recv_json(rx: &mut mpsc::UnboundedReceiver<String>) -> Value {
        let Ok(Some(text)) = tokio::time::timeout(Duration::from_secs(2), rx.recv()).await else {
            panic!("expected a push");
        };
        let Ok(value) = serde_json::from_str(&text) else {
            panic!("push is not json");
        };
        value
    }

    #[tokio::test]
    async fn consumes_topics_from_the_bus() {
        let resolver = SessionResolver::new(
            Arc::new(InMemoryIdentityStore::new()),
            Duration::from_secs(5),
            10,
        );
        let service = LiveQueryService::new(resolver, Arc::new(NoopHooks), HashMap::new());
        let bus = InProcessPubSub::new(64);
        tokio::spawn(run_change_feed(
            service.clone(),
            bus.create_subscriber(),
            "app".to_string(),
        ));

        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut ctx = ConnectionContext::new(tx);
        service
            .handle_message(&mut ctx, r#"{"op":"connect","applicationId":"app"}"#)
            .await;
        service
            .handle_message(
                &mut ctx,
                r#"{"op":"subscribe","requestId":1,"query":{"className":"Note","where":{}}}"#,
            )
            .await;
        assert_eq!(recv_json(&mut rx).await["op"], "connected");
        assert_eq!(recv_json(&mut rx).await["op"], "subscribed");

        let publisher = bus.create_publisher();
        let object = json!({ "className": "Note", "objectId": "N1" });
        let _ = publisher.publish("appafterSave", "garbage".to_string()).await;
        let _ = publisher
            .publish("otherafterSave", json!({ "currentParseObject": object }).to_string())
            .await;
        let _ = publisher
            .publish("appclearCache", json!({ "userId": "u1" }).to_string())
            .await;
        let _ = publisher
            .publish("appafterSave", json!({ "currentParseObject": object }).to_string())
            .await;
        let _ = publisher
            .publish("appafterDelete", json!({ "currentParseObject": object }).to_string())
            .await;

        let mut ops = vec![
            recv_json(&mut rx).await["op"].clone(),
            recv_json(&mut rx).await["op"].clone(),
        ];
        ops.sort_by_key(ToString::to_string);
        assert_eq!(ops, vec![json!("create"), json!("delete")]);
    }
}

//! Domain layer: clients, subscriptions, ACLs and change-feed events.
//!
//! This module contains the server-side model of the live-query engine:
//! client identity and per-connection state, the shared subscription
//! index, object snapshots with their access lists, and the events a
//! change produces.

pub mod acl;
pub mod change_event;
pub mod client;
pub mod client_id;
pub mod client_registry;
pub mod live_object;
pub mod subscription;
pub mod subscription_registry;

pub use acl::{Acl, Permission};
pub use change_event::{ChangeEvent, ChangeTopic, ClearCacheMessage, LiveEventKind};
pub use client::{Client, ClientSender, SubscriptionInfo};
pub use client_id::{ClientId, RequestId};
pub use client_registry::ClientRegistry;
pub use live_object::LiveObject;
pub use subscription::{Subscription, SubscriptionKey};
pub use subscription_registry::SubscriptionRegistry;

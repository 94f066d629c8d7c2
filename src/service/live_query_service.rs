//! Live-query service: protocol state machine and change-feed fan-out.

use std::collections::HashMap;
use std::sync::Arc;

use futures_util::future::join_all;
use serde_json::json;
use tokio::sync::RwLock;

use crate::auth::{AccessContext, SessionResolver};
use crate::domain::{
    ChangeEvent, ClearCacheMessage, Client, ClientId, ClientRegistry, ClientSender, LiveEventKind,
    LiveObject, RequestId, SubscriptionInfo, SubscriptionKey, SubscriptionRegistry, client,
};
use crate::error::LiveQueryError;
use crate::hooks::{
    AfterEventTrigger, ConnectTrigger, HookContext, LifecycleEvent, LifecycleEventKind,
    LiveQueryHooks, SubscribeTrigger,
};
use crate::query::{matches_query, query_hash};
use crate::ws::messages::{ClientRequest, ConnectRequest, SubscribeRequest};

/// Class whose subscriptions are pinned to the subscriber's own sessions.
const SESSION_CLASS: &str = "_Session";

/// Key-pair name that grants the master key.
const MASTER_KEY_NAME: &str = "masterKey";

#[derive(Debug, Default)]
struct LiveQueryState {
    clients: ClientRegistry,
    subscriptions: SubscriptionRegistry,
}

/// Per-socket protocol state: the outbound sender and, once `connect`
/// succeeded, the client id.
#[derive(Debug)]
pub struct ConnectionContext {
    sender: ClientSender,
    client_id: Option<ClientId>,
}

impl ConnectionContext {
    /// Creates the context of a freshly opened socket.
    #[must_use]
    pub fn new(sender: ClientSender) -> Self {
        Self {
            sender,
            client_id: None,
        }
    }

    /// Client id, once connected.
    #[must_use]
    pub const fn client_id(&self) -> Option<ClientId> {
        self.client_id
    }
}

/// Registry counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LiveQueryStats {
    /// Connected clients.
    pub clients: usize,
    /// Live subscriptions (distinct class + query pairs).
    pub subscriptions: usize,
    /// Classes with at least one subscription.
    pub classes: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FanOutKind {
    Save,
    Delete,
}

#[derive(Debug)]
struct DeliveryTarget {
    client_id: ClientId,
    request_id: RequestId,
    original_matched: bool,
    current_matched: bool,
    access: AccessContext,
    installation_id: Option<String>,
    watch: Option<Vec<String>>,
}

/// Delivery targets of one change, captured atomically from the
/// registries. Authorization and pushes happen in [`LiveQueryService::deliver`].
#[derive(Debug)]
pub struct FanOut {
    kind: FanOutKind,
    event: ChangeEvent,
    targets: Vec<DeliveryTarget>,
    clients: usize,
    subscriptions: usize,
}

impl FanOut {
    /// Number of `(client, request)` pairs whose query matched.
    #[must_use]
    pub fn target_count(&self) -> usize {
        self.targets.len()
    }
}

/// Orchestrates the live-query protocol.
///
/// Owns the client and subscription registries behind one lock. Registry
/// mutations complete while the lock is held; authorization and hooks run
/// outside it, so a delivery whose client went away in the meantime is
/// silently dropped.
#[derive(Debug, Clone)]
pub struct LiveQueryService {
    state: Arc<RwLock<LiveQueryState>>,
    resolver: SessionResolver,
    hooks: Arc<dyn LiveQueryHooks>,
    key_pairs: Arc<HashMap<String, String>>,
}

impl LiveQueryService {
    /// Creates a service with empty registries.
    #[must_use]
    pub fn new(
        resolver: SessionResolver,
        hooks: Arc<dyn LiveQueryHooks>,
        key_pairs: HashMap<String, String>,
    ) -> Self {
        Self {
            state: Arc::new(RwLock::new(LiveQueryState::default())),
            resolver,
            hooks,
            key_pairs: Arc::new(key_pairs),
        }
    }

    /// Returns the session resolver.
    #[must_use]
    pub fn resolver(&self) -> &SessionResolver {
        &self.resolver
    }

    /// Returns the registry counters.
    pub async fn stats(&self) -> LiveQueryStats {
        let state = self.state.read().await;
        LiveQueryStats {
            clients: state.clients.len(),
            subscriptions: state.subscriptions.len(),
            classes: state.subscriptions.class_count(),
        }
    }

    /// Reports a newly opened socket.
    pub async fn on_socket_open(&self) {
        let (clients, subscriptions) = self.counts().await;
        self.emit(LifecycleEvent {
            event: LifecycleEventKind::WsConnect,
            client_id: None,
            installation_id: None,
            use_master_key: false,
            clients,
            subscriptions,
        })
        .await;
    }

    /// Parses one inbound text frame and runs it. Failures are pushed to
    /// the socket as `error` messages; the connection stays open.
    pub async fn handle_message(&self, ctx: &mut ConnectionContext, text: &str) {
        let request = match ClientRequest::parse(text) {
            Ok(request) => request,
            Err(err) => {
                tracing::warn!(error = %err, "rejected live query request");
                client::push_error(&ctx.sender, &err, None);
                return;
            }
        };

        let (result, request_id) = match request {
            ClientRequest::Connect(req) => (self.connect(ctx, req).await, None),
            ClientRequest::Subscribe(req) => {
                let request_id = req.request_id;
                (self.subscribe(ctx, req).await, Some(request_id))
            }
            ClientRequest::Update(req) => {
                let request_id = req.request_id;
                (self.update(ctx, req).await, Some(request_id))
            }
            ClientRequest::Unsubscribe(req) => (
                self.unsubscribe(ctx, req.request_id, true).await,
                Some(req.request_id),
            ),
        };

        if let Err(err) = result {
            tracing::warn!(
                error = %err,
                code = err.error_code(),
                request_id = ?request_id,
                "live query request failed"
            );
            client::push_error(&ctx.sender, &err, request_id);
        }
    }

    /// Handles `connect`: validates keys, runs the connect hook, registers
    /// the client and pushes `connected`.
    ///
    /// # Errors
    ///
    /// [`LiveQueryError::AlreadyConnected`] on a second connect,
    /// [`LiveQueryError::InvalidKeys`] when configured key-pairs don't
    /// match, or the hook's error.
    pub async fn connect(
        &self,
        ctx: &mut ConnectionContext,
        request: ConnectRequest,
    ) -> Result<(), LiveQueryError> {
        if let Some(client_id) = ctx.client_id {
            return Err(LiveQueryError::AlreadyConnected(client_id));
        }
        if !self.validate_keys(&request) {
            return Err(LiveQueryError::InvalidKeys);
        }
        let has_master_key = self.has_master_key(&request);

        if self.hooks.is_active() {
            let (clients, subscriptions) = self.counts().await;
            let user_id = self.resolve_user(request.session_token.as_deref()).await;
            let mut trigger = ConnectTrigger {
                context: HookContext {
                    client_id: None,
                    installation_id: request.installation_id.clone(),
                    session_token: request.session_token.clone(),
                    user_id,
                    has_master_key,
                },
                clients,
                subscriptions,
            };
            self.hooks.before_connect(&mut trigger).await?;
        }

        let client_id = ClientId::new();
        let client = Client::new(
            client_id,
            ctx.sender.clone(),
            has_master_key,
            request.session_token,
            request.installation_id.clone(),
        );
        client.push_connect();

        let (clients, subscriptions) = {
            let mut state = self.state.write().await;
            state.clients.insert(client);
            (state.clients.len(), state.subscriptions.len())
        };
        ctx.client_id = Some(client_id);
        tracing::info!(%client_id, clients, "live query client connected");

        self.emit(LifecycleEvent {
            event: LifecycleEventKind::Connect,
            client_id: Some(client_id),
            installation_id: request.installation_id,
            use_master_key: has_master_key,
            clients,
            subscriptions,
        })
        .await;
        Ok(())
    }

    /// Handles `subscribe`: runs the subscribe hook, attaches the client to
    /// the shared subscription for the (possibly rewritten) query and
    /// pushes `subscribed`.
    ///
    /// # Errors
    ///
    /// [`LiveQueryError::NotConnected`] before `connect`,
    /// [`LiveQueryError::DuplicateRequestId`] for a request id in use,
    /// [`LiveQueryError::InvalidSessionToken`] for a `_Session` query
    /// without a resolvable session, or the hook's error.
    pub async fn subscribe(
        &self,
        ctx: &ConnectionContext,
        request: SubscribeRequest,
    ) -> Result<(), LiveQueryError> {
        let client_id = ctx
            .client_id
            .ok_or(LiveQueryError::NotConnected("subscribing"))?;
        let request_id = request.request_id;

        let (connection_token, installation_id, has_master_key) = {
            let state = self.state.read().await;
            let client = state
                .clients
                .get(client_id)
                .ok_or(LiveQueryError::ClientNotFound(client_id))?;
            if client.has_subscription_info(request_id) {
                return Err(LiveQueryError::DuplicateRequestId(request_id));
            }
            (
                client.session_token().map(str::to_string),
                client.installation_id().map(str::to_string),
                client.has_master_key(),
            )
        };

        let mut query = request.query;
        if self.hooks.is_active() {
            let user_id = self
                .resolve_user(request.session_token.as_deref().or(connection_token.as_deref()))
                .await;
            let mut trigger = SubscribeTrigger {
                context: HookContext {
                    client_id: Some(client_id),
                    installation_id,
                    session_token: request.session_token.clone(),
                    user_id,
                    has_master_key,
                },
                request_id,
                query,
            };
            self.hooks.before_subscribe(&mut trigger).await?;
            query = trigger.query;
        }

        if query.class_name == SESSION_CLASS {
            let token = request
                .session_token
                .as_deref()
                .or(connection_token.as_deref())
                .ok_or(LiveQueryError::InvalidSessionToken)?;
            let user_id = match self.resolver.user_id(token).await {
                Ok(Some(user_id)) => user_id,
                Ok(None) => return Err(LiveQueryError::InvalidSessionToken),
                Err(err) => {
                    tracing::warn!(error = %err, "session lookup failed for _Session subscription");
                    return Err(LiveQueryError::InvalidSessionToken);
                }
            };
            let Some(where_clause) = query.where_clause.as_object_mut() else {
                return Err(LiveQueryError::InvalidRequest(
                    "where must be an object".to_string(),
                ));
            };
            where_clause.insert(
                "user".to_string(),
                json!({ "__type": "Pointer", "className": "_User", "objectId": user_id }),
            );
        }

        let hash = query_hash(&query.class_name, &query.where_clause);
        let fields = query.selected_fields();
        let watch = query.watched_fields();
        let class_name = query.class_name;

        let (clients, subscriptions, installation_id) = {
            let mut guard = self.state.write().await;
            let state = &mut *guard;
            let client = state
                .clients
                .get_mut(client_id)
                .ok_or(LiveQueryError::ClientNotFound(client_id))?;
            client.add_subscription_info(
                request_id,
                SubscriptionInfo {
                    subscription: SubscriptionKey {
                        class_name: class_name.clone(),
                        hash: hash.clone(),
                    },
                    fields,
                    watch,
                    session_token: request.session_token,
                },
            )?;
            state
                .subscriptions
                .get_or_create(&class_name, query.where_clause, &hash)
                .add_client(client_id, request_id);
            client.push_subscribe(request_id);
            let installation_id = client.installation_id().map(str::to_string);
            (
                state.clients.len(),
                state.subscriptions.len(),
                installation_id,
            )
        };
        tracing::debug!(
            %client_id,
            request_id,
            class_name = %class_name,
            hash = %hash,
            "subscribed"
        );

        self.emit(LifecycleEvent {
            event: LifecycleEventKind::Subscribe,
            client_id: Some(client_id),
            installation_id,
            use_master_key: has_master_key,
            clients,
            subscriptions,
        })
        .await;
        Ok(())
    }

    /// Handles `update`: an unsubscribe without notification followed by a
    /// subscribe under the same request id. A failed unsubscribe is pushed
    /// and the subscribe still runs.
    ///
    /// # Errors
    ///
    /// Any error of [`Self::subscribe`].
    pub async fn update(
        &self,
        ctx: &ConnectionContext,
        request: SubscribeRequest,
    ) -> Result<(), LiveQueryError> {
        let request_id = request.request_id;
        if let Err(err) = self.unsubscribe(ctx, request_id, false).await {
            tracing::debug!(error = %err, request_id, "update of unknown subscription");
            client::push_error(&ctx.sender, &err, Some(request_id));
        }
        self.subscribe(ctx, request).await
    }

    /// Handles `unsubscribe`: detaches the request from its subscription,
    /// dropping the subscription once nobody listens. Pushes
    /// `unsubscribed` when `notify` is set.
    ///
    /// # Errors
    ///
    /// [`LiveQueryError::NotConnected`] before `connect` or
    /// [`LiveQueryError::SubscriptionNotFound`] for an unknown request id.
    pub async fn unsubscribe(
        &self,
        ctx: &ConnectionContext,
        request_id: RequestId,
        notify: bool,
    ) -> Result<(), LiveQueryError> {
        let client_id = ctx
            .client_id
            .ok_or(LiveQueryError::NotConnected("unsubscribing"))?;

        let (clients, subscriptions, installation_id, has_master_key) = {
            let mut guard = self.state.write().await;
            let state = &mut *guard;
            let client = state
                .clients
                .get_mut(client_id)
                .ok_or(LiveQueryError::ClientNotFound(client_id))?;
            let info = client.remove_subscription_info(request_id).ok_or(
                LiveQueryError::SubscriptionNotFound {
                    client_id,
                    request_id,
                },
            )?;
            state
                .subscriptions
                .remove_client(&info.subscription, client_id, request_id);
            if notify {
                client.push_unsubscribe(request_id);
            }
            let installation_id = client.installation_id().map(str::to_string);
            let has_master_key = client.has_master_key();
            (
                state.clients.len(),
                state.subscriptions.len(),
                installation_id,
                has_master_key,
            )
        };
        tracing::debug!(%client_id, request_id, notify, "unsubscribed");

        if notify {
            self.emit(LifecycleEvent {
                event: LifecycleEventKind::Unsubscribe,
                client_id: Some(client_id),
                installation_id,
                use_master_key: has_master_key,
                clients,
                subscriptions,
            })
            .await;
        }
        Ok(())
    }

    /// Tears down a closed socket: removes the client and every
    /// subscription it held.
    pub async fn disconnect(&self, ctx: &ConnectionContext) {
        let removed = {
            let mut guard = self.state.write().await;
            let state = &mut *guard;
            match ctx.client_id.and_then(|id| state.clients.remove(id)) {
                Some(mut client) => {
                    let client_id = client.id();
                    for (request_id, info) in client.drain_subscription_infos() {
                        state
                            .subscriptions
                            .remove_client(&info.subscription, client_id, request_id);
                    }
                    Some((client, state.clients.len(), state.subscriptions.len()))
                }
                None => None,
            }
        };

        let event = match removed {
            Some((client, clients, subscriptions)) => {
                tracing::info!(client_id = %client.id(), clients, "live query client disconnected");
                LifecycleEvent {
                    event: LifecycleEventKind::WsDisconnect,
                    client_id: Some(client.id()),
                    installation_id: client.installation_id().map(str::to_string),
                    use_master_key: client.has_master_key(),
                    clients,
                    subscriptions,
                }
            }
            None => {
                tracing::debug!(
                    client_id = ?ctx.client_id,
                    "socket closed without a registered client"
                );
                let (clients, subscriptions) = self.counts().await;
                LifecycleEvent {
                    event: LifecycleEventKind::WsDisconnectError,
                    client_id: ctx.client_id,
                    installation_id: None,
                    use_master_key: false,
                    clients,
                    subscriptions,
                }
            }
        };
        self.emit(event).await;
    }

    /// Processes an `afterSave` change end to end. Returns the number of
    /// pushed events.
    pub async fn handle_after_save(&self, event: ChangeEvent) -> usize {
        let fan_out = self.plan_after_save(event).await;
        self.deliver(fan_out).await
    }

    /// Processes an `afterDelete` change end to end. Returns the number of
    /// pushed events.
    pub async fn handle_after_delete(&self, event: ChangeEvent) -> usize {
        let fan_out = self.plan_after_delete(event).await;
        self.deliver(fan_out).await
    }

    /// Drops cached roles of the user named by a `clearCache` message.
    pub async fn handle_clear_cache(&self, message: ClearCacheMessage) {
        self.resolver.clear_cached_roles(&message.user_id).await;
    }

    /// Captures the subscribers an `afterSave` may reach: every request
    /// whose query matches the original or the current snapshot.
    pub async fn plan_after_save(&self, event: ChangeEvent) -> FanOut {
        self.plan(FanOutKind::Save, event).await
    }

    /// Captures the subscribers an `afterDelete` may reach.
    pub async fn plan_after_delete(&self, event: ChangeEvent) -> FanOut {
        self.plan(FanOutKind::Delete, event).await
    }

    /// Authorizes and pushes every target of a fan-out concurrently.
    /// Returns the number of pushed events.
    pub async fn deliver(&self, fan_out: FanOut) -> usize {
        let FanOut {
            kind,
            event,
            targets,
            clients,
            subscriptions,
        } = fan_out;
        let deliveries = targets
            .into_iter()
            .map(|target| self.deliver_one(kind, &event, target, clients, subscriptions));
        join_all(deliveries)
            .await
            .into_iter()
            .filter(|delivered| *delivered)
            .count()
    }

    async fn plan(&self, kind: FanOutKind, event: ChangeEvent) -> FanOut {
        let state = self.state.read().await;
        let mut targets = Vec::new();

        for subscription in state.subscriptions.for_class(event.class_name()) {
            let where_clause = subscription.where_clause();
            let current_matched = matches_query(event.current.as_map(), where_clause);
            let original_matched = kind == FanOutKind::Save
                && event
                    .original
                    .as_ref()
                    .is_some_and(|original| matches_query(original.as_map(), where_clause));
            if !current_matched && !original_matched {
                continue;
            }

            for (client_id, request_ids) in subscription.fanout() {
                let Some(client) = state.clients.get(client_id) else {
                    tracing::error!(%client_id, "subscription references an unknown client");
                    continue;
                };
                for &request_id in request_ids {
                    let Some(info) = client.subscription_info(request_id) else {
                        continue;
                    };
                    targets.push(DeliveryTarget {
                        client_id,
                        request_id,
                        original_matched,
                        current_matched,
                        access: AccessContext {
                            has_master_key: client.has_master_key(),
                            subscription_token: info.session_token.clone(),
                            connection_token: client.session_token().map(str::to_string),
                        },
                        installation_id: client.installation_id().map(str::to_string),
                        watch: info.watch.clone(),
                    });
                }
            }
        }

        let clients = state.clients.len();
        let subscriptions = state.subscriptions.len();
        drop(state);

        tracing::debug!(
            class_name = event.class_name(),
            object_id = event.current.object_id(),
            targets = targets.len(),
            "change fan-out planned"
        );
        FanOut {
            kind,
            event,
            targets,
            clients,
            subscriptions,
        }
    }

    async fn deliver_one(
        &self,
        kind: FanOutKind,
        event: &ChangeEvent,
        target: DeliveryTarget,
        clients: usize,
        subscriptions: usize,
    ) -> bool {
        let current_acl = event.current.acl();
        let live_kind = match kind {
            FanOutKind::Delete => {
                if !self
                    .resolver
                    .authorize(current_acl.as_ref(), &target.access)
                    .await
                {
                    return false;
                }
                LiveEventKind::Delete
            }
            FanOutKind::Save => {
                let original_acl = event.original.as_ref().and_then(LiveObject::acl);
                let original_check = async {
                    target.original_matched
                        && self
                            .resolver
                            .authorize(original_acl.as_ref(), &target.access)
                            .await
                };
                let current_check = async {
                    target.current_matched
                        && self
                            .resolver
                            .authorize(current_acl.as_ref(), &target.access)
                            .await
                };
                let (original_ok, current_ok) = tokio::join!(original_check, current_check);
                let Some(live_kind) = LiveEventKind::classify_save(
                    original_ok,
                    current_ok,
                    event.original.is_some(),
                ) else {
                    return false;
                };
                if matches!(live_kind, LiveEventKind::Create | LiveEventKind::Update)
                    && let Some(watch) = &target.watch
                    && !watched_fields_changed(watch, &event.current, event.original.as_ref())
                {
                    return false;
                }
                live_kind
            }
        };

        let mut object = event.current.clone();
        let mut original = match live_kind {
            LiveEventKind::Delete => None,
            _ => event.original.clone(),
        };

        if self.hooks.is_active() {
            let session_token = target
                .access
                .subscription_token
                .clone()
                .or_else(|| target.access.connection_token.clone());
            let user_id = self.resolve_user(session_token.as_deref()).await;
            let mut trigger = AfterEventTrigger {
                context: HookContext {
                    client_id: Some(target.client_id),
                    installation_id: target.installation_id.clone(),
                    session_token,
                    user_id,
                    has_master_key: target.access.has_master_key,
                },
                request_id: target.request_id,
                event: live_kind,
                object,
                original,
                send_event: true,
                clients,
                subscriptions,
            };
            if let Err(err) = self.hooks.after_event(&mut trigger).await {
                let err = LiveQueryError::from(err);
                tracing::warn!(
                    client_id = %target.client_id,
                    request_id = target.request_id,
                    error = %err,
                    "afterEvent hook failed"
                );
                let state = self.state.read().await;
                if let Some(client) = state.clients.get(target.client_id) {
                    client.push_error(&err, Some(target.request_id));
                }
                return false;
            }
            if !trigger.send_event {
                return false;
            }
            object = trigger.object;
            original = trigger.original;
        }

        if !target.access.has_master_key {
            object.strip_sensitive_fields();
            if let Some(original) = original.as_mut() {
                original.strip_sensitive_fields();
            }
        }

        let state = self.state.read().await;
        match state.clients.get(target.client_id) {
            Some(client) if client.has_subscription_info(target.request_id) => {
                client.push_event(live_kind, target.request_id, &object, original.as_ref());
                tracing::debug!(
                    client_id = %target.client_id,
                    request_id = target.request_id,
                    event = live_kind.as_str(),
                    "live event pushed"
                );
                true
            }
            _ => {
                tracing::debug!(
                    client_id = %target.client_id,
                    request_id = target.request_id,
                    "delivery target gone"
                );
                false
            }
        }
    }

    fn validate_keys(&self, request: &ConnectRequest) -> bool {
        self.key_pairs.is_empty()
            || self
                .key_pairs
                .iter()
                .any(|(name, secret)| request.key(name) == Some(secret.as_str()))
    }

    fn has_master_key(&self, request: &ConnectRequest) -> bool {
        match (self.key_pairs.get(MASTER_KEY_NAME), request.master_key.as_deref()) {
            (Some(expected), Some(given)) => expected == given,
            _ => false,
        }
    }

    /// Best-effort user lookup for hook contexts.
    async fn resolve_user(&self, session_token: Option<&str>) -> Option<String> {
        let token = session_token?;
        match self.resolver.user_id(token).await {
            Ok(user_id) => user_id,
            Err(err) => {
                tracing::debug!(error = %err, "session lookup for hook context failed");
                None
            }
        }
    }

    async fn counts(&self) -> (usize, usize) {
        let state = self.state.read().await;
        (state.clients.len(), state.subscriptions.len())
    }

    async fn emit(&self, event: LifecycleEvent) {
        tracing::trace!(
            event = ?event.event,
            clients = event.clients,
            subscriptions = event.subscriptions,
            "lifecycle"
        );
        self.hooks.on_lifecycle_event(&event).await;
    }
}

/// A `watch` list gates `create` / `update`: at least one watched field
/// must differ between the snapshots.
fn watched_fields_changed(
    watch: &[String],
    current: &LiveObject,
    original: Option<&LiveObject>,
) -> bool {
    watch
        .iter()
        .any(|field| current.get(field) != original.and_then(|o| o.get(field)))
}

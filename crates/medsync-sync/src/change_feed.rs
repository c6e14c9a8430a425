//! # Change Feed Client
//!
//! Subscribes to change notifications on remote tables and routes each one
//! to the callback registered for its channel.
//!
//! ## Channel Multiplexing
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                        Change Feed Client                               │
//! │                                                                         │
//! │  subscribe(spec, cb) ──► Registry ──► "realtime:<table>:<filter|*>:<n>"│
//! │                             │                                           │
//! │                             ▼                                           │
//! │                     ┌───────────────┐        one socket                 │
//! │                     │   Transport   │ ◄──────────────────► change feed  │
//! │                     └───────┬───────┘                                   │
//! │                             │ Connected ──► replay every live channel   │
//! │                             │ Change    ──► registry lookup ──► cb(evt) │
//! │                             │ ChannelError ──► warn, keep going         │
//! │                                                                         │
//! │  A failing channel never fails the caller: the category simply falls   │
//! │  back to its initial fetch plus explicit reloads.                      │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```

use async_trait::async_trait;
use medsync_core::{ChangeEvent, EventMask, RowFilter};
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};
use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::{SyncError, SyncResult};
use crate::protocol::{ChangePayload, FeedMessage, SubscribePayload};
use crate::session::SessionStore;
use crate::transport::{Transport, TransportConfig, TransportEvent, TransportHandle};

/// Invoked for every matching change. Must not block.
pub type ChangeCallback = Arc<dyn Fn(&ChangeEvent) + Send + Sync>;

// =============================================================================
// Channel Spec / Handle
// =============================================================================

/// What a subscription listens to.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ChannelSpec {
    pub table: String,
    pub filter: Option<RowFilter>,
    pub events: EventMask,
}

impl ChannelSpec {
    /// All operations on `table`, unfiltered.
    pub fn table(table: impl Into<String>) -> Self {
        Self {
            table: table.into(),
            filter: None,
            events: EventMask::All,
        }
    }

    pub fn filtered(table: impl Into<String>, column: &str, value: &str) -> Self {
        Self::table(table).with_filter(RowFilter::eq(column, value))
    }

    pub fn with_filter(mut self, filter: RowFilter) -> Self {
        self.filter = Some(filter);
        self
    }

    pub fn only(mut self, events: EventMask) -> Self {
        self.events = events;
        self
    }

    /// Unfiltered specs match every row of their table; filtered specs
    /// match only events carrying the same filter.
    pub fn matches(&self, event: &ChangeEvent) -> bool {
        if self.table != event.table || !self.events.matches(event.operation) {
            return false;
        }
        match &self.filter {
            None => true,
            Some(filter) => event.filter.as_ref() == Some(filter),
        }
    }

    fn channel_name(&self, id: u64) -> String {
        let filter = self
            .filter
            .as_ref()
            .map(|f| f.to_string())
            .unwrap_or_else(|| "*".to_string());
        format!("realtime:{}:{}:{}", self.table, filter, id)
    }
}

/// Opaque token for a live subscription.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct FeedHandle {
    id: u64,
    channel: String,
}

impl FeedHandle {
    pub fn channel(&self) -> &str {
        &self.channel
    }
}

// =============================================================================
// Change Feed Trait
// =============================================================================

#[async_trait]
pub trait ChangeFeed: Send + Sync {
    /// Registers `callback` for changes matching `spec`.
    ///
    /// Returns `ChannelError` only when the subscription is refused
    /// outright; network trouble after registration is logged instead.
    async fn subscribe(&self, spec: ChannelSpec, callback: ChangeCallback) -> SyncResult<FeedHandle>;

    /// Stops delivery for `handle`. Unknown handles are ignored.
    async fn unsubscribe(&self, handle: FeedHandle) -> SyncResult<()>;
}

// =============================================================================
// Registry
// =============================================================================

struct Registration {
    channel: String,
    spec: ChannelSpec,
    callback: ChangeCallback,
}

#[derive(Default)]
struct Registry {
    next_id: u64,
    entries: HashMap<u64, Registration>,
}

impl Registry {
    fn insert(&mut self, spec: ChannelSpec, callback: ChangeCallback) -> FeedHandle {
        self.next_id += 1;
        let id = self.next_id;
        let channel = spec.channel_name(id);
        self.entries.insert(
            id,
            Registration {
                channel: channel.clone(),
                spec,
                callback,
            },
        );
        FeedHandle { id, channel }
    }

    fn remove(&mut self, handle: &FeedHandle) -> Option<Registration> {
        self.entries.remove(&handle.id)
    }

    fn by_channel(&self, channel: &str) -> Option<&Registration> {
        self.entries.values().find(|r| r.channel == channel)
    }

    fn matching(&self, event: &ChangeEvent) -> Vec<ChangeCallback> {
        self.entries
            .values()
            .filter(|r| r.spec.matches(event))
            .map(|r| r.callback.clone())
            .collect()
    }
}

fn lock(registry: &Mutex<Registry>) -> std::sync::MutexGuard<'_, Registry> {
    registry.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

// =============================================================================
// Realtime Feed (WebSocket)
// =============================================================================

/// Change feed backed by one multiplexed WebSocket.
#[derive(Clone)]
pub struct RealtimeFeed {
    registry: Arc<Mutex<Registry>>,
    transport: TransportHandle,
    session: SessionStore,
}

impl RealtimeFeed {
    /// Spawns the transport and the routing task.
    pub fn connect(config: TransportConfig, session: SessionStore, cancel: CancellationToken) -> Self {
        let (transport, events) = Transport::spawn(config, cancel.clone());
        let feed = Self {
            registry: Arc::new(Mutex::new(Registry::default())),
            transport,
            session,
        };

        let router = Router {
            feed: feed.clone(),
            events,
            token: feed.session.subscribe_token(),
            cancel,
        };
        tokio::spawn(router.run());

        feed
    }

    fn subscribe_message(&self, channel: &str, spec: &ChannelSpec) -> FeedMessage {
        FeedMessage::Subscribe(SubscribePayload {
            channel: channel.to_string(),
            table: spec.table.clone(),
            filter: spec.filter.clone(),
            events: spec.events,
            access_token: self.session.access_token(),
        })
    }

    /// Sends without waiting. Registrations that miss the socket are
    /// re-sent by [`RealtimeFeed::replay`] on the next connect.
    fn send_or_log(&self, message: FeedMessage) {
        let msg_type = message.type_name();
        match self.transport.send(message) {
            Ok(()) => {}
            Err(SyncError::Disconnected) => {
                debug!(msg_type, "Change feed offline, left to the reconnect replay");
            }
            Err(e) => warn!(?e, msg_type, "Change feed send failed"),
        }
    }

    fn replay(&self) {
        let messages: Vec<FeedMessage> = {
            let registry = lock(&self.registry);
            registry
                .entries
                .values()
                .map(|r| self.subscribe_message(&r.channel, &r.spec))
                .collect()
        };
        info!(channels = messages.len(), "Replaying change feed subscriptions");
        for message in messages {
            self.send_or_log(message);
        }
    }

    fn route(&self, change: ChangePayload) {
        let delivery = {
            let registry = lock(&self.registry);
            registry.by_channel(&change.channel).and_then(|r| {
                r.spec.events.matches(change.operation).then(|| {
                    let mut event = ChangeEvent::new(change.table.clone(), change.operation);
                    event.filter = r.spec.filter.clone();
                    (r.callback.clone(), event)
                })
            })
        };

        match delivery {
            Some((callback, event)) => {
                debug!(channel = %change.channel, operation = %change.operation, "Change received");
                callback(&event);
            }
            None => debug!(channel = %change.channel, "Change for unknown or masked channel"),
        }
    }
}

#[async_trait]
impl ChangeFeed for RealtimeFeed {
    async fn subscribe(&self, spec: ChannelSpec, callback: ChangeCallback) -> SyncResult<FeedHandle> {
        let handle = lock(&self.registry).insert(spec.clone(), callback);
        debug!(channel = %handle.channel, "Subscribing");
        self.send_or_log(self.subscribe_message(&handle.channel, &spec));
        Ok(handle)
    }

    async fn unsubscribe(&self, handle: FeedHandle) -> SyncResult<()> {
        let removed = lock(&self.registry).remove(&handle).is_some();
        if removed {
            debug!(channel = %handle.channel, "Unsubscribing");
            self.send_or_log(FeedMessage::unsubscribe(&handle.channel));
        }
        Ok(())
    }
}

/// Consumes transport events for a [`RealtimeFeed`].
struct Router {
    feed: RealtimeFeed,
    events: mpsc::Receiver<TransportEvent>,
    token: watch::Receiver<Option<String>>,
    cancel: CancellationToken,
}

impl Router {
    async fn run(mut self) {
        loop {
            tokio::select! {
                event = self.events.recv() => {
                    match event {
                        Some(event) => self.handle(event),
                        None => break,
                    }
                }

                changed = self.token.changed() => {
                    if changed.is_err() {
                        break;
                    }
                    let token = self.token.borrow_and_update().clone();
                    if let Some(token) = token {
                        self.feed.send_or_log(FeedMessage::AccessToken { token });
                    }
                }

                _ = self.cancel.cancelled() => break,
            }
        }
        debug!("Change feed router stopped");
    }

    fn handle(&self, event: TransportEvent) {
        match event {
            TransportEvent::Connected => self.feed.replay(),
            TransportEvent::Disconnected => {
                warn!("Change feed disconnected, changes are paused until reconnect");
            }
            TransportEvent::Message(message) => match message {
                FeedMessage::Change(change) => self.feed.route(change),
                FeedMessage::Subscribed { channel } => debug!(%channel, "Channel live"),
                FeedMessage::ChannelError { channel, message } => {
                    warn!(%channel, %message, "Channel error, falling back to explicit reloads");
                }
                FeedMessage::Ping { .. } => self.feed.send_or_log(FeedMessage::pong()),
                FeedMessage::Error { code, message } => {
                    warn!(%code, %message, "Change feed error");
                }
                other => debug!(msg_type = %other.type_name(), "Ignoring message"),
            },
        }
    }
}

// =============================================================================
// Local Feed (in-process)
// =============================================================================

#[derive(Default)]
struct LocalState {
    subscribe_count: usize,
    unsubscribe_count: usize,
    refused_tables: HashSet<String>,
}

/// In-process change feed. Changes are injected with [`LocalFeed::emit`].
#[derive(Clone, Default)]
pub struct LocalFeed {
    registry: Arc<Mutex<Registry>>,
    state: Arc<Mutex<LocalState>>,
}

impl LocalFeed {
    pub fn new() -> Self {
        Self::default()
    }

    /// Delivers `event` to every matching live subscription. Returns the
    /// number of callbacks invoked.
    pub fn emit(&self, event: ChangeEvent) -> usize {
        let callbacks = lock(&self.registry).matching(&event);
        for callback in &callbacks {
            callback(&event);
        }
        callbacks.len()
    }

    /// Makes future subscriptions on `table` fail with `ChannelError`.
    pub fn refuse_table(&self, table: &str) {
        self.local().refused_tables.insert(table.to_string());
    }

    pub fn live_count(&self) -> usize {
        lock(&self.registry).entries.len()
    }

    pub fn live_specs(&self) -> Vec<ChannelSpec> {
        lock(&self.registry)
            .entries
            .values()
            .map(|r| r.spec.clone())
            .collect()
    }

    pub fn subscribe_count(&self) -> usize {
        self.local().subscribe_count
    }

    pub fn unsubscribe_count(&self) -> usize {
        self.local().unsubscribe_count
    }

    fn local(&self) -> std::sync::MutexGuard<'_, LocalState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

#[async_trait]
impl ChangeFeed for LocalFeed {
    async fn subscribe(&self, spec: ChannelSpec, callback: ChangeCallback) -> SyncResult<FeedHandle> {
        if self.local().refused_tables.contains(&spec.table) {
            return Err(SyncError::ChannelError {
                channel: spec.channel_name(0),
                message: "subscription refused".into(),
            });
        }
        self.local().subscribe_count += 1;
        Ok(lock(&self.registry).insert(spec, callback))
    }

    async fn unsubscribe(&self, handle: FeedHandle) -> SyncResult<()> {
        if lock(&self.registry).remove(&handle).is_some() {
            self.local().unsubscribe_count += 1;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::Session;
    use futures_util::{SinkExt, StreamExt};
    use medsync_core::ChangeOperation;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;
    use tokio::net::{TcpListener, TcpStream};
    use tokio::time::{sleep, timeout};
    use tokio_tungstenite::tungstenite::Message as WsMessage;
    use tokio_tungstenite::WebSocketStream;

    type ServerSocket = WebSocketStream<TcpStream>;

    fn counter() -> (Arc<AtomicUsize>, ChangeCallback) {
        let hits = Arc::new(AtomicUsize::new(0));
        let cb_hits = hits.clone();
        let callback: ChangeCallback = Arc::new(move |_: &ChangeEvent| {
            cb_hits.fetch_add(1, Ordering::SeqCst);
        });
        (hits, callback)
    }

    #[test]
    fn test_channel_name_format() {
        let spec = ChannelSpec::filtered("medicines", "calendar_id", "c1");
        assert_eq!(spec.channel_name(7), "realtime:medicines:calendar_id=eq.c1:7");
        assert_eq!(ChannelSpec::table("share_tokens").channel_name(2), "realtime:share_tokens:*:2");
    }

    #[test]
    fn test_spec_matching() {
        let filtered = ChannelSpec::filtered("medicines", "calendar_id", "c1");
        let event = ChangeEvent::new("medicines", ChangeOperation::Insert);

        assert!(!filtered.matches(&event));
        assert!(filtered.matches(&event.clone().with_filter(RowFilter::eq("calendar_id", "c1"))));
        assert!(!filtered.matches(&event.clone().with_filter(RowFilter::eq("calendar_id", "c2"))));

        let deletes = ChannelSpec::table("share_tokens").only(EventMask::Delete);
        assert!(deletes.matches(&ChangeEvent::new("share_tokens", ChangeOperation::Delete)));
        assert!(!deletes.matches(&ChangeEvent::new("share_tokens", ChangeOperation::Insert)));
    }

    #[tokio::test]
    async fn test_local_feed_delivery_and_unsubscribe() {
        let feed = LocalFeed::new();
        let (hits, callback) = counter();

        let handle = feed
            .subscribe(ChannelSpec::table("medicines"), callback)
            .await
            .unwrap();
        assert_eq!(feed.live_count(), 1);

        assert_eq!(feed.emit(ChangeEvent::new("medicines", ChangeOperation::Update)), 1);
        assert_eq!(feed.emit(ChangeEvent::new("calendars", ChangeOperation::Update)), 0);
        assert_eq!(hits.load(Ordering::SeqCst), 1);

        feed.unsubscribe(handle.clone()).await.unwrap();
        feed.unsubscribe(handle).await.unwrap();
        assert_eq!(feed.live_count(), 0);
        assert_eq!(feed.unsubscribe_count(), 1);

        feed.emit(ChangeEvent::new("medicines", ChangeOperation::Update));
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_local_feed_refusal() {
        let feed = LocalFeed::new();
        feed.refuse_table("notifications");
        let (_, callback) = counter();
        let result = feed.subscribe(ChannelSpec::table("notifications"), callback).await;
        assert!(matches!(result, Err(SyncError::ChannelError { .. })));
        assert_eq!(feed.live_count(), 0);
    }

    #[test]
    fn test_registry_lookup_by_channel() {
        let mut registry = Registry::default();
        let (_, callback) = counter();
        let handle = registry.insert(ChannelSpec::table("calendars"), callback);
        assert!(registry.by_channel(handle.channel()).is_some());
        assert!(registry.by_channel("realtime:calendars:*:99").is_none());
        assert!(registry.remove(&handle).is_some());
        assert!(registry.by_channel(handle.channel()).is_none());
    }

    // -------------------------------------------------------------------------
    // RealtimeFeed against a live socket
    // -------------------------------------------------------------------------

    fn quick_config(url: String) -> TransportConfig {
        TransportConfig {
            url,
            connect_timeout: Duration::from_secs(2),
            initial_backoff: Duration::from_millis(20),
            max_backoff: Duration::from_millis(50),
            ..Default::default()
        }
    }

    async fn accept(listener: &TcpListener) -> ServerSocket {
        let (stream, _) = timeout(Duration::from_secs(5), listener.accept())
            .await
            .unwrap()
            .unwrap();
        tokio_tungstenite::accept_async(stream).await.unwrap()
    }

    /// Next protocol message from the client, skipping control frames.
    async fn next_message(socket: &mut ServerSocket) -> FeedMessage {
        loop {
            let frame = timeout(Duration::from_secs(5), socket.next())
                .await
                .unwrap()
                .unwrap()
                .unwrap();
            if let WsMessage::Text(text) = frame {
                return FeedMessage::from_json(&text).unwrap();
            }
        }
    }

    async fn push(socket: &mut ServerSocket, message: FeedMessage) {
        let json = message.to_json().unwrap();
        socket.send(WsMessage::Text(json.into())).await.unwrap();
    }

    /// Reads until a subscribe has arrived for every channel in `channels`.
    async fn expect_subscribes(
        socket: &mut ServerSocket,
        channels: &[&str],
    ) -> HashMap<String, SubscribePayload> {
        let mut seen = HashMap::new();
        while !channels.iter().all(|c| seen.contains_key(*c)) {
            if let FeedMessage::Subscribe(payload) = next_message(socket).await {
                seen.insert(payload.channel.clone(), payload);
            }
        }
        seen
    }

    /// Pings the client and waits for the pong. Everything pushed before
    /// the ping has been routed once this returns.
    async fn round_trip(socket: &mut ServerSocket) {
        push(socket, FeedMessage::ping()).await;
        while !matches!(next_message(socket).await, FeedMessage::Pong { .. }) {}
    }

    fn change(channel: &str, table: &str, operation: ChangeOperation) -> FeedMessage {
        FeedMessage::Change(ChangePayload {
            channel: channel.to_string(),
            table: table.to_string(),
            operation,
        })
    }

    #[tokio::test]
    async fn test_offline_subscribes_return_immediately() {
        let cancel = CancellationToken::new();
        let feed = RealtimeFeed::connect(
            TransportConfig {
                url: "ws://127.0.0.1:9/realtime".to_string(),
                connect_timeout: Duration::from_millis(200),
                initial_backoff: Duration::from_secs(60),
                max_backoff: Duration::from_secs(60),
                ..Default::default()
            },
            SessionStore::new(),
            cancel.clone(),
        );

        // More than the transport queue holds.
        let mut handles = Vec::new();
        for n in 0..150 {
            let (_, callback) = counter();
            let spec = ChannelSpec::filtered("medicines", "calendar_id", &format!("c{}", n));
            let handle = timeout(Duration::from_secs(2), feed.subscribe(spec, callback))
                .await
                .expect("subscribe waited on the socket")
                .unwrap();
            handles.push(handle);
        }
        assert_eq!(lock(&feed.registry).entries.len(), 150);

        for handle in handles {
            timeout(Duration::from_secs(2), feed.unsubscribe(handle))
                .await
                .expect("unsubscribe waited on the socket")
                .unwrap();
        }
        assert!(lock(&feed.registry).entries.is_empty());
        cancel.cancel();
    }

    #[tokio::test]
    async fn test_realtime_feed_routes_refreshes_and_replays() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let url = format!("ws://{}/realtime", listener.local_addr().unwrap());
        let cancel = CancellationToken::new();
        let session = SessionStore::with_session(Session::new("u1", "tok-1", None));
        let feed = RealtimeFeed::connect(quick_config(url), session.clone(), cancel.clone());

        let mut socket = accept(&listener).await;
        timeout(Duration::from_secs(5), async {
            while !feed.transport.is_connected() {
                sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .unwrap();

        let (medicine_hits, callback) = counter();
        let medicines = feed
            .subscribe(ChannelSpec::filtered("medicines", "calendar_id", "c1"), callback)
            .await
            .unwrap();
        let (revocation_hits, callback) = counter();
        let revocations = feed
            .subscribe(ChannelSpec::table("share_tokens").only(EventMask::Delete), callback)
            .await
            .unwrap();

        let subscribed =
            expect_subscribes(&mut socket, &[medicines.channel(), revocations.channel()]).await;
        let payload = &subscribed[medicines.channel()];
        assert_eq!(payload.table, "medicines");
        assert_eq!(payload.filter, Some(RowFilter::eq("calendar_id", "c1")));
        assert_eq!(payload.access_token.as_deref(), Some("tok-1"));

        // Routed by channel name, filtered by the channel's event mask.
        push(&mut socket, change(medicines.channel(), "medicines", ChangeOperation::Update)).await;
        push(&mut socket, change(revocations.channel(), "share_tokens", ChangeOperation::Insert)).await;
        push(&mut socket, change("realtime:medicines:*:999", "medicines", ChangeOperation::Insert)).await;
        push(
            &mut socket,
            FeedMessage::ChannelError {
                channel: revocations.channel().to_string(),
                message: "denied".to_string(),
            },
        )
        .await;
        round_trip(&mut socket).await;
        assert_eq!(medicine_hits.load(Ordering::SeqCst), 1);
        assert_eq!(revocation_hits.load(Ordering::SeqCst), 0);

        // A channel error is logged, the registration stays.
        push(&mut socket, change(revocations.channel(), "share_tokens", ChangeOperation::Delete)).await;
        round_trip(&mut socket).await;
        assert_eq!(revocation_hits.load(Ordering::SeqCst), 1);

        // Same user, new token.
        session.set(Some(Session::new("u1", "tok-2", None)));
        loop {
            if let FeedMessage::AccessToken { token } = next_message(&mut socket).await {
                assert_eq!(token, "tok-2");
                break;
            }
        }

        // Server drops the socket: every live channel comes back on the next one.
        socket.close(None).await.unwrap();
        drop(socket);
        let mut socket = accept(&listener).await;
        let replayed =
            expect_subscribes(&mut socket, &[medicines.channel(), revocations.channel()]).await;
        assert_eq!(replayed[medicines.channel()].access_token.as_deref(), Some("tok-2"));

        push(&mut socket, change(medicines.channel(), "medicines", ChangeOperation::Delete)).await;
        round_trip(&mut socket).await;
        assert_eq!(medicine_hits.load(Ordering::SeqCst), 2);

        let channel = medicines.channel().to_string();
        feed.unsubscribe(medicines).await.unwrap();
        loop {
            if let FeedMessage::Unsubscribe { channel: gone } = next_message(&mut socket).await {
                assert_eq!(gone, channel);
                break;
            }
        }

        cancel.cancel();
    }
}

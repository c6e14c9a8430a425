//! # WebSocket Transport
//!
//! WebSocket client for the change feed with automatic reconnection and
//! backoff.
//!
//! ## Connection Lifecycle
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                    WebSocket Connection States                          │
//! │                                                                         │
//! │  ┌────────────┐    connect()    ┌────────────┐                         │
//! │  │Disconnected│ ──────────────► │ Connecting │                         │
//! │  └────────────┘                 └─────┬──────┘                         │
//! │        ▲                              │                                 │
//! │        │                    success   │   failure                       │
//! │        │                        ┌─────┴─────┐                          │
//! │        │                        ▼           ▼                           │
//! │        │              ┌────────────┐  ┌────────────┐                   │
//! │        │              │ Connected  │  │ Backoff    │                   │
//! │        │              └─────┬──────┘  └─────┬──────┘                   │
//! │        │                    │               │                           │
//! │        │              disconnect/error      │  timer expired            │
//! │        │                    ▼               │                           │
//! │        │              ┌────────────┐        │                           │
//! │        └───────────── │Reconnecting│ ◄──────┘                          │
//! │                       └────────────┘                                    │
//! │                                                                         │
//! │  Every successful connect emits TransportEvent::Connected so the       │
//! │  feed can replay its live channel registrations.                       │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```

use backoff::backoff::Backoff;
use backoff::ExponentialBackoff;
use futures_util::{SinkExt, StreamExt};
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, watch};
use tokio::time::timeout;
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::error::{SyncError, SyncResult};
use crate::protocol::FeedMessage;

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

// =============================================================================
// Transport State
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    /// Waiting before reconnection attempt.
    Backoff,
    Reconnecting,
}

impl std::fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConnectionState::Disconnected => write!(f, "disconnected"),
            ConnectionState::Connecting => write!(f, "connecting"),
            ConnectionState::Connected => write!(f, "connected"),
            ConnectionState::Backoff => write!(f, "backoff"),
            ConnectionState::Reconnecting => write!(f, "reconnecting"),
        }
    }
}

/// What the transport reports to its owner.
#[derive(Debug, Clone)]
pub enum TransportEvent {
    /// A socket is up; anything sent before this was discarded.
    Connected,
    Message(FeedMessage),
    Disconnected,
}

// =============================================================================
// Transport Configuration
// =============================================================================

#[derive(Debug, Clone)]
pub struct TransportConfig {
    /// WebSocket URL to connect to.
    pub url: String,

    /// Appended as the `apikey` query parameter when set.
    pub api_key: Option<String>,

    pub connect_timeout: Duration,

    /// Keepalive ping interval.
    pub ping_interval: Duration,

    pub initial_backoff: Duration,

    pub max_backoff: Duration,

    /// Maximum reconnection attempts (0 = infinite).
    pub max_retries: u32,
}

impl Default for TransportConfig {
    fn default() -> Self {
        TransportConfig {
            url: String::new(),
            api_key: None,
            connect_timeout: Duration::from_secs(10),
            ping_interval: Duration::from_secs(30),
            initial_backoff: Duration::from_millis(500),
            max_backoff: Duration::from_secs(60),
            max_retries: 0, // Infinite
        }
    }
}

impl TransportConfig {
    /// Final connection URL including the api key, if any.
    pub fn connect_url(&self) -> SyncResult<url::Url> {
        let mut url = url::Url::parse(&self.url)?;
        if let Some(key) = &self.api_key {
            url.query_pairs_mut().append_pair("apikey", key);
        }
        Ok(url)
    }
}

// =============================================================================
// Transport Handle
// =============================================================================

/// Handle for interacting with the transport from other components.
#[derive(Clone)]
pub struct TransportHandle {
    outgoing_tx: mpsc::Sender<FeedMessage>,
    state: watch::Receiver<ConnectionState>,
    cancel: CancellationToken,
}

impl TransportHandle {
    /// Queues a message for the live socket. Never waits.
    ///
    /// Fails with `Disconnected` while no socket is up; whatever the owner
    /// needs on the server must be re-sent on the next `Connected` event.
    pub fn send(&self, message: FeedMessage) -> SyncResult<()> {
        if !self.is_connected() {
            return Err(SyncError::Disconnected);
        }
        self.outgoing_tx.try_send(message).map_err(|e| match e {
            TrySendError::Full(_) => SyncError::Internal("change feed send queue full".into()),
            TrySendError::Closed(_) => SyncError::ShuttingDown,
        })
    }

    pub fn state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    pub fn is_connected(&self) -> bool {
        self.state() == ConnectionState::Connected
    }

    /// Closes the socket and stops reconnecting.
    pub fn shutdown(&self) {
        self.cancel.cancel();
    }
}

// =============================================================================
// WebSocket Transport
// =============================================================================

/// WebSocket transport with automatic reconnection.
///
/// ## Usage
/// ```rust,ignore
/// let (handle, mut events) = Transport::spawn(config.transport(), cancel.child_token());
///
/// while let Some(event) = events.recv().await {
///     match event {
///         TransportEvent::Connected => { /* replay subscriptions */ }
///         TransportEvent::Message(msg) => { /* route */ }
///         TransportEvent::Disconnected => {}
///     }
/// }
/// ```
pub struct Transport {
    config: TransportConfig,
    state: watch::Sender<ConnectionState>,
    outgoing_rx: mpsc::Receiver<FeedMessage>,
    events_tx: mpsc::Sender<TransportEvent>,
    cancel: CancellationToken,
}

impl Transport {
    /// Creates a new transport and spawns its background task.
    pub fn spawn(
        config: TransportConfig,
        cancel: CancellationToken,
    ) -> (TransportHandle, mpsc::Receiver<TransportEvent>) {
        let (outgoing_tx, outgoing_rx) = mpsc::channel::<FeedMessage>(100);
        let (events_tx, events_rx) = mpsc::channel::<TransportEvent>(100);
        let (state, state_rx) = watch::channel(ConnectionState::Disconnected);

        let transport = Transport {
            config,
            state,
            outgoing_rx,
            events_tx,
            cancel: cancel.clone(),
        };

        tokio::spawn(transport.run());

        let handle = TransportHandle {
            outgoing_tx,
            state: state_rx,
            cancel,
        };

        (handle, events_rx)
    }

    async fn run(mut self) {
        info!(url = %self.config.url, "Transport starting");

        let mut backoff = self.create_backoff();
        let mut retry_count = 0u32;

        loop {
            if self.cancel.is_cancelled() {
                info!("Transport received shutdown signal");
                break;
            }

            self.state.send_replace(ConnectionState::Connecting);

            match self.connect_with_timeout().await {
                Ok(ws_stream) => {
                    info!("Change feed connected");
                    backoff.reset();
                    retry_count = 0;

                    // Leftovers from the previous socket are superseded by the replay.
                    while self.outgoing_rx.try_recv().is_ok() {}
                    self.state.send_replace(ConnectionState::Connected);

                    if self.events_tx.send(TransportEvent::Connected).await.is_err() {
                        break;
                    }

                    if let Err(e) = self.connection_loop(ws_stream).await {
                        warn!(?e, "Connection loop ended");
                    }
                    self.state.send_replace(ConnectionState::Reconnecting);

                    if self.events_tx.send(TransportEvent::Disconnected).await.is_err() {
                        break;
                    }
                }
                Err(e) => {
                    error!(?e, "Failed to connect");
                }
            }

            if self.cancel.is_cancelled() {
                break;
            }

            self.state.send_replace(ConnectionState::Backoff);

            if self.config.max_retries > 0 {
                retry_count += 1;
                if retry_count >= self.config.max_retries {
                    error!(
                        max_retries = self.config.max_retries,
                        "Max reconnection attempts reached"
                    );
                    break;
                }
            }

            if let Some(duration) = backoff.next_backoff() {
                debug!(?duration, attempt = retry_count, "Waiting before reconnect");

                tokio::select! {
                    _ = tokio::time::sleep(duration) => {
                        self.state.send_replace(ConnectionState::Reconnecting);
                    }
                    _ = self.cancel.cancelled() => {
                        info!("Shutdown during backoff");
                        break;
                    }
                }
            } else {
                error!("Backoff exhausted");
                break;
            }
        }

        self.state.send_replace(ConnectionState::Disconnected);
        info!("Transport stopped");
    }

    async fn connect_with_timeout(&self) -> SyncResult<WsStream> {
        let url = self.config.connect_url()?;
        let connect_future = connect_async(url.as_str());

        match timeout(self.config.connect_timeout, connect_future).await {
            Ok(Ok((ws_stream, response))) => {
                debug!(status = ?response.status(), "WebSocket handshake complete");
                Ok(ws_stream)
            }
            Ok(Err(e)) => Err(SyncError::from(e)),
            Err(_) => Err(SyncError::Timeout(format!(
                "connect after {}s",
                self.config.connect_timeout.as_secs()
            ))),
        }
    }

    async fn connection_loop(&mut self, ws_stream: WsStream) -> SyncResult<()> {
        let (mut write, mut read) = ws_stream.split();

        let mut ping_interval = tokio::time::interval(self.config.ping_interval);
        ping_interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                Some(msg) = self.outgoing_rx.recv() => {
                    let json = msg.to_json()?;
                    debug!(msg_type = %msg.type_name(), "Sending message");
                    write.send(WsMessage::Text(json.into())).await?;
                }

                frame = read.next() => {
                    let Some(result) = frame else {
                        info!("Change feed closed the stream");
                        return Ok(());
                    };
                    match result {
                        Ok(WsMessage::Text(text)) => {
                            match FeedMessage::from_json(&text) {
                                Ok(msg) => {
                                    debug!(msg_type = %msg.type_name(), "Received message");
                                    if self.events_tx.send(TransportEvent::Message(msg)).await.is_err() {
                                        return Err(SyncError::ShuttingDown);
                                    }
                                }
                                Err(e) => {
                                    warn!(?e, "Failed to parse message");
                                }
                            }
                        }
                        Ok(WsMessage::Ping(data)) => {
                            write.send(WsMessage::Pong(data)).await?;
                        }
                        Ok(WsMessage::Pong(_)) => {
                            debug!("Received pong");
                        }
                        Ok(WsMessage::Close(frame)) => {
                            info!(?frame, "Received close frame");
                            return Ok(());
                        }
                        Ok(WsMessage::Binary(_)) => {
                            warn!("Received unexpected binary message");
                        }
                        Ok(WsMessage::Frame(_)) => {}
                        Err(e) => {
                            error!(?e, "WebSocket error");
                            return Err(SyncError::from(e));
                        }
                    }
                }

                _ = ping_interval.tick() => {
                    write.send(WsMessage::Ping(vec![].into())).await?;
                    debug!("Sent ping");
                }

                _ = self.cancel.cancelled() => {
                    info!("Shutdown signal received, closing connection");
                    let _ = write.send(WsMessage::Close(None)).await;
                    return Ok(());
                }
            }
        }
    }

    fn create_backoff(&self) -> ExponentialBackoff {
        ExponentialBackoff {
            initial_interval: self.config.initial_backoff,
            max_interval: self.config.max_backoff,
            multiplier: 2.0,
            max_elapsed_time: None,
            ..Default::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_connection_state_display() {
        assert_eq!(ConnectionState::Connected.to_string(), "connected");
        assert_eq!(ConnectionState::Backoff.to_string(), "backoff");
    }

    #[test]
    fn test_transport_config_default() {
        let config = TransportConfig::default();
        assert_eq!(config.connect_timeout, Duration::from_secs(10));
        assert_eq!(config.max_retries, 0);
    }

    #[test]
    fn test_connect_url_appends_api_key() {
        let config = TransportConfig {
            url: "wss://feed.example.com/realtime".to_string(),
            api_key: Some("pk-123".to_string()),
            ..Default::default()
        };
        assert_eq!(
            config.connect_url().unwrap().as_str(),
            "wss://feed.example.com/realtime?apikey=pk-123"
        );
    }

    #[test]
    fn test_connect_url_rejects_garbage() {
        let config = TransportConfig {
            url: "not a url".to_string(),
            ..Default::default()
        };
        assert!(config.connect_url().is_err());
    }

    #[tokio::test]
    async fn test_shutdown_stops_unreachable_transport() {
        let config = TransportConfig {
            url: "ws://127.0.0.1:1/realtime".to_string(),
            connect_timeout: Duration::from_millis(200),
            initial_backoff: Duration::from_millis(10),
            max_backoff: Duration::from_millis(20),
            ..Default::default()
        };
        let cancel = CancellationToken::new();
        let (handle, mut events) = Transport::spawn(config, cancel);
        handle.shutdown();

        // The event sender is dropped once the task exits.
        let closed = tokio::time::timeout(Duration::from_secs(5), async {
            while events.recv().await.is_some() {}
        })
        .await;
        assert!(closed.is_ok());
        assert_eq!(handle.state(), ConnectionState::Disconnected);
    }

    #[tokio::test]
    async fn test_send_while_offline_never_waits() {
        let config = TransportConfig {
            url: "ws://127.0.0.1:9/realtime".to_string(),
            connect_timeout: Duration::from_millis(200),
            initial_backoff: Duration::from_secs(60),
            max_backoff: Duration::from_secs(60),
            ..Default::default()
        };
        let cancel = CancellationToken::new();
        let (handle, _events) = Transport::spawn(config, cancel.clone());

        // Well past the queue capacity.
        for _ in 0..250 {
            let result = handle.send(FeedMessage::unsubscribe("realtime:medicines:*:1"));
            assert!(matches!(result, Err(SyncError::Disconnected)));
        }
        assert!(!handle.is_connected());
        cancel.cancel();
    }
}

//! Upstox Market Data Feed Client
//!
//! Keeps at most one authenticated WebSocket session to the Upstox feed and
//! forwards subscribe commands onto it.
//!
//! # State Machine
//!
//! ```text
//! Disconnected ──connect()──► Connecting ──open──► Open
//!      ▲                          │                 │
//!      └────── close / error ─────┴─────────────────┘
//!                 (one reconnect timer scheduled)
//! ```
//!
//! `connect()` is the only way a session starts and it refuses while a
//! session is Connecting or Open. Every session carries a generation number;
//! events from a session whose generation is no longer current are ignored,
//! so a late close from a torn-down socket cannot schedule a second timer.
//!
//! # Protocol
//!
//! The access token is passed as the `access_token` query parameter.
//! Inbound frames are opaque: text and binary payloads are wrapped as relay
//! envelopes and handed to the event channel in arrival order.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::{mpsc, watch};
use tokio::task::AbortHandle;
use tokio_tungstenite::tungstenite::Message;
use tokio_util::sync::CancellationToken;
use url::Url;

use super::reconnect::{ReconnectConfig, ReconnectPolicy};
use crate::application::ports::{AccessTokenSource, SubscriptionForwarder, UndeliverableCommand};
use crate::domain::streaming::RelayEnvelope;
use crate::domain::subscription::{SubscriptionRequest, SymbolSet};
use crate::infrastructure::metrics;

// =============================================================================
// Error Type
// =============================================================================

/// Why an upstream session ended.
#[derive(Debug, thiserror::Error)]
pub enum UpstreamConnectionError {
    /// The configured feed URL does not parse.
    #[error("invalid feed URL: {0}")]
    InvalidUrl(String),

    /// Handshake or transport failure.
    #[error("WebSocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),

    /// Upstream sent a close frame.
    #[error("upstream closed the connection (code {code:?})")]
    Closed {
        /// Close code, when one was sent.
        code: Option<u16>,
    },

    /// The WebSocket upgrade did not finish in time.
    #[error("upstream handshake timed out after {0:?}")]
    HandshakeTimeout(Duration),

    /// The stream ended without a close frame.
    #[error("upstream stream ended")]
    StreamEnded,
}

// =============================================================================
// Connection State and Events
// =============================================================================

/// Connection state of the upstream session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionState {
    /// No session.
    Disconnected,
    /// Handshake in progress.
    Connecting,
    /// Session open; subscribe commands are accepted.
    Open,
    /// Session is being shut down.
    Closing,
}

impl ConnectionState {
    /// Lowercase name for logs and health output.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Disconnected => "disconnected",
            Self::Connecting => "connecting",
            Self::Open => "open",
            Self::Closing => "closing",
        }
    }
}

/// Events emitted by the feed client.
#[derive(Debug, Clone)]
pub enum UpstreamEvent {
    /// Session opened.
    Connected,
    /// Session ended.
    Disconnected {
        /// Human readable cause.
        reason: String,
    },
    /// A reconnect timer was scheduled.
    Reconnecting {
        /// Attempt number since the last open.
        attempt: u32,
        /// Delay before the attempt.
        delay: Duration,
    },
    /// An upstream payload, wrapped for relay.
    Message(RelayEnvelope),
}

/// Outcome of a `connect()` call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectAttempt {
    /// A new session is being opened.
    Started,
    /// A session is already Connecting or Open.
    AlreadyActive,
    /// No valid access token yet.
    NoCredential,
    /// The process is shutting down.
    ShuttingDown,
}

// =============================================================================
// Configuration
// =============================================================================

/// Configuration for the feed client.
#[derive(Debug, Clone)]
pub struct FeedClientConfig {
    /// Feed WebSocket URL (without the token).
    pub url: String,
    /// Reconnect schedule.
    pub reconnect: ReconnectConfig,
    /// Re-send forwarded subscriptions after a reconnect.
    pub restore_subscriptions: bool,
    /// Upper bound on the TCP, TLS and WebSocket upgrade.
    pub handshake_timeout: Duration,
}

impl FeedClientConfig {
    /// Create a configuration with the default fixed 5s reconnect.
    #[must_use]
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            reconnect: ReconnectConfig::default(),
            restore_subscriptions: true,
            handshake_timeout: Duration::from_secs(10),
        }
    }
}

// =============================================================================
// Feed Client
// =============================================================================

struct SessionSlot {
    state: ConnectionState,
    generation: u64,
    outbound: Option<mpsc::UnboundedSender<Message>>,
    session_cancel: Option<CancellationToken>,
    reconnect_timer: Option<AbortHandle>,
    policy: ReconnectPolicy,
    forwarded: SymbolSet,
}

/// Owner of the single upstream session.
pub struct UpstreamFeed {
    base_url: Url,
    restore_subscriptions: bool,
    handshake_timeout: Duration,
    tokens: Arc<dyn AccessTokenSource>,
    event_tx: mpsc::Sender<UpstreamEvent>,
    cancel: CancellationToken,
    slot: Mutex<SessionSlot>,
    messages_received: AtomicU64,
    reconnects: AtomicU64,
}

impl UpstreamFeed {
    /// Create a feed client in the Disconnected state.
    ///
    /// # Errors
    ///
    /// Returns `UpstreamConnectionError::InvalidUrl` if the feed URL does
    /// not parse.
    pub fn new(
        config: FeedClientConfig,
        tokens: Arc<dyn AccessTokenSource>,
        event_tx: mpsc::Sender<UpstreamEvent>,
        cancel: CancellationToken,
    ) -> Result<Self, UpstreamConnectionError> {
        let base_url = Url::parse(&config.url)
            .map_err(|e| UpstreamConnectionError::InvalidUrl(format!("{}: {e}", config.url)))?;

        Ok(Self {
            base_url,
            restore_subscriptions: config.restore_subscriptions,
            handshake_timeout: config.handshake_timeout,
            tokens,
            event_tx,
            cancel,
            slot: Mutex::new(SessionSlot {
                state: ConnectionState::Disconnected,
                generation: 0,
                outbound: None,
                session_cancel: None,
                reconnect_timer: None,
                policy: ReconnectPolicy::new(config.reconnect),
                forwarded: SymbolSet::default(),
            }),
            messages_received: AtomicU64::new(0),
            reconnects: AtomicU64::new(0),
        })
    }

    /// Start a session unless one is already Connecting or Open.
    pub fn connect(self: &Arc<Self>) -> ConnectAttempt {
        if self.cancel.is_cancelled() {
            return ConnectAttempt::ShuttingDown;
        }

        let mut slot = self.slot.lock();
        if slot.state != ConnectionState::Disconnected {
            tracing::debug!(state = slot.state.as_str(), "Upstream connect ignored");
            return ConnectAttempt::AlreadyActive;
        }

        let Some(token) = self.tokens.current_access_token() else {
            tracing::info!("No valid access token; upstream connect deferred");
            return ConnectAttempt::NoCredential;
        };

        if let Some(timer) = slot.reconnect_timer.take() {
            timer.abort();
        }

        slot.generation += 1;
        let generation = slot.generation;
        let session_cancel = self.cancel.child_token();
        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
        slot.state = ConnectionState::Connecting;
        slot.session_cancel = Some(session_cancel.clone());
        slot.outbound = Some(outbound_tx);
        drop(slot);

        let mut url = self.base_url.clone();
        url.query_pairs_mut().append_pair("access_token", &token);

        tracing::info!(url = %self.base_url, generation, "Connecting to upstream feed");
        tokio::spawn(Arc::clone(self).run_session(generation, url, outbound_rx, session_cancel));
        ConnectAttempt::Started
    }

    /// Tear down the current session and reconnect with the current token.
    pub fn restart(self: &Arc<Self>) -> ConnectAttempt {
        {
            let mut slot = self.slot.lock();
            if let Some(timer) = slot.reconnect_timer.take() {
                timer.abort();
            }
            if slot.state != ConnectionState::Disconnected {
                slot.generation += 1;
                self.mark_disconnected(&mut slot);
            }
        }
        tracing::info!("Reopening upstream session with rotated credential");
        self.connect()
    }

    /// Close the session and cancel any pending reconnect.
    pub fn shutdown(&self) {
        let mut slot = self.slot.lock();
        if let Some(timer) = slot.reconnect_timer.take() {
            timer.abort();
        }
        if let Some(cancel) = slot.session_cancel.take() {
            slot.state = ConnectionState::Closing;
            cancel.cancel();
        }
    }

    /// Reconnect whenever the credential manager announces a rotation.
    pub async fn follow_rotations(self: Arc<Self>, mut rotations: watch::Receiver<u64>) {
        loop {
            tokio::select! {
                () = self.cancel.cancelled() => return,
                changed = rotations.changed() => {
                    if changed.is_err() {
                        return;
                    }
                    let rotation = *rotations.borrow();
                    tracing::debug!(rotation, "Credential rotation received");
                    let _ = self.restart();
                }
            }
        }
    }

    // =========================================================================
    // Session Task
    // =========================================================================

    #[tracing::instrument(name = "upstream_session", skip_all, fields(generation = generation))]
    async fn run_session(
        self: Arc<Self>,
        generation: u64,
        url: Url,
        outbound: mpsc::UnboundedReceiver<Message>,
        cancel: CancellationToken,
    ) {
        match self.drive_session(generation, url, outbound, &cancel).await {
            Ok(()) => self.on_session_stopped(generation).await,
            Err(e) => self.on_session_failed(generation, &e).await,
        }
    }

    async fn drive_session(
        &self,
        generation: u64,
        url: Url,
        mut outbound: mpsc::UnboundedReceiver<Message>,
        cancel: &CancellationToken,
    ) -> Result<(), UpstreamConnectionError> {
        let handshake = tokio::time::timeout(
            self.handshake_timeout,
            tokio_tungstenite::connect_async(url.as_str()),
        );
        let (ws_stream, _response) = tokio::select! {
            () = cancel.cancelled() => return Ok(()),
            result = handshake => result
                .map_err(|_| UpstreamConnectionError::HandshakeTimeout(self.handshake_timeout))??,
        };
        let (mut write, mut read) = ws_stream.split();

        if !self.on_open(generation).await {
            let _ = write.send(Message::Close(None)).await;
            return Ok(());
        }

        loop {
            tokio::select! {
                () = cancel.cancelled() => {
                    let _ = write.send(Message::Close(None)).await;
                    return Ok(());
                }
                Some(message) = outbound.recv() => {
                    write.send(message).await?;
                }
                frame = read.next() => match frame {
                    Some(Ok(Message::Text(text))) => {
                        self.relay(generation, RelayEnvelope::from_upstream_text(&text)).await;
                    }
                    Some(Ok(Message::Binary(bytes))) => {
                        self.relay(generation, RelayEnvelope::from_upstream_bytes(&bytes)).await;
                    }
                    Some(Ok(Message::Ping(data))) => {
                        write.send(Message::Pong(data)).await?;
                    }
                    Some(Ok(Message::Close(frame))) => {
                        return Err(UpstreamConnectionError::Closed {
                            code: frame.map(|f| u16::from(f.code)),
                        });
                    }
                    Some(Ok(_)) => {}
                    Some(Err(e)) => return Err(e.into()),
                    None => return Err(UpstreamConnectionError::StreamEnded),
                }
            }
        }
    }

    async fn relay(&self, generation: u64, envelope: RelayEnvelope) {
        if self.slot.lock().generation != generation {
            return;
        }
        self.messages_received.fetch_add(1, Ordering::Relaxed);
        metrics::record_message_received();
        if self
            .event_tx
            .send(UpstreamEvent::Message(envelope))
            .await
            .is_err()
        {
            tracing::debug!("Upstream event receiver dropped");
        }
    }

    // =========================================================================
    // Transitions
    // =========================================================================

    async fn on_open(&self, generation: u64) -> bool {
        let restored = {
            let mut slot = self.slot.lock();
            if slot.generation != generation || slot.state != ConnectionState::Connecting {
                return false;
            }
            slot.state = ConnectionState::Open;
            slot.policy.reset();
            self.restore_forwarded(&slot)
        };

        metrics::set_upstream_connected(true);
        tracing::info!(generation, restored, "Upstream feed connected");
        let _ = self.event_tx.send(UpstreamEvent::Connected).await;
        true
    }

    /// Queue one subscribe command covering every forwarded symbol.
    fn restore_forwarded(&self, slot: &SessionSlot) -> usize {
        if !self.restore_subscriptions {
            return 0;
        }
        let (Some(request), Some(outbound)) =
            (slot.forwarded.to_subscribe_request(), slot.outbound.as_ref())
        else {
            return 0;
        };
        match encode_command(&request) {
            Ok(payload) => {
                if outbound.send(Message::Text(payload.into())).is_ok() {
                    request.len()
                } else {
                    0
                }
            }
            Err(e) => {
                tracing::warn!(error = %e, "Failed to encode subscription restore");
                0
            }
        }
    }

    async fn on_session_failed(self: &Arc<Self>, generation: u64, error: &UpstreamConnectionError) {
        let scheduled = {
            let mut slot = self.slot.lock();
            if slot.generation != generation || slot.state == ConnectionState::Disconnected {
                tracing::debug!(generation, error = %error, "Ignoring end of stale upstream session");
                return;
            }
            self.mark_disconnected(&mut slot);
            self.schedule_reconnect(&mut slot)
        };

        tracing::warn!(error = %error, "Upstream feed disconnected");
        let _ = self
            .event_tx
            .send(UpstreamEvent::Disconnected {
                reason: error.to_string(),
            })
            .await;
        if let Some((attempt, delay)) = scheduled {
            let _ = self
                .event_tx
                .send(UpstreamEvent::Reconnecting { attempt, delay })
                .await;
        }
    }

    async fn on_session_stopped(&self, generation: u64) {
        {
            let mut slot = self.slot.lock();
            if slot.generation != generation || slot.state == ConnectionState::Disconnected {
                return;
            }
            self.mark_disconnected(&mut slot);
        }
        tracing::info!(generation, "Upstream session closed");
        let _ = self
            .event_tx
            .send(UpstreamEvent::Disconnected {
                reason: "closed".to_string(),
            })
            .await;
    }

    fn mark_disconnected(&self, slot: &mut SessionSlot) {
        slot.state = ConnectionState::Disconnected;
        slot.outbound = None;
        if let Some(cancel) = slot.session_cancel.take() {
            cancel.cancel();
        }
        if !self.restore_subscriptions {
            slot.forwarded = SymbolSet::default();
        }
        metrics::set_upstream_connected(false);
    }

    /// Replace any pending timer with a single new one.
    fn schedule_reconnect(self: &Arc<Self>, slot: &mut SessionSlot) -> Option<(u32, Duration)> {
        if let Some(timer) = slot.reconnect_timer.take() {
            timer.abort();
        }
        if self.cancel.is_cancelled() {
            return None;
        }
        let Some(delay) = slot.policy.next_delay() else {
            tracing::error!(
                attempts = slot.policy.attempt_count(),
                "Upstream reconnect attempts exhausted"
            );
            return None;
        };
        let attempt = slot.policy.attempt_count();
        let generation = slot.generation;

        let feed = Arc::downgrade(self);
        let cancel = self.cancel.clone();
        let timer = tokio::spawn(async move {
            tokio::select! {
                () = cancel.cancelled() => {}
                () = tokio::time::sleep(delay) => {
                    if let Some(feed) = feed.upgrade() {
                        feed.on_reconnect_timer(generation);
                    }
                }
            }
        });
        slot.reconnect_timer = Some(timer.abort_handle());

        self.reconnects.fetch_add(1, Ordering::Relaxed);
        metrics::record_reconnect();
        tracing::info!(attempt, delay_ms = delay.as_millis(), "Upstream reconnect scheduled");
        Some((attempt, delay))
    }

    fn on_reconnect_timer(self: &Arc<Self>, generation: u64) {
        {
            let mut slot = self.slot.lock();
            if slot.generation != generation {
                return;
            }
            slot.reconnect_timer = None;
        }
        let _ = self.connect();
    }

    // =========================================================================
    // Accessors
    // =========================================================================

    /// Current connection state.
    #[must_use]
    pub fn state(&self) -> ConnectionState {
        self.slot.lock().state
    }

    /// True when the session is Open.
    #[must_use]
    pub fn is_open(&self) -> bool {
        self.state() == ConnectionState::Open
    }

    /// True while a reconnect timer is armed.
    #[must_use]
    pub fn has_pending_reconnect(&self) -> bool {
        self.slot.lock().reconnect_timer.is_some()
    }

    /// Symbols that will be restored after a reconnect.
    #[must_use]
    pub fn tracked_symbols(&self) -> usize {
        self.slot.lock().forwarded.len()
    }

    /// Upstream messages relayed since startup.
    #[must_use]
    pub fn messages_received(&self) -> u64 {
        self.messages_received.load(Ordering::Relaxed)
    }

    /// Reconnects scheduled since startup.
    #[must_use]
    pub fn reconnect_count(&self) -> u64 {
        self.reconnects.load(Ordering::Relaxed)
    }
}

impl SubscriptionForwarder for UpstreamFeed {
    fn forward_subscription(
        &self,
        request: &SubscriptionRequest,
    ) -> Result<(), UndeliverableCommand> {
        let mut slot = self.slot.lock();
        if slot.state != ConnectionState::Open {
            return Err(UndeliverableCommand::NotConnected);
        }
        let outbound = slot
            .outbound
            .as_ref()
            .ok_or(UndeliverableCommand::NotConnected)?;

        let payload = encode_command(request).map_err(|_| UndeliverableCommand::Encoding)?;
        outbound
            .send(Message::Text(payload.into()))
            .map_err(|_| UndeliverableCommand::WriterClosed)?;

        let added = slot.forwarded.extend(request);
        tracing::debug!(symbols = request.len(), added, "Subscription forwarded upstream");
        Ok(())
    }
}

impl std::fmt::Debug for UpstreamFeed {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UpstreamFeed")
            .field("url", &self.base_url.as_str())
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}

fn encode_command(request: &SubscriptionRequest) -> Result<String, serde_json::Error> {
    serde_json::to_string(&request.to_upstream_command())
}

// =============================================================================
// Tests
// =============================================================================

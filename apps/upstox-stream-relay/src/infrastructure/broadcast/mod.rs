//! Downstream Fan-out
//!
//! Owns the set of connected subscribers and delivers relayed upstream
//! messages to each of them.
//!
//! # Architecture
//!
//! Every subscriber gets a bounded mpsc queue drained by its socket writer
//! task. `broadcast` serializes an envelope once and `try_send`s the shared
//! frame to every queue, so a slow socket never stalls the relay:
//!
//! - queue full: the frame is dropped for that subscriber only
//! - queue closed: the subscriber is unregistered on the spot
//!
//! Per-subscriber replies (acks, LTP results, pongs) go through the same
//! queue so they stay ordered with broadcast frames. A reply waits briefly
//! for space instead of being dropped.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::mpsc::{self, error::TrySendError};

use crate::application::ports::{QuoteSource, SubscriptionForwarder};
use crate::domain::streaming::{RelayEnvelope, SubscriberCommand, SubscriberReply};
use crate::infrastructure::config::BroadcastSettings;
use crate::infrastructure::metrics;

/// How long a command reply may wait for space in a subscriber queue.
pub const REPLY_TIMEOUT: Duration = Duration::from_secs(2);

/// Identifier assigned to a registered subscriber.
pub type SubscriberId = u64;

/// A registered subscriber's end of its outbound queue.
#[derive(Debug)]
pub struct SubscriberHandle {
    /// Assigned id.
    pub id: SubscriberId,
    /// Serialized frames to write to the socket.
    pub rx: mpsc::Receiver<Arc<str>>,
}

/// Result of one broadcast cycle.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BroadcastOutcome {
    /// Subscribers that accepted the frame.
    pub delivered: usize,
    /// Subscribers whose queue was full.
    pub dropped: usize,
    /// Subscribers removed because their queue was closed.
    pub removed: usize,
}

/// Snapshot of broadcaster state.
#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct BroadcastStats {
    /// Registered subscribers.
    pub subscribers: usize,
    /// Envelopes held for replay.
    pub snapshot_len: usize,
}

struct Registry {
    subscribers: HashMap<SubscriberId, mpsc::Sender<Arc<str>>>,
    history: VecDeque<Arc<str>>,
    next_id: SubscriberId,
}

/// Fan-out hub for downstream subscribers.
pub struct Broadcaster {
    settings: BroadcastSettings,
    registry: Mutex<Registry>,
    forwarder: Arc<dyn SubscriptionForwarder>,
    quotes: Arc<dyn QuoteSource>,
}

impl Broadcaster {
    /// Create an empty broadcaster.
    #[must_use]
    pub fn new(
        settings: BroadcastSettings,
        forwarder: Arc<dyn SubscriptionForwarder>,
        quotes: Arc<dyn QuoteSource>,
    ) -> Self {
        Self {
            settings,
            registry: Mutex::new(Registry {
                subscribers: HashMap::new(),
                history: VecDeque::with_capacity(settings.snapshot_depth),
                next_id: 1,
            }),
            forwarder,
            quotes,
        }
    }

    // =========================================================================
    // Membership
    // =========================================================================

    /// Add a subscriber, replaying the snapshot when one is kept.
    #[must_use]
    pub fn register(&self) -> SubscriberHandle {
        let (tx, rx) = mpsc::channel(self.settings.subscriber_buffer.max(1));

        let mut registry = self.registry.lock();
        let id = registry.next_id;
        registry.next_id += 1;

        let mut replayed = 0_usize;
        for frame in &registry.history {
            if tx.try_send(Arc::clone(frame)).is_err() {
                break;
            }
            replayed += 1;
        }
        registry.subscribers.insert(id, tx);
        let count = registry.subscribers.len();
        drop(registry);

        metrics::set_subscribers(count);
        tracing::info!(subscriber = id, subscribers = count, replayed, "Subscriber registered");
        SubscriberHandle { id, rx }
    }

    /// Remove a subscriber. Unknown ids are ignored.
    pub fn unregister(&self, id: SubscriberId) {
        let mut registry = self.registry.lock();
        if registry.subscribers.remove(&id).is_none() {
            return;
        }
        let count = registry.subscribers.len();
        drop(registry);

        metrics::set_subscribers(count);
        tracing::info!(subscriber = id, subscribers = count, "Subscriber unregistered");
    }

    // =========================================================================
    // Fan-out
    // =========================================================================

    /// Deliver an envelope to every subscriber.
    ///
    /// Never blocks and never fails as a whole.
    pub fn broadcast(&self, envelope: &RelayEnvelope) -> BroadcastOutcome {
        match serde_json::to_string(envelope) {
            Ok(frame) => self.broadcast_frame(frame.into()),
            Err(e) => {
                tracing::warn!(error = %e, "Failed to serialize relay envelope");
                BroadcastOutcome::default()
            }
        }
    }

    fn broadcast_frame(&self, frame: Arc<str>) -> BroadcastOutcome {
        let mut outcome = BroadcastOutcome::default();

        let mut registry = self.registry.lock();
        registry
            .subscribers
            .retain(|id, tx| match tx.try_send(Arc::clone(&frame)) {
                Ok(()) => {
                    outcome.delivered += 1;
                    true
                }
                Err(TrySendError::Full(_)) => {
                    outcome.dropped += 1;
                    tracing::debug!(subscriber = id, "Subscriber queue full, frame dropped");
                    true
                }
                Err(TrySendError::Closed(_)) => {
                    outcome.removed += 1;
                    false
                }
            });

        let depth = self.settings.snapshot_depth;
        if depth > 0 {
            registry.history.push_back(frame);
            while registry.history.len() > depth {
                registry.history.pop_front();
            }
        }
        let count = registry.subscribers.len();
        drop(registry);

        metrics::record_messages_relayed(outcome.delivered as u64);
        if outcome.dropped > 0 {
            metrics::record_messages_dropped(outcome.dropped as u64);
        }
        if outcome.removed > 0 {
            metrics::set_subscribers(count);
            tracing::info!(removed = outcome.removed, subscribers = count, "Closed subscribers removed");
        }
        outcome
    }

    /// Send a reply to one subscriber.
    ///
    /// Unlike broadcast frames, a reply waits up to `REPLY_TIMEOUT` for
    /// queue space. Returns false if the subscriber is gone or stays full.
    pub async fn send_to(&self, id: SubscriberId, reply: &SubscriberReply) -> bool {
        let frame: Arc<str> = match serde_json::to_string(reply) {
            Ok(frame) => frame.into(),
            Err(e) => {
                tracing::warn!(subscriber = id, error = %e, "Failed to serialize reply");
                return false;
            }
        };

        let Some(tx) = self.registry.lock().subscribers.get(&id).cloned() else {
            return false;
        };
        match tokio::time::timeout(REPLY_TIMEOUT, tx.send(frame)).await {
            Ok(Ok(())) => true,
            Ok(Err(_)) => {
                self.unregister(id);
                false
            }
            Err(_) => {
                metrics::record_messages_dropped(1);
                tracing::warn!(subscriber = id, "Subscriber queue stayed full, reply dropped");
                false
            }
        }
    }

    // =========================================================================
    // Subscriber Commands
    // =========================================================================

    /// Parse and execute one subscriber frame, replying to that subscriber.
    ///
    /// Every frame gets exactly one reply; malformed input never closes the
    /// channel.
    #[tracing::instrument(name = "subscriber_command", skip_all, fields(subscriber = id))]
    pub async fn handle_subscriber_command(&self, id: SubscriberId, text: &str) {
        let reply = match SubscriberCommand::parse(text) {
            Ok(command) => {
                metrics::record_subscriber_command(command.label());
                self.execute(command).await
            }
            Err(e) => {
                metrics::record_subscriber_command("malformed");
                tracing::debug!(subscriber = id, error = %e, "Malformed subscriber frame");
                SubscriberReply::malformed(&e)
            }
        };
        self.send_to(id, &reply).await;
    }

    async fn execute(&self, command: SubscriberCommand) -> SubscriberReply {
        match command {
            SubscriberCommand::Subscribe(request) => {
                match self.forwarder.forward_subscription(&request) {
                    Ok(()) => SubscriberReply::subscribed(&request),
                    Err(e) => {
                        tracing::info!(symbols = request.len(), error = %e, "Subscription not forwarded");
                        SubscriberReply::subscribe_failed(&request, e)
                    }
                }
            }
            SubscriberCommand::Ltp { symbol } => match self.quotes.last_traded_price(&symbol).await {
                Ok(data) => SubscriberReply::ltp(symbol, data),
                Err(e) => {
                    tracing::warn!(symbol = %symbol, error = %e, "LTP query failed");
                    SubscriberReply::ltp_failed(&symbol, e)
                }
            },
            SubscriberCommand::Ping => SubscriberReply::pong(),
            SubscriberCommand::Unknown(original) => SubscriberReply::echo(original),
        }
    }

    // =========================================================================
    // Statistics
    // =========================================================================

    /// Number of registered subscribers.
    #[must_use]
    pub fn subscriber_count(&self) -> usize {
        self.registry.lock().subscribers.len()
    }

    /// Current broadcaster statistics.
    #[must_use]
    pub fn stats(&self) -> BroadcastStats {
        let registry = self.registry.lock();
        BroadcastStats {
            subscribers: registry.subscribers.len(),
            snapshot_len: registry.history.len(),
        }
    }
}

impl std::fmt::Debug for Broadcaster {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Broadcaster")
            .field("settings", &self.settings)
            .field("stats", &self.stats())
            .finish_non_exhaustive()
    }
}

// =============================================================================
// Tests
// =============================================================================

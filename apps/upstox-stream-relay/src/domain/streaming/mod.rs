//! Relay Message Types
//!
//! Wire types exchanged with downstream subscribers:
//!
//! - `RelayEnvelope`: an upstream message wrapped as `{source, data}`
//! - `SubscriberCommand`: inbound commands (`subscribe`, `ltp`, `ping`)
//! - `SubscriberReply`: per-subscriber replies (acks, failures, echoes)
//!
//! Upstream payloads are opaque. They are never interpreted beyond an attempt
//! to parse them as JSON.

use serde::Serialize;
use serde_json::Value;

use crate::domain::subscription::SubscriptionRequest;

// =============================================================================
// Relay Envelope
// =============================================================================

/// Source tag for messages originating from the upstream feed.
pub const UPSTREAM_SOURCE: &str = "upstream";

/// An upstream message as delivered to subscribers.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RelayEnvelope {
    /// Always `"upstream"`.
    pub source: &'static str,
    /// Parsed JSON payload, or the raw text when it is not JSON.
    pub data: Value,
}

impl RelayEnvelope {
    /// Wrap an upstream text payload.
    ///
    /// Unparsable payloads fall back to a JSON string holding the raw text.
    #[must_use]
    pub fn from_upstream_text(text: &str) -> Self {
        let data = serde_json::from_str::<Value>(text)
            .unwrap_or_else(|_| Value::String(text.to_string()));
        Self {
            source: UPSTREAM_SOURCE,
            data,
        }
    }

    /// Wrap an upstream binary payload.
    ///
    /// Bytes are decoded lossily as UTF-8 before the JSON attempt.
    #[must_use]
    pub fn from_upstream_bytes(bytes: &[u8]) -> Self {
        Self::from_upstream_text(&String::from_utf8_lossy(bytes))
    }
}

// =============================================================================
// Subscriber Commands
// =============================================================================

/// A command sent by a downstream subscriber.
#[derive(Debug, Clone, PartialEq)]
pub enum SubscriberCommand {
    /// Forward a subscription to the upstream feed.
    Subscribe(SubscriptionRequest),
    /// One-off last-traded-price query for a single symbol.
    Ltp {
        /// Symbol or instrument key.
        symbol: String,
    },
    /// Liveness probe.
    Ping,
    /// Any other well-formed object; echoed back verbatim.
    Unknown(Value),
}

/// Malformed subscriber input.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SubscriberProtocolError {
    /// Payload is not valid JSON.
    #[error("invalid JSON: {0}")]
    InvalidJson(String),

    /// Payload is JSON but not an object.
    #[error("expected a JSON object")]
    NotAnObject,

    /// A recognized command is missing a required field or has the wrong type.
    #[error("'{action}' requires {expected}")]
    InvalidField {
        /// The command discriminator.
        action: &'static str,
        /// Human readable description of the expected field.
        expected: &'static str,
    },
}

impl SubscriberCommand {
    /// Parse a subscriber text frame.
    ///
    /// The discriminator is read from `action`, falling back to `type`.
    ///
    /// # Errors
    ///
    /// Returns `SubscriberProtocolError` when the frame is not a JSON object
    /// or a recognized command has invalid fields.
    pub fn parse(text: &str) -> Result<Self, SubscriberProtocolError> {
        let value: Value = serde_json::from_str(text)
            .map_err(|e| SubscriberProtocolError::InvalidJson(e.to_string()))?;

        let Some(object) = value.as_object() else {
            return Err(SubscriberProtocolError::NotAnObject);
        };

        let discriminator = object
            .get("action")
            .and_then(Value::as_str)
            .or_else(|| object.get("type").and_then(Value::as_str));

        match discriminator {
            Some("subscribe") => {
                let symbols = object
                    .get("symbols")
                    .and_then(Value::as_array)
                    .and_then(|items| items.iter().map(Value::as_str).collect::<Option<Vec<_>>>())
                    .ok_or(SubscriberProtocolError::InvalidField {
                        action: "subscribe",
                        expected: "'symbols' as an array of strings",
                    })?;
                Ok(Self::Subscribe(SubscriptionRequest::new(symbols)))
            }
            Some("ltp") => {
                let symbol = object
                    .get("symbol")
                    .and_then(Value::as_str)
                    .map(str::trim)
                    .filter(|s| !s.is_empty())
                    .ok_or(SubscriberProtocolError::InvalidField {
                        action: "ltp",
                        expected: "a non-empty 'symbol' string",
                    })?;
                Ok(Self::Ltp {
                    symbol: symbol.to_string(),
                })
            }
            Some("ping") => Ok(Self::Ping),
            _ => Ok(Self::Unknown(value)),
        }
    }

    /// Short label for metrics and logs.
    #[must_use]
    pub const fn label(&self) -> &'static str {
        match self {
            Self::Subscribe(_) => "subscribe",
            Self::Ltp { .. } => "ltp",
            Self::Ping => "ping",
            Self::Unknown(_) => "unknown",
        }
    }
}

// =============================================================================
// Subscriber Replies
// =============================================================================

/// Replies addressed to a single subscriber.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum SubscriberReply {
    /// Typed acknowledgement or failure.
    Typed(TypedReply),
    /// Unrecognized command echoed back.
    Echo {
        /// The original command object.
        echo: Value,
    },
    /// Malformed input.
    Error {
        /// Error category.
        error: &'static str,
        /// Parser detail.
        detail: String,
    },
}

/// Replies carrying a `type` tag.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TypedReply {
    /// Subscription forwarded upstream.
    Subscribed {
        /// Symbols forwarded.
        symbols: Vec<String>,
    },
    /// LTP query result, relayed verbatim.
    Ltp {
        /// Queried symbol.
        symbol: String,
        /// Raw upstream response.
        data: Value,
    },
    /// Reply to `ping`.
    Pong {
        /// Server time in epoch milliseconds.
        ts: i64,
    },
    /// A recognized command that could not be completed.
    Error {
        /// The command that failed.
        action: &'static str,
        /// Why it failed.
        error: String,
        /// Symbols involved, when relevant.
        #[serde(skip_serializing_if = "Vec::is_empty")]
        symbols: Vec<String>,
    },
}

impl SubscriberReply {
    /// Acknowledge a forwarded subscription.
    #[must_use]
    pub fn subscribed(request: &SubscriptionRequest) -> Self {
        Self::Typed(TypedReply::Subscribed {
            symbols: request.to_vec(),
        })
    }

    /// Report a subscription that could not be delivered.
    #[must_use]
    pub fn subscribe_failed(request: &SubscriptionRequest, error: impl ToString) -> Self {
        Self::Typed(TypedReply::Error {
            action: "subscribe",
            error: error.to_string(),
            symbols: request.to_vec(),
        })
    }

    /// Relay an LTP response.
    #[must_use]
    pub const fn ltp(symbol: String, data: Value) -> Self {
        Self::Typed(TypedReply::Ltp { symbol, data })
    }

    /// Report a failed LTP query.
    #[must_use]
    pub fn ltp_failed(symbol: &str, error: impl ToString) -> Self {
        Self::Typed(TypedReply::Error {
            action: "ltp",
            error: error.to_string(),
            symbols: vec![symbol.to_string()],
        })
    }

    /// Answer a ping.
    #[must_use]
    pub fn pong() -> Self {
        Self::Typed(TypedReply::Pong {
            ts: chrono::Utc::now().timestamp_millis(),
        })
    }

    /// Echo an unrecognized command.
    #[must_use]
    pub const fn echo(original: Value) -> Self {
        Self::Echo { echo: original }
    }

    /// Report malformed input.
    #[must_use]
    pub fn malformed(error: &SubscriberProtocolError) -> Self {
        Self::Error {
            error: "invalid message",
            detail: error.to_string(),
        }
    }
}

//! Upstox Adapters
//!
//! - `auth`: OAuth token endpoint (refresh and authorization-code grants)
//! - `feed`: market data WebSocket session and its state machine
//! - `quote`: REST last-traded-price lookups
//! - `reconnect`: delay schedule used by the feed

pub mod auth;
pub mod feed;
pub mod quote;
pub mod reconnect;

pub use auth::UpstoxAuthClient;
pub use feed::{
    ConnectAttempt, ConnectionState, FeedClientConfig, UpstreamConnectionError, UpstreamEvent,
    UpstreamFeed,
};
pub use quote::{UpstoxQuoteClient, instrument_key};
pub use reconnect::{ReconnectConfig, ReconnectPolicy};

#![cfg_attr(
    test,
    allow(
        clippy::unwrap_used,
        clippy::expect_used,
        clippy::float_cmp,
        clippy::significant_drop_tightening,
        clippy::too_many_lines,
        clippy::match_same_arms,
        clippy::needless_pass_by_value,
        clippy::option_if_let_else,
        clippy::default_trait_access,
        clippy::items_after_statements
    )
)]

//! Upstox Stream Relay - Market Data Fan-out
//!
//! Keeps a single authenticated WebSocket session to the Upstox market data
//! feed and relays every upstream message to many downstream WebSocket
//! subscribers, while keeping the OAuth credential fresh.
//!
//! # Layers (inside → outside)
//!
//! - **Domain**: Core types with no I/O
//!   - `credential`: access/refresh token with absolute expiry
//!   - `subscription`: symbol sets and restore tracking
//!   - `streaming`: relay envelopes, subscriber commands and replies
//!
//! - **Application**: Use cases and port definitions
//!   - `ports`: credential store, token exchange, quotes, forwarding
//!   - `services`: credential lifecycle manager
//!
//! - **Infrastructure**: Adapters and external integrations
//!   - `upstox`: OAuth client, feed session, LTP client
//!   - `store`: SQLite credential store
//!   - `broadcast`: subscriber fan-out
//!   - `http`: axum server (probes, REST, `/ws`)
//!   - `config`, `metrics`, `telemetry`
//!
//! # Data Flow
//!
//! ```text
//!                 rotations                 UpstreamEvent
//! Credential ───────────────► Upstream ─────────────────► Broadcaster ──► Subscriber 1
//! Manager                     Feed (WS)                        │      ──► Subscriber 2
//!    ▲                           ▲                             │      ──► Subscriber N
//!    │ /auth/callback            └── subscribe ◄───────────────┘
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]
#![warn(clippy::pedantic)]

// =============================================================================
// Module Declarations
// =============================================================================

/// Domain layer - Core relay types with no external dependencies.
pub mod domain;

/// Application layer - Use cases and port definitions.
pub mod application;

/// Infrastructure layer - Adapters and external integrations.
pub mod infrastructure;

// =============================================================================
// Re-exports
// =============================================================================

// Domain types
pub use domain::credential::{Credential, TokenResponse};
pub use domain::streaming::{RelayEnvelope, SubscriberCommand, SubscriberReply};
pub use domain::subscription::{SubscriptionRequest, Symbol};

// Application
pub use application::ports::{
    AccessTokenSource, CredentialStore, QuoteSource, SubscriptionForwarder, TokenExchange,
    UndeliverableCommand,
};
pub use application::services::{
    CredentialManager, CredentialSettings, CredentialStatus, RefreshError,
};

// Infrastructure config
pub use infrastructure::config::{
    BroadcastSettings, ClientCredentials, ConfigError, ReconnectSettings, RelayConfig,
    ServerSettings, UpstoxSettings,
};

// Upstox adapters
pub use infrastructure::upstox::{
    ConnectAttempt, ConnectionState, FeedClientConfig, UpstoxAuthClient, UpstoxQuoteClient,
    UpstreamConnectionError, UpstreamEvent, UpstreamFeed,
};

// Fan-out and HTTP
pub use infrastructure::broadcast::{BroadcastOutcome, Broadcaster, SubscriberHandle};
pub use infrastructure::http::{AppState, HttpServer, HttpServerError};

// Store
pub use infrastructure::store::{MemoryCredentialStore, SqliteCredentialStore};

// Metrics
pub use infrastructure::metrics::init_metrics;

// Telemetry
pub use infrastructure::telemetry::{TelemetryConfig, TelemetryGuard, init as init_telemetry};

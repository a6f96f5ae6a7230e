//! Port Interfaces
//!
//! Defines the interfaces (ports) for external systems following
//! the Hexagonal Architecture pattern. These are the contracts that
//! infrastructure adapters must implement.
//!
//! ## Driven Ports (Outbound)
//!
//! - `CredentialStore`: durable holder of the current credential
//! - `TokenExchange`: the Upstox auth endpoint (refresh and code grants)
//! - `QuoteSource`: the Upstox REST last-traded-price endpoint
//!
//! ## Internal Seams
//!
//! - `AccessTokenSource`: read side of the credential manager
//! - `SubscriptionForwarder`: command side of the upstream connection

use async_trait::async_trait;
use serde_json::Value;

use crate::domain::credential::{Credential, TokenResponse};
use crate::domain::subscription::SubscriptionRequest;

// =============================================================================
// Credential Store
// =============================================================================

/// Errors raised by a credential store.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// The backing database could not be opened or migrated.
    #[error("credential store unavailable: {0}")]
    Unavailable(String),

    /// A read or write failed.
    #[error("credential store query failed: {0}")]
    Query(String),

    /// A stored row could not be decoded.
    #[error("corrupt credential row: {0}")]
    Corrupt(String),
}

/// Durable storage for the current credential.
#[async_trait]
pub trait CredentialStore: Send + Sync {
    /// Load the stored credential, if any.
    async fn load(&self) -> Result<Option<Credential>, StoreError>;

    /// Replace the stored credential.
    async fn save(&self, credential: &Credential) -> Result<(), StoreError>;
}

// =============================================================================
// Token Exchange
// =============================================================================

/// Failure talking to the auth endpoint.
#[derive(Debug, thiserror::Error)]
pub enum AuthExchangeError {
    /// Request never produced a response.
    #[error("network error: {0}")]
    Network(String),

    /// Endpoint answered with a non-success status.
    #[error("auth endpoint returned {status}: {body}")]
    Rejected {
        /// HTTP status code.
        status: u16,
        /// Response body, for logs.
        body: String,
    },

    /// Endpoint answered 2xx without a usable token payload.
    #[error("invalid token response: {0}")]
    InvalidResponse(String),
}

/// Exchanges grants for access tokens.
#[async_trait]
pub trait TokenExchange: Send + Sync {
    /// Exchange a refresh token for a new token pair.
    async fn exchange_refresh_token(
        &self,
        refresh_token: &str,
    ) -> Result<TokenResponse, AuthExchangeError>;

    /// Exchange a one-time authorization code for the first token pair.
    async fn exchange_authorization_code(
        &self,
        code: &str,
    ) -> Result<TokenResponse, AuthExchangeError>;
}

// =============================================================================
// Quote Source
// =============================================================================

/// Failure answering an LTP query.
#[derive(Debug, thiserror::Error)]
pub enum QuoteError {
    /// No usable access token yet.
    #[error("not authenticated")]
    NotAuthenticated,

    /// Network failure.
    #[error("network error: {0}")]
    Network(String),

    /// Upstream returned a body that is not JSON.
    #[error("invalid quote response: {0}")]
    InvalidResponse(String),
}

/// Direct authenticated quote lookups.
#[async_trait]
pub trait QuoteSource: Send + Sync {
    /// Fetch the raw last-traded-price response for a symbol.
    async fn last_traded_price(&self, symbol: &str) -> Result<Value, QuoteError>;
}

// =============================================================================
// Internal Seams
// =============================================================================

/// Read access to the current access token.
pub trait AccessTokenSource: Send + Sync {
    /// The current access token, or `None` when not ready.
    fn current_access_token(&self) -> Option<String>;
}

/// A subscription that could not be delivered upstream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum UndeliverableCommand {
    /// Upstream session is not open.
    #[error("not connected")]
    NotConnected,

    /// Session is open but its writer has gone away.
    #[error("upstream writer closed")]
    WriterClosed,

    /// The command could not be serialized.
    #[error("subscribe command could not be encoded")]
    Encoding,
}

/// Forwards subscribe commands to the live upstream session.
pub trait SubscriptionForwarder: Send + Sync {
    /// Send a subscribe command now, or report why it cannot be delivered.
    ///
    /// # Errors
    ///
    /// Returns `UndeliverableCommand` when the upstream session is not open.
    /// Requests are never queued.
    fn forward_subscription(&self, request: &SubscriptionRequest)
    -> Result<(), UndeliverableCommand>;
}

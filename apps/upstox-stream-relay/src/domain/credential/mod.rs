//! Credential Types
//!
//! The access/refresh token pair used to authenticate against the Upstox
//! feed, REST, and auth endpoints.
//!
//! A `Credential` is immutable once built: every refresh produces a new value
//! that replaces the previous one wholesale.

use serde::{Deserialize, Serialize};

// =============================================================================
// Credential
// =============================================================================

/// Access credential with absolute expiry.
///
/// `expires_at` is the epoch second after which `access_token` must not be
/// used to open new upstream connections.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Credential {
    access_token: String,
    refresh_token: Option<String>,
    expires_at: i64,
}

impl Credential {
    /// Create a new credential.
    #[must_use]
    pub fn new(
        access_token: impl Into<String>,
        refresh_token: Option<String>,
        expires_at: i64,
    ) -> Self {
        Self {
            access_token: access_token.into(),
            refresh_token: refresh_token.filter(|t| !t.is_empty()),
            expires_at,
        }
    }

    /// Build a credential from a token exchange response received at `now`.
    ///
    /// When the endpoint omits the refresh token, `previous_refresh` is carried
    /// over so the next lookahead refresh still has something to exchange.
    #[must_use]
    pub fn from_exchange(
        response: TokenResponse,
        now: i64,
        previous_refresh: Option<&str>,
    ) -> Self {
        let refresh_token = response
            .refresh_token
            .filter(|t| !t.is_empty())
            .or_else(|| previous_refresh.map(str::to_string));

        Self::new(
            response.access_token,
            refresh_token,
            now.saturating_add(response.expires_in),
        )
    }

    /// The bearer token for feed and REST calls.
    #[must_use]
    pub fn access_token(&self) -> &str {
        &self.access_token
    }

    /// The refresh token, if the provider issued one.
    #[must_use]
    pub fn refresh_token(&self) -> Option<&str> {
        self.refresh_token.as_deref()
    }

    /// Absolute expiry as epoch seconds.
    #[must_use]
    pub const fn expires_at(&self) -> i64 {
        self.expires_at
    }

    /// Seconds until expiry (negative once expired).
    #[must_use]
    pub const fn seconds_until_expiry(&self, now: i64) -> i64 {
        self.expires_at.saturating_sub(now)
    }

    /// True when fewer than `margin_secs` remain before expiry.
    #[must_use]
    pub const fn expires_within(&self, now: i64, margin_secs: i64) -> bool {
        self.seconds_until_expiry(now) < margin_secs
    }

    /// True once `expires_at` has passed.
    #[must_use]
    pub const fn is_expired(&self, now: i64) -> bool {
        now >= self.expires_at
    }
}

impl std::fmt::Debug for Credential {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Credential")
            .field("access_token", &"[REDACTED]")
            .field(
                "refresh_token",
                &self.refresh_token.as_ref().map(|_| "[REDACTED]"),
            )
            .field("expires_at", &self.expires_at)
            .finish()
    }
}

// =============================================================================
// Token Response
// =============================================================================

/// JSON body returned by the auth endpoint on a successful exchange.
#[derive(Debug, Clone, Deserialize)]
pub struct TokenResponse {
    /// New access token.
    pub access_token: String,
    /// New refresh token (optional, some grants omit it).
    #[serde(default)]
    pub refresh_token: Option<String>,
    /// Lifetime of the access token in seconds.
    pub expires_in: i64,
}

/// Current epoch time in seconds.
#[must_use]
pub fn unix_now() -> i64 {
    chrono::Utc::now().timestamp()
}

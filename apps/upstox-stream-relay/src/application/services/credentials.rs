//! Credential Lifecycle Manager
//!
//! Owns the in-memory credential and keeps it valid:
//!
//! - loads it from the store at startup, refreshing right away when it is
//!   about to expire
//! - runs a fixed-cadence lookahead check that refreshes ahead of expiry
//! - accepts a bootstrap credential from the authorization-code exchange
//!
//! Every replacement is persisted first, then swapped in, then announced on
//! a rotation channel that the upstream connection manager listens to.
//!
//! # Serialization
//!
//! Exchanges go through a single async gate. Scheduled refreshes use
//! `try_lock` and short-circuit with `RefreshError::InFlight` when another
//! exchange is running; bootstrap waits for the gate instead.

use std::sync::Arc;
use std::time::Duration;

use parking_lot::RwLock;
use tokio::sync::{Mutex, watch};
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

use crate::application::ports::{
    AccessTokenSource, AuthExchangeError, CredentialStore, StoreError, TokenExchange,
};
use crate::domain::credential::{Credential, unix_now};
use crate::infrastructure::metrics;

// =============================================================================
// Settings
// =============================================================================

/// Timing thresholds for the credential lifecycle.
#[derive(Debug, Clone, Copy)]
pub struct CredentialSettings {
    /// Refresh at startup when less than this remains.
    pub startup_refresh_margin: Duration,
    /// Scheduled check refreshes when less than this remains.
    pub lookahead_margin: Duration,
    /// Cadence of the scheduled check.
    pub check_interval: Duration,
}

impl Default for CredentialSettings {
    fn default() -> Self {
        Self {
            startup_refresh_margin: Duration::from_secs(60),
            lookahead_margin: Duration::from_secs(120),
            check_interval: Duration::from_secs(45),
        }
    }
}

/// Shortest cadence the lookahead check will run at.
pub const MIN_CHECK_INTERVAL: Duration = Duration::from_secs(1);

#[allow(clippy::cast_possible_wrap)]
const fn secs(duration: Duration) -> i64 {
    duration.as_secs() as i64
}

// =============================================================================
// Errors and Status
// =============================================================================

/// Why a refresh did not replace the credential.
#[derive(Debug, thiserror::Error)]
pub enum RefreshError {
    /// No credential has been loaded or bootstrapped yet.
    #[error("no credential available")]
    NotAuthenticated,

    /// The current credential carries no refresh token.
    #[error("credential has no refresh token")]
    MissingRefreshToken,

    /// Another exchange is already running.
    #[error("a token exchange is already in flight")]
    InFlight,

    /// The auth endpoint rejected or failed the exchange.
    #[error("token exchange failed: {0}")]
    Exchange(#[from] AuthExchangeError),

    /// The new credential could not be persisted; it was not adopted.
    #[error("failed to persist credential: {0}")]
    Persist(#[source] StoreError),
}

impl RefreshError {
    const fn outcome(&self) -> &'static str {
        match self {
            Self::NotAuthenticated => "not_authenticated",
            Self::MissingRefreshToken => "missing_refresh_token",
            Self::InFlight => "in_flight",
            Self::Exchange(_) => "exchange_failed",
            Self::Persist(_) => "persist_failed",
        }
    }
}

/// Result of `CredentialManager::initialize`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CredentialStatus {
    /// Nothing stored; waiting for bootstrap.
    Unauthenticated,
    /// Stored (or seeded) credential accepted as is.
    Ready,
    /// Stored credential was near expiry and has been refreshed.
    Refreshed,
    /// Stored credential was near expiry and the refresh failed.
    Stale,
}

// =============================================================================
// Credential Manager
// =============================================================================

/// Owns the process-wide credential.
pub struct CredentialManager {
    store: Arc<dyn CredentialStore>,
    exchange: Arc<dyn TokenExchange>,
    settings: CredentialSettings,
    seed: Option<Credential>,
    current: RwLock<Option<Credential>>,
    exchange_gate: Mutex<()>,
    rotations: watch::Sender<u64>,
}

impl CredentialManager {
    /// Create a manager with no credential loaded.
    #[must_use]
    pub fn new(
        store: Arc<dyn CredentialStore>,
        exchange: Arc<dyn TokenExchange>,
        settings: CredentialSettings,
    ) -> Self {
        Self {
            store,
            exchange,
            settings,
            seed: None,
            current: RwLock::new(None),
            exchange_gate: Mutex::new(()),
            rotations: watch::channel(0).0,
        }
    }

    /// Credential to adopt when the store is empty at startup.
    #[must_use]
    pub fn with_seed(mut self, seed: Option<Credential>) -> Self {
        self.seed = seed;
        self
    }

    /// Load the stored credential and bring it up to date.
    ///
    /// # Errors
    ///
    /// Returns `StoreError` when the store cannot be read, or when a seed
    /// credential cannot be persisted.
    pub async fn initialize(&self) -> Result<CredentialStatus, StoreError> {
        let Some(stored) = self.store.load().await? else {
            return match self.seed.clone() {
                Some(seed) => {
                    tracing::info!(
                        expires_at = seed.expires_at(),
                        "No stored credential; adopting seed token from environment"
                    );
                    self.store.save(&seed).await?;
                    *self.current.write() = Some(seed);
                    Ok(CredentialStatus::Ready)
                }
                None => {
                    tracing::warn!("No stored credential; waiting for authorization bootstrap");
                    Ok(CredentialStatus::Unauthenticated)
                }
            };
        };

        let now = unix_now();
        let near_expiry = stored.expires_within(now, secs(self.settings.startup_refresh_margin));
        tracing::info!(
            expires_in_secs = stored.seconds_until_expiry(now),
            near_expiry,
            "Loaded stored credential"
        );
        *self.current.write() = Some(stored);

        if !near_expiry {
            return Ok(CredentialStatus::Ready);
        }

        match self.refresh().await {
            Ok(_) => Ok(CredentialStatus::Refreshed),
            Err(e) => {
                tracing::warn!(error = %e, "Startup refresh failed; keeping stored credential");
                Ok(CredentialStatus::Stale)
            }
        }
    }

    /// Exchange the refresh token for a new credential.
    ///
    /// # Errors
    ///
    /// Returns `RefreshError::InFlight` without contacting the endpoint when
    /// another exchange is running. On any other error the current
    /// credential is left untouched.
    pub async fn refresh(&self) -> Result<Credential, RefreshError> {
        let Ok(_gate) = self.exchange_gate.try_lock() else {
            metrics::record_token_refresh(RefreshError::InFlight.outcome());
            return Err(RefreshError::InFlight);
        };

        let result = self.refresh_exclusive().await;
        match &result {
            Ok(_) => metrics::record_token_refresh("success"),
            Err(e) => metrics::record_token_refresh(e.outcome()),
        }
        result
    }

    #[tracing::instrument(name = "credential_refresh", skip_all)]
    async fn refresh_exclusive(&self) -> Result<Credential, RefreshError> {
        let previous = self
            .current
            .read()
            .clone()
            .ok_or(RefreshError::NotAuthenticated)?;
        let refresh_token = previous
            .refresh_token()
            .ok_or(RefreshError::MissingRefreshToken)?;

        tracing::debug!("Exchanging refresh token");
        let response = self.exchange.exchange_refresh_token(refresh_token).await?;
        let credential = Credential::from_exchange(response, unix_now(), Some(refresh_token));

        self.install(credential.clone()).await?;
        tracing::info!(
            expires_at = credential.expires_at(),
            "Access token refreshed"
        );
        Ok(credential)
    }

    /// Adopt a credential produced outside the manager.
    ///
    /// Waits for any in-flight exchange, then persists, swaps, and announces
    /// the credential exactly as a refresh would.
    ///
    /// # Errors
    ///
    /// Returns `RefreshError::Persist` when the store rejects the credential.
    pub async fn on_bootstrap(&self, credential: Credential) -> Result<(), RefreshError> {
        let _gate = self.exchange_gate.lock().await;
        self.install(credential).await?;
        tracing::info!("Bootstrap credential installed");
        Ok(())
    }

    /// Run the authorization-code exchange and install the result.
    ///
    /// # Errors
    ///
    /// Returns `RefreshError::Exchange` when the code is rejected and
    /// `RefreshError::Persist` when the store rejects the credential.
    #[tracing::instrument(name = "authorization_bootstrap", skip_all)]
    pub async fn bootstrap_with_code(&self, code: &str) -> Result<Credential, RefreshError> {
        let _gate = self.exchange_gate.lock().await;
        let response = self.exchange.exchange_authorization_code(code).await?;
        let credential = Credential::from_exchange(response, unix_now(), None);
        self.install(credential.clone()).await?;
        tracing::info!(
            expires_at = credential.expires_at(),
            "Authorization code exchanged"
        );
        Ok(credential)
    }

    /// Persist, swap, announce. Callers hold the exchange gate.
    async fn install(&self, credential: Credential) -> Result<(), RefreshError> {
        self.store
            .save(&credential)
            .await
            .map_err(RefreshError::Persist)?;
        *self.current.write() = Some(credential);
        self.rotations.send_modify(|generation| *generation += 1);
        Ok(())
    }

    /// Refresh when the lookahead margin has been reached.
    ///
    /// Returns `None` when no refresh was due.
    pub async fn check_and_refresh(&self) -> Option<Result<Credential, RefreshError>> {
        let lookahead = secs(self.settings.lookahead_margin);
        let due = self
            .current
            .read()
            .as_ref()
            .is_some_and(|c| c.expires_within(unix_now(), lookahead));
        if !due {
            return None;
        }

        let result = self.refresh().await;
        match &result {
            Ok(_) => {}
            Err(RefreshError::InFlight) => tracing::debug!("Refresh already in flight"),
            Err(e) => tracing::warn!(error = %e, "Scheduled refresh failed; will retry"),
        }
        Some(result)
    }

    /// Run the lookahead check at the configured cadence until cancelled.
    ///
    /// The first check runs one interval after start; `initialize` covers
    /// startup.
    pub async fn run_refresh_loop(self: Arc<Self>, cancel: CancellationToken) {
        let period = self.settings.check_interval.max(MIN_CHECK_INTERVAL);
        let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        tracing::info!(
            interval_secs = period.as_secs(),
            lookahead_secs = self.settings.lookahead_margin.as_secs(),
            "Credential refresh loop started"
        );

        loop {
            tokio::select! {
                () = cancel.cancelled() => {
                    tracing::info!("Credential refresh loop stopped");
                    return;
                }
                _ = ticker.tick() => {
                    let _ = self.check_and_refresh().await;
                }
            }
        }
    }

    /// Receiver that changes on every successful replacement.
    #[must_use]
    pub fn subscribe_rotations(&self) -> watch::Receiver<u64> {
        self.rotations.subscribe()
    }

    /// Snapshot of the current credential.
    #[must_use]
    pub fn credential(&self) -> Option<Credential> {
        self.current.read().clone()
    }

    /// True when a credential is loaded and not expired.
    #[must_use]
    pub fn is_ready(&self) -> bool {
        self.current_access_token().is_some()
    }
}

impl AccessTokenSource for CredentialManager {
    fn current_access_token(&self) -> Option<String> {
        self.current
            .read()
            .as_ref()
            .filter(|c| !c.is_expired(unix_now()))
            .map(|c| c.access_token().to_string())
    }
}

impl std::fmt::Debug for CredentialManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CredentialManager")
            .field("settings", &self.settings)
            .field("current", &*self.current.read())
            .finish_non_exhaustive()
    }
}

// =============================================================================
// Tests
// =============================================================================

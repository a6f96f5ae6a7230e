//! Relay Configuration Settings
//!
//! Configuration types for the relay, loaded from environment variables.

use std::time::Duration;

use crate::application::services::{CredentialSettings, MIN_CHECK_INTERVAL};
use crate::domain::credential::Credential;

/// Default Upstox OAuth token endpoint.
pub const DEFAULT_AUTH_URL: &str = "https://api.upstox.com/v2/login/authorization/token";
/// Default Upstox market data feed endpoint.
pub const DEFAULT_FEED_URL: &str = "wss://api.upstox.com/v2/feed/market-data-feed";
/// Default Upstox LTP quote endpoint.
pub const DEFAULT_QUOTE_URL: &str = "https://api.upstox.com/v2/market/quote/ltp";
/// Default exchange segment for bare symbols.
pub const DEFAULT_INSTRUMENT_PREFIX: &str = "NSE_EQ";

/// Upstox application credentials.
#[derive(Clone)]
pub struct ClientCredentials {
    client_id: String,
    client_secret: String,
    redirect_uri: String,
}

impl ClientCredentials {
    /// Create new client credentials.
    #[must_use]
    pub const fn new(client_id: String, client_secret: String, redirect_uri: String) -> Self {
        Self {
            client_id,
            client_secret,
            redirect_uri,
        }
    }

    /// The API key issued for the Upstox app.
    #[must_use]
    pub fn client_id(&self) -> &str {
        &self.client_id
    }

    /// The API secret issued for the Upstox app.
    #[must_use]
    pub fn client_secret(&self) -> &str {
        &self.client_secret
    }

    /// Redirect URI registered with the Upstox app.
    #[must_use]
    pub fn redirect_uri(&self) -> &str {
        &self.redirect_uri
    }
}

impl std::fmt::Debug for ClientCredentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClientCredentials")
            .field("client_id", &"[REDACTED]")
            .field("client_secret", &"[REDACTED]")
            .field("redirect_uri", &self.redirect_uri)
            .finish()
    }
}

/// Upstox endpoint settings.
#[derive(Debug, Clone)]
pub struct UpstoxSettings {
    /// OAuth token endpoint.
    pub auth_url: String,
    /// Market data feed WebSocket endpoint.
    pub feed_url: String,
    /// LTP REST endpoint.
    pub quote_url: String,
    /// Exchange segment prepended to bare symbols.
    pub instrument_prefix: String,
    /// Timeout applied to REST and auth calls.
    pub http_timeout: Duration,
}

impl Default for UpstoxSettings {
    fn default() -> Self {
        Self {
            auth_url: DEFAULT_AUTH_URL.to_string(),
            feed_url: DEFAULT_FEED_URL.to_string(),
            quote_url: DEFAULT_QUOTE_URL.to_string(),
            instrument_prefix: DEFAULT_INSTRUMENT_PREFIX.to_string(),
            http_timeout: Duration::from_secs(10),
        }
    }
}

/// Upstream reconnection settings.
#[derive(Debug, Clone)]
pub struct ReconnectSettings {
    /// Delay before the first reconnect.
    pub delay_initial: Duration,
    /// Upper bound on the reconnect delay.
    pub delay_max: Duration,
    /// Backoff multiplier (1.0 keeps the delay fixed).
    pub multiplier: f64,
    /// Random spread applied to each delay, as a fraction (0.1 = ±10%).
    pub jitter: f64,
    /// Attempts allowed between successful opens (0 = unlimited).
    pub max_attempts: u32,
    /// Re-send forwarded subscriptions after a reconnect.
    pub restore_subscriptions: bool,
}

impl Default for ReconnectSettings {
    fn default() -> Self {
        Self {
            delay_initial: Duration::from_secs(5),
            delay_max: Duration::from_secs(5),
            multiplier: 1.0,
            jitter: 0.0,
            max_attempts: 0,
            restore_subscriptions: true,
        }
    }
}

/// Downstream fan-out settings.
#[derive(Debug, Clone, Copy)]
pub struct BroadcastSettings {
    /// Outbound buffer per subscriber.
    pub subscriber_buffer: usize,
    /// Number of recent envelopes replayed to new subscribers.
    pub snapshot_depth: usize,
}

impl Default for BroadcastSettings {
    fn default() -> Self {
        Self {
            subscriber_buffer: 1024,
            snapshot_depth: 0,
        }
    }
}

/// HTTP server and storage settings.
#[derive(Debug, Clone)]
pub struct ServerSettings {
    /// Port for the HTTP and WebSocket server.
    pub port: u16,
    /// sqlx connection string for the credential store.
    pub database_url: String,
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            port: 5000,
            database_url: "sqlite:relay_tokens.db?mode=rwc".to_string(),
        }
    }
}

/// Access token supplied directly through the environment.
#[derive(Clone)]
pub struct SeedToken {
    /// The access token.
    pub access_token: String,
    /// Lifetime assumed for it.
    pub ttl: Duration,
}

impl SeedToken {
    /// Build the credential this seed stands for, anchored at `now`.
    #[must_use]
    #[allow(clippy::cast_possible_wrap)]
    pub fn to_credential(&self, now: i64) -> Credential {
        Credential::new(
            self.access_token.clone(),
            None,
            now.saturating_add(self.ttl.as_secs() as i64),
        )
    }
}

impl std::fmt::Debug for SeedToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SeedToken")
            .field("access_token", &"[REDACTED]")
            .field("ttl", &self.ttl)
            .finish()
    }
}

/// Complete relay configuration.
#[derive(Debug, Clone)]
pub struct RelayConfig {
    /// Upstox app credentials.
    pub client: ClientCredentials,
    /// Upstox endpoints.
    pub upstox: UpstoxSettings,
    /// HTTP server and storage.
    pub server: ServerSettings,
    /// Credential refresh timing.
    pub credentials: CredentialSettings,
    /// Upstream reconnect behaviour.
    pub reconnect: ReconnectSettings,
    /// Downstream fan-out.
    pub broadcast: BroadcastSettings,
    /// Optional access token used when the store is empty.
    pub seed_token: Option<SeedToken>,
}

impl RelayConfig {
    /// Create configuration from environment variables.
    ///
    /// # Errors
    ///
    /// Returns an error if required environment variables are missing.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Create configuration from an arbitrary key lookup.
    ///
    /// # Errors
    ///
    /// Returns an error if required keys are missing or empty.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let env = Env(&lookup);

        let client = ClientCredentials::new(
            env.required("UPSTOX_API_KEY")?,
            env.required("UPSTOX_API_SECRET")?,
            env.required("UPSTOX_REDIRECT_URI")?,
        );

        let upstox_defaults = UpstoxSettings::default();
        let upstox = UpstoxSettings {
            auth_url: env.string("UPSTOX_AUTH_URL", upstox_defaults.auth_url),
            feed_url: env.string("UPSTOX_FEED_URL", upstox_defaults.feed_url),
            quote_url: env.string("UPSTOX_QUOTE_URL", upstox_defaults.quote_url),
            instrument_prefix: env.string(
                "UPSTOX_INSTRUMENT_PREFIX",
                upstox_defaults.instrument_prefix,
            ),
            http_timeout: env.secs("RELAY_HTTP_TIMEOUT_SECS", upstox_defaults.http_timeout),
        };

        let server_defaults = ServerSettings::default();
        let server = ServerSettings {
            port: env.parse("RELAY_PORT", server_defaults.port),
            database_url: env.string("RELAY_DATABASE_URL", server_defaults.database_url),
        };

        let credential_defaults = CredentialSettings::default();
        let credentials = CredentialSettings {
            startup_refresh_margin: env.secs(
                "RELAY_STARTUP_REFRESH_MARGIN_SECS",
                credential_defaults.startup_refresh_margin,
            ),
            lookahead_margin: env.secs(
                "RELAY_REFRESH_LOOKAHEAD_SECS",
                credential_defaults.lookahead_margin,
            ),
            check_interval: env
                .secs("RELAY_REFRESH_CHECK_SECS", credential_defaults.check_interval)
                .max(MIN_CHECK_INTERVAL),
        };

        let reconnect_defaults = ReconnectSettings::default();
        let reconnect = ReconnectSettings {
            delay_initial: env.millis("RELAY_RECONNECT_DELAY_MS", reconnect_defaults.delay_initial),
            delay_max: env.millis("RELAY_RECONNECT_MAX_DELAY_MS", reconnect_defaults.delay_max),
            multiplier: env.parse("RELAY_RECONNECT_MULTIPLIER", reconnect_defaults.multiplier),
            jitter: env
                .parse("RELAY_RECONNECT_JITTER", reconnect_defaults.jitter)
                .clamp(0.0, 1.0),
            max_attempts: env.parse("RELAY_RECONNECT_MAX_ATTEMPTS", reconnect_defaults.max_attempts),
            restore_subscriptions: env.flag(
                "RELAY_RESTORE_SUBSCRIPTIONS",
                reconnect_defaults.restore_subscriptions,
            ),
        };

        let broadcast_defaults = BroadcastSettings::default();
        let broadcast = BroadcastSettings {
            subscriber_buffer: env
                .parse("RELAY_SUBSCRIBER_BUFFER", broadcast_defaults.subscriber_buffer)
                .max(1),
            snapshot_depth: env.parse("RELAY_SNAPSHOT_DEPTH", broadcast_defaults.snapshot_depth),
        };

        let seed_token = env
            .optional("UPSTOX_ACCESS_TOKEN")
            .map(|access_token| SeedToken {
                access_token,
                ttl: env.secs("UPSTOX_ACCESS_TOKEN_TTL_SECS", Duration::from_secs(86_400)),
            });

        Ok(Self {
            client,
            upstox,
            server,
            credentials,
            reconnect,
            broadcast,
            seed_token,
        })
    }
}

/// Configuration error.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// Required environment variable is missing.
    #[error("missing required environment variable: {0}")]
    MissingEnvVar(String),
    /// Environment variable has empty value.
    #[error("environment variable {0} cannot be empty")]
    EmptyValue(String),
}

struct Env<'a, F>(&'a F);

impl<F: Fn(&str) -> Option<String>> Env<'_, F> {
    fn required(&self, key: &str) -> Result<String, ConfigError> {
        let value = (self.0)(key).ok_or_else(|| ConfigError::MissingEnvVar(key.to_string()))?;
        if value.trim().is_empty() {
            return Err(ConfigError::EmptyValue(key.to_string()));
        }
        Ok(value)
    }

    fn optional(&self, key: &str) -> Option<String> {
        (self.0)(key).filter(|v| !v.trim().is_empty())
    }

    fn string(&self, key: &str, default: String) -> String {
        self.optional(key).unwrap_or(default)
    }

    fn parse<T: std::str::FromStr>(&self, key: &str, default: T) -> T {
        self.optional(key)
            .and_then(|v| v.trim().parse().ok())
            .unwrap_or(default)
    }

    fn flag(&self, key: &str, default: bool) -> bool {
        self.optional(key)
            .map_or(default, |v| !matches!(v.trim().to_lowercase().as_str(), "false" | "0" | "no"))
    }

    fn secs(&self, key: &str, default: Duration) -> Duration {
        self.optional(key)
            .and_then(|v| v.trim().parse::<u64>().ok())
            .map_or(default, Duration::from_secs)
    }

    fn millis(&self, key: &str, default: Duration) -> Duration {
        self.optional(key)
            .and_then(|v| v.trim().parse::<u64>().ok())
            .map_or(default, Duration::from_millis)
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use test_case::test_case;

    use super::*;

    fn lookup(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    const REQUIRED: [(&str, &str); 3] = [
        ("UPSTOX_API_KEY", "key123"),
        ("UPSTOX_API_SECRET", "secret456"),
        ("UPSTOX_REDIRECT_URI", "http://localhost:5000/auth/callback"),
    ];

    #[test]
    fn defaults_apply_when_only_required_keys_are_set() {
        let config = RelayConfig::from_lookup(lookup(&REQUIRED)).unwrap();

        assert_eq!(config.server.port, 5000);
        assert_eq!(config.upstox.feed_url, DEFAULT_FEED_URL);
        assert_eq!(config.upstox.instrument_prefix, "NSE_EQ");
        assert_eq!(config.credentials.check_interval, Duration::from_secs(45));
        assert_eq!(config.credentials.lookahead_margin, Duration::from_secs(120));
        assert_eq!(config.credentials.startup_refresh_margin, Duration::from_secs(60));
        assert_eq!(config.reconnect.delay_initial, Duration::from_secs(5));
        assert!((config.reconnect.multiplier - 1.0).abs() < f64::EPSILON);
        assert!(config.reconnect.restore_subscriptions);
        assert_eq!(config.broadcast.snapshot_depth, 0);
        assert!(config.seed_token.is_none());
    }

    #[test]
    fn missing_required_key_is_an_error() {
        let err = RelayConfig::from_lookup(lookup(&REQUIRED[..2])).unwrap_err();
        assert!(matches!(err, ConfigError::MissingEnvVar(k) if k == "UPSTOX_REDIRECT_URI"));
    }

    #[test]
    fn empty_required_key_is_an_error() {
        let mut pairs = REQUIRED.to_vec();
        pairs[0] = ("UPSTOX_API_KEY", "  ");
        let err = RelayConfig::from_lookup(lookup(&pairs)).unwrap_err();
        assert!(matches!(err, ConfigError::EmptyValue(k) if k == "UPSTOX_API_KEY"));
    }

    #[test]
    fn overrides_are_parsed() {
        let mut pairs = REQUIRED.to_vec();
        pairs.extend([
            ("RELAY_PORT", "8080"),
            ("RELAY_RECONNECT_DELAY_MS", "250"),
            ("RELAY_RECONNECT_MULTIPLIER", "2.0"),
            ("RELAY_RESTORE_SUBSCRIPTIONS", "false"),
            ("RELAY_SUBSCRIBER_BUFFER", "0"),
            ("UPSTOX_ACCESS_TOKEN", "env-token"),
            ("UPSTOX_ACCESS_TOKEN_TTL_SECS", "600"),
        ]);
        let config = RelayConfig::from_lookup(lookup(&pairs)).unwrap();

        assert_eq!(config.server.port, 8080);
        assert_eq!(config.reconnect.delay_initial, Duration::from_millis(250));
        assert!((config.reconnect.multiplier - 2.0).abs() < f64::EPSILON);
        assert!(!config.reconnect.restore_subscriptions);
        assert_eq!(config.broadcast.subscriber_buffer, 1);

        let seed = config.seed_token.unwrap().to_credential(1_000);
        assert_eq!(seed.access_token(), "env-token");
        assert_eq!(seed.expires_at(), 1_600);
        assert!(seed.refresh_token().is_none());
    }

    #[test]
    fn reconnect_jitter_and_attempt_cap_are_parsed() {
        let mut pairs = REQUIRED.to_vec();
        pairs.extend([
            ("RELAY_RECONNECT_JITTER", "0.2"),
            ("RELAY_RECONNECT_MAX_ATTEMPTS", "12"),
        ]);
        let config = RelayConfig::from_lookup(lookup(&pairs)).unwrap();
        assert!((config.reconnect.jitter - 0.2).abs() < f64::EPSILON);
        assert_eq!(config.reconnect.max_attempts, 12);
    }

    #[test]
    fn reconnect_jitter_is_capped_at_full_delay() {
        let mut pairs = REQUIRED.to_vec();
        pairs.push(("RELAY_RECONNECT_JITTER", "7"));
        let config = RelayConfig::from_lookup(lookup(&pairs)).unwrap();
        assert!((config.reconnect.jitter - 1.0).abs() < f64::EPSILON);
    }

    #[test_case("0" ; "zero")]
    #[test_case("1" ; "one second")]
    fn refresh_check_interval_is_at_least_one_second(value: &str) {
        let mut pairs = REQUIRED.to_vec();
        pairs.push(("RELAY_REFRESH_CHECK_SECS", value));
        let config = RelayConfig::from_lookup(lookup(&pairs)).unwrap();
        assert_eq!(config.credentials.check_interval, Duration::from_secs(1));
    }

    #[test]
    fn unparsable_values_fall_back_to_defaults() {
        let mut pairs = REQUIRED.to_vec();
        pairs.push(("RELAY_PORT", "not-a-port"));
        let config = RelayConfig::from_lookup(lookup(&pairs)).unwrap();
        assert_eq!(config.server.port, 5000);
    }

    #[test]
    fn secrets_are_redacted_in_debug() {
        let config = RelayConfig::from_lookup(lookup(&REQUIRED)).unwrap();
        let debug = format!("{config:?}");
        assert!(!debug.contains("key123"));
        assert!(!debug.contains("secret456"));
        assert!(debug.contains("[REDACTED]"));
    }
}

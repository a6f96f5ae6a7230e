//! Configuration Module
//!
//! Configuration loading for the relay service.

mod settings;

pub use settings::{
    BroadcastSettings, ClientCredentials, ConfigError, DEFAULT_AUTH_URL, DEFAULT_FEED_URL,
    DEFAULT_INSTRUMENT_PREFIX, DEFAULT_QUOTE_URL, ReconnectSettings, RelayConfig, SeedToken,
    ServerSettings, UpstoxSettings,
};

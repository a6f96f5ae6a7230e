//! Upstox Stream Relay Binary
//!
//! Starts the market data relay.
//!
//! # Usage
//!
//! ```bash
//! cargo run --bin upstox-stream-relay
//! ```
//!
//! # Environment Variables
//!
//! ## Required
//! - `UPSTOX_API_KEY`: Upstox app client id
//! - `UPSTOX_API_SECRET`: Upstox app client secret
//! - `UPSTOX_REDIRECT_URI`: OAuth redirect URI registered for the app
//!
//! ## Optional
//! - `UPSTOX_ACCESS_TOKEN`: seed token used when the store is empty
//! - `RELAY_PORT`: HTTP/WebSocket port (default: 5000)
//! - `RELAY_DATABASE_URL`: credential store (default: sqlite:relay_tokens.db?mode=rwc)
//! - `OTEL_ENABLED`: Enable OpenTelemetry (default: false)
//! - `RUST_LOG`: Log level (default: info)

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use tokio::signal;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use upstox_stream_relay::application::ports::{AccessTokenSource, QuoteSource};
use upstox_stream_relay::domain::credential::unix_now;
use upstox_stream_relay::infrastructure::telemetry;
use upstox_stream_relay::infrastructure::upstox::ReconnectConfig;
use upstox_stream_relay::{
    AppState, Broadcaster, ConnectAttempt, CredentialManager, CredentialStatus, FeedClientConfig,
    HttpServer, RelayConfig, SqliteCredentialStore, UpstoxAuthClient, UpstoxQuoteClient,
    UpstreamEvent, UpstreamFeed, init_metrics,
};

/// Graceful shutdown timeout.
const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(30);

/// Upstream event channel capacity.
const EVENT_BUFFER: usize = 4096;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Fails only when a provider is already installed.
    let _ = rustls::crypto::ring::default_provider().install_default();

    load_dotenv();

    // Initialize telemetry (OpenTelemetry + tracing)
    let telemetry_guard = telemetry::init();

    tracing::info!(
        trace_export = telemetry_guard.is_exporting(),
        "Starting Upstox Stream Relay"
    );

    if let Err(e) = init_metrics() {
        tracing::warn!(error = %e, "Prometheus recorder not installed");
    }

    let config = RelayConfig::from_env()?;
    log_config(&config);

    let shutdown_token = CancellationToken::new();

    // Credential store is the one hard startup dependency
    let store = match SqliteCredentialStore::connect(&config.server.database_url).await {
        Ok(store) => Arc::new(store),
        Err(e) => {
            tracing::error!(error = %e, "Credential store unavailable, exiting");
            return Err(e).context("failed to open credential store");
        }
    };

    // Credential lifecycle
    let auth_client = Arc::new(UpstoxAuthClient::new(&config.upstox, config.client.clone())?);
    let credentials = Arc::new(
        CredentialManager::new(store.clone(), auth_client, config.credentials)
            .with_seed(config.seed_token.as_ref().map(|s| s.to_credential(unix_now()))),
    );
    match credentials.initialize().await {
        Ok(CredentialStatus::Unauthenticated) => tracing::warn!(
            "No credential yet; complete the OAuth flow via /auth/callback"
        ),
        Ok(status) => tracing::info!(?status, "Credential loaded"),
        Err(e) => {
            tracing::error!(error = %e, "Credential store unreadable, exiting");
            return Err(e).context("failed to load credential");
        }
    }
    let tokens: Arc<dyn AccessTokenSource> = credentials.clone();

    // Upstream feed
    let (event_tx, event_rx) = mpsc::channel::<UpstreamEvent>(EVENT_BUFFER);
    let feed_config = FeedClientConfig {
        url: config.upstox.feed_url.clone(),
        reconnect: ReconnectConfig::from_settings(&config.reconnect),
        restore_subscriptions: config.reconnect.restore_subscriptions,
        handshake_timeout: config.upstox.http_timeout,
    };
    let feed = Arc::new(UpstreamFeed::new(
        feed_config,
        Arc::clone(&tokens),
        event_tx,
        shutdown_token.clone(),
    )?);

    // Downstream fan-out
    let quotes: Arc<dyn QuoteSource> =
        Arc::new(UpstoxQuoteClient::new(&config.upstox, Arc::clone(&tokens))?);
    let broadcaster = Arc::new(Broadcaster::new(
        config.broadcast,
        feed.clone(),
        Arc::clone(&quotes),
    ));

    // Spawn upstream event handler
    let event_broadcaster = Arc::clone(&broadcaster);
    tokio::spawn(async move {
        handle_upstream_events(event_rx, event_broadcaster).await;
    });

    // Spawn credential refresh loop
    tokio::spawn(Arc::clone(&credentials).run_refresh_loop(shutdown_token.clone()));

    // Reconnect upstream on every credential rotation
    tokio::spawn(Arc::clone(&feed).follow_rotations(credentials.subscribe_rotations()));

    // Spawn HTTP server
    let state = Arc::new(AppState::new(
        Arc::clone(&credentials),
        Arc::clone(&feed),
        quotes,
        broadcaster,
    ));
    let http_server = HttpServer::new(config.server.port, state, shutdown_token.clone());
    let http_task = tokio::spawn(async move {
        if let Err(e) = http_server.run().await {
            tracing::error!(error = %e, "HTTP server error");
        }
    });

    if feed.connect() == ConnectAttempt::NoCredential {
        tracing::info!("Upstream connect deferred until a credential is bootstrapped");
    }

    tracing::info!("Stream relay ready");

    await_shutdown(shutdown_token).await;

    feed.shutdown();
    if tokio::time::timeout(SHUTDOWN_TIMEOUT, http_task).await.is_err() {
        tracing::warn!("HTTP server did not drain before the shutdown timeout");
    }
    store.close().await;

    tracing::info!("Stream relay stopped");
    Ok(())
}

/// Relay upstream events to subscribers, in arrival order.
async fn handle_upstream_events(mut rx: mpsc::Receiver<UpstreamEvent>, broadcaster: Arc<Broadcaster>) {
    while let Some(event) = rx.recv().await {
        match event {
            UpstreamEvent::Message(envelope) => {
                let _ = broadcaster.broadcast(&envelope);
            }
            UpstreamEvent::Connected => {
                tracing::info!("Upstream feed connected");
            }
            UpstreamEvent::Disconnected { reason } => {
                tracing::warn!(reason = %reason, "Upstream feed disconnected");
            }
            UpstreamEvent::Reconnecting { attempt, delay } => {
                tracing::info!(attempt, delay_ms = delay.as_millis(), "Upstream feed reconnecting");
            }
        }
    }
}

/// Log the parsed configuration.
fn log_config(config: &RelayConfig) {
    tracing::info!(
        port = config.server.port,
        feed_url = %config.upstox.feed_url,
        instrument_prefix = %config.upstox.instrument_prefix,
        restore_subscriptions = config.reconnect.restore_subscriptions,
        snapshot_depth = config.broadcast.snapshot_depth,
        "Configuration loaded"
    );
    tracing::debug!(
        check_interval_secs = config.credentials.check_interval.as_secs(),
        lookahead_secs = config.credentials.lookahead_margin.as_secs(),
        reconnect_delay_ms = config.reconnect.delay_initial.as_millis(),
        reconnect_jitter = config.reconnect.jitter,
        reconnect_max_attempts = config.reconnect.max_attempts,
        "Timing configuration"
    );
}

/// Load .env file from current directory or any ancestor directory.
fn load_dotenv() {
    if dotenvy::dotenv().is_ok() {
        return;
    }

    if let Ok(cwd) = std::env::current_dir() {
        let mut dir = cwd.as_path();
        while let Some(parent) = dir.parent() {
            let env_path = parent.join(".env");
            if env_path.exists() {
                let _ = dotenvy::from_path(&env_path);
                return;
            }
            dir = parent;
        }
    }
}

/// Wait for shutdown signal (SIGTERM or SIGINT).
#[allow(clippy::expect_used)]
async fn await_shutdown(shutdown_token: CancellationToken) {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("signal handler installation is critical for graceful shutdown");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("SIGTERM handler installation is critical for graceful shutdown")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {
            tracing::info!("Received Ctrl+C, initiating shutdown");
        }
        () = terminate => {
            tracing::info!("Received SIGTERM, initiating shutdown");
        }
    }

    shutdown_token.cancel();

    tracing::info!(
        timeout_secs = SHUTDOWN_TIMEOUT.as_secs(),
        "Graceful shutdown started"
    );
}

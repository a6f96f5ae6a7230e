//! HTTP and WebSocket Server
//!
//! One axum server carries the whole downstream surface.
//!
//! # Endpoints
//!
//! - `GET /health`, `/healthz`, `/readyz`, `/metrics` - probes and metrics
//! - `POST /subscribe` - forward a symbol set upstream
//! - `GET /price/{symbol}` - one-off LTP query
//! - `GET /auth/callback?code=` - authorization-code bootstrap
//! - `GET /ws` - subscriber WebSocket

mod api;
mod health;
mod ws;

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;

use axum::Router;
use axum::routing::{get, post};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tower_http::cors::CorsLayer;

pub use health::{HealthResponse, HealthStatus};

use crate::application::ports::{QuoteSource, SubscriptionForwarder};
use crate::application::services::CredentialManager;
use crate::infrastructure::broadcast::Broadcaster;
use crate::infrastructure::upstox::UpstreamFeed;

// =============================================================================
// Shared State
// =============================================================================

/// Handles shared by every request.
pub struct AppState {
    credentials: Arc<CredentialManager>,
    feed: Arc<UpstreamFeed>,
    forwarder: Arc<dyn SubscriptionForwarder>,
    quotes: Arc<dyn QuoteSource>,
    broadcaster: Arc<Broadcaster>,
    version: String,
    started_at: Instant,
}

impl AppState {
    /// Create request state. Subscriptions are forwarded through `feed`.
    #[must_use]
    pub fn new(
        credentials: Arc<CredentialManager>,
        feed: Arc<UpstreamFeed>,
        quotes: Arc<dyn QuoteSource>,
        broadcaster: Arc<Broadcaster>,
    ) -> Self {
        let forwarder: Arc<dyn SubscriptionForwarder> = feed.clone();
        Self {
            credentials,
            feed,
            forwarder,
            quotes,
            broadcaster,
            version: env!("CARGO_PKG_VERSION").to_string(),
            started_at: Instant::now(),
        }
    }

    /// Route `/subscribe` through a different forwarder.
    #[cfg(test)]
    #[must_use]
    pub(crate) fn with_forwarder(mut self, forwarder: Arc<dyn SubscriptionForwarder>) -> Self {
        self.forwarder = forwarder;
        self
    }
}

/// Build the application router.
pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/health", get(health::health_handler))
        .route("/healthz", get(health::liveness_handler))
        .route("/readyz", get(health::readiness_handler))
        .route("/metrics", get(health::metrics_handler))
        .route("/subscribe", post(api::subscribe_handler))
        .route("/price/{symbol}", get(api::price_handler))
        .route("/auth/callback", get(api::auth_callback_handler))
        .route("/ws", get(ws::ws_handler))
        .layer(CorsLayer::permissive())
        .with_state(state)
}

// =============================================================================
// Server
// =============================================================================

/// The relay's HTTP server.
pub struct HttpServer {
    port: u16,
    state: Arc<AppState>,
    cancel: CancellationToken,
}

impl HttpServer {
    /// Create a new server.
    #[must_use]
    pub const fn new(port: u16, state: Arc<AppState>, cancel: CancellationToken) -> Self {
        Self {
            port,
            state,
            cancel,
        }
    }

    /// Bind and serve until cancelled.
    ///
    /// # Errors
    ///
    /// Returns `HttpServerError` if binding fails or the server hits a fatal
    /// error while running.
    pub async fn run(self) -> Result<(), HttpServerError> {
        let addr = SocketAddr::from(([0, 0, 0, 0], self.port));
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|e| HttpServerError::BindFailed(self.port, e.to_string()))?;
        self.serve(listener).await
    }

    /// Serve on an already bound listener.
    ///
    /// # Errors
    ///
    /// Returns `HttpServerError::ServerFailed` on a fatal server error.
    pub async fn serve(self, listener: TcpListener) -> Result<(), HttpServerError> {
        let local = listener.local_addr().ok();
        tracing::info!(addr = ?local, "HTTP server listening");

        axum::serve(listener, router(self.state))
            .with_graceful_shutdown(self.cancel.cancelled_owned())
            .await
            .map_err(|e| HttpServerError::ServerFailed(e.to_string()))?;

        tracing::info!("HTTP server stopped");
        Ok(())
    }
}

/// HTTP server errors.
#[derive(Debug, thiserror::Error)]
pub enum HttpServerError {
    /// Failed to bind to port.
    #[error("failed to bind to port {0}: {1}")]
    BindFailed(u16, String),

    /// Server error.
    #[error("server error: {0}")]
    ServerFailed(String),
}

// =============================================================================
// Test Support
// =============================================================================

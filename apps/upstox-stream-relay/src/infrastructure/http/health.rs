//! Health Check and Metrics Endpoints
//!
//! - `GET /health` - JSON status, always `ok: true` while the process serves
//! - `GET /healthz` - liveness probe (simple OK)
//! - `GET /readyz` - readiness probe, 200 only while the upstream is Open
//! - `GET /metrics` - Prometheus metrics in text format

use std::sync::Arc;

use axum::{Json, extract::State, http::StatusCode, response::IntoResponse};
use chrono::{DateTime, Utc};
use serde::Serialize;

use super::AppState;
use crate::infrastructure::metrics::get_metrics_handle;
use crate::infrastructure::upstox::ConnectionState;

/// Health check response.
#[derive(Debug, Clone, Serialize)]
pub struct HealthResponse {
    /// Process is serving.
    pub ok: bool,
    /// Overall status.
    pub status: HealthStatus,
    /// Relay version.
    pub version: String,
    /// Server uptime in seconds.
    pub uptime_secs: u64,
    /// Current time.
    pub current_time: DateTime<Utc>,
    /// Upstream session state.
    pub upstream: ConnectionState,
    /// Upstream messages received since startup.
    pub messages_received: u64,
    /// Reconnects scheduled since startup.
    pub reconnects: u64,
    /// A valid access token is held.
    pub credential_ready: bool,
    /// Registered downstream subscribers.
    pub subscribers: usize,
}

/// Overall health status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    /// Credential valid and upstream Open.
    Healthy,
    /// Credential valid, upstream not Open.
    Degraded,
    /// No valid credential.
    Unhealthy,
}

const fn determine_health_status(credential_ready: bool, upstream: ConnectionState) -> HealthStatus {
    match (credential_ready, upstream) {
        (false, _) => HealthStatus::Unhealthy,
        (true, ConnectionState::Open) => HealthStatus::Healthy,
        (true, _) => HealthStatus::Degraded,
    }
}

fn build_health_response(state: &AppState) -> HealthResponse {
    let upstream = state.feed.state();
    let credential_ready = state.credentials.is_ready();

    HealthResponse {
        ok: true,
        status: determine_health_status(credential_ready, upstream),
        version: state.version.clone(),
        uptime_secs: state.started_at.elapsed().as_secs(),
        current_time: Utc::now(),
        upstream,
        messages_received: state.feed.messages_received(),
        reconnects: state.feed.reconnect_count(),
        credential_ready,
        subscribers: state.broadcaster.subscriber_count(),
    }
}

pub(super) async fn health_handler(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(build_health_response(&state))
}

pub(super) async fn liveness_handler() -> impl IntoResponse {
    (StatusCode::OK, "OK")
}

pub(super) async fn readiness_handler(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    if state.feed.is_open() {
        (StatusCode::OK, "READY")
    } else {
        (StatusCode::SERVICE_UNAVAILABLE, "NOT READY")
    }
}

pub(super) async fn metrics_handler() -> impl IntoResponse {
    get_metrics_handle().map_or_else(
        || {
            (
                StatusCode::SERVICE_UNAVAILABLE,
                [("content-type", "text/plain")],
                "Metrics not initialized".to_string(),
            )
        },
        |handle| {
            (
                StatusCode::OK,
                [("content-type", "text/plain; version=0.0.4; charset=utf-8")],
                handle.render(),
            )
        },
    )
}

#[cfg(test)]
mod tests {
    use axum::body::{Body, to_bytes};
    use axum::http::Request;
    use tower::ServiceExt;

    use super::*;
    use crate::infrastructure::http::router;
    use crate::infrastructure::http::test_support::fixture;

    #[test]
    fn status_follows_credential_then_upstream() {
        assert_eq!(
            determine_health_status(false, ConnectionState::Open),
            HealthStatus::Unhealthy
        );
        assert_eq!(
            determine_health_status(true, ConnectionState::Connecting),
            HealthStatus::Degraded
        );
        assert_eq!(
            determine_health_status(true, ConnectionState::Open),
            HealthStatus::Healthy
        );
    }

    #[tokio::test]
    async fn health_reports_ok_and_state() {
        let fx = fixture();
        let response = router(fx.state)
            .oneshot(Request::get("/health").body(Body::empty()).unwrap())
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let json: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(json["ok"], true);
        assert_eq!(json["status"], "unhealthy");
        assert_eq!(json["upstream"], "disconnected");
        assert_eq!(json["credential_ready"], false);
        assert_eq!(json["subscribers"], 0);
    }

    #[tokio::test]
    async fn readyz_is_unavailable_until_open() {
        let fx = fixture();
        let response = router(fx.state)
            .oneshot(Request::get("/readyz").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
    }

    #[tokio::test]
    async fn healthz_is_always_ok() {
        let fx = fixture();
        let response = router(fx.state)
            .oneshot(Request::get("/healthz").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }
}

//! REST Handlers
//!
//! Plain HTTP counterparts of the subscriber commands plus the OAuth
//! callback that bootstraps the first credential.

use std::sync::Arc;

use axum::Json;
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde::Deserialize;
use serde_json::json;

use super::AppState;
use crate::application::ports::UndeliverableCommand;
use crate::application::services::RefreshError;
use crate::domain::subscription::SubscriptionRequest;

#[derive(Debug, Deserialize)]
pub(super) struct SubscribeBody {
    #[serde(default)]
    symbols: Vec<String>,
}

#[derive(Debug, Deserialize)]
pub(super) struct CallbackParams {
    code: Option<String>,
    error: Option<String>,
}

/// `POST /subscribe`
pub(super) async fn subscribe_handler(
    State(state): State<Arc<AppState>>,
    Json(body): Json<SubscribeBody>,
) -> Response {
    let request = SubscriptionRequest::new(&body.symbols);
    match state.forwarder.forward_subscription(&request) {
        Ok(()) => Json(json!({ "subscribed": request.to_vec() })).into_response(),
        Err(e) => {
            let status = match e {
                UndeliverableCommand::NotConnected | UndeliverableCommand::WriterClosed => {
                    StatusCode::SERVICE_UNAVAILABLE
                }
                UndeliverableCommand::Encoding => StatusCode::INTERNAL_SERVER_ERROR,
            };
            (
                status,
                Json(json!({ "error": e.to_string(), "symbols": request.to_vec() })),
            )
                .into_response()
        }
    }
}

/// `GET /price/{symbol}`
pub(super) async fn price_handler(
    State(state): State<Arc<AppState>>,
    Path(symbol): Path<String>,
) -> Response {
    match state.quotes.last_traded_price(&symbol).await {
        Ok(data) => Json(data).into_response(),
        Err(e) => {
            tracing::warn!(symbol = %symbol, error = %e, "LTP query failed");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(json!({ "error": e.to_string() })),
            )
                .into_response()
        }
    }
}

/// `GET /auth/callback?code=...`
pub(super) async fn auth_callback_handler(
    State(state): State<Arc<AppState>>,
    Query(params): Query<CallbackParams>,
) -> Response {
    if let Some(error) = params.error {
        tracing::warn!(error = %error, "Authorization denied");
        return (StatusCode::BAD_REQUEST, Json(json!({ "error": error }))).into_response();
    }
    let Some(code) = params.code.filter(|c| !c.is_empty()) else {
        return (
            StatusCode::BAD_REQUEST,
            Json(json!({ "error": "missing code" })),
        )
            .into_response();
    };

    match state.credentials.bootstrap_with_code(&code).await {
        Ok(credential) => Json(json!({
            "ok": true,
            "expires_at": credential.expires_at(),
        }))
        .into_response(),
        Err(e) => {
            tracing::warn!(error = %e, "Bootstrap failed");
            let status = match e {
                RefreshError::Exchange(_) => StatusCode::BAD_GATEWAY,
                _ => StatusCode::INTERNAL_SERVER_ERROR,
            };
            (status, Json(json!({ "error": e.to_string() }))).into_response()
        }
    }
}

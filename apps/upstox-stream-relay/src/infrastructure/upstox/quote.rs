//! Upstox LTP Quote Client
//!
//! Authenticated one-off last-traded-price lookups. The response body is
//! relayed verbatim; only its JSON-ness is checked.

use std::sync::Arc;

use async_trait::async_trait;
use reqwest::Client;
use serde_json::Value;

use crate::application::ports::{AccessTokenSource, QuoteError, QuoteSource};
use crate::infrastructure::config::UpstoxSettings;

/// Build an Upstox instrument key from a symbol.
///
/// Symbols that already carry a segment (`NSE_EQ|INFY`) pass through.
#[must_use]
pub fn instrument_key(prefix: &str, symbol: &str) -> String {
    if symbol.contains('|') {
        symbol.to_string()
    } else {
        format!("{prefix}|{symbol}")
    }
}

/// HTTP client for the Upstox LTP endpoint.
#[derive(Clone)]
pub struct UpstoxQuoteClient {
    client: Client,
    quote_url: String,
    instrument_prefix: String,
    tokens: Arc<dyn AccessTokenSource>,
}

impl UpstoxQuoteClient {
    /// Create a client that authenticates with the current access token.
    ///
    /// # Errors
    ///
    /// Returns `QuoteError::Network` if the HTTP client cannot be built.
    pub fn new(
        settings: &UpstoxSettings,
        tokens: Arc<dyn AccessTokenSource>,
    ) -> Result<Self, QuoteError> {
        let client = Client::builder()
            .timeout(settings.http_timeout)
            .build()
            .map_err(|e| QuoteError::Network(e.to_string()))?;

        Ok(Self {
            client,
            quote_url: settings.quote_url.clone(),
            instrument_prefix: settings.instrument_prefix.clone(),
            tokens,
        })
    }
}

impl std::fmt::Debug for UpstoxQuoteClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UpstoxQuoteClient")
            .field("quote_url", &self.quote_url)
            .field("instrument_prefix", &self.instrument_prefix)
            .finish_non_exhaustive()
    }
}

#[async_trait]
impl QuoteSource for UpstoxQuoteClient {
    async fn last_traded_price(&self, symbol: &str) -> Result<Value, QuoteError> {
        let token = self
            .tokens
            .current_access_token()
            .ok_or(QuoteError::NotAuthenticated)?;
        let key = instrument_key(&self.instrument_prefix, symbol);

        let response = self
            .client
            .get(&self.quote_url)
            .header("Accept", "application/json")
            .bearer_auth(token)
            .query(&[("symbol", key.as_str())])
            .send()
            .await
            .map_err(|e| QuoteError::Network(e.to_string()))?;

        let status = response.status();
        let body = response
            .text()
            .await
            .map_err(|e| QuoteError::Network(e.to_string()))?;

        if !status.is_success() {
            tracing::debug!(instrument = %key, status = status.as_u16(), "LTP query returned error status");
        }

        serde_json::from_str(&body).map_err(|e| QuoteError::InvalidResponse(e.to_string()))
    }
}

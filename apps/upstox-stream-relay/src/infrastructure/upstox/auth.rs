//! Upstox OAuth Token Client
//!
//! Form-encoded POSTs against the Upstox token endpoint for both the
//! `refresh_token` and `authorization_code` grants.

use async_trait::async_trait;
use reqwest::Client;

use crate::application::ports::{AuthExchangeError, TokenExchange};
use crate::domain::credential::TokenResponse;
use crate::infrastructure::config::{ClientCredentials, UpstoxSettings};

/// HTTP client for the Upstox token endpoint.
#[derive(Debug, Clone)]
pub struct UpstoxAuthClient {
    client: Client,
    token_url: String,
    credentials: ClientCredentials,
}

impl UpstoxAuthClient {
    /// Create a client for the configured token endpoint.
    ///
    /// # Errors
    ///
    /// Returns `AuthExchangeError::Network` if the HTTP client cannot be built.
    pub fn new(
        settings: &UpstoxSettings,
        credentials: ClientCredentials,
    ) -> Result<Self, AuthExchangeError> {
        let client = Client::builder()
            .timeout(settings.http_timeout)
            .build()
            .map_err(|e| AuthExchangeError::Network(e.to_string()))?;

        Ok(Self {
            client,
            token_url: settings.auth_url.clone(),
            credentials,
        })
    }

    async fn post_grant(
        &self,
        grant: (&'static str, &str, &str),
    ) -> Result<TokenResponse, AuthExchangeError> {
        let (grant_type, grant_field, grant_value) = grant;
        let form = [
            ("grant_type", grant_type),
            (grant_field, grant_value),
            ("client_id", self.credentials.client_id()),
            ("client_secret", self.credentials.client_secret()),
            ("redirect_uri", self.credentials.redirect_uri()),
        ];

        let response = self
            .client
            .post(&self.token_url)
            .header("Accept", "application/json")
            .form(&form)
            .send()
            .await
            .map_err(|e| AuthExchangeError::Network(e.to_string()))?;

        let status = response.status();
        let body = response
            .text()
            .await
            .map_err(|e| AuthExchangeError::Network(e.to_string()))?;

        if !status.is_success() {
            tracing::warn!(grant_type, status = status.as_u16(), "Token exchange rejected");
            return Err(AuthExchangeError::Rejected {
                status: status.as_u16(),
                body,
            });
        }

        let token: TokenResponse = serde_json::from_str(&body)
            .map_err(|e| AuthExchangeError::InvalidResponse(e.to_string()))?;
        if token.access_token.is_empty() {
            return Err(AuthExchangeError::InvalidResponse(
                "empty access_token".to_string(),
            ));
        }

        tracing::debug!(grant_type, expires_in = token.expires_in, "Token exchange succeeded");
        Ok(token)
    }
}

#[async_trait]
impl TokenExchange for UpstoxAuthClient {
    async fn exchange_refresh_token(
        &self,
        refresh_token: &str,
    ) -> Result<TokenResponse, AuthExchangeError> {
        self.post_grant(("refresh_token", "refresh_token", refresh_token))
            .await
    }

    async fn exchange_authorization_code(
        &self,
        code: &str,
    ) -> Result<TokenResponse, AuthExchangeError> {
        self.post_grant(("authorization_code", "code", code)).await
    }
}

#[cfg(test)]
mod tests {
    use wiremock::matchers::{body_string_contains, header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    use super::*;

    fn client_for(server: &MockServer) -> UpstoxAuthClient {
        let settings = UpstoxSettings {
            auth_url: format!("{}/v2/login/authorization/token", server.uri()),
            ..UpstoxSettings::default()
        };
        let credentials = ClientCredentials::new(
            "client-id".to_string(),
            "client-secret".to_string(),
            "http://localhost/cb".to_string(),
        );
        UpstoxAuthClient::new(&settings, credentials).unwrap()
    }

    #[tokio::test]
    async fn refresh_grant_is_form_encoded() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v2/login/authorization/token"))
            .and(header("content-type", "application/x-www-form-urlencoded"))
            .and(body_string_contains("grant_type=refresh_token"))
            .and(body_string_contains("refresh_token=old-refresh"))
            .and(body_string_contains("client_id=client-id"))
            .and(body_string_contains("client_secret=client-secret"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "access_token": "new-access",
                "refresh_token": "new-refresh",
                "expires_in": 3600
            })))
            .expect(1)
            .mount(&server)
            .await;

        let token = client_for(&server)
            .exchange_refresh_token("old-refresh")
            .await
            .unwrap();

        assert_eq!(token.access_token, "new-access");
        assert_eq!(token.refresh_token.as_deref(), Some("new-refresh"));
        assert_eq!(token.expires_in, 3600);
    }

    #[tokio::test]
    async fn authorization_code_grant_sends_code() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(body_string_contains("grant_type=authorization_code"))
            .and(body_string_contains("code=abc123"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "access_token": "first",
                "expires_in": 86400
            })))
            .expect(1)
            .mount(&server)
            .await;

        let token = client_for(&server)
            .exchange_authorization_code("abc123")
            .await
            .unwrap();
        assert_eq!(token.access_token, "first");
        assert!(token.refresh_token.is_none());
    }

    #[tokio::test]
    async fn non_success_status_is_rejected() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(401).set_body_string("invalid_grant"))
            .mount(&server)
            .await;

        let err = client_for(&server)
            .exchange_refresh_token("stale")
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            AuthExchangeError::Rejected { status: 401, ref body } if body == "invalid_grant"
        ));
    }

    #[tokio::test]
    async fn malformed_body_is_invalid_response() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200).set_body_string("<html>"))
            .mount(&server)
            .await;

        let err = client_for(&server)
            .exchange_refresh_token("r")
            .await
            .unwrap_err();
        assert!(matches!(err, AuthExchangeError::InvalidResponse(_)));
    }
}

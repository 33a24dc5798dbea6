use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use reqwest::Client;
use serde::Deserialize;
use std::sync::Arc;
use thiserror::Error;
use tracing::debug;

use crate::config::{AuthConfig, SecretProvider};

const DEFAULT_EXPIRES_IN_SECS: i64 = 3600;
const INVALID_GRANT: &str = "invalid_grant";

#[derive(Clone, Debug)]
pub struct TokenGrant {
    pub access_token: String,
    /// Absent when the provider did not rotate the refresh token.
    pub refresh_token: Option<String>,
    pub expires_at: DateTime<Utc>,
}

/// Token endpoint failures, split into the only two buckets that matter to
/// the session manager.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum TokenError {
    /// The grant itself is dead; the user has to sign in again.
    #[error("invalid_grant: {0}")]
    InvalidGrant(String),
    /// Anything else: network trouble, 5xx, malformed responses.
    #[error("token endpoint unavailable: {0}")]
    Transient(String),
}

#[async_trait]
pub trait TokenClient: Send + Sync {
    async fn exchange_code(
        &self,
        code: &str,
        redirect_uri: &str,
        code_verifier: Option<&str>,
    ) -> Result<TokenGrant, TokenError>;

    async fn refresh(&self, refresh_token: &str) -> Result<TokenGrant, TokenError>;
}

#[derive(Debug, Deserialize)]
pub(crate) struct TokenResponse {
    access_token: Option<String>,
    refresh_token: Option<String>,
    expires_in: Option<i64>,
    error: Option<String>,
    error_description: Option<String>,
}

/// Form-encoded OAuth2 client for the Microsoft identity platform.
pub struct OAuthTokenClient {
    http: Client,
    token_url: String,
    client_id: String,
    scopes: Vec<String>,
    secrets: Arc<dyn SecretProvider>,
}

impl OAuthTokenClient {
    pub fn new(
        http: Client,
        config: &AuthConfig,
        secrets: Arc<dyn SecretProvider>,
    ) -> Self {
        Self {
            http,
            token_url: config.token_url(),
            client_id: config.client_id.clone(),
            scopes: config.scopes.clone(),
            secrets,
        }
    }

    fn base_params(&self, grant_type: &str) -> Vec<(&'static str, String)> {
        let mut params = vec![
            ("client_id", self.client_id.clone()),
            ("grant_type", grant_type.to_string()),
        ];
        if let Some(secret) = self.secrets.client_secret() {
            params.push(("client_secret", secret));
        }
        if !self.scopes.is_empty() {
            params.push(("scope", self.scopes.join(" ")));
        }
        params
    }

    async fn post_token_form(
        &self,
        params: &[(&'static str, String)],
    ) -> Result<TokenGrant, TokenError> {
        let response = self
            .http
            .post(&self.token_url)
            .form(params)
            .send()
            .await
            .map_err(|e| TokenError::Transient(format!("token request failed: {e}")))?;

        let status = response.status();
        let body = response
            .text()
            .await
            .map_err(|e| TokenError::Transient(format!("failed to read token response: {e}")))?;
        debug!(%status, "token endpoint responded");

        let payload: TokenResponse = match serde_json::from_str(&body) {
            Ok(payload) => payload,
            Err(e) => {
                return Err(TokenError::Transient(format!(
                    "token endpoint returned HTTP {status} with unparseable body: {e}"
                )))
            }
        };
        grant_from_response(status.is_success(), status.as_u16(), payload)
    }
}

#[async_trait]
impl TokenClient for OAuthTokenClient {
    async fn exchange_code(
        &self,
        code: &str,
        redirect_uri: &str,
        code_verifier: Option<&str>,
    ) -> Result<TokenGrant, TokenError> {
        let mut params = self.base_params("authorization_code");
        params.push(("code", code.to_string()));
        params.push(("redirect_uri", redirect_uri.to_string()));
        if let Some(verifier) = code_verifier {
            params.push(("code_verifier", verifier.to_string()));
        }
        self.post_token_form(&params).await
    }

    async fn refresh(&self, refresh_token: &str) -> Result<TokenGrant, TokenError> {
        let mut params = self.base_params("refresh_token");
        params.push(("refresh_token", refresh_token.to_string()));
        self.post_token_form(&params).await
    }
}

/// Classifies a parsed token response. Only an explicit `invalid_grant` is
/// terminal.
pub(crate) fn grant_from_response(
    success: bool,
    status: u16,
    payload: TokenResponse,
) -> Result<TokenGrant, TokenError> {
    if let Some(error) = payload.error {
        let description = payload.error_description.unwrap_or_default();
        if error == INVALID_GRANT {
            return Err(TokenError::InvalidGrant(description));
        }
        return Err(TokenError::Transient(format!("{error}: {description}")));
    }
    if !success {
        return Err(TokenError::Transient(format!(
            "token endpoint returned HTTP {status}"
        )));
    }

    let access_token = payload
        .access_token
        .filter(|t| !t.is_empty())
        .ok_or_else(|| TokenError::Transient("missing access_token in response".to_string()))?;
    let expires_in = payload.expires_in.unwrap_or(DEFAULT_EXPIRES_IN_SECS);

    Ok(TokenGrant {
        access_token,
        refresh_token: payload.refresh_token.filter(|t| !t.is_empty()),
        expires_at: Utc::now() + Duration::seconds(expires_in),
    })
}

use reqwest::{redirect::Policy, Client, Response};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use std::sync::Arc;
use std::time::Duration;

use crate::config::GraphConfig;
use crate::error::{DriveError, DriveResult};
use crate::session::SessionManager;

const TOKEN_REJECTED: &str = "access token rejected by Graph API; please sign in again";

/// Shared plumbing for every Graph call: the HTTP client, the drive base URL
/// and a source of bearer tokens.
#[derive(Clone)]
pub struct GraphClient {
    http: Client,
    drive_base: String,
    sessions: Arc<SessionManager>,
    upload_timeout: Duration,
}

impl GraphClient {
    pub fn new(http: Client, config: &GraphConfig, sessions: Arc<SessionManager>) -> Self {
        Self {
            http,
            drive_base: config.drive_base(),
            sessions,
            upload_timeout: config.upload_timeout(),
        }
    }

    pub fn http(&self) -> &Client {
        &self.http
    }

    pub fn sessions(&self) -> &Arc<SessionManager> {
        &self.sessions
    }

    pub(crate) fn upload_timeout(&self) -> Duration {
        self.upload_timeout
    }

    pub(crate) fn drive_url(&self, suffix: &str) -> String {
        format!("{}/{}", self.drive_base, suffix.trim_start_matches('/'))
    }

    /// Fresh bearer token, refreshing the session if it is about to expire.
    pub(crate) async fn bearer(&self) -> DriveResult<String> {
        self.sessions.access_token().await
    }

    /// Authenticated GET that decodes a JSON body. `what` names the target in
    /// not-found errors.
    pub(crate) async fn get_json<T: DeserializeOwned>(&self, url: &str, what: &str) -> DriveResult<T> {
        let token = self.bearer().await?;
        let response = self
            .http
            .get(url)
            .bearer_auth(token)
            .header("Accept", "application/json")
            .send()
            .await?;
        let response = check_status(response, what).await?;
        Ok(response.json::<T>().await?)
    }
}

/// Builds the HTTP client every component shares.
pub fn build_http_client(timeout: Duration) -> DriveResult<Client> {
    Ok(Client::builder()
        .timeout(timeout)
        .redirect(Policy::limited(10))
        .build()?)
}

/// Client for unauthenticated source downloads. It has no total deadline, so
/// a long transfer is bounded only by how long a single read may stall.
pub fn build_source_client(connect_timeout: Duration, read_timeout: Duration) -> DriveResult<Client> {
    Ok(Client::builder()
        .connect_timeout(connect_timeout)
        .read_timeout(read_timeout)
        .redirect(Policy::limited(10))
        .build()?)
}

#[derive(Debug, Deserialize)]
struct GraphErrorBody {
    error: Option<GraphErrorDetail>,
}

#[derive(Debug, Deserialize)]
struct GraphErrorDetail {
    code: Option<String>,
    message: Option<String>,
}

/// Maps Graph status codes onto the error taxonomy: 401 is an auth
/// challenge, 404 a miss, anything else non-2xx an API error.
pub(crate) async fn check_status(response: Response, what: &str) -> DriveResult<Response> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    if status.as_u16() == 401 {
        return Err(DriveError::Auth(TOKEN_REJECTED.to_string()));
    }
    if status.as_u16() == 404 {
        return Err(DriveError::NotFound(what.to_string()));
    }
    let message = error_message(response).await;
    Err(DriveError::Api {
        status: status.as_u16(),
        message,
    })
}

/// Best-effort extraction of Graph's `{ "error": { "message": ... } }`.
pub(crate) async fn error_message(response: Response) -> String {
    let status = response.status();
    let body = response.text().await.unwrap_or_default();
    match serde_json::from_str::<GraphErrorBody>(&body) {
        Ok(GraphErrorBody {
            error: Some(detail),
        }) => match (detail.code, detail.message) {
            (Some(code), Some(message)) => format!("{code}: {message}"),
            (None, Some(message)) => message,
            (Some(code), None) => code,
            (None, None) => status.to_string(),
        },
        _ if body.trim().is_empty() => status.to_string(),
        _ => body.chars().take(512).collect(),
    }
}

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine as _;
use rand::{distributions::Alphanumeric, Rng};
use reqwest::Client;
use serde_json::Value;
use sha2::{Digest, Sha256};
use std::sync::Arc;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tracing::{info, warn};
use url::Url;

use super::{TokenClient, TokenError};
use crate::config::{AuthConfig, GraphConfig};
use crate::error::{DriveError, DriveResult};
use crate::session::{Session, SessionManager};

/// Everything needed to send the user to the authorize endpoint and to
/// validate what comes back.
#[derive(Debug, Clone)]
pub struct AuthorizationRequest {
    pub authorize_url: String,
    pub redirect_uri: String,
    pub state: String,
    pub code_verifier: String,
}

impl AuthorizationRequest {
    pub fn new(config: &AuthConfig, redirect_uri: &str) -> DriveResult<Self> {
        let code_verifier = random_string(64);
        let code_challenge = build_code_challenge(&code_verifier);
        let state = random_string(32);

        let mut url = Url::parse(&config.authorize_url())
            .map_err(|e| DriveError::InvalidInput(format!("bad authorize endpoint: {e}")))?;
        url.query_pairs_mut()
            .append_pair("client_id", &config.client_id)
            .append_pair("response_type", "code")
            .append_pair("response_mode", "query")
            .append_pair("redirect_uri", redirect_uri)
            .append_pair("scope", &config.scopes.join(" "))
            .append_pair("code_challenge", &code_challenge)
            .append_pair("code_challenge_method", "S256")
            .append_pair("state", &state);

        Ok(Self {
            authorize_url: url.into(),
            redirect_uri: redirect_uri.to_string(),
            state,
            code_verifier,
        })
    }
}

/// Query parameters carried by the identity provider's redirect.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct RedirectParams {
    pub code: Option<String>,
    pub state: Option<String>,
    pub error: Option<String>,
    pub error_description: Option<String>,
}

/// Interactive sign-in: authorization code in, single stored session out.
pub struct LoginFlow {
    auth: AuthConfig,
    profile_url: String,
    http: Client,
    tokens: Arc<dyn TokenClient>,
    sessions: Arc<SessionManager>,
}

impl LoginFlow {
    pub fn new(
        auth: AuthConfig,
        graph: &GraphConfig,
        http: Client,
        tokens: Arc<dyn TokenClient>,
        sessions: Arc<SessionManager>,
    ) -> Self {
        Self {
            auth,
            profile_url: graph.profile_url(),
            http,
            tokens,
            sessions,
        }
    }

    /// Exchanges `code`, fetches the user's profile and replaces whatever
    /// session was stored before.
    pub async fn complete(
        &self,
        code: &str,
        redirect_uri: &str,
        code_verifier: Option<&str>,
    ) -> DriveResult<Session> {
        let grant = self
            .tokens
            .exchange_code(code, redirect_uri, code_verifier)
            .await
            .map_err(|e| match e {
                TokenError::InvalidGrant(reason) => {
                    DriveError::Auth(format!("authorization code rejected: {reason}"))
                }
                TokenError::Transient(reason) => {
                    DriveError::Auth(format!("token exchange failed: {reason}"))
                }
            })?;
        let refresh_token = grant.refresh_token.ok_or_else(|| {
            DriveError::Auth("no refresh token issued; is offline_access granted?".to_string())
        })?;

        let profile = self.fetch_profile(&grant.access_token).await?;
        self.sessions
            .create_user_session(grant.access_token, refresh_token, grant.expires_at, profile)
    }

    /// Opens the system browser and waits on a loopback listener for the
    /// redirect.
    pub async fn run_with_browser(&self) -> DriveResult<Session> {
        let (listener, redirect_uri) = bind_redirect_listener(self.auth.redirect_uri.as_deref()).await?;
        let request = AuthorizationRequest::new(&self.auth, &redirect_uri)?;

        info!(%redirect_uri, "opening browser for sign-in");
        if let Err(e) = webbrowser::open(&request.authorize_url) {
            warn!(error = %e, "failed to open browser; visit the URL manually");
            eprintln!("Open this URL to sign in:\n{}", request.authorize_url);
        }

        let params = wait_for_redirect(listener).await?;
        if let Some(error) = params.error {
            let description = params.error_description.unwrap_or_default();
            return Err(DriveError::Auth(format!("authorization error: {error} {description}")));
        }
        if params.state.as_deref() != Some(request.state.as_str()) {
            return Err(DriveError::Auth(
                "state mismatch in authorization response".to_string(),
            ));
        }
        let code = params.code.ok_or_else(|| {
            DriveError::Auth("authorization code missing in redirect".to_string())
        })?;

        self.complete(&code, &redirect_uri, Some(&request.code_verifier))
            .await
    }

    async fn fetch_profile(&self, access_token: &str) -> DriveResult<Value> {
        let response = self
            .http
            .get(&self.profile_url)
            .bearer_auth(access_token)
            .header("Accept", "application/json")
            .send()
            .await?;
        if !response.status().is_success() {
            return Err(DriveError::Auth(format!(
                "failed to fetch user profile: HTTP {}",
                response.status()
            )));
        }
        Ok(response.json::<Value>().await?)
    }
}

async fn bind_redirect_listener(configured: Option<&str>) -> DriveResult<(TcpListener, String)> {
    match configured {
        Some(uri) => {
            let url = Url::parse(uri)
                .map_err(|e| DriveError::InvalidInput(format!("bad redirect_uri {uri}: {e}")))?;
            let loopback = matches!(url.host_str(), Some("localhost") | Some("127.0.0.1"));
            let port = url.port_or_known_default().filter(|_| loopback).ok_or_else(|| {
                DriveError::InvalidInput(format!(
                    "browser sign-in needs a loopback redirect_uri, got {uri}"
                ))
            })?;
            let listener = TcpListener::bind(("127.0.0.1", port)).await?;
            Ok((listener, uri.to_string()))
        }
        None => {
            let listener = TcpListener::bind(("127.0.0.1", 0)).await?;
            let port = listener.local_addr()?.port();
            Ok((listener, format!("http://localhost:{port}")))
        }
    }
}

async fn wait_for_redirect(listener: TcpListener) -> DriveResult<RedirectParams> {
    loop {
        let (mut stream, _) = listener.accept().await?;
        let mut buffer = vec![0_u8; 8192];
        let read = stream.read(&mut buffer).await?;
        let request = String::from_utf8_lossy(&buffer[..read]).into_owned();

        let params = match parse_redirect_request(&request) {
            Ok(params) => params,
            Err(reason) => {
                warn!(%reason, "ignoring unrelated request on redirect listener");
                send_browser_response(&mut stream, "Waiting", "Waiting for sign-in.").await?;
                continue;
            }
        };
        // Browsers also ask for /favicon.ico; only a request carrying a code
        // or an error ends the wait.
        if params.code.is_none() && params.error.is_none() {
            send_browser_response(&mut stream, "Waiting", "Waiting for sign-in.").await?;
            continue;
        }

        let (title, message) = if params.error.is_some() {
            (
                "Authentication Failed",
                "We were unable to complete sign-in. You can close this window.",
            )
        } else {
            ("Authentication Complete", "You can return to the terminal.")
        };
        send_browser_response(&mut stream, title, message).await?;
        return Ok(params);
    }
}

/// Pulls the redirect query out of a raw HTTP request.
pub fn parse_redirect_request(request: &str) -> Result<RedirectParams, String> {
    let path = request
        .lines()
        .next()
        .and_then(|line| line.split_whitespace().nth(1))
        .ok_or_else(|| "failed to parse HTTP request line".to_string())?;
    let redirect_url = Url::parse(&format!("http://localhost{path}"))
        .map_err(|e| format!("failed to parse redirect url: {e}"))?;

    let mut params = RedirectParams::default();
    for (key, value) in redirect_url.query_pairs() {
        match key.as_ref() {
            "code" => params.code = Some(value.into_owned()),
            "state" => params.state = Some(value.into_owned()),
            "error" => params.error = Some(value.into_owned()),
            "error_description" => params.error_description = Some(value.into_owned()),
            _ => {}
        }
    }
    Ok(params)
}

async fn send_browser_response(
    stream: &mut TcpStream,
    title: &str,
    message: &str,
) -> DriveResult<()> {
    let body = format!(
        "<html><head><meta charset=\"utf-8\"><title>{title}</title></head>\
         <body><h1>{title}</h1><p>{message}</p></body></html>"
    );
    let response = format!(
        "HTTP/1.1 200 OK\r\nContent-Type: text/html; charset=utf-8\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
        body.len(),
        body
    );
    stream.write_all(response.as_bytes()).await?;
    stream.flush().await?;
    Ok(())
}

fn build_code_challenge(code_verifier: &str) -> String {
    let digest = Sha256::digest(code_verifier.as_bytes());
    URL_SAFE_NO_PAD.encode(digest)
}

fn random_string(len: usize) -> String {
    rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(len)
        .map(char::from)
        .collect()
}

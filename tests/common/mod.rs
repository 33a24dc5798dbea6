#![allow(dead_code)]

use axum::{
    body::{Body, Bytes},
    extract::DefaultBodyLimit,
    extract::State,
    http::{header, HeaderMap, Method, StatusCode, Uri},
    response::{IntoResponse, Response},
    Json, Router,
};
use chrono::{Duration as ChronoDuration, Utc};
use futures::StreamExt;
use percent_encoding::percent_decode_str;
use serde_json::{json, Value};
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tempfile::TempDir;

use onedrive_gateway::config::{Config, StaticSecret};
use onedrive_gateway::upload_manager::{UploadQueue, UploadStatus, UploadTask};
use onedrive_gateway::Gateway;

#[derive(Debug, Clone)]
pub struct RecordedRequest {
    pub method: Method,
    pub raw_path: String,
    pub path: String,
    pub query: Option<String>,
    pub headers: HeaderMap,
    pub body: Bytes,
}

impl RecordedRequest {
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name).and_then(|v| v.to_str().ok())
    }

    pub fn json(&self) -> Value {
        serde_json::from_slice(&self.body).unwrap_or(Value::Null)
    }
}

#[derive(Debug, Clone, Default)]
pub struct UploadSessionState {
    pub name: String,
    pub total: u64,
    pub data: Vec<u8>,
}

#[derive(Clone)]
pub struct SourceFile {
    pub body: Bytes,
    pub declare_length: bool,
    pub delay: Duration,
    /// Body sent as pieces of this size, each after `interval`.
    pub pacing: Option<(usize, Duration)>,
}

impl SourceFile {
    pub fn new(body: Vec<u8>) -> Self {
        Self {
            body: Bytes::from(body),
            declare_length: true,
            delay: Duration::ZERO,
            pacing: None,
        }
    }

    pub fn paced(mut self, piece: usize, interval: Duration) -> Self {
        self.pacing = Some((piece, interval));
        self
    }

    pub fn without_length(mut self) -> Self {
        self.declare_length = false;
        self
    }

    pub fn delayed(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }
}

#[derive(Default)]
pub struct MockState {
    base: Mutex<String>,
    counter: AtomicU64,
    requests: Mutex<Vec<RecordedRequest>>,
    items_by_path: Mutex<HashMap<String, Value>>,
    failing_paths: Mutex<HashSet<String>>,
    items_by_id: Mutex<HashMap<String, Value>>,
    children: Mutex<HashMap<String, Vec<Vec<Value>>>>,
    token_script: Mutex<VecDeque<(u16, Value)>>,
    chunk_script: Mutex<VecDeque<u16>>,
    sessions: Mutex<HashMap<String, UploadSessionState>>,
    sources: Mutex<HashMap<String, SourceFile>>,
}

/// In-process stand-in for Graph, the token endpoint, upload session URLs
/// and arbitrary download sources.
pub struct MockServer {
    pub base: String,
    state: Arc<MockState>,
}

impl MockServer {
    pub async fn spawn() -> Self {
        let state = Arc::new(MockState::default());
        let app = Router::new()
            .fallback(handle)
            .layer(DefaultBodyLimit::disable())
            .with_state(state.clone());
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
            .await
            .expect("bind mock server");
        let base = format!("http://{}", listener.local_addr().expect("local addr"));
        *state.base.lock().unwrap() = base.clone();
        tokio::spawn(async move {
            axum::serve(listener, app).await.expect("mock server");
        });
        Self { base, state }
    }

    /// Registers a folder reachable both by path and by id.
    pub fn add_folder(&self, path: &str, id: &str) {
        let (parent, name) = match path.rsplit_once('/') {
            Some((parent, name)) => (format!("/drive/root:/{parent}"), name),
            None => ("/drive/root:".to_string(), path),
        };
        let item = json!({
            "id": id,
            "name": name,
            "folder": { "childCount": 0 },
            "parentReference": { "path": parent },
        });
        self.state
            .items_by_path
            .lock()
            .unwrap()
            .insert(path.to_string(), item.clone());
        self.add_item(id, item);
    }

    pub fn add_item(&self, id: &str, item: Value) {
        self.state
            .items_by_id
            .lock()
            .unwrap()
            .insert(id.to_string(), item);
    }

    /// Lookups of `path` answer HTTP 500.
    pub fn fail_path(&self, path: &str) {
        self.state
            .failing_paths
            .lock()
            .unwrap()
            .insert(path.to_string());
    }

    /// Pages for `root`, `items/{id}` or `path:{path}` listings.
    pub fn set_children(&self, key: &str, pages: Vec<Vec<Value>>) {
        self.state
            .children
            .lock()
            .unwrap()
            .insert(key.to_string(), pages);
    }

    pub fn script_token(&self, status: u16, body: Value) {
        self.state
            .token_script
            .lock()
            .unwrap()
            .push_back((status, body));
    }

    /// Statuses for the next chunk PUTs; `0` lets a PUT through.
    pub fn script_chunks(&self, statuses: &[u16]) {
        self.state
            .chunk_script
            .lock()
            .unwrap()
            .extend(statuses.iter().copied());
    }

    /// Upload session that already holds `received`. Returns its URL.
    pub fn seed_upload_session(&self, id: &str, name: &str, total: u64, received: Vec<u8>) -> String {
        self.state.sessions.lock().unwrap().insert(
            id.to_string(),
            UploadSessionState {
                name: name.to_string(),
                total,
                data: received,
            },
        );
        format!("{}/upload/{id}", self.base)
    }

    pub fn upload_session(&self, id: &str) -> Option<UploadSessionState> {
        self.state.sessions.lock().unwrap().get(id).cloned()
    }

    pub fn add_source(&self, name: &str, source: SourceFile) -> String {
        self.state
            .sources
            .lock()
            .unwrap()
            .insert(name.to_string(), source);
        format!("{}/source/{name}", self.base)
    }

    pub fn requests(&self) -> Vec<RecordedRequest> {
        self.state.requests.lock().unwrap().clone()
    }

    pub fn drive_requests(&self) -> Vec<RecordedRequest> {
        self.requests()
            .into_iter()
            .filter(|r| r.path.starts_with("/v1.0/me/drive/"))
            .collect()
    }

    pub fn session_creations(&self) -> Vec<RecordedRequest> {
        self.requests()
            .into_iter()
            .filter(|r| r.method == Method::POST && r.path.ends_with(":/createUploadSession"))
            .collect()
    }

    pub fn chunk_puts(&self) -> Vec<RecordedRequest> {
        self.requests()
            .into_iter()
            .filter(|r| r.method == Method::PUT && r.path.starts_with("/upload/"))
            .collect()
    }

    pub fn token_requests(&self) -> Vec<RecordedRequest> {
        self.requests()
            .into_iter()
            .filter(|r| r.path.ends_with("/oauth2/v2.0/token"))
            .collect()
    }
}

async fn handle(
    State(state): State<Arc<MockState>>,
    method: Method,
    uri: Uri,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let raw_path = uri.path().to_string();
    let path = percent_decode_str(&raw_path).decode_utf8_lossy().into_owned();
    let query = uri.query().map(str::to_string);
    state.requests.lock().unwrap().push(RecordedRequest {
        method: method.clone(),
        raw_path,
        path: path.clone(),
        query: query.clone(),
        headers: headers.clone(),
        body: body.clone(),
    });

    if path == "/common/oauth2/v2.0/token" && method == Method::POST {
        return token_response(&state);
    }
    if path == "/v1.0/me" {
        return Json(json!({
            "displayName": "Test User",
            "userPrincipalName": "test@example.com",
        }))
        .into_response();
    }
    if let Some(rest) = path.strip_prefix("/v1.0/me/drive/") {
        return drive_response(&state, &method, rest, query.as_deref(), &body);
    }
    if let Some(id) = path.strip_prefix("/upload/") {
        return upload_response(&state, &method, id, &headers, &body);
    }
    if let Some(name) = path.strip_prefix("/source/") {
        return source_response(&state, name).await;
    }
    not_found()
}

fn not_found() -> Response {
    (
        StatusCode::NOT_FOUND,
        Json(json!({ "error": { "code": "itemNotFound", "message": "not found" } })),
    )
        .into_response()
}

fn token_response(state: &MockState) -> Response {
    let scripted = state.token_script.lock().unwrap().pop_front();
    match scripted {
        Some((status, body)) => (
            StatusCode::from_u16(status).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR),
            Json(body),
        )
            .into_response(),
        None => {
            let n = state.counter.fetch_add(1, Ordering::SeqCst);
            Json(json!({
                "token_type": "Bearer",
                "access_token": format!("mock-access-{n}"),
                "refresh_token": format!("mock-refresh-{n}"),
                "expires_in": 3600,
            }))
            .into_response()
        }
    }
}

fn drive_response(
    state: &MockState,
    method: &Method,
    rest: &str,
    query: Option<&str>,
    body: &Bytes,
) -> Response {
    let page = query
        .and_then(|q| q.split('&').find_map(|pair| pair.strip_prefix("page=")))
        .and_then(|n| n.parse::<usize>().ok())
        .unwrap_or(1);

    if rest == "root" {
        return Json(json!({ "id": "root", "name": "root", "folder": { "childCount": 0 } }))
            .into_response();
    }
    if rest == "root/children" {
        return children_page(state, "root", "root/children", page);
    }
    if let Some(after) = rest.strip_prefix("items/") {
        if let Some(id) = after.strip_suffix("/children") {
            return children_page(
                state,
                &format!("items/{id}"),
                &format!("items/{id}/children"),
                page,
            );
        }
        return match state.items_by_id.lock().unwrap().get(after) {
            Some(item) => Json(item.clone()).into_response(),
            None => not_found(),
        };
    }
    if let Some(target) = rest.strip_prefix("root:/") {
        if let Some(path) = target.strip_suffix(":/children") {
            return children_page(
                state,
                &format!("path:{path}"),
                &format!("root:/{path}:/children"),
                page,
            );
        }
        if let Some(path) = target.strip_suffix(":/content") {
            if *method != Method::PUT {
                return StatusCode::METHOD_NOT_ALLOWED.into_response();
            }
            let name = path.rsplit('/').next().unwrap_or(path);
            let id = format!("small-{}", state.counter.fetch_add(1, Ordering::SeqCst));
            return (
                StatusCode::CREATED,
                Json(json!({
                    "id": id,
                    "name": name,
                    "size": body.len(),
                    "file": { "mimeType": "application/octet-stream" },
                })),
            )
                .into_response();
        }
        if target.ends_with(":/createUploadSession") {
            let request: Value = serde_json::from_slice(body).unwrap_or(Value::Null);
            let total = request["fileSize"].as_u64().unwrap_or(0);
            let name = request["name"].as_str().unwrap_or_default().to_string();
            let id = format!("s{}", state.counter.fetch_add(1, Ordering::SeqCst));
            state.sessions.lock().unwrap().insert(
                id.clone(),
                UploadSessionState {
                    name,
                    total,
                    data: Vec::new(),
                },
            );
            let base = state.base.lock().unwrap().clone();
            return Json(json!({
                "uploadUrl": format!("{base}/upload/{id}"),
                "expirationDateTime": "2030-01-01T00:00:00Z",
            }))
            .into_response();
        }
        if state.failing_paths.lock().unwrap().contains(target) {
            return (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(json!({ "error": { "code": "generalException", "message": "boom" } })),
            )
                .into_response();
        }
        return match state.items_by_path.lock().unwrap().get(target) {
            Some(item) => Json(item.clone()).into_response(),
            None => not_found(),
        };
    }
    not_found()
}

fn children_page(state: &MockState, key: &str, route: &str, page: usize) -> Response {
    let pages = state
        .children
        .lock()
        .unwrap()
        .get(key)
        .cloned()
        .unwrap_or_default();
    let index = page.saturating_sub(1);
    let value = pages.get(index).cloned().unwrap_or_default();
    let mut body = json!({ "value": value });
    if index + 1 < pages.len() {
        let base = state.base.lock().unwrap().clone();
        body["@odata.nextLink"] = json!(format!("{base}/v1.0/me/drive/{route}?page={}", page + 1));
    }
    Json(body).into_response()
}

fn upload_response(
    state: &MockState,
    method: &Method,
    id: &str,
    headers: &HeaderMap,
    body: &Bytes,
) -> Response {
    let mut sessions = state.sessions.lock().unwrap();
    let Some(session) = sessions.get_mut(id) else {
        return not_found();
    };
    if *method == Method::GET {
        return Json(json!({
            "expirationDateTime": "2030-01-01T00:00:00Z",
            "nextExpectedRanges": [format!("{}-", session.data.len())],
        }))
        .into_response();
    }
    if *method != Method::PUT {
        return StatusCode::METHOD_NOT_ALLOWED.into_response();
    }

    let scripted = state.chunk_script.lock().unwrap().pop_front();
    if let Some(status) = scripted.filter(|status| *status != 0) {
        return (
            StatusCode::from_u16(status).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR),
            Json(json!({ "error": { "code": "scripted", "message": "scripted failure" } })),
        )
            .into_response();
    }

    let start = headers
        .get(header::CONTENT_RANGE)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("bytes "))
        .and_then(|v| v.split('-').next())
        .and_then(|v| v.parse::<usize>().ok());
    if start != Some(session.data.len()) {
        return StatusCode::RANGE_NOT_SATISFIABLE.into_response();
    }
    session.data.extend_from_slice(body);
    if session.data.len() as u64 >= session.total {
        return (
            StatusCode::CREATED,
            Json(json!({
                "id": format!("item-{id}"),
                "name": session.name,
                "size": session.total,
                "file": { "mimeType": "application/octet-stream" },
            })),
        )
            .into_response();
    }
    (
        StatusCode::ACCEPTED,
        Json(json!({ "nextExpectedRanges": [format!("{}-", session.data.len())] })),
    )
        .into_response()
}

async fn source_response(state: &MockState, name: &str) -> Response {
    let source = state.sources.lock().unwrap().get(name).cloned();
    let Some(source) = source else {
        return not_found();
    };
    if !source.delay.is_zero() {
        tokio::time::sleep(source.delay).await;
    }
    if let Some((piece, interval)) = source.pacing {
        let total = source.body.len();
        let pieces: Vec<Bytes> = (0..total)
            .step_by(piece)
            .map(|start| source.body.slice(start..(start + piece).min(total)))
            .collect();
        let stream = futures::stream::iter(pieces).then(move |piece| async move {
            tokio::time::sleep(interval).await;
            Ok::<Bytes, std::io::Error>(piece)
        });
        return Response::builder()
            .status(StatusCode::OK)
            .header(header::CONTENT_TYPE, "application/octet-stream")
            .header(header::CONTENT_LENGTH, total)
            .body(Body::from_stream(stream))
            .unwrap();
    }
    if source.declare_length {
        (
            StatusCode::OK,
            [(header::CONTENT_TYPE, "application/octet-stream")],
            source.body,
        )
            .into_response()
    } else {
        let chunks = vec![Ok::<Bytes, std::io::Error>(source.body)];
        Response::builder()
            .status(StatusCode::OK)
            .header(header::CONTENT_TYPE, "application/octet-stream")
            .body(Body::from_stream(futures::stream::iter(chunks)))
            .unwrap()
    }
}

pub fn test_config(server: &MockServer, dir: &TempDir) -> Config {
    let mut config = Config::default();
    config.auth.client_id = "test-client".to_string();
    config.auth.authority = server.base.clone();
    config.auth.tenant = "common".to_string();
    config.graph.api_root = format!("{}/v1.0", server.base);
    config.storage.database_path = Some(dir.path().join("gateway.db"));
    config.upload.retry_base_delay_ms = 1;
    config
}

pub fn gateway_with(config: Config) -> Gateway {
    Gateway::with_secrets(config, Arc::new(StaticSecret::new(None))).expect("gateway")
}

/// Stores a session valid for another hour.
pub fn sign_in(gateway: &Gateway) {
    gateway
        .sessions()
        .create_user_session(
            "access-0".to_string(),
            "refresh-0".to_string(),
            Utc::now() + ChronoDuration::hours(1),
            json!({ "displayName": "Test User" }),
        )
        .expect("seed session");
}

pub fn signed_in(server: &MockServer, dir: &TempDir) -> Gateway {
    let gateway = gateway_with(test_config(server, dir));
    sign_in(&gateway);
    gateway
}

pub fn patterned(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i % 251) as u8).collect()
}

/// Polls until `task_id` reaches `status`, failing after ten seconds.
pub async fn wait_for_status(queue: &UploadQueue, task_id: &str, status: UploadStatus) -> UploadTask {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
    loop {
        if let Some(task) = queue.task(task_id) {
            if task.status == status {
                return task;
            }
        }
        assert!(
            tokio::time::Instant::now() < deadline,
            "task {task_id} never reached {status:?}: {:?}",
            queue.task(task_id)
        );
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

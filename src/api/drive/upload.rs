use bytes::{Bytes, BytesMut};
use futures::{Stream, StreamExt};
use percent_encoding::percent_decode_str;
use reqwest::header::{CONTENT_LENGTH, CONTENT_RANGE, CONTENT_TYPE};
use reqwest::{Client, Response, StatusCode};
use serde::{Deserialize, Serialize};
use std::fmt::Display;
use std::time::Duration;
use tracing::{debug, info, warn};

use super::{
    client::{error_message, GraphClient},
    models::{DriveItemDto, RemoteItem, UploadReport},
    paths::{drive_path_url, normalize_path},
};
use crate::config::{ConflictBehavior, UploadConfig};
use crate::error::{DriveError, DriveResult, UploadError};

/// Upload-session chunk size. Graph requires multiples of 320 KiB.
pub const CHUNK_SIZE: usize = 320 * 1024;
/// Files below this size go up in a single PUT.
pub const SIMPLE_UPLOAD_LIMIT: u64 = 4 * 1024 * 1024;
/// Name used when a source URL has no usable last path segment.
pub const FALLBACK_FILE_NAME: &str = "downloaded_file";

const OCTET_STREAM: &str = "application/octet-stream";

/// `bytes a-b/total` for a chunk of `len` bytes starting at `start`.
pub fn content_range(start: u64, len: u64, total: u64) -> String {
    format!("bytes {}-{}/{}", start, start + len - 1, total)
}

/// Half-open byte ranges covering `start..total` in chunk order.
pub fn chunk_ranges(start: u64, total: u64) -> Vec<(u64, u64)> {
    let chunk = CHUNK_SIZE as u64;
    (start..total)
        .step_by(CHUNK_SIZE)
        .map(|begin| (begin, (begin + chunk).min(total)))
        .collect()
}

/// Where and under what name a file lands.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct UploadRequest {
    pub file_name: String,
    /// Destination folder path; empty or `/` for the drive root.
    pub dest_path: String,
    pub declared_size: u64,
    pub mime_type: Option<String>,
}

impl UploadRequest {
    pub fn new(file_name: impl Into<String>, dest_path: impl Into<String>, declared_size: u64) -> Self {
        Self {
            file_name: file_name.into(),
            dest_path: dest_path.into(),
            declared_size,
            mime_type: None,
        }
    }

    pub fn with_mime_type(mut self, mime_type: impl Into<String>) -> Self {
        self.mime_type = Some(mime_type.into());
        self
    }

    fn validate(&self) -> DriveResult<()> {
        let name = self.file_name.trim();
        if name.is_empty() {
            return Err(DriveError::InvalidInput("file name is required".to_string()));
        }
        if name.contains('/') {
            return Err(DriveError::InvalidInput(format!(
                "file name must not contain '/': {name}"
            )));
        }
        Ok(())
    }

    fn check_size(&self, actual: u64) -> DriveResult<()> {
        if actual != self.declared_size {
            return Err(UploadError::SizeMismatch {
                declared: self.declared_size,
                actual,
            }
            .into());
        }
        Ok(())
    }

    /// Drive path of the target file: destination folder plus file name.
    fn target_path(&self) -> String {
        let dest = normalize_path(self.dest_path.trim());
        let dest = dest.trim_end_matches('/');
        if dest.is_empty() {
            self.file_name.trim().to_string()
        } else {
            format!("{dest}/{}", self.file_name.trim())
        }
    }
}

#[derive(Clone, Debug)]
pub struct UploadPolicy {
    pub conflict_behavior: ConflictBehavior,
    /// Attempts per chunk, including the first one.
    pub max_chunk_attempts: u32,
    pub retry_base_delay: Duration,
}

impl From<&UploadConfig> for UploadPolicy {
    fn from(config: &UploadConfig) -> Self {
        Self {
            conflict_behavior: config.conflict_behavior,
            max_chunk_attempts: config.max_chunk_attempts.max(1),
            retry_base_delay: Duration::from_millis(config.retry_base_delay_ms),
        }
    }
}

impl Default for UploadPolicy {
    fn default() -> Self {
        Self::from(&UploadConfig::default())
    }
}

/// Hooks a caller can use to persist transfer progress.
pub trait TransferObserver: Send + Sync {
    /// A new upload session was opened for `total` bytes.
    fn session_created(&self, _upload_url: &str, _total: u64) {}

    /// `bytes_sent` bytes are now committed on the server.
    fn chunk_committed(&self, _bytes_sent: u64, _total: u64) {}
}

pub struct NoopObserver;

impl TransferObserver for NoopObserver {}

#[derive(Serialize)]
struct CreateSessionBody<'a> {
    #[serde(rename = "@microsoft.graph.conflictBehavior")]
    conflict_behavior: &'a str,
    #[serde(rename = "fileSize")]
    file_size: u64,
    name: &'a str,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct UploadSessionDto {
    upload_url: Option<String>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct UploadStatusDto {
    #[serde(default)]
    next_expected_ranges: Vec<String>,
}

/// Single-PUT and chunked uploads into the drive.
///
/// Chunks of one transfer are sent strictly in byte order. A chunk that
/// keeps failing abandons the transfer; the remote session is left to
/// expire.
#[derive(Clone)]
pub struct TransferEngine {
    client: GraphClient,
    /// Fetches URL sources. Only connect and read timeouts apply; the body
    /// is read in turns with the chunk PUTs.
    source_http: Client,
    policy: UploadPolicy,
}

impl TransferEngine {
    pub fn new(client: GraphClient, source_http: Client, policy: UploadPolicy) -> Self {
        Self {
            client,
            source_http,
            policy,
        }
    }

    pub fn policy(&self) -> &UploadPolicy {
        &self.policy
    }

    /// Uploads `content`, picking a single PUT below [`SIMPLE_UPLOAD_LIMIT`]
    /// and an upload session otherwise.
    pub async fn upload_file(
        &self,
        request: &UploadRequest,
        content: Bytes,
        observer: &dyn TransferObserver,
    ) -> DriveResult<UploadReport> {
        request.validate()?;
        request.check_size(content.len() as u64)?;
        if request.declared_size < SIMPLE_UPLOAD_LIMIT {
            self.upload_small(request, content, observer).await
        } else {
            self.upload_chunked(request, content, observer).await
        }
    }

    /// Uploads through an upload session regardless of size.
    pub async fn upload_chunked(
        &self,
        request: &UploadRequest,
        content: Bytes,
        observer: &dyn TransferObserver,
    ) -> DriveResult<UploadReport> {
        request.validate()?;
        request.check_size(content.len() as u64)?;
        let total = request.declared_size;
        let upload_url = self.create_session(request).await?;
        observer.session_created(&upload_url, total);
        self.send_chunks(&upload_url, &content, 0, total, observer).await
    }

    /// Continues an interrupted session from the first range the server still
    /// expects. An expired session restarts the upload from scratch.
    pub async fn resume_upload(
        &self,
        upload_url: &str,
        request: &UploadRequest,
        content: Bytes,
        observer: &dyn TransferObserver,
    ) -> DriveResult<UploadReport> {
        request.validate()?;
        request.check_size(content.len() as u64)?;
        let total = request.declared_size;

        let response = self
            .client
            .http()
            .get(upload_url)
            .header("Accept", "application/json")
            .send()
            .await?;
        let status = response.status();
        if status == StatusCode::NOT_FOUND {
            info!(file = %request.file_name, "upload session expired; starting over");
            return self.upload_chunked(request, content, observer).await;
        }
        if !status.is_success() {
            return Err(UploadError::SessionRejected {
                status: status.as_u16(),
                message: error_message(response).await,
            }
            .into());
        }

        let dto: UploadStatusDto = response.json().await?;
        let offset = match dto.next_expected_ranges.first() {
            Some(range) => parse_range_start(range)?,
            None => total,
        };
        if offset > total {
            return Err(UploadError::InvalidResumeOffset { offset, total }.into());
        }
        info!(file = %request.file_name, offset, total, "resuming upload session");
        self.send_chunks(upload_url, &content, offset, total, observer)
            .await
    }

    /// Copies a publicly reachable file into the drive. The source must
    /// declare a non-zero `Content-Length`; its body is streamed through
    /// the upload session chunk by chunk.
    pub async fn upload_from_url(
        &self,
        source_url: &str,
        dest_path: &str,
        observer: &dyn TransferObserver,
    ) -> DriveResult<UploadReport> {
        let file_name = file_name_from_url(source_url)?;
        let source = self.source_http.get(source_url).send().await?;
        if !source.status().is_success() {
            return Err(UploadError::Source(format!(
                "{source_url} returned HTTP {}",
                source.status()
            ))
            .into());
        }
        let total = match source.content_length() {
            None => return Err(UploadError::UnknownSourceSize.into()),
            Some(0) => return Err(UploadError::EmptySource.into()),
            Some(total) => total,
        };

        let mut request = UploadRequest::new(file_name, dest_path, total);
        if let Some(mime) = source
            .headers()
            .get(CONTENT_TYPE)
            .and_then(|value| value.to_str().ok())
        {
            request = request.with_mime_type(mime);
        }
        self.upload_stream(&request, source.bytes_stream(), observer)
            .await
    }

    /// Uploads a body of `request.declared_size` bytes that arrives as a
    /// stream, buffering one chunk at a time. A stream that yields more or
    /// fewer bytes than declared fails with `SizeMismatch`.
    pub async fn upload_stream<S, E>(
        &self,
        request: &UploadRequest,
        body: S,
        observer: &dyn TransferObserver,
    ) -> DriveResult<UploadReport>
    where
        S: Stream<Item = Result<Bytes, E>>,
        E: Display,
    {
        request.validate()?;
        let total = request.declared_size;
        if total == 0 {
            return Err(UploadError::EmptySource.into());
        }
        let upload_url = self.create_session(request).await?;
        observer.session_created(&upload_url, total);

        futures::pin_mut!(body);
        let mut buffer = BytesMut::with_capacity(CHUNK_SIZE);
        let mut received: u64 = 0;
        let mut offset: u64 = 0;
        let mut chunks = 0usize;
        let mut item = None;

        loop {
            let piece = body
                .next()
                .await
                .transpose()
                .map_err(|err| UploadError::Source(err.to_string()))?;
            let finished = piece.is_none();
            if let Some(piece) = piece {
                received += piece.len() as u64;
                if received > total {
                    return Err(UploadError::SizeMismatch {
                        declared: total,
                        actual: received,
                    }
                    .into());
                }
                buffer.extend_from_slice(&piece);
            }

            while buffer.len() >= CHUNK_SIZE || (finished && !buffer.is_empty()) {
                let take = buffer.len().min(CHUNK_SIZE);
                let chunk = buffer.split_to(take).freeze();
                let len = chunk.len() as u64;
                item = self.put_chunk(&upload_url, chunk, offset, total).await?;
                offset += len;
                chunks += 1;
                observer.chunk_committed(offset, total);
            }

            if finished {
                break;
            }
        }

        if offset != total {
            return Err(UploadError::SizeMismatch {
                declared: total,
                actual: offset,
            }
            .into());
        }
        info!(file = %request.file_name, bytes = total, chunks, "streamed upload finished");
        Ok(UploadReport {
            bytes_sent: offset,
            chunks,
            item,
        })
    }

    async fn upload_small(
        &self,
        request: &UploadRequest,
        content: Bytes,
        observer: &dyn TransferObserver,
    ) -> DriveResult<UploadReport> {
        let total = content.len() as u64;
        let url = format!(
            "{}?@microsoft.graph.conflictBehavior={}",
            self.client
                .drive_url(&drive_path_url(&request.target_path(), "content")),
            self.policy.conflict_behavior.as_str()
        );
        let token = self.client.bearer().await?;
        let response = self
            .client
            .http()
            .put(url)
            .timeout(self.client.upload_timeout())
            .bearer_auth(token)
            .header(
                CONTENT_TYPE,
                request.mime_type.as_deref().unwrap_or(OCTET_STREAM),
            )
            .body(content)
            .send()
            .await?;
        let status = response.status();
        if status == StatusCode::UNAUTHORIZED {
            return Err(DriveError::Auth(
                "access token rejected while uploading".to_string(),
            ));
        }
        if !status.is_success() {
            return Err(UploadError::SmallUploadRejected {
                status: status.as_u16(),
                message: error_message(response).await,
            }
            .into());
        }
        observer.chunk_committed(total, total);
        info!(file = %request.file_name, bytes = total, "file uploaded in a single request");
        Ok(UploadReport {
            bytes_sent: total,
            chunks: 1,
            item: parse_item(response).await,
        })
    }

    async fn create_session(&self, request: &UploadRequest) -> DriveResult<String> {
        let url = self
            .client
            .drive_url(&drive_path_url(&request.target_path(), "createUploadSession"));
        let body = CreateSessionBody {
            conflict_behavior: self.policy.conflict_behavior.as_str(),
            file_size: request.declared_size,
            name: request.file_name.trim(),
        };
        let token = self.client.bearer().await?;
        let response = self
            .client
            .http()
            .post(url)
            .bearer_auth(token)
            .json(&body)
            .send()
            .await?;
        let status = response.status();
        if status == StatusCode::UNAUTHORIZED {
            return Err(DriveError::Auth(
                "access token rejected while creating upload session".to_string(),
            ));
        }
        if !status.is_success() {
            return Err(UploadError::SessionRejected {
                status: status.as_u16(),
                message: error_message(response).await,
            }
            .into());
        }
        let dto: UploadSessionDto = response.json().await?;
        let upload_url = dto
            .upload_url
            .filter(|url| !url.trim().is_empty())
            .ok_or(UploadError::MissingUploadUrl)?;
        debug!(file = %request.file_name, size = request.declared_size, "upload session created");
        Ok(upload_url)
    }

    async fn send_chunks(
        &self,
        upload_url: &str,
        content: &Bytes,
        start: u64,
        total: u64,
        observer: &dyn TransferObserver,
    ) -> DriveResult<UploadReport> {
        let mut chunks = 0usize;
        let mut item = None;
        for (begin, end) in chunk_ranges(start, total) {
            let chunk = content.slice(begin as usize..end as usize);
            item = self.put_chunk(upload_url, chunk, begin, total).await?;
            chunks += 1;
            observer.chunk_committed(end, total);
        }
        info!(bytes = total - start, chunks, "chunked upload finished");
        Ok(UploadReport {
            bytes_sent: total - start,
            chunks,
            item,
        })
    }

    /// PUTs one chunk, retrying network errors, 5xx and 429 with exponential
    /// backoff. Returns the created item once the final chunk lands.
    async fn put_chunk(
        &self,
        upload_url: &str,
        chunk: Bytes,
        start: u64,
        total: u64,
    ) -> DriveResult<Option<RemoteItem>> {
        let len = chunk.len() as u64;
        let range = content_range(start, len, total);
        let max_attempts = self.policy.max_chunk_attempts.max(1);
        let mut attempt = 1;
        loop {
            let sent = self
                .client
                .http()
                .put(upload_url)
                .timeout(self.client.upload_timeout())
                .header(CONTENT_LENGTH, len)
                .header(CONTENT_RANGE, &range)
                .body(chunk.clone())
                .send()
                .await;

            let failure = match sent {
                Ok(response) if response.status().is_success() => {
                    debug!(range = %range, status = %response.status(), "chunk accepted");
                    return Ok(match response.status() {
                        StatusCode::OK | StatusCode::CREATED => parse_item(response).await,
                        _ => None,
                    });
                }
                Ok(response) => {
                    let status = response.status();
                    let retryable =
                        status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS;
                    let message = error_message(response).await;
                    if !retryable || attempt >= max_attempts {
                        return Err(UploadError::ChunkRejected {
                            range,
                            status: status.as_u16(),
                            message,
                        }
                        .into());
                    }
                    format!("HTTP {status}: {message}")
                }
                Err(err) => {
                    if attempt >= max_attempts {
                        return Err(UploadError::ChunkRejected {
                            range,
                            status: 0,
                            message: err.to_string(),
                        }
                        .into());
                    }
                    err.to_string()
                }
            };

            let delay = self
                .policy
                .retry_base_delay
                .saturating_mul(2u32.saturating_pow(attempt - 1));
            warn!(range = %range, attempt, error = %failure, ?delay, "chunk upload failed; retrying");
            tokio::time::sleep(delay).await;
            attempt += 1;
        }
    }
}

async fn parse_item(response: Response) -> Option<RemoteItem> {
    response
        .json::<DriveItemDto>()
        .await
        .ok()
        .map(RemoteItem::from)
}

fn parse_range_start(range: &str) -> DriveResult<u64> {
    range
        .split('-')
        .next()
        .and_then(|start| start.trim().parse().ok())
        .ok_or_else(|| {
            UploadError::SessionRejected {
                status: 200,
                message: format!("unparseable expected range '{range}'"),
            }
            .into()
        })
}

/// Last path segment of `source_url`, percent-decoded, or
/// [`FALLBACK_FILE_NAME`] when there is none.
pub fn file_name_from_url(source_url: &str) -> DriveResult<String> {
    let parsed = url::Url::parse(source_url)
        .map_err(|err| DriveError::InvalidInput(format!("invalid source url: {err}")))?;
    let name = parsed
        .path_segments()
        .and_then(|mut segments| segments.next_back())
        .map(|segment| percent_decode_str(segment).decode_utf8_lossy().into_owned())
        .map(|segment| segment.replace('/', "_"))
        .filter(|segment| !segment.trim().is_empty());
    Ok(name.unwrap_or_else(|| FALLBACK_FILE_NAME.to_string()))
}

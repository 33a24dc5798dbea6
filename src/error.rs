use thiserror::Error;

use crate::config::ConfigError;
use crate::db::StorageError;

pub type DriveResult<T> = Result<T, DriveError>;

/// Crate-wide error type. Only the session manager recovers locally; every
/// other component hands the first failure straight back to the caller.
#[derive(Debug, Error)]
pub enum DriveError {
    /// No usable session. Callers surface this as a login challenge, not a retry.
    #[error("authentication required: {0}")]
    Auth(String),
    #[error("item not found: {0}")]
    NotFound(String),
    #[error(transparent)]
    Upload(#[from] UploadError),
    #[error("graph api returned HTTP {status}: {message}")]
    Api { status: u16, message: String },
    #[error("network error: {0}")]
    Network(#[from] reqwest::Error),
    #[error("storage error: {0}")]
    Storage(#[from] StorageError),
    #[error("invalid input: {0}")]
    InvalidInput(String),
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),
}

impl DriveError {
    pub fn is_auth(&self) -> bool {
        matches!(self, DriveError::Auth(_))
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, DriveError::NotFound(_))
    }
}

/// Fatal transfer failures. A transfer that hits one of these is abandoned.
#[derive(Debug, Error)]
pub enum UploadError {
    #[error("simple upload rejected with HTTP {status}: {message}")]
    SmallUploadRejected { status: u16, message: String },
    #[error("failed to create upload session (HTTP {status}): {message}")]
    SessionRejected { status: u16, message: String },
    #[error("no upload URL received from session creation")]
    MissingUploadUrl,
    #[error("chunk {range} rejected (HTTP {status}): {message}")]
    ChunkRejected {
        range: String,
        status: u16,
        message: String,
    },
    #[error("content length {actual} does not match declared size {declared}")]
    SizeMismatch { declared: u64, actual: u64 },
    #[error("upload session expects offset {offset}, beyond the {total}-byte file")]
    InvalidResumeOffset { offset: u64, total: u64 },
    #[error("source did not declare a content length")]
    UnknownSourceSize,
    #[error("source is empty")]
    EmptySource,
    #[error("failed to read source: {0}")]
    Source(String),
}

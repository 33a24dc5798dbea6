//! Client-side OneDrive access over Microsoft Graph: a single persisted
//! session with automatic token refresh, path resolution, drive metadata
//! and chunked uploads with a durable upload queue.

pub mod api;
pub mod config;
pub mod context;
pub mod db;
pub mod error;
pub mod session;
pub mod upload_manager;

pub use config::Config;
pub use context::Gateway;
pub use error::{DriveError, DriveResult, UploadError};

mod client;
mod items;
mod models;
mod paths;
mod upload;

pub use client::{build_http_client, build_source_client, GraphClient};
pub use items::DriveItems;
pub use models::{Breadcrumb, ItemKind, RemoteItem, Thumbnail, UploadReport};
pub use paths::{is_root_path, normalize_path, PathResolver, ROOT_ID, ROOT_MARKER, ROOT_NAME};
pub use upload::{
    chunk_ranges, content_range, file_name_from_url, NoopObserver, TransferEngine,
    TransferObserver, UploadPolicy, UploadRequest, CHUNK_SIZE, FALLBACK_FILE_NAME,
    SIMPLE_UPLOAD_LIMIT,
};

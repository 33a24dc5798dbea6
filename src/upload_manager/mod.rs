mod core;
mod models;
mod storage;

pub use self::core::UploadQueue;
pub use models::{UploadProgressUpdate, UploadQueueState, UploadSource, UploadStatus, UploadTask};
pub use storage::{SqliteTransferStore, TransferStore};

use std::path::PathBuf;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UploadStatus {
    Queued,
    Uploading,
    Completed,
    Failed,
}

impl UploadStatus {
    pub fn is_finished(&self) -> bool {
        matches!(self, UploadStatus::Completed | UploadStatus::Failed)
    }

    pub(crate) fn as_i64(&self) -> i64 {
        match self {
            UploadStatus::Queued => 0,
            UploadStatus::Uploading => 1,
            UploadStatus::Completed => 2,
            UploadStatus::Failed => 3,
        }
    }

    pub(crate) fn from_i64(value: i64) -> Self {
        match value {
            1 => UploadStatus::Uploading,
            2 => UploadStatus::Completed,
            3 => UploadStatus::Failed,
            _ => UploadStatus::Queued,
        }
    }
}

/// Where the bytes of a queued upload come from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UploadSource {
    LocalFile(PathBuf),
    RemoteUrl(String),
}

#[derive(Debug, Clone, PartialEq)]
pub struct UploadTask {
    pub task_id: String,
    pub file_name: String,
    pub dest_path: String,
    pub source: UploadSource,
    pub mime_type: Option<String>,
    /// Upload session URL, once one was opened.
    pub upload_url: Option<String>,
    pub total_size: Option<u64>,
    pub bytes_sent: u64,
    pub status: UploadStatus,
    pub remote_id: Option<String>,
    pub error_message: Option<String>,
    pub queued_at: i64,
    pub completed_at: Option<i64>,
}

#[derive(Debug, Clone, Default)]
pub struct UploadQueueState {
    /// Queued and running uploads, oldest first.
    pub active: Vec<UploadTask>,
    /// Newest first.
    pub completed: Vec<UploadTask>,
    /// Newest first.
    pub failed: Vec<UploadTask>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct UploadProgressUpdate {
    pub task_id: String,
    pub status: UploadStatus,
    pub bytes_sent: u64,
    pub total_size: Option<u64>,
    pub speed_bps: Option<f64>,
    pub timestamp_millis: i64,
}

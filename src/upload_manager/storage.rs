use std::path::PathBuf;
use tracing::warn;

use super::models::{UploadSource, UploadStatus, UploadTask};
use crate::db::{current_timestamp_millis, Database, TransferRecord};

/// Persistence for the upload queue. Write failures are logged, not
/// returned: a lost progress row only costs a resume point.
pub trait TransferStore: Send + Sync {
    fn load(&self) -> Vec<UploadTask>;
    fn upsert(&self, task: &UploadTask);
    fn update_progress(&self, task_id: &str, upload_url: Option<&str>, bytes_sent: u64);
    fn remove(&self, task_id: &str);
    /// Drops completed and failed rows.
    fn clear_history(&self);
}

pub struct SqliteTransferStore {
    db: Database,
}

impl SqliteTransferStore {
    pub fn new(db: Database) -> Self {
        Self { db }
    }
}

impl TransferStore for SqliteTransferStore {
    fn load(&self) -> Vec<UploadTask> {
        match self.db.load_transfers() {
            Ok(records) => records.into_iter().filter_map(task_from_record).collect(),
            Err(err) => {
                warn!(error = %err, "failed to load upload transfers");
                Vec::new()
            }
        }
    }

    fn upsert(&self, task: &UploadTask) {
        if let Err(err) = self.db.upsert_transfer(&record_from_task(task)) {
            warn!(task_id = %task.task_id, error = %err, "failed to persist upload transfer");
        }
    }

    fn update_progress(&self, task_id: &str, upload_url: Option<&str>, bytes_sent: u64) {
        let bytes_sent = i64::try_from(bytes_sent).unwrap_or(i64::MAX);
        if let Err(err) = self.db.update_transfer_progress(
            task_id,
            upload_url,
            bytes_sent,
            current_timestamp_millis(),
        ) {
            warn!(task_id, error = %err, "failed to persist upload progress");
        }
    }

    fn remove(&self, task_id: &str) {
        if let Err(err) = self.db.delete_transfer(task_id) {
            warn!(task_id, error = %err, "failed to delete upload transfer");
        }
    }

    fn clear_history(&self) {
        let keep = [
            UploadStatus::Queued.as_i64(),
            UploadStatus::Uploading.as_i64(),
        ];
        if let Err(err) = self.db.clear_finished_transfers(&keep) {
            warn!(error = %err, "failed to clear upload history");
        }
    }
}

fn record_from_task(task: &UploadTask) -> TransferRecord {
    let (local_path, source_url) = match &task.source {
        UploadSource::LocalFile(path) => (Some(path.to_string_lossy().into_owned()), None),
        UploadSource::RemoteUrl(url) => (None, Some(url.clone())),
    };
    TransferRecord {
        task_id: task.task_id.clone(),
        file_name: task.file_name.clone(),
        dest_path: task.dest_path.clone(),
        local_path,
        source_url,
        mime_type: task.mime_type.clone(),
        upload_url: task.upload_url.clone(),
        total_size: task.total_size.and_then(|v| v.try_into().ok()),
        bytes_sent: task.bytes_sent.try_into().unwrap_or(i64::MAX),
        status: task.status.as_i64(),
        remote_id: task.remote_id.clone(),
        error_message: task.error_message.clone(),
        queued_at: task.queued_at,
        completed_at: task.completed_at,
        updated_at_millis: current_timestamp_millis(),
    }
}

/// Rows with neither a local path nor a source URL are skipped.
fn task_from_record(record: TransferRecord) -> Option<UploadTask> {
    let source = match (record.local_path, record.source_url) {
        (Some(path), _) => UploadSource::LocalFile(PathBuf::from(path)),
        (None, Some(url)) => UploadSource::RemoteUrl(url),
        (None, None) => {
            warn!(task_id = %record.task_id, "upload transfer has no source; skipping");
            return None;
        }
    };
    Some(UploadTask {
        task_id: record.task_id,
        file_name: record.file_name,
        dest_path: record.dest_path,
        source,
        mime_type: record.mime_type,
        upload_url: record.upload_url,
        total_size: record.total_size.and_then(|v| u64::try_from(v).ok()),
        bytes_sent: u64::try_from(record.bytes_sent).unwrap_or_default(),
        status: UploadStatus::from_i64(record.status),
        remote_id: record.remote_id,
        error_message: record.error_message,
        queued_at: record.queued_at,
        completed_at: record.completed_at,
    })
}

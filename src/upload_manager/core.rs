use bytes::Bytes;
use std::{
    collections::HashMap,
    path::{Path, PathBuf},
    sync::{Arc, Mutex, MutexGuard},
    time::{Duration, Instant},
};
use tokio::sync::{broadcast, Semaphore};
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::{
    models::{UploadProgressUpdate, UploadQueueState, UploadSource, UploadStatus, UploadTask},
    storage::TransferStore,
};
use crate::api::drive::{
    file_name_from_url, normalize_path, TransferEngine, TransferObserver, UploadReport,
    UploadRequest,
};
use crate::db::current_timestamp_millis;
use crate::error::{DriveError, DriveResult};

const INTERRUPTED_UPLOAD_MESSAGE: &str = "upload was interrupted before it finished; queue it again";
const PROGRESS_CHANNEL_CAP: usize = 64;
const PERSIST_BYTES_THRESHOLD: u64 = 256 * 1024;
const PERSIST_INTERVAL: Duration = Duration::from_secs(1);
const SPEED_SAMPLE_MIN_INTERVAL: Duration = Duration::from_millis(300);

/// Background upload queue. Each entry runs on its own task once a
/// concurrency permit is free; a failure only marks that entry.
#[derive(Clone)]
pub struct UploadQueue {
    engine: TransferEngine,
    state: Arc<Mutex<InnerState>>,
    store: Arc<dyn TransferStore>,
    progress_meters: Arc<Mutex<HashMap<String, ProgressTick>>>,
    persist_markers: Arc<Mutex<HashMap<String, PersistMarker>>>,
    progress_tx: broadcast::Sender<UploadProgressUpdate>,
    permits: Arc<Semaphore>,
    // Restored entries waiting for `resume_interrupted`.
    pending_restore: Arc<Mutex<Vec<String>>>,
}

#[derive(Clone, Default)]
struct InnerState {
    active: Vec<UploadTask>,
    completed: Vec<UploadTask>,
    failed: Vec<UploadTask>,
}

struct ProgressTick {
    bytes_sent: u64,
    instant: Instant,
}

struct PersistMarker {
    bytes_sent: u64,
    instant: Instant,
}

impl UploadQueue {
    /// Builds the queue and reloads persisted entries. Nothing is started
    /// until [`resume_interrupted`](Self::resume_interrupted) is called.
    pub fn new(engine: TransferEngine, store: Arc<dyn TransferStore>, max_concurrent: usize) -> Self {
        let (progress_tx, _) = broadcast::channel(PROGRESS_CHANNEL_CAP);
        let queue = Self {
            engine,
            state: Arc::new(Mutex::new(InnerState::default())),
            store,
            progress_meters: Arc::new(Mutex::new(HashMap::new())),
            persist_markers: Arc::new(Mutex::new(HashMap::new())),
            progress_tx,
            permits: Arc::new(Semaphore::new(max_concurrent.max(1))),
            pending_restore: Arc::new(Mutex::new(Vec::new())),
        };
        queue.restore_from_storage();
        queue
    }

    fn restore_from_storage(&self) {
        let mut active = Vec::new();
        let mut completed = Vec::new();
        let mut failed = Vec::new();
        for mut task in self.store.load() {
            match task.status {
                UploadStatus::Queued => active.push(task),
                UploadStatus::Uploading if is_resumable(&task) => {
                    task.status = UploadStatus::Queued;
                    self.store.upsert(&task);
                    active.push(task);
                }
                UploadStatus::Uploading => {
                    task.status = UploadStatus::Failed;
                    task.completed_at = Some(current_timestamp_millis());
                    if task.error_message.is_none() {
                        task.error_message = Some(INTERRUPTED_UPLOAD_MESSAGE.to_string());
                    }
                    self.store.upsert(&task);
                    failed.push(task);
                }
                UploadStatus::Completed => completed.push(task),
                UploadStatus::Failed => failed.push(task),
            }
        }
        active.sort_by_key(|task| task.queued_at);
        completed.sort_by_key(|task| std::cmp::Reverse(task.completed_at));
        failed.sort_by_key(|task| std::cmp::Reverse(task.completed_at));

        let pending: Vec<String> = active.iter().map(|t| t.task_id.clone()).collect();
        if !pending.is_empty() {
            info!(count = pending.len(), "restored unfinished uploads");
        }
        *recover_lock(&self.pending_restore) = pending;
        let mut state = recover_lock(&self.state);
        state.active = active;
        state.completed = completed;
        state.failed = failed;
    }

    /// Starts every entry restored from storage: queued ones from scratch,
    /// interrupted sessions from their last committed offset. Returns how
    /// many were started.
    pub fn resume_interrupted(&self) -> usize {
        let pending = std::mem::take(&mut *recover_lock(&self.pending_restore));
        let count = pending.len();
        for task_id in pending {
            self.spawn(task_id);
        }
        count
    }

    /// Queues a local file for upload into `dest_path`.
    pub async fn enqueue_file(
        &self,
        local_path: impl AsRef<Path>,
        dest_path: impl Into<String>,
    ) -> DriveResult<UploadTask> {
        let local_path = local_path.as_ref();
        let file_name = local_path
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .filter(|name| !name.trim().is_empty())
            .ok_or_else(|| {
                DriveError::InvalidInput(format!("{} does not name a file", local_path.display()))
            })?;
        let metadata = tokio::fs::metadata(local_path).await?;
        if !metadata.is_file() {
            return Err(DriveError::InvalidInput(format!(
                "{} is not a regular file",
                local_path.display()
            )));
        }
        let task = self.new_task(
            file_name,
            dest_path.into(),
            UploadSource::LocalFile(PathBuf::from(local_path)),
            Some(metadata.len()),
        );
        self.enqueue(task)
    }

    /// Queues a copy of a publicly reachable file into `dest_path`.
    pub fn enqueue_url(
        &self,
        source_url: impl Into<String>,
        dest_path: impl Into<String>,
    ) -> DriveResult<UploadTask> {
        let source_url = source_url.into();
        let file_name = file_name_from_url(&source_url)?;
        let task = self.new_task(
            file_name,
            dest_path.into(),
            UploadSource::RemoteUrl(source_url),
            None,
        );
        self.enqueue(task)
    }

    fn new_task(
        &self,
        file_name: String,
        dest_path: String,
        source: UploadSource,
        total_size: Option<u64>,
    ) -> UploadTask {
        UploadTask {
            task_id: Uuid::new_v4().to_string(),
            file_name,
            dest_path,
            source,
            mime_type: None,
            upload_url: None,
            total_size,
            bytes_sent: 0,
            status: UploadStatus::Queued,
            remote_id: None,
            error_message: None,
            queued_at: current_timestamp_millis(),
            completed_at: None,
        }
    }

    fn enqueue(&self, task: UploadTask) -> DriveResult<UploadTask> {
        let mut state = recover_lock(&self.state);
        if state.active.iter().any(|t| same_target(t, &task)) {
            return Err(DriveError::InvalidInput(format!(
                "{} is already queued for {}",
                task.file_name, task.dest_path
            )));
        }
        state.failed.retain(|t| !same_target(t, &task));
        state.completed.retain(|t| !same_target(t, &task));
        state.active.push(task.clone());
        drop(state);

        self.store.upsert(&task);
        self.emit(&task.task_id, task.status, 0, task.total_size, None);
        info!(task_id = %task.task_id, file = %task.file_name, dest = %task.dest_path, "upload queued");
        self.spawn(task.task_id.clone());
        Ok(task)
    }

    fn spawn(&self, task_id: String) {
        let queue = self.clone();
        tokio::spawn(async move { queue.run(task_id).await });
    }

    async fn run(self, task_id: String) {
        let _permit = match self.permits.clone().acquire_owned().await {
            Ok(permit) => permit,
            Err(_) => return,
        };
        let Some(task) = self.start(&task_id) else {
            debug!(task_id, "upload cancelled before it started");
            return;
        };

        let observer = QueueObserver {
            queue: self.clone(),
            task_id: task_id.clone(),
        };
        let result = match &task.source {
            UploadSource::LocalFile(path) => self.upload_local(&task, path, &observer).await,
            UploadSource::RemoteUrl(url) => {
                self.engine
                    .upload_from_url(url, &task.dest_path, &observer)
                    .await
            }
        };
        match result {
            Ok(report) => self.mark_success(&task_id, report),
            Err(err) => self.mark_failure(&task_id, err.to_string()),
        }
    }

    /// Moves a queued entry to `Uploading`. `None` when it was cancelled.
    fn start(&self, task_id: &str) -> Option<UploadTask> {
        let mut state = recover_lock(&self.state);
        let task = state
            .active
            .iter_mut()
            .find(|t| t.task_id == task_id && t.status == UploadStatus::Queued)?;
        task.status = UploadStatus::Uploading;
        let task = task.clone();
        drop(state);
        self.store.upsert(&task);
        self.emit(task_id, task.status, task.bytes_sent, task.total_size, None);
        Some(task)
    }

    async fn upload_local(
        &self,
        task: &UploadTask,
        path: &Path,
        observer: &QueueObserver,
    ) -> DriveResult<UploadReport> {
        let content = Bytes::from(tokio::fs::read(path).await?);
        let declared = task.total_size.unwrap_or(content.len() as u64);
        let mut request = UploadRequest::new(task.file_name.clone(), task.dest_path.clone(), declared);
        if let Some(mime) = &task.mime_type {
            request = request.with_mime_type(mime.clone());
        }
        match &task.upload_url {
            Some(upload_url) => {
                self.engine
                    .resume_upload(upload_url, &request, content, observer)
                    .await
            }
            None => self.engine.upload_file(&request, content, observer).await,
        }
    }

    /// Cancels an entry that has not started yet. Running uploads cannot be
    /// cancelled.
    pub fn cancel(&self, task_id: &str) -> DriveResult<UploadQueueState> {
        let mut state = recover_lock(&self.state);
        let Some(pos) = state.active.iter().position(|t| t.task_id == task_id) else {
            return Err(DriveError::NotFound(format!("upload task {task_id}")));
        };
        if state.active[pos].status != UploadStatus::Queued {
            return Err(DriveError::InvalidInput(format!(
                "upload {task_id} is already running and cannot be cancelled"
            )));
        }
        state.active.remove(pos);
        let snapshot = (*state).clone();
        drop(state);
        self.store.remove(task_id);
        self.clear_progress_meter(task_id);
        info!(task_id, "queued upload cancelled");
        Ok(snapshot.into())
    }

    pub fn clear_history(&self) -> UploadQueueState {
        let mut state = recover_lock(&self.state);
        state.completed.clear();
        state.failed.clear();
        let snapshot = (*state).clone();
        drop(state);
        self.store.clear_history();
        snapshot.into()
    }

    pub fn snapshot(&self) -> UploadQueueState {
        recover_lock(&self.state).clone().into()
    }

    pub fn task(&self, task_id: &str) -> Option<UploadTask> {
        let state = recover_lock(&self.state);
        state
            .active
            .iter()
            .chain(state.completed.iter())
            .chain(state.failed.iter())
            .find(|t| t.task_id == task_id)
            .cloned()
    }

    /// Progress and status changes for every entry. Slow receivers lag
    /// rather than block uploads.
    pub fn subscribe(&self) -> broadcast::Receiver<UploadProgressUpdate> {
        self.progress_tx.subscribe()
    }

    fn mark_success(&self, task_id: &str, report: UploadReport) {
        let mut state = recover_lock(&self.state);
        let mut updated = None;
        if let Some(pos) = state.active.iter().position(|t| t.task_id == task_id) {
            let mut task = state.active.remove(pos);
            task.status = UploadStatus::Completed;
            task.completed_at = Some(current_timestamp_millis());
            task.bytes_sent = task.total_size.unwrap_or(report.bytes_sent);
            task.remote_id = report.item.map(|item| item.id);
            task.error_message = None;
            // Persisted and announced before the lock is released.
            self.store.upsert(&task);
            self.emit(task_id, task.status, task.bytes_sent, task.total_size, None);
            state.completed.insert(0, task.clone());
            updated = Some(task);
        }
        drop(state);
        if let Some(task) = updated {
            info!(task_id, file = %task.file_name, chunks = report.chunks, "upload completed");
            self.clear_progress_meter(task_id);
        }
    }

    fn mark_failure(&self, task_id: &str, err: String) {
        let mut state = recover_lock(&self.state);
        let mut updated = None;
        if let Some(pos) = state.active.iter().position(|t| t.task_id == task_id) {
            let mut task = state.active.remove(pos);
            task.status = UploadStatus::Failed;
            task.completed_at = Some(current_timestamp_millis());
            task.error_message = Some(err.clone());
            self.store.upsert(&task);
            self.emit(task_id, task.status, task.bytes_sent, task.total_size, None);
            state.failed.insert(0, task.clone());
            updated = Some(task);
        }
        drop(state);
        if let Some(task) = updated {
            warn!(task_id, file = %task.file_name, error = %err, "upload failed");
            self.clear_progress_meter(task_id);
        }
    }

    fn record_session(&self, task_id: &str, upload_url: &str, total: u64) {
        let mut state = recover_lock(&self.state);
        if let Some(task) = state.active.iter_mut().find(|t| t.task_id == task_id) {
            task.upload_url = Some(upload_url.to_string());
            task.total_size = Some(total);
            task.bytes_sent = 0;
        }
        drop(state);
        self.store.update_progress(task_id, Some(upload_url), 0);
    }

    fn report_progress(&self, task_id: &str, bytes_sent: u64, total: u64) {
        let mut state = recover_lock(&self.state);
        let mut updated = None;
        if let Some(task) = state.active.iter_mut().find(|t| t.task_id == task_id) {
            task.bytes_sent = bytes_sent;
            task.total_size = Some(total);
            updated = Some(task.clone());
        }
        drop(state);
        if let Some(task) = updated {
            if self.should_persist_progress(task_id, bytes_sent) {
                self.store.update_progress(task_id, None, bytes_sent);
            }
            let speed = self.compute_speed_bps(task_id, bytes_sent);
            self.emit(task_id, task.status, bytes_sent, task.total_size, speed);
        }
    }

    fn emit(
        &self,
        task_id: &str,
        status: UploadStatus,
        bytes_sent: u64,
        total_size: Option<u64>,
        speed_bps: Option<f64>,
    ) {
        // No subscribers is not an error.
        let _ = self.progress_tx.send(UploadProgressUpdate {
            task_id: task_id.to_string(),
            status,
            bytes_sent,
            total_size,
            speed_bps,
            timestamp_millis: current_timestamp_millis(),
        });
    }

    fn compute_speed_bps(&self, task_id: &str, bytes_sent: u64) -> Option<f64> {
        let now = Instant::now();
        let mut meters = recover_lock(&self.progress_meters);
        let entry = meters
            .entry(task_id.to_string())
            .or_insert_with(|| ProgressTick {
                bytes_sent,
                instant: now,
            });
        let delta_bytes = bytes_sent.saturating_sub(entry.bytes_sent);
        let elapsed = now.duration_since(entry.instant);
        if delta_bytes == 0 || elapsed < SPEED_SAMPLE_MIN_INTERVAL {
            return None;
        }
        entry.bytes_sent = bytes_sent;
        entry.instant = now;
        Some(delta_bytes as f64 / elapsed.as_secs_f64())
    }

    fn should_persist_progress(&self, task_id: &str, bytes_sent: u64) -> bool {
        let now = Instant::now();
        let mut inserted = false;
        let mut markers = recover_lock(&self.persist_markers);
        let entry = markers.entry(task_id.to_string()).or_insert_with(|| {
            inserted = true;
            PersistMarker {
                bytes_sent,
                instant: now,
            }
        });
        if inserted {
            return true;
        }
        let delta_bytes = bytes_sent.saturating_sub(entry.bytes_sent);
        let elapsed = now.duration_since(entry.instant);
        if delta_bytes >= PERSIST_BYTES_THRESHOLD || elapsed >= PERSIST_INTERVAL {
            entry.bytes_sent = bytes_sent;
            entry.instant = now;
            true
        } else {
            false
        }
    }

    fn clear_progress_meter(&self, task_id: &str) {
        recover_lock(&self.progress_meters).remove(task_id);
        recover_lock(&self.persist_markers).remove(task_id);
    }
}

/// Feeds engine callbacks back into the queue's state and storage.
struct QueueObserver {
    queue: UploadQueue,
    task_id: String,
}

impl TransferObserver for QueueObserver {
    fn session_created(&self, upload_url: &str, total: u64) {
        self.queue.record_session(&self.task_id, upload_url, total);
    }

    fn chunk_committed(&self, bytes_sent: u64, total: u64) {
        self.queue.report_progress(&self.task_id, bytes_sent, total);
    }
}

/// Same file name into the same folder, however the folder path is spelled.
fn same_target(a: &UploadTask, b: &UploadTask) -> bool {
    a.file_name == b.file_name && folder_key(&a.dest_path) == folder_key(&b.dest_path)
}

fn folder_key(dest_path: &str) -> String {
    normalize_path(dest_path.trim())
        .trim_end_matches('/')
        .to_string()
}

fn is_resumable(task: &UploadTask) -> bool {
    matches!(task.source, UploadSource::LocalFile(_)) && task.upload_url.is_some()
}

impl From<InnerState> for UploadQueueState {
    fn from(value: InnerState) -> Self {
        Self {
            active: value.active,
            completed: value.completed,
            failed: value.failed,
        }
    }
}

fn recover_lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poison) => poison.into_inner(),
    }
}

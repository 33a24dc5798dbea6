use rusqlite::{params, OptionalExtension, Row};

use super::{Database, StorageResult};

pub(crate) const TRANSFER_TABLE_SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS upload_transfers (
    task_id TEXT PRIMARY KEY,
    file_name TEXT NOT NULL,
    dest_path TEXT NOT NULL,
    local_path TEXT,
    source_url TEXT,
    mime_type TEXT,
    upload_url TEXT,
    total_size INTEGER,
    bytes_sent INTEGER NOT NULL DEFAULT 0,
    status INTEGER NOT NULL,
    remote_id TEXT,
    error_message TEXT,
    queued_at INTEGER NOT NULL,
    completed_at INTEGER,
    updated_at_millis INTEGER NOT NULL
);";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransferRecord {
    pub task_id: String,
    pub file_name: String,
    pub dest_path: String,
    pub local_path: Option<String>,
    pub source_url: Option<String>,
    pub mime_type: Option<String>,
    pub upload_url: Option<String>,
    pub total_size: Option<i64>,
    pub bytes_sent: i64,
    pub status: i64,
    pub remote_id: Option<String>,
    pub error_message: Option<String>,
    pub queued_at: i64,
    pub completed_at: Option<i64>,
    pub updated_at_millis: i64,
}

impl Database {
    pub fn upsert_transfer(&self, record: &TransferRecord) -> StorageResult<()> {
        self.with_connection(|conn| {
            conn.execute(
                "INSERT INTO upload_transfers (
                    task_id,
                    file_name,
                    dest_path,
                    local_path,
                    source_url,
                    mime_type,
                    upload_url,
                    total_size,
                    bytes_sent,
                    status,
                    remote_id,
                    error_message,
                    queued_at,
                    completed_at,
                    updated_at_millis
                )
                VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
                ON CONFLICT(task_id) DO UPDATE SET
                    file_name = excluded.file_name,
                    dest_path = excluded.dest_path,
                    local_path = excluded.local_path,
                    source_url = excluded.source_url,
                    mime_type = excluded.mime_type,
                    upload_url = excluded.upload_url,
                    total_size = excluded.total_size,
                    bytes_sent = excluded.bytes_sent,
                    status = excluded.status,
                    remote_id = excluded.remote_id,
                    error_message = excluded.error_message,
                    queued_at = excluded.queued_at,
                    completed_at = excluded.completed_at,
                    updated_at_millis = excluded.updated_at_millis",
                params![
                    record.task_id,
                    record.file_name,
                    record.dest_path,
                    record.local_path,
                    record.source_url,
                    record.mime_type,
                    record.upload_url,
                    record.total_size,
                    record.bytes_sent,
                    record.status,
                    record.remote_id,
                    record.error_message,
                    record.queued_at,
                    record.completed_at,
                    record.updated_at_millis,
                ],
            )?;
            Ok(())
        })
    }

    pub fn load_transfers(&self) -> StorageResult<Vec<TransferRecord>> {
        self.with_connection(|conn| {
            let mut stmt = conn.prepare(
                "SELECT
                    task_id,
                    file_name,
                    dest_path,
                    local_path,
                    source_url,
                    mime_type,
                    upload_url,
                    total_size,
                    bytes_sent,
                    status,
                    remote_id,
                    error_message,
                    queued_at,
                    completed_at,
                    updated_at_millis
                FROM upload_transfers
                ORDER BY queued_at ASC",
            )?;
            let rows = stmt
                .query_map([], map_transfer)?
                .collect::<Result<Vec<_>, _>>()?;
            Ok(rows)
        })
    }

    pub fn load_transfer(&self, task_id: &str) -> StorageResult<Option<TransferRecord>> {
        self.with_connection(|conn| {
            let record = conn
                .query_row(
                    "SELECT
                        task_id,
                        file_name,
                        dest_path,
                        local_path,
                        source_url,
                        mime_type,
                        upload_url,
                        total_size,
                        bytes_sent,
                        status,
                        remote_id,
                        error_message,
                        queued_at,
                        completed_at,
                        updated_at_millis
                    FROM upload_transfers
                    WHERE task_id = ?",
                    params![task_id],
                    map_transfer,
                )
                .optional()?;
            Ok(record)
        })
    }

    /// Cheap cursor write used between chunks.
    pub fn update_transfer_progress(
        &self,
        task_id: &str,
        upload_url: Option<&str>,
        bytes_sent: i64,
        updated_at_millis: i64,
    ) -> StorageResult<()> {
        self.with_connection(|conn| {
            conn.execute(
                "UPDATE upload_transfers
                SET upload_url = COALESCE(?, upload_url),
                    bytes_sent = ?,
                    updated_at_millis = ?
                WHERE task_id = ?",
                params![upload_url, bytes_sent, updated_at_millis, task_id],
            )?;
            Ok(())
        })
    }

    pub fn delete_transfer(&self, task_id: &str) -> StorageResult<()> {
        self.with_connection(|conn| {
            conn.execute(
                "DELETE FROM upload_transfers WHERE task_id = ?",
                params![task_id],
            )?;
            Ok(())
        })
    }

    /// Removes every row whose status is not one of `keep_statuses`.
    pub fn clear_finished_transfers(&self, keep_statuses: &[i64]) -> StorageResult<()> {
        self.with_connection(|conn| {
            let tx = conn.transaction()?;
            let mut stmt = tx.prepare("SELECT task_id, status FROM upload_transfers")?;
            let rows = stmt
                .query_map([], |row| Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?)))?
                .collect::<Result<Vec<_>, _>>()?;
            drop(stmt);
            for (task_id, status) in rows {
                if !keep_statuses.contains(&status) {
                    tx.execute(
                        "DELETE FROM upload_transfers WHERE task_id = ?",
                        params![task_id],
                    )?;
                }
            }
            tx.commit()?;
            Ok(())
        })
    }
}

fn map_transfer(row: &Row) -> rusqlite::Result<TransferRecord> {
    Ok(TransferRecord {
        task_id: row.get(0)?,
        file_name: row.get(1)?,
        dest_path: row.get(2)?,
        local_path: row.get(3)?,
        source_url: row.get(4)?,
        mime_type: row.get(5)?,
        upload_url: row.get(6)?,
        total_size: row.get(7)?,
        bytes_sent: row.get(8)?,
        status: row.get(9)?,
        remote_id: row.get(10)?,
        error_message: row.get(11)?,
        queued_at: row.get(12)?,
        completed_at: row.get(13)?,
        updated_at_millis: row.get(14)?,
    })
}

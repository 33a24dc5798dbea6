use rusqlite::{params, OptionalExtension, Row};

use super::{Database, StorageResult};

/// `slot` can only ever be 1, so the table holds at most one session no
/// matter what the caller does.
pub(crate) const SESSION_TABLE_SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS sessions (
    slot INTEGER PRIMARY KEY CHECK (slot = 1),
    id TEXT NOT NULL UNIQUE,
    access_token TEXT NOT NULL,
    refresh_token TEXT NOT NULL,
    expires_at_millis INTEGER NOT NULL,
    user_profile TEXT NOT NULL,
    created_at_millis INTEGER NOT NULL,
    updated_at_millis INTEGER NOT NULL
);";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionRecord {
    pub id: String,
    pub access_token: String,
    pub refresh_token: String,
    pub expires_at_millis: i64,
    pub user_profile: String,
    pub created_at_millis: i64,
    pub updated_at_millis: i64,
}

impl Database {
    pub fn load_session(&self) -> StorageResult<Option<SessionRecord>> {
        self.with_connection(|conn| {
            let record = conn
                .query_row(
                    "SELECT
                        id,
                        access_token,
                        refresh_token,
                        expires_at_millis,
                        user_profile,
                        created_at_millis,
                        updated_at_millis
                    FROM sessions
                    WHERE slot = 1",
                    [],
                    map_session,
                )
                .optional()?;
            Ok(record)
        })
    }

    /// Deletes whatever is stored and inserts `record`, in one transaction.
    pub fn replace_session(&self, record: &SessionRecord) -> StorageResult<()> {
        self.with_connection(|conn| {
            let tx = conn.transaction()?;
            tx.execute("DELETE FROM sessions", [])?;
            tx.execute(
                "INSERT INTO sessions (
                    slot,
                    id,
                    access_token,
                    refresh_token,
                    expires_at_millis,
                    user_profile,
                    created_at_millis,
                    updated_at_millis
                )
                VALUES (1, ?, ?, ?, ?, ?, ?, ?)",
                params![
                    record.id,
                    record.access_token,
                    record.refresh_token,
                    record.expires_at_millis,
                    record.user_profile,
                    record.created_at_millis,
                    record.updated_at_millis,
                ],
            )?;
            tx.commit()?;
            Ok(())
        })
    }

    /// Replaces tokens and expiry of session `id`; the profile is left alone.
    /// Returns the row after the update, or `None` if `id` is no longer stored.
    pub fn update_session_tokens(
        &self,
        id: &str,
        access_token: &str,
        refresh_token: &str,
        expires_at_millis: i64,
        updated_at_millis: i64,
    ) -> StorageResult<Option<SessionRecord>> {
        self.with_connection(|conn| {
            let tx = conn.transaction()?;
            let changed = tx.execute(
                "UPDATE sessions
                SET access_token = ?,
                    refresh_token = ?,
                    expires_at_millis = ?,
                    updated_at_millis = ?
                WHERE id = ?",
                params![
                    access_token,
                    refresh_token,
                    expires_at_millis,
                    updated_at_millis,
                    id
                ],
            )?;
            let record = if changed == 0 {
                None
            } else {
                tx.query_row(
                    "SELECT
                        id,
                        access_token,
                        refresh_token,
                        expires_at_millis,
                        user_profile,
                        created_at_millis,
                        updated_at_millis
                    FROM sessions
                    WHERE id = ?",
                    params![id],
                    map_session,
                )
                .optional()?
            };
            tx.commit()?;
            Ok(record)
        })
    }

    pub fn delete_session(&self, id: &str) -> StorageResult<()> {
        self.with_connection(|conn| {
            conn.execute("DELETE FROM sessions WHERE id = ?", params![id])?;
            Ok(())
        })
    }

    pub fn clear_sessions(&self) -> StorageResult<()> {
        self.with_connection(|conn| {
            conn.execute("DELETE FROM sessions", [])?;
            Ok(())
        })
    }

    pub fn count_sessions(&self) -> StorageResult<usize> {
        self.with_connection(|conn| {
            let count: i64 = conn.query_row("SELECT COUNT(*) FROM sessions", [], |row| row.get(0))?;
            Ok(count.max(0) as usize)
        })
    }
}

fn map_session(row: &Row) -> rusqlite::Result<SessionRecord> {
    Ok(SessionRecord {
        id: row.get(0)?,
        access_token: row.get(1)?,
        refresh_token: row.get(2)?,
        expires_at_millis: row.get(3)?,
        user_profile: row.get(4)?,
        created_at_millis: row.get(5)?,
        updated_at_millis: row.get(6)?,
    })
}

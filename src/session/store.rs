use chrono::{DateTime, Utc};

use super::Session;
use crate::db::{current_timestamp_millis, Database, SessionRecord, StorageError, StorageResult};

/// Single-slot persistence for the session. Implementations guarantee that
/// at most one session exists after any call returns.
pub trait SessionStore: Send + Sync {
    fn load(&self) -> StorageResult<Option<Session>>;
    /// Drops every stored session and stores `session` as the only one.
    fn replace(&self, session: &Session) -> StorageResult<()>;
    /// Swaps tokens and expiry in place. `None` means the session is gone.
    fn update_tokens(
        &self,
        id: &str,
        access_token: &str,
        refresh_token: &str,
        expires_at: DateTime<Utc>,
    ) -> StorageResult<Option<Session>>;
    fn delete(&self, id: &str) -> StorageResult<()>;
    fn clear(&self) -> StorageResult<()>;
    fn count(&self) -> StorageResult<usize>;
}

pub struct SqliteSessionStore {
    db: Database,
}

impl SqliteSessionStore {
    pub fn new(db: Database) -> Self {
        Self { db }
    }
}

impl SessionStore for SqliteSessionStore {
    fn load(&self) -> StorageResult<Option<Session>> {
        self.db
            .load_session()?
            .map(session_from_record)
            .transpose()
    }

    fn replace(&self, session: &Session) -> StorageResult<()> {
        self.db.replace_session(&record_from_session(session))
    }

    fn update_tokens(
        &self,
        id: &str,
        access_token: &str,
        refresh_token: &str,
        expires_at: DateTime<Utc>,
    ) -> StorageResult<Option<Session>> {
        self.db
            .update_session_tokens(
                id,
                access_token,
                refresh_token,
                expires_at.timestamp_millis(),
                current_timestamp_millis(),
            )?
            .map(session_from_record)
            .transpose()
    }

    fn delete(&self, id: &str) -> StorageResult<()> {
        self.db.delete_session(id)
    }

    fn clear(&self) -> StorageResult<()> {
        self.db.clear_sessions()
    }

    fn count(&self) -> StorageResult<usize> {
        self.db.count_sessions()
    }
}

fn record_from_session(session: &Session) -> SessionRecord {
    SessionRecord {
        id: session.id.clone(),
        access_token: session.access_token.clone(),
        refresh_token: session.refresh_token.clone(),
        expires_at_millis: session.expires_at.timestamp_millis(),
        user_profile: session.user_profile.to_string(),
        created_at_millis: session.created_at.timestamp_millis(),
        updated_at_millis: session.updated_at.timestamp_millis(),
    }
}

fn session_from_record(record: SessionRecord) -> StorageResult<Session> {
    let user_profile = serde_json::from_str(&record.user_profile)
        .map_err(|e| StorageError::Corrupt(format!("session profile is not JSON: {e}")))?;
    Ok(Session {
        id: record.id,
        access_token: record.access_token,
        refresh_token: record.refresh_token,
        expires_at: millis_to_datetime(record.expires_at_millis)?,
        user_profile,
        created_at: millis_to_datetime(record.created_at_millis)?,
        updated_at: millis_to_datetime(record.updated_at_millis)?,
    })
}

fn millis_to_datetime(millis: i64) -> StorageResult<DateTime<Utc>> {
    DateTime::from_timestamp_millis(millis)
        .ok_or_else(|| StorageError::Corrupt(format!("timestamp out of range: {millis}")))
}

use directories::ProjectDirs;
use rusqlite::Connection;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use thiserror::Error;

mod sessions;
mod transfers;

pub use sessions::SessionRecord;
pub use transfers::TransferRecord;

use sessions::SESSION_TABLE_SCHEMA;
use transfers::TRANSFER_TABLE_SCHEMA;

const QUALIFIER: &str = "com";
const ORGANIZATION: &str = "OneDriveGateway";
const APPLICATION: &str = "OneDriveGateway";
const DB_FILE_NAME: &str = "gateway.db";
const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("failed to create database directory {path:?}: {source}")]
    CreateDir {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("failed to resolve application data directory")]
    DataDir,
    #[error("corrupt row: {0}")]
    Corrupt(String),
}

pub type StorageResult<T> = Result<T, StorageError>;

/// Handle to the gateway's SQLite file. Every operation opens its own
/// connection so the handle can be shared freely across tasks.
#[derive(Debug, Clone)]
pub struct Database {
    path: PathBuf,
}

impl Database {
    pub fn open(path: impl Into<PathBuf>) -> StorageResult<Self> {
        let db = Self { path: path.into() };
        db.with_connection(|_| Ok(()))?;
        Ok(db)
    }

    /// Opens the database at `configured`, or in the platform data dir.
    pub fn open_default(configured: Option<&Path>) -> StorageResult<Self> {
        match configured {
            Some(path) => Self::open(path),
            None => Self::open(default_database_path()?),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub(crate) fn with_connection<T, F>(&self, operation: F) -> StorageResult<T>
    where
        F: FnOnce(&mut Connection) -> StorageResult<T>,
    {
        let mut conn = self.open_connection()?;
        operation(&mut conn)
    }

    fn open_connection(&self) -> StorageResult<Connection> {
        if let Some(dir) = self.path.parent().filter(|d| !d.as_os_str().is_empty()) {
            fs::create_dir_all(dir).map_err(|source| StorageError::CreateDir {
                path: dir.to_path_buf(),
                source,
            })?;
        }

        let conn = Connection::open(&self.path)?;
        conn.busy_timeout(BUSY_TIMEOUT)?;
        apply_migrations(&conn)?;
        Ok(conn)
    }
}

fn apply_migrations(conn: &Connection) -> StorageResult<()> {
    conn.execute_batch(SESSION_TABLE_SCHEMA)?;
    conn.execute_batch(TRANSFER_TABLE_SCHEMA)?;
    Ok(())
}

fn default_database_path() -> StorageResult<PathBuf> {
    let dirs =
        ProjectDirs::from(QUALIFIER, ORGANIZATION, APPLICATION).ok_or(StorageError::DataDir)?;
    Ok(dirs.data_dir().join(DB_FILE_NAME))
}

pub(crate) fn current_timestamp_millis() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|duration| duration.as_millis() as i64)
        .unwrap_or(0)
}

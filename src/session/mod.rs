mod manager;
mod refresher;
mod store;

pub use manager::{needs_refresh, RefreshOutcome, SessionManager};
pub use refresher::spawn_refresher;
pub use store::{SessionStore, SqliteSessionStore};

use chrono::{DateTime, Utc};
use serde_json::Value;

/// The one authenticated session the gateway works with.
#[derive(Debug, Clone, PartialEq)]
pub struct Session {
    pub id: String,
    pub access_token: String,
    pub refresh_token: String,
    pub expires_at: DateTime<Utc>,
    /// Opaque `/me` payload captured at login; never touched by refresh.
    pub user_profile: Value,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Session {
    pub fn display_name(&self) -> Option<&str> {
        self.user_profile
            .get("displayName")
            .and_then(Value::as_str)
            .or_else(|| self.user_profile.get("userPrincipalName").and_then(Value::as_str))
    }
}

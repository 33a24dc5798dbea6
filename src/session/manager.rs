use chrono::{DateTime, Duration, Utc};
use serde_json::Value;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::{Session, SessionStore};
use crate::api::auth::{TokenClient, TokenError};
use crate::error::{DriveError, DriveResult};

/// True once `now` has entered the refresh window before `expires_at`.
pub fn needs_refresh(expires_at: DateTime<Utc>, now: DateTime<Utc>, threshold: Duration) -> bool {
    now >= expires_at - threshold
}

/// What a refresh check did, for callers that run it proactively.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RefreshOutcome {
    NoSession,
    /// Token is outside the refresh window; nothing was sent.
    Fresh,
    Refreshed(DateTime<Utc>),
    /// The token endpoint answered `invalid_grant`; the session was deleted.
    Revoked,
    /// Refresh failed for another reason; the stale session was kept.
    Deferred(String),
}

/// Owns the session's lifecycle: expiry checks, refresh and the
/// single-session rule.
pub struct SessionManager {
    store: Arc<dyn SessionStore>,
    tokens: Arc<dyn TokenClient>,
    refresh_threshold: Duration,
    // Held across check-refresh-update so only one refresh is ever in flight.
    refresh_lease: Mutex<()>,
}

impl SessionManager {
    pub fn new(
        store: Arc<dyn SessionStore>,
        tokens: Arc<dyn TokenClient>,
        refresh_threshold: Duration,
    ) -> Self {
        Self {
            store,
            tokens,
            refresh_threshold,
            refresh_lease: Mutex::new(()),
        }
    }

    /// Returns the stored session, refreshing it first when it expires within
    /// the refresh threshold.
    pub async fn current_session(&self) -> DriveResult<Option<Session>> {
        let (session, _) = self.ensure_fresh(self.refresh_threshold).await?;
        Ok(session)
    }

    /// Like [`current_session`](Self::current_session) but a missing session is
    /// an [`DriveError::Auth`] the caller must turn into a login challenge.
    pub async fn require_auth(&self) -> DriveResult<Session> {
        self.current_session().await?.ok_or_else(|| {
            DriveError::Auth("no active session; please sign in".to_string())
        })
    }

    pub async fn access_token(&self) -> DriveResult<String> {
        Ok(self.require_auth().await?.access_token)
    }

    /// Proactive variant for the periodic refresher, with its own window.
    pub async fn refresh_if_expiring(&self, threshold: Duration) -> DriveResult<RefreshOutcome> {
        let (_, outcome) = self.ensure_fresh(threshold).await?;
        Ok(outcome)
    }

    /// Deletes every existing session, then stores the new one.
    pub fn create_user_session(
        &self,
        access_token: String,
        refresh_token: String,
        expires_at: DateTime<Utc>,
        user_profile: Value,
    ) -> DriveResult<Session> {
        let now = Utc::now();
        let session = Session {
            id: Uuid::new_v4().to_string(),
            access_token,
            refresh_token,
            expires_at,
            user_profile,
            created_at: now,
            updated_at: now,
        };
        self.store.replace(&session)?;
        info!(session_id = %session.id, %expires_at, "created user session");
        Ok(session)
    }

    pub fn logout(&self) -> DriveResult<()> {
        self.store.clear()?;
        info!("signed out; all sessions removed");
        Ok(())
    }

    async fn ensure_fresh(
        &self,
        threshold: Duration,
    ) -> DriveResult<(Option<Session>, RefreshOutcome)> {
        let Some(session) = self.store.load()? else {
            return Ok((None, RefreshOutcome::NoSession));
        };
        if !needs_refresh(session.expires_at, Utc::now(), threshold) {
            return Ok((Some(session), RefreshOutcome::Fresh));
        }

        let _lease = self.refresh_lease.lock().await;
        // Whoever held the lease before us may already have refreshed.
        let Some(session) = self.store.load()? else {
            return Ok((None, RefreshOutcome::NoSession));
        };
        if !needs_refresh(session.expires_at, Utc::now(), threshold) {
            debug!(session_id = %session.id, "reusing session refreshed by a concurrent caller");
            return Ok((Some(session), RefreshOutcome::Fresh));
        }

        self.refresh_locked(session).await
    }

    async fn refresh_locked(
        &self,
        session: Session,
    ) -> DriveResult<(Option<Session>, RefreshOutcome)> {
        debug!(session_id = %session.id, expires_at = %session.expires_at, "refreshing access token");
        match self.tokens.refresh(&session.refresh_token).await {
            Ok(grant) => {
                let refresh_token = grant
                    .refresh_token
                    .unwrap_or_else(|| session.refresh_token.clone());
                let updated = self.store.update_tokens(
                    &session.id,
                    &grant.access_token,
                    &refresh_token,
                    grant.expires_at,
                )?;
                match updated {
                    Some(updated) => {
                        info!(session_id = %updated.id, expires_at = %updated.expires_at, "access token refreshed");
                        let expires_at = updated.expires_at;
                        Ok((Some(updated), RefreshOutcome::Refreshed(expires_at)))
                    }
                    None => {
                        warn!(session_id = %session.id, "session disappeared during refresh");
                        Ok((None, RefreshOutcome::NoSession))
                    }
                }
            }
            Err(TokenError::InvalidGrant(reason)) => {
                warn!(session_id = %session.id, %reason, "refresh token rejected; deleting session");
                self.store.delete(&session.id)?;
                Ok((None, RefreshOutcome::Revoked))
            }
            Err(TokenError::Transient(reason)) => {
                warn!(session_id = %session.id, %reason, "token refresh failed; keeping current session");
                Ok((Some(session), RefreshOutcome::Deferred(reason)))
            }
        }
    }
}

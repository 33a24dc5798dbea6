use chrono::Duration;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use super::{RefreshOutcome, SessionManager};

/// Periodically refreshes the session once it comes within `threshold` of
/// expiry, so interactive calls rarely have to wait on the token endpoint.
/// Runs until `shutdown` is cancelled.
pub fn spawn_refresher(
    manager: Arc<SessionManager>,
    every: std::time::Duration,
    threshold: Duration,
    shutdown: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = interval(every);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        info!(interval_secs = every.as_secs(), "token refresher started");
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = ticker.tick() => {}
            }
            match manager.refresh_if_expiring(threshold).await {
                Ok(RefreshOutcome::Refreshed(expires_at)) => {
                    info!(%expires_at, "refreshed session ahead of expiry")
                }
                Ok(RefreshOutcome::Revoked) => {
                    warn!("session revoked by identity provider; sign-in required")
                }
                Ok(RefreshOutcome::Deferred(reason)) => {
                    warn!(%reason, "refresh deferred; will retry next tick")
                }
                Ok(RefreshOutcome::Fresh) | Ok(RefreshOutcome::NoSession) => {}
                Err(err) => error!(error = %err, "refresh check failed"),
            }
        }
        info!("token refresher stopped");
    })
}

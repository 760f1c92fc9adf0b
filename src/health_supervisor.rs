//! Health Supervisor (component G): finds and retries stuck sessions,
//! both on demand and on a fixed-interval background scan (spec §4.G).
//!
//! The scan loop follows the template's own background-task shape (the
//! MQTT reconnect loop in `lib.rs::run`): a `tokio::spawn`ed
//! `tokio::select!` over a `tokio::time::interval` tick and a
//! `CancellationToken`. The "no overlapping scans" rule (spec §5) is
//! enforced with a `tokio::sync::Mutex<()>` guard — `try_lock` skips a
//! tick outright rather than queuing behind a slow scan.

use chrono::Utc;
use std::sync::Arc;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{info, instrument, warn};

use crate::clock::{Clock, SystemClock};
use crate::error::Result;
use crate::model::UpdateSession;
use crate::repository::{Repository, StuckCutoffs};
use crate::session_engine::SessionEngine;

/// Default scan interval (spec §5).
pub const DEFAULT_SCAN_INTERVAL_SECS: u64 = 300;
/// Default "stuck" threshold (spec §4.G leaves the threshold caller-supplied
/// with no stated default; 30 minutes matches the scan cadence's order of
/// magnitude).
pub const DEFAULT_STUCK_THRESHOLD_MINUTES: i64 = 30;

pub struct HealthSupervisor {
    repository: Arc<dyn Repository>,
    session_engine: SessionEngine,
    scan_guard: Mutex<()>,
    clock: Arc<dyn Clock>,
}

impl HealthSupervisor {
    pub fn new(repository: Arc<dyn Repository>, session_engine: SessionEngine) -> Self {
        Self::with_clock(repository, session_engine, Arc::new(SystemClock))
    }

    pub fn with_clock(
        repository: Arc<dyn Repository>,
        session_engine: SessionEngine,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            repository,
            session_engine,
            scan_guard: Mutex::new(()),
            clock,
        }
    }

    /// `GetStuckUpdates(threshold_minutes)`.
    #[instrument(skip(self))]
    pub async fn get_stuck_updates(&self, threshold_minutes: i64) -> Result<Vec<UpdateSession>> {
        let cutoff = self.clock.now() - chrono::Duration::minutes(threshold_minutes);
        self.repository
            .get_stuck_sessions(StuckCutoffs::uniform(cutoff))
            .await
    }

    /// `RetryFailedUpdate(session_id)`: delegates to the Session Engine's
    /// `Retry` transition (spec §4.D table).
    #[instrument(skip(self))]
    pub async fn retry_failed_update(&self, session_id: &str) -> Result<UpdateSession> {
        self.session_engine.retry(session_id).await
    }

    /// Runs one scan: finds sessions stuck past `threshold_minutes`, forces
    /// each to `failed` (`GetStuckUpdates` only ever returns non-terminal
    /// sessions, so this is always a real transition), then retries it if
    /// it hasn't exhausted `max_retries`. Skips entirely (returning `0`) if
    /// a scan is already in progress — the "no overlapping scans"
    /// invariant (spec §5).
    #[instrument(skip(self))]
    pub async fn scan_once(&self, threshold_minutes: i64) -> Result<usize> {
        let Ok(_guard) = self.scan_guard.try_lock() else {
            warn!("skipping supervisor scan: previous scan still in progress");
            return Ok(0);
        };

        let stuck = self.get_stuck_updates(threshold_minutes).await?;
        let mut retried = 0;
        for session in &stuck {
            let reason = format!("stuck past {threshold_minutes}-minute threshold");
            let failed = match self
                .session_engine
                .fail_stuck(&session.session_id, &reason)
                .await
            {
                Ok(session) => session,
                Err(err) => {
                    warn!(
                        session_id = %session.session_id,
                        %err,
                        "failed to mark stuck session as failed"
                    );
                    continue;
                }
            };

            if failed.retry_count >= failed.max_retries {
                warn!(
                    session_id = %session.session_id,
                    retry_count = failed.retry_count,
                    "stuck session exhausted retries, leaving failed"
                );
                continue;
            }

            match self.session_engine.retry(&session.session_id).await {
                Ok(_) => retried += 1,
                Err(err) => warn!(
                    session_id = %session.session_id,
                    %err,
                    "failed to auto-retry stuck session"
                ),
            }
        }
        info!(found = stuck.len(), retried, "completed supervisor scan");
        Ok(retried)
    }

    /// Spawns the fixed-interval background scan loop, returning a task
    /// handle the caller should `.await` at shutdown. Cancellation via
    /// `cancel_token` stops the loop before its next tick.
    pub fn spawn_scan_loop(
        self: Arc<Self>,
        interval_secs: u64,
        threshold_minutes: i64,
        cancel_token: CancellationToken,
    ) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(std::time::Duration::from_secs(interval_secs));
            loop {
                tokio::select! {
                    () = cancel_token.cancelled() => {
                        info!("health supervisor scan loop shutting down");
                        break;
                    }
                    _ = ticker.tick() => {
                        if let Err(err) = self.scan_once(threshold_minutes).await {
                            warn!(%err, "supervisor scan failed");
                        }
                    }
                }
            }
        })
    }
}

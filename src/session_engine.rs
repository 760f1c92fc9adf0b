//! Session Engine (component D): the eleven-state per-device update
//! lifecycle (spec §4.D).
//!
//! `SessionEngine` is a thin coordinator over the Repository Adapter, the
//! same separation the template draws between `FirmwareManager`
//! (orchestration) and `RegistryClient` (I/O) — here, `SessionEngine`
//! (orchestration) and `Repository` (I/O). Post-download verification
//! runs as a detached `tokio::spawn` task the engine owns a handle to,
//! observing the session's terminal state before any mutation, per
//! design note §9's replacement for the source's fire-and-forget
//! background verification.

use parking_lot::Mutex;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tracing::{info, instrument, warn};
use uuid::Uuid;

use crate::batch_controller::BatchController;
use crate::clock::{Clock, SystemClock};
use crate::error::{OtaError, Result};
use crate::event_log::{EventLog, LogEntry};
use crate::model::{LogCategory, LogLevel, SessionStatus, UpdateSession};
use crate::repository::Repository;

#[derive(Clone)]
pub struct SessionEngine {
    repository: Arc<dyn Repository>,
    event_log: Arc<EventLog>,
    clock: Arc<dyn Clock>,
    batch_controller: Option<BatchController>,
    verification_tasks: Arc<Mutex<Vec<JoinHandle<()>>>>,
}

impl SessionEngine {
    pub fn new(repository: Arc<dyn Repository>, event_log: Arc<EventLog>) -> Self {
        Self::with_clock(repository, event_log, Arc::new(SystemClock))
    }

    pub fn with_clock(
        repository: Arc<dyn Repository>,
        event_log: Arc<EventLog>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            repository,
            event_log,
            clock,
            batch_controller: None,
            verification_tasks: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// Registers the Batch Controller this engine notifies after every
    /// terminal or cancellation transition of a batch member session
    /// (spec §4.E). `OtaService` wires this once both components exist,
    /// since each needs a handle to the other's collaborator.
    pub fn with_batch_controller(mut self, batch_controller: BatchController) -> Self {
        self.batch_controller = Some(batch_controller);
        self
    }

    async fn notify_batch(&self, batch_id: Option<&str>) {
        let (Some(controller), Some(batch_id)) = (&self.batch_controller, batch_id) else {
            return;
        };
        if let Err(err) = controller.update_batch_statistics(batch_id).await {
            warn!(batch_id, %err, "failed to refresh batch statistics");
        }
    }

    /// Awaits every outstanding detached verification task, for graceful
    /// shutdown. Per design note §9, these tasks are pool-scoped to this
    /// engine, not a global singleton, so the engine is responsible for
    /// draining them rather than leaking them at process exit.
    pub async fn drain_verification_tasks(&self) {
        let handles: Vec<JoinHandle<()>> = std::mem::take(&mut *self.verification_tasks.lock());
        for handle in handles {
            if let Err(err) = handle.await {
                warn!(%err, "verification task panicked");
            }
        }
    }

    /// `CreateSession` (spec §4.D): validates device and firmware
    /// eligibility and records a fresh `scheduled` session.
    #[instrument(skip(self))]
    pub async fn create_session(
        &self,
        device_id: i64,
        firmware_id: i64,
        priority: u8,
        force_update: bool,
        allow_rollback: bool,
    ) -> Result<UpdateSession> {
        let device = self
            .repository
            .find_device_by_id(device_id)
            .await?
            .ok_or_else(|| OtaError::NotFound(format!("device {device_id}")))?;
        if !device.active {
            return Err(OtaError::DeviceNotEligible(format!(
                "device {device_id} is inactive"
            )));
        }
        if !(device.allow_updates || force_update) {
            return Err(OtaError::DeviceNotEligible(format!(
                "device {device_id} has updates disabled"
            )));
        }

        let firmware = self
            .repository
            .get_firmware_by_id(firmware_id)
            .await?
            .ok_or_else(|| OtaError::NotFound(format!("firmware {firmware_id}")))?;
        if !firmware.is_eligible() {
            return Err(OtaError::FirmwareNotEligible(format!(
                "firmware {firmware_id} is not valid and active"
            )));
        }

        let session = UpdateSession {
            session_id: Uuid::new_v4().to_string(),
            device_id,
            firmware_id,
            status: SessionStatus::Scheduled,
            priority,
            timestamps: crate::model::SessionTimestamps {
                scheduled_at: Some(self.clock.now()),
                ..Default::default()
            },
            progress: crate::model::SessionProgress {
                total_bytes: firmware.size,
                ..Default::default()
            },
            force_update,
            allow_rollback,
            retry_count: 0,
            max_retries: 3,
            batch_id: None,
            device_version: None,
            download_checksum: None,
            error_message: None,
        };

        self.repository.create_session(session.clone()).await?;
        info!(session_id = %session.session_id, device_id, firmware_id, "created session");
        Ok(session)
    }

    /// `Acknowledge`: `scheduled`/`pending` → `acknowledged`.
    #[instrument(skip(self))]
    pub async fn acknowledge(&self, session_id: &str, device_version: &str) -> Result<UpdateSession> {
        let mut session = self.load(session_id).await?;
        require_state(
            &session,
            &[SessionStatus::Scheduled, SessionStatus::Pending],
        )?;

        if let (Some(controller), Some(batch_id)) = (&self.batch_controller, &session.batch_id) {
            if !controller.has_concurrency_slot(batch_id).await? {
                return Err(OtaError::ConcurrencyLimitReached(format!(
                    "batch {batch_id} is at its max_concurrent cap"
                )));
            }
        }

        session.status = SessionStatus::Acknowledged;
        session.timestamps.acknowledged_at = Some(self.clock.now());
        session.device_version = Some(device_version.to_string());
        self.repository.update_session(session.clone()).await?;

        self.event_log
            .append(LogEntry {
                session_id: Some(session_id.to_string()),
                device_id: session.device_id,
                event_type: LogCategory::Acknowledge,
                level: LogLevel::Info,
                message: format!("acknowledged at device version {device_version}"),
                metadata: serde_json::json!({ "device_version": device_version }),
            })
            .await;

        Ok(session)
    }

    /// `CompleteDownload(checksum)`: `downloading` → `verifying`. A
    /// checksum mismatch is logged as a warning, not a failure — the
    /// device still proceeds to verification (spec §7).
    #[instrument(skip(self))]
    pub async fn complete_download(&self, session_id: &str, checksum: &str) -> Result<UpdateSession> {
        let mut session = self.load(session_id).await?;
        require_state(&session, &[SessionStatus::Downloading])?;

        let firmware = self
            .repository
            .get_firmware_by_id(session.firmware_id)
            .await?
            .ok_or_else(|| OtaError::NotFound(format!("firmware {}", session.firmware_id)))?;

        if checksum != firmware.file_hash {
            warn!(session_id, "checksum mismatch on download completion");
            self.event_log
                .append(LogEntry {
                    session_id: Some(session_id.to_string()),
                    device_id: session.device_id,
                    event_type: LogCategory::ChecksumMismatch,
                    level: LogLevel::Warn,
                    message: "device-reported checksum does not match stored hash".to_string(),
                    metadata: serde_json::json!({
                        "expected": firmware.file_hash,
                        "actual": checksum,
                    }),
                })
                .await;
        }

        let now = self.clock.now();
        session.status = SessionStatus::Verifying;
        session.timestamps.download_completed_at = Some(now);
        session.timestamps.verification_started_at = Some(now);
        session.download_checksum = Some(checksum.to_string());
        self.repository.update_session(session.clone()).await?;

        self.event_log
            .append(LogEntry {
                session_id: Some(session_id.to_string()),
                device_id: session.device_id,
                event_type: LogCategory::DownloadComplete,
                level: LogLevel::Info,
                message: "download complete".to_string(),
                metadata: serde_json::json!({ "checksum": checksum }),
            })
            .await;

        self.spawn_verification(session_id);

        Ok(session)
    }

    /// Launches the post-download verification as a detached task owned
    /// by this engine (spec §9: "launched per download completion...
    /// owned by the Session Engine"). `complete_verification` is the
    /// cancellation-aware guard the task observes before mutating.
    fn spawn_verification(&self, session_id: &str) {
        let engine = self.clone();
        let session_id = session_id.to_string();
        let handle = tokio::spawn(async move {
            if let Err(err) = engine.complete_verification(&session_id).await {
                warn!(session_id, %err, "verification task failed");
            }
        });
        self.verification_tasks.lock().push(handle);
    }

    /// Async verification completing: `verifying` → `installing`.
    #[instrument(skip(self))]
    pub async fn complete_verification(&self, session_id: &str) -> Result<UpdateSession> {
        let mut session = self.load(session_id).await?;
        if session.status.is_terminal() {
            // The session was cancelled while verification was in flight;
            // the detached task must observe this and make no mutation.
            return Ok(session);
        }
        require_state(&session, &[SessionStatus::Verifying])?;

        let now = self.clock.now();
        session.status = SessionStatus::Installing;
        session.timestamps.verification_completed_at = Some(now);
        session.timestamps.install_started_at = Some(now);
        self.repository.update_session(session.clone()).await?;

        self.event_log
            .append(LogEntry {
                session_id: Some(session_id.to_string()),
                device_id: session.device_id,
                event_type: LogCategory::VerificationComplete,
                level: LogLevel::Info,
                message: "verification complete".to_string(),
                metadata: serde_json::json!({}),
            })
            .await;

        Ok(session)
    }

    /// `CompleteUpdate(success)`: `verifying`/`installing` → `completed`
    /// or `failed`.
    #[instrument(skip(self, error_message))]
    pub async fn complete_update(
        &self,
        session_id: &str,
        success: bool,
        error_message: Option<String>,
        new_version: Option<String>,
    ) -> Result<UpdateSession> {
        let mut session = self.load(session_id).await?;
        require_state(
            &session,
            &[SessionStatus::Verifying, SessionStatus::Installing],
        )?;

        let now = self.clock.now();
        if success {
            session.status = SessionStatus::Completed;
            session.timestamps.completed_at = Some(now);
            session.timestamps.install_completed_at = Some(now);

            if let Some(mut device) = self.repository.find_device_by_id(session.device_id).await? {
                device.current_firmware_id = Some(session.firmware_id);
                self.repository.update_device(device).await?;
            }

            self.repository.update_session(session.clone()).await?;
            self.event_log
                .append(LogEntry {
                    session_id: Some(session_id.to_string()),
                    device_id: session.device_id,
                    event_type: LogCategory::UpdateComplete,
                    level: LogLevel::Info,
                    message: format!("update complete, new_version={:?}", new_version),
                    metadata: serde_json::json!({ "new_version": new_version }),
                })
                .await;
        } else {
            session.status = SessionStatus::Failed;
            session.timestamps.failed_at = Some(now);
            session.error_message = error_message.clone();
            self.repository.update_session(session.clone()).await?;
            self.event_log
                .append(LogEntry {
                    session_id: Some(session_id.to_string()),
                    device_id: session.device_id,
                    event_type: LogCategory::UpdateFailed,
                    level: LogLevel::Error,
                    message: error_message.unwrap_or_else(|| "update failed".to_string()),
                    metadata: serde_json::json!({}),
                })
                .await;
        }

        self.notify_batch(session.batch_id.as_deref()).await;

        Ok(session)
    }

    /// `Cancel`: any non-terminal state → `cancelled`.
    #[instrument(skip(self))]
    pub async fn cancel(&self, session_id: &str, reason: &str) -> Result<bool> {
        let session = self.load(session_id).await?;
        let previous_status = session.status;
        let changed = self.repository.cancel_session(session_id, reason).await?;
        if changed {
            self.event_log
                .append(LogEntry {
                    session_id: Some(session_id.to_string()),
                    device_id: session.device_id,
                    event_type: LogCategory::Cancel,
                    level: LogLevel::Info,
                    message: format!("cancelled from {}", previous_status.as_str()),
                    metadata: serde_json::json!({ "previous_status": previous_status.as_str() }),
                })
                .await;
            self.notify_batch(session.batch_id.as_deref()).await;
        }
        Ok(changed)
    }

    /// Forces a stuck non-terminal session straight to `failed`, for the
    /// Health Supervisor's remediation path (spec §4.G: "synthesize retry
    /// sessions" for sessions stuck past their threshold). Unlike
    /// `CompleteUpdate`, which only applies from `verifying`/`installing`,
    /// this accepts any non-terminal state, since a session can get stuck
    /// in `acknowledged` or `downloading` too.
    #[instrument(skip(self))]
    pub async fn fail_stuck(&self, session_id: &str, reason: &str) -> Result<UpdateSession> {
        let mut session = self.load(session_id).await?;
        if session.status.is_terminal() {
            return Err(OtaError::InvalidState(format!(
                "session {session_id} is already {:?}",
                session.status
            )));
        }

        let previous_status = session.status;
        session.status = SessionStatus::Failed;
        session.timestamps.failed_at = Some(self.clock.now());
        session.error_message = Some(reason.to_string());
        self.repository.update_session(session.clone()).await?;

        self.event_log
            .append(LogEntry {
                session_id: Some(session_id.to_string()),
                device_id: session.device_id,
                event_type: LogCategory::UpdateFailed,
                level: LogLevel::Warn,
                message: format!("stuck in {} past threshold: {reason}", previous_status.as_str()),
                metadata: serde_json::json!({ "previous_status": previous_status.as_str() }),
            })
            .await;

        self.notify_batch(session.batch_id.as_deref()).await;

        Ok(session)
    }

    /// `Retry` (operator): `failed` → fresh `scheduled` session sharing
    /// `batch_id`, `priority`, `force_update`, `allow_rollback`, with
    /// `retry_count` incremented. Forbidden once `retry_count >=
    /// max_retries`.
    #[instrument(skip(self))]
    pub async fn retry(&self, session_id: &str) -> Result<UpdateSession> {
        let failed = self.load(session_id).await?;
        require_state(&failed, &[SessionStatus::Failed])?;

        if failed.retry_count >= failed.max_retries {
            return Err(OtaError::RetryExhausted(format!(
                "session {session_id} has exhausted {} retries",
                failed.max_retries
            )));
        }

        let retried = UpdateSession {
            session_id: Uuid::new_v4().to_string(),
            device_id: failed.device_id,
            firmware_id: failed.firmware_id,
            status: SessionStatus::Scheduled,
            priority: failed.priority,
            timestamps: crate::model::SessionTimestamps {
                scheduled_at: Some(self.clock.now()),
                ..Default::default()
            },
            progress: crate::model::SessionProgress {
                total_bytes: failed.progress.total_bytes,
                ..Default::default()
            },
            force_update: failed.force_update,
            allow_rollback: failed.allow_rollback,
            retry_count: failed.retry_count + 1,
            max_retries: failed.max_retries,
            batch_id: failed.batch_id.clone(),
            device_version: None,
            download_checksum: None,
            error_message: None,
        };

        self.repository.create_session(retried.clone()).await?;
        self.event_log
            .append(LogEntry {
                session_id: Some(retried.session_id.clone()),
                device_id: retried.device_id,
                event_type: LogCategory::RetryUpdate,
                level: LogLevel::Info,
                message: format!("retry of {session_id}, attempt {}", retried.retry_count),
                metadata: serde_json::json!({ "previous_session_id": session_id }),
            })
            .await;

        Ok(retried)
    }

    async fn load(&self, session_id: &str) -> Result<UpdateSession> {
        self.repository
            .get_session(session_id)
            .await?
            .ok_or_else(|| OtaError::NotFound(format!("session {session_id} not found")))
    }
}

fn require_state(session: &UpdateSession, allowed: &[SessionStatus]) -> Result<()> {
    if allowed.contains(&session.status) {
        Ok(())
    } else {
        Err(OtaError::InvalidState(format!(
            "session {} is {:?}, expected one of {:?}",
            session.session_id, session.status, allowed
        )))
    }
}

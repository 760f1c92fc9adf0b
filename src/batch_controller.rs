//! Batch Controller (component E): fleet-wide rollout creation and
//! per-batch statistics (spec §4.E).

use std::sync::Arc;
use tracing::{info, instrument};
use uuid::Uuid;

use crate::clock::{Clock, SystemClock};
use crate::error::{OtaError, Result};
use crate::event_log::{EventLog, LogEntry};
use crate::model::{BatchStatus, LogCategory, LogLevel, SessionStatus, UpdateBatch, UpdateSession};
use crate::repository::Repository;

/// Default `max_concurrent`, used when the caller doesn't specify one
/// (spec §4.E).
pub const DEFAULT_MAX_CONCURRENT: u32 = 100;

#[derive(Clone)]
pub struct BatchController {
    repository: Arc<dyn Repository>,
    event_log: Arc<EventLog>,
    clock: Arc<dyn Clock>,
}

impl BatchController {
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
        }
    }

    /// `CreateBatch`: validates the release, then transactionally creates
    /// the `UpdateBatch` and one `scheduled` `UpdateSession` per device,
    /// all sharing `batch_id` (spec §4.E; chunked inserts of
    /// [`crate::repository::BATCH_INSERT_CHUNK_SIZE`] are the Repository
    /// Adapter's concern, not this component's).
    #[instrument(skip(self, device_ids))]
    #[allow(clippy::too_many_arguments)]
    pub async fn create_batch(
        &self,
        firmware_id: i64,
        device_ids: &[i64],
        priority: u8,
        force_update: bool,
        allow_rollback: bool,
        max_concurrent: Option<u32>,
    ) -> Result<UpdateBatch> {
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

        let batch_id = new_batch_id(self.clock.as_ref());
        let now = self.clock.now();
        let total = device_ids.len() as u32;

        let sessions: Vec<UpdateSession> = device_ids
            .iter()
            .map(|&device_id| UpdateSession {
                session_id: Uuid::new_v4().to_string(),
                device_id,
                firmware_id,
                status: SessionStatus::Scheduled,
                priority,
                timestamps: crate::model::SessionTimestamps {
                    scheduled_at: Some(now),
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
                batch_id: Some(batch_id.clone()),
                device_version: None,
                download_checksum: None,
                error_message: None,
            })
            .collect();

        let batch = UpdateBatch {
            batch_id: batch_id.clone(),
            firmware_id,
            status: BatchStatus::Scheduled,
            scheduled_at: now,
            priority,
            force_update,
            allow_rollback,
            max_concurrent: max_concurrent.unwrap_or(DEFAULT_MAX_CONCURRENT),
            total_count: total,
            pending_count: total,
            completed_count: 0,
            failed_count: 0,
            completed_at: None,
        };

        self.repository
            .create_batch(batch.clone(), sessions)
            .await?;
        info!(batch_id = %batch_id, device_count = total, "created batch");
        Ok(batch)
    }

    /// `updateBatchStatistics`: recounts member sessions by status and
    /// advances the batch's own status accordingly (spec §4.E).
    #[instrument(skip(self))]
    pub async fn update_batch_statistics(&self, batch_id: &str) -> Result<UpdateBatch> {
        let mut batch = self
            .repository
            .get_batch(batch_id)
            .await?
            .ok_or_else(|| OtaError::NotFound(format!("batch {batch_id}")))?;

        let sessions = self.repository.list_sessions_by_batch(batch_id).await?;
        let completed = sessions
            .iter()
            .filter(|s| s.status == SessionStatus::Completed)
            .count() as u32;
        let failed = sessions
            .iter()
            .filter(|s| s.status == SessionStatus::Failed)
            .count() as u32;
        let pending = sessions
            .iter()
            .filter(|s| !s.status.is_terminal())
            .count() as u32;

        batch.completed_count = completed;
        batch.failed_count = failed;
        batch.pending_count = pending;

        if pending == 0 {
            batch.status = if completed > 0 {
                BatchStatus::Completed
            } else {
                BatchStatus::Failed
            };
            batch.completed_at = Some(self.clock.now());
        } else if batch.status == BatchStatus::Scheduled
            && sessions.iter().any(|s| s.status.is_terminal())
        {
            batch.status = BatchStatus::InProgress;
        }

        self.repository.update_batch(batch.clone()).await?;
        Ok(batch)
    }

    /// Whether another member session may move past `scheduled`/`pending`
    /// without breaching `max_concurrent` (spec §1/§2's "enforces
    /// per-batch concurrency caps"). Sessions not yet acknowledged don't
    /// occupy a slot; acknowledged-through-installing do.
    #[instrument(skip(self))]
    pub async fn has_concurrency_slot(&self, batch_id: &str) -> Result<bool> {
        let batch = self
            .repository
            .get_batch(batch_id)
            .await?
            .ok_or_else(|| OtaError::NotFound(format!("batch {batch_id}")))?;
        let sessions = self.repository.list_sessions_by_batch(batch_id).await?;
        let in_flight = sessions
            .iter()
            .filter(|s| {
                !matches!(s.status, SessionStatus::Scheduled | SessionStatus::Pending)
                    && !s.status.is_terminal()
            })
            .count() as u32;
        Ok(in_flight < batch.max_concurrent)
    }

    /// `CancelBatch`: sets the batch to `cancelled` and cascades
    /// cancellation to every non-terminal member session.
    #[instrument(skip(self))]
    pub async fn cancel_batch(&self, batch_id: &str) -> Result<UpdateBatch> {
        let mut batch = self
            .repository
            .get_batch(batch_id)
            .await?
            .ok_or_else(|| OtaError::NotFound(format!("batch {batch_id}")))?;

        let sessions = self.repository.list_sessions_by_batch(batch_id).await?;
        for session in &sessions {
            if self
                .repository
                .cancel_session(&session.session_id, "batch cancelled")
                .await?
            {
                self.event_log
                    .append(LogEntry {
                        session_id: Some(session.session_id.clone()),
                        device_id: session.device_id,
                        event_type: LogCategory::BatchCancel,
                        level: LogLevel::Info,
                        message: format!("cancelled as part of batch {batch_id}"),
                        metadata: serde_json::json!({ "batch_id": batch_id }),
                    })
                    .await;
            }
        }

        batch.status = BatchStatus::Cancelled;
        self.repository.update_batch(batch.clone()).await?;
        Ok(batch)
    }
}

/// `"batch-<YYYYMMDD-HHMMSS>-<uuid8>"` (spec §4.E).
fn new_batch_id(clock: &dyn crate::clock::Clock) -> String {
    let timestamp = clock.now().format("%Y%m%d-%H%M%S");
    let short = Uuid::new_v4().simple().to_string()[..8].to_string();
    format!("batch-{timestamp}-{short}")
}

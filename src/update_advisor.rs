//! Update Advisor (component F): decides what, if anything, a polling
//! device should be offered (spec §4.F).

use semver::Version;
use std::sync::Arc;
use tracing::instrument;
use uuid::Uuid;

use crate::batch_controller::BatchController;
use crate::clock::{Clock, SystemClock};
use crate::error::{OtaError, Result};
use crate::event_log::{EventLog, LogEntry};
use crate::model::{LogCategory, LogLevel, ReleaseType, SessionStatus, UpdateSession};
use crate::repository::Repository;

/// Priority assigned to ad-hoc sessions synthesized for a device that is
/// simply behind the latest production release (spec §4.F).
const AD_HOC_PRIORITY: u8 = 5;

pub struct UpdateAdvisor {
    repository: Arc<dyn Repository>,
    event_log: Arc<EventLog>,
    batch_controller: BatchController,
    clock: Arc<dyn Clock>,
}

impl UpdateAdvisor {
    pub fn new(
        repository: Arc<dyn Repository>,
        event_log: Arc<EventLog>,
        batch_controller: BatchController,
    ) -> Self {
        Self::with_clock(repository, event_log, batch_controller, Arc::new(SystemClock))
    }

    pub fn with_clock(
        repository: Arc<dyn Repository>,
        event_log: Arc<EventLog>,
        batch_controller: BatchController,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            repository,
            event_log,
            batch_controller,
            clock,
        }
    }

    /// `CheckForUpdate(device_uid, current_version)`.
    #[instrument(skip(self))]
    pub async fn check_for_update(
        &self,
        device_uid: &str,
        current_version: &str,
    ) -> Result<Option<UpdateSession>> {
        let device = self
            .repository
            .find_device_by_uid(device_uid)
            .await?
            .ok_or_else(|| OtaError::NotFound(format!("device {device_uid}")))?;
        if !(device.active && device.allow_updates) {
            return Err(OtaError::DeviceNotEligible(format!(
                "device {device_uid} is inactive or has updates disabled"
            )));
        }

        let pending = self.repository.get_pending_for_device(device.device_id).await?;
        if let Some(mut session) = pending.into_iter().next() {
            // get_pending_for_device is already ordered priority desc,
            // created_at asc, so the first entry is the best candidate.
            if let Some(batch_id) = &session.batch_id {
                if !self.batch_controller.has_concurrency_slot(batch_id).await? {
                    return Err(OtaError::ConcurrencyLimitReached(format!(
                        "batch {batch_id} is at its max_concurrent cap"
                    )));
                }
            }

            session.status = SessionStatus::Acknowledged;
            session.timestamps.acknowledged_at = Some(self.clock.now());
            session.device_version = Some(current_version.to_string());
            self.repository.update_session(session.clone()).await?;

            self.event_log
                .append(LogEntry {
                    session_id: Some(session.session_id.clone()),
                    device_id: device.device_id,
                    event_type: LogCategory::DeviceCheck,
                    level: LogLevel::Info,
                    message: format!("offered pending session at device version {current_version}"),
                    metadata: serde_json::json!({ "current_version": current_version }),
                })
                .await;

            if let Some(batch_id) = &session.batch_id {
                self.batch_controller.update_batch_statistics(batch_id).await?;
            }

            return Ok(Some(session));
        }

        let Some(current_firmware_id) = device.current_firmware_id else {
            return Ok(None);
        };
        let current_firmware = self
            .repository
            .get_firmware_by_id(current_firmware_id)
            .await?;
        let current_parsed = Version::parse(current_version).ok();

        let latest = self
            .repository
            .get_latest_firmware(ReleaseType::Production)
            .await?;
        let Some(latest) = latest else {
            return Ok(None);
        };

        let is_newer = match (&current_parsed, current_firmware.as_ref()) {
            (Some(current), _) => latest.version > *current,
            (None, Some(firmware)) => latest.version > firmware.version,
            (None, None) => true,
        };
        if !is_newer {
            return Ok(None);
        }

        let session = UpdateSession {
            session_id: Uuid::new_v4().to_string(),
            device_id: device.device_id,
            firmware_id: latest.id,
            status: SessionStatus::Acknowledged,
            priority: AD_HOC_PRIORITY,
            timestamps: crate::model::SessionTimestamps {
                scheduled_at: Some(self.clock.now()),
                acknowledged_at: Some(self.clock.now()),
                ..Default::default()
            },
            progress: crate::model::SessionProgress {
                total_bytes: latest.size,
                ..Default::default()
            },
            force_update: false,
            allow_rollback: true,
            retry_count: 0,
            max_retries: 3,
            batch_id: None,
            device_version: Some(current_version.to_string()),
            download_checksum: None,
            error_message: None,
        };
        self.repository.create_session(session.clone()).await?;

        self.event_log
            .append(LogEntry {
                session_id: Some(session.session_id.clone()),
                device_id: device.device_id,
                event_type: LogCategory::AutoUpdate,
                level: LogLevel::Info,
                message: format!("auto-offering {} over {current_version}", latest.version),
                metadata: serde_json::json!({ "latest_version": latest.version.to_string() }),
            })
            .await;

        Ok(Some(session))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{Device, FirmwareRelease};
    use crate::repository::InMemoryRepository;

    async fn setup() -> (Arc<InMemoryRepository>, UpdateAdvisor, i64) {
        let repo = Arc::new(InMemoryRepository::new());
        let device = repo
            .put_device(Device {
                device_id: 0,
                uid: "dev-1".to_string(),
                active: true,
                allow_updates: true,
                current_firmware_id: None,
            })
            .await
            .unwrap();
        let event_log = Arc::new(EventLog::new(repo.clone()));
        let batch_controller = BatchController::new(repo.clone(), event_log.clone());
        let advisor = UpdateAdvisor::new(repo.clone(), event_log, batch_controller);
        (repo, advisor, device.device_id)
    }

    #[tokio::test]
    async fn returns_pending_session_when_one_exists() {
        let (repo, advisor, device_id) = setup().await;
        let firmware = repo
            .create_firmware(FirmwareRelease {
                id: 0,
                file_path: "x".to_string(),
                size: 4096,
                file_hash: "h".to_string(),
                version: Version::parse("1.0.1").unwrap(),
                release_type: ReleaseType::Production,
                valid: true,
                active: true,
                is_test: false,
                test_device_id: None,
                test_passed: false,
                signature: None,
                signature_algorithm: None,
                signed_at: None,
                signed_by: None,
                certificate_id: None,
                notes: None,
            })
            .await
            .unwrap();

        let session = UpdateSession {
            session_id: "s1".to_string(),
            device_id,
            firmware_id: firmware.id,
            status: SessionStatus::Scheduled,
            priority: 5,
            timestamps: crate::model::SessionTimestamps::default(),
            progress: crate::model::SessionProgress::default(),
            force_update: false,
            allow_rollback: true,
            retry_count: 0,
            max_retries: 3,
            batch_id: None,
            device_version: None,
            download_checksum: None,
            error_message: None,
        };
        repo.create_session(session).await.unwrap();

        let offered = advisor
            .check_for_update("dev-1", "1.0.0")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(offered.session_id, "s1");
        assert_eq!(offered.status, SessionStatus::Acknowledged);
    }

    #[tokio::test]
    async fn synthesizes_ad_hoc_session_when_device_is_behind_latest() {
        let (repo, advisor, device_id) = setup().await;
        let old = repo
            .create_firmware(FirmwareRelease {
                id: 0,
                file_path: "x".to_string(),
                size: 10,
                file_hash: "h".to_string(),
                version: Version::parse("1.0.0").unwrap(),
                release_type: ReleaseType::Production,
                valid: true,
                active: true,
                is_test: false,
                test_device_id: None,
                test_passed: false,
                signature: None,
                signature_algorithm: None,
                signed_at: None,
                signed_by: None,
                certificate_id: None,
                notes: None,
            })
            .await
            .unwrap();
        let mut device = repo.find_device_by_id(device_id).await.unwrap().unwrap();
        device.current_firmware_id = Some(old.id);
        repo.update_device(device).await.unwrap();

        repo.create_firmware(FirmwareRelease {
            id: 0,
            file_path: "y".to_string(),
            size: 20,
            file_hash: "h2".to_string(),
            version: Version::parse("1.1.0").unwrap(),
            release_type: ReleaseType::Production,
            valid: true,
            active: true,
            is_test: false,
            test_device_id: None,
            test_passed: false,
            signature: None,
            signature_algorithm: None,
            signed_at: None,
            signed_by: None,
            certificate_id: None,
            notes: None,
        })
        .await
        .unwrap();

        let offered = advisor
            .check_for_update("dev-1", "1.0.0")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(offered.status, SessionStatus::Acknowledged);
        assert_eq!(offered.priority, AD_HOC_PRIORITY);
    }

    #[tokio::test]
    async fn returns_none_when_device_is_current() {
        let (repo, advisor, device_id) = setup().await;
        let firmware = repo
            .create_firmware(FirmwareRelease {
                id: 0,
                file_path: "x".to_string(),
                size: 10,
                file_hash: "h".to_string(),
                version: Version::parse("1.0.0").unwrap(),
                release_type: ReleaseType::Production,
                valid: true,
                active: true,
                is_test: false,
                test_device_id: None,
                test_passed: false,
                signature: None,
                signature_algorithm: None,
                signed_at: None,
                signed_by: None,
                certificate_id: None,
                notes: None,
            })
            .await
            .unwrap();
        let mut device = repo.find_device_by_id(device_id).await.unwrap().unwrap();
        device.current_firmware_id = Some(firmware.id);
        repo.update_device(device).await.unwrap();

        let offered = advisor.check_for_update("dev-1", "1.0.0").await.unwrap();
        assert!(offered.is_none());
    }
}

//! Repository Adapter (component I): translates component queries into
//! store operations.
//!
//! Spec §9 flags the source's "polymorphic repository variants" (runtime
//! interface assertions to pick between repository capabilities) for
//! rearchitecture. Here there is exactly one capability set, expressed as
//! a single object-safe trait — no runtime feature sniffing. The real
//! deployment backs this trait with a relational store (out of scope per
//! spec §1); [`InMemoryRepository`] is the bundled implementation, used by
//! the test suite and suitable for single-node deployments.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use semver::Version;
use std::collections::HashMap;
use std::sync::atomic::{AtomicI64, Ordering};
use tokio::sync::RwLock;

use crate::error::{OtaError, Result};
use crate::model::{
    Device, DeviceLog, FirmwareRelease, ReleaseType, SessionStatus, UpdateBatch, UpdateSession,
};

/// Number of session rows committed per transaction chunk when creating a
/// batch, bounding memory for very large device sets (spec §4.E).
pub const BATCH_INSERT_CHUNK_SIZE: usize = 100;

#[async_trait]
pub trait Repository: Send + Sync {
    // --- Devices --------------------------------------------------------
    async fn find_device_by_id(&self, device_id: i64) -> Result<Option<Device>>;
    async fn find_device_by_uid(&self, uid: &str) -> Result<Option<Device>>;
    async fn update_device(&self, device: Device) -> Result<()>;
    /// Registers a device record. Device lifecycle itself is owned by an
    /// external fleet system per spec §1; this exists so the core and its
    /// tests can seed the collaborator records the core reads.
    async fn put_device(&self, device: Device) -> Result<Device>;

    // --- Firmware ---------------------------------------------------------
    async fn create_firmware(&self, release: FirmwareRelease) -> Result<FirmwareRelease>;
    async fn update_firmware(&self, release: FirmwareRelease) -> Result<()>;
    async fn get_firmware_by_id(&self, id: i64) -> Result<Option<FirmwareRelease>>;
    async fn get_firmware_by_version(
        &self,
        version: &Version,
        release_type: ReleaseType,
    ) -> Result<Option<FirmwareRelease>>;
    async fn list_firmware(&self, release_type: ReleaseType) -> Result<Vec<FirmwareRelease>>;
    /// Ordered by (major desc, minor desc, patch desc), filtered to
    /// `valid ∧ active`.
    async fn get_latest_firmware(
        &self,
        release_type: ReleaseType,
    ) -> Result<Option<FirmwareRelease>>;
    async fn list_valid_firmware(
        &self,
        release_type: ReleaseType,
        active_only: bool,
    ) -> Result<Vec<FirmwareRelease>>;

    // --- Sessions -----------------------------------------------------
    async fn create_session(&self, session: UpdateSession) -> Result<()>;
    async fn update_session(&self, session: UpdateSession) -> Result<()>;
    async fn get_session(&self, session_id: &str) -> Result<Option<UpdateSession>>;
    async fn list_sessions_by_device(
        &self,
        device_id: i64,
        limit: usize,
    ) -> Result<Vec<UpdateSession>>;
    async fn list_sessions_by_batch(&self, batch_id: &str) -> Result<Vec<UpdateSession>>;
    /// Pending sessions ordered `priority desc, created_at asc`.
    async fn get_pending_for_device(&self, device_id: i64) -> Result<Vec<UpdateSession>>;
    async fn get_stuck_sessions(&self, cutoffs: StuckCutoffs) -> Result<Vec<UpdateSession>>;
    /// Cancels the session if it is non-terminal; returns whether it changed.
    async fn cancel_session(&self, session_id: &str, reason: &str) -> Result<bool>;

    // --- Batches ------------------------------------------------------
    async fn create_batch(&self, batch: UpdateBatch, sessions: Vec<UpdateSession>)
        -> Result<()>;
    async fn update_batch(&self, batch: UpdateBatch) -> Result<()>;
    async fn get_batch(&self, batch_id: &str) -> Result<Option<UpdateBatch>>;

    // --- Logs -----------------------------------------------------------
    async fn create_log(&self, log: DeviceLog) -> Result<()>;
    async fn list_logs_by_session(&self, session_id: &str, limit: usize) -> Result<Vec<DeviceLog>>;
    async fn list_logs_by_device(&self, device_id: i64, limit: usize) -> Result<Vec<DeviceLog>>;

    // --- Stats ----------------------------------------------------------
    /// `Stats`: grouped counts over sessions and batches by status
    /// (spec §4.I).
    async fn get_stats(&self) -> Result<RepositoryStats>;
}

/// Grouped counts returned by [`Repository::get_stats`], keyed by each
/// entity's `as_str()` status.
#[derive(Clone, Debug, Default, serde::Serialize)]
pub struct RepositoryStats {
    pub sessions_by_status: HashMap<String, u64>,
    pub batches_by_status: HashMap<String, u64>,
}

/// Per-status cutoff timestamps used by `get_stuck_sessions`, one per
/// non-terminal state that has an entry timestamp (spec §4.G).
#[derive(Clone, Copy, Debug)]
pub struct StuckCutoffs {
    pub acknowledged_before: DateTime<Utc>,
    pub downloading_before: DateTime<Utc>,
    pub verifying_before: DateTime<Utc>,
    pub installing_before: DateTime<Utc>,
}

impl StuckCutoffs {
    pub fn uniform(cutoff: DateTime<Utc>) -> Self {
        Self {
            acknowledged_before: cutoff,
            downloading_before: cutoff,
            verifying_before: cutoff,
            installing_before: cutoff,
        }
    }
}

#[derive(Default)]
struct Inner {
    devices: HashMap<i64, Device>,
    devices_by_uid: HashMap<String, i64>,
    firmware: HashMap<i64, FirmwareRelease>,
    sessions: HashMap<String, UpdateSession>,
    batches: HashMap<String, UpdateBatch>,
    logs: Vec<DeviceLog>,
}

pub struct InMemoryRepository {
    inner: RwLock<Inner>,
    next_device_id: AtomicI64,
    next_firmware_id: AtomicI64,
    next_log_id: AtomicI64,
}

impl Default for InMemoryRepository {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryRepository {
    pub fn new() -> Self {
        Self {
            inner: RwLock::new(Inner::default()),
            next_device_id: AtomicI64::new(1),
            next_firmware_id: AtomicI64::new(1),
            next_log_id: AtomicI64::new(1),
        }
    }

    fn in_state_since(session: &UpdateSession, status: SessionStatus) -> Option<DateTime<Utc>> {
        if session.status != status {
            return None;
        }
        match status {
            SessionStatus::Acknowledged => session.timestamps.acknowledged_at,
            SessionStatus::Downloading => session.timestamps.download_started_at,
            SessionStatus::Verifying => session.timestamps.verification_started_at,
            SessionStatus::Installing => session.timestamps.install_started_at,
            _ => None,
        }
    }
}

#[async_trait]
impl Repository for InMemoryRepository {
    async fn find_device_by_id(&self, device_id: i64) -> Result<Option<Device>> {
        Ok(self.inner.read().await.devices.get(&device_id).cloned())
    }

    async fn find_device_by_uid(&self, uid: &str) -> Result<Option<Device>> {
        let inner = self.inner.read().await;
        Ok(inner
            .devices_by_uid
            .get(uid)
            .and_then(|id| inner.devices.get(id))
            .cloned())
    }

    async fn update_device(&self, device: Device) -> Result<()> {
        let mut inner = self.inner.write().await;
        if !inner.devices.contains_key(&device.device_id) {
            return Err(OtaError::NotFound(format!(
                "device {} not found",
                device.device_id
            )));
        }
        inner.devices.insert(device.device_id, device);
        Ok(())
    }

    async fn put_device(&self, mut device: Device) -> Result<Device> {
        let mut inner = self.inner.write().await;
        if device.device_id == 0 {
            device.device_id = self.next_device_id.fetch_add(1, Ordering::Relaxed);
        }
        inner.devices_by_uid.insert(device.uid.clone(), device.device_id);
        inner.devices.insert(device.device_id, device.clone());
        Ok(device)
    }

    async fn create_firmware(&self, mut release: FirmwareRelease) -> Result<FirmwareRelease> {
        let mut inner = self.inner.write().await;
        release.id = self.next_firmware_id.fetch_add(1, Ordering::Relaxed);
        inner.firmware.insert(release.id, release.clone());
        Ok(release)
    }

    async fn update_firmware(&self, release: FirmwareRelease) -> Result<()> {
        let mut inner = self.inner.write().await;
        if !inner.firmware.contains_key(&release.id) {
            return Err(OtaError::NotFound(format!(
                "firmware {} not found",
                release.id
            )));
        }
        inner.firmware.insert(release.id, release);
        Ok(())
    }

    async fn get_firmware_by_id(&self, id: i64) -> Result<Option<FirmwareRelease>> {
        Ok(self.inner.read().await.firmware.get(&id).cloned())
    }

    async fn get_firmware_by_version(
        &self,
        version: &Version,
        release_type: ReleaseType,
    ) -> Result<Option<FirmwareRelease>> {
        let inner = self.inner.read().await;
        Ok(inner
            .firmware
            .values()
            .find(|f| f.release_type == release_type && &f.version == version)
            .cloned())
    }

    async fn list_firmware(&self, release_type: ReleaseType) -> Result<Vec<FirmwareRelease>> {
        let inner = self.inner.read().await;
        Ok(inner
            .firmware
            .values()
            .filter(|f| f.release_type == release_type)
            .cloned()
            .collect())
    }

    async fn get_latest_firmware(
        &self,
        release_type: ReleaseType,
    ) -> Result<Option<FirmwareRelease>> {
        let inner = self.inner.read().await;
        Ok(inner
            .firmware
            .values()
            .filter(|f| f.release_type == release_type && f.is_eligible())
            .max_by(|a, b| a.version.cmp(&b.version))
            .cloned())
    }

    async fn list_valid_firmware(
        &self,
        release_type: ReleaseType,
        active_only: bool,
    ) -> Result<Vec<FirmwareRelease>> {
        let inner = self.inner.read().await;
        Ok(inner
            .firmware
            .values()
            .filter(|f| {
                f.release_type == release_type && f.valid && (!active_only || f.active)
            })
            .cloned()
            .collect())
    }

    async fn create_session(&self, session: UpdateSession) -> Result<()> {
        let mut inner = self.inner.write().await;
        inner.sessions.insert(session.session_id.clone(), session);
        Ok(())
    }

    async fn update_session(&self, session: UpdateSession) -> Result<()> {
        let mut inner = self.inner.write().await;
        if !inner.sessions.contains_key(&session.session_id) {
            return Err(OtaError::NotFound(format!(
                "session {} not found",
                session.session_id
            )));
        }
        inner.sessions.insert(session.session_id.clone(), session);
        Ok(())
    }

    async fn get_session(&self, session_id: &str) -> Result<Option<UpdateSession>> {
        Ok(self.inner.read().await.sessions.get(session_id).cloned())
    }

    async fn list_sessions_by_device(
        &self,
        device_id: i64,
        limit: usize,
    ) -> Result<Vec<UpdateSession>> {
        let inner = self.inner.read().await;
        let mut sessions: Vec<UpdateSession> = inner
            .sessions
            .values()
            .filter(|s| s.device_id == device_id)
            .cloned()
            .collect();
        sessions.sort_by(|a, b| b.created_at().cmp(&a.created_at()));
        sessions.truncate(limit);
        Ok(sessions)
    }

    async fn list_sessions_by_batch(&self, batch_id: &str) -> Result<Vec<UpdateSession>> {
        let inner = self.inner.read().await;
        Ok(inner
            .sessions
            .values()
            .filter(|s| s.batch_id.as_deref() == Some(batch_id))
            .cloned()
            .collect())
    }

    async fn get_pending_for_device(&self, device_id: i64) -> Result<Vec<UpdateSession>> {
        let inner = self.inner.read().await;
        let mut pending: Vec<UpdateSession> = inner
            .sessions
            .values()
            .filter(|s| {
                s.device_id == device_id
                    && matches!(s.status, SessionStatus::Scheduled | SessionStatus::Pending)
            })
            .cloned()
            .collect();
        pending.sort_by(|a, b| {
            b.priority
                .cmp(&a.priority)
                .then(a.created_at().cmp(&b.created_at()))
        });
        Ok(pending)
    }

    async fn get_stuck_sessions(&self, cutoffs: StuckCutoffs) -> Result<Vec<UpdateSession>> {
        let inner = self.inner.read().await;
        Ok(inner
            .sessions
            .values()
            .filter(|s| {
                Self::in_state_since(s, SessionStatus::Acknowledged)
                    .is_some_and(|t| t < cutoffs.acknowledged_before)
                    || Self::in_state_since(s, SessionStatus::Downloading)
                        .is_some_and(|t| t < cutoffs.downloading_before)
                    || Self::in_state_since(s, SessionStatus::Verifying)
                        .is_some_and(|t| t < cutoffs.verifying_before)
                    || Self::in_state_since(s, SessionStatus::Installing)
                        .is_some_and(|t| t < cutoffs.installing_before)
            })
            .cloned()
            .collect())
    }

    async fn cancel_session(&self, session_id: &str, reason: &str) -> Result<bool> {
        let mut inner = self.inner.write().await;
        let Some(session) = inner.sessions.get_mut(session_id) else {
            return Err(OtaError::NotFound(format!("session {session_id} not found")));
        };
        if session.status.is_terminal() {
            return Ok(false);
        }
        session.status = SessionStatus::Cancelled;
        session.error_message = Some(reason.to_string());
        Ok(true)
    }

    async fn create_batch(
        &self,
        batch: UpdateBatch,
        sessions: Vec<UpdateSession>,
    ) -> Result<()> {
        let mut inner = self.inner.write().await;
        inner.batches.insert(batch.batch_id.clone(), batch);
        for chunk in sessions.chunks(BATCH_INSERT_CHUNK_SIZE) {
            for session in chunk {
                inner
                    .sessions
                    .insert(session.session_id.clone(), session.clone());
            }
        }
        Ok(())
    }

    async fn update_batch(&self, batch: UpdateBatch) -> Result<()> {
        let mut inner = self.inner.write().await;
        if !inner.batches.contains_key(&batch.batch_id) {
            return Err(OtaError::NotFound(format!(
                "batch {} not found",
                batch.batch_id
            )));
        }
        inner.batches.insert(batch.batch_id.clone(), batch);
        Ok(())
    }

    async fn get_batch(&self, batch_id: &str) -> Result<Option<UpdateBatch>> {
        Ok(self.inner.read().await.batches.get(batch_id).cloned())
    }

    async fn create_log(&self, mut log: DeviceLog) -> Result<()> {
        let mut inner = self.inner.write().await;
        log.id = self.next_log_id.fetch_add(1, Ordering::Relaxed);
        inner.logs.push(log);
        Ok(())
    }

    async fn list_logs_by_session(&self, session_id: &str, limit: usize) -> Result<Vec<DeviceLog>> {
        let inner = self.inner.read().await;
        let mut logs: Vec<DeviceLog> = inner
            .logs
            .iter()
            .filter(|l| l.session_id.as_deref() == Some(session_id))
            .cloned()
            .collect();
        logs.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        logs.truncate(limit);
        Ok(logs)
    }

    async fn list_logs_by_device(&self, device_id: i64, limit: usize) -> Result<Vec<DeviceLog>> {
        let inner = self.inner.read().await;
        let mut logs: Vec<DeviceLog> = inner
            .logs
            .iter()
            .filter(|l| l.device_id == device_id)
            .cloned()
            .collect();
        logs.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        logs.truncate(limit);
        Ok(logs)
    }

    async fn get_stats(&self) -> Result<RepositoryStats> {
        let inner = self.inner.read().await;
        let mut sessions_by_status = HashMap::new();
        for session in inner.sessions.values() {
            *sessions_by_status
                .entry(session.status.as_str().to_string())
                .or_insert(0u64) += 1;
        }
        let mut batches_by_status = HashMap::new();
        for batch in inner.batches.values() {
            *batches_by_status
                .entry(batch.status.as_str().to_string())
                .or_insert(0u64) += 1;
        }
        Ok(RepositoryStats {
            sessions_by_status,
            batches_by_status,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{SessionProgress, SessionTimestamps};

    fn sample_device(uid: &str) -> Device {
        Device {
            device_id: 0,
            uid: uid.to_string(),
            active: true,
            allow_updates: true,
            current_firmware_id: None,
        }
    }

    #[tokio::test]
    async fn put_device_assigns_id_and_is_findable_by_uid() {
        let repo = InMemoryRepository::new();
        let device = repo.put_device(sample_device("dev-1")).await.unwrap();
        assert_eq!(device.device_id, 1);
        let found = repo.find_device_by_uid("dev-1").await.unwrap().unwrap();
        assert_eq!(found.device_id, device.device_id);
    }

    #[tokio::test]
    async fn cancel_session_refuses_terminal_sessions() {
        let repo = InMemoryRepository::new();
        let session = UpdateSession {
            session_id: "s1".to_string(),
            device_id: 1,
            firmware_id: 1,
            status: SessionStatus::Completed,
            priority: 5,
            timestamps: SessionTimestamps::default(),
            progress: SessionProgress::default(),
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
        let changed = repo.cancel_session("s1", "test").await.unwrap();
        assert!(!changed);
    }

    #[tokio::test]
    async fn get_latest_firmware_ignores_ineligible_releases() {
        let repo = InMemoryRepository::new();
        let base = FirmwareRelease {
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
        };
        let mut newer = base.clone();
        newer.version = Version::parse("2.0.0").unwrap();
        newer.valid = false; // not eligible
        repo.create_firmware(base.clone()).await.unwrap();
        repo.create_firmware(newer).await.unwrap();

        let latest = repo
            .get_latest_firmware(ReleaseType::Production)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(latest.version, Version::parse("1.0.0").unwrap());
    }

    #[tokio::test]
    async fn get_stats_groups_sessions_and_batches_by_status() {
        let repo = InMemoryRepository::new();
        for (id, status) in [("s1", SessionStatus::Completed), ("s2", SessionStatus::Completed), ("s3", SessionStatus::Failed)] {
            repo.create_session(UpdateSession {
                session_id: id.to_string(),
                device_id: 1,
                firmware_id: 1,
                status,
                priority: 5,
                timestamps: SessionTimestamps::default(),
                progress: SessionProgress::default(),
                force_update: false,
                allow_rollback: true,
                retry_count: 0,
                max_retries: 3,
                batch_id: None,
                device_version: None,
                download_checksum: None,
                error_message: None,
            })
            .await
            .unwrap();
        }
        repo.create_batch(
            UpdateBatch {
                batch_id: "b1".to_string(),
                firmware_id: 1,
                status: crate::model::BatchStatus::InProgress,
                scheduled_at: Utc::now(),
                priority: 5,
                force_update: false,
                allow_rollback: true,
                max_concurrent: 10,
                total_count: 0,
                pending_count: 0,
                completed_count: 0,
                failed_count: 0,
                completed_at: None,
            },
            vec![],
        )
        .await
        .unwrap();

        let stats = repo.get_stats().await.unwrap();
        assert_eq!(stats.sessions_by_status.get("completed"), Some(&2));
        assert_eq!(stats.sessions_by_status.get("failed"), Some(&1));
        assert_eq!(stats.batches_by_status.get("in_progress"), Some(&1));
    }
}

//! Core entities: `FirmwareRelease`, `UpdateSession`, `UpdateBatch`,
//! `Device`, `DeviceLog`, `Manifest`, and their status enums.
//!
//! These are plain data, owned by the components named in their
//! "Ownership" note in spec §3: sessions by the Session Engine, batch
//! counters only by the Batch Controller, firmware files by the Firmware
//! Store.

use chrono::{DateTime, Utc};
use semver::Version;
use serde::{Deserialize, Serialize};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReleaseType {
    Production,
    Development,
    Test,
}

impl ReleaseType {
    pub fn as_str(self) -> &'static str {
        match self {
            ReleaseType::Production => "production",
            ReleaseType::Development => "development",
            ReleaseType::Test => "test",
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct FirmwareRelease {
    pub id: i64,
    pub file_path: String,
    pub size: u64,
    pub file_hash: String,
    pub version: Version,
    pub release_type: ReleaseType,
    pub valid: bool,
    pub active: bool,
    pub is_test: bool,
    pub test_device_id: Option<i64>,
    pub test_passed: bool,
    pub signature: Option<String>,
    pub signature_algorithm: Option<String>,
    pub signed_at: Option<DateTime<Utc>>,
    pub signed_by: Option<String>,
    pub certificate_id: Option<String>,
    pub notes: Option<String>,
}

impl FirmwareRelease {
    /// A release is eligible for rollout iff `valid ∧ active` (spec §3).
    pub fn is_eligible(&self) -> bool {
        self.valid && self.active
    }

    /// A test release may be promoted only if `is_test ∧ test_passed`.
    pub fn is_promotable(&self) -> bool {
        self.is_test && self.test_passed
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    Scheduled,
    Pending,
    Acknowledged,
    Downloading,
    Downloaded,
    Verifying,
    Installing,
    Completed,
    Failed,
    Cancelled,
    RolledBack,
}

impl SessionStatus {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            SessionStatus::Completed
                | SessionStatus::Failed
                | SessionStatus::Cancelled
                | SessionStatus::RolledBack
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            SessionStatus::Scheduled => "scheduled",
            SessionStatus::Pending => "pending",
            SessionStatus::Acknowledged => "acknowledged",
            SessionStatus::Downloading => "downloading",
            SessionStatus::Downloaded => "downloaded",
            SessionStatus::Verifying => "verifying",
            SessionStatus::Installing => "installing",
            SessionStatus::Completed => "completed",
            SessionStatus::Failed => "failed",
            SessionStatus::Cancelled => "cancelled",
            SessionStatus::RolledBack => "rolled_back",
        }
    }
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct SessionTimestamps {
    pub scheduled_at: Option<DateTime<Utc>>,
    pub acknowledged_at: Option<DateTime<Utc>>,
    pub download_started_at: Option<DateTime<Utc>>,
    pub download_completed_at: Option<DateTime<Utc>>,
    pub verification_started_at: Option<DateTime<Utc>>,
    pub verification_completed_at: Option<DateTime<Utc>>,
    pub install_started_at: Option<DateTime<Utc>>,
    pub install_completed_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub failed_at: Option<DateTime<Utc>>,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct SessionProgress {
    pub total_bytes: u64,
    pub bytes_downloaded: u64,
    pub chunks_total: u64,
    pub chunks_received: u64,
    pub last_chunk_time: Option<DateTime<Utc>>,
    pub last_chunk_size: u64,
    pub download_speed: f64,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct UpdateSession {
    pub session_id: String,
    pub device_id: i64,
    pub firmware_id: i64,
    pub status: SessionStatus,
    pub priority: u8,
    pub timestamps: SessionTimestamps,
    pub progress: SessionProgress,
    pub force_update: bool,
    pub allow_rollback: bool,
    pub retry_count: u32,
    pub max_retries: u32,
    pub batch_id: Option<String>,
    pub device_version: Option<String>,
    pub download_checksum: Option<String>,
    pub error_message: Option<String>,
}

impl UpdateSession {
    pub fn created_at(&self) -> DateTime<Utc> {
        self.timestamps
            .scheduled_at
            .unwrap_or_else(|| self.timestamps.acknowledged_at.unwrap_or_else(Utc::now))
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BatchStatus {
    Scheduled,
    InProgress,
    Completed,
    Failed,
    Cancelled,
}

impl BatchStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            BatchStatus::Scheduled => "scheduled",
            BatchStatus::InProgress => "in_progress",
            BatchStatus::Completed => "completed",
            BatchStatus::Failed => "failed",
            BatchStatus::Cancelled => "cancelled",
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct UpdateBatch {
    pub batch_id: String,
    pub firmware_id: i64,
    pub status: BatchStatus,
    pub scheduled_at: DateTime<Utc>,
    pub priority: u8,
    pub force_update: bool,
    pub allow_rollback: bool,
    pub max_concurrent: u32,
    pub total_count: u32,
    pub pending_count: u32,
    pub completed_count: u32,
    pub failed_count: u32,
    pub completed_at: Option<DateTime<Utc>>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Device {
    pub device_id: i64,
    pub uid: String,
    pub active: bool,
    pub allow_updates: bool,
    pub current_firmware_id: Option<i64>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogCategory {
    Acknowledge,
    DownloadProgress,
    DownloadComplete,
    VerificationComplete,
    UpdateComplete,
    UpdateFailed,
    ChecksumMismatch,
    BatchCancel,
    RetryUpdate,
    DeviceCheck,
    AutoUpdate,
    Cancel,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogLevel {
    Info,
    Warn,
    Error,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct DeviceLog {
    pub id: i64,
    pub session_id: Option<String>,
    pub device_id: i64,
    pub event_type: LogCategory,
    pub level: LogLevel,
    pub message: String,
    pub metadata: serde_json::Value,
    pub created_at: DateTime<Utc>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Manifest {
    pub manifest_version: u32,
    pub generated_at: DateTime<Utc>,
    pub minimum_version: Option<Version>,
    pub recommended_version: Option<Version>,
    pub releases: Vec<FirmwareRelease>,
    pub signature: Option<String>,
}

impl Manifest {
    /// Canonical string form signed over by the Firmware Store, per spec §6.
    pub fn canonical_signing_string(&self) -> String {
        format!(
            "manifest:{}|min:{}|rec:{}|gen:{}",
            self.manifest_version,
            self.minimum_version
                .as_ref()
                .map(ToString::to_string)
                .unwrap_or_default(),
            self.recommended_version
                .as_ref()
                .map(ToString::to_string)
                .unwrap_or_default(),
            self.generated_at.to_rfc3339(),
        )
    }
}

//! Event Log (component H): appends structured records for every state
//! transition, checksum mismatch, download-progress milestone, and
//! cancellation (spec §4.H).
//!
//! A log-write failure is logged as a warning and otherwise swallowed —
//! spec §7 carves out log-entry writes as one of the two operations
//! allowed to fail silently from the caller's point of view.

use std::sync::Arc;
use tracing::warn;

use crate::clock::{Clock, SystemClock};
use crate::model::{DeviceLog, LogCategory, LogLevel};
use crate::repository::Repository;

pub struct LogEntry {
    pub session_id: Option<String>,
    pub device_id: i64,
    pub event_type: LogCategory,
    pub level: LogLevel,
    pub message: String,
    pub metadata: serde_json::Value,
}

pub struct EventLog {
    repository: Arc<dyn Repository>,
    clock: Arc<dyn Clock>,
}

impl EventLog {
    pub fn new(repository: Arc<dyn Repository>) -> Self {
        Self::with_clock(repository, Arc::new(SystemClock))
    }

    pub fn with_clock(repository: Arc<dyn Repository>, clock: Arc<dyn Clock>) -> Self {
        Self { repository, clock }
    }

    /// Appends `entry`. Never returns an error to the caller; a store
    /// failure here is logged and the operation that triggered it
    /// proceeds regardless.
    pub async fn append(&self, entry: LogEntry) {
        let log = DeviceLog {
            id: 0,
            session_id: entry.session_id.clone(),
            device_id: entry.device_id,
            event_type: entry.event_type,
            level: entry.level,
            message: entry.message.clone(),
            metadata: entry.metadata,
            created_at: self.clock.now(),
        };
        if let Err(err) = self.repository.create_log(log).await {
            warn!(
                session_id = ?entry.session_id,
                device_id = entry.device_id,
                message = %entry.message,
                %err,
                "failed to append event log entry"
            );
        }
    }
}

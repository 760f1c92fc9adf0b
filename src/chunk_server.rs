//! Chunk Server (component C): range reads over firmware files with a
//! bounded, age-ordered byte cache.
//!
//! The cache is a single `parking_lot::Mutex`-guarded map, the same lock
//! choice the template's `FirmwareManager` makes for its own in-process
//! cache, keyed by `"<session_id>:<offset>:<size>"` (spec §4.C). Unlike
//! the template's LRU-by-access-count cache, eviction here is strictly
//! age-based (oldest insertion first), per design note §9's replacement
//! for the source's "random victim" policy.

use parking_lot::Mutex;
use std::collections::VecDeque;
use std::path::Path;
use std::sync::Arc;
use tokio::io::{AsyncReadExt, AsyncSeekExt};
use tracing::{debug, instrument, warn};

use crate::batch_controller::BatchController;
use crate::clock::{Clock, SystemClock};
use crate::error::{OtaError, Result};
use crate::event_log::{EventLog, LogEntry};
use crate::model::{LogCategory, LogLevel, SessionStatus};
use crate::repository::Repository;

/// Default aggregate cache cap (spec §4.C).
pub const DEFAULT_CACHE_MAX_BYTES: u64 = 10 * 1024 * 1024;
/// Evictions proceed until the cache falls back to this fraction of the
/// configured maximum — the "low-water threshold" spec §4.C leaves as a
/// configuration knob.
const LOW_WATER_RATIO: f64 = 0.8;
/// Batch statistics are refreshed this often during an in-progress
/// download, in addition to every terminal/acknowledgment transition
/// (spec §4.E).
const BATCH_REFRESH_CHUNK_INTERVAL: u64 = 20;

struct CacheState {
    entries: std::collections::HashMap<String, Arc<Vec<u8>>>,
    order: VecDeque<String>,
    total_bytes: u64,
    max_bytes: u64,
}

impl CacheState {
    fn new(max_bytes: u64) -> Self {
        Self {
            entries: std::collections::HashMap::new(),
            order: VecDeque::new(),
            total_bytes: 0,
            max_bytes,
        }
    }

    fn get(&self, key: &str) -> Option<Arc<Vec<u8>>> {
        self.entries.get(key).cloned()
    }

    fn insert(&mut self, key: String, bytes: Arc<Vec<u8>>) {
        if self.entries.contains_key(&key) {
            return;
        }
        self.total_bytes += bytes.len() as u64;
        self.order.push_back(key.clone());
        self.entries.insert(key, bytes);
        self.evict_to_low_water();
    }

    fn evict_to_low_water(&mut self) {
        if self.total_bytes <= self.max_bytes {
            return;
        }
        let low_water = (self.max_bytes as f64 * LOW_WATER_RATIO) as u64;
        while self.total_bytes > low_water {
            let Some(oldest) = self.order.pop_front() else {
                break;
            };
            if let Some(bytes) = self.entries.remove(&oldest) {
                self.total_bytes = self.total_bytes.saturating_sub(bytes.len() as u64);
            }
        }
    }
}

pub struct ChunkServer {
    repository: Arc<dyn Repository>,
    event_log: Arc<EventLog>,
    cache: Mutex<CacheState>,
    clock: Arc<dyn Clock>,
    batch_controller: Option<BatchController>,
}

impl ChunkServer {
    pub fn new(repository: Arc<dyn Repository>, event_log: Arc<EventLog>) -> Self {
        Self::with_cache_max_bytes(repository, event_log, DEFAULT_CACHE_MAX_BYTES)
    }

    pub fn with_cache_max_bytes(
        repository: Arc<dyn Repository>,
        event_log: Arc<EventLog>,
        cache_max_bytes: u64,
    ) -> Self {
        Self::with_clock(repository, event_log, cache_max_bytes, Arc::new(SystemClock))
    }

    pub fn with_clock(
        repository: Arc<dyn Repository>,
        event_log: Arc<EventLog>,
        cache_max_bytes: u64,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            repository,
            event_log,
            cache: Mutex::new(CacheState::new(cache_max_bytes)),
            clock,
            batch_controller: None,
        }
    }

    /// Registers the Batch Controller this server notifies every
    /// [`BATCH_REFRESH_CHUNK_INTERVAL`] chunks of an in-progress download
    /// (spec §4.E). `OtaService` wires this once both components exist.
    pub fn with_batch_controller(mut self, batch_controller: BatchController) -> Self {
        self.batch_controller = Some(batch_controller);
        self
    }

    /// Reads `size` bytes (clamped to the file's tail) at `offset` from the
    /// firmware backing `session_id`'s update, updating session progress
    /// and (on the first chunk) transitioning `acknowledged → downloading`.
    #[instrument(skip(self), fields(session_id, offset, size))]
    pub async fn get_chunk(&self, session_id: &str, offset: u64, size: u64) -> Result<Vec<u8>> {
        let mut session = self
            .repository
            .get_session(session_id)
            .await?
            .ok_or_else(|| OtaError::NotFound(format!("session {session_id} not found")))?;

        if !matches!(
            session.status,
            SessionStatus::Acknowledged | SessionStatus::Downloading
        ) {
            return Err(OtaError::InvalidState(format!(
                "session {session_id} is {:?}, cannot serve chunks",
                session.status
            )));
        }

        let firmware = self
            .repository
            .get_firmware_by_id(session.firmware_id)
            .await?
            .ok_or_else(|| OtaError::NotFound(format!("firmware {}", session.firmware_id)))?;

        if offset >= firmware.size {
            return Err(OtaError::OffsetOutOfRange(format!(
                "offset {offset} >= file size {}",
                firmware.size
            )));
        }
        let clamped_size = size.min(firmware.size - offset);

        let cache_key = format!("{session_id}:{offset}:{clamped_size}");
        let cached = { self.cache.lock().get(&cache_key) };

        let bytes = if let Some(bytes) = cached {
            bytes
        } else {
            let bytes = Arc::new(
                read_range(&firmware.file_path, offset, clamped_size)
                    .await
                    .map_err(|_| OtaError::FirmwareFileMissing(firmware.file_path.clone()))?,
            );
            self.cache.lock().insert(cache_key.clone(), Arc::clone(&bytes));
            bytes
        };

        let first_chunk = session.status == SessionStatus::Acknowledged;
        if first_chunk {
            session.status = SessionStatus::Downloading;
            session.timestamps.download_started_at = Some(self.clock.now());
            session.progress.chunks_total =
                (firmware.size + clamped_size - 1) / clamped_size.max(1);
        }

        session.progress.last_chunk_time = Some(self.clock.now());
        session.progress.last_chunk_size = bytes.len() as u64;
        session.progress.bytes_downloaded += bytes.len() as u64;
        session.progress.chunks_received += 1;

        let elapsed = session
            .timestamps
            .download_started_at
            .map(|started| (self.clock.now() - started).num_milliseconds().max(1) as f64 / 1000.0)
            .unwrap_or(1.0);
        session.progress.download_speed = session.progress.bytes_downloaded as f64 / elapsed;

        let chunks_received = session.progress.chunks_received;
        self.repository.update_session(session.clone()).await?;

        let is_final_chunk = session.progress.bytes_downloaded >= firmware.size;
        if chunks_received == 1 || chunks_received % 10 == 0 || is_final_chunk {
            self.event_log
                .append(LogEntry {
                    session_id: Some(session_id.to_string()),
                    device_id: session.device_id,
                    event_type: LogCategory::DownloadProgress,
                    level: LogLevel::Info,
                    message: format!(
                        "chunk {chunks_received}/{} ({} bytes downloaded)",
                        session.progress.chunks_total, session.progress.bytes_downloaded
                    ),
                    metadata: serde_json::json!({
                        "chunk_index": chunks_received,
                        "bytes_downloaded": session.progress.bytes_downloaded,
                    }),
                })
                .await;
        }

        if chunks_received % BATCH_REFRESH_CHUNK_INTERVAL == 0 {
            if let (Some(controller), Some(batch_id)) = (&self.batch_controller, &session.batch_id) {
                if let Err(err) = controller.update_batch_statistics(batch_id).await {
                    warn!(batch_id, %err, "failed to refresh batch statistics");
                }
            }
        }

        debug!(chunks_received, bytes = bytes.len(), "served chunk");
        Ok((*bytes).clone())
    }
}

async fn read_range(path: &str, offset: u64, size: u64) -> std::io::Result<Vec<u8>> {
    let mut file = tokio::fs::File::open(Path::new(path)).await?;
    file.seek(std::io::SeekFrom::Start(offset)).await?;
    let mut buf = vec![0u8; size as usize];
    file.read_exact(&mut buf).await?;
    Ok(buf)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{
        Device, FirmwareRelease, ReleaseType, SessionProgress, SessionTimestamps, UpdateSession,
    };
    use crate::repository::InMemoryRepository;
    use semver::Version;

    async fn seed(repo: &InMemoryRepository, file_path: &str, size: u64) -> (i64, i64) {
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
        let firmware = repo
            .create_firmware(FirmwareRelease {
                id: 0,
                file_path: file_path.to_string(),
                size,
                file_hash: "irrelevant".to_string(),
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
        (device.device_id, firmware.id)
    }

    fn session(session_id: &str, device_id: i64, firmware_id: i64) -> UpdateSession {
        UpdateSession {
            session_id: session_id.to_string(),
            device_id,
            firmware_id,
            status: SessionStatus::Acknowledged,
            priority: 5,
            timestamps: SessionTimestamps::default(),
            progress: SessionProgress::default(),
            force_update: false,
            allow_rollback: true,
            retry_count: 0,
            max_retries: 3,
            batch_id: None,
            device_version: Some("1.0.0".to_string()),
            download_checksum: None,
            error_message: None,
        }
    }

    #[tokio::test]
    async fn first_chunk_transitions_to_downloading_and_tracks_progress() {
        let dir = tempfile::tempdir().unwrap();
        let file_path = dir.path().join("fw.bin");
        tokio::fs::write(&file_path, vec![7u8; 4096]).await.unwrap();

        let repo = Arc::new(InMemoryRepository::new());
        let (device_id, firmware_id) = seed(&repo, file_path.to_str().unwrap(), 4096).await;
        repo.create_session(session("s1", device_id, firmware_id))
            .await
            .unwrap();

        let event_log = Arc::new(EventLog::new(repo.clone()));
        let chunk_server = ChunkServer::new(repo.clone(), event_log);

        let first = chunk_server.get_chunk("s1", 0, 2048).await.unwrap();
        assert_eq!(first.len(), 2048);

        let s = repo.get_session("s1").await.unwrap().unwrap();
        assert_eq!(s.status, SessionStatus::Downloading);
        assert!(s.timestamps.download_started_at.is_some());
        assert_eq!(s.progress.bytes_downloaded, 2048);
        assert_eq!(s.progress.chunks_received, 1);

        let second = chunk_server.get_chunk("s1", 2048, 2048).await.unwrap();
        assert_eq!(second.len(), 2048);
        let s = repo.get_session("s1").await.unwrap().unwrap();
        assert_eq!(s.progress.bytes_downloaded, 4096);
        assert_eq!(s.progress.chunks_received, 2);
    }

    #[tokio::test]
    async fn tail_chunk_is_clamped_to_file_size() {
        let dir = tempfile::tempdir().unwrap();
        let file_path = dir.path().join("fw.bin");
        tokio::fs::write(&file_path, vec![1u8; 100]).await.unwrap();

        let repo = Arc::new(InMemoryRepository::new());
        let (device_id, firmware_id) = seed(&repo, file_path.to_str().unwrap(), 100).await;
        repo.create_session(session("s1", device_id, firmware_id))
            .await
            .unwrap();

        let event_log = Arc::new(EventLog::new(repo.clone()));
        let chunk_server = ChunkServer::new(repo, event_log);

        let chunk = chunk_server.get_chunk("s1", 80, 64).await.unwrap();
        assert_eq!(chunk.len(), 20);
    }

    #[tokio::test]
    async fn offset_beyond_file_size_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let file_path = dir.path().join("fw.bin");
        tokio::fs::write(&file_path, vec![1u8; 100]).await.unwrap();

        let repo = Arc::new(InMemoryRepository::new());
        let (device_id, firmware_id) = seed(&repo, file_path.to_str().unwrap(), 100).await;
        repo.create_session(session("s1", device_id, firmware_id))
            .await
            .unwrap();

        let event_log = Arc::new(EventLog::new(repo.clone()));
        let chunk_server = ChunkServer::new(repo, event_log);

        let err = chunk_server.get_chunk("s1", 200, 10).await.unwrap_err();
        assert!(matches!(err, OtaError::OffsetOutOfRange(_)));
    }

    #[tokio::test]
    async fn rejects_chunk_requests_outside_acknowledged_or_downloading() {
        let dir = tempfile::tempdir().unwrap();
        let file_path = dir.path().join("fw.bin");
        tokio::fs::write(&file_path, vec![1u8; 100]).await.unwrap();

        let repo = Arc::new(InMemoryRepository::new());
        let (device_id, firmware_id) = seed(&repo, file_path.to_str().unwrap(), 100).await;
        let mut s = session("s1", device_id, firmware_id);
        s.status = SessionStatus::Cancelled;
        repo.create_session(s).await.unwrap();

        let event_log = Arc::new(EventLog::new(repo.clone()));
        let chunk_server = ChunkServer::new(repo, event_log);

        let err = chunk_server.get_chunk("s1", 0, 10).await.unwrap_err();
        assert!(matches!(err, OtaError::InvalidState(_)));
    }
}

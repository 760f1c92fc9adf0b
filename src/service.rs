//! `OtaService`: wires the Repository Adapter, Firmware Store, Chunk
//! Server, Session Engine, Batch Controller, Update Advisor, and Health
//! Supervisor into one facade, the way `api::router::AppState` wants a
//! single state value to hand to its handlers.

use std::sync::Arc;

use crate::batch_controller::BatchController;
use crate::chunk_server::{ChunkServer, DEFAULT_CACHE_MAX_BYTES};
use crate::clock::{Clock, SystemClock};
use crate::event_log::EventLog;
use crate::firmware_store::FirmwareStore;
use crate::health_supervisor::HealthSupervisor;
use crate::key_store::KeyStore;
use crate::repository::{InMemoryRepository, Repository};
use crate::session_engine::SessionEngine;
use crate::update_advisor::UpdateAdvisor;

#[derive(Clone)]
pub struct OtaService {
    pub repository: Arc<dyn Repository>,
    pub event_log: Arc<EventLog>,
    pub firmware_store: Arc<FirmwareStore>,
    pub chunk_server: Arc<ChunkServer>,
    pub session_engine: SessionEngine,
    pub batch_controller: BatchController,
    pub update_advisor: Arc<UpdateAdvisor>,
    pub health_supervisor: Arc<HealthSupervisor>,
}

impl OtaService {
    /// Builds the full component graph over the bundled
    /// [`InMemoryRepository`] and a [`KeyStore`] rooted at
    /// `storage_root/keys`.
    pub fn new(storage_root: impl Into<std::path::PathBuf>, cache_max_bytes: u64) -> Self {
        let storage_root = storage_root.into();
        let repository: Arc<dyn Repository> = Arc::new(InMemoryRepository::new());
        Self::with_repository(repository, storage_root, cache_max_bytes)
    }

    pub fn with_repository(
        repository: Arc<dyn Repository>,
        storage_root: impl Into<std::path::PathBuf>,
        cache_max_bytes: u64,
    ) -> Self {
        let clock: Arc<dyn Clock> = Arc::new(SystemClock);
        Self::with_repository_and_clock(repository, storage_root, cache_max_bytes, clock)
    }

    /// Same as [`OtaService::with_repository`] but with an explicit shared
    /// clock, so every component — session timestamps, batch IDs, the
    /// health supervisor's staleness cutoff — reads the time through the
    /// same source.
    pub fn with_repository_and_clock(
        repository: Arc<dyn Repository>,
        storage_root: impl Into<std::path::PathBuf>,
        cache_max_bytes: u64,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let storage_root = storage_root.into();
        let event_log = Arc::new(EventLog::with_clock(repository.clone(), clock.clone()));
        let keys = Arc::new(KeyStore::new(&storage_root));
        let firmware_store = Arc::new(FirmwareStore::with_clock(
            storage_root.join("firmware"),
            repository.clone(),
            keys,
            clock.clone(),
        ));
        let batch_controller =
            BatchController::with_clock(repository.clone(), event_log.clone(), clock.clone());
        let session_engine =
            SessionEngine::with_clock(repository.clone(), event_log.clone(), clock.clone())
                .with_batch_controller(batch_controller.clone());
        let chunk_server = Arc::new(
            ChunkServer::with_clock(
                repository.clone(),
                event_log.clone(),
                cache_max_bytes,
                clock.clone(),
            )
            .with_batch_controller(batch_controller.clone()),
        );
        let update_advisor = Arc::new(UpdateAdvisor::with_clock(
            repository.clone(),
            event_log.clone(),
            batch_controller.clone(),
            clock.clone(),
        ));
        let health_supervisor = Arc::new(HealthSupervisor::with_clock(
            repository.clone(),
            session_engine.clone(),
            clock,
        ));

        Self {
            repository,
            event_log,
            firmware_store,
            chunk_server,
            session_engine,
            batch_controller,
            update_advisor,
            health_supervisor,
        }
    }
}

impl Default for OtaService {
    fn default() -> Self {
        Self::new("./data", DEFAULT_CACHE_MAX_BYTES)
    }
}

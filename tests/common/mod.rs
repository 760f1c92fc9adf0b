//! Shared test fixtures for the orchestrator's integration tests.
//!
//! Builds the component graph directly over `InMemoryRepository`, the way
//! `OtaService::with_repository` wires it for production, but without an
//! HTTP server in front of it.

#![allow(dead_code)]

use std::sync::Arc;

use axum::body::to_bytes;
use semver::Version;
use serde_json::Value;

use ota_orchestrator::batch_controller::BatchController;
use ota_orchestrator::event_log::EventLog;
use ota_orchestrator::firmware_store::FirmwareStore;
use ota_orchestrator::health_supervisor::HealthSupervisor;
use ota_orchestrator::key_store::KeyStore;
use ota_orchestrator::model::{Device, FirmwareRelease, ReleaseType};
use ota_orchestrator::repository::{InMemoryRepository, Repository};
use ota_orchestrator::service::OtaService;
use ota_orchestrator::session_engine::SessionEngine;
use ota_orchestrator::update_advisor::UpdateAdvisor;

pub struct Harness {
    pub repo: Arc<InMemoryRepository>,
    pub repository: Arc<dyn Repository>,
    pub event_log: Arc<EventLog>,
    pub firmware_store: FirmwareStore,
    pub session_engine: SessionEngine,
    pub batch_controller: BatchController,
    pub update_advisor: UpdateAdvisor,
    pub health_supervisor: HealthSupervisor,
}

pub fn harness(dir: &std::path::Path) -> Harness {
    let repo = Arc::new(InMemoryRepository::new());
    let repository: Arc<dyn Repository> = repo.clone();
    let event_log = Arc::new(EventLog::new(repository.clone()));
    let keys = Arc::new(KeyStore::new(dir));
    let firmware_store = FirmwareStore::new(dir.join("firmware"), repository.clone(), keys);
    let session_engine = SessionEngine::new(repository.clone(), event_log.clone());
    let batch_controller = BatchController::new(repository.clone(), event_log.clone());
    let update_advisor = UpdateAdvisor::new(
        repository.clone(),
        event_log.clone(),
        batch_controller.clone(),
    );
    let health_supervisor = HealthSupervisor::new(repository.clone(), session_engine.clone());
    Harness {
        repo,
        repository,
        event_log,
        firmware_store,
        session_engine,
        batch_controller,
        update_advisor,
        health_supervisor,
    }
}

/// A `FirmwareRelease` with sane defaults; override fields as each test needs.
pub fn blank_release(version: &str, release_type: ReleaseType, size: u64) -> FirmwareRelease {
    FirmwareRelease {
        id: 0,
        file_path: "x".to_string(),
        size,
        file_hash: "h".to_string(),
        version: Version::parse(version).unwrap(),
        release_type,
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
    }
}

pub async fn seed_device(
    repo: &InMemoryRepository,
    uid: &str,
    current_firmware_id: Option<i64>,
) -> i64 {
    let device = repo
        .put_device(Device {
            device_id: 0,
            uid: uid.to_string(),
            active: true,
            allow_updates: true,
            current_firmware_id,
        })
        .await
        .unwrap();
    device.device_id
}

/// Builds an `OtaService` behind a fresh temp directory, for HTTP-level tests.
pub fn new_service(dir: &std::path::Path) -> Arc<OtaService> {
    Arc::new(OtaService::new(dir.to_path_buf(), 10 * 1024 * 1024))
}

pub async fn body_json(response: axum::response::Response) -> Value {
    let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
    serde_json::from_slice(&bytes).unwrap()
}

//! Device-facing and operator-facing HTTP handlers (spec §6's "External
//! Interfaces" contract; the HTTP adapter itself is explicitly out of
//! scope per spec §1 — this is a thin translation layer over the core
//! components, kept for parity with the template's own `endpoints.rs`).

use axum::{
    extract::{Path, Query, State},
    http::{HeaderMap, HeaderValue, StatusCode},
    response::IntoResponse,
    Json,
};
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::api::router::AppState;
use crate::error::OtaError;
use crate::model::ReleaseType;

/// Server-side clamp on a single chunk request (spec §6).
const MAX_CHUNK_SIZE: u64 = 1024 * 1024;

fn error_status(err: &OtaError) -> StatusCode {
    match err {
        OtaError::NotFound(_) => StatusCode::NOT_FOUND,
        OtaError::InvalidState(_)
        | OtaError::InvalidVersion(_)
        | OtaError::FirmwareNotEligible(_)
        | OtaError::DeviceNotEligible(_)
        | OtaError::OffsetOutOfRange(_) => StatusCode::BAD_REQUEST,
        OtaError::RetryExhausted(_) | OtaError::ConcurrencyLimitReached(_) => {
            StatusCode::CONFLICT
        }
        OtaError::IntegrityFailure(_) | OtaError::FirmwareFileMissing(_) => {
            StatusCode::UNPROCESSABLE_ENTITY
        }
        OtaError::IoError(_) | OtaError::StoreError(_) => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

fn error_response(err: OtaError) -> (StatusCode, Json<ErrorBody>) {
    let status = error_status(&err);
    (status, Json(ErrorBody { error: err.to_string() }))
}

#[derive(Serialize)]
struct ErrorBody {
    error: String,
}

pub async fn health_handler() -> impl IntoResponse {
    StatusCode::OK
}

#[derive(Deserialize)]
pub struct CheckUpdateQuery {
    device_uid: String,
    current_version: String,
}

#[derive(Serialize)]
pub struct CheckUpdateResponse {
    available: bool,
    session_id: Option<String>,
    firmware_id: Option<i64>,
    version: Option<String>,
    size: Option<u64>,
    checksum: Option<String>,
    force_update: Option<bool>,
}

pub async fn check_update_handler(
    State(state): State<AppState>,
    Query(query): Query<CheckUpdateQuery>,
) -> impl IntoResponse {
    let result = state
        .service
        .update_advisor
        .check_for_update(&query.device_uid, &query.current_version)
        .await;

    match result {
        Ok(Some(session)) => {
            let firmware = state
                .service
                .repository
                .get_firmware_by_id(session.firmware_id)
                .await
                .ok()
                .flatten();
            (
                StatusCode::OK,
                Json(CheckUpdateResponse {
                    available: true,
                    session_id: Some(session.session_id),
                    firmware_id: Some(session.firmware_id),
                    version: firmware.as_ref().map(|f| f.version.to_string()),
                    size: firmware.as_ref().map(|f| f.size),
                    checksum: firmware.as_ref().map(|f| f.file_hash.clone()),
                    force_update: Some(session.force_update),
                }),
            )
                .into_response()
        }
        Ok(None) => (
            StatusCode::OK,
            Json(CheckUpdateResponse {
                available: false,
                session_id: None,
                firmware_id: None,
                version: None,
                size: None,
                checksum: None,
                force_update: None,
            }),
        )
            .into_response(),
        Err(err) => error_response(err).into_response(),
    }
}

#[derive(Deserialize)]
pub struct AcknowledgeRequest {
    session_id: String,
    device_version: String,
    accept: bool,
}

pub async fn acknowledge_handler(
    State(state): State<AppState>,
    Json(body): Json<AcknowledgeRequest>,
) -> impl IntoResponse {
    if !body.accept {
        return match state
            .service
            .session_engine
            .cancel(&body.session_id, "device declined update")
            .await
        {
            Ok(_) => StatusCode::OK.into_response(),
            Err(err) => {
                warn!(session_id = %body.session_id, %err, "failed to cancel declined session");
                error_response(err).into_response()
            }
        };
    }

    match state
        .service
        .session_engine
        .acknowledge(&body.session_id, &body.device_version)
        .await
    {
        Ok(_) => StatusCode::OK.into_response(),
        Err(err) => error_response(err).into_response(),
    }
}

#[derive(Deserialize)]
pub struct ChunkQuery {
    session_id: String,
    chunk_index: u64,
    chunk_size: u64,
}

pub async fn chunk_handler(
    State(state): State<AppState>,
    Query(query): Query<ChunkQuery>,
) -> impl IntoResponse {
    let clamped_size = query.chunk_size.min(MAX_CHUNK_SIZE);
    let offset = query.chunk_index * clamped_size;

    match state
        .service
        .chunk_server
        .get_chunk(&query.session_id, offset, clamped_size)
        .await
    {
        Ok(bytes) => {
            let session = state
                .service
                .repository
                .get_session(&query.session_id)
                .await
                .ok()
                .flatten();
            let mut headers = HeaderMap::new();
            headers.insert(
                "X-Chunk-Index",
                HeaderValue::from_str(&query.chunk_index.to_string()).unwrap(),
            );
            headers.insert(
                "X-Chunk-Size",
                HeaderValue::from_str(&bytes.len().to_string()).unwrap(),
            );
            if let Some(session) = &session {
                headers.insert(
                    "X-Total-Chunks",
                    HeaderValue::from_str(&session.progress.chunks_total.to_string()).unwrap(),
                );
                headers.insert(
                    "X-Total-Size",
                    HeaderValue::from_str(&session.progress.total_bytes.to_string()).unwrap(),
                );
            }
            (StatusCode::OK, headers, Bytes::from(bytes)).into_response()
        }
        Err(err) => error_response(err).into_response(),
    }
}

#[derive(Deserialize)]
pub struct DownloadCompleteRequest {
    session_id: String,
    checksum: String,
}

pub async fn download_complete_handler(
    State(state): State<AppState>,
    Json(body): Json<DownloadCompleteRequest>,
) -> impl IntoResponse {
    match state
        .service
        .session_engine
        .complete_download(&body.session_id, &body.checksum)
        .await
    {
        Ok(_) => StatusCode::OK.into_response(),
        Err(err) => error_response(err).into_response(),
    }
}

#[derive(Deserialize)]
pub struct FlashCompleteRequest {
    session_id: String,
    success: bool,
    #[serde(default)]
    error_message: Option<String>,
    #[serde(default)]
    new_version: Option<String>,
}

pub async fn flash_complete_handler(
    State(state): State<AppState>,
    Json(body): Json<FlashCompleteRequest>,
) -> impl IntoResponse {
    match state
        .service
        .session_engine
        .complete_update(&body.session_id, body.success, body.error_message, body.new_version)
        .await
    {
        Ok(_) => StatusCode::OK.into_response(),
        Err(err) => error_response(err).into_response(),
    }
}

#[derive(Deserialize)]
pub struct UploadQuery {
    filename: String,
    release_type: ReleaseType,
    version: String,
    #[serde(default)]
    is_test: bool,
    #[serde(default)]
    test_device_id: Option<i64>,
    #[serde(default)]
    notes: Option<String>,
}

pub async fn upload_firmware_handler(
    State(state): State<AppState>,
    Query(query): Query<UploadQuery>,
    body: Bytes,
) -> impl IntoResponse {
    let cursor = std::io::Cursor::new(body.to_vec());
    match state
        .service
        .firmware_store
        .upload(
            cursor,
            &query.filename,
            query.release_type,
            &query.version,
            query.is_test,
            query.test_device_id,
            query.notes,
        )
        .await
    {
        Ok(release) => (StatusCode::CREATED, Json(release)).into_response(),
        Err(err) => error_response(err).into_response(),
    }
}

pub async fn validate_firmware_handler(
    State(state): State<AppState>,
    Path(id): Path<i64>,
) -> impl IntoResponse {
    match state.service.firmware_store.validate(id).await {
        Ok(validation) => (
            StatusCode::OK,
            Json(serde_json::json!({ "passed": validation.passed() })),
        )
            .into_response(),
        Err(err) => error_response(err).into_response(),
    }
}

pub async fn sign_firmware_handler(
    State(state): State<AppState>,
    Path(id): Path<i64>,
) -> impl IntoResponse {
    match state.service.firmware_store.sign(id, None).await {
        Ok(release) => (StatusCode::OK, Json(release)).into_response(),
        Err(err) => error_response(err).into_response(),
    }
}

pub async fn promote_firmware_handler(
    State(state): State<AppState>,
    Path(id): Path<i64>,
) -> impl IntoResponse {
    match state
        .service
        .firmware_store
        .promote_test_to_production(id)
        .await
    {
        Ok(release) => (StatusCode::OK, Json(release)).into_response(),
        Err(err) => error_response(err).into_response(),
    }
}

pub async fn manifest_handler(
    State(state): State<AppState>,
    Path(release_type): Path<ReleaseType>,
) -> impl IntoResponse {
    match state.service.firmware_store.generate_manifest(release_type).await {
        Ok(manifest) => (StatusCode::OK, Json(manifest)).into_response(),
        Err(err) => error_response(err).into_response(),
    }
}

#[derive(Deserialize)]
pub struct CreateBatchRequest {
    firmware_id: i64,
    device_ids: Vec<i64>,
    priority: u8,
    #[serde(default)]
    force_update: bool,
    #[serde(default)]
    allow_rollback: bool,
    #[serde(default)]
    max_concurrent: Option<u32>,
}

pub async fn create_batch_handler(
    State(state): State<AppState>,
    Json(body): Json<CreateBatchRequest>,
) -> impl IntoResponse {
    match state
        .service
        .batch_controller
        .create_batch(
            body.firmware_id,
            &body.device_ids,
            body.priority,
            body.force_update,
            body.allow_rollback,
            body.max_concurrent,
        )
        .await
    {
        Ok(batch) => (StatusCode::CREATED, Json(batch)).into_response(),
        Err(err) => error_response(err).into_response(),
    }
}

pub async fn get_batch_handler(
    State(state): State<AppState>,
    Path(batch_id): Path<String>,
) -> impl IntoResponse {
    match state.service.repository.get_batch(&batch_id).await {
        Ok(Some(batch)) => (StatusCode::OK, Json(batch)).into_response(),
        Ok(None) => {
            error_response(OtaError::NotFound(format!("batch {batch_id}"))).into_response()
        }
        Err(err) => error_response(err).into_response(),
    }
}

pub async fn cancel_batch_handler(
    State(state): State<AppState>,
    Path(batch_id): Path<String>,
) -> impl IntoResponse {
    match state.service.batch_controller.cancel_batch(&batch_id).await {
        Ok(batch) => (StatusCode::OK, Json(batch)).into_response(),
        Err(err) => error_response(err).into_response(),
    }
}

pub async fn stuck_updates_handler(
    State(state): State<AppState>,
    Query(query): Query<StuckQuery>,
) -> impl IntoResponse {
    match state
        .service
        .health_supervisor
        .get_stuck_updates(query.threshold_minutes)
        .await
    {
        Ok(sessions) => (StatusCode::OK, Json(sessions)).into_response(),
        Err(err) => error_response(err).into_response(),
    }
}

#[derive(Deserialize)]
pub struct StuckQuery {
    threshold_minutes: i64,
}

pub async fn stats_handler(State(state): State<AppState>) -> impl IntoResponse {
    match state.service.repository.get_stats().await {
        Ok(stats) => (StatusCode::OK, Json(stats)).into_response(),
        Err(err) => error_response(err).into_response(),
    }
}

pub async fn retry_session_handler(
    State(state): State<AppState>,
    Path(session_id): Path<String>,
) -> impl IntoResponse {
    match state
        .service
        .health_supervisor
        .retry_failed_update(&session_id)
        .await
    {
        Ok(session) => (StatusCode::OK, Json(session)).into_response(),
        Err(err) => error_response(err).into_response(),
    }
}


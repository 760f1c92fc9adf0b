use axum::{
    extract::FromRef,
    middleware,
    routing::{get, post},
    Router,
};
use std::sync::Arc;
use tower_http::trace::TraceLayer;

use crate::api::endpoints::{
    acknowledge_handler, cancel_batch_handler, check_update_handler, chunk_handler,
    create_batch_handler, download_complete_handler, flash_complete_handler, get_batch_handler,
    health_handler, manifest_handler, promote_firmware_handler, retry_session_handler,
    sign_firmware_handler, stats_handler, stuck_updates_handler, upload_firmware_handler,
    validate_firmware_handler,
};
use crate::metrics::middleware::track_metrics;
use crate::service::OtaService;

#[derive(Clone)]
pub struct AppState {
    pub service: Arc<OtaService>,
}

impl FromRef<AppState> for Arc<OtaService> {
    fn from_ref(app_state: &AppState) -> Self {
        app_state.service.clone()
    }
}

/// Builds the device-facing and operator-facing API router over a shared
/// [`OtaService`], mirroring the template's own `api_router`/`AppState`/
/// `FromRef` pattern.
pub fn api_router(service: Arc<OtaService>) -> Router {
    let app_state = AppState { service };

    Router::new()
        .route("/health", get(health_handler))
        .route("/devices/check-update", get(check_update_handler))
        .route("/devices/acknowledge", post(acknowledge_handler))
        .route("/devices/chunk", get(chunk_handler))
        .route("/devices/download-complete", post(download_complete_handler))
        .route("/devices/flash-complete", post(flash_complete_handler))
        .route("/firmware", post(upload_firmware_handler))
        .route("/firmware/{id}/validate", post(validate_firmware_handler))
        .route("/firmware/{id}/sign", post(sign_firmware_handler))
        .route("/firmware/{id}/promote", post(promote_firmware_handler))
        .route("/manifests/{release_type}", get(manifest_handler))
        .route("/batches", post(create_batch_handler))
        .route("/batches/{batch_id}", get(get_batch_handler))
        .route("/batches/{batch_id}/cancel", post(cancel_batch_handler))
        .route("/stats", get(stats_handler))
        .route("/sessions/stuck", get(stuck_updates_handler))
        .route("/sessions/{session_id}/retry", post(retry_session_handler))
        .layer(middleware::from_fn(track_metrics))
        .with_state(app_state)
        .layer(TraceLayer::new_for_http())
}

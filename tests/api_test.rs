//! HTTP adapter tests driven through the router with `tower::ServiceExt::oneshot`,
//! exercising the device- and operator-facing contracts end to end.

mod common;

use axum::body::Body;
use axum::http::{Request, StatusCode};
use serde_json::json;
use tower::ServiceExt;

use ota_orchestrator::api::router::api_router;
use ota_orchestrator::model::Device;
use ota_orchestrator::repository::Repository;

use common::{body_json, new_service};

#[tokio::test]
async fn health_endpoint_returns_ok() {
    let dir = tempfile::tempdir().unwrap();
    let router = api_router(new_service(dir.path()));

    let response = router
        .oneshot(
            Request::builder()
                .uri("/health")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
}

#[tokio::test]
async fn upload_validate_and_check_update_flow() {
    let dir = tempfile::tempdir().unwrap();
    let service = new_service(dir.path());

    service
        .repository
        .put_device(Device {
            device_id: 0,
            uid: "device-http".to_string(),
            active: true,
            allow_updates: true,
            current_firmware_id: None,
        })
        .await
        .unwrap();

    let router = api_router(service.clone());

    let upload_response = router
        .clone()
        .oneshot(
            Request::builder()
                .method("POST")
                .uri("/firmware?filename=fw.bin&release_type=production&version=1.0.0")
                .header("content-type", "application/octet-stream")
                .body(Body::from(vec![0x11u8; 256]))
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(upload_response.status(), StatusCode::CREATED);
    let uploaded = body_json(upload_response).await;
    let firmware_id = uploaded["id"].as_i64().unwrap();
    assert_eq!(uploaded["valid"], json!(false));

    let validate_response = router
        .clone()
        .oneshot(
            Request::builder()
                .method("POST")
                .uri(format!("/firmware/{firmware_id}/validate"))
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(validate_response.status(), StatusCode::OK);
    let validation = body_json(validate_response).await;
    assert_eq!(validation["passed"], json!(true));

    let mut release = service
        .repository
        .get_firmware_by_id(firmware_id)
        .await
        .unwrap()
        .unwrap();
    release.active = true;
    service.repository.update_firmware(release).await.unwrap();

    let check_response = router
        .clone()
        .oneshot(
            Request::builder()
                .uri("/devices/check-update?device_uid=device-http&current_version=0.9.0")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(check_response.status(), StatusCode::OK);
    let offer = body_json(check_response).await;
    assert_eq!(offer["available"], json!(true));
    assert_eq!(offer["firmware_id"], json!(firmware_id));
}

#[tokio::test]
async fn create_and_fetch_batch() {
    let dir = tempfile::tempdir().unwrap();
    let service = new_service(dir.path());

    let device_a = service
        .repository
        .put_device(Device {
            device_id: 0,
            uid: "batch-dev-a".to_string(),
            active: true,
            allow_updates: true,
            current_firmware_id: None,
        })
        .await
        .unwrap();
    let device_b = service
        .repository
        .put_device(Device {
            device_id: 0,
            uid: "batch-dev-b".to_string(),
            active: true,
            allow_updates: true,
            current_firmware_id: None,
        })
        .await
        .unwrap();

    let router = api_router(service.clone());

    let upload_response = router
        .clone()
        .oneshot(
            Request::builder()
                .method("POST")
                .uri("/firmware?filename=fw.bin&release_type=production&version=2.0.0")
                .body(Body::from(vec![0x22u8; 64]))
                .unwrap(),
        )
        .await
        .unwrap();
    let uploaded = body_json(upload_response).await;
    let firmware_id = uploaded["id"].as_i64().unwrap();

    let mut release = service
        .repository
        .get_firmware_by_id(firmware_id)
        .await
        .unwrap()
        .unwrap();
    release.valid = true;
    release.active = true;
    service.repository.update_firmware(release).await.unwrap();

    let create_response = router
        .clone()
        .oneshot(
            Request::builder()
                .method("POST")
                .uri("/batches")
                .header("content-type", "application/json")
                .body(Body::from(
                    json!({
                        "firmware_id": firmware_id,
                        "device_ids": [device_a.device_id, device_b.device_id],
                        "priority": 5,
                        "force_update": false,
                        "allow_rollback": true,
                    })
                    .to_string(),
                ))
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(create_response.status(), StatusCode::CREATED);
    let batch = body_json(create_response).await;
    let batch_id = batch["batch_id"].as_str().unwrap().to_string();
    assert_eq!(batch["total_count"], json!(2));

    let get_response = router
        .oneshot(
            Request::builder()
                .uri(format!("/batches/{batch_id}"))
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(get_response.status(), StatusCode::OK);
    let fetched = body_json(get_response).await;
    assert_eq!(fetched["batch_id"], json!(batch_id));
}

#[tokio::test]
async fn retry_unknown_session_returns_not_found() {
    let dir = tempfile::tempdir().unwrap();
    let router = api_router(new_service(dir.path()));

    let response = router
        .oneshot(
            Request::builder()
                .method("POST")
                .uri("/sessions/does-not-exist/retry")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
}

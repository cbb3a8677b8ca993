mod common;

use std::sync::Arc;

use axum::body::Body;
use axum::http::{Request, StatusCode};
use axum::Router;
use common::*;
use serde_json::Value;
use signage_player::backend::memory::MemoryBackend;
use signage_player::http;
use tower::ServiceExt;

async fn call(app: &Router, method: &str, uri: &str) -> (StatusCode, Value) {
    let response = app
        .clone()
        .oneshot(
            Request::builder()
                .method(method)
                .uri(uri)
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    let status = response.status();
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    let body = if bytes.is_empty() {
        Value::Null
    } else {
        serde_json::from_slice(&bytes).unwrap()
    };
    (status, body)
}

fn setup() -> (Harness, Router) {
    let backend = Arc::new(MemoryBackend::new());
    backend.register_device(CODE, DEVICE, "Lobby screen");
    backend.set_playlist(DEVICE, vec![lapsed("A", "image", 0), lapsed("B", "video", 1)]);
    let h = Harness::start(backend, None);
    let app = http::router(h.status.clone(), h.tx.clone());
    (h, app)
}

#[tokio::test(start_paused = true)]
async fn test_status_reports_unpaired_player() {
    let (_h, app) = setup();
    settle().await;
    let (status, body) = call(&app, "GET", "/api/status").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["connection"], "unpaired");
    assert_eq!(body["status"], "disconnected");
    assert_eq!(body["playback"], "idle");
    assert!(body["device"].is_null());
}

#[tokio::test(start_paused = true)]
async fn test_pair_endpoint_maps_errors_to_status_codes() {
    let (_h, app) = setup();

    let (status, body) = call(&app, "POST", "/api/pair/abc").await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["kind"], "invalid_code_format");

    let (status, body) = call(&app, "POST", "/api/pair/QQQQQQ").await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body["kind"], "code_not_found");

    let (status, body) = call(&app, "POST", "/api/pair/ab12cd").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["device_id"], DEVICE);
    assert_eq!(body["device_name"], "Lobby screen");

    let (status, body) = call(&app, "POST", "/api/pair/AB12CD").await;
    assert_eq!(status, StatusCode::CONFLICT);
    assert_eq!(body["kind"], "already_paired");

    settle().await;
    let (_, body) = call(&app, "GET", "/api/status").await;
    assert_eq!(body["connection"], "connected");
    assert_eq!(body["device"]["device_name"], "Lobby screen");
    assert_eq!(body["now_showing"]["item_id"], "A");
}

#[tokio::test(start_paused = true)]
async fn test_stop_resume_and_visibility() {
    let (h, app) = setup();
    h.pair(CODE).await.unwrap();

    let (status, _) = call(&app, "POST", "/api/stop").await;
    assert_eq!(status, StatusCode::ACCEPTED);
    settle().await;
    let (_, body) = call(&app, "GET", "/api/status").await;
    assert_eq!(body["playback"], "stopped");
    assert_eq!(h.surface.count(&Call::Halt), 1);

    let (status, _) = call(&app, "POST", "/api/resume").await;
    assert_eq!(status, StatusCode::ACCEPTED);
    settle().await;
    let (_, body) = call(&app, "GET", "/api/status").await;
    assert_eq!(body["playback"], "playing");

    let (status, _) = call(&app, "POST", "/api/visibility/sideways").await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    let (status, _) = call(&app, "POST", "/api/visibility/hidden").await;
    assert_eq!(status, StatusCode::ACCEPTED);
    settle().await;
    let (_, body) = call(&app, "GET", "/api/status").await;
    assert_eq!(body["playback"], "paused");
}

#[tokio::test(start_paused = true)]
async fn test_repair_endpoint() {
    let (h, app) = setup();
    h.pair(CODE).await.unwrap();

    let (status, _) = call(&app, "POST", "/api/repair").await;
    assert_eq!(status, StatusCode::OK);
    settle().await;
    let (_, body) = call(&app, "GET", "/api/status").await;
    assert_eq!(body["connection"], "unpaired");
    assert_eq!(body["playlist_len"], 0);
}

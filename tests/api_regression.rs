//! API surface regression tests: snapshot endpoints, command injection,
//! validation failures, and the settings round-trip, all driven through the
//! router with `tower::ServiceExt::oneshot`.

use std::sync::Arc;
use std::time::Instant;

use axum::body::Body;
use axum::http::{Request, StatusCode};
use tokio_util::sync::CancellationToken;
use tower::ServiceExt;

use aegis_evac::api::{create_app, ws::ClientRegistry, ApiState};
use aegis_evac::config::{self, SystemConfig};
use aegis_evac::control::ControlEngine;
use aegis_evac::fleet::FleetManager;
use aegis_evac::serial::{CommandFrame, CommandSink};
use aegis_evac::state::StateStore;
use aegis_evac::storage::Storage;
use aegis_evac::types::AlertState;
use aegis_evac::vision::{detector::NullDetector, VisionPipeline};

struct NullSink;

impl CommandSink for NullSink {
    fn send(&self, _frame: CommandFrame) -> bool {
        true
    }
}

async fn test_state() -> (tempfile::TempDir, ApiState) {
    let dir = tempfile::tempdir().unwrap();
    let store = Arc::new(StateStore::new());
    let fleet = Arc::new(FleetManager::new(Arc::clone(&store)));
    let cancel = CancellationToken::new();
    let settings = config::shared(SystemConfig::default());
    let vision = Arc::new(VisionPipeline::new(
        Arc::clone(&store),
        Arc::clone(&fleet),
        Box::new(NullDetector),
        Arc::clone(&settings),
        cancel.clone(),
    ));
    let storage = Storage::open(&dir.path().join("api.db")).await.unwrap();
    let control = ControlEngine::new(Arc::clone(&store), Arc::new(NullSink), cancel.clone());

    let state = ApiState {
        store,
        control,
        fleet,
        vision,
        storage,
        settings,
        clients: ClientRegistry::new(),
        config_path: dir.path().join("config.json"),
        started_at: Instant::now(),
        cancel,
    };
    (dir, state)
}

async fn get(app: &axum::Router, uri: &str) -> (StatusCode, serde_json::Value) {
    let response = app
        .clone()
        .oneshot(Request::builder().uri(uri).body(Body::empty()).unwrap())
        .await
        .unwrap();
    let status = response.status();
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    let json = serde_json::from_slice(&bytes).unwrap_or(serde_json::Value::Null);
    (status, json)
}

async fn post(app: &axum::Router, uri: &str, body: &str) -> (StatusCode, serde_json::Value) {
    let response = app
        .clone()
        .oneshot(
            Request::builder()
                .method("POST")
                .uri(uri)
                .header("content-type", "application/json")
                .body(Body::from(body.to_string()))
                .unwrap(),
        )
        .await
        .unwrap();
    let status = response.status();
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    let json = serde_json::from_slice(&bytes).unwrap_or(serde_json::Value::Null);
    (status, json)
}

#[tokio::test]
async fn status_reports_core_counters() {
    let (_dir, state) = test_state().await;
    let app = create_app(state);

    let (status, body) = get(&app, "/api/status").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "ok");
    assert_eq!(body["alert"]["state"], "SAFE");
    assert_eq!(body["workers"], 0);
    assert_eq!(body["dropped_events"], 0);
    assert_eq!(body["persistence_failures"], 0);
}

#[tokio::test]
async fn alert_set_and_read_back() {
    let (_dir, state) = test_state().await;
    let app = create_app(state);

    let (status, body) = post(&app, "/api/alert", r#"{"alert":3,"reason":"drill"}"#).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["alert"], "DANGER");

    let (_, alert) = get(&app, "/api/alert").await;
    assert_eq!(alert["value"], 3);

    let (_, history) = get(&app, "/api/alerts/history").await;
    assert_eq!(history[0]["reason"], "drill");
}

#[tokio::test]
async fn out_of_range_alert_is_rejected_without_state_change() {
    let (_dir, state) = test_state().await;
    let store = Arc::clone(&state.store);
    let app = create_app(state);

    let (status, body) = post(&app, "/api/alert", r#"{"alert":9}"#).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["error"]["code"], "BAD_REQUEST");
    assert_eq!(store.alert(), AlertState::Safe);
}

#[tokio::test]
async fn evacuate_and_safe_round_trip() {
    let (_dir, state) = test_state().await;
    let store = Arc::clone(&state.store);
    let app = create_app(state);

    let (status, _) = post(&app, "/api/evacuate", r#"{"exit_zone":2}"#).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(store.alert(), AlertState::Evacuate);

    let (status, _) = post(&app, "/api/safe", "{}").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(store.alert(), AlertState::Safe);
}

#[tokio::test]
async fn verify_code_accepts_only_the_generated_code() {
    let (_dir, state) = test_state().await;
    let code = state.store.access_code().to_string();
    let app = create_app(state);

    let (_, body) = post(&app, "/api/verify_code", &format!(r#"{{"code":"{code}"}}"#)).await;
    assert_eq!(body["valid"], true);

    let (_, body) = post(&app, "/api/verify_code", r#"{"code":"000000"}"#).await;
    assert_eq!(body["valid"], false);

    let (_, body) = get(&app, "/api/access_code").await;
    assert_eq!(body["access_code"], code);
}

#[tokio::test]
async fn gsm_contact_lifecycle() {
    let (_dir, state) = test_state().await;
    let app = create_app(state);

    let (status, _) = post(
        &app,
        "/api/gsm/contacts",
        r#"{"mode":"call","number":"+639170000001","name":"BFP","category":"fire"}"#,
    )
    .await;
    assert_eq!(status, StatusCode::OK);

    let (_, contacts) = get(&app, "/api/gsm/contacts").await;
    assert_eq!(contacts.as_array().map(Vec::len), Some(1));
    assert_eq!(contacts[0]["number"], "+639170000001");

    // Empty number rejected.
    let (status, _) = post(
        &app,
        "/api/gsm/contacts",
        r#"{"mode":"sms","number":"  ","name":"x"}"#,
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    let response = app
        .clone()
        .oneshot(
            Request::builder()
                .method("DELETE")
                .uri("/api/gsm/contacts/+639170000001")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let (_, contacts) = get(&app, "/api/gsm/contacts").await;
    assert_eq!(contacts.as_array().map(Vec::len), Some(0));
}

#[tokio::test]
async fn manual_trigger_validates_action_type() {
    let (_dir, state) = test_state().await;
    let store = Arc::clone(&state.store);
    let app = create_app(state);

    let (status, _) = post(
        &app,
        "/api/manual/trigger",
        r#"{"action_type":"sms_broadcast","details":"test"}"#,
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(store.drain_manual_actions().len(), 1);

    let (status, _) = post(&app, "/api/manual/trigger", r#"{"action_type":"rm_rf"}"#).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert!(store.drain_manual_actions().is_empty());
}

#[tokio::test]
async fn classify_unknown_worker_is_404() {
    let (_dir, state) = test_state().await;
    let app = create_app(state);

    let (status, _) = post(
        &app,
        "/api/cluster/classify",
        r#"{"device_id":"ghost","classification":"Fire Specialist"}"#,
    )
    .await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn camera_registration_conflicts_on_duplicate() {
    let (_dir, state) = test_state().await;
    let app = create_app(state);

    let (status, body) = post(
        &app,
        "/api/cameras/register",
        r#"{"device_id":"cam_hall","ip":"192.168.1.44"}"#,
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["url"], "http://192.168.1.44/stream");

    let (status, _) = post(
        &app,
        "/api/cameras/register",
        r#"{"device_id":"cam_hall","ip":"192.168.1.44"}"#,
    )
    .await;
    assert_eq!(status, StatusCode::CONFLICT);
}

#[tokio::test]
async fn video_feed_unknown_camera_is_404() {
    let (_dir, state) = test_state().await;
    let app = create_app(state);

    let (status, _) = get(&app, "/api/video_feed?id=nope").await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn settings_validate_and_persist() {
    let (_dir, state) = test_state().await;
    let config_path = state.config_path.clone();
    let app = create_app(state);

    // Invalid: threshold out of range.
    let (status, _) = post(
        &app,
        "/api/settings",
        r#"{"confidence_threshold":2.0,"alert_mode":"Visual","analysis_interval_ms":1000,"hazard_classes":["Fire"]}"#,
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    let (status, _) = post(
        &app,
        "/api/settings",
        r#"{"confidence_threshold":0.6,"alert_mode":"Full","analysis_interval_ms":500,"hazard_classes":["Fire","Smoke"]}"#,
    )
    .await;
    assert_eq!(status, StatusCode::OK);

    let (_, body) = get(&app, "/api/settings").await;
    assert_eq!(body["confidence_threshold"], 0.6);
    assert_eq!(body["alert_mode"], "Full");

    // Persisted to disk for the next boot.
    let saved: serde_json::Value =
        serde_json::from_str(&std::fs::read_to_string(config_path).unwrap()).unwrap();
    assert_eq!(saved["alert_mode"], "Full");
}

#[tokio::test]
async fn detections_and_sensor_snapshots_serve_live_state() {
    let (_dir, state) = test_state().await;
    let store = Arc::clone(&state.store);
    let app = create_app(state);

    store.add_detection("Flood", 0.82, [1.0, 2.0, 3.0, 4.0], 11);
    let (_, detections) = get(&app, "/api/detections?limit=5").await;
    assert_eq!(detections[0]["class"], "Flood");
    assert_eq!(detections[0]["frame_id"], 11);

    let (_, sensor) = get(&app, "/api/sensor").await;
    assert_eq!(sensor["raining"], 0.0);

    let (_, history) = get(&app, "/api/history").await;
    assert!(history.is_array());
}

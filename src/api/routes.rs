//! API route definitions.
//!
//! Snapshot reads, command injection, and streaming endpoints for the
//! evacuation dashboard:
//! - `/api/status`, `/api/sensor`, `/api/devices`, ... — State Store reads
//! - `/api/alert`, `/api/evacuate`, `/api/safe`, ... — Control Engine ops
//! - `/api/video_feed` — MJPEG relay
//! - `/ws/telemetry` — live event stream

use axum::{
    routing::{delete, get, post},
    Router,
};

use super::handlers::{self, ApiState};
use super::{video, ws};

/// All `/api/*` routes.
pub fn api_routes(state: ApiState) -> Router {
    Router::new()
        .route("/status", get(handlers::get_status))
        .route("/sensor", get(handlers::get_sensor))
        .route("/devices", get(handlers::get_devices))
        .route("/workers", get(handlers::get_workers))
        .route("/detections", get(handlers::get_detections))
        .route("/alert", get(handlers::get_alert))
        .route("/alert", post(handlers::post_alert))
        .route("/alerts/history", get(handlers::get_alert_history))
        .route("/access_code", get(handlers::get_access_code))
        .route("/history", get(handlers::get_history))
        .route("/settings", get(handlers::get_settings))
        .route("/settings", post(handlers::post_settings))
        // Emergency controls
        .route("/evacuate", post(handlers::post_evacuate))
        .route("/safe", post(handlers::post_safe))
        .route("/verify_code", post(handlers::post_verify_code))
        .route("/manual/trigger", post(handlers::post_manual_trigger))
        // GSM contact book
        .route("/gsm/contacts", get(handlers::get_gsm_contacts))
        .route("/gsm/contacts", post(handlers::post_gsm_contact))
        .route("/gsm/contacts/:number", delete(handlers::delete_gsm_contact))
        // Fleet & cameras
        .route("/cluster/classify", post(handlers::post_classify))
        .route("/cameras/register", post(handlers::post_register_camera))
        // Streaming video
        .route("/video_feed", get(video::video_feed))
        .with_state(state)
}

/// WebSocket routes (mounted at the root, not under `/api`).
pub fn ws_routes(state: ApiState) -> Router {
    Router::new()
        .route("/ws/telemetry", get(ws::ws_handler))
        .with_state(state)
}

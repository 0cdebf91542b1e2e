//! API route handlers.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;

use axum::extract::{Path, Query, State};
use axum::Json;
use serde::Deserialize;
use serde_json::json;
use tokio_util::sync::CancellationToken;
use tracing::warn;

use crate::config::Settings;
use crate::config::SystemConfig;
use crate::control::ControlEngine;
use crate::fleet::FleetManager;
use crate::state::StateStore;
use crate::storage::Storage;
use crate::types::{AlertState, GsmContact, WorkerSpecialty};
use crate::vision::VisionPipeline;

use super::ws::ClientRegistry;
use super::ApiError;

/// Everything the handlers need, injected once at startup.
#[derive(Clone)]
pub struct ApiState {
    pub store: Arc<StateStore>,
    pub control: Arc<ControlEngine>,
    pub fleet: Arc<FleetManager>,
    pub vision: Arc<VisionPipeline>,
    pub storage: Storage,
    pub settings: Settings,
    pub clients: ClientRegistry,
    pub config_path: PathBuf,
    pub started_at: Instant,
    /// API-level shutdown token; long-lived responses (WS, MJPEG) watch it.
    pub cancel: CancellationToken,
}

#[derive(Debug, Deserialize)]
pub struct LimitQuery {
    pub limit: Option<usize>,
}

// ============================================================================
// Read Endpoints
// ============================================================================

/// GET /api/status — system overview incl. queue and persistence counters.
pub async fn get_status(State(state): State<ApiState>) -> Json<serde_json::Value> {
    let alert = state.store.alert();
    let devices = state.store.devices();
    let connected = devices.iter().filter(|d| d.connected).count();

    Json(json!({
        "status": "ok",
        "uptime_secs": state.started_at.elapsed().as_secs(),
        "alert": { "state": alert.name(), "value": alert.value() },
        "devices": { "total": devices.len(), "connected": connected },
        "workers": state.fleet.connected_count(),
        "vision": state.vision.stats(),
        "access_code": state.store.access_code(),
        "dropped_events": state.store.dropped_events(),
        "dropped_manual_actions": state.store.dropped_manual_actions(),
        "persistence_failures": state.storage.write_failures(),
        "ws_clients": state.clients.len(),
    }))
}

pub async fn get_sensor(State(state): State<ApiState>) -> Json<serde_json::Value> {
    Json(json!(state.store.sensor()))
}

pub async fn get_devices(State(state): State<ApiState>) -> Json<serde_json::Value> {
    Json(json!(state.store.devices()))
}

pub async fn get_workers(State(state): State<ApiState>) -> Json<serde_json::Value> {
    Json(json!(state.fleet.workers()))
}

pub async fn get_detections(
    State(state): State<ApiState>,
    Query(query): Query<LimitQuery>,
) -> Json<serde_json::Value> {
    Json(json!(state.store.detections(query.limit.unwrap_or(20))))
}

pub async fn get_alert(State(state): State<ApiState>) -> Json<serde_json::Value> {
    let alert = state.store.alert();
    Json(json!({ "state": alert.name(), "value": alert.value() }))
}

pub async fn get_alert_history(
    State(state): State<ApiState>,
    Query(query): Query<LimitQuery>,
) -> Json<serde_json::Value> {
    Json(json!(state.store.alert_history(query.limit.unwrap_or(20))))
}

pub async fn get_access_code(State(state): State<ApiState>) -> Json<serde_json::Value> {
    Json(json!({ "access_code": state.store.access_code() }))
}

pub async fn get_gsm_contacts(State(state): State<ApiState>) -> Json<serde_json::Value> {
    Json(json!(state.store.gsm_contacts()))
}

/// GET /api/history — persisted detection log. Read failures degrade to an
/// empty list; the dashboard keeps working off live state.
pub async fn get_history(
    State(state): State<ApiState>,
    Query(query): Query<LimitQuery>,
) -> Json<serde_json::Value> {
    let limit = query.limit.unwrap_or(100) as i64;
    let entries = match state.storage.detection_history(limit).await {
        Ok(entries) => entries,
        Err(e) => {
            warn!(error = %e, "History read failed");
            Vec::new()
        }
    };
    Json(json!(entries))
}

pub async fn get_settings(State(state): State<ApiState>) -> Json<SystemConfig> {
    Json(state.settings.load().as_ref().clone())
}

// ============================================================================
// Mutating Endpoints
// ============================================================================

#[derive(Debug, Deserialize)]
pub struct SetAlertRequest {
    pub alert: u8,
    #[serde(default)]
    pub reason: String,
}

/// POST /api/alert — operator-chosen alert level.
pub async fn post_alert(
    State(state): State<ApiState>,
    Json(request): Json<SetAlertRequest>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let Some(alert) = AlertState::from_value(request.alert) else {
        return Err(ApiError::bad_request(format!(
            "alert must be 0-4, got {}",
            request.alert
        )));
    };
    let reason = if request.reason.is_empty() {
        "Manual alert".to_string()
    } else {
        request.reason
    };
    state.control.set_alert_manual(alert, &reason);
    Ok(Json(json!({ "ok": true, "alert": alert.name() })))
}

#[derive(Debug, Deserialize)]
pub struct EvacuateRequest {
    #[serde(default = "default_exit_zone")]
    pub exit_zone: u32,
}

fn default_exit_zone() -> u32 {
    3
}

pub async fn post_evacuate(
    State(state): State<ApiState>,
    Json(request): Json<EvacuateRequest>,
) -> Json<serde_json::Value> {
    state.control.set_evacuate(request.exit_zone);
    Json(json!({ "ok": true, "exit_zone": request.exit_zone }))
}

pub async fn post_safe(State(state): State<ApiState>) -> Json<serde_json::Value> {
    state.control.set_safe_mode();
    Json(json!({ "ok": true }))
}

#[derive(Debug, Deserialize)]
pub struct VerifyCodeRequest {
    pub code: String,
}

pub async fn post_verify_code(
    State(state): State<ApiState>,
    Json(request): Json<VerifyCodeRequest>,
) -> Json<serde_json::Value> {
    Json(json!({ "valid": state.store.verify_access_code(&request.code) }))
}

/// POST /api/gsm/contacts — register an emergency contact.
pub async fn post_gsm_contact(
    State(state): State<ApiState>,
    Json(contact): Json<GsmContact>,
) -> Result<Json<serde_json::Value>, ApiError> {
    if contact.number.trim().is_empty() {
        return Err(ApiError::bad_request("contact number must not be empty"));
    }
    state.store.add_gsm_contact(contact);
    Ok(Json(json!({ "ok": true })))
}

pub async fn delete_gsm_contact(
    State(state): State<ApiState>,
    Path(number): Path<String>,
) -> Json<serde_json::Value> {
    state.store.delete_gsm_contact(&number);
    Json(json!({ "ok": true }))
}

#[derive(Debug, Deserialize)]
pub struct ManualTriggerRequest {
    pub action_type: String,
    #[serde(default)]
    pub details: String,
}

const MANUAL_ACTIONS: [&str; 5] = [
    "call_fire",
    "call_police",
    "earthquake_alert",
    "sms_broadcast",
    "set_safe",
];

pub async fn post_manual_trigger(
    State(state): State<ApiState>,
    Json(request): Json<ManualTriggerRequest>,
) -> Result<Json<serde_json::Value>, ApiError> {
    if !MANUAL_ACTIONS.contains(&request.action_type.as_str()) {
        return Err(ApiError::bad_request(format!(
            "unknown action_type '{}'",
            request.action_type
        )));
    }
    state
        .store
        .trigger_manual_action(&request.action_type, &request.details);
    Ok(Json(json!({ "ok": true })))
}

#[derive(Debug, Deserialize)]
pub struct ClassifyRequest {
    pub device_id: String,
    pub classification: WorkerSpecialty,
}

pub async fn post_classify(
    State(state): State<ApiState>,
    Json(request): Json<ClassifyRequest>,
) -> Result<Json<serde_json::Value>, ApiError> {
    if state
        .fleet
        .classify(&request.device_id, request.classification)
    {
        Ok(Json(json!({ "ok": true })))
    } else {
        Err(ApiError::not_found(format!(
            "no connected worker '{}'",
            request.device_id
        )))
    }
}

#[derive(Debug, Deserialize)]
pub struct RegisterCameraRequest {
    pub device_id: String,
    pub ip: String,
}

pub async fn post_register_camera(
    State(state): State<ApiState>,
    Json(request): Json<RegisterCameraRequest>,
) -> Result<Json<serde_json::Value>, ApiError> {
    if request.device_id.trim().is_empty() || request.ip.trim().is_empty() {
        return Err(ApiError::bad_request("device_id and ip are required"));
    }
    let url = if request.ip.contains("://") {
        request.ip.clone()
    } else {
        format!("http://{}/stream", request.ip)
    };
    if Arc::clone(&state.vision).add_camera(&request.device_id, &url) {
        Ok(Json(json!({ "ok": true, "url": url })))
    } else {
        Err(ApiError::conflict(format!(
            "camera '{}' already registered",
            request.device_id
        )))
    }
}

/// POST /api/settings — replace the settings document and persist it.
pub async fn post_settings(
    State(state): State<ApiState>,
    Json(config): Json<SystemConfig>,
) -> Result<Json<serde_json::Value>, ApiError> {
    if let Err(e) = config.validate() {
        return Err(ApiError::bad_request(e.to_string()));
    }
    config.save(&state.config_path);
    state.settings.store(Arc::new(config));
    Ok(Json(json!({ "ok": true })))
}

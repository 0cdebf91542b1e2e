//! Core data model shared across the coordinator.
//!
//! Everything the State Store owns lives here: sensor snapshots, hazard
//! detections, device records, alert states and transitions, GSM contacts,
//! manual actions, worker records, and the event enum broadcast on the
//! state bus.

use chrono::Utc;
use serde::{Deserialize, Serialize};

// ============================================================================
// Alert State
// ============================================================================

/// Ordered alert severity driving visual and GSM side-effects.
///
/// The ordering is load-bearing: escalation guards compare with `<` so a
/// lower severity never overwrites a live higher one.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default,
)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AlertState {
    #[default]
    Safe = 0,
    Calling = 1,
    Messaging = 2,
    Danger = 3,
    Evacuate = 4,
}

impl AlertState {
    /// Integer value sent to the microcontroller (`set_alert` command).
    pub fn value(self) -> u8 {
        self as u8
    }

    /// Parse the integer form used by the API and the serial protocol.
    pub fn from_value(v: u8) -> Option<Self> {
        match v {
            0 => Some(Self::Safe),
            1 => Some(Self::Calling),
            2 => Some(Self::Messaging),
            3 => Some(Self::Danger),
            4 => Some(Self::Evacuate),
            _ => None,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            Self::Safe => "SAFE",
            Self::Calling => "CALLING",
            Self::Messaging => "MESSAGING",
            Self::Danger => "DANGER",
            Self::Evacuate => "EVACUATE",
        }
    }
}

impl std::fmt::Display for AlertState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.name())
    }
}

/// A single alert transition appended to the history ring and the alert log.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AlertTransition {
    pub from: AlertState,
    pub to: AlertState,
    pub reason: String,
    /// Unix timestamp (seconds).
    pub timestamp: f64,
}

// ============================================================================
// Sensor Telemetry
// ============================================================================

/// Latest-write-wins snapshot of the microcontroller's sensor suite.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct SensorSnapshot {
    /// Flame sensor tripped.
    pub fire: bool,
    /// Precipitation level, percent of scale (0-100).
    pub raining: f64,
    /// Gyro orientation in degrees.
    pub orientation: Triple,
    /// Accelerometer reading.
    pub accel: Triple,
    /// Unix timestamp of the last update (seconds).
    pub timestamp: f64,
}

/// An (x, y, z) sensor triple.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq)]
pub struct Triple {
    pub x: f64,
    pub y: f64,
    pub z: f64,
}

/// Partial sensor update parsed from one telemetry line.
///
/// Absent fields leave the corresponding snapshot fields untouched.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SensorPatch {
    pub fire: Option<bool>,
    pub raining: Option<f64>,
    pub orientation: Option<Triple>,
    pub accel: Option<Triple>,
}

// ============================================================================
// Detections
// ============================================================================

/// The fixed hazard vocabulary the detector classifies into.
pub const HAZARD_CLASSES: [&str; 8] = [
    "Fire",
    "Smoke",
    "Flood",
    "Falling Debris",
    "Landslide",
    "Explosion",
    "Collapsed Structure",
    "Industrial Accident",
];

/// Classes that escalate straight to [`AlertState::Danger`].
pub const CRITICAL_HAZARDS: [&str; 4] = ["Fire", "Explosion", "Flood", "Collapsed Structure"];

/// Classes that escalate to [`AlertState::Calling`].
pub const WARNING_HAZARDS: [&str; 3] = ["Smoke", "Falling Debris", "Landslide"];

/// One detector output box, local or remote.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Detection {
    /// Class label from [`HAZARD_CLASSES`].
    #[serde(rename = "class")]
    pub class_name: String,
    /// Confidence in [0, 1].
    pub confidence: f64,
    /// Axis-aligned `[x1, y1, x2, y2]` in source-frame pixels.
    pub bbox: [f64; 4],
    /// Pipeline-global monotonic frame counter value at capture.
    pub frame_id: u64,
    /// Unix timestamp (seconds).
    pub timestamp: f64,
}

impl Detection {
    pub fn new(class_name: impl Into<String>, confidence: f64, bbox: [f64; 4], frame_id: u64) -> Self {
        Self {
            class_name: class_name.into(),
            confidence,
            bbox,
            frame_id,
            timestamp: unix_now(),
        }
    }
}

// ============================================================================
// Devices
// ============================================================================

/// Kind of peripheral tracked in the device table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeviceKind {
    /// The microcontroller on the serial link.
    SensorHub,
    /// A camera frame source.
    Camera,
    /// A registered inference worker node.
    Worker,
}

impl std::fmt::Display for DeviceKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::SensorHub => write!(f, "sensor_hub"),
            Self::Camera => write!(f, "camera"),
            Self::Worker => write!(f, "worker"),
        }
    }
}

/// Connection status of one peripheral.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeviceStatus {
    pub device_id: String,
    pub kind: DeviceKind,
    pub connected: bool,
    /// Unix timestamp of the last status change or heartbeat.
    pub last_seen: f64,
    /// Serial port path or `host:port`.
    pub address: String,
}

// ============================================================================
// GSM Contacts & Manual Actions
// ============================================================================

/// Routing sub-type for GSM dispatch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum HazardCategory {
    #[default]
    General,
    Fire,
    Smoke,
    Rain,
    Debris,
}

impl HazardCategory {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::General => "general",
            Self::Fire => "fire",
            Self::Smoke => "smoke",
            Self::Rain => "rain",
            Self::Debris => "debris",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "general" => Some(Self::General),
            "fire" => Some(Self::Fire),
            "smoke" => Some(Self::Smoke),
            "rain" => Some(Self::Rain),
            "debris" => Some(Self::Debris),
            _ => None,
        }
    }
}

impl std::fmt::Display for HazardCategory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Whether a contact is reached by voice call or SMS.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GsmMode {
    Sms,
    Call,
}

impl GsmMode {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Sms => "sms",
            Self::Call => "call",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "sms" => Some(Self::Sms),
            "call" => Some(Self::Call),
            _ => None,
        }
    }
}

/// One emergency contact reachable through the GSM module.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct GsmContact {
    pub mode: GsmMode,
    pub number: String,
    pub name: String,
    /// Custom SMS text; falls back to the alert reason when empty.
    #[serde(default)]
    pub message: String,
    #[serde(default)]
    pub category: HazardCategory,
}

/// Operator-initiated action queued from the dashboard.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ManualAction {
    /// `call_fire`, `call_police`, `earthquake_alert`, `sms_broadcast`, `set_safe`.
    pub action_type: String,
    pub details: String,
    pub timestamp: f64,
}

// ============================================================================
// Workers
// ============================================================================

/// Capability label a worker declares at registration; filters dispatch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum WorkerSpecialty {
    #[default]
    Generalist,
    #[serde(rename = "Fire Specialist")]
    FireSpecialist,
    #[serde(rename = "Smoke Specialist")]
    SmokeSpecialist,
    #[serde(rename = "Flood Detector")]
    FloodDetector,
    #[serde(untagged)]
    Custom(String),
}

impl std::fmt::Display for WorkerSpecialty {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Generalist => write!(f, "Generalist"),
            Self::FireSpecialist => write!(f, "Fire Specialist"),
            Self::SmokeSpecialist => write!(f, "Smoke Specialist"),
            Self::FloodDetector => write!(f, "Flood Detector"),
            Self::Custom(s) => write!(f, "{s}"),
        }
    }
}

/// Role a worker plays in the fleet.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum WorkerRole {
    Main,
    #[default]
    SubWorker,
}

/// Snapshot of a registered worker for dashboards and `/api/workers`.
#[derive(Debug, Clone, Serialize)]
pub struct WorkerInfo {
    pub worker_id: String,
    pub name: String,
    pub model: String,
    pub specialty: WorkerSpecialty,
    pub role: WorkerRole,
    pub address: String,
    /// Unix timestamp of the last heartbeat or message.
    pub last_seen: f64,
    /// Free-form live stats reported in heartbeats (fps, load, ...).
    pub stats: serde_json::Value,
}

// ============================================================================
// State Events
// ============================================================================

/// Event broadcast to bus subscribers and the dashboard fan-out queue.
///
/// Serializes as `{"type": "...", "data": {...}}`, which is exactly the
/// shape WebSocket clients receive.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "snake_case")]
pub enum StateEvent {
    SensorUpdate(SensorSnapshot),
    Detection(Detection),
    DeviceUpdate(DeviceStatus),
    AlertChange {
        state: String,
        value: u8,
        reason: String,
    },
    GsmUpdate {
        contacts: Vec<GsmContact>,
    },
    ManualTrigger(ManualAction),
    /// Emitted by the control engine alongside an escalation so dashboards
    /// can raise a notification distinct from the state change itself.
    HazardDetected {
        kind: String,
        reason: String,
    },
}

impl StateEvent {
    /// Stable name used for logging and subscriber filtering.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::SensorUpdate(_) => "sensor_update",
            Self::Detection(_) => "detection",
            Self::DeviceUpdate(_) => "device_update",
            Self::AlertChange { .. } => "alert_change",
            Self::GsmUpdate { .. } => "gsm_update",
            Self::ManualTrigger(_) => "manual_trigger",
            Self::HazardDetected { .. } => "hazard_detected",
        }
    }
}

/// Current unix time in fractional seconds.
pub fn unix_now() -> f64 {
    Utc::now().timestamp_micros() as f64 / 1_000_000.0
}

//! AEGIS-EVAC: Hazard Detection & Evacuation Coordination
//!
//! Central coordinator for an emergency-evacuation deployment. Ingests
//! microcontroller telemetry and camera frames, balances object-detection
//! inference between the local node and a LAN fleet of workers, merges
//! results into a global safety state, and drives alerts, GSM dispatch, and
//! dashboard broadcasts.
//!
//! ## Architecture
//!
//! - **State Store**: authoritative in-memory state + event bus
//! - **Serial Sensor Link**: line-JSON telemetry and commands to the MCU
//! - **Worker Fleet Manager**: discovery, registration, balanced dispatch
//! - **Vision Pipeline**: cameras, interleaved local/remote inference
//! - **Control Engine**: alert transitions, debouncing, GSM escalation
//! - **API**: HTTP snapshots, command injection, WebSocket/MJPEG streaming

pub mod api;
pub mod config;
pub mod control;
pub mod fleet;
pub mod serial;
pub mod state;
pub mod storage;
pub mod types;
pub mod vision;

// Re-export commonly used types
pub use config::{RuntimeConfig, SystemConfig};
pub use state::StateStore;
pub use types::{
    AlertState, AlertTransition, Detection, DeviceKind, DeviceStatus, GsmContact, GsmMode,
    HazardCategory, SensorPatch, SensorSnapshot, StateEvent, WorkerInfo, WorkerRole,
    WorkerSpecialty,
};

// Re-export component entry points
pub use control::ControlEngine;
pub use fleet::FleetManager;
pub use storage::Storage;
pub use vision::VisionPipeline;

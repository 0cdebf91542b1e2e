//! Configuration module.
//!
//! Two layers:
//!
//! 1. [`SystemConfig`] — the operator-tunable settings document, persisted
//!    as a single JSON file (`config.json` by default) and editable at
//!    runtime through `POST /api/settings`. Held in an `ArcSwap` so readers
//!    never block writers.
//! 2. [`RuntimeConfig`] — process-level wiring (bind addresses, ports,
//!    paths) resolved once at startup from CLI flags and environment.

pub mod defaults;

use arc_swap::ArcSwap;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use thiserror::Error;
use tracing::{info, warn};

use crate::types::HAZARD_CLASSES;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Read {
        path: String,
        source: std::io::Error,
    },

    #[error("failed to parse config file {path}: {source}")]
    Parse {
        path: String,
        source: serde_json::Error,
    },

    #[error("invalid config: {0}")]
    Invalid(String),
}

// ============================================================================
// Settings Document
// ============================================================================

/// Operator-tunable settings, stored as one JSON document.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SystemConfig {
    /// Minimum confidence for local inference output.
    pub confidence_threshold: f64,
    /// Alerting posture shown on the dashboard (`Visual`, `Full`).
    pub alert_mode: String,
    /// Target interval between analyzed frames per camera.
    pub analysis_interval_ms: u64,
    /// Detector class-id → label mapping, index-aligned.
    pub hazard_classes: Vec<String>,
}

impl Default for SystemConfig {
    fn default() -> Self {
        Self {
            confidence_threshold: defaults::CONFIDENCE_THRESHOLD,
            alert_mode: "Visual".to_string(),
            analysis_interval_ms: defaults::ANALYSIS_INTERVAL_MS,
            hazard_classes: HAZARD_CLASSES.iter().map(|s| (*s).to_string()).collect(),
        }
    }
}

impl SystemConfig {
    /// Load from `path`, falling back to defaults when the file is absent.
    ///
    /// An unreadable or unparseable file is a fatal startup error — a half
    /// applied settings document is worse than no deployment at all.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        if !path.exists() {
            info!(path = %path.display(), "No settings file found, using defaults");
            return Ok(Self::default());
        }

        let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.display().to_string(),
            source,
        })?;
        let config: Self = serde_json::from_str(&raw).map_err(|source| ConfigError::Parse {
            path: path.display().to_string(),
            source,
        })?;
        config.validate()?;
        info!(path = %path.display(), "Settings loaded");
        Ok(config)
    }

    /// Persist to `path`. Failures are logged, not fatal — the live copy in
    /// memory stays authoritative.
    pub fn save(&self, path: &Path) {
        let json = match serde_json::to_string_pretty(self) {
            Ok(j) => j,
            Err(e) => {
                warn!(error = %e, "Failed to serialize settings");
                return;
            }
        };
        if let Err(e) = std::fs::write(path, json) {
            warn!(path = %path.display(), error = %e, "Failed to write settings file");
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if !(0.0..=1.0).contains(&self.confidence_threshold) {
            return Err(ConfigError::Invalid(format!(
                "confidence_threshold must be within [0, 1], got {}",
                self.confidence_threshold
            )));
        }
        if self.hazard_classes.is_empty() {
            return Err(ConfigError::Invalid(
                "hazard_classes must not be empty".to_string(),
            ));
        }
        Ok(())
    }
}

/// Shared, atomically swappable settings handle.
pub type Settings = Arc<ArcSwap<SystemConfig>>;

/// Wrap a loaded [`SystemConfig`] for shared runtime access.
pub fn shared(config: SystemConfig) -> Settings {
    Arc::new(ArcSwap::from_pointee(config))
}

// ============================================================================
// Runtime Wiring
// ============================================================================

/// Process-level configuration resolved at startup.
#[derive(Debug, Clone)]
pub struct RuntimeConfig {
    /// HTTP server bind address.
    pub server_addr: String,
    /// UDP port workers listen on for discovery announcements.
    pub discovery_port: u16,
    /// TCP port the fleet registration listener binds.
    pub fleet_port: u16,
    /// Identifier carried in discovery announcements.
    pub system_tag: String,
    /// Serial port override; auto-detect when `None`.
    pub serial_port: Option<String>,
    /// Serial baud rate.
    pub baud_rate: u32,
    /// SQLite database path.
    pub db_path: PathBuf,
    /// Settings document path.
    pub config_path: PathBuf,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            server_addr: "0.0.0.0:8080".to_string(),
            discovery_port: defaults::DISCOVERY_PORT,
            fleet_port: defaults::FLEET_PORT,
            system_tag: "aegis-evac".to_string(),
            serial_port: None,
            baud_rate: defaults::SERIAL_BAUD,
            db_path: PathBuf::from("system.db"),
            config_path: PathBuf::from("config.json"),
        }
    }
}

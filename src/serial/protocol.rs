//! Line-delimited JSON protocol spoken by the microcontroller.
//!
//! Inbound lines are either telemetry (`{"type":"telemetry", ...}`) or
//! lifecycle events (`{"event":"boot"|"error"|"alert_set"|"pong", ...}`).
//! Outbound command frames serialize as one JSON object per line.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::types::{SensorPatch, Triple};

/// Command frame written to the microcontroller, one JSON object per line.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "cmd", rename_all = "snake_case")]
pub enum CommandFrame {
    SetAlert {
        alert: u8,
    },
    GsmCall {
        number: String,
        robot_talk: bool,
        msg: String,
    },
    GsmSms {
        number: String,
        message: String,
    },
    Ping,
}

impl CommandFrame {
    /// Serialize to the wire line (newline-terminated).
    pub fn to_line(&self) -> String {
        // A struct of strings and numbers cannot fail to serialize.
        let mut line = serde_json::to_string(self).unwrap_or_default();
        line.push('\n');
        line
    }
}

/// Result of parsing one inbound line.
#[derive(Debug, Clone, PartialEq)]
pub enum InboundLine {
    /// Sensor telemetry to merge into the state store.
    Telemetry(SensorPatch),
    /// Lifecycle event (`boot`, `error`, `alert_set`, `pong`).
    Event { name: String, payload: Value },
    /// Valid JSON with no recognized shape.
    Unknown(Value),
    /// Not JSON at all.
    Raw(String),
}

fn parse_triple(value: &Value) -> Option<Triple> {
    Some(Triple {
        x: value.get("x")?.as_f64().unwrap_or(0.0),
        y: value.get("y")?.as_f64().unwrap_or(0.0),
        z: value.get("z")?.as_f64().unwrap_or(0.0),
    })
}

/// Parse one line from the serial peer.
///
/// Telemetry accepts the field aliases the firmware has shipped with over
/// time: `raining`/`water` for precipitation and `earthquake`/`gyro` for
/// orientation.
pub fn parse_line(line: &str) -> InboundLine {
    let trimmed = line.trim();
    let Ok(value) = serde_json::from_str::<Value>(trimmed) else {
        return InboundLine::Raw(trimmed.to_string());
    };

    if value.get("type").and_then(Value::as_str) == Some("telemetry") {
        let patch = SensorPatch {
            fire: value.get("fire").and_then(Value::as_bool),
            raining: value
                .get("raining")
                .or_else(|| value.get("water"))
                .and_then(Value::as_f64),
            orientation: value
                .get("earthquake")
                .or_else(|| value.get("gyro"))
                .and_then(parse_triple),
            accel: value.get("accel").and_then(parse_triple),
        };
        return InboundLine::Telemetry(patch);
    }

    if let Some(event) = value.get("event").and_then(Value::as_str) {
        return InboundLine::Event {
            name: event.to_string(),
            payload: value,
        };
    }

    InboundLine::Unknown(value)
}

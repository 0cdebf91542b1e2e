//! Worker wire protocol: 4-byte big-endian length prefix + UTF-8 JSON body.
//!
//! The framing itself is `LengthDelimitedCodec` (its default header is the
//! 4-byte big-endian prefix this protocol specifies); this module owns the
//! message bodies and their encode/decode helpers.

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

use crate::types::{WorkerRole, WorkerSpecialty};

#[derive(Error, Debug)]
pub enum WireError {
    #[error("malformed frame: {0}")]
    Malformed(#[from] serde_json::Error),
}

/// One detection as reported by a worker.
///
/// `bbox` stays a `Vec` on the wire; workers have shipped 4-element boxes
/// with assorted extra fields and the coordinator tolerates both.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct WireDetection {
    #[serde(rename = "class")]
    pub class_name: String,
    #[serde(alias = "conf")]
    pub confidence: f64,
    pub bbox: Vec<f64>,
}

impl WireDetection {
    /// Normalize to the fixed `[x1, y1, x2, y2]` box, rejecting malformed
    /// boxes instead of guessing.
    pub fn bbox_array(&self) -> Option<[f64; 4]> {
        match self.bbox.as_slice() {
            [x1, y1, x2, y2] => Some([*x1, *y1, *x2, *y2]),
            _ => None,
        }
    }
}

/// Messages a worker sends to the coordinator.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum WorkerMessage {
    Register {
        worker_id: String,
        name: String,
        model: String,
        #[serde(default)]
        specialty: WorkerSpecialty,
        #[serde(default)]
        role: WorkerRole,
    },
    Heartbeat {
        worker_id: String,
        #[serde(default)]
        stats: Value,
    },
    InferenceResult {
        frame_id: u64,
        detections: Vec<WireDetection>,
    },
}

/// Messages the coordinator sends to a worker.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum CoordinatorMessage {
    Registered {
        worker_id: String,
    },
    InferenceTask {
        frame_id: u64,
        /// Base64-encoded JPEG.
        image: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        specialty: Option<WorkerSpecialty>,
    },
}

pub fn encode<T: Serialize>(message: &T) -> Bytes {
    Bytes::from(serde_json::to_vec(message).unwrap_or_default())
}

pub fn decode_worker(body: &[u8]) -> Result<WorkerMessage, WireError> {
    Ok(serde_json::from_slice(body)?)
}

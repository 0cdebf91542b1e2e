//! Detector seam — the object-detection model is a black box behind a trait.
//!
//! The coordinator only depends on the contract: hand in an RGB frame and a
//! confidence floor, get back class-id/confidence/box triples. Deployments
//! plug a real backend in; [`NullDetector`] keeps the pipeline running with
//! remote-only inference, and tests script their own implementations.

use image::RgbImage;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum DetectorError {
    #[error("inference failed: {0}")]
    Inference(String),
}

/// One raw model output box.
#[derive(Debug, Clone, PartialEq)]
pub struct RawDetection {
    /// Index into the configured class list.
    pub class_id: usize,
    pub confidence: f64,
    /// `[x1, y1, x2, y2]` in frame pixels.
    pub bbox: [f64; 4],
}

/// Black-box hazard classifier.
pub trait Detector: Send + Sync {
    /// Run inference, returning boxes at or above `min_confidence`.
    fn detect(&self, frame: &RgbImage, min_confidence: f64)
        -> Result<Vec<RawDetection>, DetectorError>;
}

/// Backend used when no model is configured: detects nothing, so every
/// detection comes from the worker fleet.
pub struct NullDetector;

impl Detector for NullDetector {
    fn detect(
        &self,
        _frame: &RgbImage,
        _min_confidence: f64,
    ) -> Result<Vec<RawDetection>, DetectorError> {
        Ok(Vec::new())
    }
}

/// Map a model class id into the configured vocabulary.
pub fn class_label(classes: &[String], class_id: usize) -> String {
    classes
        .get(class_id)
        .cloned()
        .unwrap_or_else(|| "Hazard".to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unknown_class_ids_fall_back() {
        let classes = vec!["Fire".to_string(), "Smoke".to_string()];
        assert_eq!(class_label(&classes, 1), "Smoke");
        assert_eq!(class_label(&classes, 9), "Hazard");
    }

    #[test]
    fn null_detector_detects_nothing() {
        let frame = RgbImage::new(4, 4);
        assert!(NullDetector.detect(&frame, 0.0).unwrap().is_empty());
    }
}

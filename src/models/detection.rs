use image::RgbImage;
use serde::Serialize;

use super::geometry::Quad;

#[derive(
    strum_macros::Display,
    strum_macros::EnumString,
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    Serialize,
)]
#[strum(serialize_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum DetectionMethod {
    Simple,
    Accelerated,
    Adaptive,
    SimpleFallback,
    None,
    Error,
}

/// Outcome of one boundary detection over one frame.
///
/// `rectified` holds the card warped to the target size on success and a
/// copy of the input frame otherwise.
#[derive(Debug, Clone)]
pub struct DetectionResult {
    pub success: bool,
    pub corners: Option<Quad>,
    pub confidence: f64,
    pub area: f64,
    pub method: DetectionMethod,
    pub rectified: RgbImage,
}

impl DetectionResult {
    pub fn found(
        corners: Quad,
        confidence: f64,
        method: DetectionMethod,
        rectified: RgbImage,
    ) -> Self {
        Self {
            success: true,
            area: corners.area(),
            corners: Some(corners),
            confidence: clamp_confidence(confidence),
            method,
            rectified,
        }
    }

    pub fn failed(frame: &RgbImage, confidence: f64, method: DetectionMethod) -> Self {
        Self {
            success: false,
            corners: None,
            confidence: clamp_confidence(confidence),
            area: 0.0,
            method,
            rectified: frame.clone(),
        }
    }

    pub fn with_method(mut self, method: DetectionMethod) -> Self {
        self.method = method;
        self
    }

    pub fn with_confidence(mut self, confidence: f64) -> Self {
        self.confidence = clamp_confidence(confidence);
        self
    }
}

pub fn clamp_confidence(confidence: f64) -> f64 {
    if confidence.is_nan() {
        0.0
    } else {
        confidence.clamp(0.0, 1.0)
    }
}

use image::RgbImage;

use crate::config::DetectConfig;
use crate::error::ScanError;
use crate::models::DetectionResult;

pub mod accelerated;
pub mod geometry;
pub mod hybrid;
pub mod scoring;
pub mod simple;

pub use hybrid::{HybridDetector, HybridOutcome};
pub use simple::SimpleDetector;

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum EdgeThresholds {
    /// Derived from the frame's mean and standard deviation.
    Adaptive,
    Fixed { low: f64, high: f64 },
}

#[derive(Debug, Clone, PartialEq)]
pub struct DetectOptions {
    pub fast_mode: bool,
    pub min_confidence: f64,
    pub min_area: f64,
    pub target_width: u32,
    pub target_height: u32,
    pub enable_accelerated: bool,
    pub enable_simple: bool,
    pub edges: EdgeThresholds,
}

impl Default for DetectOptions {
    fn default() -> Self {
        DetectOptions::from(&DetectConfig::default())
    }
}

impl From<&DetectConfig> for DetectOptions {
    fn from(config: &DetectConfig) -> Self {
        Self {
            fast_mode: config.fast_mode,
            min_confidence: config.min_confidence,
            min_area: config.min_area,
            target_width: config.target_width,
            target_height: config.target_height,
            enable_accelerated: config.enable_accelerated,
            enable_simple: config.enable_simple,
            edges: EdgeThresholds::Adaptive,
        }
    }
}

impl DetectOptions {
    pub fn with_edges(&self, edges: EdgeThresholds) -> Self {
        Self {
            edges,
            ..self.clone()
        }
    }
}

/// Implementations return `Ok` with `success == false` when the frame simply
/// holds no card, and `Err` only when they could not run at all.
pub trait BoundaryDetector: Send + Sync {
    fn name(&self) -> &'static str;

    fn detect(&self, frame: &RgbImage, options: &DetectOptions) -> Result<DetectionResult, ScanError>;
}

/// Luma with the 0.299 / 0.587 / 0.114 weighting, rounded.
pub fn luma(r: u8, g: u8, b: u8) -> u8 {
    (0.299 * r as f64 + 0.587 * g as f64 + 0.114 * b as f64).round() as u8
}

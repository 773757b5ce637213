use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::time::{Duration, Instant};

use image::RgbImage;
use tracing::warn;

use super::accelerated::{self, AcceleratedDetector};
use super::scoring::quick_fallback_confidence;
use super::simple::SimpleDetector;
use super::{BoundaryDetector, DetectOptions, EdgeThresholds};
use crate::config::DetectConfig;
use crate::error::{ConfigError, ScanError};
use crate::models::{DetectionMethod, DetectionResult};
use crate::opt::*;

/// Fixed Canny thresholds tried when adaptive ones found nothing.
pub const ADAPTIVE_STRATEGIES: [(f64, f64); 3] = [(50.0, 150.0), (100.0, 200.0), (30.0, 100.0)];

/// Re-parameterized runs must clear this floor regardless of `min_confidence`.
const ADAPTIVE_MIN_CONFIDENCE: f64 = 0.4;

pub const QUICK_MIN_CONFIDENCE: f64 = 0.4;

fn log(s: String) {
    log_if(s.as_str(), DbgFlg::Detect);
}

#[derive(Debug, Clone)]
pub struct HybridOutcome {
    pub result: DetectionResult,
    pub elapsed: Duration,
    /// The accelerated strategy was requested but could not run.
    pub accelerated_unavailable: bool,
}

/// Runs the detection strategies cheapest first and never fails.
#[derive(Clone)]
pub struct HybridDetector {
    simple: Arc<dyn BoundaryDetector>,
    accelerated: Option<Arc<dyn BoundaryDetector>>,
}

impl HybridDetector {
    /// Builds the default strategy stack. The accelerated detector is only
    /// installed when the native capability probe passes.
    pub fn new(config: &DetectConfig) -> Result<Self, ConfigError> {
        config.validate()?;
        let accelerated: Option<Arc<dyn BoundaryDetector>> = if accelerated::probe() {
            Some(Arc::new(AcceleratedDetector::default()))
        } else {
            None
        };
        Ok(Self {
            simple: Arc::new(SimpleDetector::default()),
            accelerated,
        })
    }

    pub fn with_strategies(
        simple: Arc<dyn BoundaryDetector>,
        accelerated: Option<Arc<dyn BoundaryDetector>>,
    ) -> Self {
        Self {
            simple,
            accelerated,
        }
    }

    pub fn has_accelerated(&self) -> bool {
        self.accelerated.is_some()
    }

    pub fn detect(&self, frame: &RgbImage, options: &DetectOptions) -> HybridOutcome {
        let start = Instant::now();
        let finish = |result: DetectionResult, accelerated_unavailable: bool| {
            let elapsed = start.elapsed();
            log(format!(
                "{} success={} confidence={:.2} in {:?}",
                result.method, result.success, result.confidence, elapsed
            ));
            HybridOutcome {
                result,
                elapsed,
                accelerated_unavailable,
            }
        };

        let mut best_confidence: f64 = 0.0;
        let mut errored = false;
        let mut unavailable = false;

        if options.enable_simple {
            match run_guarded(self.simple.as_ref(), frame, options) {
                Ok(result) if result.success && result.confidence >= options.min_confidence => {
                    return finish(result.with_method(DetectionMethod::Simple), false);
                }
                Ok(result) => best_confidence = best_confidence.max(result.confidence),
                Err(err) => {
                    warn!("Simple detection failed: {}", err);
                    errored = true;
                }
            }
        }

        if options.enable_accelerated && !options.fast_mode {
            match &self.accelerated {
                None => unavailable = true,
                Some(detector) => {
                    let adaptive = options.with_edges(EdgeThresholds::Adaptive);
                    match run_guarded(detector.as_ref(), frame, &adaptive) {
                        Ok(result) if result.success && result.confidence >= options.min_confidence => {
                            return finish(result.with_method(DetectionMethod::Accelerated), false);
                        }
                        Ok(result) => best_confidence = best_confidence.max(result.confidence),
                        Err(ScanError::AcceleratedUnavailable(reason)) => {
                            warn!("Accelerated detection unavailable: {}", reason);
                            unavailable = true;
                        }
                        Err(err) => {
                            warn!("Accelerated detection failed: {}", err);
                            errored = true;
                        }
                    }

                    if !unavailable {
                        let floor = options.min_confidence.max(ADAPTIVE_MIN_CONFIDENCE);
                        for (low, high) in ADAPTIVE_STRATEGIES {
                            let fixed = options.with_edges(EdgeThresholds::Fixed { low, high });
                            match run_guarded(detector.as_ref(), frame, &fixed) {
                                Ok(result) if result.success && result.confidence >= floor => {
                                    return finish(result.with_method(DetectionMethod::Adaptive), false);
                                }
                                Ok(result) => best_confidence = best_confidence.max(result.confidence),
                                Err(err) => {
                                    log(format!("adaptive strategy ({}, {}) failed: {}", low, high, err));
                                    errored = true;
                                }
                            }
                        }
                    }
                }
            }
        }

        let method = if errored && best_confidence == 0.0 {
            DetectionMethod::Error
        } else {
            DetectionMethod::None
        };
        finish(DetectionResult::failed(frame, best_confidence, method), unavailable)
    }

    /// Runs the stack in fast mode at a 0.4 floor; when that finds nothing,
    /// reports the simple detector's verdict scored on frame coverage.
    pub fn quick_detect(&self, frame: &RgbImage, options: &DetectOptions) -> DetectionResult {
        let quick = DetectOptions {
            fast_mode: true,
            min_confidence: QUICK_MIN_CONFIDENCE,
            ..options.clone()
        };
        let outcome = self.detect(frame, &quick);
        if outcome.result.success && outcome.result.confidence >= QUICK_MIN_CONFIDENCE {
            return outcome.result;
        }

        match run_guarded(self.simple.as_ref(), frame, options) {
            Ok(result) => {
                let frame_area = (frame.width() as f64) * (frame.height() as f64);
                let area_ratio = if frame_area > 0.0 {
                    result.area / frame_area
                } else {
                    0.0
                };
                let confidence = quick_fallback_confidence(result.success, area_ratio);
                result
                    .with_confidence(confidence)
                    .with_method(DetectionMethod::SimpleFallback)
            }
            Err(err) => {
                warn!("Quick detection failed: {}", err);
                DetectionResult::failed(frame, 0.0, DetectionMethod::Error)
            }
        }
    }
}

/// Runs one strategy, turning a panic into [`ScanError::Internal`].
fn run_guarded(
    detector: &dyn BoundaryDetector,
    frame: &RgbImage,
    options: &DetectOptions,
) -> Result<DetectionResult, ScanError> {
    match panic::catch_unwind(AssertUnwindSafe(|| detector.detect(frame, options))) {
        Ok(result) => result,
        Err(_) => Err(ScanError::Internal(format!(
            "{} detector panicked",
            detector.name()
        ))),
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::models::Quad;
    use std::sync::atomic::{AtomicUsize, Ordering};

    type Script = dyn Fn(&RgbImage, &DetectOptions) -> Result<DetectionResult, ScanError> + Send + Sync;

    struct Scripted {
        calls: AtomicUsize,
        script: Box<Script>,
    }

    impl Scripted {
        fn new(
            script: impl Fn(&RgbImage, &DetectOptions) -> Result<DetectionResult, ScanError> + Send + Sync + 'static,
        ) -> Arc<Self> {
            Arc::new(Self {
                calls: AtomicUsize::new(0),
                script: Box::new(script),
            })
        }

        fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    impl BoundaryDetector for Scripted {
        fn name(&self) -> &'static str {
            "scripted"
        }

        fn detect(&self, frame: &RgbImage, options: &DetectOptions) -> Result<DetectionResult, ScanError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            (self.script)(frame, options)
        }
    }

    fn hit(frame: &RgbImage, confidence: f64) -> DetectionResult {
        DetectionResult::found(
            Quad::from_rect(10.0, 10.0, 50.0, 70.0),
            confidence,
            DetectionMethod::Simple,
            frame.clone(),
        )
    }

    fn frame() -> RgbImage {
        RgbImage::new(200, 200)
    }

    #[test]
    fn test_simple_hit_short_circuits() {
        let simple = Scripted::new(|f, _| Ok(hit(f, 0.8)));
        let accel = Scripted::new(|f, _| Ok(hit(f, 0.9)));
        let hybrid = HybridDetector::with_strategies(simple.clone(), Some(accel.clone()));

        let outcome = hybrid.detect(&frame(), &DetectOptions::default());
        assert!(outcome.result.success);
        assert_eq!(outcome.result.method, DetectionMethod::Simple);
        assert_eq!(accel.calls(), 0);
    }

    #[test]
    fn test_falls_through_to_accelerated() {
        let simple = Scripted::new(|f, _| Ok(hit(f, 0.1)));
        let accel = Scripted::new(|f, _| Ok(hit(f, 0.6)));
        let hybrid = HybridDetector::with_strategies(simple, Some(accel.clone()));

        let outcome = hybrid.detect(&frame(), &DetectOptions::default());
        assert_eq!(outcome.result.method, DetectionMethod::Accelerated);
        assert_eq!(accel.calls(), 1);
    }

    #[test]
    fn test_fast_mode_skips_accelerated() {
        let simple = Scripted::new(|f, _| Ok(hit(f, 0.1)));
        let accel = Scripted::new(|f, _| Ok(hit(f, 0.9)));
        let hybrid = HybridDetector::with_strategies(simple, Some(accel.clone()));

        let options = DetectOptions {
            fast_mode: true,
            ..DetectOptions::default()
        };
        let outcome = hybrid.detect(&frame(), &options);
        assert!(!outcome.result.success);
        assert_eq!(outcome.result.method, DetectionMethod::None);
        assert_eq!(outcome.result.confidence, 0.1);
        assert_eq!(accel.calls(), 0);
    }

    #[test]
    fn test_adaptive_strategies_are_last_resort() {
        let simple = Scripted::new(|f, _| Ok(DetectionResult::failed(f, 0.0, DetectionMethod::Simple)));
        let accel = Scripted::new(|f, options| match options.edges {
            EdgeThresholds::Fixed { low, .. } if low == 30.0 => Ok(hit(f, 0.5)),
            EdgeThresholds::Fixed { .. } => Ok(hit(f, 0.35)),
            EdgeThresholds::Adaptive => Ok(DetectionResult::failed(f, 0.25, DetectionMethod::Accelerated)),
        });
        let hybrid = HybridDetector::with_strategies(simple, Some(accel.clone()));

        let outcome = hybrid.detect(&frame(), &DetectOptions::default());
        assert!(outcome.result.success);
        assert_eq!(outcome.result.method, DetectionMethod::Adaptive);
        assert_eq!(accel.calls(), 4);
    }

    #[test]
    fn test_failure_reports_best_confidence_and_original_frame() {
        let simple = Scripted::new(|f, _| Ok(DetectionResult::failed(f, 0.15, DetectionMethod::Simple)));
        let accel = Scripted::new(|f, _| Ok(DetectionResult::failed(f, 0.27, DetectionMethod::Accelerated)));
        let hybrid = HybridDetector::with_strategies(simple, Some(accel));

        let input = frame();
        let outcome = hybrid.detect(&input, &DetectOptions::default());
        assert!(!outcome.result.success);
        assert_eq!(outcome.result.confidence, 0.27);
        assert_eq!(outcome.result.rectified, input);
    }

    #[test]
    fn test_panics_degrade_to_failed_result() {
        let simple = Scripted::new(|_, _| panic!("pixel buffer exploded"));
        let hybrid = HybridDetector::with_strategies(simple, None);

        let options = DetectOptions {
            enable_accelerated: false,
            ..DetectOptions::default()
        };
        let outcome = hybrid.detect(&frame(), &options);
        assert!(!outcome.result.success);
        assert_eq!(outcome.result.method, DetectionMethod::Error);
        assert!(!outcome.accelerated_unavailable);
    }

    #[test]
    fn test_unavailable_accelerated_is_flagged() {
        let simple = Scripted::new(|f, _| Ok(DetectionResult::failed(f, 0.0, DetectionMethod::Simple)));
        let accel = Scripted::new(|_, _| Err(ScanError::AcceleratedUnavailable("no library".to_string())));
        let hybrid = HybridDetector::with_strategies(simple.clone(), Some(accel.clone()));

        let outcome = hybrid.detect(&frame(), &DetectOptions::default());
        assert!(outcome.accelerated_unavailable);
        assert_eq!(accel.calls(), 1);

        let missing = HybridDetector::with_strategies(simple, None);
        assert!(missing.detect(&frame(), &DetectOptions::default()).accelerated_unavailable);
    }

    #[test]
    fn test_quick_detect_falls_back_to_simple() {
        let simple = Scripted::new(|f, _| Ok(hit(f, 0.3)));
        let hybrid = HybridDetector::with_strategies(simple.clone(), None);

        let result = hybrid.quick_detect(&frame(), &DetectOptions::default());
        assert!(result.success);
        assert_eq!(result.method, DetectionMethod::SimpleFallback);
        assert_eq!(simple.calls(), 2);
        assert!(result.confidence > 0.3);
    }

    #[test]
    fn test_quick_detect_accepts_confident_simple() {
        let simple = Scripted::new(|f, _| Ok(hit(f, 0.75)));
        let hybrid = HybridDetector::with_strategies(simple, None);

        let result = hybrid.quick_detect(&frame(), &DetectOptions::default());
        assert_eq!(result.method, DetectionMethod::Simple);
        assert_eq!(result.confidence, 0.75);
    }
}

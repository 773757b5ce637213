//! Continuous scanning: a step-driven state machine over detection results,
//! hosted on a tokio timer by [`ScanSession`].

use std::time::Instant;

use image::RgbImage;
use serde::Serialize;

use crate::config::ScanConfig;
use crate::detect::scoring::{cycle_confidence, effective_min_confidence};
use crate::models::{DetectionMethod, DetectionResult, Quad};
use crate::opt::*;

pub mod history;
pub mod session;
pub mod source;

pub use history::{DetectionHistory, HistoryEntry};
pub use session::{ScanHandle, ScanListener, ScanSession, ScanSummary};
pub use source::{DirectoryFrameSource, FrameSource, StillFrameSource};

fn log(s: String) {
    log_if(s.as_str(), DbgFlg::Scan);
}

#[derive(strum_macros::Display, Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[strum(serialize_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum ScanState {
    Idle,
    Scanning,
    Unstable,
    Found,
}

#[derive(Debug, Clone, Serialize)]
pub struct StatusUpdate {
    pub confidence: f64,
    pub avg_confidence: f64,
    pub detected: bool,
    pub state: ScanState,
    /// Corners in the caller's display space.
    pub corners: Option<Quad>,
    pub area: f64,
    pub method: DetectionMethod,
}

/// Handed to the capture callback, at most once per stable detection.
#[derive(Debug, Clone)]
pub struct CaptureEvent {
    pub image: RgbImage,
    /// Average over the stabilization window.
    pub confidence: f64,
    pub corners: Option<Quad>,
    pub detection: DetectionResult,
}

#[derive(Debug)]
pub struct StepReport {
    pub status: StatusUpdate,
    pub capture: Option<CaptureEvent>,
}

/// Proof that a cycle was admitted by the re-entrancy guard.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CycleTicket {
    generation: u64,
}

#[derive(Debug, Clone)]
pub struct CycleInput {
    pub result: DetectionResult,
    pub frame_size: (u32, u32),
    pub display_size: (u32, u32),
    /// The session runs on the simple detector only.
    pub fell_back: bool,
}

/// `Idle -> Scanning <-> Unstable -> Found`, reset to `Idle` on stop.
///
/// Owns the detection history and the in-flight flag; nothing else in the
/// crate keeps state across cycles.
#[derive(Debug)]
pub struct ScanLoop {
    config: ScanConfig,
    history: DetectionHistory,
    in_flight: bool,
    generation: u64,
    state: ScanState,
}

impl ScanLoop {
    pub fn new(config: ScanConfig) -> Self {
        let history = DetectionHistory::new(config.history_window(), config.max_history);
        Self {
            config,
            history,
            in_flight: false,
            generation: 0,
            state: ScanState::Idle,
        }
    }

    pub fn state(&self) -> ScanState {
        self.state
    }

    pub fn history(&self) -> &DetectionHistory {
        &self.history
    }

    pub fn is_in_flight(&self) -> bool {
        self.in_flight
    }

    pub fn try_begin(&mut self) -> Option<CycleTicket> {
        if self.in_flight {
            log("cycle skipped, previous detection still running".to_string());
            return None;
        }
        self.in_flight = true;
        Some(CycleTicket {
            generation: self.generation,
        })
    }

    /// Releases the guard without a result (no frame was available).
    pub fn abandon(&mut self, ticket: CycleTicket) {
        if ticket.generation == self.generation {
            self.in_flight = false;
        }
    }

    /// Folds a finished cycle into the history. Returns `None` when the
    /// ticket predates the last [`ScanLoop::reset`].
    pub fn finish(&mut self, ticket: CycleTicket, input: CycleInput, now: Instant) -> Option<StepReport> {
        if ticket.generation != self.generation {
            log("discarding result of a cycle started before reset".to_string());
            return None;
        }
        self.in_flight = false;

        let CycleInput {
            result,
            frame_size,
            display_size,
            fell_back,
        } = input;
        let frame_area = frame_size.0 as f64 * frame_size.1 as f64;
        let confidence = cycle_confidence(
            result.success,
            result.confidence,
            result.area,
            frame_area,
            fell_back,
        );

        self.history.push(HistoryEntry {
            at: now,
            confidence,
            success: result.success,
            area: result.area,
        });
        self.history.prune(now);

        let window = self.config.stabilization_frames;
        let recent: Vec<&HistoryEntry> = self.history.recent(window).collect();
        let avg_confidence = if recent.is_empty() {
            0.0
        } else {
            recent.iter().map(|e| e.confidence).sum::<f64>() / recent.len() as f64
        };
        let floor = effective_min_confidence(self.config.min_confidence, fell_back);
        let stable = recent.len() >= window
            && recent.iter().all(|e| e.success)
            && avg_confidence >= floor;

        self.state = match (result.success, stable) {
            (true, true) => ScanState::Found,
            (true, false) => ScanState::Unstable,
            (false, _) => ScanState::Scanning,
        };

        let scale_x = if frame_size.0 > 0 {
            display_size.0 as f64 / frame_size.0 as f64
        } else {
            1.0
        };
        let scale_y = if frame_size.1 > 0 {
            display_size.1 as f64 / frame_size.1 as f64
        } else {
            1.0
        };
        let status = StatusUpdate {
            confidence,
            avg_confidence,
            detected: result.success,
            state: self.state,
            corners: result.corners.map(|q| q.scaled(scale_x, scale_y)),
            area: result.area,
            method: result.method,
        };
        log(format!(
            "{} confidence {:.2} avg {:.2} floor {:.2} history {}",
            status.state,
            confidence,
            avg_confidence,
            floor,
            self.history.len()
        ));

        let capture = if self.state == ScanState::Found {
            self.history.clear();
            Some(CaptureEvent {
                image: result.rectified.clone(),
                confidence: avg_confidence,
                corners: result.corners,
                detection: result,
            })
        } else {
            None
        };

        Some(StepReport { status, capture })
    }

    /// Stops the loop: history cleared, guard released, running cycles orphaned.
    pub fn reset(&mut self) {
        self.generation = self.generation.wrapping_add(1);
        self.history.clear();
        self.in_flight = false;
        self.state = ScanState::Idle;
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use std::time::Duration;

    fn config() -> ScanConfig {
        ScanConfig {
            min_confidence: 0.7,
            stabilization_frames: 3,
            ..ScanConfig::default()
        }
    }

    fn detection(success: bool, confidence: f64) -> DetectionResult {
        let frame = RgbImage::new(64, 48);
        if success {
            DetectionResult::found(
                Quad::from_rect(16.0, 8.0, 20.0, 28.0),
                confidence,
                DetectionMethod::Simple,
                RgbImage::new(33, 44),
            )
        } else {
            DetectionResult::failed(&frame, confidence, DetectionMethod::None)
        }
    }

    fn input(success: bool, confidence: f64) -> CycleInput {
        CycleInput {
            result: detection(success, confidence),
            frame_size: (64, 48),
            display_size: (128, 96),
            fell_back: true,
        }
    }

    fn step(scan: &mut ScanLoop, input: CycleInput, now: Instant) -> StepReport {
        let ticket = scan.try_begin().unwrap();
        scan.finish(ticket, input, now).unwrap()
    }

    #[test]
    fn test_reentrant_tick_is_skipped() {
        let mut scan = ScanLoop::new(config());
        let ticket = scan.try_begin().unwrap();
        assert!(scan.try_begin().is_none());
        assert!(scan.is_in_flight());

        scan.finish(ticket, input(false, 0.0), Instant::now()).unwrap();
        assert!(scan.try_begin().is_some());
    }

    #[test]
    fn test_abandon_releases_guard() {
        let mut scan = ScanLoop::new(config());
        let ticket = scan.try_begin().unwrap();
        scan.abandon(ticket);
        assert!(!scan.is_in_flight());
        assert!(scan.history().is_empty());
    }

    #[test]
    fn test_states_progress_to_found() {
        let mut scan = ScanLoop::new(config());
        let now = Instant::now();
        assert_eq!(scan.state(), ScanState::Idle);

        let report = step(&mut scan, input(false, 0.0), now);
        assert_eq!(report.status.state, ScanState::Scanning);

        let report = step(&mut scan, input(true, 0.8), now + Duration::from_millis(500));
        assert_eq!(report.status.state, ScanState::Unstable);
        assert!(report.capture.is_none());

        step(&mut scan, input(true, 0.8), now + Duration::from_millis(1000));
        let report = step(&mut scan, input(true, 0.8), now + Duration::from_millis(1500));
        assert_eq!(report.status.state, ScanState::Found);
        let capture = report.capture.unwrap();
        assert_eq!(capture.image.dimensions(), (33, 44));
        assert!((capture.confidence - 0.8).abs() < 1e-9);
        assert!(scan.history().is_empty());
    }

    #[test]
    fn test_capture_once_per_history_reset() {
        let mut scan = ScanLoop::new(config());
        let start = Instant::now();
        let mut captures = 0;
        for i in 0..9 {
            let len_before = scan.history().len();
            let report = step(&mut scan, input(true, 0.9), start + Duration::from_millis(i * 100));
            if report.capture.is_some() {
                captures += 1;
                assert_eq!(len_before, 2, "capture without a full window");
                assert!(scan.history().is_empty());
            }
        }
        assert_eq!(captures, 3);
    }

    #[test]
    fn test_failure_inside_window_blocks_capture() {
        let mut scan = ScanLoop::new(config());
        let start = Instant::now();
        step(&mut scan, input(true, 0.9), start);
        step(&mut scan, input(false, 0.0), start + Duration::from_millis(100));
        let report = step(&mut scan, input(true, 0.9), start + Duration::from_millis(200));
        assert_eq!(report.status.state, ScanState::Unstable);
        assert!(report.capture.is_none());
    }

    #[test]
    fn test_fallback_relaxes_floor() {
        let mut scan = ScanLoop::new(config());
        let start = Instant::now();
        let mut found = false;
        for i in 0..3 {
            found |= step(&mut scan, input(true, 0.35), start + Duration::from_millis(i * 100))
                .capture
                .is_some();
        }
        assert!(found);
    }

    #[test]
    fn test_full_stack_rescored_on_frame_share() {
        let mut scan = ScanLoop::new(config());
        let start = Instant::now();
        let filling = || CycleInput {
            result: DetectionResult::found(
                Quad::from_rect(0.0, 0.0, 64.0, 48.0),
                0.95,
                DetectionMethod::Accelerated,
                RgbImage::new(33, 44),
            ),
            frame_size: (64, 48),
            display_size: (64, 48),
            fell_back: false,
        };
        for i in 0..3 {
            let report = step(&mut scan, filling(), start + Duration::from_millis(i * 100));
            assert!((report.status.confidence - 0.3).abs() < 1e-9);
            assert!(report.capture.is_none());
        }
    }

    #[test]
    fn test_result_after_reset_is_discarded() {
        let mut scan = ScanLoop::new(config());
        let ticket = scan.try_begin().unwrap();
        scan.reset();
        assert!(scan.finish(ticket, input(true, 0.9), Instant::now()).is_none());
        assert!(scan.history().is_empty());
        assert!(!scan.is_in_flight());
        assert_eq!(scan.state(), ScanState::Idle);
    }

    #[test]
    fn test_history_window_expires_old_successes() {
        let mut scan = ScanLoop::new(config());
        let start = Instant::now();
        step(&mut scan, input(true, 0.9), start);
        step(&mut scan, input(true, 0.9), start + Duration::from_secs(1));
        let report = step(&mut scan, input(true, 0.9), start + Duration::from_secs(7));
        assert!(report.capture.is_none());
        assert_eq!(scan.history().len(), 1);
    }

    #[test]
    fn test_status_corners_are_scaled_to_display() {
        let mut scan = ScanLoop::new(config());
        let report = step(&mut scan, input(true, 0.9), Instant::now());
        let corners = report.status.corners.unwrap();
        assert_eq!(corners.top_left.x, 32.0);
        assert_eq!(corners.bottom_right.y, 72.0);
    }
}

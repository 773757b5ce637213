use std::sync::Arc;
use std::time::Instant;

use image::RgbImage;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::{self, MissedTickBehavior};
use tracing::{info, warn};

use super::source::FrameSource;
use super::{CaptureEvent, CycleInput, CycleTicket, ScanLoop, StatusUpdate};
use crate::config::{ScanConfig, ScannerConfig};
use crate::detect::{DetectOptions, HybridDetector, HybridOutcome};
use crate::error::ConfigError;
use crate::models::DetectionResult;

const SESSION_ID_LENGTH: usize = 8;
const SESSION_ID_ALPHABET: &str = "0123456789abcdefghijklmnopqrstuvwxyz";

pub trait ScanListener: Send + Sync + 'static {
    fn on_status(&self, status: &StatusUpdate);

    fn on_capture(&self, capture: CaptureEvent);
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ScanSummary {
    pub ticks: u64,
    pub cycles: u64,
    /// Ticks dropped because a detection was still running.
    pub skipped: u64,
    /// Ticks with no frame available.
    pub idle: u64,
    pub captures: u64,
    pub discarded: u64,
}

pub struct ScanSession {
    id: String,
    config: ScanConfig,
    options: DetectOptions,
    detector: Arc<HybridDetector>,
    fell_back: bool,
}

impl ScanSession {
    pub fn new(config: &ScannerConfig) -> Result<Self, ConfigError> {
        let detector = HybridDetector::new(&config.detect)?;
        Self::with_detector(config, detector)
    }

    pub fn with_detector(config: &ScannerConfig, detector: HybridDetector) -> Result<Self, ConfigError> {
        config.validate()?;
        let id = nanoid::nanoid!(
            SESSION_ID_LENGTH,
            &SESSION_ID_ALPHABET.chars().collect::<Vec<char>>()
        );
        let mut options = DetectOptions::from(&config.detect);
        options.min_area = config.scan.min_area;

        let mut session = Self {
            id,
            config: config.scan.clone(),
            options,
            detector: Arc::new(detector),
            fell_back: false,
        };
        if !config.detect.enable_accelerated || !session.detector.has_accelerated() {
            session.fall_back("accelerated detector not available at startup");
        }
        Ok(session)
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    /// The session runs on the simple detector only.
    pub fn is_fallback(&self) -> bool {
        self.fell_back
    }

    fn fall_back(&mut self, reason: &str) {
        if self.fell_back {
            return;
        }
        self.fell_back = true;
        self.options.enable_accelerated = false;
        warn!("Session {} using simple detection: {}", self.id, reason);
    }

    pub fn quick_detect(&self, frame: &RgbImage) -> DetectionResult {
        self.detector.quick_detect(frame, &self.options)
    }

    /// Starts the timer. Events go to `listener` until the handle is stopped
    /// or dropped.
    pub fn start<S, L>(self, source: S, listener: Arc<L>) -> ScanHandle
    where
        S: FrameSource,
        L: ScanListener,
    {
        let (stop_tx, stop_rx) = oneshot::channel();
        let id = self.id.clone();
        info!(
            "Scan session {} started, interval {:?}",
            id,
            self.config.interval()
        );
        let task = tokio::spawn(self.run(source, listener, stop_rx));
        ScanHandle {
            id,
            stop: Some(stop_tx),
            task,
        }
    }

    async fn run<S, L>(mut self, mut source: S, listener: Arc<L>, mut stop_rx: oneshot::Receiver<()>) -> ScanSummary
    where
        S: FrameSource,
        L: ScanListener,
    {
        let mut scan = ScanLoop::new(self.config.clone());
        let mut summary = ScanSummary::default();
        let (result_tx, mut result_rx) = mpsc::channel::<(CycleTicket, HybridOutcome, (u32, u32))>(1);

        let mut ticker = time::interval(self.config.interval());
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = &mut stop_rx => break,
                _ = ticker.tick() => {
                    summary.ticks += 1;
                    let Some(ticket) = scan.try_begin() else {
                        summary.skipped += 1;
                        continue;
                    };
                    let Some(frame) = source.next_frame() else {
                        summary.idle += 1;
                        scan.abandon(ticket);
                        continue;
                    };

                    let detector = self.detector.clone();
                    let options = self.options.clone();
                    let tx = result_tx.clone();
                    tokio::task::spawn_blocking(move || {
                        let size = frame.dimensions();
                        let outcome = detector.detect(&frame, &options);
                        // The receiver is gone once the session stopped.
                        let _ = tx.blocking_send((ticket, outcome, size));
                    });
                }
                Some((ticket, outcome, frame_size)) = result_rx.recv() => {
                    summary.cycles += 1;
                    if outcome.accelerated_unavailable {
                        self.fall_back("accelerated detector failed to run");
                    }
                    let input = CycleInput {
                        result: outcome.result,
                        frame_size,
                        display_size: source.display_size().unwrap_or(frame_size),
                        fell_back: self.fell_back,
                    };
                    match scan.finish(ticket, input, Instant::now()) {
                        None => summary.discarded += 1,
                        Some(report) => {
                            listener.on_status(&report.status);
                            if let Some(capture) = report.capture {
                                summary.captures += 1;
                                info!(
                                    "Session {} captured card, confidence {:.2}",
                                    self.id, capture.confidence
                                );
                                listener.on_capture(capture);
                            }
                        }
                    }
                }
            }
        }

        scan.reset();
        info!(
            "Scan session {} stopped after {} ticks, {} captures",
            self.id, summary.ticks, summary.captures
        );
        summary
    }
}

pub struct ScanHandle {
    id: String,
    stop: Option<oneshot::Sender<()>>,
    task: JoinHandle<ScanSummary>,
}

impl ScanHandle {
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Stops the timer and waits for the session task. A detection still
    /// running finishes in the background and its result is dropped.
    pub async fn stop(mut self) -> ScanSummary {
        if let Some(stop) = self.stop.take() {
            let _ = stop.send(());
        }
        match self.task.await {
            Ok(summary) => summary,
            Err(err) => {
                warn!("Scan session {} ended abnormally: {}", self.id, err);
                ScanSummary::default()
            }
        }
    }
}

//! Dependency-free card boundary estimate from Sobel edges.

use image::RgbImage;

use super::geometry::rectify;
use super::scoring::{SimpleWeights, CARD_ASPECT_RATIO};
use super::{luma, BoundaryDetector, DetectOptions};
use crate::error::ScanError;
use crate::models::{DetectionMethod, DetectionResult, Quad};
use crate::opt::*;

const STRONG: u8 = 255;
const WEAK: u8 = 128;

/// Centered search windows as (share of width, share of height).
const CENTER_ESTIMATES: [(f64, f64); 3] = [(0.5, 0.6), (0.4, 0.5), (0.35, 0.45)];

fn log(s: String) {
    log_if(s.as_str(), DbgFlg::Detect);
}

#[derive(Debug, Clone, PartialEq)]
pub struct SimpleParams {
    /// Every n-th pixel in x and y is sampled for edge points.
    pub sample_step: u32,
    pub min_edge_points: usize,
    /// Bounding boxes above this share of the frame are background noise.
    pub whole_frame_ratio: f64,
    pub large_area_ratio: f64,
    pub min_area_ratio: f64,
    pub max_area_ratio: f64,
    pub min_side: f64,
    /// Sampled edge density a normal box must exceed. A clean card outline
    /// sampled every 4 px sits around 0.04.
    pub min_edge_density: f64,
    pub min_edge_density_large: f64,
    pub center_min_density: f64,
    pub center_min_area: f64,
    pub center_max_area_ratio: f64,
    pub forced_min_area: f64,
    pub forced_min_points: usize,
    pub forced_min_density: f64,
}

impl Default for SimpleParams {
    fn default() -> Self {
        Self {
            sample_step: 4,
            min_edge_points: 50,
            whole_frame_ratio: 0.9,
            large_area_ratio: 0.7,
            min_area_ratio: 0.10,
            max_area_ratio: 0.85,
            min_side: 80.0,
            min_edge_density: 0.02,
            min_edge_density_large: 0.15,
            center_min_density: 0.05,
            center_min_area: 30_000.0,
            center_max_area_ratio: 0.80,
            forced_min_area: 50_000.0,
            forced_min_points: 100,
            forced_min_density: 0.1,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct SimpleDetector {
    pub params: SimpleParams,
    pub weights: SimpleWeights,
}

struct EdgeSample {
    width: f64,
    height: f64,
    points: Vec<(u32, u32)>,
}

impl EdgeSample {
    fn count_within(&self, min_x: f64, max_x: f64, min_y: f64, max_y: f64) -> usize {
        self.points
            .iter()
            .filter(|(x, y)| {
                let (x, y) = (*x as f64, *y as f64);
                x >= min_x && x <= max_x && y >= min_y && y <= max_y
            })
            .count()
    }
}

impl SimpleDetector {
    pub fn new(params: SimpleParams, weights: SimpleWeights) -> Self {
        Self { params, weights }
    }

    fn sample_edges(&self, frame: &RgbImage) -> EdgeSample {
        let (width, height) = frame.dimensions();
        let edges = edge_map(frame);
        let step = self.params.sample_step.max(1) as usize;

        let mut points = Vec::new();
        for y in (0..height).step_by(step) {
            for x in (0..width).step_by(step) {
                if edges[(y * width + x) as usize] > 0 {
                    points.push((x, y));
                }
            }
        }
        EdgeSample {
            width: width as f64,
            height: height as f64,
            points,
        }
    }

    fn sampled_density(&self, points: usize, area: f64) -> f64 {
        let cell = (self.params.sample_step * self.params.sample_step) as f64;
        if area <= 0.0 {
            return 0.0;
        }
        points as f64 / (area / cell)
    }

    /// Scores every centered card-shaped window and keeps the one with the
    /// highest edge density, ties going to the higher confidence.
    fn center_search(&self, sample: &EdgeSample) -> Option<(Quad, f64)> {
        let p = &self.params;
        let frame_area = sample.width * sample.height;
        let (cx, cy) = (sample.width / 2.0, sample.height / 2.0);

        let mut best: Option<(Quad, f64, f64)> = None;
        for (width_share, height_share) in CENTER_ESTIMATES {
            let card_w = (sample.width * width_share).min(sample.height * height_share);
            let card_h = card_w / CARD_ASPECT_RATIO;

            let min_x = (cx - card_w / 2.0).max(0.0);
            let max_x = (cx + card_w / 2.0).min(sample.width);
            let min_y = (cy - card_h / 2.0).max(0.0);
            let max_y = (cy + card_h / 2.0).min(sample.height);
            let (w, h) = (max_x - min_x, max_y - min_y);
            let area = w * h;

            let density = self.sampled_density(sample.count_within(min_x, max_x, min_y, max_y), area);
            log(format!(
                "center window {:.0}x{:.0} density {:.3} area ratio {:.2}",
                w,
                h,
                density,
                area / frame_area
            ));

            if density <= p.center_min_density || area <= p.center_min_area {
                continue;
            }
            let area_ratio = area / frame_area;
            let has_structure = area_ratio > p.min_area_ratio
                && area_ratio < p.center_max_area_ratio
                && w > p.min_side
                && h > p.min_side;
            if !has_structure {
                continue;
            }
            let confidence = self.weights.center_confidence(area_ratio, w / h, density);
            let better = match &best {
                None => true,
                Some((_, best_density, best_confidence)) => {
                    density > *best_density || (density == *best_density && confidence > *best_confidence)
                }
            };
            if better {
                best = Some((Quad::from_rect(min_x, min_y, w, h), density, confidence));
            }
        }
        best.map(|(quad, _, confidence)| (quad, confidence))
    }

    fn found(
        &self,
        frame: &RgbImage,
        quad: Quad,
        confidence: f64,
        options: &DetectOptions,
    ) -> Result<DetectionResult, ScanError> {
        let rectified = rectify(frame, &quad, options.target_width, options.target_height)?;
        Ok(DetectionResult::found(
            quad,
            confidence,
            DetectionMethod::Simple,
            rectified,
        ))
    }
}

impl BoundaryDetector for SimpleDetector {
    fn name(&self) -> &'static str {
        "simple"
    }

    fn detect(&self, frame: &RgbImage, options: &DetectOptions) -> Result<DetectionResult, ScanError> {
        let (width, height) = frame.dimensions();
        if width < 5 || height < 5 {
            return Err(ScanError::InputUnavailable);
        }
        let p = &self.params;
        let sample = self.sample_edges(frame);

        if sample.points.len() < p.min_edge_points {
            log(format!("only {} edge points sampled", sample.points.len()));
            return Ok(DetectionResult::failed(frame, 0.0, DetectionMethod::Simple));
        }

        let (mut min_x, mut max_x, mut min_y, mut max_y) = (u32::MAX, 0, u32::MAX, 0);
        for (x, y) in &sample.points {
            min_x = min_x.min(*x);
            max_x = max_x.max(*x);
            min_y = min_y.min(*y);
            max_y = max_y.max(*y);
        }
        let rect_w = (max_x - min_x) as f64;
        let rect_h = (max_y - min_y) as f64;
        let rect_area = rect_w * rect_h;
        let frame_area = sample.width * sample.height;
        let area_ratio = rect_area / frame_area;
        // Every sampled point lies inside its own bounding box.
        let density = self.sampled_density(sample.points.len(), rect_area);

        let whole_frame = area_ratio > p.whole_frame_ratio;
        if whole_frame {
            if let Some((quad, confidence)) = self.center_search(&sample) {
                log(format!("center search hit, confidence {:.2}", confidence));
                return self.found(frame, quad, confidence, options);
            }
        }

        let large = area_ratio > p.large_area_ratio && area_ratio <= p.whole_frame_ratio;
        let min_density = if large {
            p.min_edge_density_large
        } else {
            p.min_edge_density
        };
        let has_structure = !whole_frame
            && area_ratio > p.min_area_ratio
            && area_ratio < p.max_area_ratio
            && rect_w > p.min_side
            && rect_h > p.min_side
            && rect_area >= options.min_area
            && density > min_density;

        log(format!(
            "box {}x{} ratio {:.2} points {} density {:.3} large {} structure {}",
            rect_w,
            rect_h,
            area_ratio,
            sample.points.len(),
            density,
            large,
            has_structure
        ));

        let quad = Quad::from_rect(min_x as f64, min_y as f64, rect_w, rect_h);
        if has_structure {
            let confidence = self
                .weights
                .box_confidence(area_ratio, rect_w / rect_h, density, large);
            return self.found(frame, quad, confidence, options);
        }

        let partial = rect_area > p.forced_min_area
            && sample.points.len() > p.forced_min_points
            && area_ratio > 0.05
            && area_ratio < p.whole_frame_ratio;
        if partial && area_ratio > p.large_area_ratio && density > p.forced_min_density {
            return self.found(frame, quad, self.weights.min_confidence, options);
        }

        let confidence = if partial { 0.15 } else { 0.0 };
        Ok(DetectionResult::failed(frame, confidence, DetectionMethod::Simple))
    }
}

/// Smoothed Sobel edge map with adaptive double thresholds and a single
/// hysteresis pass. Values are 0 or [`STRONG`].
fn edge_map(frame: &RgbImage) -> Vec<u8> {
    let (width, height) = frame.dimensions();
    let (w, h) = (width as usize, height as usize);

    let gray: Vec<u8> = frame.pixels().map(|p| luma(p[0], p[1], p[2])).collect();
    let blurred = blur3(&gray, w, h);

    let n = blurred.len() as f64;
    let sum: f64 = blurred.iter().map(|v| *v as f64).sum();
    let sum_sq: f64 = blurred.iter().map(|v| (*v as f64).powi(2)).sum();
    let mean = sum / n;
    let stddev = (sum_sq / n - mean * mean).max(0.0).sqrt();

    let low = (mean * 0.3).clamp(20.0, 80.0);
    let high = (mean + stddev * 1.5).clamp(40.0, 160.0);

    let mut edges = vec![0u8; w * h];
    let at = |x: usize, y: usize| blurred[y * w + x] as i32;
    for y in 2..h.saturating_sub(2) {
        for x in 2..w.saturating_sub(2) {
            let gx = -at(x - 1, y - 1) + at(x + 1, y - 1) - 2 * at(x - 1, y) + 2 * at(x + 1, y)
                - at(x - 1, y + 1)
                + at(x + 1, y + 1);
            let gy = -at(x - 1, y - 1) - 2 * at(x, y - 1) - at(x + 1, y - 1)
                + at(x - 1, y + 1)
                + 2 * at(x, y + 1)
                + at(x + 1, y + 1);
            let magnitude = ((gx * gx + gy * gy) as f64).sqrt();
            edges[y * w + x] = if magnitude > high {
                STRONG
            } else if magnitude > low {
                WEAK
            } else {
                0
            };
        }
    }

    for y in 2..h.saturating_sub(2) {
        for x in 2..w.saturating_sub(2) {
            let idx = y * w + x;
            if edges[idx] != WEAK {
                continue;
            }
            let connected = (y - 1..=y + 1)
                .flat_map(|ny| (x - 1..=x + 1).map(move |nx| (nx, ny)))
                .any(|(nx, ny)| (nx, ny) != (x, y) && edges[ny * w + nx] == STRONG);
            edges[idx] = if connected { STRONG } else { 0 };
        }
    }
    edges
}

/// 3x3 binomial blur; the one pixel border keeps its input value.
fn blur3(gray: &[u8], w: usize, h: usize) -> Vec<u8> {
    let mut out = gray.to_vec();
    for y in 1..h.saturating_sub(1) {
        for x in 1..w.saturating_sub(1) {
            let g = |dx: usize, dy: usize| gray[(y + dy - 1) * w + (x + dx - 1)] as u32;
            let sum = g(0, 0) + 2 * g(1, 0) + g(2, 0)
                + 2 * g(0, 1)
                + 4 * g(1, 1)
                + 2 * g(2, 1)
                + g(0, 2)
                + 2 * g(1, 2)
                + g(2, 2);
            out[y * w + x] = ((sum as f64) / 16.0).round() as u8;
        }
    }
    out
}

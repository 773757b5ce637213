//! Oriented FAST keypoints with rotated BRIEF descriptors.

use image::{imageops, GrayImage, RgbImage};
use imageproc::corners::{corners_fast9, Corner};
use imageproc::filter::gaussian_blur_f32;
use lazy_static::lazy_static;
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;

use crate::models::{Descriptor, DescriptorSet, Keypoint, DESCRIPTOR_BYTES};
use crate::opt::*;

const DESCRIPTOR_BITS: usize = DESCRIPTOR_BYTES * 8;
/// Test pairs stay inside this radius, so any rotation of them does too.
const PATTERN_RADIUS: i32 = 12;
const PATTERN_SEED: u64 = 0x0b5e_55ed_c0de_0042;

lazy_static! {
    /// Fixed BRIEF test pairs; every descriptor ever computed uses the same set.
    static ref SAMPLING_PATTERN: Vec<[(f64, f64); 2]> = {
        let mut rng = ChaCha8Rng::seed_from_u64(PATTERN_SEED);
        let mut point = || loop {
            let x = rng.gen_range(-PATTERN_RADIUS..=PATTERN_RADIUS);
            let y = rng.gen_range(-PATTERN_RADIUS..=PATTERN_RADIUS);
            if x * x + y * y <= PATTERN_RADIUS * PATTERN_RADIUS {
                return (x as f64, y as f64);
            }
        };
        (0..DESCRIPTOR_BITS).map(|_| [point(), point()]).collect()
    };
}

fn log(s: String) {
    log_if(s.as_str(), DbgFlg::Match);
}

#[derive(Debug, Clone, PartialEq)]
pub struct OrbParams {
    pub max_features: usize,
    pub fast_threshold: u8,
    /// Radius of the patch used for orientation; also the image border kept clear.
    pub patch_radius: u32,
    /// Keep at most one keypoint per grid cell of this size.
    pub grid_cell: u32,
    pub blur_sigma: f32,
}

impl Default for OrbParams {
    fn default() -> Self {
        Self {
            max_features: 500,
            fast_threshold: 20,
            patch_radius: 15,
            grid_cell: 8,
            blur_sigma: 2.0,
        }
    }
}

pub fn detect_and_describe(image: &RgbImage, params: &OrbParams) -> DescriptorSet {
    let gray = imageops::grayscale(image);
    let (width, height) = gray.dimensions();
    let border = params.patch_radius + 1;
    if width <= 2 * border || height <= 2 * border {
        return DescriptorSet::default();
    }

    let corners = strongest_corners(&gray, params, border);
    let smoothed = gaussian_blur_f32(&gray, params.blur_sigma);

    let mut set = DescriptorSet::default();
    for corner in corners {
        let angle = orientation(&gray, corner.x, corner.y, params.patch_radius as i32);
        let descriptor = describe(&smoothed, corner.x, corner.y, angle);
        let degrees = angle.to_degrees().rem_euclid(360.0);
        set.push(
            Keypoint {
                x: corner.x as f64,
                y: corner.y as f64,
                size: (2 * params.patch_radius + 1) as f64,
                angle: if degrees >= 360.0 { 0.0 } else { degrees },
                response: corner.score as f64,
            },
            descriptor,
        );
    }
    log(format!("{} keypoints described", set.len()));
    set
}

/// FAST-9 corners away from the border, thinned to the best one per grid
/// cell, strongest first.
fn strongest_corners(gray: &GrayImage, params: &OrbParams, border: u32) -> Vec<Corner> {
    let (width, height) = gray.dimensions();
    let cell = params.grid_cell.max(1);
    let cols = (width / cell + 1) as usize;
    let rows = (height / cell + 1) as usize;
    let mut grid: Vec<Option<Corner>> = vec![None; cols * rows];

    for corner in corners_fast9(gray, params.fast_threshold) {
        if corner.x < border
            || corner.y < border
            || corner.x >= width - border
            || corner.y >= height - border
        {
            continue;
        }
        let slot = &mut grid[(corner.y / cell) as usize * cols + (corner.x / cell) as usize];
        if slot.map_or(true, |kept| corner.score > kept.score) {
            *slot = Some(corner);
        }
    }

    let mut corners: Vec<Corner> = grid.into_iter().flatten().collect();
    corners.sort_by(|a, b| b.score.total_cmp(&a.score));
    corners.truncate(params.max_features);
    corners
}

/// Intensity centroid angle (radians) of the disc around `(cx, cy)`.
fn orientation(gray: &GrayImage, cx: u32, cy: u32, radius: i32) -> f64 {
    let (mut m01, mut m10) = (0.0f64, 0.0f64);
    for dy in -radius..=radius {
        for dx in -radius..=radius {
            if dx * dx + dy * dy > radius * radius {
                continue;
            }
            let x = (cx as i32 + dx) as u32;
            let y = (cy as i32 + dy) as u32;
            let intensity = gray.get_pixel(x, y)[0] as f64;
            m10 += dx as f64 * intensity;
            m01 += dy as f64 * intensity;
        }
    }
    m01.atan2(m10)
}

fn describe(smoothed: &GrayImage, cx: u32, cy: u32, angle: f64) -> Descriptor {
    let (sin, cos) = angle.sin_cos();
    let sample = |(px, py): (f64, f64)| {
        let x = cx as f64 + (cos * px - sin * py).round();
        let y = cy as f64 + (sin * px + cos * py).round();
        smoothed.get_pixel(x as u32, y as u32)[0]
    };

    let mut descriptor = [0u8; DESCRIPTOR_BYTES];
    for (i, [p, q]) in SAMPLING_PATTERN.iter().enumerate() {
        if sample(*p) < sample(*q) {
            descriptor[i / 8] |= 1 << (i % 8);
        }
    }
    descriptor
}

use image::{imageops, imageops::FilterType, Rgb, RgbImage};
use imageproc::geometric_transformations::{warp_into, Interpolation, Projection};

use crate::error::ScanError;
use crate::models::{Point, Quad};

/// Orders four points as top-left, top-right, bottom-left, bottom-right.
///
/// Top-left has the smallest `x + y`, bottom-right the largest; top-right
/// has the largest `x - y`, bottom-left the smallest.
pub fn order_corners(points: [Point; 4]) -> Quad {
    Quad {
        top_left: extreme(&points, |p| p.x + p.y, false),
        top_right: extreme(&points, |p| p.x - p.y, true),
        bottom_left: extreme(&points, |p| p.x - p.y, false),
        bottom_right: extreme(&points, |p| p.x + p.y, true),
    }
}

fn extreme(points: &[Point; 4], key: impl Fn(&Point) -> f64, max: bool) -> Point {
    let mut best = points[0];
    for p in points.iter().skip(1) {
        let better = if max {
            key(p) > key(&best)
        } else {
            key(p) < key(&best)
        };
        if better {
            best = *p;
        }
    }
    best
}

pub fn rectify(frame: &RgbImage, quad: &Quad, width: u32, height: u32) -> Result<RgbImage, ScanError> {
    if width == 0 || height == 0 {
        return Err(ScanError::Internal(format!(
            "invalid rectify target {}x{}",
            width, height
        )));
    }
    if frame.width() == 0 || frame.height() == 0 {
        return Err(ScanError::InputUnavailable);
    }

    if quad.is_axis_aligned(1.0) {
        return crop_and_resize(frame, quad, width, height);
    }

    let to_f32 = |p: Point| (p.x as f32, p.y as f32);
    let from = [
        to_f32(quad.top_left),
        to_f32(quad.top_right),
        to_f32(quad.bottom_right),
        to_f32(quad.bottom_left),
    ];
    let (w, h) = (width as f32, height as f32);
    let to = [(0.0, 0.0), (w - 1.0, 0.0), (w - 1.0, h - 1.0), (0.0, h - 1.0)];

    let projection = Projection::from_control_points(from, to)
        .ok_or_else(|| ScanError::DetectionFailure("degenerate quadrilateral".to_string()))?;
    let mut out = RgbImage::new(width, height);
    warp_into(frame, &projection, Interpolation::Bilinear, Rgb([0, 0, 0]), &mut out);
    Ok(out)
}

fn crop_and_resize(frame: &RgbImage, quad: &Quad, width: u32, height: u32) -> Result<RgbImage, ScanError> {
    let bbox = quad.bounding_box();
    let x = bbox.x.round().clamp(0.0, (frame.width() - 1) as f64) as u32;
    let y = bbox.y.round().clamp(0.0, (frame.height() - 1) as f64) as u32;
    let w = (bbox.width.round() as u32).clamp(1, frame.width() - x);
    let h = (bbox.height.round() as u32).clamp(1, frame.height() - y);

    let cropped = imageops::crop_imm(frame, x, y, w, h).to_image();
    Ok(imageops::resize(&cropped, width, height, FilterType::Triangle))
}

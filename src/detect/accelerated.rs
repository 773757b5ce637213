//! Contour based card detection on top of OpenCV.
//!
//! Built only with the `opencv` feature. Without it [`probe`] reports the
//! capability as missing and [`AcceleratedDetector::detect`] returns
//! [`ScanError::AcceleratedUnavailable`].

use image::RgbImage;

use super::scoring::ContourWeights;
use super::{BoundaryDetector, DetectOptions};
use crate::error::ScanError;
use crate::models::DetectionResult;

#[derive(Debug, Clone, Default)]
pub struct AcceleratedDetector {
    pub weights: ContourWeights,
}

impl AcceleratedDetector {
    pub fn new(weights: ContourWeights) -> Self {
        Self { weights }
    }
}

/// One-time capability check: can the native vision library run at all?
pub fn probe() -> bool {
    #[cfg(feature = "opencv")]
    {
        native::probe().is_ok()
    }
    #[cfg(not(feature = "opencv"))]
    {
        false
    }
}

impl BoundaryDetector for AcceleratedDetector {
    fn name(&self) -> &'static str {
        "accelerated"
    }

    #[cfg(feature = "opencv")]
    fn detect(&self, frame: &RgbImage, options: &DetectOptions) -> Result<DetectionResult, ScanError> {
        native::detect(&self.weights, frame, options)
    }

    #[cfg(not(feature = "opencv"))]
    fn detect(&self, _frame: &RgbImage, _options: &DetectOptions) -> Result<DetectionResult, ScanError> {
        Err(ScanError::AcceleratedUnavailable(
            "built without the opencv feature".to_string(),
        ))
    }
}

pub fn adaptive_canny_thresholds(mean: f64, stddev: f64) -> (f64, f64) {
    let low = (mean * 0.5).clamp(30.0, 150.0);
    let high = (mean + stddev * 2.0).clamp(60.0, 300.0);
    (low, high)
}

#[cfg(feature = "opencv")]
mod native {
    use image::RgbImage;
    use opencv::{core, imgproc, prelude::*};

    use super::adaptive_canny_thresholds;
    use crate::detect::geometry::order_corners;
    use crate::detect::scoring::ContourWeights;
    use crate::detect::{DetectOptions, EdgeThresholds};
    use crate::error::ScanError;
    use crate::models::{DetectionMethod, DetectionResult, Point, Quad};
    use crate::opt::*;

    fn log(s: String) {
        log_if(s.as_str(), DbgFlg::Detect);
    }

    pub fn probe() -> Result<(), ScanError> {
        let frame = RgbImage::new(2, 2);
        let src = to_mat(&frame)?;
        let mut gray = Mat::default();
        imgproc::cvt_color(&src, &mut gray, imgproc::COLOR_RGB2GRAY, 0)?;
        Ok(())
    }

    fn to_mat(frame: &RgbImage) -> Result<Mat, ScanError> {
        let (w, h) = frame.dimensions();
        let mut mat = Mat::new_rows_cols_with_default(
            h as i32,
            w as i32,
            core::CV_8UC3,
            core::Scalar::all(0.0),
        )?;
        mat.data_bytes_mut()?.copy_from_slice(frame.as_raw());
        Ok(mat)
    }

    fn to_image(mat: &Mat) -> Result<RgbImage, ScanError> {
        let (w, h) = (mat.cols() as u32, mat.rows() as u32);
        let bytes = mat.data_bytes()?.to_vec();
        RgbImage::from_raw(w, h, bytes)
            .ok_or_else(|| ScanError::Internal("warped buffer size mismatch".to_string()))
    }

    struct Candidate {
        score: f64,
        corners: core::Vector<core::Point>,
        rect: core::Rect,
    }

    pub fn detect(
        weights: &ContourWeights,
        frame: &RgbImage,
        options: &DetectOptions,
    ) -> Result<DetectionResult, ScanError> {
        let src = to_mat(frame)?;

        let mut gray = Mat::default();
        imgproc::cvt_color(&src, &mut gray, imgproc::COLOR_RGB2GRAY, 0)?;

        let (low, high, method) = match options.edges {
            EdgeThresholds::Adaptive => {
                let mut mean = core::Vector::<f64>::new();
                let mut stddev = core::Vector::<f64>::new();
                core::mean_std_dev(&gray, &mut mean, &mut stddev, &Mat::default())?;
                let (low, high) = adaptive_canny_thresholds(mean.get(0)?, stddev.get(0)?);
                (low, high, DetectionMethod::Accelerated)
            }
            EdgeThresholds::Fixed { low, high } => (low, high, DetectionMethod::Adaptive),
        };

        let mut enhanced = Mat::default();
        let mut clahe = imgproc::create_clahe(2.0, core::Size::new(8, 8))?;
        clahe.apply(&gray, &mut enhanced)?;

        let mut blurred = Mat::default();
        imgproc::gaussian_blur(
            &enhanced,
            &mut blurred,
            core::Size::new(5, 5),
            0.0,
            0.0,
            core::BORDER_DEFAULT,
        )?;

        let mut edges = Mat::default();
        imgproc::canny(&blurred, &mut edges, low, high, 3, false)?;

        let kernel = imgproc::get_structuring_element(
            imgproc::MORPH_RECT,
            core::Size::new(5, 5),
            core::Point::new(-1, -1),
        )?;
        let mut closed = Mat::default();
        imgproc::morphology_ex(
            &edges,
            &mut closed,
            imgproc::MORPH_CLOSE,
            &kernel,
            core::Point::new(-1, -1),
            1,
            core::BORDER_CONSTANT,
            imgproc::morphology_default_border_value()?,
        )?;

        let mut contours = core::Vector::<core::Vector<core::Point>>::new();
        imgproc::find_contours(
            &closed,
            &mut contours,
            imgproc::RETR_EXTERNAL,
            imgproc::CHAIN_APPROX_SIMPLE,
            core::Point::new(0, 0),
        )?;

        let frame_area = (frame.width() * frame.height()) as f64;
        let mut best: Option<Candidate> = None;
        for contour in contours.iter() {
            let area = imgproc::contour_area(&contour, false)?;
            if area < options.min_area {
                continue;
            }

            let mut approx = core::Vector::<core::Point>::new();
            let epsilon = 0.02 * imgproc::arc_length(&contour, true)?;
            imgproc::approx_poly_dp(&contour, &mut approx, epsilon, true)?;

            let mut hull = core::Vector::<core::Point>::new();
            imgproc::convex_hull(&contour, &mut hull, false, true)?;
            let hull_area = imgproc::contour_area(&hull, false)?;
            let convexity = if hull_area > 0.0 { area / hull_area } else { 0.0 };

            let rect = imgproc::bounding_rect(&approx)?;
            let box_ratio = if rect.height > 0 {
                rect.width as f64 / rect.height as f64
            } else {
                0.0
            };

            let score = weights.polygon_score(approx.len(), area / frame_area, convexity, box_ratio);
            if score > best.as_ref().map_or(0.0, |b| b.score) {
                best = Some(Candidate {
                    score,
                    corners: approx,
                    rect,
                });
            }
        }

        let Some(best) = best else {
            log(format!("no contour candidates ({} contours)", contours.len()));
            return Ok(DetectionResult::failed(frame, 0.0, method));
        };

        let points: [Point; 4] = if best.corners.len() == 4 {
            let mut points = [Point::default(); 4];
            for (i, p) in best.corners.iter().enumerate() {
                points[i] = Point::new(p.x as f64, p.y as f64);
            }
            points
        } else {
            let r = best.rect;
            Quad::from_rect(r.x as f64, r.y as f64, r.width as f64, r.height as f64).points()
        };
        let quad = order_corners(points);

        let (tw, th) = (options.target_width as f32, options.target_height as f32);
        let src_points = core::Vector::<core::Point2f>::from_iter(
            quad.points()
                .iter()
                .map(|p| core::Point2f::new(p.x as f32, p.y as f32)),
        );
        let dst_points = core::Vector::<core::Point2f>::from_iter([
            core::Point2f::new(0.0, 0.0),
            core::Point2f::new(tw, 0.0),
            core::Point2f::new(0.0, th),
            core::Point2f::new(tw, th),
        ]);
        let transform = imgproc::get_perspective_transform(&src_points, &dst_points, core::DECOMP_LU)?;

        let mut warped = Mat::default();
        imgproc::warp_perspective(
            &src,
            &mut warped,
            &transform,
            core::Size::new(options.target_width as i32, options.target_height as i32),
            imgproc::INTER_LINEAR,
            core::BORDER_CONSTANT,
            core::Scalar::default(),
        )?;

        log(format!(
            "contour with {} corners, score {:.2}",
            best.corners.len(),
            best.score
        ));
        Ok(DetectionResult::found(quad, best.score, method, to_image(&warped)?))
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_adaptive_thresholds_are_clamped() {
        assert_eq!(adaptive_canny_thresholds(0.0, 0.0), (30.0, 60.0));
        assert_eq!(adaptive_canny_thresholds(400.0, 100.0), (150.0, 300.0));
        assert_eq!(adaptive_canny_thresholds(100.0, 20.0), (50.0, 140.0));
    }

    #[cfg(not(feature = "opencv"))]
    #[test]
    fn test_unavailable_without_native_library() {
        assert!(!probe());
        let frame = RgbImage::new(8, 8);
        let result = AcceleratedDetector::default().detect(&frame, &DetectOptions::default());
        assert!(matches!(result, Err(ScanError::AcceleratedUnavailable(_))));
    }
}

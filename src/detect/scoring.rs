//! Confidence formulas shared by the detectors and the scan loop.
//!
//! The weights were tuned by hand against camera captures; they are kept as
//! plain structs so callers can override them.

use crate::models::detection::clamp_confidence;

/// Width over height of a standard 2.5" x 3.5" card.
pub const CARD_ASPECT_RATIO: f64 = 2.5 / 3.5;

/// Closeness of `ratio` to the card ratio (portrait or landscape), falling
/// linearly to 0 at `tolerance`.
pub fn aspect_score(ratio: f64, tolerance: f64) -> f64 {
    if !ratio.is_finite() || ratio <= 0.0 || tolerance <= 0.0 {
        return 0.0;
    }
    let diff = (ratio - CARD_ASPECT_RATIO)
        .abs()
        .min((ratio - 1.0 / CARD_ASPECT_RATIO).abs());
    (1.0 - diff / tolerance).max(0.0)
}

/// Closeness of an area ratio to `ideal`, falling linearly to 0 at `tolerance`.
pub fn area_score(area_ratio: f64, ideal: f64, tolerance: f64) -> f64 {
    if tolerance <= 0.0 {
        return 0.0;
    }
    (1.0 - (area_ratio - ideal).abs() / tolerance).max(0.0)
}

pub fn edge_density_score(density: f64, normaliser: f64) -> f64 {
    if normaliser <= 0.0 {
        return 0.0;
    }
    (density / normaliser).clamp(0.0, 1.0)
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ScoreWeights {
    pub base: f64,
    pub area: f64,
    pub aspect: f64,
    pub edge: f64,
}

impl ScoreWeights {
    pub fn combine(&self, area: f64, aspect: f64, edge: f64) -> f64 {
        clamp_confidence(self.base + area * self.area + aspect * self.aspect + edge * self.edge)
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SimpleWeights {
    pub normal: ScoreWeights,
    /// Boxes covering most of the frame lean on edge evidence instead.
    pub large: ScoreWeights,
    pub center_search: ScoreWeights,
    pub ideal_area: f64,
    pub ideal_area_large: f64,
    pub area_tolerance: f64,
    pub aspect_tolerance: f64,
    pub edge_normaliser: f64,
    pub center_edge_normaliser: f64,
    pub center_ideal_area: f64,
    pub center_area_tolerance: f64,
    pub min_confidence: f64,
}

impl Default for SimpleWeights {
    fn default() -> Self {
        Self {
            normal: ScoreWeights {
                base: 0.2,
                area: 0.4,
                aspect: 0.3,
                edge: 0.1,
            },
            large: ScoreWeights {
                base: 0.2,
                area: 0.2,
                aspect: 0.2,
                edge: 0.4,
            },
            center_search: ScoreWeights {
                base: 0.25,
                area: 0.2,
                aspect: 0.3,
                edge: 0.25,
            },
            ideal_area: 0.3,
            ideal_area_large: 0.75,
            area_tolerance: 0.5,
            aspect_tolerance: 0.4,
            edge_normaliser: 0.3,
            center_edge_normaliser: 0.15,
            center_ideal_area: 0.4,
            center_area_tolerance: 0.4,
            min_confidence: 0.2,
        }
    }
}

impl SimpleWeights {
    pub fn box_confidence(&self, area_ratio: f64, box_ratio: f64, density: f64, large: bool) -> f64 {
        let ideal = if large {
            self.ideal_area_large
        } else {
            self.ideal_area
        };
        let weights = if large { &self.large } else { &self.normal };
        weights
            .combine(
                area_score(area_ratio, ideal, self.area_tolerance),
                aspect_score(box_ratio, self.aspect_tolerance),
                edge_density_score(density, self.edge_normaliser),
            )
            .max(self.min_confidence)
    }

    pub fn center_confidence(&self, area_ratio: f64, box_ratio: f64, density: f64) -> f64 {
        self.center_search
            .combine(
                area_score(area_ratio, self.center_ideal_area, self.center_area_tolerance),
                aspect_score(box_ratio, self.aspect_tolerance),
                edge_density_score(density, self.center_edge_normaliser),
            )
            .max(self.min_confidence)
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ContourWeights {
    pub quad_area: f64,
    pub quad_shape: f64,
    pub quad_convexity: f64,
    pub quad_aspect: f64,
    pub other_area: f64,
    pub other_convexity: f64,
    pub ideal_area: f64,
    pub area_tolerance: f64,
    pub aspect_tolerance: f64,
}

impl Default for ContourWeights {
    fn default() -> Self {
        Self {
            quad_area: 0.3,
            quad_shape: 0.3,
            quad_convexity: 0.2,
            quad_aspect: 0.2,
            other_area: 0.4,
            other_convexity: 0.3,
            ideal_area: 0.3,
            area_tolerance: 0.5,
            aspect_tolerance: 0.3,
        }
    }
}

impl ContourWeights {
    /// Score of one approximated contour; `corners` outside 3..=5 score 0.
    pub fn polygon_score(&self, corners: usize, area_ratio: f64, convexity: f64, box_ratio: f64) -> f64 {
        if !(3..=5).contains(&corners) {
            return 0.0;
        }
        let area = area_score(area_ratio, self.ideal_area, self.area_tolerance);
        let convexity = convexity.clamp(0.0, 1.0);
        let score = if corners == 4 {
            area * self.quad_area
                + self.quad_shape
                + convexity * self.quad_convexity
                + aspect_score(box_ratio, self.aspect_tolerance) * self.quad_aspect
        } else {
            area * self.other_area + convexity * self.other_convexity
        };
        clamp_confidence(score)
    }
}

/// Confidence floor for stabilization. A session running on the simple
/// detector alone accepts weaker evidence.
pub fn effective_min_confidence(min_confidence: f64, fell_back: bool) -> f64 {
    if fell_back {
        (min_confidence * 0.4).max(0.2)
    } else {
        min_confidence
    }
}

/// Ideal share of the frame covered by a card held at a comfortable distance.
pub const IDEAL_FRAME_SHARE: f64 = 0.3;

/// Like [`area_score`] with `tolerance == ideal`, but not floored: a card far
/// too large or too small drags the combined score down.
pub fn frame_share_score(area_ratio: f64) -> f64 {
    1.0 - (area_ratio - IDEAL_FRAME_SHARE).abs() / IDEAL_FRAME_SHARE
}

/// Confidence reported by quick detect when only the simple detector ran.
pub fn quick_fallback_confidence(success: bool, area_ratio: f64) -> f64 {
    let success_bonus = if success { 0.2 } else { 0.0 };
    clamp_confidence(0.3 + success_bonus + 0.3 * frame_share_score(area_ratio))
}

/// Confidence one scan cycle contributes to the stabilization window.
///
/// The simple detector's own score is trusted as-is (a bare success counts
/// as 0.3). Results from the full strategy stack are re-scored on frame
/// coverage so both paths land on a comparable scale.
pub fn cycle_confidence(success: bool, confidence: f64, area: f64, frame_area: f64, fell_back: bool) -> f64 {
    if !success || area <= 0.0 {
        return 0.0;
    }
    if fell_back {
        if confidence <= 0.0 {
            return 0.3;
        }
        return clamp_confidence(confidence);
    }
    let area_ratio = if frame_area > 0.0 { area / frame_area } else { 0.0 };
    clamp_confidence(0.4 + 0.3 + 0.3 * frame_share_score(area_ratio))
}

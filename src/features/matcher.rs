use image::RgbImage;
use serde::Serialize;

use super::orb::{detect_and_describe, OrbParams};
use crate::models::{Descriptor, DescriptorSet};

/// Matches closer than this many bits count as good.
pub const GOOD_MATCH_DISTANCE: u32 = 50;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct DescriptorMatch {
    pub query_idx: usize,
    pub train_idx: usize,
    pub distance: u32,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct FeatureMatchResult {
    pub matches: Vec<DescriptorMatch>,
    pub good_matches: usize,
    /// `good_matches / matches.len()`, 0 when nothing was matched.
    pub match_score: f64,
}

pub fn descriptor_distance(a: &Descriptor, b: &Descriptor) -> u32 {
    a.iter().zip(b.iter()).map(|(x, y)| (x ^ y).count_ones()).sum()
}

/// Brute-force nearest neighbour for every query descriptor.
pub fn match_descriptors(query: &DescriptorSet, train: &DescriptorSet, cutoff: u32) -> FeatureMatchResult {
    if query.is_empty() || train.is_empty() {
        return FeatureMatchResult::default();
    }

    let matches: Vec<DescriptorMatch> = query
        .descriptors
        .iter()
        .enumerate()
        .filter_map(|(query_idx, q)| {
            train
                .descriptors
                .iter()
                .enumerate()
                .map(|(train_idx, t)| DescriptorMatch {
                    query_idx,
                    train_idx,
                    distance: descriptor_distance(q, t),
                })
                .min_by_key(|m| m.distance)
        })
        .collect();

    let good_matches = matches.iter().filter(|m| m.distance < cutoff).count();
    let match_score = good_matches as f64 / matches.len() as f64;
    FeatureMatchResult {
        matches,
        good_matches,
        match_score,
    }
}

pub fn compare_images(query: &RgbImage, reference: &RgbImage, params: &OrbParams) -> FeatureMatchResult {
    let query = detect_and_describe(query, params);
    let reference = detect_and_describe(reference, params);
    match_descriptors(&query, &reference, GOOD_MATCH_DISTANCE)
}

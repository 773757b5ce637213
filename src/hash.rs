//! Perceptual fingerprints: a difference hash over a card-shaped raster,
//! computed for all four physical orientations of a card.

use image::{imageops, imageops::FilterType, RgbImage};

use crate::detect::luma;
use crate::detect::scoring::CARD_ASPECT_RATIO;
use crate::error::ScanError;
use crate::models::{Fingerprint, FingerprintSet, Orientation, Preprocess};
use crate::opt::*;

pub const HASH_WIDTH: u32 = 64;
/// floor(64 / 0.714); reference corpora store 64x89 hashes.
pub const HASH_HEIGHT: u32 = 89;
pub const FINGERPRINT_BITS: usize = (HASH_WIDTH * HASH_HEIGHT) as usize;

/// Inputs within this distance of the card ratio are hashed without cropping.
const DIRECT_RATIO_TOLERANCE: f64 = 0.05;

fn log(s: String) {
    log_if(s.as_str(), DbgFlg::Hash);
}

/// Crops `image` to card proportions unless it already has them.
pub fn preprocess(image: &RgbImage) -> Result<(RgbImage, Preprocess), ScanError> {
    let (width, height) = image.dimensions();
    if width == 0 || height == 0 {
        return Err(ScanError::InputUnavailable);
    }

    let ratio = width as f64 / height as f64;
    if (ratio - CARD_ASPECT_RATIO).abs() < DIRECT_RATIO_TOLERANCE {
        return Ok((image.clone(), Preprocess::Direct));
    }

    let (crop_w, crop_h) = if ratio > CARD_ASPECT_RATIO {
        (((height as f64) * CARD_ASPECT_RATIO).round() as u32, height)
    } else {
        (width, ((width as f64) / CARD_ASPECT_RATIO).round() as u32)
    };
    let (crop_w, crop_h) = (crop_w.clamp(1, width), crop_h.clamp(1, height));
    let left = (width - crop_w) / 2;
    let top = (height - crop_h) / 2;

    log(format!(
        "ratio {:.3} is off card proportions, center-cropping {}x{} at ({}, {})",
        ratio, crop_w, crop_h, left, top
    ));
    let cropped = imageops::crop_imm(image, left, top, crop_w, crop_h).to_image();
    Ok((cropped, Preprocess::CenterCropped))
}

/// Difference hash of one image: bit `(y, x)` is set when pixel `x` is
/// brighter than pixel `x + 1` on a `(HASH_WIDTH + 1) x HASH_HEIGHT` raster.
pub fn difference_hash(image: &RgbImage) -> Result<(Fingerprint, Preprocess), ScanError> {
    let (card, preprocess) = preprocess(image)?;
    let raster = imageops::resize(&card, HASH_WIDTH + 1, HASH_HEIGHT, FilterType::Triangle);

    let gray: Vec<u8> = raster.pixels().map(|p| luma(p[0], p[1], p[2])).collect();
    let stride = (HASH_WIDTH + 1) as usize;
    let bits = (0..HASH_HEIGHT as usize).flat_map(|y| {
        let row = &gray[y * stride..(y + 1) * stride];
        (0..HASH_WIDTH as usize).map(move |x| row[x] > row[x + 1])
    });
    let fingerprint = Fingerprint::from_bits(bits);

    log(format!(
        "dHash {} bits, {} ones",
        fingerprint.len(),
        fingerprint.count_ones()
    ));
    Ok((fingerprint, preprocess))
}

pub fn orient(image: &RgbImage, orientation: Orientation) -> RgbImage {
    match orientation {
        Orientation::Normal => image.clone(),
        Orientation::Mirrored => imageops::flip_horizontal(image),
        Orientation::Rotated => imageops::rotate180(image),
        // Mirrored, then turned upside down.
        Orientation::MirroredRotated => imageops::flip_vertical(image),
    }
}

pub fn fingerprint_set(image: &RgbImage) -> Result<FingerprintSet, ScanError> {
    let (normal, preprocess) = difference_hash(image)?;
    let hash = |o: Orientation| difference_hash(&orient(image, o)).map(|(fp, _)| fp);
    Ok(FingerprintSet {
        normal,
        mirrored: hash(Orientation::Mirrored)?,
        rotated: hash(Orientation::Rotated)?,
        mirrored_rotated: hash(Orientation::MirroredRotated)?,
        preprocess,
    })
}

/// Number of differing bits, plus one per bit of length mismatch.
pub fn hamming_distance(a: &Fingerprint, b: &Fingerprint) -> u32 {
    let common = a.len().min(b.len());
    let full_words = common / 64;
    let tail = common % 64;

    let mut distance: u32 = a.words()[..full_words]
        .iter()
        .zip(&b.words()[..full_words])
        .map(|(x, y)| (x ^ y).count_ones())
        .sum();
    if tail > 0 {
        let mask = (1u64 << tail) - 1;
        distance += ((a.words()[full_words] ^ b.words()[full_words]) & mask).count_ones();
    }
    distance + a.len().abs_diff(b.len()) as u32
}

/// `1 - distance / length`, floored at 0.
pub fn similarity(a: &Fingerprint, b: &Fingerprint) -> f64 {
    let len = a.len().max(b.len());
    if len == 0 {
        return 0.0;
    }
    (1.0 - hamming_distance(a, b) as f64 / len as f64).max(0.0)
}

/// Smallest distance from `query` to any orientation in `set`.
pub fn best_orientation(query: &Fingerprint, set: &FingerprintSet) -> (Orientation, u32) {
    set.iter()
        .map(|(orientation, fp)| (orientation, hamming_distance(query, fp)))
        .min_by_key(|(_, distance)| *distance)
        .unwrap_or((Orientation::Normal, u32::MAX))
}

#[cfg(test)]
mod test {
    use super::*;
    use image::Rgb;
    use itertools::Itertools;

    /// Card-sized image made of 10px blocks with pseudo-random shades.
    fn textured(width: u32, height: u32) -> RgbImage {
        RgbImage::from_fn(width, height, |x, y| {
            let block = (x / 10) * 7919 + (y / 10) * 104_729;
            let v = (block.wrapping_mul(2_654_435_761) >> 13) % 256;
            Rgb([v as u8, (v / 2) as u8, (255 - v) as u8])
        })
    }

    #[test]
    fn test_length_is_constant() {
        for (w, h) in [(330, 440), (640, 480), (100, 1000), (7, 9)] {
            let (fp, _) = difference_hash(&textured(w, h)).unwrap();
            assert_eq!(fp.len(), FINGERPRINT_BITS, "{}x{}", w, h);
        }
        assert_eq!(FINGERPRINT_BITS, 5696);
    }

    #[test]
    fn test_preprocess_paths() {
        let (_, direct) = preprocess(&textured(330, 462)).unwrap();
        assert_eq!(direct, Preprocess::Direct);

        let (cropped, path) = preprocess(&textured(640, 480)).unwrap();
        assert_eq!(path, Preprocess::CenterCropped);
        assert_eq!(cropped.dimensions(), (343, 480));

        let (cropped, _) = preprocess(&textured(100, 1000)).unwrap();
        assert_eq!(cropped.dimensions(), (100, 140));
    }

    #[test]
    fn test_deterministic() {
        let image = textured(330, 440);
        assert_eq!(fingerprint_set(&image).unwrap(), fingerprint_set(&image).unwrap());
    }

    #[test]
    fn test_self_distance_and_symmetry() {
        let a = fingerprint_set(&textured(330, 440)).unwrap();
        let b = fingerprint_set(&textured(500, 700)).unwrap();
        assert_eq!(hamming_distance(&a.normal, &a.normal), 0);
        assert_eq!(
            hamming_distance(&a.normal, &b.normal),
            hamming_distance(&b.normal, &a.normal)
        );
        assert_eq!(similarity(&a.normal, &a.normal), 1.0);
    }

    #[test]
    fn test_orientations_are_distinguishable() {
        let set = fingerprint_set(&textured(330, 462)).unwrap();
        let prints: Vec<_> = set.iter().collect();
        for ((oa, a), (ob, b)) in prints.iter().tuple_combinations() {
            assert!(hamming_distance(a, b) > 0, "{} == {}", oa, ob);
        }
    }

    #[test]
    fn test_best_orientation_finds_flipped_capture() {
        let image = textured(330, 462);
        let reference = fingerprint_set(&image).unwrap();
        let (upside_down, _) = difference_hash(&orient(&image, Orientation::Rotated)).unwrap();
        assert_eq!(
            best_orientation(&upside_down, &reference),
            (Orientation::Rotated, 0)
        );
    }

    #[test]
    fn test_length_mismatch_penalty() {
        let a: Fingerprint = "1010".parse().unwrap();
        let b: Fingerprint = "101011".parse().unwrap();
        assert_eq!(hamming_distance(&a, &b), 2);
        let c: Fingerprint = "0110".parse().unwrap();
        assert_eq!(hamming_distance(&a, &c), 2);
        assert_eq!(similarity(&a, &c), 0.5);
    }

    #[test]
    fn test_empty_image_is_rejected() {
        assert!(difference_hash(&RgbImage::new(0, 0)).is_err());
    }
}

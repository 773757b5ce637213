use std::sync::Arc;

use image::{imageops, Rgb, RgbImage};

use card_scanner::config::MatchConfig;
use card_scanner::detect::{DetectOptions, HybridDetector, SimpleDetector};
use card_scanner::hash::{fingerprint_set, hamming_distance, FINGERPRINT_BITS};
use card_scanner::matching::{CorpusEntry, InMemoryCorpus, MatchAggregator, MatchStrategy};
use card_scanner::models::{DetectionMethod, TextRecognition};

const CARD_W: u32 = 296;
const CARD_H: u32 = 415;

/// Smooth, seed-dependent artwork that never gets as dark as the table.
fn artwork(seed: u32) -> RgbImage {
    let s = seed as f64;
    RgbImage::from_fn(CARD_W, CARD_H, |x, y| {
        let (x, y) = (x as f64, y as f64);
        let v = 150.0
            + 45.0 * (x / (7.0 + 3.0 * s) + s).sin()
            + 30.0 * (y / (9.0 + 2.0 * s) + 2.0 * s).sin()
            + 20.0 * ((x + y) / (13.0 + s)).cos();
        let v = v.clamp(40.0, 250.0) as u8;
        Rgb([v, v.saturating_sub(20), v / 2 + 100])
    })
}

fn on_table(card: &RgbImage) -> RgbImage {
    let mut frame = RgbImage::from_pixel(640, 480, Rgb([12, 14, 18]));
    imageops::replace(&mut frame, card, 172, 32);
    frame
}

fn corpus(cards: &[RgbImage]) -> InMemoryCorpus {
    let names = ["Zubat", "Drowzee", "Gloom"];
    InMemoryCorpus::new(
        cards
            .iter()
            .enumerate()
            .map(|(i, card)| {
                let mut entry = CorpusEntry::from_image(&format!("card-{}", i), card).unwrap();
                entry.name = Some(names[i].to_string());
                entry
            })
            .collect(),
    )
}

fn simple_only() -> HybridDetector {
    HybridDetector::with_strategies(Arc::new(SimpleDetector::default()), None)
}

fn fingerprint_only() -> MatchConfig {
    MatchConfig {
        refine_with_features: false,
        ..MatchConfig::default()
    }
}

#[tokio::test]
async fn test_detect_then_identify() {
    let cards: Vec<RgbImage> = (1..=3).map(artwork).collect();
    let detection = simple_only()
        .detect(&on_table(&cards[1]), &DetectOptions::default())
        .result;
    assert!(detection.success);
    assert_eq!(detection.method, DetectionMethod::Simple);
    assert_eq!(detection.rectified.dimensions(), (330, 440));

    let aggregator = MatchAggregator::new(Arc::new(corpus(&cards)), fingerprint_only());
    let outcome = aggregator.identify(&detection.rectified, None).await;

    assert_eq!(outcome.strategy, MatchStrategy::Fingerprint);
    assert_eq!(outcome.candidates[0].reference_id, "card-1");
    assert!(outcome.candidates[0].fingerprint_score > 0.7);
    for pair in outcome.candidates.windows(2) {
        assert!(pair[0].combined_score >= pair[1].combined_score);
    }
}

#[tokio::test]
async fn test_card_held_upside_down() {
    let cards: Vec<RgbImage> = (1..=3).map(artwork).collect();
    let flipped = imageops::rotate180(&cards[2]);
    let detection = simple_only()
        .detect(&on_table(&flipped), &DetectOptions::default())
        .result;
    assert!(detection.success);

    let aggregator = MatchAggregator::new(Arc::new(corpus(&cards)), fingerprint_only());
    let outcome = aggregator.identify(&detection.rectified, None).await;
    assert_eq!(outcome.candidates[0].reference_id, "card-2");
}

#[tokio::test]
async fn test_text_hint_wins_over_fingerprint() {
    let cards: Vec<RgbImage> = (1..=3).map(artwork).collect();
    let aggregator = MatchAggregator::new(Arc::new(corpus(&cards)), fingerprint_only());
    let text = TextRecognition {
        name: Some("Gloom".to_string()),
        number: None,
        confidence: 0.8,
        raw_text: "BASIC Gloom".to_string(),
    };

    let outcome = aggregator.identify(&cards[0], Some(&text)).await;
    assert_eq!(outcome.strategy, MatchStrategy::Text);
    assert_eq!(outcome.candidates[0].reference_id, "card-2");
}

#[test]
fn test_orientation_fingerprints() {
    let set = fingerprint_set(&artwork(4)).unwrap();
    let all: Vec<_> = set.iter().map(|(_, fp)| fp).collect();
    for fp in &all {
        assert_eq!(fp.len(), FINGERPRINT_BITS);
    }
    assert!(hamming_distance(all[0], all[2]) > 0);
    assert!(hamming_distance(all[1], all[3]) > 0);
}

#[test]
fn test_quick_detect_on_empty_table() {
    let frame = RgbImage::from_pixel(640, 480, Rgb([12, 14, 18]));
    let result = simple_only().quick_detect(&frame, &DetectOptions::default());
    assert!(!result.success);
    assert_eq!(result.method, DetectionMethod::SimpleFallback);
}

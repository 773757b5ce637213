//! Scores corpus entries against recognized card text.
//!
//! Points are awarded on a 0..=150 scale (name up to 100, collector number up
//! to 50) and normalised to [0, 1] for merging with image scores.

use strsim::normalized_levenshtein;

use crate::models::TextRecognition;

pub const MAX_TEXT_POINTS: f64 = 150.0;

/// Candidates below this many points are dropped from a text search.
pub const TEXT_POINTS_FLOOR: f64 = 20.0;
/// Floor used instead when the best weak candidate scored at least this much,
/// so that a misread name still gets through.
pub const TEXT_POINTS_LENIENT_FLOOR: f64 = 10.0;

fn name_points(query: &str, name: &str) -> f64 {
    let query = query.trim().to_lowercase();
    let name = name.trim().to_lowercase();
    if query.is_empty() || name.is_empty() {
        return 0.0;
    }
    if query == name {
        return 100.0;
    }
    if query.contains(&name) || name.contains(&query) {
        return 70.0;
    }

    let similarity = normalized_levenshtein(&query, &name);
    if similarity > 0.7 {
        50.0 * similarity
    } else if similarity > 0.5 {
        30.0 * similarity
    } else if similarity > 0.3 {
        20.0 * similarity
    } else {
        0.0
    }
}

fn number_points(query: &str, number: &str) -> f64 {
    let query = query.trim();
    let number = number.trim();
    if query.is_empty() || number.is_empty() {
        return 0.0;
    }
    if query == number {
        return 50.0;
    }

    let number_stripped = number.trim_start_matches('0');
    let query_stripped = query
        .trim_start_matches('0')
        .split('/')
        .next()
        .unwrap_or_default();
    if !query_stripped.is_empty()
        && !number_stripped.is_empty()
        && (number_stripped == query_stripped
            || number.contains(query_stripped)
            || query_stripped.contains(number_stripped))
    {
        return 30.0;
    }
    if number.contains(query) || query.contains(number) {
        return 20.0;
    }
    0.0
}

pub fn text_points(query: &TextRecognition, name: Option<&str>, number: Option<&str>) -> f64 {
    let name_score = match (query.name.as_deref(), name) {
        (Some(q), Some(n)) => name_points(q, n),
        _ => 0.0,
    };
    let number_score = match (query.number.as_deref(), number) {
        (Some(q), Some(n)) => number_points(q, n),
        _ => 0.0,
    };
    name_score + number_score
}

pub fn text_match_score(query: &TextRecognition, name: Option<&str>, number: Option<&str>) -> f64 {
    (text_points(query, name, number) / MAX_TEXT_POINTS).clamp(0.0, 1.0)
}

pub fn points_floor(points: &[f64]) -> f64 {
    let best_weak = points
        .iter()
        .copied()
        .filter(|p| *p > 0.0 && *p < TEXT_POINTS_FLOOR)
        .fold(0.0f64, f64::max);
    if best_weak >= TEXT_POINTS_LENIENT_FLOOR {
        TEXT_POINTS_LENIENT_FLOOR
    } else {
        TEXT_POINTS_FLOOR
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn query(name: Option<&str>, number: Option<&str>) -> TextRecognition {
        TextRecognition {
            name: name.map(str::to_string),
            number: number.map(str::to_string),
            confidence: 0.9,
            raw_text: String::new(),
        }
    }

    #[test]
    fn test_name_tiers() {
        assert_eq!(name_points("Drowzee", "drowzee"), 100.0);
        assert_eq!(name_points("Drowzee", "Drowzee ex"), 70.0);
        // one substitution out of seven characters
        let fuzzy = name_points("ShuckIe", "Shuckle");
        assert!(fuzzy > 35.0 && fuzzy < 50.0);
        assert_eq!(name_points("Pikachu", "Zubat"), 0.0);
        assert_eq!(name_points("", "Zubat"), 0.0);
    }

    #[test]
    fn test_number_tiers() {
        assert_eq!(number_points("049/102", "049/102"), 50.0);
        assert_eq!(number_points("049/102", "49"), 30.0);
        assert_eq!(number_points("12", "7"), 0.0);
    }

    #[test]
    fn test_combined_score_normalised() {
        let q = query(Some("Drowzee"), Some("049/102"));
        assert_eq!(text_match_score(&q, Some("Drowzee"), Some("049/102")), 1.0);
        let name_only = text_match_score(&q, Some("Drowzee"), None);
        assert!((name_only - 100.0 / 150.0).abs() < 1e-9);
        assert_eq!(text_match_score(&query(None, None), Some("Drowzee"), Some("1")), 0.0);
    }

    #[test]
    fn test_points_floor() {
        assert_eq!(points_floor(&[100.0, 5.0]), TEXT_POINTS_FLOOR);
        assert_eq!(points_floor(&[100.0, 12.0]), TEXT_POINTS_LENIENT_FLOOR);
        assert_eq!(points_floor(&[]), TEXT_POINTS_FLOOR);
    }
}

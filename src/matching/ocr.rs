//! Text recognition collaborator and the parsing of its raw output.

use image::RgbImage;
use lazy_static::lazy_static;
use regex::Regex;

use crate::error::ScanError;
use crate::models::TextRecognition;
use crate::opt::*;

/// Only the first few lines of a card carry its name.
const NAME_SEARCH_LINES: usize = 5;
const NAME_MIN_LEN: usize = 3;
const NAME_MAX_LEN: usize = 30;

const SKIP_WORDS: [&str; 11] = [
    "HP", "ATTACK", "ABILITY", "POKEMON", "ENERGY", "RETREAT", "WEAKNESS", "RESISTANCE", "DAMAGE",
    "EVOLVES", "FROM",
];

const CARD_TYPE_WORDS: [&str; 13] = [
    "BASIC", "BASI", "STAGE", "STAGE1", "STAGE2", "VMAX", "VSTAR", "V-UNION", "TRAINER",
    "SUPPORTER", "ITEM", "STADIUM", "SIC",
];

lazy_static! {
    static ref COLLECTOR_NUMBER: Regex = Regex::new(r"(\d{1,3})/(\d{1,3})").expect("valid collector number regex");
    static ref NOT_A_NAME: Regex = Regex::new(r"(?i)^\d+(/\d+)?$|^\d+\s*HP$|HP\s*\d+|^NO\.\s*\d+|^HT\.|^WT\s*\d+")
        .expect("valid skip line regex");
    static ref NAME_NOISE: Regex = Regex::new(r"[^A-Za-z0-9\s\-'.]").expect("valid name noise regex");
    static ref MISREAD_GL: Regex = Regex::new(r"GI([a-z])").expect("valid misread regex");
}

fn log(s: String) {
    log_if(s.as_str(), DbgFlg::Match);
}

pub trait TextRecognizer: Send + Sync {
    fn recognize(&self, image: &RgbImage) -> Result<TextRecognition, ScanError>;
}

fn letter_count(s: &str) -> usize {
    s.chars().filter(|c| c.is_ascii_alphabetic()).count()
}

/// Strips a leading card type ("BASIC Drowzee" -> "Drowzee"). Returns `None`
/// when the whole line is a card type.
fn strip_card_type(line: &str) -> Option<&str> {
    for word in CARD_TYPE_WORDS {
        if line.eq_ignore_ascii_case(word) {
            return None;
        }
        let prefixed = line
            .get(..word.len())
            .map_or(false, |prefix| prefix.eq_ignore_ascii_case(word));
        if prefixed && line[word.len()..].starts_with(char::is_whitespace) {
            return Some(line[word.len()..].trim());
        }
    }
    Some(line)
}

fn clean_name(line: &str) -> Option<String> {
    let line = line.replace('|', "I");
    let line = MISREAD_GL.replace_all(&line, "Gl$1");
    let cleaned = NAME_NOISE.replace_all(&line, "").trim().to_string();
    if cleaned.len() >= NAME_MIN_LEN && letter_count(&cleaned) >= 2 {
        Some(cleaned)
    } else {
        None
    }
}

fn looks_like_name(line: &str) -> bool {
    let upper = line.to_uppercase();
    line.len() >= NAME_MIN_LEN
        && line.len() <= NAME_MAX_LEN
        && letter_count(line) >= 2
        && !NOT_A_NAME.is_match(line)
        && !SKIP_WORDS.iter().any(|w| upper.contains(w))
}

fn extract_name(lines: &[&str]) -> Option<String> {
    let top = lines
        .iter()
        .take(NAME_SEARCH_LINES)
        .filter_map(|line| strip_card_type(line))
        .find(|line| looks_like_name(line))
        .and_then(clean_name);
    if top.is_some() {
        return top;
    }

    // Fall back to the longest plausible line anywhere on the card.
    lines
        .iter()
        .filter_map(|line| strip_card_type(line))
        .filter(|line| looks_like_name(line))
        .max_by_key(|line| line.len())
        .and_then(clean_name)
}

pub fn parse_card_text(text: &str, confidence: f64) -> TextRecognition {
    let lines: Vec<&str> = text.lines().map(str::trim).filter(|l| !l.is_empty()).collect();
    let name = extract_name(&lines);
    let number = COLLECTOR_NUMBER.find(text).map(|m| m.as_str().to_string());
    log(format!("parsed card text: name {:?} number {:?}", name, number));

    TextRecognition {
        name,
        number,
        confidence: confidence.clamp(0.0, 1.0),
        raw_text: text.to_string(),
    }
}

#[cfg(feature = "ocr")]
pub use tesseract::TesseractRecognizer;

#[cfg(feature = "ocr")]
mod tesseract {
    use std::io::Cursor;

    use image::{DynamicImage, ImageFormat, RgbImage};
    use leptess::LepTess;

    use super::{parse_card_text, TextRecognizer};
    use crate::error::ScanError;
    use crate::models::TextRecognition;

    /// Tesseract through `leptess`. A fresh engine is created per call; the
    /// engine itself is not `Sync`.
    pub struct TesseractRecognizer {
        tessdata: Option<String>,
        language: String,
    }

    impl TesseractRecognizer {
        pub fn new(tessdata: Option<String>) -> Self {
            Self {
                tessdata,
                language: "eng".to_string(),
            }
        }
    }

    impl TextRecognizer for TesseractRecognizer {
        fn recognize(&self, image: &RgbImage) -> Result<TextRecognition, ScanError> {
            let mut png = Vec::new();
            DynamicImage::ImageRgb8(image.clone()).write_to(&mut Cursor::new(&mut png), ImageFormat::Png)?;

            let mut lt = LepTess::new(self.tessdata.as_deref(), &self.language)
                .map_err(|err| ScanError::Internal(format!("tesseract init failed: {:?}", err)))?;
            lt.set_image_from_mem(&png)
                .map_err(|err| ScanError::Internal(format!("set image failed: {:?}", err)))?;
            let text = lt
                .get_utf8_text()
                .map_err(|err| ScanError::Internal(format!("get text failed: {:?}", err)))?;
            let confidence = lt.mean_text_conf() as f64 / 100.0;
            Ok(parse_card_text(&text, confidence))
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_parse_name_and_number() {
        let text = "BASIC Drowzee\n70 HP\nPound 20\nWeakness x2\n049/102\n";
        let parsed = parse_card_text(text, 0.8);
        assert_eq!(parsed.name.as_deref(), Some("Drowzee"));
        assert_eq!(parsed.number.as_deref(), Some("049/102"));
        assert!(parsed.is_usable());
    }

    #[test]
    fn test_card_type_line_is_skipped() {
        let parsed = parse_card_text("TRAINER\nITEM\nPoke Ball\n", 0.5);
        assert_eq!(parsed.name.as_deref(), Some("Poke Ball"));
        assert!(parsed.number.is_none());
    }

    #[test]
    fn test_noise_and_misreads_cleaned() {
        let parsed = parse_card_text("GIoom*\n", 0.5);
        assert_eq!(parsed.name.as_deref(), Some("Gloom"));
    }

    #[test]
    fn test_nothing_usable() {
        let parsed = parse_card_text("12\nHP 60\n", 1.7);
        assert!(parsed.name.is_none());
        assert!(parsed.number.is_none());
        assert!(!parsed.is_usable());
        assert_eq!(parsed.confidence, 1.0);
    }
}

pub mod aggregator;
pub mod corpus;
pub mod ocr;
pub mod reference;
pub mod text_score;

pub use aggregator::{Diagnostic, MatchAggregator, MatchOutcome, MatchStrategy};
pub use corpus::{
    CorpusEntry, CorpusMatch, CorpusMatcher, CorpusResponse, FingerprintRequest, HttpCorpusMatcher, InMemoryCorpus,
    TextQuery,
};
#[cfg(feature = "ocr")]
pub use ocr::TesseractRecognizer;
pub use ocr::{parse_card_text, TextRecognizer};
pub use reference::{DirectoryReferenceImages, HttpReferenceImages, ReferenceImageSource};
pub use text_score::text_match_score;

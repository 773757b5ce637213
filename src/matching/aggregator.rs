//! Combines text and fingerprint rankings from the corpus into one list,
//! optionally re-ranked with local feature matching.

use std::collections::HashMap;
use std::fmt::{self, Display};
use std::future::Future;
use std::sync::Arc;

use image::RgbImage;
use serde::Serialize;
use tokio::time;
use tracing::{info, warn};

use super::corpus::{CorpusMatch, CorpusMatcher, CorpusResponse, FingerprintRequest, TextQuery, DEFAULT_LIMIT};
use super::reference::ReferenceImageSource;
use super::text_score::{points_floor, text_points, MAX_TEXT_POINTS};
use crate::config::MatchConfig;
use crate::error::MatchServiceError;
use crate::features::{detect_and_describe, match_descriptors, OrbParams, GOOD_MATCH_DISTANCE};
use crate::hash::difference_hash;
use crate::models::{Fingerprint, MatchCandidate, TextRecognition};
use crate::opt::*;

fn log(s: String) {
    log_if(s.as_str(), DbgFlg::Match);
}

#[derive(strum_macros::Display, Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[strum(serialize_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum MatchStrategy {
    Text,
    Fingerprint,
    Refined,
    None,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "reason", content = "detail", rename_all = "snake_case")]
pub enum Diagnostic {
    ServiceError(String),
    NoIndexedFingerprints,
    TextExtractionFailed,
    LowImageQuality,
}

impl Display for Diagnostic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Diagnostic::ServiceError(err) => write!(f, "match service error: {}", err),
            Diagnostic::NoIndexedFingerprints => write!(f, "no reference fingerprints are indexed"),
            Diagnostic::TextExtractionFailed => write!(f, "card text could not be read"),
            Diagnostic::LowImageQuality => write!(f, "image quality too low to match"),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct MatchOutcome {
    pub candidates: Vec<MatchCandidate>,
    pub strategy: MatchStrategy,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub diagnostic: Option<Diagnostic>,
}

impl MatchOutcome {
    fn empty(diagnostic: Diagnostic) -> Self {
        Self {
            candidates: Vec::new(),
            strategy: MatchStrategy::None,
            diagnostic: Some(diagnostic),
        }
    }
}

fn metadata_with(m: &CorpusMatch) -> serde_json::Value {
    let mut metadata = match &m.metadata {
        serde_json::Value::Object(map) => map.clone(),
        serde_json::Value::Null => serde_json::Map::new(),
        other => {
            let mut map = serde_json::Map::new();
            map.insert("value".to_string(), other.clone());
            map
        }
    };
    if let Some(name) = &m.name {
        metadata.entry("name").or_insert_with(|| name.clone().into());
    }
    if let Some(number) = &m.number {
        metadata.entry("number").or_insert_with(|| number.clone().into());
    }
    serde_json::Value::Object(metadata)
}

fn candidate_from(m: &CorpusMatch, fingerprint_score: f64) -> MatchCandidate {
    MatchCandidate {
        reference_id: m.reference_id.clone(),
        fingerprint_score,
        feature_score: None,
        text_score: None,
        combined_score: fingerprint_score,
        metadata: metadata_with(m),
        image_reference: m.image_reference.clone(),
    }
}

fn sort_candidates(candidates: &mut [MatchCandidate]) {
    candidates.sort_by(|a, b| b.combined_score.total_cmp(&a.combined_score));
}

#[derive(Default)]
struct Stages {
    service_error: Option<String>,
    indexed_count: Option<usize>,
}

impl Stages {
    fn absorb(&mut self, stage: &str, result: Result<CorpusResponse, MatchServiceError>) -> Vec<CorpusMatch> {
        match result {
            Ok(response) => {
                if response.indexed_count.is_some() {
                    self.indexed_count = response.indexed_count;
                }
                response.matches
            }
            Err(err) => {
                warn!("{} search failed: {}", stage, err);
                self.service_error = Some(err.to_string());
                Vec::new()
            }
        }
    }
}

pub struct MatchAggregator {
    corpus: Arc<dyn CorpusMatcher>,
    references: Option<Arc<dyn ReferenceImageSource>>,
    config: MatchConfig,
    orb: OrbParams,
}

impl MatchAggregator {
    pub fn new(corpus: Arc<dyn CorpusMatcher>, config: MatchConfig) -> Self {
        Self {
            corpus,
            references: None,
            config,
            orb: OrbParams::default(),
        }
    }

    pub fn with_references(mut self, references: Arc<dyn ReferenceImageSource>) -> Self {
        self.references = Some(references);
        self
    }

    async fn bounded<T, F>(&self, call: F) -> Result<T, MatchServiceError>
    where
        F: Future<Output = Result<T, MatchServiceError>>,
    {
        let limit = self.config.request_timeout();
        match time::timeout(limit, call).await {
            Ok(result) => result,
            Err(_) => Err(MatchServiceError::Timeout(limit)),
        }
    }

    /// Identifies the card in `image`. Never fails: collaborator errors end
    /// up in the outcome's diagnostic.
    pub async fn identify(&self, image: &RgbImage, text: Option<&TextRecognition>) -> MatchOutcome {
        let fingerprint = match difference_hash(image) {
            Ok((fingerprint, _)) => fingerprint,
            Err(err) => {
                warn!("Unable to fingerprint capture: {}", err);
                return MatchOutcome::empty(Diagnostic::LowImageQuality);
            }
        };
        let mut stages = Stages::default();
        let text = text.filter(|t| t.is_usable());

        if let Some(text) = text {
            let candidates = self.merged_search(&fingerprint, text, &mut stages).await;
            if !candidates.is_empty() {
                info!("Text search found {} candidates", candidates.len());
                return MatchOutcome {
                    candidates,
                    strategy: MatchStrategy::Text,
                    diagnostic: None,
                };
            }
            log("text search found nothing, falling back to fingerprint".to_string());
        }

        let request = FingerprintRequest {
            fingerprint,
            similarity_threshold: self.config.similarity_threshold,
            category_filter: None,
            limit: self.config.max_candidates.max(DEFAULT_LIMIT),
        };
        let result = self.bounded(self.corpus.search_fingerprint(&request)).await;
        let mut candidates: Vec<MatchCandidate> = stages
            .absorb("fingerprint", result)
            .iter()
            .map(|m| candidate_from(m, m.similarity))
            .collect();
        sort_candidates(&mut candidates);
        candidates.truncate(self.config.max_candidates);

        if candidates.is_empty() {
            let diagnostic = if let Some(err) = stages.service_error {
                Diagnostic::ServiceError(err)
            } else if stages.indexed_count == Some(0) {
                Diagnostic::NoIndexedFingerprints
            } else if text.is_none() {
                Diagnostic::TextExtractionFailed
            } else {
                Diagnostic::LowImageQuality
            };
            info!("No match: {}", diagnostic);
            return MatchOutcome::empty(diagnostic);
        }

        if self.config.refine_with_features {
            if let Some(refined) = self.refine(image, &candidates).await {
                return MatchOutcome {
                    candidates: refined,
                    strategy: MatchStrategy::Refined,
                    diagnostic: None,
                };
            }
        }
        MatchOutcome {
            candidates,
            strategy: MatchStrategy::Fingerprint,
            diagnostic: None,
        }
    }

    async fn merged_search(
        &self,
        fingerprint: &Fingerprint,
        text: &TextRecognition,
        stages: &mut Stages,
    ) -> Vec<MatchCandidate> {
        let query = TextQuery::from(text);
        let request = FingerprintRequest {
            fingerprint: fingerprint.clone(),
            similarity_threshold: self.config.similarity_threshold,
            category_filter: self.config.category_filter.clone(),
            limit: DEFAULT_LIMIT,
        };
        let (text_result, image_result) = tokio::join!(
            self.bounded(self.corpus.search_text(&query)),
            self.bounded(self.corpus.search_fingerprint(&request)),
        );
        let text_matches = stages.absorb("text", text_result);
        let image_matches = stages.absorb("fingerprint", image_result);

        let text_weight = self.config.text_weight;
        let scored: Vec<(f64, &CorpusMatch)> = text_matches
            .iter()
            .map(|m| (text_points(text, m.name.as_deref(), m.number.as_deref()), m))
            .collect();
        let floor = points_floor(&scored.iter().map(|(p, _)| *p).collect::<Vec<f64>>());

        let mut merged: HashMap<String, MatchCandidate> = HashMap::new();
        for (points, m) in scored.into_iter().filter(|(p, _)| *p >= floor) {
            let text_score = (points / MAX_TEXT_POINTS).min(1.0);
            let mut candidate = candidate_from(m, 0.0);
            candidate.text_score = Some(text_score);
            candidate.combined_score = text_score;
            merged.entry(m.reference_id.clone()).or_insert(candidate);
        }
        for m in &image_matches {
            match merged.get_mut(&m.reference_id) {
                Some(candidate) => {
                    candidate.fingerprint_score = m.similarity;
                    candidate.combined_score = text_weight * candidate.text_score.unwrap_or(0.0)
                        + (1.0 - text_weight) * m.similarity;
                }
                None => {
                    let mut candidate = candidate_from(m, m.similarity);
                    candidate.combined_score = (1.0 - text_weight) * m.similarity;
                    merged.insert(m.reference_id.clone(), candidate);
                }
            }
        }

        let mut candidates: Vec<MatchCandidate> = merged.into_values().collect();
        sort_candidates(&mut candidates);
        candidates.truncate(self.config.max_candidates);
        candidates
    }

    /// Re-scores the top fingerprint candidates with feature matching.
    /// Returns `None` when refinement was not possible or not convincing.
    async fn refine(&self, image: &RgbImage, candidates: &[MatchCandidate]) -> Option<Vec<MatchCandidate>> {
        let references = self.references.as_ref()?;
        let params = self.orb.clone();
        let query_image = image.clone();
        let query = tokio::task::spawn_blocking(move || detect_and_describe(&query_image, &params))
            .await
            .ok()?;
        if query.is_empty() {
            log("no features in capture, skipping refinement".to_string());
            return None;
        }
        let query = Arc::new(query);

        let mut refined = Vec::with_capacity(self.config.refine_top);
        for candidate in candidates.iter().take(self.config.refine_top) {
            let mut candidate = candidate.clone();
            let Some(image_reference) = candidate.image_reference.clone() else {
                refined.push(candidate);
                continue;
            };
            match self.bounded(references.fetch(&image_reference)).await {
                Ok(reference) => {
                    let params = self.orb.clone();
                    let query = query.clone();
                    let scored = tokio::task::spawn_blocking(move || {
                        let train = detect_and_describe(&reference, &params);
                        match_descriptors(&query, &train, GOOD_MATCH_DISTANCE)
                    })
                    .await;
                    if let Ok(result) = scored {
                        candidate.feature_score = Some(result.match_score);
                        candidate.combined_score = self.config.hash_weight * candidate.fingerprint_score
                            + self.config.feature_weight * result.match_score;
                        log(format!(
                            "{}: hash {:.2} features {:.2} combined {:.2}",
                            candidate.reference_id,
                            candidate.fingerprint_score,
                            result.match_score,
                            candidate.combined_score
                        ));
                    }
                }
                Err(err) => warn!("Unable to fetch reference {}: {}", image_reference, err),
            }
            refined.push(candidate);
        }
        sort_candidates(&mut refined);

        let best = refined.first()?;
        if best.feature_score.is_some() && best.combined_score > self.config.refine_accept_score {
            info!("Using feature-refined ranking, top score {:.2}", best.combined_score);
            Some(refined)
        } else {
            None
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::matching::corpus::{CorpusEntry, InMemoryCorpus};
    use crate::matching::reference::DirectoryReferenceImages;
    use async_trait::async_trait;
    use image::Rgb;
    use rand::{Rng, SeedableRng};
    use rand_chacha::ChaCha8Rng;
    use std::time::Duration;

    fn card(seed: u32) -> RgbImage {
        RgbImage::from_fn(250, 350, |x, y| {
            let block = (x / 10) * 31 + (y / 10) * 17 + seed * 7919;
            let v = (block.wrapping_mul(2_654_435_761) >> 11) % 256;
            Rgb([v as u8, (v / 2) as u8, 255 - v as u8])
        })
    }

    fn noise(seed: u64) -> RgbImage {
        let mut rng = ChaCha8Rng::seed_from_u64(seed);
        let cells: Vec<u8> = (0..64 * 90).map(|_| rng.gen()).collect();
        RgbImage::from_fn(250, 350, |x, y| {
            let v = cells[((y / 4) * 64 + x / 4) as usize];
            Rgb([v, v, v])
        })
    }

    fn entry(id: &str, name: &str, seed: u32) -> CorpusEntry {
        let mut entry = CorpusEntry::from_image(id, &card(seed)).unwrap();
        entry.name = Some(name.to_string());
        entry
    }

    fn text(name: &str) -> TextRecognition {
        TextRecognition {
            name: Some(name.to_string()),
            number: None,
            confidence: 0.9,
            raw_text: name.to_string(),
        }
    }

    fn config() -> MatchConfig {
        MatchConfig {
            refine_with_features: false,
            ..MatchConfig::default()
        }
    }

    struct Failing;

    #[async_trait]
    impl CorpusMatcher for Failing {
        async fn search_fingerprint(&self, _: &FingerprintRequest) -> Result<CorpusResponse, MatchServiceError> {
            Err(MatchServiceError::Status {
                status: 503,
                body: "down".to_string(),
            })
        }

        async fn search_text(&self, _: &TextQuery) -> Result<CorpusResponse, MatchServiceError> {
            Err(MatchServiceError::Decode("bad".to_string()))
        }
    }

    struct Hanging;

    #[async_trait]
    impl CorpusMatcher for Hanging {
        async fn search_fingerprint(&self, _: &FingerprintRequest) -> Result<CorpusResponse, MatchServiceError> {
            time::sleep(Duration::from_secs(3600)).await;
            Ok(CorpusResponse::default())
        }

        async fn search_text(&self, _: &TextQuery) -> Result<CorpusResponse, MatchServiceError> {
            time::sleep(Duration::from_secs(3600)).await;
            Ok(CorpusResponse::default())
        }
    }

    /// Answers without ever reporting its index size.
    struct Silent;

    #[async_trait]
    impl CorpusMatcher for Silent {
        async fn search_fingerprint(&self, _: &FingerprintRequest) -> Result<CorpusResponse, MatchServiceError> {
            Ok(CorpusResponse::default())
        }

        async fn search_text(&self, _: &TextQuery) -> Result<CorpusResponse, MatchServiceError> {
            Ok(CorpusResponse::default())
        }
    }

    #[tokio::test]
    async fn test_failed_text_and_empty_corpus() {
        let aggregator = MatchAggregator::new(Arc::new(InMemoryCorpus::default()), config());
        let outcome = aggregator.identify(&card(1), None).await;
        assert!(outcome.candidates.is_empty());
        assert_eq!(outcome.strategy, MatchStrategy::None);
        assert_eq!(outcome.diagnostic, Some(Diagnostic::NoIndexedFingerprints));
    }

    #[tokio::test]
    async fn test_unreadable_text_without_index_info() {
        let aggregator = MatchAggregator::new(Arc::new(Silent), config());
        let unreadable = TextRecognition::default();
        let outcome = aggregator.identify(&card(1), Some(&unreadable)).await;
        assert!(outcome.candidates.is_empty());
        assert_eq!(outcome.diagnostic, Some(Diagnostic::TextExtractionFailed));
    }

    #[tokio::test]
    async fn test_service_errors_become_diagnostic() {
        let aggregator = MatchAggregator::new(Arc::new(Failing), config());
        let outcome = aggregator.identify(&card(1), Some(&text("Drowzee"))).await;
        assert!(outcome.candidates.is_empty());
        assert!(matches!(outcome.diagnostic, Some(Diagnostic::ServiceError(_))));
    }

    #[tokio::test(start_paused = true)]
    async fn test_hanging_service_times_out() {
        let aggregator = MatchAggregator::new(Arc::new(Hanging), config());
        let outcome = aggregator.identify(&card(1), None).await;
        assert!(outcome.candidates.is_empty());
        assert!(matches!(outcome.diagnostic, Some(Diagnostic::ServiceError(_))));
    }

    #[tokio::test]
    async fn test_fingerprint_only_ranking() {
        let corpus = InMemoryCorpus::new(vec![entry("a", "Zubat", 1), entry("b", "Drowzee", 2)]);
        let aggregator = MatchAggregator::new(Arc::new(corpus), config());
        let outcome = aggregator.identify(&card(2), None).await;
        assert_eq!(outcome.strategy, MatchStrategy::Fingerprint);
        assert_eq!(outcome.candidates[0].reference_id, "b");
        assert_eq!(outcome.candidates[0].combined_score, 1.0);
        assert!(outcome.diagnostic.is_none());
    }

    #[tokio::test]
    async fn test_text_and_fingerprint_merged() {
        let corpus = InMemoryCorpus::new(vec![entry("a", "Zubat", 1), entry("b", "Drowzee", 2)]);
        let aggregator = MatchAggregator::new(Arc::new(corpus), config());
        let outcome = aggregator.identify(&card(2), Some(&text("Drowzee"))).await;

        assert_eq!(outcome.strategy, MatchStrategy::Text);
        let top = &outcome.candidates[0];
        assert_eq!(top.reference_id, "b");
        let expected_text = 100.0 / MAX_TEXT_POINTS;
        assert_eq!(top.text_score, Some(expected_text));
        assert!((top.combined_score - (0.6 * expected_text + 0.4)).abs() < 1e-9);
        assert_eq!(top.metadata["name"], "Drowzee");

        let other = outcome.candidates.iter().find(|c| c.reference_id == "a").unwrap();
        assert!(other.text_score.is_none());
        assert!((other.combined_score - 0.4 * other.fingerprint_score).abs() < 1e-9);
    }

    #[tokio::test]
    async fn test_feature_refinement_reranks() {
        let dir = tempfile::tempdir().unwrap();
        let mut entries = Vec::new();
        for (id, seed) in [("a", 1), ("b", 2)] {
            card(seed).save(dir.path().join(format!("{}.png", id))).unwrap();
            let mut e = entry(id, id, seed);
            e.image_reference = Some(format!("{}.png", id));
            entries.push(e);
        }
        let aggregator = MatchAggregator::new(
            Arc::new(InMemoryCorpus::new(entries)),
            MatchConfig::default(),
        )
        .with_references(Arc::new(DirectoryReferenceImages::new(dir.path())));

        let outcome = aggregator.identify(&card(2), None).await;
        assert_eq!(outcome.strategy, MatchStrategy::Refined);
        let top = &outcome.candidates[0];
        assert_eq!(top.reference_id, "b");
        assert_eq!(top.feature_score, Some(1.0));
        assert!((top.combined_score - 1.0).abs() < 1e-9);
    }

    #[tokio::test]
    async fn test_features_reverse_close_hash_scores() {
        let query = noise(1);
        let dir = tempfile::tempdir().unwrap();
        noise(2).save(dir.path().join("a.png")).unwrap();
        query.save(dir.path().join("b.png")).unwrap();

        // "a" carries the query's own hash but different artwork; "b" is the
        // query artwork behind a hash that is a few bits off.
        let mut a = CorpusEntry::from_image("a", &query).unwrap();
        a.image_reference = Some("a.png".to_string());
        let mut b = CorpusEntry::from_image("b", &query).unwrap();
        b.image_reference = Some("b.png".to_string());
        if let Some(set) = b.fingerprints.as_mut() {
            let normal = &set.normal;
            set.normal = Fingerprint::from_bits((0..normal.len()).map(|i| normal.bit(i).unwrap() != (i < 60)));
        }

        let corpus: Arc<dyn CorpusMatcher> = Arc::new(InMemoryCorpus::new(vec![a, b]));
        let hashed = MatchAggregator::new(corpus.clone(), config())
            .identify(&query, None)
            .await;
        assert_eq!(hashed.candidates[0].reference_id, "a");
        assert!(hashed.candidates[0].fingerprint_score - hashed.candidates[1].fingerprint_score < 0.02);

        let refined = MatchAggregator::new(corpus, MatchConfig::default())
            .with_references(Arc::new(DirectoryReferenceImages::new(dir.path())))
            .identify(&query, None)
            .await;
        assert_eq!(refined.strategy, MatchStrategy::Refined);
        assert_eq!(refined.candidates[0].reference_id, "b");
        assert_eq!(refined.candidates[0].feature_score, Some(1.0));
        let a = refined.candidates.iter().find(|c| c.reference_id == "a").unwrap();
        assert!(a.feature_score.unwrap() < 0.95);
    }
}

//! Reference corpus collaborators: the remote match service and a local,
//! file-backed index with the same contract.

use std::fs;
use std::path::Path;
use std::time::Duration;

use async_trait::async_trait;
use image::RgbImage;
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use tracing::warn;

use super::text_score::text_match_score;
use crate::error::{MatchServiceError, ScanError};
use crate::hash::{best_orientation, fingerprint_set};
use crate::models::{Fingerprint, FingerprintSet, TextRecognition};
use crate::opt::*;

pub const DEFAULT_LIMIT: usize = 50;

fn log(s: String) {
    log_if(s.as_str(), DbgFlg::Match);
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FingerprintRequest {
    pub fingerprint: Fingerprint,
    pub similarity_threshold: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub category_filter: Option<String>,
    pub limit: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TextQuery {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub number: Option<String>,
    pub limit: usize,
}

impl From<&TextRecognition> for TextQuery {
    fn from(text: &TextRecognition) -> Self {
        Self {
            name: text.name.clone(),
            number: text.number.clone(),
            limit: DEFAULT_LIMIT,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CorpusMatch {
    pub reference_id: String,
    /// In [0, 1]; for text searches the corpus' own relevance.
    #[serde(default)]
    pub similarity: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub number: Option<String>,
    #[serde(default)]
    pub metadata: serde_json::Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image_reference: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CorpusResponse {
    #[serde(default)]
    pub matches: Vec<CorpusMatch>,
    /// How many references carry fingerprints, when the corpus reports it.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub indexed_count: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub warning: Option<String>,
}

#[async_trait]
pub trait CorpusMatcher: Send + Sync {
    async fn search_fingerprint(&self, request: &FingerprintRequest) -> Result<CorpusResponse, MatchServiceError>;

    async fn search_text(&self, query: &TextQuery) -> Result<CorpusResponse, MatchServiceError>;
}

pub struct HttpCorpusMatcher {
    base_url: String,
    client: reqwest::Client,
    timeout: Duration,
}

impl HttpCorpusMatcher {
    pub fn new(base_url: &str, timeout: Duration) -> Result<Self, MatchServiceError> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            client,
            timeout,
        })
    }

    fn map_send_error(&self, err: reqwest::Error) -> MatchServiceError {
        if err.is_timeout() {
            MatchServiceError::Timeout(self.timeout)
        } else {
            MatchServiceError::Http(err)
        }
    }

    async fn read(&self, response: reqwest::Response) -> Result<CorpusResponse, MatchServiceError> {
        let status = response.status();
        if status == StatusCode::NOT_FOUND || status == StatusCode::INTERNAL_SERVER_ERROR {
            // The service answers this way while its fingerprint index is empty.
            warn!("Corpus not ready ({}), treating as no matches", status);
            return Ok(CorpusResponse::default());
        }
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(MatchServiceError::Status {
                status: status.as_u16(),
                body,
            });
        }

        let body = response.bytes().await.map_err(|err| self.map_send_error(err))?;
        let parsed: CorpusResponse =
            serde_json::from_slice(&body).map_err(|err| MatchServiceError::Decode(err.to_string()))?;
        if let Some(warning) = &parsed.warning {
            warn!("Corpus warning: {}", warning);
        }
        Ok(parsed)
    }
}

#[async_trait]
impl CorpusMatcher for HttpCorpusMatcher {
    async fn search_fingerprint(&self, request: &FingerprintRequest) -> Result<CorpusResponse, MatchServiceError> {
        let url = format!("{}/match-image", self.base_url);
        log(format!("POST {} threshold {}", url, request.similarity_threshold));
        let response = self
            .client
            .post(&url)
            .json(request)
            .send()
            .await
            .map_err(|err| self.map_send_error(err))?;
        self.read(response).await
    }

    async fn search_text(&self, query: &TextQuery) -> Result<CorpusResponse, MatchServiceError> {
        let url = format!("{}/search", self.base_url);
        let mut params: Vec<(&str, String)> = vec![("limit", query.limit.to_string())];
        if let Some(name) = &query.name {
            params.push(("q", name.clone()));
        }
        if let Some(number) = &query.number {
            params.push(("number", number.clone()));
        }
        log(format!("GET {} {:?}", url, params));
        let response = self
            .client
            .get(&url)
            .query(&params)
            .send()
            .await
            .map_err(|err| self.map_send_error(err))?;
        self.read(response).await
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CorpusEntry {
    pub reference_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub number: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub category: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fingerprints: Option<FingerprintSet>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image_reference: Option<String>,
    #[serde(default)]
    pub metadata: serde_json::Value,
}

impl CorpusEntry {
    pub fn from_image(reference_id: &str, image: &RgbImage) -> Result<Self, ScanError> {
        Ok(Self {
            reference_id: reference_id.to_string(),
            name: None,
            number: None,
            category: None,
            fingerprints: Some(fingerprint_set(image)?),
            image_reference: None,
            metadata: serde_json::Value::Null,
        })
    }

    fn to_match(&self, similarity: f64) -> CorpusMatch {
        CorpusMatch {
            reference_id: self.reference_id.clone(),
            similarity,
            name: self.name.clone(),
            number: self.number.clone(),
            metadata: self.metadata.clone(),
            image_reference: self.image_reference.clone(),
        }
    }
}

/// A local corpus held in memory, loadable from a JSON array of entries.
#[derive(Debug, Clone, Default)]
pub struct InMemoryCorpus {
    entries: Vec<CorpusEntry>,
}

impl InMemoryCorpus {
    pub fn new(entries: Vec<CorpusEntry>) -> Self {
        Self { entries }
    }

    pub fn load(path: &Path) -> Result<Self, MatchServiceError> {
        let raw = fs::read_to_string(path)
            .map_err(|err| MatchServiceError::Decode(format!("{}: {}", path.display(), err)))?;
        let entries: Vec<CorpusEntry> =
            serde_json::from_str(&raw).map_err(|err| MatchServiceError::Decode(err.to_string()))?;
        Ok(Self::new(entries))
    }

    pub fn push(&mut self, entry: CorpusEntry) {
        self.entries.push(entry);
    }

    pub fn entries(&self) -> &[CorpusEntry] {
        &self.entries
    }

    fn indexed_count(&self) -> usize {
        self.entries.iter().filter(|e| e.fingerprints.is_some()).count()
    }
}

#[async_trait]
impl CorpusMatcher for InMemoryCorpus {
    async fn search_fingerprint(&self, request: &FingerprintRequest) -> Result<CorpusResponse, MatchServiceError> {
        let mut matches: Vec<CorpusMatch> = self
            .entries
            .iter()
            .filter(|entry| match (&request.category_filter, &entry.category) {
                (Some(wanted), Some(category)) => wanted.eq_ignore_ascii_case(category),
                (Some(_), None) => false,
                (None, _) => true,
            })
            .filter_map(|entry| {
                let set = entry.fingerprints.as_ref()?;
                let (_, distance) = best_orientation(&request.fingerprint, set);
                let len = request.fingerprint.len().max(set.normal.len());
                if len == 0 {
                    return None;
                }
                let similarity = (1.0 - distance as f64 / len as f64).max(0.0);
                (similarity >= request.similarity_threshold).then(|| entry.to_match(similarity))
            })
            .collect();
        matches.sort_by(|a, b| b.similarity.total_cmp(&a.similarity));
        matches.truncate(request.limit);

        Ok(CorpusResponse {
            matches,
            indexed_count: Some(self.indexed_count()),
            warning: None,
        })
    }

    async fn search_text(&self, query: &TextQuery) -> Result<CorpusResponse, MatchServiceError> {
        let recognition = TextRecognition {
            name: query.name.clone(),
            number: query.number.clone(),
            confidence: 1.0,
            raw_text: String::new(),
        };
        let mut matches: Vec<CorpusMatch> = self
            .entries
            .iter()
            .filter_map(|entry| {
                let score = text_match_score(&recognition, entry.name.as_deref(), entry.number.as_deref());
                (score > 0.0).then(|| entry.to_match(score))
            })
            .collect();
        matches.sort_by(|a, b| b.similarity.total_cmp(&a.similarity));
        matches.truncate(query.limit);

        Ok(CorpusResponse {
            matches,
            indexed_count: Some(self.indexed_count()),
            warning: None,
        })
    }
}

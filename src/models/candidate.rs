use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MatchCandidate {
    pub reference_id: String,
    pub fingerprint_score: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub feature_score: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub text_score: Option<f64>,
    pub combined_score: f64,
    #[serde(default)]
    pub metadata: serde_json::Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image_reference: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TextRecognition {
    pub name: Option<String>,
    pub number: Option<String>,
    /// Recognizer confidence in [0, 1].
    pub confidence: f64,
    #[serde(default)]
    pub raw_text: String,
}

impl TextRecognition {
    pub fn is_usable(&self) -> bool {
        self.name.as_deref().map_or(false, |n| !n.trim().is_empty())
            || self.number.as_deref().map_or(false, |n| !n.trim().is_empty())
    }
}

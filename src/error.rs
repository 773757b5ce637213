use std::time::Duration;

use thiserror::Error;

/// Failures inside the detection and scanning pipeline.
///
/// Only [`ScanError::Config`] is meant to reach a caller; everything else is
/// downgraded to a failed detection at the orchestrator boundary.
#[derive(Debug, Error)]
pub enum ScanError {
    #[error("frame source is not ready")]
    InputUnavailable,
    #[error("no card structure found: {0}")]
    DetectionFailure(String),
    #[error("accelerated detector unavailable: {0}")]
    AcceleratedUnavailable(String),
    #[error("internal error: {0}")]
    Internal(String),
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error("image error: {0}")]
    Image(#[from] image::ImageError),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

#[cfg(feature = "opencv")]
impl From<opencv::Error> for ScanError {
    fn from(err: opencv::Error) -> Self {
        ScanError::Internal(format!("opencv: {}", err))
    }
}

#[derive(Debug, Error)]
pub enum MatchServiceError {
    #[error("request timed out after {0:?}")]
    Timeout(Duration),
    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),
    #[error("corpus responded with status {status}: {body}")]
    Status { status: u16, body: String },
    #[error("unable to decode corpus response: {0}")]
    Decode(String),
    #[error("reference image error: {0}")]
    Image(#[from] image::ImageError),
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid configuration: {0}")]
    Invalid(String),
    #[error("unable to read configuration: {0}")]
    Io(#[from] std::io::Error),
    #[error("unable to parse configuration: {0}")]
    Parse(#[from] serde_json::Error),
}

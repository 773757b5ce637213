//! Card boundary detection, continuous scanning and perceptual identification
//! of trading cards held in front of a camera.

pub mod config;
pub mod detect;
pub mod error;
pub mod features;
pub mod hash;
pub mod matching;
pub mod models;
pub mod opt;
pub mod scan;

pub use config::ScannerConfig;
pub use detect::{DetectOptions, HybridDetector};
pub use error::{ConfigError, MatchServiceError, ScanError};
pub use matching::{MatchAggregator, MatchOutcome};
pub use scan::{ScanHandle, ScanListener, ScanSession};

use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::Duration;

use directories::ProjectDirs;
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::error::ConfigError;

const APP_NAME: &str = "card-scanner";
const APP_AUTHOR: &str = "cardscan";
const APP_QUALIFIER: &str = "com";

const CONFIG_FILE_NAME: &str = "config.json";

pub const ENV_CORPUS_URL: &str = "CARD_SCANNER_CORPUS_URL";
pub const ENV_TESSDATA: &str = "CARD_SCANNER_TESSDATA";
pub const ENV_INTERVAL_MS: &str = "CARD_SCANNER_INTERVAL_MS";

const MAX_TARGET_SIDE: u32 = 4096;

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ScannerConfig {
    pub scan: ScanConfig,
    pub detect: DetectConfig,
    pub matching: MatchConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ScanConfig {
    pub detection_interval_ms: u64,
    /// Average confidence the stabilization window must reach.
    pub min_confidence: f64,
    pub min_area: f64,
    pub stabilization_frames: usize,
    /// Trailing window kept in the detection history.
    pub history_window_ms: u64,
    pub max_history: usize,
}

impl Default for ScanConfig {
    fn default() -> Self {
        Self {
            detection_interval_ms: 500,
            min_confidence: 0.7,
            min_area: 50_000.0,
            stabilization_frames: 3,
            history_window_ms: 5_000,
            max_history: 64,
        }
    }
}

impl ScanConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.detection_interval_ms)
    }

    pub fn history_window(&self) -> Duration {
        Duration::from_millis(self.history_window_ms)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct DetectConfig {
    pub fast_mode: bool,
    pub min_confidence: f64,
    pub min_area: f64,
    pub enable_accelerated: bool,
    pub enable_simple: bool,
    pub target_width: u32,
    pub target_height: u32,
}

impl Default for DetectConfig {
    fn default() -> Self {
        Self {
            fast_mode: false,
            min_confidence: 0.3,
            min_area: 5_000.0,
            enable_accelerated: true,
            enable_simple: true,
            target_width: 330,
            target_height: 440,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct MatchConfig {
    pub corpus_url: Option<String>,
    pub tessdata_path: Option<String>,
    pub similarity_threshold: f64,
    pub category_filter: Option<String>,
    pub request_timeout_secs: u64,
    pub refine_with_features: bool,
    pub refine_top: usize,
    pub hash_weight: f64,
    pub feature_weight: f64,
    pub refine_accept_score: f64,
    pub text_weight: f64,
    pub max_candidates: usize,
}

impl Default for MatchConfig {
    fn default() -> Self {
        Self {
            corpus_url: None,
            tessdata_path: None,
            similarity_threshold: 0.05,
            category_filter: None,
            request_timeout_secs: 30,
            refine_with_features: true,
            refine_top: 10,
            hash_weight: 0.6,
            feature_weight: 0.4,
            refine_accept_score: 0.5,
            text_weight: 0.6,
            max_candidates: 20,
        }
    }
}

impl MatchConfig {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }
}

impl ScannerConfig {
    /// Reads the config from `path`, or from the per-user config directory
    /// when no path is given. A missing file yields the defaults.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let path = match path {
            Some(path) => path.to_path_buf(),
            None => default_config_path()?,
        };

        let mut config = if path.exists() {
            let contents = fs::read_to_string(&path)?;
            serde_json::from_str::<ScannerConfig>(&contents)?
        } else {
            info!("No config at {}, using defaults", path.display());
            ScannerConfig::default()
        };

        config.apply_env();
        config.validate()?;
        Ok(config)
    }

    pub fn save(&self, path: &Path) -> Result<(), ConfigError> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let mut file = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .open(path)?;
        let content = serde_json::to_string_pretty(self)?;
        file.write_all(content.as_bytes())?;
        Ok(())
    }

    /// Environment overrides, applied after `dotenv` has populated the
    /// process environment.
    pub fn apply_env(&mut self) {
        if let Ok(url) = std::env::var(ENV_CORPUS_URL) {
            if !url.trim().is_empty() {
                self.matching.corpus_url = Some(url.trim().to_string());
            }
        }
        if let Ok(path) = std::env::var(ENV_TESSDATA) {
            if !path.trim().is_empty() {
                self.matching.tessdata_path = Some(path.trim().to_string());
            }
        }
        if let Some(interval) = std::env::var(ENV_INTERVAL_MS)
            .ok()
            .and_then(|s| s.trim().parse::<u64>().ok())
        {
            self.scan.detection_interval_ms = interval;
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        self.scan.validate()?;
        self.detect.validate()?;
        self.matching.validate()
    }
}

impl ScanConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.detection_interval_ms == 0 {
            return Err(invalid("scan.detection_interval_ms must be positive"));
        }
        check_unit("scan.min_confidence", self.min_confidence)?;
        if self.min_area < 0.0 {
            return Err(invalid("scan.min_area must not be negative"));
        }
        if self.stabilization_frames == 0 {
            return Err(invalid("scan.stabilization_frames must be at least 1"));
        }
        if self.max_history < self.stabilization_frames {
            return Err(invalid(
                "scan.max_history must hold at least stabilization_frames entries",
            ));
        }
        Ok(())
    }
}

impl DetectConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        check_unit("detect.min_confidence", self.min_confidence)?;
        if self.min_area < 0.0 {
            return Err(invalid("detect.min_area must not be negative"));
        }
        for (name, side) in [
            ("detect.target_width", self.target_width),
            ("detect.target_height", self.target_height),
        ] {
            if side == 0 || side > MAX_TARGET_SIDE {
                return Err(invalid(&format!(
                    "{} must be within 1..={} (got {})",
                    name, MAX_TARGET_SIDE, side
                )));
            }
        }
        if !self.enable_simple && !self.enable_accelerated {
            return Err(invalid("at least one detection strategy must be enabled"));
        }
        Ok(())
    }
}

impl MatchConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        check_unit("matching.similarity_threshold", self.similarity_threshold)?;
        check_unit("matching.refine_accept_score", self.refine_accept_score)?;
        check_unit("matching.text_weight", self.text_weight)?;
        if self.request_timeout_secs == 0 {
            return Err(invalid("matching.request_timeout_secs must be positive"));
        }
        if self.hash_weight <= 0.0 || self.feature_weight < 0.0 {
            return Err(invalid("matching weights must be positive"));
        }
        Ok(())
    }
}

fn check_unit(name: &str, value: f64) -> Result<(), ConfigError> {
    if (0.0..=1.0).contains(&value) {
        Ok(())
    } else {
        Err(invalid(&format!("{} must be within [0, 1] (got {})", name, value)))
    }
}

fn invalid(msg: &str) -> ConfigError {
    ConfigError::Invalid(msg.to_string())
}

pub fn default_config_path() -> Result<PathBuf, ConfigError> {
    let project_dirs = ProjectDirs::from(APP_QUALIFIER, APP_AUTHOR, APP_NAME)
        .ok_or_else(|| invalid("unable to resolve the user config directory"))?;
    Ok(project_dirs.config_dir().join(CONFIG_FILE_NAME))
}

//! Pipeline configuration.
//!
//! Endpoint, retry and image constants that used to be module-level globals
//! live here and are passed into the pipeline at construction. Loaded from a
//! JSON document; every field has a default so partial files are fine.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::pipeline::ExtractionError;

/// Application-level constants
pub const APP_NAME: &str = "AutoQuest";
pub const APP_VERSION: &str = env!("CARGO_PKG_VERSION");

/// Get the application data directory (~/AutoQuest/ on all platforms)
pub fn app_data_dir() -> Option<PathBuf> {
    dirs::home_dir().map(|home| home.join(APP_NAME))
}

/// Default location of the configuration file.
pub fn default_config_path() -> Option<PathBuf> {
    app_data_dir().map(|dir| dir.join("config.json"))
}

/// Filter used when `RUST_LOG` is not set.
pub fn default_log_filter() -> &'static str {
    "info,autoquest_lib=info,reqwest=warn"
}

// ═══════════════════════════════════════════════════════════
// Types
// ═══════════════════════════════════════════════════════════

/// Which prompt/parse path reconciles the model output with the schema.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReconciliationStrategy {
    /// JSON prompt; an unparsable response fails the patient.
    Json,
    /// JSON prompt; an unparsable response is reparsed as `Key: Value` lines.
    JsonWithLineFallback,
    /// Free-form `Key: Value` prompt and fuzzy matching throughout.
    Lines,
}

/// Backoff between attempts of the remote call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackoffKind {
    Fixed,
    Exponential,
}

/// One spelling fix applied to normalized labels, word by word.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LabelCorrection {
    pub from: String,
    pub to: String,
}

impl LabelCorrection {
    pub fn new(from: &str, to: &str) -> Self {
        Self {
            from: from.to_string(),
            to: to.to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    /// Vision model endpoint (`POST` JSON).
    pub endpoint_url: String,
    /// Total attempts of the remote call, first one included.
    pub max_retries: u32,
    pub retry_delay_secs: u64,
    pub backoff: BackoffKind,
    pub request_timeout_secs: u64,
    pub max_tokens: u32,
    /// Longest side of the image sent to the model, in pixels.
    pub max_image_dimension: u32,
    /// Merged images larger than this are rejected.
    pub max_image_bytes: u64,
    /// Minimum similarity (0..=1) for a fuzzy label match.
    pub fuzzy_match_threshold: f64,
    /// Variables whose raw answers may be coerced to Oui/Non.
    pub boolean_fields: Vec<String>,
    /// Known label misspellings, applied after normalization.
    pub label_corrections: Vec<LabelCorrection>,
    pub strategy: ReconciliationStrategy,
    /// Refuse to start new work above this memory usage (percent).
    pub max_memory_percent: f64,
    /// Refuse to start new work above this 1-minute load average per core.
    pub max_load_per_core: f64,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            endpoint_url: "http://localhost:8000/generate".into(),
            max_retries: 3,
            retry_delay_secs: 5,
            backoff: BackoffKind::Fixed,
            request_timeout_secs: 300,
            max_tokens: 4096,
            max_image_dimension: 2000,
            max_image_bytes: 10 * 1024 * 1024,
            fuzzy_match_threshold: 0.6,
            boolean_fields: default_boolean_fields(),
            label_corrections: default_label_corrections(),
            strategy: ReconciliationStrategy::JsonWithLineFallback,
            max_memory_percent: 90.0,
            max_load_per_core: 0.9,
        }
    }
}

/// Checkbox questions of the standard intake questionnaire.
fn default_boolean_fields() -> Vec<String> {
    [
        "Fièvre",
        "Toux",
        "Diarrhée",
        "Vomissements",
        "Céphalées",
        "Fatigue",
        "Douleurs abdominales",
        "Éruption cutanée",
        "Hospitalisation",
        "Vaccination",
    ]
    .iter()
    .map(|s| s.to_string())
    .collect()
}

/// OCR/model misspellings seen on scanned forms.
fn default_label_corrections() -> Vec<LabelCorrection> {
    vec![
        LabelCorrection::new("provnce", "province"),
        LabelCorrection::new("povince", "province"),
        LabelCorrection::new("distric", "district"),
        LabelCorrection::new("disctrict", "district"),
        LabelCorrection::new("maladi", "maladie"),
        LabelCorrection::new("maldie", "maladie"),
    ]
}

impl PipelineConfig {
    /// Load from a JSON file. A missing file yields the defaults.
    pub fn load(path: &Path) -> Result<Self, ExtractionError> {
        if !path.exists() {
            tracing::info!(path = %path.display(), "No config file, using defaults");
            return Ok(Self::default());
        }
        let raw = std::fs::read_to_string(path)?;
        let config: Self = serde_json::from_str(&raw)
            .map_err(|e| ExtractionError::Config(format!("{}: {e}", path.display())))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ExtractionError> {
        if !(0.0..=1.0).contains(&self.fuzzy_match_threshold) {
            return Err(ExtractionError::Config(format!(
                "fuzzy_match_threshold must be within 0..=1, got {}",
                self.fuzzy_match_threshold
            )));
        }
        if self.max_image_dimension == 0 {
            return Err(ExtractionError::Config(
                "max_image_dimension must be positive".into(),
            ));
        }
        if self.max_retries == 0 {
            return Err(ExtractionError::Config("max_retries must be at least 1".into()));
        }
        Ok(())
    }

    pub fn retry_delay(&self) -> Duration {
        Duration::from_secs(self.retry_delay_secs)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_documented_constants() {
        let config = PipelineConfig::default();
        assert_eq!(config.max_retries, 3);
        assert_eq!(config.retry_delay(), Duration::from_secs(5));
        assert_eq!(config.max_image_dimension, 2000);
        assert!((config.fuzzy_match_threshold - 0.6).abs() < f64::EPSILON);
        assert_eq!(config.strategy, ReconciliationStrategy::JsonWithLineFallback);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn partial_file_fills_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        std::fs::write(
            &path,
            r#"{"endpoint_url": "http://gpu-box:8000/generate", "strategy": "lines", "boolean_fields": ["Fumeur"]}"#,
        )
        .unwrap();

        let config = PipelineConfig::load(&path).unwrap();
        assert_eq!(config.endpoint_url, "http://gpu-box:8000/generate");
        assert_eq!(config.strategy, ReconciliationStrategy::Lines);
        assert_eq!(config.boolean_fields, vec!["Fumeur"]);
        assert_eq!(config.max_tokens, 4096);
    }

    #[test]
    fn missing_file_gives_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let config = PipelineConfig::load(&dir.path().join("absent.json")).unwrap();
        assert_eq!(config, PipelineConfig::default());
    }

    #[test]
    fn out_of_range_threshold_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        std::fs::write(&path, r#"{"fuzzy_match_threshold": 1.5}"#).unwrap();
        assert!(matches!(
            PipelineConfig::load(&path),
            Err(ExtractionError::Config(_))
        ));
    }

    #[test]
    fn strategy_serializes_snake_case() {
        let json = serde_json::to_string(&ReconciliationStrategy::JsonWithLineFallback).unwrap();
        assert_eq!(json, "\"json_with_line_fallback\"");
    }

    #[test]
    fn app_data_dir_under_home() {
        if let (Some(dir), Some(home)) = (app_data_dir(), dirs::home_dir()) {
            assert!(dir.starts_with(home));
            assert!(dir.ends_with("AutoQuest"));
        }
    }
}

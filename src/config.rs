//! Configuration management

use std::{
    path::{Path, PathBuf},
    time::Duration,
};

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::{
    classifier::GestureLabels,
    decision::{ConfidencePolicy, DEFAULT_CONFIDENCE_THRESHOLD},
    keypoints::KeypointLayout,
    model_download::{
        FACE_LANDMARK_MODEL_FILENAME, HAND_LANDMARK_MODEL_FILENAME, HAND_LANDMARK_MODEL_URL,
        PALM_DETECTOR_MODEL_FILENAME, PALM_DETECTOR_MODEL_URL, POSE_LANDMARK_MODEL_FILENAME,
        SEQUENCE_CLASSIFIER_MODEL_FILENAME, default_model_dir,
    },
    sequence::DEFAULT_WINDOW_LEN,
};

pub const JWT_SECRET_ENV: &str = "SIGNSPEAK_JWT_SECRET";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("failed to serialize config: {0}")]
    Serialize(#[from] toml::ser::Error),

    #[error("invalid config: {0}")]
    Invalid(String),
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct Config {
    pub server: ServerConfig,
    pub models: ModelsConfig,
    pub recognition: RecognitionConfig,
    pub source: SourceConfig,
    pub auth: AuthConfig,
    pub dataset: DatasetConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ServerConfig {
    pub bind: String,
    /// Pending inference jobs before requests are turned away with 503.
    pub queue_capacity: usize,
    pub max_upload_bytes: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: "127.0.0.1:8000".to_string(),
            queue_capacity: 8,
            max_upload_bytes: 10 * 1024 * 1024,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ModelSource {
    pub path: PathBuf,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
}

impl ModelSource {
    fn local(path: PathBuf) -> Self {
        Self { path, url: None }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ModelsConfig {
    pub intra_threads: usize,
    pub classifier: PathBuf,
    pub palm_detector: ModelSource,
    pub hand_landmarker: ModelSource,
    pub pose_landmarker: ModelSource,
    pub face_landmarker: ModelSource,
}

impl Default for ModelsConfig {
    fn default() -> Self {
        let dir = default_model_dir();
        Self {
            intra_threads: 2,
            classifier: dir.join(SEQUENCE_CLASSIFIER_MODEL_FILENAME),
            palm_detector: ModelSource {
                path: dir.join(PALM_DETECTOR_MODEL_FILENAME),
                url: Some(PALM_DETECTOR_MODEL_URL.to_string()),
            },
            hand_landmarker: ModelSource {
                path: dir.join(HAND_LANDMARK_MODEL_FILENAME),
                url: Some(HAND_LANDMARK_MODEL_URL.to_string()),
            },
            pose_landmarker: ModelSource::local(dir.join(POSE_LANDMARK_MODEL_FILENAME)),
            face_landmarker: ModelSource::local(dir.join(FACE_LANDMARK_MODEL_FILENAME)),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct RecognitionConfig {
    /// Output order of the classifier; must match training.
    pub labels: Vec<String>,
    pub layout: KeypointLayout,
    pub window_len: usize,
    pub confidence_threshold: f32,
    pub prediction_interval_ms: u64,
    pub min_detection_confidence: f32,
}

impl Default for RecognitionConfig {
    fn default() -> Self {
        Self {
            labels: GestureLabels::default().as_slice().to_vec(),
            layout: KeypointLayout::Holistic,
            window_len: DEFAULT_WINDOW_LEN,
            confidence_threshold: DEFAULT_CONFIDENCE_THRESHOLD,
            prediction_interval_ms: 3_000,
            min_detection_confidence: 0.5,
        }
    }
}

impl RecognitionConfig {
    pub fn gesture_labels(&self) -> Result<GestureLabels, ConfigError> {
        GestureLabels::new(self.labels.iter().cloned())
            .map_err(|err| ConfigError::Invalid(err.to_string()))
    }

    pub fn policy(&self) -> ConfidencePolicy {
        ConfidencePolicy::new(self.confidence_threshold)
    }

    pub fn prediction_interval(&self) -> Duration {
        Duration::from_millis(self.prediction_interval_ms)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct SourceConfig {
    /// Local camera index, used when `url` is unset.
    pub camera_index: u32,
    /// MJPEG stream, e.g. a phone camera app on the local network.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    pub mirror: bool,
}

impl Default for SourceConfig {
    fn default() -> Self {
        Self {
            camera_index: 0,
            url: None,
            mirror: true,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct AuthConfig {
    pub database: PathBuf,
    pub jwt_secret: String,
    pub token_ttl_secs: u64,
    pub bcrypt_cost: u32,
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            database: PathBuf::from("users.db"),
            jwt_secret: String::new(),
            token_ttl_secs: 3_600,
            bcrypt_cost: bcrypt::DEFAULT_COST,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct DatasetConfig {
    pub path: PathBuf,
    pub sequences_per_action: usize,
    pub countdown_secs: u64,
}

impl Default for DatasetConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("MP_Data"),
            sequences_per_action: 30,
            countdown_secs: 3,
        }
    }
}

impl Config {
    pub fn validate(&self) -> Result<(), ConfigError> {
        let recognition = &self.recognition;
        recognition.gesture_labels()?;
        if recognition.window_len == 0 {
            return Err(ConfigError::Invalid("window_len must be > 0".to_string()));
        }
        if !(0.0..=1.0).contains(&recognition.confidence_threshold) {
            return Err(ConfigError::Invalid(format!(
                "confidence_threshold must be in [0, 1], got {}",
                recognition.confidence_threshold
            )));
        }
        if !(0.0..=1.0).contains(&recognition.min_detection_confidence) {
            return Err(ConfigError::Invalid(format!(
                "min_detection_confidence must be in [0, 1], got {}",
                recognition.min_detection_confidence
            )));
        }
        if self.server.queue_capacity == 0 {
            return Err(ConfigError::Invalid("queue_capacity must be > 0".to_string()));
        }
        if self.server.bind.trim().is_empty() {
            return Err(ConfigError::Invalid("bind must not be empty".to_string()));
        }
        if !(4..=31).contains(&self.auth.bcrypt_cost) {
            return Err(ConfigError::Invalid(format!(
                "bcrypt_cost must be in [4, 31], got {}",
                self.auth.bcrypt_cost
            )));
        }
        if self.auth.token_ttl_secs == 0 {
            return Err(ConfigError::Invalid("token_ttl_secs must be > 0".to_string()));
        }
        Ok(())
    }

    pub fn from_toml(content: &str) -> Result<Self, ConfigError> {
        let mut config: Self = toml::from_str(content)?;
        config.apply_env();
        config.validate()?;
        Ok(config)
    }

    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml(&content)
    }

    /// Loads `path` when it exists, otherwise the defaults.
    pub fn load_or_default(path: &Path) -> Result<Self, ConfigError> {
        if path.exists() {
            Self::load(path)
        } else {
            log::info!("no config at {}, using defaults", path.display());
            let mut config = Self::default();
            config.apply_env();
            config.validate()?;
            Ok(config)
        }
    }

    pub fn to_toml(&self) -> Result<String, ConfigError> {
        Ok(toml::to_string_pretty(self)?)
    }

    fn apply_env(&mut self) {
        if let Ok(secret) = std::env::var(JWT_SECRET_ENV) {
            if !secret.is_empty() {
                self.auth.jwt_secret = secret;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_defaults_are_valid() {
        let config = Config::default();
        config.validate().unwrap();
        assert_eq!(config.recognition.window_len, 30);
        assert_eq!(config.recognition.confidence_threshold, 0.7);
        assert_eq!(config.recognition.prediction_interval(), Duration::from_secs(3));
        assert_eq!(config.server.bind, "127.0.0.1:8000");
    }

    #[test]
    fn test_toml_round_trip() {
        let mut config = Config::default();
        config.source.url = Some("http://192.168.1.20:4747/video".to_string());
        config.recognition.layout = KeypointLayout::HandOnly;
        let text = config.to_toml().unwrap();
        let parsed: Config = toml::from_str(&text).unwrap();
        assert_eq!(parsed, config);
    }

    #[test]
    fn test_partial_file_fills_defaults() {
        let config = Config::from_toml(
            r#"
            [recognition]
            labels = ["a", "b"]
            confidence_threshold = 0.5
            "#,
        )
        .unwrap();
        assert_eq!(config.recognition.labels, vec!["a", "b"]);
        assert_eq!(config.recognition.window_len, 30);
        assert_eq!(config.server.queue_capacity, 8);
    }

    #[test]
    fn test_rejects_bad_threshold() {
        let err = Config::from_toml("[recognition]\nconfidence_threshold = 1.5\n").unwrap_err();
        assert!(matches!(err, ConfigError::Invalid(_)));
    }

    #[test]
    fn test_rejects_duplicate_labels() {
        let err = Config::from_toml("[recognition]\nlabels = [\"yes\", \"yes\"]\n").unwrap_err();
        assert!(matches!(err, ConfigError::Invalid(_)));
    }

    #[test]
    fn test_rejects_zero_window() {
        let err = Config::from_toml("[recognition]\nwindow_len = 0\n").unwrap_err();
        assert!(matches!(err, ConfigError::Invalid(_)));
    }

    #[test]
    fn test_load_or_default_without_file() {
        let dir = TempDir::new().unwrap();
        let config = Config::load_or_default(&dir.path().join("absent.toml")).unwrap();
        assert_eq!(config.recognition.labels.len(), 5);
    }

    #[test]
    fn test_load_reads_file() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("signspeak.toml");
        std::fs::write(&path, "[server]\nbind = \"0.0.0.0:9000\"\n").unwrap();
        let config = Config::load(&path).unwrap();
        assert_eq!(config.server.bind, "0.0.0.0:9000");
    }
}

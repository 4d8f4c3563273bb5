//! Application Configuration
//!
//! Service settings stored in TOML format. Every section is optional in the
//! file and falls back to the defaults below.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Environment variable that overrides `server.api_key`
pub const API_KEY_ENV: &str = "BOTTLE_FINDER_API_KEY";

/// Application settings
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    /// HTTP server settings
    pub server: ServerConfig,
    /// Product catalog settings
    pub catalog: CatalogConfig,
    /// Temporary image staging settings
    pub staging: StagingConfig,
    /// Object detector settings
    pub detector: DetectorConfig,
    /// Text extraction settings
    pub ocr: OcrConfig,
    /// Catalog matching settings
    pub matcher: MatcherConfig,
    /// Remote product image fetching
    pub fetch: FetchConfig,
}

impl AppConfig {
    /// Apply overrides taken from the process environment
    pub fn apply_env_overrides(&mut self) {
        if let Ok(key) = std::env::var(API_KEY_ENV) {
            if !key.trim().is_empty() {
                self.server.api_key = key;
            }
        }
    }

    /// Reject settings the pipeline cannot run with
    pub fn validate(&self) -> Result<()> {
        if self.staging.target_size == 0 {
            anyhow::bail!("staging.target_size must be greater than zero");
        }
        if self.detector.input_size == 0 {
            anyhow::bail!("detector.input_size must be greater than zero");
        }
        Ok(())
    }
}

/// HTTP server settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Socket address to listen on
    pub bind: String,
    /// Shared secret expected in the `X-API-KEY` header
    pub api_key: String,
    /// Maximum accepted request body size in bytes
    pub max_upload_bytes: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: "0.0.0.0:56789".to_string(),
            api_key: "change-me".to_string(),
            max_upload_bytes: 20 * 1024 * 1024,
        }
    }
}

/// Product catalog settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CatalogConfig {
    /// JSON file holding the product list
    pub products_file: PathBuf,
    /// Directory served under `/db/images`
    pub images_dir: PathBuf,
}

impl Default for CatalogConfig {
    fn default() -> Self {
        Self {
            products_file: PathBuf::from("db/products.json"),
            images_dir: PathBuf::from("db/images"),
        }
    }
}

/// Temporary image staging settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StagingConfig {
    /// Root holding the `input`, `resized` and `output` directories
    pub root: PathBuf,
    /// Square size uploads are resampled to before detection
    pub target_size: u32,
}

impl Default for StagingConfig {
    fn default() -> Self {
        Self {
            root: PathBuf::from("temp-images"),
            target_size: 640,
        }
    }
}

/// Where a model file lives and how to obtain it when missing
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelSource {
    /// Local path of the model file
    pub path: PathBuf,
    /// Download location used when the file is missing
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    /// Expected SHA-256 of the file (hex)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sha256: Option<String>,
}

impl ModelSource {
    /// Local-only model source
    pub fn local(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            url: None,
            sha256: None,
        }
    }
}

/// Inference device selection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Device {
    #[default]
    Cpu,
    Cuda,
}

/// Object detector settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DetectorConfig {
    /// ONNX export of the trained detector
    pub model: ModelSource,
    /// Square network input size
    pub input_size: u32,
    /// Minimum confidence for a detection
    pub conf_threshold: f32,
    /// IoU above which overlapping boxes are suppressed
    pub iou_threshold: f32,
    /// Maximum detections kept after suppression
    pub max_detections: usize,
    /// Inference device
    pub device: Device,
}

impl Default for DetectorConfig {
    fn default() -> Self {
        Self {
            model: ModelSource::local("trained-model/yolov5-large-trained.onnx"),
            input_size: 640,
            conf_threshold: 0.25,
            iou_threshold: 0.45,
            max_detections: 1000,
            device: Device::Cpu,
        }
    }
}

/// Text extraction settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct OcrConfig {
    /// PaddleOCR text detection model
    pub detection_model: ModelSource,
    /// PaddleOCR text recognition model
    pub recognition_model: ModelSource,
    /// Character dictionary for the recognition model
    pub dictionary: ModelSource,
    /// Minimum length (in characters) of accepted label text
    pub min_text_len: usize,
    /// Multiplier applied to box width and height before cropping
    pub crop_gain: f32,
    /// Pixels added to box width and height before cropping
    pub crop_pad: f32,
    /// Probability above which a pixel counts as text
    pub binarize_threshold: f32,
    /// Minimum mean probability for a text box to be recognized
    pub box_threshold: f32,
    /// Longest side of the text detection input
    pub max_side: u32,
}

impl Default for OcrConfig {
    fn default() -> Self {
        Self {
            detection_model: ModelSource {
                path: PathBuf::from("models/det.onnx"),
                url: Some(
                    "https://huggingface.co/monkt/paddleocr-onnx/resolve/main/detection/v3/det.onnx"
                        .to_string(),
                ),
                sha256: None,
            },
            recognition_model: ModelSource {
                path: PathBuf::from("models/rec.onnx"),
                url: Some(
                    "https://huggingface.co/monkt/paddleocr-onnx/resolve/main/languages/latin/rec.onnx"
                        .to_string(),
                ),
                sha256: None,
            },
            dictionary: ModelSource {
                path: PathBuf::from("models/dict.txt"),
                url: Some(
                    "https://huggingface.co/monkt/paddleocr-onnx/resolve/main/languages/latin/dict.txt"
                        .to_string(),
                ),
                sha256: None,
            },
            min_text_len: 4,
            crop_gain: 1.02,
            crop_pad: 10.0,
            binarize_threshold: 0.3,
            box_threshold: 0.6,
            max_side: 960,
        }
    }
}

/// String similarity used to score OCR text against product names
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScoreAlgorithm {
    /// Ratcliff/Obershelp matching-blocks ratio
    #[default]
    RatcliffObershelp,
    /// Normalized Levenshtein similarity
    Levenshtein,
    /// Jaro-Winkler similarity
    JaroWinkler,
}

/// Catalog matching settings
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct MatcherConfig {
    /// A product must score strictly above this to be returned (0-100)
    pub min_score: u8,
    /// Scoring function
    pub algorithm: ScoreAlgorithm,
}

/// Remote product image fetching
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FetchConfig {
    /// Per-request timeout in seconds
    pub timeout_secs: u64,
}

impl Default for FetchConfig {
    fn default() -> Self {
        Self { timeout_secs: 10 }
    }
}

/// Load configuration from file
pub fn load_config(path: &Path) -> Result<AppConfig> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file {:?}", path))?;
    let config: AppConfig = toml::from_str(&content)
        .with_context(|| format!("Failed to parse config file {:?}", path))?;
    config
        .validate()
        .with_context(|| format!("Invalid config file {:?}", path))?;
    Ok(config)
}

/// Save configuration to file
pub fn save_config(config: &AppConfig, path: &Path) -> Result<()> {
    let content = toml::to_string_pretty(config)?;
    std::fs::write(path, content)?;
    Ok(())
}

//! Model management for ONNX Runtime
//!
//! Locates model files on disk, downloads missing ones, and wraps loaded
//! ONNX Runtime sessions.

use anyhow::{Context, Result};
use futures_util::StreamExt;
use ort::session::{builder::GraphOptimizationLevel, Session};
use parking_lot::Mutex;
use sha2::{Digest, Sha256};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::config::{Device, ModelSource};

/// Set to any value to forbid model downloads
pub const OFFLINE_ENV: &str = "BOTTLE_FINDER_OFFLINE";

/// Model manager for downloading and verifying model files
pub struct ModelManager {
    client: reqwest::Client,
}

impl ModelManager {
    /// Create a new model manager
    pub fn new() -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(300)) // 5 minute timeout
            .build()
            .context("Failed to create HTTP client")?;

        Ok(Self { client })
    }

    /// Make sure a model file exists locally, downloading it if needed
    /// Returns the path to the model file
    pub async fn ensure(&self, source: &ModelSource) -> Result<PathBuf> {
        if is_model_available(&source.path) {
            match source.sha256.as_deref() {
                None => {
                    debug!("Model already available at {:?}", source.path);
                    return Ok(source.path.clone());
                }
                Some(expected) => {
                    let actual = file_sha256(&source.path)?;
                    if actual.eq_ignore_ascii_case(expected) {
                        debug!("Model at {:?} matches its checksum", source.path);
                        return Ok(source.path.clone());
                    }
                    warn!(
                        "Model at {:?} has checksum {}, expected {}",
                        source.path, actual, expected
                    );
                }
            }
        }

        let Some(url) = source.url.as_deref() else {
            anyhow::bail!(
                "Model file {:?} is missing and no download URL is configured",
                source.path
            );
        };

        if std::env::var(OFFLINE_ENV).is_ok() {
            anyhow::bail!(
                "Offline mode: cannot download models. Please download manually from {} and place at {:?}",
                url,
                source.path
            );
        }

        if let Some(parent) = source.path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create model directory {:?}", parent))?;
        }

        info!("Downloading model from {} to {:?}", url, source.path);
        self.download_file(url, &source.path, source.sha256.as_deref())
            .await?;
        info!("Successfully downloaded {:?}", source.path);

        Ok(source.path.clone())
    }

    /// Stream a file to disk, verifying its checksum when one is known
    async fn download_file(&self, url: &str, path: &Path, expected_sha256: Option<&str>) -> Result<()> {
        let response = self
            .client
            .get(url)
            .send()
            .await
            .context("Failed to send download request")?;

        if !response.status().is_success() {
            anyhow::bail!("Download failed with status {}: {}", response.status(), url);
        }

        debug!("Download size: {:?} bytes", response.content_length());

        let temp_path = path.with_extension("tmp");
        let mut file = std::fs::File::create(&temp_path).context("Failed to create temp file")?;

        let mut hasher = Sha256::new();
        let mut stream = response.bytes_stream();

        while let Some(chunk) = stream.next().await {
            let chunk = chunk.context("Error reading download stream")?;
            file.write_all(&chunk).context("Failed to write to temp file")?;
            hasher.update(&chunk);
        }

        file.flush().context("Failed to flush temp file")?;
        drop(file);

        let hash = format!("{:x}", hasher.finalize());
        if let Some(expected) = expected_sha256 {
            if !hash.eq_ignore_ascii_case(expected) {
                std::fs::remove_file(&temp_path).ok();
                anyhow::bail!(
                    "Checksum mismatch for {:?}: expected {}, got {}",
                    path,
                    expected,
                    hash
                );
            }
            info!("Checksum verified for {:?}", path);
        }

        std::fs::rename(&temp_path, path)
            .context("Failed to move downloaded file to final location")?;

        Ok(())
    }
}

/// A model counts as available when it is a non-empty regular file
pub fn is_model_available(path: &Path) -> bool {
    std::fs::metadata(path)
        .map(|m| m.is_file() && m.len() > 0)
        .unwrap_or(false)
}

/// SHA-256 of a file on disk, hex encoded
pub fn file_sha256(path: &Path) -> Result<String> {
    let data = std::fs::read(path).with_context(|| format!("Failed to read {:?}", path))?;
    let mut hasher = Sha256::new();
    hasher.update(&data);
    Ok(format!("{:x}", hasher.finalize()))
}

/// ONNX Runtime session wrapper
///
/// Inference needs exclusive access to the session, so runs are serialized
/// through a mutex.
pub struct OnnxSession {
    session: Mutex<Session>,
}

impl OnnxSession {
    /// Create a new ONNX session from a model file on the given device
    pub fn new(model_path: &Path, device: Device) -> Result<Self> {
        info!("Loading ONNX model from {:?} ({:?})", model_path, device);

        let session_builder = Session::builder()?
            .with_optimization_level(GraphOptimizationLevel::Level3)?
            .with_intra_threads(4)?;

        #[cfg(feature = "cuda")]
        let session_builder = if device == Device::Cuda {
            use ort::execution_providers::CUDAExecutionProvider;
            match session_builder
                .with_execution_providers([CUDAExecutionProvider::default().build()])
            {
                Ok(builder) => {
                    info!("CUDA acceleration enabled");
                    builder
                }
                Err(e) => {
                    warn!("CUDA not available, using CPU: {}", e);
                    Session::builder()?
                        .with_optimization_level(GraphOptimizationLevel::Level3)?
                        .with_intra_threads(4)?
                }
            }
        } else {
            session_builder
        };

        #[cfg(not(feature = "cuda"))]
        if device == Device::Cuda {
            warn!("Built without the `cuda` feature, running {:?} on CPU", model_path);
        }

        let session = session_builder
            .commit_from_file(model_path)
            .with_context(|| format!("Failed to load ONNX model {:?}", model_path))?;

        let input_names: Vec<String> = session
            .inputs
            .iter()
            .map(|input| input.name.clone())
            .collect();

        let output_names: Vec<String> = session
            .outputs
            .iter()
            .map(|output| output.name.clone())
            .collect();

        info!(
            "Model loaded. Inputs: {:?}, Outputs: {:?}",
            input_names, output_names
        );

        Ok(Self {
            session: Mutex::new(session),
        })
    }

    /// Get the underlying session for running inference
    pub fn session(&self) -> &Mutex<Session> {
        &self.session
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_model_availability() {
        let dir = TempDir::new().unwrap();
        let empty = dir.path().join("empty.onnx");
        let full = dir.path().join("full.onnx");
        std::fs::write(&empty, b"").unwrap();
        std::fs::write(&full, b"weights").unwrap();

        assert!(!is_model_available(&empty));
        assert!(is_model_available(&full));
        assert!(!is_model_available(&dir.path().join("missing.onnx")));
        assert!(!is_model_available(dir.path()));
    }

    #[test]
    fn test_file_sha256() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("abc.txt");
        std::fs::write(&path, b"abc").unwrap();

        assert_eq!(
            file_sha256(&path).unwrap(),
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
    }

    #[tokio::test]
    async fn test_ensure_existing_model() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("det.onnx");
        std::fs::write(&path, b"weights").unwrap();

        let manager = ModelManager::new().unwrap();
        let resolved = manager.ensure(&ModelSource::local(&path)).await.unwrap();
        assert_eq!(resolved, path);
    }

    #[tokio::test]
    async fn test_ensure_verifies_existing_checksum() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("abc.onnx");
        std::fs::write(&path, b"abc").unwrap();
        let manager = ModelManager::new().unwrap();

        let mut source = ModelSource::local(&path);
        source.sha256 =
            Some("BA7816BF8F01CFEA414140DE5DAE2223B00361A396177A9CB410FF61F20015AD".to_string());
        assert_eq!(manager.ensure(&source).await.unwrap(), path);

        // Corrupt local copy with nowhere to download a fresh one from
        source.sha256 = Some("00".repeat(32));
        assert!(manager.ensure(&source).await.is_err());
    }

    #[tokio::test]
    async fn test_ensure_missing_model_without_url() {
        let dir = TempDir::new().unwrap();
        let manager = ModelManager::new().unwrap();

        let result = manager
            .ensure(&ModelSource::local(dir.path().join("missing.onnx")))
            .await;
        assert!(result.is_err());
    }
}

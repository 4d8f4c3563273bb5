//! Request Pipeline
//!
//! Turns one uploaded photo into the identification response:
//!
//! ```text
//! Validated -> Staged -> Detected -> Extracted -> Matched -> Responded -> CleanedUp
//! ```
//!
//! Authorization and payload validation happen in the server before a
//! request reaches this module. Staging, detection and text extraction are
//! CPU bound and run on the blocking pool; matching runs on the async
//! runtime because it may download product images. The request's staged
//! files are reclaimed on every path, including errors and cancellation.

use anyhow::{Context, Result};
use serde::Serialize;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::catalog::Product;
use crate::config::AppConfig;
use crate::matcher::Matcher;
use crate::staging::{RequestStaging, StagingArea, StagingError};
use crate::vision::{crop_detection, encode_jpeg_base64, join_fragments, Detector, TextRecognizer};

/// Text summary used when nothing was read
const EMPTY_SUMMARY: &str = "-";

/// Body of a successful `/process` call
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ProcessResponse {
    /// Number of matched products
    pub bottles: usize,
    /// Accepted texts, quoted and comma separated
    pub text: String,
    /// Matched products, unmatched texts dropped
    pub results: Vec<Product>,
    /// Accepted crops as base64 JPEG, aligned with the accepted texts
    pub images_base64: Vec<String>,
}

impl ProcessResponse {
    /// Response for an image with nothing readable in it
    ///
    /// Also returned when detections exist but every text was too short, so
    /// the summary is `"-"` there as well rather than an empty string.
    pub fn empty() -> Self {
        Self {
            bottles: 0,
            text: EMPTY_SUMMARY.to_string(),
            results: vec![],
            images_base64: vec![],
        }
    }
}

/// Tunables of the crop and filter stage
#[derive(Debug, Clone)]
pub struct PipelineSettings {
    /// Square size uploads are resampled to before detection
    pub target_size: u32,
    /// Minimum recognized text length, in characters
    pub min_text_len: usize,
    pub crop_gain: f32,
    pub crop_pad: f32,
}

impl PipelineSettings {
    pub fn from_config(config: &AppConfig) -> Self {
        Self {
            target_size: config.staging.target_size,
            min_text_len: config.ocr.min_text_len,
            crop_gain: config.ocr.crop_gain,
            crop_pad: config.ocr.crop_pad,
        }
    }
}

impl Default for PipelineSettings {
    fn default() -> Self {
        Self::from_config(&AppConfig::default())
    }
}

/// Texts read off the detections and their crops, index aligned
#[derive(Debug, Default)]
struct Extraction {
    texts: Vec<String>,
    images_base64: Vec<String>,
}

/// Detection to match pipeline shared by all requests
pub struct Pipeline {
    staging: StagingArea,
    detector: Detector,
    recognizer: Arc<dyn TextRecognizer>,
    matcher: Matcher,
    settings: PipelineSettings,
}

impl Pipeline {
    pub fn new(
        staging: StagingArea,
        detector: Detector,
        recognizer: Arc<dyn TextRecognizer>,
        matcher: Matcher,
        settings: PipelineSettings,
    ) -> Self {
        Self {
            staging,
            detector,
            recognizer,
            matcher,
            settings,
        }
    }

    /// Identify the products in an uploaded photo
    pub async fn process(self: Arc<Self>, bytes: Vec<u8>, filename: String) -> Result<ProcessResponse> {
        let start = Instant::now();

        let pipeline = Arc::clone(&self);
        let (mut staging, extraction) = tokio::task::spawn_blocking(move || -> Result<_> {
            let staging = pipeline.staging.begin()?;
            let extraction = pipeline.extract(&staging, &bytes, &filename);
            Ok((staging, extraction))
        })
        .await
        .context("Extraction task failed")??;

        let result = match extraction {
            Ok(Some(extraction)) => Ok(self.respond(extraction).await),
            Ok(None) => Ok(ProcessResponse::empty()),
            Err(e) => Err(e),
        };

        staging.cleanup();

        if let Ok(response) = &result {
            info!(
                "Request {} done in {:?}: {} bottles",
                staging.request_id(),
                start.elapsed(),
                response.bottles
            );
        }
        result
    }

    /// Stage, detect, crop and read the upload
    ///
    /// Returns `None` when the upload is not a usable image.
    fn extract(&self, staging: &RequestStaging, bytes: &[u8], filename: &str) -> Result<Option<Extraction>> {
        let input = staging.stage(bytes, filename)?;

        let resized = match staging.resize(&input, self.settings.target_size) {
            Ok(path) => path,
            Err(StagingError::UndecodableImage(e)) => {
                warn!("Upload {:?} is not a decodable image: {}", filename, e);
                return Ok(None);
            }
            Err(e) => return Err(e.into()),
        };

        let detected = self.detector.detect(&resized)?;
        if detected.is_degenerate() {
            warn!("Upload {:?} decoded to an empty image", filename);
            return Ok(None);
        }

        debug!("{} detections in {:?}", detected.detections.len(), filename);

        let mut extraction = Extraction::default();
        for (i, detection) in detected.detections.iter().enumerate() {
            let Some(crop) = crop_detection(
                &detected.image,
                &detection.bbox,
                self.settings.crop_gain,
                self.settings.crop_pad,
            ) else {
                debug!("Detection {} has an empty crop", i);
                continue;
            };

            let regions = self.recognizer.recognize(&crop)?;
            for region in &regions {
                debug!(
                    "Detection {} fragment {:?} at {:?} ({:.2})",
                    i, region.text, region.bounds, region.confidence
                );
            }
            let text = join_fragments(&regions);
            if text.chars().count() < self.settings.min_text_len {
                debug!("Detection {} text {:?} too short", i, text);
                continue;
            }

            let crop_path = staging
                .output_dir()
                .join(format!("{}.jpg", Uuid::new_v4().simple()));
            crop.save_with_format(&crop_path, image::ImageFormat::Jpeg)
                .with_context(|| format!("Failed to save crop {:?}", crop_path))?;

            extraction.images_base64.push(encode_jpeg_base64(&crop)?);
            extraction.texts.push(text);
        }

        Ok(Some(extraction))
    }

    /// Match every accepted text and assemble the response
    async fn respond(&self, extraction: Extraction) -> ProcessResponse {
        if extraction.texts.is_empty() {
            return ProcessResponse::empty();
        }

        let mut results = Vec::new();
        for text in &extraction.texts {
            if let Some(product) = self.matcher.resolve(text).await {
                results.push(product);
            }
        }

        ProcessResponse {
            bottles: results.len(),
            text: summarize(&extraction.texts),
            results,
            images_base64: extraction.images_base64,
        }
    }
}

/// `'first', 'second'` style summary of accepted texts
fn summarize(texts: &[String]) -> String {
    texts
        .iter()
        .map(|t| format!("'{t}'"))
        .collect::<Vec<_>>()
        .join(", ")
}

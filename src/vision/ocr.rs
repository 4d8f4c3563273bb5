//! OCR (Optical Character Recognition) module
//!
//! Uses PaddleOCR models via ONNX Runtime: a DB text detector finds text
//! lines, a CRNN recognizer reads each line with greedy CTC decoding.

use anyhow::{Context, Result};
use image::{imageops, GrayImage, Luma, RgbImage};
use imageproc::region_labelling::{connected_components, Connectivity};
use ndarray::{ArrayView2, Axis, Ix3, Ix4};
use ort::value::TensorRef;
use std::path::Path;
use std::time::Instant;
use tracing::{debug, info};

use super::models::OnnxSession;
use super::preprocess::{preprocess_for_detection, preprocess_for_recognition, PreprocessConfig};
use super::TextRegion;
use crate::config::{Device, OcrConfig};

/// Text boxes with a shorter side than this (in detector pixels) are noise
const MIN_BOX_SIDE: u32 = 3;

/// How far boxes are grown relative to area / perimeter
const UNCLIP_RATIO: f32 = 1.5;

/// Anything that turns an image into text fragments
///
/// Fragments come back in the recognizer's own order.
pub trait TextRecognizer: Send + Sync {
    fn recognize(&self, image: &RgbImage) -> Result<Vec<TextRegion>>;
}

/// Join fragment texts with single spaces, keeping their order
pub fn join_fragments(regions: &[TextRegion]) -> String {
    regions
        .iter()
        .map(|r| r.text.as_str())
        .collect::<Vec<_>>()
        .join(" ")
}

/// Thresholds for turning the detector probability map into boxes
#[derive(Debug, Clone)]
pub struct BoxParams {
    /// Probability above which a pixel counts as text
    pub binarize_threshold: f32,
    /// Minimum mean probability inside a box
    pub box_threshold: f32,
}

impl Default for BoxParams {
    fn default() -> Self {
        Self {
            binarize_threshold: 0.3,
            box_threshold: 0.6,
        }
    }
}

/// OCR engine using PaddleOCR via ONNX Runtime
pub struct PaddleOcrEngine {
    detection: OnnxSession,
    recognition: OnnxSession,
    dictionary: Vec<String>,
    preprocess: PreprocessConfig,
    boxes: BoxParams,
}

impl PaddleOcrEngine {
    /// Initialize OCR engine with model paths
    pub fn new(
        detection_model: &Path,
        recognition_model: &Path,
        dictionary_path: &Path,
        device: Device,
        config: &OcrConfig,
    ) -> Result<Self> {
        let dictionary = std::fs::read_to_string(dictionary_path)
            .with_context(|| format!("Failed to read OCR dictionary {:?}", dictionary_path))?;
        let dictionary = load_dictionary(&dictionary);
        info!("Loaded OCR dictionary with {} symbols", dictionary.len());

        Ok(Self {
            detection: OnnxSession::new(detection_model, device)?,
            recognition: OnnxSession::new(recognition_model, device)?,
            dictionary,
            preprocess: PreprocessConfig {
                det_max_side: config.max_side,
                ..PreprocessConfig::default()
            },
            boxes: BoxParams {
                binarize_threshold: config.binarize_threshold,
                box_threshold: config.box_threshold,
            },
        })
    }

    /// Find text line boxes as (x, y, width, height) in image pixels
    fn detect_lines(&self, image: &RgbImage) -> Result<Vec<(u32, u32, u32, u32)>> {
        let (tensor, (sx, sy)) = preprocess_for_detection(image, &self.preprocess);
        let input_ref: TensorRef<f32> = TensorRef::from_array_view(&tensor)?;

        // Output shape: [1, 1, H, W]
        let prob = {
            let mut session = self.detection.session().lock();
            let outputs = session
                .run(ort::inputs![input_ref])
                .map_err(|e| anyhow::anyhow!("Text detection inference failed: {e}"))?;
            outputs[0]
                .try_extract_array::<f32>()?
                .into_owned()
                .into_dimensionality::<Ix4>()
                .context("Unexpected text detection output shape")?
        };
        let prob = prob.index_axis(Axis(0), 0);
        let prob = prob.index_axis(Axis(0), 0);

        let (img_w, img_h) = image.dimensions();
        let lines = text_boxes(prob, &self.boxes)
            .into_iter()
            .filter_map(|(x, y, w, h)| {
                let x1 = ((x as f32 * sx) as u32).min(img_w);
                let y1 = ((y as f32 * sy) as u32).min(img_h);
                let x2 = (((x + w) as f32 * sx).ceil() as u32).min(img_w);
                let y2 = (((y + h) as f32 * sy).ceil() as u32).min(img_h);
                (x2 > x1 && y2 > y1).then_some((x1, y1, x2 - x1, y2 - y1))
            })
            .collect();

        Ok(lines)
    }

    /// Read a single text line
    fn recognize_line(&self, line: &RgbImage) -> Result<(String, f32)> {
        let tensor = preprocess_for_recognition(line, &self.preprocess);
        let input_ref: TensorRef<f32> = TensorRef::from_array_view(&tensor)?;

        // Output shape: [1, T, classes]
        let probs = {
            let mut session = self.recognition.session().lock();
            let outputs = session
                .run(ort::inputs![input_ref])
                .map_err(|e| anyhow::anyhow!("Text recognition inference failed: {e}"))?;
            outputs[0]
                .try_extract_array::<f32>()?
                .into_owned()
                .into_dimensionality::<Ix3>()
                .context("Unexpected text recognition output shape")?
        };

        Ok(ctc_greedy_decode(probs.index_axis(Axis(0), 0), &self.dictionary))
    }
}

impl TextRecognizer for PaddleOcrEngine {
    fn recognize(&self, image: &RgbImage) -> Result<Vec<TextRegion>> {
        let start = Instant::now();
        let lines = self.detect_lines(image)?;

        let mut regions = Vec::with_capacity(lines.len());
        for (x, y, w, h) in lines {
            let line = imageops::crop_imm(image, x, y, w, h).to_image();
            let (text, confidence) = self.recognize_line(&line)?;
            if text.trim().is_empty() {
                continue;
            }
            regions.push(TextRegion {
                text,
                bounds: (x, y, w, h),
                confidence,
            });
        }

        debug!(
            "OCR complete in {:?}: {} text regions",
            start.elapsed(),
            regions.len()
        );
        Ok(regions)
    }
}

/// Parse a PaddleOCR character dictionary (one symbol per line)
///
/// A trailing space symbol is appended, matching models trained with
/// space support.
pub fn load_dictionary(content: &str) -> Vec<String> {
    let mut symbols: Vec<String> = content
        .lines()
        .map(|l| l.trim_end_matches('\r').to_string())
        .filter(|l| !l.is_empty())
        .collect();
    symbols.push(" ".to_string());
    symbols
}

/// Greedy CTC decoding of per-step class probabilities
///
/// Class 0 is the blank; class `i` maps to `dictionary[i - 1]`. Returns the
/// text and the mean probability of the emitted symbols.
pub fn ctc_greedy_decode(probs: ArrayView2<f32>, dictionary: &[String]) -> (String, f32) {
    let mut text = String::new();
    let mut scores = Vec::new();
    let mut previous: Option<usize> = None;

    for step in probs.outer_iter() {
        let (index, score) = step
            .iter()
            .copied()
            .enumerate()
            .fold((0usize, f32::NEG_INFINITY), |best, (i, p)| {
                if p > best.1 {
                    (i, p)
                } else {
                    best
                }
            });

        if index != 0 && previous != Some(index) {
            if let Some(symbol) = dictionary.get(index - 1) {
                text.push_str(symbol);
                scores.push(score);
            }
        }
        previous = Some(index);
    }

    let confidence = if scores.is_empty() {
        0.0
    } else {
        scores.iter().sum::<f32>() / scores.len() as f32
    };

    (text, confidence)
}

/// Turn a text probability map into boxes (x, y, width, height)
///
/// Boxes are returned in connected-component label order, which follows the
/// raster position of each region's first pixel.
pub fn text_boxes(prob: ArrayView2<f32>, params: &BoxParams) -> Vec<(u32, u32, u32, u32)> {
    let (h, w) = prob.dim();
    if h == 0 || w == 0 {
        return vec![];
    }

    let mut binary = GrayImage::new(w as u32, h as u32);
    for ((y, x), &p) in prob.indexed_iter() {
        if p > params.binarize_threshold {
            binary.put_pixel(x as u32, y as u32, Luma([255]));
        }
    }

    let labels = connected_components(&binary, Connectivity::Eight, Luma([0u8]));

    struct Region {
        min_x: u32,
        min_y: u32,
        max_x: u32,
        max_y: u32,
    }

    let mut regions: Vec<Option<Region>> = Vec::new();
    for (x, y, label) in labels.enumerate_pixels() {
        let label = label[0] as usize;
        if label == 0 {
            continue;
        }
        if regions.len() <= label {
            regions.resize_with(label + 1, || None);
        }
        let region = regions[label].get_or_insert(Region {
            min_x: x,
            min_y: y,
            max_x: x,
            max_y: y,
        });
        region.min_x = region.min_x.min(x);
        region.min_y = region.min_y.min(y);
        region.max_x = region.max_x.max(x);
        region.max_y = region.max_y.max(y);
    }

    regions
        .into_iter()
        .flatten()
        .filter_map(|r| {
            let bw = r.max_x - r.min_x + 1;
            let bh = r.max_y - r.min_y + 1;
            if bw.min(bh) < MIN_BOX_SIDE {
                return None;
            }

            let region = prob.slice(ndarray::s![
                r.min_y as usize..=r.max_y as usize,
                r.min_x as usize..=r.max_x as usize
            ]);
            let score = region.mean().unwrap_or(0.0);
            if score < params.box_threshold {
                return None;
            }

            // Grow the shrunk text kernel back to the full line
            let distance = (bw * bh) as f32 * UNCLIP_RATIO / (2 * (bw + bh)) as f32;
            let x1 = (r.min_x as f32 - distance).max(0.0);
            let y1 = (r.min_y as f32 - distance).max(0.0);
            let x2 = ((r.max_x + 1) as f32 + distance).min(w as f32);
            let y2 = ((r.max_y + 1) as f32 + distance).min(h as f32);

            Some((
                x1 as u32,
                y1 as u32,
                (x2 - x1).round() as u32,
                (y2 - y1).round() as u32,
            ))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::{array, Array2};

    fn region(text: &str) -> TextRegion {
        TextRegion {
            text: text.to_string(),
            bounds: (0, 0, 1, 1),
            confidence: 1.0,
        }
    }

    #[test]
    fn test_join_fragments_keeps_order() {
        let regions = vec![region("ZERO"), region("coca"), region("cola")];
        assert_eq!(join_fragments(&regions), "ZERO coca cola");
        assert_eq!(join_fragments(&[]), "");
    }

    #[test]
    fn test_load_dictionary() {
        let dict = load_dictionary("a\r\nb\n\nc\n");
        assert_eq!(dict, vec!["a", "b", "c", " "]);
    }

    #[test]
    fn test_ctc_greedy_decode() {
        let dictionary = load_dictionary("a\nb");
        // blank, a, a, blank, a, b, space
        let probs = array![
            [0.9, 0.05, 0.05, 0.0],
            [0.1, 0.8, 0.1, 0.0],
            [0.1, 0.8, 0.1, 0.0],
            [0.7, 0.2, 0.1, 0.0],
            [0.1, 0.6, 0.3, 0.0],
            [0.1, 0.1, 0.8, 0.0],
            [0.1, 0.1, 0.0, 0.8],
        ];

        let (text, confidence) = ctc_greedy_decode(probs.view(), &dictionary);

        assert_eq!(text, "aab ");
        assert!((confidence - (0.8 + 0.6 + 0.8 + 0.8) / 4.0).abs() < 1e-6);
    }

    #[test]
    fn test_ctc_all_blank() {
        let dictionary = load_dictionary("a");
        let probs = array![[0.9, 0.1, 0.0], [0.8, 0.2, 0.0]];

        assert_eq!(ctc_greedy_decode(probs.view(), &dictionary), (String::new(), 0.0));
    }

    #[test]
    fn test_text_boxes_order_and_expansion() {
        let mut prob = Array2::<f32>::zeros((40, 60));
        // Lower line first in memory, upper line must still come first
        prob.slice_mut(ndarray::s![25..30, 10..50]).fill(0.9);
        prob.slice_mut(ndarray::s![5..10, 20..40]).fill(0.9);
        // Tiny speck is dropped
        prob[[35, 5]] = 0.9;

        let boxes = text_boxes(prob.view(), &BoxParams::default());

        assert_eq!(boxes.len(), 2);
        let (x, y, w, h) = boxes[0];
        assert!(y < 5 && x < 20);
        assert!(w > 20 && h > 5);
        assert!(boxes[1].1 > boxes[0].1);
    }

    #[test]
    fn test_text_boxes_low_score_rejected() {
        let mut prob = Array2::<f32>::zeros((20, 20));
        prob.slice_mut(ndarray::s![5..10, 5..15]).fill(0.4);

        assert!(text_boxes(prob.view(), &BoxParams::default()).is_empty());
    }
}

//! Object detection module
//!
//! Runs the bottle detector on staged images: letterboxing, inference,
//! non-maximum suppression, and mapping boxes back to source pixels.

use anyhow::{Context, Result};
use image::RgbImage;
use ndarray::{Array2, Array4, ArrayView2, Axis, Ix3};
use ort::value::TensorRef;
use std::path::Path;
use std::sync::Arc;
use std::time::Instant;
use tracing::debug;

use super::models::OnnxSession;
use super::preprocess::preprocess_for_yolo;
use super::{BoundingBox, Detection};
use crate::config::{DetectorConfig, Device};

/// Candidates considered by suppression after the confidence filter
const MAX_NMS_CANDIDATES: usize = 30_000;

/// A network producing raw detector rows
///
/// Each output row is `[cx, cy, w, h, objectness, class scores...]` in
/// letterboxed input pixels.
pub trait DetectionModel: Send + Sync {
    fn forward(&self, input: &Array4<f32>) -> Result<Array2<f32>>;
}

/// YOLO detector exported to ONNX
pub struct YoloModel {
    session: OnnxSession,
}

impl YoloModel {
    /// Load the detector weights
    pub fn load(model_path: &Path, device: Device) -> Result<Self> {
        Ok(Self {
            session: OnnxSession::new(model_path, device)?,
        })
    }
}

impl DetectionModel for YoloModel {
    fn forward(&self, input: &Array4<f32>) -> Result<Array2<f32>> {
        let input_ref: TensorRef<f32> = TensorRef::from_array_view(input)?;

        let mut session = self.session.session().lock();
        let outputs = session
            .run(ort::inputs![input_ref])
            .map_err(|e| anyhow::anyhow!("Detector inference failed: {e}"))?;

        // Output shape: [1, N, 5 + classes]
        let predictions = outputs[0]
            .try_extract_array::<f32>()?
            .into_owned()
            .into_dimensionality::<Ix3>()
            .context("Unexpected detector output shape")?;

        Ok(predictions.index_axis(Axis(0), 0).to_owned())
    }
}

/// Thresholds applied to raw detector output
#[derive(Debug, Clone)]
pub struct DetectionParams {
    /// Square network input size
    pub input_size: u32,
    /// Minimum confidence for a detection
    pub conf_threshold: f32,
    /// IoU above which overlapping boxes are suppressed
    pub iou_threshold: f32,
    /// Maximum detections kept after suppression
    pub max_detections: usize,
}

impl Default for DetectionParams {
    fn default() -> Self {
        Self {
            input_size: 640,
            conf_threshold: 0.25,
            iou_threshold: 0.45,
            max_detections: 1000,
        }
    }
}

impl From<&DetectorConfig> for DetectionParams {
    fn from(config: &DetectorConfig) -> Self {
        Self {
            input_size: config.input_size,
            conf_threshold: config.conf_threshold,
            iou_threshold: config.iou_threshold,
            max_detections: config.max_detections,
        }
    }
}

/// Source image and the detections found in it
#[derive(Debug)]
pub struct DetectorOutput {
    /// Image at the resolution it was loaded from disk
    pub image: RgbImage,
    /// Detections in `image` coordinates, highest confidence first
    pub detections: Vec<Detection>,
}

impl DetectorOutput {
    /// True when the loaded image has no pixels
    pub fn is_degenerate(&self) -> bool {
        self.image.width() == 0 || self.image.height() == 0
    }
}

/// Detector adapter combining a model with its thresholds
pub struct Detector {
    model: Arc<dyn DetectionModel>,
    params: DetectionParams,
}

impl Detector {
    pub fn new(model: Arc<dyn DetectionModel>, params: DetectionParams) -> Self {
        Self { model, params }
    }

    /// Detect objects in the image at `image_path`
    pub fn detect(&self, image_path: &Path) -> Result<DetectorOutput> {
        let image = image::open(image_path)
            .with_context(|| format!("Failed to load image for detection: {:?}", image_path))?
            .to_rgb8();

        self.detect_image(image)
    }

    /// Detect objects in an already decoded image
    pub fn detect_image(&self, image: RgbImage) -> Result<DetectorOutput> {
        if image.width() == 0 || image.height() == 0 {
            return Ok(DetectorOutput {
                image,
                detections: vec![],
            });
        }

        let start = Instant::now();
        let (tensor, boxed) = preprocess_for_yolo(&image, self.params.input_size);
        let rows = self.model.forward(&tensor)?;

        let mut detections = non_max_suppression(
            rows.view(),
            self.params.conf_threshold,
            self.params.iou_threshold,
            self.params.max_detections,
        );
        scale_boxes(&mut detections, boxed.gain, boxed.pad, image.dimensions());

        debug!(
            "Detection complete in {:?}: {} candidates, {} kept",
            start.elapsed(),
            rows.nrows(),
            detections.len()
        );

        Ok(DetectorOutput { image, detections })
    }
}

/// Intersection over union of two boxes
pub fn iou(a: &BoundingBox, b: &BoundingBox) -> f32 {
    let ix = (a.x2.min(b.x2) - a.x1.max(b.x1)).max(0.0);
    let iy = (a.y2.min(b.y2) - a.y1.max(b.y1)).max(0.0);
    let inter = ix * iy;
    let union = a.area() + b.area() - inter;

    if union <= 0.0 {
        0.0
    } else {
        inter / union
    }
}

/// Filter raw rows by confidence and suppress overlapping boxes per class
pub fn non_max_suppression(
    rows: ArrayView2<f32>,
    conf_threshold: f32,
    iou_threshold: f32,
    max_detections: usize,
) -> Vec<Detection> {
    let mut candidates: Vec<Detection> = Vec::new();

    for row in rows.outer_iter() {
        if row.len() < 5 {
            continue;
        }

        let objectness = row[4];
        if objectness <= conf_threshold {
            continue;
        }

        // Single-output models carry no class columns
        let (class_id, class_score) = row
            .iter()
            .skip(5)
            .copied()
            .enumerate()
            .fold((0usize, f32::NEG_INFINITY), |best, (i, s)| {
                if s > best.1 {
                    (i, s)
                } else {
                    best
                }
            });
        let class_score = if class_score.is_finite() { class_score } else { 1.0 };

        let confidence = objectness * class_score;
        if confidence <= conf_threshold {
            continue;
        }

        let (cx, cy, w, h) = (row[0], row[1], row[2], row[3]);
        candidates.push(Detection {
            bbox: BoundingBox {
                x1: cx - w / 2.0,
                y1: cy - h / 2.0,
                x2: cx + w / 2.0,
                y2: cy + h / 2.0,
            },
            confidence,
            class_id,
        });
    }

    candidates.sort_by(|a, b| b.confidence.total_cmp(&a.confidence));
    candidates.truncate(MAX_NMS_CANDIDATES);

    let mut kept: Vec<Detection> = Vec::new();
    for candidate in candidates {
        let suppressed = kept.iter().any(|k| {
            k.class_id == candidate.class_id && iou(&k.bbox, &candidate.bbox) > iou_threshold
        });

        if !suppressed {
            kept.push(candidate);
            if kept.len() >= max_detections {
                break;
            }
        }
    }

    kept
}

/// Map boxes from letterboxed input pixels back to source pixels
pub fn scale_boxes(detections: &mut [Detection], gain: f32, pad: (f32, f32), source_dims: (u32, u32)) {
    let (w, h) = (source_dims.0 as f32, source_dims.1 as f32);

    for det in detections {
        let b = &mut det.bbox;
        b.x1 = ((b.x1 - pad.0) / gain).clamp(0.0, w);
        b.x2 = ((b.x2 - pad.0) / gain).clamp(0.0, w);
        b.y1 = ((b.y1 - pad.1) / gain).clamp(0.0, h);
        b.y2 = ((b.y2 - pad.1) / gain).clamp(0.0, h);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::Rgb;
    use ndarray::array;

    struct FixedModel(Array2<f32>);

    impl DetectionModel for FixedModel {
        fn forward(&self, input: &Array4<f32>) -> Result<Array2<f32>> {
            assert_eq!(input.dim(), (1, 3, 640, 640));
            Ok(self.0.clone())
        }
    }

    fn bbox(x1: f32, y1: f32, x2: f32, y2: f32) -> BoundingBox {
        BoundingBox { x1, y1, x2, y2 }
    }

    #[test]
    fn test_iou() {
        let a = bbox(0.0, 0.0, 10.0, 10.0);
        let b = bbox(5.0, 0.0, 15.0, 10.0);
        let c = bbox(20.0, 20.0, 30.0, 30.0);

        assert!((iou(&a, &a) - 1.0).abs() < 1e-6);
        assert!((iou(&a, &b) - 50.0 / 150.0).abs() < 1e-6);
        assert_eq!(iou(&a, &c), 0.0);
    }

    #[test]
    fn test_nms_suppresses_overlaps() {
        let rows = array![
            [50.0, 50.0, 20.0, 40.0, 0.9, 0.8],
            [52.0, 50.0, 20.0, 40.0, 0.9, 0.9],
            [200.0, 50.0, 20.0, 40.0, 0.8, 0.9],
        ];

        let dets = non_max_suppression(rows.view(), 0.25, 0.45, 1000);

        assert_eq!(dets.len(), 2);
        // Highest confidence first
        assert!((dets[0].confidence - 0.81).abs() < 1e-6);
        assert!((dets[0].bbox.x1 - 42.0).abs() < 1e-6);
        assert!((dets[1].bbox.x1 - 190.0).abs() < 1e-6);
    }

    #[test]
    fn test_nms_confidence_filter() {
        let rows = array![
            // objectness below threshold
            [50.0, 50.0, 20.0, 40.0, 0.2, 1.0],
            // objectness passes but product does not
            [150.0, 50.0, 20.0, 40.0, 0.5, 0.4],
            [250.0, 50.0, 20.0, 40.0, 0.5, 0.6],
        ];

        let dets = non_max_suppression(rows.view(), 0.25, 0.45, 1000);

        assert_eq!(dets.len(), 1);
        assert!((dets[0].bbox.x1 - 240.0).abs() < 1e-6);
    }

    #[test]
    fn test_nms_keeps_overlapping_boxes_of_other_classes() {
        let rows = array![
            [50.0, 50.0, 20.0, 40.0, 0.9, 0.9, 0.1],
            [50.0, 50.0, 20.0, 40.0, 0.9, 0.1, 0.8],
        ];

        let dets = non_max_suppression(rows.view(), 0.25, 0.45, 1000);

        assert_eq!(dets.len(), 2);
        assert_eq!(dets[0].class_id, 0);
        assert_eq!(dets[1].class_id, 1);
    }

    #[test]
    fn test_nms_max_detections() {
        let rows = array![
            [50.0, 50.0, 20.0, 40.0, 0.9, 0.9],
            [150.0, 50.0, 20.0, 40.0, 0.9, 0.8],
            [250.0, 50.0, 20.0, 40.0, 0.9, 0.7],
        ];

        let dets = non_max_suppression(rows.view(), 0.25, 0.45, 2);
        assert_eq!(dets.len(), 2);
    }

    #[test]
    fn test_scale_boxes_removes_letterbox() {
        let mut dets = vec![Detection {
            bbox: bbox(100.0, 200.0, 300.0, 400.0),
            confidence: 0.9,
            class_id: 0,
        }];

        // 1280x640 source letterboxed into 640: gain 0.5, 160px vertical pad
        scale_boxes(&mut dets, 0.5, (0.0, 160.0), (1280, 640));

        let b = &dets[0].bbox;
        assert_eq!((b.x1, b.y1, b.x2, b.y2), (200.0, 80.0, 600.0, 480.0));
    }

    #[test]
    fn test_scale_boxes_clips_to_image() {
        let mut dets = vec![Detection {
            bbox: bbox(-10.0, 150.0, 700.0, 500.0),
            confidence: 0.9,
            class_id: 0,
        }];

        scale_boxes(&mut dets, 0.5, (0.0, 160.0), (1280, 640));

        let b = &dets[0].bbox;
        assert_eq!((b.x1, b.y1, b.x2, b.y2), (0.0, 0.0, 1280.0, 640.0));
    }

    #[test]
    fn test_detect_image_returns_source_coordinates() {
        let model = FixedModel(array![[320.0, 320.0, 100.0, 200.0, 0.95, 0.9]]);
        let detector = Detector::new(Arc::new(model), DetectionParams::default());

        let image = RgbImage::from_pixel(1280, 640, Rgb([10, 10, 10]));
        let output = detector.detect_image(image).unwrap();

        assert_eq!(output.image.dimensions(), (1280, 640));
        assert_eq!(output.detections.len(), 1);
        let b = &output.detections[0].bbox;
        assert_eq!((b.x1, b.y1, b.x2, b.y2), (540.0, 120.0, 740.0, 520.0));
    }

    #[test]
    fn test_detect_image_without_detections() {
        let model = FixedModel(Array2::zeros((0, 6)));
        let detector = Detector::new(Arc::new(model), DetectionParams::default());

        let output = detector
            .detect_image(RgbImage::from_pixel(640, 640, Rgb([0, 0, 0])))
            .unwrap();

        assert!(output.detections.is_empty());
        assert!(!output.is_degenerate());
    }
}

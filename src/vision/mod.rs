//! Vision Layer
//!
//! Object detection and label text extraction on staged images:
//! - Bottle detector (YOLO exported to ONNX)
//! - PaddleOCR text detection and recognition via ONNX Runtime
//! - Crop geometry shared by both

pub mod crop;
pub mod detection;
pub mod models;
pub mod ocr;
pub mod preprocess;

pub use crop::{crop_detection, encode_jpeg_base64};
pub use detection::{DetectionParams, Detector, YoloModel};
pub use models::ModelManager;
pub use ocr::{join_fragments, PaddleOcrEngine, TextRecognizer};

/// Axis-aligned box in pixel coordinates (corners)
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BoundingBox {
    pub x1: f32,
    pub y1: f32,
    pub x2: f32,
    pub y2: f32,
}

impl BoundingBox {
    pub fn width(&self) -> f32 {
        (self.x2 - self.x1).max(0.0)
    }

    pub fn height(&self) -> f32 {
        (self.y2 - self.y1).max(0.0)
    }

    pub fn area(&self) -> f32 {
        self.width() * self.height()
    }
}

/// Object proposed by the detector
#[derive(Debug, Clone, PartialEq)]
pub struct Detection {
    /// Box in source image coordinates
    pub bbox: BoundingBox,
    /// Objectness times class score
    pub confidence: f32,
    /// Index of the best scoring class
    pub class_id: usize,
}

/// Recognized text fragment from OCR
#[derive(Debug, Clone)]
pub struct TextRegion {
    /// Detected text content
    pub text: String,
    /// Bounding box (x, y, width, height) within the recognized image
    pub bounds: (u32, u32, u32, u32),
    /// Confidence score (0.0 - 1.0)
    pub confidence: f32,
}

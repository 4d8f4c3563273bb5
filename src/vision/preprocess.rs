//! Image preprocessing for ONNX models
//!
//! Handles letterboxing, resizing, normalization, and tensor conversion for
//! the object detector and the PaddleOCR models.

use image::imageops::{self, FilterType};
use image::{Rgb, RgbImage};
use ndarray::{Array3, Array4};

/// Gray value YOLO-style letterboxing pads with
const LETTERBOX_FILL: u8 = 114;

/// Preprocessing configuration for the PaddleOCR models
#[derive(Debug, Clone)]
pub struct PreprocessConfig {
    /// Longest side of the text detection input
    pub det_max_side: u32,
    /// Target height for recognition model (typically 48)
    pub rec_target_height: u32,
    /// Maximum width for recognition
    pub rec_max_width: u32,
    /// Mean values for detection normalization [R, G, B]
    pub det_mean: [f32; 3],
    /// Std values for detection normalization [R, G, B]
    pub det_std: [f32; 3],
    /// Mean values for recognition normalization [R, G, B]
    pub rec_mean: [f32; 3],
    /// Std values for recognition normalization [R, G, B]
    pub rec_std: [f32; 3],
}

impl Default for PreprocessConfig {
    fn default() -> Self {
        Self {
            det_max_side: 960,
            rec_target_height: 48,
            rec_max_width: 640,
            // DB detector is trained with ImageNet statistics
            det_mean: [0.485, 0.456, 0.406],
            det_std: [0.229, 0.224, 0.225],
            // Recognizer maps [0, 255] -> [-1, 1]
            rec_mean: [0.5, 0.5, 0.5],
            rec_std: [0.5, 0.5, 0.5],
        }
    }
}

/// Letterboxed image plus the transform that produced it
#[derive(Debug, Clone)]
pub struct Letterbox {
    /// Padded square image
    pub image: RgbImage,
    /// Scale applied to the source image
    pub gain: f32,
    /// Horizontal and vertical padding added on each side
    pub pad: (f32, f32),
}

/// Resize keeping aspect ratio and pad to a `size` x `size` square
pub fn letterbox(image: &RgbImage, size: u32) -> Letterbox {
    let size = size.max(1);
    let (w, h) = image.dimensions();
    let gain = (size as f32 / w as f32).min(size as f32 / h as f32);
    let new_w = ((w as f32 * gain).round() as u32).clamp(1, size);
    let new_h = ((h as f32 * gain).round() as u32).clamp(1, size);

    let pad_x = (size - new_w) as f32 / 2.0;
    let pad_y = (size - new_h) as f32 / 2.0;

    let resized = if (new_w, new_h) == (w, h) {
        image.clone()
    } else {
        imageops::resize(image, new_w, new_h, FilterType::Triangle)
    };

    let mut canvas = RgbImage::from_pixel(size, size, Rgb([LETTERBOX_FILL; 3]));
    let left = (pad_x - 0.1).round().max(0.0) as i64;
    let top = (pad_y - 0.1).round().max(0.0) as i64;
    imageops::replace(&mut canvas, &resized, left, top);

    Letterbox {
        image: canvas,
        gain,
        pad: (pad_x, pad_y),
    }
}

/// Convert an RGB image to an HWC f32 array scaled to 0-1
pub fn rgb_to_f32(image: &RgbImage) -> Array3<f32> {
    let (width, height) = image.dimensions();
    let mut rgb = Array3::<f32>::zeros((height as usize, width as usize, 3));

    for (x, y, pixel) in image.enumerate_pixels() {
        for c in 0..3 {
            rgb[[y as usize, x as usize, c]] = pixel[c] as f32 / 255.0;
        }
    }

    rgb
}

/// Normalize image with mean and std
pub fn normalize(image: &Array3<f32>, mean: &[f32; 3], std: &[f32; 3]) -> Array3<f32> {
    let (h, w, _) = image.dim();
    let mut normalized = Array3::<f32>::zeros((h, w, 3));

    for y in 0..h {
        for x in 0..w {
            for c in 0..3 {
                normalized[[y, x, c]] = (image[[y, x, c]] - mean[c]) / std[c];
            }
        }
    }

    normalized
}

/// Convert HWC image to NCHW tensor (batch size 1)
pub fn hwc_to_nchw(image: &Array3<f32>) -> Array4<f32> {
    let (h, w, c) = image.dim();
    let mut tensor = Array4::<f32>::zeros((1, c, h, w));

    for y in 0..h {
        for x in 0..w {
            for ch in 0..c {
                tensor[[0, ch, y, x]] = image[[y, x, ch]];
            }
        }
    }

    tensor
}

/// Detector input: letterboxed, scaled to 0-1, NCHW
pub fn preprocess_for_yolo(image: &RgbImage, size: u32) -> (Array4<f32>, Letterbox) {
    let boxed = letterbox(image, size);
    let tensor = hwc_to_nchw(&rgb_to_f32(&boxed.image));
    (tensor, boxed)
}

/// Dimensions for the text detector: longest side capped, both sides
/// rounded to a multiple of 32
pub fn detection_dims(width: u32, height: u32, max_side: u32) -> (u32, u32) {
    let longest = width.max(height).max(1);
    let ratio = if longest > max_side {
        max_side as f32 / longest as f32
    } else {
        1.0
    };

    let round32 = |v: u32| -> u32 {
        let scaled = (v as f32 * ratio).round() as u32;
        ((scaled + 16) / 32 * 32).max(32)
    };

    (round32(width), round32(height))
}

/// Full preprocessing pipeline for text detection
/// Returns the tensor and the (x, y) factors mapping tensor pixels back to
/// source pixels
pub fn preprocess_for_detection(
    image: &RgbImage,
    config: &PreprocessConfig,
) -> (Array4<f32>, (f32, f32)) {
    let (w, h) = image.dimensions();
    let (new_w, new_h) = detection_dims(w, h, config.det_max_side);
    let resized = imageops::resize(image, new_w, new_h, FilterType::Triangle);

    let normalized = normalize(&rgb_to_f32(&resized), &config.det_mean, &config.det_std);
    let scale = (w as f32 / new_w as f32, h as f32 / new_h as f32);

    (hwc_to_nchw(&normalized), scale)
}

/// Resize image for recognition model (fixed height, variable width)
pub fn resize_for_recognition(image: &RgbImage, target_height: u32, max_width: u32) -> RgbImage {
    let (w, h) = image.dimensions();
    let scale = target_height as f32 / h.max(1) as f32;
    let new_w = ((w as f32 * scale).ceil() as u32).clamp(1, max_width);

    imageops::resize(image, new_w, target_height, FilterType::Triangle)
}

/// Full preprocessing pipeline for recognition
pub fn preprocess_for_recognition(image: &RgbImage, config: &PreprocessConfig) -> Array4<f32> {
    let resized = resize_for_recognition(image, config.rec_target_height, config.rec_max_width);
    let normalized = normalize(&rgb_to_f32(&resized), &config.rec_mean, &config.rec_std);
    hwc_to_nchw(&normalized)
}

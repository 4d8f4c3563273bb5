//! Detection crops
//!
//! Cuts detected objects out of the source image with a small margin and
//! encodes them for the response payload.

use anyhow::{Context, Result};
use base64::{engine::general_purpose::STANDARD, Engine as _};
use image::{imageops, RgbImage};
use std::io::Cursor;

use super::BoundingBox;

/// Crop `bbox` out of `image`, grown by `gain` and `pad` around its center
///
/// Returns `None` when the clipped region has no area.
pub fn crop_detection(image: &RgbImage, bbox: &BoundingBox, gain: f32, pad: f32) -> Option<RgbImage> {
    let cx = (bbox.x1 + bbox.x2) / 2.0;
    let cy = (bbox.y1 + bbox.y2) / 2.0;
    let w = bbox.width() * gain + pad;
    let h = bbox.height() * gain + pad;

    let (img_w, img_h) = image.dimensions();
    let clip = |v: f32, max: u32| -> u32 { v.max(0.0).min(max as f32) as u32 };

    let x1 = clip(cx - w / 2.0, img_w);
    let y1 = clip(cy - h / 2.0, img_h);
    let x2 = clip(cx + w / 2.0, img_w);
    let y2 = clip(cy + h / 2.0, img_h);

    if x2 <= x1 || y2 <= y1 {
        return None;
    }

    Some(imageops::crop_imm(image, x1, y1, x2 - x1, y2 - y1).to_image())
}

/// JPEG-encode an image and return it as base64
pub fn encode_jpeg_base64(image: &RgbImage) -> Result<String> {
    let mut buf = Cursor::new(Vec::new());
    image
        .write_to(&mut buf, image::ImageFormat::Jpeg)
        .context("Failed to encode crop as JPEG")?;

    Ok(STANDARD.encode(buf.into_inner()))
}

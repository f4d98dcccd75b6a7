//! Resizes the fixed-ratio result to the caller's requested scale and encodes
//! the final PNG.

use std::io::Cursor;

use anyhow::{Context, Result};
use image::imageops::FilterType;
use image::RgbaImage;
use tracing::debug;

use crate::types::ImageBuffer;

/// Target scales within this distance of the model's fixed ratio skip the
/// resize entirely.
pub const SCALE_EPSILON: f32 = 1e-3;

/// Compute the caller-visible output dimensions for a target scale.
pub fn target_dimensions(source_w: u32, source_h: u32, target_scale: f32) -> (u32, u32) {
    (
        (source_w as f32 * target_scale).round() as u32,
        (source_h as f32 * target_scale).round() as u32,
    )
}

/// Resize the fixed-ratio upscale to `round(source * target_scale)` using
/// Lanczos3, or return the input unchanged when the target equals the model's
/// native factor.
pub fn finalize(
    fixed: ImageBuffer,
    source_w: u32,
    source_h: u32,
    target_scale: f32,
    model_scale: u32,
) -> Result<ImageBuffer> {
    if (target_scale - model_scale as f32).abs() < SCALE_EPSILON {
        return Ok(fixed);
    }

    let (target_w, target_h) = target_dimensions(source_w, source_h, target_scale);
    debug!(
        from_w = fixed.width,
        from_h = fixed.height,
        target_w,
        target_h,
        "resizing fixed-ratio result to target scale"
    );

    let rgba = RgbaImage::from_raw(fixed.width, fixed.height, fixed.data)
        .context("fixed-ratio buffer does not match its declared dimensions")?;
    let resized = image::imageops::resize(&rgba, target_w, target_h, FilterType::Lanczos3);

    Ok(ImageBuffer {
        width: target_w,
        height: target_h,
        data: resized.into_raw(),
    })
}

pub fn encode_png(img: &ImageBuffer) -> Result<Vec<u8>> {
    let rgba = RgbaImage::from_raw(img.width, img.height, img.data.clone())
        .context("output buffer does not match its declared dimensions")?;
    let mut out = Cursor::new(Vec::new());
    rgba.write_to(&mut out, image::ImageFormat::Png)
        .context("failed to encode PNG output")?;
    Ok(out.into_inner())
}

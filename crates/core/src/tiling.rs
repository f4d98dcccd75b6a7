//! Tile grid computation, context-padded extraction, and stitching.
//!
//! Each tile is a `tile_edge` square window around a `stride` square content
//! region, where `stride = tile_edge - 2 * padding`. The padding gives the
//! network surrounding context at tile boundaries; only the central
//! `stride * scale` square of each processed tile is stitched into the output
//! canvas, which removes the seam a naive no-overlap tiling would produce.
//! Sampled coordinates outside the image are clamped to the nearest valid
//! pixel (edge replication), never zero-filled, to avoid dark borders.

use anyhow::{bail, Result};
use ndarray::Array4;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::error::UpscaleError;
use crate::manager::SharedModel;
use crate::types::ImageBuffer;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TileGrid {
    pub tiles_x: u32,
    pub tiles_y: u32,
    pub tile_edge: u32,
    pub padding: u32,
    pub stride: u32,
}

/// One cell of the tile grid. The extraction origin may be negative or exceed
/// the image bounds; it is resolved by per-sample clamping, not stored
/// pre-clamped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TileDescriptor {
    pub tx: u32,
    pub ty: u32,
    pub origin_x: i64,
    pub origin_y: i64,
    pub edge: u32,
    pub padding: u32,
}

pub fn plan_grid(width: u32, height: u32, tile_edge: u32, padding: u32) -> Result<TileGrid> {
    let stride = tile_edge as i64 - 2 * padding as i64;
    if stride <= 0 {
        bail!("tile edge ({tile_edge}) is too small for padding ({padding})");
    }
    let stride = stride as u32;

    Ok(TileGrid {
        tiles_x: width.div_ceil(stride),
        tiles_y: height.div_ceil(stride),
        tile_edge,
        padding,
        stride,
    })
}

impl TileGrid {
    pub fn tile_count(&self) -> u64 {
        self.tiles_x as u64 * self.tiles_y as u64
    }

    pub fn descriptor(&self, tx: u32, ty: u32) -> TileDescriptor {
        TileDescriptor {
            tx,
            ty,
            origin_x: tx as i64 * self.stride as i64 - self.padding as i64,
            origin_y: ty as i64 * self.stride as i64 - self.padding as i64,
            edge: self.tile_edge,
            padding: self.padding,
        }
    }
}

/// RGB planes of an extracted tile as NCHW 0–1 floats, plus its alpha plane.
/// The network upscales RGB only; alpha is carried separately.
pub struct ExtractedTile {
    pub rgb: Array4<f32>,
    pub alpha: Vec<u8>,
}

/// Extract a `edge x edge` window with edge-replicated clamping for any
/// sample outside `[0, width) x [0, height)`.
pub fn extract_tile(image: &ImageBuffer, desc: &TileDescriptor) -> ExtractedTile {
    let edge = desc.edge as usize;
    let max_x = image.width as i64 - 1;
    let max_y = image.height as i64 - 1;

    let mut rgb = Array4::<f32>::zeros((1, 3, edge, edge));
    let mut alpha = vec![0u8; edge * edge];

    for y in 0..edge {
        let sy = (desc.origin_y + y as i64).clamp(0, max_y) as u32;
        for x in 0..edge {
            let sx = (desc.origin_x + x as i64).clamp(0, max_x) as u32;
            let [r, g, b, a] = image.pixel(sx, sy);
            rgb[[0, 0, y, x]] = r as f32 / 255.0;
            rgb[[0, 1, y, x]] = g as f32 / 255.0;
            rgb[[0, 2, y, x]] = b as f32 / 255.0;
            alpha[y * edge + x] = a;
        }
    }

    ExtractedTile { rgb, alpha }
}

/// Run every tile through the session in row-major order and stitch the valid
/// interior of each processed tile into the fixed-ratio output canvas.
///
/// Cancellation is polled between tile iterations. Any inference error
/// propagates unmodified so the orchestrator can decide on failover; the
/// partial canvas is discarded with the call's stack frame.
pub fn process_tiles(
    image: &ImageBuffer,
    session: &SharedModel,
    grid: &TileGrid,
    cancel: &CancellationToken,
    mut on_tile_done: impl FnMut(u64, u64),
) -> Result<ImageBuffer> {
    let scale = session.lock().unwrap().scale() as usize;
    let out_w = image.width as usize * scale;
    let out_h = image.height as usize * scale;
    let mut canvas = ImageBuffer::new(out_w as u32, out_h as u32);

    let total = grid.tile_count();
    let mut done = 0u64;

    debug!(
        tiles_x = grid.tiles_x,
        tiles_y = grid.tiles_y,
        tile_edge = grid.tile_edge,
        padding = grid.padding,
        stride = grid.stride,
        "starting tiled inference"
    );

    for ty in 0..grid.tiles_y {
        for tx in 0..grid.tiles_x {
            if cancel.is_cancelled() {
                return Err(UpscaleError::Cancelled.into());
            }

            let desc = grid.descriptor(tx, ty);
            let tile = extract_tile(image, &desc);

            let output = {
                let mut model = session.lock().unwrap();
                model.run_tile(&tile.rgb)?
            };

            let expected_edge = grid.tile_edge as usize * scale;
            if output.shape() != [1, 3, expected_edge, expected_edge] {
                bail!(
                    "unexpected tile output shape {:?}, expected [1, 3, {}, {}]",
                    output.shape(),
                    expected_edge,
                    expected_edge
                );
            }

            stitch_tile(&mut canvas, grid, &desc, &output, &tile.alpha, scale);

            done += 1;
            on_tile_done(done, total);
        }
    }

    Ok(canvas)
}

/// Copy the central `stride * scale` square of one processed tile into the
/// canvas at `(tx * stride * scale, ty * stride * scale)`, clipping against
/// the canvas bounds for the final (possibly partial) row/column of tiles.
fn stitch_tile(
    canvas: &mut ImageBuffer,
    grid: &TileGrid,
    desc: &TileDescriptor,
    output: &Array4<f32>,
    tile_alpha: &[u8],
    scale: usize,
) {
    let stride = grid.stride as usize;
    let padding = grid.padding as usize;
    let edge = grid.tile_edge as usize;

    let ox0 = desc.tx as usize * stride * scale;
    let oy0 = desc.ty as usize * stride * scale;
    let copy_w = (stride * scale).min(canvas.width as usize - ox0);
    let copy_h = (stride * scale).min(canvas.height as usize - oy0);

    // The content region always begins exactly `padding` pixels into the
    // extraction window, because clamping is applied per sample rather than
    // by shifting the window.
    let crop = padding * scale;

    for j in 0..copy_h {
        for i in 0..copy_w {
            let sy = crop + j;
            let sx = crop + i;
            let r = quantize(output[[0, 0, sy, sx]]);
            let g = quantize(output[[0, 1, sy, sx]]);
            let b = quantize(output[[0, 2, sy, sx]]);
            // Alpha is replicated from the nearest source sample.
            let a = tile_alpha[(padding + j / scale) * edge + (padding + i / scale)];
            canvas.put_pixel((ox0 + i) as u32, (oy0 + j) as u32, [r, g, b, a]);
        }
    }
}

#[inline]
fn quantize(v: f32) -> u8 {
    (v * 255.0).round().clamp(0.0, 255.0) as u8
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};

    use crate::session::{ExecutionProvider, TileModel};

    /// Nearest-neighbor 4x model: deterministic stand-in for the network.
    struct NearestModel {
        scale: u32,
    }

    impl TileModel for NearestModel {
        fn provider(&self) -> ExecutionProvider {
            ExecutionProvider::Cpu
        }
        fn scale(&self) -> u32 {
            self.scale
        }
        fn run_tile(&mut self, tile: &Array4<f32>) -> Result<Array4<f32>> {
            let edge = tile.shape()[2];
            let s = self.scale as usize;
            let mut out = Array4::<f32>::zeros((1, 3, edge * s, edge * s));
            for c in 0..3 {
                for y in 0..edge * s {
                    for x in 0..edge * s {
                        out[[0, c, y, x]] = tile[[0, c, y / s, x / s]];
                    }
                }
            }
            Ok(out)
        }
    }

    struct FailingModel;

    impl TileModel for FailingModel {
        fn provider(&self) -> ExecutionProvider {
            ExecutionProvider::Gpu
        }
        fn scale(&self) -> u32 {
            4
        }
        fn run_tile(&mut self, _tile: &Array4<f32>) -> Result<Array4<f32>> {
            anyhow::bail!("device lost")
        }
    }

    fn shared(model: impl TileModel + 'static) -> SharedModel {
        Arc::new(Mutex::new(Box::new(model) as Box<dyn TileModel>))
    }

    /// Checkerboard-ish pattern with distinct channel values per pixel.
    fn pattern_image(width: u32, height: u32) -> ImageBuffer {
        let mut img = ImageBuffer::new(width, height);
        for y in 0..height {
            for x in 0..width {
                img.put_pixel(
                    x,
                    y,
                    [
                        ((x * 7 + y * 13) % 256) as u8,
                        ((x * 3 + y * 29 + 101) % 256) as u8,
                        ((x * 17 + y * 5 + 53) % 256) as u8,
                        ((x + y * 11 + 7) % 256) as u8,
                    ],
                );
            }
        }
        img
    }

    fn nearest_upscale(img: &ImageBuffer, scale: u32) -> ImageBuffer {
        let mut out = ImageBuffer::new(img.width * scale, img.height * scale);
        for y in 0..out.height {
            for x in 0..out.width {
                out.put_pixel(x, y, img.pixel(x / scale, y / scale));
            }
        }
        out
    }

    #[test]
    fn test_plan_grid_counts() {
        let grid = plan_grid(300, 200, 192, 32).unwrap();
        assert_eq!(grid.stride, 128);
        assert_eq!(grid.tiles_x, 3);
        assert_eq!(grid.tiles_y, 2);
        assert_eq!(grid.tile_count(), 6);
    }

    #[test]
    fn test_plan_grid_single_tile_for_small_image() {
        // 10x10 image, tile edge 192, padding 32: exactly one tile.
        let grid = plan_grid(10, 10, 192, 32).unwrap();
        assert_eq!((grid.tiles_x, grid.tiles_y), (1, 1));
    }

    #[test]
    fn test_plan_grid_exact_multiple() {
        let grid = plan_grid(256, 128, 192, 32).unwrap();
        assert_eq!(grid.tiles_x, 2);
        assert_eq!(grid.tiles_y, 1);
    }

    #[test]
    fn test_plan_grid_rejects_nonpositive_stride() {
        assert!(plan_grid(100, 100, 64, 32).is_err());
        assert!(plan_grid(100, 100, 64, 33).is_err());
        assert!(plan_grid(100, 100, 64, 31).is_ok());
    }

    #[test]
    fn test_descriptor_origin_is_unclamped() {
        let grid = plan_grid(300, 200, 192, 32).unwrap();
        let first = grid.descriptor(0, 0);
        assert_eq!((first.origin_x, first.origin_y), (-32, -32));
        let last = grid.descriptor(2, 1);
        assert_eq!(last.origin_x, 2 * 128 - 32);
        assert_eq!(last.origin_y, 128 - 32);
    }

    #[test]
    fn test_extract_clamps_to_image_edges() {
        let img = pattern_image(4, 4);
        let grid = plan_grid(4, 4, 8, 2).unwrap();
        let tile = extract_tile(&img, &grid.descriptor(0, 0));

        // Top-left padding samples replicate pixel (0, 0).
        let [r00, ..] = img.pixel(0, 0);
        assert_eq!(tile.rgb[[0, 0, 0, 0]], r00 as f32 / 255.0);
        assert_eq!(tile.rgb[[0, 0, 1, 1]], r00 as f32 / 255.0);
        // Content begins `padding` samples in.
        assert_eq!(tile.rgb[[0, 0, 2, 2]], r00 as f32 / 255.0);
        let [r11, ..] = img.pixel(1, 1);
        assert_eq!(tile.rgb[[0, 0, 3, 3]], r11 as f32 / 255.0);
        // Bottom-right overhang replicates pixel (3, 3).
        let [r33, ..] = img.pixel(3, 3);
        assert_eq!(tile.rgb[[0, 0, 7, 7]], r33 as f32 / 255.0);
        assert_eq!(tile.alpha[7 * 8 + 7], img.pixel(3, 3)[3]);
    }

    #[test]
    fn test_stitched_output_matches_direct_upscale() {
        // Multi-tile grid with a partial final row/column: 20x14 with
        // stride 8 gives 3x2 tiles, last column 4 wide, last row 6 tall.
        let img = pattern_image(20, 14);
        let grid = plan_grid(20, 14, 12, 2).unwrap();
        let session = shared(NearestModel { scale: 4 });

        let out = process_tiles(&img, &session, &grid, &CancellationToken::new(), |_, _| {})
            .unwrap();

        assert_eq!((out.width, out.height), (80, 56));
        assert_eq!(out, nearest_upscale(&img, 4));
    }

    #[test]
    fn test_single_tile_covers_whole_output() {
        // 10x10 image and a 192-edge tile: one tile whose valid region still
        // maps onto the entire 40x40 canvas.
        let img = pattern_image(10, 10);
        let grid = plan_grid(10, 10, 192, 32).unwrap();
        let session = shared(NearestModel { scale: 4 });

        let out = process_tiles(&img, &session, &grid, &CancellationToken::new(), |_, _| {})
            .unwrap();

        assert_eq!((out.width, out.height), (40, 40));
        assert_eq!(out, nearest_upscale(&img, 4));
    }

    #[test]
    fn test_every_canvas_pixel_is_written() {
        // Zero-initialized canvas + fully opaque source: any uncovered output
        // pixel would keep alpha 0.
        let mut img = pattern_image(17, 9);
        for y in 0..img.height {
            for x in 0..img.width {
                let [r, g, b, _] = img.pixel(x, y);
                img.put_pixel(x, y, [r, g, b, 255]);
            }
        }
        let grid = plan_grid(17, 9, 10, 3).unwrap();
        let session = shared(NearestModel { scale: 4 });

        let out = process_tiles(&img, &session, &grid, &CancellationToken::new(), |_, _| {})
            .unwrap();

        assert!(out
            .data
            .chunks_exact(4)
            .all(|px| px[3] == 255));
    }

    #[test]
    fn test_progress_callback_sees_every_tile_in_order() {
        let img = pattern_image(20, 14);
        let grid = plan_grid(20, 14, 12, 2).unwrap();
        let session = shared(NearestModel { scale: 4 });

        let mut seen = Vec::new();
        process_tiles(&img, &session, &grid, &CancellationToken::new(), |done, total| {
            seen.push((done, total));
        })
        .unwrap();

        assert_eq!(seen.len(), 6);
        assert_eq!(seen.first(), Some(&(1, 6)));
        assert_eq!(seen.last(), Some(&(6, 6)));
        assert!(seen.windows(2).all(|w| w[0].0 + 1 == w[1].0));
    }

    #[test]
    fn test_cancellation_between_tiles() {
        let img = pattern_image(20, 14);
        let grid = plan_grid(20, 14, 12, 2).unwrap();
        let session = shared(NearestModel { scale: 4 });

        let cancel = CancellationToken::new();
        cancel.cancel();

        let err = process_tiles(&img, &session, &grid, &cancel, |_, _| {}).unwrap_err();
        assert_eq!(
            err.downcast_ref::<UpscaleError>(),
            Some(&UpscaleError::Cancelled)
        );
    }

    #[test]
    fn test_inference_error_propagates_unmodified() {
        let img = pattern_image(10, 10);
        let grid = plan_grid(10, 10, 12, 2).unwrap();
        let session = shared(FailingModel);

        let err = process_tiles(&img, &session, &grid, &CancellationToken::new(), |_, _| {})
            .unwrap_err();
        assert!(err.to_string().contains("device lost"));
        assert!(err.downcast_ref::<UpscaleError>().is_none());
    }

    #[test]
    fn test_wrong_output_shape_is_rejected() {
        struct WrongShapeModel;
        impl TileModel for WrongShapeModel {
            fn provider(&self) -> ExecutionProvider {
                ExecutionProvider::Cpu
            }
            fn scale(&self) -> u32 {
                4
            }
            fn run_tile(&mut self, _tile: &Array4<f32>) -> Result<Array4<f32>> {
                Ok(Array4::<f32>::zeros((1, 3, 8, 8)))
            }
        }

        let img = pattern_image(10, 10);
        let grid = plan_grid(10, 10, 12, 2).unwrap();
        let session = shared(WrongShapeModel);

        let err = process_tiles(&img, &session, &grid, &CancellationToken::new(), |_, _| {})
            .unwrap_err();
        assert!(err.to_string().contains("unexpected tile output shape"));
    }
}

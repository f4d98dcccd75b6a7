//! Shared pixel-buffer and progress types for the upscaling pipeline.

use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;

use anyhow::{bail, Result};

use crate::error::UpscaleError;

pub const RGBA_CHANNELS: usize = 4;

/// Interleaved 8-bit-per-channel RGBA pixel buffer.
///
/// Exclusively owned by the call that created it; never shared across
/// concurrent operations.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageBuffer {
    pub width: u32,
    pub height: u32,
    pub data: Vec<u8>,
}

impl ImageBuffer {
    /// Allocate a zeroed canvas of the given dimensions.
    pub fn new(width: u32, height: u32) -> Self {
        Self {
            width,
            height,
            data: vec![0u8; width as usize * height as usize * RGBA_CHANNELS],
        }
    }

    pub fn from_rgba(width: u32, height: u32, data: Vec<u8>) -> Result<Self> {
        let expected = width as usize * height as usize * RGBA_CHANNELS;
        if data.len() != expected {
            bail!(
                "RGBA data length mismatch: expected {} ({}x{}x4), got {}",
                expected,
                width,
                height,
                data.len()
            );
        }
        Ok(Self {
            width,
            height,
            data,
        })
    }

    #[inline]
    pub fn pixel(&self, x: u32, y: u32) -> [u8; 4] {
        let idx = (y as usize * self.width as usize + x as usize) * RGBA_CHANNELS;
        [
            self.data[idx],
            self.data[idx + 1],
            self.data[idx + 2],
            self.data[idx + 3],
        ]
    }

    #[inline]
    pub fn put_pixel(&mut self, x: u32, y: u32, rgba: [u8; 4]) {
        let idx = (y as usize * self.width as usize + x as usize) * RGBA_CHANNELS;
        self.data[idx..idx + RGBA_CHANNELS].copy_from_slice(&rgba);
    }
}

/// Coarse pipeline phase reported to progress observers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpscalingPhase {
    Preparing,
    ProcessingTiles,
    ResizingToTarget,
    Finalizing,
}

impl std::fmt::Display for UpscalingPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Preparing => write!(f, "preparing"),
            Self::ProcessingTiles => write!(f, "processing tiles"),
            Self::ResizingToTarget => write!(f, "resizing to target"),
            Self::Finalizing => write!(f, "finalizing"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UpscalingProgress {
    pub phase: UpscalingPhase,
    pub message: String,
    /// Percent complete, 0–100. Monotonically non-decreasing within one call.
    pub percent: u8,
}

pub type ProgressFn = dyn Fn(UpscalingProgress) + Send + Sync;

/// Wraps the caller's progress callback and clamps reported percentages so
/// they never decrease within a single upscale call.
pub struct ProgressReporter {
    callback: Option<Arc<ProgressFn>>,
    last_percent: AtomicU8,
}

impl ProgressReporter {
    pub fn new(callback: Option<Arc<ProgressFn>>) -> Self {
        Self {
            callback,
            last_percent: AtomicU8::new(0),
        }
    }

    pub fn report(&self, phase: UpscalingPhase, message: impl Into<String>, percent: u8) {
        let previous = self.last_percent.fetch_max(percent.min(100), Ordering::SeqCst);
        let percent = previous.max(percent.min(100));
        if let Some(cb) = &self.callback {
            cb(UpscalingProgress {
                phase,
                message: message.into(),
                percent,
            });
        }
    }
}

/// Outcome of one upscale call. Either `png` holds the encoded output image,
/// or `error` describes why the call failed (including cancellation).
#[derive(Debug, Clone)]
pub struct UpscalingResult {
    pub success: bool,
    pub error: Option<UpscaleError>,
    pub png: Option<Vec<u8>>,
    pub width: u32,
    pub height: u32,
}

impl UpscalingResult {
    pub fn completed(png: Vec<u8>, width: u32, height: u32) -> Self {
        Self {
            success: true,
            error: None,
            png: Some(png),
            width,
            height,
        }
    }

    pub fn failed(error: UpscaleError) -> Self {
        Self {
            success: false,
            error: Some(error),
            png: None,
            width: 0,
            height: 0,
        }
    }

    pub fn error_message(&self) -> Option<String> {
        self.error.as_ref().map(|e| e.to_string())
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self.error, Some(UpscaleError::Cancelled))
    }
}

//! Public entry point for the upscaling service.
//!
//! `upscale` validates its inputs, enforces single-flight execution, runs the
//! pipeline on a blocking worker, and drives the failover state machine:
//!
//! ```text
//! Initializing -> Tiling -> Finalizing -> Completed
//!                   |  ^
//!       gpu failure |  | session rebuilt on CPU (at most once)
//!                   v  |
//!               Reinitializing
//! ```
//!
//! Every failure is converted into a structured [`UpscalingResult`] at this
//! boundary; no raw error reaches the caller.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::config::EngineConfig;
use crate::error::UpscaleError;
use crate::finalize::{encode_png, finalize};
use crate::manager::{SessionFactory, SessionManager};
use crate::models::ModelStore;
use crate::tiling::{plan_grid, process_tiles};
use crate::types::{
    ImageBuffer, ProgressFn, ProgressReporter, UpscalingPhase, UpscalingResult,
};

pub const MIN_TARGET_SCALE: f32 = 1.1;
pub const MAX_TARGET_SCALE: f32 = 4.0;

pub struct UpscaleService {
    config: EngineConfig,
    models: Arc<dyn ModelStore>,
    sessions: Arc<SessionManager>,
    in_flight: Arc<AtomicBool>,
}

/// Resets the in-flight flag on every exit path, including panics inside the
/// blocking worker.
struct InFlightGuard(Arc<AtomicBool>);

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

impl UpscaleService {
    pub fn new(config: EngineConfig, models: Arc<dyn ModelStore>) -> Self {
        let sessions = Arc::new(SessionManager::from_config(&config));
        Self {
            config,
            models,
            sessions,
            in_flight: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Service with a pluggable session factory. Used by tests to exercise
    /// the failover path without a native runtime.
    pub fn with_session_factory(
        config: EngineConfig,
        models: Arc<dyn ModelStore>,
        factory: Box<SessionFactory>,
    ) -> Self {
        let prefer_gpu = config.inference.prefer_gpu;
        Self {
            config,
            models,
            sessions: Arc::new(SessionManager::new(prefer_gpu, factory)),
            in_flight: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn is_gpu_active(&self) -> bool {
        self.sessions.is_gpu_active()
    }

    pub fn shutdown(&self) {
        self.sessions.shutdown();
    }

    /// Upscale one image to `target_scale` in `[1.1, 4.0]`.
    ///
    /// The pixel work runs on a blocking worker; the caller's task only
    /// suspends at the boundary of the whole operation. A second call while
    /// one is in flight is rejected immediately rather than queued.
    pub async fn upscale(
        &self,
        image: ImageBuffer,
        target_scale: f32,
        progress: Option<Arc<ProgressFn>>,
        cancel: CancellationToken,
    ) -> UpscalingResult {
        if let Err(err) = validate_request(&image, target_scale) {
            return UpscalingResult::failed(err);
        }

        if self
            .in_flight
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return UpscalingResult::failed(UpscaleError::AlreadyProcessing);
        }

        let config = self.config.clone();
        let models = self.models.clone();
        let sessions = self.sessions.clone();
        let in_flight = self.in_flight.clone();

        let outcome = tokio::task::spawn_blocking(move || {
            let _guard = InFlightGuard(in_flight);
            let reporter = ProgressReporter::new(progress);
            run_pipeline(
                &config,
                models.as_ref(),
                &sessions,
                &image,
                target_scale,
                &reporter,
                &cancel,
            )
        })
        .await;

        match outcome {
            Ok(Ok((png, width, height))) => {
                info!(width, height, "upscale completed");
                UpscalingResult::completed(png, width, height)
            }
            Ok(Err(UpscaleError::Cancelled)) => {
                info!("upscale cancelled by caller");
                UpscalingResult::failed(UpscaleError::Cancelled)
            }
            Ok(Err(err)) => {
                error!(error = %err, "upscale failed");
                UpscalingResult::failed(err)
            }
            Err(join_error) => {
                error!(error = %join_error, "upscale worker task failed");
                UpscalingResult::failed(UpscaleError::Internal(format!(
                    "worker task failed: {join_error}"
                )))
            }
        }
    }
}

fn validate_request(image: &ImageBuffer, target_scale: f32) -> Result<(), UpscaleError> {
    if !(MIN_TARGET_SCALE..=MAX_TARGET_SCALE).contains(&target_scale) {
        return Err(UpscaleError::Validation(format!(
            "target scale {target_scale} is outside [{MIN_TARGET_SCALE}, {MAX_TARGET_SCALE}]"
        )));
    }
    if image.width == 0 || image.height == 0 {
        return Err(UpscaleError::Validation(format!(
            "image dimensions must be positive, got {}x{}",
            image.width, image.height
        )));
    }
    let expected = image.width as usize * image.height as usize * 4;
    if image.data.len() != expected {
        return Err(UpscaleError::Validation(format!(
            "pixel buffer length {} does not match {}x{} RGBA",
            image.data.len(),
            image.width,
            image.height
        )));
    }
    Ok(())
}

/// Drive the pipeline to completion, retrying the tiling phase exactly once
/// on CPU after an accelerator failure. Cancellation is checked at the top of
/// each phase; `process_tiles` polls it between tiles.
fn run_pipeline(
    config: &EngineConfig,
    models: &dyn ModelStore,
    sessions: &SessionManager,
    image: &ImageBuffer,
    target_scale: f32,
    reporter: &ProgressReporter,
    cancel: &CancellationToken,
) -> Result<(Vec<u8>, u32, u32), UpscaleError> {
    reporter.report(UpscalingPhase::Preparing, "preparing upscale", 0);
    if cancel.is_cancelled() {
        return Err(UpscaleError::Cancelled);
    }

    let grid = plan_grid(
        image.width,
        image.height,
        config.tiling.tile_edge,
        config.tiling.padding,
    )
    .map_err(|e| UpscaleError::Validation(format!("{e:#}")))?;

    let mut retried = false;
    let canvas = loop {
        // Initializing: single-flight construction (or the cached session).
        let session = sessions.ensure_initialized(models)?;
        reporter.report(UpscalingPhase::Preparing, "inference session ready", 5);

        if cancel.is_cancelled() {
            return Err(UpscaleError::Cancelled);
        }

        // Tiling: the fixed-ratio pass.
        let total = grid.tile_count();
        let result = process_tiles(image, &session, &grid, cancel, |done, _| {
            let percent = 5 + ((done * 85) / total) as u8;
            reporter.report(
                UpscalingPhase::ProcessingTiles,
                format!("tile {done}/{total}"),
                percent,
            );
        });
        drop(session);

        match result {
            Ok(canvas) => break canvas,
            Err(err) => {
                if let Some(classified) = err.downcast_ref::<UpscaleError>() {
                    return Err(classified.clone());
                }
                if sessions.is_gpu_active() && !retried {
                    let gpu_err = UpscaleError::GpuInference(format!("{err:#}"));
                    warn!(error = %gpu_err, "disabling accelerator and retrying once on CPU");
                    // Tiling -> Reinitializing: tear down the GPU session
                    // before the CPU replacement is constructed.
                    sessions.disable_gpu();
                    sessions.invalidate();
                    retried = true;
                    continue;
                }
                return Err(UpscaleError::CpuInference(format!("{err:#}")));
            }
        }
    };

    // Finalizing: resize to the requested scale and encode.
    if cancel.is_cancelled() {
        return Err(UpscaleError::Cancelled);
    }
    reporter.report(UpscalingPhase::ResizingToTarget, "resizing to target scale", 90);
    let final_image = finalize(
        canvas,
        image.width,
        image.height,
        target_scale,
        config.inference.model_scale,
    )
    .map_err(|e| UpscaleError::Internal(format!("{e:#}")))?;

    reporter.report(UpscalingPhase::Finalizing, "encoding output", 98);
    let png = encode_png(&final_image).map_err(|e| UpscaleError::Internal(format!("{e:#}")))?;
    reporter.report(UpscalingPhase::Finalizing, "upscale complete", 100);

    Ok((png, final_image.width, final_image.height))
}

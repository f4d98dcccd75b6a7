//! Inference backend selection: GPU-first session construction with a
//! compatibility-oriented option set, and a fully optimized CPU fallback.

use std::path::Path;

use anyhow::{Context, Result};
use half::f16;
use half::slice::HalfFloatSliceExt;
use ndarray::Array4;
use ort::{
    execution_providers::{
        CPUExecutionProvider, CUDAExecutionProvider, ExecutionProvider as OrtExecutionProvider,
    },
    session::{builder::GraphOptimizationLevel, Session},
    value::Tensor,
};
use tracing::{debug, warn};

/// Backend that executes the inference graph.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecutionProvider {
    Gpu,
    Cpu,
}

impl std::fmt::Display for ExecutionProvider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Gpu => write!(f, "gpu"),
            Self::Cpu => write!(f, "cpu"),
        }
    }
}

/// Seam between the tiling engine and the native inference session.
///
/// Input is an NCHW `[1, 3, e, e]` RGB tensor normalized to 0–1; output is
/// `[1, 3, e*scale, e*scale]` in the same range. Value-range and precision
/// conversions for the concrete model happen behind this trait.
pub trait TileModel: Send {
    fn provider(&self) -> ExecutionProvider;
    fn scale(&self) -> u32;
    fn run_tile(&mut self, tile: &Array4<f32>) -> Result<Array4<f32>>;
}

impl std::fmt::Debug for dyn TileModel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TileModel")
            .field("provider", &self.provider())
            .field("scale", &self.scale())
            .finish()
    }
}

/// An `ort::Session` plus the model metadata discovered at load time.
pub struct LoadedSession {
    session: Session,
    provider: ExecutionProvider,
    scale: u32,
    input_name: String,
    output_name: String,
    is_fp16: bool,
}

/// Construct a session on the requested provider and discover the model's
/// input/output tensor names from its metadata.
///
/// GPU sessions use compatibility-safe options: conservative graph
/// optimization, memory-pattern reuse off, sequential execution, and the CPU
/// EP registered as an in-session fallback for unsupported operators. CPU
/// sessions use full graph optimization, memory patterns, and intra-op
/// parallelism equal to the logical core count.
pub fn build_session(
    model_path: &Path,
    provider: ExecutionProvider,
    scale: u32,
) -> Result<LoadedSession> {
    let session = match provider {
        ExecutionProvider::Gpu => {
            let cuda = CUDAExecutionProvider::default();
            if !cuda.is_available().unwrap_or(false) {
                anyhow::bail!("CUDA EP is not available on this host");
            }

            debug!(backend = "gpu", model = %model_path.display(), "building session");

            Session::builder()?
                .with_optimization_level(GraphOptimizationLevel::Level1)?
                .with_memory_pattern(false)?
                .with_parallel_execution(false)?
                .with_execution_providers([
                    CUDAExecutionProvider::default().build().error_on_failure(),
                    CPUExecutionProvider::default().build(),
                ])?
                .commit_from_file(model_path)
                .with_context(|| {
                    format!("failed to load ONNX model: {}", model_path.display())
                })?
        }
        ExecutionProvider::Cpu => {
            debug!(backend = "cpu", model = %model_path.display(), "building session");

            Session::builder()?
                .with_optimization_level(GraphOptimizationLevel::Level3)?
                .with_memory_pattern(true)?
                .with_intra_threads(num_cpus::get())?
                .with_execution_providers([CPUExecutionProvider::default().build()])?
                .commit_from_file(model_path)
                .with_context(|| {
                    format!("failed to load ONNX model: {}", model_path.display())
                })?
        }
    };

    let input = session
        .inputs()
        .first()
        .context("model metadata does not declare an input tensor")?;
    let input_name = input.name().to_string();
    let is_fp16 = match input.dtype() {
        ort::value::ValueType::Tensor { ty, .. } => {
            *ty == ort::tensor::TensorElementType::Float16
        }
        _ => false,
    };
    let output_name = session
        .outputs()
        .first()
        .map(|o| o.name().to_string())
        .context("model metadata does not declare an output tensor")?;

    debug!(%input_name, %output_name, is_fp16, %provider, "detected model IO");

    Ok(LoadedSession {
        session,
        provider,
        scale,
        input_name,
        output_name,
        is_fp16,
    })
}

/// Accelerator-first fallback chain: try GPU construction (unless the caller
/// disallows it), then fall through to pure-CPU construction.
pub fn select_session(model_path: &Path, prefer_gpu: bool, scale: u32) -> Result<LoadedSession> {
    if prefer_gpu {
        match build_session(model_path, ExecutionProvider::Gpu, scale) {
            Ok(session) => return Ok(session),
            Err(e) => {
                warn!(error = %e, "GPU session construction failed, falling back to CPU");
            }
        }
    }
    build_session(model_path, ExecutionProvider::Cpu, scale)
}

impl TileModel for LoadedSession {
    fn provider(&self) -> ExecutionProvider {
        self.provider
    }

    fn scale(&self) -> u32 {
        self.scale
    }

    fn run_tile(&mut self, tile: &Array4<f32>) -> Result<Array4<f32>> {
        if self.is_fp16 {
            self.run_tile_f16(tile)
        } else {
            self.run_tile_f32(tile)
        }
    }
}

impl LoadedSession {
    /// FP32 models (Real-ESRGAN family) expect and produce the 0–255 range.
    fn run_tile_f32(&mut self, tile: &Array4<f32>) -> Result<Array4<f32>> {
        let input = Tensor::from_array(tile.mapv(|v| v * 255.0))?;
        let outputs = self
            .session
            .run(ort::inputs![self.input_name.as_str() => &input])?;
        let view = outputs[self.output_name.as_str()].try_extract_array::<f32>()?;
        let out = view.to_owned().into_dimensionality::<ndarray::Ix4>()?;
        Ok(out.mapv(|v| v / 255.0))
    }

    /// FP16 models expect and produce the 0–1 range; conversion to and from
    /// `f16` happens only at this tensor boundary.
    fn run_tile_f16(&mut self, tile: &Array4<f32>) -> Result<Array4<f32>> {
        let f32_slice = tile
            .as_slice()
            .context("tile tensor must be contiguous for f16 conversion")?;
        let mut fp16_data = vec![f16::ZERO; f32_slice.len()];
        fp16_data.convert_from_f32_slice(f32_slice);

        let fp16_array =
            ndarray::ArrayD::from_shape_vec(tile.shape().to_vec(), fp16_data)?;
        let input = Tensor::from_array(fp16_array)?;
        let outputs = self
            .session
            .run(ort::inputs![self.input_name.as_str() => &input])?;
        let view = outputs[self.output_name.as_str()].try_extract_array::<f16>()?;

        let owned_contig;
        let fp16_slice = if let Some(s) = view.as_slice() {
            s
        } else {
            owned_contig = view.as_standard_layout().into_owned();
            owned_contig
                .as_slice()
                .context("standard-layout tensor is not contiguous")?
        };
        let mut f32_data = vec![0.0f32; fp16_slice.len()];
        fp16_slice.convert_to_f32_slice(&mut f32_data);

        let out = ndarray::ArrayD::from_shape_vec(view.shape().to_vec(), f32_data)?;
        Ok(out.into_dimensionality::<ndarray::Ix4>()?)
    }
}

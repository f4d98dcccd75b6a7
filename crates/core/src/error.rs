//! Failure taxonomy for the upscaling pipeline.
//!
//! Internal pipeline code reports failures through `anyhow`; the orchestrator
//! classifies them into these variants at its boundary, so no raw error ever
//! reaches a caller of `upscale`.

/// Classified failure of one upscale call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UpscaleError {
    /// Invalid dimensions or out-of-range target scale. No resources touched.
    Validation(String),
    /// The model is not downloaded/verified. No session construction attempted.
    ModelNotReady,
    /// Both GPU and CPU session construction failed, or the model's tensor
    /// names could not be discovered.
    SessionInit(String),
    /// Inference failed while the GPU session was active. Recoverable:
    /// triggers exactly one automatic CPU retry.
    GpuInference(String),
    /// Inference failed during (or after) the CPU retry. Fatal.
    CpuInference(String),
    /// The caller requested cancellation.
    Cancelled,
    /// Another upscale call is already in flight on this service instance.
    AlreadyProcessing,
    /// Non-inference pipeline fault (buffer layout, encoding).
    Internal(String),
}

impl std::fmt::Display for UpscaleError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Validation(msg) => write!(f, "validation failed: {msg}"),
            Self::ModelNotReady => write!(f, "model is not ready (not downloaded or not verified)"),
            Self::SessionInit(msg) => write!(f, "inference session initialization failed: {msg}"),
            Self::GpuInference(msg) => write!(f, "GPU inference failed: {msg}"),
            Self::CpuInference(msg) => write!(f, "inference failed during CPU retry: {msg}"),
            Self::Cancelled => write!(f, "operation cancelled"),
            Self::AlreadyProcessing => write!(f, "an upscale operation is already processing"),
            Self::Internal(msg) => write!(f, "internal pipeline failure: {msg}"),
        }
    }
}

impl std::error::Error for UpscaleError {}

//! Core crate for the tessera tiled super-resolution engine.

pub mod config;
pub mod error;
pub mod finalize;
pub mod logging;
pub mod manager;
pub mod models;
pub mod orchestrator;
pub mod session;
pub mod tiling;
pub mod types;

pub use error::UpscaleError;
pub use orchestrator::UpscaleService;
pub use types::{ImageBuffer, UpscalingPhase, UpscalingProgress, UpscalingResult};

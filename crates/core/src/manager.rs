//! Lifecycle of the single active inference session.
//!
//! At most one session exists per manager at any time. Initialization is
//! single-flight: concurrent callers block on the slot mutex and observe the
//! session the first caller constructed. Once the GPU is marked permanently
//! disabled, every later initialization forces CPU-only construction.

use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use anyhow::Result;
use tracing::{debug, info};

use crate::config::EngineConfig;
use crate::error::UpscaleError;
use crate::models::{ModelStatus, ModelStore};
use crate::session::{select_session, ExecutionProvider, TileModel};

pub type SharedModel = Arc<Mutex<Box<dyn TileModel>>>;

/// Builds a tile model from a model path. `prefer_gpu` is false when the
/// accelerator has been permanently disabled for this service instance.
pub type SessionFactory = dyn Fn(&Path, bool) -> Result<Box<dyn TileModel>> + Send + Sync;

pub struct SessionManager {
    factory: Box<SessionFactory>,
    prefer_gpu: bool,
    slot: Mutex<Option<SharedModel>>,
    gpu_disabled: AtomicBool,
}

impl SessionManager {
    pub fn new(prefer_gpu: bool, factory: Box<SessionFactory>) -> Self {
        Self {
            factory,
            prefer_gpu,
            slot: Mutex::new(None),
            gpu_disabled: AtomicBool::new(false),
        }
    }

    /// Manager backed by real `ort` sessions, configured from `EngineConfig`.
    pub fn from_config(config: &EngineConfig) -> Self {
        let scale = config.inference.model_scale;
        Self::new(
            config.inference.prefer_gpu,
            Box::new(move |path, prefer_gpu| {
                let session = select_session(path, prefer_gpu, scale)?;
                Ok(Box::new(session) as Box<dyn TileModel>)
            }),
        )
    }

    /// Return the active session, constructing it on first use.
    ///
    /// Fails fast with `ModelNotReady` when the model store does not report a
    /// ready model, without attempting construction.
    pub fn ensure_initialized(&self, store: &dyn ModelStore) -> Result<SharedModel, UpscaleError> {
        let mut slot = self.slot.lock().unwrap();
        if let Some(model) = slot.as_ref() {
            return Ok(model.clone());
        }

        if store.status() != ModelStatus::Ready {
            return Err(UpscaleError::ModelNotReady);
        }
        let model_path = store.model_path().ok_or(UpscaleError::ModelNotReady)?;

        let prefer_gpu = self.prefer_gpu && !self.gpu_disabled.load(Ordering::SeqCst);
        debug!(model = %model_path.display(), prefer_gpu, "initializing inference session");

        let model = (self.factory)(&model_path, prefer_gpu)
            .map_err(|e| UpscaleError::SessionInit(format!("{e:#}")))?;
        info!(provider = %model.provider(), "inference session ready");

        let shared: SharedModel = Arc::new(Mutex::new(model));
        *slot = Some(shared.clone());
        Ok(shared)
    }

    /// Drop the active session, if any. The drop completes while the slot
    /// lock is held, so a replacement can never coexist with the old session.
    pub fn invalidate(&self) {
        let mut slot = self.slot.lock().unwrap();
        if slot.take().is_some() {
            debug!("inference session released");
        }
    }

    /// Permanently disable the accelerator for this service instance.
    pub fn disable_gpu(&self) {
        self.gpu_disabled.store(true, Ordering::SeqCst);
    }

    pub fn is_gpu_disabled(&self) -> bool {
        self.gpu_disabled.load(Ordering::SeqCst)
    }

    /// True when an active session exists and runs on the accelerator.
    pub fn is_gpu_active(&self) -> bool {
        let slot = self.slot.lock().unwrap();
        match slot.as_ref() {
            Some(model) => model.lock().unwrap().provider() == ExecutionProvider::Gpu,
            None => false,
        }
    }

    pub fn shutdown(&self) {
        self.invalidate();
    }
}

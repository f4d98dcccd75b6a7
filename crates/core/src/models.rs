//! Model catalog and on-disk model store.
//!
//! The orchestrator only consumes the [`ModelStore`] view: whether the active
//! model is ready and where it lives. Acquisition (download, hash
//! verification) is handled here and never triggered from the pipeline.

use std::fs;
use std::io::Read;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::{info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ModelStatus {
    NotDownloaded,
    Downloading,
    Ready,
    Error,
}

impl std::fmt::Display for ModelStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::NotDownloaded => write!(f, "not downloaded"),
            Self::Downloading => write!(f, "downloading"),
            Self::Ready => write!(f, "ready"),
            Self::Error => write!(f, "error"),
        }
    }
}

/// Read-only view of the active model, consumed by the session manager.
pub trait ModelStore: Send + Sync {
    fn status(&self) -> ModelStatus;
    fn model_path(&self) -> Option<PathBuf>;
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelEntry {
    pub name: String,
    pub filename: String,
    pub url: Option<String>,
    pub sha256: Option<String>,
    /// Fixed upscale factor of the model.
    pub scale: u32,
    pub description: String,
}

fn builtin_catalog() -> Vec<ModelEntry> {
    vec![ModelEntry {
        name: "RealESRGAN_x4plus".into(),
        filename: "RealESRGAN_x4plus.onnx".into(),
        url: Some("https://huggingface.co/deepghs/imgutils-models/resolve/main/onnx/realesrgan/RealESRGAN_x4plus.onnx".into()),
        sha256: None,
        scale: 4,
        description: "Real-ESRGAN 4x general upscaling model".into(),
    }]
}

pub struct ModelRegistry {
    models_dir: PathBuf,
    entries: Vec<ModelEntry>,
    active: String,
    downloading: AtomicBool,
}

impl ModelRegistry {
    pub fn new(models_dir: PathBuf, active: String) -> Self {
        Self {
            models_dir,
            entries: Vec::new(),
            active,
            downloading: AtomicBool::new(false),
        }
    }

    pub fn with_builtin_models(models_dir: PathBuf) -> Self {
        let catalog = builtin_catalog();
        let active = catalog[0].name.clone();
        Self {
            models_dir,
            entries: catalog,
            active,
            downloading: AtomicBool::new(false),
        }
    }

    pub fn get(&self, name: &str) -> Option<&ModelEntry> {
        self.entries.iter().find(|e| e.name == name)
    }

    pub fn list(&self) -> &[ModelEntry] {
        &self.entries
    }

    pub fn active_model(&self) -> Option<&ModelEntry> {
        self.get(&self.active)
    }

    pub fn set_active(&mut self, name: &str) -> Result<()> {
        if self.get(name).is_none() {
            bail!("unknown model: {name}");
        }
        self.active = name.to_string();
        Ok(())
    }

    pub fn is_downloaded(&self, name: &str) -> bool {
        self.get(name)
            .map(|e| self.models_dir.join(&e.filename).is_file())
            .unwrap_or(false)
    }

    pub fn path_for(&self, name: &str) -> Option<PathBuf> {
        self.get(name).map(|e| self.models_dir.join(&e.filename))
    }

    /// Download a catalog model to a `.part` temp file, verify its SHA-256
    /// when one is configured, and rename it into place.
    pub fn download(&self, name: &str) -> Result<PathBuf> {
        let entry = self
            .get(name)
            .with_context(|| format!("unknown model: {name}"))?;

        let url = entry
            .url
            .as_deref()
            .with_context(|| format!("no download URL for model: {name}"))?;

        fs::create_dir_all(&self.models_dir).with_context(|| {
            format!(
                "failed to create models directory: {}",
                self.models_dir.display()
            )
        })?;

        let final_path = self.models_dir.join(&entry.filename);
        let tmp_path = self.models_dir.join(format!("{}.part", entry.filename));

        info!(model = %name, url = %url, "downloading model");
        self.downloading.store(true, Ordering::SeqCst);
        let result = self.download_to(name, url, entry.sha256.as_deref(), &tmp_path, &final_path);
        self.downloading.store(false, Ordering::SeqCst);
        result
    }

    fn download_to(
        &self,
        name: &str,
        url: &str,
        expected_sha256: Option<&str>,
        tmp_path: &Path,
        final_path: &Path,
    ) -> Result<PathBuf> {
        let client = reqwest::blocking::Client::builder()
            .connect_timeout(Duration::from_secs(15))
            .timeout(Duration::from_secs(30 * 60))
            .build()
            .context("failed to build HTTP client for model download")?;

        let mut response = client
            .get(url)
            .send()
            .with_context(|| format!("failed to start download for model {name}"))?;

        if !response.status().is_success() {
            let _ = fs::remove_file(tmp_path);
            bail!(
                "download request for model {name} returned HTTP {}",
                response.status().as_u16()
            );
        }

        let mut tmp_file = fs::File::create(tmp_path)
            .with_context(|| format!("failed to create temp file: {}", tmp_path.display()))?;

        if let Err(err) = response
            .copy_to(&mut tmp_file)
            .with_context(|| format!("failed while downloading model {name} from {url}"))
        {
            let _ = fs::remove_file(tmp_path);
            return Err(err);
        }

        if let Err(err) = tmp_file
            .sync_all()
            .with_context(|| format!("failed to flush temp file: {}", tmp_path.display()))
        {
            let _ = fs::remove_file(tmp_path);
            return Err(err);
        }

        if let Some(expected_hash) = expected_sha256 {
            info!(model = %name, "verifying SHA-256 hash");
            let actual_hash = sha256_file(tmp_path)?;
            if actual_hash != expected_hash {
                let _ = fs::remove_file(tmp_path);
                bail!("SHA-256 mismatch for {name}: expected {expected_hash}, got {actual_hash}");
            }
        } else {
            warn!(model = %name, "no SHA-256 hash configured, skipping verification");
        }

        fs::rename(tmp_path, final_path).with_context(|| {
            format!(
                "failed to move {} to {}",
                tmp_path.display(),
                final_path.display()
            )
        })?;

        info!(model = %name, path = %final_path.display(), "download complete");
        Ok(final_path.to_path_buf())
    }

    pub fn to_json(&self) -> Result<String> {
        serde_json::to_string_pretty(&self.entries).context("failed to serialize model catalog")
    }

    pub fn load_json(&mut self, json: &str) -> Result<()> {
        let loaded: Vec<ModelEntry> =
            serde_json::from_str(json).context("failed to parse model catalog JSON")?;
        for entry in loaded {
            if !self.entries.iter().any(|e| e.name == entry.name) {
                self.entries.push(entry);
            }
        }
        Ok(())
    }
}

impl ModelStore for ModelRegistry {
    fn status(&self) -> ModelStatus {
        if self.downloading.load(Ordering::SeqCst) {
            return ModelStatus::Downloading;
        }
        match self.active_model() {
            None => ModelStatus::Error,
            Some(_) if self.is_downloaded(&self.active) => ModelStatus::Ready,
            Some(_) => ModelStatus::NotDownloaded,
        }
    }

    fn model_path(&self) -> Option<PathBuf> {
        self.path_for(&self.active)
    }
}

fn sha256_file(path: &Path) -> Result<String> {
    let mut file =
        fs::File::open(path).with_context(|| format!("cannot open {}", path.display()))?;
    let mut hasher = Sha256::new();
    let mut buf = [0u8; 8192];
    loop {
        let n = file.read(&mut buf)?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    let hash = hasher.finalize();
    Ok(format!("{hash:x}"))
}

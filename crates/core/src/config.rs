use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};

/// Fixed upscale factor of the bundled model.
pub const DEFAULT_MODEL_SCALE: u32 = 4;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct EngineConfig {
    pub paths: PathsConfig,
    pub tiling: TilingConfig,
    pub inference: InferenceConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct PathsConfig {
    pub models_dir: PathBuf,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct TilingConfig {
    /// Edge length of the square window fed to the model, in source pixels.
    pub tile_edge: u32,
    /// Context border included on each side of a tile and discarded from the
    /// stitched output.
    pub padding: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct InferenceConfig {
    pub model_name: String,
    pub model_scale: u32,
    pub prefer_gpu: bool,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            paths: PathsConfig::default(),
            tiling: TilingConfig::default(),
            inference: InferenceConfig::default(),
        }
    }
}

impl Default for PathsConfig {
    fn default() -> Self {
        Self {
            models_dir: PathBuf::from("models"),
        }
    }
}

impl Default for TilingConfig {
    fn default() -> Self {
        Self {
            tile_edge: 192,
            padding: 32,
        }
    }
}

impl Default for InferenceConfig {
    fn default() -> Self {
        Self {
            model_name: "RealESRGAN_x4plus".to_string(),
            model_scale: DEFAULT_MODEL_SCALE,
            prefer_gpu: true,
        }
    }
}

impl TilingConfig {
    /// Content stride of a tile: `tile_edge - 2 * padding`.
    pub fn stride(&self) -> i64 {
        self.tile_edge as i64 - 2 * self.padding as i64
    }
}

impl EngineConfig {
    pub fn load_from_path(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }

        let raw = fs::read_to_string(path)
            .with_context(|| format!("failed to read config file: {}", path.display()))?;

        if raw.trim().is_empty() {
            return Ok(Self::default());
        }

        let config: Self = toml::from_str(&raw)
            .with_context(|| format!("failed to parse config TOML: {}", path.display()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn save_to_path(&self, path: &Path) -> Result<()> {
        let parent = path
            .parent()
            .context("config path does not have a parent directory")?;
        fs::create_dir_all(parent)
            .with_context(|| format!("failed to create config directory: {}", parent.display()))?;

        let encoded = toml::to_string_pretty(self).context("failed to serialize config TOML")?;
        fs::write(path, encoded)
            .with_context(|| format!("failed to write config file: {}", path.display()))?;
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        if self.tiling.stride() <= 0 {
            bail!(
                "tile_edge ({}) must exceed 2x padding ({})",
                self.tiling.tile_edge,
                self.tiling.padding
            );
        }
        if self.inference.model_scale == 0 {
            bail!("model_scale must be positive");
        }
        Ok(())
    }
}

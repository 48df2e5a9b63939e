/// Runtime configuration
///
/// Persisted as JSON. Every field has a default, so a partial file (or no
/// file at all) is valid. Values are handed to the resolver and cache at
/// construction; nothing here is global.
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::{Error, Result};
use crate::state::data::CropVariant;
use crate::state::resolver::WalkLimits;

const APP_DIR: &str = "cell-verifier";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Directory declared image paths are resolved under.
    pub data_root: Option<PathBuf>,
    /// Detections scoring below this are dropped when flattening.
    pub confidence_threshold: f64,
    /// Tier-1 capacity in entries.
    pub memory_capacity: usize,
    /// Tier-2 directory. `None` runs the cache memory-only.
    pub cache_dir: Option<PathBuf>,
    pub thumbnail_size: u32,
    pub viewfinder_size: u32,
    pub viewfinder_padding: f64,
    pub walk_max_depth: usize,
    pub walk_max_entries: usize,
    pub walk_timeout_ms: u64,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            data_root: None,
            confidence_threshold: 0.5,
            memory_capacity: 256,
            cache_dir: default_cache_dir(),
            thumbnail_size: 120,
            viewfinder_size: 512,
            viewfinder_padding: 1.0,
            walk_max_depth: 16,
            walk_max_entries: 200_000,
            walk_timeout_ms: 10_000,
        }
    }
}

/// `~/.cache/cell-verifier/crops` on Linux.
pub fn default_cache_dir() -> Option<PathBuf> {
    let mut path = dirs_next::cache_dir().or_else(dirs_next::home_dir)?;
    path.push(APP_DIR);
    path.push("crops");
    Some(path)
}

/// `~/.config/cell-verifier/config.json` on Linux.
pub fn default_config_path() -> Option<PathBuf> {
    let mut path = dirs::config_dir().or_else(dirs::home_dir)?;
    path.push(APP_DIR);
    path.push("config.json");
    Some(path)
}

impl Config {
    /// Read `path`; a missing file yields the defaults.
    pub fn load(path: &Path) -> Result<Self> {
        match std::fs::read(path) {
            Ok(bytes) => Self::from_json(&bytes)
                .map_err(|e| Error::Config(format!("{}: {}", path.display(), e))),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Self::default()),
            Err(e) => Err(Error::Config(format!("cannot read {}: {}", path.display(), e))),
        }
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| Error::Config(format!("cannot create {}: {}", parent.display(), e)))?;
        }
        std::fs::write(path, self.to_json()?)
            .map_err(|e| Error::Config(format!("cannot write {}: {}", path.display(), e)))
    }

    pub fn to_json(&self) -> Result<String> {
        serde_json::to_string_pretty(self).map_err(|e| Error::Config(e.to_string()))
    }

    pub fn from_json(bytes: &[u8]) -> Result<Self> {
        let config: Self = serde_json::from_slice(bytes).map_err(|e| Error::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<()> {
        if !(0.0..=1.0).contains(&self.confidence_threshold) {
            return Err(Error::Config(format!(
                "confidence_threshold {} outside [0, 1]",
                self.confidence_threshold
            )));
        }
        if self.thumbnail_size == 0 || self.viewfinder_size == 0 {
            return Err(Error::Config("crop sizes must be positive".to_string()));
        }
        Ok(())
    }

    pub fn walk_limits(&self) -> WalkLimits {
        WalkLimits {
            max_depth: self.walk_max_depth,
            max_entries: self.walk_max_entries,
            timeout: Duration::from_millis(self.walk_timeout_ms),
        }
    }

    pub fn variant_thumbnail(&self) -> CropVariant {
        CropVariant::Thumbnail {
            size: self.thumbnail_size,
        }
    }

    pub fn variant_viewfinder(&self) -> CropVariant {
        CropVariant::Viewfinder {
            padding_ratio: self.viewfinder_padding,
            size: self.viewfinder_size,
        }
    }
}

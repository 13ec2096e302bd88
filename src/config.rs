//! Engine Configuration
//!
//! Loaded from JSON the same way the rest of the engine reads its data files.

use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

use crate::error::{EngineError, Result};
use crate::ENGINE_VERSION;

pub const DEFAULT_EXTENSION: &str = "html";
pub const DEFAULT_MAX_DEPTH: usize = 32;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EngineConfig {
    pub views_dir: PathBuf,
    pub cache_dir: PathBuf,
    #[serde(default = "default_extension")]
    pub extension: String,
    #[serde(default = "default_max_depth")]
    pub max_depth: usize,
    #[serde(default = "default_true")]
    pub cache_enabled: bool,
    #[serde(default)]
    pub engine_min_version: Option<String>,
}

fn default_extension() -> String {
    DEFAULT_EXTENSION.to_string()
}

fn default_max_depth() -> usize {
    DEFAULT_MAX_DEPTH
}

fn default_true() -> bool {
    true
}

impl EngineConfig {
    pub fn new(views_dir: impl Into<PathBuf>, cache_dir: impl Into<PathBuf>) -> Self {
        Self {
            views_dir: views_dir.into(),
            cache_dir: cache_dir.into(),
            extension: default_extension(),
            max_depth: default_max_depth(),
            cache_enabled: true,
            engine_min_version: None,
        }
    }

    pub fn from_file(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path)
            .map_err(|e| EngineError::Config(format!("cannot read {}: {}", path.display(), e)))?;
        let config: Self = serde_json::from_str(&content)
            .map_err(|e| EngineError::Config(format!("invalid {}: {}", path.display(), e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Checks limits and engine compatibility.
    pub fn validate(&self) -> Result<()> {
        if self.max_depth == 0 {
            return Err(EngineError::Config("maxDepth must be at least 1".into()));
        }
        if self.extension.trim_start_matches('.').is_empty() {
            return Err(EngineError::Config("extension must not be empty".into()));
        }
        if let Some(min) = &self.engine_min_version {
            let engine_ver = semver::Version::parse(ENGINE_VERSION)
                .map_err(|_| EngineError::Config("Invalid engine version".into()))?;
            let min_ver = semver::Version::parse(min)
                .map_err(|_| EngineError::Config(format!("Invalid engineMinVersion {}", min)))?;
            if engine_ver < min_ver {
                return Err(EngineError::Config(format!(
                    "configuration requires engine >= {}, current is {}",
                    min, ENGINE_VERSION
                )));
            }
        }
        Ok(())
    }
}

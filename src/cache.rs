//! Template Cache - Compiled Artifacts on Disk
//!
//! Layout: `<root>/<h[0..2]>/<h[2..4]>/<h>.fgc` where `h` is the SHA-256 of
//! the normalized source path. Writes go through a temp file in the target
//! directory followed by an atomic rename, so readers see either the old
//! artifact or the complete new one. Readers never lock.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::SystemTime;
use tempfile::NamedTempFile;

use crate::error::{EngineError, Result};
use crate::hashing::artifact_key;
use crate::syntax::{INSTRUCTION_CLOSE, INSTRUCTION_OPEN};

pub const ARTIFACT_EXTENSION: &str = "fgc";

/// Metadata line written ahead of the compiled text.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ArtifactHeader {
    pub engine_version: String,
    pub source: PathBuf,
    #[serde(default)]
    pub dependencies: Vec<PathBuf>,
}

#[derive(Debug, Clone)]
pub struct CompiledArtifact {
    pub path: PathBuf,
    pub header: ArtifactHeader,
    pub text: String,
    pub modified: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct TemplateCache {
    root: PathBuf,
}

impl TemplateCache {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Deterministic artifact location for a source path.
    pub fn compiled_path_for(&self, source_path: &Path) -> PathBuf {
        let key = artifact_key(source_path);
        self.root
            .join(&key[0..2])
            .join(&key[2..4])
            .join(format!("{}.{}", key, ARTIFACT_EXTENSION))
    }

    /// True when the artifact is missing or older than its source.
    pub fn is_stale(&self, source_path: &Path, compiled_path: &Path) -> bool {
        let Some(compiled) = modified(compiled_path) else {
            return true;
        };
        match modified(source_path) {
            Some(source) => source > compiled,
            None => true,
        }
    }

    /// [`is_stale`](Self::is_stale) over every file the artifact was built from.
    pub fn is_stale_with_dependencies(
        &self,
        compiled_path: &Path,
        dependencies: &[PathBuf],
    ) -> bool {
        dependencies.is_empty()
            || dependencies.iter().any(|dep| self.is_stale(dep, compiled_path))
    }

    pub fn write(&self, compiled_path: &Path, content: &str) -> Result<()> {
        let cache_err = |reason: String| EngineError::CacheWrite {
            path: compiled_path.to_path_buf(),
            reason,
        };
        let parent = compiled_path
            .parent()
            .ok_or_else(|| cache_err("artifact path has no parent directory".into()))?;
        fs::create_dir_all(parent)
            .map_err(|e| cache_err(format!("Failed to create cache directory: {}", e)))?;

        let mut temp_file = NamedTempFile::new_in(parent)
            .map_err(|e| cache_err(format!("Failed to create temp file: {}", e)))?;
        temp_file
            .write_all(content.as_bytes())
            .map_err(|e| cache_err(format!("Failed to write temp file: {}", e)))?;
        temp_file
            .as_file()
            .sync_all()
            .map_err(|e| cache_err(format!("Failed to sync temp file: {}", e)))?;
        temp_file
            .persist(compiled_path)
            .map_err(|e| cache_err(format!("Failed to persist temp file: {}", e)))?;
        Ok(())
    }

    pub fn read(&self, compiled_path: &Path) -> Result<String> {
        Ok(fs::read_to_string(compiled_path)?)
    }

    /// Stores compiled text with its header.
    pub fn store(
        &self,
        compiled_path: &Path,
        header: &ArtifactHeader,
        compiled: &str,
    ) -> Result<()> {
        let encoded = encode_artifact(header, compiled)?;
        self.write(compiled_path, &encoded)
    }

    /// Loads and decodes an artifact. `Ok(None)` when the file exists but is
    /// not a well-formed artifact.
    pub fn artifact(&self, compiled_path: &Path) -> Result<Option<CompiledArtifact>> {
        let raw = self.read(compiled_path)?;
        let modified = fs::metadata(compiled_path)?.modified()?;
        Ok(decode_artifact(&raw).map(|(header, text)| CompiledArtifact {
            path: compiled_path.to_path_buf(),
            header,
            text: text.to_string(),
            modified: DateTime::<Utc>::from(modified),
        }))
    }

    /// Removes every artifact below the cache root. Returns how many files
    /// were deleted.
    pub fn clear(&self) -> Result<usize> {
        if !self.root.exists() {
            return Ok(0);
        }
        let mut removed = 0;
        for shard in read_dirs(&self.root)? {
            for leaf in read_dirs(&shard)? {
                for entry in fs::read_dir(&leaf)? {
                    let path = entry?.path();
                    if path.extension().map_or(false, |e| e == ARTIFACT_EXTENSION) {
                        fs::remove_file(&path)?;
                        removed += 1;
                    }
                }
                // Left behind when another writer is mid-rename.
                let _ = fs::remove_dir(&leaf);
            }
            let _ = fs::remove_dir(&shard);
        }
        tracing::info!(removed, root = %self.root.display(), "cleared compiled templates");
        Ok(removed)
    }
}

fn modified(path: &Path) -> Option<SystemTime> {
    fs::metadata(path).and_then(|m| m.modified()).ok()
}

fn read_dirs(dir: &Path) -> Result<Vec<PathBuf>> {
    let mut dirs = vec![];
    for entry in fs::read_dir(dir)? {
        let path = entry?.path();
        if path.is_dir() {
            dirs.push(path);
        }
    }
    Ok(dirs)
}

pub fn encode_artifact(header: &ArtifactHeader, compiled: &str) -> Result<String> {
    let json = serde_json::to_string(header)?;
    Ok(format!(
        "{} artifact {} {}\n{}",
        INSTRUCTION_OPEN, json, INSTRUCTION_CLOSE, compiled
    ))
}

pub fn decode_artifact(raw: &str) -> Option<(ArtifactHeader, &str)> {
    let (first, body) = raw.split_once('\n')?;
    let json = first
        .strip_prefix(INSTRUCTION_OPEN)?
        .trim_start()
        .strip_prefix("artifact")?
        .strip_suffix(INSTRUCTION_CLOSE)?;
    let header = serde_json::from_str(json.trim()).ok()?;
    Some((header, body))
}

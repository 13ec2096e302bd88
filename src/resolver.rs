//! Path Resolution - Logical Names to Files Under the Views Directory
//!
//! Every resolved path is a descendant of the canonical base directory.
//! Traversal is rejected twice: lexically before touching the filesystem,
//! and again after symlinks are resolved.

use std::path::{Component, Path, PathBuf};

use crate::error::{EngineError, Result};

#[derive(Debug, Clone)]
pub struct PathResolver {
    base: PathBuf,
    extension: String,
}

impl PathResolver {
    pub fn new(base: &Path, extension: &str) -> Result<Self> {
        let base = base.canonicalize().map_err(|e| EngineError::PathNotFound {
            name: base.display().to_string(),
            reason: format!("views directory unavailable: {}", e),
        })?;
        Ok(Self {
            base,
            extension: extension.trim_start_matches('.').to_string(),
        })
    }

    pub fn base(&self) -> &Path {
        &self.base
    }

    pub fn resolve(&self, name: &str) -> Result<PathBuf> {
        let normalized = normalize_name(name, &self.extension)?;
        let relative = contained_relative_path(&normalized)
            .ok_or_else(|| EngineError::PathEscape(name.to_string()))?;

        let candidate = self.base.join(relative);
        let canonical = candidate.canonicalize().map_err(|e| EngineError::PathNotFound {
            name: name.to_string(),
            reason: e.to_string(),
        })?;

        if !canonical.starts_with(&self.base) {
            return Err(EngineError::PathEscape(name.to_string()));
        }
        if !canonical.is_file() {
            return Err(EngineError::PathNotFound {
                name: name.to_string(),
                reason: "not a regular file".into(),
            });
        }
        Ok(canonical)
    }
}

/// Cleans a logical name: trims it, unifies separators, appends the extension.
pub fn normalize_name(name: &str, extension: &str) -> Result<String> {
    let trimmed = name.trim();
    if trimmed.is_empty() {
        return Err(EngineError::PathNotFound {
            name: name.to_string(),
            reason: "empty template name".into(),
        });
    }
    if let Some(c) = trimmed.chars().find(|c| is_forbidden_char(*c)) {
        return Err(EngineError::PathNotFound {
            name: name.escape_debug().to_string(),
            reason: format!("forbidden character {:?}", c),
        });
    }

    let mut normalized = trimmed.replace('\\', "/");
    let suffix = format!(".{}", extension);
    if !normalized.ends_with(&suffix) {
        normalized.push_str(&suffix);
    }
    Ok(normalized)
}

pub fn is_forbidden_char(c: char) -> bool {
    c == '\0' || c.is_control()
}

/// Lexically folds `.` and `..`; `None` when the path climbs above its root
/// or is absolute.
pub fn contained_relative_path(normalized: &str) -> Option<PathBuf> {
    let mut parts: Vec<&std::ffi::OsStr> = vec![];
    for component in Path::new(normalized).components() {
        match component {
            Component::Normal(part) => parts.push(part),
            Component::CurDir => {}
            Component::ParentDir => {
                parts.pop()?;
            }
            Component::RootDir | Component::Prefix(_) => return None,
        }
    }
    if parts.is_empty() {
        return None;
    }
    Some(parts.iter().collect())
}

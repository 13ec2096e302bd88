//! Error Taxonomy
//!
//! Path and compile errors abort the whole render. Cache write failures are
//! recovered inside the parsing service and only ever logged.

use std::path::PathBuf;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, EngineError>;

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("Template not found: {name} ({reason})")]
    PathNotFound { name: String, reason: String },

    #[error("Template path escapes the views directory: {0}")]
    PathEscape(String),

    #[error("Compile error in {template} at line {line}: {message}")]
    Compile {
        template: String,
        line: usize,
        message: String,
    },

    #[error("Duplicate section '{section}' in {template}")]
    DuplicateSection { template: String, section: String },

    #[error("Layout cycle detected: {}", chain.join(" -> "))]
    LayoutCycle { chain: Vec<String> },

    #[error("Failed to write compiled template {}: {reason}", path.display())]
    CacheWrite { path: PathBuf, reason: String },

    #[error("Recursion limit of {limit} exceeded: {}", chain.join(" -> "))]
    RecursionLimitExceeded { limit: usize, chain: Vec<String> },

    #[error("Render error in {template}: {message}")]
    Render { template: String, message: String },

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Json(#[from] serde_json::Error),
}

impl EngineError {
    pub fn compile(template: impl Into<String>, line: usize, message: impl Into<String>) -> Self {
        Self::Compile {
            template: template.into(),
            line,
            message: message.into(),
        }
    }

    pub fn render(template: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Render {
            template: template.into(),
            message: message.into(),
        }
    }

    /// Template chain carried by cycle and recursion errors.
    pub fn chain(&self) -> Option<&[String]> {
        match self {
            Self::LayoutCycle { chain } | Self::RecursionLimitExceeded { chain, .. } => Some(chain),
            _ => None,
        }
    }
}

/// 1-based line number of a byte offset.
pub fn line_of(text: &str, offset: usize) -> usize {
    text[..offset.min(text.len())].matches('\n').count() + 1
}

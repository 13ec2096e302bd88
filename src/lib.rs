//! PageForge Core - Template Compilation and Rendering Engine
//!
//! # The Rules
//! 1. Templates Resolve Inside the Views Directory
//! 2. Layout Chains Terminate
//! 3. Compiled Artifacts Are Keyed by Source Path
//! 4. Stale Means Missing or Older Than Any Source
//! 5. Cache Failures Degrade, Never Fail
//! 6. No Partial HTML on Error

pub mod cache;
pub mod compiler;
pub mod config;
pub mod context;
pub mod error;
pub mod executor;
pub mod expr;
pub mod hashing;
pub mod layout;
pub mod parsing;
pub mod renderable;
pub mod rendering;
pub mod resolver;
pub mod sections;
pub mod syntax;

pub use cache::{CompiledArtifact, TemplateCache};
pub use compiler::{Compiler, CompilerPass, YieldPass};
pub use config::EngineConfig;
pub use context::{Data, RenderContext};
pub use error::{EngineError, Result};
pub use layout::extract_layout;
pub use parsing::{TemplateParsingService, TemplateSource};
pub use renderable::{AssetLink, Page, Partial, Renderable, RenderableKind, View};
pub use rendering::{ComponentExecutor, ComponentRenderingService};
pub use resolver::PathResolver;
pub use sections::{extract_sections, SectionMap};

pub const ENGINE_VERSION: &str = env!("CARGO_PKG_VERSION");

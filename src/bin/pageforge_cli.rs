//! PageForge CLI - Render and Inspect Templates
//!
//! Commands: render, compile, cache-path, clear-cache
//! Rendered output goes to stdout; errors are printed as JSON
//! Returns non-zero on failure

use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::process::ExitCode;
use tracing::Level;
use tracing_subscriber::EnvFilter;

use pageforge_core::{
    ComponentRenderingService, Data, EngineConfig, EngineError, Renderable, View,
};

#[derive(Parser)]
#[command(name = "pageforge-cli")]
#[command(about = "PageForge CLI - Template Compilation and Rendering")]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Path to a JSON engine configuration
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Path to the views directory (overrides the configuration)
    #[arg(long)]
    views_dir: Option<PathBuf>,

    /// Path to the compiled template cache (overrides the configuration)
    #[arg(long)]
    cache_dir: Option<PathBuf>,
}

const DEFAULT_VIEWS_DIR: &str = "views";
const DEFAULT_CACHE_DIR: &str = "cache/views";

#[derive(Subcommand)]
enum Commands {
    /// Render a view, or a full renderable given as JSON
    Render {
        /// Template name
        #[arg(short, long, required_unless_present = "renderable")]
        template: Option<String>,

        /// JSON object with the view data
        #[arg(short, long)]
        data: Option<String>,

        /// Page title exposed as `title`
        #[arg(long)]
        title: Option<String>,

        /// JSON renderable (page, view or partial)
        #[arg(short, long, conflicts_with = "template")]
        renderable: Option<String>,
    },

    /// Print the compiled form of a template
    Compile {
        /// Template name
        #[arg(short, long)]
        template: String,
    },

    /// Print where a template's compiled artifact is stored
    CachePath {
        /// Template name
        #[arg(short, long)]
        template: String,
    },

    /// Delete every compiled artifact
    ClearCache,
}

fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(EnvFilter::from_default_env().add_directive(Level::WARN.into()))
        .init();

    let cli = Cli::parse();
    match run(cli) {
        Ok(output) => {
            println!("{}", output);
            ExitCode::SUCCESS
        }
        Err(e) => {
            let output = serde_json::json!({
                "success": false,
                "error": e.to_string(),
            });
            println!("{}", output);
            ExitCode::from(2)
        }
    }
}

/// Configuration file (or defaults) with the directory flags applied on top.
fn load_config(cli: &Cli) -> Result<EngineConfig, EngineError> {
    let mut config = match &cli.config {
        Some(path) => EngineConfig::from_file(path)?,
        None => EngineConfig::new(DEFAULT_VIEWS_DIR, DEFAULT_CACHE_DIR),
    };
    if let Some(dir) = &cli.views_dir {
        config.views_dir = dir.clone();
    }
    if let Some(dir) = &cli.cache_dir {
        config.cache_dir = dir.clone();
    }
    Ok(config)
}

fn run(cli: Cli) -> Result<String, EngineError> {
    let config = load_config(&cli)?;
    let renderer = ComponentRenderingService::from_config(&config)?;

    match cli.command {
        Commands::Render { template, data, title, renderable } => {
            let renderable: Renderable = match (renderable, template) {
                (Some(json), _) => serde_json::from_str(&json)?,
                (None, Some(template)) => {
                    let data: Data = match data {
                        Some(json) => serde_json::from_str(&json)?,
                        None => Data::new(),
                    };
                    let mut view = View::new(template).with_data(data);
                    if let Some(title) = title {
                        view = view.with_title(title);
                    }
                    view.into()
                }
                (None, None) => {
                    let message = "render needs --template or --renderable";
                    return Err(EngineError::Config(message.into()));
                }
            };
            renderer.render(&renderable)
        }

        Commands::Compile { template } => renderer.parser().get_compiled(&template),

        Commands::CachePath { template } => renderer
            .parser()
            .compiled_path(&template)
            .map(|p| p.display().to_string()),

        Commands::ClearCache => {
            let removed = renderer.parser().cache().clear()?;
            Ok(serde_json::json!({ "success": true, "removed": removed }).to_string())
        }
    }
}

//! CLI parse: clap types for settle. No behavior; definitions only.

use clap::{Parser, Subcommand};
use std::path::PathBuf;

/// Inspect the persisted state of a settle store
#[derive(Parser)]
#[command(name = "settle")]
#[command(about = "Inspect memo entries, scope records, and tracked effects")]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    /// Workspace root directory
    #[arg(long, default_value = ".")]
    pub workspace: PathBuf,

    /// Configuration file path (overrides default config loading)
    #[arg(long)]
    pub config: Option<PathBuf>,

    /// Store directory (overrides storage.path)
    #[arg(long)]
    pub store: Option<PathBuf>,

    /// Enable verbose logging (default: off)
    #[arg(long, default_value = "false")]
    pub verbose: bool,

    /// Log level (trace, debug, info, warn, error, off)
    #[arg(long)]
    pub log_level: Option<String>,

    /// Log format (json, text)
    #[arg(long)]
    pub log_format: Option<String>,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Show record counts per keyspace
    Status {
        /// Output format (text or json)
        #[arg(long, default_value = "text")]
        format: String,
    },
    /// List scope records
    Scopes {
        /// Only scopes at or below this path
        #[arg(long)]
        prefix: Option<String>,
        #[arg(long, default_value = "text")]
        format: String,
    },
    /// List tracked effects
    Effects {
        /// Only effects of this provider
        #[arg(long)]
        provider: Option<String>,
        /// Only effects with an unconfirmed intent
        #[arg(long)]
        pending: bool,
        #[arg(long, default_value = "text")]
        format: String,
    },
    /// Show memo entries recorded for a scope
    Memo {
        /// Scope path, e.g. /docs/a.md
        path: String,
        #[arg(long, default_value = "text")]
        format: String,
    },
}

impl Commands {
    pub fn name(&self) -> &'static str {
        match self {
            Commands::Status { .. } => "status",
            Commands::Scopes { .. } => "scopes",
            Commands::Effects { .. } => "effects",
            Commands::Memo { .. } => "memo",
        }
    }
}

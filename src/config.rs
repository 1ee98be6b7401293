//! Configuration System
//!
//! Layered configuration: built-in defaults, the user's global config file,
//! workspace config files, then `SETTLE_`-prefixed environment variables.

use crate::error::EngineError;
use crate::logging::LoggingConfig;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

mod merge {
    pub mod merge_policy;
}
mod sources {
    pub mod environment;
    pub mod global_file;
    pub mod workspace_file;
}

pub use sources::global_file::global_config_path;

/// Root configuration structure
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SettleConfig {
    #[serde(default)]
    pub storage: StorageConfig,

    #[serde(default)]
    pub runner: RunnerConfig,

    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Where run state is persisted
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    /// Directory of the sled database
    #[serde(default = "default_store_path")]
    pub path: PathBuf,

    /// Use a throwaway in-memory database instead of `path`
    #[serde(default)]
    pub temporary: bool,

    /// Flush to disk at the end of every commit wave
    #[serde(default = "default_true")]
    pub flush_on_commit: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunnerConfig {
    /// Upper bound on actions handed to a sink in one call
    #[serde(default = "default_max_batch_size")]
    pub max_batch_size: usize,

    /// Cancel remaining work after the first scope failure
    #[serde(default)]
    pub fail_fast: bool,
}

fn default_store_path() -> PathBuf {
    PathBuf::from(".settle/store")
}

fn default_true() -> bool {
    true
}

fn default_max_batch_size() -> usize {
    256
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            path: default_store_path(),
            temporary: false,
            flush_on_commit: default_true(),
        }
    }
}

impl Default for RunnerConfig {
    fn default() -> Self {
        Self {
            max_batch_size: default_max_batch_size(),
            fail_fast: false,
        }
    }
}

/// Configuration validation errors
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ValidationError {
    Storage(String),
    Runner(String),
    Logging(String),
}

impl std::fmt::Display for ValidationError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ValidationError::Storage(msg) => write!(f, "Storage: {}", msg),
            ValidationError::Runner(msg) => write!(f, "Runner: {}", msg),
            ValidationError::Logging(msg) => write!(f, "Logging: {}", msg),
        }
    }
}

impl std::error::Error for ValidationError {}

impl SettleConfig {
    /// Validate the whole configuration, reporting every problem found.
    pub fn validate(&self) -> Result<(), Vec<ValidationError>> {
        let mut errors = Vec::new();

        if !self.storage.temporary && self.storage.path.as_os_str().is_empty() {
            errors.push(ValidationError::Storage(
                "path cannot be empty unless storage is temporary".to_string(),
            ));
        }

        if self.runner.max_batch_size == 0 {
            errors.push(ValidationError::Runner(
                "max_batch_size must be at least 1".to_string(),
            ));
        }

        if let Err(msg) = self.logging.validate() {
            errors.push(ValidationError::Logging(msg));
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors)
        }
    }
}

/// Loads [`SettleConfig`] from the layered sources.
pub struct ConfigLoader;

impl ConfigLoader {
    /// Load configuration for a workspace
    ///
    /// Precedence (lowest to highest): defaults, global file, workspace
    /// `config/config.toml`, workspace `config/{SETTLE_ENV}.toml`,
    /// `SETTLE_*` environment variables. A relative `storage.path` is
    /// resolved against `workspace_root`.
    pub fn load(workspace_root: &Path) -> Result<SettleConfig, EngineError> {
        let builder = merge::merge_policy::builder_with_defaults()?;
        let builder = sources::global_file::add_to_builder(builder)?;
        let builder = sources::workspace_file::add_to_builder(builder, workspace_root)?;
        let builder = sources::environment::add_to_builder(builder);

        let mut config: SettleConfig = builder.build()?.try_deserialize()?;
        if config.storage.path.is_relative() {
            config.storage.path = workspace_root.join(&config.storage.path);
        }
        Ok(config)
    }

    /// Load a single file on top of the defaults.
    pub fn load_from_file(path: &Path) -> Result<SettleConfig, EngineError> {
        let config = merge::merge_policy::builder_with_defaults()?
            .add_source(config::File::from(path).required(true))
            .build()?
            .try_deserialize()?;
        Ok(config)
    }
}

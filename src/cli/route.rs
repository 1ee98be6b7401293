//! CLI route: run context and the single dispatch table.

use crate::cli::parse::Commands;
use crate::cli::presentation::{format_effects, format_memo, format_scopes, format_status, StatusView};
use crate::config::{ConfigLoader, SettleConfig};
use crate::error::EngineError;
use crate::scope::ScopePath;
use crate::store::{Keyspace, Records, SledStateStore};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, info};

/// Runtime context for CLI execution: resolved config and the opened store.
pub struct RunContext {
    records: Records,
    store_path: PathBuf,
}

impl RunContext {
    /// Resolve configuration and open the store. `store` overrides `storage.path`.
    pub fn new(
        workspace_root: PathBuf,
        config_path: Option<PathBuf>,
        store: Option<PathBuf>,
    ) -> Result<Self, EngineError> {
        let mut config: SettleConfig = if let Some(ref cfg_path) = config_path {
            ConfigLoader::load_from_file(cfg_path)?
        } else {
            ConfigLoader::load(&workspace_root)?
        };
        if let Some(store) = store {
            config.storage.path = store;
        }
        if !config.storage.path.exists() {
            return Err(EngineError::Config(format!(
                "No store at {}",
                config.storage.path.display()
            )));
        }
        let backend = SledStateStore::open(&config.storage.path)?;
        debug!(store = %config.storage.path.display(), "Opened store for inspection");
        Ok(Self {
            records: Records::new(Arc::new(backend)),
            store_path: config.storage.path,
        })
    }

    pub fn from_records(records: Records, store_path: PathBuf) -> Self {
        Self {
            records,
            store_path,
        }
    }

    pub fn execute(&self, command: &Commands) -> Result<String, EngineError> {
        let started = Instant::now();
        let output = match command {
            Commands::Status { format } => self.handle_status(format),
            Commands::Scopes { prefix, format } => self.handle_scopes(prefix.as_deref(), format),
            Commands::Effects {
                provider,
                pending,
                format,
            } => self.handle_effects(provider.as_deref(), *pending, format),
            Commands::Memo { path, format } => self.handle_memo(path, format),
        }?;
        info!(
            command = command.name(),
            elapsed_ms = started.elapsed().as_millis() as u64,
            "Command finished"
        );
        Ok(output)
    }

    fn handle_status(&self, format: &str) -> Result<String, EngineError> {
        let mut counts = Vec::new();
        for space in Keyspace::ALL {
            counts.push((space.tree_name().to_string(), self.records.count(space)?));
        }
        let view = StatusView {
            store: self.store_path.display().to_string(),
            counts,
        };
        format_status(&view, format)
    }

    fn handle_scopes(&self, prefix: Option<&str>, format: &str) -> Result<String, EngineError> {
        let prefix = match prefix {
            Some(p) => ScopePath::parse(p)?,
            None => ScopePath::root(),
        };
        let records = self.records.scope_records_under(&prefix)?;
        format_scopes(&records, format)
    }

    fn handle_effects(
        &self,
        provider: Option<&str>,
        pending_only: bool,
        format: &str,
    ) -> Result<String, EngineError> {
        let mut effects = self.records.tracked_effects(provider)?;
        if pending_only {
            effects.retain(|e| e.pending);
        }
        format_effects(&effects, format)
    }

    fn handle_memo(&self, path: &str, format: &str) -> Result<String, EngineError> {
        let scope = ScopePath::parse(path)?;
        let mut entries = Vec::new();
        if let Some(record) = self.records.scope_record(&scope)? {
            for key in &record.value.memo_keys {
                if let Some(entry) = self.records.memo_entry(key)? {
                    entries.push(entry.value);
                }
            }
        }
        format_memo(&scope.to_string(), &entries, format)
    }
}

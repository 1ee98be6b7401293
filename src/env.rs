//! Engine environment
//!
//! Owns everything a run needs: configuration, the durable records, the logic
//! fingerprint registry, and the effect providers. Functions are defined and
//! providers registered on an [`Environment`]; runs are started from it.

use crate::config::SettleConfig;
use crate::effect::provider::{ProviderHandle, ProviderRegistry};
use crate::effect::{Reconciler, Sink};
use crate::error::{EngineError, StorageError};
use crate::logic::{FunctionSpec, LogicRegistry};
use crate::memo::MemoInput;
use crate::runner::context::{MemoFn, ScopeContext};
use crate::runner::run::{self, RunHandle, RunReport};
use crate::store::{Records, SledStateStore, StateStore};
use crate::types::LogicFingerprint;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::future::Future;
use std::sync::Arc;
use tracing::{debug, info};

pub(crate) struct EnvInner {
    pub config: SettleConfig,
    pub records: Records,
    pub logic: LogicRegistry,
    pub providers: ProviderRegistry,
}

impl Drop for EnvInner {
    fn drop(&mut self) {
        self.logic.clear();
    }
}

/// Handle to an engine instance; cheap to clone.
#[derive(Clone)]
pub struct Environment {
    inner: Arc<EnvInner>,
}

impl Environment {
    /// Open the store named by `config.storage`.
    pub fn open(config: SettleConfig) -> Result<Self, EngineError> {
        config.validate().map_err(|errors| {
            let messages: Vec<String> = errors.iter().map(|e| e.to_string()).collect();
            EngineError::Config(messages.join("; "))
        })?;
        let store = if config.storage.temporary {
            SledStateStore::temporary()?
        } else {
            SledStateStore::open(&config.storage.path)?
        };
        info!(
            path = %config.storage.path.display(),
            temporary = config.storage.temporary,
            "Opened state store"
        );
        Ok(Self::with_store(config, Arc::new(store)))
    }

    /// In-memory environment with default settings.
    pub fn open_temporary() -> Result<Self, EngineError> {
        let mut config = SettleConfig::default();
        config.storage.temporary = true;
        Self::open(config)
    }

    pub fn with_store(config: SettleConfig, store: Arc<dyn StateStore>) -> Self {
        Self {
            inner: Arc::new(EnvInner {
                config,
                records: Records::new(store),
                logic: LogicRegistry::new(),
                providers: ProviderRegistry::new(),
            }),
        }
    }

    pub fn config(&self) -> &SettleConfig {
        &self.inner.config
    }

    pub fn records(&self) -> &Records {
        &self.inner.records
    }

    pub fn logic(&self) -> &LogicRegistry {
        &self.inner.logic
    }

    pub fn providers(&self) -> &ProviderRegistry {
        &self.inner.providers
    }

    pub fn register_logic_fingerprint(&self, spec: &FunctionSpec) -> Result<LogicFingerprint, EngineError> {
        self.inner.logic.register(spec)
    }

    pub fn unregister_logic_fingerprint(&self, fingerprint: &LogicFingerprint) -> bool {
        self.inner.logic.unregister(fingerprint)
    }

    /// Register `spec` and bind it to an async body.
    pub fn define_async<A, R, F, Fut>(&self, spec: FunctionSpec, body: F) -> Result<MemoFn<A, R>, EngineError>
    where
        A: MemoInput + Send + 'static,
        R: Serialize + DeserializeOwned + Send + 'static,
        F: Fn(ScopeContext, A) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<R>> + Send + 'static,
    {
        let fingerprint = self.inner.logic.register(&spec)?;
        Ok(MemoFn::new_async(spec, fingerprint, body))
    }

    /// Register `spec` and bind it to a blocking body, run on the blocking pool.
    pub fn define_sync<A, R, F>(&self, spec: FunctionSpec, body: F) -> Result<MemoFn<A, R>, EngineError>
    where
        A: MemoInput + Send + 'static,
        R: Serialize + DeserializeOwned + Send + 'static,
        F: Fn(&ScopeContext, A) -> anyhow::Result<R> + Send + Sync + 'static,
    {
        let fingerprint = self.inner.logic.register(&spec)?;
        Ok(MemoFn::new_sync(spec, fingerprint, body))
    }

    /// Replace `old` with new logic under the same name.
    ///
    /// If the new logic fails to register, `old` stays registered.
    pub fn reload_async<A, R, F, Fut>(
        &self,
        old: &MemoFn<A, R>,
        spec: FunctionSpec,
        body: F,
    ) -> Result<MemoFn<A, R>, EngineError>
    where
        A: MemoInput + Send + 'static,
        R: Serialize + DeserializeOwned + Send + 'static,
        F: Fn(ScopeContext, A) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<R>> + Send + 'static,
    {
        self.swap_logic(old.spec(), old.fingerprint(), &spec)?;
        let fingerprint = spec.fingerprint();
        Ok(MemoFn::new_async(spec, fingerprint, body))
    }

    pub fn reload_sync<A, R, F>(&self, old: &MemoFn<A, R>, spec: FunctionSpec, body: F) -> Result<MemoFn<A, R>, EngineError>
    where
        A: MemoInput + Send + 'static,
        R: Serialize + DeserializeOwned + Send + 'static,
        F: Fn(&ScopeContext, A) -> anyhow::Result<R> + Send + Sync + 'static,
    {
        self.swap_logic(old.spec(), old.fingerprint(), &spec)?;
        let fingerprint = spec.fingerprint();
        Ok(MemoFn::new_sync(spec, fingerprint, body))
    }

    fn swap_logic(
        &self,
        old_spec: &FunctionSpec,
        old: LogicFingerprint,
        new: &FunctionSpec,
    ) -> Result<(), EngineError> {
        self.inner.logic.unregister(&old);
        match self.inner.logic.register(new) {
            Ok(fingerprint) => {
                debug!(
                    function = %new.name,
                    from = %old.short(),
                    to = %fingerprint.short(),
                    "Reloaded function logic"
                );
                Ok(())
            }
            Err(err) => {
                // Restore the previous registration.
                self.inner.logic.register(old_spec)?;
                Err(err)
            }
        }
    }

    /// Register an effect provider under `name`.
    pub fn register_effect_provider<R, S>(
        &self,
        name: impl Into<String>,
        reconciler: R,
        sink: S,
    ) -> Result<ProviderHandle<R>, EngineError>
    where
        R: Reconciler,
        S: Sink<Key = R::Key, Action = R::Action>,
    {
        self.inner.providers.register(name, reconciler, sink)
    }

    /// Start a run whose root scope executes `root`. Must be called within a
    /// tokio runtime.
    pub fn start<F, Fut>(&self, root: F) -> RunHandle
    where
        F: FnOnce(ScopeContext) -> Fut + Send + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        run::start(self.inner.clone(), root)
    }

    /// Start a run and wait for its report.
    pub async fn run<F, Fut>(&self, root: F) -> RunReport
    where
        F: FnOnce(ScopeContext) -> Fut + Send + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        self.start(root).wait().await
    }

    /// Flush the store and forget all registrations.
    pub fn close(&self) -> Result<(), StorageError> {
        self.inner.records.flush()?;
        self.inner.logic.clear();
        info!("Environment closed");
        Ok(())
    }
}

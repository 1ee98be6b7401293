//! Provider registry: named reconciler + sink pairs
//!
//! Providers are stored type-erased so one run can reconcile effects of many
//! providers. Values and states cross the erasure boundary as JSON (the form
//! they are persisted in); actions cross it boxed and are recovered by the
//! same provider that produced them.

use crate::effect::reconciler::{Desired, PrevState, Reconciler};
use crate::effect::sink::{ApplyError, Sink, SinkItem};
use crate::effect::{Effect, EffectKey};
use crate::error::EngineError;
use async_trait::async_trait;
use parking_lot::RwLock;
use serde_json::Value;
use std::any::Any;
use std::collections::HashMap;
use std::marker::PhantomData;
use std::sync::Arc;
use tracing::debug;

pub(crate) type BoxedAction = Box<dyn Any + Send + Sync>;

/// Result of reconciling one key, before apply.
pub(crate) struct PlannedEffect {
    pub new_state: Desired<Value>,
    pub action: Option<BoxedAction>,
}

#[async_trait]
pub(crate) trait ErasedProvider: Send + Sync {
    fn name(&self) -> &str;

    fn reconcile(
        &self,
        key: &EffectKey,
        desired: &Desired<Value>,
        prev: PrevState<Value>,
    ) -> Result<PlannedEffect, EngineError>;

    async fn apply(&self, batch: Vec<BoxedAction>) -> Result<(), ApplyError>;
}

struct TypedProvider<R, S> {
    name: String,
    reconciler: R,
    sink: S,
}

#[async_trait]
impl<R, S> ErasedProvider for TypedProvider<R, S>
where
    R: Reconciler,
    S: Sink<Key = R::Key, Action = R::Action>,
{
    fn name(&self) -> &str {
        &self.name
    }

    fn reconcile(
        &self,
        key: &EffectKey,
        desired: &Desired<Value>,
        prev: PrevState<Value>,
    ) -> Result<PlannedEffect, EngineError> {
        let typed_key: R::Key = serde_json::from_str(&key.instance)
            .map_err(|e| EngineError::codec(format!("effect key {}", key), e))?;
        let desired: Desired<R::Value> = desired
            .clone()
            .try_map(serde_json::from_value)
            .map_err(|e| EngineError::codec(format!("desired value of {}", key), e))?;
        let prev: PrevState<R::State> = prev
            .try_map(serde_json::from_value)
            .map_err(|e| EngineError::codec(format!("tracked state of {}", key), e))?;

        let reconciliation = self.reconciler.reconcile(&typed_key, &desired, &prev);

        let new_state = reconciliation
            .new_state
            .try_map(|s| serde_json::to_value(s))
            .map_err(|e| EngineError::codec(format!("new state of {}", key), e))?;
        let action = reconciliation.action.map(|action| {
            Box::new(SinkItem {
                key: typed_key,
                action,
            }) as BoxedAction
        });
        Ok(PlannedEffect { new_state, action })
    }

    async fn apply(&self, batch: Vec<BoxedAction>) -> Result<(), ApplyError> {
        let mut items = Vec::with_capacity(batch.len());
        for boxed in batch {
            match boxed.downcast::<SinkItem<R::Key, R::Action>>() {
                Ok(item) => items.push(*item),
                Err(_) => {
                    return Err(ApplyError::all(format!(
                        "provider '{}' received an action it did not produce",
                        self.name
                    )))
                }
            }
        }
        self.sink.apply(items).await
    }
}

/// Typed handle used by application code to declare effects.
pub struct ProviderHandle<R> {
    name: Arc<str>,
    _marker: PhantomData<fn() -> R>,
}

impl<R> Clone for ProviderHandle<R> {
    fn clone(&self) -> Self {
        Self {
            name: self.name.clone(),
            _marker: PhantomData,
        }
    }
}

impl<R: Reconciler> ProviderHandle<R> {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn key(&self, key: &R::Key) -> Result<EffectKey, EngineError> {
        let instance = serde_json::to_string(key)
            .map_err(|e| EngineError::codec(format!("key for provider '{}'", self.name), e))?;
        Ok(EffectKey::new(self.name.as_ref(), instance))
    }

    pub fn effect(&self, key: &R::Key, desired: Desired<R::Value>) -> Result<Effect, EngineError> {
        let key = self.key(key)?;
        let desired = desired
            .try_map(|v| serde_json::to_value(v))
            .map_err(|e| EngineError::codec(format!("desired value of {}", key), e))?;
        Ok(Effect { key, desired })
    }

    /// Shorthand for `effect(key, Desired::Exists(value))`.
    pub fn exists(&self, key: &R::Key, value: R::Value) -> Result<Effect, EngineError> {
        self.effect(key, Desired::Exists(value))
    }

    /// Shorthand for `effect(key, Desired::NonExistence)`.
    pub fn non_existence(&self, key: &R::Key) -> Result<Effect, EngineError> {
        self.effect(key, Desired::NonExistence)
    }
}

/// Named providers available to a run
#[derive(Default)]
pub struct ProviderRegistry {
    providers: RwLock<HashMap<String, Arc<dyn ErasedProvider>>>,
}

impl ProviderRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register<R, S>(
        &self,
        name: impl Into<String>,
        reconciler: R,
        sink: S,
    ) -> Result<ProviderHandle<R>, EngineError>
    where
        R: Reconciler,
        S: Sink<Key = R::Key, Action = R::Action>,
    {
        let name = name.into();
        if name.is_empty() || name.contains('\0') {
            return Err(EngineError::InvalidPath(format!(
                "invalid provider name {:?}",
                name
            )));
        }
        let mut providers = self.providers.write();
        if providers.contains_key(&name) {
            return Err(EngineError::DuplicateProvider(name));
        }
        providers.insert(
            name.clone(),
            Arc::new(TypedProvider {
                name: name.clone(),
                reconciler,
                sink,
            }),
        );
        debug!(provider = %name, "Registered effect provider");
        Ok(ProviderHandle {
            name: Arc::from(name.as_str()),
            _marker: PhantomData,
        })
    }

    pub(crate) fn get(&self, name: &str) -> Option<Arc<dyn ErasedProvider>> {
        self.providers.read().get(name).cloned()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.providers.read().contains_key(name)
    }

    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.providers.read().keys().cloned().collect();
        names.sort();
        names
    }
}

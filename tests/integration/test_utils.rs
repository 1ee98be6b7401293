//! Shared fixtures: an in-memory "table" behind a recording sink, and
//! environment helpers.

use async_trait::async_trait;
use parking_lot::Mutex;
use settle::config::SettleConfig;
use settle::effect::{ApplyError, ProviderHandle, Sink, SinkItem, ValueAction, ValueReconciler};
use settle::store::SledStateStore;
use settle::Environment;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

pub type TableReconciler = ValueReconciler<String, String>;
pub type TableAction = ValueAction<String>;

/// Which action kinds a sink saw, in order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Applied {
    Create,
    Upsert,
    Delete,
}

#[derive(Default)]
struct TableState {
    rows: BTreeMap<String, String>,
    log: Vec<(String, Applied)>,
    batches: Vec<usize>,
    fail_keys: BTreeSet<String>,
    fail_all: bool,
}

/// External table with scriptable failures
#[derive(Clone, Default)]
pub struct TableSink {
    state: Arc<Mutex<TableState>>,
}

impl TableSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn rows(&self) -> BTreeMap<String, String> {
        self.state.lock().rows.clone()
    }

    pub fn log(&self) -> Vec<(String, Applied)> {
        self.state.lock().log.clone()
    }

    pub fn batches(&self) -> Vec<usize> {
        self.state.lock().batches.clone()
    }

    pub fn clear_log(&self) {
        let mut state = self.state.lock();
        state.log.clear();
        state.batches.clear();
    }

    pub fn fail_key(&self, key: &str) {
        self.state.lock().fail_keys.insert(key.to_string());
    }

    pub fn fail_everything(&self, fail: bool) {
        self.state.lock().fail_all = fail;
    }

    pub fn heal(&self) {
        let mut state = self.state.lock();
        state.fail_keys.clear();
        state.fail_all = false;
    }
}

#[async_trait]
impl Sink for TableSink {
    type Key = String;
    type Action = TableAction;

    async fn apply(&self, batch: Vec<SinkItem<String, TableAction>>) -> Result<(), ApplyError> {
        let mut state = self.state.lock();
        state.batches.push(batch.len());
        if state.fail_all {
            return Err(ApplyError::all("table unavailable"));
        }
        let mut failed = Vec::new();
        for (index, item) in batch.into_iter().enumerate() {
            if state.fail_keys.contains(&item.key) {
                failed.push(index);
                continue;
            }
            let kind = match item.action {
                ValueAction::Create(value) => {
                    state.rows.insert(item.key.clone(), value);
                    Applied::Create
                }
                ValueAction::Upsert(value) => {
                    state.rows.insert(item.key.clone(), value);
                    Applied::Upsert
                }
                ValueAction::Delete => {
                    state.rows.remove(&item.key);
                    Applied::Delete
                }
            };
            state.log.push((item.key, kind));
        }
        if failed.is_empty() {
            Ok(())
        } else {
            Err(ApplyError::partial("row rejected", failed))
        }
    }
}

pub fn temp_env() -> Environment {
    Environment::open_temporary().unwrap()
}

/// Environment over a shared store, so several "processes" see the same state.
pub fn env_over(store: &Arc<SledStateStore>, config: SettleConfig) -> Environment {
    Environment::with_store(config, store.clone())
}

pub fn shared_store() -> Arc<SledStateStore> {
    Arc::new(SledStateStore::temporary().unwrap())
}

pub fn table(env: &Environment, sink: &TableSink) -> ProviderHandle<TableReconciler> {
    env.register_effect_provider("table", TableReconciler::new(), sink.clone())
        .unwrap()
}

//! An unreachable store stops the run before anything else is written

use super::test_utils::{table, TableSink};
use settle::config::SettleConfig;
use settle::store::{Keyspace, SledStateStore, StateStore};
use settle::{EngineError, Environment, FunctionSpec, RunState, ScopeContext, StorageError};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

/// Sled store whose writes fail with an I/O error while `down` is set.
struct FlakyDisk {
    inner: SledStateStore,
    down: AtomicBool,
    refused: AtomicUsize,
}

impl FlakyDisk {
    fn new() -> Self {
        Self {
            inner: SledStateStore::temporary().unwrap(),
            down: AtomicBool::new(false),
            refused: AtomicUsize::new(0),
        }
    }
}

impl StateStore for FlakyDisk {
    fn get(&self, space: Keyspace, key: &[u8]) -> Result<Option<Vec<u8>>, StorageError> {
        self.inner.get(space, key)
    }

    fn compare_and_swap(
        &self,
        space: Keyspace,
        key: &[u8],
        expected: Option<&[u8]>,
        new: Option<&[u8]>,
    ) -> Result<bool, StorageError> {
        if self.down.load(Ordering::SeqCst) {
            self.refused.fetch_add(1, Ordering::SeqCst);
            return Err(StorageError::Io("device not ready".to_string()));
        }
        self.inner.compare_and_swap(space, key, expected, new)
    }

    fn scan_prefix(&self, space: Keyspace, prefix: &[u8]) -> Result<Vec<(Vec<u8>, Vec<u8>)>, StorageError> {
        self.inner.scan_prefix(space, prefix)
    }

    fn len(&self, space: Keyspace) -> Result<usize, StorageError> {
        self.inner.len(space)
    }

    fn flush(&self) -> Result<(), StorageError> {
        self.inner.flush()
    }
}

#[tokio::test(flavor = "multi_thread")]
async fn test_storage_error_fails_run_and_stops_writes() {
    let disk = Arc::new(FlakyDisk::new());
    let env = Environment::with_store(SettleConfig::default(), disk.clone());
    let sink = TableSink::new();
    let rows = table(&env, &sink);
    let put = env
        .define_sync(FunctionSpec::new("put", "declare(k, v)"), move |ctx: &ScopeContext, v: String| {
            ctx.declare(rows.exists(&"k".to_string(), v)?)?;
            Ok(())
        })
        .unwrap();

    disk.down.store(true, Ordering::SeqCst);
    let f = put.clone();
    let report = env
        .run(move |ctx| async move {
            ctx.mount("s", &f, "v".to_string()).result().await?;
            anyhow::Ok(())
        })
        .await;

    assert_eq!(report.state, RunState::Failed);
    assert!(report
        .failures
        .iter()
        .any(|f| matches!(f.error, EngineError::Storage(StorageError::Io(_)))));
    // The first refused write (the apply intent) is also the last one attempted.
    assert_eq!(disk.refused.load(Ordering::SeqCst), 1);
    assert!(sink.batches().is_empty());
    assert_eq!(env.records().count(Keyspace::MemoEntries).unwrap(), 0);
    assert_eq!(env.records().count(Keyspace::ScopeRecords).unwrap(), 0);

    // Once the store is back the same work commits.
    disk.down.store(false, Ordering::SeqCst);
    let report = env
        .run(move |ctx| async move {
            ctx.mount("s", &put, "v".to_string()).result().await?;
            anyhow::Ok(())
        })
        .await;
    assert!(report.succeeded(), "{:?}", report.failures);
    assert_eq!(sink.rows().get("k").map(String::as_str), Some("v"));
}

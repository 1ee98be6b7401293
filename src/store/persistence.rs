//! Sled-backed state store

use crate::error::StorageError;
use crate::store::{Keyspace, StateStore};
use sled::{Db, Tree};
use std::path::Path;
use tracing::debug;

/// One sled tree per keyspace in a single database.
#[derive(Clone)]
pub struct SledStateStore {
    db: Db,
    memo_entries: Tree,
    scope_records: Tree,
    tracked_effects: Tree,
}

impl SledStateStore {
    /// Open (or create) a database at `path`.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, StorageError> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let db = sled::open(path)?;
        debug!(path = %path.display(), "Opened state store");
        Self::from_db(db)
    }

    /// Database that is deleted when the last handle is dropped.
    pub fn temporary() -> Result<Self, StorageError> {
        let db = sled::Config::new().temporary(true).open()?;
        Self::from_db(db)
    }

    pub fn from_db(db: Db) -> Result<Self, StorageError> {
        let memo_entries = db.open_tree(Keyspace::MemoEntries.tree_name())?;
        let scope_records = db.open_tree(Keyspace::ScopeRecords.tree_name())?;
        let tracked_effects = db.open_tree(Keyspace::TrackedEffects.tree_name())?;
        Ok(Self {
            db,
            memo_entries,
            scope_records,
            tracked_effects,
        })
    }

    fn tree(&self, space: Keyspace) -> &Tree {
        match space {
            Keyspace::MemoEntries => &self.memo_entries,
            Keyspace::ScopeRecords => &self.scope_records,
            Keyspace::TrackedEffects => &self.tracked_effects,
        }
    }
}

impl StateStore for SledStateStore {
    fn get(&self, space: Keyspace, key: &[u8]) -> Result<Option<Vec<u8>>, StorageError> {
        Ok(self.tree(space).get(key)?.map(|v| v.to_vec()))
    }

    fn compare_and_swap(
        &self,
        space: Keyspace,
        key: &[u8],
        expected: Option<&[u8]>,
        new: Option<&[u8]>,
    ) -> Result<bool, StorageError> {
        let outcome = self.tree(space).compare_and_swap(key, expected, new)?;
        Ok(outcome.is_ok())
    }

    fn scan_prefix(
        &self,
        space: Keyspace,
        prefix: &[u8],
    ) -> Result<Vec<(Vec<u8>, Vec<u8>)>, StorageError> {
        let mut out = Vec::new();
        for item in self.tree(space).scan_prefix(prefix) {
            let (key, value) = item?;
            out.push((key.to_vec(), value.to_vec()));
        }
        Ok(out)
    }

    fn len(&self, space: Keyspace) -> Result<usize, StorageError> {
        Ok(self.tree(space).len())
    }

    fn flush(&self) -> Result<(), StorageError> {
        self.db.flush()?;
        Ok(())
    }
}

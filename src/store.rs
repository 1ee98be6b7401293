//! Durable state store
//!
//! Three keyspaces hold everything the engine persists between runs:
//! memo entries (by memo key), scope records (by encoded scope path, so a
//! prefix scan is a subtree scan) and tracked effects (by encoded effect key).
//! Values are JSON. Every mutation the engine makes goes through
//! compare-and-swap against the bytes it read.

pub mod persistence;
pub mod records;

pub use persistence::SledStateStore;
pub use records::{ScopeRecord, TrackedEffect};

use crate::effect::EffectKey;
use crate::error::StorageError;
use crate::memo::MemoEntry;
use crate::scope::ScopePath;
use crate::types::MemoKey;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::sync::Arc;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Keyspace {
    MemoEntries,
    ScopeRecords,
    TrackedEffects,
}

impl Keyspace {
    pub const ALL: [Keyspace; 3] = [
        Keyspace::MemoEntries,
        Keyspace::ScopeRecords,
        Keyspace::TrackedEffects,
    ];

    pub fn tree_name(self) -> &'static str {
        match self {
            Keyspace::MemoEntries => "memo_entries",
            Keyspace::ScopeRecords => "scope_records",
            Keyspace::TrackedEffects => "tracked_effects",
        }
    }
}

/// Raw key-value store interface
pub trait StateStore: Send + Sync {
    fn get(&self, space: Keyspace, key: &[u8]) -> Result<Option<Vec<u8>>, StorageError>;

    /// Replace `expected` with `new` atomically. `None` means absent on either
    /// side. Returns `Ok(false)` when the stored value did not match.
    fn compare_and_swap(
        &self,
        space: Keyspace,
        key: &[u8],
        expected: Option<&[u8]>,
        new: Option<&[u8]>,
    ) -> Result<bool, StorageError>;

    fn scan_prefix(
        &self,
        space: Keyspace,
        prefix: &[u8],
    ) -> Result<Vec<(Vec<u8>, Vec<u8>)>, StorageError>;

    fn len(&self, space: Keyspace) -> Result<usize, StorageError>;

    fn flush(&self) -> Result<(), StorageError>;
}

/// A decoded record together with the bytes it was decoded from.
#[derive(Debug, Clone)]
pub struct Versioned<T> {
    pub value: T,
    raw: Vec<u8>,
}

impl<T> Versioned<T> {
    pub fn raw(&self) -> &[u8] {
        &self.raw
    }
}

/// Typed access to the three keyspaces
#[derive(Clone)]
pub struct Records {
    store: Arc<dyn StateStore>,
}

impl Records {
    pub fn new(store: Arc<dyn StateStore>) -> Self {
        Self { store }
    }

    fn get_json<T: DeserializeOwned>(
        &self,
        space: Keyspace,
        key: &[u8],
    ) -> Result<Option<Versioned<T>>, StorageError> {
        let Some(raw) = self.store.get(space, key)? else {
            return Ok(None);
        };
        let value = serde_json::from_slice(&raw)?;
        Ok(Some(Versioned { value, raw }))
    }

    fn swap_json<T: Serialize>(
        &self,
        space: Keyspace,
        key: &[u8],
        expected: Option<&[u8]>,
        new: Option<&T>,
    ) -> Result<Option<Vec<u8>>, StorageError> {
        let encoded = new.map(serde_json::to_vec).transpose()?;
        let swapped = self
            .store
            .compare_and_swap(space, key, expected, encoded.as_deref())?;
        if !swapped {
            return Err(StorageError::CasConflict {
                keyspace: space.tree_name(),
                key: hex::encode(key),
            });
        }
        Ok(encoded)
    }

    fn scan_json<T: DeserializeOwned>(
        &self,
        space: Keyspace,
        prefix: &[u8],
    ) -> Result<Vec<Versioned<T>>, StorageError> {
        self.store
            .scan_prefix(space, prefix)?
            .into_iter()
            .map(|(_, raw)| -> Result<Versioned<T>, StorageError> {
                let value = serde_json::from_slice(&raw)?;
                Ok(Versioned { value, raw })
            })
            .collect()
    }

    pub fn memo_entry(&self, key: &MemoKey) -> Result<Option<Versioned<MemoEntry>>, StorageError> {
        self.get_json(Keyspace::MemoEntries, key.as_bytes())
    }

    /// Replace the memo entry read as `expected` (raw bytes, `None` if absent).
    pub fn swap_memo_entry(
        &self,
        key: &MemoKey,
        expected: Option<&[u8]>,
        new: Option<&MemoEntry>,
    ) -> Result<(), StorageError> {
        self.swap_json(Keyspace::MemoEntries, key.as_bytes(), expected, new)
            .map(|_| ())
    }

    /// Unconditional removal, for entries of scopes being purged.
    pub fn remove_memo_entry(&self, key: &MemoKey) -> Result<(), StorageError> {
        let current = self.store.get(Keyspace::MemoEntries, key.as_bytes())?;
        if let Some(current) = current {
            self.store
                .compare_and_swap(Keyspace::MemoEntries, key.as_bytes(), Some(&current), None)?;
        }
        Ok(())
    }

    pub fn scope_record(&self, path: &ScopePath) -> Result<Option<Versioned<ScopeRecord>>, StorageError> {
        self.get_json(Keyspace::ScopeRecords, &path.encode())
    }

    /// Every scope record at or beneath `path`, in path order.
    pub fn scope_records_under(&self, path: &ScopePath) -> Result<Vec<ScopeRecord>, StorageError> {
        Ok(self
            .scan_json::<ScopeRecord>(Keyspace::ScopeRecords, &path.encode())?
            .into_iter()
            .map(|v| v.value)
            .collect())
    }

    pub fn put_scope_record(&self, record: &ScopeRecord) -> Result<(), StorageError> {
        let key = record.path.encode();
        let current = self.store.get(Keyspace::ScopeRecords, &key)?;
        self.swap_json(Keyspace::ScopeRecords, &key, current.as_deref(), Some(record))
            .map(|_| ())
    }

    pub fn remove_scope_record(&self, path: &ScopePath) -> Result<(), StorageError> {
        let key = path.encode();
        if let Some(current) = self.store.get(Keyspace::ScopeRecords, &key)? {
            self.store
                .compare_and_swap(Keyspace::ScopeRecords, &key, Some(&current), None)?;
        }
        Ok(())
    }

    pub fn tracked_effect(&self, key: &EffectKey) -> Result<Option<Versioned<TrackedEffect>>, StorageError> {
        self.get_json(Keyspace::TrackedEffects, &key.encode())
    }

    /// Replace a tracked effect, returning the raw bytes now stored.
    pub fn swap_tracked_effect(
        &self,
        key: &EffectKey,
        expected: Option<&[u8]>,
        new: Option<&TrackedEffect>,
    ) -> Result<Option<Vec<u8>>, StorageError> {
        self.swap_json(Keyspace::TrackedEffects, &key.encode(), expected, new)
    }

    /// Tracked effects of one provider, or of all providers.
    pub fn tracked_effects(&self, provider: Option<&str>) -> Result<Vec<TrackedEffect>, StorageError> {
        let prefix = provider.map(EffectKey::provider_prefix).unwrap_or_default();
        Ok(self
            .scan_json::<TrackedEffect>(Keyspace::TrackedEffects, &prefix)?
            .into_iter()
            .map(|v| v.value)
            .collect())
    }

    pub fn count(&self, space: Keyspace) -> Result<usize, StorageError> {
        self.store.len(space)
    }

    pub fn flush(&self) -> Result<(), StorageError> {
        self.store.flush()
    }
}

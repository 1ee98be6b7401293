//! Per-run mount table
//!
//! Records every scope mounted during one run and how its body finished. The
//! table answers two questions: is a mount a duplicate, and is a persisted
//! scope from an earlier run now an orphan.

use crate::error::EngineError;
use crate::scope::ScopePath;
use parking_lot::Mutex;
use std::collections::HashMap;

/// How a mounted scope's body finished in this run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScopeOutcome {
    /// Mounted, body not finished yet.
    Running,
    /// Body executed to completion in this run.
    Executed,
    /// Body skipped: a valid memo entry was reused.
    Hit,
    Failed,
    Cancelled,
}

impl ScopeOutcome {
    /// Only a body that actually ran to completion re-declared its whole
    /// subtree; children it did not mount are gone.
    pub fn prunes_unmounted_children(self) -> bool {
        matches!(self, ScopeOutcome::Executed)
    }
}

#[derive(Default)]
pub struct MountTable {
    entries: Mutex<HashMap<ScopePath, ScopeOutcome>>,
}

impl MountTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Claim a path for this run. A second claim is a duplicate mount.
    pub fn claim(&self, path: &ScopePath) -> Result<(), EngineError> {
        let mut entries = self.entries.lock();
        if entries.contains_key(path) {
            return Err(EngineError::DuplicateMount(path.clone()));
        }
        entries.insert(path.clone(), ScopeOutcome::Running);
        Ok(())
    }

    pub fn set_outcome(&self, path: &ScopePath, outcome: ScopeOutcome) {
        self.entries.lock().insert(path.clone(), outcome);
    }

    pub fn outcome(&self, path: &ScopePath) -> Option<ScopeOutcome> {
        self.entries.lock().get(path).copied()
    }

    pub fn is_mounted(&self, path: &ScopePath) -> bool {
        self.entries.lock().contains_key(path)
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }

    /// Nearest proper ancestor of `path` that was mounted in this run.
    pub fn nearest_mounted_ancestor(&self, path: &ScopePath) -> Option<(ScopePath, ScopeOutcome)> {
        let entries = self.entries.lock();
        path.ancestors()
            .find_map(|ancestor| entries.get(&ancestor).map(|o| (ancestor, *o)))
    }

    /// A persisted scope is an orphan when this run did not mount it and the
    /// closest mounted ancestor executed its body to completion without it.
    pub fn is_orphan(&self, path: &ScopePath) -> bool {
        if self.is_mounted(path) {
            return false;
        }
        self.nearest_mounted_ancestor(path)
            .map(|(_, outcome)| outcome.prunes_unmounted_children())
            .unwrap_or(false)
    }
}

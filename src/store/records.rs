//! Persisted scope ownership and effect tracking records

use crate::effect::{Desired, EffectKey, PrevState};
use crate::scope::ScopePath;
use crate::types::{now_millis, MemoKey};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeSet;

/// What a scope used and owned as of its last committed execution.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScopeRecord {
    pub path: ScopePath,
    #[serde(default)]
    pub memo_keys: BTreeSet<MemoKey>,
    #[serde(default)]
    pub effect_keys: BTreeSet<EffectKey>,
    pub updated_at_ms: u64,
}

impl ScopeRecord {
    pub fn new(path: ScopePath) -> Self {
        Self {
            path,
            memo_keys: BTreeSet::new(),
            effect_keys: BTreeSet::new(),
            updated_at_ms: now_millis(),
        }
    }
}

/// Last known state of one external resource
///
/// `pending` marks an apply that was started and never confirmed; its
/// `possible_states` then hold both the state before and the intended one.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrackedEffect {
    pub key: EffectKey,
    pub owner: ScopePath,
    pub possible_states: Vec<Desired<Value>>,
    pub pending: bool,
    pub updated_at_ms: u64,
}

impl TrackedEffect {
    /// A confirmed single state.
    pub fn settled(key: EffectKey, owner: ScopePath, state: Desired<Value>) -> Self {
        Self {
            key,
            owner,
            possible_states: vec![state],
            pending: false,
            updated_at_ms: now_millis(),
        }
    }

    /// Record the intent to move to `new_state` before the apply runs.
    pub fn intent(
        current: Option<&TrackedEffect>,
        key: EffectKey,
        owner: ScopePath,
        new_state: Desired<Value>,
    ) -> Self {
        let mut possible_states = match current {
            Some(record) => record.possible_states.clone(),
            None => vec![Desired::NonExistence],
        };
        if !possible_states.contains(&new_state) {
            possible_states.push(new_state);
        }
        Self {
            key,
            owner,
            possible_states,
            pending: true,
            updated_at_ms: now_millis(),
        }
    }

    /// Prior state as seen by a reconciler.
    pub fn prev_state(record: Option<&TrackedEffect>) -> PrevState<Value> {
        match record {
            None => PrevState::absent(),
            Some(record) => {
                PrevState::ambiguous(record.possible_states.iter().cloned(), record.pending)
            }
        }
    }
}

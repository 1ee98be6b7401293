//! Persisted memo entry and the reuse decision

use crate::effect::EffectKey;
use crate::memo::input::StateValidator;
use crate::scope::ScopePath;
use crate::types::{InputFingerprint, LogicFingerprint, MemoKey};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeSet;

/// Cached outcome of one memoized invocation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MemoEntry {
    pub memo_key: MemoKey,
    pub path: ScopePath,
    pub function: String,
    pub logic_fingerprint: LogicFingerprint,
    pub input_fingerprint: InputFingerprint,
    /// One opaque state per validator, in validator order.
    #[serde(default)]
    pub states: Vec<Value>,
    pub result: Value,
    #[serde(default)]
    pub effect_keys: BTreeSet<EffectKey>,
    /// Entries of calls made inside this one, transitively. A hit keeps them
    /// alive in the scope record.
    #[serde(default)]
    pub nested_memo_keys: BTreeSet<MemoKey>,
    pub committed_at_ms: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MissReason {
    NoEntry,
    LogicChanged,
    InputChanged,
    StateInvalid,
}

impl MissReason {
    pub fn as_str(self) -> &'static str {
        match self {
            MissReason::NoEntry => "no_entry",
            MissReason::LogicChanged => "logic_changed",
            MissReason::InputChanged => "input_changed",
            MissReason::StateInvalid => "state_invalid",
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum MemoDecision {
    /// Skip execution. `states` are the validators' updated states.
    Reuse { states: Vec<Value>, states_changed: bool },
    /// Execute the body; `states` go into the new entry.
    Execute { reason: MissReason, states: Vec<Value> },
}

/// Decide whether `prior` can stand in for executing the function
///
/// With validators, a usable entry (same logic, one stored state per
/// validator) is reused iff every validator reports valid; the raw input
/// fingerprint is not consulted. Without validators the input fingerprint must
/// match exactly. Validators always run, with `None` when there is no usable
/// entry, so their states can be stored either way.
pub fn evaluate(
    prior: Option<&MemoEntry>,
    logic: &LogicFingerprint,
    input: &InputFingerprint,
    validators: &[&dyn StateValidator],
) -> anyhow::Result<MemoDecision> {
    let logic_reason = match prior {
        None => Some(MissReason::NoEntry),
        Some(entry) if entry.logic_fingerprint != *logic => Some(MissReason::LogicChanged),
        Some(_) => None,
    };

    if validators.is_empty() {
        let reason = logic_reason.or_else(|| match prior {
            Some(entry) if entry.input_fingerprint != *input => Some(MissReason::InputChanged),
            _ => None,
        });
        return Ok(match reason {
            Some(reason) => MemoDecision::Execute {
                reason,
                states: Vec::new(),
            },
            None => MemoDecision::Reuse {
                states: Vec::new(),
                states_changed: false,
            },
        });
    }

    let usable = match (prior, logic_reason) {
        (Some(entry), None) if entry.states.len() == validators.len() => Some(entry),
        _ => None,
    };

    let Some(entry) = usable else {
        let states = validators
            .iter()
            .map(|v| v.validate(None).map(|outcome| outcome.state))
            .collect::<anyhow::Result<Vec<_>>>()?;
        return Ok(MemoDecision::Execute {
            reason: logic_reason.unwrap_or(MissReason::InputChanged),
            states,
        });
    };

    let mut states = Vec::with_capacity(validators.len());
    let mut all_valid = true;
    for (validator, prev) in validators.iter().zip(&entry.states) {
        let outcome = validator.validate(Some(prev))?;
        all_valid &= outcome.valid;
        states.push(outcome.state);
    }

    if all_valid {
        let states_changed = states != entry.states;
        Ok(MemoDecision::Reuse {
            states,
            states_changed,
        })
    } else {
        Ok(MemoDecision::Execute {
            reason: MissReason::StateInvalid,
            states,
        })
    }
}

//! Reconciler contract: desired value + ambiguous prior state -> action + new state

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

/// Desired (or recorded) state of a resource: a value, or the sentinel
/// meaning the resource must not exist.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Desired<T> {
    Exists(T),
    NonExistence,
}

impl<T> Desired<T> {
    pub fn is_non_existence(&self) -> bool {
        matches!(self, Desired::NonExistence)
    }

    pub fn as_ref(&self) -> Desired<&T> {
        match self {
            Desired::Exists(v) => Desired::Exists(v),
            Desired::NonExistence => Desired::NonExistence,
        }
    }

    pub fn value(&self) -> Option<&T> {
        match self {
            Desired::Exists(v) => Some(v),
            Desired::NonExistence => None,
        }
    }

    pub fn map<U>(self, f: impl FnOnce(T) -> U) -> Desired<U> {
        match self {
            Desired::Exists(v) => Desired::Exists(f(v)),
            Desired::NonExistence => Desired::NonExistence,
        }
    }

    pub fn try_map<U, E>(self, f: impl FnOnce(T) -> Result<U, E>) -> Result<Desired<U>, E> {
        match self {
            Desired::Exists(v) => Ok(Desired::Exists(f(v)?)),
            Desired::NonExistence => Ok(Desired::NonExistence),
        }
    }
}

impl<T> From<Option<T>> for Desired<T> {
    fn from(value: Option<T>) -> Self {
        match value {
            Some(v) => Desired::Exists(v),
            None => Desired::NonExistence,
        }
    }
}

/// What is known about a resource before reconciliation
///
/// `possible_states` is an unordered, deduplicated, non-empty set: more than one
/// member means an earlier apply may or may not have landed. `may_be_missing`
/// means absence of a record does not prove the resource is absent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PrevState<S> {
    possible_states: Vec<Desired<S>>,
    pub may_be_missing: bool,
}

impl<S: PartialEq> PrevState<S> {
    /// Nothing recorded and nothing in doubt: the resource does not exist.
    pub fn absent() -> Self {
        Self {
            possible_states: vec![Desired::NonExistence],
            may_be_missing: false,
        }
    }

    /// Exactly one recorded state, confirmed applied.
    pub fn known(state: Desired<S>) -> Self {
        Self {
            possible_states: vec![state],
            may_be_missing: false,
        }
    }

    /// Several plausible states. An empty input degrades to "absent, maybe missing".
    pub fn ambiguous(states: impl IntoIterator<Item = Desired<S>>, may_be_missing: bool) -> Self {
        let mut possible_states: Vec<Desired<S>> = Vec::new();
        for state in states {
            if !possible_states.contains(&state) {
                possible_states.push(state);
            }
        }
        if possible_states.is_empty() {
            return Self {
                possible_states: vec![Desired::NonExistence],
                may_be_missing: true,
            };
        }
        Self {
            possible_states,
            may_be_missing,
        }
    }

    pub fn possible_states(&self) -> &[Desired<S>] {
        &self.possible_states
    }

    pub fn is_ambiguous(&self) -> bool {
        self.possible_states.len() > 1
    }

    /// Every plausible prior state equals `state`, and nothing is in doubt.
    pub fn certainly(&self, state: &Desired<S>) -> bool {
        !self.may_be_missing && self.possible_states.iter().all(|s| s == state)
    }

    /// The resource is known not to exist.
    pub fn certainly_absent(&self) -> bool {
        self.certainly(&Desired::NonExistence)
    }

    pub fn try_map<U: PartialEq, E>(
        self,
        mut f: impl FnMut(S) -> Result<U, E>,
    ) -> Result<PrevState<U>, E> {
        let states = self
            .possible_states
            .into_iter()
            .map(|s| s.try_map(&mut f))
            .collect::<Result<Vec<_>, E>>()?;
        Ok(PrevState::ambiguous(states, self.may_be_missing))
    }
}

/// Reconciler output. `action: None` is a no-op.
#[derive(Debug, Clone, PartialEq)]
pub struct Reconciliation<A, S> {
    pub action: Option<A>,
    pub new_state: Desired<S>,
}

impl<A, S> Reconciliation<A, S> {
    pub fn noop(new_state: Desired<S>) -> Self {
        Self {
            action: None,
            new_state,
        }
    }

    pub fn apply(action: A, new_state: Desired<S>) -> Self {
        Self {
            action: Some(action),
            new_state,
        }
    }
}

/// Deterministic, pure reconciliation logic for one provider
///
/// Implementations must uphold:
/// - identical inputs give identical outputs (safe retry after a crash);
/// - `desired == NonExistence` yields a delete and a `NonExistence` new state;
/// - when the resource certainly matches `desired`, the action is a no-op;
/// - one action converges from every member of `prev.possible_states()`;
/// - with `prev.may_be_missing`, the action is safe whether or not the
///   resource exists (upsert, idempotent delete).
pub trait Reconciler: Send + Sync + 'static {
    type Key: Serialize + DeserializeOwned + Clone + Send + Sync + 'static;
    type Value: Serialize + DeserializeOwned + Clone + Send + Sync + 'static;
    type State: Serialize + DeserializeOwned + Clone + PartialEq + Send + Sync + 'static;
    type Action: Send + Sync + 'static;

    fn reconcile(
        &self,
        key: &Self::Key,
        desired: &Desired<Self::Value>,
        prev: &PrevState<Self::State>,
    ) -> Reconciliation<Self::Action, Self::State>;
}

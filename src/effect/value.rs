//! Whole-value reconciler
//!
//! Reconciles targets whose state is the full value last written (a row, a
//! document, a file). Emits `Create` only when absence is certain; any doubt
//! yields an `Upsert` or an idempotent `Delete`.

use crate::effect::reconciler::{Desired, PrevState, Reconciler, Reconciliation};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::marker::PhantomData;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ValueAction<V> {
    /// Insert; the resource is known not to exist.
    Create(V),
    /// Insert or overwrite.
    Upsert(V),
    /// Remove if present.
    Delete,
}

pub struct ValueReconciler<K, V> {
    _marker: PhantomData<fn() -> (K, V)>,
}

impl<K, V> ValueReconciler<K, V> {
    pub fn new() -> Self {
        Self {
            _marker: PhantomData,
        }
    }
}

impl<K, V> Default for ValueReconciler<K, V> {
    fn default() -> Self {
        Self::new()
    }
}

impl<K, V> Reconciler for ValueReconciler<K, V>
where
    K: Serialize + DeserializeOwned + Clone + Send + Sync + 'static,
    V: Serialize + DeserializeOwned + Clone + PartialEq + Send + Sync + 'static,
{
    type Key = K;
    type Value = V;
    type State = V;
    type Action = ValueAction<V>;

    fn reconcile(
        &self,
        _key: &K,
        desired: &Desired<V>,
        prev: &PrevState<V>,
    ) -> Reconciliation<ValueAction<V>, V> {
        if prev.certainly(desired) {
            return Reconciliation::noop(desired.clone());
        }
        match desired {
            Desired::Exists(value) if prev.certainly_absent() => {
                Reconciliation::apply(ValueAction::Create(value.clone()), desired.clone())
            }
            Desired::Exists(value) => {
                Reconciliation::apply(ValueAction::Upsert(value.clone()), desired.clone())
            }
            Desired::NonExistence => {
                Reconciliation::apply(ValueAction::Delete, Desired::NonExistence)
            }
        }
    }
}

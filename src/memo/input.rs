//! Input capabilities for memoized invocations
//!
//! Every argument type implements [`MemoInput`]. By default an input is
//! identified by its structural hash; an input can instead supply a custom key,
//! and can attach [`StateValidator`]s that decide reuse from cheap external
//! state (an mtime, an etag) rather than from the input value itself.

use crate::hashing::{combine_keys, custom_key_hash, structural_hash};
use crate::types::{Hash, InputFingerprint};
use serde::{Serialize, Serializer};
use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::ops::Deref;
use std::path::PathBuf;

/// Outcome of one validator call.
#[derive(Debug, Clone, PartialEq)]
pub struct Validation {
    /// State to persist for the next check, regardless of `valid`.
    pub state: Value,
    pub valid: bool,
}

impl Validation {
    pub fn valid(state: Value) -> Self {
        Self { state, valid: true }
    }

    pub fn invalid(state: Value) -> Self {
        Self { state, valid: false }
    }
}

/// Checks whether a cached result is still valid against external state
pub trait StateValidator: Send + Sync {
    /// `prev` is the state stored with the entry, or `None` if there is no
    /// usable entry.
    fn validate(&self, prev: Option<&Value>) -> anyhow::Result<Validation>;
}

impl<F> StateValidator for F
where
    F: Fn(Option<&Value>) -> anyhow::Result<Validation> + Send + Sync,
{
    fn validate(&self, prev: Option<&Value>) -> anyhow::Result<Validation> {
        self(prev)
    }
}

/// Argument type of a memoized function
pub trait MemoInput: Serialize {
    /// Key replacing the structural hash in the memo key.
    fn custom_key(&self) -> Option<Hash> {
        None
    }

    /// Append this input's validators, in a stable order.
    fn collect_validators<'a>(&'a self, _out: &mut Vec<&'a dyn StateValidator>) {}
}

/// Identity of one set of arguments
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InputIdentity {
    pub fingerprint: InputFingerprint,
    /// Custom key if supplied, else the fingerprint bytes.
    pub key: Hash,
}

pub fn identify<A: MemoInput + ?Sized>(args: &A) -> Result<InputIdentity, serde_json::Error> {
    let fingerprint = structural_hash(args)?;
    let key = args.custom_key().unwrap_or(fingerprint.0);
    Ok(InputIdentity { fingerprint, key })
}

pub fn validators_of<A: MemoInput + ?Sized>(args: &A) -> Vec<&dyn StateValidator> {
    let mut out = Vec::new();
    args.collect_validators(&mut out);
    out
}

macro_rules! plain_input {
    ($($ty:ty),* $(,)?) => {
        $(impl MemoInput for $ty {})*
    };
}

plain_input!(
    (),
    bool,
    char,
    u8,
    u16,
    u32,
    u64,
    u128,
    usize,
    i8,
    i16,
    i32,
    i64,
    i128,
    isize,
    f32,
    f64,
    String,
    str,
    PathBuf,
    Value,
);

impl<T: MemoInput + ?Sized> MemoInput for &T {
    fn custom_key(&self) -> Option<Hash> {
        (**self).custom_key()
    }

    fn collect_validators<'a>(&'a self, out: &mut Vec<&'a dyn StateValidator>) {
        (**self).collect_validators(out)
    }
}

impl<T: MemoInput + ?Sized> MemoInput for Box<T> {
    fn custom_key(&self) -> Option<Hash> {
        (**self).custom_key()
    }

    fn collect_validators<'a>(&'a self, out: &mut Vec<&'a dyn StateValidator>) {
        (**self).collect_validators(out)
    }
}

impl<T: MemoInput> MemoInput for Option<T> {
    fn custom_key(&self) -> Option<Hash> {
        self.as_ref().and_then(MemoInput::custom_key)
    }

    fn collect_validators<'a>(&'a self, out: &mut Vec<&'a dyn StateValidator>) {
        if let Some(inner) = self {
            inner.collect_validators(out);
        }
    }
}

impl<T: MemoInput> MemoInput for Vec<T> {
    fn collect_validators<'a>(&'a self, out: &mut Vec<&'a dyn StateValidator>) {
        for item in self {
            item.collect_validators(out);
        }
    }
}

impl<T: MemoInput> MemoInput for [T] {
    fn collect_validators<'a>(&'a self, out: &mut Vec<&'a dyn StateValidator>) {
        for item in self {
            item.collect_validators(out);
        }
    }
}

impl<K: Serialize + Ord, V: MemoInput> MemoInput for BTreeMap<K, V> {
    fn collect_validators<'a>(&'a self, out: &mut Vec<&'a dyn StateValidator>) {
        for value in self.values() {
            value.collect_validators(out);
        }
    }
}

// Hash containers carry no validators: their iteration order is not stable.
impl<K: Serialize + Eq + std::hash::Hash, V: Serialize> MemoInput for HashMap<K, V> {}
impl<T: Serialize + Eq + std::hash::Hash> MemoInput for HashSet<T> {}
impl<T: Serialize + Ord> MemoInput for BTreeSet<T> {}

/// Component key for tuple composition: custom key, else structural hash.
fn component_key<T: MemoInput + ?Sized>(value: &T) -> Option<Hash> {
    match value.custom_key() {
        Some(key) => Some(key),
        None => structural_hash(value).ok().map(|fp| fp.0),
    }
}

macro_rules! tuple_input {
    ($($name:ident : $idx:tt),+) => {
        impl<$($name: MemoInput),+> MemoInput for ($($name,)+) {
            fn custom_key(&self) -> Option<Hash> {
                if $(self.$idx.custom_key().is_none())&&+ {
                    return None;
                }
                let parts = [$(component_key(&self.$idx)?),+];
                Some(combine_keys(&parts))
            }

            fn collect_validators<'a>(&'a self, out: &mut Vec<&'a dyn StateValidator>) {
                $(self.$idx.collect_validators(out);)+
            }
        }
    };
}

tuple_input!(A: 0);
tuple_input!(A: 0, B: 1);
tuple_input!(A: 0, B: 1, C: 2);
tuple_input!(A: 0, B: 1, C: 2, D: 3);
tuple_input!(A: 0, B: 1, C: 2, D: 3, E: 4);
tuple_input!(A: 0, B: 1, C: 2, D: 3, E: 4, F: 5);

/// Value identified by a caller-supplied key instead of its contents.
#[derive(Debug, Clone, PartialEq)]
pub struct Keyed<T> {
    pub key: String,
    pub value: T,
}

impl<T> Keyed<T> {
    pub fn new(key: impl Into<String>, value: T) -> Self {
        Self {
            key: key.into(),
            value,
        }
    }

    pub fn into_inner(self) -> T {
        self.value
    }
}

impl<T> Deref for Keyed<T> {
    type Target = T;

    fn deref(&self) -> &T {
        &self.value
    }
}

impl<T: Serialize> Serialize for Keyed<T> {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        self.value.serialize(serializer)
    }
}

impl<T: Serialize> MemoInput for Keyed<T> {
    fn custom_key(&self) -> Option<Hash> {
        Some(custom_key_hash(self.key.as_bytes()))
    }
}

/// Value paired with a validator that decides reuse for it.
pub struct Validated<T, V> {
    pub value: T,
    pub validator: V,
}

impl<T, V> Validated<T, V> {
    pub fn new(value: T, validator: V) -> Self {
        Self { value, validator }
    }

    pub fn into_inner(self) -> T {
        self.value
    }
}

impl<T, V> Deref for Validated<T, V> {
    type Target = T;

    fn deref(&self) -> &T {
        &self.value
    }
}

impl<T: Serialize, V> Serialize for Validated<T, V> {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        self.value.serialize(serializer)
    }
}

impl<T: MemoInput, V: StateValidator> MemoInput for Validated<T, V> {
    fn custom_key(&self) -> Option<Hash> {
        self.value.custom_key()
    }

    fn collect_validators<'a>(&'a self, out: &mut Vec<&'a dyn StateValidator>) {
        out.push(&self.validator);
        self.value.collect_validators(out);
    }
}

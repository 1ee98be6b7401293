//! Effect Reconciliation Protocol
//!
//! Application code declares the desired state of external resources as
//! [`Effect`]s. At the end of a run every declared (or orphaned) effect is
//! reconciled against the persisted, possibly ambiguous, prior state by its
//! provider's [`Reconciler`], and the resulting actions are applied in batches
//! through the provider's [`Sink`].

pub mod provider;
pub mod reconciler;
pub mod sink;
pub mod value;

pub use provider::{ProviderHandle, ProviderRegistry};
pub use reconciler::{Desired, PrevState, Reconciler, Reconciliation};
pub use sink::{ApplyError, Sink, SinkItem};
pub use value::{ValueAction, ValueReconciler};

use crate::error::StorageError;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;

const KEY_SEPARATOR: u8 = 0x00;

/// Globally unique identity of one external resource instance
///
/// `instance` is the canonical JSON text of the provider's typed key.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct EffectKey {
    pub provider: String,
    pub instance: String,
}

impl EffectKey {
    pub fn new(provider: impl Into<String>, instance: impl Into<String>) -> Self {
        Self {
            provider: provider.into(),
            instance: instance.into(),
        }
    }

    /// Storage key: provider, NUL, instance. Prefix-scannable by provider.
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.provider.len() + 1 + self.instance.len());
        out.extend_from_slice(self.provider.as_bytes());
        out.push(KEY_SEPARATOR);
        out.extend_from_slice(self.instance.as_bytes());
        out
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, StorageError> {
        let split = bytes
            .iter()
            .position(|b| *b == KEY_SEPARATOR)
            .ok_or_else(|| StorageError::InvalidKey("effect key without separator".to_string()))?;
        let provider = std::str::from_utf8(&bytes[..split])
            .map_err(|e| StorageError::InvalidKey(e.to_string()))?;
        let instance = std::str::from_utf8(&bytes[split + 1..])
            .map_err(|e| StorageError::InvalidKey(e.to_string()))?;
        Ok(Self::new(provider, instance))
    }

    /// Prefix covering every key of one provider.
    pub fn provider_prefix(provider: &str) -> Vec<u8> {
        let mut out = provider.as_bytes().to_vec();
        out.push(KEY_SEPARATOR);
        out
    }
}

impl fmt::Display for EffectKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.provider, self.instance)
    }
}

/// A declared target state for one resource.
#[derive(Debug, Clone, PartialEq)]
pub struct Effect {
    pub key: EffectKey,
    pub desired: Desired<Value>,
}

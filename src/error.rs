//! Error types for the memoization and reconciliation engine.
//!
//! Every variant is `Clone`: a single failure may have to be delivered to all
//! callers waiting on the same single-flight slot.

use crate::effect::EffectKey;
use crate::scope::ScopePath;
use crate::types::{LogicFingerprint, MemoKey};
use thiserror::Error;

/// Durable store errors. Fatal for the run that hits them.
#[derive(Debug, Clone, Error)]
pub enum StorageError {
    #[error("Store backend error: {0}")]
    Sled(String),

    #[error("Failed to encode or decode record: {0}")]
    Codec(String),

    #[error("Concurrent modification of {keyspace} record {key}")]
    CasConflict { keyspace: &'static str, key: String },

    #[error("Invalid storage key: {0}")]
    InvalidKey(String),

    #[error("Storage I/O error: {0}")]
    Io(String),
}

impl From<sled::Error> for StorageError {
    fn from(err: sled::Error) -> Self {
        StorageError::Sled(err.to_string())
    }
}

impl From<serde_json::Error> for StorageError {
    fn from(err: serde_json::Error) -> Self {
        StorageError::Codec(err.to_string())
    }
}

impl From<std::io::Error> for StorageError {
    fn from(err: std::io::Error) -> Self {
        StorageError::Io(err.to_string())
    }
}

/// Engine errors surfaced on mount handles, calls, and run reports.
#[derive(Debug, Clone, Error)]
pub enum EngineError {
    #[error("Scope {0} was mounted twice in the same run")]
    DuplicateMount(ScopePath),

    #[error("Logic fingerprint conflict for '{function}': {reason}")]
    FingerprintConflict { function: String, reason: String },

    #[error("Logic fingerprint {0} is not registered")]
    FingerprintNotRegistered(LogicFingerprint),

    #[error("State validator failed at {path}: {message}")]
    StateValidatorError { path: ScopePath, message: String },

    #[error("Effect {key} declared by both {first} and {second}")]
    ReconcileConflict {
        key: EffectKey,
        first: ScopePath,
        second: ScopePath,
    },

    #[error("Sink for provider '{provider}' failed to apply {key}: {message}")]
    SinkApplyError {
        provider: String,
        key: EffectKey,
        message: String,
    },

    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("Function '{function}' failed at {path}: {message}")]
    FunctionFailed {
        path: ScopePath,
        function: String,
        message: String,
    },

    #[error("Work at {0} was cancelled")]
    Cancelled(ScopePath),

    #[error("Effect provider not registered: {0}")]
    UnknownProvider(String),

    #[error("Effect provider already registered: {0}")]
    DuplicateProvider(String),

    #[error("Invalid scope path: {0}")]
    InvalidPath(String),

    #[error("Failed to encode or decode value for {context}: {message}")]
    Codec { context: String, message: String },

    #[error("Memo entry {0} is corrupt: {1}")]
    CorruptEntry(MemoKey, String),

    #[error("Configuration error: {0}")]
    Config(String),
}

impl EngineError {
    /// Storage failures abort the whole run; everything else is scoped.
    /// A compare-and-swap conflict only fails the scope that lost the race.
    pub fn is_fatal(&self) -> bool {
        match self {
            EngineError::Storage(StorageError::CasConflict { .. }) => false,
            EngineError::Storage(_) => true,
            _ => false,
        }
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, EngineError::Cancelled(_))
    }

    pub(crate) fn codec(context: impl Into<String>, err: impl std::fmt::Display) -> Self {
        EngineError::Codec {
            context: context.into(),
            message: err.to_string(),
        }
    }
}

impl From<config::ConfigError> for EngineError {
    fn from(err: config::ConfigError) -> Self {
        EngineError::Config(err.to_string())
    }
}

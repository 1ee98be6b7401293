//! Logic Fingerprint Registry
//!
//! Maps function identities to content hashes of their logic so that memo
//! entries produced by older code are detected and re-executed. The registry is
//! an explicit object owned by an [`Environment`](crate::env::Environment);
//! reloading a function is an unregister followed by a register.

use crate::error::EngineError;
use crate::hashing::compute_logic_fingerprint;
use crate::types::LogicFingerprint;
use parking_lot::RwLock;
use std::collections::HashMap;
use tracing::debug;

/// Declaration of a memo-eligible function
///
/// `code` is the function's source text; the [`function_spec!`](crate::function_spec)
/// family of macros fills it with the body's tokens.
///
/// Identical code and version give identical fingerprints, so two functions
/// with the same body text cannot both be registered under different names
/// (`FingerprintConflict`). Give one of them an explicit version to keep
/// their logic apart.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FunctionSpec {
    pub name: String,
    pub code: String,
    pub version: Option<u32>,
    pub memo: bool,
}

impl FunctionSpec {
    pub fn new(name: impl Into<String>, code: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            code: code.into(),
            version: None,
            memo: true,
        }
    }

    /// Explicit logic version. Bumping it invalidates memo entries even when
    /// the code text is unchanged.
    pub fn with_version(mut self, version: u32) -> Self {
        self.version = Some(version);
        self
    }

    /// Disable memoization; the function always executes.
    pub fn with_memo(mut self, memo: bool) -> Self {
        self.memo = memo;
        self
    }

    pub fn fingerprint(&self) -> LogicFingerprint {
        compute_logic_fingerprint(&self.code, self.version)
    }
}

#[derive(Debug)]
struct Registration {
    function: String,
    refs: usize,
}

#[derive(Debug, Default)]
struct RegistryState {
    by_fingerprint: HashMap<LogicFingerprint, Registration>,
    by_name: HashMap<String, LogicFingerprint>,
}

/// Registry of live logic fingerprints
#[derive(Debug, Default)]
pub struct LogicRegistry {
    state: RwLock<RegistryState>,
}

impl LogicRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a function's logic and return its fingerprint
    ///
    /// Registering the same name with the same fingerprint again only bumps a
    /// reference count. A fingerprint already owned by another name, or a new
    /// fingerprint for a name whose previous logic is still registered, is a
    /// conflict.
    pub fn register(&self, spec: &FunctionSpec) -> Result<LogicFingerprint, EngineError> {
        let fingerprint = spec.fingerprint();
        let mut state = self.state.write();

        if let Some(existing) = state.by_fingerprint.get(&fingerprint) {
            if existing.function != spec.name {
                return Err(EngineError::FingerprintConflict {
                    function: spec.name.clone(),
                    reason: format!(
                        "fingerprint {} is already registered by '{}'",
                        fingerprint.short(),
                        existing.function
                    ),
                });
            }
        }

        if let Some(current) = state.by_name.get(&spec.name) {
            if *current != fingerprint {
                return Err(EngineError::FingerprintConflict {
                    function: spec.name.clone(),
                    reason: format!(
                        "logic {} is still registered; unregister it before registering {}",
                        current.short(),
                        fingerprint.short()
                    ),
                });
            }
        }

        state
            .by_fingerprint
            .entry(fingerprint)
            .or_insert_with(|| Registration {
                function: spec.name.clone(),
                refs: 0,
            })
            .refs += 1;
        state.by_name.insert(spec.name.clone(), fingerprint);

        debug!(function = %spec.name, fingerprint = %fingerprint.short(), "Registered logic");
        Ok(fingerprint)
    }

    /// Drop one registration of a fingerprint. Returns false if it was not registered.
    pub fn unregister(&self, fingerprint: &LogicFingerprint) -> bool {
        let mut state = self.state.write();
        let Some(registration) = state.by_fingerprint.get_mut(fingerprint) else {
            return false;
        };
        registration.refs -= 1;
        if registration.refs == 0 {
            let function = registration.function.clone();
            state.by_fingerprint.remove(fingerprint);
            if state.by_name.get(&function) == Some(fingerprint) {
                state.by_name.remove(&function);
            }
            debug!(function = %function, fingerprint = %fingerprint.short(), "Unregistered logic");
        }
        true
    }

    pub fn is_registered(&self, fingerprint: &LogicFingerprint) -> bool {
        self.state.read().by_fingerprint.contains_key(fingerprint)
    }

    /// Current fingerprint registered for a function name.
    pub fn current(&self, function: &str) -> Option<LogicFingerprint> {
        self.state.read().by_name.get(function).copied()
    }

    pub fn len(&self) -> usize {
        self.state.read().by_fingerprint.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Teardown: forget every registration.
    pub fn clear(&self) {
        let mut state = self.state.write();
        state.by_fingerprint.clear();
        state.by_name.clear();
    }
}

/// Build a [`FunctionSpec`] whose code identity is the body's token text.
#[macro_export]
macro_rules! function_spec {
    ($name:expr, $body:expr) => {
        $crate::logic::FunctionSpec::new($name, stringify!($body))
    };
}

/// Define an async memo function on an environment, fingerprinting its body.
#[macro_export]
macro_rules! async_fn {
    ($env:expr, $name:expr, version = $version:expr, $body:expr) => {
        $env.define_async(
            $crate::function_spec!($name, $body).with_version($version),
            $body,
        )
    };
    ($env:expr, $name:expr, $body:expr) => {
        $env.define_async($crate::function_spec!($name, $body), $body)
    };
}

/// Define a sync memo function on an environment, fingerprinting its body.
#[macro_export]
macro_rules! sync_fn {
    ($env:expr, $name:expr, version = $version:expr, $body:expr) => {
        $env.define_sync(
            $crate::function_spec!($name, $body).with_version($version),
            $body,
        )
    };
    ($env:expr, $name:expr, $body:expr) => {
        $env.define_sync($crate::function_spec!($name, $body), $body)
    };
}

//! Settle: incremental memoization and declarative effect reconciliation
//!
//! Functions are mounted at hierarchical scope paths. Each invocation is
//! memoized by scope, function, logic fingerprint, and input; effects declared
//! by the functions that actually run are reconciled against their persisted,
//! possibly ambiguous, prior state and applied in batches at the end of a run.
//! Scopes that are no longer mounted have their effects retracted.

pub mod cli;
pub mod config;
pub mod effect;
pub mod env;
pub mod error;
pub mod hashing;
pub mod logging;
pub mod logic;
pub mod memo;
pub mod runner;
pub mod scope;
pub mod store;
pub mod types;

pub use config::SettleConfig;
pub use effect::{
    ApplyError, Desired, Effect, EffectKey, PrevState, ProviderHandle, Reconciler, Reconciliation, Sink, SinkItem,
    ValueAction, ValueReconciler,
};
pub use env::Environment;
pub use error::{EngineError, StorageError};
pub use logic::FunctionSpec;
pub use memo::{Keyed, MemoInput, StateValidator, Validated, Validation};
pub use runner::{CancelToken, MemoFn, MountHandle, RunHandle, RunReport, RunState, ScopeContext, ScopeFailure};
pub use scope::ScopePath;
pub use types::{InputFingerprint, LogicFingerprint, MemoKey};

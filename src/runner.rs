//! Execution Runner
//!
//! Drives one run: mounts functions at scope paths, resolves each invocation
//! against the memoization store, collects declared effects per scope, and
//! finishes with a single commit wave.

pub mod cancel;
mod commit;
pub mod context;
pub mod run;

pub use cancel::CancelToken;
pub use context::{MemoFn, MountHandle, ScopeContext};
pub use run::{new_run_id, RunHandle, RunReport, RunState, ScopeFailure};

//! Scope Tree
//!
//! Stable hierarchical addresses for units of mounted work, and the per-run
//! table of which addresses were mounted and how their bodies finished.

pub mod path;
pub mod tree;

pub use path::ScopePath;
pub use tree::{MountTable, ScopeOutcome};

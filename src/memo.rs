//! Memoization Store
//!
//! A memoized invocation is identified by a [`MemoKey`](crate::types::MemoKey)
//! derived from its scope path, function name, and inputs. Its [`MemoEntry`]
//! is reused when the logic fingerprint is unchanged and either the inputs'
//! validators all report valid or, without validators, the input fingerprint
//! matches exactly.

pub mod entry;
pub mod flight;
pub mod input;

pub use entry::{evaluate, MemoDecision, MemoEntry, MissReason};
pub use flight::FlightTable;
pub use input::{identify, validators_of, InputIdentity, Keyed, MemoInput, StateValidator, Validated, Validation};

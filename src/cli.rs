//! Inspector CLI: parse, route, and presentation only.
//! Read-only views over a store; no runs are started from the command line.

mod parse;
mod presentation;
mod route;

pub use parse::{Cli, Commands};
pub use route::RunContext;

/// Map errors to the string shown to the user.
pub fn map_error(e: &crate::error::EngineError) -> String {
    e.to_string()
}

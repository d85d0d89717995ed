//! qmeventd library crate.

/// Connection handling, protocol state machine and host side effects.
pub mod core;

/// CLI argument parsing (only when the `cli` feature is enabled).
#[cfg(feature = "cli")]
pub mod cli;

pub mod logging;

mod config;
mod error;

pub use config::*;
pub use error::*;

//! rpoe - a YAML-based task runner
//!
//! Tasks are declared in an `rpoe.yml` file as commands, shell scripts, Python
//! callables, expressions, sequences, switches or references to other tasks.
//! rpoe binds typed command line arguments, expands `${VAR}` templates, resolves
//! the task graph and supervises the resulting child processes.

// Public modules
pub mod cli;
pub mod config;
pub mod error;
pub mod exit_codes;
pub mod logging;
pub mod runner;

// Re-export commonly used types
pub use error::{Result, RpoeError};

/// Current version of rpoe
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

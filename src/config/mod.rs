//! Configuration parsing and validation
//!
//! This module handles parsing of rpoe.yml configuration files
//! and validation of configuration structure.

pub mod parse;
pub mod schema;
pub mod types;

// Re-export main types
pub use parse::*;
pub use schema::{matches_pattern, validate_config, validate_registry};
pub use types::{Config, TaskDef, TaskDetail};

//! CLI interface and argument parsing
//!
//! This module handles the runner's own flags, task listing and dispatch.

pub mod app;

// Re-export main types
pub use app::*;

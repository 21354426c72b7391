//! Stable exit codes for the rpoe CLI.

/// The task ran to completion successfully.
pub const OK: i32 = 0;
/// Execution failed without a child exit status to report (e.g. no matching switch case).
pub const FAILED: i32 = 1;
/// Invalid configuration or arguments, detected before any process was spawned.
pub const INVALID: i32 = 2;
/// A child process could not be started.
pub const SPAWN_FAILED: i32 = 127;
/// Added to the signal number when the runner shuts down on a signal.
pub const INTERRUPTED_BASE: i32 = 128;

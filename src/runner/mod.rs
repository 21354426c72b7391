//! Task execution engine
//!
//! This module turns configured tasks into child processes: templates and
//! arguments are expanded, the task graph is resolved, and the resulting steps
//! are run under supervision.

pub mod args;
pub mod command;
pub mod context;
pub mod env;
pub mod expr;
pub mod resolve;
pub mod signals;
pub mod supervisor;
pub mod task;
pub mod template;
pub mod words;

// Re-export main types
pub use command::{Executor, Invocation, ProcessHandle, SimpleExecutor};
pub use context::{Action, ExecutionContext, Verbosity};
pub use env::TaskEnv;
pub use resolve::Runner;
pub use signals::Termination;
pub use supervisor::{Capture, ExecutionResult, ProcessGroup, ResolvedStep, Supervisor};
pub use task::{TaskKind, TaskRegistry, TaskSpec};
pub use template::{expand, Lookup};

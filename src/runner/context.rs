//! Execution context for task running
//!
//! The context holds the per-invocation settings shared by every task run and
//! owns the runner's user-facing output.

use crate::runner::env::{TaskEnv, POE_ACTIVE, POE_CWD, POE_PWD, POE_ROOT};
use colored::Colorize;
use std::env;
use std::path::{Path, PathBuf};

/// Verbosity levels for output
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Verbosity {
    Silent = 0,
    Quiet = 1,
    Normal = 2,
    Verbose = 3,
}

/// How a would-be command is going to be run
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action {
    /// Output streams to the terminal
    Streamed,
    /// Output is captured
    Captured,
    /// Cannot be determined without running an upstream task
    Unresolved,
}

impl Action {
    fn marker(&self) -> &'static str {
        match self {
            Action::Streamed => "rpoe =>",
            Action::Captured => "rpoe <=",
            Action::Unresolved => "rpoe ??",
        }
    }
}

/// Read-mostly settings for one invocation of the runner
#[derive(Debug, Clone)]
pub struct ExecutionContext {
    /// Directory of the main config file
    pub project_root: PathBuf,

    /// Environment every task starts from
    pub base_env: TaskEnv,

    /// Verbosity level
    pub verbosity: Verbosity,

    /// Print what would run without starting anything
    pub dry_run: bool,
}

impl ExecutionContext {
    /// Create a context from the current process environment
    pub fn new(project_root: PathBuf) -> Self {
        let cwd = env::current_dir().unwrap_or_else(|_| PathBuf::from("."));
        Self::with_env(project_root, env::vars(), &cwd)
    }

    /// Create a context from an explicit environment snapshot
    pub fn with_env<I>(project_root: PathBuf, vars: I, cwd: &Path) -> Self
    where
        I: IntoIterator<Item = (String, String)>,
    {
        let mut base_env = TaskEnv::new(vars);
        base_env.set(POE_ROOT, project_root.display().to_string());
        if !base_env.contains(POE_PWD) {
            base_env.set(POE_PWD, cwd.display().to_string());
        }
        if !base_env.contains(POE_CWD) {
            base_env.set(POE_CWD, cwd.display().to_string());
        }

        ExecutionContext {
            project_root,
            base_env,
            verbosity: Verbosity::Normal,
            dry_run: false,
        }
    }

    /// Set verbosity level
    pub fn with_verbosity(mut self, verbosity: Verbosity) -> Self {
        self.verbosity = verbosity;
        self
    }

    pub fn with_dry_run(mut self, dry_run: bool) -> Self {
        self.dry_run = dry_run;
        self
    }

    /// Record the executor strategy in the base environment
    pub fn with_executor_name(mut self, name: &str) -> Self {
        self.base_env.set(POE_ACTIVE, name);
        self
    }

    /// Print the command a task is about to run; dry runs show it unless silent
    pub fn print_action(&self, action: Action, text: &str) {
        let min = if self.dry_run {
            Verbosity::Quiet
        } else {
            Verbosity::Normal
        };
        if self.verbosity >= min {
            let marker = match action {
                Action::Streamed => action.marker().blue().bold(),
                Action::Captured => action.marker().cyan().bold(),
                Action::Unresolved => action.marker().yellow().bold(),
            };
            eprintln!("{} {}", marker, text);
        }
    }

    /// Print error message
    pub fn print_error(&self, message: &str) {
        if self.verbosity >= Verbosity::Quiet {
            eprintln!("{} {}", "Error:".red().bold(), message);
        }
    }

    /// Print debug message (only in verbose mode)
    pub fn print_debug(&self, message: &str) {
        if self.verbosity >= Verbosity::Verbose {
            eprintln!("{} {}", "rpoe".dimmed(), message);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn context(vars: Vec<(&str, &str)>) -> ExecutionContext {
        ExecutionContext::with_env(
            PathBuf::from("/proj"),
            vars.into_iter().map(|(k, v)| (k.to_string(), v.to_string())),
            Path::new("/proj/sub"),
        )
    }

    #[test]
    fn test_context_new() {
        let ctx = context(vec![("HOME", "/home/me")]);
        assert_eq!(ctx.verbosity, Verbosity::Normal);
        assert!(!ctx.dry_run);
        assert_eq!(ctx.base_env.get("HOME"), Some("/home/me"));
        assert_eq!(ctx.base_env.get(POE_ROOT), Some("/proj"));
        assert_eq!(ctx.base_env.get(POE_PWD), Some("/proj/sub"));
    }

    #[test]
    fn test_preset_poe_pwd_is_kept() {
        let ctx = context(vec![("POE_PWD", "/elsewhere"), ("POE_ROOT", "/stale")]);
        assert_eq!(ctx.base_env.get(POE_PWD), Some("/elsewhere"));
        assert_eq!(ctx.base_env.get(POE_ROOT), Some("/proj"));
    }

    #[test]
    fn test_builder() {
        let ctx = context(vec![])
            .with_verbosity(Verbosity::Verbose)
            .with_dry_run(true)
            .with_executor_name("simple");
        assert_eq!(ctx.verbosity, Verbosity::Verbose);
        assert!(ctx.dry_run);
        assert_eq!(ctx.base_env.get(POE_ACTIVE), Some("simple"));
    }

    #[test]
    fn test_verbosity_levels() {
        assert!(Verbosity::Verbose > Verbosity::Normal);
        assert!(Verbosity::Normal > Verbosity::Quiet);
        assert!(Verbosity::Quiet > Verbosity::Silent);
    }
}

//! Error types for rpoe

use crate::exit_codes;
use crate::runner::Termination;
use std::io;
use std::path::PathBuf;
use thiserror::Error;

/// Result type alias for rpoe operations
pub type Result<T> = std::result::Result<T, RpoeError>;

/// Main error type for rpoe
#[derive(Error, Debug)]
pub enum RpoeError {
    /// Configuration-related errors
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    /// Bad values supplied on the command line
    #[error("{0}")]
    Validation(#[from] ValidationError),

    /// Task execution errors
    #[error("{0}")]
    Execution(#[from] ExecutionError),

    /// A child process could not be started or observed
    #[error("{0}")]
    Process(#[from] ProcessError),

    /// The runner received a termination signal and shut its children down
    #[error("Interrupted by {0}")]
    Interrupted(Termination),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// YAML parsing errors
    #[error("YAML parsing error: {0}")]
    Yaml(#[from] serde_yaml::Error),
}

impl RpoeError {
    /// Exit status the runner should terminate with for this error
    pub fn exit_code(&self) -> i32 {
        match self {
            RpoeError::Config(_) | RpoeError::Validation(_) | RpoeError::Yaml(_) => {
                exit_codes::INVALID
            }
            RpoeError::Execution(err) => err.exit_code(),
            RpoeError::Process(_) => exit_codes::SPAWN_FAILED,
            RpoeError::Interrupted(signal) => exit_codes::INTERRUPTED_BASE + signal.signum(),
            RpoeError::Io(_) => exit_codes::FAILED,
        }
    }
}

/// Configuration parsing and validation errors
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to find config file (searched: {0})")]
    NotFound(String),

    #[error("Invalid configuration: {0}")]
    Invalid(String),

    #[error("Invalid task '{task}': {reason}")]
    InvalidTask { task: String, reason: String },

    #[error("Invalid argument '{arg}' declared for task '{task}': {reason}")]
    InvalidArgument {
        task: String,
        arg: String,
        reason: String,
    },

    #[error("Unsupported interpreter '{interpreter}' for task '{task}'. Expected one of: {valid}")]
    InvalidInterpreter {
        task: String,
        interpreter: String,
        valid: String,
    },

    #[error("Task '{0}' is not defined")]
    TaskNotFound(String),

    #[error("Circular dependency detected: {0}")]
    CircularDependency(String),

    #[error("Task '{0}' cannot capture stdout because it resolves to a sequence")]
    CaptureOnSequence(String),

    #[error("Failed to include file '{path}': {error}")]
    IncludeFile { path: PathBuf, error: String },

    #[error("Failed to load envfile '{path}': {error}")]
    EnvFile { path: PathBuf, error: String },
}

/// Invalid values supplied for a task's declared arguments
#[derive(Error, Debug)]
pub enum ValidationError {
    #[error("Invalid arguments for task '{task}': {message}")]
    InvalidArguments { task: String, message: String },

    #[error("Invalid value '{value}' for argument '{arg}' of task '{task}': expected {expected}")]
    InvalidType {
        task: String,
        arg: String,
        value: String,
        expected: &'static str,
    },

    #[error("Invalid choice '{value}' for argument '{arg}' of task '{task}' (choose from {choices})")]
    InvalidChoice {
        task: String,
        arg: String,
        value: String,
        choices: String,
    },

    #[error("Argument '{arg}' is required by task '{task}'")]
    MissingArgument { task: String, arg: String },

    #[error("{kind} task '{task}' does not accept arguments")]
    UnexpectedArguments { task: String, kind: &'static str },

    /// `--help` was passed to a task; carries the rendered help text
    #[error("{0}")]
    HelpRequested(String),
}

/// Task execution errors
#[derive(Error, Debug)]
pub enum ExecutionError {
    #[error("Control value '{value}' did not match any cases in switch task '{task}'.")]
    UnresolvedCase { task: String, value: String },

    #[error("Switch task '{task}' aborted after failed control task")]
    ControlFailed { task: String, code: i32 },

    #[error("Sequence aborted after failed subtask '{subtask}'")]
    SequenceAborted {
        task: String,
        subtask: String,
        code: i32,
    },

    #[error("Subtasks {subtasks} of task '{task}' returned non-zero exit status")]
    SubtasksFailed { task: String, subtasks: String },

    #[error("Task '{task}' aborted after upstream task '{upstream}' failed")]
    UpstreamFailed {
        task: String,
        upstream: String,
        code: i32,
    },

    #[error("Expression error in task '{task}': {error}")]
    Expression { task: String, error: String },

    #[error("Failed to write captured output to '{path}': {error}")]
    CaptureFile { path: PathBuf, error: String },
}

impl ExecutionError {
    /// Failures carrying a child's exit status propagate it unchanged
    pub fn exit_code(&self) -> i32 {
        match self {
            ExecutionError::SequenceAborted { code, .. }
            | ExecutionError::UpstreamFailed { code, .. }
            | ExecutionError::ControlFailed { code, .. }
                if *code != 0 =>
            {
                *code
            }
            _ => exit_codes::FAILED,
        }
    }
}

/// Failures to start or observe child processes
#[derive(Error, Debug)]
pub enum ProcessError {
    #[error("Failed to start '{command}': {source}")]
    Spawn {
        command: String,
        #[source]
        source: io::Error,
    },

    #[error("Failed waiting on '{command}': {source}")]
    Wait {
        command: String,
        #[source]
        source: io::Error,
    },

    #[error("Couldn't locate interpreter executable for '{interpreter}' to run task '{task}'")]
    InterpreterNotFound { task: String, interpreter: String },
}

/// Specialized result type for configuration operations
pub type ConfigResult<T> = std::result::Result<T, ConfigError>;

/// Specialized result type for argument validation
pub type ValidationResult<T> = std::result::Result<T, ValidationError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_errors_use_invalid_exit_code() {
        let err: RpoeError = ConfigError::TaskNotFound("nope".to_string()).into();
        assert_eq!(err.exit_code(), exit_codes::INVALID);

        let err: RpoeError = ValidationError::MissingArgument {
            task: "t".to_string(),
            arg: "a".to_string(),
        }
        .into();
        assert_eq!(err.exit_code(), exit_codes::INVALID);
    }

    #[test]
    fn test_sequence_abort_propagates_child_code() {
        let err: RpoeError = ExecutionError::SequenceAborted {
            task: "seq".to_string(),
            subtask: "fail".to_string(),
            code: 22,
        }
        .into();
        assert_eq!(err.exit_code(), 22);
    }

    #[test]
    fn test_unresolved_case_message() {
        let err = ExecutionError::UnresolvedCase {
            task: "default_fail".to_string(),
            value: "nothing".to_string(),
        };
        assert_eq!(
            err.to_string(),
            "Control value 'nothing' did not match any cases in switch task 'default_fail'."
        );
        assert_eq!(err.exit_code(), exit_codes::FAILED);
    }

    #[test]
    fn test_interrupted_exit_code_reflects_signal() {
        let err = RpoeError::Interrupted(Termination::Interrupt);
        assert_eq!(err.exit_code(), 130);
        let err = RpoeError::Interrupted(Termination::HangUp);
        assert_eq!(err.exit_code(), 129);
    }
}

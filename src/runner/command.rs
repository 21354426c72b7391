//! Command execution
//!
//! This module starts child processes. An `Executor` turns an `Invocation` into
//! a running `ProcessHandle`; the supervisor decides what to do with it.

use crate::error::ProcessError;
use crate::runner::signals::{kill_process_group, signal_process_group, Termination};
use crate::runner::words;
use std::fs::File;
use std::io::{self, Write};
use std::path::PathBuf;
use std::process::{Child, ChildStderr, ChildStdout, Command, ExitStatus, Stdio};
use std::thread;
use std::time::Duration;
use tracing::{debug, warn};
use wait_timeout::ChildExt;

/// Where a child's output stream goes
#[derive(Debug)]
pub enum OutputMode {
    Inherit,
    Piped,
    File(File),
}

impl OutputMode {
    fn into_stdio(self) -> Stdio {
        match self {
            OutputMode::Inherit => Stdio::inherit(),
            OutputMode::Piped => Stdio::piped(),
            OutputMode::File(file) => Stdio::from(file),
        }
    }
}

/// Everything needed to start one child process
#[derive(Debug)]
pub struct Invocation {
    pub program: String,
    pub args: Vec<String>,
    /// Complete environment of the child; nothing else is inherited
    pub env: Vec<(String, String)>,
    pub cwd: PathBuf,
    /// Written to the child's stdin, which is then closed
    pub stdin: Option<String>,
    pub stdout: OutputMode,
    pub stderr: OutputMode,
}

impl Invocation {
    /// Shell-quoted command line for messages
    pub fn command_line(&self) -> String {
        let mut all = Vec::with_capacity(self.args.len() + 1);
        all.push(self.program.clone());
        all.extend(self.args.iter().cloned());
        words::join(&all)
    }
}

/// A strategy for starting task processes
pub trait Executor: Send + Sync {
    /// Name exported to tasks as `POE_ACTIVE`
    fn name(&self) -> &str;

    fn invoke(&self, invocation: Invocation) -> Result<ProcessHandle, ProcessError>;
}

/// Runs the program directly, each child leading its own process group
#[derive(Debug, Default, Clone, Copy)]
pub struct SimpleExecutor;

impl Executor for SimpleExecutor {
    fn name(&self) -> &str {
        "simple"
    }

    fn invoke(&self, invocation: Invocation) -> Result<ProcessHandle, ProcessError> {
        let command_line = invocation.command_line();
        let mut command = Command::new(&invocation.program);
        command
            .args(&invocation.args)
            .env_clear()
            .envs(invocation.env.iter().map(|(k, v)| (k, v)))
            .current_dir(&invocation.cwd)
            .stdout(invocation.stdout.into_stdio())
            .stderr(invocation.stderr.into_stdio());
        if invocation.stdin.is_some() {
            command.stdin(Stdio::piped());
        } else {
            command.stdin(Stdio::inherit());
        }

        #[cfg(unix)]
        {
            use std::os::unix::process::CommandExt;
            command.process_group(0);
        }

        debug!(command = %command_line, cwd = %invocation.cwd.display(), "spawning child process");
        let mut child = command.spawn().map_err(|source| ProcessError::Spawn {
            command: command_line.clone(),
            source,
        })?;

        if let Some(input) = invocation.stdin {
            if let Some(mut stdin) = child.stdin.take() {
                // Large scripts would block on a full pipe before the child reads them
                thread::spawn(move || {
                    if let Err(e) = stdin.write_all(input.as_bytes()) {
                        warn!(err = %e, "failed to write child stdin");
                    }
                });
            }
        }

        Ok(ProcessHandle {
            child,
            command: command_line,
        })
    }
}

/// A started child process
#[derive(Debug)]
pub struct ProcessHandle {
    child: Child,
    command: String,
}

impl ProcessHandle {
    pub fn id(&self) -> u32 {
        self.child.id()
    }

    pub fn command(&self) -> &str {
        &self.command
    }

    pub fn take_stdout(&mut self) -> Option<ChildStdout> {
        self.child.stdout.take()
    }

    pub fn take_stderr(&mut self) -> Option<ChildStderr> {
        self.child.stderr.take()
    }

    pub fn try_wait(&mut self) -> io::Result<Option<ExitStatus>> {
        self.child.try_wait()
    }

    pub fn wait_timeout(&mut self, timeout: Duration) -> io::Result<Option<ExitStatus>> {
        self.child.wait_timeout(timeout)
    }

    pub fn wait(&mut self) -> io::Result<ExitStatus> {
        self.child.wait()
    }

    /// Forward a termination signal to the child's process group
    pub fn signal(&mut self, signal: Termination) -> io::Result<()> {
        if cfg!(unix) {
            signal_process_group(self.id(), signal)
        } else {
            self.child.kill()
        }
    }

    /// Kill the child and everything in its process group
    pub fn kill(&mut self) -> io::Result<()> {
        if let Err(e) = kill_process_group(self.id()) {
            debug!(err = %e, pid = self.id(), "killpg failed, killing child directly");
            return self.child.kill();
        }
        Ok(())
    }
}

/// Exit code of a finished child; death by signal counts as 128 + signum
pub fn exit_code(status: ExitStatus) -> i32 {
    if let Some(code) = status.code() {
        return code;
    }
    #[cfg(unix)]
    {
        use std::os::unix::process::ExitStatusExt;
        if let Some(signal) = status.signal() {
            return crate::exit_codes::INTERRUPTED_BASE + signal;
        }
    }
    crate::exit_codes::FAILED
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Read;

    fn invocation(program: &str, args: &[&str]) -> Invocation {
        Invocation {
            program: program.to_string(),
            args: args.iter().map(|a| a.to_string()).collect(),
            env: std::env::vars().collect(),
            cwd: std::env::current_dir().unwrap(),
            stdin: None,
            stdout: OutputMode::Piped,
            stderr: OutputMode::Inherit,
        }
    }

    #[cfg(unix)]
    #[test]
    fn test_invoke_captures_stdout() {
        let mut handle = SimpleExecutor.invoke(invocation("echo", &["hello"])).unwrap();
        let mut out = String::new();
        handle.take_stdout().unwrap().read_to_string(&mut out).unwrap();
        let status = handle.wait().unwrap();
        assert_eq!(out, "hello\n");
        assert_eq!(exit_code(status), 0);
    }

    #[cfg(unix)]
    #[test]
    fn test_invoke_writes_stdin() {
        let mut inv = invocation("sh", &[]);
        inv.stdin = Some("echo from-stdin; exit 3\n".to_string());
        let mut handle = SimpleExecutor.invoke(inv).unwrap();
        let mut out = String::new();
        handle.take_stdout().unwrap().read_to_string(&mut out).unwrap();
        assert_eq!(out.trim(), "from-stdin");
        assert_eq!(exit_code(handle.wait().unwrap()), 3);
    }

    #[cfg(unix)]
    #[test]
    fn test_env_is_exact() {
        let mut inv = invocation("sh", &["-c", "echo \"${ONLY:-unset} ${HOME:-nohome}\""]);
        inv.env = vec![
            ("ONLY".to_string(), "set".to_string()),
            ("PATH".to_string(), std::env::var("PATH").unwrap_or_default()),
        ];
        let mut handle = SimpleExecutor.invoke(inv).unwrap();
        let mut out = String::new();
        handle.take_stdout().unwrap().read_to_string(&mut out).unwrap();
        handle.wait().unwrap();
        assert_eq!(out.trim(), "set nohome");
    }

    #[test]
    fn test_spawn_failure_names_command() {
        let err = SimpleExecutor
            .invoke(invocation("definitely-not-a-real-program-rpoe", &["x"]))
            .unwrap_err();
        assert!(err.to_string().contains("definitely-not-a-real-program-rpoe x"));
    }

    #[cfg(unix)]
    #[test]
    fn test_signal_kills_process_group() {
        let mut inv = invocation("sleep", &["30"]);
        inv.stdout = OutputMode::Inherit;
        let mut handle = SimpleExecutor.invoke(inv).unwrap();
        handle.signal(Termination::Terminate).unwrap();
        let status = handle.wait().unwrap();
        assert_eq!(exit_code(status), 128 + 15);
    }
}

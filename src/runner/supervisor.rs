//! Process supervision
//!
//! Runs resolved steps as child processes, alone or as a parallel group,
//! collects or tags their output, and aggregates their exit codes. Every live
//! child is registered with a shared `ProcessGroup` so termination signals can
//! reach it.

use crate::error::{ExecutionError, RpoeError};
use crate::runner::command::{exit_code, Executor, Invocation, OutputMode, ProcessHandle};
use crate::runner::env::TaskEnv;
use crate::runner::signals::{kill_process_group, signal_process_group, Termination};
use crate::runner::words;
use colored::{Color, Colorize};
use std::fs::{self, File};
use std::io::{self, BufRead, BufReader, Read, Write};
use std::path::PathBuf;
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use tracing::{debug, warn};

/// Time between polls of running children
pub const POLL_INTERVAL: Duration = Duration::from_millis(50);

/// How long children get to exit after a termination signal before SIGKILL
pub const DEFAULT_GRACE_PERIOD: Duration = Duration::from_secs(3);

const MAX_PREFIX_WIDTH: usize = 16;

const PREFIX_COLORS: &[Color] = &[
    Color::Cyan,
    Color::Magenta,
    Color::Yellow,
    Color::Green,
    Color::Blue,
    Color::BrightRed,
];

/// Where a step's stdout goes
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Capture {
    Inherit,
    Memory,
    File(PathBuf),
}

/// A fully resolved child process invocation
#[derive(Debug, Clone)]
pub struct ResolvedStep {
    /// Task name shown in messages and output prefixes
    pub name: String,
    pub program: String,
    pub args: Vec<String>,
    pub env: TaskEnv,
    pub cwd: PathBuf,
    pub stdin: Option<String>,
    pub capture: Capture,
}

impl ResolvedStep {
    /// Shell-quoted command line
    pub fn command_line(&self) -> String {
        let mut all = Vec::with_capacity(self.args.len() + 1);
        all.push(self.program.clone());
        all.extend(self.args.iter().cloned());
        words::join(&all)
    }
}

/// Outcome of running a step or group
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExecutionResult {
    pub exit_code: i32,
    /// Captured stdout for `Capture::Memory`
    pub stdout: Option<String>,
}

impl ExecutionResult {
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }
}

#[derive(Debug, Default)]
struct GroupState {
    children: Vec<u32>,
    shutdown: Option<(Termination, Instant)>,
}

/// Registry of live child process groups
///
/// `terminate` is the only thing a signal handler calls.
#[derive(Debug, Default)]
pub struct ProcessGroup {
    state: Mutex<GroupState>,
}

impl ProcessGroup {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, GroupState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn register(&self, pid: u32) {
        self.state().children.push(pid);
    }

    pub fn unregister(&self, pid: u32) {
        self.state().children.retain(|p| *p != pid);
    }

    /// Number of children still registered
    pub fn live(&self) -> usize {
        self.state().children.len()
    }

    /// Mark shutdown and forward the signal to every live child group
    pub fn terminate(&self, signal: Termination) {
        let mut state = self.state();
        if state.shutdown.is_none() {
            state.shutdown = Some((signal, Instant::now()));
        }
        for pid in &state.children {
            if let Err(e) = signal_process_group(*pid, signal) {
                debug!(pid, err = %e, "failed to forward signal");
            }
        }
    }

    /// Signal that triggered shutdown, if any
    pub fn shutdown(&self) -> Option<Termination> {
        self.state().shutdown.map(|(signal, _)| signal)
    }

    fn shutdown_elapsed(&self) -> Option<Duration> {
        self.state().shutdown.map(|(_, since)| since.elapsed())
    }

    /// SIGKILL every live child group
    pub fn kill_all(&self) {
        let state = self.state();
        for pid in &state.children {
            warn!(pid, "child did not exit after termination signal, killing");
            if let Err(e) = kill_process_group(*pid) {
                debug!(pid, err = %e, "failed to kill process group");
            }
        }
    }
}

struct RunningChild {
    name: String,
    handle: ProcessHandle,
    readers: Vec<JoinHandle<io::Result<Vec<u8>>>>,
    collect_stdout: bool,
    status: Option<i32>,
}

/// Children started by one `run` or `run_group` call
///
/// Anything still alive when this is dropped is killed and reaped.
struct RunningSet<'g> {
    group: &'g ProcessGroup,
    children: Vec<RunningChild>,
}

impl RunningSet<'_> {
    fn all_done(&self) -> bool {
        self.children.iter().all(|c| c.status.is_some())
    }
}

impl Drop for RunningSet<'_> {
    fn drop(&mut self) {
        for child in self.children.iter_mut().filter(|c| c.status.is_none()) {
            debug!(task = %child.name, pid = child.handle.id(), "cleaning up child process");
            let _ = child.handle.kill();
            let _ = child.handle.wait();
            self.group.unregister(child.handle.id());
        }
    }
}

enum Sink {
    Collect,
    Tagged { prefix: String, stderr: bool },
}

fn spawn_reader<R: Read + Send + 'static>(reader: R, sink: Sink) -> JoinHandle<io::Result<Vec<u8>>> {
    thread::spawn(move || match sink {
        Sink::Collect => {
            let mut buf = Vec::new();
            let mut reader = reader;
            reader.read_to_end(&mut buf)?;
            Ok(buf)
        }
        Sink::Tagged { prefix, stderr } => {
            let mut reader = BufReader::new(reader);
            let mut line = Vec::new();
            loop {
                line.clear();
                if reader.read_until(b'\n', &mut line)? == 0 {
                    break;
                }
                let text = String::from_utf8_lossy(&line);
                let text = text.trim_end_matches(['\n', '\r']);
                if stderr {
                    let mut out = io::stderr().lock();
                    writeln!(out, "{} {}", prefix, text)?;
                } else {
                    let mut out = io::stdout().lock();
                    writeln!(out, "{} {}", prefix, text)?;
                    out.flush()?;
                }
            }
            Ok(Vec::new())
        }
    })
}

/// Step name shortened for use as an output prefix
pub fn truncate_name(name: &str) -> String {
    if name.chars().count() <= MAX_PREFIX_WIDTH {
        name.to_string()
    } else {
        let mut short: String = name.chars().take(MAX_PREFIX_WIDTH - 1).collect();
        short.push('…');
        short
    }
}

fn open_capture_file(path: &PathBuf) -> Result<File, ExecutionError> {
    let capture_error = |e: io::Error| ExecutionError::CaptureFile {
        path: path.clone(),
        error: e.to_string(),
    };
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent).map_err(capture_error)?;
        }
    }
    File::create(path).map_err(capture_error)
}

/// Starts and waits for task processes
pub struct Supervisor<'a> {
    executor: &'a dyn Executor,
    group: Arc<ProcessGroup>,
    grace: Duration,
}

impl<'a> Supervisor<'a> {
    pub fn new(executor: &'a dyn Executor, group: Arc<ProcessGroup>) -> Self {
        Supervisor {
            executor,
            group,
            grace: DEFAULT_GRACE_PERIOD,
        }
    }

    pub fn with_grace_period(mut self, grace: Duration) -> Self {
        self.grace = grace;
        self
    }

    pub fn group(&self) -> &Arc<ProcessGroup> {
        &self.group
    }

    fn check_shutdown(&self) -> Result<(), RpoeError> {
        match self.group.shutdown() {
            Some(signal) => Err(RpoeError::Interrupted(signal)),
            None => Ok(()),
        }
    }

    /// Run one step to completion
    pub fn run(&self, step: &ResolvedStep) -> Result<ExecutionResult, RpoeError> {
        self.check_shutdown()?;
        let mut running = RunningSet {
            group: &self.group,
            children: Vec::with_capacity(1),
        };
        let stdout = match &step.capture {
            Capture::Inherit => OutputMode::Inherit,
            Capture::Memory => OutputMode::Piped,
            Capture::File(path) => OutputMode::File(open_capture_file(path)?),
        };
        running
            .children
            .push(self.start(step, stdout, OutputMode::Inherit, None)?);

        self.wait_all(&mut running)?;
        let mut results = self.collect(&mut running)?;
        Ok(results.pop().unwrap_or_default())
    }

    /// Run steps concurrently; the aggregate exit code is the sum of theirs
    pub fn run_group(&self, steps: &[ResolvedStep]) -> Result<ExecutionResult, RpoeError> {
        self.check_shutdown()?;
        let prefixes: Vec<String> = steps.iter().map(|s| truncate_name(&s.name)).collect();
        let width = prefixes.iter().map(|p| p.chars().count()).max().unwrap_or(0);

        let mut running = RunningSet {
            group: &self.group,
            children: Vec::with_capacity(steps.len()),
        };
        for (index, step) in steps.iter().enumerate() {
            let color = PREFIX_COLORS[index % PREFIX_COLORS.len()];
            let prefix = format!("{:<width$} |", prefixes[index], width = width)
                .color(color)
                .to_string();
            let (stdout, tag) = match &step.capture {
                Capture::File(path) => (OutputMode::File(open_capture_file(path)?), None),
                Capture::Memory => (OutputMode::Piped, None),
                Capture::Inherit => (OutputMode::Piped, Some(prefix.clone())),
            };
            running
                .children
                .push(self.start(step, stdout, OutputMode::Piped, Some((tag, prefix)))?);
        }

        self.wait_all(&mut running)?;
        let results = self.collect(&mut running)?;
        let exit_code: i32 = results.iter().map(|r| r.exit_code).sum();
        debug!(members = results.len(), exit_code, "parallel group finished");
        Ok(ExecutionResult {
            exit_code,
            stdout: None,
        })
    }

    fn start(
        &self,
        step: &ResolvedStep,
        stdout: OutputMode,
        stderr: OutputMode,
        tags: Option<(Option<String>, String)>,
    ) -> Result<RunningChild, RpoeError> {
        let collect_stdout = matches!(stdout, OutputMode::Piped) && !matches!(tags, Some((Some(_), _)));
        let invocation = Invocation {
            program: step.program.clone(),
            args: step.args.clone(),
            env: step.env.iter().map(|(k, v)| (k.clone(), v.clone())).collect(),
            cwd: step.cwd.clone(),
            stdin: step.stdin.clone(),
            stdout,
            stderr,
        };
        let mut handle = self.executor.invoke(invocation)?;
        self.group.register(handle.id());

        let mut readers = Vec::with_capacity(2);
        if let Some(out) = handle.take_stdout() {
            let sink = match &tags {
                Some((Some(prefix), _)) => Sink::Tagged {
                    prefix: prefix.clone(),
                    stderr: false,
                },
                _ => Sink::Collect,
            };
            readers.push(spawn_reader(out, sink));
        }
        if let Some(err) = handle.take_stderr() {
            let prefix = tags.map(|(_, prefix)| prefix).unwrap_or_default();
            readers.push(spawn_reader(err, Sink::Tagged { prefix, stderr: true }));
        }

        Ok(RunningChild {
            name: step.name.clone(),
            handle,
            readers,
            collect_stdout,
            status: None,
        })
    }

    /// Poll until every child has exited, escalating to SIGKILL after shutdown
    fn wait_all(&self, running: &mut RunningSet<'_>) -> Result<(), RpoeError> {
        let mut killed = false;
        let pending = running.children.len().max(1) as u32;
        let slice = POLL_INTERVAL / pending;

        while !running.all_done() {
            for child in running.children.iter_mut().filter(|c| c.status.is_none()) {
                let status = child
                    .handle
                    .wait_timeout(slice)
                    .map_err(|source| crate::error::ProcessError::Wait {
                        command: child.handle.command().to_string(),
                        source,
                    })?;
                if let Some(status) = status {
                    let code = exit_code(status);
                    debug!(task = %child.name, exit_code = code, "child exited");
                    child.status = Some(code);
                    self.group.unregister(child.handle.id());
                }
            }

            if !killed {
                if let Some(elapsed) = self.group.shutdown_elapsed() {
                    if elapsed >= self.grace {
                        self.group.kill_all();
                        killed = true;
                    }
                }
            }
        }

        Ok(())
    }

    /// Join output readers and turn exit codes into results
    fn collect(&self, running: &mut RunningSet<'_>) -> Result<Vec<ExecutionResult>, RpoeError> {
        let mut results = Vec::with_capacity(running.children.len());
        for child in running.children.iter_mut() {
            let mut stdout = None;
            for (index, reader) in child.readers.drain(..).enumerate() {
                let output = reader
                    .join()
                    .unwrap_or_else(|_| Err(io::Error::other("output reader thread panicked")))?;
                if index == 0 && child.collect_stdout {
                    stdout = Some(String::from_utf8_lossy(&output).into_owned());
                }
            }
            results.push(ExecutionResult {
                exit_code: child.status.unwrap_or(crate::exit_codes::FAILED),
                stdout,
            });
        }

        self.check_shutdown()?;
        Ok(results)
    }
}

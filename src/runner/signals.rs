//! Termination signals
//!
//! A listener thread receives interrupt, hang-up and terminate signals and
//! hands them to the shared `ProcessGroup`, which forwards them to every live
//! child process group.

use crate::runner::supervisor::ProcessGroup;
use std::fmt;
use std::io;
use std::sync::Arc;
use std::thread::JoinHandle;
use tracing::debug;

/// Signals the runner forwards to its children
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Termination {
    HangUp,
    Interrupt,
    Terminate,
}

impl Termination {
    pub fn signum(&self) -> i32 {
        match self {
            Termination::HangUp => 1,
            Termination::Interrupt => 2,
            Termination::Terminate => 15,
        }
    }

    pub fn from_signum(signum: i32) -> Option<Self> {
        match signum {
            1 => Some(Termination::HangUp),
            2 => Some(Termination::Interrupt),
            15 => Some(Termination::Terminate),
            _ => None,
        }
    }

    #[cfg(unix)]
    fn as_signal(&self) -> nix::sys::signal::Signal {
        use nix::sys::signal::Signal;
        match self {
            Termination::HangUp => Signal::SIGHUP,
            Termination::Interrupt => Signal::SIGINT,
            Termination::Terminate => Signal::SIGTERM,
        }
    }
}

impl fmt::Display for Termination {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Termination::HangUp => "SIGHUP",
            Termination::Interrupt => "SIGINT",
            Termination::Terminate => "SIGTERM",
        };
        f.write_str(name)
    }
}

/// Send a signal to the process group led by `pid`
#[cfg(unix)]
pub fn signal_process_group(pid: u32, signal: Termination) -> io::Result<()> {
    use nix::sys::signal::killpg;
    use nix::unistd::Pid;

    killpg(Pid::from_raw(pid as i32), signal.as_signal()).map_err(io::Error::from)
}

#[cfg(not(unix))]
pub fn signal_process_group(_pid: u32, _signal: Termination) -> io::Result<()> {
    Err(io::Error::new(
        io::ErrorKind::Unsupported,
        "process groups are not supported on this platform",
    ))
}

/// Kill the process group led by `pid`
#[cfg(unix)]
pub fn kill_process_group(pid: u32) -> io::Result<()> {
    use nix::sys::signal::{killpg, Signal};
    use nix::unistd::Pid;

    killpg(Pid::from_raw(pid as i32), Signal::SIGKILL).map_err(io::Error::from)
}

#[cfg(not(unix))]
pub fn kill_process_group(_pid: u32) -> io::Result<()> {
    Err(io::Error::new(
        io::ErrorKind::Unsupported,
        "process groups are not supported on this platform",
    ))
}

/// Background thread forwarding termination signals; stops when dropped
pub struct SignalListener {
    #[cfg(unix)]
    handle: signal_hook::iterator::Handle,
    thread: Option<JoinHandle<()>>,
}

/// Start forwarding termination signals to `group`
#[cfg(unix)]
pub fn listen(group: Arc<ProcessGroup>) -> io::Result<SignalListener> {
    use signal_hook::consts::signal::{SIGHUP, SIGINT, SIGTERM};
    use signal_hook::iterator::Signals;

    let mut signals = Signals::new([SIGINT, SIGHUP, SIGTERM])?;
    let handle = signals.handle();
    let thread = std::thread::Builder::new()
        .name("rpoe-signals".to_string())
        .spawn(move || {
            for signum in signals.forever() {
                if let Some(signal) = Termination::from_signum(signum) {
                    debug!(%signal, "received termination signal");
                    group.terminate(signal);
                }
            }
        })?;

    Ok(SignalListener {
        handle,
        thread: Some(thread),
    })
}

#[cfg(not(unix))]
pub fn listen(_group: Arc<ProcessGroup>) -> io::Result<SignalListener> {
    Ok(SignalListener { thread: None })
}

impl Drop for SignalListener {
    fn drop(&mut self) {
        #[cfg(unix)]
        self.handle.close();
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}

//! The handle returned by a successful spawn.
//!
//! An [`Execution`] owns the parent-side pipe ends. Each output pipe has
//! exactly one reader over the handle's lifetime: it is handed out either as a
//! lazy [`OutputStream`] or drained together with the other one by
//! [`Execution::capture_ios`]. Asking for a stream a second time, or for a
//! stream that was never piped, is a caller bug and panics.

use std::fmt;
use std::io;
use std::os::fd::OwnedFd;
use std::sync::{Mutex, MutexGuard, PoisonError};

use nix::errno::Errno;
use nix::sys::signal::{self, Signal};
use nix::unistd::Pid;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::net::unix::pipe::Receiver;
use tokio_util::io::ReaderStream;
use tracing::debug;

use crate::error::Result;
use crate::request::ProcessId;
use crate::status::TerminationStatus;

/// Single-pass sequence of output chunks read straight from a pipe.
///
/// Dropping it closes the read end; a child still writing then sees `EPIPE`.
pub type OutputStream = ReaderStream<Receiver>;

/// Both output streams, fully read.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CapturedIos {
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum OutputKind {
    Stdout,
    Stderr,
}

impl fmt::Display for OutputKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Stdout => f.write_str("standard output"),
            Self::Stderr => f.write_str("standard error"),
        }
    }
}

/// Which output streams have been handed out. Bits only ever go from
/// `false` to `true`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct OutputConsumptionState {
    pub stdout_consumed: bool,
    pub stderr_consumed: bool,
}

#[derive(Debug, Default)]
struct Pipes {
    stdin: Option<OwnedFd>,
    stdout: Option<OwnedFd>,
    stderr: Option<OwnedFd>,
    consumed: OutputConsumptionState,
}

impl Pipes {
    fn slot(&mut self, kind: OutputKind) -> (&mut Option<OwnedFd>, &mut bool) {
        match kind {
            OutputKind::Stdout => (&mut self.stdout, &mut self.consumed.stdout_consumed),
            OutputKind::Stderr => (&mut self.stderr, &mut self.consumed.stderr_consumed),
        }
    }

    #[allow(clippy::panic)]
    fn ensure_available(&mut self, kind: OutputKind) {
        let (pipe, consumed) = self.slot(kind);
        if *consumed {
            panic!("{kind} of this execution was already consumed");
        }
        if pipe.is_none() {
            panic!("{kind} of this execution was not redirected to a pipe");
        }
    }

    /// Hand out the read end and flip the consumed bit.
    fn take(&mut self, kind: OutputKind) -> Option<OwnedFd> {
        self.ensure_available(kind);
        let (pipe, consumed) = self.slot(kind);
        *consumed = true;
        pipe.take()
    }
}

/// A running (or already exited) child and the parent ends of its pipes.
pub struct Execution {
    pid: ProcessId,
    process_group: Option<ProcessId>,
    pipes: Mutex<Pipes>,
}

impl Execution {
    pub(crate) fn new(
        pid: ProcessId,
        process_group: Option<ProcessId>,
        stdin: Option<OwnedFd>,
        stdout: Option<OwnedFd>,
        stderr: Option<OwnedFd>,
    ) -> Self {
        Self {
            pid,
            process_group,
            pipes: Mutex::new(Pipes {
                stdin,
                stdout,
                stderr,
                consumed: OutputConsumptionState::default(),
            }),
        }
    }

    pub fn pid(&self) -> ProcessId {
        self.pid
    }

    /// The process group the child leads or joined, if the spawn created a
    /// session or assigned a group.
    pub fn process_group(&self) -> Option<ProcessId> {
        self.process_group
    }

    fn lock_pipes(&self) -> MutexGuard<'_, Pipes> {
        self.pipes.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn consumption_state(&self) -> OutputConsumptionState {
        self.lock_pipes().consumed
    }

    /// Take the write end of the child's stdin pipe. `None` if it was never
    /// supplied or was already taken.
    pub fn take_stdin(&self) -> Option<OwnedFd> {
        self.lock_pipes().stdin.take()
    }

    /// Lazily read the child's stdout. Must be called inside a Tokio runtime.
    ///
    /// # Panics
    ///
    /// If stdout was already consumed or was not piped.
    pub fn stdout(&self) -> io::Result<OutputStream> {
        self.stream(OutputKind::Stdout)
    }

    /// Lazily read the child's stderr. Must be called inside a Tokio runtime.
    ///
    /// # Panics
    ///
    /// If stderr was already consumed or was not piped.
    pub fn stderr(&self) -> io::Result<OutputStream> {
        self.stream(OutputKind::Stderr)
    }

    fn stream(&self, kind: OutputKind) -> io::Result<OutputStream> {
        let fd = self.lock_pipes().take(kind).ok_or_else(missing_pipe)?;
        debug!(pid = %self.pid, stream = %kind, "output stream handed out");
        Ok(ReaderStream::new(Receiver::from_owned_fd(fd)?))
    }

    /// Read stdout and stderr to end-of-file concurrently and return both.
    ///
    /// Each pipe is drained by its own task, so a child that fills one pipe
    /// while the other is still open never blocks.
    ///
    /// # Panics
    ///
    /// If either stream was already consumed or was not piped.
    pub async fn capture_ios(&self) -> io::Result<CapturedIos> {
        let (stdout, stderr) = {
            let mut pipes = self.lock_pipes();
            pipes.ensure_available(OutputKind::Stdout);
            pipes.ensure_available(OutputKind::Stderr);
            (pipes.take(OutputKind::Stdout), pipes.take(OutputKind::Stderr))
        };
        let stdout = Receiver::from_owned_fd(stdout.ok_or_else(missing_pipe)?)?;
        let stderr = Receiver::from_owned_fd(stderr.ok_or_else(missing_pipe)?)?;

        let stdout_task = tokio::spawn(read_to_end(stdout));
        let stderr_task = tokio::spawn(read_to_end(stderr));
        let (stdout, stderr) = tokio::join!(stdout_task, stderr_task);

        let captured = CapturedIos {
            stdout: stdout.map_err(io::Error::other)??,
            stderr: stderr.map_err(io::Error::other)??,
        };
        debug!(
            pid = %self.pid,
            stdout_len = captured.stdout.len(),
            stderr_len = captured.stderr.len(),
            "captured output"
        );
        Ok(captured)
    }

    /// Deliver `signal` to the child.
    pub fn send_signal(&self, signal: Signal) -> Result<()> {
        signal::kill(Pid::from(self.pid), signal)?;
        Ok(())
    }

    /// Deliver `signal` to the child's whole process group.
    ///
    /// # Panics
    ///
    /// If the spawn neither created a session nor assigned a process group;
    /// the child then shares the caller's group.
    #[allow(clippy::panic)]
    pub fn send_signal_to_group(&self, signal: Signal) -> Result<()> {
        let Some(pgid) = self.process_group else {
            panic!("execution {} has no process group of its own", self.pid);
        };
        signal::killpg(Pid::from(pgid), signal)?;
        Ok(())
    }

    /// Wait for the child to terminate and reap it.
    pub async fn wait(&self) -> Result<TerminationStatus> {
        let pid = self.pid;
        tokio::task::spawn_blocking(move || wait_blocking(pid))
            .await
            .map_err(io::Error::other)?
    }

    /// Reap the child if it has already terminated.
    pub fn try_wait(&self) -> Result<Option<TerminationStatus>> {
        let mut status: libc::c_int = 0;
        loop {
            // SAFETY: status is a valid out-pointer.
            let rc = unsafe { libc::waitpid(self.pid.as_raw(), &mut status, libc::WNOHANG) };
            match Errno::result(rc) {
                Ok(0) => return Ok(None),
                Ok(_) => return Ok(TerminationStatus::from_raw(status)),
                Err(Errno::EINTR) => continue,
                Err(errno) => return Err(errno.into()),
            }
        }
    }
}

fn wait_blocking(pid: ProcessId) -> Result<TerminationStatus> {
    let mut status: libc::c_int = 0;
    loop {
        // SAFETY: status is a valid out-pointer.
        let rc = unsafe { libc::waitpid(pid.as_raw(), &mut status, 0) };
        match Errno::result(rc) {
            Ok(_) => {
                if let Some(terminated) = TerminationStatus::from_raw(status) {
                    return Ok(terminated);
                }
            }
            Err(Errno::EINTR) => {}
            Err(errno) => return Err(errno.into()),
        }
    }
}

fn missing_pipe() -> io::Error {
    io::Error::other("output pipe missing after availability check")
}

async fn read_to_end<R: AsyncRead + Unpin>(mut reader: R) -> io::Result<Vec<u8>> {
    let mut buf = Vec::new();
    reader.read_to_end(&mut buf).await?;
    Ok(buf)
}

impl fmt::Debug for Execution {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Execution")
            .field("pid", &self.pid)
            .field("process_group", &self.process_group)
            .field("consumed", &self.consumption_state())
            .finish()
    }
}

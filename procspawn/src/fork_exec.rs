//! Spawn by duplicating the caller: `fork`, child-side setup, `execve`.
//!
//! Used whenever the request asks for something `posix_spawn` cannot express
//! atomically (identity, supplementary groups, session, working directory,
//! pre-exec hook). Failures between `fork` and `execve` travel back to the
//! parent over a close-on-exec pipe:
//!
//! ```text
//! parent                          child
//! ------                          -----
//! pipe(O_CLOEXEC)
//! block all signals
//! fork ─────────────────────────▶ reset dispositions, close read end
//! restore signal mask             setgroups → setgid → setuid
//! close write end                 setsid / setpgid
//! read(report, 4 bytes) ◀──┐      dup2 stdio, close parent ends
//!   0 bytes  → exec worked │      chdir, unblock signals, pre-exec hook
//!   4 bytes  → errno       └───── execve   (on failure: write errno, _exit)
//! ```
//!
//! The child branch runs in a copy of a possibly multi-threaded process, so
//! it only makes async-signal-safe libc calls on data marshaled in the parent:
//! no allocation, no locks, no logging, no destructors.

use std::convert::Infallible;
use std::ffi::CStr;
use std::os::fd::{AsRawFd, OwnedFd, RawFd};

use libc::c_char;
use nix::errno::Errno;
use tracing::debug;

use crate::pipe::pipe;
use crate::request::{PreExecHook, ProcessId};
use crate::signals::{self, BlockAllSignals};

/// Size of one error report on the pipe: a native `int` errno.
const REPORT_LEN: usize = std::mem::size_of::<libc::c_int>();

/// Everything the child needs, in primitive form.
pub(crate) struct ChildSetup<'a> {
    pub path: &'a CStr,
    pub argv: *const *const c_char,
    pub envp: *const *const c_char,
    pub cwd: Option<&'a CStr>,
    pub fds: [RawFd; 6],
    pub uid: Option<libc::uid_t>,
    pub gid: Option<libc::gid_t>,
    pub groups: &'a [libc::gid_t],
    pub process_group: Option<libc::pid_t>,
    pub create_session: bool,
    pub pre_exec: Option<&'a mut PreExecHook>,
}

/// Fork and exec. Blocks until the child has either replaced its image or
/// reported the errno of the first setup step that failed.
pub(crate) fn spawn(setup: &mut ChildSetup<'_>) -> Result<ProcessId, Errno> {
    let (report_read, report_write) = pipe()?;
    let blocked = BlockAllSignals::new()?;

    // SAFETY: the child branch only runs `run_child`, which is restricted to
    // async-signal-safe calls, and leaves through `_exit`.
    let pid = unsafe { libc::fork() };
    if pid == 0 {
        let errno = run_child(setup, report_read.as_raw_fd());
        // SAFETY: still in the child; the write end is open.
        unsafe { report_and_exit(report_write.as_raw_fd(), errno) }
    }
    let fork_errno = Errno::last();
    drop(blocked);
    if pid < 0 {
        return Err(fork_errno);
    }
    drop(report_write);

    match read_report(report_read) {
        Ok(None) => Ok(ProcessId::from_raw(pid)),
        Ok(Some(errno)) => {
            reap(pid);
            debug!(pid, %errno, "child failed before exec");
            Err(errno)
        }
        Err(errno) => {
            // The child's state is unknown; do not leave it running.
            // SAFETY: pid is our own unreaped child.
            unsafe { libc::kill(pid, libc::SIGKILL) };
            reap(pid);
            Err(errno)
        }
    }
}

fn run_child(setup: &mut ChildSetup<'_>, report_read: RawFd) -> Errno {
    match child_steps(setup, report_read) {
        Ok(never) => match never {},
        Err(errno) => errno,
    }
}

/// The ordered child-side setup. Returns only on failure.
fn child_steps(setup: &mut ChildSetup<'_>, report_read: RawFd) -> Result<Infallible, Errno> {
    signals::reset_dispositions_in_child();
    // SAFETY (all blocks below): async-signal-safe libc calls on descriptors
    // and strings prepared before fork.
    Errno::result(unsafe { libc::close(report_read) })?;

    // Groups before gid before uid: each step needs the privilege the next
    // one gives up.
    if !setup.groups.is_empty() {
        Errno::result(unsafe { libc::setgroups(setup.groups.len() as _, setup.groups.as_ptr()) })?;
    }
    if let Some(gid) = setup.gid {
        Errno::result(unsafe { libc::setgid(gid) })?;
    }
    if let Some(uid) = setup.uid {
        Errno::result(unsafe { libc::setuid(uid) })?;
    }

    if setup.create_session {
        Errno::result(unsafe { libc::setsid() })?;
    }
    if let Some(pgid) = setup.process_group {
        Errno::result(unsafe { libc::setpgid(0, pgid) })?;
    }

    rebind_stdio(setup.fds)?;

    if let Some(cwd) = setup.cwd {
        Errno::result(unsafe { libc::chdir(cwd.as_ptr()) })?;
    }

    signals::unblock_all_in_child()?;
    if let Some(hook) = setup.pre_exec.as_deref_mut()
        && let Err(err) = hook()
    {
        let code = err.raw_os_error().unwrap_or(libc::EINVAL);
        // Dropping a custom io::Error would free memory.
        std::mem::forget(err);
        return Err(Errno::from_raw(code));
    }

    unsafe { libc::execve(setup.path.as_ptr(), setup.argv, setup.envp) };
    Err(Errno::last())
}

/// Move the child-side slots onto 0/1/2 and close every other slot.
///
/// Slots arrive numbered above 2 (see `StdioSlots::relocate_standard_numbers`),
/// so no dup2 clobbers a slot that a later step still reads.
fn rebind_stdio(fds: [RawFd; 6]) -> Result<(), Errno> {
    let [in_child, in_parent, out_child, out_parent, err_child, err_parent] = fds;
    let bindings = [
        (in_child, libc::STDIN_FILENO),
        (out_child, libc::STDOUT_FILENO),
        (err_child, libc::STDERR_FILENO),
    ];

    for (fd, target) in bindings {
        if fd >= 0 {
            Errno::result(unsafe { libc::dup2(fd, target) })?;
        }
    }

    for (index, (fd, _)) in bindings.iter().enumerate() {
        let closed_already = bindings
            .iter()
            .take(index)
            .any(|(earlier, _)| earlier == fd);
        if *fd > libc::STDERR_FILENO && !closed_already {
            Errno::result(unsafe { libc::close(*fd) })?;
        }
    }
    for fd in [in_parent, out_parent, err_parent] {
        if fd > libc::STDERR_FILENO {
            Errno::result(unsafe { libc::close(fd) })?;
        }
    }
    Ok(())
}

/// Write `errno` to the report pipe and terminate without running any
/// cleanup.
///
/// # Safety
///
/// Only for the forked child.
unsafe fn report_and_exit(fd: RawFd, errno: Errno) -> ! {
    let bytes = (errno as libc::c_int).to_ne_bytes();
    // SAFETY: write and _exit are async-signal-safe; bytes lives on the stack.
    unsafe {
        libc::write(fd, bytes.as_ptr().cast(), bytes.len());
        libc::_exit(libc::EXIT_FAILURE)
    }
}

/// Read the child's report: `None` on EOF (exec succeeded), the errno
/// otherwise.
fn read_report(fd: OwnedFd) -> Result<Option<Errno>, Errno> {
    let mut buf = [0u8; REPORT_LEN];
    let mut filled = 0;
    while filled < REPORT_LEN {
        let rest = buf.get_mut(filled..).unwrap_or_default();
        // SAFETY: rest is a writable buffer of rest.len() bytes.
        let n = unsafe { libc::read(fd.as_raw_fd(), rest.as_mut_ptr().cast(), rest.len()) };
        match Errno::result(n) {
            Ok(0) => break,
            Ok(n) => filled += n.unsigned_abs(),
            Err(Errno::EINTR) => continue,
            Err(errno) => return Err(errno),
        }
    }
    match filled {
        0 => Ok(None),
        REPORT_LEN => Ok(Some(Errno::from_raw(libc::c_int::from_ne_bytes(buf)))),
        _ => Err(Errno::EIO),
    }
}

/// Collect a child that is known to be exiting.
fn reap(pid: libc::pid_t) {
    loop {
        // SAFETY: waitpid on our own child; the status is not needed.
        let rc = unsafe { libc::waitpid(pid, std::ptr::null_mut(), 0) };
        if rc >= 0 || Errno::last() != Errno::EINTR {
            break;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn report_pipe_eof_means_success() {
        let (read, write) = pipe().unwrap();
        drop(write);
        assert_eq!(read_report(read).unwrap(), None);
    }

    #[test]
    fn report_pipe_carries_native_errno() {
        let (read, write) = pipe().unwrap();
        let bytes = libc::EACCES.to_ne_bytes();
        let n = unsafe { libc::write(write.as_raw_fd(), bytes.as_ptr().cast(), bytes.len()) };
        assert_eq!(n, REPORT_LEN as isize);
        drop(write);
        assert_eq!(read_report(read).unwrap(), Some(Errno::EACCES));
    }

    #[test]
    fn truncated_report_is_an_error() {
        let (read, write) = pipe().unwrap();
        let n = unsafe { libc::write(write.as_raw_fd(), [1u8].as_ptr().cast(), 1) };
        assert_eq!(n, 1);
        drop(write);
        assert_eq!(read_report(read), Err(Errno::EIO));
    }
}

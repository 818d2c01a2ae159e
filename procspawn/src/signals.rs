//! Signal-mask handling around the spawn window.

use std::mem::MaybeUninit;

use nix::errno::Errno;

/// Highest signal number whose disposition is reset in a forked child.
#[cfg(target_vendor = "apple")]
const MAX_SIGNAL: libc::c_int = 31;
#[cfg(not(target_vendor = "apple"))]
const MAX_SIGNAL: libc::c_int = 64;

pub(crate) fn empty_set() -> libc::sigset_t {
    let mut set = MaybeUninit::<libc::sigset_t>::uninit();
    // SAFETY: sigemptyset fully initializes the set and cannot fail for a valid pointer.
    unsafe {
        libc::sigemptyset(set.as_mut_ptr());
        set.assume_init()
    }
}

pub(crate) fn full_set() -> libc::sigset_t {
    let mut set = MaybeUninit::<libc::sigset_t>::uninit();
    // SAFETY: sigfillset fully initializes the set and cannot fail for a valid pointer.
    unsafe {
        libc::sigfillset(set.as_mut_ptr());
        set.assume_init()
    }
}

/// Blocks every signal on the calling thread until dropped, then restores the
/// previous mask.
pub(crate) struct BlockAllSignals {
    previous: libc::sigset_t,
}

impl BlockAllSignals {
    pub(crate) fn new() -> Result<Self, Errno> {
        let all = full_set();
        let mut previous = empty_set();
        // SAFETY: both sets are initialized; pthread_sigmask returns an error number.
        let rc = unsafe { libc::pthread_sigmask(libc::SIG_SETMASK, &all, &mut previous) };
        if rc != 0 {
            return Err(Errno::from_raw(rc));
        }
        Ok(Self { previous })
    }
}

impl Drop for BlockAllSignals {
    fn drop(&mut self) {
        // SAFETY: restores a mask previously returned by pthread_sigmask.
        unsafe {
            libc::pthread_sigmask(libc::SIG_SETMASK, &self.previous, std::ptr::null_mut());
        }
    }
}

/// Reset every catchable signal to its default disposition.
///
/// Async-signal-safe; runs in the forked child while all signals are still
/// blocked, so no handler inherited from the parent can run. Signal numbers
/// the platform rejects (`SIGKILL`, `SIGSTOP`, reserved real-time signals)
/// fail with `EINVAL` and are skipped.
pub(crate) fn reset_dispositions_in_child() {
    for sig in 1..=MAX_SIGNAL {
        if sig == libc::SIGKILL || sig == libc::SIGSTOP {
            continue;
        }
        // SAFETY: signal(2) is async-signal-safe; SIG_DFL installs no handler.
        unsafe {
            libc::signal(sig, libc::SIG_DFL);
        }
    }
}

/// Clear the signal mask of the (single-threaded) forked child.
pub(crate) fn unblock_all_in_child() -> Result<(), Errno> {
    let none = empty_set();
    // SAFETY: sigprocmask is async-signal-safe and `none` is initialized.
    let rc = unsafe { libc::sigprocmask(libc::SIG_SETMASK, &none, std::ptr::null_mut()) };
    Errno::result(rc).map(drop)
}

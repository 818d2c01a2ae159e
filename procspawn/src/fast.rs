//! Single-call spawn through `posix_spawn`.

use std::ffi::CStr;
use std::mem::MaybeUninit;
use std::os::fd::RawFd;

use libc::c_char;
use nix::errno::Errno;
use tracing::trace;

use crate::request::ProcessId;
use crate::signals;

/// Inputs of the native spawn, all marshaled by the caller.
pub(crate) struct NativeSpawn<'a> {
    pub path: &'a CStr,
    pub argv: *const *const c_char,
    pub envp: *const *const c_char,
    pub fds: [RawFd; 6],
    pub process_group: Option<libc::pid_t>,
}

fn check(rc: libc::c_int) -> Result<(), Errno> {
    if rc == 0 {
        Ok(())
    } else {
        Err(Errno::from_raw(rc))
    }
}

struct FileActions(libc::posix_spawn_file_actions_t);

impl FileActions {
    fn new() -> Result<Self, Errno> {
        let mut raw = MaybeUninit::uninit();
        // SAFETY: init writes a valid file-actions object on success.
        check(unsafe { libc::posix_spawn_file_actions_init(raw.as_mut_ptr()) })?;
        // SAFETY: initialized above.
        Ok(Self(unsafe { raw.assume_init() }))
    }

    fn dup2(&mut self, fd: RawFd, target: RawFd) -> Result<(), Errno> {
        trace!(fd, target, "file action: dup2");
        // SAFETY: self.0 is an initialized file-actions object.
        check(unsafe { libc::posix_spawn_file_actions_adddup2(&mut self.0, fd, target) })
    }

    fn close(&mut self, fd: RawFd) -> Result<(), Errno> {
        trace!(fd, "file action: close");
        // SAFETY: self.0 is an initialized file-actions object.
        check(unsafe { libc::posix_spawn_file_actions_addclose(&mut self.0, fd) })
    }
}

impl Drop for FileActions {
    fn drop(&mut self) {
        // SAFETY: destroyed exactly once.
        unsafe {
            libc::posix_spawn_file_actions_destroy(&mut self.0);
        }
    }
}

struct Attributes(libc::posix_spawnattr_t);

impl Attributes {
    fn new() -> Result<Self, Errno> {
        let mut raw = MaybeUninit::uninit();
        // SAFETY: init writes a valid attribute object on success.
        check(unsafe { libc::posix_spawnattr_init(raw.as_mut_ptr()) })?;
        // SAFETY: initialized above.
        Ok(Self(unsafe { raw.assume_init() }))
    }
}

impl Drop for Attributes {
    fn drop(&mut self) {
        // SAFETY: destroyed exactly once.
        unsafe {
            libc::posix_spawnattr_destroy(&mut self.0);
        }
    }
}

/// Rebind the child-side slots onto 0/1/2, then close the originals and the
/// parent-side ends in the child's descriptor table.
fn file_actions(fds: [RawFd; 6]) -> Result<FileActions, Errno> {
    let [in_child, in_parent, out_child, out_parent, err_child, err_parent] = fds;
    let mut actions = FileActions::new()?;

    let bindings = [
        (in_child, libc::STDIN_FILENO),
        (out_child, libc::STDOUT_FILENO),
        (err_child, libc::STDERR_FILENO),
    ];
    for (fd, target) in bindings {
        if fd >= 0 {
            actions.dup2(fd, target)?;
        }
    }
    let mut closed: Vec<RawFd> = Vec::with_capacity(6);
    for (fd, _) in bindings {
        if fd > libc::STDERR_FILENO && !closed.contains(&fd) {
            actions.close(fd)?;
            closed.push(fd);
        }
    }
    for fd in [in_parent, out_parent, err_parent] {
        if fd > libc::STDERR_FILENO {
            actions.close(fd)?;
        }
    }
    Ok(actions)
}

/// Default signal dispositions and an empty mask in the child, plus the
/// optional process group.
fn attributes(process_group: Option<libc::pid_t>) -> Result<Attributes, Errno> {
    let mut attrs = Attributes::new()?;
    let none = signals::empty_set();
    let all = signals::full_set();
    // SAFETY: attrs.0 is initialized; the sets outlive the calls.
    unsafe {
        check(libc::posix_spawnattr_setsigmask(&mut attrs.0, &none))?;
        check(libc::posix_spawnattr_setsigdefault(&mut attrs.0, &all))?;
    }

    let mut flags = libc::POSIX_SPAWN_SETSIGMASK | libc::POSIX_SPAWN_SETSIGDEF;
    if let Some(pgid) = process_group {
        flags |= libc::POSIX_SPAWN_SETPGROUP;
        trace!(pgid, "spawn attribute: process group");
        // SAFETY: attrs.0 is initialized.
        check(unsafe { libc::posix_spawnattr_setpgroup(&mut attrs.0, pgid) })?;
    }
    // SAFETY: attrs.0 is initialized; the flag constants fit in c_short.
    check(unsafe { libc::posix_spawnattr_setflags(&mut attrs.0, flags as libc::c_short) })?;
    Ok(attrs)
}

/// Create the child with one `posix_spawn` call.
///
/// On failure the parent's state is untouched and the primitive's own error
/// number comes back verbatim.
pub(crate) fn spawn(request: &NativeSpawn<'_>) -> Result<ProcessId, Errno> {
    let actions = file_actions(request.fds)?;
    let attrs = attributes(request.process_group)?;

    // Apple's posix_spawn is called bare. Elsewhere the parent blocks every
    // signal across the call and restores its own mask afterwards.
    #[cfg(not(target_vendor = "apple"))]
    let _blocked = signals::BlockAllSignals::new()?;

    let mut pid: libc::pid_t = 0;
    // SAFETY: every pointer is valid for the duration of the call; argv and
    // envp are NULL-terminated arrays of NUL-terminated strings.
    let rc = unsafe {
        libc::posix_spawn(
            &mut pid,
            request.path.as_ptr(),
            &actions.0,
            &attrs.0,
            request.argv.cast(),
            request.envp.cast(),
        )
    };
    check(rc)?;
    Ok(ProcessId::from_raw(pid))
}

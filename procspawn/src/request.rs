use std::collections::BTreeMap;
use std::ffi::{OsStr, OsString};
use std::fmt;
use std::io;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};
use std::path::{Path, PathBuf};

use nix::errno::Errno;
use nix::unistd::{Gid, Pid, Uid};
use tracing::trace;

use crate::pipe::pipe;

/// Opaque wrapper around the OS process id of a spawned child.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ProcessId(libc::pid_t);

impl ProcessId {
    pub(crate) fn from_raw(pid: libc::pid_t) -> Self {
        Self(pid)
    }

    pub fn as_raw(self) -> libc::pid_t {
        self.0
    }
}

impl From<ProcessId> for Pid {
    fn from(pid: ProcessId) -> Self {
        Pid::from_raw(pid.0)
    }
}

impl fmt::Display for ProcessId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Environment the child starts with.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum Environment {
    /// Pass the calling process's live environment block through.
    #[default]
    Inherit,
    /// Replace the environment entirely with this mapping.
    Replace(BTreeMap<OsString, OsString>),
}

/// The six descriptor slots of a spawn: three child/parent pairs.
///
/// The `child_*` ends are rebound onto fds 0, 1 and 2 in the child and closed
/// in the parent once the spawn returns. The `parent_*` ends are closed in the
/// child and handed to the [`crate::Execution`]. An unset child slot means the
/// child inherits the caller's stream.
#[derive(Debug, Default)]
pub struct StdioSlots {
    pub child_stdin: Option<OwnedFd>,
    pub parent_stdin: Option<OwnedFd>,
    pub child_stdout: Option<OwnedFd>,
    pub parent_stdout: Option<OwnedFd>,
    pub child_stderr: Option<OwnedFd>,
    pub parent_stderr: Option<OwnedFd>,
}

impl StdioSlots {
    pub fn new() -> Self {
        Self::default()
    }

    /// Connect the child's stdin to a fresh pipe the parent writes.
    pub fn piped_stdin(mut self) -> Result<Self, Errno> {
        let (read, write) = pipe()?;
        self.child_stdin = Some(read);
        self.parent_stdin = Some(write);
        Ok(self)
    }

    /// Connect the child's stdout to a fresh pipe the parent reads.
    pub fn piped_stdout(mut self) -> Result<Self, Errno> {
        let (read, write) = pipe()?;
        self.child_stdout = Some(write);
        self.parent_stdout = Some(read);
        Ok(self)
    }

    /// Connect the child's stderr to a fresh pipe the parent reads.
    pub fn piped_stderr(mut self) -> Result<Self, Errno> {
        let (read, write) = pipe()?;
        self.child_stderr = Some(write);
        self.parent_stderr = Some(read);
        Ok(self)
    }

    /// Bind the child's stdin to an already open descriptor (file, null device).
    pub fn stdin_from(mut self, fd: OwnedFd) -> Self {
        self.child_stdin = Some(fd);
        self
    }

    pub fn stdout_to(mut self, fd: OwnedFd) -> Self {
        self.child_stdout = Some(fd);
        self
    }

    pub fn stderr_to(mut self, fd: OwnedFd) -> Self {
        self.child_stderr = Some(fd);
        self
    }

    /// Move every slot numbered 0..=2 to a fresh close-on-exec descriptor
    /// above 2.
    ///
    /// Afterwards no slot collides with a rebinding target, so the child can
    /// dup2 onto 0/1/2 in any order and close every slot it does not keep.
    pub(crate) fn relocate_standard_numbers(&mut self) -> Result<(), Errno> {
        for slot in [
            &mut self.child_stdin,
            &mut self.parent_stdin,
            &mut self.child_stdout,
            &mut self.parent_stdout,
            &mut self.child_stderr,
            &mut self.parent_stderr,
        ] {
            let Some(fd) = slot.as_ref() else { continue };
            let raw = fd.as_raw_fd();
            if raw > libc::STDERR_FILENO {
                continue;
            }
            // SAFETY: raw is open and owned by this slot.
            let moved = Errno::result(unsafe {
                libc::fcntl(raw, libc::F_DUPFD_CLOEXEC, libc::STDERR_FILENO + 1)
            })?;
            trace!(from = raw, to = moved, "relocated stdio slot");
            // SAFETY: fcntl returned a new descriptor nobody else owns.
            *slot = Some(unsafe { OwnedFd::from_raw_fd(moved) });
        }
        Ok(())
    }

    /// Raw numbers in slot order, `-1` for unset slots.
    pub(crate) fn raw_fds(&self) -> [RawFd; 6] {
        let raw = |slot: &Option<OwnedFd>| slot.as_ref().map_or(-1, AsRawFd::as_raw_fd);
        [
            raw(&self.child_stdin),
            raw(&self.parent_stdin),
            raw(&self.child_stdout),
            raw(&self.parent_stdout),
            raw(&self.child_stderr),
            raw(&self.parent_stderr),
        ]
    }
}

/// Closure run in the child after all other setup, right before `execve`.
pub type PreExecHook = Box<dyn FnMut() -> io::Result<()> + Send + Sync>;

/// Everything needed to spawn one child.
pub struct SpawnRequest {
    pub(crate) path: PathBuf,
    pub(crate) args: Vec<OsString>,
    pub(crate) env: Environment,
    pub(crate) cwd: Option<PathBuf>,
    pub(crate) stdio: StdioSlots,
    pub(crate) uid: Option<Uid>,
    pub(crate) gid: Option<Gid>,
    pub(crate) groups: Vec<Gid>,
    pub(crate) process_group: Option<Pid>,
    pub(crate) create_session: bool,
    pub(crate) pre_exec: Option<PreExecHook>,
}

impl SpawnRequest {
    /// A request for `path` with `argv[0]` set to `path`.
    ///
    /// `path` is used verbatim; it is never searched for in `PATH`.
    pub fn new(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let arg0 = path.as_os_str().to_owned();
        Self {
            path,
            args: vec![arg0],
            env: Environment::Inherit,
            cwd: None,
            stdio: StdioSlots::default(),
            uid: None,
            gid: None,
            groups: Vec::new(),
            process_group: None,
            create_session: false,
            pre_exec: None,
        }
    }

    /// Override `argv[0]`.
    pub fn arg0(mut self, arg0: impl AsRef<OsStr>) -> Self {
        match self.args.first_mut() {
            Some(first) => *first = arg0.as_ref().to_owned(),
            None => self.args.push(arg0.as_ref().to_owned()),
        }
        self
    }

    pub fn arg(mut self, arg: impl AsRef<OsStr>) -> Self {
        self.args.push(arg.as_ref().to_owned());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<OsStr>,
    {
        self.args
            .extend(args.into_iter().map(|a| a.as_ref().to_owned()));
        self
    }

    pub fn environment(mut self, env: Environment) -> Self {
        self.env = env;
        self
    }

    /// Set one variable. An inherited environment is snapshotted first, so the
    /// child sees the current environment plus this entry.
    pub fn env(mut self, key: impl AsRef<OsStr>, value: impl AsRef<OsStr>) -> Self {
        if self.env == Environment::Inherit {
            self.env = Environment::Replace(std::env::vars_os().collect());
        }
        if let Environment::Replace(vars) = &mut self.env {
            vars.insert(key.as_ref().to_owned(), value.as_ref().to_owned());
        }
        self
    }

    /// Start the child with an empty environment.
    pub fn env_clear(mut self) -> Self {
        self.env = Environment::Replace(BTreeMap::new());
        self
    }

    pub fn current_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.cwd = Some(dir.into());
        self
    }

    pub fn stdio(mut self, stdio: StdioSlots) -> Self {
        self.stdio = stdio;
        self
    }

    pub fn uid(mut self, uid: Uid) -> Self {
        self.uid = Some(uid);
        self
    }

    pub fn gid(mut self, gid: Gid) -> Self {
        self.gid = Some(gid);
        self
    }

    /// Supplementary groups, applied with `setgroups` before gid and uid.
    pub fn groups(mut self, groups: impl IntoIterator<Item = Gid>) -> Self {
        self.groups = groups.into_iter().collect();
        self
    }

    /// Move the child into process group `pgid`; `Pid::from_raw(0)` makes the
    /// child the leader of a new group.
    pub fn process_group(mut self, pgid: Pid) -> Self {
        self.process_group = Some(pgid);
        self
    }

    /// Run the child in a new session (`setsid`).
    pub fn create_session(mut self, create: bool) -> Self {
        self.create_session = create;
        self
    }

    /// Run `hook` in the child right before the image is replaced.
    ///
    /// An `Err` aborts the spawn; its raw OS error (or `EINVAL` when it has
    /// none) is reported to the parent.
    ///
    /// # Safety
    ///
    /// The hook runs between `fork` and `execve` in a copy of a possibly
    /// multi-threaded process. It must only call async-signal-safe functions:
    /// no allocation, no locks, no logging.
    pub unsafe fn pre_exec<F>(mut self, hook: F) -> Self
    where
        F: FnMut() -> io::Result<()> + Send + Sync + 'static,
    {
        self.pre_exec = Some(Box::new(hook));
        self
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn get_args(&self) -> &[OsString] {
        &self.args
    }
}

impl fmt::Debug for SpawnRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SpawnRequest")
            .field("path", &self.path)
            .field("args", &self.args)
            .field("env", &self.env)
            .field("cwd", &self.cwd)
            .field("stdio", &self.stdio)
            .field("uid", &self.uid)
            .field("gid", &self.gid)
            .field("groups", &self.groups)
            .field("process_group", &self.process_group)
            .field("create_session", &self.create_session)
            .field("pre_exec", &self.pre_exec.is_some())
            .finish()
    }
}

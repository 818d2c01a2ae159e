//! Entry point: turn a [`SpawnRequest`] into a running [`Execution`].

use tracing::{debug, warn};

use crate::environ;
use crate::error::Result;
use crate::execution::Execution;
use crate::fast::{self, NativeSpawn};
use crate::fork_exec::{self, ChildSetup};
use crate::marshal;
use crate::request::{Environment, ProcessId, SpawnRequest, StdioSlots};
use crate::strategy::SpawnStrategy;

/// Spawn the program described by `request`.
///
/// The call returns once the child has replaced its image with the target
/// program, or with the errno of the step that prevented it. Child-side
/// descriptors in the request's [`StdioSlots`] are closed in the parent
/// before this returns; parent-side ones move into the [`Execution`].
///
/// `path` is used verbatim; no `PATH` lookup happens here.
pub fn spawn(mut request: SpawnRequest) -> Result<Execution> {
    let strategy = SpawnStrategy::select(&request);

    let path = marshal::path(&request.path, "program path")?;
    let argv = marshal::argv(&request.args)?;
    let envp = match &request.env {
        Environment::Inherit => None,
        Environment::Replace(vars) => Some(marshal::envp(vars)?),
    };
    let cwd = request
        .cwd
        .as_deref()
        .map(|dir| marshal::path(dir, "working directory"))
        .transpose()?;
    request.stdio.relocate_standard_numbers()?;
    let fds = request.stdio.raw_fds();
    let process_group = request.process_group.map(|pgid| pgid.as_raw());

    let spawned = {
        let environ = environ::lock();
        let envp = envp
            .as_ref()
            .map_or_else(|| environ.as_ptr(), |envp| envp.as_ptr());

        match strategy {
            SpawnStrategy::PosixSpawn => fast::spawn(&NativeSpawn {
                path: &path,
                argv: argv.as_ptr(),
                envp,
                fds,
                process_group,
            }),
            SpawnStrategy::ForkExec => {
                let groups: Vec<libc::gid_t> =
                    request.groups.iter().map(|gid| gid.as_raw()).collect();
                fork_exec::spawn(&mut ChildSetup {
                    path: &path,
                    argv: argv.as_ptr(),
                    envp,
                    cwd: cwd.as_deref(),
                    fds,
                    uid: request.uid.map(|uid| uid.as_raw()),
                    gid: request.gid.map(|gid| gid.as_raw()),
                    groups: &groups,
                    process_group,
                    create_session: request.create_session,
                    pre_exec: request.pre_exec.as_mut(),
                })
            }
        }
    };

    let StdioSlots {
        child_stdin,
        parent_stdin,
        child_stdout,
        parent_stdout,
        child_stderr,
        parent_stderr,
    } = request.stdio;
    drop((child_stdin, child_stdout, child_stderr));

    let pid = match spawned {
        Ok(pid) => pid,
        Err(errno) => {
            warn!(
                path = %request.path.display(),
                %strategy,
                %errno,
                "spawn failed"
            );
            return Err(errno.into());
        }
    };
    debug!(
        %pid,
        path = %request.path.display(),
        argc = argv.len(),
        %strategy,
        "spawned child"
    );

    let own_group = if request.create_session {
        Some(pid)
    } else {
        process_group.map(|pgid| if pgid == 0 { pid } else { ProcessId::from_raw(pgid) })
    };

    Ok(Execution::new(
        pid,
        own_group,
        parent_stdin,
        parent_stdout,
        parent_stderr,
    ))
}

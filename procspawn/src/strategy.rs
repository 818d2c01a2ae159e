use std::fmt;

use crate::request::SpawnRequest;

/// `posix_spawn` can place the child in a process group on Apple platforms.
/// Elsewhere a process group request goes through fork/exec.
const NATIVE_PROCESS_GROUP: bool = cfg!(target_vendor = "apple");

/// How a request is turned into a child process.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SpawnStrategy {
    /// One `posix_spawn` call builds the child.
    PosixSpawn,
    /// `fork`, child-side setup, then `execve`.
    ForkExec,
}

impl SpawnStrategy {
    /// Pick the strategy for `request`. Pure function of the request's policy.
    pub fn select(request: &SpawnRequest) -> Self {
        Self::for_policy(Policy::of(request))
    }

    fn for_policy(policy: Policy) -> Self {
        let needs_fork = policy.identity
            || policy.supplementary_groups
            || policy.new_session
            || policy.working_directory
            || policy.pre_exec
            || (policy.process_group && !NATIVE_PROCESS_GROUP);
        if needs_fork {
            Self::ForkExec
        } else {
            Self::PosixSpawn
        }
    }
}

impl fmt::Display for SpawnStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::PosixSpawn => f.write_str("posix_spawn"),
            Self::ForkExec => f.write_str("fork/exec"),
        }
    }
}

/// Which of the policies `posix_spawn` may not express are present.
#[derive(Debug, Clone, Copy, Default)]
struct Policy {
    identity: bool,
    supplementary_groups: bool,
    new_session: bool,
    process_group: bool,
    working_directory: bool,
    pre_exec: bool,
}

impl Policy {
    fn of(request: &SpawnRequest) -> Self {
        Self {
            identity: request.uid.is_some() || request.gid.is_some(),
            supplementary_groups: !request.groups.is_empty(),
            new_session: request.create_session,
            process_group: request.process_group.is_some(),
            working_directory: request.cwd.is_some(),
            pre_exec: request.pre_exec.is_some(),
        }
    }
}

#[cfg(test)]
mod tests {
    use nix::unistd::{Gid, Pid, Uid};

    use super::*;

    const BITS: u32 = 7;

    /// Build a request with the policy bits of `mask` set.
    /// Bits: uid, gid, groups, session, pgid, cwd, pre_exec.
    fn request_for(mask: u32) -> SpawnRequest {
        let mut req = SpawnRequest::new("/bin/true");
        if mask & 1 != 0 {
            req = req.uid(Uid::from_raw(1000));
        }
        if mask & 2 != 0 {
            req = req.gid(Gid::from_raw(1000));
        }
        if mask & 4 != 0 {
            req = req.groups([Gid::from_raw(1000)]);
        }
        if mask & 8 != 0 {
            req = req.create_session(true);
        }
        if mask & 16 != 0 {
            req = req.process_group(Pid::from_raw(0));
        }
        if mask & 32 != 0 {
            req = req.current_dir("/");
        }
        if mask & 64 != 0 {
            req = unsafe { req.pre_exec(|| Ok(())) };
        }
        req
    }

    #[test]
    fn plain_request_uses_posix_spawn() {
        let req = SpawnRequest::new("/bin/true").arg("x").env_clear();
        assert_eq!(SpawnStrategy::select(&req), SpawnStrategy::PosixSpawn);
    }

    #[test]
    fn every_policy_combination_routes_correctly() {
        for mask in 0..(1u32 << BITS) {
            let expected = if mask == 0 || (NATIVE_PROCESS_GROUP && mask == 16) {
                SpawnStrategy::PosixSpawn
            } else {
                SpawnStrategy::ForkExec
            };
            assert_eq!(
                SpawnStrategy::select(&request_for(mask)),
                expected,
                "policy mask {mask:#09b}"
            );
        }
    }

    #[test]
    fn stdio_bindings_do_not_force_fork() {
        let stdio = crate::StdioSlots::new()
            .piped_stdin()
            .unwrap()
            .piped_stdout()
            .unwrap();
        let req = SpawnRequest::new("/bin/cat").stdio(stdio);
        assert_eq!(SpawnStrategy::select(&req), SpawnStrategy::PosixSpawn);
    }
}

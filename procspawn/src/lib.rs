//! Spawn one child process per request, through `posix_spawn` when the
//! request allows it and `fork`/`execve` otherwise, and consume its output
//! through an [`Execution`] handle.

pub mod environ;
mod error;
mod execution;
mod fast;
mod fork_exec;
mod marshal;
mod pipe;
mod request;
mod signals;
mod spawn;
mod status;
mod strategy;

pub use error::{Result, SpawnError};
pub use execution::{CapturedIos, Execution, OutputConsumptionState, OutputStream};
pub use nix::sys::signal::Signal;
pub use nix::unistd::{Gid, Pid, Uid};
pub use pipe::pipe;
pub use request::{Environment, PreExecHook, ProcessId, SpawnRequest, StdioSlots};
pub use spawn::spawn;
pub use status::TerminationStatus;
pub use strategy::SpawnStrategy;

use std::collections::TryReserveError;
use std::io;

use nix::errno::Errno;

use crate::ptracer::{Pid, Signal};


pub type Result<T> = std::result::Result<T, Error>;

/// Failure to set up the shared handshake region before forking.
#[derive(thiserror::Error, Debug)]
pub enum SetupError {
    #[error("Could not map shared handshake page")]
    Map(#[source] nix::Error),

    #[error("Could not initialize {which} semaphore")]
    Semaphore {
        which: &'static str,
        source: io::Error,
    },
}

/// Failure to attach to and configure the target. Fatal to the session.
#[derive(thiserror::Error, Debug)]
pub enum AttachError {
    #[error("Could not attach to app = {pid}")]
    AttachFailed { pid: Pid, source: nix::Error },

    #[error("Could not wait for attach-stop of app = {pid}")]
    WaitFailed { pid: Pid, source: nix::Error },

    #[error("Could not set ptrace options for app = {pid}")]
    OptionsFailed { pid: Pid, source: nix::Error },

    #[error("Could not allocate {len} byte scratch buffer")]
    ScratchAllocFailed { len: usize, source: TryReserveError },

    #[error("Handshake with app failed")]
    Handshake(#[source] io::Error),
}

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error(transparent)]
    Setup(#[from] SetupError),

    #[error(transparent)]
    Attach(#[from] AttachError),

    #[error("Tracee died while stopped, pid = {pid}")]
    TraceeDied { pid: Pid, source: nix::Error },

    #[error("Could not read word at {addr:#x} from tracee = {pid}")]
    ReadMemory { pid: Pid, addr: u64, source: nix::Error },

    #[error("Could not write word at {addr:#x} to tracee = {pid}")]
    WriteMemory { pid: Pid, addr: u64, source: nix::Error },

    #[error("No NUL within {max} bytes of path at {addr:#x} in tracee = {pid}")]
    UnterminatedPath { pid: Pid, addr: u64, max: usize },

    #[error("Replacement path of {len} bytes exceeds maximum of {max}")]
    ReplacementTooLong { len: usize, max: usize },

    #[error("Replacement path contains an interior NUL")]
    InvalidReplacement,

    #[error("Could not read registers of tracee = {pid}")]
    Registers { pid: Pid, source: nix::Error },

    #[error("Stack pointer {sp:#x} of tracee = {pid} is too low to stage a replacement path")]
    StackTooLow { pid: Pid, sp: u64 },

    #[error("Wrote path at {addr:#x} but could not commit registers of tracee = {pid}")]
    CommitRegisters { pid: Pid, addr: u64, source: nix::Error },

    #[error("Could not read event message of tracee = {pid}")]
    EventMessage { pid: Pid, source: nix::Error },

    #[error("Could not wait for tracees")]
    Wait(#[source] nix::Error),

    #[error("Tracee = {pid} was terminated by {signal}")]
    Signaled { pid: Pid, signal: Signal },

    #[error("Unexpected wait status: {status}")]
    UnexpectedStatus { status: String },

    #[error("OS error")]
    OS(#[from] nix::Error),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    /// `true` if the error means the stopped tracee no longer exists.
    pub fn tracee_died(&self) -> bool {
        matches!(self, Error::TraceeDied { .. })
    }

    /// `true` if the error only affects the current syscall.
    ///
    /// The syscall proceeds with its original arguments, and tracing continues.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Error::ReadMemory { .. } |
            Error::WriteMemory { .. } |
            Error::UnterminatedPath { .. } |
            Error::ReplacementTooLong { .. } |
            Error::InvalidReplacement |
            Error::Registers { .. } |
            Error::StackTooLow { .. } |
            Error::CommitRegisters { .. }
        )
    }
}

pub(crate) trait ResultExt<T> {
    /// Map `ESRCH` to [`Error::TraceeDied`], and any other error with `f`.
    fn died_if_esrch_or(self, pid: Pid, f: impl FnOnce(nix::Error) -> Error) -> Result<T>;

    fn died_if_esrch(self, pid: Pid) -> Result<T>;
}

impl<T> ResultExt<T> for nix::Result<T> {
    fn died_if_esrch_or(self, pid: Pid, f: impl FnOnce(nix::Error) -> Error) -> Result<T> {
        self.map_err(|source| {
            if source == Errno::ESRCH {
                Error::TraceeDied { pid, source }
            } else {
                f(source)
            }
        })
    }

    fn died_if_esrch(self, pid: Pid) -> Result<T> {
        self.died_if_esrch_or(pid, Error::OS)
    }
}

macro_rules! internal_error {
    ($ctx: expr) => {
        return Err($crate::error::Error::Internal($ctx.into()))
    };
}

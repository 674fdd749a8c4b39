//! Rewriting the path argument of open syscalls at syscall-enter.

use tracing::{debug, info};

use crate::abi;
use crate::config::Config;
use crate::error::{Error, Result, ResultExt};
use crate::memory::{self, WORD};
use crate::ptracer::{Pid, Ptrace};

/// Decides whether, and where, to redirect an open of an external-storage path.
///
/// Called synchronously from the event loop, with the opening thread stopped. It must
/// not trace or signal the app itself.
pub trait PathPolicy {
    /// Return a replacement for the absolute `path` opened with `mode` flags, or `None`
    /// to leave the open untouched.
    fn redirect(&mut self, path: &str, mode: i32) -> Option<String>;
}

impl<F> PathPolicy for F
where
    F: FnMut(&str, i32) -> Option<String>,
{
    fn redirect(&mut self, path: &str, mode: i32) -> Option<String> {
        self(path, mode)
    }
}

/// What happened to a syscall inspected at syscall-enter.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum Rewrite {
    /// Not an open syscall. Nothing was read from the tracee beyond its registers.
    NotOpen,

    /// Relative paths are left alone.
    Relative,

    /// The path is not under a recognized external-storage prefix.
    NotExternal,

    /// The path is not valid UTF-8, so it cannot be handed to the policy.
    NotUtf8,

    /// The policy chose not to redirect.
    Declined,

    /// The path argument now points to `to`, staged at `addr` on the tracee stack.
    Redirected { from: String, to: String, addr: u64 },
}

/// Inspect the open syscall `pid` is entering, and redirect its path if `policy` says so.
///
/// Must only be called at syscall-enter-stop. `scratch` holds the observed path, then the
/// staged replacement. Any error leaves the syscall to run with its original arguments,
/// except [`Error::CommitRegisters`], where the replacement was written but not installed.
pub fn interpose_on_open<P: Ptrace + ?Sized>(
    ptrace: &mut P,
    pid: Pid,
    scratch: &mut Vec<u8>,
    policy: &mut dyn PathPolicy,
    config: &Config,
) -> Result<Rewrite> {
    let mut regs = ptrace
        .registers(pid)
        .died_if_esrch_or(pid, |source| Error::Registers { pid, source })?;

    let syscall = match abi::open_syscall(&regs) {
        Some(syscall) => syscall,
        None => return Ok(Rewrite::NotOpen),
    };

    debug!(pid = pid.as_raw(), syscall = syscall.name, "found open syscall");

    let path_addr = abi::argument(&regs, syscall.path_arg);
    memory::read_target_cstr(ptrace, pid, path_addr, scratch, config.max_path())?;

    if scratch.first() != Some(&b'/') {
        debug!(pid = pid.as_raw(), path = %String::from_utf8_lossy(scratch), "ignoring relative path");
        return Ok(Rewrite::Relative);
    }

    if !config.is_external(scratch) {
        return Ok(Rewrite::NotExternal);
    }

    let from = match std::str::from_utf8(scratch) {
        Ok(path) => path.to_owned(),
        Err(_) => {
            debug!(pid = pid.as_raw(), path = %String::from_utf8_lossy(scratch), "ignoring non-UTF-8 path");
            return Ok(Rewrite::NotUtf8);
        },
    };

    // Flags are an `int`; the upper half of the register is undefined.
    let mode = abi::argument(&regs, syscall.mode_arg) as i32;

    debug!(pid = pid.as_raw(), path = %from, mode, "consulting policy");

    let to = match policy.redirect(&from, mode) {
        Some(to) => to,
        None => {
            debug!(pid = pid.as_raw(), path = %from, "policy declined");
            return Ok(Rewrite::Declined);
        },
    };

    if to.as_bytes().contains(&0) {
        return Err(Error::InvalidReplacement);
    }

    // Length including the terminating NUL.
    let len = to.len() + 1;

    if len > config.max_path() {
        return Err(Error::ReplacementTooLong { len, max: config.max_path() });
    }

    let addr = staging_address(pid, abi::stack_pointer(&regs), len, config.red_zone())?;

    scratch.clear();
    scratch.extend_from_slice(to.as_bytes());
    scratch.push(0);

    memory::write_target_bytes(ptrace, pid, addr, scratch)?;

    abi::set_argument(&mut regs, syscall.path_arg, addr);

    ptrace
        .set_registers(pid, &regs)
        .died_if_esrch_or(pid, |source| Error::CommitRegisters { pid, addr, source })?;

    info!(pid = pid.as_raw(), %from, %to, addr, "redirected open");

    Ok(Rewrite::Redirected { from, to, addr })
}

// Place `len` bytes below the red zone under `sp`, aligned down to a word.
fn staging_address(pid: Pid, sp: u64, len: usize, red_zone: u64) -> Result<u64> {
    let addr = sp
        .checked_sub(red_zone)
        .and_then(|a| a.checked_sub(len as u64));

    match addr {
        Some(addr) => Ok(addr & !(WORD as u64 - 1)),
        None => Err(Error::StackTooLow { pid, sp }),
    }
}

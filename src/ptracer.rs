//! The ptrace(2) requests the tracer makes, and their Linux implementation.

use nix::{
    errno::Errno,
    sys::{
        ptrace::{self, AddressType},
        wait::{self, WaitPidFlag, WaitStatus},
    },
};

#[cfg(target_arch = "aarch64")]
use crate::aarch64;

use crate::error::Result;

pub use nix::unistd::Pid;
pub use nix::sys::ptrace::Options;

/// POSIX signal.
pub use nix::sys::signal::Signal;

/// Register state of a tracee.
#[cfg(target_arch = "aarch64")]
pub type Registers = aarch64::user_pt_regs;

/// Register state of a tracee.
#[cfg(target_arch = "x86_64")]
pub type Registers = libc::user_regs_struct;

/// Register state of a tracee on an architecture without syscall interposition.
#[cfg(not(any(target_arch = "x86_64", target_arch = "aarch64")))]
#[derive(Clone, Copy, Debug, Default)]
pub struct Registers;

/// Extra signal info, such as its cause.
pub type Siginfo = libc::siginfo_t;

/// Linux constant defined in `include/uapi/linux/elf.h`.
#[cfg(target_arch = "aarch64")]
const NT_PRSTATUS: i32 = 0x1;

/// Restart requests, which resume stopped tracees.
///
/// The restart mode determines the possible subsequent stops of the restarted tracee.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Restart {
    Continue,
    Syscall,
}

/// Options required by the event loop.
/// These are:
/// - [`PTRACE_O_TRACECLONE`](Options::PTRACE_O_TRACECLONE)
/// - [`PTRACE_O_TRACEEXEC`](Options::PTRACE_O_TRACEEXEC)
/// - [`PTRACE_O_TRACEEXIT`](Options::PTRACE_O_TRACEEXIT)
/// - [`PTRACE_O_TRACESYSGOOD`](Options::PTRACE_O_TRACESYSGOOD)
pub const REQUIRED_OPTIONS: Options = Options::empty()
    .union(Options::PTRACE_O_TRACECLONE)
    .union(Options::PTRACE_O_TRACEEXEC)
    .union(Options::PTRACE_O_TRACEEXIT)
    .union(Options::PTRACE_O_TRACESYSGOOD);

/// Every OS request made against a tracee.
///
/// Requests are keyed by thread id, and return raw `nix` results so callers can attach
/// their own context.
pub trait Ptrace {
    /// `PTRACE_ATTACH`. Delivers a `SIGSTOP` to `pid`.
    fn attach(&mut self, pid: Pid) -> nix::Result<()>;

    /// `PTRACE_DETACH`, delivering `signal` if set.
    fn detach(&mut self, pid: Pid, signal: Option<Signal>) -> nix::Result<()>;

    /// Block until `pid` changes state.
    fn wait_for(&mut self, pid: Pid) -> nix::Result<WaitStatus>;

    /// Block until any traced thread changes state.
    fn wait_any(&mut self) -> nix::Result<WaitStatus>;

    fn set_options(&mut self, pid: Pid, options: Options) -> nix::Result<()>;

    /// `PTRACE_GETEVENTMSG`.
    fn event_message(&mut self, pid: Pid) -> nix::Result<libc::c_long>;

    fn siginfo(&mut self, pid: Pid) -> nix::Result<Siginfo>;

    /// Resume the stopped thread, delivering `signal` if set.
    fn restart(&mut self, pid: Pid, restart: Restart, signal: Option<Signal>) -> nix::Result<()>;

    fn registers(&mut self, pid: Pid) -> nix::Result<Registers>;

    fn set_registers(&mut self, pid: Pid, regs: &Registers) -> nix::Result<()>;

    /// Read one machine word of tracee memory. `addr` need not be aligned.
    fn peek(&mut self, pid: Pid, addr: u64) -> nix::Result<libc::c_long>;

    /// Write one machine word of tracee memory. `addr` need not be aligned.
    fn poke(&mut self, pid: Pid, addr: u64, word: libc::c_long) -> nix::Result<()>;
}

/// Tracer for a Linux process, backed by `ptrace(2)`.
///
/// All requests must be made from the thread that attached.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct Ptracer {
    _private: (),
}

impl Ptracer {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Ptrace for Ptracer {
    fn attach(&mut self, pid: Pid) -> nix::Result<()> {
        ptrace::attach(pid)
    }

    fn detach(&mut self, pid: Pid, signal: Option<Signal>) -> nix::Result<()> {
        ptrace::detach(pid, signal)
    }

    fn wait_for(&mut self, pid: Pid) -> nix::Result<WaitStatus> {
        wait::waitpid(pid, Some(WaitPidFlag::__WALL))
    }

    fn wait_any(&mut self) -> nix::Result<WaitStatus> {
        wait::waitpid(None, Some(WaitPidFlag::__WALL))
    }

    fn set_options(&mut self, pid: Pid, options: Options) -> nix::Result<()> {
        ptrace::setoptions(pid, options)
    }

    fn event_message(&mut self, pid: Pid) -> nix::Result<libc::c_long> {
        ptrace::getevent(pid)
    }

    fn siginfo(&mut self, pid: Pid) -> nix::Result<Siginfo> {
        ptrace::getsiginfo(pid)
    }

    fn restart(&mut self, pid: Pid, restart: Restart, signal: Option<Signal>) -> nix::Result<()> {
        match restart {
            Restart::Continue =>
                ptrace::cont(pid, signal),
            Restart::Syscall =>
                ptrace::syscall(pid, signal),
        }
    }

    #[cfg(target_arch = "x86_64")]
    fn registers(&mut self, pid: Pid) -> nix::Result<Registers> {
        ptrace::getregs(pid)
    }

    #[cfg(target_arch = "aarch64")]
    fn registers(&mut self, pid: Pid) -> nix::Result<Registers> {
        let mut data = std::mem::MaybeUninit::<Registers>::uninit();
        let mut rv = libc::iovec {
            iov_base: data.as_mut_ptr() as *mut libc::c_void,
            iov_len: std::mem::size_of::<Registers>(),
        };

        let res = unsafe {
            libc::ptrace(libc::PTRACE_GETREGSET, pid.as_raw(), NT_PRSTATUS, &mut rv as *mut _ as *mut libc::c_void)
        };

        Errno::result(res)?;

        Ok(unsafe { data.assume_init() })
    }

    #[cfg(not(any(target_arch = "x86_64", target_arch = "aarch64")))]
    fn registers(&mut self, _pid: Pid) -> nix::Result<Registers> {
        Err(Errno::ENOSYS)
    }

    #[cfg(target_arch = "x86_64")]
    fn set_registers(&mut self, pid: Pid, regs: &Registers) -> nix::Result<()> {
        ptrace::setregs(pid, *regs)
    }

    #[cfg(target_arch = "aarch64")]
    fn set_registers(&mut self, pid: Pid, regs: &Registers) -> nix::Result<()> {
        let mut rv = libc::iovec {
            iov_base: regs as *const _ as *const libc::c_void as *mut libc::c_void,
            iov_len: std::mem::size_of::<Registers>(),
        };

        let res = unsafe {
            libc::ptrace(libc::PTRACE_SETREGSET, pid.as_raw(), NT_PRSTATUS, &mut rv as *mut _ as *mut libc::c_void)
        };

        Errno::result(res)?;

        Ok(())
    }

    #[cfg(not(any(target_arch = "x86_64", target_arch = "aarch64")))]
    fn set_registers(&mut self, _pid: Pid, _regs: &Registers) -> nix::Result<()> {
        Err(Errno::ENOSYS)
    }

    fn peek(&mut self, pid: Pid, addr: u64) -> nix::Result<libc::c_long> {
        ptrace::read(pid, addr as AddressType)
    }

    fn poke(&mut self, pid: Pid, addr: u64, word: libc::c_long) -> nix::Result<()> {
        // SAFETY: `PTRACE_POKEDATA` takes the word itself in the data argument, and never
        // dereferences it in the tracer.
        unsafe { ptrace::write(pid, addr as AddressType, word as *mut libc::c_void) }
    }
}

/// Pending termination of a thread, as reported with `PTRACE_EVENT_EXIT`.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ExitType {
    Exit(i32),
    Signaled(Signal, bool),
}

impl ExitType {
    pub fn parse(status: u16) -> Result<Self> {
        // The bit layout of the word `status` is:
        //
        //   15                         8   7                     0
        //    +-------------------------+---+---------------------+
        //    |        exit_code        | c |       sig_no        |
        //    +-------------------------+---+---------------------+
        //
        // If `status[6:0]` is nonzero, then `pid` is being signaled with `sig_no`,
        // and a set `status[7]` bit flags a core dump. Otherwise, it is a normal
        // exit with exit code `status[15:8]`.
        let sig_no = status & 0x7f;

        let ty = if sig_no == 0 {
            // Extract, zero-extend, cast.
            let exit_code = (status >> 8) as u8 as u32 as i32;

            ExitType::Exit(exit_code)
        } else {
            use std::convert::TryFrom;

            let core_dump = (status & (1 << 7)) != 0;
            let signal = Signal::try_from(sig_no as i32)?;

            ExitType::Signaled(signal, core_dump)
        };

        Ok(ty)
    }
}

// Check if a wait stop with signal delivery is a group-stop.
//
// Assumes attach-stop has already been ruled out.
pub(crate) fn is_group_stop<P: Ptrace + ?Sized>(ptrace: &mut P, pid: Pid, sig: Signal) -> nix::Result<bool> {
    use Signal::*;

    match sig {
        SIGSTOP | SIGTSTP | SIGTTIN | SIGTTOU => {
            // Possible group-stop. Check `siginfo` to disambiguate.
            //
            // From the manual:
            //
            //     If PTRACE_GETSIGINFO fails with EINVAL, then it is definitely a
            //     group-stop.  (Other failure codes are possible, such as ESRCH
            //     ("no such process") if a SIGKILL killed the tracee.)
            //
            match ptrace.siginfo(pid) {
                Err(Errno::EINVAL) =>
                    Ok(true),
                Err(err) =>
                    Err(err),
                Ok(_) =>
                    Ok(false)
            }
        },
        // Only the four signals above are stopping signals.
        _ => Ok(false),
    }
}

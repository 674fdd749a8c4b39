//! Architecture-neutral view of the syscall calling convention.
//!
//! Each supported architecture contributes a table of recognized open syscalls and
//! accessors for the syscall number, arguments, and stack pointer. Architectures without
//! a table report [`SUPPORTED`] as `false`, and interposition becomes a no-op.

use crate::ptracer::Registers;

#[cfg(target_arch = "aarch64")]
use crate::aarch64 as arch;

#[cfg(target_arch = "x86_64")]
use crate::x86 as arch;

/// A syscall of the file-open family, and where its arguments live.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct OpenSyscall {
    pub name: &'static str,

    /// Syscall number, as seen in the syscall-number register at syscall-enter.
    pub number: u64,

    /// Index of the argument holding the path pointer.
    pub path_arg: usize,

    /// Index of the argument holding the open flags.
    pub mode_arg: usize,
}

#[cfg(any(target_arch = "x86_64", target_arch = "aarch64"))]
pub const SUPPORTED: bool = true;

#[cfg(not(any(target_arch = "x86_64", target_arch = "aarch64")))]
pub const SUPPORTED: bool = false;

/// Open syscalls recognized on this architecture.
#[cfg(any(target_arch = "x86_64", target_arch = "aarch64"))]
pub const OPEN_SYSCALLS: &[OpenSyscall] = arch::OPEN_SYSCALLS;

/// Open syscalls recognized on this architecture.
#[cfg(not(any(target_arch = "x86_64", target_arch = "aarch64")))]
pub const OPEN_SYSCALLS: &[OpenSyscall] = &[];

/// Look up the open syscall that `regs` is entering, if any.
pub fn open_syscall(regs: &Registers) -> Option<&'static OpenSyscall> {
    let number = syscall_number(regs)?;

    OPEN_SYSCALLS.iter().find(|sc| sc.number == number)
}

#[cfg(any(target_arch = "x86_64", target_arch = "aarch64"))]
pub fn syscall_number(regs: &Registers) -> Option<u64> {
    Some(arch::syscall_number(regs))
}

#[cfg(any(target_arch = "x86_64", target_arch = "aarch64"))]
pub fn argument(regs: &Registers, index: usize) -> u64 {
    arch::argument(regs, index)
}

#[cfg(any(target_arch = "x86_64", target_arch = "aarch64"))]
pub fn set_argument(regs: &mut Registers, index: usize, value: u64) {
    arch::set_argument(regs, index, value)
}

#[cfg(any(target_arch = "x86_64", target_arch = "aarch64"))]
pub fn stack_pointer(regs: &Registers) -> u64 {
    arch::stack_pointer(regs)
}

#[cfg(not(any(target_arch = "x86_64", target_arch = "aarch64")))]
pub fn syscall_number(_regs: &Registers) -> Option<u64> {
    None
}

#[cfg(not(any(target_arch = "x86_64", target_arch = "aarch64")))]
pub fn argument(_regs: &Registers, _index: usize) -> u64 {
    0
}

#[cfg(not(any(target_arch = "x86_64", target_arch = "aarch64")))]
pub fn set_argument(_regs: &mut Registers, _index: usize, _value: u64) {}

#[cfg(not(any(target_arch = "x86_64", target_arch = "aarch64")))]
pub fn stack_pointer(_regs: &Registers) -> u64 {
    0
}

/// Registers as seen at syscall-enter, for tests.
#[cfg(all(test, any(target_arch = "x86_64", target_arch = "aarch64")))]
pub(crate) fn syscall_registers(number: u64, args: [u64; 6], sp: u64) -> Registers {
    arch::syscall_registers(number, args, sp)
}

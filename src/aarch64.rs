//! AArch64 syscall calling convention.
//!
//! Arguments are passed in `x0`..`x5` and the syscall number in `x8`. Only `openat()`
//! exists for opening files; `open()` is not part of the arm64 syscall table.

use crate::abi::OpenSyscall;

/// Defined in [`arch/arm64/include/uapi/asm/ptrace.h`](https://android.googlesource.com/kernel/common/+/refs/heads/android-mainline/arch/arm64/include/uapi/asm/ptrace.h#88).
#[allow(non_camel_case_types)]
#[repr(C)]
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct user_pt_regs {
    pub regs: [u64; 31],
    pub sp: u64,
    pub pc: u64,
    pub pstate: u64
}

const REG_SYSCALL_NUMBER: usize = 8;

pub(crate) const OPEN_SYSCALLS: &[OpenSyscall] = &[
    OpenSyscall { name: "openat", number: libc::SYS_openat as u64, path_arg: 1, mode_arg: 2 },
];

pub(crate) fn syscall_number(regs: &user_pt_regs) -> u64 {
    regs.regs[REG_SYSCALL_NUMBER]
}

pub(crate) fn argument(regs: &user_pt_regs, index: usize) -> u64 {
    regs.regs[index]
}

pub(crate) fn set_argument(regs: &mut user_pt_regs, index: usize, value: u64) {
    regs.regs[index] = value;
}

pub(crate) fn stack_pointer(regs: &user_pt_regs) -> u64 {
    regs.sp
}

#[cfg(test)]
pub(crate) fn syscall_registers(number: u64, args: [u64; 6], sp: u64) -> user_pt_regs {
    let mut regs = user_pt_regs::default();
    regs.regs[REG_SYSCALL_NUMBER] = number;
    regs.regs[..6].copy_from_slice(&args);
    regs.sp = sp;
    regs
}

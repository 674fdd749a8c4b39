//! x86-64 syscall calling convention.
//!
//! The syscall number is in `orig_rax` at syscall-enter (`rax` already holds
//! `-ENOSYS`), and arguments are in `rdi`, `rsi`, `rdx`, `r10`, `r8`, `r9`.

use crate::abi::OpenSyscall;

pub(crate) const OPEN_SYSCALLS: &[OpenSyscall] = &[
    OpenSyscall { name: "openat", number: libc::SYS_openat as u64, path_arg: 1, mode_arg: 2 },
    OpenSyscall { name: "open", number: libc::SYS_open as u64, path_arg: 0, mode_arg: 1 },
];

pub(crate) fn syscall_number(regs: &libc::user_regs_struct) -> u64 {
    regs.orig_rax
}

pub(crate) fn argument(regs: &libc::user_regs_struct, index: usize) -> u64 {
    match index {
        0 => regs.rdi,
        1 => regs.rsi,
        2 => regs.rdx,
        3 => regs.r10,
        4 => regs.r8,
        5 => regs.r9,
        _ => unreachable!("syscalls take at most 6 arguments"),
    }
}

pub(crate) fn set_argument(regs: &mut libc::user_regs_struct, index: usize, value: u64) {
    let reg = match index {
        0 => &mut regs.rdi,
        1 => &mut regs.rsi,
        2 => &mut regs.rdx,
        3 => &mut regs.r10,
        4 => &mut regs.r8,
        5 => &mut regs.r9,
        _ => unreachable!("syscalls take at most 6 arguments"),
    };

    *reg = value;
}

pub(crate) fn stack_pointer(regs: &libc::user_regs_struct) -> u64 {
    regs.rsp
}

#[cfg(test)]
pub(crate) fn syscall_registers(number: u64, args: [u64; 6], sp: u64) -> libc::user_regs_struct {
    // SAFETY: `user_regs_struct` is plain integers, for which all-zero is valid.
    let mut regs: libc::user_regs_struct = unsafe { std::mem::zeroed() };
    regs.orig_rax = number;
    regs.rax = -(libc::ENOSYS as i64) as u64;

    for (index, &arg) in args.iter().enumerate() {
        set_argument(&mut regs, index, arg);
    }

    regs.rsp = sp;
    regs
}

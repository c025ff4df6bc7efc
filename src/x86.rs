//! Syscall calling conventions of x86-64 tracees, including 32-bit (ia32) images.
//!
//! Registers are accessed one at a time via `PTRACE_PEEKUSER`/`PTRACE_POKEUSER`, at their
//! offsets in the kernel's virtual `user` struct.

use nix::errno::Errno;

use crate::bitness::Bitness;
use crate::error::{Result, ResultExt};
use crate::ptracer::Pid;

/// Register state of a tracee.
pub type Registers = libc::user_regs_struct;

/// Code segment selector of 64-bit user mode (`__USER_CS`).
const USER_CS_64: u64 = 0x33;

/// Code segment selector of 32-bit compatibility mode (`__USER32_CS`).
const USER_CS_32: u64 = 0x23;

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Register {
    OrigRax,
    Rax,
    Rbx,
    Rcx,
    Rdx,
    Rsi,
    Rdi,
    Rbp,
    R8,
    R9,
    R10,
    Cs,
}

/// Argument registers of the `syscall` instruction.
const ARGS_64: [Register; 6] = [
    Register::Rdi,
    Register::Rsi,
    Register::Rdx,
    Register::R10,
    Register::R8,
    Register::R9,
];

/// Argument registers of `int 0x80`.
const ARGS_32: [Register; 6] = [
    Register::Rbx,
    Register::Rcx,
    Register::Rdx,
    Register::Rsi,
    Register::Rdi,
    Register::Rbp,
];

impl Register {
    /// Return the offset of the register in the virtual `user` struct.
    pub(crate) fn user_offset(self) -> u64 {
        use memoffset::offset_of;

        let regs = offset_of!(libc::user, regs);

        let reg = match self {
            Register::OrigRax => offset_of!(Registers, orig_rax),
            Register::Rax => offset_of!(Registers, rax),
            Register::Rbx => offset_of!(Registers, rbx),
            Register::Rcx => offset_of!(Registers, rcx),
            Register::Rdx => offset_of!(Registers, rdx),
            Register::Rsi => offset_of!(Registers, rsi),
            Register::Rdi => offset_of!(Registers, rdi),
            Register::Rbp => offset_of!(Registers, rbp),
            Register::R8 => offset_of!(Registers, r8),
            Register::R9 => offset_of!(Registers, r9),
            Register::R10 => offset_of!(Registers, r10),
            Register::Cs => offset_of!(Registers, cs),
        };

        (regs + reg) as u64
    }

    fn argument(bitness: Bitness, index: usize) -> Option<Self> {
        match bitness {
            Bitness::Bits64 => ARGS_64.get(index).copied(),
            Bitness::Bits32 => ARGS_32.get(index).copied(),
            Bitness::Unknown => None,
        }
    }
}

fn peek_user(pid: Pid, reg: Register) -> Result<u64> {
    let off = reg.user_offset();

    // SAFETY: `off` does not require validation, because it is not actually used as a
    // pointer offset by the kernel.
    //
    // See: https://github.com/torvalds/linux/blob/v4.9/arch/x86/kernel/ptrace.c#L774-L791
    //
    // A peeked word may legitimately be `-1`, so `errno` is the only error indicator.
    Errno::clear();
    let data = unsafe {
        libc::ptrace(
            libc::PTRACE_PEEKUSER,
            pid.as_raw(),
            off,
            std::ptr::null_mut::<libc::c_void>(),
        )
    };

    let res = match (data, Errno::last()) {
        (-1, errno) if errno != Errno::UnknownErrno => Err(errno),
        _ => Ok(data as u64),
    };

    res.died_if_esrch(pid)
}

fn poke_user(pid: Pid, reg: Register, data: u64) -> Result<()> {
    let off = reg.user_offset();

    // SAFETY: see `peek_user()`.
    let res = unsafe {
        libc::ptrace(
            libc::PTRACE_POKEUSER,
            pid.as_raw(),
            off,
            data,
        )
    };

    Errno::result(res).map(drop).died_if_esrch(pid)
}

/// Decide the bitness of a stopped tracee from its code segment selector.
pub(crate) fn bitness(pid: Pid) -> Result<Bitness> {
    let cs = peek_user(pid, Register::Cs)?;

    let bitness = match cs {
        USER_CS_64 => Bitness::Bits64,
        USER_CS_32 => Bitness::Bits32,
        _ => Bitness::Unknown,
    };

    Ok(bitness)
}

pub(crate) fn syscall_number(pid: Pid, bitness: Bitness) -> Result<u64> {
    Ok(bitness.truncate(peek_user(pid, Register::OrigRax)?))
}

pub(crate) fn set_syscall_number(pid: Pid, bitness: Bitness, number: u64) -> Result<()> {
    poke_user(pid, Register::OrigRax, bitness.truncate(number))
}

pub(crate) fn return_value(pid: Pid, bitness: Bitness) -> Result<i64> {
    Ok(bitness.sign_extend(peek_user(pid, Register::Rax)?))
}

pub(crate) fn set_return_value(pid: Pid, bitness: Bitness, value: i64) -> Result<()> {
    poke_user(pid, Register::Rax, bitness.truncate(value as u64))
}

pub(crate) fn argument(pid: Pid, bitness: Bitness, index: usize) -> Result<u64> {
    match Register::argument(bitness, index) {
        Some(reg) => Ok(bitness.truncate(peek_user(pid, reg)?)),
        None => internal_error!("no argument register for index"),
    }
}

pub(crate) fn set_argument(pid: Pid, bitness: Bitness, index: usize, value: u64) -> Result<()> {
    match Register::argument(bitness, index) {
        Some(reg) => poke_user(pid, reg, bitness.truncate(value)),
        None => internal_error!("no argument register for index"),
    }
}

//! Syscall calling conventions of aarch64 tracees, including AArch32 compat images.
//!
//! The kernel hands out a different view of `NT_PRSTATUS` for compat tasks, so the length
//! it reports back for the register set tells us the bitness of the image.
#![allow(non_camel_case_types)]

use std::mem::{self, MaybeUninit};

use nix::errno::Errno;

use crate::bitness::Bitness;
use crate::error::{Result, ResultExt};
use crate::ptracer::Pid;

/// Linux constants defined in `include/uapi/linux/elf.h`.
const NT_PRSTATUS: i32 = 0x1;
const NT_ARM_SYSTEM_CALL: i32 = 0x404;

/// Defined in [`arch/arm64/include/uapi/asm/ptrace.h`](https://android.googlesource.com/kernel/common/+/refs/heads/android-mainline/arch/arm64/include/uapi/asm/ptrace.h#88).
#[repr(C)]
#[derive(Clone, Copy, Debug)]
pub struct user_pt_regs {
    pub regs: [u64; 31],
    pub sp: u64,
    pub pc: u64,
    pub pstate: u64,
}

/// AArch32 view of `NT_PRSTATUS`: `r0`-`r15`, `cpsr`, `orig_r0`.
#[repr(C)]
#[derive(Clone, Copy, Debug)]
pub struct compat_pt_regs {
    pub uregs: [u32; 18],
}

/// Register state of a tracee.
#[derive(Clone, Copy, Debug)]
pub enum Registers {
    Aarch64(user_pt_regs),
    Arm(compat_pt_regs),
}

/// Number of argument registers, `x0`-`x5` or `r0`-`r5`.
const NUM_ARGS: usize = 6;

impl Registers {
    fn bitness(&self) -> Bitness {
        match self {
            Registers::Aarch64(..) => Bitness::Bits64,
            Registers::Arm(..) => Bitness::Bits32,
        }
    }

    /// Read the register holding the syscall number: `x8`, or `r7` in compat mode.
    fn syscall_number(&self) -> u64 {
        match self {
            Registers::Aarch64(regs) => regs.regs[8],
            Registers::Arm(regs) => u64::from(regs.uregs[7]),
        }
    }

    fn set_syscall_number(&mut self, number: u64) {
        match self {
            Registers::Aarch64(regs) => regs.regs[8] = number,
            Registers::Arm(regs) => regs.uregs[7] = number as u32,
        }
    }

    fn get(&self, index: usize) -> u64 {
        match self {
            Registers::Aarch64(regs) => regs.regs[index],
            Registers::Arm(regs) => u64::from(regs.uregs[index]),
        }
    }

    fn set(&mut self, index: usize, value: u64) {
        match self {
            Registers::Aarch64(regs) => regs.regs[index] = value,
            Registers::Arm(regs) => regs.uregs[index] = value as u32,
        }
    }
}

fn registers(pid: Pid) -> Result<Registers> {
    let mut data = MaybeUninit::<user_pt_regs>::zeroed();
    let mut rv = libc::iovec {
        iov_base: data.as_mut_ptr() as *mut libc::c_void,
        iov_len: mem::size_of::<user_pt_regs>(),
    };

    let res = unsafe {
        libc::ptrace(
            libc::PTRACE_GETREGSET,
            pid.as_raw(),
            NT_PRSTATUS,
            &mut rv as *mut _ as *mut libc::c_void,
        )
    };

    Errno::result(res).died_if_esrch(pid)?;

    // SAFETY: the buffer was zero-initialized, and both views are plain integers.
    let regs = if rv.iov_len == mem::size_of::<compat_pt_regs>() {
        Registers::Arm(unsafe { std::ptr::read(data.as_ptr() as *const compat_pt_regs) })
    } else if rv.iov_len == mem::size_of::<user_pt_regs>() {
        Registers::Aarch64(unsafe { data.assume_init() })
    } else {
        internal_error!("unexpected NT_PRSTATUS register set size")
    };

    Ok(regs)
}

fn set_registers(pid: Pid, mut regs: Registers) -> Result<()> {
    let mut rv = match &mut regs {
        Registers::Aarch64(regs) => libc::iovec {
            iov_base: regs as *mut _ as *mut libc::c_void,
            iov_len: mem::size_of::<user_pt_regs>(),
        },
        Registers::Arm(regs) => libc::iovec {
            iov_base: regs as *mut _ as *mut libc::c_void,
            iov_len: mem::size_of::<compat_pt_regs>(),
        },
    };

    let res = unsafe {
        libc::ptrace(
            libc::PTRACE_SETREGSET,
            pid.as_raw(),
            NT_PRSTATUS,
            &mut rv as *mut _ as *mut libc::c_void,
        )
    };

    Errno::result(res).map(drop).died_if_esrch(pid)
}

pub(crate) fn bitness(pid: Pid) -> Result<Bitness> {
    Ok(registers(pid)?.bitness())
}

pub(crate) fn syscall_number(pid: Pid, _bitness: Bitness) -> Result<u64> {
    Ok(registers(pid)?.syscall_number())
}

/// Overwrite the syscall number.
///
/// On aarch64 the kernel latches the number before the syscall-enter-stop, so rewriting `x8`
/// alone has no effect: the `NT_ARM_SYSTEM_CALL` register set must be written too.
pub(crate) fn set_syscall_number(pid: Pid, _bitness: Bitness, number: u64) -> Result<()> {
    let mut regs = registers(pid)?;
    regs.set_syscall_number(number);
    set_registers(pid, regs)?;

    if let Registers::Aarch64(..) = regs {
        let mut number = number as i32;
        let mut rv = libc::iovec {
            iov_base: &mut number as *mut _ as *mut libc::c_void,
            iov_len: mem::size_of::<i32>(),
        };

        let res = unsafe {
            libc::ptrace(
                libc::PTRACE_SETREGSET,
                pid.as_raw(),
                NT_ARM_SYSTEM_CALL,
                &mut rv as *mut _ as *mut libc::c_void,
            )
        };

        Errno::result(res).died_if_esrch(pid)?;
    }

    Ok(())
}

pub(crate) fn return_value(pid: Pid, _bitness: Bitness) -> Result<i64> {
    let regs = registers(pid)?;
    Ok(regs.bitness().sign_extend(regs.get(0)))
}

pub(crate) fn set_return_value(pid: Pid, _bitness: Bitness, value: i64) -> Result<()> {
    let mut regs = registers(pid)?;
    regs.set(0, value as u64);
    set_registers(pid, regs)
}

/// Read argument `index`.
///
/// `x0` doubles as the return value register, so argument 0 is only reliable at
/// syscall-enter-stops.
pub(crate) fn argument(pid: Pid, _bitness: Bitness, index: usize) -> Result<u64> {
    if index >= NUM_ARGS {
        internal_error!("no argument register for index");
    }

    Ok(registers(pid)?.get(index))
}

pub(crate) fn set_argument(pid: Pid, _bitness: Bitness, index: usize, value: u64) -> Result<()> {
    if index >= NUM_ARGS {
        internal_error!("no argument register for index");
    }

    let mut regs = registers(pid)?;
    regs.set(index, value);
    set_registers(pid, regs)
}

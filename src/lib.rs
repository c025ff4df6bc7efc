//! Trace the syscalls of a Linux process with `ptrace(2)`.
//!
//! Spawn or attach to a process with a [`Session`], then drive it from syscall-stop to
//! syscall-stop, reading and rewriting syscall numbers, arguments, return values, and the
//! memory their pointer arguments refer to.

#[macro_use]
pub mod error;

pub mod bitness;
pub mod cmd;
pub mod event;
pub mod memory;
pub mod ptracer;
pub mod session;
pub mod syscall;

#[cfg(target_arch = "x86_64")]
mod x86;

#[cfg(target_arch = "x86_64")]
use x86 as arch;

#[cfg(target_arch = "aarch64")]
mod aarch64;

#[cfg(target_arch = "aarch64")]
use aarch64 as arch;

pub use bitness::Bitness;
pub use cmd::{Command, Fork, SPAWN_FAILED_EXIT_CODE};
pub use error::Error;
pub use event::{Event, PtraceEvent};
pub use memory::{Address, DecodedAddress};
pub use ptracer::{Options, Pid, Ptracer, Restart, State, Tracee, REQUIRED_OPTIONS};
pub use session::{Session, Stop};

//! Word width and calling convention of a tracee's program image.

use std::fmt;

use crate::arch;
use crate::error::{Error, Result};
use crate::ptracer::Pid;


/// Register width of the traced program image.
///
/// Bitness belongs to the loaded image, not to the process: it must be re-detected after
/// every successful `execve()`.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub enum Bitness {
    Unknown,
    Bits32,
    Bits64,
}

impl Bitness {
    /// Inspect the register state of the stopped tracee `pid` to decide its bitness.
    ///
    /// Fails with [`Error::UnsupportedBitness`] if the tracee runs in a mode we cannot decode.
    pub fn detect(pid: Pid) -> Result<Self> {
        match arch::bitness(pid)? {
            Bitness::Unknown => Err(Error::UnsupportedBitness { pid }),
            bitness => Ok(bitness),
        }
    }

    /// Size of a pointer or register-width argument, in bytes.
    pub fn word_size(self) -> Option<usize> {
        match self {
            Bitness::Unknown => None,
            Bitness::Bits32 => Some(4),
            Bitness::Bits64 => Some(8),
        }
    }

    /// Bitness of a program image built for the host.
    pub fn native() -> Self {
        if cfg!(target_pointer_width = "64") {
            Bitness::Bits64
        } else {
            Bitness::Bits32
        }
    }

    /// Truncate a register value to the width of this bitness.
    pub(crate) fn truncate(self, value: u64) -> u64 {
        match self {
            Bitness::Bits32 => value & u64::from(u32::MAX),
            _ => value,
        }
    }

    /// Sign-extend a register holding a return value of this bitness.
    pub(crate) fn sign_extend(self, value: u64) -> i64 {
        match self {
            Bitness::Bits32 => value as u32 as i32 as i64,
            _ => value as i64,
        }
    }
}

impl fmt::Display for Bitness {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Bitness::Unknown => "unknown",
            Bitness::Bits32 => "32 bit",
            Bitness::Bits64 => "64 bit",
        };
        f.write_str(s)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_word_size() {
        assert_eq!(Bitness::Bits32.word_size(), Some(4));
        assert_eq!(Bitness::Bits64.word_size(), Some(8));
        assert_eq!(Bitness::Unknown.word_size(), None);
    }

    #[test]
    fn test_truncate_and_sign_extend() {
        assert_eq!(Bitness::Bits32.truncate(0xdead_beef_cafe_f00d), 0xcafe_f00d);
        assert_eq!(Bitness::Bits64.truncate(0xdead_beef_cafe_f00d), 0xdead_beef_cafe_f00d);

        // -ENOENT in a 32-bit `eax`.
        assert_eq!(Bitness::Bits32.sign_extend(0xffff_fffe), -2);
        assert_eq!(Bitness::Bits64.sign_extend(-2i64 as u64), -2);
        assert_eq!(Bitness::Bits64.sign_extend(0xffff_fffe), 0xffff_fffe);
    }

    #[test]
    fn test_native() {
        assert_eq!(Bitness::native().word_size(), Some(std::mem::size_of::<usize>()));
    }
}

//! Syscall metadata: names, argument shapes, and error returns.

use std::collections::HashMap;

use lazy_static::lazy_static;
use nix::errno::Errno;

use crate::bitness::Bitness;

/// Number of syscall argument registers. Valid argument indices are `0..MAX_ARGS`.
pub const MAX_ARGS: usize = 6;

/// Largest errno value the kernel encodes in a syscall return value.
const MAX_ERRNO: i64 = 4095;

/// Semantic hint for how to render a syscall argument.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub enum Arg {
    /// Plain integer, flags, or size.
    Int,

    /// File descriptor.
    Fd,

    /// Pointer to memory we do not decode.
    Ptr,

    /// Pointer to a NUL-terminated string.
    Str,

    /// Pointer to a NULL-terminated array of string pointers.
    StrArray,

    /// Pointer to a `struct sockaddr`, followed by its length in the next argument.
    SockAddr,
}

/// Static description of a syscall, for a given architecture and bitness.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct Descriptor {
    pub number: u64,
    pub name: &'static str,

    /// Argument hints, if the signature of the syscall is known.
    pub args: Option<&'static [Arg]>,
}

impl Descriptor {
    pub fn arity(&self) -> Option<usize> {
        self.args.map(|args| args.len())
    }
}

use Arg::*;

const SIGNATURES: &[(&str, &[Arg])] = &[
    ("accept", &[Fd, Ptr, Ptr]),
    ("accept4", &[Fd, Ptr, Ptr, Int]),
    ("access", &[Str, Int]),
    ("bind", &[Fd, SockAddr, Int]),
    ("brk", &[Ptr]),
    ("chdir", &[Str]),
    ("chmod", &[Str, Int]),
    ("chown", &[Str, Int, Int]),
    ("close", &[Fd]),
    ("connect", &[Fd, SockAddr, Int]),
    ("creat", &[Str, Int]),
    ("dup", &[Fd]),
    ("dup2", &[Fd, Fd]),
    ("dup3", &[Fd, Fd, Int]),
    ("execve", &[Str, StrArray, StrArray]),
    ("execveat", &[Fd, Str, StrArray, StrArray, Int]),
    ("exit", &[Int]),
    ("exit_group", &[Int]),
    ("faccessat", &[Fd, Str, Int]),
    ("faccessat2", &[Fd, Str, Int, Int]),
    ("fchdir", &[Fd]),
    ("fstat", &[Fd, Ptr]),
    ("getcwd", &[Ptr, Int]),
    ("getpeername", &[Fd, Ptr, Ptr]),
    ("getpid", &[]),
    ("getppid", &[]),
    ("getsockname", &[Fd, Ptr, Ptr]),
    ("getsockopt", &[Fd, Int, Int, Ptr, Ptr]),
    ("kill", &[Int, Int]),
    ("link", &[Str, Str]),
    ("listen", &[Fd, Int]),
    ("lseek", &[Fd, Int, Int]),
    ("lstat", &[Str, Ptr]),
    ("mkdir", &[Str, Int]),
    ("mkdirat", &[Fd, Str, Int]),
    ("mmap", &[Ptr, Int, Int, Int, Fd, Int]),
    ("mprotect", &[Ptr, Int, Int]),
    ("munmap", &[Ptr, Int]),
    ("newfstatat", &[Fd, Str, Ptr, Int]),
    ("open", &[Str, Int, Int]),
    ("openat", &[Fd, Str, Int, Int]),
    ("pipe", &[Ptr]),
    ("pipe2", &[Ptr, Int]),
    ("read", &[Fd, Ptr, Int]),
    ("readlink", &[Str, Ptr, Int]),
    ("readlinkat", &[Fd, Str, Ptr, Int]),
    ("recvfrom", &[Fd, Ptr, Int, Int, Ptr, Ptr]),
    ("recvmsg", &[Fd, Ptr, Int]),
    ("rename", &[Str, Str]),
    ("renameat", &[Fd, Str, Fd, Str]),
    ("renameat2", &[Fd, Str, Fd, Str, Int]),
    ("rmdir", &[Str]),
    ("sendmsg", &[Fd, Ptr, Int]),
    ("sendto", &[Fd, Ptr, Int, Int, SockAddr, Int]),
    ("setsockopt", &[Fd, Int, Int, Ptr, Int]),
    ("shutdown", &[Fd, Int]),
    ("socket", &[Int, Int, Int]),
    ("socketcall", &[Int, Ptr]),
    ("socketpair", &[Int, Int, Int, Ptr]),
    ("stat", &[Str, Ptr]),
    ("statx", &[Fd, Str, Int, Int, Ptr]),
    ("symlink", &[Str, Str]),
    ("tgkill", &[Int, Int, Int]),
    ("tkill", &[Int, Int]),
    ("truncate", &[Str, Int]),
    ("unlink", &[Str]),
    ("unlinkat", &[Fd, Str, Int]),
    ("write", &[Fd, Ptr, Int]),
];

lazy_static! {
    static ref SIGNATURE_INDEX: HashMap<&'static str, &'static [Arg]> =
        SIGNATURES.iter().copied().collect();
}

/// Look up the name of syscall `number` in the table for `bitness`.
///
/// Returns `None` for numbers without a table entry. Callers should fall back to printing the
/// number itself.
pub fn name(number: u64, bitness: Bitness) -> Option<&'static str> {
    let number = usize::try_from(number).ok()?;
    lookup(number, bitness)
}

#[cfg(target_arch = "x86_64")]
fn lookup(number: usize, bitness: Bitness) -> Option<&'static str> {
    match bitness {
        Bitness::Bits64 => syscalls::x86_64::Sysno::new(number).map(|sysno| sysno.name()),
        Bitness::Bits32 => syscalls::x86::Sysno::new(number).map(|sysno| sysno.name()),
        Bitness::Unknown => None,
    }
}

#[cfg(target_arch = "aarch64")]
fn lookup(number: usize, bitness: Bitness) -> Option<&'static str> {
    match bitness {
        Bitness::Bits64 => syscalls::aarch64::Sysno::new(number).map(|sysno| sysno.name()),
        Bitness::Bits32 => syscalls::arm::Sysno::new(number).map(|sysno| sysno.name()),
        Bitness::Unknown => None,
    }
}

/// Describe syscall `number` for `bitness`.
pub fn describe(number: u64, bitness: Bitness) -> Option<Descriptor> {
    let name = name(number, bitness)?;
    let args = SIGNATURE_INDEX.get(name).copied();

    Some(Descriptor { number, name, args })
}

/// Return `true` if `name` is a syscall that replaces the program image on success.
pub fn is_exec(name: &str) -> bool {
    name == "execve" || name == "execveat"
}

/// Return `true` if `name` is `socketcall(2)`, through which ia32 and AArch32 images may
/// multiplex their socket syscalls.
pub fn is_socketcall(name: &str) -> bool {
    name == "socketcall"
}

/// Subcall of `socketcall(2)`, passed in its first argument.
///
/// The arguments of the subcall are passed as an array of words, pointed to by the second
/// argument.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub enum SocketCall {
    Socket = 1,
    Bind,
    Connect,
    Listen,
    Accept,
    GetSockName,
    GetPeerName,
    SocketPair,
    Send,
    Recv,
    SendTo,
    RecvFrom,
    Shutdown,
    SetSockOpt,
    GetSockOpt,
    SendMsg,
    RecvMsg,
    Accept4,
    RecvMmsg,
    SendMmsg,
}

// Indexed by subcall number less one, per `include/uapi/linux/net.h`.
const SOCKET_CALLS: [(SocketCall, &str); 20] = [
    (SocketCall::Socket, "socket"),
    (SocketCall::Bind, "bind"),
    (SocketCall::Connect, "connect"),
    (SocketCall::Listen, "listen"),
    (SocketCall::Accept, "accept"),
    (SocketCall::GetSockName, "getsockname"),
    (SocketCall::GetPeerName, "getpeername"),
    (SocketCall::SocketPair, "socketpair"),
    (SocketCall::Send, "send"),
    (SocketCall::Recv, "recv"),
    (SocketCall::SendTo, "sendto"),
    (SocketCall::RecvFrom, "recvfrom"),
    (SocketCall::Shutdown, "shutdown"),
    (SocketCall::SetSockOpt, "setsockopt"),
    (SocketCall::GetSockOpt, "getsockopt"),
    (SocketCall::SendMsg, "sendmsg"),
    (SocketCall::RecvMsg, "recvmsg"),
    (SocketCall::Accept4, "accept4"),
    (SocketCall::RecvMmsg, "recvmmsg"),
    (SocketCall::SendMmsg, "sendmmsg"),
];

impl SocketCall {
    pub fn name(self) -> &'static str {
        SOCKET_CALLS[self as usize - 1].1
    }

    /// Argument hints of the subcall, if its signature is known.
    pub fn args(self) -> Option<&'static [Arg]> {
        SIGNATURE_INDEX.get(self.name()).copied()
    }
}

/// Decode the subcall number of a `socketcall(2)`.
pub fn socket_call(subcall: u64) -> Option<SocketCall> {
    let index = usize::try_from(subcall).ok()?.checked_sub(1)?;

    SOCKET_CALLS.get(index).map(|(call, _)| *call)
}

/// Decode a syscall return value as an error, if it is one.
///
/// The kernel returns `-errno` for failed syscalls, with errno in `1..=4095`.
pub fn errno(ret: i64) -> Option<Errno> {
    if (-MAX_ERRNO..0).contains(&ret) {
        Some(Errno::from_i32(-ret as i32))
    } else {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[cfg(target_arch = "x86_64")]
    #[test]
    fn test_name_x86_64() {
        assert_eq!(name(0, Bitness::Bits64), Some("read"));
        assert_eq!(name(59, Bitness::Bits64), Some("execve"));
        assert_eq!(name(62, Bitness::Bits64), Some("kill"));

        // ia32 numbering differs.
        assert_eq!(name(11, Bitness::Bits32), Some("execve"));
        assert_eq!(name(37, Bitness::Bits32), Some("kill"));
    }

    #[cfg(target_arch = "aarch64")]
    #[test]
    fn test_name_aarch64() {
        assert_eq!(name(221, Bitness::Bits64), Some("execve"));
        assert_eq!(name(129, Bitness::Bits64), Some("kill"));
        assert_eq!(name(11, Bitness::Bits32), Some("execve"));
    }

    #[test]
    fn test_name_unknown() {
        assert_eq!(name(0xbadca11, Bitness::Bits64), None);
        assert_eq!(name(u64::MAX, Bitness::Bits64), None);
        assert_eq!(name(0, Bitness::Unknown), None);
    }

    #[test]
    fn test_describe() {
        let number = libc::SYS_execve as u64;
        let desc = describe(number, Bitness::native()).unwrap();

        assert_eq!(desc.name, "execve");
        assert_eq!(desc.arity(), Some(3));
        assert_eq!(desc.args, Some(&[Str, StrArray, StrArray][..]));

        let number = libc::SYS_connect as u64;
        let desc = describe(number, Bitness::native()).unwrap();
        assert_eq!(desc.args.unwrap()[1], SockAddr);
    }

    #[test]
    fn test_describe_without_signature() {
        let number = libc::SYS_rt_sigprocmask as u64;
        let desc = describe(number, Bitness::native()).unwrap();

        assert_eq!(desc.name, "rt_sigprocmask");
        assert_eq!(desc.arity(), None);
    }

    #[test]
    fn test_signatures_fit_argument_registers() {
        for (name, args) in SIGNATURES {
            assert!(args.len() <= MAX_ARGS, "{}", name);
        }

        assert_eq!(SIGNATURE_INDEX.len(), SIGNATURES.len());
    }

    #[test]
    fn test_errno() {
        assert_eq!(errno(-2), Some(Errno::ENOENT));
        assert_eq!(errno(-(libc::EPERM as i64)), Some(Errno::EPERM));
        assert_eq!(errno(0), None);
        assert_eq!(errno(3), None);

        // Large "negative" results, e.g. `mmap()` addresses in the upper half, are not errors.
        assert_eq!(errno(-4096), None);
    }

    #[test]
    fn test_socket_call() {
        assert_eq!(socket_call(0), None);
        assert_eq!(socket_call(1), Some(SocketCall::Socket));
        assert_eq!(socket_call(3), Some(SocketCall::Connect));
        assert_eq!(socket_call(11), Some(SocketCall::SendTo));
        assert_eq!(socket_call(20), Some(SocketCall::SendMmsg));
        assert_eq!(socket_call(21), None);
        assert_eq!(socket_call(u64::MAX), None);

        for (index, (call, name)) in SOCKET_CALLS.iter().enumerate() {
            assert_eq!(*call as usize, index + 1, "{}", name);
            assert_eq!(call.name(), *name);
        }
    }

    #[test]
    fn test_socket_call_args() {
        assert_eq!(SocketCall::Connect.args(), Some(&[Fd, SockAddr, Int][..]));
        assert_eq!(SocketCall::SendTo.args().unwrap()[4], SockAddr);

        // No standalone syscall to borrow a signature from.
        assert_eq!(SocketCall::Send.args(), None);
    }

    #[cfg(target_arch = "x86_64")]
    #[test]
    fn test_socketcall_is_ia32_only() {
        assert_eq!(name(102, Bitness::Bits32), Some("socketcall"));
        assert!(is_socketcall("socketcall"));

        let number = libc::SYS_connect as u64;
        assert!(!is_socketcall(name(number, Bitness::Bits64).unwrap()));
    }

    #[test]
    fn test_is_exec() {
        assert!(is_exec("execve"));
        assert!(is_exec("execveat"));
        assert!(!is_exec("execv"));
    }
}

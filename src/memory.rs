//! Reading and decoding tracee memory pointed to by syscall arguments.
//!
//! Decoders make a fresh read on every call. Nothing is cached across stops.

use std::cmp;
use std::fmt;
use std::io;
use std::net::{Ipv4Addr, Ipv6Addr, SocketAddrV4, SocketAddrV6};
use std::os::unix::fs::FileExt;

use lazy_static::lazy_static;

use crate::error::{Error, Result};
use crate::ptracer::Tracee;
use crate::syscall::{self, SocketCall, MAX_ARGS};

/// Size of `struct sockaddr_storage`, the most a socket address can occupy.
pub const SOCKADDR_MAX: usize = 128;

lazy_static! {
    static ref PAGE_SIZE: u64 = {
        let ret = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
        if ret > 0 { ret as u64 } else { 4096 }
    };
}

/// Socket address decoded from tracee memory.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum Address {
    /// The address pointer was `NULL`.
    Null,

    /// `AF_UNIX`. Unnamed sockets have an empty path.
    Unix { path: String, is_abstract: bool },

    /// `AF_INET`.
    Inet(SocketAddrV4),

    /// `AF_INET6`.
    Inet6(SocketAddrV6),

    /// `AF_NETLINK`.
    Netlink { pid: u32, groups: u32 },

    /// A family we do not decode, or an address too short for its family.
    Unsupported { family: u16 },
}

/// Snapshot of a `struct sockaddr` argument.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct DecodedAddress {
    /// Raw `sa_family`, or `None` for a `NULL` address.
    pub family: Option<u16>,

    /// Address length passed by the tracee.
    pub length: u64,

    pub address: Address,
}

impl Address {
    /// Decode the bytes of a `struct sockaddr`, laid out for the host.
    pub fn parse(bytes: &[u8]) -> Self {
        let family = match bytes.get(0..2) {
            Some(family) => u16::from_ne_bytes([family[0], family[1]]),
            None => return Address::Unsupported { family: libc::AF_UNSPEC as u16 },
        };
        let data = &bytes[2..];

        match i32::from(family) {
            libc::AF_UNIX => parse_unix(data),
            libc::AF_INET => parse_inet(data).unwrap_or(Address::Unsupported { family }),
            libc::AF_INET6 => parse_inet6(data).unwrap_or(Address::Unsupported { family }),
            libc::AF_NETLINK => parse_netlink(data).unwrap_or(Address::Unsupported { family }),
            _ => Address::Unsupported { family },
        }
    }
}

fn parse_unix(path: &[u8]) -> Address {
    match path.split_first() {
        // Abstract socket names are not NUL-terminated, and span the whole address.
        Some((0, name)) => {
            let path = String::from_utf8_lossy(name).into_owned();
            Address::Unix { path, is_abstract: true }
        },
        _ => {
            let end = path.iter().position(|&b| b == 0).unwrap_or(path.len());
            let path = String::from_utf8_lossy(&path[..end]).into_owned();
            Address::Unix { path, is_abstract: false }
        },
    }
}

// `sin_port`, `sin_addr`, both in network byte order.
fn parse_inet(data: &[u8]) -> Option<Address> {
    let port = u16::from_be_bytes(data.get(0..2)?.try_into().ok()?);
    let octets: [u8; 4] = data.get(2..6)?.try_into().ok()?;

    Some(Address::Inet(SocketAddrV4::new(Ipv4Addr::from(octets), port)))
}

// `sin6_port`, `sin6_flowinfo`, `sin6_addr`, then the host-order `sin6_scope_id`, which
// RFC 2133-era callers omit.
fn parse_inet6(data: &[u8]) -> Option<Address> {
    let port = u16::from_be_bytes(data.get(0..2)?.try_into().ok()?);
    let flowinfo = u32::from_be_bytes(data.get(2..6)?.try_into().ok()?);
    let octets: [u8; 16] = data.get(6..22)?.try_into().ok()?;
    let scope_id = match data.get(22..26) {
        Some(scope_id) => u32::from_ne_bytes(scope_id.try_into().ok()?),
        None => 0,
    };

    let addr = SocketAddrV6::new(Ipv6Addr::from(octets), port, flowinfo, scope_id);

    Some(Address::Inet6(addr))
}

// `nl_pad`, `nl_pid`, `nl_groups`.
fn parse_netlink(data: &[u8]) -> Option<Address> {
    let pid = u32::from_ne_bytes(data.get(2..6)?.try_into().ok()?);
    let groups = u32::from_ne_bytes(data.get(6..10)?.try_into().ok()?);

    Some(Address::Netlink { pid, groups })
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Address::Null => write!(f, "NULL"),
            Address::Unix { path, is_abstract: true } => write!(f, "unix:@{:?}", path),
            Address::Unix { path, is_abstract: false } => write!(f, "unix:{:?}", path),
            Address::Inet(addr) => write!(f, "inet:{}", addr),
            Address::Inet6(addr) => write!(f, "inet6:{}", addr),
            Address::Netlink { pid, groups } => write!(f, "netlink:{}:{:#x}", pid, groups),
            Address::Unsupported { family } => write!(f, "family:{}", family),
        }
    }
}

// Address of element `index` of a word array at `base`.
fn word_address(base: u64, index: usize, word: usize) -> Option<u64> {
    (index as u64)
        .checked_mul(word as u64)
        .and_then(|off| base.checked_add(off))
}

// Read a host-endian word of 4 or 8 bytes.
fn word_from_bytes(bytes: &[u8]) -> Option<u64> {
    match *bytes {
        [a, b, c, d] => Some(u64::from(u32::from_ne_bytes([a, b, c, d]))),
        [a, b, c, d, e, f, g, h] => Some(u64::from_ne_bytes([a, b, c, d, e, f, g, h])),
        _ => None,
    }
}

impl Tracee {
    pub fn read_memory(&self, addr: u64, len: usize) -> Result<Vec<u8>> {
        let mut data = vec![0; len];
        let len_read = self.read_memory_mut(addr, &mut data)?;
        data.truncate(len_read);
        Ok(data)
    }

    /// Read into `data`, returning the number of bytes read. Reads may be short when they
    /// extend into unmapped memory, but fail if no byte at `addr` is readable.
    pub fn read_memory_mut(&self, addr: u64, data: &mut [u8]) -> Result<usize> {
        let mem = self.memory()?;
        read_at(self, &mem, addr, data)
    }

    pub fn write_memory(&mut self, addr: u64, data: &[u8]) -> Result<usize> {
        self.ensure_alive()?;

        let mem = std::fs::OpenOptions::new()
            .read(true)
            .write(true)
            .open(self.proc_mem_path())?;

        let len = mem.write_at(data, addr)?;

        Ok(len)
    }

    /// Read a NUL-terminated string at `addr`, of at most `max_len` bytes if bounded.
    ///
    /// The terminator is not included.
    pub fn read_string(&self, addr: u64, max_len: Option<usize>) -> Result<Vec<u8>> {
        let mem = self.memory()?;
        let mut string = vec![];
        let mut addr = addr;

        loop {
            let remaining = match max_len {
                Some(max_len) => max_len - string.len(),
                None => usize::MAX,
            };

            if remaining == 0 {
                break;
            }

            // Never cross a page boundary in one read, so an unmapped next page cannot fail a
            // read that ends in a mapped one.
            let to_page_end = *PAGE_SIZE - (addr % *PAGE_SIZE);
            let len = cmp::min(to_page_end, remaining as u64) as usize;

            let mut chunk = vec![0; len];
            let len_read = read_at(self, &mem, addr, &mut chunk)?;
            chunk.truncate(len_read);

            if let Some(nul) = chunk.iter().position(|&b| b == 0) {
                string.extend_from_slice(&chunk[..nul]);
                break;
            }

            string.extend_from_slice(&chunk);
            addr = match addr.checked_add(len_read as u64) {
                Some(addr) => addr,
                None => break,
            };
        }

        Ok(string)
    }

    /// Decode the string pointed to by argument `index`, reading at most `max_len` bytes if
    /// bounded. Invalid UTF-8 is replaced.
    pub fn decode_string(&self, index: usize, max_len: Option<usize>) -> Result<String> {
        let addr = self.argument(index)?;
        let string = self.read_string(addr, max_len)?;

        Ok(String::from_utf8_lossy(&string).into_owned())
    }

    /// Decode element `index` of the `NULL`-terminated string pointer array at `base`, like
    /// `argv` or `envp`.
    ///
    /// Returns `None` at the terminating `NULL`. Each call is an independent read, so
    /// iterating from index 0 again yields the current contents.
    pub fn decode_string_array_element(&self, base: u64, index: usize) -> Result<Option<String>> {
        let ptr = self.read_word(base, index)?;

        if ptr == 0 {
            return Ok(None);
        }

        let string = self.read_string(ptr, None)?;

        Ok(Some(String::from_utf8_lossy(&string).into_owned()))
    }

    // Read element `index` of the word array at `base`, sized for the tracee's bitness.
    fn read_word(&self, base: u64, index: usize) -> Result<u64> {
        let word = match self.bitness().word_size() {
            Some(word) => word,
            None => return Err(Error::UnsupportedBitness { pid: self.pid() }),
        };

        let addr = word_address(base, index, word)
            .ok_or_else(|| self.memory_error(base, io::ErrorKind::InvalidInput.into()))?;

        let bytes = self.read_memory(addr, word)?;

        word_from_bytes(&bytes)
            .ok_or_else(|| self.memory_error(addr, io::ErrorKind::UnexpectedEof.into()))
    }

    /// Decode the subcall of the current syscall, if it is a `socketcall(2)`.
    pub fn socket_call(&self) -> Result<Option<SocketCall>> {
        if self.is_socketcall()? {
            Ok(syscall::socket_call(self.argument(0)?))
        } else {
            Ok(None)
        }
    }

    fn is_socketcall(&self) -> Result<bool> {
        let number = self.syscall_number()?;

        Ok(syscall::name(number, self.bitness()).map_or(false, syscall::is_socketcall))
    }

    /// Read argument `index` of the current socket syscall.
    ///
    /// For a `socketcall(2)`, this is the argument of its subcall, read from the array in the
    /// tracee's memory. Otherwise, it is the syscall argument itself.
    pub fn socket_argument(&self, index: usize) -> Result<u64> {
        if index >= MAX_ARGS {
            return Err(Error::InvalidArgumentIndex { index });
        }

        if self.is_socketcall()? {
            let args = self.argument(1)?;
            self.read_word(args, index)
        } else {
            self.argument(index)
        }
    }

    /// Decode the socket address of a syscall shaped like `(fd, struct sockaddr *, len)`, with
    /// the address in argument `index` and its length in the argument after it.
    ///
    /// Arguments are those of the socket call, so a `socketcall(2)` is decoded through its
    /// argument array. Returns the address and the raw value of the file descriptor argument
    /// 0. The live socket is never inspected.
    pub fn decode_socket_address(&self, index: usize) -> Result<(DecodedAddress, i64)> {
        let fd = self.socket_argument(0)? as i32 as i64;
        let addr = self.socket_argument(index)?;
        let length = match index + 1 {
            len_index if len_index < MAX_ARGS => self.socket_argument(len_index)?,
            _ => SOCKADDR_MAX as u64,
        };

        if addr == 0 {
            let address = DecodedAddress { family: None, length, address: Address::Null };
            return Ok((address, fd));
        }

        let len = cmp::min(length, SOCKADDR_MAX as u64) as usize;
        let bytes = self.read_memory(addr, len)?;
        let address = Address::parse(&bytes);
        let family = bytes.get(0..2).map(|family| u16::from_ne_bytes([family[0], family[1]]));

        Ok((DecodedAddress { family, length, address }, fd))
    }

    /// Write `string` and a NUL terminator to the memory pointed to by argument `index`.
    ///
    /// The tracee must own enough writable memory there.
    pub fn encode_string(&mut self, index: usize, string: &str) -> Result<()> {
        let addr = self.argument(index)?;

        let mut data = Vec::with_capacity(string.len() + 1);
        data.extend_from_slice(string.as_bytes());
        data.push(0);

        let len = self.write_memory(addr, &data)?;

        if len != data.len() {
            return Err(self.memory_error(addr, io::ErrorKind::WriteZero.into()));
        }

        Ok(())
    }

    fn memory_error(&self, addr: u64, source: io::Error) -> Error {
        Error::MemoryRead { pid: self.pid(), addr, source }
    }
}

fn read_at(tracee: &Tracee, mem: &std::fs::File, addr: u64, data: &mut [u8]) -> Result<usize> {
    if data.is_empty() {
        return Ok(0);
    }

    match mem.read_at(data, addr) {
        Ok(0) => Err(tracee.memory_error(addr, io::ErrorKind::UnexpectedEof.into())),
        Ok(len) => Ok(len),
        Err(source) => Err(tracee.memory_error(addr, source)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn sockaddr(family: i32, data: &[u8]) -> Vec<u8> {
        let mut bytes = (family as u16).to_ne_bytes().to_vec();
        bytes.extend_from_slice(data);
        bytes
    }

    #[test]
    fn test_word_from_bytes() {
        assert_eq!(word_from_bytes(&0x1234_5678u32.to_ne_bytes()), Some(0x1234_5678));
        assert_eq!(
            word_from_bytes(&0xdead_beef_cafe_f00du64.to_ne_bytes()),
            Some(0xdead_beef_cafe_f00d),
        );

        // 32-bit words are zero-extended.
        assert_eq!(word_from_bytes(&u32::MAX.to_ne_bytes()), Some(0xffff_ffff));

        // Short reads.
        assert_eq!(word_from_bytes(&[]), None);
        assert_eq!(word_from_bytes(&[1, 2, 3]), None);
        assert_eq!(word_from_bytes(&[1, 2, 3, 4, 5]), None);
    }

    #[test]
    fn test_word_address() {
        // A `socketcall(SYS_CONNECT, args)` array of `{ fd, addr, len }`.
        assert_eq!(word_address(0x1000, 0, 4), Some(0x1000));
        assert_eq!(word_address(0x1000, 1, 4), Some(0x1004));
        assert_eq!(word_address(0x1000, 2, 4), Some(0x1008));
        assert_eq!(word_address(0x1000, 2, 8), Some(0x1010));

        assert_eq!(word_address(u64::MAX - 4, 1, 8), None);
        assert_eq!(word_address(0, usize::MAX, 8), None);
    }

    #[test]
    fn test_parse_socketcall_args() {
        let args: Vec<u8> = [3u32, 0xffd0_1234, 16]
            .iter()
            .flat_map(|arg| arg.to_ne_bytes())
            .collect();

        let words: Vec<_> = (0..3)
            .map(|index| {
                let addr = word_address(0, index, 4).unwrap() as usize;
                word_from_bytes(&args[addr..addr + 4]).unwrap()
            })
            .collect();

        assert_eq!(words, vec![3, 0xffd0_1234, 16]);
    }

    #[test]
    fn test_parse_unix() {
        let bytes = sockaddr(libc::AF_UNIX, b"/tmp/s\0garbage");

        assert_eq!(
            Address::parse(&bytes),
            Address::Unix { path: "/tmp/s".into(), is_abstract: false },
        );
    }

    #[test]
    fn test_parse_unix_unterminated() {
        let bytes = sockaddr(libc::AF_UNIX, b"/tmp/s");

        assert_eq!(
            Address::parse(&bytes),
            Address::Unix { path: "/tmp/s".into(), is_abstract: false },
        );
    }

    #[test]
    fn test_parse_unix_abstract_and_unnamed() {
        let bytes = sockaddr(libc::AF_UNIX, b"\0pinch");
        assert_eq!(
            Address::parse(&bytes),
            Address::Unix { path: "pinch".into(), is_abstract: true },
        );

        let bytes = sockaddr(libc::AF_UNIX, b"");
        assert_eq!(
            Address::parse(&bytes),
            Address::Unix { path: "".into(), is_abstract: false },
        );
    }

    #[test]
    fn test_parse_inet() {
        let bytes = sockaddr(libc::AF_INET, &[0, 80, 127, 0, 0, 1, 0, 0, 0, 0, 0, 0, 0, 0]);
        let expected = SocketAddrV4::new(Ipv4Addr::new(127, 0, 0, 1), 80);

        assert_eq!(Address::parse(&bytes), Address::Inet(expected));
        assert_eq!(Address::parse(&bytes).to_string(), "inet:127.0.0.1:80");
    }

    #[test]
    fn test_parse_inet6() {
        let mut data = vec![0x1f, 0x90];
        data.extend_from_slice(&[0, 0, 0, 0]);
        data.extend_from_slice(&Ipv6Addr::LOCALHOST.octets());
        data.extend_from_slice(&0u32.to_ne_bytes());
        let bytes = sockaddr(libc::AF_INET6, &data);

        let expected = SocketAddrV6::new(Ipv6Addr::LOCALHOST, 8080, 0, 0);
        assert_eq!(Address::parse(&bytes), Address::Inet6(expected));
        assert_eq!(Address::parse(&bytes).to_string(), "inet6:[::1]:8080");
    }

    #[test]
    fn test_parse_netlink() {
        let mut data = vec![0, 0];
        data.extend_from_slice(&1234u32.to_ne_bytes());
        data.extend_from_slice(&0x10u32.to_ne_bytes());
        let bytes = sockaddr(libc::AF_NETLINK, &data);

        assert_eq!(Address::parse(&bytes), Address::Netlink { pid: 1234, groups: 0x10 });
    }

    #[test]
    fn test_parse_truncated() {
        let family = libc::AF_INET as u16;
        let bytes = sockaddr(libc::AF_INET, &[0, 80, 127]);
        assert_eq!(Address::parse(&bytes), Address::Unsupported { family });

        assert_eq!(
            Address::parse(&[1]),
            Address::Unsupported { family: libc::AF_UNSPEC as u16 },
        );
    }

    #[test]
    fn test_parse_unsupported_family() {
        let family = libc::AF_PACKET as u16;
        let bytes = sockaddr(libc::AF_PACKET, &[0; 18]);

        assert_eq!(Address::parse(&bytes), Address::Unsupported { family });
    }
}

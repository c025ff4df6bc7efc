use std::io;

use nix::errno::Errno;

use crate::ptracer::Pid;


pub type Result<T> = std::result::Result<T, Error>;

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("Syscall argument index {index} out of range")]
    InvalidArgumentIndex { index: usize },

    #[error("Tracee = {pid} is not stopped")]
    ProcessNotStopped { pid: Pid },

    #[error("Tracee = {pid} was not resumed, and has no stop to wait for")]
    ProcessNotRunning { pid: Pid },

    #[error("Tracee = {pid} does not exist")]
    NoSuchProcess { pid: Pid },

    #[error("Not permitted to trace process = {pid}")]
    PermissionDenied { pid: Pid },

    #[error("Unsupported bitness for tracee = {pid}")]
    UnsupportedBitness { pid: Pid },

    #[error("Could not read memory of tracee = {pid} at 0x{addr:x}")]
    MemoryRead {
        pid: Pid,
        addr: u64,
        source: io::Error,
    },

    #[error("Spawned child = {pid} terminated before its initial stop (status = {status:#x})")]
    SpawnFailed { pid: Pid, status: i32 },

    #[error("Could not attach to tracee = {pid}")]
    Attach {
        pid: Pid,
        source: nix::Error,
    },

    #[error("Input/output error")]
    IO(#[from] io::Error),

    #[error("OS error")]
    OS(#[from] nix::Error),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Return `true` if the error means the tracee has vanished.
    pub fn is_no_such_process(&self) -> bool {
        matches!(self, Error::NoSuchProcess { .. })
    }
}

pub(crate) trait ResultExt<T> {
    /// Map `ESRCH` to [`Error::NoSuchProcess`] for `pid`.
    fn died_if_esrch(self, pid: Pid) -> Result<T>;
}

impl<T> ResultExt<T> for nix::Result<T> {
    fn died_if_esrch(self, pid: Pid) -> Result<T> {
        self.map_err(|errno| match errno {
            Errno::ESRCH => Error::NoSuchProcess { pid },
            errno => Error::OS(errno),
        })
    }
}

macro_rules! internal_error {
    ($msg: expr) => {
        return Err(crate::error::Error::Internal($msg.into()))
    };
}

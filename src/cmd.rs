use std::env;
use std::ffi::{CString, OsStr};
use std::io;
use std::os::unix::ffi::OsStrExt;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};

use nix::{
    sys::{signal::{raise, Signal}, ptrace},
    unistd::{fork, ForkResult, Pid},
};
use tracing::debug;

use crate::error::Result;


/// Exit code of a spawned child that could not exec its program.
pub const SPAWN_FAILED_EXIT_CODE: i32 = 127;

/// Outcome of forking a traced child.
#[derive(Debug)]
pub enum Fork<T> {
    /// We are the child, stopped and resumed by the tracer.
    Child,

    /// We are the tracer, holding the stopped child.
    Parent(T),
}

/// Command to spawn as a child process to be traced.
#[derive(Clone, Debug)]
pub struct Command {
    /// Path passed to `execv()`.
    path: CString,

    /// Argument vector to pass to `execv()`.
    argv: Vec<CString>,
}

impl Command {
    /// Command that executes `argv[0]` with `argv`.
    ///
    /// A program name without a `/` is looked up in `PATH`, before any fork.
    pub fn new(argv: Vec<impl Into<Vec<u8>>>) -> Result<Self> {
        let argv = to_cstrings(argv)?;

        let program = match argv.first() {
            Some(program) => OsStr::from_bytes(program.as_bytes()),
            None => {
                let err = io::Error::new(io::ErrorKind::InvalidInput, "Command exe required");
                return Err(err.into());
            },
        };
        let path = resolve(program);
        let path = CString::new(path.as_os_str().as_bytes()).map_err(io::Error::from)?;

        Ok(Self { path, argv })
    }

    /// Command that executes the program at `path`, with an arbitrary argument vector.
    pub fn with_path(path: impl AsRef<Path>, argv: Vec<impl Into<Vec<u8>>>) -> Result<Self> {
        let path = CString::new(path.as_ref().as_os_str().as_bytes()).map_err(io::Error::from)?;
        let argv = to_cstrings(argv)?;

        Ok(Self { path, argv })
    }

    pub fn path(&self) -> &Path {
        Path::new(OsStr::from_bytes(self.path.as_bytes()))
    }

    /// Fork and exec a child process determined by `self.path` and `self.argv`.
    ///
    /// The child will set itself as a tracee of the parent, then raise `SIGSTOP` so the parent
    /// can observe it pre-exec, without a race. If the exec fails, the child exits with
    /// [`SPAWN_FAILED_EXIT_CODE`].
    pub fn fork_exec(self) -> Result<Pid> {
        // Heap-allocates, must occur pre-fork.
        let argv = self.argv();

        debug!(path = ?self.path, "forking tracee");

        // SAFETY: the child only makes async-signal-safe calls before `execv()` or `_exit()`.
        match unsafe { fork_traceme()? } {
            None => {
                // Use unsafe `libc::execv`, because the `nix` wrapper heap-allocates a `Vec`
                // internally, which is not async-signal-safe.
                unsafe {
                    libc::execv(self.path.as_ptr(), argv.as_ptr());
                    libc::_exit(SPAWN_FAILED_EXIT_CODE);
                }
            },
            Some(child) => Ok(child),
        }
    }

    // Construct NUL-terminated arguments for `execv`. We heap-allocate to return a `Vec`,
    // and so must do this before calling `fork()`.
    fn argv(&self) -> Vec<*const libc::c_char> {
        let mut argv: Vec<_> = self.argv
            .iter()
            .map(|s| s.as_ptr())
            .collect();
        argv.push(std::ptr::null());
        argv
    }
}

/// Fork. The child requests `PTRACE_TRACEME` and stops itself with `SIGSTOP`.
///
/// Returns `None` in the child, once the tracer resumes it, and the child's PID in the parent.
///
/// # Safety
///
/// If the calling process is multithreaded, the child may only make async-signal-safe calls
/// until it execs or exits.
pub(crate) unsafe fn fork_traceme() -> Result<Option<Pid>> {
    match fork()? {
        ForkResult::Child => {
            // If any post-fork call fails, `_exit`, since `?` may call `malloc` via `Into`,
            // which is not async-signal-safe.
            if ptrace::traceme().is_err() {
                libc::_exit(SPAWN_FAILED_EXIT_CODE);
            }

            if raise(Signal::SIGSTOP).is_err() {
                libc::_exit(SPAWN_FAILED_EXIT_CODE);
            }

            Ok(None)
        },
        ForkResult::Parent { child } => Ok(Some(child)),
    }
}

fn to_cstrings(argv: Vec<impl Into<Vec<u8>>>) -> Result<Vec<CString>> {
    // Ensure we own NUL-terminated strings for the foreign exec call.
    let argv: std::result::Result<Vec<_>, _> = argv
        .into_iter()
        .map(CString::new)
        .collect();

    Ok(argv.map_err(io::Error::from)?)
}

// Find `program` in `PATH`, like `execvp()` would. Unresolvable names are returned as-is, and
// left to fail in the child.
fn resolve(program: &OsStr) -> PathBuf {
    if program.as_bytes().contains(&b'/') {
        return PathBuf::from(program);
    }

    let paths = env::var_os("PATH").unwrap_or_default();

    env::split_paths(&paths)
        .map(|dir| dir.join(program))
        .find(|candidate| is_executable(candidate))
        .unwrap_or_else(|| PathBuf::from(program))
}

fn is_executable(path: &Path) -> bool {
    match path.metadata() {
        Ok(meta) => meta.is_file() && meta.permissions().mode() & 0o111 != 0,
        Err(_) => false,
    }
}

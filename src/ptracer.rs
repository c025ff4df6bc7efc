//! Types for spawning and attaching to tracees, resuming them, and accessing their syscall state.

use std::fs;
use std::marker::PhantomData;

use nix::{
    errno::Errno,
    sys::{
        ptrace,
        signal::{self, Signal},
    },
};
use tracing::{debug, info, trace};

use crate::arch;
use crate::bitness::Bitness;
use crate::cmd::{self, Command, Fork};
use crate::error::{Error, Result, ResultExt};
use crate::event::{self, Event};
use crate::syscall::MAX_ARGS;

pub use nix::unistd::Pid;
pub use nix::sys::ptrace::Options;

/// Trace state of a tracee.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum State {
    // Restarted, and not yet seen to stop.
    Running,

    // In some ptrace-stop other than a syscall-stop.
    Stopped,

    // syscall-enter-stop
    SyscallEntry,

    // syscall-exit-stop
    SyscallExit,

    // Exited or killed, and reaped.
    Terminated,
}

impl State {
    pub fn is_stopped(self) -> bool {
        matches!(self, State::Stopped | State::SyscallEntry | State::SyscallExit)
    }
}

/// Restart requests, which resume stopped tracees.
///
/// The restart mode determines the possible subsequent stops of the restarted tracee.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Restart {
    Step,
    Continue,
    Syscall,
}

/// A traced process.
///
/// Register and memory accessors are only valid while the tracee is stopped, that is, between
/// a [`Ptracer::wait()`] that reported a stop and the next restart.
#[derive(Debug)]
pub struct Tracee {
    pid: Pid,
    bitness: Bitness,
    state: State,

    // Number of the syscall most recently entered.
    syscall: Option<u64>,

    // Signal to deliver on the next restart.
    pending: Option<i32>,

    // Bitness detections since setup.
    detections: usize,

    #[doc(hidden)]
    _not_send: PhantomData<*const ()>,
}

impl Tracee {
    fn new(pid: Pid, bitness: Bitness) -> Self {
        let state = State::Stopped;
        let _not_send = PhantomData;

        Self { pid, bitness, state, syscall: None, pending: None, detections: 0, _not_send }
    }

    pub fn pid(&self) -> Pid {
        self.pid
    }

    pub fn bitness(&self) -> Bitness {
        self.bitness
    }

    pub fn state(&self) -> State {
        self.state
    }

    pub(crate) fn set_state(&mut self, state: State) {
        debug!(pid = self.pid.as_raw(), ?state, "setting tracee state");
        self.state = state;
    }

    /// Number of the syscall most recently entered, as recorded by a [`Session`](crate::Session).
    pub fn last_syscall(&self) -> Option<u64> {
        self.syscall
    }

    pub(crate) fn set_last_syscall(&mut self, number: u64) {
        self.syscall = Some(number);
    }

    pub fn pending_signal(&self) -> Option<i32> {
        self.pending
    }

    /// Set a signal to deliver to the stopped process upon restart.
    pub fn inject(&mut self, signal: i32) {
        self.pending = Some(signal);
    }

    /// Remove any signal scheduled for delivery upon restart.
    pub fn suppress(&mut self) {
        self.pending = None;
    }

    /// Re-detect the bitness of the current program image.
    pub fn detect_bitness(&mut self) -> Result<Bitness> {
        self.ensure_stopped()?;

        let bitness = Bitness::detect(self.pid)?;

        if bitness != self.bitness {
            info!(pid = self.pid.as_raw(), %bitness, "tracee bitness changed");
        }

        self.bitness = bitness;
        self.detections += 1;

        Ok(bitness)
    }

    /// Number of times [`Tracee::detect_bitness()`] has run since the tracee was set up.
    pub fn bitness_detections(&self) -> usize {
        self.detections
    }

    /// Read the syscall number, at a syscall-enter-stop or syscall-exit-stop.
    pub fn syscall_number(&self) -> Result<u64> {
        self.ensure_stopped()?;
        arch::syscall_number(self.pid, self.known_bitness()?)
    }

    /// Overwrite the syscall number. At a syscall-enter-stop, this changes which syscall runs.
    pub fn set_syscall_number(&mut self, number: u64) -> Result<()> {
        self.ensure_stopped()?;
        arch::set_syscall_number(self.pid, self.known_bitness()?, number)
    }

    /// Read the sign-extended return value. Only meaningful at a syscall-exit-stop, where
    /// failed syscalls return `-errno`.
    pub fn return_value(&self) -> Result<i64> {
        self.ensure_stopped()?;
        arch::return_value(self.pid, self.known_bitness()?)
    }

    pub fn set_return_value(&mut self, value: i64) -> Result<()> {
        self.ensure_stopped()?;
        arch::set_return_value(self.pid, self.known_bitness()?, value)
    }

    /// Read syscall argument `index`, zero-extended from the register width of the tracee.
    pub fn argument(&self, index: usize) -> Result<u64> {
        check_index(index)?;
        self.ensure_stopped()?;
        arch::argument(self.pid, self.known_bitness()?, index)
    }

    pub fn set_argument(&mut self, index: usize, value: u64) -> Result<()> {
        check_index(index)?;
        self.ensure_stopped()?;
        arch::set_argument(self.pid, self.known_bitness()?, index, value)
    }

    /// Fetch the message of the current ptrace-event-stop, via `PTRACE_GETEVENTMSG`.
    pub fn event_message(&self) -> Result<u64> {
        self.ensure_stopped()?;
        Ok(ptrace::getevent(self.pid).died_if_esrch(self.pid)? as u64)
    }

    pub(crate) fn proc_mem_path(&self) -> String {
        let tid = self.pid.as_raw() as u32;
        format!("/proc/{}/mem", tid)
    }

    pub fn memory(&self) -> Result<fs::File> {
        self.ensure_alive()?;
        Ok(fs::File::open(self.proc_mem_path())?)
    }

    pub(crate) fn ensure_stopped(&self) -> Result<()> {
        if self.state.is_stopped() {
            Ok(())
        } else {
            Err(Error::ProcessNotStopped { pid: self.pid })
        }
    }

    pub(crate) fn ensure_alive(&self) -> Result<()> {
        if self.state == State::Terminated {
            Err(Error::NoSuchProcess { pid: self.pid })
        } else {
            Ok(())
        }
    }

    pub(crate) fn known_bitness(&self) -> Result<Bitness> {
        match self.bitness {
            Bitness::Unknown => Err(Error::UnsupportedBitness { pid: self.pid }),
            bitness => Ok(bitness),
        }
    }
}

fn check_index(index: usize) -> Result<()> {
    if index < MAX_ARGS {
        Ok(())
    } else {
        Err(Error::InvalidArgumentIndex { index })
    }
}

/// Tracer for Linux processes.
///
/// Spawned and attached tracees have [`REQUIRED_OPTIONS`] set, and any extra options
/// configured via [`Ptracer::set_options()`].
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Ptracer {
    /// Ptrace options that will be applied to new tracees.
    options: Options,
}

/// Options required for internal tracee state management.
/// These are:
/// - [`PTRACE_O_TRACESYSGOOD`](Options::PTRACE_O_TRACESYSGOOD), so syscall-stops can be
///   told apart from genuine `SIGTRAP`s
/// - [`PTRACE_O_TRACEEXEC`](Options::PTRACE_O_TRACEEXEC), so a successful `execve()` does
///   not raise a `SIGTRAP`
pub const REQUIRED_OPTIONS: Options = Options::empty()
    .union(Options::PTRACE_O_TRACESYSGOOD)
    .union(Options::PTRACE_O_TRACEEXEC);

impl Ptracer {
    pub fn new() -> Self {
        let options = REQUIRED_OPTIONS;

        Self { options }
    }

    /// Return the ptrace options applied to new tracees.
    pub fn options(&self) -> Options {
        self.options
    }

    /// Set the ptrace options applied to new tracees.
    ///
    /// **NOTE:** [`REQUIRED_OPTIONS`] are always set, even if unset in the passed value.
    pub fn set_options(&mut self, options: Options) {
        self.options = options | REQUIRED_OPTIONS;
    }

    /// Spawn `cmd` for tracing.
    ///
    /// Returns once the child has been seen in its pre-exec self-stop. The first restart will
    /// run it into `execve()`.
    pub fn spawn(&mut self, cmd: Command) -> Result<Tracee> {
        let pid = cmd.fork_exec()?;

        info!(pid = pid.as_raw(), "spawned tracee");

        self.initial_stop(pid)
    }

    /// Fork the calling process, tracing the child.
    ///
    /// # Safety
    ///
    /// If the calling process is multithreaded, the child may only make async-signal-safe calls
    /// until it execs or exits.
    pub unsafe fn fork(&mut self) -> Result<Fork<Tracee>> {
        match cmd::fork_traceme()? {
            None => Ok(Fork::Child),
            Some(pid) => {
                info!(pid = pid.as_raw(), "forked tracee");

                Ok(Fork::Parent(self.initial_stop(pid)?))
            },
        }
    }

    // Wait for the self-stop of a child that requested `PTRACE_TRACEME`.
    fn initial_stop(&mut self, pid: Pid) -> Result<Tracee> {
        let status = waitpid(pid)?;

        match event::decide(status) {
            Event::SignalDelivered { signal: libc::SIGSTOP } => {},
            Event::Exited { .. } | Event::Killed { .. } => {
                return Err(Error::SpawnFailed { pid, status });
            },
            event => {
                debug!(pid = pid.as_raw(), %event, "unexpected initial stop");

                let _ = signal::kill(pid, Signal::SIGKILL);
                let _ = waitpid(pid);

                internal_error!("tracee did not self-stop before exec");
            },
        }

        self.setup(pid)
    }

    /// Attach to a running process.
    ///
    /// Returns once the attach-stop has been observed. Signals that arrive before it are
    /// delivered, not stashed.
    pub fn attach(&mut self, pid: Pid) -> Result<Tracee> {
        ptrace::attach(pid).map_err(|source| match source {
            Errno::ESRCH => Error::NoSuchProcess { pid },
            Errno::EPERM => Error::PermissionDenied { pid },
            source => Error::Attach { pid, source },
        })?;

        info!(pid = pid.as_raw(), "attached to tracee");

        self.attach_stop(pid)
    }

    /// Take over a child that the kernel attached to us, as reported by a fork, vfork, or
    /// clone [`PtraceEvent`](crate::PtraceEvent) of a tracee with the matching
    /// `PTRACE_O_TRACE*` option.
    ///
    /// The message of that event is the `pid` of the new child. Returns once its initial
    /// `SIGSTOP` has been observed.
    pub fn adopt(&mut self, pid: Pid) -> Result<Tracee> {
        info!(pid = pid.as_raw(), "adopting auto-attached tracee");

        self.attach_stop(pid)
    }

    // Wait for the `SIGSTOP` that starts a tracee we did not spawn.
    fn attach_stop(&mut self, pid: Pid) -> Result<Tracee> {
        loop {
            let status = waitpid(pid)?;

            match event::decide(status) {
                Event::SignalDelivered { signal: libc::SIGSTOP } => break,
                Event::SignalDelivered { signal } => {
                    trace!(pid = pid.as_raw(), signal, "delivering signal before attach-stop");
                    restart(pid, Restart::Continue, Some(signal)).died_if_esrch(pid)?;
                },
                Event::Exited { .. } | Event::Killed { .. } => {
                    return Err(Error::NoSuchProcess { pid });
                },
                _ => {
                    restart(pid, Restart::Continue, None).died_if_esrch(pid)?;
                },
            }
        }

        self.setup(pid)
    }

    fn setup(&mut self, pid: Pid) -> Result<Tracee> {
        ptrace::setoptions(pid, self.options).died_if_esrch(pid)?;

        let bitness = Bitness::detect(pid)?;
        debug!(pid = pid.as_raw(), %bitness, "detected tracee bitness");

        Ok(Tracee::new(pid, bitness))
    }

    /// Resume the stopped tracee until its next syscall-stop or signal, delivering `signal`.
    pub fn resume(&mut self, tracee: &mut Tracee, signal: impl Into<Option<i32>>) -> Result<()> {
        self.restart(tracee, Restart::Syscall, signal)
    }

    /// Resume the stopped tracee with the given restart mode, delivering `signal`.
    pub fn restart(
        &mut self,
        tracee: &mut Tracee,
        mode: Restart,
        signal: impl Into<Option<i32>>,
    ) -> Result<()> {
        let signal = signal.into();

        tracee.ensure_alive()?;
        tracee.ensure_stopped()?;

        trace!(pid = tracee.pid.as_raw(), ?mode, ?signal, "restarting tracee");

        restart(tracee.pid, mode, signal).died_if_esrch(tracee.pid)?;
        tracee.set_state(State::Running);

        Ok(())
    }

    /// Wait for the tracee to stop or terminate, and classify its new state.
    ///
    /// Blocks without a timeout.
    pub fn wait(&mut self, tracee: &mut Tracee) -> Result<Event> {
        tracee.ensure_alive()?;

        // A stopped tracee stays stopped until restarted, so `waitpid()` would never return.
        if tracee.state != State::Running {
            return Err(Error::ProcessNotRunning { pid: tracee.pid });
        }

        let status = waitpid(tracee.pid)?;
        let event = event::decide(status);

        trace!(pid = tracee.pid.as_raw(), status, %event, "tracee changed state");

        match event {
            Event::Exited { .. } | Event::Killed { .. } => {
                info!(pid = tracee.pid.as_raw(), %event, "tracee terminated");
                tracee.set_state(State::Terminated);
            },
            Event::Unknown { .. } => {},
            _ => tracee.set_state(State::Stopped),
        }

        Ok(event)
    }

    /// Send `SIGKILL` to the tracee.
    ///
    /// Best-effort: a tracee that has already exited is not an error. The termination is
    /// observed by a subsequent [`Ptracer::wait()`].
    pub fn kill(&mut self, tracee: &mut Tracee) -> Result<()> {
        if tracee.state == State::Terminated {
            return Ok(());
        }

        info!(pid = tracee.pid.as_raw(), "killing tracee");

        match signal::kill(tracee.pid, Signal::SIGKILL) {
            Ok(()) | Err(Errno::ESRCH) => {},
            Err(err) => return Err(err.into()),
        }

        // `SIGKILL` ends any ptrace-stop.
        tracee.set_state(State::Running);

        Ok(())
    }

    /// Stop tracing the stopped tracee, letting it run on with `signal` delivered.
    pub fn detach(&mut self, tracee: Tracee, signal: impl Into<Option<i32>>) -> Result<()> {
        tracee.ensure_stopped()?;

        let data = signal.into().unwrap_or(0) as libc::c_long;
        let res = unsafe {
            libc::ptrace(
                libc::PTRACE_DETACH,
                tracee.pid.as_raw(),
                std::ptr::null_mut::<libc::c_void>(),
                data,
            )
        };

        Errno::result(res).died_if_esrch(tracee.pid)?;

        info!(pid = tracee.pid.as_raw(), "detached from tracee");

        Ok(())
    }
}

impl Default for Ptracer {
    fn default() -> Self {
        Self::new()
    }
}

// Restart with a raw signal number. The `nix` wrappers take a `Signal`, which cannot represent
// real-time signals.
fn restart(pid: Pid, mode: Restart, signal: Option<i32>) -> nix::Result<()> {
    let request = match mode {
        Restart::Step => libc::PTRACE_SINGLESTEP,
        Restart::Continue => libc::PTRACE_CONT,
        Restart::Syscall => libc::PTRACE_SYSCALL,
    };
    let data = signal.unwrap_or(0) as libc::c_long;

    let res = unsafe {
        libc::ptrace(request, pid.as_raw(), std::ptr::null_mut::<libc::c_void>(), data)
    };

    Errno::result(res).map(drop)
}

// Block until `pid` changes state, returning the raw `wait(2)` status.
fn waitpid(pid: Pid) -> Result<i32> {
    let mut status = 0;

    loop {
        let res = unsafe { libc::waitpid(pid.as_raw(), &mut status, libc::__WALL) };

        match Errno::result(res) {
            Ok(_) => return Ok(status),
            Err(Errno::EINTR) => continue,
            Err(Errno::ECHILD) => return Err(Error::NoSuchProcess { pid }),
            Err(err) => return Err(err.into()),
        }
    }
}

//! The syscall-stop state machine that drives a single tracee.
//!
//! A [`Session`] turns raw trace events into syscall entries and exits, follows the tracee
//! through `execve()`, and stashes genuine signals for delivery on the next resume.

use std::fmt;

use tracing::{debug, info};

use crate::bitness::Bitness;
use crate::cmd::{Command, Fork, SPAWN_FAILED_EXIT_CODE};
use crate::error::Result;
use crate::event::{Event, PtraceEvent};
use crate::ptracer::{Pid, Ptracer, Restart, State, Tracee};
use crate::syscall;

/// A stop of the tracee, as reported by [`Session::wait()`].
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Stop {
    SyscallEntry { number: u64 },

    SyscallExit { number: u64, ret: i64 },

    /// A successful `execve()` returned, replacing the program image. Reported instead of its
    /// syscall exit, with the bitness of the replaced image and of the new one.
    Exec { old: Bitness, new: Bitness },

    /// A genuine signal is about to be delivered. It will be delivered on the next resume,
    /// unless suppressed via [`Tracee::suppress()`].
    SignalDelivered { signal: i32 },

    PtraceEvent { event: PtraceEvent, message: u64 },

    Exited { exit_code: i32 },

    Killed { signal: i32, core_dumped: bool },
}

impl Stop {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Stop::Exited { .. } | Stop::Killed { .. })
    }
}

impl fmt::Display for Stop {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Stop::SyscallEntry { number } => write!(f, "syscall {} entry", number),
            Stop::SyscallExit { number, ret } => write!(f, "syscall {} exit = {}", number, ret),
            Stop::Exec { old, new } => write!(f, "exec ({} to {})", old, new),
            Stop::SignalDelivered { signal } => write!(f, "signal {}", signal),
            Stop::PtraceEvent { event, message } => {
                write!(f, "{:?} event, message {}", event, message)
            },
            Stop::Exited { exit_code } => write!(f, "exited with {}", exit_code),
            Stop::Killed { signal, .. } => write!(f, "killed by signal {}", signal),
        }
    }
}

/// Trace session for one process.
///
/// Drive it by alternating [`Session::resume()`] and [`Session::wait()`], or with
/// [`Session::advance()`], inspecting the tracee in between, until a terminal [`Stop`].
#[derive(Debug)]
pub struct Session {
    ptracer: Ptracer,
    tracee: Tracee,

    // Syscall-stops come in entry/exit pairs, with nothing in the stop itself to tell them
    // apart.
    in_syscall: bool,

    // Set on entry to an exec syscall, cleared at its exit.
    exec_pending: bool,

    // Number of successful execs observed.
    execs: usize,

    // Whether the tracee was spawned from a `Command`.
    spawned: bool,

    // Exit code, or 128 + signal, once terminated.
    status: Option<i32>,
}

impl Session {
    fn new(ptracer: Ptracer, tracee: Tracee, spawned: bool) -> Self {
        Self {
            ptracer,
            tracee,
            in_syscall: false,
            exec_pending: false,
            execs: 0,
            spawned,
            status: None,
        }
    }

    /// Spawn `cmd`, stopped before it execs.
    pub fn spawn(mut ptracer: Ptracer, cmd: Command) -> Result<Self> {
        let tracee = ptracer.spawn(cmd)?;

        Ok(Self::new(ptracer, tracee, true))
    }

    /// Fork the calling process, tracing the child.
    ///
    /// # Safety
    ///
    /// See [`Ptracer::fork()`].
    pub unsafe fn fork(mut ptracer: Ptracer) -> Result<Fork<Self>> {
        match ptracer.fork()? {
            Fork::Child => Ok(Fork::Child),
            Fork::Parent(tracee) => Ok(Fork::Parent(Self::new(ptracer, tracee, false))),
        }
    }

    /// Attach to the running process `pid`.
    ///
    /// If the process is blocked inside a syscall, its exit will be reported as an entry.
    pub fn attach(mut ptracer: Ptracer, pid: Pid) -> Result<Self> {
        let tracee = ptracer.attach(pid)?;

        Ok(Self::new(ptracer, tracee, false))
    }

    /// Trace the new child `pid` of another session's tracee, which the kernel attached to us.
    ///
    /// `pid` is the message of the fork, vfork, or clone [`Stop::PtraceEvent`] of the parent.
    /// Pass the `Ptracer` of the parent's session, or one with the same options. Drive the
    /// child from the thread that traces the parent.
    pub fn adopt(mut ptracer: Ptracer, pid: Pid) -> Result<Self> {
        let tracee = ptracer.adopt(pid)?;

        Ok(Self::new(ptracer, tracee, false))
    }

    /// The tracer driving this session.
    pub fn ptracer(&self) -> &Ptracer {
        &self.ptracer
    }

    pub fn tracee(&self) -> &Tracee {
        &self.tracee
    }

    pub fn tracee_mut(&mut self) -> &mut Tracee {
        &mut self.tracee
    }

    pub fn pid(&self) -> Pid {
        self.tracee.pid()
    }

    /// Return `true` if the tracee is between a syscall entry and its exit.
    pub fn in_syscall(&self) -> bool {
        self.in_syscall
    }

    /// Final status of the tracee: its exit code, or 128 plus the terminating signal.
    pub fn status(&self) -> Option<i32> {
        self.status
    }

    pub fn is_terminated(&self) -> bool {
        self.tracee.state() == State::Terminated
    }

    /// Number of successful execs observed so far.
    pub fn execs(&self) -> usize {
        self.execs
    }

    /// Return `true` if a spawned tracee exited with [`SPAWN_FAILED_EXIT_CODE`] before any
    /// exec succeeded.
    pub fn spawn_failed(&self) -> bool {
        self.spawned && self.execs == 0 && self.status == Some(SPAWN_FAILED_EXIT_CODE)
    }

    /// Resume the tracee until its next stop, delivering any pending signal.
    pub fn resume(&mut self) -> Result<()> {
        self.tracee.ensure_alive()?;
        self.tracee.ensure_stopped()?;

        let signal = self.tracee.pending_signal();

        // Keep the signal pending if it could not be delivered.
        self.ptracer.resume(&mut self.tracee, signal)?;
        self.tracee.suppress();

        Ok(())
    }

    /// Wait for the next stop of the resumed tracee.
    pub fn wait(&mut self) -> Result<Stop> {
        loop {
            let event = self.ptracer.wait(&mut self.tracee)?;

            let stop = match event {
                Event::SyscallBoundary if self.in_syscall => self.syscall_exit()?,
                Event::SyscallBoundary => self.syscall_entry()?,
                Event::SignalDelivered { signal } => {
                    debug!(pid = self.pid().as_raw(), signal, "stashing signal");
                    self.tracee.inject(signal);

                    Stop::SignalDelivered { signal }
                },
                Event::PtraceEvent(PtraceEvent::Exec) => {
                    // The exec is reported at the exit of its syscall.
                    debug!(pid = self.pid().as_raw(), "absorbing exec event");
                    self.ptracer.restart(&mut self.tracee, Restart::Syscall, None)?;

                    continue;
                },
                Event::PtraceEvent(event) => {
                    let message = self.tracee.event_message()?;

                    Stop::PtraceEvent { event, message }
                },
                Event::Exited { exit_code } => {
                    self.terminate(exit_code);

                    Stop::Exited { exit_code }
                },
                Event::Killed { signal, core_dumped } => {
                    self.terminate(128 + signal);

                    Stop::Killed { signal, core_dumped }
                },
                Event::Unknown { status } => {
                    internal_error!(format!("unexpected wait status {:#x}", status));
                },
            };

            return Ok(stop);
        }
    }

    /// Resume the tracee, then wait for its next stop.
    pub fn advance(&mut self) -> Result<Stop> {
        self.resume()?;
        self.wait()
    }

    fn syscall_entry(&mut self) -> Result<Stop> {
        self.in_syscall = true;
        self.tracee.set_state(State::SyscallEntry);

        let number = self.tracee.syscall_number()?;
        self.tracee.set_last_syscall(number);

        if let Some(name) = syscall::name(number, self.tracee.bitness()) {
            if syscall::is_exec(name) {
                debug!(pid = self.pid().as_raw(), name, "entering exec");
                self.exec_pending = true;
            }
        }

        Ok(Stop::SyscallEntry { number })
    }

    fn syscall_exit(&mut self) -> Result<Stop> {
        self.in_syscall = false;
        self.tracee.set_state(State::SyscallExit);

        // Zero reads as zero at any width, so success can be checked before the new image's
        // bitness is known.
        let ret = self.tracee.return_value()?;

        if self.exec_pending {
            self.exec_pending = false;

            if ret == 0 {
                let old = self.tracee.bitness();
                let new = self.tracee.detect_bitness()?;

                self.execs += 1;
                info!(pid = self.pid().as_raw(), %old, %new, "tracee execed");

                return Ok(Stop::Exec { old, new });
            }
        }

        let number = self.tracee.syscall_number()?;

        Ok(Stop::SyscallExit { number, ret })
    }

    fn terminate(&mut self, status: i32) {
        self.in_syscall = false;
        self.exec_pending = false;
        self.status = Some(status);
    }

    /// Kill the tracee, and reap it.
    ///
    /// A tracee that has already terminated is not an error.
    pub fn kill(&mut self) -> Result<()> {
        self.ptracer.kill(&mut self.tracee)?;

        while !self.is_terminated() {
            match self.ptracer.wait(&mut self.tracee) {
                Ok(Event::Exited { exit_code }) => self.terminate(exit_code),
                Ok(Event::Killed { signal, .. }) => self.terminate(128 + signal),
                Ok(_) => {
                    // E.g. a `PTRACE_EVENT_EXIT` stop, if requested. Let it die.
                    let restarted = self.ptracer.restart(&mut self.tracee, Restart::Continue, None);

                    if restarted.is_err() {
                        // The kill is still in flight, so there is a termination to reap.
                        self.tracee.set_state(State::Running);
                    }
                },
                Err(err) if err.is_no_such_process() => {
                    self.tracee.set_state(State::Terminated);
                },
                Err(err) => return Err(err),
            }
        }

        Ok(())
    }

    /// Stop tracing, letting the process run on with any pending signal delivered.
    pub fn detach(mut self) -> Result<()> {
        let signal = self.tracee.pending_signal();

        self.ptracer.detach(self.tracee, signal)
    }
}

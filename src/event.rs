//! Classification of raw `wait(2)` statuses into trace events.

use std::fmt;

/// Signal number of a syscall-stop, when `PTRACE_O_TRACESYSGOOD` is in effect.
const SYSCALL_TRAP: i32 = libc::SIGTRAP | 0x80;

/// Kind of a _ptrace-event-stop_, from the high bits of the wait status.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub enum PtraceEvent {
    Fork,
    Vfork,
    Clone,
    Exec,
    VforkDone,
    Exit,
    Seccomp,
    Stop,
}

impl PtraceEvent {
    pub fn from_raw(code: i32) -> Option<Self> {
        let event = match code {
            libc::PTRACE_EVENT_FORK => PtraceEvent::Fork,
            libc::PTRACE_EVENT_VFORK => PtraceEvent::Vfork,
            libc::PTRACE_EVENT_CLONE => PtraceEvent::Clone,
            libc::PTRACE_EVENT_EXEC => PtraceEvent::Exec,
            libc::PTRACE_EVENT_VFORK_DONE => PtraceEvent::VforkDone,
            libc::PTRACE_EVENT_EXIT => PtraceEvent::Exit,
            libc::PTRACE_EVENT_SECCOMP => PtraceEvent::Seccomp,
            libc::PTRACE_EVENT_STOP => PtraceEvent::Stop,
            _ => return None,
        };

        Some(event)
    }
}

/// What a single `wait(2)` status says happened to a tracee.
///
/// Syscall-enter-stops and syscall-exit-stops are indistinguishable here: both are reported as
/// [`Event::SyscallBoundary`], and the caller must track which one it expects next.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Event {
    // syscall-enter-stop or syscall-exit-stop
    SyscallBoundary,

    // signal-delivery-stop, or group-stop
    SignalDelivered { signal: i32 },

    // ptrace-event-stop
    PtraceEvent(PtraceEvent),

    Exited { exit_code: i32 },

    Killed {
        signal: i32,
        core_dumped: bool,
    },

    // Not a stop or termination, e.g. a `WIFCONTINUED` status.
    Unknown { status: i32 },
}

impl Event {
    /// Return `true` if the tracee no longer exists after this event.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Event::Exited { .. } | Event::Killed { .. })
    }
}

impl fmt::Display for Event {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Event::SyscallBoundary => write!(f, "syscall"),
            Event::SignalDelivered { signal } => write!(f, "signal {}", signal),
            Event::PtraceEvent(event) => write!(f, "ptrace event {:?}", event),
            Event::Exited { exit_code } => write!(f, "exited with {}", exit_code),
            Event::Killed { signal, core_dumped: false } => {
                write!(f, "killed by signal {}", signal)
            },
            Event::Killed { signal, core_dumped: true } => {
                write!(f, "killed by signal {} (core dumped)", signal)
            },
            Event::Unknown { status } => write!(f, "unknown status {:#x}", status),
        }
    }
}

/// Classify a raw `wait(2)` status.
///
/// Assumes the tracee has `PTRACE_O_TRACESYSGOOD` set, so that syscall-stops are reported with
/// `SIGTRAP | 0x80`. Any other stop signal, including a plain `SIGTRAP`, is a genuine signal.
pub fn decide(status: i32) -> Event {
    if libc::WIFEXITED(status) {
        let exit_code = libc::WEXITSTATUS(status);

        return Event::Exited { exit_code };
    }

    if libc::WIFSIGNALED(status) {
        let signal = libc::WTERMSIG(status);
        let core_dumped = libc::WCOREDUMP(status);

        return Event::Killed { signal, core_dumped };
    }

    if !libc::WIFSTOPPED(status) {
        return Event::Unknown { status };
    }

    let signal = libc::WSTOPSIG(status);

    // The bit layout of a stopped `status` is:
    //
    //   31             16 15            8 7              0
    //    +---------------+---------------+---------------+
    //    |     event     |    sig_no     |      0x7f     |
    //    +---------------+---------------+---------------+
    //
    // A nonzero `event` marks a ptrace-event-stop.
    let code = ((status as u32) >> 16) as i32;

    if code != 0 {
        return match PtraceEvent::from_raw(code) {
            Some(event) => Event::PtraceEvent(event),
            None => Event::Unknown { status },
        };
    }

    if signal == SYSCALL_TRAP {
        Event::SyscallBoundary
    } else {
        Event::SignalDelivered { signal }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn stopped(signal: i32) -> i32 {
        (signal << 8) | 0x7f
    }

    fn ptrace_event(code: i32) -> i32 {
        (code << 16) | stopped(libc::SIGTRAP)
    }

    #[test]
    fn test_decide_exited() {
        assert_eq!(decide(13 << 8), Event::Exited { exit_code: 13 });
        assert_eq!(decide(0), Event::Exited { exit_code: 0 });
    }

    #[test]
    fn test_decide_killed() {
        assert_eq!(decide(libc::SIGKILL), Event::Killed { signal: 9, core_dumped: false });
        assert_eq!(
            decide(libc::SIGSEGV | 0x80),
            Event::Killed { signal: libc::SIGSEGV, core_dumped: true },
        );
    }

    #[test]
    fn test_decide_syscall_boundary() {
        assert_eq!(decide(stopped(SYSCALL_TRAP)), Event::SyscallBoundary);
    }

    #[test]
    fn test_decide_genuine_signals() {
        assert_eq!(
            decide(stopped(libc::SIGUSR1)),
            Event::SignalDelivered { signal: libc::SIGUSR1 },
        );

        // Without the 0x80 bit, a trap is a genuine signal.
        assert_eq!(
            decide(stopped(libc::SIGTRAP)),
            Event::SignalDelivered { signal: libc::SIGTRAP },
        );

        // Real-time signals have no `nix::sys::signal::Signal` representation.
        let rt = libc::SIGRTMIN() + 2;
        assert_eq!(decide(stopped(rt)), Event::SignalDelivered { signal: rt });
    }

    #[test]
    fn test_decide_ptrace_events() {
        assert_eq!(
            decide(ptrace_event(libc::PTRACE_EVENT_EXEC)),
            Event::PtraceEvent(PtraceEvent::Exec),
        );
        assert_eq!(
            decide(ptrace_event(libc::PTRACE_EVENT_CLONE)),
            Event::PtraceEvent(PtraceEvent::Clone),
        );
        assert_eq!(
            decide(ptrace_event(libc::PTRACE_EVENT_EXIT)),
            Event::PtraceEvent(PtraceEvent::Exit),
        );

        let bogus = ptrace_event(0x42);
        assert_eq!(decide(bogus), Event::Unknown { status: bogus });
    }

    #[test]
    fn test_decide_continued() {
        assert_eq!(decide(0xffff), Event::Unknown { status: 0xffff });
    }

    #[test]
    fn test_is_terminal() {
        assert!(decide(13 << 8).is_terminal());
        assert!(decide(libc::SIGKILL).is_terminal());
        assert!(!decide(stopped(SYSCALL_TRAP)).is_terminal());
    }
}

#![allow(unused)]

use anyhow::{bail, Result};
use pinch::{Fork, Ptracer, Session, Stop};

/// Most stops a test trace may run for, so a confused session fails instead of spinning.
const MAX_STOPS: usize = 100_000;

/// Assert that a stop matches a pattern, with a readable failure.
macro_rules! assert_stop {
    ($stop: expr, $pat: pat) => {{
        let stop = $stop;

        if !matches!(stop, $pat) {
            panic!("expected `{}`, got `{:?}`", stringify!($pat), stop);
        }
    }};
}

/// Fork a traced child that runs `child` and then exits with 0.
///
/// `child` runs in the forked copy of a multithreaded test process, so it may only make
/// async-signal-safe calls. It should `_exit()` itself if it needs another exit code.
pub fn fork_session(child: impl FnOnce()) -> Result<Session> {
    fork_session_with(Ptracer::new(), child)
}

/// Like [`fork_session()`], tracing the child with `ptracer`.
pub fn fork_session_with(ptracer: Ptracer, child: impl FnOnce()) -> Result<Session> {
    match unsafe { Session::fork(ptracer)? } {
        Fork::Child => {
            child();

            unsafe { libc::_exit(0) }
        },
        Fork::Parent(session) => Ok(session),
    }
}

/// Advance the session until it terminates, returning every stop seen.
pub fn trace(session: &mut Session) -> Result<Vec<Stop>> {
    let mut stops = vec![];

    for _ in 0..MAX_STOPS {
        let stop = session.advance()?;
        stops.push(stop);

        if stop.is_terminal() {
            return Ok(stops);
        }
    }

    bail!("tracee did not terminate after {} stops", MAX_STOPS)
}

/// Advance the session to the next entry to syscall `number`.
pub fn until_entry(session: &mut Session, number: libc::c_long) -> Result<()> {
    for _ in 0..MAX_STOPS {
        match session.advance()? {
            Stop::SyscallEntry { number: n } if n == number as u64 => return Ok(()),
            stop if stop.is_terminal() => bail!("tracee terminated first: {:?}", stop),
            _ => {},
        }
    }

    bail!("no entry to syscall {} after {} stops", number, MAX_STOPS)
}

/// Advance the session to the next entry to the syscall named `name`.
pub fn until_named_entry(session: &mut Session, name: &str) -> Result<u64> {
    for _ in 0..MAX_STOPS {
        match session.advance()? {
            Stop::SyscallEntry { number } => {
                let bitness = session.tracee().bitness();

                if pinch::syscall::name(number, bitness) == Some(name) {
                    return Ok(number);
                }
            },
            stop if stop.is_terminal() => bail!("tracee terminated first: {:?}", stop),
            _ => {},
        }
    }

    bail!("no entry to {} after {} stops", name, MAX_STOPS)
}

/// Finish tracing, expecting a clean exit.
pub fn finish(session: &mut Session) -> Result<i32> {
    trace(session)?;

    match session.status() {
        Some(status) => Ok(status),
        None => bail!("terminated session has no status"),
    }
}

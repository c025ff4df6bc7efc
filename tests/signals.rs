use anyhow::Result;
use ntest::timeout;
use pinch::{Error, Stop};
use pretty_assertions::assert_eq;

#[macro_use]
mod support;

extern "C" fn exit_13(_signal: libc::c_int) {
    unsafe { libc::_exit(13) }
}

// Raise SIGUSR1 with a handler that exits 13. If the signal is lost, exit 1.
fn raise_usr1() {
    unsafe {
        libc::signal(libc::SIGUSR1, exit_13 as libc::sighandler_t);
        libc::kill(libc::getpid(), libc::SIGUSR1);
        libc::_exit(1);
    }
}

#[test]
#[timeout(5000)]
fn test_signal_is_forwarded() -> Result<()> {
    let mut session = support::fork_session(raise_usr1)?;

    let stops = support::trace(&mut session)?;

    assert!(stops.contains(&Stop::SignalDelivered { signal: libc::SIGUSR1 }));
    assert_eq!(stops.last(), Some(&Stop::Exited { exit_code: 13 }));

    Ok(())
}

#[test]
#[timeout(5000)]
fn test_signal_is_stashed() -> Result<()> {
    let mut session = support::fork_session(raise_usr1)?;

    loop {
        let stop = session.advance()?;

        if let Stop::SignalDelivered { signal } = stop {
            assert_eq!(signal, libc::SIGUSR1);
            assert_eq!(session.tracee().pending_signal(), Some(libc::SIGUSR1));
            break;
        }

        assert!(!stop.is_terminal(), "{:?}", stop);
    }

    assert_eq!(support::finish(&mut session)?, 13);

    Ok(())
}

#[test]
#[timeout(5000)]
fn test_signal_can_be_suppressed() -> Result<()> {
    let mut session = support::fork_session(raise_usr1)?;

    loop {
        if let Stop::SignalDelivered { .. } = session.advance()? {
            session.tracee_mut().suppress();
            break;
        }
    }

    assert_eq!(support::finish(&mut session)?, 1);

    Ok(())
}

#[test]
#[timeout(5000)]
fn test_real_time_signal_is_forwarded() -> Result<()> {
    let rt = libc::SIGRTMIN() + 1;

    let mut session = support::fork_session(move || unsafe {
        libc::signal(rt, exit_13 as libc::sighandler_t);
        libc::kill(libc::getpid(), rt);
        libc::_exit(1);
    })?;

    let stops = support::trace(&mut session)?;

    assert!(stops.contains(&Stop::SignalDelivered { signal: rt }));
    assert_eq!(session.status(), Some(13));

    Ok(())
}

#[test]
#[timeout(5000)]
fn test_signal_stays_pending_if_resume_fails() -> Result<()> {
    let mut session = support::fork_session(raise_usr1)?;

    loop {
        let stop = session.advance()?;

        if let Stop::SignalDelivered { .. } = stop {
            break;
        }

        assert!(!stop.is_terminal(), "{:?}", stop);
    }

    // Kill it behind the session's back, so the restart fails.
    unsafe { libc::kill(session.pid().as_raw(), libc::SIGKILL) };

    assert_stop!(session.resume(), Err(Error::NoSuchProcess { .. }));
    assert_eq!(session.tracee().pending_signal(), Some(libc::SIGUSR1));

    session.kill()?;
    assert_eq!(session.status(), Some(128 + libc::SIGKILL));

    Ok(())
}

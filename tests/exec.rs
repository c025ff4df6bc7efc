use anyhow::Result;
use ntest::timeout;
use pinch::{syscall, Bitness, Command, Ptracer, Session, Stop, SPAWN_FAILED_EXIT_CODE};
use pretty_assertions::assert_eq;

#[macro_use]
mod support;

#[test]
#[timeout(5000)]
fn test_decode_exec_argv() -> Result<()> {
    let cmd = Command::new(vec!["true", "a", "b"])?;
    let path = cmd.path().to_owned();
    let mut session = Session::spawn(Ptracer::new(), cmd)?;

    support::until_named_entry(&mut session, "execve")?;

    let tracee = session.tracee();

    assert_eq!(tracee.decode_string(0, None)?, path.to_string_lossy());
    assert_eq!(tracee.decode_string(0, Some(1))?, "/");

    let argv = tracee.argument(1)?;

    assert_eq!(tracee.decode_string_array_element(argv, 0)?.as_deref(), Some("true"));
    assert_eq!(tracee.decode_string_array_element(argv, 1)?.as_deref(), Some("a"));
    assert_eq!(tracee.decode_string_array_element(argv, 2)?.as_deref(), Some("b"));
    assert_eq!(tracee.decode_string_array_element(argv, 3)?, None);

    // Each element is an independent read, so traversal can restart.
    assert_eq!(tracee.decode_string_array_element(argv, 1)?.as_deref(), Some("a"));
    assert_eq!(tracee.decode_string_array_element(argv, 0)?.as_deref(), Some("true"));

    assert_eq!(support::finish(&mut session)?, 0);

    Ok(())
}

#[test]
#[timeout(5000)]
fn test_exec_is_reported_once() -> Result<()> {
    let cmd = Command::new(vec!["true"])?;
    let mut session = Session::spawn(Ptracer::new(), cmd)?;

    let execve = support::until_named_entry(&mut session, "execve")?;
    assert_eq!(session.tracee().last_syscall(), Some(execve));
    assert_eq!(session.tracee().bitness_detections(), 0);

    let stop = session.advance()?;
    let native = Bitness::native();
    assert_eq!(stop, Stop::Exec { old: native, new: native });
    assert_eq!(session.tracee().bitness(), native);
    assert_eq!(session.tracee().bitness_detections(), 1);
    assert!(!session.in_syscall());

    let stops = support::trace(&mut session)?;

    let execs = stops.iter().filter(|stop| matches!(stop, Stop::Exec { .. })).count();
    assert_eq!(execs, 0);

    // No exit of the exec syscall leaks out, before or after the image change.
    let exec_exits = stops
        .iter()
        .filter(|stop| matches!(stop, Stop::SyscallExit { number, .. } if *number == execve))
        .count();
    assert_eq!(exec_exits, 0);

    assert_eq!(stops.last(), Some(&Stop::Exited { exit_code: 0 }));
    assert_eq!(session.execs(), 1);

    // Nothing after the exec re-detects.
    assert_eq!(session.tracee().bitness_detections(), 1);

    Ok(())
}

#[test]
#[timeout(5000)]
fn test_failed_exec_is_a_syscall_exit() -> Result<()> {
    let cmd = Command::new(vec!["/nonexistent/pinch-test-program"])?;
    let mut session = Session::spawn(Ptracer::new(), cmd)?;

    support::until_named_entry(&mut session, "execve")?;

    match session.advance()? {
        Stop::SyscallExit { ret, .. } => {
            assert_eq!(syscall::errno(ret), Some(nix::errno::Errno::ENOENT));
        },
        stop => panic!("expected syscall exit, got {:?}", stop),
    }

    let status = support::finish(&mut session)?;

    assert_eq!(status, SPAWN_FAILED_EXIT_CODE);
    assert_eq!(session.execs(), 0);
    assert_eq!(session.tracee().bitness_detections(), 0);
    assert!(session.spawn_failed());

    Ok(())
}

#[test]
#[timeout(5000)]
fn test_forked_exit_127_is_not_spawn_failure() -> Result<()> {
    let mut session = support::fork_session(|| unsafe { libc::_exit(SPAWN_FAILED_EXIT_CODE) })?;

    assert_eq!(support::finish(&mut session)?, 127);
    assert!(!session.spawn_failed());

    Ok(())
}

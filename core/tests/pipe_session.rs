mod common;

use std::time::Duration;
use std::time::Instant;

use assert_matches::assert_matches;
use common::events_so_far;
use common::events_until_exit;
use common::output_text;
use common::pipe_session;
use common::pipe_session_with;
use execbridge_core::CommandSpec;
use execbridge_core::ControlError;
use execbridge_core::ExecConfig;
use execbridge_core::ExecEvent;
use execbridge_core::ExecSession;
use execbridge_core::ExitStatus;
use execbridge_core::OutputEvent;
use execbridge_core::OutputStream;
use execbridge_core::SessionState;
use execbridge_core::SpawnError;
use execbridge_core::StartError;
use pretty_assertions::assert_eq;

fn stdout_line(text: &str) -> ExecEvent {
    ExecEvent::Output(OutputEvent::new(OutputStream::Stdout, text.as_bytes().to_vec()))
}

#[test]
fn round_trip_delivers_events_in_order() {
    let (session, rx) = pipe_session();
    session
        .start(CommandSpec::shell("printf 'a\\nb\\n'").with_tag("rt"))
        .expect("start");

    assert_eq!(
        events_until_exit(&rx),
        vec![
            ExecEvent::Started {
                tag: "rt".to_string()
            },
            stdout_line("a\n"),
            stdout_line("b\n"),
            ExecEvent::Exited {
                tag: "rt".to_string(),
                status: ExitStatus::Exited(0),
            },
        ]
    );
    assert!(session.is_done());
}

#[test]
fn every_stdout_line_becomes_one_event() {
    let (session, rx) = pipe_session();
    session
        .start(CommandSpec::shell(
            "i=0; while [ $i -lt 250 ]; do echo line$i; i=$((i+1)); done",
        ))
        .expect("start");

    let events = events_until_exit(&rx);
    let lines: Vec<&ExecEvent> = events
        .iter()
        .filter(|event| matches!(event, ExecEvent::Output(_)))
        .collect();
    assert_eq!(lines.len(), 250);
    let expected: String = (0..250).map(|i| format!("line{i}\n")).collect();
    assert_eq!(output_text(&events, OutputStream::Stdout), expected);
    assert_matches!(
        events.last(),
        Some(ExecEvent::Exited {
            status: ExitStatus::Exited(0),
            ..
        })
    );
}

#[test]
fn stderr_is_reported_on_its_own_stream() {
    let (session, rx) = pipe_session();
    session
        .start(CommandSpec::shell("echo out; echo err >&2; exit 4"))
        .expect("start");

    let events = events_until_exit(&rx);
    assert_eq!(output_text(&events, OutputStream::Stdout), "out\n");
    assert_eq!(output_text(&events, OutputStream::Stderr), "err\n");
    assert_matches!(
        events.last(),
        Some(ExecEvent::Exited {
            status: ExitStatus::Exited(4),
            ..
        })
    );
}

#[test]
fn trailing_partial_line_is_flushed_at_exit() {
    let (session, rx) = pipe_session();
    session
        .start(CommandSpec::shell("printf 'no newline'"))
        .expect("start");
    let events = events_until_exit(&rx);
    assert_eq!(output_text(&events, OutputStream::Stdout), "no newline");
}

#[test]
fn spawn_failure_is_synchronous_and_silent() {
    let (session, rx) = pipe_session();
    let err = session
        .start(CommandSpec::shell_with("/nonexistent/sh", "true"))
        .expect_err("interpreter is missing");
    assert_matches!(err, StartError::Spawn(SpawnError::Exec { .. }));
    assert_eq!(session.state(), SessionState::Terminated);

    std::thread::sleep(Duration::from_millis(100));
    assert_eq!(events_so_far(&rx), Vec::<ExecEvent>::new());
}

#[test]
fn second_start_is_rejected() {
    let (session, rx) = pipe_session();
    session.start(CommandSpec::shell("true")).expect("first start");
    assert_matches!(
        session.start(CommandSpec::shell("echo again")),
        Err(StartError::AlreadyStarted)
    );

    let events = events_until_exit(&rx);
    assert_eq!(output_text(&events, OutputStream::Stdout), "");
    std::thread::sleep(Duration::from_millis(50));
    assert_eq!(events_so_far(&rx), Vec::<ExecEvent>::new());
}

#[test]
fn interactive_spec_is_rejected() {
    let (session, _rx) = pipe_session();
    assert_matches!(
        session.start(CommandSpec::interactive(["/bin/sh"])),
        Err(StartError::WrongMode)
    );
    assert_eq!(session.state(), SessionState::Idle);
}

#[test]
fn interrupt_stops_a_busy_loop() {
    let (session, rx) = pipe_session();
    session
        .start(CommandSpec::shell("while :; do :; done"))
        .expect("start");
    std::thread::sleep(Duration::from_millis(100));

    let started = Instant::now();
    session.interrupt().expect("interrupt");
    assert!(started.elapsed() < ExecConfig::default().interrupt_timeout());
    assert!(session.is_done());

    let events = events_until_exit(&rx);
    assert_matches!(
        events.last(),
        Some(ExecEvent::Exited {
            status: ExitStatus::Signaled(libc::SIGTERM),
            ..
        })
    );
}

#[test]
fn interrupt_that_times_out_still_tears_down() {
    let config = ExecConfig {
        interrupt_timeout_ms: 200,
        ..ExecConfig::default()
    };
    let (session, rx) = pipe_session_with(config);
    session
        .start(CommandSpec::shell("trap '' TERM; while :; do :; done"))
        .expect("start");
    std::thread::sleep(Duration::from_millis(100));

    assert_matches!(session.interrupt(), Err(ControlError::Timeout { .. }));
    assert!(session.is_done());
    assert_matches!(
        events_until_exit(&rx).last(),
        Some(ExecEvent::Exited {
            status: ExitStatus::Unknown,
            ..
        })
    );

    // Clean up the orphan the timeout left behind.
    if let Some(pid) = session.pid()
        && pid > 0
    {
        // SAFETY: plain kill(2) on our own child group.
        unsafe { libc::kill(-pid, libc::SIGKILL) };
    }
}

#[test]
fn suspend_pauses_output_without_changing_state() {
    let (session, rx) = pipe_session();
    session
        .start(CommandSpec::shell(
            "i=0; while :; do echo $i; i=$((i+1)); sleep 0.01; done",
        ))
        .expect("start");
    std::thread::sleep(Duration::from_millis(150));

    session.suspend().expect("suspend");
    assert_eq!(session.state(), SessionState::Running);
    std::thread::sleep(Duration::from_millis(100));
    events_so_far(&rx);
    std::thread::sleep(Duration::from_millis(250));
    assert_eq!(events_so_far(&rx), Vec::<ExecEvent>::new());

    session.resume().expect("resume");
    assert_eq!(session.state(), SessionState::Running);
    common::wait_for_output(&rx, "\n");

    session.interrupt().expect("interrupt");
}

#[test]
fn interrupt_reaches_a_suspended_child() {
    let config = ExecConfig {
        interrupt_timeout_ms: 2_000,
        ..ExecConfig::default()
    };
    let (session, rx) = pipe_session_with(config);
    session.start(CommandSpec::shell("sleep 30")).expect("start");
    std::thread::sleep(Duration::from_millis(50));
    session.suspend().expect("suspend");

    session.interrupt().expect("interrupt");
    assert!(session.is_done());
    assert_matches!(
        events_until_exit(&rx).last(),
        Some(ExecEvent::Exited {
            status: ExitStatus::Signaled(libc::SIGTERM),
            ..
        })
    );
}

#[test]
fn batch_children_run_at_the_configured_niceness() {
    // SAFETY: getpriority(2) has no memory safety requirements.
    let inherited = unsafe { libc::getpriority(libc::PRIO_PROCESS, 0) };
    let config = ExecConfig {
        batch_nice: 7,
        ..ExecConfig::default()
    };
    let (session, rx) = pipe_session_with(config);
    session.start(CommandSpec::shell("nice")).expect("start");
    let events = events_until_exit(&rx);
    assert_eq!(
        output_text(&events, OutputStream::Stdout),
        format!("{}\n", inherited.max(7))
    );
}

#[test]
fn input_reaches_the_child_and_close_sends_eof() {
    let (session, rx) = pipe_session();
    session.start(CommandSpec::shell("cat")).expect("start");
    session.push_input(b"hello\n").expect("write");
    session.close_input();

    let events = events_until_exit(&rx);
    assert_eq!(output_text(&events, OutputStream::Stdout), "hello\n");
    assert_matches!(
        events.last(),
        Some(ExecEvent::Exited {
            status: ExitStatus::Exited(0),
            ..
        })
    );
    session
        .push_input(b"too late\n")
        .expect("dropped silently after exit");
}

#[test]
fn working_directory_is_applied() {
    let dir = tempfile::tempdir().expect("tempdir");
    let expected = dir.path().canonicalize().expect("canonical path");
    let (session, rx) = pipe_session();
    session
        .start(CommandSpec::shell("pwd -P").with_cwd(dir.path()))
        .expect("start");
    let events = events_until_exit(&rx);
    assert_eq!(
        output_text(&events, OutputStream::Stdout),
        format!("{}\n", expected.display())
    );
}

#[test]
fn dropping_a_running_session_terminates_the_child() {
    let (session, _rx) = pipe_session();
    session.start(CommandSpec::shell("sleep 30")).expect("start");
    let pid = session.pid().expect("pid");
    drop(session);

    // SAFETY: signal 0 only probes for existence.
    let alive = unsafe { libc::kill(pid, 0) } == 0;
    assert!(!alive, "child {pid} survived its session");
}

#[test]
fn sessions_work_through_the_trait_object() {
    let (session, rx) = pipe_session();
    let session: Box<dyn ExecSession> = Box::new(session);
    session.start(CommandSpec::shell("echo via trait")).expect("start");
    let events = events_until_exit(&rx);
    assert_eq!(output_text(&events, OutputStream::Stdout), "via trait\n");
    assert!(session.is_done());
}

#[test]
fn concurrent_sessions_keep_their_own_output() {
    let handles: Vec<_> = (0..8)
        .map(|n| {
            std::thread::spawn(move || {
                let (session, rx) = pipe_session();
                session
                    .start(CommandSpec::shell(format!("echo session{n}")))
                    .expect("start");
                output_text(&events_until_exit(&rx), OutputStream::Stdout)
            })
        })
        .collect();
    for (n, handle) in handles.into_iter().enumerate() {
        assert_eq!(handle.join().expect("thread"), format!("session{n}\n"));
    }
}

//! Sessions running side by side must not leak descriptors into each
//! other's children.
#![cfg(target_os = "linux")]

mod common;

use std::sync::Arc;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::Ordering;

use common::events_until_exit;
use common::output_text;
use common::pipe_session;
use common::pty_session_with;
use execbridge_core::CommandSpec;
use execbridge_core::ExecConfig;
use execbridge_core::OutputStream;
use pretty_assertions::assert_eq;

#[test]
fn pipe_children_never_inherit_a_pty_master() {
    let stop = Arc::new(AtomicBool::new(false));
    let churners: Vec<_> = (0..4)
        .map(|_| {
            let stop = Arc::clone(&stop);
            std::thread::spawn(move || {
                while !stop.load(Ordering::SeqCst) {
                    let (session, rx) = pty_session_with(ExecConfig::default());
                    if session.run(["true"]).is_ok() {
                        events_until_exit(&rx);
                    }
                }
            })
        })
        .collect();

    let mut leaks = Vec::new();
    for _ in 0..200 {
        let (session, rx) = pipe_session();
        session
            .start(CommandSpec::shell("ls -l /proc/$$/fd"))
            .expect("start");
        let listing = output_text(&events_until_exit(&rx), OutputStream::Stdout);
        leaks.extend(
            listing
                .lines()
                .filter(|line| line.contains("ptmx"))
                .map(str::to_string),
        );
    }

    stop.store(true, Ordering::SeqCst);
    for churner in churners {
        churner.join().expect("pty churner");
    }
    assert_eq!(leaks, Vec::<String>::new());
}

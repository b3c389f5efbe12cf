#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;
use std::time::Instant;

use async_channel::Receiver;
use execbridge_core::ChannelSink;
use execbridge_core::ExecConfig;
use execbridge_core::ExecEvent;
use execbridge_core::OutputStream;
use execbridge_core::PipeExecutionSession;
use execbridge_core::PtyExecutionSession;

pub const EVENT_DEADLINE: Duration = Duration::from_secs(10);

pub fn pipe_session() -> (PipeExecutionSession, Receiver<ExecEvent>) {
    pipe_session_with(ExecConfig::default())
}

pub fn pipe_session_with(config: ExecConfig) -> (PipeExecutionSession, Receiver<ExecEvent>) {
    let (sink, rx) = ChannelSink::unbounded();
    (PipeExecutionSession::new(config, Arc::new(sink)), rx)
}

pub fn pty_session_with(config: ExecConfig) -> (PtyExecutionSession, Receiver<ExecEvent>) {
    let (sink, rx) = ChannelSink::unbounded();
    (PtyExecutionSession::new(config, Arc::new(sink)), rx)
}

/// Collects events up to and including the exit event.
pub fn events_until_exit(rx: &Receiver<ExecEvent>) -> Vec<ExecEvent> {
    let deadline = Instant::now() + EVENT_DEADLINE;
    let mut events = Vec::new();
    while Instant::now() < deadline {
        match rx.try_recv() {
            Ok(event) => {
                let exited = matches!(event, ExecEvent::Exited { .. });
                events.push(event);
                if exited {
                    return events;
                }
            }
            Err(_) => std::thread::sleep(Duration::from_millis(5)),
        }
    }
    panic!("no exit event within {EVENT_DEADLINE:?}; got {events:?}");
}

/// Drains whatever has arrived so far without waiting.
pub fn events_so_far(rx: &Receiver<ExecEvent>) -> Vec<ExecEvent> {
    std::iter::from_fn(|| rx.try_recv().ok()).collect()
}

/// Waits until the concatenated output contains `needle`.
pub fn wait_for_output(rx: &Receiver<ExecEvent>, needle: &str) -> String {
    let deadline = Instant::now() + EVENT_DEADLINE;
    let mut seen = String::new();
    while Instant::now() < deadline {
        match rx.try_recv() {
            Ok(ExecEvent::Output(output)) => {
                seen.push_str(&output.text());
                if seen.contains(needle) {
                    return seen;
                }
            }
            Ok(_) => {}
            Err(_) => std::thread::sleep(Duration::from_millis(5)),
        }
    }
    panic!("output never contained {needle:?}; got {seen:?}");
}

pub fn output_text(events: &[ExecEvent], stream: OutputStream) -> String {
    events
        .iter()
        .filter_map(|event| match event {
            ExecEvent::Output(output) if output.stream == stream => Some(output.text()),
            _ => None,
        })
        .collect()
}

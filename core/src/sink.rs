//! The narrow interface sessions push their events into.

use std::sync::Arc;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::Ordering;

use async_channel::Receiver;
use async_channel::Sender;
use tracing::debug;

use crate::protocol::ExecEvent;
use crate::protocol::ExitStatus;
use crate::protocol::OutputEvent;

/// Receives a session's events on the session's worker thread.
///
/// Implementations hand events off to their own thread if they need to; the
/// worker does not buffer on their behalf.
pub trait ExecutionSink: Send + Sync {
    fn on_started(&self, _tag: &str) {}

    fn on_output(&self, event: OutputEvent);

    fn on_exited(&self, tag: &str, status: ExitStatus);
}

impl<T: ExecutionSink + ?Sized> ExecutionSink for Arc<T> {
    fn on_started(&self, tag: &str) {
        (**self).on_started(tag);
    }

    fn on_output(&self, event: OutputEvent) {
        (**self).on_output(event);
    }

    fn on_exited(&self, tag: &str, status: ExitStatus) {
        (**self).on_exited(tag, status);
    }
}

/// Forwards events into an `async_channel`, for consumers that `recv().await`.
#[derive(Debug, Clone)]
pub struct ChannelSink {
    tx: Sender<ExecEvent>,
}

impl ChannelSink {
    pub fn new(tx: Sender<ExecEvent>) -> Self {
        Self { tx }
    }

    pub fn unbounded() -> (Self, Receiver<ExecEvent>) {
        let (tx, rx) = async_channel::unbounded();
        (Self::new(tx), rx)
    }

    /// Bounded channel; the worker blocks when the consumer falls behind.
    pub fn bounded(capacity: usize) -> (Self, Receiver<ExecEvent>) {
        let (tx, rx) = async_channel::bounded(capacity.max(1));
        (Self::new(tx), rx)
    }

    fn send(&self, event: ExecEvent) {
        if self.tx.send_blocking(event).is_err() {
            debug!("event receiver dropped; discarding event");
        }
    }
}

impl ExecutionSink for ChannelSink {
    fn on_started(&self, tag: &str) {
        self.send(ExecEvent::Started {
            tag: tag.to_string(),
        });
    }

    fn on_output(&self, event: OutputEvent) {
        self.send(ExecEvent::Output(event));
    }

    fn on_exited(&self, tag: &str, status: ExitStatus) {
        self.send(ExecEvent::Exited {
            tag: tag.to_string(),
            status,
        });
    }
}

/// Adapts a closure taking [`ExecEvent`]s.
pub struct FnSink<F>(F);

impl<F> FnSink<F>
where
    F: Fn(ExecEvent) + Send + Sync,
{
    pub fn new(f: F) -> Self {
        Self(f)
    }
}

impl<F> ExecutionSink for FnSink<F>
where
    F: Fn(ExecEvent) + Send + Sync,
{
    fn on_started(&self, tag: &str) {
        (self.0)(ExecEvent::Started {
            tag: tag.to_string(),
        });
    }

    fn on_output(&self, event: OutputEvent) {
        (self.0)(ExecEvent::Output(event));
    }

    fn on_exited(&self, tag: &str, status: ExitStatus) {
        (self.0)(ExecEvent::Exited {
            tag: tag.to_string(),
            status,
        });
    }
}

/// Wraps a session's sink so nothing is delivered after the exit event.
#[derive(Clone)]
pub(crate) struct EventGate {
    sink: Arc<dyn ExecutionSink>,
    tag: Arc<str>,
    closed: Arc<AtomicBool>,
}

impl EventGate {
    pub(crate) fn new(sink: Arc<dyn ExecutionSink>, tag: &str) -> Self {
        Self {
            sink,
            tag: Arc::from(tag),
            closed: Arc::new(AtomicBool::new(false)),
        }
    }

    pub(crate) fn started(&self) {
        if !self.is_closed() {
            self.sink.on_started(&self.tag);
        }
    }

    pub(crate) fn output(&self, event: OutputEvent) {
        if !self.is_closed() {
            self.sink.on_output(event);
        }
    }

    /// Delivers the exit event once; later calls are ignored.
    pub(crate) fn exited(&self, status: ExitStatus) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.sink.on_exited(&self.tag, status);
    }

    pub(crate) fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

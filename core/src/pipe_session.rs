//! Batch execution: a shell command line with its streams on three pipes.

use std::os::fd::AsFd;
use std::os::fd::BorrowedFd;
use std::os::fd::OwnedFd;
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::Ordering;
use std::time::Duration;

use tracing::debug;
use tracing::warn;

use crate::config::ExecConfig;
use crate::error::ControlError;
use crate::error::SpawnError;
use crate::error::StartError;
use crate::fd;
use crate::process::ChildProcess;
use crate::process::Signal;
use crate::protocol::CommandSpec;
use crate::protocol::ExecMode;
use crate::protocol::ExitStatus;
use crate::protocol::OutputEvent;
use crate::protocol::OutputStream;
use crate::session::ExecSession;
use crate::session::SessionState;
use crate::session::StateCell;
use crate::session::Worker;
use crate::session::lock;
use crate::session::would_block;
use crate::signal_pipe::SignalPipe;
use crate::sink::EventGate;
use crate::sink::ExecutionSink;

/// How long a dropped session waits for its terminated child to be reaped.
const DROP_GRACE: Duration = Duration::from_millis(100);

/// Runs one batch command and streams its output, a line per event, into an
/// [`ExecutionSink`].
pub struct PipeExecutionSession {
    config: ExecConfig,
    sink: Arc<dyn ExecutionSink>,
    state: Arc<StateCell>,
    process: Mutex<Option<Arc<ChildProcess>>>,
    stdin: Arc<Mutex<Option<OwnedFd>>>,
    worker: Worker,
}

impl PipeExecutionSession {
    pub fn new(config: ExecConfig, sink: Arc<dyn ExecutionSink>) -> Self {
        Self {
            config,
            sink,
            state: Arc::new(StateCell::new()),
            process: Mutex::new(None),
            stdin: Arc::new(Mutex::new(None)),
            worker: Worker::default(),
        }
    }

    pub fn start(&self, spec: CommandSpec) -> Result<(), StartError> {
        if spec.mode() != ExecMode::Batch {
            return Err(StartError::WrongMode);
        }
        let spec = match spec.nice() {
            Some(_) => spec,
            None => spec.with_nice(self.config.batch_nice),
        };
        if !self
            .state
            .transition(SessionState::Idle, SessionState::Starting)
        {
            return Err(StartError::AlreadyStarted);
        }

        let (process, stdin, stdout, stderr) = match self.launch(&spec) {
            Ok(parts) => parts,
            Err(err) => {
                debug!(tag = spec.tag(), error = %err, "pipe session failed to start");
                self.state
                    .transition(SessionState::Starting, SessionState::Terminated);
                return Err(err.into());
            }
        };

        *lock(&self.process) = Some(Arc::clone(&process));
        *lock(&self.stdin) = Some(stdin);
        self.state
            .transition(SessionState::Starting, SessionState::Running);

        let context = WorkerContext {
            gate: EventGate::new(Arc::clone(&self.sink), spec.tag()),
            streams: [
                StreamReader::new(OutputStream::Stdout, stdout, self.config.max_line_bytes),
                StreamReader::new(OutputStream::Stderr, stderr, self.config.max_line_bytes),
            ],
            process: Arc::clone(&process),
            state: Arc::clone(&self.state),
            stdin: Arc::clone(&self.stdin),
            cancel: self.worker.cancel_flag(),
            poll_interval: self.config.poll_interval(),
            chunk: self.config.read_chunk_bytes(),
        };
        if let Err(err) = self.worker.spawn("execbridge-pipe", move || context.run()) {
            let _ = process.signal_group(Signal::Kill);
            process.wait_timeout(self.config.interrupt_timeout());
            lock(&self.stdin).take();
            self.state.advance(SessionState::Terminated);
            return Err(err);
        }
        debug!(tag = spec.tag(), pid = process.spawned_pid(), "pipe session running");
        Ok(())
    }

    fn launch(
        &self,
        spec: &CommandSpec,
    ) -> Result<(Arc<ChildProcess>, OwnedFd, OwnedFd, OwnedFd), SpawnError> {
        let child = SignalPipe::spawn(spec)?;
        if let (Some(stdout), Some(stderr)) = (child.stdout(), child.stderr()) {
            fd::set_nonblocking(stdout).map_err(SpawnError::Pipe)?;
            fd::set_nonblocking(stderr).map_err(SpawnError::Pipe)?;
            // The child is still stopped, so anything here predates it.
            if self.config.drain_stale_output {
                drain_stale(stdout);
                drain_stale(stderr);
            }
        }
        let mut handle = child.resume()?;
        let process = Arc::clone(handle.process());
        match (handle.take_stdin(), handle.take_stdout(), handle.take_stderr()) {
            (Some(stdin), Some(stdout), Some(stderr)) => Ok((process, stdin, stdout, stderr)),
            _ => Err(SpawnError::Pipe(std::io::Error::other(
                "spawned child is missing a stream",
            ))),
        }
    }

    /// Writes to the child's stdin. Dropped silently unless the session is
    /// running with its input open.
    pub fn push_input(&self, bytes: &[u8]) -> Result<(), ControlError> {
        if self.state.get() != SessionState::Running {
            debug!(len = bytes.len(), "input dropped; session not running");
            return Ok(());
        }
        let guard = lock(&self.stdin);
        let Some(stdin) = guard.as_ref() else {
            debug!(len = bytes.len(), "input dropped; stdin closed");
            return Ok(());
        };
        fd::write_all(stdin.as_fd(), bytes).map_err(ControlError::Write)
    }

    /// Closes the child's stdin so it sees end of input.
    pub fn close_input(&self) {
        if lock(&self.stdin).take().is_some() {
            debug!("stdin closed");
        }
    }

    /// `SIGTERM` to the child's group, then a bounded wait. The session is
    /// torn down even when the wait times out.
    pub fn interrupt(&self) -> Result<(), ControlError> {
        let Some(process) = self.process() else {
            return Err(ControlError::NotRunning);
        };
        let waited = self.config.interrupt_timeout();
        let result = process.terminate_group().and_then(|()| {
            match process.wait_timeout(waited) {
                Some(status) => {
                    debug!(pid = process.spawned_pid(), %status, "interrupted child exited");
                    Ok(())
                }
                None => {
                    warn!(pid = process.spawned_pid(), ?waited, "child ignored interrupt");
                    Err(ControlError::Timeout {
                        pid: process.spawned_pid(),
                        waited,
                    })
                }
            }
        });
        self.teardown();
        result
    }

    pub fn suspend(&self) -> Result<(), ControlError> {
        self.signal_group(Signal::Stop)
    }

    pub fn resume(&self) -> Result<(), ControlError> {
        self.signal_group(Signal::Continue)
    }

    pub fn state(&self) -> SessionState {
        self.state.get()
    }

    pub fn is_done(&self) -> bool {
        self.state.get() == SessionState::Terminated
    }

    /// The child's pid; `None` before start, `Some(-1)` once reaped.
    pub fn pid(&self) -> Option<libc::pid_t> {
        self.process().map(|process| process.pid())
    }

    fn process(&self) -> Option<Arc<ChildProcess>> {
        lock(&self.process).clone()
    }

    fn signal_group(&self, signal: Signal) -> Result<(), ControlError> {
        self.process()
            .ok_or(ControlError::NotRunning)?
            .signal_group(signal)
    }

    fn teardown(&self) {
        self.worker.stop_and_join();
        lock(&self.stdin).take();
    }
}

impl ExecSession for PipeExecutionSession {
    fn start(&self, spec: CommandSpec) -> Result<(), StartError> {
        PipeExecutionSession::start(self, spec)
    }

    fn write(&self, bytes: &[u8]) -> Result<(), ControlError> {
        self.push_input(bytes)
    }

    fn interrupt(&self) -> Result<(), ControlError> {
        PipeExecutionSession::interrupt(self)
    }

    fn suspend(&self) -> Result<(), ControlError> {
        PipeExecutionSession::suspend(self)
    }

    fn resume(&self) -> Result<(), ControlError> {
        PipeExecutionSession::resume(self)
    }

    fn state(&self) -> SessionState {
        self.state.get()
    }
}

impl Drop for PipeExecutionSession {
    fn drop(&mut self) {
        if let Some(process) = self.process()
            && process.is_alive()
        {
            let _ = process.terminate_group();
            process.wait_timeout(DROP_GRACE);
        }
        self.teardown();
    }
}

/// Discards whatever is already buffered on a non-blocking pipe.
fn drain_stale(fd: BorrowedFd<'_>) {
    let mut buf = [0u8; 512];
    let mut discarded = 0usize;
    while let Ok(n) = fd::read(fd, &mut buf) {
        if n == 0 {
            break;
        }
        discarded += n;
    }
    if discarded > 0 {
        debug!(discarded, "discarded stale pipe bytes");
    }
}

struct WorkerContext {
    gate: EventGate,
    streams: [StreamReader; 2],
    process: Arc<ChildProcess>,
    state: Arc<StateCell>,
    stdin: Arc<Mutex<Option<OwnedFd>>>,
    cancel: Arc<AtomicBool>,
    poll_interval: Duration,
    chunk: usize,
}

impl WorkerContext {
    fn run(mut self) {
        self.gate.started();
        let mut buf = vec![0u8; self.chunk];

        while !self.cancel.load(Ordering::SeqCst) {
            if self.streams.iter().all(|s| s.eof) {
                if !self.process.is_alive() {
                    break;
                }
                std::thread::sleep(self.poll_interval);
                continue;
            }

            let polled = {
                let open: Vec<BorrowedFd<'_>> = self
                    .streams
                    .iter()
                    .filter(|s| !s.eof)
                    .map(|s| s.fd.as_fd())
                    .collect();
                fd::poll_readable(&open, self.poll_interval)
            };
            if let Err(err) = polled {
                warn!(error = %err, "poll failed; abandoning output");
                break;
            }
            for stream in self.streams.iter_mut().filter(|s| !s.eof) {
                stream.pump(&mut buf, &self.gate);
            }
        }

        self.state.advance(SessionState::Draining);
        let cancelled = self.cancel.load(Ordering::SeqCst);
        let status = self.process.try_wait().unwrap_or_else(|| {
            if !cancelled {
                warn!(pid = self.process.spawned_pid(), "output loop ended with child alive");
            }
            ExitStatus::Unknown
        });
        lock(&self.stdin).take();
        let Self { streams, gate, .. } = self;
        drop(streams);
        self.state.advance(SessionState::Terminated);
        debug!(pid = self.process.spawned_pid(), %status, "pipe session terminated");
        gate.exited(status);
    }
}

struct StreamReader {
    fd: OwnedFd,
    lines: LineBuffer,
    eof: bool,
}

impl StreamReader {
    fn new(stream: OutputStream, fd: OwnedFd, max_line_bytes: usize) -> Self {
        Self {
            fd,
            lines: LineBuffer::new(stream, max_line_bytes),
            eof: false,
        }
    }

    /// Reads until the pipe would block or reaches EOF.
    fn pump(&mut self, buf: &mut [u8], gate: &EventGate) {
        let mut emit = |event: OutputEvent| gate.output(event);
        loop {
            match fd::read(self.fd.as_fd(), buf) {
                Ok(0) => {
                    self.eof = true;
                    self.lines.finish(&mut emit);
                    return;
                }
                Ok(n) => self.lines.push(&buf[..n], &mut emit),
                Err(err) if would_block(&err) => return,
                Err(err) => {
                    debug!(stream = ?self.lines.stream, error = %err, "read failed; treating as end of stream");
                    self.eof = true;
                    self.lines.finish(&mut emit);
                    return;
                }
            }
        }
    }
}

/// Splits a byte stream into newline-terminated events.
#[derive(Debug)]
struct LineBuffer {
    stream: OutputStream,
    pending: Vec<u8>,
    max_line_bytes: usize,
}

impl LineBuffer {
    fn new(stream: OutputStream, max_line_bytes: usize) -> Self {
        Self {
            stream,
            pending: Vec::new(),
            max_line_bytes: max_line_bytes.max(1),
        }
    }

    fn push(&mut self, bytes: &[u8], emit: &mut impl FnMut(OutputEvent)) {
        for segment in bytes.split_inclusive(|b| *b == b'\n') {
            self.pending.extend_from_slice(segment);
            loop {
                let terminated = self.pending.ends_with(b"\n");
                if self.pending.len() - usize::from(terminated) <= self.max_line_bytes {
                    break;
                }
                let rest = self.pending.split_off(self.max_line_bytes);
                let chunk = std::mem::replace(&mut self.pending, rest);
                emit(OutputEvent::new(self.stream, chunk));
            }
            if self.pending.ends_with(b"\n") {
                self.flush(emit);
            }
        }
    }

    /// Emits a trailing unterminated line, if any.
    fn finish(&mut self, emit: &mut impl FnMut(OutputEvent)) {
        self.flush(emit);
    }

    fn flush(&mut self, emit: &mut impl FnMut(OutputEvent)) {
        if !self.pending.is_empty() {
            emit(OutputEvent::new(self.stream, std::mem::take(&mut self.pending)));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn collect(buffer: &mut LineBuffer, pushes: &[&[u8]], finish: bool) -> Vec<String> {
        let mut out = Vec::new();
        let mut emit = |event: OutputEvent| out.push(event.text());
        for bytes in pushes {
            buffer.push(bytes, &mut emit);
        }
        if finish {
            buffer.finish(&mut emit);
        }
        out
    }

    #[test]
    fn lines_split_across_reads_are_joined() {
        let mut buffer = LineBuffer::new(OutputStream::Stdout, 1024);
        let lines = collect(&mut buffer, &[b"hel", b"lo\nwor", b"ld\n\n"], false);
        assert_eq!(lines, vec!["hello\n", "world\n", "\n"]);
    }

    #[test]
    fn trailing_fragment_waits_for_finish() {
        let mut buffer = LineBuffer::new(OutputStream::Stderr, 1024);
        assert_eq!(collect(&mut buffer, &[b"a\npartial"], false), vec!["a\n"]);
        assert_eq!(collect(&mut buffer, &[], true), vec!["partial"]);
    }

    #[test]
    fn overlong_line_is_flushed_in_pieces() {
        let mut buffer = LineBuffer::new(OutputStream::Stdout, 4);
        let lines = collect(&mut buffer, &[b"abcdefghij\n"], true);
        assert_eq!(lines, vec!["abcd", "efgh", "ij\n"]);
    }

    #[test]
    fn drain_discards_buffered_bytes() {
        let (read_end, write_end) = fd::pipe().expect("pipe");
        fd::set_nonblocking(read_end.as_fd()).expect("nonblocking");
        fd::write_all(write_end.as_fd(), b"stale output").expect("write");
        drain_stale(read_end.as_fd());
        let mut buf = [0u8; 16];
        let err = fd::read(read_end.as_fd(), &mut buf).expect_err("drained");
        assert!(would_block(&err));
    }
}

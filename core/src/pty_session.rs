//! Interactive execution: a program attached to a pseudo-terminal.

use std::os::fd::AsFd;
use std::os::fd::AsRawFd;
use std::os::fd::OwnedFd;
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::Ordering;
use std::time::Duration;

use tracing::debug;
use tracing::warn;

use crate::config::ExecConfig;
use crate::config::WindowSize;
use crate::error::ControlError;
use crate::error::HandshakeError;
use crate::error::SpawnError;
use crate::error::StartError;
use crate::fd;
use crate::handshake;
use crate::process::ChildProcess;
use crate::process::ProcessHandle;
use crate::process::Signal;
use crate::protocol::CommandSpec;
use crate::protocol::ExecMode;
use crate::protocol::ExitStatus;
use crate::protocol::OutputEvent;
use crate::protocol::OutputStream;
use crate::pty;
use crate::session::ExecSession;
use crate::session::SessionState;
use crate::session::StateCell;
use crate::session::Worker;
use crate::session::lock;
use crate::signal_pipe::ExecImage;
use crate::signal_pipe::fork_lock;
use crate::sink::EventGate;
use crate::sink::ExecutionSink;

/// How long the reader blocks in `poll` before rechecking its stop flag.
const READER_WAKE_INTERVAL: Duration = Duration::from_millis(50);
/// Grace period for a stopped reader to collect the exit status.
const EXIT_GRACE: Duration = Duration::from_millis(100);

/// Runs one program on a pty and streams raw terminal output into an
/// [`ExecutionSink`] as `Stdout` events, one per read.
pub struct PtyExecutionSession {
    config: ExecConfig,
    sink: Arc<dyn ExecutionSink>,
    state: Arc<StateCell>,
    process: Mutex<Option<Arc<ChildProcess>>>,
    master: Mutex<Option<OwnedFd>>,
    worker: Worker,
}

impl PtyExecutionSession {
    pub fn new(config: ExecConfig, sink: Arc<dyn ExecutionSink>) -> Self {
        Self {
            config,
            sink,
            state: Arc::new(StateCell::new()),
            process: Mutex::new(None),
            master: Mutex::new(None),
            worker: Worker::default(),
        }
    }

    /// Starts `argv` with the configured window size.
    pub fn run<I, S>(&self, argv: I) -> Result<(), StartError>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.start(CommandSpec::interactive(argv))
    }

    pub fn start(&self, spec: CommandSpec) -> Result<(), StartError> {
        if spec.mode() != ExecMode::Interactive {
            return Err(StartError::WrongMode);
        }
        if !self
            .state
            .transition(SessionState::Idle, SessionState::Starting)
        {
            return Err(StartError::AlreadyStarted);
        }

        let (process, master) = match self.launch(&spec) {
            Ok(mut handle) => match handle.take_master() {
                Some(master) => (Arc::clone(handle.process()), master),
                None => {
                    abandon(handle.process());
                    self.state.advance(SessionState::Terminated);
                    return Err(StartError::Spawn(SpawnError::Pty(std::io::Error::other(
                        "pty handle is missing its master",
                    ))));
                }
            },
            Err(err) => {
                debug!(tag = spec.tag(), error = %err, "pty session failed to start");
                self.state
                    .transition(SessionState::Starting, SessionState::Terminated);
                return Err(err);
            }
        };

        let reader_fd = match fd::dup_cloexec(master.as_raw_fd()) {
            Ok(reader_fd) => reader_fd,
            Err(err) => {
                abandon(&process);
                self.state.advance(SessionState::Terminated);
                return Err(StartError::Spawn(SpawnError::Pty(err)));
            }
        };
        *lock(&self.process) = Some(Arc::clone(&process));
        *lock(&self.master) = Some(master);
        self.state
            .transition(SessionState::Starting, SessionState::Running);

        let reader = Reader {
            gate: EventGate::new(Arc::clone(&self.sink), spec.tag()),
            master: reader_fd,
            process: Arc::clone(&process),
            state: Arc::clone(&self.state),
            cancel: self.worker.cancel_flag(),
            chunk: self.config.read_chunk_bytes(),
            exit_wait: self.config.interrupt_timeout(),
        };
        if let Err(err) = self.worker.spawn("execbridge-pty", move || reader.run()) {
            abandon(&process);
            lock(&self.master).take();
            self.state.advance(SessionState::Terminated);
            return Err(err);
        }
        debug!(tag = spec.tag(), pid = process.spawned_pid(), "pty session running");
        Ok(())
    }

    fn launch(&self, spec: &CommandSpec) -> Result<ProcessHandle, StartError> {
        let image = ExecImage::prepare(spec)?;

        // Allocated under the lock so no concurrently forked child inherits
        // the master or the child end of the channel.
        let (pair, channel, pid) = {
            let _guard = fork_lock();
            let pair = pty::open_pty().map_err(SpawnError::Pty)?;
            let (channel, child_channel) = fd::socket_pair().map_err(SpawnError::Pipe)?;
            // SAFETY: the child only runs async-signal-safe code before execve.
            let pid = unsafe { libc::fork() };
            if pid == 0 {
                // SAFETY: we are the freshly forked child.
                unsafe {
                    pty::child_exec(
                        pair.master.as_raw_fd(),
                        &pair.slave_path,
                        child_channel.as_raw_fd(),
                        &image,
                    )
                }
            }
            let fork_result = if pid < 0 {
                Err(SpawnError::Fork(std::io::Error::last_os_error()))
            } else {
                Ok(pid)
            };
            (pair, channel, fork_result?)
        };
        let process = Arc::new(ChildProcess::new(pid));
        debug!(pid, program = image.program(), "pty child forked");

        if let Err(err) = fd::set_receive_timeout(channel.as_fd(), self.config.handshake_timeout())
            .map_err(HandshakeError::Io)
            .and_then(|()| handshake::negotiate(channel.as_fd(), self.config.window))
        {
            abandon(&process);
            return Err(err.into());
        }
        match handshake::await_exec(channel.as_fd()) {
            Ok(None) => Ok(ProcessHandle::with_pty(process, pair.master)),
            Ok(Some(errno)) => {
                abandon(&process);
                Err(SpawnError::exec(image.program(), errno).into())
            }
            Err(err) => {
                abandon(&process);
                Err(err.into())
            }
        }
    }

    /// Writes keystrokes to the pty master. Dropped silently unless the
    /// session is running.
    pub fn write(&self, bytes: &[u8]) -> Result<(), ControlError> {
        if self.state.get() != SessionState::Running {
            debug!(len = bytes.len(), "input dropped; session not running");
            return Ok(());
        }
        let guard = lock(&self.master);
        let Some(master) = guard.as_ref() else {
            return Ok(());
        };
        fd::write_all(master.as_fd(), bytes).map_err(ControlError::Write)
    }

    /// `SIGTERM` to the child, then stops the reader and closes the master.
    pub fn kill(&self) -> Result<(), ControlError> {
        let result = self
            .process()
            .ok_or(ControlError::NotRunning)
            .and_then(|process| {
                process.signal(Signal::Terminate)?;
                let _ = process.signal(Signal::Continue);
                Ok(())
            });
        self.teardown();
        result
    }

    /// `SIGTERM` to the child's group with a bounded wait, then teardown.
    pub fn interrupt(&self) -> Result<(), ControlError> {
        let Some(process) = self.process() else {
            return Err(ControlError::NotRunning);
        };
        let waited = self.config.interrupt_timeout();
        let result = process.terminate_group().and_then(|()| {
            if process.wait_timeout(waited).is_some() {
                Ok(())
            } else {
                warn!(pid = process.spawned_pid(), ?waited, "pty child ignored interrupt");
                Err(ControlError::Timeout {
                    pid: process.spawned_pid(),
                    waited,
                })
            }
        });
        self.teardown();
        result
    }

    /// Applies a new window size and notifies the child's group.
    pub fn resize(&self, rows: u16, cols: u16) -> Result<(), ControlError> {
        {
            let guard = lock(&self.master);
            let Some(master) = guard.as_ref() else {
                return Err(ControlError::NotRunning);
            };
            pty::set_window_size(master.as_raw_fd(), WindowSize { rows, cols })
                .map_err(ControlError::Resize)?;
        }
        self.signal_group(Signal::WindowChanged)
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
        lock(&self.master).take();
    }
}

impl ExecSession for PtyExecutionSession {
    fn start(&self, spec: CommandSpec) -> Result<(), StartError> {
        PtyExecutionSession::start(self, spec)
    }

    fn write(&self, bytes: &[u8]) -> Result<(), ControlError> {
        PtyExecutionSession::write(self, bytes)
    }

    fn interrupt(&self) -> Result<(), ControlError> {
        PtyExecutionSession::interrupt(self)
    }

    fn suspend(&self) -> Result<(), ControlError> {
        PtyExecutionSession::suspend(self)
    }

    fn resume(&self) -> Result<(), ControlError> {
        PtyExecutionSession::resume(self)
    }

    fn state(&self) -> SessionState {
        self.state.get()
    }
}

impl Drop for PtyExecutionSession {
    fn drop(&mut self) {
        if let Some(process) = self.process()
            && process.is_alive()
        {
            let _ = process.terminate_group();
            process.wait_timeout(EXIT_GRACE);
        }
        self.teardown();
    }
}

/// Kills a child that failed to start and reaps it.
fn abandon(process: &ChildProcess) {
    let _ = process.signal(Signal::Kill);
    if process.wait_timeout(EXIT_GRACE * 10).is_none() {
        warn!(pid = process.spawned_pid(), "failed pty child was not reaped");
    }
}

struct Reader {
    gate: EventGate,
    master: OwnedFd,
    process: Arc<ChildProcess>,
    state: Arc<StateCell>,
    cancel: Arc<AtomicBool>,
    chunk: usize,
    exit_wait: Duration,
}

impl Reader {
    fn run(self) {
        self.gate.started();
        let mut buf = vec![0u8; self.chunk];

        while !self.cancel.load(Ordering::SeqCst) {
            match fd::poll_readable(&[self.master.as_fd()], READER_WAKE_INTERVAL) {
                Ok(ready) if ready.first().copied().unwrap_or(false) => {}
                Ok(_) => continue,
                Err(err) => {
                    warn!(error = %err, "poll on pty master failed");
                    break;
                }
            }
            match fd::read(self.master.as_fd(), &mut buf) {
                Ok(0) => break,
                Ok(n) => self
                    .gate
                    .output(OutputEvent::new(OutputStream::Stdout, buf[..n].to_vec())),
                Err(err) => {
                    // EIO once every slave descriptor is closed.
                    debug!(error = %err, "pty master closed");
                    break;
                }
            }
        }

        self.state.advance(SessionState::Draining);
        let Self {
            gate,
            master,
            process,
            state,
            cancel,
            exit_wait,
            ..
        } = self;
        drop(master);
        let wait = if cancel.load(Ordering::SeqCst) {
            EXIT_GRACE
        } else {
            exit_wait
        };
        let status = process.wait_timeout(wait).unwrap_or(ExitStatus::Unknown);
        state.advance(SessionState::Terminated);
        debug!(pid = process.spawned_pid(), %status, "pty session terminated");
        gate.exited(status);
    }
}

//! Lifecycle and control contract shared by both session kinds.

use std::fmt;
use std::io;
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::AtomicU8;
use std::sync::atomic::Ordering;
use std::thread::JoinHandle;

use tracing::debug;
use tracing::warn;

use crate::error::ControlError;
use crate::error::StartError;
use crate::protocol::CommandSpec;

/// `Idle → Starting → Running → Draining → Terminated`, with
/// `Starting → Terminated` on spawn failure. Nothing leaves `Terminated`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum SessionState {
    Idle = 0,
    Starting = 1,
    Running = 2,
    Draining = 3,
    Terminated = 4,
}

impl SessionState {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => Self::Idle,
            1 => Self::Starting,
            2 => Self::Running,
            3 => Self::Draining,
            _ => Self::Terminated,
        }
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Self::Idle => "idle",
            Self::Starting => "starting",
            Self::Running => "running",
            Self::Draining => "draining",
            Self::Terminated => "terminated",
        };
        f.write_str(label)
    }
}

/// Atomic holder for a [`SessionState`]; only forward transitions succeed.
#[derive(Debug)]
pub(crate) struct StateCell(AtomicU8);

impl StateCell {
    pub(crate) fn new() -> Self {
        Self(AtomicU8::new(SessionState::Idle as u8))
    }

    pub(crate) fn get(&self) -> SessionState {
        SessionState::from_u8(self.0.load(Ordering::SeqCst))
    }

    /// Moves `from → to`; false if the cell was not in `from`.
    pub(crate) fn transition(&self, from: SessionState, to: SessionState) -> bool {
        let moved = self
            .0
            .compare_exchange(from as u8, to as u8, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok();
        if moved {
            debug!(%from, %to, "session state");
        }
        moved
    }

    /// Advances to `to` unless the cell is already at or past it.
    pub(crate) fn advance(&self, to: SessionState) {
        let prev = self.0.fetch_max(to as u8, Ordering::SeqCst);
        if prev < to as u8 {
            debug!(from = %SessionState::from_u8(prev), %to, "session state");
        }
    }
}

/// Control surface common to pipe and pty sessions.
///
/// Every method takes `&self`: control calls may run concurrently with the
/// session's worker thread.
pub trait ExecSession: Send + Sync {
    /// Spawns the child and starts the worker. Sessions are single-use; a
    /// second call fails with [`StartError::AlreadyStarted`].
    fn start(&self, spec: CommandSpec) -> Result<(), StartError>;

    /// Sends bytes to the child's input. Dropped silently unless the session
    /// is running.
    fn write(&self, bytes: &[u8]) -> Result<(), ControlError>;

    /// Terminates the child and tears the session down.
    fn interrupt(&self) -> Result<(), ControlError>;

    fn suspend(&self) -> Result<(), ControlError>;

    fn resume(&self) -> Result<(), ControlError>;

    fn state(&self) -> SessionState;

    fn is_done(&self) -> bool {
        self.state() == SessionState::Terminated
    }
}

/// The single worker thread a session may own, plus its stop flag.
#[derive(Debug, Default)]
pub(crate) struct Worker {
    handle: Mutex<Option<JoinHandle<()>>>,
    cancel: Arc<AtomicBool>,
}

impl Worker {
    pub(crate) fn cancel_flag(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.cancel)
    }

    pub(crate) fn spawn<F>(&self, name: &str, body: F) -> Result<(), StartError>
    where
        F: FnOnce() + Send + 'static,
    {
        let mut slot = self.lock();
        if slot.is_some() {
            return Err(StartError::AlreadyStarted);
        }
        let handle = std::thread::Builder::new()
            .name(name.to_string())
            .spawn(body)
            .map_err(StartError::Worker)?;
        *slot = Some(handle);
        Ok(())
    }

    pub(crate) fn request_stop(&self) {
        self.cancel.store(true, Ordering::SeqCst);
    }

    /// Stops and joins the worker. A no-op when called from the worker
    /// itself (e.g. from inside a sink callback).
    pub(crate) fn stop_and_join(&self) {
        self.request_stop();
        let handle = {
            let mut slot = self.lock();
            match slot.as_ref() {
                Some(handle) if handle.thread().id() == std::thread::current().id() => return,
                _ => slot.take(),
            }
        };
        if let Some(handle) = handle
            && handle.join().is_err()
        {
            warn!("session worker panicked");
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Option<JoinHandle<()>>> {
        self.handle
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }
}

pub(crate) fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(std::sync::PoisonError::into_inner)
}

pub(crate) fn would_block(err: &io::Error) -> bool {
    err.kind() == io::ErrorKind::WouldBlock
}

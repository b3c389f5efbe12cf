use std::io;
use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

use crate::protocol::ExitStatus;

/// The child could not be brought to life.
#[derive(Debug, Error)]
pub enum SpawnError {
    #[error("command argument vector is empty")]
    EmptyCommand,
    #[error("argument contains an interior NUL byte: {0:?}")]
    InvalidArgument(String),
    #[error("program not found: {program}")]
    ProgramNotFound {
        program: String,
        #[source]
        source: which::Error,
    },
    #[error("failed to create pipe: {0}")]
    Pipe(#[source] io::Error),
    #[error("failed to fork: {0}")]
    Fork(#[source] io::Error),
    #[error("failed to execute {program}: {source}")]
    Exec {
        program: String,
        #[source]
        source: io::Error,
    },
    #[error("cannot change to working directory {}: {source}", path.display())]
    WorkingDirectory {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("failed to allocate pseudo-terminal: {0}")]
    Pty(#[source] io::Error),
    #[error("child exited before it could be resumed ({0})")]
    ChildExited(ExitStatus),
    #[error("failed to wait for child: {0}")]
    Wait(#[source] io::Error),
}

impl SpawnError {
    pub(crate) fn exec(program: impl Into<String>, errno: i32) -> Self {
        Self::Exec {
            program: program.into(),
            source: io::Error::from_raw_os_error(errno),
        }
    }
}

/// The pty child failed one of its setup steps before reporting `OK`.
#[derive(Debug, Error)]
pub enum HandshakeError {
    #[error("pty child setup failed: {message}")]
    Child { message: String },
    #[error("unexpected handshake status {0}")]
    UnexpectedStatus(i32),
    #[error("handshake channel closed before the child reported")]
    ChannelClosed,
    #[error("pty child did not answer the handshake in time")]
    Timeout,
    #[error("handshake channel error: {0}")]
    Io(#[source] io::Error),
}

/// A control call (`interrupt`, `suspend`, `resume`, `write`) did not reach
/// its target. Never escalated: the desired end state usually holds anyway.
#[derive(Debug, Error)]
pub enum ControlError {
    #[error("process {pid} is no longer alive")]
    ProcessGone { pid: libc::pid_t },
    #[error("session is not running")]
    NotRunning,
    #[error("process {pid} did not exit within {waited:?}")]
    Timeout { pid: libc::pid_t, waited: Duration },
    #[error("failed to deliver signal: {0}")]
    Signal(#[source] io::Error),
    #[error("failed to write to child: {0}")]
    Write(#[source] io::Error),
    #[error("failed to resize terminal: {0}")]
    Resize(#[source] io::Error),
}

/// Returned synchronously from `start`; the worker thread is never started
/// on this path.
#[derive(Debug, Error)]
pub enum StartError {
    #[error("session already started; sessions are single-use")]
    AlreadyStarted,
    #[error("command mode does not match the session kind")]
    WrongMode,
    #[error(transparent)]
    Spawn(#[from] SpawnError),
    #[error(transparent)]
    Handshake(#[from] HandshakeError),
    #[error("failed to start worker thread: {0}")]
    Worker(#[source] io::Error),
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("failed to parse config {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },
}

//! Process execution and pseudo-terminal bridge.
//!
//! Runs one external command per session, either over three redirected
//! pipes ([`PipeExecutionSession`]) or behind a pseudo-terminal
//! ([`PtyExecutionSession`]), and streams its output to an
//! [`ExecutionSink`] from a dedicated worker thread.
#![cfg(unix)]

pub mod config;
pub mod error;
mod fd;
mod handshake;
mod pipe_session;
pub mod process;
pub mod protocol;
mod pty;
mod pty_session;
pub mod search;
mod session;
mod signal_pipe;
pub mod sink;

pub use config::ExecConfig;
pub use config::WindowSize;
pub use error::ConfigError;
pub use error::ControlError;
pub use error::HandshakeError;
pub use error::SpawnError;
pub use error::StartError;
pub use handshake::HandshakeMessage;
pub use handshake::HandshakeStatus;
pub use pipe_session::PipeExecutionSession;
pub use process::ProcessHandle;
pub use protocol::CommandSpec;
pub use protocol::ExecEvent;
pub use protocol::ExecMode;
pub use protocol::ExitStatus;
pub use protocol::OutputEvent;
pub use protocol::OutputStream;
pub use pty_session::PtyExecutionSession;
pub use session::ExecSession;
pub use session::SessionState;
pub use signal_pipe::SignalPipe;
pub use signal_pipe::SuspendedChild;
pub use sink::ChannelSink;
pub use sink::ExecutionSink;
pub use sink::FnSink;

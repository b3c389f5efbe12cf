//! The fixed-size message a pty child and its parent exchange over a private
//! socket between `fork` and `execve`.
//!
//! ```text
//! child                         parent
//!   NEEDS_WINDOW_SIZE   ───▶
//!                       ◀───   NEEDS_WINDOW_SIZE {rows, cols}
//!   OK | FAILED{message} ──▶
//!   (execve)
//!   EOF | EXEC_FAILED{errno} ─▶
//! ```
//!
//! Encoding and decoding never allocate, so the child side is safe to run
//! after `fork`.

use std::fmt;
use std::io;
use std::os::fd::BorrowedFd;

use tracing::debug;

use crate::config::WindowSize;
use crate::error::HandshakeError;
use crate::fd;
use crate::session::would_block;
use crate::signal_pipe::read_full;

pub const MESSAGE_LEN: usize = 128;
const STATUS_OFFSET: usize = 0;
const MESSAGE_OFFSET: usize = 4;
const ROWS_OFFSET: usize = MESSAGE_OFFSET + MESSAGE_LEN;
const COLS_OFFSET: usize = ROWS_OFFSET + 2;
pub const WIRE_LEN: usize = COLS_OFFSET + 2;

const EXEC_FAILED_PREFIX: &[u8] = b"execve failed, errno ";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(i32)]
pub enum HandshakeStatus {
    Ok = 0,
    Failed = 1,
    NeedsWindowSize = 2,
    /// Sent after `Ok` when `execve` itself fails.
    ExecFailed = 3,
}

impl HandshakeStatus {
    fn from_raw(raw: i32) -> Option<Self> {
        match raw {
            0 => Some(Self::Ok),
            1 => Some(Self::Failed),
            2 => Some(Self::NeedsWindowSize),
            3 => Some(Self::ExecFailed),
            _ => None,
        }
    }
}

/// `{status, message[128], rows, cols}` in native byte order.
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct HandshakeMessage {
    status: i32,
    message: [u8; MESSAGE_LEN],
    rows: u16,
    cols: u16,
}

impl HandshakeMessage {
    pub const fn new(status: HandshakeStatus) -> Self {
        Self {
            status: status as i32,
            message: [0; MESSAGE_LEN],
            rows: 0,
            cols: 0,
        }
    }

    pub const fn ok() -> Self {
        Self::new(HandshakeStatus::Ok)
    }

    pub const fn needs_window_size() -> Self {
        Self::new(HandshakeStatus::NeedsWindowSize)
    }

    /// The parent's reply to `NEEDS_WINDOW_SIZE`.
    pub const fn window_size(window: WindowSize) -> Self {
        let mut msg = Self::new(HandshakeStatus::NeedsWindowSize);
        msg.rows = window.rows;
        msg.cols = window.cols;
        msg
    }

    /// `FAILED` carrying `text`, truncated to leave a trailing NUL.
    pub fn failed(text: &[u8]) -> Self {
        let mut msg = Self::new(HandshakeStatus::Failed);
        msg.set_message(&[text]);
        msg
    }

    pub fn exec_failed(errno: i32) -> Self {
        let mut digits = [0u8; 12];
        let mut start = digits.len();
        let mut n = errno.unsigned_abs();
        loop {
            start -= 1;
            digits[start] = b'0' + (n % 10) as u8;
            n /= 10;
            if n == 0 {
                break;
            }
        }
        let mut msg = Self::new(HandshakeStatus::ExecFailed);
        msg.set_message(&[EXEC_FAILED_PREFIX, &digits[start..]]);
        msg
    }

    fn set_message(&mut self, parts: &[&[u8]]) {
        let mut at = 0;
        for part in parts {
            let take = part.len().min(MESSAGE_LEN - 1 - at);
            self.message[at..at + take].copy_from_slice(&part[..take]);
            at += take;
        }
    }

    pub fn status(&self) -> Option<HandshakeStatus> {
        HandshakeStatus::from_raw(self.status)
    }

    pub fn raw_status(&self) -> i32 {
        self.status
    }

    /// Message text up to the first NUL.
    pub fn message(&self) -> String {
        let end = self
            .message
            .iter()
            .position(|b| *b == 0)
            .unwrap_or(MESSAGE_LEN);
        String::from_utf8_lossy(&self.message[..end]).into_owned()
    }

    pub fn window(&self) -> WindowSize {
        WindowSize {
            rows: self.rows,
            cols: self.cols,
        }
    }

    /// The errno carried by an `EXEC_FAILED` message.
    pub fn exec_errno(&self) -> Option<i32> {
        if self.status() != Some(HandshakeStatus::ExecFailed) {
            return None;
        }
        self.message()
            .strip_prefix(std::str::from_utf8(EXEC_FAILED_PREFIX).ok()?)?
            .parse()
            .ok()
    }

    pub fn encode(&self) -> [u8; WIRE_LEN] {
        let mut out = [0u8; WIRE_LEN];
        out[STATUS_OFFSET..MESSAGE_OFFSET].copy_from_slice(&self.status.to_ne_bytes());
        out[MESSAGE_OFFSET..ROWS_OFFSET].copy_from_slice(&self.message);
        out[ROWS_OFFSET..COLS_OFFSET].copy_from_slice(&self.rows.to_ne_bytes());
        out[COLS_OFFSET..WIRE_LEN].copy_from_slice(&self.cols.to_ne_bytes());
        out
    }

    pub fn decode(bytes: &[u8; WIRE_LEN]) -> Self {
        let mut status = [0u8; 4];
        status.copy_from_slice(&bytes[STATUS_OFFSET..MESSAGE_OFFSET]);
        let mut message = [0u8; MESSAGE_LEN];
        message.copy_from_slice(&bytes[MESSAGE_OFFSET..ROWS_OFFSET]);
        Self {
            status: i32::from_ne_bytes(status),
            message,
            rows: u16::from_ne_bytes([bytes[ROWS_OFFSET], bytes[ROWS_OFFSET + 1]]),
            cols: u16::from_ne_bytes([bytes[COLS_OFFSET], bytes[COLS_OFFSET + 1]]),
        }
    }
}

impl fmt::Debug for HandshakeMessage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HandshakeMessage")
            .field("status", &self.status)
            .field("message", &self.message())
            .field("rows", &self.rows)
            .field("cols", &self.cols)
            .finish()
    }
}

pub(crate) fn send(channel: BorrowedFd<'_>, msg: &HandshakeMessage) -> io::Result<()> {
    fd::write_all(channel, &msg.encode())
}

/// `Ok(None)` when the peer closed the channel before sending anything.
pub(crate) fn recv(channel: BorrowedFd<'_>) -> io::Result<Option<HandshakeMessage>> {
    let mut buf = [0u8; WIRE_LEN];
    match read_full(channel, &mut buf)? {
        0 => Ok(None),
        WIRE_LEN => Ok(Some(HandshakeMessage::decode(&buf))),
        _ => Err(io::Error::from(io::ErrorKind::UnexpectedEof)),
    }
}

/// A receive timeout on the channel surfaces as `WouldBlock`.
fn recv_error(err: io::Error) -> HandshakeError {
    if would_block(&err) {
        HandshakeError::Timeout
    } else {
        HandshakeError::Io(err)
    }
}

/// Parent side: answers window-size requests until the child reports `OK`
/// or `FAILED`.
pub(crate) fn negotiate(channel: BorrowedFd<'_>, window: WindowSize) -> Result<(), HandshakeError> {
    loop {
        let Some(msg) = recv(channel).map_err(recv_error)? else {
            return Err(HandshakeError::ChannelClosed);
        };
        match msg.status() {
            Some(HandshakeStatus::NeedsWindowSize) => {
                debug!(rows = window.rows, cols = window.cols, "sending window size");
                send(channel, &HandshakeMessage::window_size(window)).map_err(HandshakeError::Io)?;
            }
            Some(HandshakeStatus::Ok) => return Ok(()),
            Some(HandshakeStatus::Failed) => {
                return Err(HandshakeError::Child {
                    message: msg.message(),
                });
            }
            Some(HandshakeStatus::ExecFailed) | None => {
                return Err(HandshakeError::UnexpectedStatus(msg.raw_status()));
            }
        }
    }
}

/// After `OK`: `Ok(None)` once the channel closes on a successful exec,
/// `Ok(Some(errno))` if the child reports that `execve` failed.
pub(crate) fn await_exec(channel: BorrowedFd<'_>) -> Result<Option<i32>, HandshakeError> {
    match recv(channel).map_err(recv_error)? {
        None => Ok(None),
        Some(msg) => match msg.exec_errno() {
            Some(errno) => Ok(Some(errno)),
            None => Err(HandshakeError::UnexpectedStatus(msg.raw_status())),
        },
    }
}

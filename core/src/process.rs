//! The live child process and the descriptors a session owns for it.

use std::io;
use std::os::fd::OwnedFd;
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::MutexGuard;
use std::time::Duration;
use std::time::Instant;

use tracing::debug;

use crate::error::ControlError;
use crate::protocol::ExitStatus;

const WAIT_POLL_INTERVAL: Duration = Duration::from_millis(5);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Signal {
    /// `SIGTERM`.
    Terminate,
    /// `SIGSTOP`.
    Stop,
    /// `SIGCONT`.
    Continue,
    /// `SIGKILL`.
    Kill,
    /// `SIGWINCH`.
    WindowChanged,
}

impl Signal {
    pub fn as_raw(self) -> libc::c_int {
        match self {
            Signal::Terminate => libc::SIGTERM,
            Signal::Stop => libc::SIGSTOP,
            Signal::Continue => libc::SIGCONT,
            Signal::Kill => libc::SIGKILL,
            Signal::WindowChanged => libc::SIGWINCH,
        }
    }
}

/// A forked child, identified by its pid, that leads its own process group.
///
/// The exit status is cached the first time `waitpid` reports it. All
/// liveness checks and signal deliveries go through the same lock, so a
/// signal is never sent to a pid that has already been reaped (and might
/// have been recycled).
#[derive(Debug)]
pub struct ChildProcess {
    pid: libc::pid_t,
    exit: Mutex<Option<ExitStatus>>,
}

impl ChildProcess {
    pub(crate) fn new(pid: libc::pid_t) -> Self {
        Self {
            pid,
            exit: Mutex::new(None),
        }
    }

    /// The pid, or `-1` once the child has been reaped.
    pub fn pid(&self) -> libc::pid_t {
        if self.lock_exit().is_some() {
            -1
        } else {
            self.pid
        }
    }

    /// The pid the child was spawned with, reaped or not.
    pub fn spawned_pid(&self) -> libc::pid_t {
        self.pid
    }

    pub fn is_alive(&self) -> bool {
        self.try_wait().is_none()
    }

    /// Non-blocking reap. `Some` once the child has exited.
    pub fn try_wait(&self) -> Option<ExitStatus> {
        let mut guard = self.lock_exit();
        self.poll_locked(&mut guard)
    }

    /// Polls for exit until `timeout` elapses.
    pub fn wait_timeout(&self, timeout: Duration) -> Option<ExitStatus> {
        let deadline = Instant::now() + timeout;
        loop {
            if let Some(status) = self.try_wait() {
                return Some(status);
            }
            let now = Instant::now();
            if now >= deadline {
                return None;
            }
            std::thread::sleep(WAIT_POLL_INTERVAL.min(deadline - now));
        }
    }

    /// Sends `signal` to this process only.
    pub fn signal(&self, signal: Signal) -> Result<(), ControlError> {
        self.deliver(self.pid, signal)
    }

    /// Sends `signal` to the whole process group led by this child.
    pub fn signal_group(&self, signal: Signal) -> Result<(), ControlError> {
        self.deliver(-self.pid, signal)
    }

    /// `SIGTERM` then `SIGCONT` to the group, so a suspended child still
    /// sees the termination.
    pub fn terminate_group(&self) -> Result<(), ControlError> {
        self.signal_group(Signal::Terminate)?;
        if let Err(err) = self.signal_group(Signal::Continue) {
            debug!(pid = self.pid, error = %err, "continue after terminate failed");
        }
        Ok(())
    }

    fn deliver(&self, target: libc::pid_t, signal: Signal) -> Result<(), ControlError> {
        let mut guard = self.lock_exit();
        if self.poll_locked(&mut guard).is_some() {
            return Err(ControlError::ProcessGone { pid: self.pid });
        }
        // SAFETY: kill(2) has no memory safety requirements. The child is
        // unreaped while `guard` is held, so `target` still names it.
        let ret = unsafe { libc::kill(target, signal.as_raw()) };
        if ret == -1 {
            let err = io::Error::last_os_error();
            if err.raw_os_error() == Some(libc::ESRCH) {
                return Err(ControlError::ProcessGone { pid: self.pid });
            }
            return Err(ControlError::Signal(err));
        }
        debug!(pid = self.pid, target, signal = ?signal, "signal delivered");
        Ok(())
    }

    fn poll_locked(&self, exit: &mut Option<ExitStatus>) -> Option<ExitStatus> {
        if exit.is_some() {
            return *exit;
        }
        let mut status: libc::c_int = 0;
        // SAFETY: `status` is a valid out pointer for waitpid(2).
        let ret = unsafe { libc::waitpid(self.pid, &mut status, libc::WNOHANG) };
        match ret {
            0 => None,
            -1 => {
                let err = io::Error::last_os_error();
                if err.kind() == io::ErrorKind::Interrupted {
                    return None;
                }
                // ECHILD: someone else reaped it; the status is lost.
                debug!(pid = self.pid, error = %err, "waitpid failed; treating child as gone");
                *exit = Some(ExitStatus::Unknown);
                *exit
            }
            _ => {
                let decoded = ExitStatus::from_wait_status(status);
                debug!(pid = self.pid, status = %decoded, "child reaped");
                *exit = Some(decoded);
                *exit
            }
        }
    }

    fn lock_exit(&self) -> MutexGuard<'_, Option<ExitStatus>> {
        self.exit
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }
}

#[derive(Debug)]
enum Descriptors {
    Pipes {
        stdin: Option<OwnedFd>,
        stdout: Option<OwnedFd>,
        stderr: Option<OwnedFd>,
    },
    Pty {
        master: Option<OwnedFd>,
    },
}

/// Exactly one child plus the descriptors wired to it: three pipe ends, or
/// one pty master. Descriptors are `OwnedFd`, so each is closed exactly once
/// whether it is taken by a session or dropped with the handle.
#[derive(Debug)]
pub struct ProcessHandle {
    process: Arc<ChildProcess>,
    descriptors: Descriptors,
}

impl ProcessHandle {
    pub(crate) fn with_pipes(
        process: Arc<ChildProcess>,
        stdin: OwnedFd,
        stdout: OwnedFd,
        stderr: OwnedFd,
    ) -> Self {
        Self {
            process,
            descriptors: Descriptors::Pipes {
                stdin: Some(stdin),
                stdout: Some(stdout),
                stderr: Some(stderr),
            },
        }
    }

    pub(crate) fn with_pty(process: Arc<ChildProcess>, master: OwnedFd) -> Self {
        Self {
            process,
            descriptors: Descriptors::Pty {
                master: Some(master),
            },
        }
    }

    pub fn process(&self) -> &Arc<ChildProcess> {
        &self.process
    }

    pub fn pid(&self) -> libc::pid_t {
        self.process.pid()
    }

    pub fn is_alive(&self) -> bool {
        self.process.is_alive()
    }

    pub fn signal(&self, signal: Signal) -> Result<(), ControlError> {
        self.process.signal(signal)
    }

    pub fn signal_group(&self, signal: Signal) -> Result<(), ControlError> {
        self.process.signal_group(signal)
    }

    pub fn stdin(&self) -> Option<&OwnedFd> {
        match &self.descriptors {
            Descriptors::Pipes { stdin, .. } => stdin.as_ref(),
            Descriptors::Pty { .. } => None,
        }
    }

    pub fn stdout(&self) -> Option<&OwnedFd> {
        match &self.descriptors {
            Descriptors::Pipes { stdout, .. } => stdout.as_ref(),
            Descriptors::Pty { .. } => None,
        }
    }

    pub fn stderr(&self) -> Option<&OwnedFd> {
        match &self.descriptors {
            Descriptors::Pipes { stderr, .. } => stderr.as_ref(),
            Descriptors::Pty { .. } => None,
        }
    }

    pub fn take_stdin(&mut self) -> Option<OwnedFd> {
        match &mut self.descriptors {
            Descriptors::Pipes { stdin, .. } => stdin.take(),
            Descriptors::Pty { .. } => None,
        }
    }

    pub fn take_stdout(&mut self) -> Option<OwnedFd> {
        match &mut self.descriptors {
            Descriptors::Pipes { stdout, .. } => stdout.take(),
            Descriptors::Pty { .. } => None,
        }
    }

    pub fn take_stderr(&mut self) -> Option<OwnedFd> {
        match &mut self.descriptors {
            Descriptors::Pipes { stderr, .. } => stderr.take(),
            Descriptors::Pty { .. } => None,
        }
    }

    pub fn take_master(&mut self) -> Option<OwnedFd> {
        match &mut self.descriptors {
            Descriptors::Pty { master } => master.take(),
            Descriptors::Pipes { .. } => None,
        }
    }

    /// Closes whatever descriptors are still held.
    pub fn close(&mut self) {
        match &mut self.descriptors {
            Descriptors::Pipes {
                stdin,
                stdout,
                stderr,
            } => {
                stdin.take();
                stdout.take();
                stderr.take();
            }
            Descriptors::Pty { master } => {
                master.take();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;
    use std::os::unix::process::CommandExt;
    use std::process::Command;
    use std::process::Stdio;

    fn spawn_leader(script: &str) -> ChildProcess {
        let child = Command::new("/bin/sh")
            .arg("-c")
            .arg(script)
            .process_group(0)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .spawn()
            .expect("spawn");
        ChildProcess::new(child.id() as libc::pid_t)
    }

    #[test]
    fn reaped_child_reports_exit_and_invalid_pid() {
        let child = spawn_leader("exit 7");
        let status = child
            .wait_timeout(Duration::from_secs(5))
            .expect("child exits");
        assert_eq!(status, ExitStatus::Exited(7));
        assert_eq!(child.pid(), -1);
        assert!(!child.is_alive());
    }

    #[test]
    fn signal_to_dead_child_is_rejected() {
        let child = spawn_leader("exit 0");
        child
            .wait_timeout(Duration::from_secs(5))
            .expect("child exits");
        assert_matches!(
            child.signal_group(Signal::Terminate),
            Err(ControlError::ProcessGone { .. })
        );
    }

    #[test]
    fn terminate_reaches_process_group() {
        let child = spawn_leader("sleep 30");
        assert!(child.is_alive());
        child.signal_group(Signal::Terminate).expect("signal");
        let status = child
            .wait_timeout(Duration::from_secs(5))
            .expect("child exits");
        assert_eq!(status, ExitStatus::Signaled(libc::SIGTERM));
    }

    #[test]
    fn terminate_group_ends_a_stopped_group() {
        let child = spawn_leader("sleep 30");
        child.signal_group(Signal::Stop).expect("stop");
        child.terminate_group().expect("terminate");
        let status = child
            .wait_timeout(Duration::from_secs(5))
            .expect("child exits");
        assert_eq!(status, ExitStatus::Signaled(libc::SIGTERM));
    }
}

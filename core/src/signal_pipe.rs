//! Spawning a child with its standard streams redirected into pipes.
//!
//! Redirection is done on the parent's own descriptor slots 0/1/2: the
//! originals are set aside, the pipe ends are `dup2`ed over them, the child is
//! forked (inheriting them), and the originals are put back. Slots 0/1/2 are
//! process-wide state, so the whole window runs under [`fork_lock`]; the pty
//! session forks under the same lock so no child ever inherits a half
//! redirected table.
//!
//! The child stops itself before `execve`. The caller finishes its
//! bookkeeping on the read ends and then calls [`SuspendedChild::resume`].

use std::ffi::CString;
use std::io;
use std::os::fd::AsFd;
use std::os::fd::AsRawFd;
use std::os::fd::BorrowedFd;
use std::os::fd::OwnedFd;
use std::os::fd::RawFd;
use std::os::unix::ffi::OsStrExt;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::MutexGuard;

use tracing::debug;
use tracing::warn;

use crate::error::SpawnError;
use crate::fd;
use crate::process::ChildProcess;
use crate::process::ProcessHandle;
use crate::protocol::CommandSpec;
use crate::protocol::ExitStatus;

static FORK_LOCK: Mutex<()> = Mutex::new(());

const STAGE_CHDIR: i32 = 1;
const STAGE_EXEC: i32 = 2;
const STATUS_LEN: usize = 8;

/// Held for the brief fork/redirect/restore window, never for a session's
/// lifetime.
pub(crate) fn fork_lock() -> MutexGuard<'static, ()> {
    FORK_LOCK
        .lock()
        .unwrap_or_else(std::sync::PoisonError::into_inner)
}

/// Everything `execve` needs, built before `fork` so the child never
/// allocates.
pub(crate) struct ExecImage {
    program: CString,
    argv: Vec<CString>,
    argv_ptrs: Vec<*const libc::c_char>,
    envp: Vec<CString>,
    envp_ptrs: Vec<*const libc::c_char>,
    cwd: Option<CString>,
    nice: Option<i32>,
    display_program: String,
    display_cwd: Option<PathBuf>,
}

impl ExecImage {
    pub(crate) fn prepare(spec: &CommandSpec) -> Result<Self, SpawnError> {
        let Some(program) = spec.program() else {
            return Err(SpawnError::EmptyCommand);
        };
        let resolved = if program.contains('/') {
            PathBuf::from(program)
        } else {
            which::which(program).map_err(|source| SpawnError::ProgramNotFound {
                program: program.to_string(),
                source,
            })?
        };

        let program_c = cstring(resolved.as_os_str().as_bytes())?;
        let argv = spec
            .argv()
            .iter()
            .map(|arg| cstring(arg.as_bytes()))
            .collect::<Result<Vec<_>, _>>()?;

        let mut vars: Vec<(Vec<u8>, Vec<u8>)> = std::env::vars_os()
            .map(|(k, v)| (k.as_bytes().to_vec(), v.as_bytes().to_vec()))
            .collect();
        for (key, value) in spec.env() {
            vars.retain(|(k, _)| k.as_slice() != key.as_bytes());
            vars.push((key.as_bytes().to_vec(), value.as_bytes().to_vec()));
        }
        let envp = vars
            .into_iter()
            .map(|(mut key, value)| {
                key.push(b'=');
                key.extend_from_slice(&value);
                cstring(&key)
            })
            .collect::<Result<Vec<_>, _>>()?;

        let cwd = spec
            .cwd()
            .map(|dir| cstring(dir.as_os_str().as_bytes()))
            .transpose()?;

        let mut image = Self {
            program: program_c,
            argv,
            argv_ptrs: Vec::new(),
            envp,
            envp_ptrs: Vec::new(),
            cwd,
            nice: spec.nice(),
            display_program: program.to_string(),
            display_cwd: spec.cwd().map(std::path::Path::to_path_buf),
        };
        // The CStrings' heap buffers do not move when `image` does.
        image.argv_ptrs = image
            .argv
            .iter()
            .map(|arg| arg.as_ptr())
            .chain(std::iter::once(std::ptr::null()))
            .collect();
        image.envp_ptrs = image
            .envp
            .iter()
            .map(|var| var.as_ptr())
            .chain(std::iter::once(std::ptr::null()))
            .collect();
        Ok(image)
    }

    pub(crate) fn program(&self) -> &str {
        &self.display_program
    }

    /// `chdir` then `execve`. Only returns on failure, with the failing stage
    /// and errno.
    ///
    /// # Safety
    /// Must only be called in a freshly forked child; it performs nothing but
    /// async-signal-safe syscalls.
    pub(crate) unsafe fn exec(&self) -> (i32, i32) {
        if let Err(errno) = unsafe { self.change_dir() } {
            return (STAGE_CHDIR, errno);
        }
        (STAGE_EXEC, unsafe { self.execve() })
    }

    /// Applies the requested niceness; failure leaves the inherited one.
    ///
    /// # Safety
    /// As [`ExecImage::exec`].
    pub(crate) unsafe fn apply_priority(&self) {
        if let Some(nice) = self.nice {
            unsafe { libc::setpriority(libc::PRIO_PROCESS, 0, nice) };
        }
    }

    /// # Safety
    /// As [`ExecImage::exec`].
    pub(crate) unsafe fn change_dir(&self) -> Result<(), i32> {
        if let Some(cwd) = &self.cwd
            && unsafe { libc::chdir(cwd.as_ptr()) } == -1
        {
            return Err(errno());
        }
        Ok(())
    }

    /// Replaces the process image; returns errno only if that fails.
    ///
    /// # Safety
    /// As [`ExecImage::exec`].
    pub(crate) unsafe fn execve(&self) -> i32 {
        unsafe {
            libc::execve(
                self.program.as_ptr(),
                self.argv_ptrs.as_ptr(),
                self.envp_ptrs.as_ptr(),
            );
        }
        errno()
    }

    pub(crate) fn failure(&self, stage: i32, errno: i32) -> SpawnError {
        if stage == STAGE_CHDIR {
            SpawnError::WorkingDirectory {
                path: self.display_cwd.clone().unwrap_or_default(),
                source: io::Error::from_raw_os_error(errno),
            }
        } else {
            SpawnError::exec(self.display_program.clone(), errno)
        }
    }
}

fn cstring(bytes: &[u8]) -> Result<CString, SpawnError> {
    CString::new(bytes)
        .map_err(|_| SpawnError::InvalidArgument(String::from_utf8_lossy(bytes).into_owned()))
}

pub(crate) fn errno() -> i32 {
    io::Error::last_os_error()
        .raw_os_error()
        .unwrap_or(libc::EINVAL)
}

/// Restores default dispositions and an empty mask in a forked child. The
/// parent may ignore `SIGPIPE` (the Rust runtime does), and ignored
/// dispositions survive `execve`.
///
/// # Safety
/// Only async-signal-safe calls; intended for the child side of `fork`.
pub(crate) unsafe fn reset_child_signals() {
    unsafe {
        for signal in [
            libc::SIGCHLD,
            libc::SIGHUP,
            libc::SIGINT,
            libc::SIGQUIT,
            libc::SIGTERM,
            libc::SIGTTOU,
            libc::SIGPIPE,
        ] {
            libc::signal(signal, libc::SIG_DFL);
        }
        let mut set: libc::sigset_t = std::mem::zeroed();
        libc::sigemptyset(&mut set);
        libc::sigprocmask(libc::SIG_SETMASK, &set, std::ptr::null_mut());
    }
}

enum SavedSlot {
    Saved(OwnedFd),
    /// The slot was closed; it holds a `/dev/null` placeholder for now.
    WasClosed,
}

/// The caller's descriptors 0/1/2, set aside for the redirection window and
/// put back on drop.
struct SavedStdio {
    slots: [SavedSlot; 3],
}

impl SavedStdio {
    fn capture() -> io::Result<Self> {
        Ok(Self {
            slots: [save_slot(0)?, save_slot(1)?, save_slot(2)?],
        })
    }

    fn redirect(
        &self,
        stdin: BorrowedFd<'_>,
        stdout: BorrowedFd<'_>,
        stderr: BorrowedFd<'_>,
    ) -> io::Result<()> {
        for (source, slot) in [(stdin, 0), (stdout, 1), (stderr, 2)] {
            // SAFETY: both descriptors are open; dup2 replaces `slot`.
            fd::cvt(unsafe { libc::dup2(source.as_raw_fd(), slot) })?;
        }
        Ok(())
    }
}

impl Drop for SavedStdio {
    fn drop(&mut self) {
        for (slot, saved) in self.slots.iter().enumerate() {
            let slot = slot as RawFd;
            let ret = match saved {
                // SAFETY: `fd` is open and owned by us; dup2 replaces `slot`.
                SavedSlot::Saved(fd) => unsafe { libc::dup2(fd.as_raw_fd(), slot) },
                // SAFETY: the slot holds our placeholder (or a pipe end we
                // dup2ed there); closing it returns the table to its prior
                // state.
                SavedSlot::WasClosed => unsafe { libc::close(slot) },
            };
            if ret == -1 {
                warn!(slot, error = %io::Error::last_os_error(), "failed to restore standard descriptor");
            }
        }
    }
}

fn save_slot(slot: RawFd) -> io::Result<SavedSlot> {
    match fd::dup_cloexec(slot) {
        Ok(saved) => Ok(SavedSlot::Saved(saved)),
        Err(err) if err.raw_os_error() == Some(libc::EBADF) => {
            occupy_slot(slot)?;
            Ok(SavedSlot::WasClosed)
        }
        Err(err) => Err(err),
    }
}

/// Parks `/dev/null` in a closed slot so new pipes cannot land on 0/1/2.
fn occupy_slot(slot: RawFd) -> io::Result<()> {
    // SAFETY: the path is a valid NUL terminated string.
    let null = fd::cvt(unsafe { libc::open(c"/dev/null".as_ptr(), libc::O_RDWR) })?;
    if null != slot {
        // SAFETY: `null` is open; dup2 fills the closed `slot`.
        let ret = unsafe { libc::dup2(null, slot) };
        // SAFETY: `null` was opened above and is not referenced elsewhere.
        unsafe { libc::close(null) };
        fd::cvt(ret)?;
    }
    Ok(())
}

/// Spawns children with redirected standard streams.
pub struct SignalPipe;

impl SignalPipe {
    /// Forks `spec` with stdin/stdout/stderr redirected into fresh pipes. The
    /// child is stopped before it execs; nothing is returned half built.
    pub fn spawn(spec: &CommandSpec) -> Result<SuspendedChild, SpawnError> {
        let image = ExecImage::prepare(spec)?;

        let guard = fork_lock();
        let saved = SavedStdio::capture().map_err(SpawnError::Pipe)?;
        let (stdin_read, stdin_write) = fd::pipe().map_err(SpawnError::Pipe)?;
        let (stdout_read, stdout_write) = fd::pipe().map_err(SpawnError::Pipe)?;
        let (stderr_read, stderr_write) = fd::pipe().map_err(SpawnError::Pipe)?;
        let (status_read, status_write) = fd::pipe().map_err(SpawnError::Pipe)?;
        saved
            .redirect(stdin_read.as_fd(), stdout_write.as_fd(), stderr_write.as_fd())
            .map_err(SpawnError::Pipe)?;

        // SAFETY: the child only runs async-signal-safe code before execve.
        let pid = unsafe { libc::fork() };
        if pid == 0 {
            // SAFETY: we are the freshly forked child.
            unsafe { child_after_fork(&image, status_write.as_raw_fd()) }
        }
        let fork_error = (pid < 0).then(io::Error::last_os_error);

        drop(saved);
        // The child's ends close here in the parent.
        drop((stdin_read, stdout_write, stderr_write, status_write));
        drop(guard);

        if let Some(err) = fork_error {
            return Err(SpawnError::Fork(err));
        }
        // Also done in the child; whichever runs first wins.
        // SAFETY: setpgid(2) has no memory safety requirements.
        unsafe { libc::setpgid(pid, pid) };
        debug!(pid, program = image.program(), "spawned suspended child");

        Ok(SuspendedChild {
            parts: Some(SuspendedParts {
                pid,
                stdin: stdin_write,
                stdout: stdout_read,
                stderr: stderr_read,
                status: status_read,
                image,
            }),
        })
    }
}

/// # Safety
/// Child side of `fork`: async-signal-safe calls only, never returns.
unsafe fn child_after_fork(image: &ExecImage, status_fd: RawFd) -> ! {
    unsafe {
        libc::setpgid(0, 0);
        reset_child_signals();
        image.apply_priority();
        // Wait here until the parent has finished with the pipe read ends.
        libc::kill(libc::getpid(), libc::SIGSTOP);
        let (stage, errno) = image.exec();
        let mut report = [0u8; STATUS_LEN];
        report[..4].copy_from_slice(&stage.to_ne_bytes());
        report[4..].copy_from_slice(&errno.to_ne_bytes());
        libc::write(status_fd, report.as_ptr().cast(), report.len());
        libc::_exit(127)
    }
}

struct SuspendedParts {
    pid: libc::pid_t,
    stdin: OwnedFd,
    stdout: OwnedFd,
    stderr: OwnedFd,
    status: OwnedFd,
    image: ExecImage,
}

/// A child that has been forked with redirected streams but has not yet
/// exec'd. Dropping it without resuming kills and reaps the child.
pub struct SuspendedChild {
    parts: Option<SuspendedParts>,
}

impl SuspendedChild {
    pub fn pid(&self) -> libc::pid_t {
        self.parts.as_ref().map_or(-1, |p| p.pid)
    }

    /// Read end of the child's stdout.
    pub fn stdout(&self) -> Option<BorrowedFd<'_>> {
        self.parts.as_ref().map(|p| p.stdout.as_fd())
    }

    /// Read end of the child's stderr.
    pub fn stderr(&self) -> Option<BorrowedFd<'_>> {
        self.parts.as_ref().map(|p| p.stderr.as_fd())
    }

    /// Lets the child continue into `execve` and reports whether the exec
    /// succeeded.
    pub fn resume(mut self) -> Result<ProcessHandle, SpawnError> {
        let Some(parts) = self.parts.take() else {
            return Err(SpawnError::EmptyCommand);
        };
        let SuspendedParts {
            pid,
            stdin,
            stdout,
            stderr,
            status,
            image,
        } = parts;

        let wait_status = match wait_for_stop(pid) {
            Ok(wait_status) => wait_status,
            Err(err) => {
                // SAFETY: `pid` is our child; it is reaped below.
                unsafe { libc::kill(pid, libc::SIGKILL) };
                reap_blocking(pid);
                return Err(err);
            }
        };
        if !libc::WIFSTOPPED(wait_status) {
            return Err(SpawnError::ChildExited(ExitStatus::from_wait_status(
                wait_status,
            )));
        }
        // SAFETY: `pid` is our stopped, unreaped child.
        unsafe { libc::kill(pid, libc::SIGCONT) };

        let mut report = [0u8; STATUS_LEN];
        let n = read_full(status.as_fd(), &mut report).map_err(SpawnError::Wait)?;
        if n == STATUS_LEN {
            let stage = i32::from_ne_bytes([report[0], report[1], report[2], report[3]]);
            let errno = i32::from_ne_bytes([report[4], report[5], report[6], report[7]]);
            reap_blocking(pid);
            return Err(image.failure(stage, errno));
        }

        debug!(pid, program = image.program(), "child resumed");
        Ok(ProcessHandle::with_pipes(
            Arc::new(ChildProcess::new(pid)),
            stdin,
            stdout,
            stderr,
        ))
    }
}

impl std::fmt::Debug for SuspendedChild {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SuspendedChild")
            .field("pid", &self.pid())
            .finish_non_exhaustive()
    }
}

impl Drop for SuspendedChild {
    fn drop(&mut self) {
        if let Some(parts) = self.parts.take() {
            // SAFETY: `parts.pid` is our unreaped child.
            unsafe { libc::kill(parts.pid, libc::SIGKILL) };
            reap_blocking(parts.pid);
        }
    }
}

fn wait_for_stop(pid: libc::pid_t) -> Result<libc::c_int, SpawnError> {
    let mut status: libc::c_int = 0;
    loop {
        // SAFETY: `status` is a valid out pointer.
        let ret = unsafe { libc::waitpid(pid, &mut status, libc::WUNTRACED) };
        if ret == pid {
            return Ok(status);
        }
        let err = io::Error::last_os_error();
        if err.kind() != io::ErrorKind::Interrupted {
            return Err(SpawnError::Wait(err));
        }
    }
}

pub(crate) fn reap_blocking(pid: libc::pid_t) -> Option<ExitStatus> {
    let mut status: libc::c_int = 0;
    loop {
        // SAFETY: `status` is a valid out pointer.
        let ret = unsafe { libc::waitpid(pid, &mut status, 0) };
        if ret == pid {
            return Some(ExitStatus::from_wait_status(status));
        }
        if ret == -1 && io::Error::last_os_error().kind() == io::ErrorKind::Interrupted {
            continue;
        }
        return None;
    }
}

/// Reads until `buf` is full or EOF; returns the byte count.
pub(crate) fn read_full(fd: BorrowedFd<'_>, buf: &mut [u8]) -> io::Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        let n = fd::read(fd, &mut buf[filled..])?;
        if n == 0 {
            break;
        }
        filled += n;
    }
    Ok(filled)
}

//! Pseudo-terminal allocation and the child's side of pty setup.

use std::ffi::CStr;
use std::ffi::CString;
use std::io;
#[cfg(not(any(target_os = "linux", target_os = "android")))]
use std::os::fd::AsFd;
use std::os::fd::AsRawFd;
use std::os::fd::BorrowedFd;
use std::os::fd::FromRawFd;
use std::os::fd::OwnedFd;
use std::os::fd::RawFd;

use crate::config::WindowSize;
use crate::fd;
use crate::handshake;
use crate::handshake::HandshakeMessage;
use crate::handshake::HandshakeStatus;
use crate::signal_pipe::ExecImage;
use crate::signal_pipe::reset_child_signals;

/// A freshly unlocked master plus the path of its slave device.
#[derive(Debug)]
pub(crate) struct PtyPair {
    pub(crate) master: OwnedFd,
    pub(crate) slave_path: CString,
}

/// Opens a close-on-exec master. Where the flag cannot be passed to
/// `posix_openpt`, the caller must hold the fork lock.
pub(crate) fn open_pty() -> io::Result<PtyPair> {
    #[cfg(any(target_os = "linux", target_os = "android"))]
    let flags = libc::O_RDWR | libc::O_NOCTTY | libc::O_CLOEXEC;
    #[cfg(not(any(target_os = "linux", target_os = "android")))]
    let flags = libc::O_RDWR | libc::O_NOCTTY;
    // SAFETY: posix_openpt(3) has no memory safety requirements.
    let raw = fd::cvt(unsafe { libc::posix_openpt(flags) })?;
    // SAFETY: `raw` was just returned by posix_openpt and is owned by no one else.
    let master = unsafe { OwnedFd::from_raw_fd(raw) };
    #[cfg(not(any(target_os = "linux", target_os = "android")))]
    fd::set_cloexec(master.as_fd())?;
    // SAFETY: `master` is an open pty master.
    fd::cvt(unsafe { libc::grantpt(master.as_raw_fd()) })?;
    // SAFETY: as above.
    fd::cvt(unsafe { libc::unlockpt(master.as_raw_fd()) })?;
    let slave_path = slave_name(master.as_raw_fd())?;
    Ok(PtyPair { master, slave_path })
}

#[cfg(target_os = "linux")]
fn slave_name(master: RawFd) -> io::Result<CString> {
    let mut buf = [0 as libc::c_char; 128];
    // SAFETY: `buf` is valid for `buf.len()` bytes; ptsname_r NUL terminates.
    let ret = unsafe { libc::ptsname_r(master, buf.as_mut_ptr(), buf.len()) };
    if ret != 0 {
        return Err(io::Error::from_raw_os_error(ret));
    }
    // SAFETY: ptsname_r succeeded, so `buf` holds a NUL terminated string.
    Ok(unsafe { CStr::from_ptr(buf.as_ptr()) }.to_owned())
}

#[cfg(not(target_os = "linux"))]
fn slave_name(master: RawFd) -> io::Result<CString> {
    static PTSNAME_LOCK: std::sync::Mutex<()> = std::sync::Mutex::new(());
    let _guard = crate::session::lock(&PTSNAME_LOCK);
    // SAFETY: ptsname(3) returns a static buffer, read under the lock.
    let name = unsafe { libc::ptsname(master) };
    if name.is_null() {
        return Err(io::Error::last_os_error());
    }
    // SAFETY: non-null return is a NUL terminated string.
    Ok(unsafe { CStr::from_ptr(name) }.to_owned())
}

pub(crate) fn set_window_size(fd: RawFd, window: WindowSize) -> io::Result<()> {
    let size = libc::winsize {
        ws_row: window.rows,
        ws_col: window.cols,
        ws_xpixel: 0,
        ws_ypixel: 0,
    };
    // SAFETY: `size` is a valid winsize for TIOCSWINSZ to read.
    fd::cvt(unsafe { libc::ioctl(fd, libc::TIOCSWINSZ, &size) })?;
    Ok(())
}

const fn ctrl(key: u8) -> libc::cc_t {
    (key & 0x1f) as libc::cc_t
}

/// Canonical line discipline with signal keys and without local echo; the
/// embedding application renders its own echo.
pub(crate) fn apply_terminal_defaults(tio: &mut libc::termios) {
    tio.c_iflag &= !(libc::INLCR | libc::IGNCR | libc::ISTRIP | libc::IGNBRK | libc::BRKINT);
    tio.c_iflag |= libc::ICRNL;

    tio.c_oflag &= !(libc::OCRNL | libc::ONLRET);
    tio.c_oflag |= libc::OPOST | libc::ONLCR;

    tio.c_cflag &= !libc::CSIZE;
    tio.c_cflag |= libc::CS8 | libc::CREAD | libc::HUPCL;

    tio.c_lflag |= libc::ISIG | libc::ICANON | libc::ECHOE | libc::ECHONL;
    tio.c_lflag &= !(libc::ECHO | libc::ECHOK | libc::IEXTEN);

    tio.c_cc[libc::VINTR] = ctrl(b'C');
    tio.c_cc[libc::VQUIT] = ctrl(b'\\');
    tio.c_cc[libc::VERASE] = 0x7f;
    tio.c_cc[libc::VKILL] = ctrl(b'U');
    tio.c_cc[libc::VEOF] = ctrl(b'D');
    tio.c_cc[libc::VSTART] = ctrl(b'Q');
    tio.c_cc[libc::VSTOP] = ctrl(b'S');
    tio.c_cc[libc::VSUSP] = ctrl(b'Z');
    tio.c_cc[libc::VMIN] = 1;
    tio.c_cc[libc::VTIME] = 0;
}

/// Everything between `fork` and `execve` on the child side. Failures are
/// reported over `channel` as `FAILED`, then the child exits with status 1.
///
/// # Safety
/// Must only run in a freshly forked child. Only async-signal-safe calls are
/// made; every buffer was allocated before `fork`.
pub(crate) unsafe fn child_exec(
    master: RawFd,
    slave_path: &CStr,
    channel: RawFd,
    image: &ExecImage,
) -> ! {
    // SAFETY: `channel` stays open until exec or exit.
    let channel = unsafe { BorrowedFd::borrow_raw(channel) };

    unsafe {
        libc::close(master);
        if libc::setsid() == -1 {
            fail(channel, b"failed to create a new session");
        }
        let slave = libc::open(slave_path.as_ptr(), libc::O_RDWR);
        if slave == -1 {
            fail(channel, b"failed to open the pty slave device");
        }
        if libc::ioctl(slave, libc::TIOCSCTTY as _, 0) == -1 {
            fail(channel, b"failed to acquire the controlling terminal");
        }
        reset_child_signals();
        image.apply_priority();

        let mut tio: libc::termios = std::mem::zeroed();
        if libc::tcgetattr(slave, &mut tio) == -1 {
            fail(channel, b"failed to read terminal attributes");
        }
        apply_terminal_defaults(&mut tio);

        for target in 0..=2 {
            if libc::dup2(slave, target) == -1 {
                fail(channel, b"failed to attach the pty slave to stdio");
            }
        }
        if slave > 2 {
            libc::close(slave);
        }
        if libc::tcsetattr(0, libc::TCSANOW, &tio) == -1 {
            fail(channel, b"failed to set terminal attributes");
        }

        if handshake::send(channel, &HandshakeMessage::needs_window_size()).is_err() {
            libc::_exit(1);
        }
        let reply = match handshake::recv(channel) {
            Ok(Some(reply)) => reply,
            _ => libc::_exit(1),
        };
        if reply.status() != Some(HandshakeStatus::NeedsWindowSize) {
            fail(channel, b"mismatch handshake");
        }
        if set_window_size(0, reply.window()).is_err() {
            fail(channel, b"failed to set the window size");
        }
        if libc::tcsetpgrp(0, libc::getpgrp()) == -1 {
            fail(channel, b"failed to become the foreground process group");
        }
        if image.change_dir().is_err() {
            fail(channel, b"failed to change to the working directory");
        }
        if handshake::send(channel, &HandshakeMessage::ok()).is_err() {
            libc::_exit(1);
        }

        let errno = image.execve();
        let _ = handshake::send(channel, &HandshakeMessage::exec_failed(errno));
        libc::_exit(1)
    }
}

fn fail(channel: BorrowedFd<'_>, text: &[u8]) -> ! {
    let _ = handshake::send(channel, &HandshakeMessage::failed(text));
    // SAFETY: _exit(2) is async-signal-safe and never returns.
    unsafe { libc::_exit(1) }
}

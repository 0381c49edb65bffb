//! Pseudo-terminal pairs for attach sessions.
//!
//! The master side stays in the daemon and is driven through tokio's
//! reactor; the slave side is handed to the process started in the
//! container and becomes its controlling terminal.
//!
//! # Panic-Free Guarantees
//!
//! - No `.unwrap()`, `.expect()`, `panic!()`
//! - All descriptor operations report failures as `io::Error`

use std::io;
use std::os::fd::{AsRawFd, OwnedFd, RawFd};
use std::pin::Pin;
use std::process::{ExitStatus, Stdio};
use std::task::{ready, Context, Poll};

use nix::fcntl::{fcntl, FcntlArg, FdFlag, OFlag};
use nix::pty::{openpty, OpenptyResult};
use nix::unistd;
use tokio::io::unix::AsyncFd;
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::process::Command;
use tracing::{debug, trace};

/// A freshly allocated master/slave pair.
pub struct Pty {
    master: OwnedFd,
    slave: OwnedFd,
}

impl Pty {
    /// Allocates a pseudo-terminal.
    ///
    /// Both ends are close-on-exec; the master is non-blocking.
    pub fn open() -> io::Result<Self> {
        let OpenptyResult { master, slave } = openpty(None, None).map_err(io::Error::from)?;
        set_cloexec(master.as_raw_fd())?;
        set_cloexec(slave.as_raw_fd())?;
        set_nonblocking(master.as_raw_fd())?;
        trace!(
            master = master.as_raw_fd(),
            slave = slave.as_raw_fd(),
            "Allocated pty"
        );
        Ok(Self { master, slave })
    }

    /// Splits the pair into the async master and the raw slave.
    ///
    /// Must be called from within a tokio runtime.
    pub fn into_parts(self) -> io::Result<(PtyMaster, OwnedFd)> {
        let master = PtyMaster {
            inner: AsyncFd::try_new(self.master).map_err(io::Error::from)?,
        };
        Ok((master, self.slave))
    }
}

fn set_cloexec(fd: RawFd) -> io::Result<()> {
    let flags = FdFlag::from_bits_truncate(fcntl(fd, FcntlArg::F_GETFD)?);
    fcntl(fd, FcntlArg::F_SETFD(flags | FdFlag::FD_CLOEXEC))?;
    Ok(())
}

fn set_nonblocking(fd: RawFd) -> io::Result<()> {
    let flags = OFlag::from_bits_truncate(fcntl(fd, FcntlArg::F_GETFL)?);
    fcntl(fd, FcntlArg::F_SETFL(flags | OFlag::O_NONBLOCK))?;
    Ok(())
}

// ============================================================================
// Async master
// ============================================================================

/// Master side of a pseudo-terminal as an async byte stream.
///
/// Reads return end-of-file once every slave descriptor is closed (Linux
/// reports that as `EIO`). Dropping the master hangs up the terminal.
pub struct PtyMaster {
    inner: AsyncFd<OwnedFd>,
}

impl AsyncRead for PtyMaster {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        loop {
            let mut guard = ready!(self.inner.poll_read_ready(cx))?;
            let result = guard.try_io(|inner| {
                let slice = buf.initialize_unfilled();
                unistd::read(inner.get_ref().as_raw_fd(), slice).map_err(io::Error::from)
            });
            match result {
                Ok(Ok(n)) => {
                    buf.advance(n);
                    return Poll::Ready(Ok(()));
                }
                Ok(Err(e)) if e.raw_os_error() == Some(libc::EIO) => {
                    return Poll::Ready(Ok(()));
                }
                Ok(Err(e)) if e.kind() == io::ErrorKind::Interrupted => {}
                Ok(Err(e)) => return Poll::Ready(Err(e)),
                Err(_would_block) => {}
            }
        }
    }
}

impl AsyncWrite for PtyMaster {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        loop {
            let mut guard = ready!(self.inner.poll_write_ready(cx))?;
            let result = guard.try_io(|inner| {
                unistd::write(inner.get_ref(), buf).map_err(io::Error::from)
            });
            match result {
                Ok(Ok(n)) => return Poll::Ready(Ok(n)),
                Ok(Err(e)) if e.kind() == io::ErrorKind::Interrupted => {}
                Ok(Err(e)) => return Poll::Ready(Err(e)),
                Err(_would_block) => {}
            }
        }
    }

    fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }

    fn poll_shutdown(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        // A terminal has no half-close; the hangup happens on drop.
        Poll::Ready(Ok(()))
    }
}

// ============================================================================
// Running a process on the slave
// ============================================================================

/// Runs `cmd` with `tty` as stdin, stdout, stderr and controlling terminal.
///
/// The caller's copies of the slave are closed as soon as the process is
/// spawned, so the master sees end-of-file when the process exits. The
/// process is killed if the returned future is dropped before it finishes.
pub async fn run_on_tty(mut cmd: Command, tty: OwnedFd) -> io::Result<ExitStatus> {
    cmd.stdin(Stdio::from(tty.try_clone()?))
        .stdout(Stdio::from(tty.try_clone()?))
        .stderr(Stdio::from(tty.try_clone()?))
        .kill_on_drop(true);

    // SAFETY: only async-signal-safe calls between fork and exec.
    unsafe {
        cmd.pre_exec(|| {
            if libc::setsid() < 0 {
                return Err(io::Error::last_os_error());
            }
            if libc::ioctl(libc::STDIN_FILENO, libc::TIOCSCTTY as _, 0) < 0 {
                return Err(io::Error::last_os_error());
            }
            Ok(())
        });
    }

    let mut child = cmd.spawn()?;
    drop(cmd);
    drop(tty);

    debug!(pid = ?child.id(), "Process started on pty");
    child.wait().await
}

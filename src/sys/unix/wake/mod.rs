use std::io;
use std::os::fd::RawFd;
use std::process;
use std::sync::atomic::{AtomicI32, Ordering};

#[cfg(feature = "log")]
use log::{error, trace};

#[cfg(all(
    not(eloop_force_wake_pipe),
    any(target_os = "linux", target_os = "android")
))]
mod eventfd;
#[cfg(all(
    not(eloop_force_wake_pipe),
    any(target_os = "linux", target_os = "android")
))]
use self::eventfd::open_fds;

#[cfg(any(
    eloop_force_wake_pipe,
    not(any(target_os = "linux", target_os = "android"))
))]
mod pipe;
#[cfg(any(
    eloop_force_wake_pipe,
    not(any(target_os = "linux", target_os = "android"))
))]
use self::pipe::open_fds;

/// The per-loop kernel primitive used to rouse the loop from its blocking
/// poll in response to a cross-thread signal.
///
/// Backed by an `eventfd` counter where available (`wfd` is `-1` and reads
/// and writes share the descriptor) and by a non-blocking close-on-exec
/// pipe pair otherwise. The descriptors are held in atomic cells so that
/// the post-fork hook can swap them in place while senders on other
/// threads keep loading them without a lock; a sender never holds a
/// descriptor across a suspension point, only across one `write(2)`.
#[derive(Debug)]
pub(crate) struct WakeChannel {
    rfd: AtomicI32,
    wfd: AtomicI32,
}

impl WakeChannel {
    pub(crate) fn open() -> io::Result<WakeChannel> {
        let [rfd, wfd] = open_fds()?;
        #[cfg(feature = "log")]
        trace!("wake channel open: rfd={}, wfd={}", rfd, wfd);
        Ok(WakeChannel {
            rfd: AtomicI32::new(rfd),
            wfd: AtomicI32::new(wfd),
        })
    }

    /// The descriptor the loop registers for read interest.
    pub(crate) fn rfd(&self) -> RawFd {
        self.rfd.load(Ordering::Acquire)
    }

    /// Rouse the loop thread. Callable from any thread, and from signal
    /// handlers that can tolerate a `write` syscall.
    ///
    /// Infallible from the caller's perspective: a full pipe means the
    /// loop has unobserved signals queued already, which is success.
    /// Anything else the kernel reports here breaks the channel contract
    /// and aborts.
    pub(crate) fn wake(&self) {
        let counter_buf: [u8; 8] = 1u64.to_ne_bytes();
        let byte_buf: [u8; 1] = [0];

        let wfd = self.wfd.load(Ordering::Acquire);
        let (fd, buf, len) = if wfd == -1 {
            // Counter descriptor: an 8-byte increment on the read side.
            (self.rfd.load(Ordering::Acquire), counter_buf.as_ptr(), 8)
        } else {
            (wfd, byte_buf.as_ptr(), 1)
        };

        loop {
            let n = unsafe { libc::write(fd, buf as *const libc::c_void, len) };
            if n == len as isize {
                return;
            }

            if n == -1 {
                let err = io::Error::last_os_error();
                match err.raw_os_error() {
                    Some(libc::EINTR) => continue,
                    Some(code) if code == libc::EAGAIN || code == libc::EWOULDBLOCK => return,
                    _ => {
                        #[cfg(feature = "log")]
                        error!("wake channel write failed: {}", err);
                    }
                }
            }
            // Partial writes do not happen on a pipe byte or an eventfd
            // counter; treat them like unknown errno.
            process::abort();
        }
    }

    /// Drain the read side. Loop thread only, called on read readiness.
    ///
    /// Keeps reading while full buffers come back so that any number of
    /// queued signals collapses into this one readiness callback.
    pub(crate) fn drain(&self) {
        let fd = self.rfd.load(Ordering::Acquire);
        let mut buf = [0u8; 1024];

        loop {
            let n = unsafe { libc::read(fd, buf.as_mut_ptr() as *mut libc::c_void, buf.len()) };
            if n == buf.len() as isize {
                continue;
            }
            if n != -1 {
                return;
            }

            let err = io::Error::last_os_error();
            match err.raw_os_error() {
                Some(libc::EINTR) => continue,
                Some(code) if code == libc::EAGAIN || code == libc::EWOULDBLOCK => return,
                _ => {
                    #[cfg(feature = "log")]
                    error!("wake channel read failed: {}", err);
                    process::abort();
                }
            }
        }
    }

    /// Replace the descriptors after a fork.
    ///
    /// The inherited descriptors are shared with the parent and a wake
    /// written to them would rouse the parent's loop; close them and open
    /// a fresh pair in place. Runs on the only thread alive in the child,
    /// so the swap does not race senders.
    pub(crate) fn reopen(&self) -> io::Result<()> {
        self.close_fds();
        let [rfd, wfd] = open_fds()?;
        self.rfd.store(rfd, Ordering::Release);
        self.wfd.store(wfd, Ordering::Release);
        Ok(())
    }

    fn close_fds(&self) {
        let wfd = self.wfd.swap(-1, Ordering::AcqRel);
        let rfd = self.rfd.swap(-1, Ordering::AcqRel);
        if wfd != -1 && wfd != rfd {
            unsafe { libc::close(wfd) };
        }
        if rfd != -1 {
            unsafe { libc::close(rfd) };
        }
    }
}

impl Drop for WakeChannel {
    fn drop(&mut self) {
        self.close_fds();
    }
}

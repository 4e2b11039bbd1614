//! # Wakeup and Readiness Wait
//!
//! ## Purpose
//!
//! With `XDP_USE_NEED_WAKEUP` the kernel stops polling a ring when it runs
//! dry and sets `XDP_RING_NEED_WAKEUP` in the ring flags; the application
//! must then kick it with a syscall. Independently, an application that
//! prefers low CPU usage over latency can park in `wait` until the socket
//! becomes readable or writable.
//!
//! ## How it works
//!
//! - `kick_tx` is a zero-length `sendto`, `kick_rx` a zero-length `recvfrom`,
//!   both non-blocking. `EBUSY`, `ENOBUFS` and `EAGAIN` only mean the kernel is
//!   already working; `ENETDOWN` is logged.
//! - `wait` polls the socket together with the eventfd of the socket's
//!   `CloseHandle`, so closing the socket from another thread unblocks the
//!   waiter with `XskError::Closed`.
//!
//! ## Main components
//!
//! - `Socket::kick()`, `Socket::wait()`.
//! - `CloseHandle`: cloneable, `Send` cancellation handle.
//! - `Interest`, `Readiness`.

use crate::arena::FramePool;
use crate::error::{Result, XskError};
use crate::socket::Socket;
use std::mem::size_of;
use std::os::fd::{AsRawFd as _, FromRawFd as _, OwnedFd, RawFd};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};
use std::{io, ptr};

/// What `wait` should wait for.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum Interest {
    /// RX descriptors are available.
    Readable,
    /// The TX ring has room.
    Writable,
    Both,
}

impl Interest {
    fn events(&self) -> libc::c_short {
        match self {
            Interest::Readable => libc::POLLIN,
            Interest::Writable => libc::POLLOUT,
            Interest::Both => libc::POLLIN | libc::POLLOUT,
        }
    }
}

/// Outcome of a `wait` that was not cancelled.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum Readiness {
    Ready,
    TimedOut,
}

struct CloseInner {
    event: OwnedFd,
    requested: AtomicBool,
}

/// Requests a socket to stop waiting. Cheap to clone and safe to use from
/// any thread.
#[derive(Clone)]
pub struct CloseHandle(Arc<CloseInner>);

impl CloseHandle {
    pub(crate) fn new() -> io::Result<Self> {
        let fd = unsafe { libc::eventfd(0, libc::EFD_CLOEXEC | libc::EFD_NONBLOCK) };
        if fd < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(CloseHandle(Arc::new(CloseInner {
            event: unsafe { OwnedFd::from_raw_fd(fd) },
            requested: AtomicBool::new(false),
        })))
    }

    /// Wakes every current waiter; later waits, receives and sends fail with
    /// `Closed`. The owner still has to call `Socket::close` to drain.
    pub fn close(&self) {
        if self.0.requested.swap(true, Ordering::AcqRel) {
            return;
        }
        let one: u64 = 1;
        let ret = unsafe {
            libc::write(
                self.0.event.as_raw_fd(),
                &one as *const u64 as *const libc::c_void,
                size_of::<u64>(),
            )
        };
        if ret < 0 {
            log::error!(
                "failed to signal close event: {}",
                io::Error::last_os_error()
            );
        }
    }

    pub fn is_closed(&self) -> bool {
        self.0.requested.load(Ordering::Acquire)
    }

    fn raw_fd(&self) -> RawFd {
        self.0.event.as_raw_fd()
    }
}

impl<P: FramePool> Socket<P> {
    /// Wakes the kernel for every ring that asked for it.
    pub fn kick(&mut self) -> Result<()> {
        let (rx, tx) = match self.rings.as_ref() {
            Some(rings) => (
                rings.fill.as_ref().is_some_and(|r| r.needs_wakeup()),
                rings.tx.as_ref().is_some_and(|r| r.needs_wakeup()),
            ),
            None => return Ok(()),
        };
        if rx {
            self.stats.rx_wakeup += 1;
            self.kick_rx()?;
        }
        if tx {
            self.stats.tx_wakeup += 1;
            self.kick_tx()?;
        }
        Ok(())
    }

    pub(crate) fn kick_tx(&self) -> Result<()> {
        let Some(fd) = self.raw_fd() else {
            return Ok(());
        };
        let ret = unsafe {
            libc::sendto(
                fd,
                ptr::null(),
                0,
                libc::MSG_DONTWAIT | libc::MSG_NOSIGNAL,
                ptr::null(),
                0,
            )
        };
        check_wakeup(ret)
    }

    pub(crate) fn kick_rx(&self) -> Result<()> {
        let Some(fd) = self.raw_fd() else {
            return Ok(());
        };
        let ret = unsafe {
            libc::recvfrom(
                fd,
                ptr::null_mut(),
                0,
                libc::MSG_DONTWAIT,
                ptr::null_mut(),
                ptr::null_mut(),
            )
        };
        check_wakeup(ret)
    }

    /// Blocks until the socket is ready for `interest`, the timeout expires
    /// or the socket is closed through its `CloseHandle`.
    ///
    /// `None` waits without a timeout. Rings asking for a wakeup are kicked
    /// before parking.
    pub fn wait(&mut self, interest: Interest, timeout: Option<Duration>) -> Result<Readiness> {
        self.ensure_active()?;
        self.kick()?;

        let deadline = timeout.map(|t| Instant::now() + t);
        let events = interest.events();
        let close_fd = self.closer.raw_fd();
        loop {
            let mut fds = [
                libc::pollfd {
                    // a negative fd is ignored by poll
                    fd: self.raw_fd().unwrap_or(-1),
                    events,
                    revents: 0,
                },
                libc::pollfd {
                    fd: close_fd,
                    events: libc::POLLIN,
                    revents: 0,
                },
            ];
            let timeout_ms = match deadline {
                None => -1,
                Some(deadline) => {
                    let left = deadline.saturating_duration_since(Instant::now());
                    left.as_millis().min(i32::MAX as u128) as libc::c_int
                }
            };
            let ret = unsafe { libc::poll(fds.as_mut_ptr(), fds.len() as libc::nfds_t, timeout_ms) };
            if ret < 0 {
                let err = io::Error::last_os_error();
                if err.kind() == io::ErrorKind::Interrupted {
                    continue;
                }
                return Err(err.into());
            }
            if fds[1].revents != 0 || self.closer.is_closed() {
                return Err(XskError::Closed);
            }
            if fds[0].revents & (events | libc::POLLERR | libc::POLLHUP) != 0 {
                return Ok(Readiness::Ready);
            }
            if ret == 0 {
                return Ok(Readiness::TimedOut);
            }
        }
    }
}

fn check_wakeup(ret: isize) -> Result<()> {
    if ret >= 0 {
        return Ok(());
    }
    match io::Error::last_os_error().raw_os_error() {
        None | Some(libc::EBUSY | libc::ENOBUFS | libc::EAGAIN) => Ok(()),
        Some(libc::ENETDOWN) => {
            log::warn!("network interface is down, cannot wake up the socket");
            Ok(())
        }
        Some(e) => Err(io::Error::from_raw_os_error(e).into()),
    }
}

//! Eventfd doorbell for waking the peer's real-time thread.
//!
//! A doorbell carries no data. `signal()` bumps the counter; the waiter drains
//! it and then rescans its ring, so any number of signals between two scans
//! collapse into one wake. Both ends are non-blocking: a full counter
//! (`EAGAIN`) means a wake is already pending.

use std::io::{self, ErrorKind};
use std::os::fd::{AsFd, AsRawFd, BorrowedFd, FromRawFd, OwnedFd, RawFd};
use std::time::Duration;
use tracing::trace;

use crate::error::{NodeError, Result};

pub struct Doorbell {
    fd: OwnedFd,
}

impl std::fmt::Debug for Doorbell {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_tuple("Doorbell").field(&self.fd.as_raw_fd()).finish()
    }
}

fn set_nonblocking(fd: RawFd) -> io::Result<()> {
    // SAFETY: fcntl on a descriptor we own; no memory is involved.
    let flags = unsafe { libc::fcntl(fd, libc::F_GETFL) };
    if flags < 0 {
        return Err(io::Error::last_os_error());
    }
    // SAFETY: as above.
    if unsafe { libc::fcntl(fd, libc::F_SETFL, flags | libc::O_NONBLOCK) } < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

/// Outcome of a bounded wait.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Wake {
    Signalled,
    TimedOut,
}

impl Doorbell {
    /// A fresh eventfd.
    pub fn eventfd() -> io::Result<Self> {
        // SAFETY: plain syscall, result checked below.
        let raw = unsafe { libc::eventfd(0, libc::EFD_NONBLOCK | libc::EFD_CLOEXEC) };
        if raw < 0 {
            return Err(io::Error::last_os_error());
        }
        // SAFETY: eventfd just returned this descriptor to us.
        let fd = unsafe { OwnedFd::from_raw_fd(raw) };
        Ok(Self { fd })
    }

    /// Wrap a descriptor received from the peer.
    pub fn from_fd(fd: OwnedFd) -> io::Result<Self> {
        set_nonblocking(fd.as_raw_fd())?;
        Ok(Self { fd })
    }

    /// A second descriptor for the same doorbell, to hand to the peer.
    pub fn try_clone_fd(&self) -> io::Result<OwnedFd> {
        self.fd.try_clone()
    }

    /// Wake the peer.
    pub fn signal(&self) -> Result<()> {
        let token: u64 = 1;
        // SAFETY: writes 8 bytes from a live u64.
        let ret = unsafe {
            libc::write(
                self.fd.as_raw_fd(),
                &token as *const u64 as *const libc::c_void,
                std::mem::size_of::<u64>(),
            )
        };
        if ret >= 0 {
            return Ok(());
        }
        let err = io::Error::last_os_error();
        match err.kind() {
            ErrorKind::WouldBlock => {
                trace!("doorbell already pending");
                Ok(())
            }
            ErrorKind::Interrupted => self.signal(),
            _ => Err(NodeError::Transport(format!("doorbell signal: {err}"))),
        }
    }

    /// Consume pending wakes. Returns how many signals were coalesced.
    pub fn drain(&self) -> Result<u64> {
        let mut count: u64 = 0;
        // SAFETY: reads 8 bytes into a live u64.
        let ret = unsafe {
            libc::read(
                self.fd.as_raw_fd(),
                &mut count as *mut u64 as *mut libc::c_void,
                std::mem::size_of::<u64>(),
            )
        };
        if ret >= 0 {
            return Ok(count);
        }
        let err = io::Error::last_os_error();
        match err.kind() {
            ErrorKind::WouldBlock => Ok(0),
            ErrorKind::Interrupted => self.drain(),
            _ => Err(NodeError::Transport(format!("doorbell drain: {err}"))),
        }
    }

    /// Block the calling thread until signalled or `timeout` passes.
    ///
    /// Does not drain; callers drain and rescan.
    pub fn wait(&self, timeout: Option<Duration>) -> Result<Wake> {
        let mut fds = [libc::pollfd {
            fd: self.fd.as_raw_fd(),
            events: libc::POLLIN,
            revents: 0,
        }];
        match poll(&mut fds, timeout)? {
            0 => Ok(Wake::TimedOut),
            _ if fds[0].revents & (libc::POLLERR | libc::POLLHUP | libc::POLLNVAL) != 0 => Err(
                NodeError::Transport(format!("doorbell revents {:#x}", fds[0].revents)),
            ),
            _ => Ok(Wake::Signalled),
        }
    }
}

/// `poll(2)` retrying on `EINTR`. Returns the number of ready descriptors.
pub(crate) fn poll(fds: &mut [libc::pollfd], timeout: Option<Duration>) -> Result<usize> {
    let ms = timeout
        .map(|t| t.as_millis().min(i32::MAX as u128) as libc::c_int)
        .unwrap_or(-1);
    loop {
        // SAFETY: `fds` is a live slice of pollfd for the duration of the call.
        let ret = unsafe { libc::poll(fds.as_mut_ptr(), fds.len() as libc::nfds_t, ms) };
        if ret >= 0 {
            return Ok(ret as usize);
        }
        let err = io::Error::last_os_error();
        if err.kind() != ErrorKind::Interrupted {
            return Err(NodeError::Transport(format!("poll: {err}")));
        }
    }
}

impl AsRawFd for Doorbell {
    fn as_raw_fd(&self) -> RawFd {
        self.fd.as_raw_fd()
    }
}

impl AsFd for Doorbell {
    fn as_fd(&self) -> BorrowedFd<'_> {
        self.fd.as_fd()
    }
}

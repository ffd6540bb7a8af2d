// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 natyamatsya contributors
//
// Per-queue-pair event notifier. Backed by a Linux eventfd so the handle
// is a plain file descriptor that can be passed to a peer as SCM_RIGHTS
// ancillary data over the control channel (see control.rs), the same way
// this crate already treats named kernel objects (shm, mutex) as
// resources acquired via a raw syscall and wrapped in an owning struct.

use std::io;
use std::os::unix::io::{AsRawFd, FromRawFd, IntoRawFd, RawFd};

/// Whether this process created the notifier (and must close/forget it
/// according to local policy) or received it from a peer over the
/// control channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NotifierOwnership {
    Local,
    Borrowed,
}

/// A single wake handle for one rx or tx ring.
pub struct Notifier {
    fd: RawFd,
    ownership: NotifierOwnership,
}

impl Notifier {
    /// Create a new local eventfd-backed notifier, initial count zero,
    /// non-blocking so `drain` never stalls the progress loop.
    pub fn create() -> io::Result<Self> {
        let fd = unsafe { libc::eventfd(0, libc::EFD_NONBLOCK | libc::EFD_CLOEXEC) };
        if fd < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(Self {
            fd,
            ownership: NotifierOwnership::Local,
        })
    }

    /// Wrap a descriptor received from a peer (e.g. via SCM_RIGHTS). The
    /// wrapper owns the fd (it will be closed on drop) but is marked
    /// borrowed for bookkeeping: the peer, not this process, is the
    /// notifier's logical creator.
    ///
    /// # Safety
    /// `fd` must be a valid, open file descriptor not owned elsewhere.
    pub unsafe fn from_raw_borrowed(fd: RawFd) -> Self {
        Self {
            fd,
            ownership: NotifierOwnership::Borrowed,
        }
    }

    pub fn ownership(&self) -> NotifierOwnership {
        self.ownership
    }

    /// Signal the notifier once.
    pub fn signal(&self) -> io::Result<()> {
        let buf: u64 = 1;
        let rc = unsafe {
            libc::write(self.fd, &buf as *const u64 as *const libc::c_void, 8)
        };
        if rc < 0 {
            let err = io::Error::last_os_error();
            if err.raw_os_error() == Some(libc::EAGAIN) {
                return Ok(());
            }
            return Err(err);
        }
        Ok(())
    }

    /// Drain any pending signal. Returns `true` if the notifier had been
    /// signalled since the last drain.
    pub fn drain(&self) -> io::Result<bool> {
        let mut buf: u64 = 0;
        let rc = unsafe {
            libc::read(self.fd, &mut buf as *mut u64 as *mut libc::c_void, 8)
        };
        if rc < 0 {
            let err = io::Error::last_os_error();
            if err.raw_os_error() == Some(libc::EAGAIN) {
                return Ok(false);
            }
            return Err(err);
        }
        Ok(true)
    }
}

impl AsRawFd for Notifier {
    fn as_raw_fd(&self) -> RawFd {
        self.fd
    }
}

impl FromRawFd for Notifier {
    unsafe fn from_raw_fd(fd: RawFd) -> Self {
        Self::from_raw_borrowed(fd)
    }
}

impl IntoRawFd for Notifier {
    fn into_raw_fd(self) -> RawFd {
        let fd = self.fd;
        std::mem::forget(self);
        fd
    }
}

impl Drop for Notifier {
    fn drop(&mut self) {
        unsafe {
            libc::close(self.fd);
        }
    }
}

unsafe impl Send for Notifier {}
unsafe impl Sync for Notifier {}

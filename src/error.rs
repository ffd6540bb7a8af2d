// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 natyamatsya contributors
//
// Structured error taxonomy for the shared-memory endpoint stack.
// Classifies std::io::Error by raw_os_error() the way the rest of this
// crate wraps individual POSIX syscalls.

use std::io;
use thiserror::Error;

/// Errors surfaced by endpoints, the control channel, and RMA transfers.
#[derive(Debug, Error)]
pub enum Error {
    #[error("permission denied")]
    PermissionDenied,

    #[error("no such entry")]
    NoEntry,

    #[error("interrupted")]
    Interrupted,

    /// Transient back-pressure. Internal resolve/reserve call sites treat
    /// this as a retry signal rather than surfacing it to the caller;
    /// it only reaches a caller when returned from a non-retrying path.
    #[error("resource temporarily unavailable")]
    Again,

    #[error("out of memory")]
    OutOfMemory,

    #[error("access denied")]
    AccessDenied,

    #[error("invalid argument")]
    BadArgument,

    #[error("bad address")]
    BadAddress,

    #[error("resource busy")]
    Busy,

    #[error("already exists")]
    AlreadyExists,

    #[error("no such device")]
    NoDevice,

    #[error("value too large")]
    Overflow,

    #[error("message too large for a single buffer slot")]
    MessageSize,

    #[error("protocol not supported")]
    ProtocolNotSupported,

    #[error("operation not supported on this platform")]
    OperationNotSupported,

    #[error("address already in use")]
    AddressInUse,

    #[error("address not available")]
    AddressNotAvailable,

    #[error("operation timed out")]
    Timeout,

    #[error("operation canceled")]
    Canceled,

    #[error("protocol error: {0}")]
    Protocol(String),
}

impl Error {
    /// Classify a raw OS error the way this crate already maps errno values
    /// for shared-memory and mutex syscalls, but returning a taxonomy
    /// variant instead of bubbling up `io::Error` directly.
    pub fn from_errno(eno: i32) -> Self {
        match eno {
            libc::EPERM => Error::PermissionDenied,
            libc::ENOENT => Error::NoEntry,
            libc::EINTR => Error::Interrupted,
            libc::EAGAIN => Error::Again,
            libc::ENOMEM => Error::OutOfMemory,
            libc::EACCES => Error::AccessDenied,
            libc::EINVAL => Error::BadArgument,
            libc::EFAULT => Error::BadAddress,
            libc::EBUSY => Error::Busy,
            libc::EEXIST => Error::AlreadyExists,
            libc::ENODEV => Error::NoDevice,
            libc::EOVERFLOW | libc::ENAMETOOLONG => Error::Overflow,
            libc::EMSGSIZE => Error::MessageSize,
            libc::EPROTONOSUPPORT => Error::ProtocolNotSupported,
            libc::EOPNOTSUPP => Error::OperationNotSupported,
            libc::EADDRINUSE => Error::AddressInUse,
            libc::EADDRNOTAVAIL => Error::AddressNotAvailable,
            libc::ETIMEDOUT => Error::Timeout,
            libc::ETOOMANYREFS => Error::Again,
            other => Error::Protocol(format!("errno {other}")),
        }
    }

    /// True for conditions that an internal retry loop should treat as
    /// "try again later" rather than a hard failure.
    pub fn is_again(&self) -> bool {
        matches!(self, Error::Again)
    }
}

impl From<io::Error> for Error {
    fn from(e: io::Error) -> Self {
        match e.raw_os_error() {
            Some(eno) => Error::from_errno(eno),
            None => Error::Protocol(e.to_string()),
        }
    }
}

impl From<Error> for io::Error {
    fn from(e: Error) -> Self {
        match e {
            Error::Again => io::Error::from_raw_os_error(libc::EAGAIN),
            Error::Timeout => io::Error::new(io::ErrorKind::TimedOut, e.to_string()),
            other => io::Error::other(other.to_string()),
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;

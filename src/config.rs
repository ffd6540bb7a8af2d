// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 natyamatsya contributors
//
// Endpoint configuration. No file or environment parsing: this is a
// library, callers build the struct directly the way the rest of this
// crate's public API takes plain option structs rather than config files.

use std::io;

/// Default prefix used to namespace every SHM object and control-socket
/// path this crate creates, unless overridden.
pub const DEFAULT_SHM_PREFIX: &str = "smep";

/// Hard ceiling on `EndpointOptions::max_contexts`, independent of whatever
/// the process `RLIMIT_NOFILE` allows.
pub const MAX_CONTEXTS_CEILING: u32 = 4096;

/// Caller-supplied endpoint configuration.
#[derive(Debug, Clone)]
pub struct EndpointOptions {
    /// Disable the poll set and event notifiers; callers must drive
    /// progress by polling explicitly instead of blocking.
    pub no_wait: bool,
    /// Upper bound on per-endpoint execution contexts (operation-queue
    /// depth hint). Validated against [`MAX_CONTEXTS_CEILING`].
    pub max_contexts: u32,
    /// Prefix used in every namespaced SHM and socket path this endpoint
    /// creates or resolves.
    pub shm_prefix: String,
}

impl Default for EndpointOptions {
    fn default() -> Self {
        Self {
            no_wait: false,
            max_contexts: 256,
            shm_prefix: DEFAULT_SHM_PREFIX.to_string(),
        }
    }
}

impl EndpointOptions {
    /// Validate option values, clamping `max_contexts` to the hard ceiling
    /// and rejecting an empty prefix.
    pub fn validate(&self) -> crate::error::Result<()> {
        if self.shm_prefix.is_empty() {
            return Err(crate::error::Error::BadArgument);
        }
        if self.max_contexts == 0 || self.max_contexts > MAX_CONTEXTS_CEILING {
            return Err(crate::error::Error::BadArgument);
        }
        Ok(())
    }
}

/// Read the soft limit on open file descriptors for the current process.
///
/// Read once at endpoint-open time, mirroring the direct libc-syscall style
/// this crate already uses for shared-memory and mutex setup rather than
/// going through a config file or environment variable.
#[cfg(unix)]
pub fn fd_ceiling() -> io::Result<u64> {
    let mut rl: libc::rlimit = unsafe { std::mem::zeroed() };
    let rc = unsafe { libc::getrlimit(libc::RLIMIT_NOFILE, &mut rl) };
    if rc != 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(rl.rlim_cur as u64)
}

#[cfg(not(unix))]
pub fn fd_ceiling() -> io::Result<u64> {
    Ok(u64::MAX)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_options_are_valid() {
        assert!(EndpointOptions::default().validate().is_ok());
    }

    #[test]
    fn empty_prefix_is_rejected() {
        let mut opts = EndpointOptions::default();
        opts.shm_prefix.clear();
        assert!(opts.validate().is_err());
    }

    #[test]
    fn max_contexts_above_ceiling_is_rejected() {
        let mut opts = EndpointOptions::default();
        opts.max_contexts = MAX_CONTEXTS_CEILING + 1;
        assert!(opts.validate().is_err());
    }

    #[cfg(unix)]
    #[test]
    fn fd_ceiling_reads_a_positive_limit() {
        assert!(fd_ceiling().unwrap() > 0);
    }
}

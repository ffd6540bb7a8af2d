// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 natyamatsya contributors
//
// Best-effort sweep of stragglers under the per-user control-socket tree.
// Mirrors the teardown-on-drop philosophy of ShmHandle/PlatformShm: files
// in use by live processes are left alone, everything else is removed.

use std::path::Path;

use crate::config::DEFAULT_SHM_PREFIX;

/// Remove every endpoint directory under `<tmp>/<shm_prefix>_<user>/` whose
/// control socket is no longer connectable (`ENOENT`/`ECONNREFUSED`).
///
/// Best-effort: failures to remove an individual entry are logged and
/// skipped rather than aborting the sweep.
pub fn sweep(shm_prefix: &str, user: &str) {
    let tmp = std::env::temp_dir();
    let root = tmp.join(format!("{shm_prefix}_{user}"));
    let Ok(pids) = std::fs::read_dir(&root) else { return };

    for pid_entry in pids.flatten() {
        let pid_dir = pid_entry.path();
        let Ok(instances) = std::fs::read_dir(&pid_dir) else { continue };
        let mut any_live = false;
        for instance_entry in instances.flatten() {
            let instance_dir = instance_entry.path();
            let sock = instance_dir.join("sock");
            if is_stale(&sock) {
                log::debug!("cleanup: removing stale endpoint dir {:?}", instance_dir);
                let _ = std::fs::remove_dir_all(&instance_dir);
            } else {
                any_live = true;
            }
        }
        if !any_live {
            let _ = std::fs::remove_dir(&pid_dir);
        }
    }
}

fn is_stale(sock_path: &Path) -> bool {
    if !sock_path.exists() {
        return true;
    }
    match std::os::unix::net::UnixDatagram::unbound() {
        Ok(probe) => {
            let connected = probe.connect(sock_path).is_ok();
            // A seqpacket socket accepts `connect` even with nobody
            // listening for datagram sockets in some configurations, so
            // this is advisory; genuine staleness (missing parent
            // directory, dangling inode) is the primary signal.
            !connected && !sock_path.exists()
        }
        Err(_) => false,
    }
}

/// Sweep using the default prefix and the current user.
pub fn sweep_default() {
    let user = std::env::var("USER").unwrap_or_else(|_| "user".to_string());
    sweep(DEFAULT_SHM_PREFIX, &user);
}

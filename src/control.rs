// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 natyamatsya contributors
//
// Control channel: one SOCK_SEQPACKET AF_UNIX socket per endpoint carrying
// command headers plus, when establishing a peer, two file descriptors
// (tx-notify, rx-notify) as SCM_RIGHTS ancillary data. The aligned
// control-message buffer and manual cmsghdr/CMSG_SPACE/CMSG_LEN/CMSG_DATA
// construction follow the same pattern this crate's corpus uses for
// ancillary-data exchange (adapted here from IP_PKTINFO to SCM_RIGHTS).

use std::io;
use std::mem;
use std::os::unix::io::RawFd;
use std::os::unix::net::UnixDatagram;
use std::path::{Path, PathBuf};

use crate::error::{Error, Result};
use crate::header::CommandHeader;

const MAX_FDS: usize = 2;

/// Control-message buffer sized for up to two passed descriptors, aligned
/// to `cmsghdr`'s natural alignment the way an ordinary `[u8; N]` is not
/// guaranteed to be.
#[repr(align(8))]
struct AlignedCmsgBuf([u8; cmsg_space_const(MAX_FDS)]);

const fn cmsg_space_const(n: usize) -> usize {
    // CMSG_SPACE(n * sizeof(RawFd)) computed without relying on libc's
    // non-const macro expansion.
    let payload = n * mem::size_of::<RawFd>();
    let aligned_payload = (payload + mem::size_of::<usize>() - 1) & !(mem::size_of::<usize>() - 1);
    let hdr = mem::size_of::<libc::cmsghdr>();
    let aligned_hdr = (hdr + mem::size_of::<usize>() - 1) & !(mem::size_of::<usize>() - 1);
    aligned_hdr + aligned_payload
}

/// Build the namespaced directory `<tmp>/<shm_prefix>_<user>/<pid>/<instance>/`.
pub fn endpoint_dir(tmp: &Path, shm_prefix: &str, user: &str, pid: u32, instance: u8) -> PathBuf {
    tmp.join(format!("{shm_prefix}_{user}"))
        .join(pid.to_string())
        .join(instance.to_string())
}

/// A received command datagram: the header plus any passed descriptors.
pub struct ReceivedCommand {
    pub header: CommandHeader,
    pub fds: Vec<RawFd>,
}

/// One endpoint's control-channel socket.
pub struct ControlChannel {
    sock: UnixDatagram,
    path: Option<PathBuf>,
}

impl ControlChannel {
    /// Create a bound, non-blocking seqpacket socket at `path` (listener
    /// side).
    pub fn bind(path: &Path) -> io::Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let _ = std::fs::remove_file(path);
        let fd = unsafe { libc::socket(libc::AF_UNIX, libc::SOCK_SEQPACKET, 0) };
        if fd < 0 {
            return Err(io::Error::last_os_error());
        }
        let sock = unsafe { <UnixDatagram as std::os::unix::io::FromRawFd>::from_raw_fd(fd) };
        bind_path(&sock, path)?;
        sock.set_nonblocking(true)?;
        Ok(Self {
            sock,
            path: Some(path.to_path_buf()),
        })
    }

    /// Create an unbound, non-blocking seqpacket socket (non-listener
    /// side; only used to `send_to` a listener's bound path).
    pub fn unbound() -> io::Result<Self> {
        let fd = unsafe { libc::socket(libc::AF_UNIX, libc::SOCK_SEQPACKET, 0) };
        if fd < 0 {
            return Err(io::Error::last_os_error());
        }
        let sock = unsafe { <UnixDatagram as std::os::unix::io::FromRawFd>::from_raw_fd(fd) };
        sock.set_nonblocking(true)?;
        Ok(Self { sock, path: None })
    }

    pub fn as_raw_fd(&self) -> RawFd {
        use std::os::unix::io::AsRawFd;
        self.sock.as_raw_fd()
    }

    /// Send a command header with no ancillary descriptors.
    pub fn send_header(&self, dest: &Path, header: CommandHeader) -> Result<()> {
        self.send(dest, header, &[])
    }

    /// Send a command header plus up to two descriptors (e.g. during
    /// resolve, {tx_notify, rx_notify}).
    pub fn send(&self, dest: &Path, header: CommandHeader, fds: &[RawFd]) -> Result<()> {
        debug_assert!(fds.len() <= MAX_FDS);
        let packed = header.encode();
        let iov = libc::iovec {
            iov_base: &packed as *const u64 as *mut libc::c_void,
            iov_len: mem::size_of::<u64>(),
        };

        let dest_cstr = std::ffi::CString::new(dest.as_os_str().as_encoded_bytes())
            .map_err(|_| Error::BadArgument)?;
        let mut addr: libc::sockaddr_un = unsafe { mem::zeroed() };
        addr.sun_family = libc::AF_UNIX as libc::sa_family_t;
        let bytes = dest_cstr.as_bytes_with_nul();
        if bytes.len() > addr.sun_path.len() {
            return Err(Error::Overflow);
        }
        for (i, b) in bytes.iter().enumerate() {
            addr.sun_path[i] = *b as libc::c_char;
        }

        let mut cmsg_buf = AlignedCmsgBuf([0u8; cmsg_space_const(MAX_FDS)]);
        let mut msg: libc::msghdr = unsafe { mem::zeroed() };
        msg.msg_name = &mut addr as *mut _ as *mut libc::c_void;
        msg.msg_namelen = mem::size_of::<libc::sockaddr_un>() as u32;
        msg.msg_iov = &iov as *const _ as *mut libc::iovec;
        msg.msg_iovlen = 1;

        if !fds.is_empty() {
            let space = unsafe { libc::CMSG_SPACE((fds.len() * mem::size_of::<RawFd>()) as u32) } as usize;
            msg.msg_control = cmsg_buf.0.as_mut_ptr() as *mut libc::c_void;
            msg.msg_controllen = space;
            unsafe {
                let cmsg = libc::CMSG_FIRSTHDR(&msg);
                (*cmsg).cmsg_level = libc::SOL_SOCKET;
                (*cmsg).cmsg_type = libc::SCM_RIGHTS;
                (*cmsg).cmsg_len = libc::CMSG_LEN((fds.len() * mem::size_of::<RawFd>()) as u32) as usize;
                std::ptr::copy_nonoverlapping(
                    fds.as_ptr(),
                    libc::CMSG_DATA(cmsg) as *mut RawFd,
                    fds.len(),
                );
            }
        }

        let rc = unsafe { libc::sendmsg(self.as_raw_fd(), &msg, 0) };
        if rc < 0 {
            let err = io::Error::last_os_error();
            return Err(Error::from(err));
        }
        Ok(())
    }

    /// Receive one command datagram, if any is pending. Returns `None`
    /// on `EAGAIN` (nothing to receive).
    pub fn try_recv(&self) -> Result<Option<ReceivedCommand>> {
        let mut packed: u64 = 0;
        let iov = libc::iovec {
            iov_base: &mut packed as *mut u64 as *mut libc::c_void,
            iov_len: mem::size_of::<u64>(),
        };
        let mut cmsg_buf = AlignedCmsgBuf([0u8; cmsg_space_const(MAX_FDS)]);
        let mut msg: libc::msghdr = unsafe { mem::zeroed() };
        msg.msg_iov = &iov as *const _ as *mut libc::iovec;
        msg.msg_iovlen = 1;
        msg.msg_control = cmsg_buf.0.as_mut_ptr() as *mut libc::c_void;
        msg.msg_controllen = cmsg_buf.0.len();

        let rc = unsafe { libc::recvmsg(self.as_raw_fd(), &mut msg, 0) };
        if rc < 0 {
            let err = io::Error::last_os_error();
            if err.raw_os_error() == Some(libc::EAGAIN) {
                return Ok(None);
            }
            return Err(Error::from(err));
        }
        if rc == 0 {
            // Empty/malformed datagram from a misbehaving peer; ignore.
            return Ok(None);
        }

        let header = match CommandHeader::decode(packed) {
            Some(h) => h,
            None => return Ok(None),
        };

        let mut fds = Vec::new();
        unsafe {
            let mut cmsg = libc::CMSG_FIRSTHDR(&msg);
            while !cmsg.is_null() {
                if (*cmsg).cmsg_level == libc::SOL_SOCKET && (*cmsg).cmsg_type == libc::SCM_RIGHTS {
                    let n = ((*cmsg).cmsg_len - libc::CMSG_LEN(0) as usize) / mem::size_of::<RawFd>();
                    let data = libc::CMSG_DATA(cmsg) as *const RawFd;
                    for i in 0..n {
                        fds.push(*data.add(i));
                    }
                }
                cmsg = libc::CMSG_NXTHDR(&msg, cmsg);
            }
        }

        Ok(Some(ReceivedCommand { header, fds }))
    }
}

fn bind_path(sock: &UnixDatagram, path: &Path) -> io::Result<()> {
    use std::os::unix::io::AsRawFd;
    let cstr = std::ffi::CString::new(path.as_os_str().as_encoded_bytes())
        .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "nul byte in path"))?;
    let mut addr: libc::sockaddr_un = unsafe { mem::zeroed() };
    addr.sun_family = libc::AF_UNIX as libc::sa_family_t;
    let bytes = cstr.as_bytes_with_nul();
    if bytes.len() > addr.sun_path.len() {
        return Err(io::Error::new(io::ErrorKind::InvalidInput, "path too long"));
    }
    for (i, b) in bytes.iter().enumerate() {
        addr.sun_path[i] = *b as libc::c_char;
    }
    let rc = unsafe {
        libc::bind(
            sock.as_raw_fd(),
            &addr as *const _ as *const libc::sockaddr,
            mem::size_of::<libc::sockaddr_un>() as u32,
        )
    };
    if rc < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

impl Drop for ControlChannel {
    fn drop(&mut self) {
        if let Some(path) = &self.path {
            let _ = std::fs::remove_file(path);
        }
    }
}

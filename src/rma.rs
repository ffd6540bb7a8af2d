// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 natyamatsya contributors
//
// One-sided remote memory access. Translates scatter/gather memory
// handles into the offset/length window requested, then invokes the
// kernel's cross-process copy primitive. Linux implements this via
// process_vm_readv/process_vm_writev; every other `cfg(unix)` target
// reports OperationNotSupported rather than carrying a fabricated
// fallback (see SPEC_FULL.md design notes). Wrapped in `io::Error::
// last_os_error()` the same way the rest of this crate's direct libc
// syscall wrappers (shm, mutex) surface kernel failures.

use crate::error::{Error, Result};

const INLINE_IOV: usize = 8;

bitflags::bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct AccessFlags: u8 {
        const READ = 0b01;
        const WRITE = 0b10;
    }
}

/// One contiguous segment of a memory handle's scatter/gather list.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IovSegment {
    pub base: usize,
    pub len: usize,
}

enum IovStorage {
    Inline([IovSegment; INLINE_IOV], usize),
    Heap(Vec<IovSegment>),
}

/// Scatter/gather descriptor for one side of an RMA transfer.
pub struct MemoryHandle {
    segments: IovStorage,
    total_len: usize,
    pub flags: AccessFlags,
}

impl MemoryHandle {
    pub fn new(segments: &[IovSegment], flags: AccessFlags) -> Self {
        let total_len = segments.iter().map(|s| s.len).sum();
        let storage = if segments.len() <= INLINE_IOV {
            let mut arr = [IovSegment { base: 0, len: 0 }; INLINE_IOV];
            arr[..segments.len()].copy_from_slice(segments);
            IovStorage::Inline(arr, segments.len())
        } else {
            IovStorage::Heap(segments.to_vec())
        };
        Self {
            segments: storage,
            total_len,
            flags,
        }
    }

    pub fn segments(&self) -> &[IovSegment] {
        match &self.segments {
            IovStorage::Inline(arr, n) => &arr[..*n],
            IovStorage::Heap(v) => v,
        }
    }

    pub fn total_len(&self) -> usize {
        self.total_len
    }

    /// Serialized form: iov count (u32) + total length (u64) + flags (u8),
    /// followed by (base, length) pairs, matching the external wire
    /// layout. Addresses are interpreted in the sender's address space.
    pub fn serialize(&self) -> Vec<u8> {
        let segs = self.segments();
        let mut out = Vec::with_capacity(13 + segs.len() * 16);
        out.extend_from_slice(&(segs.len() as u32).to_le_bytes());
        out.extend_from_slice(&(self.total_len as u64).to_le_bytes());
        out.push(self.flags.bits());
        for s in segs {
            out.extend_from_slice(&(s.base as u64).to_le_bytes());
            out.extend_from_slice(&(s.len as u64).to_le_bytes());
        }
        out
    }

    pub fn deserialize(buf: &[u8]) -> Result<Self> {
        if buf.len() < 13 {
            return Err(Error::BadArgument);
        }
        let count = u32::from_le_bytes(buf[0..4].try_into().unwrap()) as usize;
        let _total_len = u64::from_le_bytes(buf[4..12].try_into().unwrap()) as usize;
        let flags = AccessFlags::from_bits_truncate(buf[12]);
        let mut segments = Vec::with_capacity(count);
        let mut off = 13;
        for _ in 0..count {
            if buf.len() < off + 16 {
                return Err(Error::BadArgument);
            }
            let base = u64::from_le_bytes(buf[off..off + 8].try_into().unwrap()) as usize;
            let len = u64::from_le_bytes(buf[off + 8..off + 16].try_into().unwrap()) as usize;
            segments.push(IovSegment { base, len });
            off += 16;
        }
        Ok(Self::new(&segments, flags))
    }
}

/// Translate a memory handle into the iov entries covering
/// `[offset, offset+length)`. Mirrors §4.8's walk-then-clip algorithm:
/// find the starting segment, then emit full segments until `length`
/// bytes have been covered, clipping the first and last.
fn translate(handle: &MemoryHandle, offset: usize, length: usize) -> Result<Vec<IovSegment>> {
    if offset + length > handle.total_len() {
        return Err(Error::BadArgument);
    }
    let mut remaining_offset = offset;
    let mut remaining_len = length;
    let mut out = Vec::new();

    for seg in handle.segments() {
        if remaining_len == 0 {
            break;
        }
        if remaining_offset >= seg.len {
            remaining_offset -= seg.len;
            continue;
        }
        let start = seg.base + remaining_offset;
        let avail = seg.len - remaining_offset;
        let take = avail.min(remaining_len);
        out.push(IovSegment { base: start, len: take });
        remaining_len -= take;
        remaining_offset = 0;
    }

    if remaining_len != 0 {
        return Err(Error::BadArgument);
    }
    Ok(out)
}

/// Result of one RMA transfer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TransferOutcome {
    pub bytes: usize,
}

/// Perform `length` bytes from `local` (offset `local_offset`) into
/// `remote` (offset `remote_offset`) owned by process `remote_pid`.
pub fn put(
    local: &MemoryHandle,
    local_offset: usize,
    remote: &MemoryHandle,
    remote_offset: usize,
    length: usize,
    remote_pid: u32,
) -> Result<TransferOutcome> {
    if !remote.flags.contains(AccessFlags::WRITE) {
        return Err(Error::PermissionDenied);
    }
    transfer(local, local_offset, remote, remote_offset, length, remote_pid, Direction::Write)
}

/// Perform `length` bytes from `remote` (offset `remote_offset`) owned by
/// process `remote_pid` into `local` (offset `local_offset`).
pub fn get(
    local: &MemoryHandle,
    local_offset: usize,
    remote: &MemoryHandle,
    remote_offset: usize,
    length: usize,
    remote_pid: u32,
) -> Result<TransferOutcome> {
    if !remote.flags.contains(AccessFlags::READ) {
        return Err(Error::PermissionDenied);
    }
    transfer(local, local_offset, remote, remote_offset, length, remote_pid, Direction::Read)
}

#[derive(Clone, Copy)]
enum Direction {
    Read,
    Write,
}

fn transfer(
    local: &MemoryHandle,
    local_offset: usize,
    remote: &MemoryHandle,
    remote_offset: usize,
    length: usize,
    remote_pid: u32,
    dir: Direction,
) -> Result<TransferOutcome> {
    let local_iov = translate(local, local_offset, length)?;
    let remote_iov = translate(remote, remote_offset, length)?;

    #[cfg(target_os = "linux")]
    {
        linux::copy(&local_iov, &remote_iov, remote_pid, dir, length)
    }
    #[cfg(not(target_os = "linux"))]
    {
        let _ = (local_iov, remote_iov, remote_pid, dir, length);
        Err(Error::OperationNotSupported)
    }
}

#[cfg(target_os = "linux")]
mod linux {
    use super::{Direction, Error, IovSegment, Result, TransferOutcome};

    pub(super) fn copy(
        local: &[IovSegment],
        remote: &[IovSegment],
        remote_pid: u32,
        dir: Direction,
        length: usize,
    ) -> Result<TransferOutcome> {
        let to_iovec = |segs: &[IovSegment]| -> Vec<libc::iovec> {
            segs.iter()
                .map(|s| libc::iovec {
                    iov_base: s.base as *mut libc::c_void,
                    iov_len: s.len,
                })
                .collect()
        };
        let local_iov = to_iovec(local);
        let remote_iov = to_iovec(remote);

        // SAFETY: iov bases were produced by `translate` from caller-owned
        // memory handles describing live mappings; process_vm_{read,write}v
        // is documented to fail (not crash) on bad addresses in either
        // process, surfaced below as an io error.
        let n = unsafe {
            match dir {
                Direction::Read => libc::process_vm_readv(
                    remote_pid as libc::pid_t,
                    local_iov.as_ptr(),
                    local_iov.len() as libc::c_ulong,
                    remote_iov.as_ptr(),
                    remote_iov.len() as libc::c_ulong,
                    0,
                ),
                Direction::Write => libc::process_vm_writev(
                    remote_pid as libc::pid_t,
                    local_iov.as_ptr(),
                    local_iov.len() as libc::c_ulong,
                    remote_iov.as_ptr(),
                    remote_iov.len() as libc::c_ulong,
                    0,
                ),
            }
        };

        if n < 0 {
            let err = std::io::Error::last_os_error();
            if err.raw_os_error() == Some(libc::EPERM) {
                return Err(Error::PermissionDenied);
            }
            return Err(Error::from(err));
        }
        if n as usize != length {
            return Err(Error::Protocol("short RMA transfer".to_string()));
        }
        Ok(TransferOutcome { bytes: n as usize })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn translate_skips_and_clips_across_segments() {
        let handle = MemoryHandle::new(
            &[
                IovSegment { base: 0x1000, len: 1000 },
                IovSegment { base: 0x2000, len: 1000 },
                IovSegment { base: 0x3000, len: 1000 },
            ],
            AccessFlags::READ | AccessFlags::WRITE,
        );
        let iov = translate(&handle, 500, 2000).unwrap();
        assert_eq!(iov.len(), 3);
        assert_eq!(iov[0], IovSegment { base: 0x1000 + 500, len: 500 });
        assert_eq!(iov[1], IovSegment { base: 0x2000, len: 1000 });
        assert_eq!(iov[2], IovSegment { base: 0x3000, len: 500 });
        let total: usize = iov.iter().map(|s| s.len).sum();
        assert_eq!(total, 2000);
    }

    #[test]
    fn translate_rejects_out_of_range_window() {
        let handle = MemoryHandle::new(&[IovSegment { base: 0, len: 10 }], AccessFlags::READ);
        assert!(translate(&handle, 5, 10).is_err());
    }

    #[test]
    fn memory_handle_round_trips_through_serialize() {
        let handle = MemoryHandle::new(
            &[IovSegment { base: 10, len: 20 }, IovSegment { base: 40, len: 5 }],
            AccessFlags::WRITE,
        );
        let bytes = handle.serialize();
        let back = MemoryHandle::deserialize(&bytes).unwrap();
        assert_eq!(back.total_len(), handle.total_len());
        assert_eq!(back.segments().len(), handle.segments().len());
        assert_eq!(back.flags, handle.flags);
    }

    #[test]
    fn put_without_write_permission_is_rejected() {
        let local = MemoryHandle::new(&[IovSegment { base: 0, len: 10 }], AccessFlags::READ);
        let remote = MemoryHandle::new(&[IovSegment { base: 0, len: 10 }], AccessFlags::READ);
        let result = put(&local, 0, &remote, 0, 10, 1);
        assert!(matches!(result, Err(Error::PermissionDenied)));
    }
}

// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 natyamatsya contributors
//
// Peer addressing: the wire address form, the address record slab, the
// map used for initiator-side lookups, and the poll list scanned by the
// progress engine. Address records are stored in a slab and referenced
// by a small integer handle from operations and the poll list, rather
// than by raw pointer, so the slab can be compacted safely under the
// map's reader/writer lock (see rw_lock::RwLock for the lock itself).

use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use crate::error::{Error, Result};
use crate::notify::Notifier;
use crate::region::SharedRegion;
use crate::rw_lock::RwLock;

/// Wire/string form of a peer address: `sm://<pid>/<instance>`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Address {
    pub pid: u32,
    pub instance: u8,
}

impl Address {
    pub fn to_wire(self) -> String {
        format!("sm://{}/{}", self.pid, self.instance)
    }

    /// Parse `sm://<pid>/<instance>`, tolerating a missing `sm://` prefix.
    pub fn parse(s: &str) -> Result<Self> {
        let body = s.strip_prefix("sm://").unwrap_or(s);
        let mut parts = body.splitn(2, '/');
        let pid = parts.next().ok_or(Error::BadArgument)?;
        let instance = parts.next().ok_or(Error::BadArgument)?;
        let pid: u32 = pid.parse().map_err(|_| Error::BadArgument)?;
        let instance: u8 = instance.parse().map_err(|_| Error::BadArgument)?;
        Ok(Self { pid, instance })
    }

    /// 4-byte PID + 1-byte instance, per the external serialized form.
    pub fn to_bytes(self) -> [u8; 5] {
        let mut buf = [0u8; 5];
        buf[0..4].copy_from_slice(&self.pid.to_le_bytes());
        buf[4] = self.instance;
        buf
    }

    pub fn from_bytes(buf: &[u8; 5]) -> Self {
        let pid = u32::from_le_bytes(buf[0..4].try_into().unwrap());
        Self { pid, instance: buf[4] }
    }
}

/// Whether an address was resolved because this endpoint initiated
/// contact (expected — we hold the SHM handle and own notifier cleanup)
/// or because a peer reserved a pair on our region first (unexpected —
/// the region is borrowed and queue-pair roles are inverted).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AddressOrigin {
    Expected,
    Unexpected,
}

bitflags::bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct AddressStatus: u8 {
        const RESERVED = 0b001;
        const CMD_PUSHED = 0b010;
        const RESOLVED = 0b100;
    }
}

/// One known peer. Reference-counted: operations, poll-list membership,
/// and map membership each hold a count; the record is torn down only
/// once the count reaches zero and a RELEASED command has been exchanged
/// (see progress::dispatch_command).
pub struct AddressRecord {
    pub addr: Address,
    pub origin: AddressOrigin,
    pub region: Option<Arc<SharedRegion>>,
    pub pair_index: Option<usize>,
    pub tx_notify: Option<Notifier>,
    pub rx_notify: Option<Notifier>,
    pub status: AddressStatus,
    pub released: bool,
    in_poll_list: bool,
    refs: AtomicU32,
}

impl AddressRecord {
    pub fn new(addr: Address, origin: AddressOrigin) -> Self {
        Self {
            addr,
            origin,
            region: None,
            pair_index: None,
            tx_notify: None,
            rx_notify: None,
            status: AddressStatus::empty(),
            released: false,
            in_poll_list: false,
            refs: AtomicU32::new(0),
        }
    }

    pub fn add_ref(&self) -> u32 {
        self.refs.fetch_add(1, Ordering::AcqRel) + 1
    }

    /// Release one reference, returning the count remaining.
    pub fn release_ref(&self) -> u32 {
        self.refs.fetch_sub(1, Ordering::AcqRel) - 1
    }

    pub fn ref_count(&self) -> u32 {
        self.refs.load(Ordering::Acquire)
    }

    pub fn is_resolved(&self) -> bool {
        self.status.contains(AddressStatus::RESOLVED)
    }
}

/// Slab handle into the address table. Stable across insert/remove of
/// other entries.
pub type AddressHandle = usize;

/// PID+instance -> address record table, plus the poll list the progress
/// engine walks each tick. Initiator-side lookups hash-map; dispatch from
/// the control channel and ring drains walks the poll list directly.
pub struct AddressTable {
    lock: RwLock,
    slab: std::cell::UnsafeCell<slab_storage::Slab>,
    by_key: std::cell::UnsafeCell<HashMap<Address, AddressHandle>>,
    poll_list: std::cell::UnsafeCell<Vec<AddressHandle>>,
}

// A hand-rolled minimal slab: this crate doesn't carry the `slab` crate
// as a mandatory dependency for the core library (it stays an optional
// feature used by the proto layer), and the table needs stable handles
// over entries that can be individually freed.
mod slab_storage {
    use super::AddressRecord;

    #[derive(Default)]
    pub struct Slab {
        entries: Vec<Option<AddressRecord>>,
        free: Vec<usize>,
    }

    impl Slab {
        pub fn insert(&mut self, record: AddressRecord) -> usize {
            if let Some(idx) = self.free.pop() {
                self.entries[idx] = Some(record);
                idx
            } else {
                self.entries.push(Some(record));
                self.entries.len() - 1
            }
        }

        pub fn get(&self, idx: usize) -> Option<&AddressRecord> {
            self.entries.get(idx).and_then(|e| e.as_ref())
        }

        pub fn get_mut(&mut self, idx: usize) -> Option<&mut AddressRecord> {
            self.entries.get_mut(idx).and_then(|e| e.as_mut())
        }

        pub fn remove(&mut self, idx: usize) -> Option<AddressRecord> {
            let record = self.entries.get_mut(idx)?.take();
            if record.is_some() {
                self.free.push(idx);
            }
            record
        }
    }
}

// Safety: every access to the interior-mutable fields goes through
// `AddressTable`'s own read/write lock below; no reference to slab
// contents escapes past the locked section.
unsafe impl Send for AddressTable {}
unsafe impl Sync for AddressTable {}

impl AddressTable {
    pub fn new() -> Self {
        Self {
            lock: RwLock::new(),
            slab: std::cell::UnsafeCell::new(slab_storage::Slab::default()),
            by_key: std::cell::UnsafeCell::new(HashMap::new()),
            poll_list: std::cell::UnsafeCell::new(Vec::new()),
        }
    }

    /// Look up an existing handle for `addr`, or insert `make()`'s result
    /// under the write lock (linearizing concurrent duplicate inserts).
    pub fn get_or_insert_with<F>(&self, addr: Address, make: F) -> AddressHandle
    where
        F: FnOnce() -> AddressRecord,
    {
        self.lock.lock_shared();
        let existing = unsafe { (*self.by_key.get()).get(&addr).copied() };
        self.lock.unlock_shared();
        if let Some(h) = existing {
            return h;
        }

        self.lock.lock();
        let handle = unsafe {
            if let Some(h) = (*self.by_key.get()).get(&addr).copied() {
                h
            } else {
                let h = (*self.slab.get()).insert(make());
                (*self.by_key.get()).insert(addr, h);
                h
            }
        };
        self.lock.unlock();
        handle
    }

    pub fn link_poll_list(&self, handle: AddressHandle) {
        self.lock.lock();
        unsafe {
            (*self.poll_list.get()).push(handle);
            if let Some(r) = (*self.slab.get()).get_mut(handle) {
                r.in_poll_list = true;
            }
        }
        self.lock.unlock();
    }

    /// Link `handle` into the poll list unless it's already there. Used
    /// when wiring up a peer-initiated (unexpected) address: the same
    /// handle may already exist (e.g. a `recv_expected` posted before the
    /// peer's RESERVED command arrived created a placeholder), in which
    /// case it must not be linked twice.
    pub fn ensure_poll_linked(&self, handle: AddressHandle) {
        self.lock.lock();
        unsafe {
            if let Some(r) = (*self.slab.get()).get_mut(handle) {
                if !r.in_poll_list {
                    r.in_poll_list = true;
                    (*self.poll_list.get()).push(handle);
                }
            }
        }
        self.lock.unlock();
    }

    pub fn with_record<R>(&self, handle: AddressHandle, f: impl FnOnce(&AddressRecord) -> R) -> Option<R> {
        self.lock.lock_shared();
        let result = unsafe { (*self.slab.get()).get(handle).map(f) };
        self.lock.unlock_shared();
        result
    }

    /// Mutate a record under the table's write lock, excluding concurrent
    /// readers (`with_record`) and writers for the duration of `f`.
    pub fn with_record_mut<R>(&self, handle: AddressHandle, f: impl FnOnce(&mut AddressRecord) -> R) -> Option<R> {
        self.lock.lock();
        let result = unsafe { (*self.slab.get()).get_mut(handle).map(f) };
        self.lock.unlock();
        result
    }

    /// Snapshot of the current poll list, for the progress engine to walk
    /// outside the lock.
    pub fn poll_list_snapshot(&self) -> Vec<AddressHandle> {
        self.lock.lock_shared();
        let list = unsafe { (*self.poll_list.get()).clone() };
        self.lock.unlock_shared();
        list
    }

    pub fn find_by_pair(&self, pid: u32, instance: u8, pair_index: usize) -> Option<AddressHandle> {
        self.lock.lock_shared();
        let found = unsafe {
            (*self.poll_list.get()).iter().copied().find(|&h| {
                (*self.slab.get())
                    .get(h)
                    .map(|r| r.addr.pid == pid && r.addr.instance == instance && r.pair_index == Some(pair_index))
                    .unwrap_or(false)
            })
        };
        self.lock.unlock_shared();
        found
    }

    /// Remove a handle from both the poll list and the map (if present).
    /// Returns the record so the caller can release its resources.
    pub fn remove(&self, handle: AddressHandle) -> Option<AddressRecord> {
        self.lock.lock();
        let record = unsafe {
            (*self.poll_list.get()).retain(|&h| h != handle);
            if let Some(r) = (*self.slab.get()).get(handle) {
                (*self.by_key.get()).remove(&r.addr);
            }
            (*self.slab.get()).remove(handle)
        };
        self.lock.unlock();
        record
    }
}

impl Default for AddressTable {
    fn default() -> Self {
        Self::new()
    }
}

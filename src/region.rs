// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 natyamatsya contributors
//
// Shared region layout: the copy-buffer pool, the queue-pair array, and
// the command queue, all mapped in one named SHM segment per listening
// endpoint. Construction-once discipline mirrors proto::shm_ring's
// `constructed: AtomicBool` header flag and this crate's ShmHandle
// acquire/refcount/unlink lifecycle.

use std::io;
use std::sync::atomic::{AtomicBool, Ordering};

use crate::bitmap::{Bitmap256, Bitmap64};
use crate::ring::Ring;
use crate::shm::{ShmHandle, ShmOpenMode};

/// One fixed-size staging slot in the copy-buffer pool.
pub const BUFFER_SLOT_LEN: usize = 4096;
pub const BUFFER_SLOT_COUNT: usize = 64;
pub const QUEUE_PAIR_COUNT: usize = 256;
pub const MESSAGE_RING_CAPACITY: usize = 256;
pub const COMMAND_RING_CAPACITY: usize = 512;

pub type MessageRing = Ring<MESSAGE_RING_CAPACITY>;
pub type CommandRing = Ring<COMMAND_RING_CAPACITY>;

/// One rx/tx ring pair assignable to a single peer relationship.
#[repr(C)]
pub struct QueuePair {
    pub rx: MessageRing,
    pub tx: MessageRing,
}

/// Fixed layout mapped at the start of the region's SHM segment.
///
/// `constructed` gates one-time initialization the same way
/// `proto::shm_ring::Header::constructed` does: the process that wins the
/// `shm_open(O_CREAT|O_EXCL)` race zeroes and builds the rest, everyone
/// else just maps and waits for the flag.
#[repr(C)]
struct RegionLayout {
    constructed: AtomicBool,
    buffer_bitmap: Bitmap64,
    pair_bitmap: Bitmap256,
    command_queue: CommandRing,
    pairs: [QueuePair; QUEUE_PAIR_COUNT],
    buffers: [[u8; BUFFER_SLOT_LEN]; BUFFER_SLOT_COUNT],
}

fn region_size() -> usize {
    std::mem::size_of::<RegionLayout>()
}

/// A mapped shared region: the SHM handle for one endpoint's buffer pool,
/// queue-pair array, and command queue.
pub struct SharedRegion {
    shm: ShmHandle,
}

impl SharedRegion {
    /// Open (creating if necessary) the region named for `(shm_prefix,
    /// user, pid, instance)`.
    pub fn open(name: &str) -> io::Result<Self> {
        let shm = ShmHandle::acquire(name, region_size(), ShmOpenMode::CreateOrOpen)?;
        let layout = unsafe { &*(shm.get() as *const RegionLayout) };
        if !layout.constructed.load(Ordering::Acquire) {
            unsafe {
                let ptr = shm.get() as *mut RegionLayout;
                std::ptr::write(
                    std::ptr::addr_of_mut!((*ptr).buffer_bitmap),
                    Bitmap64::all_free(),
                );
                std::ptr::write(
                    std::ptr::addr_of_mut!((*ptr).pair_bitmap),
                    Bitmap256::all_free(),
                );
                std::ptr::write(std::ptr::addr_of_mut!((*ptr).command_queue), CommandRing::new());
                for i in 0..QUEUE_PAIR_COUNT {
                    let pair_ptr = std::ptr::addr_of_mut!((*ptr).pairs[i]);
                    std::ptr::write(std::ptr::addr_of_mut!((*pair_ptr).rx), MessageRing::new());
                    std::ptr::write(std::ptr::addr_of_mut!((*pair_ptr).tx), MessageRing::new());
                }
            }
            layout.constructed.store(true, Ordering::Release);
        }
        Ok(Self { shm })
    }

    fn layout(&self) -> &RegionLayout {
        unsafe { &*(self.shm.get() as *const RegionLayout) }
    }

    pub fn buffer_bitmap(&self) -> &Bitmap64 {
        &self.layout().buffer_bitmap
    }

    pub fn pair_bitmap(&self) -> &Bitmap256 {
        &self.layout().pair_bitmap
    }

    pub fn command_queue(&self) -> &CommandRing {
        &self.layout().command_queue
    }

    pub fn pair(&self, index: usize) -> &QueuePair {
        debug_assert!(index < QUEUE_PAIR_COUNT);
        &self.layout().pairs[index]
    }

    /// Mutable pointer to a copy-buffer slot's bytes.
    pub fn buffer_slot_ptr(&self, index: usize) -> *mut u8 {
        debug_assert!(index < BUFFER_SLOT_COUNT);
        unsafe {
            let ptr = self.shm.get() as *mut RegionLayout;
            std::ptr::addr_of_mut!((*ptr).buffers[index]) as *mut u8
        }
    }

    /// Copy `data` into buffer slot `index`. `data.len()` must not exceed
    /// `BUFFER_SLOT_LEN`.
    pub fn write_buffer(&self, index: usize, data: &[u8]) {
        debug_assert!(data.len() <= BUFFER_SLOT_LEN);
        unsafe {
            std::ptr::copy_nonoverlapping(data.as_ptr(), self.buffer_slot_ptr(index), data.len());
        }
    }

    /// Copy `len` bytes out of buffer slot `index` into `out`.
    pub fn read_buffer(&self, index: usize, len: usize, out: &mut [u8]) {
        debug_assert!(len <= BUFFER_SLOT_LEN);
        debug_assert!(out.len() >= len);
        unsafe {
            std::ptr::copy_nonoverlapping(self.buffer_slot_ptr(index), out.as_mut_ptr(), len);
        }
    }

    pub fn unlink(&self) {
        self.shm.unlink();
    }
}

unsafe impl Send for SharedRegion {}
unsafe impl Sync for SharedRegion {}

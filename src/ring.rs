// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 natyamatsya contributors
//
// Lock-free multi-producer/multi-consumer ring of packed 64-bit headers.
// Used for both the per-queue-pair message rings and the per-region
// command queue; only the capacity differs between the two.
//
// Unlike this crate's existing proto::shm_ring (single producer, single
// consumer), every producer and every consumer here may run concurrently,
// so head/tail advancement is claimed with a CAS rather than a plain
// fetch_add-and-go, following the same acquire/release discipline the
// rest of this crate's lock-free structures use.

use std::sync::atomic::{AtomicU64, Ordering};

use crate::spin_lock::adaptive_yield_pub as adaptive_yield;

/// A bounded MPMC ring of `N` 64-bit slots. `N` must be a power of two.
#[repr(C)]
pub struct Ring<const N: usize> {
    producer_head: AtomicU64,
    producer_tail: AtomicU64,
    consumer_head: AtomicU64,
    consumer_tail: AtomicU64,
    slots: [AtomicU64; N],
}

impl<const N: usize> Ring<N> {
    const MASK: u64 = (N as u64) - 1;

    const fn check_capacity() {
        assert!(N.is_power_of_two(), "Ring capacity must be a power of two");
    }

    /// Construct a ring with all slots empty. Call only on memory this
    /// process owns the first-initialization race for (see `region::SharedRegion`
    /// for the construction-once discipline used over shared memory).
    pub fn new() -> Self {
        Self::check_capacity();
        Self {
            producer_head: AtomicU64::new(0),
            producer_tail: AtomicU64::new(0),
            consumer_head: AtomicU64::new(0),
            consumer_tail: AtomicU64::new(0),
            slots: std::array::from_fn(|_| AtomicU64::new(0)),
        }
    }

    fn slot(&self, idx: u64) -> &AtomicU64 {
        &self.slots[(idx & Self::MASK) as usize]
    }

    /// Push a non-zero packed header. Returns `false` if the ring is full.
    pub fn push(&self, value: u64) -> bool {
        debug_assert_ne!(value, 0, "zero is the empty-slot sentinel");
        let mut head = self.producer_head.load(Ordering::Relaxed);
        loop {
            let tail = self.consumer_tail.load(Ordering::Acquire);
            if head.wrapping_sub(tail) >= N as u64 {
                return false;
            }
            match self.producer_head.compare_exchange_weak(
                head,
                head.wrapping_add(1),
                Ordering::AcqRel,
                Ordering::Relaxed,
            ) {
                Ok(_) => break,
                Err(observed) => head = observed,
            }
        }

        self.slot(head).store(value, Ordering::Release);

        let mut k = 0u32;
        while self
            .producer_tail
            .compare_exchange_weak(head, head.wrapping_add(1), Ordering::AcqRel, Ordering::Relaxed)
            .is_err()
        {
            adaptive_yield(&mut k);
        }
        true
    }

    /// Pop a packed header. Returns `None` if the ring is empty.
    pub fn pop(&self) -> Option<u64> {
        let mut head = self.consumer_head.load(Ordering::Relaxed);
        loop {
            let tail = self.producer_tail.load(Ordering::Acquire);
            if head >= tail {
                return None;
            }
            match self.consumer_head.compare_exchange_weak(
                head,
                head.wrapping_add(1),
                Ordering::AcqRel,
                Ordering::Relaxed,
            ) {
                Ok(_) => break,
                Err(observed) => head = observed,
            }
        }

        let slot = self.slot(head);
        let mut k = 0u32;
        let mut value = slot.load(Ordering::Acquire);
        while value == 0 {
            adaptive_yield(&mut k);
            value = slot.load(Ordering::Acquire);
        }
        slot.store(0, Ordering::Release);

        let mut k = 0u32;
        while self
            .consumer_tail
            .compare_exchange_weak(head, head.wrapping_add(1), Ordering::AcqRel, Ordering::Relaxed)
            .is_err()
        {
            adaptive_yield(&mut k);
        }
        Some(value)
    }

    pub fn len(&self) -> usize {
        let tail = self.producer_tail.load(Ordering::Acquire);
        let head = self.consumer_tail.load(Ordering::Acquire);
        tail.wrapping_sub(head) as usize
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn capacity(&self) -> usize {
        N
    }
}

impl<const N: usize> Default for Ring<N> {
    fn default() -> Self {
        Self::new()
    }
}

unsafe impl<const N: usize> Send for Ring<N> {}
unsafe impl<const N: usize> Sync for Ring<N> {}

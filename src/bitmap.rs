// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 natyamatsya contributors
//
// Atomic bitmap allocators backing the copy-buffer pool (64 slots) and the
// queue-pair array (256 slots). Contention is resolved with CAS retries
// rather than a lock, the same way the rest of this crate's lock-free
// structures (spin_lock, rw_lock) avoid blocking under contention.

use std::sync::atomic::{AtomicU64, Ordering};

use crate::error::{Error, Result};

/// A single 64-bit word of reservable bits. A set bit means "free".
pub struct Bitmap64 {
    word: AtomicU64,
}

impl Bitmap64 {
    pub const CAPACITY: usize = 64;

    /// A bitmap with every bit marked free.
    pub const fn all_free() -> Self {
        Self {
            word: AtomicU64::new(u64::MAX),
        }
    }

    /// Reserve one free bit, returning its index. Returns `Error::Again`
    /// when no bit is currently free.
    pub fn reserve(&self) -> Result<usize> {
        let mut current = self.word.load(Ordering::Relaxed);
        loop {
            if current == 0 {
                return Err(Error::Again);
            }
            let bit = current.trailing_zeros() as usize;
            let candidate = current & !(1u64 << bit);
            match self.word.compare_exchange_weak(
                current,
                candidate,
                Ordering::AcqRel,
                Ordering::Relaxed,
            ) {
                Ok(_) => return Ok(bit),
                Err(observed) => current = observed,
            }
        }
    }

    /// Release a previously reserved bit. Never fails.
    pub fn release(&self, index: usize) {
        debug_assert!(index < Self::CAPACITY);
        self.word.fetch_or(1u64 << index, Ordering::AcqRel);
    }

    pub fn is_free(&self, index: usize) -> bool {
        debug_assert!(index < Self::CAPACITY);
        self.word.load(Ordering::Acquire) & (1u64 << index) != 0
    }
}

impl Default for Bitmap64 {
    fn default() -> Self {
        Self::all_free()
    }
}

/// Bitmap over 256 slots, implemented as four `Bitmap64` words. Used for
/// the queue-pair availability table.
pub struct Bitmap256 {
    words: [Bitmap64; 4],
}

impl Bitmap256 {
    pub const CAPACITY: usize = 256;

    pub const fn all_free() -> Self {
        Self {
            words: [
                Bitmap64::all_free(),
                Bitmap64::all_free(),
                Bitmap64::all_free(),
                Bitmap64::all_free(),
            ],
        }
    }

    /// Reserve one free slot anywhere across the four words. Each word is
    /// tried once per pass; a CAS failure on a word moves on to the next
    /// word rather than retrying the same stale value, per the reserve
    /// algorithm's no-hot-spin contract.
    pub fn reserve(&self) -> Result<usize> {
        for (word_idx, word) in self.words.iter().enumerate() {
            match word.reserve() {
                Ok(bit) => return Ok(word_idx * Bitmap64::CAPACITY + bit),
                Err(Error::Again) => continue,
                Err(e) => return Err(e),
            }
        }
        Err(Error::Again)
    }

    pub fn release(&self, index: usize) {
        debug_assert!(index < Self::CAPACITY);
        let word_idx = index / Bitmap64::CAPACITY;
        let bit = index % Bitmap64::CAPACITY;
        self.words[word_idx].release(bit);
    }

    pub fn is_free(&self, index: usize) -> bool {
        debug_assert!(index < Self::CAPACITY);
        let word_idx = index / Bitmap64::CAPACITY;
        let bit = index % Bitmap64::CAPACITY;
        self.words[word_idx].is_free(bit)
    }
}

impl Default for Bitmap256 {
    fn default() -> Self {
        Self::all_free()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn reserve_then_release_restores_bit() {
        let bm = Bitmap64::all_free();
        let idx = bm.reserve().unwrap();
        assert!(!bm.is_free(idx));
        bm.release(idx);
        assert!(bm.is_free(idx));
    }

    #[test]
    fn exhausting_all_64_bits_returns_again() {
        let bm = Bitmap64::all_free();
        let mut taken = Vec::new();
        for _ in 0..64 {
            taken.push(bm.reserve().unwrap());
        }
        assert!(matches!(bm.reserve(), Err(Error::Again)));
        bm.release(taken[0]);
        assert_eq!(bm.reserve().unwrap(), taken[0]);
    }

    #[test]
    fn bitmap256_spans_four_words() {
        let bm = Bitmap256::all_free();
        let mut all = Vec::new();
        for _ in 0..256 {
            all.push(bm.reserve().unwrap());
        }
        assert!(matches!(bm.reserve(), Err(Error::Again)));
        all.sort_unstable();
        all.dedup();
        assert_eq!(all.len(), 256);
    }

    #[test]
    fn concurrent_reservations_never_double_allocate() {
        let bm = Arc::new(Bitmap64::all_free());
        let mut handles = Vec::new();
        for _ in 0..8 {
            let bm = Arc::clone(&bm);
            handles.push(thread::spawn(move || {
                let mut got = Vec::new();
                for _ in 0..8 {
                    if let Ok(idx) = bm.reserve() {
                        got.push(idx);
                    }
                }
                got
            }));
        }
        let mut all: Vec<usize> = handles.into_iter().flat_map(|h| h.join().unwrap()).collect();
        all.sort_unstable();
        let before_dedup = all.len();
        all.dedup();
        assert_eq!(all.len(), before_dedup, "no index should be reserved twice");
    }
}

// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 natyamatsya contributors
//
// Operation identifier lifecycle. Callers allocate an Operation once and
// resubmit it after each completion; status bits track whether it is
// idle, queued on one of the endpoint's parking queues, completed, or
// canceled. Queue membership uses the same short-held spin lock style as
// the rest of this crate's lock-free/short-critical-section code
// (spin_lock::SpinLock).

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU8, Ordering};

use crate::address::AddressHandle;
use crate::spin_lock::SpinLock;

bitflags::bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct OpStatus: u8 {
        const COMPLETED = 0b001;
        const CANCELED  = 0b010;
        const QUEUED    = 0b100;
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpKind {
    SendUnexpected,
    RecvUnexpected,
    SendExpected,
    RecvExpected,
    Put,
    Get,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompletionResult {
    Ok,
    Canceled,
    Error,
}

/// One reusable operation slot.
pub struct Operation {
    status: AtomicU8,
    pub kind: OpKind,
    pub buf_ptr: *mut u8,
    pub buf_len: usize,
    pub actual_len: usize,
    pub tag: u32,
    pub peer: Option<AddressHandle>,
    pub result: Option<CompletionResult>,
}

// Safety: buf_ptr is a caller-owned buffer valid for the operation's
// lifetime; the endpoint never touches it from more than one thread at
// a time per operation (enforced by the COMPLETED/QUEUED handoff).
unsafe impl Send for Operation {}

impl Operation {
    pub fn new(kind: OpKind) -> Self {
        Self {
            status: AtomicU8::new(OpStatus::COMPLETED.bits()),
            kind,
            buf_ptr: std::ptr::null_mut(),
            buf_len: 0,
            actual_len: 0,
            tag: 0,
            peer: None,
            result: None,
        }
    }

    fn status(&self) -> OpStatus {
        OpStatus::from_bits_truncate(self.status.load(Ordering::Acquire))
    }

    fn set_status(&self, s: OpStatus) {
        self.status.store(s.bits(), Ordering::Release);
    }

    /// Take the operation out of COMPLETED to begin a new submission.
    /// Returns `false` if it was already in flight.
    pub fn begin_submit(&self, buf_ptr: *mut u8, buf_len: usize, tag: u32) -> bool {
        let prev = self.status.swap(0, Ordering::AcqRel);
        if OpStatus::from_bits_truncate(prev).contains(OpStatus::COMPLETED) {
            // SAFETY: only one thread may hold a `&mut` view at a time,
            // guaranteed by the COMPLETED handoff this call just took.
            let this = self as *const Self as *mut Self;
            unsafe {
                (*this).buf_ptr = buf_ptr;
                (*this).buf_len = buf_len;
                (*this).tag = tag;
                (*this).actual_len = 0;
                (*this).peer = None;
                (*this).result = None;
            }
            true
        } else {
            self.status.store(prev, Ordering::Release);
            false
        }
    }

    pub fn mark_queued(&self) {
        let s = self.status() | OpStatus::QUEUED;
        self.set_status(s);
    }

    pub fn mark_dequeued(&self) {
        let s = self.status() & !OpStatus::QUEUED;
        self.set_status(s);
    }

    pub fn is_queued(&self) -> bool {
        self.status().contains(OpStatus::QUEUED)
    }

    pub fn is_canceled(&self) -> bool {
        self.status().contains(OpStatus::CANCELED)
    }

    pub fn is_completed(&self) -> bool {
        self.status().contains(OpStatus::COMPLETED)
    }

    /// Complete the operation. If it was already CANCELED while parked,
    /// the final result is forced to `Canceled` regardless of `result`.
    pub fn complete(&self, result: CompletionResult) {
        let canceled = self.is_canceled();
        let final_result = if canceled { CompletionResult::Canceled } else { result };
        let this = self as *const Self as *mut Self;
        unsafe { (*this).result = Some(final_result) };
        self.set_status(OpStatus::COMPLETED);
    }

    /// Mark CANCELED. A no-op (returns `false`) if already completed.
    pub fn cancel(&self) -> bool {
        if self.is_completed() {
            return false;
        }
        let s = self.status() | OpStatus::CANCELED;
        self.set_status(s);
        true
    }
}

/// Spin-locked FIFO queue of operation pointers, used for the unexpected,
/// expected, and retry parking queues.
pub struct OpQueue {
    lock: SpinLock,
    items: std::cell::UnsafeCell<VecDeque<*const Operation>>,
}

// Safety: all access to `items` is gated by `lock`.
unsafe impl Send for OpQueue {}
unsafe impl Sync for OpQueue {}

impl OpQueue {
    pub fn new() -> Self {
        Self {
            lock: SpinLock::new(),
            items: std::cell::UnsafeCell::new(VecDeque::new()),
        }
    }

    pub fn push(&self, op: *const Operation) {
        unsafe { (*op).mark_queued() };
        self.lock.lock();
        unsafe { (*self.items.get()).push_back(op) };
        self.lock.unlock();
    }

    pub fn pop_front(&self) -> Option<*const Operation> {
        self.lock.lock();
        let op = unsafe { (*self.items.get()).pop_front() };
        self.lock.unlock();
        if let Some(op) = op {
            unsafe { (*op).mark_dequeued() };
        }
        op
    }

    /// Remove a specific operation (used by cancel). Returns `true` if found.
    pub fn remove(&self, target: *const Operation) -> bool {
        self.lock.lock();
        let items = unsafe { &mut *self.items.get() };
        let before = items.len();
        items.retain(|&op| op != target);
        let removed = items.len() != before;
        self.lock.unlock();
        if removed {
            unsafe { (*target).mark_dequeued() };
        }
        removed
    }

    pub fn len(&self) -> usize {
        self.lock.lock();
        let n = unsafe { (*self.items.get()).len() };
        self.lock.unlock();
        n
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Drain every currently queued operation through `f`, re-pushing
    /// those `f` returns `false` for (used by the retry loop's
    /// head-of-line blocking: stop at the first item that still isn't
    /// ready).
    pub fn drain_while_ready<F: FnMut(*const Operation) -> bool>(&self, mut f: F) {
        loop {
            let op = match self.pop_front() {
                Some(op) => op,
                None => return,
            };
            if !f(op) {
                self.push(op);
                return;
            }
        }
    }
}

impl Default for OpQueue {
    fn default() -> Self {
        Self::new()
    }
}

/// A short-held spin-locked FIFO of arbitrary `T`, used for the
/// unexpected-message holding queue, the expected-op parking list, and
/// the retry queue — structures that need more than a bare operation
/// pointer (a source address, a tag, held payload bytes).
pub struct SpinDeque<T> {
    lock: SpinLock,
    items: std::cell::UnsafeCell<VecDeque<T>>,
}

unsafe impl<T: Send> Send for SpinDeque<T> {}
unsafe impl<T: Send> Sync for SpinDeque<T> {}

impl<T> SpinDeque<T> {
    pub fn new() -> Self {
        Self {
            lock: SpinLock::new(),
            items: std::cell::UnsafeCell::new(VecDeque::new()),
        }
    }

    pub fn push_back(&self, item: T) {
        self.lock.lock();
        unsafe { (*self.items.get()).push_back(item) };
        self.lock.unlock();
    }

    pub fn pop_front(&self) -> Option<T> {
        self.lock.lock();
        let item = unsafe { (*self.items.get()).pop_front() };
        self.lock.unlock();
        item
    }

    /// Remove and return the first item for which `pred` returns `true`.
    pub fn remove_first<F: Fn(&T) -> bool>(&self, pred: F) -> Option<T> {
        self.lock.lock();
        let items = unsafe { &mut *self.items.get() };
        let pos = items.iter().position(pred);
        let removed = pos.map(|i| items.remove(i).unwrap());
        self.lock.unlock();
        removed
    }

    pub fn len(&self) -> usize {
        self.lock.lock();
        let n = unsafe { (*self.items.get()).len() };
        self.lock.unlock();
        n
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl<T> Default for SpinDeque<T> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn submit_then_complete_cycle() {
        let op = Operation::new(OpKind::SendUnexpected);
        assert!(op.is_completed());
        assert!(op.begin_submit(std::ptr::null_mut(), 0, 7));
        assert!(!op.is_completed());
        op.complete(CompletionResult::Ok);
        assert!(op.is_completed());
        assert_eq!(op.result, Some(CompletionResult::Ok));
    }

    #[test]
    fn resubmit_while_in_flight_fails() {
        let op = Operation::new(OpKind::SendUnexpected);
        assert!(op.begin_submit(std::ptr::null_mut(), 0, 1));
        assert!(!op.begin_submit(std::ptr::null_mut(), 0, 2));
    }

    #[test]
    fn cancel_after_complete_is_a_noop() {
        let op = Operation::new(OpKind::SendUnexpected);
        op.begin_submit(std::ptr::null_mut(), 0, 1);
        op.complete(CompletionResult::Ok);
        assert!(!op.cancel());
        assert_eq!(op.result, Some(CompletionResult::Ok));
    }

    #[test]
    fn cancel_before_complete_forces_canceled_result() {
        let op = Operation::new(OpKind::SendUnexpected);
        op.begin_submit(std::ptr::null_mut(), 0, 1);
        assert!(op.cancel());
        op.complete(CompletionResult::Ok);
        assert_eq!(op.result, Some(CompletionResult::Canceled));
    }

    #[test]
    fn queue_push_pop_preserves_order() {
        let a = Operation::new(OpKind::SendUnexpected);
        let b = Operation::new(OpKind::SendUnexpected);
        a.begin_submit(std::ptr::null_mut(), 0, 1);
        b.begin_submit(std::ptr::null_mut(), 0, 2);
        let q = OpQueue::new();
        q.push(&a as *const _);
        q.push(&b as *const _);
        assert_eq!(q.pop_front(), Some(&a as *const _));
        assert_eq!(q.pop_front(), Some(&b as *const _));
        assert_eq!(q.pop_front(), None);
    }
}

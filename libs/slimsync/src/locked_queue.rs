// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! A mutex-protected wait-block queue whose own lock admits contenders
//! wait-free.
//!
//! `lock_state` is either `LOCK_FREE`, `LOCK_BUSY`, or a CAS stack of wait
//! blocks pushed by threads that found the lock busy. Unlocking flushes the
//! stack: wait blocks carrying [`LOCK_ONLY_REQUEST`] move to a private queue
//! and are woken after the final unlock (they retry the lock), the rest are
//! spliced onto the tail of the head queue in arrival order. Before the lock
//! word is released, `front_request` is published with the request value of
//! the queue's head so that lock-free readers can tell whether a waiter is
//! eligible for release.

use crate::list::{self, LOCK_BUSY, LOCK_FREE, ListEntry};
use crate::loom::atomic::{AtomicI32, AtomicPtr, Ordering};
use crate::parker::{Parker, WAIT_SUCCESS};
use crate::spin::{is_multi_processor, spin_wait};
use crate::wait_block::{LOCK_ONLY_REQUEST, MAX_REQUEST, WaitBlock};
use core::ptr;

#[derive(Debug)]
pub(crate) struct LockedQueue {
    lock_state: AtomicPtr<ListEntry>,
    /// Wait blocks to wake once the lock word is released; owned by the
    /// lock holder.
    private_queue: AtomicPtr<ListEntry>,
    pub(crate) head: ListEntry,
    front_request: AtomicI32,
    pub(crate) spin_count: u32,
}

// === impl LockedQueue ===

impl LockedQueue {
    pub(crate) fn new(spin_count: u32) -> Self {
        Self {
            lock_state: AtomicPtr::new(LOCK_FREE),
            private_queue: AtomicPtr::new(ptr::null_mut()),
            head: ListEntry::new(),
            front_request: AtomicI32::new(0),
            spin_count: if is_multi_processor() { spin_count } else { 0 },
        }
    }

    /// The request code of the queue's first waiter as of the last unlock,
    /// or zero. Readable without the lock.
    #[inline]
    pub(crate) fn front_request(&self) -> i32 {
        self.front_request.load(Ordering::Acquire)
    }

    #[inline]
    fn head_ptr(&self) -> *mut ListEntry {
        self.head.as_ptr()
    }

    /// The sentinel head cannot self-link until the queue has a stable
    /// address, so it is initialized on first lock acquisition.
    #[inline]
    fn on_lock_acquired(&self) {
        if self.head.flink.load(Ordering::Relaxed).is_null() {
            self.head.init();
        }
        self.front_request.store(0, Ordering::Relaxed);
        self.private_queue.store(ptr::null_mut(), Ordering::Relaxed);
    }

    /// Single-attempt lock acquisition, used by release-pending probes.
    pub(crate) fn try_lock(&self) -> bool {
        if self.lock_state.load(Ordering::Relaxed) == LOCK_FREE
            && self
                .lock_state
                .compare_exchange(LOCK_FREE, LOCK_BUSY, Ordering::Acquire, Ordering::Relaxed)
                .is_ok()
        {
            self.on_lock_acquired();
            true
        } else {
            false
        }
    }

    /// Acquires the queue's lock, parking on contention.
    ///
    /// When `watch` is given, the acquisition is abandoned (returning
    /// `false`) as soon as the watched entry is observed dead, meaning some
    /// other thread already serviced it.
    pub(crate) fn lock(&self, watch: Option<&ListEntry>) -> bool {
        let parker = Parker::new(1);
        let wait_block = WaitBlock::new(&parker, LOCK_ONLY_REQUEST, WAIT_SUCCESS);

        loop {
            let mut spin = self.spin_count;
            loop {
                if let Some(watch) = watch {
                    if watch.is_dead() {
                        return false;
                    }
                }
                let state = self.lock_state.load(Ordering::Relaxed);
                if state == LOCK_FREE {
                    if self
                        .lock_state
                        .compare_exchange(
                            LOCK_FREE,
                            LOCK_BUSY,
                            Ordering::Acquire,
                            Ordering::Relaxed,
                        )
                        .is_ok()
                    {
                        self.on_lock_acquired();
                        return true;
                    }
                    continue;
                }
                if state != LOCK_BUSY || spin == 0 {
                    break;
                }
                spin -= 1;
                spin_wait(1);
            }

            parker.reset(1);

            loop {
                if let Some(watch) = watch {
                    if watch.is_dead() {
                        return false;
                    }
                }
                let state = self.lock_state.load(Ordering::Relaxed);
                if state == LOCK_FREE {
                    if self
                        .lock_state
                        .compare_exchange(
                            LOCK_FREE,
                            LOCK_BUSY,
                            Ordering::Acquire,
                            Ordering::Relaxed,
                        )
                        .is_ok()
                    {
                        self.on_lock_acquired();
                        return true;
                    }
                    continue;
                }
                wait_block.entry.flink.store(state, Ordering::Relaxed);
                if self
                    .lock_state
                    .compare_exchange(
                        state,
                        wait_block.entry.as_ptr(),
                        Ordering::Release,
                        Ordering::Relaxed,
                    )
                    .is_ok()
                {
                    break;
                }
            }

            parker.park();
        }
    }

    /// Appends `wait_block` to the queue.
    ///
    /// Returns `(locked, first)`: whether the caller acquired (and still
    /// holds) the queue's lock, and whether the block landed at the front of
    /// the queue.
    pub(crate) fn enqueue(&self, wait_block: &WaitBlock) -> (bool, bool) {
        loop {
            let state = self.lock_state.load(Ordering::Relaxed);
            if state == LOCK_FREE {
                if self
                    .lock_state
                    .compare_exchange(LOCK_FREE, LOCK_BUSY, Ordering::Acquire, Ordering::Relaxed)
                    .is_ok()
                {
                    self.on_lock_acquired();
                    // Safety: we hold the queue's lock.
                    unsafe { list::insert_tail(self.head_ptr(), wait_block.entry.as_ptr()); }
                    let first =
                        self.head.flink.load(Ordering::Relaxed) == wait_block.entry.as_ptr();
                    return (true, first);
                }
                continue;
            }
            wait_block.entry.flink.store(state, Ordering::Relaxed);
            if self
                .lock_state
                .compare_exchange(
                    state,
                    wait_block.entry.as_ptr(),
                    Ordering::Release,
                    Ordering::Relaxed,
                )
                .is_ok()
            {
                let first = state == LOCK_BUSY && self.head.is_empty();
                return (false, first);
            }
        }
    }

    /// Releases the queue's lock.
    ///
    /// New contenders may have pushed themselves onto `lock_state` during
    /// the critical section; their wait blocks are flushed into the queue
    /// first. When that flush changes the queue and `force` is `false`, the
    /// unlock fails (returning `false`) so the caller can re-examine the
    /// queue it believed quiescent.
    pub(crate) fn try_unlock(&self, force: bool) -> bool {
        let head = self.head_ptr();
        let mut force = force;
        if !force && !self.head.is_empty() {
            force = true;
        }
        loop {
            let state = self.lock_state.load(Ordering::Relaxed);
            if state == LOCK_BUSY {
                let first = self.head.flink.load(Ordering::Relaxed);
                let front = if first == head || first.is_null() {
                    0
                } else {
                    // Safety: we hold the lock; the first entry is a live
                    // wait block.
                    unsafe { WaitBlock::from_entry(first) }.request() & MAX_REQUEST
                };
                self.front_request.store(front, Ordering::Release);
                if self
                    .lock_state
                    .compare_exchange(LOCK_BUSY, LOCK_FREE, Ordering::Release, Ordering::Relaxed)
                    .is_ok()
                {
                    // Wake the lock-only waiters collected while unlocking.
                    let mut entry = self.private_queue.load(Ordering::Relaxed);
                    while !entry.is_null() {
                        // Safety: private-queue entries are live wait blocks
                        // whose parkers wait for exactly this wake.
                        unsafe {
                            let next = (*entry).flink.load(Ordering::Relaxed);
                            WaitBlock::from_entry(entry).parker().unpark(WAIT_SUCCESS);
                            entry = next;
                        }
                    }
                    return true;
                }
                self.front_request.store(0, Ordering::Relaxed);
            } else if self
                .lock_state
                .compare_exchange(state, LOCK_BUSY, Ordering::Acquire, Ordering::Relaxed)
                .is_ok()
            {
                // Safety: we hold the lock and exclusively own the captured
                // stack.
                let changed = unsafe { self.process_lock_queue(state) };
                if changed && !force {
                    return false;
                }
            }
        }
    }

    /// Flushes a captured contention stack into the queue. Returns whether
    /// any entry was spliced onto the queue.
    ///
    /// # Safety
    ///
    /// The caller must hold the queue's lock and own the captured stack.
    unsafe fn process_lock_queue(&self, mut first: *mut ListEntry) -> bool {
        let tail = self.head.blink.load(Ordering::Relaxed);
        let mut queue_changed = false;
        while !first.is_null() {
            // Safety: stack entries are live wait blocks; `Acquire` pairs
            // with the pushers' `Release` CAS.
            unsafe {
                let next = (*first).flink.load(Ordering::Acquire);
                let wait_block = WaitBlock::from_entry(first);
                let request = wait_block.request();
                if request == LOCK_ONLY_REQUEST {
                    (*first)
                        .flink
                        .store(self.private_queue.load(Ordering::Relaxed), Ordering::Relaxed);
                    self.private_queue.store(first, Ordering::Relaxed);
                } else if !wait_block.parker().is_locked() || request < 0 {
                    // Splicing right after the pre-flush tail keeps arrival
                    // order: the stack is newest-first.
                    list::insert_head(tail, first);
                    queue_changed = true;
                } else {
                    (*first).flink.store(first, Ordering::Release);
                }
                first = next;
            }
        }
        queue_changed
    }
}

// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! The mutant: a binary state plus a [`LockedQueue`] of waiters, the common
//! core of the fair lock and the synchronization event.
//!
//! The release protocol never loses a signal: a grant is taken either from
//! the state word (CAS 1→0) or from a `try_set` token passed by a setter,
//! handed directly to the queue's first eligible waiter, and restored when
//! that waiter turns out to be cancelled. A releaser keeps traversing while
//! the *release-pending* predicate holds: the published front request is
//! non-zero, the mutant is available, and the queue's lock can be taken.

use crate::alerter::Alerter;
use crate::list::{self, ListEntry};
use crate::locked_queue::LockedQueue;
use crate::loom::atomic::{AtomicI32, Ordering};
use crate::parker::{Parker, WAIT_SUCCESS, WAIT_TIMEOUT};
use crate::wait_block::{ACQUIRE, LOCKED_ACQUIRE, WaitBlock};
use std::time::Duration;

/// Binary state (0 = unavailable, 1 = available) with a fair waiter queue.
#[derive(Debug)]
pub struct Mutant {
    state: AtomicI32,
    queue: LockedQueue,
}

// === impl Mutant ===

impl Mutant {
    #[must_use]
    pub fn new(available: bool, spin_count: u32) -> Self {
        Self {
            state: AtomicI32::new(i32::from(available)),
            queue: LockedQueue::new(spin_count),
        }
    }

    #[inline]
    pub fn is_available(&self) -> bool {
        self.state.load(Ordering::Relaxed) == 1
    }

    /// Whether the queue's front waiter was eligible as of the last queue
    /// unlock. Readable without any lock.
    #[inline]
    pub fn has_queued_waiters(&self) -> bool {
        self.queue.front_request() != 0
    }

    /// Consumes the state when it is available and no queued waiter has
    /// precedence.
    pub fn try_acquire(&self) -> bool {
        self.state.load(Ordering::Relaxed) == 1
            && self.queue.front_request() == 0
            && self
                .state
                .compare_exchange(1, 0, Ordering::Acquire, Ordering::Relaxed)
                .is_ok()
    }

    /// Makes the state available and services the queue if a waiter can be
    /// released.
    pub fn release(&self) {
        self.state.store(1, Ordering::Release);
        if self.is_release_pending() {
            self.release_waiters_and_unlock_queue(false);
        }
    }

    /// Re-initializes the mutant. Only valid while no thread can reach it.
    pub(crate) fn reset_state(&self, available: bool) {
        self.state.store(i32::from(available), Ordering::Relaxed);
    }

    /// The release-pending probe; acquires the queue's lock when it fires.
    fn is_release_pending(&self) -> bool {
        self.queue.front_request() != 0
            && self.state.load(Ordering::Relaxed) != 0
            && self.queue.try_lock()
    }

    /// The heart of the fairness protocol. Called with the queue's lock
    /// held; returns with it released.
    ///
    /// When `try_set` is `true` the caller donates one grant that bypasses
    /// the state word. The return value reports whether that donation was
    /// *not* delivered (it ended up in the state word instead).
    pub(crate) fn release_waiters_and_unlock_queue(&self, try_set: bool) -> bool {
        let head = self.queue.head.as_ptr();
        let mut try_set = try_set;
        let mut try_set_used = false;

        loop {
            loop {
                if self.state.load(Ordering::Relaxed) == 0 && !try_set {
                    break;
                }
                // Safety: we hold the queue's lock.
                let entry = unsafe { (*head).flink.load(Ordering::Relaxed) };
                if entry == head {
                    break;
                }

                // Take a grant: the donated set, or the state word.
                if try_set {
                    try_set = false;
                    try_set_used = true;
                } else if self
                    .state
                    .compare_exchange(1, 0, Ordering::Acquire, Ordering::Relaxed)
                    .is_err()
                {
                    break;
                }

                // Safety: we hold the queue's lock and `entry` is linked.
                unsafe { list::remove_entry(entry) };
                // Safety: queued entries are live wait blocks.
                let wait_block = unsafe { WaitBlock::from_entry(entry) };
                if wait_block.parker().try_lock() || wait_block.request() < 0 {
                    wait_block.parker().unpark(wait_block.wait_key);
                } else {
                    // The waiter cancelled; put the grant back. If the state
                    // word cannot take it, carry it as a donation.
                    if try_set_used
                        || self.state.load(Ordering::Relaxed) == 1
                        || self
                            .state
                            .compare_exchange(0, 1, Ordering::Release, Ordering::Relaxed)
                            .is_err()
                    {
                        try_set = true;
                        try_set_used = false;
                    }
                    // Safety: the entry is unlinked and only its (cancelled)
                    // owner still observes it.
                    unsafe { (*entry).flink.store(entry, Ordering::Release); }
                }
            }

            // No releasable waiter is left; drop the queue's lock. The
            // unlock fails when new arrivals were flushed into a queue the
            // mutant could still service.
            if !self
                .queue
                .try_unlock(self.state.load(Ordering::Relaxed) == 0 && !try_set)
            {
                continue;
            }

            // An undelivered donation goes back into the state word.
            if try_set
                && self.state.load(Ordering::Relaxed) == 0
                && self
                    .state
                    .compare_exchange(0, 1, Ordering::Release, Ordering::Relaxed)
                    .is_ok()
            {
                try_set = false;
                try_set_used = true;
            }

            if !self.is_release_pending() {
                return !try_set_used;
            }
        }
    }

    /// Enqueues `wait_block` and services the queue when the enqueue itself
    /// exposed releasable waiters. Returns whether the block landed at the
    /// front.
    fn enqueue_waiter(&self, wait_block: &WaitBlock) -> bool {
        let (locked, first) = self.queue.enqueue(wait_block);
        if !locked {
            return first;
        }
        if !first || self.state.load(Ordering::Relaxed) == 0 {
            self.queue.try_unlock(true);
            if !self.is_release_pending() {
                return first;
            }
        }
        self.release_waiters_and_unlock_queue(false);
        first
    }

    /// Queued acquisition.
    pub fn slow_wait(
        &self,
        timeout: Option<Duration>,
        alerter: Option<&Alerter>,
        interruptible: bool,
    ) -> i32 {
        let parker = Parker::new(1);
        let wait_block = WaitBlock::new(&parker, ACQUIRE, WAIT_SUCCESS);

        // Spinning only pays off at the front of the queue.
        let first = self.enqueue_waiter(&wait_block);
        tracing::trace!(first, "queued on mutant");
        let spin = if first { self.queue.spin_count } else { 0 };
        let status = parker.park_ex(spin, timeout, alerter, interruptible);
        if status == WAIT_SUCCESS {
            return WAIT_SUCCESS;
        }
        self.unlink_entry(&wait_block.entry);
        status
    }

    /// Enqueues a wait block whose parker was already locked by the caller;
    /// the wait block is granted (and its parker unparked) by a later
    /// release even though it cannot be locked again.
    pub fn enqueue_locked(&self, wait_block: &WaitBlock) {
        wait_block.request.store(LOCKED_ACQUIRE, Ordering::Relaxed);
        self.enqueue_waiter(wait_block);
    }

    /// Removes a cancelled wait block from the queue, then reruns the
    /// release protocol on behalf of anyone the cancellation unblocked.
    fn unlink_entry(&self, entry: &ListEntry) {
        if !entry.is_dead() && self.queue.lock(Some(entry)) {
            if !entry.is_dead() {
                // Safety: we hold the queue's lock and the entry is linked.
                unsafe { list::remove_entry(entry.as_ptr()) };
            }
            self.release_waiters_and_unlock_queue(false);
        }
    }
}

/// An auto-reset synchronization event built on the mutant: a wait consumes
/// the signal, a set releases exactly one waiter (bypassing the state word
/// so barging acquirers cannot steal the signal) or latches the state.
#[derive(Debug)]
pub struct SyncEvent {
    mutant: Mutant,
}

// === impl SyncEvent ===

impl SyncEvent {
    #[must_use]
    pub fn new(signaled: bool, spin_count: u32) -> Self {
        Self {
            mutant: Mutant::new(signaled, spin_count),
        }
    }

    #[inline]
    pub fn is_set(&self) -> bool {
        self.mutant.is_available()
    }

    /// Signals the event. Returns `true` when it was already signaled.
    pub fn set(&self) -> bool {
        loop {
            if self.mutant.is_available() {
                return true;
            }
            if self.mutant.has_queued_waiters() && self.mutant.queue.try_lock() {
                self.mutant.release_waiters_and_unlock_queue(true);
                return false;
            }
            if self
                .mutant
                .state
                .compare_exchange(0, 1, Ordering::Release, Ordering::Relaxed)
                .is_ok()
            {
                if self.mutant.is_release_pending() {
                    self.mutant.release_waiters_and_unlock_queue(false);
                }
                return false;
            }
        }
    }

    /// Returns the event to unsignaled. Returns `true` when it was signaled.
    pub fn reset(&self) -> bool {
        self.mutant
            .state
            .compare_exchange(1, 0, Ordering::Acquire, Ordering::Relaxed)
            .is_ok()
    }

    pub fn wait(&self, timeout: Option<Duration>) -> i32 {
        self.wait_ex(timeout, None, false)
    }

    pub fn wait_ex(
        &self,
        timeout: Option<Duration>,
        alerter: Option<&Alerter>,
        interruptible: bool,
    ) -> i32 {
        if self.mutant.try_acquire() {
            return WAIT_SUCCESS;
        }
        if timeout == Some(Duration::ZERO) {
            return WAIT_TIMEOUT;
        }
        self.mutant.slow_wait(timeout, alerter, interruptible)
    }
}

#[cfg(all(test, not(loom)))]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering as StdOrdering};
    use std::thread;

    #[test]
    fn sync_event_set_before_wait() {
        let event = SyncEvent::new(true, 0);
        assert!(event.is_set());
        assert_eq!(event.wait(None), WAIT_SUCCESS);
        // Auto-reset: the signal was consumed.
        assert!(!event.is_set());
        assert_eq!(event.wait(Some(Duration::ZERO)), WAIT_TIMEOUT);
    }

    #[test]
    fn sync_event_releases_one_waiter_per_set() {
        let event = Arc::new(SyncEvent::new(false, 0));
        let woken = Arc::new(AtomicUsize::new(0));
        let mut handles = Vec::new();
        for _ in 0..3 {
            let event = Arc::clone(&event);
            let woken = Arc::clone(&woken);
            handles.push(thread::spawn(move || {
                assert_eq!(event.wait(None), WAIT_SUCCESS);
                woken.fetch_add(1, StdOrdering::SeqCst);
            }));
        }
        thread::sleep(Duration::from_millis(20));
        for expected in 1..=3 {
            event.set();
            let deadline = std::time::Instant::now() + Duration::from_secs(5);
            while woken.load(StdOrdering::SeqCst) < expected {
                assert!(std::time::Instant::now() < deadline, "missing wakeup");
                thread::yield_now();
            }
            // One set wakes exactly one waiter.
            thread::sleep(Duration::from_millis(10));
            assert_eq!(woken.load(StdOrdering::SeqCst), expected);
        }
        for handle in handles {
            handle.join().unwrap();
        }
    }

    #[test]
    fn sync_event_set_reset_round_trip() {
        let event = SyncEvent::new(false, 0);
        assert!(!event.set());
        assert!(event.set());
        assert!(event.reset());
        assert!(!event.reset());
    }

    #[test]
    fn timed_out_waiter_does_not_eat_a_later_set() {
        let event = Arc::new(SyncEvent::new(false, 0));
        assert_eq!(event.wait(Some(Duration::from_millis(10))), WAIT_TIMEOUT);
        event.set();
        assert_eq!(event.wait(Some(Duration::ZERO)), WAIT_SUCCESS);
    }
}

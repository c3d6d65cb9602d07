// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! The notification event: a sticky broadcast event.
//!
//! Once set the event stays set and waiters complete without blocking. The
//! state is a tagged pointer:
//!
//! - `0`: empty, not set
//! - `SET` (set bit alone): set, no waiters
//! - `RESET_LOCKED` (lock bit alone): transitory, lock held, empty list
//! - `ptr`: wait list, unlocked
//! - `ptr | lock`: wait list, lock held by a cancelling thread
//! - `ptr | set`: wait list with a set recorded while the lock was held;
//!   the unlocking thread performs the wake-up
//!
//! The wait list is singly linked through the wait blocks' `flink` and null
//! terminated; pushes preserve the lock bit.

use crate::list::ListEntry;
use crate::loom::atomic::{AtomicUsize, Ordering};
use crate::parker::{Parker, WAIT_SUCCESS, WAIT_TIMEOUT};
use crate::spin::SpinWait;
use crate::wait_block::WaitBlock;
use crate::alerter::Alerter;
use core::ptr;
use std::time::Duration;

const LOCK: usize = 1;
const SET: usize = 2;
const PTR_MASK: usize = !(LOCK | SET);

/// A sticky broadcast event.
#[derive(Debug)]
pub struct NotificationEvent {
    state: AtomicUsize,
    spin_count: u32,
}

// === impl NotificationEvent ===

impl NotificationEvent {
    #[must_use]
    pub fn new(signaled: bool, spin_count: u32) -> Self {
        Self {
            state: AtomicUsize::new(if signaled { SET } else { 0 }),
            spin_count: if crate::spin::is_multi_processor() {
                spin_count
            } else {
                0
            },
        }
    }

    #[inline]
    pub fn is_set(&self) -> bool {
        self.state.load(Ordering::Acquire) & SET != 0
    }

    /// Sets the event, waking every current waiter. Returns `true` when the
    /// event was already set.
    pub fn set(&self) -> bool {
        loop {
            let state = self.state.load(Ordering::Acquire);
            if state & SET != 0 {
                return true;
            }
            if state & LOCK != 0 {
                // A cancelling thread holds the list; record the set and
                // leave the wake-up to it.
                if self
                    .state
                    .compare_exchange_weak(state, state | SET, Ordering::Release, Ordering::Relaxed)
                    .is_ok()
                {
                    return false;
                }
            } else if self
                .state
                .compare_exchange_weak(state, SET, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
            {
                // Safety: the captured list is now exclusively ours; wait
                // blocks stay alive until unparked or self-linked.
                unsafe {
                    self.unpark_wait_list(ptr::with_exposed_provenance_mut::<ListEntry>(
                        state & PTR_MASK,
                    ));
                }
                return false;
            }
        }
    }

    /// Resets the event to unsignaled. Returns `true` when it was set.
    pub fn reset(&self) -> bool {
        let mut spinner = SpinWait::new();
        loop {
            let state = self.state.load(Ordering::Acquire);
            if state & SET == 0 {
                return false;
            }
            if state & LOCK == 0
                && self
                    .state
                    .compare_exchange(SET, 0, Ordering::AcqRel, Ordering::Relaxed)
                    .is_ok()
            {
                return true;
            }
            spinner.spin_once();
        }
    }

    /// Waits for the event to be set.
    pub fn wait(&self, timeout: Option<Duration>) -> i32 {
        self.wait_ex(timeout, None, false)
    }

    pub fn wait_ex(
        &self,
        timeout: Option<Duration>,
        alerter: Option<&Alerter>,
        interruptible: bool,
    ) -> i32 {
        if self.is_set() {
            return WAIT_SUCCESS;
        }
        if timeout == Some(Duration::ZERO) {
            return WAIT_TIMEOUT;
        }
        self.slow_wait(timeout, alerter, interruptible)
    }

    fn slow_wait(
        &self,
        timeout: Option<Duration>,
        alerter: Option<&Alerter>,
        interruptible: bool,
    ) -> i32 {
        let parker = Parker::new(1);
        let wait_block = WaitBlock::new(&parker, 0, WAIT_SUCCESS);
        let entry = wait_block.entry.as_ptr();

        let was_empty;
        loop {
            let state = self.state.load(Ordering::Acquire);
            if state & SET != 0 {
                return WAIT_SUCCESS;
            }
            wait_block.entry.flink.store(
                ptr::with_exposed_provenance_mut::<ListEntry>(state & PTR_MASK),
                Ordering::Relaxed,
            );
            let next = entry.expose_provenance() | (state & LOCK);
            if self
                .state
                .compare_exchange_weak(state, next, Ordering::Release, Ordering::Relaxed)
                .is_ok()
            {
                was_empty = state & PTR_MASK == 0;
                break;
            }
        }

        // Only the first waiter spins; set wakes it before the others.
        tracing::trace!(was_empty, "queued on notification event");
        let spin = if was_empty { self.spin_count } else { 0 };
        let status = parker.park_ex(spin, timeout, alerter, interruptible);
        if status == WAIT_SUCCESS {
            return WAIT_SUCCESS;
        }
        self.unlink_entry(&wait_block.entry);
        status
    }

    /// Wakes a captured wait list. When spinning is configured and the list
    /// has more than one entry, the tail entry (the one still spinning) is
    /// released first to minimize its wake latency.
    ///
    /// # Safety
    ///
    /// `list` must be exclusively owned by the caller.
    unsafe fn unpark_wait_list(&self, mut list: *mut ListEntry) {
        if list.is_null() {
            return;
        }
        // Safety for all blocks below: ensured by caller.
        if self.spin_count != 0 && unsafe { !(*list).flink.load(Ordering::Relaxed).is_null() } {
            unsafe {
                let mut prev = list;
                let mut next;
                loop {
                    next = (*prev).flink.load(Ordering::Relaxed);
                    if next.is_null() || (*next).flink.load(Ordering::Relaxed).is_null() {
                        break;
                    }
                    prev = next;
                }
                if !next.is_null() {
                    (*prev).flink.store(ptr::null_mut(), Ordering::Relaxed);
                    unpark_list_entry(next);
                }
            }
        }
        while !list.is_null() {
            // Safety: ensured by caller.
            unsafe {
                let next = (*list).flink.load(Ordering::Relaxed);
                unpark_list_entry(list);
                list = next;
            }
        }
    }

    fn unlink_entry(&self, entry: &ListEntry) {
        let entry_addr = entry.as_ptr().expose_provenance();
        if entry.is_dead() {
            return;
        }
        if self.state.load(Ordering::Acquire) == entry_addr
            && entry.flink.load(Ordering::Relaxed).is_null()
            && self
                .state
                .compare_exchange(entry_addr, 0, Ordering::AcqRel, Ordering::Relaxed)
                .is_ok()
        {
            return;
        }
        self.slow_unlink_entry(entry);
    }

    /// Cancellation slow path: seize the lock bit, rebuild the list without
    /// locked parkers, then restore the state honoring a set recorded while
    /// the lock was held.
    fn slow_unlink_entry(&self, entry: &ListEntry) {
        let entry_addr = entry.as_ptr().expose_provenance();
        let mut spinner = SpinWait::new();

        let captured;
        loop {
            let state = self.state.load(Ordering::Acquire);
            if entry.is_dead() {
                return;
            }
            if state & (LOCK | SET) == 0 && state != 0 {
                if state == entry_addr && entry.flink.load(Ordering::Relaxed).is_null() {
                    if self
                        .state
                        .compare_exchange(state, 0, Ordering::AcqRel, Ordering::Relaxed)
                        .is_ok()
                    {
                        return;
                    }
                } else if self
                    .state
                    .compare_exchange(state, LOCK, Ordering::AcqRel, Ordering::Relaxed)
                    .is_ok()
                {
                    captured = ptr::with_exposed_provenance_mut::<ListEntry>(state & PTR_MASK);
                    break;
                }
            }
            spinner.spin_once();
        }

        // Rebuild the captured list from its non-locked entries.
        let mut first: *mut ListEntry = ptr::null_mut();
        let mut last: *mut ListEntry = ptr::null_mut();
        let mut current = captured;
        while !current.is_null() {
            // Safety: the captured list is exclusively ours; wait blocks
            // stay alive until self-linked or restored.
            unsafe {
                let next = (*current).flink.load(Ordering::Relaxed);
                if WaitBlock::from_entry(current).parker().is_locked() {
                    (*current).flink.store(current, Ordering::Release);
                } else if first.is_null() {
                    (*current).flink.store(ptr::null_mut(), Ordering::Relaxed);
                    first = current;
                    last = current;
                } else {
                    (*last).flink.store(current, Ordering::Relaxed);
                    (*current).flink.store(ptr::null_mut(), Ordering::Relaxed);
                    last = current;
                }
                current = next;
            }
        }

        // Clear the lock bit, returning the survivors to the wait list.
        loop {
            let state = self.state.load(Ordering::Acquire);
            if state & SET != 0 {
                // A setter arrived while we held the lock: the event is now
                // set; wake the survivors plus anything pushed meanwhile.
                let pushed = ptr::with_exposed_provenance_mut::<ListEntry>(state & PTR_MASK);
                self.state.store(SET, Ordering::Release);
                let all = if first.is_null() {
                    pushed
                } else {
                    if !pushed.is_null() {
                        // Safety: survivors are exclusively ours.
                        unsafe { (*last).flink.store(pushed, Ordering::Relaxed); }
                    }
                    first
                };
                // Safety: both sub-lists are exclusively ours now.
                unsafe { self.unpark_wait_list(all); }
                break;
            }

            let pushed = state & PTR_MASK;
            let next = if first.is_null() {
                pushed
            } else {
                // Safety: survivors are exclusively ours until published.
                unsafe {
                    (*last).flink.store(
                        ptr::with_exposed_provenance_mut::<ListEntry>(pushed),
                        Ordering::Relaxed,
                    );
                }
                first.expose_provenance()
            };
            if self
                .state
                .compare_exchange_weak(state, next, Ordering::Release, Ordering::Relaxed)
                .is_ok()
            {
                break;
            }
        }

        // A racing walker may still be about to self-link our entry.
        while !entry.is_dead() {
            spinner.spin_once();
        }
    }
}

/// Wakes the waiter behind one wait list entry, self-linking it when its
/// parker was already cancelled.
///
/// # Safety
///
/// `entry` must belong to a captured wait list exclusively owned by the
/// caller.
unsafe fn unpark_list_entry(entry: *mut ListEntry) {
    // Safety: ensured by caller.
    unsafe {
        let wait_block = WaitBlock::from_entry(entry);
        if wait_block.parker().try_lock() {
            wait_block.parker().unpark(wait_block.wait_key);
        } else {
            (*entry).flink.store(entry, Ordering::Release);
        }
    }
}

#[cfg(all(test, not(loom)))]
mod tests {
    use super::*;
    use crate::parker::WAIT_ALERTED;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn set_before_wait() {
        let event = NotificationEvent::new(true, 0);
        assert!(event.is_set());
        assert_eq!(event.wait(None), WAIT_SUCCESS);
        assert_eq!(event.wait(Some(Duration::ZERO)), WAIT_SUCCESS);
    }

    #[test]
    fn wait_times_out_while_unset() {
        let event = NotificationEvent::new(false, 0);
        assert_eq!(event.wait(Some(Duration::ZERO)), WAIT_TIMEOUT);
        assert_eq!(event.wait(Some(Duration::from_millis(10))), WAIT_TIMEOUT);
    }

    #[test]
    fn set_wakes_all_waiters() {
        let event = Arc::new(NotificationEvent::new(false, 128));
        let mut handles = Vec::new();
        for _ in 0..4 {
            let event = Arc::clone(&event);
            handles.push(thread::spawn(move || event.wait(None)));
        }
        thread::sleep(Duration::from_millis(20));
        assert!(!event.set());
        for handle in handles {
            assert_eq!(handle.join().unwrap(), WAIT_SUCCESS);
        }
        // Sticky: the event stays set.
        assert!(event.is_set());
        assert_eq!(event.wait(None), WAIT_SUCCESS);
    }

    #[test]
    fn set_then_reset_round_trip() {
        let event = NotificationEvent::new(false, 0);
        assert!(!event.set());
        assert!(event.set());
        assert!(event.reset());
        assert!(!event.reset());
        assert!(!event.is_set());
        assert_eq!(event.wait(Some(Duration::ZERO)), WAIT_TIMEOUT);
    }

    #[test]
    fn alerted_waiter_is_unlinked_and_later_set_still_works() {
        let event = Arc::new(NotificationEvent::new(false, 0));
        let alerter = Arc::new(Alerter::new());
        let handle = {
            let event = Arc::clone(&event);
            let alerter = Arc::clone(&alerter);
            thread::spawn(move || event.wait_ex(None, Some(&alerter), false))
        };
        thread::sleep(Duration::from_millis(10));
        alerter.set();
        assert_eq!(handle.join().unwrap(), WAIT_ALERTED);

        // The cancelled wait block left no trace.
        let event2 = Arc::clone(&event);
        let waiter = thread::spawn(move || event2.wait(None));
        thread::sleep(Duration::from_millis(10));
        event.set();
        assert_eq!(waiter.join().unwrap(), WAIT_SUCCESS);
    }

    #[test]
    fn timed_out_waiter_among_survivors() {
        let event = Arc::new(NotificationEvent::new(false, 0));
        let short = {
            let event = Arc::clone(&event);
            thread::spawn(move || event.wait(Some(Duration::from_millis(10))))
        };
        let long = {
            let event = Arc::clone(&event);
            thread::spawn(move || event.wait(None))
        };
        assert_eq!(short.join().unwrap(), WAIT_TIMEOUT);
        event.set();
        assert_eq!(long.join().unwrap(), WAIT_SUCCESS);
    }
}

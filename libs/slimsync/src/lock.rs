// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! A non-fair lock whose contenders queue wait-free.
//!
//! The state word is `LOCK_FREE`, `LOCK_BUSY`, or a stack of wait blocks.
//! Unlocking releases every queued contender at once and lets them barge.

use crate::list::{self, LOCK_BUSY, LOCK_FREE, ListEntry};
use crate::loom::atomic::{AtomicPtr, Ordering};
use crate::parker::{Parker, WAIT_SUCCESS};
use crate::spin::{SpinWait, spin_wait};
use crate::wait_block::WaitBlock;
use std::time::{Duration, Instant};

/// Spin count used by [`RawLock::INIT`].
pub const DEFAULT_SPIN_COUNT: u32 = 100;

/// The raw non-fair lock. Usable directly or through [`lock_api`] as
/// [`crate::Mutex`].
#[derive(Debug)]
pub struct RawLock {
    state: AtomicPtr<ListEntry>,
    spin_count: u32,
}

/// Alias kept for symmetry with the other synchronizers.
pub type Lock = RawLock;

// === impl RawLock ===

impl RawLock {
    #[must_use]
    pub fn new(spin_count: u32) -> Self {
        Self {
            state: AtomicPtr::new(LOCK_FREE),
            spin_count,
        }
    }

    #[inline]
    fn effective_spin(&self) -> u32 {
        if crate::spin::is_multi_processor() {
            self.spin_count
        } else {
            0
        }
    }

    #[inline]
    pub fn try_enter(&self) -> bool {
        self.state.load(Ordering::Relaxed) == LOCK_FREE
            && self
                .state
                .compare_exchange(LOCK_FREE, LOCK_BUSY, Ordering::Acquire, Ordering::Relaxed)
                .is_ok()
    }

    pub fn enter(&self) {
        if !self.try_enter() {
            self.slow_enter(None);
        }
    }

    /// Bounded acquisition; `None` means wait forever.
    pub fn try_enter_ex(&self, timeout: Option<Duration>) -> bool {
        if self.try_enter() {
            return true;
        }
        if timeout == Some(Duration::ZERO) {
            return false;
        }
        self.slow_enter(timeout)
    }

    pub fn exit(&self) {
        let state = self.state.swap(LOCK_FREE, Ordering::AcqRel);
        // Safety: the captured stack is exclusively ours.
        unsafe { unpark_wait_list(state); }
    }

    fn slow_enter(&self, timeout: Option<Duration>) -> bool {
        tracing::trace!(?timeout, "contended lock enter");
        let deadline = timeout.and_then(|t| Instant::now().checked_add(t));
        let parker = Parker::new(1);
        let wait_block = WaitBlock::new(&parker, 0, WAIT_SUCCESS);

        loop {
            let mut spin = self.effective_spin();
            loop {
                let state = self.state.load(Ordering::Relaxed);
                if state == LOCK_FREE {
                    if self
                        .state
                        .compare_exchange(
                            LOCK_FREE,
                            LOCK_BUSY,
                            Ordering::Acquire,
                            Ordering::Relaxed,
                        )
                        .is_ok()
                    {
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
                let state = self.state.load(Ordering::Relaxed);
                if state == LOCK_FREE {
                    if self
                        .state
                        .compare_exchange(
                            LOCK_FREE,
                            LOCK_BUSY,
                            Ordering::Acquire,
                            Ordering::Relaxed,
                        )
                        .is_ok()
                    {
                        return true;
                    }
                    continue;
                }
                wait_block.entry.flink.store(state, Ordering::Relaxed);
                if self
                    .state
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

            let remaining = match deadline {
                None => None,
                Some(d) => Some(d.saturating_duration_since(Instant::now())),
            };
            let status = parker.park_ex(0, remaining, None, false);
            if status != WAIT_SUCCESS {
                self.unlink_entry(&wait_block.entry);
                return false;
            }
            if self.try_enter() {
                return true;
            }
            if let Some(d) = deadline {
                if Instant::now() >= d {
                    return false;
                }
            }
        }
    }

    /// Removes a timed-out contender from the stack by seizing the whole
    /// stack and waking everyone else.
    fn unlink_entry(&self, entry: &ListEntry) {
        loop {
            if entry.is_dead() {
                return;
            }
            let state = self.state.load(Ordering::Relaxed);
            if state == LOCK_BUSY || state == LOCK_FREE {
                break;
            }
            if self
                .state
                .compare_exchange(state, LOCK_BUSY, Ordering::Acquire, Ordering::Relaxed)
                .is_ok()
            {
                if state == entry.as_ptr() && entry.flink.load(Ordering::Relaxed) == LOCK_BUSY {
                    return;
                }
                // Safety: the captured stack is exclusively ours; our own
                // cancelled entry gets self-linked by the walk.
                unsafe { unpark_wait_list(state); }
                break;
            }
        }
        let mut spinner = SpinWait::new();
        while !entry.is_dead() {
            spinner.spin_once();
        }
    }
}

/// Wakes every wait block on a captured contention stack; cancelled entries
/// are self-linked instead.
///
/// # Safety
///
/// The stack must be exclusively owned by the caller.
unsafe fn unpark_wait_list(mut entry: *mut ListEntry) {
    if entry == LOCK_BUSY || entry == LOCK_FREE {
        return;
    }
    // Collect the lockable waiters first so no freshly woken barger can
    // invalidate the stack under us.
    let mut wake_stack: *mut ListEntry = core::ptr::null_mut();
    while entry != LOCK_BUSY {
        // Safety: ensured by caller; `Acquire` pairs with the pushers'
        // `Release`.
        unsafe {
            let next = (*entry).flink.load(Ordering::Acquire);
            if WaitBlock::from_entry(entry).parker().try_lock() {
                (*entry).blink.store(wake_stack, Ordering::Relaxed);
                wake_stack = entry;
            } else {
                (*entry).flink.store(entry, Ordering::Release);
            }
            entry = next;
        }
    }
    while !wake_stack.is_null() {
        // Safety: locked entries are ours to wake.
        unsafe {
            let next = (*wake_stack).blink.load(Ordering::Relaxed);
            let wait_block = WaitBlock::from_entry(wake_stack);
            wait_block.parker().unpark(wait_block.wait_key);
            wake_stack = next;
        }
    }
}

#[cfg(not(loom))]
// Safety: `RawLock::exit` is only called by lock_api with the lock held.
unsafe impl lock_api::RawMutex for RawLock {
    #[allow(
        clippy::declare_interior_mutable_const,
        reason = "lock_api requires an interior-mutable INIT"
    )]
    const INIT: Self = Self {
        state: AtomicPtr::new(LOCK_FREE),
        spin_count: DEFAULT_SPIN_COUNT,
    };

    type GuardMarker = lock_api::GuardSend;

    fn lock(&self) {
        self.enter();
    }

    fn try_lock(&self) -> bool {
        self.try_enter()
    }

    unsafe fn unlock(&self) {
        self.exit();
    }

    fn is_locked(&self) -> bool {
        self.state.load(Ordering::Relaxed) != LOCK_FREE
    }
}

#[cfg(all(test, not(loom)))]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn try_enter_and_exit() {
        let lock = RawLock::new(DEFAULT_SPIN_COUNT);
        assert!(lock.try_enter());
        assert!(!lock.try_enter());
        lock.exit();
        assert!(lock.try_enter());
        lock.exit();
    }

    #[test]
    fn contended_counter() {
        let lock = Arc::new(crate::Mutex::new(0u64));
        let mut handles = Vec::new();
        for _ in 0..4 {
            let lock = Arc::clone(&lock);
            handles.push(thread::spawn(move || {
                for _ in 0..1000 {
                    *lock.lock() += 1;
                }
            }));
        }
        for handle in handles {
            handle.join().unwrap();
        }
        assert_eq!(*lock.lock(), 4000);
    }

    #[test]
    fn bounded_enter_times_out() {
        let lock = Arc::new(RawLock::new(0));
        lock.enter();
        let contender = Arc::clone(&lock);
        let handle = thread::spawn(move || {
            let acquired = contender.try_enter_ex(Some(Duration::from_millis(20)));
            if acquired {
                contender.exit();
            }
            acquired
        });
        assert!(!handle.join().unwrap());
        lock.exit();
        assert!(lock.try_enter());
        lock.exit();
    }

    #[test]
    fn zero_timeout_is_a_try() {
        let lock = RawLock::new(0);
        lock.enter();
        assert!(!lock.try_enter_ex(Some(Duration::ZERO)));
        lock.exit();
        assert!(lock.try_enter_ex(Some(Duration::ZERO)));
        lock.exit();
    }
}

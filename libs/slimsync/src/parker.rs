// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! The parker: a single-shot synchronization object bound to one thread for
//! one wait.
//!
//! The state word packs a 16-bit lock count with a `WAIT_IN_PROGRESS` flag
//! (bit 31). Releasers decrement the count with [`Parker::try_lock`]; the
//! caller that observes the count reach zero becomes the unique unparker.
//! [`Parker::try_cancel`] clears the count while preserving the flag, making
//! the canceller the unique wake path instead. The waiter itself clears the
//! flag before sleeping on its [`ParkSpot`]; an unparker that finds the flag
//! already clear must post the spot, and one that clears the flag itself
//! must not.

use crate::alerter::Alerter;
use crate::loom::atomic::{AtomicI32, AtomicPtr, Ordering};
use crate::park_spot::ParkSpot;
use crate::spin::spin_wait;
use core::ptr;
use std::time::Duration;

/// The wait was satisfied.
pub const WAIT_SUCCESS: i32 = 0;
/// The wait was cancelled by an [`Alerter`].
pub const WAIT_ALERTED: i32 = 257;
/// The wait timed out.
pub const WAIT_TIMEOUT: i32 = 258;
/// The wait was broken by a host interruption request.
pub const WAIT_INTERRUPTED: i32 = 512;

const WAIT_IN_PROGRESS: i32 = i32::MIN;
const LOCK_COUNT_MASK: i32 = (1 << 16) - 1;

/// Classification helpers over raw wait-status codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitStatus {
    Success,
    Timeout,
    Alerted,
    Interrupted,
}

// === impl WaitStatus ===

impl WaitStatus {
    /// Classifies a raw status code. Codes below [`WAIT_ALERTED`] other than
    /// [`WAIT_TIMEOUT`] report success carrying a wait key.
    #[must_use]
    pub fn from_raw(raw: i32) -> Self {
        match raw {
            WAIT_TIMEOUT => Self::Timeout,
            WAIT_ALERTED => Self::Alerted,
            WAIT_INTERRUPTED => Self::Interrupted,
            _ => Self::Success,
        }
    }
}

/// A single-shot wait object. See the module docs for the protocol.
#[derive(Debug)]
pub struct Parker {
    /// Link used while registered with an [`Alerter`]; self-pointing once
    /// removed from the registration list.
    pub(crate) next: AtomicPtr<Parker>,
    state: AtomicI32,
    spot: AtomicPtr<ParkSpot>,
    wait_status: AtomicI32,
}

// === impl Parker ===

impl Parker {
    /// Creates a parker whose wait completes after `count` releases.
    #[must_use]
    pub fn new(count: u16) -> Self {
        Self {
            next: AtomicPtr::new(ptr::null_mut()),
            state: AtomicI32::new(i32::from(count) | WAIT_IN_PROGRESS),
            spot: AtomicPtr::new(ptr::null_mut()),
            wait_status: AtomicI32::new(WAIT_SUCCESS),
        }
    }

    /// Re-arms the parker for another wait. Only the owning thread may call
    /// this, and only while no other thread can reach the parker.
    pub fn reset(&self, count: u16) {
        self.next.store(ptr::null_mut(), Ordering::Relaxed);
        self.spot.store(ptr::null_mut(), Ordering::Relaxed);
        self.state
            .store(i32::from(count) | WAIT_IN_PROGRESS, Ordering::Relaxed);
    }

    /// Whether the lock count has already been driven to zero (or cleared by
    /// a cancellation).
    #[inline]
    pub fn is_locked(&self) -> bool {
        self.state.load(Ordering::Acquire) & LOCK_COUNT_MASK == 0
    }

    /// Decrements the lock count. Returns `true` for exactly one caller: the
    /// one whose decrement reaches zero and who must therefore unpark the
    /// waiter.
    pub fn try_lock(&self) -> bool {
        loop {
            let state = self.state.load(Ordering::Acquire);
            if state & LOCK_COUNT_MASK == 0 {
                return false;
            }
            if self
                .state
                .compare_exchange_weak(state, state - 1, Ordering::AcqRel, Ordering::Relaxed)
                .is_ok()
            {
                return state & LOCK_COUNT_MASK == 1;
            }
        }
    }

    /// Atomically clears the lock count, preserving the wait-in-progress
    /// flag. Returns `true` when the count was non-zero: the caller is now
    /// the unique wake path and owns the wait block cleanup.
    pub fn try_cancel(&self) -> bool {
        loop {
            let state = self.state.load(Ordering::Acquire);
            if state & LOCK_COUNT_MASK == 0 {
                return false;
            }
            if self
                .state
                .compare_exchange_weak(
                    state,
                    state & WAIT_IN_PROGRESS,
                    Ordering::AcqRel,
                    Ordering::Relaxed,
                )
                .is_ok()
            {
                return true;
            }
        }
    }

    /// Publishes `wait_status` and clears the state. Returns `true` when the
    /// waiter had not yet begun sleeping, in which case no park-spot post is
    /// needed.
    pub fn unpark_in_progress(&self, wait_status: i32) -> bool {
        self.wait_status.store(wait_status, Ordering::Relaxed);
        self.state.load(Ordering::Relaxed) & WAIT_IN_PROGRESS != 0
            && self.state.swap(0, Ordering::AcqRel) & WAIT_IN_PROGRESS != 0
    }

    /// Unparks the waiter bound to this parker with the given status.
    pub fn unpark(&self, wait_status: i32) {
        if !self.unpark_in_progress(wait_status) {
            let spot = self.spot.load(Ordering::Acquire);
            // Safety: the waiter published its spot before clearing the
            // wait-in-progress flag and cannot release it before consuming
            // the token posted here.
            unsafe { (*spot).set(); }
        }
    }

    /// Completes the wait from the waiting thread itself (timeout,
    /// interruption or alert on the self-cancellation path).
    pub fn unpark_self(&self, wait_status: i32) {
        self.wait_status.store(wait_status, Ordering::Relaxed);
        self.state.store(0, Ordering::Release);
    }

    /// Parks the calling thread with an infinite, non-interruptible wait.
    pub fn park(&self) -> i32 {
        self.park_ex(0, None, None, false)
    }

    /// Parks the calling thread until the parker is unparked, spinning up to
    /// `spin_count` iterations first.
    ///
    /// Returns the wait status the unparker published, [`WAIT_TIMEOUT`] when
    /// `timeout` elapsed, [`WAIT_ALERTED`] when `alerter` fired first, or
    /// [`WAIT_INTERRUPTED`] when `interruptible` and the host requested
    /// interruption.
    pub fn park_ex(
        &self,
        spin_count: u32,
        timeout: Option<Duration>,
        alerter: Option<&Alerter>,
        interruptible: bool,
    ) -> i32 {
        let mut spin = spin_count;
        loop {
            if self.state.load(Ordering::Acquire) >= 0 {
                return self.wait_status.load(Ordering::Relaxed);
            }
            if spin == 0 {
                break;
            }
            spin -= 1;
            if let Some(alerter) = alerter {
                if alerter.is_set() && self.try_cancel() {
                    return WAIT_ALERTED;
                }
            }
            spin_wait(1);
        }

        let spot = ParkSpot::alloc();
        self.spot.store(spot.as_ptr(), Ordering::Release);

        // Clear the wait-in-progress flag; from here on an unparker must
        // post the spot to wake us.
        loop {
            let state = self.state.load(Ordering::Acquire);
            if state & WAIT_IN_PROGRESS == 0 {
                // Safety: no unparker can reach the spot, the flag was
                // already clear when it completed the unpark.
                unsafe { ParkSpot::free(spot); }
                return self.wait_status.load(Ordering::Relaxed);
            }
            if self
                .state
                .compare_exchange_weak(
                    state,
                    state & !WAIT_IN_PROGRESS,
                    Ordering::Release,
                    Ordering::Relaxed,
                )
                .is_ok()
            {
                break;
            }
        }

        let mut timeout = timeout;
        let mut registered = false;
        if let Some(alerter) = alerter {
            registered = alerter.register(self);
            if !registered {
                // The alerter fired before we could register.
                if self.try_cancel() {
                    self.unpark_self(WAIT_ALERTED);
                    // Safety: we are the unique wake path, nothing was or
                    // will be posted.
                    unsafe { ParkSpot::free(spot); }
                    return WAIT_ALERTED;
                }
                // A racing unparker owns the wakeup; wait for its post.
                timeout = None;
            }
        }

        // Safety: the spot stays allocated until we free it below.
        let wait_result = unsafe { spot.as_ref() }.wait(timeout, interruptible);
        if wait_result != 1 {
            if self.try_cancel() {
                self.unpark_self(if wait_result == 0 {
                    WAIT_TIMEOUT
                } else {
                    WAIT_INTERRUPTED
                });
            } else {
                // Someone unparked us between the failed wait and the
                // cancellation attempt; consume the token they posted so the
                // spot can be reused.
                // Safety: as above.
                let consumed = unsafe { spot.as_ref() }.wait(None, false);
                debug_assert_eq!(consumed, 1);
            }
        }

        if registered {
            if let Some(alerter) = alerter {
                alerter.deregister(self);
            }
        }

        // Safety: every posted token has been consumed and the unparker, if
        // any, finished with the spot before we could observe its post.
        unsafe { ParkSpot::free(spot); }
        self.wait_status.load(Ordering::Acquire)
    }
}

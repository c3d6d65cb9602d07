// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! The OS-level sleep/wake handle threads park on.
//!
//! A park spot is a one-shot counting semaphore with initial count zero.
//! Spots are cached on a per-thread free list because a thread may end up
//! waiting in more than one place at a time (nested waits while handling
//! signals, for example); live spots are registered with the owning thread's
//! host record so an interrupter can find and wake them. An interruptible
//! wait observes the owning thread's pending-interruption flag; the flag is
//! consumed later at an interruption checkpoint, not here.

use crate::host;
use core::ptr::NonNull;
use std::cell::RefCell;
use std::sync::{Condvar, Mutex, PoisonError};
use std::time::{Duration, Instant};

/// A one-shot wake primitive. `set` posts a token; `wait` consumes one.
#[derive(Debug, Default)]
pub struct ParkSpot {
    tokens: Mutex<u32>,
    cvar: Condvar,
}

// === impl ParkSpot ===

impl ParkSpot {
    fn new() -> Self {
        Self::default()
    }

    /// Posts one wake token.
    pub fn set(&self) {
        let mut tokens = self.tokens.lock().unwrap_or_else(PoisonError::into_inner);
        *tokens += 1;
        drop(tokens);
        self.cvar.notify_one();
    }

    /// Wakes the waiter, if any, without posting a token, so that an
    /// interruptible wait re-examines the owning thread's interruption flag.
    /// A non-interruptible waiter goes back to sleep. The lock round trip
    /// orders the wake after the waiter's last flag check.
    pub(crate) fn poke(&self) {
        drop(self.tokens.lock().unwrap_or_else(PoisonError::into_inner));
        self.cvar.notify_all();
    }

    /// Blocks until a token is posted.
    ///
    /// Returns `1` when a token was consumed, `0` on timeout and `-1` when
    /// `interruptible` and the owning thread has a pending interruption
    /// request (which stays pending until the next checkpoint).
    pub fn wait(&self, timeout: Option<Duration>, interruptible: bool) -> i32 {
        let deadline = timeout.and_then(|t| Instant::now().checked_add(t));
        let infinite = timeout.is_none();
        let mut tokens = self.tokens.lock().unwrap_or_else(PoisonError::into_inner);
        loop {
            if *tokens > 0 {
                *tokens -= 1;
                return 1;
            }
            if interruptible && host::interruption_requested() {
                return -1;
            }
            if infinite {
                tokens = self
                    .cvar
                    .wait(tokens)
                    .unwrap_or_else(PoisonError::into_inner);
                continue;
            }
            let Some(remaining) = deadline.and_then(|d| d.checked_duration_since(Instant::now()))
            else {
                return 0;
            };
            if remaining.is_zero() {
                return 0;
            }
            tokens = self
                .cvar
                .wait_timeout(tokens, remaining)
                .unwrap_or_else(PoisonError::into_inner)
                .0;
        }
    }

    /// Takes a spot from the current thread's cache, allocating on demand,
    /// and registers it for interrupt delivery.
    pub fn alloc() -> NonNull<ParkSpot> {
        let spot = SPOT_CACHE
            .with(|cache| cache.borrow_mut().0.pop())
            .unwrap_or_else(|| {
                // Safety: `Box::into_raw` never returns null.
                unsafe { NonNull::new_unchecked(Box::into_raw(Box::new(ParkSpot::new()))) }
            });
        host::register_spot(spot.as_ptr().expose_provenance());
        spot
    }

    /// Returns a spot to the current thread's cache.
    ///
    /// # Safety
    ///
    /// `spot` must have been returned by [`ParkSpot::alloc`] on this thread,
    /// every posted token must have been consumed, and no other thread may
    /// still hold a reference to it.
    pub unsafe fn free(spot: NonNull<ParkSpot>) {
        host::deregister_spot(spot.as_ptr().expose_provenance());
        let pushed = SPOT_CACHE
            .try_with(|cache| cache.borrow_mut().0.push(spot))
            .is_ok();
        if !pushed {
            // The thread is exiting and the cache is gone.
            // Safety: ownership was handed back by the caller.
            drop(unsafe { Box::from_raw(spot.as_ptr()) });
        }
    }
}

struct SpotCache(Vec<NonNull<ParkSpot>>);

impl Drop for SpotCache {
    fn drop(&mut self) {
        for spot in self.0.drain(..) {
            // Safety: cached spots are owned by this thread and unreachable
            // from anywhere else once deregistered.
            drop(unsafe { Box::from_raw(spot.as_ptr()) });
        }
    }
}

thread_local! {
    static SPOT_CACHE: RefCell<SpotCache> = const { RefCell::new(SpotCache(Vec::new())) };
}

#[cfg(all(test, not(loom)))]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn set_before_wait_is_consumed() {
        let spot = ParkSpot::new();
        spot.set();
        assert_eq!(spot.wait(Some(Duration::from_millis(10)), false), 1);
        assert_eq!(spot.wait(Some(Duration::ZERO), false), 0);
    }

    #[test]
    fn wait_times_out() {
        let spot = ParkSpot::new();
        assert_eq!(spot.wait(Some(Duration::from_millis(10)), false), 0);
    }

    #[test]
    fn cross_thread_wake() {
        let spot = Arc::new(ParkSpot::new());
        let waker = Arc::clone(&spot);
        let handle = thread::spawn(move || spot.wait(None, false));
        thread::sleep(Duration::from_millis(5));
        waker.set();
        assert_eq!(handle.join().unwrap(), 1);
    }

    #[test]
    fn pending_interruption_breaks_interruptible_waits_only() {
        // Run on a dedicated thread so the latched flag cannot leak into
        // other tests sharing this thread.
        thread::spawn(|| {
            let spot = ParkSpot::new();
            assert!(crate::host::interrupt(crate::host::thread_small_id()));
            assert_eq!(spot.wait(Some(Duration::from_millis(5)), false), 0);
            assert_eq!(spot.wait(Some(Duration::from_millis(5)), true), -1);
            // Still pending until a checkpoint consumes it.
            assert_eq!(spot.wait(Some(Duration::ZERO), true), -1);
            assert!(crate::host::interruption_checkpoint());
            assert_eq!(spot.wait(Some(Duration::ZERO), true), 0);
        })
        .join()
        .unwrap();
    }
}

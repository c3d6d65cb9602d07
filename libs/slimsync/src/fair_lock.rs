// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Fair lock (a mutant whose state is lock availability) and its reentrant
//! extension carrying an owner id and a nest count.

use crate::alerter::Alerter;
use crate::host;
use crate::loom::atomic::{AtomicU32, Ordering};
use crate::mutant::Mutant;
use crate::parker::{WAIT_SUCCESS, WAIT_TIMEOUT};
use crate::wait_block::WaitBlock;
use std::time::Duration;

/// A fair queue-based lock. Ownership is handed off to the queue's first
/// waiter on release rather than being re-contended.
#[derive(Debug)]
pub struct FairLock {
    mutant: Mutant,
}

// === impl FairLock ===

impl FairLock {
    #[must_use]
    pub fn new(spin_count: u32) -> Self {
        Self {
            mutant: Mutant::new(true, spin_count),
        }
    }

    #[inline]
    pub fn try_enter(&self) -> bool {
        self.mutant.try_acquire()
    }

    pub fn enter(&self) {
        if !self.try_enter() {
            let status = self.mutant.slow_wait(None, None, false);
            debug_assert_eq!(status, WAIT_SUCCESS);
        }
    }

    pub fn try_enter_ex(
        &self,
        timeout: Option<Duration>,
        alerter: Option<&Alerter>,
        interruptible: bool,
    ) -> i32 {
        if self.try_enter() {
            return WAIT_SUCCESS;
        }
        if timeout == Some(Duration::ZERO) {
            return WAIT_TIMEOUT;
        }
        self.mutant.slow_wait(timeout, alerter, interruptible)
    }

    pub fn exit(&self) {
        self.mutant.release();
    }
}

/// A [`FairLock`] that can be recursively acquired by its owning thread.
///
/// `owner` holds the owner's small thread id (zero when unowned) and `nest`
/// counts the acquisitions beyond the first. Both are written only by the
/// owner while it holds the lock.
#[derive(Debug)]
pub struct ReentrantFairLock {
    lock: FairLock,
    owner: AtomicU32,
    nest: AtomicU32,
}

// === impl ReentrantFairLock ===

impl ReentrantFairLock {
    #[must_use]
    pub fn new(spin_count: u32) -> Self {
        Self {
            lock: FairLock::new(spin_count),
            owner: AtomicU32::new(0),
            nest: AtomicU32::new(0),
        }
    }

    /// The owner's small id, or zero.
    #[inline]
    pub fn owner(&self) -> u32 {
        self.owner.load(Ordering::Relaxed)
    }

    /// The number of acquisitions beyond the first.
    #[inline]
    pub fn nest(&self) -> u32 {
        self.nest.load(Ordering::Relaxed)
    }

    #[inline]
    pub fn is_owned_by(&self, small_id: u32) -> bool {
        self.owner() == small_id
    }

    /// Whether some thread is queued on the lock.
    #[inline]
    pub fn has_queued_waiters(&self) -> bool {
        self.lock.mutant.has_queued_waiters()
    }

    /// Records the caller as owner after the lock was handed to it without
    /// a matching `enter` (condition-wait handoff).
    pub fn set_owner(&self, small_id: u32) {
        self.owner.store(small_id, Ordering::Relaxed);
    }

    /// Restores a saved nest count. Only the owner may call this.
    pub fn set_nest(&self, nest: u32) {
        self.nest.store(nest, Ordering::Relaxed);
    }

    /// Re-initializes the lock as owned by `small_id` with no nesting. Only
    /// valid while no other thread can reach the lock.
    pub fn reset_owned(&self, small_id: u32) {
        self.lock.mutant.reset_state(false);
        self.owner.store(small_id, Ordering::Relaxed);
        self.nest.store(0, Ordering::Relaxed);
    }

    fn try_enter_with(&self, small_id: u32) -> bool {
        if self.lock.try_enter() {
            self.owner.store(small_id, Ordering::Relaxed);
            return true;
        }
        if self.owner() == small_id {
            self.nest.fetch_add(1, Ordering::Relaxed);
            return true;
        }
        false
    }

    pub fn try_enter(&self) -> bool {
        self.try_enter_with(host::thread_small_id())
    }

    pub fn enter(&self) {
        let status = self.try_enter_ex(None, None, false);
        debug_assert_eq!(status, WAIT_SUCCESS);
    }

    pub fn try_enter_ex(
        &self,
        timeout: Option<Duration>,
        alerter: Option<&Alerter>,
        interruptible: bool,
    ) -> i32 {
        let small_id = host::thread_small_id();
        if self.try_enter_with(small_id) {
            return WAIT_SUCCESS;
        }
        if timeout == Some(Duration::ZERO) {
            return WAIT_TIMEOUT;
        }
        let status = self.lock.mutant.slow_wait(timeout, alerter, interruptible);
        if status == WAIT_SUCCESS {
            self.owner.store(small_id, Ordering::Relaxed);
        }
        status
    }

    /// Releases one nest level, or the lock itself at level zero.
    ///
    /// # Panics
    ///
    /// Panics when the calling thread does not own the lock.
    pub fn exit(&self) {
        assert!(
            self.is_owned_by(host::thread_small_id()),
            "fair lock released by a thread that does not own it"
        );
        if self.nest.load(Ordering::Relaxed) > 0 {
            self.nest.fetch_sub(1, Ordering::Relaxed);
        } else {
            self.owner.store(0, Ordering::Relaxed);
            self.lock.exit();
        }
    }

    /// Releases the lock unconditionally, returning the nest count so a
    /// condition wait can restore it after reacquisition.
    pub fn exit_completely(&self) -> u32 {
        let nest = self.nest.load(Ordering::Relaxed);
        self.nest.store(0, Ordering::Relaxed);
        self.owner.store(0, Ordering::Relaxed);
        self.lock.exit();
        nest
    }

    /// Enqueues `wait_block` on the lock's queue without contending for the
    /// lock state; it is granted by a subsequent exit.
    pub fn enqueue_locked(&self, wait_block: &WaitBlock) {
        self.lock.mutant.enqueue_locked(wait_block);
    }
}

#[cfg(all(test, not(loom)))]
mod tests {
    use super::*;
    use rand::Rng;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicU64, Ordering as StdOrdering};
    use std::thread;

    fn trace_init() {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .try_init();
    }

    #[test]
    fn fair_lock_mutual_exclusion() {
        let lock = Arc::new(FairLock::new(64));
        let counter = Arc::new(AtomicU64::new(0));
        let mut handles = Vec::new();
        for _ in 0..4 {
            let lock = Arc::clone(&lock);
            let counter = Arc::clone(&counter);
            handles.push(thread::spawn(move || {
                for _ in 0..500 {
                    lock.enter();
                    let seen = counter.load(StdOrdering::Relaxed);
                    counter.store(seen + 1, StdOrdering::Relaxed);
                    lock.exit();
                }
            }));
        }
        for handle in handles {
            handle.join().unwrap();
        }
        assert_eq!(counter.load(StdOrdering::Relaxed), 2000);
    }

    #[test]
    fn fair_lock_bounded_enter() {
        let lock = Arc::new(FairLock::new(0));
        lock.enter();
        let contender = Arc::clone(&lock);
        let handle = thread::spawn(move || {
            contender.try_enter_ex(Some(Duration::from_millis(20)), None, false)
        });
        assert_eq!(handle.join().unwrap(), WAIT_TIMEOUT);
        lock.exit();
        assert!(lock.try_enter());
        lock.exit();
    }

    #[test]
    fn reentrant_nesting() {
        let lock = ReentrantFairLock::new(0);
        assert!(lock.try_enter());
        assert!(lock.try_enter());
        lock.enter();
        assert_eq!(lock.nest(), 2);
        lock.exit();
        lock.exit();
        assert_eq!(lock.nest(), 0);
        assert!(lock.is_owned_by(host::thread_small_id()));
        lock.exit();
        assert_eq!(lock.owner(), 0);
    }

    #[test]
    fn exit_completely_reports_nest() {
        let lock = ReentrantFairLock::new(0);
        lock.enter();
        lock.enter();
        lock.enter();
        assert_eq!(lock.exit_completely(), 2);
        assert_eq!(lock.owner(), 0);
        assert!(lock.try_enter());
        lock.exit();
    }

    #[test]
    fn exit_by_non_owner_panics() {
        let lock = Arc::new(ReentrantFairLock::new(0));
        lock.enter();
        let lock2 = Arc::clone(&lock);
        assert!(thread::spawn(move || lock2.exit()).join().is_err());
        lock.exit();
    }

    #[test]
    fn randomized_reentrant_stress() {
        trace_init();
        let lock = Arc::new(ReentrantFairLock::new(32));
        let counter = Arc::new(AtomicU64::new(0));
        let mut handles = Vec::new();
        for _ in 0..4 {
            let lock = Arc::clone(&lock);
            let counter = Arc::clone(&counter);
            handles.push(thread::spawn(move || {
                let mut rng = rand::rng();
                let mut acquired = 0_u64;
                for _ in 0..200 {
                    let depth = rng.random_range(1..=3_u32);
                    let status = lock.try_enter_ex(
                        Some(Duration::from_millis(rng.random_range(1..50))),
                        None,
                        false,
                    );
                    if status != WAIT_SUCCESS {
                        continue;
                    }
                    for _ in 1..depth {
                        lock.enter();
                    }
                    let seen = counter.load(StdOrdering::Relaxed);
                    if rng.random_range(0..4) == 0 {
                        thread::yield_now();
                    }
                    counter.store(seen + 1, StdOrdering::Relaxed);
                    acquired += 1;
                    for _ in 0..depth {
                        lock.exit();
                    }
                }
                acquired
            }));
        }
        let total: u64 = handles.into_iter().map(|h| h.join().unwrap()).sum();
        assert_eq!(counter.load(StdOrdering::Relaxed), total);
        assert_eq!(lock.owner(), 0);
        assert_eq!(lock.nest(), 0);
    }

    #[test]
    fn reentrant_blocks_other_threads() {
        let lock = Arc::new(ReentrantFairLock::new(0));
        lock.enter();
        lock.enter();
        let contender = Arc::clone(&lock);
        let handle = thread::spawn(move || {
            contender.try_enter_ex(Some(Duration::from_millis(10)), None, false)
        });
        assert_eq!(handle.join().unwrap(), WAIT_TIMEOUT);
        lock.exit();
        lock.exit();

        let contender = Arc::clone(&lock);
        let handle = thread::spawn(move || {
            let status = contender.try_enter_ex(Some(Duration::from_secs(5)), None, false);
            if status == WAIT_SUCCESS {
                contender.exit();
            }
            status
        });
        assert_eq!(handle.join().unwrap(), WAIT_SUCCESS);
    }
}

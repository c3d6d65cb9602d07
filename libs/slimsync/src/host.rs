// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Host services consumed by the primitives: compact per-thread ids and
//! cooperative thread interruption.
//!
//! Every thread that touches a synchronizer is lazily assigned a *small id*,
//! a non-zero integer of at most [`SMALL_ID_BITS`] bits that is stable for
//! the thread's lifetime and recycled afterwards. Interruption is a
//! cooperative per-thread flag; [`interrupt`] additionally wakes every park
//! spot the target thread is currently blocked on, so interruptible waits
//! observe the request promptly.

use crate::park_spot::ParkSpot;
use core::ptr;
use core::sync::atomic::{AtomicBool, Ordering};
use hashbrown::HashMap;
use std::cell::OnceCell;
use std::sync::{Arc, LazyLock, Mutex, PoisonError};

/// Width of a small thread id.
pub const SMALL_ID_BITS: u32 = 22;
const MAX_SMALL_ID: u32 = (1 << SMALL_ID_BITS) - 1;

#[derive(Debug)]
struct ThreadRecord {
    small_id: u32,
    interrupt_requested: AtomicBool,
    /// Addresses of the park spots this thread is currently blocked on.
    spots: Mutex<Vec<usize>>,
}

#[derive(Debug, Default)]
struct Registry {
    next_id: u32,
    free_ids: Vec<u32>,
    threads: HashMap<u32, Arc<ThreadRecord>>,
}

static REGISTRY: LazyLock<Mutex<Registry>> = LazyLock::new(|| {
    Mutex::new(Registry {
        next_id: 1,
        free_ids: Vec::new(),
        threads: HashMap::new(),
    })
});

struct ThreadGuard {
    record: Arc<ThreadRecord>,
}

impl Drop for ThreadGuard {
    fn drop(&mut self) {
        let mut registry = REGISTRY.lock().unwrap_or_else(PoisonError::into_inner);
        registry.threads.remove(&self.record.small_id);
        registry.free_ids.push(self.record.small_id);
    }
}

thread_local! {
    static CURRENT: OnceCell<ThreadGuard> = const { OnceCell::new() };
}

fn register_current() -> ThreadGuard {
    let mut registry = REGISTRY.lock().unwrap_or_else(PoisonError::into_inner);
    let small_id = registry.free_ids.pop().unwrap_or_else(|| {
        let id = registry.next_id;
        assert!(id <= MAX_SMALL_ID, "small thread id space exhausted");
        registry.next_id += 1;
        id
    });
    let record = Arc::new(ThreadRecord {
        small_id,
        interrupt_requested: AtomicBool::new(false),
        spots: Mutex::new(Vec::new()),
    });
    registry.threads.insert(small_id, Arc::clone(&record));
    ThreadGuard { record }
}

fn with_record<R>(f: impl FnOnce(&ThreadRecord) -> R) -> R {
    CURRENT.with(|current| f(&current.get_or_init(register_current).record))
}

/// Returns the calling thread's small id, assigning one on first use.
pub fn thread_small_id() -> u32 {
    with_record(|record| record.small_id)
}

/// Whether an interruption has been requested for the calling thread.
pub fn interruption_requested() -> bool {
    with_record(|record| record.interrupt_requested.load(Ordering::Acquire))
}

/// Consumes a pending interruption request, returning whether one was
/// pending. Blocking paths call this after releasing their resources so the
/// caller observes a clean state.
pub fn interruption_checkpoint() -> bool {
    with_record(|record| record.interrupt_requested.swap(false, Ordering::AcqRel))
}

/// Requests interruption of the thread identified by `small_id` and wakes
/// any interruptible wait it is currently blocked in.
///
/// Returns `false` when no live thread carries that id.
pub fn interrupt(small_id: u32) -> bool {
    let record = {
        let registry = REGISTRY.lock().unwrap_or_else(PoisonError::into_inner);
        registry.threads.get(&small_id).cloned()
    };
    let Some(record) = record else {
        return false;
    };
    tracing::trace!(small_id, "requesting thread interruption");
    record.interrupt_requested.store(true, Ordering::Release);
    let spots = record.spots.lock().unwrap_or_else(PoisonError::into_inner);
    for &addr in &*spots {
        // Safety: a spot address stays registered only while the owning
        // thread keeps the spot allocated; deregistration happens under
        // this same lock before the spot can be reused or freed.
        unsafe { (*ptr::with_exposed_provenance::<ParkSpot>(addr)).poke(); }
    }
    true
}

pub(crate) fn register_spot(addr: usize) {
    with_record(|record| {
        record
            .spots
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(addr);
    });
}

pub(crate) fn deregister_spot(addr: usize) {
    with_record(|record| {
        let mut spots = record.spots.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(pos) = spots.iter().rposition(|&a| a == addr) {
            spots.swap_remove(pos);
        }
    });
}

#[cfg(all(test, not(loom)))]
mod tests {
    use super::*;
    use std::thread;

    #[test]
    fn small_ids_are_non_zero_and_distinct() {
        let mine = thread_small_id();
        assert_ne!(mine, 0);
        assert_eq!(mine, thread_small_id());

        let other = thread::spawn(thread_small_id).join().unwrap();
        assert_ne!(other, 0);
        assert_ne!(mine, other);
    }

    #[test]
    fn interruption_flag_round_trip() {
        let id = thread_small_id();
        assert!(!interruption_requested());
        assert!(interrupt(id));
        assert!(interruption_requested());
        assert!(interruption_checkpoint());
        assert!(!interruption_requested());
        assert!(!interruption_checkpoint());
    }

    #[test]
    fn interrupting_a_dead_id_fails() {
        assert!(!interrupt(MAX_SMALL_ID));
    }
}

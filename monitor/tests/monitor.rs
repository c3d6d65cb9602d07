// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

use monitor::{MonitorError, ObjectHeader, host};
use rand::Rng;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::thread;
use std::time::{Duration, Instant};

fn trace_init() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .try_init();
}

// Lock word layout constants, as documented for the header slot.
const STATUS_MASK: usize = 0b11;
const STATUS_FLAT: usize = 0;
const STATUS_THIN_HASH: usize = 1;
const STATUS_FAT_HASH: usize = 3;
const INFLATED_BIT: usize = 2;
const NEST_SHIFT: usize = 2;
const NEST_MASK: usize = 0xff << NEST_SHIFT;
const OWNER_SHIFT: usize = 10;

fn wait_until(mut cond: impl FnMut() -> bool) {
    let deadline = Instant::now() + Duration::from_secs(10);
    while !cond() {
        assert!(Instant::now() < deadline, "condition never became true");
        thread::yield_now();
    }
}

#[test]
fn uncontended_nest_keeps_the_word_flat() {
    monitor::init();
    let obj = ObjectHeader::new();
    let id = usize::try_from(host::thread_small_id()).unwrap();

    monitor::enter(&obj);
    assert_eq!(obj.sync_slot(), id << OWNER_SHIFT);

    monitor::enter(&obj);
    monitor::enter(&obj);
    let slot = obj.sync_slot();
    assert_eq!(slot & STATUS_MASK, STATUS_FLAT);
    assert_eq!(slot >> OWNER_SHIFT, id);
    assert_eq!((slot & NEST_MASK) >> NEST_SHIFT, 2);

    monitor::exit(&obj).unwrap();
    assert_eq!((obj.sync_slot() & NEST_MASK) >> NEST_SHIFT, 1);
    monitor::exit(&obj).unwrap();
    assert_eq!((obj.sync_slot() & NEST_MASK) >> NEST_SHIFT, 0);
    monitor::exit(&obj).unwrap();

    // Round trip: back to the pristine word.
    assert_eq!(obj.sync_slot(), 0);
}

#[test]
fn recursion_requires_matching_exits() {
    let obj = Arc::new(ObjectHeader::new());
    monitor::enter(&obj);
    monitor::enter(&obj);

    let contender = Arc::clone(&obj);
    let acquired = thread::spawn(move || {
        monitor::try_enter(&contender, Duration::from_millis(30))
    });
    assert!(!acquired.join().unwrap());

    monitor::exit(&obj).unwrap();
    let contender = Arc::clone(&obj);
    let acquired = thread::spawn(move || {
        monitor::try_enter(&contender, Duration::from_millis(30))
    });
    assert!(!acquired.join().unwrap());

    monitor::exit(&obj).unwrap();
    let contender = Arc::clone(&obj);
    let acquired = thread::spawn(move || {
        let ok = monitor::try_enter(&contender, Duration::from_secs(5));
        if ok {
            monitor::exit(&contender).unwrap();
        }
        ok
    });
    assert!(acquired.join().unwrap());
}

#[test]
fn contended_enter_inflates_and_hands_over() {
    let obj = Arc::new(ObjectHeader::new());
    monitor::enter(&obj);

    let remote = Arc::clone(&obj);
    let handle = thread::spawn(move || {
        monitor::enter(&remote);
        let slot = remote.sync_slot();
        monitor::exit(&remote).unwrap();
        slot
    });

    // Give the contender time to bind a sync block, then release; its
    // enter completes by publishing the inflated word.
    thread::sleep(Duration::from_millis(20));
    monitor::exit(&obj).unwrap();
    let slot_seen_by_contender = handle.join().unwrap();
    assert_ne!(slot_seen_by_contender & INFLATED_BIT, 0);
    wait_until(|| obj.sync_slot() & INFLATED_BIT != 0);

    // The inflated path keeps working for both threads.
    monitor::enter(&obj);
    assert_ne!(obj.sync_slot() & INFLATED_BIT, 0);
    monitor::exit(&obj).unwrap();
}

#[test]
fn mutual_exclusion_under_contention() {
    let obj = Arc::new(ObjectHeader::new());
    let counter = Arc::new(AtomicU64::new(0));
    let mut handles = Vec::new();
    for _ in 0..8 {
        let obj = Arc::clone(&obj);
        let counter = Arc::clone(&counter);
        handles.push(thread::spawn(move || {
            for _ in 0..200 {
                monitor::enter(&obj);
                // Non-atomic read-modify-write; only exclusion keeps it
                // consistent.
                let seen = counter.load(Ordering::Relaxed);
                counter.store(seen + 1, Ordering::Relaxed);
                monitor::exit(&obj).unwrap();
            }
        }));
    }
    for handle in handles {
        handle.join().unwrap();
    }
    assert_eq!(counter.load(Ordering::Relaxed), 1600);
}

#[test]
fn nest_overflow_inflates_while_owned() {
    let obj = Arc::new(ObjectHeader::new());
    let enters = 300_usize;
    for _ in 0..enters {
        monitor::enter(&obj);
    }
    // The 8-bit nest field overflowed into a sync block.
    assert_ne!(obj.sync_slot() & INFLATED_BIT, 0);
    for _ in 0..enters {
        monitor::exit(&obj).unwrap();
    }

    let contender = Arc::clone(&obj);
    let acquired = thread::spawn(move || {
        let ok = monitor::try_enter(&contender, Duration::from_secs(5));
        if ok {
            monitor::exit(&contender).unwrap();
        }
        ok
    });
    assert!(acquired.join().unwrap());
}

#[test]
fn hash_is_stable_and_thin_until_locked() {
    let obj = ObjectHeader::new();
    let h = monitor::hash(&obj);
    assert_ne!(h, 0);
    assert_eq!(obj.sync_slot() & STATUS_MASK, STATUS_THIN_HASH);
    assert_eq!(monitor::hash(&obj), h);

    // Locking a hashed object migrates the hash into the sync block.
    monitor::enter(&obj);
    assert_eq!(obj.sync_slot() & STATUS_MASK, STATUS_FAT_HASH);
    assert_eq!(monitor::hash(&obj), h);
    monitor::exit(&obj).unwrap();
    assert_eq!(monitor::hash(&obj), h);
    // Inflation is monotonic: the block stays bound.
    assert_eq!(obj.sync_slot() & STATUS_MASK, STATUS_FAT_HASH);
}

#[test]
fn hash_of_a_flat_locked_object_inflates() {
    let obj = Arc::new(ObjectHeader::new());
    monitor::enter(&obj);
    let h = monitor::hash(&obj);
    assert_ne!(h, 0);
    assert_eq!(obj.sync_slot() & STATUS_MASK, STATUS_FAT_HASH);
    assert_eq!(monitor::hash(&obj), h);
    monitor::exit(&obj).unwrap();
    assert_eq!(monitor::hash(&obj), h);

    // Hash agreed across threads.
    let remote = Arc::clone(&obj);
    let remote_hash = thread::spawn(move || monitor::hash(&remote)).join().unwrap();
    assert_eq!(remote_hash, h);
}

#[test]
fn try_enter_times_out_and_recovers() {
    let obj = Arc::new(ObjectHeader::new());
    monitor::enter(&obj);

    let contender = Arc::clone(&obj);
    let started = Instant::now();
    let handle = thread::spawn(move || {
        monitor::try_enter(&contender, Duration::from_millis(50))
    });
    assert!(!handle.join().unwrap());
    assert!(started.elapsed() >= Duration::from_millis(45));

    monitor::exit(&obj).unwrap();
    let contender = Arc::clone(&obj);
    let handle = thread::spawn(move || {
        let ok = monitor::try_enter(&contender, Duration::from_secs(5));
        if ok {
            monitor::exit(&contender).unwrap();
        }
        ok
    });
    assert!(handle.join().unwrap());
}

/// Inflates `obj` up front so condition waits never race a first-time
/// inflation.
fn pre_inflate(obj: &ObjectHeader) {
    let _ = monitor::hash(obj);
    monitor::enter(obj);
    monitor::exit(obj).unwrap();
    assert_ne!(obj.sync_slot() & INFLATED_BIT, 0);
}

#[test]
fn wait_pulse_round_trip() {
    let obj = Arc::new(ObjectHeader::new());
    pre_inflate(&obj);

    monitor::enter(&obj);
    monitor::enter(&obj); // nest level 1, to verify restoration

    let pulser = {
        let obj = Arc::clone(&obj);
        thread::spawn(move || {
            monitor::enter(&obj);
            monitor::pulse(&obj).unwrap();
            monitor::exit(&obj).unwrap();
        })
    };

    assert_eq!(monitor::wait(&obj, None), Ok(true));
    pulser.join().unwrap();

    // Ownership and the nest count survived the wait.
    monitor::exit(&obj).unwrap();
    monitor::exit(&obj).unwrap();
    assert!(monitor::exit(&obj).is_err());
}

#[test]
fn pulse_all_wakes_every_waiter() {
    let obj = Arc::new(ObjectHeader::new());
    pre_inflate(&obj);
    let woken = Arc::new(AtomicUsize::new(0));
    let waiting = Arc::new(AtomicUsize::new(0));

    let mut handles = Vec::new();
    for _ in 0..4 {
        let obj = Arc::clone(&obj);
        let woken = Arc::clone(&woken);
        let waiting = Arc::clone(&waiting);
        handles.push(thread::spawn(move || {
            monitor::enter(&obj);
            waiting.fetch_add(1, Ordering::SeqCst);
            assert_eq!(monitor::wait(&obj, None), Ok(true));
            woken.fetch_add(1, Ordering::SeqCst);
            monitor::exit(&obj).unwrap();
        }));
    }

    wait_until(|| waiting.load(Ordering::SeqCst) == 4);
    // All four are either enqueued or about to be; take the monitor and
    // pulse everyone.
    monitor::enter(&obj);
    monitor::pulse_all(&obj).unwrap();
    monitor::exit(&obj).unwrap();

    for handle in handles {
        handle.join().unwrap();
    }
    assert_eq!(woken.load(Ordering::SeqCst), 4);
}

#[test]
fn single_pulse_wakes_single_waiter() {
    let obj = Arc::new(ObjectHeader::new());
    pre_inflate(&obj);
    let woken = Arc::new(AtomicUsize::new(0));
    let waiting = Arc::new(AtomicUsize::new(0));

    let mut handles = Vec::new();
    for _ in 0..3 {
        let obj = Arc::clone(&obj);
        let woken = Arc::clone(&woken);
        let waiting = Arc::clone(&waiting);
        handles.push(thread::spawn(move || {
            monitor::enter(&obj);
            waiting.fetch_add(1, Ordering::SeqCst);
            assert_eq!(monitor::wait(&obj, None), Ok(true));
            woken.fetch_add(1, Ordering::SeqCst);
            monitor::exit(&obj).unwrap();
        }));
    }

    wait_until(|| waiting.load(Ordering::SeqCst) == 3);
    for expected in 1..=3_usize {
        monitor::enter(&obj);
        monitor::pulse(&obj).unwrap();
        monitor::exit(&obj).unwrap();
        wait_until(|| woken.load(Ordering::SeqCst) == expected);
        // No extra thread slipped through.
        thread::sleep(Duration::from_millis(10));
        assert_eq!(woken.load(Ordering::SeqCst), expected);
    }
    for handle in handles {
        handle.join().unwrap();
    }
}

#[test]
fn wait_times_out_and_later_pulse_is_a_noop() {
    let obj = Arc::new(ObjectHeader::new());

    monitor::enter(&obj);
    let started = Instant::now();
    assert_eq!(monitor::wait(&obj, Some(Duration::from_millis(10))), Ok(false));
    assert!(started.elapsed() >= Duration::from_millis(9));
    // The lock was reacquired by contention.
    monitor::exit(&obj).unwrap();

    // A pulse now finds no eligible waiter and must not fault or leak a
    // stale wait block.
    monitor::enter(&obj);
    monitor::pulse(&obj).unwrap();
    monitor::pulse_all(&obj).unwrap();
    monitor::exit(&obj).unwrap();

    // The condition machinery still works afterwards. Extra pulses are
    // harmless, so the pulser just keeps pulsing until the waiter is back.
    let woke = Arc::new(AtomicUsize::new(0));
    let pulser = {
        let obj = Arc::clone(&obj);
        let woke = Arc::clone(&woke);
        thread::spawn(move || {
            loop {
                monitor::enter(&obj);
                monitor::pulse(&obj).unwrap();
                monitor::exit(&obj).unwrap();
                if woke.load(Ordering::SeqCst) != 0 {
                    break;
                }
                thread::yield_now();
            }
        })
    };
    monitor::enter(&obj);
    assert_eq!(monitor::wait(&obj, None), Ok(true));
    woke.store(1, Ordering::SeqCst);
    monitor::exit(&obj).unwrap();
    pulser.join().unwrap();
}

#[test]
fn wait_is_broken_by_interruption() {
    let obj = Arc::new(ObjectHeader::new());
    let (tx, rx) = std::sync::mpsc::channel();

    let waiter = {
        let obj = Arc::clone(&obj);
        thread::spawn(move || {
            tx.send(host::thread_small_id()).unwrap();
            monitor::enter(&obj);
            let woken = monitor::wait(&obj, None).unwrap();
            monitor::exit(&obj).unwrap();
            woken
        })
    };

    let id = rx.recv().unwrap();
    // Let the waiter reach the condition wait.
    thread::sleep(Duration::from_millis(30));
    assert!(host::interrupt(id));
    assert!(!waiter.join().unwrap());
}

#[test]
fn non_owner_operations_are_violations() {
    let obj = Arc::new(ObjectHeader::new());

    assert_eq!(
        monitor::exit(&obj),
        Err(MonitorError::SynchronizationLockViolation)
    );
    assert_eq!(
        monitor::wait(&obj, None),
        Err(MonitorError::SynchronizationLockViolation)
    );
    assert_eq!(
        monitor::pulse(&obj),
        Err(MonitorError::SynchronizationLockViolation)
    );
    assert_eq!(
        monitor::pulse_all(&obj),
        Err(MonitorError::SynchronizationLockViolation)
    );

    // Holding it on another thread does not make this thread an owner.
    monitor::enter(&obj);
    let remote = Arc::clone(&obj);
    let err = thread::spawn(move || monitor::exit(&remote)).join().unwrap();
    assert_eq!(err, Err(MonitorError::SynchronizationLockViolation));
    monitor::exit(&obj).unwrap();
}

#[test]
fn raw_surface_checks_null_handles() {
    // Safety: null and valid pinned pointers, per the raw contract.
    unsafe {
        assert_eq!(
            monitor::raw::enter(std::ptr::null()),
            Err(MonitorError::NullObject)
        );
        assert_eq!(
            monitor::raw::exit(std::ptr::null()),
            Err(MonitorError::NullObject)
        );
        assert_eq!(
            monitor::raw::try_enter(std::ptr::null(), Duration::from_millis(1)),
            Err(MonitorError::NullObject)
        );
        assert_eq!(monitor::raw::hash(std::ptr::null()), 0);

        let obj = ObjectHeader::new();
        monitor::raw::enter(&raw const obj).unwrap();
        assert!(monitor::raw::try_enter(&raw const obj, Duration::ZERO).unwrap());
        monitor::raw::exit(&raw const obj).unwrap();
        monitor::raw::exit(&raw const obj).unwrap();
        assert_ne!(monitor::raw::hash(&raw const obj), 0);
    }
}

#[test]
fn try_enter_interruptible_acquires_free_monitor() {
    let obj = ObjectHeader::new();
    assert!(monitor::try_enter_interruptible(&obj, None));
    monitor::exit(&obj).unwrap();
}

#[test]
fn locks_dump_reports_held_monitors() {
    let obj = ObjectHeader::new();
    // Inflate by hashing first, then locking.
    let _ = monitor::hash(&obj);
    monitor::enter(&obj);

    let dump = monitor::locks_dump(true);
    assert!(dump.contains("Total locks"));
    assert!(dump.contains("held by thread"));

    monitor::exit(&obj).unwrap();
    let dump = monitor::locks_dump(false);
    assert!(dump.contains("Total locks"));
}

#[test]
fn collected_objects_free_their_blocks_for_recycling() {
    // Inflate a batch of heap objects, then report them dead and make sure
    // later inflations keep succeeding (recycling the dead blocks once the
    // free list runs dry).
    let mut dead = Vec::new();
    for _ in 0..24 {
        let obj = Box::new(ObjectHeader::new());
        let _ = monitor::hash(&obj);
        monitor::enter(&obj);
        monitor::exit(&obj).unwrap();
        assert_ne!(obj.sync_slot() & INFLATED_BIT, 0);
        dead.push(obj);
    }
    for obj in dead {
        let addr = std::ptr::from_ref(&*obj).expose_provenance();
        // Report the death before the allocation is reusable so no
        // unrelated object can appear at the same address first.
        monitor::collect_object(addr);
        drop(obj);
    }

    for _ in 0..48 {
        let obj = ObjectHeader::new();
        let _ = monitor::hash(&obj);
        monitor::enter(&obj);
        monitor::exit(&obj).unwrap();
    }
    let dump = monitor::locks_dump(false);
    assert!(dump.contains("Total locks"));
}

#[test]
fn wait_handles_racing_timeout_and_pulse() {
    // Stress the cancelled-waiter path: waiters with short timeouts racing
    // a pulser. Nothing must hang, and every wait must reacquire.
    trace_init();
    let obj = Arc::new(ObjectHeader::new());
    pre_inflate(&obj);
    let pulses = Arc::new(AtomicUsize::new(0));

    let stop = Arc::new(AtomicUsize::new(0));
    let pulser = {
        let obj = Arc::clone(&obj);
        let stop = Arc::clone(&stop);
        let pulses = Arc::clone(&pulses);
        thread::spawn(move || {
            while stop.load(Ordering::SeqCst) == 0 {
                monitor::enter(&obj);
                monitor::pulse(&obj).unwrap();
                monitor::exit(&obj).unwrap();
                pulses.fetch_add(1, Ordering::SeqCst);
                thread::yield_now();
            }
        })
    };

    let mut handles = Vec::new();
    for _ in 0..4 {
        let obj = Arc::clone(&obj);
        handles.push(thread::spawn(move || {
            let mut rng = rand::rng();
            for _ in 0..50 {
                monitor::enter(&obj);
                let timeout = Duration::from_micros(rng.random_range(1..2000));
                let _ = monitor::wait(&obj, Some(timeout)).unwrap();
                monitor::exit(&obj).unwrap();
            }
        }));
    }
    for handle in handles {
        handle.join().unwrap();
    }
    stop.store(1, Ordering::SeqCst);
    pulser.join().unwrap();
    assert!(pulses.load(Ordering::SeqCst) > 0);

    // The object is still a working monitor.
    monitor::enter(&obj);
    monitor::pulse_all(&obj).unwrap();
    monitor::exit(&obj).unwrap();
}

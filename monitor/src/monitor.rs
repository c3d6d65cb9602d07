// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! The monitor engine: enter/exit over the lock word, inflation, condition
//! waiting and identity hashing.

use crate::error::MonitorError;
use crate::gc;
use crate::host;
use crate::lock_word::{LockWord, OBJECT_ALIGNMENT_SHIFT, Status};
use crate::sync_block::{MONITOR_SPIN_COUNT, SyncBlock, allocator};
use crate::ObjectHeader;
use slimsync::{
    list, Parker, SpinWait, WaitBlock, WAIT_SUCCESS, WAIT_TIMEOUT,
};
use std::time::{Duration, Instant};

const HASH_MULTIPLIER: u32 = 2_654_435_761;
const HASH_MASK: i32 = (1 << 30) - 1;

fn remaining(deadline: Option<Instant>) -> Option<Duration> {
    deadline.map(|d| d.saturating_duration_since(Instant::now()))
}

/// Verifies that the calling thread owns `obj`'s monitor.
fn ensure_owned(lw: LockWord, small_id: u32) -> Result<(), MonitorError> {
    let owned = if lw.is_flat() {
        !lw.is_free() && lw.flat_owner() == small_id
    } else if lw.is_inflated() {
        lw.sync_block().lock().is_owned_by(small_id)
    } else {
        false
    };
    if owned {
        Ok(())
    } else {
        tracing::trace!(small_id, lock_word = lw.raw(), "synchronization error");
        Err(MonitorError::SynchronizationLockViolation)
    }
}

/// Acquires an inflated monitor. Returns 1 on success, 0 on timeout, -1 on
/// interruption.
fn try_enter_inflated(
    block: &'static SyncBlock,
    timeout: Option<Duration>,
    interruptible: bool,
) -> i32 {
    if block.lock().try_enter() {
        return 1;
    }
    if timeout == Some(Duration::ZERO) {
        return 0;
    }
    tracing::trace!(block = block.addr(), "contended inflated enter");
    match block.lock().try_enter_ex(timeout, None, interruptible) {
        WAIT_SUCCESS => 1,
        WAIT_TIMEOUT => 0,
        _ => -1,
    }
}

/// Inflates `obj`'s monitor and acquires it, returning 1/0/-1 like
/// [`try_enter_inflated`].
///
/// The object is registered in the inflation table so concurrent attempts
/// share one sync block; the attempt that ends up holding the block's inner
/// lock publishes the pointer once the flat word clears.
fn inflate(obj: &ObjectHeader, timeout: Option<Duration>, interruptible: bool) -> i32 {
    let deadline = timeout.and_then(|t| Instant::now().checked_add(t));
    tracing::trace!(obj = obj.addr(), "inflating monitor");

    'retry: loop {
        let (block, bound) = allocator().lock().lookup_or_bind(obj.addr());
        if bound {
            gc::weak_link_add(block.data(), obj.addr());
        }

        // The monitor may have inflated while we were allocating.
        let lw = obj.lock_word();
        if lw.is_inflated() {
            let current = lw.sync_block();
            if current.addr() != block.addr() {
                allocator().lock().fail_inflation(obj.addr(), block);
            }
            return try_enter_inflated(current, remaining(deadline), interruptible);
        }

        if !bound {
            // Whoever holds the block's inner lock publishes the pointer;
            // queue up on that lock.
            let ret = try_enter_inflated(block, remaining(deadline), interruptible);
            if ret != 1 {
                let mut alloc = allocator().lock();
                if !obj.lock_word().is_inflated() {
                    alloc.fail_inflation(obj.addr(), block);
                }
                tracing::trace!(obj = obj.addr(), "failed to inflate monitor");
                return ret;
            }
            if obj.lock_word().is_inflated() {
                return 1;
            }
        }

        // We hold the inner lock; wait for the flat lock to be released and
        // publish the sync block.
        loop {
            let lw = obj.lock_word();
            if lw.is_free() || lw.status() == Status::ThinHash {
                let fat_hash = lw.status() == Status::ThinHash;
                if fat_hash {
                    block.set_hash_code(lw.thin_hash_value());
                }
                let new = LockWord::inflated(block, fat_hash);
                if obj.cas_lock_word(lw, new) {
                    allocator().lock().finish_inflation(obj.addr(), block);
                    tracing::trace!(obj = obj.addr(), block = block.addr(), "inflated monitor");
                    return 1;
                }
            }

            std::thread::yield_now();

            if let Some(d) = deadline {
                if Instant::now() >= d {
                    block.lock().exit();
                    allocator().lock().fail_inflation(obj.addr(), block);
                    tracing::trace!(obj = obj.addr(), "inflation timed out");
                    return 0;
                }
            }

            if host::interruption_requested() {
                block.lock().exit();
                allocator().lock().fail_inflation(obj.addr(), block);
                if interruptible {
                    return -1;
                }
                host::interruption_checkpoint();
                continue 'retry;
            }
        }
    }
}

/// Inflates a monitor the calling thread already owns (nest overflow, hash
/// publication, or an imminent wait). The saved nest count is migrated into
/// the sync block's lock.
fn inflate_owned(obj: &ObjectHeader) -> &'static SyncBlock {
    let lw = obj.lock_word();
    let nest = lw.flat_nest();
    tracing::trace!(obj = obj.addr(), nest, "inflating owned monitor");

    // Only the owner reads or writes the nest bits, so the word can be
    // cleared transiently; the inflation below re-acquires it for us.
    obj.store_lock_word(LockWord::from_raw(0));

    let acquired = inflate(obj, None, false);
    debug_assert_eq!(acquired, 1);

    let block = obj.lock_word().sync_block();
    block.lock().set_nest(nest);
    block
}

/// Core acquisition. Returns 1 on success, 0 on timeout, -1 when the wait
/// was interrupted (only with `interruptible`).
fn try_enter_internal(obj: &ObjectHeader, timeout: Option<Duration>, interruptible: bool) -> i32 {
    let small_id = host::thread_small_id();
    let mut lw = obj.lock_word();

    if lw.is_free() {
        if obj.cas_lock_word(lw, LockWord::flat(small_id)) {
            return 1;
        }
        lw = obj.lock_word();
    } else if lw.is_flat() && lw.flat_owner() == small_id {
        if lw.flat_nest_is_max() {
            let block = inflate_owned(obj);
            block.lock().set_nest(block.lock().nest() + 1);
        } else {
            // We own the word; no CAS needed.
            obj.store_lock_word(lw.with_nest_incremented());
        }
        return 1;
    }

    if lw.is_inflated() {
        return try_enter_inflated(lw.sync_block(), timeout, interruptible);
    }

    // Contention, or the word holds a thin hash: inflate either way.
    inflate(obj, timeout, interruptible)
}

/// Acquires `obj`'s monitor, waiting as long as it takes.
pub fn enter(obj: &ObjectHeader) {
    let acquired = try_enter_internal(obj, None, false);
    debug_assert_eq!(acquired, 1);
}

/// Acquires `obj`'s monitor, giving up after `timeout`.
#[must_use]
pub fn try_enter(obj: &ObjectHeader, timeout: Duration) -> bool {
    try_enter_internal(obj, Some(timeout), false) == 1
}

/// Like [`try_enter`] (`None` waits forever), servicing host interruption
/// requests at a checkpoint and retrying.
#[must_use]
pub fn try_enter_interruptible(obj: &ObjectHeader, timeout: Option<Duration>) -> bool {
    loop {
        match try_enter_internal(obj, timeout, true) {
            -1 => {
                host::interruption_checkpoint();
            }
            ret => return ret == 1,
        }
    }
}

/// Releases one nest level of `obj`'s monitor, releasing the monitor itself
/// at level zero.
///
/// # Errors
///
/// Returns [`MonitorError::SynchronizationLockViolation`] when the calling
/// thread does not own the monitor.
pub fn exit(obj: &ObjectHeader) -> Result<(), MonitorError> {
    let lw = obj.lock_word();
    ensure_owned(lw, host::thread_small_id())?;

    if lw.is_inflated() {
        lw.sync_block().lock().exit();
    } else if lw.flat_nest() > 0 {
        obj.store_lock_word(lw.with_nest_decremented());
    } else {
        obj.store_lock_word(LockWord::from_raw(0));
    }
    Ok(())
}

/// Releases `obj`'s monitor and blocks until pulsed, then reacquires it
/// with the saved nest count.
///
/// Returns `Ok(true)` when a pulse promoted the wait, `Ok(false)` on
/// timeout or interruption (a pending interruption is checkpointed after
/// the monitor is reacquired).
///
/// # Errors
///
/// Returns [`MonitorError::SynchronizationLockViolation`] when the calling
/// thread does not own the monitor.
pub fn wait(obj: &ObjectHeader, timeout: Option<Duration>) -> Result<bool, MonitorError> {
    let small_id = host::thread_small_id();
    let mut lw = obj.lock_word();
    ensure_owned(lw, small_id)?;

    if !lw.is_inflated() {
        // We are about to race with a pulsing thread, so the monitor must
        // be inflated up front.
        inflate_owned(obj);
        lw = obj.lock_word();
    }
    let block = lw.sync_block();
    tracing::trace!(obj = obj.addr(), ?timeout, "waiting on monitor");

    let parker = Parker::new(1);
    let wait_block = WaitBlock::new(&parker, 0, WAIT_SUCCESS);
    // Safety: we own the monitor, which guards the condition wait list.
    unsafe { list::insert_tail(block.wait_list().as_ptr(), wait_block.entry.as_ptr()); }

    let nest = block.lock().exit_completely();
    let status = parker.park_ex(MONITOR_SPIN_COUNT, timeout, None, true);

    let success = status == WAIT_SUCCESS;
    if success {
        // A pulse moved our wait block to the lock's queue and the lock was
        // handed to us on release.
        block.lock().set_owner(small_id);
    } else {
        // Not promoted: reacquire by ordinary contention and drop the wait
        // block out of the condition list.
        tracing::trace!(obj = obj.addr(), status, "wait failed, reacquiring");
        let mut spinner = SpinWait::new();
        while block.lock().try_enter_ex(None, None, false) != WAIT_SUCCESS {
            spinner.spin_once();
        }
        if !wait_block.entry.is_dead() {
            // Safety: we own the monitor again; the entry is still linked.
            unsafe { list::remove_entry(wait_block.entry.as_ptr()) };
        }
    }
    block.lock().set_nest(nest);

    if !success && host::interruption_requested() {
        host::interruption_checkpoint();
    }
    Ok(success)
}

/// Promotes the first eligible condition waiter of `obj` onto the monitor's
/// lock queue; it acquires the monitor when the caller exits.
///
/// # Errors
///
/// Returns [`MonitorError::SynchronizationLockViolation`] when the calling
/// thread does not own the monitor.
pub fn pulse(obj: &ObjectHeader) -> Result<(), MonitorError> {
    let block = pulse_target(obj)?;
    let head = block.wait_list().as_ptr();
    // Safety: we own the monitor, which guards the condition wait list;
    // queued wait blocks stay alive until unparked or dead-marked.
    unsafe {
        loop {
            let entry = (*head).forward();
            if entry == head {
                break;
            }
            list::remove_entry(entry);
            let wait_block = WaitBlock::from_entry(entry);
            if wait_block.parker().try_lock() {
                tracing::trace!(obj = obj.addr(), "promoting one condition waiter");
                block.lock().enqueue_locked(wait_block);
                break;
            }
            (*entry).mark_dead();
        }
    }
    Ok(())
}

/// Promotes every eligible condition waiter of `obj`.
///
/// # Errors
///
/// Returns [`MonitorError::SynchronizationLockViolation`] when the calling
/// thread does not own the monitor.
pub fn pulse_all(obj: &ObjectHeader) -> Result<(), MonitorError> {
    let block = pulse_target(obj)?;
    let head = block.wait_list().as_ptr();
    // Safety: as in `pulse`.
    unsafe {
        let mut entry = (*head).forward();
        if entry == head {
            return Ok(());
        }
        while entry != head {
            let next = (*entry).forward();
            let wait_block = WaitBlock::from_entry(entry);
            if wait_block.parker().try_lock() {
                block.lock().enqueue_locked(wait_block);
            } else {
                (*entry).mark_dead();
            }
            entry = next;
        }
        block.wait_list().init();
    }
    Ok(())
}

/// Ownership check plus on-demand inflation shared by pulse and pulse-all.
fn pulse_target(obj: &ObjectHeader) -> Result<&'static SyncBlock, MonitorError> {
    let lw = obj.lock_word();
    ensure_owned(lw, host::thread_small_id())?;
    if lw.is_inflated() {
        Ok(lw.sync_block())
    } else {
        // Assume we are racing with a waiter and inflate preemptively.
        Ok(inflate_owned(obj))
    }
}

/// A stable 30-bit identity hash for `obj`.
///
/// The first request publishes the hash into the lock word when the object
/// was never locked; otherwise the monitor inflates so hash and lock state
/// can coexist, with the hash stored in the sync block.
#[allow(
    clippy::cast_possible_truncation,
    clippy::cast_possible_wrap,
    reason = "the hash deliberately folds the low address bits and is masked \
              to 30 bits"
)]
pub fn hash(obj: &ObjectHeader) -> i32 {
    let mut lw = obj.lock_word();

    if lw.status() == Status::ThinHash {
        return lw.thin_hash_value();
    }
    if lw.status() == Status::FatHash {
        return lw.sync_block().hash_code();
    }

    // The hash depends only on the address, so racing computations agree.
    let hash = ((obj.addr() >> OBJECT_ALIGNMENT_SHIFT) as u32).wrapping_mul(HASH_MULTIPLIER);
    let hash = (hash as i32) & HASH_MASK;

    if lw.is_free() {
        if obj.cas_lock_word(lw, LockWord::thin_hash(hash)) {
            return hash;
        }
        lw = obj.lock_word();
        if lw.status() == Status::ThinHash {
            return hash;
        }
        // Someone acquired or inflated the lock meanwhile.
    }

    if !lw.is_inflated() {
        // The object is flat-locked; inflate so the hash has somewhere to
        // live. Locking an object and hashing it concurrently is rare.
        let owned = lw.flat_owner() == host::thread_small_id();
        let block = if owned {
            inflate_owned(obj)
        } else {
            let acquired = inflate(obj, None, false);
            debug_assert_eq!(acquired, 1);
            obj.lock_word().sync_block()
        };
        if !owned {
            block.lock().exit();
        }
        block.set_hash_code(hash);
        obj.or_status_bit(1);
        return hash;
    }

    // Inflated without a hash yet: publish it in the block. Safe while
    // monitors never deflate.
    let block = lw.sync_block();
    block.set_hash_code(hash);
    obj.or_status_bit(1);
    hash
}

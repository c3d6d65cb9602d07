// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

use crate::list::ListEntry;
use crate::loom::atomic::{AtomicI32, Ordering};
use crate::parker::Parker;
use core::ptr;

/// Mask for the value portion of a request code.
pub const MAX_REQUEST: i32 = (1 << 30) - 1;
/// Flags a request that must be treated specially by queue processing.
pub const SPECIAL_REQUEST: i32 = 1 << 30;
/// Flags a wait block whose parker was locked before it was enqueued; such a
/// block is granted even though its parker cannot be locked again.
pub const LOCKED_REQUEST: i32 = i32::MIN;
/// A plain acquire request.
pub const ACQUIRE: i32 = 1;
/// An acquire request enqueued on behalf of an already-locked parker.
pub const LOCKED_ACQUIRE: i32 = LOCKED_REQUEST | ACQUIRE;
/// A request queued by a thread that only wants a locked queue's *lock*.
pub const LOCK_ONLY_REQUEST: i32 = LOCKED_REQUEST | SPECIAL_REQUEST;

/// A stack-allocated request queued on a synchronizer.
///
/// The embedded [`ListEntry`] must stay the first field: queue code recovers
/// the wait block from a list entry pointer by casting.
#[derive(Debug)]
#[repr(C)]
pub struct WaitBlock {
    pub entry: ListEntry,
    parker: *const Parker,
    pub(crate) request: AtomicI32,
    pub(crate) wait_key: i32,
}

// Safety: the raw parker pointer is only dereferenced while the waiting
// thread is blocked inside `park_ex`, which keeps the parker alive; queue
// protocols guarantee no access after the wait block is unlinked or
// dead-marked.
unsafe impl Send for WaitBlock {}
// Safety: see above; all mutable state is atomic.
unsafe impl Sync for WaitBlock {}

// === impl WaitBlock ===

impl WaitBlock {
    #[must_use]
    pub fn new(parker: &Parker, request: i32, wait_key: i32) -> Self {
        Self {
            entry: ListEntry::new(),
            parker: ptr::from_ref(parker),
            request: AtomicI32::new(request),
            wait_key,
        }
    }

    /// Recovers the wait block containing `entry`.
    ///
    /// # Safety
    ///
    /// `entry` must be the `entry` field of a live `WaitBlock`.
    #[inline]
    pub unsafe fn from_entry<'a>(entry: *mut ListEntry) -> &'a WaitBlock {
        // Safety: `entry` is the first field of a `repr(C)` wait block, so
        // the pointer casts back to its container; liveness per caller.
        unsafe { &*entry.cast::<WaitBlock>() }
    }

    /// The parker this wait block reports to.
    #[inline]
    pub fn parker(&self) -> &Parker {
        // Safety: per the container invariant the parker outlives every
        // queue that can still reach this wait block.
        unsafe { &*self.parker }
    }

    #[inline]
    pub(crate) fn request(&self) -> i32 {
        self.request.load(Ordering::Relaxed)
    }
}

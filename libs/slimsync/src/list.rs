// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Intrusive circular doubly-linked list with a sentinel head.
//!
//! Entries are linked by raw pointers and manipulated by free functions, so
//! the same [`ListEntry`] can serve as a list node, as a link in a lock-free
//! contention stack (`flink` only), or as the distinguished *dead* sentinel:
//! an entry whose `flink` points at itself has been removed by a third party
//! and must be skipped by walkers.
//!
//! Callers are responsible for the usual intrusive-list discipline: every
//! function below that takes raw pointers requires the entries to be alive
//! and the list to be protected by whatever lock (or publication protocol)
//! its owner imposes.

use crate::loom::atomic::{AtomicPtr, Ordering};
use core::ptr;

/// Sentinel stored in a lock-state word when the lock is free.
pub(crate) const LOCK_FREE: *mut ListEntry = ptr::without_provenance_mut(usize::MAX);
/// Sentinel stored in a lock-state word when the lock is held and no
/// contention stack has formed. Identical to a null stack terminator.
pub(crate) const LOCK_BUSY: *mut ListEntry = ptr::null_mut();

/// An intrusive list link.
///
/// `flink` is atomic because unlinked entries may self-point to signal
/// "removed" while other threads are still walking a stale snapshot of the
/// list; readers must tolerate observing that transition at any time.
#[derive(Debug)]
#[repr(C)]
pub struct ListEntry {
    pub(crate) flink: AtomicPtr<ListEntry>,
    pub(crate) blink: AtomicPtr<ListEntry>,
}

// === impl ListEntry ===

impl ListEntry {
    #[must_use]
    pub fn new() -> Self {
        Self {
            flink: AtomicPtr::new(ptr::null_mut()),
            blink: AtomicPtr::new(ptr::null_mut()),
        }
    }

    /// This entry as a raw link pointer.
    #[inline]
    pub fn as_ptr(&self) -> *mut ListEntry {
        ptr::from_ref(self).cast_mut()
    }

    /// Makes `self` an empty sentinel head.
    pub fn init(&self) {
        let this = self.as_ptr();
        self.flink.store(this, Ordering::Relaxed);
        self.blink.store(this, Ordering::Relaxed);
    }

    /// Whether a sentinel head has any entries. Also `true` for a head that
    /// was never initialized.
    #[inline]
    pub fn is_empty(&self) -> bool {
        let flink = self.flink.load(Ordering::Relaxed);
        flink == self.as_ptr() || flink.is_null()
    }

    /// The next entry in list order. Callers must hold the lock guarding
    /// the list.
    #[inline]
    pub fn forward(&self) -> *mut ListEntry {
        self.flink.load(Ordering::Relaxed)
    }

    /// Whether this entry carries the self-linked "removed" sentinel.
    #[inline]
    pub fn is_dead(&self) -> bool {
        self.flink.load(Ordering::Acquire) == self.as_ptr()
    }

    /// Marks this entry as removed so that list walkers skip it.
    #[inline]
    pub fn mark_dead(&self) {
        self.flink.store(self.as_ptr(), Ordering::Release);
    }
}

impl Default for ListEntry {
    fn default() -> Self {
        Self::new()
    }
}

/// Unlinks `entry` from its list. Returns `true` when the list became empty.
///
/// # Safety
///
/// `entry` must be linked into a live list owned by the caller.
pub unsafe fn remove_entry(entry: *mut ListEntry) -> bool {
    // Safety: ensured by caller.
    unsafe {
        let blink = (*entry).blink.load(Ordering::Relaxed);
        let flink = (*entry).flink.load(Ordering::Relaxed);
        (*blink).flink.store(flink, Ordering::Relaxed);
        (*flink).blink.store(blink, Ordering::Relaxed);
        flink == blink
    }
}

/// Removes and returns the first entry after the sentinel `head`.
///
/// # Safety
///
/// `head` must be a non-empty sentinel owned by the caller.
pub unsafe fn remove_first(head: *mut ListEntry) -> *mut ListEntry {
    // Safety: ensured by caller.
    unsafe {
        let entry = (*head).flink.load(Ordering::Relaxed);
        let flink = (*entry).flink.load(Ordering::Relaxed);
        (*head).flink.store(flink, Ordering::Relaxed);
        (*flink).blink.store(head, Ordering::Relaxed);
        entry
    }
}

/// Inserts `entry` at the tail of the list headed by `head`.
///
/// # Safety
///
/// `head` must be an initialized sentinel and `entry` alive and unlinked.
pub unsafe fn insert_tail(head: *mut ListEntry, entry: *mut ListEntry) {
    // Safety: ensured by caller.
    unsafe {
        let blink = (*head).blink.load(Ordering::Relaxed);
        (*entry).flink.store(head, Ordering::Relaxed);
        (*head).blink.store(entry, Ordering::Relaxed);
        (*entry).blink.store(blink, Ordering::Relaxed);
        (*blink).flink.store(entry, Ordering::Relaxed);
    }
}

/// Inserts `entry` immediately after `node` (which may be the sentinel).
///
/// # Safety
///
/// `node` must be linked into a live list and `entry` alive and unlinked.
pub unsafe fn insert_head(node: *mut ListEntry, entry: *mut ListEntry) {
    // Safety: ensured by caller.
    unsafe {
        let flink = (*node).flink.load(Ordering::Relaxed);
        (*entry).flink.store(flink, Ordering::Relaxed);
        (*flink).blink.store(entry, Ordering::Relaxed);
        (*entry).blink.store(node, Ordering::Relaxed);
        (*node).flink.store(entry, Ordering::Relaxed);
    }
}

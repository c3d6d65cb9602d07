// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Weak-link surface consumed from the collector.
//!
//! A bound sync block holds its object through a weak link: a registered
//! word the collector nulls when the object dies. The registry here stands
//! in for the collector's weak-reference table; [`collect_object`] is the
//! hook the collector (or a test) uses to report an object's death.

use core::ptr;
use core::sync::atomic::{AtomicUsize, Ordering};
use hashbrown::HashSet;
use std::sync::{LazyLock, Mutex, PoisonError};

static LINKS: LazyLock<Mutex<HashSet<usize>>> = LazyLock::new(|| Mutex::new(HashSet::new()));

/// Registers `link` as a weak reference to `obj`.
pub(crate) fn weak_link_add(link: &AtomicUsize, obj: usize) {
    link.store(obj, Ordering::Release);
    LINKS
        .lock()
        .unwrap_or_else(PoisonError::into_inner)
        .insert(ptr::from_ref(link).expose_provenance());
}

/// Unregisters `link` and clears it.
pub(crate) fn weak_link_remove(link: &AtomicUsize) {
    LINKS
        .lock()
        .unwrap_or_else(PoisonError::into_inner)
        .remove(&ptr::from_ref(link).expose_provenance());
    link.store(0, Ordering::Release);
}

/// Resolves `link`; zero when the referent was collected.
pub(crate) fn weak_link_get(link: &AtomicUsize) -> usize {
    link.load(Ordering::Acquire)
}

/// Nulls every registered weak link referring to `addr`, as the collector
/// does when the object at that address dies. The object must no longer be
/// reachable by any monitor operation.
pub fn collect_object(addr: usize) {
    let links = LINKS.lock().unwrap_or_else(PoisonError::into_inner);
    for &link_addr in &*links {
        // Safety: registered links live inside the allocator's leaked sync
        // block arrays and are therefore always valid.
        let link = unsafe { &*ptr::with_exposed_provenance::<AtomicUsize>(link_addr) };
        if link.load(Ordering::Acquire) == addr {
            link.store(0, Ordering::Release);
        }
    }
}

// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Process-wide registry handing out artificial handles for waitable
//! objects, so they can be shared across domains that cannot exchange
//! pointers.
//!
//! Handles are generated from a module-level counter that wraps back to one
//! near the top of the range. The registry assumes the same object is not
//! registered more than once; callers needing that must synchronize
//! upstream.

use crate::ObjectHeader;
use hashbrown::HashMap;
use std::sync::LazyLock;

/// An opaque, non-zero registry handle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Handle(usize);

// === impl Handle ===

impl Handle {
    #[must_use]
    pub fn as_raw(self) -> usize {
        self.0
    }
}

struct HandleTable {
    next_handle: usize,
    entries: HashMap<usize, usize>,
}

static HANDLES: LazyLock<slimsync::Mutex<HandleTable>> = LazyLock::new(|| {
    slimsync::Mutex::new(HandleTable {
        next_handle: 1,
        entries: HashMap::new(),
    })
});

/// Registers `obj` and returns its handle.
pub fn register(obj: &ObjectHeader) -> Handle {
    let mut table = HANDLES.lock();
    let handle = table.next_handle;
    if table.next_handle == usize::MAX - 1 {
        table.next_handle = 1;
    } else {
        table.next_handle += 1;
    }
    table.entries.insert(handle, obj.addr());
    Handle(handle)
}

/// Resolves `handle` to the registered object's address, or zero.
#[must_use]
pub fn resolve(handle: Handle) -> usize {
    HANDLES.lock().entries.get(&handle.0).copied().unwrap_or(0)
}

/// Drops `handle` from the registry. Returns whether it was present.
pub fn remove(handle: Handle) -> bool {
    HANDLES.lock().entries.remove(&handle.0).is_some()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn register_resolve_remove() {
        let obj = ObjectHeader::new();
        let handle = register(&obj);
        assert_ne!(handle.as_raw(), 0);
        assert_eq!(resolve(handle), obj.addr());
        assert!(remove(handle));
        assert_eq!(resolve(handle), 0);
        assert!(!remove(handle));
    }

    #[test]
    fn handles_are_distinct() {
        let a = ObjectHeader::new();
        let b = ObjectHeader::new();
        let ha = register(&a);
        let hb = register(&b);
        assert_ne!(ha, hb);
        assert_eq!(resolve(ha), a.addr());
        assert_eq!(resolve(hb), b.addr());
        assert!(remove(ha));
        assert!(remove(hb));
    }
}

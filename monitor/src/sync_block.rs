// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Sync blocks and their allocator.
//!
//! A sync block extends an object's header once its monitor inflates: it
//! carries the reentrant fair lock, the condition wait list, and the
//! identity hash when one was published before or after inflation.
//!
//! Blocks live in geometrically growing arrays that are allocated once and
//! never freed. The `data` word tracks the lifecycle: on the free list it
//! links the next free block, on a bound block it is the weak link to the
//! object, and a bound block whose weak link reads zero is dead and gets
//! recycled lazily the next time the free list runs dry.
//!
//! The allocator's mutex also guards the inflation table, the transient
//! object → block map that lets concurrent inflation attempts of the same
//! object share one block. It is only ever held around CAS-bounded
//! sections, never across a blocking wait.

use crate::gc;
use crate::host;
use core::fmt::Write as _;
use core::mem::{align_of, size_of};
use core::ptr;
use core::sync::atomic::{AtomicI32, AtomicU32, AtomicUsize, Ordering};
use hashbrown::HashMap;
use slimsync::{ListEntry, ReentrantFairLock};
use static_assertions::const_assert;
use std::sync::LazyLock;

/// Spin count configured on every sync-block lock.
pub(crate) const MONITOR_SPIN_COUNT: u32 = 256;

const INITIAL_ARRAY_SIZE: usize = 16;

/// The lock record bound to an inflated object.
#[derive(Debug)]
#[repr(C)]
pub(crate) struct SyncBlock {
    lock: ReentrantFairLock,
    /// Condition wait list; initialized when the block is published.
    wait_list: ListEntry,
    hash_code: AtomicI32,
    /// Number of unfinished inflation attempts holding this block; only
    /// meaningful while the block sits in the inflation table.
    inflation_refcount: AtomicU32,
    /// FREE: next free block. BOUND: weak link to the object.
    data: AtomicUsize,
}

// The lock word steals the two low bits of a sync block pointer.
const_assert!(align_of::<SyncBlock>() >= 4);

// === impl SyncBlock ===

impl SyncBlock {
    fn new() -> Self {
        Self {
            lock: ReentrantFairLock::new(MONITOR_SPIN_COUNT),
            wait_list: ListEntry::new(),
            hash_code: AtomicI32::new(0),
            inflation_refcount: AtomicU32::new(0),
            data: AtomicUsize::new(0),
        }
    }

    #[inline]
    pub(crate) fn lock(&self) -> &ReentrantFairLock {
        &self.lock
    }

    #[inline]
    pub(crate) fn wait_list(&self) -> &ListEntry {
        &self.wait_list
    }

    #[inline]
    pub(crate) fn hash_code(&self) -> i32 {
        self.hash_code.load(Ordering::Acquire)
    }

    pub(crate) fn set_hash_code(&self, hash: i32) {
        self.hash_code.store(hash, Ordering::Release);
    }

    #[inline]
    pub(crate) fn data(&self) -> &AtomicUsize {
        &self.data
    }

    #[inline]
    pub(crate) fn addr(&self) -> usize {
        ptr::from_ref(self).expose_provenance()
    }

    pub(crate) fn retain(&self) {
        self.inflation_refcount.fetch_add(1, Ordering::Relaxed);
    }
}

pub(crate) struct Allocator {
    free_list: usize,
    arrays: Vec<&'static [SyncBlock]>,
    array_size: usize,
    /// Transient map from a pinned object's address to the block an ongoing
    /// inflation is trying to publish.
    table: HashMap<usize, &'static SyncBlock>,
}

// === impl Allocator ===

impl Allocator {
    fn new() -> Self {
        Self {
            free_list: 0,
            arrays: Vec::new(),
            array_size: INITIAL_ARRAY_SIZE,
            table: HashMap::new(),
        }
    }

    /// Looks up the block an ongoing inflation of `obj` uses, retaining it,
    /// or binds a fresh block whose inner lock is owned by the caller.
    ///
    /// Returns the block and whether it was newly bound; a newly bound
    /// block still needs its weak link installed (outside this mutex).
    pub(crate) fn lookup_or_bind(&mut self, obj: usize) -> (&'static SyncBlock, bool) {
        if let Some(&block) = self.table.get(&obj) {
            block.retain();
            return (block, false);
        }
        let block = self.mon_new();
        self.table.insert(obj, block);
        (block, true)
    }

    /// Drops one inflation reference to `block`; the last reference of a
    /// never-published block returns it to the free list.
    pub(crate) fn fail_inflation(&mut self, obj: usize, block: &'static SyncBlock) {
        let remaining = block.inflation_refcount.fetch_sub(1, Ordering::Relaxed) - 1;
        if remaining == 0 {
            self.table.remove(&obj);
            self.mon_finalize(block);
        }
    }

    /// Completes a successful publication of `block` for `obj`.
    pub(crate) fn finish_inflation(&mut self, obj: usize, block: &'static SyncBlock) {
        block.wait_list.init();
        block.inflation_refcount.store(0, Ordering::Relaxed);
        self.table.remove(&obj);
    }

    /// Takes a block off the free list, recycling dead blocks or growing
    /// the arrays when it runs dry. The block's lock comes back owned by
    /// the calling thread.
    fn mon_new(&mut self) -> &'static SyncBlock {
        if self.free_list == 0 {
            self.recycle_dead_blocks();
        }
        if self.free_list == 0 {
            self.grow();
        }

        // Safety: free-list entries point into the leaked arrays.
        let block = unsafe { &*ptr::with_exposed_provenance::<SyncBlock>(self.free_list) };
        self.free_list = block.data.load(Ordering::Relaxed);
        // Self-link until the weak link is installed so the recycling scan
        // cannot mistake the block for a dead one.
        block.data.store(block.addr(), Ordering::Relaxed);
        block.lock.reset_owned(host::thread_small_id());
        block.hash_code.store(0, Ordering::Relaxed);
        block.inflation_refcount.store(1, Ordering::Relaxed);
        block
    }

    /// Scans for bound blocks whose object has been collected and relinks
    /// them onto the free list. Arrays sit in allocation order, so smaller
    /// ones are scanned first; the scan stops at the first array that
    /// yields anything.
    fn recycle_dead_blocks(&mut self) {
        let mut recycled = 0_usize;
        for array in &self.arrays {
            for block in *array {
                if block.data.load(Ordering::Acquire) == 0 {
                    gc::weak_link_remove(&block.data);
                    block.data.store(self.free_list, Ordering::Relaxed);
                    self.free_list = block.addr();
                    recycled += 1;
                }
            }
            if recycled > 0 {
                break;
            }
        }
        if recycled > 0 {
            tracing::trace!(recycled, "recycled dead sync blocks");
        }
    }

    fn grow(&mut self) {
        let count = self.array_size;
        self.array_size *= 2;
        tracing::trace!(count, "allocating more sync blocks");

        let array: &'static [SyncBlock] = Box::leak(
            (0..count)
                .map(|_| SyncBlock::new())
                .collect::<Vec<_>>()
                .into_boxed_slice(),
        );
        for i in 0..count - 1 {
            array[i].data.store(array[i + 1].addr(), Ordering::Relaxed);
        }
        array[count - 1].data.store(self.free_list, Ordering::Relaxed);
        self.free_list = array[0].addr();
        // Appending keeps the recycling scan visiting smaller arrays first.
        self.arrays.push(array);
    }

    /// Returns `block` to the free list, dropping its weak link.
    fn mon_finalize(&mut self, block: &'static SyncBlock) {
        tracing::trace!(block = block.addr(), "finalizing sync block");
        gc::weak_link_remove(&block.data);
        block.data.store(self.free_list, Ordering::Relaxed);
        self.free_list = block.addr();
    }

    fn is_block_addr(&self, addr: usize) -> bool {
        self.arrays.iter().any(|array| {
            let start = array.as_ptr().expose_provenance();
            let end = start + array.len() * size_of::<SyncBlock>();
            addr >= start && addr < end
        })
    }
}

static ALLOCATOR: LazyLock<slimsync::Mutex<Allocator>> =
    LazyLock::new(|| slimsync::Mutex::new(Allocator::new()));

/// The allocator singleton. Lock ordering: nothing else is acquired while
/// this mutex is held except the weak-link registry.
pub(crate) fn allocator() -> &'static slimsync::Mutex<Allocator> {
    &ALLOCATOR
}

/// Installs the allocator and the inflation table. Idempotent; operations
/// initialize lazily anyway.
pub fn init() {
    LazyLock::force(&ALLOCATOR);
}

/// Releases nothing: sync blocks must outlive the subsystem because the
/// collector may still reference them through weak links.
pub fn cleanup() {}

/// Renders a report of all sync blocks and the locks they hold, in the
/// style of a debugger dump. With `include_untaken`, bound but currently
/// unheld locks are listed too.
pub fn locks_dump(include_untaken: bool) -> String {
    let allocator = allocator().lock();
    let mut out = String::new();

    let mut on_freelist = 0_usize;
    let mut free = allocator.free_list;
    while free != 0 {
        on_freelist += 1;
        // Safety: free-list entries point into the leaked arrays.
        free = unsafe { &*ptr::with_exposed_provenance::<SyncBlock>(free) }
            .data
            .load(Ordering::Relaxed);
    }

    let mut total = 0_usize;
    let mut used = 0_usize;
    let mut to_recycle = 0_usize;
    for array in &allocator.arrays {
        total += array.len();
        for block in *array {
            let data = block.data.load(Ordering::Acquire);
            if data == 0 {
                to_recycle += 1;
            } else if !allocator.is_block_addr(data) {
                // Not a free-list link, so this block is bound to a live
                // object.
                used += 1;
                let holder = gc::weak_link_get(&block.data);
                let owner = block.lock.owner();
                if owner != 0 {
                    let _ = writeln!(
                        out,
                        "Lock {:#x} in object {holder:#x} held by thread {owner}, nest level: {}",
                        block.addr(),
                        block.lock.nest(),
                    );
                    if block.lock.has_queued_waiters() {
                        let _ = writeln!(out, "\tThere are threads waiting to acquire the lock");
                    }
                } else if include_untaken {
                    let _ = writeln!(out, "Lock {:#x} in object {holder:#x} untaken", block.addr());
                }
            }
        }
    }
    let _ = writeln!(
        out,
        "Total locks (in {} array(s)): {total}, used: {used}, on freelist: {on_freelist}, to recycle: {to_recycle}",
        allocator.arrays.len(),
    );
    out
}

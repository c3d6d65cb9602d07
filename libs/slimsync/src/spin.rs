// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

use crate::loom::thread;
use core::sync::atomic::{AtomicUsize, Ordering};

/// How often a calibrated spinner yields the processor instead of spinning.
const YIELD_FREQUENCY: u32 = 4000;

/// Returns `true` when the process has more than one processor available.
///
/// Spinning is pointless on a uniprocessor, so every spin count in the crate
/// collapses to zero there. The detection result is cached.
pub fn is_multi_processor() -> bool {
    static NUM_PROCS: AtomicUsize = AtomicUsize::new(0);

    let mut procs = NUM_PROCS.load(Ordering::Relaxed);
    if procs == 0 {
        procs = std::thread::available_parallelism().map_or(1, usize::from);
        NUM_PROCS.store(procs, Ordering::Relaxed);
    }
    procs > 1
}

/// Yields the OS scheduler `iterations` times.
pub fn spin_wait(iterations: u32) {
    for _ in 0..iterations {
        thread::yield_now();
    }
}

/// A calibrated backoff helper for open-coded retry loops.
///
/// Unlike a pure spin loop this eventually degrades to yielding the
/// processor, so it is safe to use while waiting for another thread that may
/// not be running.
#[derive(Debug, Default)]
pub struct SpinWait {
    count: u32,
}

// === impl SpinWait ===

impl SpinWait {
    #[must_use]
    pub const fn new() -> Self {
        Self { count: 0 }
    }

    /// Performs a single backoff step, proportional to the number of steps
    /// taken so far.
    pub fn spin_once(&mut self) {
        self.count = self.count.wrapping_add(1) & !(1 << 31);
        if is_multi_processor() {
            let remainder = self.count % YIELD_FREQUENCY;
            if remainder > 0 {
                spin_wait(1 + remainder * 32 / 1000);
            } else {
                thread::yield_now();
            }
        } else {
            thread::yield_now();
        }
    }

    pub fn reset(&mut self) {
        self.count = 0;
    }
}

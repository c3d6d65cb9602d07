// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Low-level synchronization primitives built around a single-shot *parker*.
//!
//! The crate provides the building blocks used by the managed-object monitor:
//! a per-wait [`Parker`] backed by an OS-level [`ParkSpot`], an [`Alerter`]
//! for broadcast cancellation, a sticky [`NotificationEvent`], a fair
//! queue-based [`FairLock`]/[`ReentrantFairLock`] pair layered on a binary
//! [`Mutant`], an auto-reset [`SyncEvent`], and a non-fair [`Lock`] whose
//! contention queue is itself lock-free.
//!
//! All blocking operations accept an optional timeout (`None` = infinite),
//! an optional [`Alerter`], and an `interruptible` flag; they report their
//! outcome as a wait-status code ([`WAIT_SUCCESS`], [`WAIT_TIMEOUT`],
//! [`WAIT_ALERTED`], [`WAIT_INTERRUPTED`]) carried on the parker.

mod alerter;
mod event;
mod fair_lock;
pub mod host;
pub mod list;
mod lock;
mod locked_queue;
mod loom;
mod mutant;
mod park_spot;
mod parker;
mod spin;
mod wait_block;

pub use alerter::Alerter;
pub use event::NotificationEvent;
pub use fair_lock::{FairLock, ReentrantFairLock};
pub use list::ListEntry;
pub use lock::{Lock, RawLock};
pub use mutant::{Mutant, SyncEvent};
pub use park_spot::ParkSpot;
pub use parker::{
    Parker, WAIT_ALERTED, WAIT_INTERRUPTED, WAIT_SUCCESS, WAIT_TIMEOUT, WaitStatus,
};
pub use spin::{SpinWait, is_multi_processor, spin_wait};
pub use wait_block::{
    ACQUIRE, LOCK_ONLY_REQUEST, LOCKED_ACQUIRE, LOCKED_REQUEST, MAX_REQUEST, SPECIAL_REQUEST,
    WaitBlock,
};

#[cfg(not(loom))]
/// A mutex whose raw implementation is the crate's non-fair [`RawLock`].
pub type Mutex<T> = lock_api::Mutex<RawLock, T>;
#[cfg(not(loom))]
/// RAII guard returned by [`Mutex`].
pub type MutexGuard<'a, T> = lock_api::MutexGuard<'a, RawLock, T>;

use static_assertions::assert_impl_all;

assert_impl_all!(Alerter: Send, Sync);
assert_impl_all!(FairLock: Send, Sync);
assert_impl_all!(Lock: Send, Sync);
assert_impl_all!(Mutant: Send, Sync);
assert_impl_all!(NotificationEvent: Send, Sync);
assert_impl_all!(Parker: Send, Sync);
assert_impl_all!(ReentrantFairLock: Send, Sync);
assert_impl_all!(SyncEvent: Send, Sync);

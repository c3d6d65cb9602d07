// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! The alerter: broadcast cancellation of a group of parked threads.
//!
//! The state word is either null (no registrations), the `ALERTED` sentinel,
//! or the head of a lock-free singly-linked list of registered parkers
//! (chained through [`Parker::next`]). Once alerted, registration fails and
//! every registered parker that can still be cancelled is unparked with
//! [`WAIT_ALERTED`].

use crate::loom::atomic::{AtomicPtr, Ordering};
use crate::parker::{Parker, WAIT_ALERTED};
use crate::spin::SpinWait;
use core::ptr;

const ALERTED: *mut Parker = ptr::without_provenance_mut(usize::MAX);

/// A broadcast-cancellation group over registered parkers.
#[derive(Debug)]
pub struct Alerter {
    state: AtomicPtr<Parker>,
}

// === impl Alerter ===

impl Alerter {
    #[must_use]
    pub fn new() -> Self {
        Self {
            state: AtomicPtr::new(ptr::null_mut()),
        }
    }

    #[inline]
    pub fn is_set(&self) -> bool {
        self.state.load(Ordering::Acquire) == ALERTED
    }

    /// Alerts the group. Every parker registered at the moment of the
    /// transition observes [`WAIT_ALERTED`]; later registrations fail.
    /// Returns `false` when the alerter was already set.
    pub fn set(&self) -> bool {
        loop {
            let state = self.state.load(Ordering::Acquire);
            if state == ALERTED {
                return false;
            }
            if self
                .state
                .compare_exchange_weak(state, ALERTED, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
            {
                tracing::trace!("alerting registered parkers");
                // Safety: the captured list is now unreachable from the
                // state word; its parkers stay alive until deregistered.
                unsafe { alert_parker_list(state); }
                return true;
            }
        }
    }

    /// Registers `parker` with the group. Fails when the alerter is already
    /// set; the caller must then cancel its own wait.
    pub fn register(&self, parker: &Parker) -> bool {
        let parker_ptr = ptr::from_ref(parker).cast_mut();
        loop {
            let state = self.state.load(Ordering::Acquire);
            if state == ALERTED {
                return false;
            }
            parker.next.store(state, Ordering::Relaxed);
            if self
                .state
                .compare_exchange_weak(state, parker_ptr, Ordering::Release, Ordering::Relaxed)
                .is_ok()
            {
                return true;
            }
        }
    }

    /// Removes `parker` from the registration list after its wait completed.
    pub fn deregister(&self, parker: &Parker) {
        let parker_ptr = ptr::from_ref(parker).cast_mut();
        if parker.next.load(Ordering::Acquire) == parker_ptr {
            return;
        }
        if parker.next.load(Ordering::Acquire).is_null()
            && self
                .state
                .compare_exchange(
                    parker_ptr,
                    ptr::null_mut(),
                    Ordering::AcqRel,
                    Ordering::Relaxed,
                )
                .is_ok()
        {
            return;
        }
        self.slow_deregister(parker);
    }

    /// Slow removal: takes the whole list, filters out locked parkers
    /// (including the caller's), merges the survivors back, and spins until
    /// some list walker self-links our parker.
    fn slow_deregister(&self, parker: &Parker) {
        let parker_ptr = ptr::from_ref(parker).cast_mut();
        let mut spinner = SpinWait::new();

        'retry: loop {
            // Capture the list, leaving the alerter empty.
            let mut state;
            loop {
                if parker.next.load(Ordering::Acquire) == parker_ptr {
                    return;
                }
                state = self.state.load(Ordering::Acquire);
                if state.is_null() || state == ALERTED {
                    // Another remover or the alert path owns the list; wait
                    // for it to self-link our parker below.
                    break;
                }
                if self
                    .state
                    .compare_exchange_weak(
                        state,
                        ptr::null_mut(),
                        Ordering::AcqRel,
                        Ordering::Acquire,
                    )
                    .is_ok()
                {
                    // Single-element fast pop.
                    // Safety: the captured list is exclusively ours now.
                    if state == parker_ptr && unsafe { (*state).next.load(Ordering::Relaxed) }.is_null() {
                        return;
                    }
                    break;
                }
            }

            let mut merged = state;
            if !state.is_null() && state != ALERTED {
                // Filter out locked parkers; they are done waiting and only
                // expect to be self-linked.
                let mut first: *mut Parker = ptr::null_mut();
                let mut last: *mut Parker = ptr::null_mut();
                let mut current = state;
                while !current.is_null() {
                    // Safety: registered parkers stay alive until their
                    // owner observes the self-link we publish here.
                    unsafe {
                        let next = (*current).next.load(Ordering::Relaxed);
                        if (*current).is_locked() {
                            (*current).next.store(current, Ordering::Release);
                        } else if first.is_null() {
                            (*current).next.store(ptr::null_mut(), Ordering::Relaxed);
                            first = current;
                            last = current;
                        } else {
                            (*last).next.store(current, Ordering::Relaxed);
                            (*current).next.store(ptr::null_mut(), Ordering::Relaxed);
                            last = current;
                        }
                        current = next;
                    }
                }

                // Merge the survivors back, unless the alerter fired.
                if first.is_null() {
                    merged = ptr::null_mut();
                } else {
                    loop {
                        let current_state = self.state.load(Ordering::Acquire);
                        if current_state == ALERTED {
                            // Safety: survivors are exclusively ours.
                            unsafe {
                                (*last).next.store(ptr::null_mut(), Ordering::Relaxed);
                                alert_parker_list(first);
                            }
                            merged = ALERTED;
                            break;
                        }
                        // Safety: as above.
                        unsafe { (*last).next.store(current_state, Ordering::Relaxed); }
                        if self
                            .state
                            .compare_exchange_weak(
                                current_state,
                                first,
                                Ordering::Release,
                                Ordering::Acquire,
                            )
                            .is_ok()
                        {
                            merged = first;
                            break;
                        }
                    }
                }
            }

            // Spin until we are unlinked or the list changes hands again.
            loop {
                if parker.next.load(Ordering::Acquire) == parker_ptr {
                    return;
                }
                let new_state = self.state.load(Ordering::Acquire);
                if new_state != merged && new_state != ALERTED {
                    continue 'retry;
                }
                spinner.spin_once();
            }
        }
    }
}

impl Default for Alerter {
    fn default() -> Self {
        Self::new()
    }
}

/// Cancels and unparks every parker on a captured registration list,
/// self-linking each entry as it goes.
///
/// # Safety
///
/// The list must be exclusively owned by the caller and its parkers alive.
unsafe fn alert_parker_list(mut first: *mut Parker) {
    while !first.is_null() && first != ALERTED {
        // Safety: ensured by caller.
        unsafe {
            let next = (*first).next.load(Ordering::Relaxed);
            if (*first).try_cancel() {
                (*first).unpark(WAIT_ALERTED);
            }
            (*first).next.store(first, Ordering::Release);
            first = next;
        }
    }
}

#[cfg(all(test, not(loom)))]
mod tests {
    use super::*;
    use crate::parker::{WAIT_SUCCESS, WAIT_TIMEOUT};
    use std::sync::Arc;
    use std::thread;
    use std::time::Duration;

    #[test]
    fn set_alerts_parked_thread() {
        let alerter = Arc::new(Alerter::new());
        let remote = Arc::clone(&alerter);
        let handle = thread::spawn(move || {
            let parker = Parker::new(1);
            parker.park_ex(0, None, Some(&remote), false)
        });
        thread::sleep(Duration::from_millis(10));
        assert!(alerter.set());
        assert_eq!(handle.join().unwrap(), WAIT_ALERTED);
    }

    #[test]
    fn registration_fails_once_set() {
        let alerter = Alerter::new();
        assert!(alerter.set());
        assert!(!alerter.set());
        let parker = Parker::new(1);
        assert!(!alerter.register(&parker));
        // A wait governed by a fired alerter completes alerted.
        assert!(alerter.is_set());
        assert_eq!(parker.park_ex(8, None, Some(&alerter), false), WAIT_ALERTED);
    }

    #[test]
    fn deregister_after_normal_wakeup() {
        let alerter = Arc::new(Alerter::new());
        let remote = Arc::clone(&alerter);
        let parker = Arc::new(Parker::new(1));
        let parker2 = Arc::clone(&parker);
        let handle =
            thread::spawn(move || parker2.park_ex(0, None, Some(&remote), false));
        thread::sleep(Duration::from_millis(10));
        assert!(parker.try_lock());
        parker.unpark(WAIT_SUCCESS);
        assert_eq!(handle.join().unwrap(), WAIT_SUCCESS);
        // The alerter is empty again; a later set has nobody to wake.
        assert!(alerter.set());
    }

    #[test]
    fn timed_out_registration_is_removed() {
        let alerter = Alerter::new();
        let parker = Parker::new(1);
        assert_eq!(
            parker.park_ex(0, Some(Duration::from_millis(10)), Some(&alerter), false),
            WAIT_TIMEOUT
        );
        assert!(alerter.set());
    }

    #[test]
    fn set_reaches_every_registered_parker() {
        let alerter = Arc::new(Alerter::new());
        let mut handles = Vec::new();
        for _ in 0..8 {
            let remote = Arc::clone(&alerter);
            handles.push(thread::spawn(move || {
                let parker = Parker::new(1);
                parker.park_ex(0, None, Some(&remote), false)
            }));
        }
        thread::sleep(Duration::from_millis(20));
        alerter.set();
        for handle in handles {
            assert_eq!(handle.join().unwrap(), WAIT_ALERTED);
        }
    }
}

#[cfg(all(test, loom))]
mod loom_tests {
    use super::*;
    use crate::loom;
    use std::sync::Arc;

    #[test]
    fn register_races_with_set() {
        loom::model(|| {
            let alerter = Arc::new(Alerter::new());
            let parker = Arc::new(Parker::new(1));

            let setter = {
                let alerter = Arc::clone(&alerter);
                loom::thread::spawn(move || alerter.set())
            };
            let registered = alerter.register(&parker);

            setter.join().unwrap();

            if registered {
                // The set must have cancelled us, or we are still cancellable.
                assert!(parker.is_locked() || parker.try_cancel());
            } else {
                // Registration failed, so the alerter was already set.
                assert!(alerter.is_set());
            }
        });
    }
}

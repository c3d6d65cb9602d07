// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Runtime-call surface over raw object pointers.
//!
//! The managed class library reaches the monitor through these entry
//! points; they add the null-handle checks the safe API cannot need.
//!
//! # Safety
//!
//! Every function requires `obj` to be either null or a pointer to a live
//! [`ObjectHeader`] that stays pinned for the duration of the call.

use crate::ObjectHeader;
use crate::error::MonitorError;
use std::time::Duration;

unsafe fn deref<'a>(obj: *const ObjectHeader) -> Result<&'a ObjectHeader, MonitorError> {
    // Safety: ensured by caller.
    unsafe { obj.as_ref() }.ok_or(MonitorError::NullObject)
}

/// See [`crate::enter`].
///
/// # Errors
///
/// Returns [`MonitorError::NullObject`] for a null handle.
///
/// # Safety
///
/// See the module docs.
pub unsafe fn enter(obj: *const ObjectHeader) -> Result<(), MonitorError> {
    // Safety: ensured by caller.
    let obj = unsafe { deref(obj) }?;
    crate::enter(obj);
    Ok(())
}

/// See [`crate::try_enter`].
///
/// # Errors
///
/// Returns [`MonitorError::NullObject`] for a null handle.
///
/// # Safety
///
/// See the module docs.
pub unsafe fn try_enter(
    obj: *const ObjectHeader,
    timeout: Duration,
) -> Result<bool, MonitorError> {
    // Safety: ensured by caller.
    let obj = unsafe { deref(obj) }?;
    Ok(crate::try_enter(obj, timeout))
}

/// See [`crate::try_enter_interruptible`].
///
/// # Errors
///
/// Returns [`MonitorError::NullObject`] for a null handle.
///
/// # Safety
///
/// See the module docs.
pub unsafe fn try_enter_interruptible(
    obj: *const ObjectHeader,
    timeout: Option<Duration>,
) -> Result<bool, MonitorError> {
    // Safety: ensured by caller.
    let obj = unsafe { deref(obj) }?;
    Ok(crate::try_enter_interruptible(obj, timeout))
}

/// See [`crate::exit`].
///
/// # Errors
///
/// Returns [`MonitorError::NullObject`] for a null handle and
/// [`MonitorError::SynchronizationLockViolation`] when the calling thread
/// does not own the monitor.
///
/// # Safety
///
/// See the module docs.
pub unsafe fn exit(obj: *const ObjectHeader) -> Result<(), MonitorError> {
    // Safety: ensured by caller.
    let obj = unsafe { deref(obj) }?;
    crate::exit(obj)
}

/// See [`crate::wait`].
///
/// # Errors
///
/// Returns [`MonitorError::NullObject`] for a null handle and
/// [`MonitorError::SynchronizationLockViolation`] when the calling thread
/// does not own the monitor.
///
/// # Safety
///
/// See the module docs.
pub unsafe fn wait(
    obj: *const ObjectHeader,
    timeout: Option<Duration>,
) -> Result<bool, MonitorError> {
    // Safety: ensured by caller.
    let obj = unsafe { deref(obj) }?;
    crate::wait(obj, timeout)
}

/// See [`crate::pulse`].
///
/// # Errors
///
/// Returns [`MonitorError::NullObject`] for a null handle and
/// [`MonitorError::SynchronizationLockViolation`] when the calling thread
/// does not own the monitor.
///
/// # Safety
///
/// See the module docs.
pub unsafe fn pulse(obj: *const ObjectHeader) -> Result<(), MonitorError> {
    // Safety: ensured by caller.
    let obj = unsafe { deref(obj) }?;
    crate::pulse(obj)
}

/// See [`crate::pulse_all`].
///
/// # Errors
///
/// Returns [`MonitorError::NullObject`] for a null handle and
/// [`MonitorError::SynchronizationLockViolation`] when the calling thread
/// does not own the monitor.
///
/// # Safety
///
/// See the module docs.
pub unsafe fn pulse_all(obj: *const ObjectHeader) -> Result<(), MonitorError> {
    // Safety: ensured by caller.
    let obj = unsafe { deref(obj) }?;
    crate::pulse_all(obj)
}

/// See [`crate::hash`]. A null handle hashes to zero.
///
/// # Safety
///
/// See the module docs.
pub unsafe fn hash(obj: *const ObjectHeader) -> i32 {
    // Safety: ensured by caller.
    match unsafe { obj.as_ref() } {
        Some(obj) => crate::hash(obj),
        None => 0,
    }
}

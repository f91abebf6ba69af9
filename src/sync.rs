//! Lock helpers shared by the runtime primitives.
//!
//! Panics are caught at every thread and task boundary, so a poisoned lock
//! still guards consistent data; the guard is recovered instead of propagating.
use std::{
    sync::{Condvar, Mutex, MutexGuard, PoisonError},
    time::Duration,
};

use crate::timeout::Timeout;

pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

pub(crate) fn wait<'a, T>(condvar: &Condvar, guard: MutexGuard<'a, T>) -> MutexGuard<'a, T> {
    condvar.wait(guard).unwrap_or_else(PoisonError::into_inner)
}

/// Waits on `condvar` while `blocked` holds, for at most `timeout`.
///
/// Returns the guard once `blocked` is false or the timeout expired; the
/// caller re-inspects the guarded value to learn which.
pub(crate) fn wait_while<'a, T, F>(
    condvar: &Condvar,
    mut guard: MutexGuard<'a, T>,
    timeout: Timeout,
    mut blocked: F,
) -> MutexGuard<'a, T>
where
    F: FnMut(&mut T) -> bool,
{
    let deadline = timeout.deadline();
    while blocked(&mut guard) {
        let remaining = deadline.remaining();
        if remaining == Duration::ZERO {
            break;
        }
        guard = match condvar.wait_timeout(guard, remaining) {
            Ok((guard, _)) => guard,
            Err(poisoned) => poisoned.into_inner().0,
        };
    }
    guard
}

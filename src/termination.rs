//! Independent termination flag handed to bound threads.
use std::sync::{Arc, Condvar, Mutex};

use crate::{
    sync::{lock, wait_while},
    timeout::Timeout,
};

#[derive(Debug, Default)]
struct FlagState {
    set: Mutex<bool>,
    changed: Condvar,
}

/// A one-way boolean cancellation signal.
///
/// Clones share the same flag. Once set it stays set; every waiter is woken.
#[derive(Debug, Clone, Default)]
pub struct TerminationFlag {
    inner: Arc<FlagState>,
}

impl TerminationFlag {
    pub fn new() -> Self {
        Self::default()
    }

    /// Raises the flag and wakes all waiters.
    pub fn set(&self) {
        let mut set = lock(&self.inner.set);
        if !*set {
            *set = true;
            self.inner.changed.notify_all();
        }
    }

    pub fn is_set(&self) -> bool {
        *lock(&self.inner.set)
    }

    /// Blocks until the flag is raised or `timeout` elapses and returns the
    /// observed value. Expiry is a normal outcome, not an error.
    pub fn wait(&self, timeout: Timeout) -> bool {
        let guard = wait_while(
            &self.inner.changed,
            lock(&self.inner.set),
            timeout,
            |set| !*set,
        );
        *guard
    }
}

//! Owned OS threads with an optional startup barrier.
use std::{
    any::Any,
    panic::{self, AssertUnwindSafe},
    sync::{Arc, Condvar, Mutex},
    thread::{self as std_thread, JoinHandle},
};

use strum_macros::{AsRefStr, Display};
use tracing::{debug, error};

use crate::{
    error::RuntimeError,
    sync::{lock, wait},
};

/// Lifecycle of a [`Thread`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display, AsRefStr)]
pub enum RunState {
    NotStarted,
    Running,
    Finished,
}

#[derive(Debug)]
pub(crate) struct ThreadStatus {
    state: Mutex<RunState>,
    changed: Condvar,
}

impl ThreadStatus {
    fn new() -> Self {
        Self {
            state: Mutex::new(RunState::NotStarted),
            changed: Condvar::new(),
        }
    }

    pub(crate) fn get(&self) -> RunState {
        *lock(&self.state)
    }

    fn set(&self, next: RunState) {
        *lock(&self.state) = next;
        self.changed.notify_all();
    }
}

/// A named unit of concurrent execution.
///
/// The body runs on its own OS thread. Panics are caught at the thread
/// boundary and logged; they never reach the code that called [`Thread::start`].
#[derive(Debug)]
pub struct Thread {
    name: String,
    await_startup: bool,
    status: Arc<ThreadStatus>,
    handle: Option<JoinHandle<()>>,
}

impl Thread {
    /// Creates an unstarted thread. Startup is not awaited unless requested.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            await_startup: false,
            status: Arc::new(ThreadStatus::new()),
            handle: None,
        }
    }

    /// Makes [`Thread::start`] block until the body has begun running.
    pub fn await_startup(mut self, await_startup: bool) -> Self {
        self.await_startup = await_startup;
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Launches `body` on a new OS thread.
    pub fn start<F>(&mut self, body: F) -> Result<(), RuntimeError>
    where
        F: FnOnce() + Send + 'static,
    {
        if self.handle.is_some() || self.status.get() != RunState::NotStarted {
            return Err(RuntimeError::ThreadAlreadyStarted {
                thread: self.name.clone(),
            });
        }

        let status = Arc::clone(&self.status);
        let name = self.name.clone();
        let handle = std_thread::Builder::new()
            .name(self.name.clone())
            .spawn(move || {
                status.set(RunState::Running);
                if let Err(payload) = panic::catch_unwind(AssertUnwindSafe(body)) {
                    error!(
                        "Thread '{}' panicked: {}",
                        name,
                        panic_message(payload.as_ref())
                    );
                }
                status.set(RunState::Finished);
            })
            .map_err(|source| RuntimeError::ThreadSpawn {
                thread: self.name.clone(),
                source,
            })?;
        self.handle = Some(handle);
        debug!("Thread '{}' launched", self.name);

        if self.await_startup {
            let mut state = lock(&self.status.state);
            while *state == RunState::NotStarted {
                state = wait(&self.status.changed, state);
            }
        }

        Ok(())
    }

    /// Blocks until the body has returned. Joining twice is a no-op.
    pub fn join(&mut self) {
        if let Some(handle) = self.handle.take() {
            // The body is wrapped in `catch_unwind`, so the join itself cannot carry a panic.
            let _ = handle.join();
            debug!("Thread '{}' joined", self.name);
        }
    }

    /// Liveness snapshot for diagnostics; never use it to synchronise.
    pub fn is_running(&self) -> bool {
        self.status.get() == RunState::Running
    }

    pub fn state(&self) -> RunState {
        self.status.get()
    }

    pub(crate) fn status(&self) -> Arc<ThreadStatus> {
        Arc::clone(&self.status)
    }
}

pub(crate) fn panic_message(payload: &(dyn Any + Send)) -> &str {
    if let Some(message) = payload.downcast_ref::<&'static str>() {
        message
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.as_str()
    } else {
        "non-string panic payload"
    }
}

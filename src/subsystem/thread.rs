//! Threads bound to a subsystem and governed by its lifecycle.
use std::sync::Arc;

use strum_macros::{AsRefStr, Display};
use tracing::{debug, error, warn};

use super::{Subsystem, SubsystemState};
use crate::{
    error::RuntimeError,
    termination::TerminationFlag,
    thread::{RunState, Thread, ThreadStatus},
    timeout::Timeout,
};

/// How a bound thread learns that it should wind down.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display, AsRefStr)]
pub enum TerminationMode {
    /// Follows the owning subsystem: terminate once it is `Stopping` or `Idling`.
    Derived,
    /// Follows a private flag, raised by the subsystem when it begins stopping
    /// or directly through [`ThreadHandle::set_should_terminate`].
    Independent,
}

/// Construction options for [`Subsystem::spawn_thread`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ThreadOptions {
    mode: TerminationMode,
    auto_stop: bool,
    await_startup: bool,
}

impl Default for ThreadOptions {
    fn default() -> Self {
        Self {
            mode: TerminationMode::Independent,
            auto_stop: true,
            await_startup: true,
        }
    }
}

impl ThreadOptions {
    pub fn independent() -> Self {
        Self::default()
    }

    pub fn derived() -> Self {
        Self {
            mode: TerminationMode::Derived,
            ..Self::default()
        }
    }

    /// Whether an unexpected exit asks the owning subsystem to stop.
    pub fn auto_stop(mut self, auto_stop: bool) -> Self {
        self.auto_stop = auto_stop;
        self
    }

    /// Whether spawning blocks until the thread has begun running.
    pub fn await_startup(mut self, await_startup: bool) -> Self {
        self.await_startup = await_startup;
        self
    }

    pub fn mode(&self) -> TerminationMode {
        self.mode
    }
}

/// Termination view handed by value to the body of a bound thread.
#[derive(Debug, Clone)]
pub struct ThreadContext {
    subsystem: Subsystem,
    name: Arc<str>,
    mode: TerminationMode,
    flag: TerminationFlag,
}

impl ThreadContext {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn subsystem(&self) -> &Subsystem {
        &self.subsystem
    }

    pub fn mode(&self) -> TerminationMode {
        self.mode
    }

    /// Non-blocking check of the termination condition.
    pub fn should_terminate(&self) -> bool {
        match self.mode {
            TerminationMode::Derived => self.subsystem.state().is_terminating(),
            TerminationMode::Independent => self.flag.is_set(),
        }
    }

    /// Blocks until termination is requested or `timeout` elapses.
    ///
    /// Returns the termination condition as last observed; `false` only means
    /// "check again later".
    pub fn await_termination(&self, timeout: Timeout) -> bool {
        match self.mode {
            TerminationMode::Derived => self
                .subsystem
                .wait_until(timeout, SubsystemState::is_terminating)
                .is_terminating(),
            TerminationMode::Independent => self.flag.wait(timeout),
        }
    }
}

/// Controller-side handle of a bound thread.
#[derive(Debug, Clone)]
pub struct ThreadHandle {
    name: Arc<str>,
    mode: TerminationMode,
    flag: TerminationFlag,
    status: Arc<ThreadStatus>,
}

impl ThreadHandle {
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Raises the thread's private termination flag.
    ///
    /// Only threads in [`TerminationMode::Independent`] consult the flag.
    pub fn set_should_terminate(&self) {
        if self.mode == TerminationMode::Derived {
            debug!(
                "Thread '{}' follows its subsystem state; flag has no effect",
                self.name
            );
        }
        self.flag.set();
    }

    pub fn should_terminate(&self) -> bool {
        self.flag.is_set()
    }

    /// Liveness snapshot for diagnostics.
    pub fn is_running(&self) -> bool {
        self.status.get() == RunState::Running
    }
}

/// Deregisters a bound thread when its body returns or unwinds.
struct ExitGuard {
    context: ThreadContext,
    key: u64,
    auto_stop: bool,
}

impl Drop for ExitGuard {
    fn drop(&mut self) {
        let expected = self.context.should_terminate() && !std::thread::panicking();
        self.context.subsystem.deregister(self.key);
        if expected {
            return;
        }

        let subsystem = &self.context.subsystem;
        warn!(
            "Thread '{}' of subsystem '{}' exited unexpectedly",
            self.context.name,
            subsystem.name()
        );
        if self.auto_stop
            && let Err(err) = subsystem.request_stop()
        {
            error!(
                "Auto-stop of subsystem '{}' failed: {err}",
                subsystem.name()
            );
        }
    }
}

impl Subsystem {
    /// Spawns a thread bound to this subsystem.
    ///
    /// Allowed while `Starting` or `Running`. The subsystem cannot reach
    /// `Idling` until `body` has returned.
    pub fn spawn_thread<F>(
        &self,
        name: impl Into<String>,
        options: ThreadOptions,
        body: F,
    ) -> Result<ThreadHandle, RuntimeError>
    where
        F: FnOnce(ThreadContext) + Send + 'static,
    {
        let name: Arc<str> = Arc::from(name.into());
        let flag = TerminationFlag::new();
        let key = self.register(&flag)?;

        let context = ThreadContext {
            subsystem: self.clone(),
            name: Arc::clone(&name),
            mode: options.mode,
            flag: flag.clone(),
        };
        let auto_stop = options.auto_stop;

        let mut thread = Thread::new(&*name).await_startup(options.await_startup);
        let status = thread.status();
        let started = thread.start(move || {
            let _guard = ExitGuard {
                context: context.clone(),
                key,
                auto_stop,
            };
            body(context);
        });
        if let Err(err) = started {
            self.unregister_unstarted(key);
            return Err(err);
        }
        self.adopt(thread);
        debug!(
            "Thread '{}' bound to subsystem '{}' ({})",
            name,
            self.name(),
            options.mode
        );

        Ok(ThreadHandle {
            name,
            mode: options.mode,
            flag,
            status,
        })
    }
}

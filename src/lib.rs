//! subsys is a small runtime for long-running server processes: a tree of
//! lifecycle-managed subsystems with coordinated start/stop, OS threads bound
//! to those subsystems with cooperative termination, and a worker-pool task
//! dispatcher that runs discrete units of work under the same lifecycle.
//!
//! The `subsysd` binary uses it to serve a line-echo TCP protocol.

/// CLI interface.
pub mod cli;

/// Configuration management.
pub mod config;

/// Constants and default values.
pub mod constants;

/// Worker-pool task dispatcher.
pub mod dispatcher;

/// Echo service built on the runtime.
pub mod echo;

/// Error handling.
pub mod error;

/// Tracing subscriber setup.
pub mod logs;

/// Root server subsystem.
pub mod server;

/// Subsystem tree, lifecycle and bound threads.
pub mod subsystem;

/// Tasks and one-shot jobs.
pub mod task;

/// Independent termination flag.
pub mod termination;

/// Owned OS threads.
pub mod thread;

/// Bounded-wait values.
pub mod timeout;

mod sync;

#[cfg(test)]
mod test_utils;

pub use crate::{
    dispatcher::{Affinity, DispatcherConfig, DispatcherCounters, StopPolicy, TaskDispatcher, TaskSender},
    error::{ConfigError, HookError, RuntimeError},
    server::{Server, ShutdownHandle},
    subsystem::{
        NoHooks, Subsystem, SubsystemHooks, SubsystemId, SubsystemState, TerminationMode,
        ThreadContext, ThreadHandle, ThreadOptions,
    },
    task::{Job, Task, TaskFn, TaskState, TaskStatus, WorkerInfo, task_fn},
    termination::TerminationFlag,
    thread::{RunState, Thread},
    timeout::{Deadline, Timeout},
};

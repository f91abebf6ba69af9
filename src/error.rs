//! Error handling for the subsystem runtime.
use thiserror::Error;

use crate::{subsystem::SubsystemState, task::TaskState};

/// Error returned by a subsystem `on_start` hook.
pub type HookError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// Defines all failures the runtime reports to its callers.
#[derive(Debug, Error)]
pub enum RuntimeError {
    /// A lifecycle transition was requested that is not valid from the current state.
    #[error("Subsystem '{subsystem}' cannot change state from {from} to {to}")]
    CannotChangeState {
        /// The subsystem whose transition was rejected.
        subsystem: String,
        /// State observed when the request was made.
        from: SubsystemState,
        /// Requested target state.
        to: SubsystemState,
    },

    /// A task was executed a second time.
    #[error("Task '{task}' cannot be executed again (state: {state})")]
    TaskAlreadyExecuted {
        /// Name of the offending task.
        task: String,
        /// State the task was in when execution was requested.
        state: TaskState,
    },

    /// An operation was attempted on a component that is not running.
    #[error("Cannot {operation} on '{component}': not running (state: {state})")]
    NotRunning {
        /// Name of the component.
        component: String,
        /// The rejected operation.
        operation: &'static str,
        /// State of the component at the time of the request.
        state: SubsystemState,
    },

    /// A bounded task queue has no room left.
    #[error("Task queue of dispatcher '{dispatcher}' is full (capacity {capacity})")]
    QueueFull {
        /// Dispatcher name.
        dispatcher: String,
        /// Configured capacity.
        capacity: usize,
    },

    /// A task was pinned to a worker id outside the pool.
    #[error("Dispatcher '{dispatcher}' has no worker {worker} (pool size {workers})")]
    UnknownWorker {
        /// Dispatcher name.
        dispatcher: String,
        /// Requested worker id.
        worker: usize,
        /// Size of the worker pool.
        workers: usize,
    },

    /// `start` was called on a thread that was already started.
    #[error("Thread '{thread}' has already been started")]
    ThreadAlreadyStarted {
        /// Thread name.
        thread: String,
    },

    /// The operating system refused to create a thread.
    #[error("Failed to spawn thread '{thread}': {source}")]
    ThreadSpawn {
        /// Thread name.
        thread: String,
        /// The underlying error that occurred.
        #[source]
        source: std::io::Error,
    },

    /// A subsystem setup hook failed, so the subsystem never reached `Running`.
    #[error("Subsystem '{subsystem}' failed to start: {source}")]
    StartFailed {
        /// The subsystem whose hook failed.
        subsystem: String,
        /// The hook error.
        #[source]
        source: HookError,
    },

    /// A bounded stop did not observe `Idling` in time.
    #[error("Subsystem '{subsystem}' did not stop in time (state: {state})")]
    StopTimedOut {
        /// The subsystem being stopped.
        subsystem: String,
        /// State observed when the wait expired.
        state: SubsystemState,
    },

    /// A task body panicked; the panic was caught at the task boundary.
    #[error("Task '{task}' panicked during execution")]
    TaskPanicked {
        /// Name of the task.
        task: String,
    },

    /// Invalid runtime configuration.
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// A child stopped before its parent finished starting.
    #[error("Subsystem '{subsystem}' failed to start: child '{child}' is {state}")]
    ChildNotRunning {
        /// The subsystem whose start was aborted.
        subsystem: String,
        /// The child that left `Running`.
        child: String,
        /// State the child was observed in.
        state: SubsystemState,
    },
}

/// Errors raised while loading the YAML configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Error reading or accessing a configuration file.
    #[error("Failed to read config file: {0}")]
    Read(#[from] std::io::Error),

    /// Error parsing YAML configuration.
    #[error("Invalid YAML format: {0}")]
    Parse(#[from] serde_yaml::Error),

    /// The configuration references an undefined environment variable.
    #[error("Missing environment variable: {0}")]
    MissingEnvVar(String),

    /// A duration string could not be parsed.
    #[error("Invalid duration '{0}'")]
    InvalidDuration(String),

    /// The configuration parsed but is not usable.
    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

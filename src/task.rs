//! Units of work executed by dispatcher workers.
//!
//! A [`Task`] is wrapped in a [`Job`] when it is submitted. The job carries a
//! shared [`TaskStatus`] that moves `Pending -> Executing -> Done` (or
//! `Pending -> Abandoned`) exactly once; the check-and-set is atomic, so the
//! body of a task can never run twice.
use std::{
    borrow::Cow,
    fmt,
    panic::{self, AssertUnwindSafe},
    sync::{
        Arc,
        atomic::{AtomicU8, Ordering},
    },
};

use strum_macros::{AsRefStr, Display};
use tracing::{debug, error};

use crate::{error::RuntimeError, thread::panic_message};

/// Identity of the worker executing a task.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerInfo {
    id: usize,
    dispatcher: Arc<str>,
}

impl WorkerInfo {
    pub fn new(id: usize, dispatcher: impl Into<Arc<str>>) -> Self {
        Self {
            id,
            dispatcher: dispatcher.into(),
        }
    }

    /// Stable id of the worker within its pool, `0..workers`.
    pub fn id(&self) -> usize {
        self.id
    }

    pub fn dispatcher(&self) -> &str {
        &self.dispatcher
    }
}

impl fmt::Display for WorkerInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/worker-{}", self.dispatcher, self.id)
    }
}

/// A unit of work that runs at most once.
pub trait Task: Send + 'static {
    /// Performs the work on the given worker.
    fn run(self: Box<Self>, worker: &WorkerInfo);

    /// Called instead of [`Task::run`] when the task is discarded unexecuted.
    fn abandon(self: Box<Self>) {}

    fn name(&self) -> &str {
        std::any::type_name::<Self>()
    }
}

/// Task backed by a closure.
pub struct TaskFn<F> {
    name: Cow<'static, str>,
    f: F,
}

impl<F> TaskFn<F>
where
    F: FnOnce(&WorkerInfo) + Send + 'static,
{
    pub fn new(name: impl Into<Cow<'static, str>>, f: F) -> Self {
        Self {
            name: name.into(),
            f,
        }
    }
}

impl<F> fmt::Debug for TaskFn<F> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TaskFn").field("name", &self.name).finish()
    }
}

impl<F> Task for TaskFn<F>
where
    F: FnOnce(&WorkerInfo) + Send + 'static,
{
    fn run(self: Box<Self>, worker: &WorkerInfo) {
        (self.f)(worker)
    }

    fn name(&self) -> &str {
        &self.name
    }
}

/// Shorthand for [`TaskFn::new`].
pub fn task_fn<F>(name: impl Into<Cow<'static, str>>, f: F) -> TaskFn<F>
where
    F: FnOnce(&WorkerInfo) + Send + 'static,
{
    TaskFn::new(name, f)
}

/// Execution state of a submitted task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display, AsRefStr)]
#[repr(u8)]
pub enum TaskState {
    Pending = 0,
    Executing = 1,
    Done = 2,
    Abandoned = 3,
}

impl TaskState {
    fn from_u8(raw: u8) -> Self {
        match raw {
            0 => TaskState::Pending,
            1 => TaskState::Executing,
            2 => TaskState::Done,
            _ => TaskState::Abandoned,
        }
    }
}

/// Observer of a job's [`TaskState`], shareable with the submitter.
#[derive(Debug, Clone)]
pub struct TaskStatus(Arc<AtomicU8>);

impl TaskStatus {
    fn new() -> Self {
        Self(Arc::new(AtomicU8::new(TaskState::Pending as u8)))
    }

    pub fn state(&self) -> TaskState {
        TaskState::from_u8(self.0.load(Ordering::Acquire))
    }

    /// Whether the task body has run to completion.
    pub fn is_executed(&self) -> bool {
        self.state() == TaskState::Done
    }

    fn advance(&self, from: TaskState, to: TaskState) -> Result<(), TaskState> {
        self.0
            .compare_exchange(from as u8, to as u8, Ordering::AcqRel, Ordering::Acquire)
            .map(|_| ())
            .map_err(TaskState::from_u8)
    }

    fn set(&self, state: TaskState) {
        self.0.store(state as u8, Ordering::Release);
    }
}

/// A submitted task together with its one-shot execution state.
pub struct Job {
    name: String,
    task: Option<Box<dyn Task>>,
    status: TaskStatus,
}

impl fmt::Debug for Job {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Job")
            .field("name", &self.name)
            .field("state", &self.status.state())
            .finish()
    }
}

impl Job {
    pub fn new(task: impl Task) -> Self {
        Self::from_boxed(Box::new(task))
    }

    pub fn from_boxed(task: Box<dyn Task>) -> Self {
        Self {
            name: task.name().to_string(),
            task: Some(task),
            status: TaskStatus::new(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn state(&self) -> TaskState {
        self.status.state()
    }

    /// A status observer that outlives the job.
    pub fn status(&self) -> TaskStatus {
        self.status.clone()
    }

    /// Runs the task body on `worker`.
    ///
    /// Fails with [`RuntimeError::TaskAlreadyExecuted`] unless the job is still
    /// `Pending`; the body is then not run. A panic inside the body is caught,
    /// the job still ends `Done` and [`RuntimeError::TaskPanicked`] is returned.
    pub fn execute(&mut self, worker: &WorkerInfo) -> Result<(), RuntimeError> {
        self.status
            .advance(TaskState::Pending, TaskState::Executing)
            .map_err(|state| self.rejected(state))?;
        let Some(task) = self.task.take() else {
            self.status.set(TaskState::Done);
            return Err(self.rejected(TaskState::Done));
        };

        debug!("Task '{}' executing on {}", self.name, worker);
        let outcome = panic::catch_unwind(AssertUnwindSafe(|| task.run(worker)));
        self.status.set(TaskState::Done);

        outcome.map_err(|payload| {
            error!(
                "Task '{}' panicked on {}: {}",
                self.name,
                worker,
                panic_message(payload.as_ref())
            );
            RuntimeError::TaskPanicked {
                task: self.name.clone(),
            }
        })
    }

    /// Discards a pending job, giving the task a chance to clean up.
    ///
    /// Returns `false` if the job had already left `Pending`.
    pub fn abandon(mut self) -> bool {
        if self
            .status
            .advance(TaskState::Pending, TaskState::Abandoned)
            .is_err()
        {
            return false;
        }
        if let Some(task) = self.task.take() {
            debug!("Task '{}' abandoned", self.name);
            task.abandon();
        }
        true
    }

    fn rejected(&self, state: TaskState) -> RuntimeError {
        error!("Task '{}' executed again (state: {})", self.name, state);
        RuntimeError::TaskAlreadyExecuted {
            task: self.name.clone(),
            state,
        }
    }
}

//! Worker-pool task dispatcher.
//!
//! A [`TaskDispatcher`] is a subsystem whose bound threads are workers. Its
//! hooks open the task queue and spawn the pool on start, and close the queue
//! (discarding what is left under [`StopPolicy::Abandon`]) on stop. The queue
//! has its own lock; producers never touch the subsystem lock except for the
//! state check in [`TaskDispatcher::push`].

mod queue;
mod worker;

use std::sync::{
    Arc,
    atomic::{AtomicU64, Ordering},
};

use serde::Deserialize;
use strum_macros::{AsRefStr, Display, EnumString};
use tracing::{debug, error, info, warn};

pub use self::queue::Affinity;
use self::{queue::TaskQueue, worker::Worker};
use crate::{
    constants::{DEFAULT_POLL_INTERVAL, DEFAULT_WORKERS},
    error::{HookError, RuntimeError},
    subsystem::{Subsystem, SubsystemHooks, SubsystemState, ThreadOptions},
    task::{Job, Task, TaskStatus, WorkerInfo},
    timeout::Timeout,
};

/// What happens to queued tasks when the dispatcher stops.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize, Display, AsRefStr, EnumString,
)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum StopPolicy {
    /// Workers finish every queued task before exiting.
    #[default]
    Drain,
    /// Queued tasks are discarded; workers exit after the task in hand.
    Abandon,
}

/// Pool and queue settings of a dispatcher.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct DispatcherConfig {
    /// Number of workers, at least one.
    pub workers: usize,
    /// Maximum number of queued tasks; `None` means unbounded.
    pub queue_capacity: Option<usize>,
    pub stop_policy: StopPolicy,
    /// How long a worker waits for work before re-checking termination.
    pub poll_interval: Timeout,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            workers: DEFAULT_WORKERS,
            queue_capacity: None,
            stop_policy: StopPolicy::Drain,
            poll_interval: Timeout::from_duration(DEFAULT_POLL_INTERVAL),
        }
    }
}

impl DispatcherConfig {
    pub fn validate(&self) -> Result<(), RuntimeError> {
        if self.workers == 0 {
            return Err(RuntimeError::InvalidConfig(
                "dispatcher needs at least one worker".into(),
            ));
        }
        if self.queue_capacity == Some(0) {
            return Err(RuntimeError::InvalidConfig(
                "queue_capacity must be positive when set".into(),
            ));
        }
        if self.poll_interval.is_zero() {
            return Err(RuntimeError::InvalidConfig(
                "poll_interval must be positive".into(),
            ));
        }
        Ok(())
    }
}

/// Snapshot of a dispatcher's task accounting.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct DispatcherCounters {
    /// Tasks whose body ran to the end or panicked.
    pub executed: u64,
    /// Tasks discarded unexecuted on an abandoning stop.
    pub abandoned: u64,
    /// Subset of `executed` whose body panicked.
    pub panicked: u64,
    /// Pushes refused because the dispatcher was not running or the queue was full.
    pub rejected: u64,
}

#[derive(Debug, Default)]
pub(crate) struct Counters {
    executed: AtomicU64,
    abandoned: AtomicU64,
    panicked: AtomicU64,
    rejected: AtomicU64,
}

impl Counters {
    fn snapshot(&self) -> DispatcherCounters {
        DispatcherCounters {
            executed: self.executed.load(Ordering::Relaxed),
            abandoned: self.abandoned.load(Ordering::Relaxed),
            panicked: self.panicked.load(Ordering::Relaxed),
            rejected: self.rejected.load(Ordering::Relaxed),
        }
    }

    pub(crate) fn record_executed(&self, panicked: bool) {
        self.executed.fetch_add(1, Ordering::Relaxed);
        if panicked {
            self.panicked.fetch_add(1, Ordering::Relaxed);
        }
    }

    /// Abandons `job` and counts it if it was still pending.
    pub(crate) fn abandon(&self, job: Job, dispatcher: &str) {
        let name = job.name().to_string();
        if job.abandon() {
            self.abandoned.fetch_add(1, Ordering::Relaxed);
            warn!("Dispatcher '{dispatcher}' abandoned task '{name}'");
        }
    }

    fn record_rejected(&self) {
        self.rejected.fetch_add(1, Ordering::Relaxed);
    }
}

/// Producer handle onto a dispatcher's queue.
///
/// Holds only the queue, never the subsystem, so it can be captured by the
/// hooks or threads of other subsystems in the same tree. Pushes succeed
/// while the queue is open, i.e. from the dispatcher's setup until it begins
/// stopping.
#[derive(Clone)]
pub struct TaskSender {
    name: Arc<str>,
    workers: usize,
    queue: Arc<TaskQueue>,
    counters: Arc<Counters>,
}

impl std::fmt::Debug for TaskSender {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskSender")
            .field("dispatcher", &self.name)
            .field("pending", &self.queue.len())
            .finish()
    }
}

impl TaskSender {
    pub fn dispatcher(&self) -> &str {
        &self.name
    }

    pub fn push(&self, task: impl Task) -> Result<TaskStatus, RuntimeError> {
        self.push_job(Job::new(task))
    }

    /// Pins the task to worker `worker`.
    pub fn push_to(&self, worker: usize, task: impl Task) -> Result<TaskStatus, RuntimeError> {
        if worker >= self.workers {
            self.counters.record_rejected();
            let err = RuntimeError::UnknownWorker {
                dispatcher: self.name.to_string(),
                worker,
                workers: self.workers,
            };
            error!("{err}");
            return Err(err);
        }
        self.enqueue(Job::new(task), Affinity::Worker(worker), Timeout::ZERO)
    }

    /// Waits up to `timeout` for room in a bounded queue.
    pub fn push_wait(&self, task: impl Task, timeout: Timeout) -> Result<TaskStatus, RuntimeError> {
        self.enqueue(Job::new(task), Affinity::Any, timeout)
    }

    pub fn push_job(&self, job: Job) -> Result<TaskStatus, RuntimeError> {
        self.enqueue(job, Affinity::Any, Timeout::ZERO)
    }

    fn enqueue(
        &self,
        job: Job,
        affinity: Affinity,
        timeout: Timeout,
    ) -> Result<TaskStatus, RuntimeError> {
        let status = job.status();
        let name = job.name().to_string();
        match self.queue.push_wait(job, affinity, timeout) {
            Ok(()) => {
                debug!("Task '{name}' queued on '{}'", self.name);
                Ok(status)
            }
            Err(err) => {
                self.counters.record_rejected();
                error!("Task '{name}' rejected: {err}");
                Err(err)
            }
        }
    }
}

struct DispatcherHooks {
    name: Arc<str>,
    config: DispatcherConfig,
    queue: Arc<TaskQueue>,
    counters: Arc<Counters>,
}

impl SubsystemHooks for DispatcherHooks {
    fn on_start(&self, subsystem: &Subsystem) -> Result<(), HookError> {
        self.queue.open();
        for id in 0..self.config.workers {
            let worker = Worker {
                info: WorkerInfo::new(id, Arc::clone(&self.name)),
                queue: Arc::clone(&self.queue),
                policy: self.config.stop_policy,
                poll: self.config.poll_interval,
                counters: Arc::clone(&self.counters),
            };
            subsystem.spawn_thread(
                format!("{}-worker-{id}", self.name),
                ThreadOptions::derived().await_startup(true),
                move |ctx| worker.run(ctx),
            )?;
        }
        info!(
            "Dispatcher '{}' started {} workers ({})",
            self.name, self.config.workers, self.config.stop_policy
        );
        Ok(())
    }

    fn on_stop(&self, _subsystem: &Subsystem) {
        self.queue.close();
        match self.config.stop_policy {
            StopPolicy::Drain => {
                let pending = self.queue.len();
                if pending > 0 {
                    info!("Dispatcher '{}' draining {pending} queued tasks", self.name);
                }
            }
            StopPolicy::Abandon => {
                let pending = self.queue.drain_pending();
                if !pending.is_empty() {
                    warn!(
                        "Dispatcher '{}' abandoning {} queued tasks",
                        self.name,
                        pending.len()
                    );
                }
                for job in pending {
                    self.counters.abandon(job, &self.name);
                }
            }
        }
    }
}

/// A subsystem owning a worker pool and a task queue.
#[derive(Debug, Clone)]
pub struct TaskDispatcher {
    subsystem: Subsystem,
    config: DispatcherConfig,
    sender: TaskSender,
}

impl TaskDispatcher {
    /// Creates a dispatcher at the root of its own subsystem tree.
    pub fn new(name: impl Into<String>, config: DispatcherConfig) -> Result<Self, RuntimeError> {
        Self::build(name.into(), config, |name, hooks| Subsystem::root(name, hooks))
    }

    /// Creates a dispatcher as a child of `parent`, started and stopped with it.
    pub fn attach(
        parent: &Subsystem,
        name: impl Into<String>,
        config: DispatcherConfig,
    ) -> Result<Self, RuntimeError> {
        Self::build(name.into(), config, |name, hooks| parent.add_child(name, hooks))
    }

    fn build<F>(name: String, config: DispatcherConfig, make: F) -> Result<Self, RuntimeError>
    where
        F: FnOnce(String, DispatcherHooks) -> Subsystem,
    {
        config.validate()?;
        let name: Arc<str> = Arc::from(name);
        let queue = Arc::new(TaskQueue::new(&*name, config.queue_capacity));
        let counters = Arc::new(Counters::default());
        let sender = TaskSender {
            name: Arc::clone(&name),
            workers: config.workers,
            queue: Arc::clone(&queue),
            counters: Arc::clone(&counters),
        };
        let hooks = DispatcherHooks {
            name: Arc::clone(&name),
            config: config.clone(),
            queue,
            counters,
        };
        let subsystem = make(name.to_string(), hooks);
        Ok(Self {
            subsystem,
            config,
            sender,
        })
    }

    pub fn subsystem(&self) -> &Subsystem {
        &self.subsystem
    }

    pub fn name(&self) -> &str {
        self.subsystem.name()
    }

    pub fn config(&self) -> &DispatcherConfig {
        &self.config
    }

    pub fn workers(&self) -> usize {
        self.config.workers
    }

    pub fn state(&self) -> SubsystemState {
        self.subsystem.state()
    }

    /// Starts the pool; returns once every worker is running.
    pub fn start(&self) -> Result<(), RuntimeError> {
        self.subsystem.start()
    }

    /// Stops the pool per the stop policy and joins every worker.
    pub fn stop(&self) -> Result<(), RuntimeError> {
        self.subsystem.stop()
    }

    pub fn stop_within(&self, grace: Timeout) -> Result<(), RuntimeError> {
        self.subsystem.stop_within(grace)
    }

    /// Queues a task for any worker.
    ///
    /// Fails with [`RuntimeError::NotRunning`] unless the dispatcher is
    /// `Running`; the task is then dropped without running.
    pub fn push(&self, task: impl Task) -> Result<TaskStatus, RuntimeError> {
        self.ensure_running()?;
        self.sender.push(task)
    }

    pub fn push_to(&self, worker: usize, task: impl Task) -> Result<TaskStatus, RuntimeError> {
        self.ensure_running()?;
        self.sender.push_to(worker, task)
    }

    pub fn push_wait(&self, task: impl Task, timeout: Timeout) -> Result<TaskStatus, RuntimeError> {
        self.ensure_running()?;
        self.sender.push_wait(task, timeout)
    }

    pub fn push_job(&self, job: Job) -> Result<TaskStatus, RuntimeError> {
        self.ensure_running()?;
        self.sender.push_job(job)
    }

    pub fn sender(&self) -> TaskSender {
        self.sender.clone()
    }

    /// Number of queued tasks not yet picked up by a worker.
    pub fn pending(&self) -> usize {
        self.sender.queue.len()
    }

    pub fn counters(&self) -> DispatcherCounters {
        self.sender.counters.snapshot()
    }

    fn ensure_running(&self) -> Result<(), RuntimeError> {
        let state = self.subsystem.state();
        if state == SubsystemState::Running {
            return Ok(());
        }
        self.sender.counters.record_rejected();
        let err = RuntimeError::NotRunning {
            component: self.name().to_string(),
            operation: "push a task",
            state,
        };
        error!("{err}");
        Err(err)
    }
}

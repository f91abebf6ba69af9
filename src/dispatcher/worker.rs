//! Worker run loop.
use std::sync::Arc;

use tracing::{debug, error};

use super::{Counters, StopPolicy, queue::{Pop, TaskQueue}};
use crate::{
    error::RuntimeError,
    subsystem::ThreadContext,
    task::{Job, WorkerInfo},
    timeout::Timeout,
};

/// One thread of a dispatcher's pool.
pub(crate) struct Worker {
    pub(crate) info: WorkerInfo,
    pub(crate) queue: Arc<TaskQueue>,
    pub(crate) policy: StopPolicy,
    pub(crate) poll: Timeout,
    pub(crate) counters: Arc<Counters>,
}

impl Worker {
    /// Pulls and executes tasks until the dispatcher stops.
    ///
    /// Under [`StopPolicy::Drain`] the loop ends only once the closed queue
    /// holds nothing for this worker; under [`StopPolicy::Abandon`] it ends as
    /// soon as termination is observed, after the task in hand (if any).
    pub(crate) fn run(self, ctx: ThreadContext) {
        debug!("{} waiting for tasks", self.info);
        loop {
            if self.abandoning(&ctx) {
                break;
            }
            match self.queue.pop(self.info.id(), self.poll) {
                Pop::Job(job) if self.abandoning(&ctx) => {
                    self.counters.abandon(job, self.info.dispatcher());
                    break;
                }
                Pop::Job(job) => self.execute(job),
                Pop::TimedOut => continue,
                Pop::Closed => break,
            }
        }
        debug!("{} exiting", self.info);
    }

    fn abandoning(&self, ctx: &ThreadContext) -> bool {
        self.policy == StopPolicy::Abandon && ctx.should_terminate()
    }

    fn execute(&self, mut job: Job) {
        match job.execute(&self.info) {
            Ok(()) => self.counters.record_executed(false),
            Err(RuntimeError::TaskPanicked { .. }) => self.counters.record_executed(true),
            Err(err) => error!("{} could not run task: {err}", self.info),
        }
    }
}

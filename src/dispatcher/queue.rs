//! FIFO task queue shared between producers and workers.
//!
//! Guarded by its own lock, independent of the dispatcher's subsystem lock,
//! so "is there work" never contends with "is the dispatcher alive".
use std::{
    collections::VecDeque,
    sync::{Condvar, Mutex},
};

use crate::{
    error::RuntimeError,
    subsystem::SubsystemState,
    sync::{lock, wait_while},
    task::Job,
    timeout::Timeout,
};

/// Which workers may pick up a task.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Affinity {
    Any,
    Worker(usize),
}

impl Affinity {
    fn accepts(self, worker: usize) -> bool {
        match self {
            Affinity::Any => true,
            Affinity::Worker(id) => id == worker,
        }
    }
}

struct Queued {
    job: Job,
    affinity: Affinity,
}

struct QueueState {
    items: VecDeque<Queued>,
    /// Mirrors the dispatcher lifecycle; pushes are accepted only while `Running`.
    phase: SubsystemState,
}

impl QueueState {
    fn open(&self) -> bool {
        self.phase == SubsystemState::Running
    }
}

/// Outcome of a worker's bounded wait for work.
#[derive(Debug)]
pub(crate) enum Pop {
    Job(Job),
    /// Nothing eligible arrived in time.
    TimedOut,
    /// The queue is closed and holds nothing for this worker.
    Closed,
}

pub(crate) struct TaskQueue {
    dispatcher: String,
    capacity: Option<usize>,
    state: Mutex<QueueState>,
    available: Condvar,
    space: Condvar,
}

impl TaskQueue {
    pub(crate) fn new(dispatcher: impl Into<String>, capacity: Option<usize>) -> Self {
        Self {
            dispatcher: dispatcher.into(),
            capacity,
            state: Mutex::new(QueueState {
                items: VecDeque::new(),
                phase: SubsystemState::Idling,
            }),
            available: Condvar::new(),
            space: Condvar::new(),
        }
    }

    pub(crate) fn open(&self) {
        lock(&self.state).phase = SubsystemState::Running;
    }

    /// Rejects further pushes and wakes every waiter.
    pub(crate) fn close(&self) {
        lock(&self.state).phase = SubsystemState::Stopping;
        self.available.notify_all();
        self.space.notify_all();
    }

    pub(crate) fn len(&self) -> usize {
        lock(&self.state).items.len()
    }

    /// Removes and returns everything still queued.
    pub(crate) fn drain_pending(&self) -> Vec<Job> {
        let drained: Vec<Job> = lock(&self.state)
            .items
            .drain(..)
            .map(|queued| queued.job)
            .collect();
        self.space.notify_all();
        drained
    }

    /// Enqueues without waiting; fails when closed or full.
    pub(crate) fn push(&self, job: Job, affinity: Affinity) -> Result<(), RuntimeError> {
        self.push_wait(job, affinity, Timeout::ZERO)
    }

    /// Enqueues, waiting up to `timeout` for room in a bounded queue.
    pub(crate) fn push_wait(
        &self,
        job: Job,
        affinity: Affinity,
        timeout: Timeout,
    ) -> Result<(), RuntimeError> {
        let capacity = self.capacity;
        let mut state = wait_while(&self.space, lock(&self.state), timeout, |state| {
            state.open() && capacity.is_some_and(|capacity| state.items.len() >= capacity)
        });

        if !state.open() {
            return Err(RuntimeError::NotRunning {
                component: self.dispatcher.clone(),
                operation: "push a task",
                state: state.phase,
            });
        }
        if let Some(capacity) = capacity
            && state.items.len() >= capacity
        {
            return Err(RuntimeError::QueueFull {
                dispatcher: self.dispatcher.clone(),
                capacity,
            });
        }

        state.items.push_back(Queued { job, affinity });
        let pinned = state
            .items
            .iter()
            .any(|queued| matches!(queued.affinity, Affinity::Worker(_)));
        drop(state);
        // With pinned work queued, a single woken worker may take that instead.
        if pinned {
            self.available.notify_all();
        } else {
            self.available.notify_one();
        }
        Ok(())
    }

    /// Takes the oldest task eligible for `worker`, waiting up to `timeout`.
    pub(crate) fn pop(&self, worker: usize, timeout: Timeout) -> Pop {
        let mut state = wait_while(&self.available, lock(&self.state), timeout, |state| {
            state.open() && !state.items.iter().any(|q| q.affinity.accepts(worker))
        });

        let position = state.items.iter().position(|q| q.affinity.accepts(worker));
        match position.and_then(|index| state.items.remove(index)) {
            Some(queued) => {
                drop(state);
                self.space.notify_one();
                Pop::Job(queued.job)
            }
            None if !state.open() => Pop::Closed,
            None => Pop::TimedOut,
        }
    }
}

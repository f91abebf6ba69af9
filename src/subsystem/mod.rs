//! Subsystem tree with a per-node lifecycle state machine.
//!
//! Every node lives in a shared arena and is addressed by [`SubsystemId`];
//! children are stored as ids and the parent as an explicit index, so the
//! tree holds no ownership cycles. Behaviour is injected through
//! [`SubsystemHooks`] rather than by subclassing.
//!
//! # Locking
//!
//! Each node owns one mutex guarding its state and thread registry, plus one
//! condition variable broadcast on every change. A node's lock is never held
//! while calling hooks, touching another node, or joining threads.

mod state;
mod thread;

use std::{
    collections::HashMap,
    fmt,
    sync::{Arc, Condvar, Mutex, PoisonError, RwLock},
};

use tracing::{debug, error, info, warn};

pub use self::{
    state::SubsystemState,
    thread::{TerminationMode, ThreadContext, ThreadHandle, ThreadOptions},
};

use crate::{
    error::{HookError, RuntimeError},
    sync::{lock, wait, wait_while},
    termination::TerminationFlag,
    thread::Thread,
    timeout::Timeout,
};

/// Setup and teardown callbacks run by a subsystem on its own transitions.
pub trait SubsystemHooks: Send + Sync + 'static {
    /// Runs while `Starting`, after every child reached `Running`.
    ///
    /// Returning an error aborts the start: the subsystem unwinds back to
    /// `Idling` and never claims `Running`.
    fn on_start(&self, _subsystem: &Subsystem) -> Result<(), HookError> {
        Ok(())
    }

    /// Runs right after the subsystem entered `Stopping`, before children are stopped.
    fn on_stop(&self, _subsystem: &Subsystem) {}
}

/// Hooks that do nothing; for pure grouping nodes.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoHooks;

impl SubsystemHooks for NoHooks {}

/// Index of a subsystem inside its tree.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SubsystemId(usize);

impl SubsystemId {
    pub fn index(&self) -> usize {
        self.0
    }
}

impl fmt::Display for SubsystemId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

struct Node {
    name: String,
    parent: Option<SubsystemId>,
    hooks: Box<dyn SubsystemHooks>,
    inner: Mutex<NodeInner>,
    changed: Condvar,
}

struct NodeInner {
    state: SubsystemState,
    children: Vec<SubsystemId>,
    /// Bound threads that have not exited yet, keyed by registration number.
    live: HashMap<u64, TerminationFlag>,
    /// Join handles of every thread spawned since the last stop.
    threads: Vec<Thread>,
    /// Registrations whose handle has not reached `threads` yet.
    spawning: usize,
    next_thread: u64,
    /// A stop was requested while `Starting`; honoured on reaching `Running`.
    stop_requested: bool,
}

#[derive(Default)]
struct Arena {
    nodes: RwLock<Vec<Arc<Node>>>,
}

impl Arena {
    fn insert(&self, node: Node) -> (SubsystemId, Arc<Node>) {
        let mut nodes = self.nodes.write().unwrap_or_else(PoisonError::into_inner);
        let id = SubsystemId(nodes.len());
        let node = Arc::new(node);
        nodes.push(Arc::clone(&node));
        (id, node)
    }

    fn get(&self, id: SubsystemId) -> Option<Arc<Node>> {
        self.nodes
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(id.0)
            .cloned()
    }
}

/// Handle to one node of a subsystem tree. Cloning is cheap.
#[derive(Clone)]
pub struct Subsystem {
    arena: Arc<Arena>,
    id: SubsystemId,
    node: Arc<Node>,
}

impl fmt::Debug for Subsystem {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subsystem")
            .field("id", &self.id)
            .field("name", &self.node.name)
            .field("state", &self.state())
            .finish()
    }
}

impl Subsystem {
    /// Creates the root of a new subsystem tree.
    pub fn root(name: impl Into<String>, hooks: impl SubsystemHooks) -> Self {
        Self::insert(Arc::new(Arena::default()), name.into(), None, Box::new(hooks))
    }

    /// Attaches a new child, started after any existing siblings.
    ///
    /// Children attached after this subsystem started are not started
    /// automatically; they are still stopped with it.
    pub fn add_child(&self, name: impl Into<String>, hooks: impl SubsystemHooks) -> Subsystem {
        let child = Self::insert(
            Arc::clone(&self.arena),
            name.into(),
            Some(self.id),
            Box::new(hooks),
        );
        lock(&self.node.inner).children.push(child.id);
        debug!("Subsystem '{}' attached to '{}'", child.name(), self.name());
        child
    }

    fn insert(
        arena: Arc<Arena>,
        name: String,
        parent: Option<SubsystemId>,
        hooks: Box<dyn SubsystemHooks>,
    ) -> Self {
        let (id, node) = arena.insert(Node {
            name,
            parent,
            hooks,
            inner: Mutex::new(NodeInner {
                state: SubsystemState::Idling,
                children: Vec::new(),
                live: HashMap::new(),
                threads: Vec::new(),
                spawning: 0,
                next_thread: 0,
                stop_requested: false,
            }),
            changed: Condvar::new(),
        });
        Self { arena, id, node }
    }

    fn with_id(&self, id: SubsystemId) -> Option<Subsystem> {
        self.arena.get(id).map(|node| Subsystem {
            arena: Arc::clone(&self.arena),
            id,
            node,
        })
    }

    pub fn id(&self) -> SubsystemId {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.node.name
    }

    pub fn parent(&self) -> Option<Subsystem> {
        self.node.parent.and_then(|id| self.with_id(id))
    }

    /// Children in attachment order.
    pub fn children(&self) -> Vec<Subsystem> {
        let ids = lock(&self.node.inner).children.clone();
        ids.into_iter().filter_map(|id| self.with_id(id)).collect()
    }

    pub fn state(&self) -> SubsystemState {
        lock(&self.node.inner).state
    }

    /// Number of bound threads that have not exited yet.
    pub fn live_threads(&self) -> usize {
        lock(&self.node.inner).live.len()
    }

    /// Waits until the state differs from `current` or `timeout` elapses,
    /// returning the state observed last. A zero timeout never blocks.
    pub fn await_state(&self, current: SubsystemState, timeout: Timeout) -> SubsystemState {
        self.wait_until(timeout, |state| state != current)
    }

    /// Waits until the subsystem is in `target`; returns whether it got there in time.
    pub fn wait_for(&self, target: SubsystemState, timeout: Timeout) -> bool {
        self.wait_until(timeout, |state| state == target) == target
    }

    pub(crate) fn wait_until<F>(&self, timeout: Timeout, mut done: F) -> SubsystemState
    where
        F: FnMut(SubsystemState) -> bool,
    {
        let inner = wait_while(
            &self.node.changed,
            lock(&self.node.inner),
            timeout,
            |inner| !done(inner.state),
        );
        inner.state
    }

    /// Starts children in order, then runs this subsystem's setup hook.
    ///
    /// Returns once the whole subtree is `Running`. On failure, everything
    /// started so far is stopped again and this subsystem ends up `Idling`.
    pub fn start(&self) -> Result<(), RuntimeError> {
        self.transition(SubsystemState::Starting)?;
        info!("Starting subsystem '{}'", self.name());

        let children = self.children();
        let mut started = Vec::new();
        for child in children.iter().cloned() {
            if child.state() == SubsystemState::Running {
                continue;
            }
            if let Err(err) = child.start() {
                error!(
                    "Subsystem '{}' cannot start: child '{}' failed: {err}",
                    self.name(),
                    child.name()
                );
                self.abort_start(&started);
                return Err(err);
            }
            started.push(child);
        }

        if let Err(source) = self.node.hooks.on_start(self) {
            error!("Subsystem '{}' setup failed: {source}", self.name());
            self.abort_start(&started);
            return Err(RuntimeError::StartFailed {
                subsystem: self.name().to_string(),
                source,
            });
        }

        // A child may have stopped on its own while later siblings were starting.
        if let Some((child, state)) = children
            .iter()
            .map(|child| (child, child.state()))
            .find(|(_, state)| *state != SubsystemState::Running)
        {
            error!(
                "Subsystem '{}' cannot start: child '{}' is {state}",
                self.name(),
                child.name()
            );
            self.abort_start(&started);
            return Err(RuntimeError::ChildNotRunning {
                subsystem: self.name().to_string(),
                child: child.name().to_string(),
                state,
            });
        }

        let stop_requested = {
            let mut inner = lock(&self.node.inner);
            self.transition_locked(&mut inner, SubsystemState::Running)?;
            std::mem::take(&mut inner.stop_requested)
        };
        info!("Subsystem '{}' running", self.name());

        if stop_requested {
            debug!("Honouring stop requested during startup of '{}'", self.name());
            if let Err(err) = self.request_stop() {
                error!("Deferred stop of '{}' failed: {err}", self.name());
            }
        }
        Ok(())
    }

    /// Stops the subtree and blocks until this subsystem is `Idling`.
    pub fn stop(&self) -> Result<(), RuntimeError> {
        self.initiate_stop()
            .map_err(|from| self.rejected(from, SubsystemState::Stopping))?;
        self.complete_stop();
        Ok(())
    }

    /// Like [`Subsystem::stop`], but waits at most `grace` for `Idling`.
    ///
    /// On [`RuntimeError::StopTimedOut`] the teardown keeps going in the
    /// background; [`Subsystem::wait_for`] observes its completion.
    pub fn stop_within(&self, grace: Timeout) -> Result<(), RuntimeError> {
        self.initiate_stop()
            .map_err(|from| self.rejected(from, SubsystemState::Stopping))?;
        self.spawn_teardown()?;

        if self.wait_for(SubsystemState::Idling, grace) {
            Ok(())
        } else {
            let state = self.state();
            warn!(
                "Subsystem '{}' still {} after {}",
                self.name(),
                state,
                grace
            );
            Err(RuntimeError::StopTimedOut {
                subsystem: self.name().to_string(),
                state,
            })
        }
    }

    /// Asks the subsystem to stop without waiting for it.
    ///
    /// Requests made while `Starting` are deferred until `Running` is reached;
    /// requests made while already `Stopping` or `Idling` have no effect.
    pub fn request_stop(&self) -> Result<(), RuntimeError> {
        {
            let mut inner = lock(&self.node.inner);
            match inner.state {
                SubsystemState::Starting => {
                    inner.stop_requested = true;
                    debug!("Stop of '{}' deferred until running", self.name());
                    return Ok(());
                }
                SubsystemState::Running => {}
                SubsystemState::Stopping | SubsystemState::Idling => return Ok(()),
            }
        }

        match self.initiate_stop() {
            Ok(()) => {
                self.defer_parent_stop();
                self.spawn_teardown()
            }
            // Someone else began stopping in the meantime.
            Err(_) => Ok(()),
        }
    }

    /// A parent still `Starting` must not come up around a child that stopped itself.
    fn defer_parent_stop(&self) {
        let Some(parent) = self.parent() else {
            return;
        };
        let mut inner = lock(&parent.node.inner);
        if inner.state == SubsystemState::Starting {
            inner.stop_requested = true;
            debug!(
                "Child '{}' stopped while '{}' was starting; stop deferred",
                self.name(),
                parent.name()
            );
        }
    }

    /// Performs a checked transition under the subsystem lock.
    pub(crate) fn transition(&self, to: SubsystemState) -> Result<SubsystemState, RuntimeError> {
        let mut inner = lock(&self.node.inner);
        self.transition_locked(&mut inner, to)
    }

    fn transition_locked(
        &self,
        inner: &mut NodeInner,
        to: SubsystemState,
    ) -> Result<SubsystemState, RuntimeError> {
        let from = inner.state;
        if !from.can_transition_to(to) {
            return Err(self.rejected(from, to));
        }
        inner.state = to;
        self.node.changed.notify_all();
        debug!("Subsystem '{}': {} -> {}", self.name(), from, to);
        Ok(from)
    }

    fn rejected(&self, from: SubsystemState, to: SubsystemState) -> RuntimeError {
        error!(
            "Subsystem '{}' cannot change state from {} to {}",
            self.name(),
            from,
            to
        );
        RuntimeError::CannotChangeState {
            subsystem: self.name().to_string(),
            from,
            to,
        }
    }

    /// `Running -> Stopping`, then signals threads and runs the stop hook.
    /// Fails with the observed state when the subsystem is not `Running`.
    fn initiate_stop(&self) -> Result<(), SubsystemState> {
        let flags = {
            let mut inner = lock(&self.node.inner);
            if inner.state != SubsystemState::Running {
                return Err(inner.state);
            }
            inner.state = SubsystemState::Stopping;
            self.node.changed.notify_all();
            inner.live.values().cloned().collect::<Vec<_>>()
        };
        debug!(
            "Subsystem '{}': {} -> {}",
            self.name(),
            SubsystemState::Running,
            SubsystemState::Stopping
        );
        info!("Stopping subsystem '{}'", self.name());

        for flag in flags {
            flag.set();
        }
        self.node.hooks.on_stop(self);
        Ok(())
    }

    /// Stops children (last first), waits for bound threads, then `Stopping -> Idling`.
    fn complete_stop(&self) {
        for child in self.children().into_iter().rev() {
            child.stop_from_parent();
        }
        self.finish_stop();
    }

    fn finish_stop(&self) {
        let threads = {
            let mut inner = lock(&self.node.inner);
            while !inner.live.is_empty() || inner.spawning > 0 {
                inner = wait(&self.node.changed, inner);
            }
            std::mem::take(&mut inner.threads)
        };
        for mut thread in threads {
            thread.join();
        }

        let mut inner = lock(&self.node.inner);
        if self
            .transition_locked(&mut inner, SubsystemState::Idling)
            .is_ok()
        {
            info!("Subsystem '{}' stopped", self.name());
        }
    }

    fn stop_from_parent(&self) {
        loop {
            let state = self.state();
            match state {
                SubsystemState::Idling => return,
                SubsystemState::Running => {
                    if self.initiate_stop().is_ok() {
                        self.complete_stop();
                        return;
                    }
                }
                SubsystemState::Starting | SubsystemState::Stopping => {
                    self.await_state(state, Timeout::DEFAULT);
                }
            }
        }
    }

    /// Unwinds a start that failed after `Idling -> Starting`.
    fn abort_start(&self, started: &[Subsystem]) {
        let flags = {
            let mut inner = lock(&self.node.inner);
            inner.stop_requested = false;
            if self
                .transition_locked(&mut inner, SubsystemState::Stopping)
                .is_err()
            {
                return;
            }
            inner.live.values().cloned().collect::<Vec<_>>()
        };
        for flag in flags {
            flag.set();
        }
        self.node.hooks.on_stop(self);

        for child in started.iter().rev() {
            child.stop_from_parent();
        }
        self.finish_stop();
    }

    fn spawn_teardown(&self) -> Result<(), RuntimeError> {
        let this = self.clone();
        let mut teardown = Thread::new(format!("{}-teardown", self.name()));
        teardown.start(move || this.complete_stop()).inspect_err(|err| {
            error!("Subsystem '{}' left stopping: {err}", self.name());
        })
    }

    /// Registers a bound thread, provided the subsystem is starting or running.
    fn register(&self, flag: &TerminationFlag) -> Result<u64, RuntimeError> {
        let mut inner = lock(&self.node.inner);
        if !matches!(
            inner.state,
            SubsystemState::Starting | SubsystemState::Running
        ) {
            return Err(RuntimeError::NotRunning {
                component: self.name().to_string(),
                operation: "spawn a thread",
                state: inner.state,
            });
        }
        let key = inner.next_thread;
        inner.next_thread += 1;
        inner.live.insert(key, flag.clone());
        inner.spawning += 1;
        Ok(key)
    }

    /// Takes ownership of the join handle of a freshly started bound thread.
    fn adopt(&self, thread: Thread) {
        let mut inner = lock(&self.node.inner);
        inner.threads.push(thread);
        inner.spawning -= 1;
        self.node.changed.notify_all();
    }

    /// Drops a registration whose thread never started.
    fn unregister_unstarted(&self, key: u64) {
        let mut inner = lock(&self.node.inner);
        inner.live.remove(&key);
        inner.spawning -= 1;
        self.node.changed.notify_all();
    }

    fn deregister(&self, key: u64) {
        let mut inner = lock(&self.node.inner);
        inner.live.remove(&key);
        self.node.changed.notify_all();
    }
}

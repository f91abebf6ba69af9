//! Process root: the subsystem the main thread runs and waits on.
use tracing::{debug, info};

use crate::{
    error::RuntimeError,
    subsystem::{Subsystem, SubsystemHooks, SubsystemState},
    timeout::Timeout,
};

/// The root subsystem of a server process.
#[derive(Debug, Clone)]
pub struct Server {
    root: Subsystem,
}

impl Server {
    pub fn new(name: impl Into<String>, hooks: impl SubsystemHooks) -> Self {
        Self {
            root: Subsystem::root(name, hooks),
        }
    }

    pub fn subsystem(&self) -> &Subsystem {
        &self.root
    }

    pub fn name(&self) -> &str {
        self.root.name()
    }

    /// Attaches a component to be started before, and stopped after, the root's own hooks.
    pub fn add_subsystem(&self, name: impl Into<String>, hooks: impl SubsystemHooks) -> Subsystem {
        self.root.add_child(name, hooks)
    }

    /// Starts the tree and blocks until it has unwound back to `Idling`.
    ///
    /// Returns early only if the start itself fails.
    pub fn run(&self) -> Result<(), RuntimeError> {
        self.root.start()?;
        info!("Server '{}' running", self.name());

        let mut observed = SubsystemState::Running;
        while observed != SubsystemState::Idling {
            let next = self.root.await_state(observed, Timeout::DEFAULT);
            if next != observed {
                debug!("Server '{}' is {}", self.name(), next);
            }
            observed = next;
        }

        info!("Server '{}' stopped", self.name());
        Ok(())
    }

    pub fn shutdown_handle(&self) -> ShutdownHandle {
        ShutdownHandle {
            root: self.root.clone(),
        }
    }
}

/// Cloneable trigger that asks a running [`Server`] to stop.
#[derive(Debug, Clone)]
pub struct ShutdownHandle {
    root: Subsystem,
}

impl ShutdownHandle {
    /// Requests a stop of the whole tree without waiting for it.
    ///
    /// Harmless when the server is already stopping or idle.
    pub fn shutdown(&self) -> Result<(), RuntimeError> {
        info!("Shutdown of '{}' requested", self.root.name());
        self.root.request_stop()
    }

    /// Waits up to `grace` for the tree to reach `Idling`.
    pub fn wait_stopped(&self, grace: Timeout) -> bool {
        self.root.wait_for(SubsystemState::Idling, grace)
    }
}

#[cfg(test)]
mod tests {
    use std::{thread, time::Duration};

    use super::*;
    use crate::subsystem::{NoHooks, ThreadOptions};

    #[test]
    fn run_returns_after_shutdown() {
        let server = Server::new("srv", NoHooks);
        let worker = server.add_subsystem("component", NoHooks);
        let handle = server.shutdown_handle();

        let runner = {
            let server = server.clone();
            thread::spawn(move || server.run())
        };
        assert!(
            server
                .subsystem()
                .wait_for(SubsystemState::Running, Timeout::from_secs(5))
        );
        assert_eq!(worker.state(), SubsystemState::Running);

        handle.shutdown().unwrap();
        runner.join().unwrap().unwrap();
        assert_eq!(server.subsystem().state(), SubsystemState::Idling);
        assert_eq!(worker.state(), SubsystemState::Idling);
        // A second request is a no-op.
        handle.shutdown().unwrap();
    }

    #[test]
    fn run_returns_when_a_thread_dies() {
        struct Fragile;

        impl SubsystemHooks for Fragile {
            fn on_start(&self, subsystem: &Subsystem) -> Result<(), crate::error::HookError> {
                subsystem.spawn_thread("fragile", ThreadOptions::independent(), |_| {
                    thread::sleep(Duration::from_millis(20));
                })?;
                Ok(())
            }
        }

        let server = Server::new("srv", Fragile);
        server.run().unwrap();
        assert_eq!(server.subsystem().state(), SubsystemState::Idling);
    }
}

//! Line-echo TCP service assembled from the runtime primitives.
//!
//! The root [`Server`] has two children: a [`TaskDispatcher`] and, after it, a
//! listener subsystem. The listener's setup binds the socket and spawns an
//! acceptor thread that turns every accepted socket into a [`ConnectionTask`].
//! Stopping the root stops the listener first (raising the acceptor's flag and
//! telling open connections to wind down), then the dispatcher per its policy.
use std::{
    io::{self, BufRead, BufReader, ErrorKind, Write},
    net::{Shutdown, SocketAddr, TcpListener, TcpStream},
    sync::{Arc, Mutex},
    time::Instant,
};

use tracing::{debug, error, info, warn};

use crate::{
    config::Config,
    dispatcher::{TaskDispatcher, TaskSender},
    error::{HookError, RuntimeError},
    server::{Server, ShutdownHandle},
    subsystem::{NoHooks, Subsystem, SubsystemHooks, SubsystemState, ThreadContext, ThreadOptions},
    sync::lock,
    task::{Task, WorkerInfo},
    termination::TerminationFlag,
    timeout::Timeout,
};

/// Shared between the hooks, which refresh it on every start, and the service.
#[derive(Debug, Default)]
struct Runtime {
    local_addr: Option<SocketAddr>,
    /// Raised when the listener begins stopping; observed by open connections.
    closing: TerminationFlag,
}

struct EchoHooks {
    listen: SocketAddr,
    accept_poll: Timeout,
    connection_timeout: Timeout,
    sender: TaskSender,
    runtime: Arc<Mutex<Runtime>>,
}

impl SubsystemHooks for EchoHooks {
    fn on_start(&self, subsystem: &Subsystem) -> Result<(), HookError> {
        let listener = TcpListener::bind(self.listen)?;
        listener.set_nonblocking(true)?;
        let local_addr = listener.local_addr()?;

        let closing = TerminationFlag::new();
        {
            let mut runtime = lock(&self.runtime);
            runtime.local_addr = Some(local_addr);
            runtime.closing = closing.clone();
        }

        let acceptor = Acceptor {
            listener,
            sender: self.sender.clone(),
            accept_poll: self.accept_poll,
            connection_timeout: self.connection_timeout,
            closing,
        };
        subsystem.spawn_thread(
            format!("{}-acceptor", subsystem.name()),
            ThreadOptions::independent(),
            move |ctx| acceptor.run(ctx),
        )?;
        info!("Listening on {local_addr}");
        Ok(())
    }

    fn on_stop(&self, subsystem: &Subsystem) {
        lock(&self.runtime).closing.set();
        // Stopping on its own (the acceptor died) takes the whole server down.
        if let Some(parent) = subsystem.parent()
            && parent.state() == SubsystemState::Running
        {
            warn!("Listener '{}' stopped; shutting down '{}'", subsystem.name(), parent.name());
            if let Err(err) = parent.request_stop() {
                error!("Could not stop '{}': {err}", parent.name());
            }
        }
    }
}

struct Acceptor {
    listener: TcpListener,
    sender: TaskSender,
    accept_poll: Timeout,
    connection_timeout: Timeout,
    closing: TerminationFlag,
}

impl Acceptor {
    fn run(self, ctx: ThreadContext) {
        while !ctx.should_terminate() {
            match self.listener.accept() {
                Ok((stream, peer)) => self.dispatch(stream, peer),
                Err(e) if e.kind() == ErrorKind::WouldBlock => {
                    ctx.await_termination(self.accept_poll);
                }
                Err(e) if e.kind() == ErrorKind::Interrupted => {}
                Err(e) => {
                    // Returning with the flag clear auto-stops the listener.
                    error!("Accept on {:?} failed: {e}", self.listener.local_addr());
                    return;
                }
            }
        }
        debug!("Acceptor '{}' exiting", ctx.name());
    }

    fn dispatch(&self, stream: TcpStream, peer: SocketAddr) {
        let task = match ConnectionTask::new(
            stream,
            peer,
            self.accept_poll,
            self.connection_timeout,
            self.closing.clone(),
        ) {
            Ok(task) => task,
            Err(e) => {
                warn!("Dropping connection from {peer}: {e}");
                return;
            }
        };
        if let Err(err) = self.sender.push(task) {
            warn!("Connection from {peer} refused: {err}");
        }
    }
}

/// Echoes every line received on one connection back to the peer.
///
/// Ends on EOF, on an I/O error, after `idle_timeout` without input, or once
/// the server begins stopping.
pub struct ConnectionTask {
    name: String,
    stream: TcpStream,
    peer: SocketAddr,
    idle_timeout: Timeout,
    closing: TerminationFlag,
}

impl ConnectionTask {
    fn new(
        stream: TcpStream,
        peer: SocketAddr,
        poll: Timeout,
        idle_timeout: Timeout,
        closing: TerminationFlag,
    ) -> io::Result<Self> {
        stream.set_nonblocking(false)?;
        // Short reads let the task notice `closing` without waiting out the idle timeout.
        stream.set_read_timeout(Some(poll.min(idle_timeout).as_duration()))?;
        Ok(Self {
            name: format!("connection {peer}"),
            stream,
            peer,
            idle_timeout,
            closing,
        })
    }

    fn serve(&self) -> io::Result<u64> {
        let mut reader = BufReader::new(self.stream.try_clone()?);
        let mut writer = &self.stream;
        let mut line = Vec::new();
        let mut echoed = 0;
        let mut last_input = Instant::now();

        loop {
            match reader.read_until(b'\n', &mut line) {
                Ok(0) => {
                    // EOF; echo back an unterminated final line.
                    if !line.is_empty() {
                        writer.write_all(&line)?;
                        echoed += 1;
                    }
                    return Ok(echoed);
                }
                Ok(_) => {
                    writer.write_all(&line)?;
                    writer.flush()?;
                    line.clear();
                    echoed += 1;
                    last_input = Instant::now();
                }
                Err(e) if matches!(e.kind(), ErrorKind::WouldBlock | ErrorKind::TimedOut) => {
                    if self.closing.is_set() {
                        debug!("Closing {} for shutdown", self.name);
                        return Ok(echoed);
                    }
                    if last_input.elapsed() >= self.idle_timeout.as_duration() {
                        debug!("Closing idle {}", self.name);
                        return Ok(echoed);
                    }
                }
                Err(e) if e.kind() == ErrorKind::Interrupted => {}
                Err(e) => return Err(e),
            }
        }
    }
}

impl Task for ConnectionTask {
    fn run(self: Box<Self>, worker: &WorkerInfo) {
        debug!("Serving {} on {}", self.peer, worker);
        match self.serve() {
            Ok(lines) => debug!("Connection {} done after {lines} lines", self.peer),
            Err(e) => warn!("Connection {} failed: {e}", self.peer),
        }
        let _ = self.stream.shutdown(Shutdown::Both);
    }

    fn abandon(self: Box<Self>) {
        debug!("Closing unserved connection {}", self.peer);
        let _ = self.stream.shutdown(Shutdown::Both);
    }

    fn name(&self) -> &str {
        &self.name
    }
}

/// The echo server: root subsystem, dispatcher and listener.
#[derive(Debug, Clone)]
pub struct EchoService {
    server: Server,
    dispatcher: TaskDispatcher,
    listener: Subsystem,
    runtime: Arc<Mutex<Runtime>>,
}

impl EchoService {
    /// Composes the subsystem tree described by `config`; nothing runs yet.
    ///
    /// The listener is attached after the dispatcher, so it starts once the
    /// workers are up and stops before they drain.
    pub fn build(config: &Config) -> Result<Self, RuntimeError> {
        let name = &config.server.name;
        let server = Server::new(name.as_str(), NoHooks);
        let dispatcher = TaskDispatcher::attach(
            server.subsystem(),
            format!("{name}-dispatcher"),
            config.dispatcher.clone(),
        )?;

        let runtime = Arc::new(Mutex::new(Runtime::default()));
        let listener = server.add_subsystem(
            format!("{name}-listener"),
            EchoHooks {
                listen: config.server.listen,
                accept_poll: config.server.accept_poll,
                connection_timeout: config.server.connection_timeout,
                sender: dispatcher.sender(),
                runtime: Arc::clone(&runtime),
            },
        );

        Ok(Self {
            server,
            dispatcher,
            listener,
            runtime,
        })
    }

    pub fn server(&self) -> &Server {
        &self.server
    }

    pub fn dispatcher(&self) -> &TaskDispatcher {
        &self.dispatcher
    }

    pub fn listener(&self) -> &Subsystem {
        &self.listener
    }

    /// Address the listener is bound to, once it has started.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        lock(&self.runtime).local_addr
    }

    /// Runs the service until it is shut down.
    pub fn run(&self) -> Result<(), RuntimeError> {
        self.server.run()
    }

    pub fn shutdown_handle(&self) -> ShutdownHandle {
        self.server.shutdown_handle()
    }
}

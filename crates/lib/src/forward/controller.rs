//! Device controller: control socket accept loop and the port → listener registry.
//!
//! Everything that touches the registry runs on the controller's own task: one control
//! connection is accepted, its single command is read and fully applied, then the next one
//! is accepted. Listener exit reports and in-process queries are handled between commands on
//! the same task, so the registry needs no lock.

use crate::config::Config;
use crate::error::ProtocolError;
use crate::forward::command::{self, Command, CommandType};
use crate::forward::listener::{ExitNotifier, ExitReason, Listener, ListenerExit};
use crate::shutdown::ShutdownSignal;
use anyhow::{Context, Result};
use std::collections::HashMap;
use std::net::IpAddr;
use std::path::PathBuf;
use std::time::Duration;
use tokio::net::{UnixListener, UnixStream};
use tokio::sync::{mpsc, oneshot};

/// Pause after a failed control accept so a persistent error (e.g. EMFILE) does not spin.
const ACCEPT_RETRY_DELAY: Duration = Duration::from_millis(100);

enum Query {
    Ports(oneshot::Sender<Vec<u16>>),
}

/// In-process handle for observing a running controller.
#[derive(Clone)]
pub struct ControllerHandle {
    queries: mpsc::Sender<Query>,
}

impl ControllerHandle {
    /// Ports currently registered, sorted. `None` once the controller has stopped.
    pub async fn ports(&self) -> Option<Vec<u16>> {
        let (tx, rx) = oneshot::channel();
        self.queries.send(Query::Ports(tx)).await.ok()?;
        rx.await.ok()
    }
}

pub struct Controller {
    control: UnixListener,
    socket_path: PathBuf,
    listeners: HashMap<u16, Listener>,
    next_id: u64,
    bind_addr: IpAddr,
    command_timeout: Duration,
    exit_tx: mpsc::UnboundedSender<ListenerExit>,
    exit_rx: mpsc::UnboundedReceiver<ListenerExit>,
    queries: mpsc::Receiver<Query>,
    shutdown: ShutdownSignal,
}

impl Controller {
    /// Bind the control socket at `config.controller.socket_path`, replacing a stale socket file.
    /// Failure here is the only fatal error of the daemon.
    pub fn bind(config: &Config, shutdown: ShutdownSignal) -> Result<(Self, ControllerHandle)> {
        let socket_path = config.controller.socket_path.clone();
        let bind_addr = config.listener.bind_addr()?;
        if let Some(parent) = socket_path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("creating socket directory {}", parent.display()))?;
        }
        if socket_path.exists() {
            log::debug!("removing stale control socket {}", socket_path.display());
            let _ = std::fs::remove_file(&socket_path);
        }
        let control = UnixListener::bind(&socket_path)
            .with_context(|| format!("binding control socket {}", socket_path.display()))?;
        log::info!("listening on unix domain socket {}", socket_path.display());

        let (exit_tx, exit_rx) = mpsc::unbounded_channel();
        let (query_tx, queries) = mpsc::channel(16);
        let controller = Self {
            control,
            socket_path,
            listeners: HashMap::new(),
            next_id: 0,
            bind_addr,
            command_timeout: config.controller.command_timeout(),
            exit_tx,
            exit_rx,
            queries,
            shutdown,
        };
        Ok((controller, ControllerHandle { queries: query_tx }))
    }

    /// Serve control connections until the shutdown signal fires, then close every listener.
    pub async fn run(mut self) {
        loop {
            tokio::select! {
                biased;
                _ = self.shutdown.wait() => {
                    log::info!("received exit notification");
                    break;
                }
                Some(exit) = self.exit_rx.recv() => self.on_listener_exit(exit).await,
                Some(query) = self.queries.recv() => self.answer(query),
                accepted = self.control.accept() => match accepted {
                    Ok((stream, _)) => self.handle_connection(stream).await,
                    Err(e) => {
                        log::error!("could not accept control connection: {}", e);
                        tokio::time::sleep(ACCEPT_RETRY_DELAY).await;
                    }
                },
            }
        }
        self.close_all().await;
    }

    async fn handle_connection(&mut self, mut stream: UnixStream) {
        let read = tokio::select! {
            _ = self.shutdown.wait() => {
                log::debug!("exit notification while waiting for a command");
                return;
            }
            read = tokio::time::timeout(self.command_timeout, command::read_command(&mut stream)) => {
                read.unwrap_or(Err(ProtocolError::Timeout))
            }
        };
        let cmd = match read {
            Ok(cmd) => cmd,
            Err(e) => {
                log::error!("invalid command received: {}", e);
                return;
            }
        };
        log::debug!("received {}", cmd);
        match cmd.kind {
            CommandType::Listen => self.listen(cmd.port).await,
            CommandType::DataConnection => self.attach_data_connection(cmd.port, stream),
            CommandType::Unlisten => self.unlisten(cmd.port, stream).await,
            _ => log::error!(
                "invalid command received. port: {} command: {}",
                cmd.port,
                cmd.kind
            ),
        }
    }

    async fn listen(&mut self, port: u16) {
        if let Some(existing) = self.listeners.remove(&port) {
            log::warn!("already forwarding port {}; restarting the listener", port);
            existing.close().await;
        }
        let id = self.next_id;
        self.next_id += 1;
        let listener = Listener::create(
            self.bind_addr,
            port,
            id,
            ExitNotifier::new(&self.exit_tx),
            self.shutdown.clone(),
        )
        .await;
        let mut listener = match listener {
            Ok(l) => l,
            Err(e) => {
                log::error!("could not start listener: {}", e);
                return;
            }
        };
        listener.start();
        // `port` may be 0; register under the port actually bound.
        let listener_port = listener.listener_port();
        self.listeners.insert(listener_port, listener);
        log::info!("forwarding device port {} to host", listener_port);
    }

    fn attach_data_connection(&mut self, port: u16, stream: UnixStream) {
        let Some(listener) = self.listeners.get(&port) else {
            // No NACK exists; the host sees this connection close.
            log::error!(
                "data connection command received, but listener has not been set up yet for port {}",
                port
            );
            return;
        };
        if listener.set_data_socket(stream).is_err() {
            log::warn!(
                "listener on port {} already stopped; dropping data connection",
                port
            );
        }
    }

    async fn unlisten(&mut self, port: u16, mut stream: UnixStream) {
        log::info!("unmapping port {}", port);
        let reply = match self.listeners.remove(&port) {
            Some(listener) => {
                listener.close().await;
                CommandType::UnlistenSuccess
            }
            None => {
                log::error!("no listener found for port {}", port);
                CommandType::UnlistenError
            }
        };
        if let Err(e) = command::write_command(&mut stream, reply, port).await {
            log::warn!("could not send {} to host: {}", Command::new(reply, port), e);
        }
    }

    async fn on_listener_exit(&mut self, exit: ListenerExit) {
        let current = self.listeners.get(&exit.port).map(Listener::id);
        if current != Some(exit.id) {
            log::debug!(
                "ignoring stale exit report for port {} (listener {})",
                exit.port,
                exit.id
            );
            return;
        }
        if let Some(listener) = self.listeners.remove(&exit.port) {
            listener.close().await;
        }
        match exit.reason {
            ExitReason::Closed => log::info!("stopped forwarding device port {}", exit.port),
            ExitReason::Failed(e) => {
                log::warn!("removed listener for port {} after error: {}", exit.port, e)
            }
        }
    }

    fn answer(&self, query: Query) {
        match query {
            Query::Ports(reply) => {
                let mut ports: Vec<u16> = self.listeners.keys().copied().collect();
                ports.sort_unstable();
                let _ = reply.send(ports);
            }
        }
    }

    async fn close_all(&mut self) {
        for (port, listener) in std::mem::take(&mut self.listeners) {
            listener.close().await;
            log::debug!("closed listener for port {}", port);
        }
    }
}

impl Drop for Controller {
    fn drop(&mut self) {
        let _ = std::fs::remove_file(&self.socket_path);
    }
}

/// Bind the control socket and serve until `shutdown` fires.
pub async fn run_forwarder(config: Config, shutdown: ShutdownSignal) -> Result<()> {
    let (controller, _handle) = Controller::bind(&config, shutdown)?;
    controller.run().await;
    log::info!("forwarder stopped");
    Ok(())
}

//! Per-port device listener.
//!
//! A listener owns the TCP socket for one forwarded port and serves exactly one pair: the
//! first device connection and the first host data connection. Until both exist, one of each
//! is held; further device connections stay in the kernel backlog and further data
//! connections are closed immediately. The relay ending (either side closing, or an I/O
//! error) and an accept failure are terminal: the listener reports itself to the controller
//! exactly once through its [`ExitNotifier`].

use crate::error::{ForwardError, ListenerError};
use crate::shutdown::ShutdownSignal;
use std::io;
use std::net::{IpAddr, SocketAddr};
use tokio::io::AsyncWriteExt;
use tokio::net::{TcpListener, TcpStream, UnixStream};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

/// Why a listener stopped on its own.
#[derive(Debug)]
pub enum ExitReason {
    /// A relay finished because one side closed.
    Closed,
    Failed(ListenerError),
}

/// Sent to the controller when a listener stops on its own. `port` and `id` together identify
/// the registry entry; a report whose id no longer matches is stale.
#[derive(Debug)]
pub struct ListenerExit {
    pub port: u16,
    pub id: u64,
    pub reason: ExitReason,
}

/// One-shot route back to the controller.
///
/// Holds only a weak sender: once the controller is gone, [`ExitNotifier::notify`] does nothing.
pub struct ExitNotifier {
    tx: mpsc::WeakUnboundedSender<ListenerExit>,
}

impl ExitNotifier {
    pub fn new(tx: &mpsc::UnboundedSender<ListenerExit>) -> Self {
        Self { tx: tx.downgrade() }
    }

    /// Deliver the report. Returns false when the controller no longer exists.
    pub fn notify(self, exit: ListenerExit) -> bool {
        match self.tx.upgrade() {
            Some(tx) => tx.send(exit).is_ok(),
            None => false,
        }
    }
}

enum State {
    Bound(Box<Worker>),
    Running(JoinHandle<()>),
    Closed,
}

/// Handle to one forwarded port, owned by the controller's registry.
pub struct Listener {
    port: u16,
    id: u64,
    data_tx: mpsc::UnboundedSender<UnixStream>,
    state: State,
}

impl Listener {
    /// Bind `bind_addr:port` (any free port when `port` is 0). The accept loop does not run
    /// until [`Listener::start`].
    pub async fn create(
        bind_addr: IpAddr,
        port: u16,
        id: u64,
        on_exit: ExitNotifier,
        shutdown: ShutdownSignal,
    ) -> Result<Self, ForwardError> {
        let socket = TcpListener::bind(SocketAddr::new(bind_addr, port))
            .await
            .map_err(|source| ForwardError::Bind { port, source })?;
        let port = socket
            .local_addr()
            .map_err(|source| ForwardError::Bind { port, source })?
            .port();
        let (data_tx, data_rx) = mpsc::unbounded_channel();
        let worker = Worker {
            port,
            id,
            socket,
            data_rx,
            shutdown,
            on_exit,
        };
        Ok(Self {
            port,
            id,
            data_tx,
            state: State::Bound(Box::new(worker)),
        })
    }

    /// Spawn the accept loop. Calling it again is a no-op.
    pub fn start(&mut self) {
        self.state = match std::mem::replace(&mut self.state, State::Closed) {
            State::Bound(worker) => State::Running(tokio::spawn(worker.run())),
            other => other,
        };
    }

    /// The port actually bound; differs from the requested one only when that was 0.
    pub fn listener_port(&self) -> u16 {
        self.port
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    /// Attach a host-side data connection. Gives the socket back if the listener has already
    /// stopped.
    pub fn set_data_socket(&self, socket: UnixStream) -> Result<(), UnixStream> {
        self.data_tx.send(socket).map_err(|e| e.0)
    }

    /// Stop the accept loop (or relay) and wait until the port is released.
    pub async fn close(mut self) {
        if let State::Running(handle) = std::mem::replace(&mut self.state, State::Closed) {
            handle.abort();
            let _ = handle.await;
        }
    }
}

impl Drop for Listener {
    fn drop(&mut self) {
        if let State::Running(handle) = &self.state {
            handle.abort();
        }
    }
}

enum Served {
    Shutdown,
    Closed,
}

struct Worker {
    port: u16,
    id: u64,
    socket: TcpListener,
    data_rx: mpsc::UnboundedReceiver<UnixStream>,
    shutdown: ShutdownSignal,
    on_exit: ExitNotifier,
}

impl Worker {
    async fn run(mut self) {
        let reason = match self.serve().await {
            Ok(Served::Shutdown) => {
                log::debug!("listener on port {} stopping for exit", self.port);
                return;
            }
            Ok(Served::Closed) => ExitReason::Closed,
            Err(e) => {
                log::warn!("listener on port {} failed: {}", self.port, e);
                ExitReason::Failed(e)
            }
        };
        let exit = ListenerExit {
            port: self.port,
            id: self.id,
            reason,
        };
        if !self.on_exit.notify(exit) {
            log::debug!("listener on port {} exited after controller shutdown", self.port);
        }
    }

    async fn serve(&mut self) -> Result<Served, ListenerError> {
        let mut device: Option<(TcpStream, SocketAddr)> = None;
        let mut host: Option<UnixStream> = None;
        loop {
            match (device.take(), host.take()) {
                (Some((d, peer)), Some(h)) => return self.relay(d, peer, h).await,
                (d, h) => {
                    device = d;
                    host = h;
                }
            }
            tokio::select! {
                _ = self.shutdown.wait() => return Ok(Served::Shutdown),
                // One pending device connection at most; later ones wait in the kernel backlog.
                accepted = self.socket.accept(), if device.is_none() => {
                    let (stream, peer) = accepted.map_err(ListenerError::Accept)?;
                    log::debug!("port {}: device connection from {}", self.port, peer);
                    device = Some((stream, peer));
                }
                Some(stream) = self.data_rx.recv() => {
                    if host.is_some() {
                        self.reject(stream);
                    } else {
                        log::debug!("port {}: data connection attached", self.port);
                        host = Some(stream);
                    }
                }
            }
        }
    }

    /// A listener serves a single pair, so any data connection beyond the attached one is
    /// closed right away and the host sees EOF.
    fn reject(&self, stream: UnixStream) {
        log::warn!(
            "port {}: data connection already attached; closing the extra one",
            self.port
        );
        drop(stream);
    }

    async fn relay(
        &mut self,
        mut device: TcpStream,
        peer: SocketAddr,
        mut host: UnixStream,
    ) -> Result<Served, ListenerError> {
        log::info!("port {}: relaying device connection {}", self.port, peer);
        let outcome = {
            let (mut device_rd, mut device_wr) = device.split();
            let (mut host_rd, mut host_wr) = host.split();
            let device_to_host = tokio::io::copy(&mut device_rd, &mut host_wr);
            let host_to_device = tokio::io::copy(&mut host_rd, &mut device_wr);
            tokio::pin!(device_to_host, host_to_device);
            loop {
                tokio::select! {
                    _ = self.shutdown.wait() => return Ok(Served::Shutdown),
                    r = &mut device_to_host => break r.map(|n| ("device", n)),
                    r = &mut host_to_device => break r.map(|n| ("host", n)),
                    Some(extra) = self.data_rx.recv() => self.reject(extra),
                }
            }
        };
        let _ = device.shutdown().await;
        let _ = host.shutdown().await;
        match outcome {
            Ok((side, n)) => {
                log::info!(
                    "port {}: {} side closed after {} bytes from it; forwarding finished",
                    self.port,
                    side,
                    n
                );
                Ok(Served::Closed)
            }
            Err(e) if is_disconnect(&e) => {
                log::info!("port {}: peer disconnected ({})", self.port, e);
                Ok(Served::Closed)
            }
            Err(e) => Err(ListenerError::Relay(e)),
        }
    }
}

/// Reset and broken-pipe races during teardown count as a normal close.
fn is_disconnect(e: &io::Error) -> bool {
    matches!(
        e.kind(),
        io::ErrorKind::BrokenPipe | io::ErrorKind::NotConnected | io::ErrorKind::ConnectionReset
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::shutdown;
    use std::time::Duration;
    use tokio::io::AsyncReadExt;

    const LOCALHOST: IpAddr = IpAddr::V4(std::net::Ipv4Addr::LOCALHOST);

    #[tokio::test]
    async fn notifier_is_noop_once_controller_is_gone() {
        let (tx, rx) = mpsc::unbounded_channel::<ListenerExit>();
        let notifier = ExitNotifier::new(&tx);
        drop(tx);
        drop(rx);
        assert!(!notifier.notify(ListenerExit {
            port: 1,
            id: 0,
            reason: ExitReason::Closed,
        }));
    }

    #[tokio::test]
    async fn dynamic_port_is_resolved_at_create() {
        let (tx, _rx) = mpsc::unbounded_channel();
        let (_trigger, signal) = shutdown::channel();
        let listener = Listener::create(LOCALHOST, 0, 7, ExitNotifier::new(&tx), signal)
            .await
            .expect("bind ephemeral port");
        assert_ne!(listener.listener_port(), 0);
        assert_eq!(listener.id(), 7);
    }

    #[tokio::test]
    async fn bind_conflict_is_bind_error() {
        let taken = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let port = taken.local_addr().unwrap().port();
        let (tx, _rx) = mpsc::unbounded_channel();
        let (_trigger, signal) = shutdown::channel();
        match Listener::create(LOCALHOST, port, 0, ExitNotifier::new(&tx), signal).await {
            Err(ForwardError::Bind { port: p, .. }) => assert_eq!(p, port),
            Err(other) => panic!("expected bind error, got {}", other),
            Ok(_) => panic!("expected bind error, got a listener"),
        }
    }

    #[tokio::test]
    async fn relay_end_reports_exactly_once() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let (_trigger, signal) = shutdown::channel();
        let mut listener = Listener::create(LOCALHOST, 0, 3, ExitNotifier::new(&tx), signal)
            .await
            .unwrap();
        let port = listener.listener_port();
        listener.start();

        let (mut host_side, daemon_side) = UnixStream::pair().unwrap();
        listener.set_data_socket(daemon_side).unwrap();
        let mut device = TcpStream::connect((LOCALHOST, port)).await.unwrap();

        device.write_all(b"ping").await.unwrap();
        let mut buf = [0u8; 4];
        host_side.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"ping");
        host_side.write_all(b"pong").await.unwrap();
        device.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"pong");

        drop(device);
        let exit = tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .expect("exit report")
            .expect("channel open");
        assert_eq!(exit.port, port);
        assert_eq!(exit.id, 3);
        assert!(matches!(exit.reason, ExitReason::Closed));

        listener.close().await;
        assert!(rx.try_recv().is_err(), "second report");
    }

    #[tokio::test]
    async fn first_device_connection_is_the_one_paired() {
        let (tx, _rx) = mpsc::unbounded_channel();
        let (_trigger, signal) = shutdown::channel();
        let mut listener = Listener::create(LOCALHOST, 0, 0, ExitNotifier::new(&tx), signal)
            .await
            .unwrap();
        let port = listener.listener_port();
        listener.start();

        let mut first = TcpStream::connect((LOCALHOST, port)).await.unwrap();
        first.write_all(b"one").await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        let mut second = TcpStream::connect((LOCALHOST, port)).await.unwrap();
        second.write_all(b"two").await.unwrap();

        let (mut host_side, daemon_side) = UnixStream::pair().unwrap();
        listener.set_data_socket(daemon_side).unwrap();
        let mut buf = [0u8; 3];
        tokio::time::timeout(Duration::from_secs(5), host_side.read_exact(&mut buf))
            .await
            .expect("relayed in time")
            .unwrap();
        assert_eq!(&buf, b"one");
        listener.close().await;
    }

    #[tokio::test]
    async fn extra_data_socket_is_closed_immediately() {
        let (tx, _rx) = mpsc::unbounded_channel();
        let (_trigger, signal) = shutdown::channel();
        let mut listener = Listener::create(LOCALHOST, 0, 0, ExitNotifier::new(&tx), signal)
            .await
            .unwrap();
        let port = listener.listener_port();
        listener.start();

        let (mut attached, daemon_first) = UnixStream::pair().unwrap();
        let (mut extra, daemon_extra) = UnixStream::pair().unwrap();
        listener.set_data_socket(daemon_first).unwrap();
        listener.set_data_socket(daemon_extra).unwrap();

        let mut buf = [0u8; 8];
        let n = tokio::time::timeout(Duration::from_secs(2), extra.read(&mut buf))
            .await
            .expect("extra data connection closed promptly")
            .unwrap_or(0);
        assert_eq!(n, 0);

        // The attached one still pairs with the device connection.
        let mut device = TcpStream::connect((LOCALHOST, port)).await.unwrap();
        device.write_all(b"hi").await.unwrap();
        let mut two = [0u8; 2];
        tokio::time::timeout(Duration::from_secs(5), attached.read_exact(&mut two))
            .await
            .expect("relayed in time")
            .unwrap();
        assert_eq!(&two, b"hi");
        listener.close().await;
    }

    #[tokio::test]
    async fn shutdown_stops_without_report() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let (trigger, signal) = shutdown::channel();
        let mut listener = Listener::create(LOCALHOST, 0, 0, ExitNotifier::new(&tx), signal)
            .await
            .unwrap();
        let port = listener.listener_port();
        listener.start();
        trigger.trigger();
        listener.close().await;
        assert!(rx.try_recv().is_err());
        // Port is free again once close returns.
        std::net::TcpListener::bind(("127.0.0.1", port)).expect("port released");
    }
}

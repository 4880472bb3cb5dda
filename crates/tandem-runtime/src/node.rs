//! # Nodes
//!
//! A [`ServerNode`] or [`ClientNode`] wires one transport endpoint to real
//! sockets and a [`Runtime`]. Peer notifications come out of the public
//! `events` receiver, the same way the transport crate emits them.

use crossbeam_channel::{unbounded, Receiver, RecvTimeoutError};
use quanta::Instant;
use std::net::{SocketAddr, TcpListener, UdpSocket};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use tandem_transport::peer::PeerState;
use tandem_transport::router::Transport;
use tandem_transport::{Client, EventSink, PeerEvent, Server};

use crate::config::NodeConfig;
use crate::net::{read_datagrams, read_stream, ClientIo, StdConnector, TcpTransport, UdpPeers, POLL_INTERVAL};
use crate::runtime::Runtime;

/// Ticks between prunes of the datagram address cache.
const PRUNE_EVERY: u32 = 50;

fn lock<T>(m: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|e| e.into_inner())
}

/// Poll `done` until it holds or `limit` passes.
fn wait_for(limit: Duration, done: impl Fn() -> bool) -> bool {
    let deadline = std::time::Instant::now() + limit;
    while !done() {
        if std::time::Instant::now() >= deadline {
            return false;
        }
        thread::sleep(Duration::from_millis(5));
    }
    true
}

// ─── Server ─────────────────────────────────────────────────────────────────

pub struct ServerNode {
    server: Arc<Server>,
    /// Peer notifications, in order per peer.
    pub events: Receiver<PeerEvent>,
    local_addr: SocketAddr,
    udp_addr: Option<SocketAddr>,
    sweep_interval: Duration,
    running: Arc<AtomicBool>,
    runtime: Runtime,
    threads: Mutex<Vec<thread::JoinHandle<()>>>,
}

impl ServerNode {
    pub fn start(config: &NodeConfig) -> anyhow::Result<Self> {
        let (sink, events) = EventSink::new();
        let server = Arc::new(Server::new(config.transport.clone(), sink));
        let running = Arc::new(AtomicBool::new(true));
        let mut threads = Vec::new();

        let listener = TcpListener::bind(config.listen)
            .map_err(|e| anyhow::anyhow!("cannot listen on {}: {e}", config.listen))?;
        listener.set_nonblocking(true)?;
        let local_addr = listener.local_addr()?;

        let udp_addr = match config.udp_listen {
            Some(addr) if config.transport.udp_enabled => {
                let socket = UdpSocket::bind(addr)
                    .map_err(|e| anyhow::anyhow!("cannot bind udp {addr}: {e}"))?;
                let bound = socket.local_addr()?;
                server.set_udp_port(bound.port());
                threads.push(spawn_udp_reader(Arc::new(socket), &server, &running)?);
                Some(bound)
            }
            _ => None,
        };

        let write_timeout = config.transport.send_timeout;
        threads.push(spawn_acceptor(listener, &server, &running, write_timeout)?);

        let runtime = Runtime::start(
            Arc::clone(&server),
            config.workers,
            config.tick_interval,
            config.sweep_interval,
        )?;

        tracing::info!(listen = %local_addr, udp = ?udp_addr, workers = config.workers, "server node started");
        Ok(ServerNode {
            server,
            events,
            local_addr,
            udp_addr,
            sweep_interval: config.sweep_interval,
            running,
            runtime,
            threads: Mutex::new(threads),
        })
    }

    pub fn server(&self) -> &Arc<Server> {
        &self.server
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn udp_addr(&self) -> Option<SocketAddr> {
        self.udp_addr
    }

    /// Close every peer, give the close handshakes and the sweep that
    /// removes closed peers up to `grace` to finish, then stop all threads.
    /// Idempotent.
    pub fn shutdown(&mut self, grace: Duration) {
        if !self.running.load(Ordering::Acquire) {
            return;
        }
        self.server.shutdown(Instant::now());
        let server = Arc::clone(&self.server);
        if !wait_for(grace, || server.stats().peers == 0) {
            tracing::warn!(peers = server.stats().peers, "peers not drained at shutdown");
        }
        self.runtime.shutdown();
        self.running.store(false, Ordering::Release);
        for handle in lock(&self.threads).drain(..) {
            let _ = handle.join();
        }
        tracing::info!("server node stopped");
    }
}

impl Drop for ServerNode {
    fn drop(&mut self) {
        let grace = self.server.config().close_grace + self.sweep_interval * 2;
        self.shutdown(grace);
    }
}

fn spawn_acceptor(
    listener: TcpListener,
    server: &Arc<Server>,
    running: &Arc<AtomicBool>,
    write_timeout: Duration,
) -> anyhow::Result<thread::JoinHandle<()>> {
    let server = Arc::clone(server);
    let running = Arc::clone(running);
    let handle = thread::Builder::new()
        .name("tandem-accept".into())
        .spawn(move || {
            while running.load(Ordering::Relaxed) {
                match listener.accept() {
                    Ok((stream, remote)) => {
                        if let Err(e) = stream.set_nonblocking(false) {
                            tracing::warn!(%remote, error = %e, "cannot configure stream");
                            continue;
                        }
                        accept_stream(&server, stream, write_timeout);
                    }
                    Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => {
                        thread::sleep(Duration::from_millis(10));
                    }
                    Err(e) => {
                        tracing::debug!(error = %e, "accept failed");
                        thread::sleep(Duration::from_millis(10));
                    }
                }
            }
        })
        .map_err(|e| anyhow::anyhow!("failed to spawn acceptor: {e}"))?;
    Ok(handle)
}

fn accept_stream(server: &Arc<Server>, stream: std::net::TcpStream, write_timeout: Duration) {
    let tcp = match TcpTransport::new(stream, write_timeout) {
        Ok(tcp) => tcp,
        Err(e) => {
            tracing::warn!(error = %e, "cannot configure stream");
            return;
        }
    };
    let reader = match tcp.reader() {
        Ok(reader) => reader,
        Err(e) => {
            tracing::warn!(remote = %tcp.peer_addr(), error = %e, "cannot clone stream");
            return;
        }
    };
    let remote = tcp.peer_addr();
    let key = match server.accept(tcp, Instant::now()) {
        Ok(key) => key,
        Err(e) => {
            tracing::warn!(%remote, error = %e, "stream refused");
            return;
        }
    };
    let server = Arc::clone(server);
    let spawned = thread::Builder::new()
        .name(format!("tandem-rx-{}", key.0))
        .spawn(move || {
            let error = read_stream(reader, |data| server.on_stream_data(key, data, Instant::now()));
            server.on_stream_closed(key, error, Instant::now());
        });
    if let Err(e) = spawned {
        tracing::warn!(%remote, error = %e, "failed to spawn stream reader");
    }
}

fn spawn_udp_reader(
    socket: Arc<UdpSocket>,
    server: &Arc<Server>,
    running: &Arc<AtomicBool>,
) -> anyhow::Result<thread::JoinHandle<()>> {
    let server = Arc::clone(server);
    let running = Arc::clone(running);
    let handle = thread::Builder::new()
        .name("tandem-udp".into())
        .spawn(move || {
            let mut peers = UdpPeers::new(Arc::clone(&socket));
            let mut seen = 0u32;
            let result = read_datagrams(&socket, &running, |data, from| {
                let reply: Arc<dyn Transport> = peers.get(from);
                server.on_datagram(data, reply, Instant::now());
                seen = seen.wrapping_add(1);
                if seen % PRUNE_EVERY == 0 {
                    peers.prune();
                }
            });
            if let Err(e) = result {
                tracing::warn!(error = %e, "udp reader stopped");
            }
        })
        .map_err(|e| anyhow::anyhow!("failed to spawn udp reader: {e}"))?;
    Ok(handle)
}

// ─── Client ─────────────────────────────────────────────────────────────────

pub struct ClientNode {
    client: Arc<Client>,
    /// Peer notifications for the one connection.
    pub events: Receiver<PeerEvent>,
    running: Arc<AtomicBool>,
    runtime: Runtime,
    pump: Option<thread::JoinHandle<()>>,
}

impl ClientNode {
    /// Build the client and start connecting to `config.connect`.
    pub fn start(config: &NodeConfig) -> anyhow::Result<Self> {
        let (sink, events) = EventSink::new();
        let (io_tx, io_rx) = unbounded();
        let connector = StdConnector::new(config.connect, config.transport.send_timeout, io_tx);
        let client = Arc::new(Client::new(
            config.transport.clone(),
            Arc::new(connector),
            sink,
            Instant::now(),
        ));
        let running = Arc::new(AtomicBool::new(true));

        let pump = {
            let client = Arc::clone(&client);
            let running = Arc::clone(&running);
            thread::Builder::new()
                .name("tandem-client-io".into())
                .spawn(move || pump_client_io(&client, &io_rx, &running))
                .map_err(|e| anyhow::anyhow!("failed to spawn client io thread: {e}"))?
        };

        let runtime = Runtime::start(
            Arc::clone(&client),
            1,
            config.tick_interval,
            config.sweep_interval,
        )?;
        client.connect(Instant::now());
        tracing::info!(server = %config.connect, "client node started");

        Ok(ClientNode {
            client,
            events,
            running,
            runtime,
            pump: Some(pump),
        })
    }

    pub fn client(&self) -> &Arc<Client> {
        &self.client
    }

    /// Close gracefully, wait up to `grace` for the close to finish, then
    /// stop all threads. Idempotent.
    pub fn shutdown(&mut self, grace: Duration) {
        if !self.running.load(Ordering::Acquire) {
            return;
        }
        self.client.close(Instant::now());
        let client = Arc::clone(&self.client);
        wait_for(grace, || client.state() == PeerState::Closed);
        self.runtime.shutdown();
        self.running.store(false, Ordering::Release);
        if let Some(pump) = self.pump.take() {
            let _ = pump.join();
        }
        tracing::info!("client node stopped");
    }
}

impl Drop for ClientNode {
    fn drop(&mut self) {
        let grace = self.client.connection().config().close_grace;
        self.shutdown(grace);
    }
}

fn pump_client_io(client: &Client, io_rx: &Receiver<ClientIo>, running: &AtomicBool) {
    while running.load(Ordering::Relaxed) {
        match io_rx.recv_timeout(POLL_INTERVAL) {
            Ok(ClientIo::StreamData { transport, data }) => {
                client.on_stream_data(&transport, &data, Instant::now())
            }
            Ok(ClientIo::StreamClosed { transport, error }) => {
                client.on_stream_closed(&transport, error, Instant::now())
            }
            Ok(ClientIo::Datagram(data)) => client.on_datagram(data, Instant::now()),
            Err(RecvTimeoutError::Timeout) => {}
            Err(RecvTimeoutError::Disconnected) => return,
        }
    }
}

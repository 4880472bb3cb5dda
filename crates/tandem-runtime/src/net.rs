//! # Std Socket Adapters
//!
//! [`Transport`] implementations over blocking `std::net` sockets, the
//! reader threads that feed them, and a [`Connector`] for clients.
//!
//! Each stream gets one reader thread, so there is never more than one
//! receive outstanding per connection. Writes go straight to the socket and
//! block the caller for at most the write timeout (the configured
//! `send_timeout`); the transport layer serializes them per channel.
//!
//! Datagram transports share one socket. A server keeps one transport per
//! source address ([`UdpPeers`]) so that repeated datagrams from the same
//! client present the same transport identity.

use bytes::Bytes;
use crossbeam_channel::Sender;
use std::collections::HashMap;
use std::io::{self, Read, Write};
use std::net::{Shutdown, SocketAddr, TcpStream, UdpSocket};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use tandem_transport::router::{Channel, Transport};
use tandem_transport::Connector;

/// Largest single read from a stream.
const READ_CHUNK: usize = 64 * 1024;
/// Largest datagram we accept.
const DATAGRAM_MAX: usize = 65_536;
/// How often blocked datagram readers look at their stop flag.
pub(crate) const POLL_INTERVAL: Duration = Duration::from_millis(100);

// ─── TCP ────────────────────────────────────────────────────────────────────

pub struct TcpTransport {
    stream: TcpStream,
    peer: SocketAddr,
    closed: AtomicBool,
}

impl TcpTransport {
    /// `write_timeout` bounds how long one send may wait on a peer that has
    /// stopped reading. It must be non-zero.
    pub fn new(stream: TcpStream, write_timeout: Duration) -> io::Result<Arc<Self>> {
        let peer = stream.peer_addr()?;
        stream.set_nodelay(true)?;
        stream.set_write_timeout(Some(write_timeout))?;
        Ok(Arc::new(TcpTransport {
            stream,
            peer,
            closed: AtomicBool::new(false),
        }))
    }

    pub fn peer_addr(&self) -> SocketAddr {
        self.peer
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// A second handle on the socket for the reader thread.
    pub fn reader(&self) -> io::Result<TcpStream> {
        self.stream.try_clone()
    }
}

impl Transport for TcpTransport {
    fn channel(&self) -> Channel {
        Channel::Reliable
    }

    /// Blocks until the kernel takes every byte, for at most the write
    /// timeout given to [`TcpTransport::new`] per stalled write. A failed
    /// write may have left part of a frame on the wire, so it closes the
    /// stream.
    fn send(&self, data: &[u8]) -> io::Result<()> {
        if self.is_closed() {
            return Err(io::ErrorKind::NotConnected.into());
        }
        let result = (&self.stream).write_all(data);
        if result.is_err() {
            self.close();
        }
        result
    }

    fn close(&self) {
        if !self.closed.swap(true, Ordering::AcqRel) {
            let _ = self.stream.shutdown(Shutdown::Both);
        }
    }

    fn describe(&self) -> String {
        format!("tcp {}", self.peer)
    }
}

/// Read `stream` until it ends, handing each chunk to `on_data`. Returns
/// the error that ended the stream, or `None` on a clean end of stream.
pub fn read_stream(
    mut stream: TcpStream,
    mut on_data: impl FnMut(&[u8]),
) -> Option<io::Error> {
    let mut buf = vec![0u8; READ_CHUNK];
    loop {
        match stream.read(&mut buf) {
            Ok(0) => return None,
            Ok(n) => on_data(&buf[..n]),
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Some(e),
        }
    }
}

// ─── UDP ────────────────────────────────────────────────────────────────────

/// One remote address on a shared datagram socket.
pub struct UdpTransport {
    socket: Arc<UdpSocket>,
    peer: SocketAddr,
    closed: AtomicBool,
}

impl UdpTransport {
    pub fn new(socket: Arc<UdpSocket>, peer: SocketAddr) -> Arc<Self> {
        Arc::new(UdpTransport {
            socket,
            peer,
            closed: AtomicBool::new(false),
        })
    }

    pub fn peer_addr(&self) -> SocketAddr {
        self.peer
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }
}

impl Transport for UdpTransport {
    fn channel(&self) -> Channel {
        Channel::Unreliable
    }

    fn send(&self, data: &[u8]) -> io::Result<()> {
        if self.is_closed() {
            return Err(io::ErrorKind::NotConnected.into());
        }
        self.socket.send_to(data, self.peer).map(|_| ())
    }

    /// The socket is shared, so closing only detaches this address.
    fn close(&self) {
        self.closed.store(true, Ordering::Release);
    }

    fn describe(&self) -> String {
        format!("udp {}", self.peer)
    }
}

/// Server-side cache of datagram transports by source address.
pub struct UdpPeers {
    socket: Arc<UdpSocket>,
    by_addr: HashMap<SocketAddr, Arc<UdpTransport>>,
}

impl UdpPeers {
    pub fn new(socket: Arc<UdpSocket>) -> Self {
        UdpPeers {
            socket,
            by_addr: HashMap::new(),
        }
    }

    /// The transport for `addr`; a closed one is replaced.
    pub fn get(&mut self, addr: SocketAddr) -> Arc<UdpTransport> {
        let entry = self
            .by_addr
            .entry(addr)
            .or_insert_with(|| UdpTransport::new(Arc::clone(&self.socket), addr));
        if entry.is_closed() {
            *entry = UdpTransport::new(Arc::clone(&self.socket), addr);
        }
        Arc::clone(entry)
    }

    /// Forget transports that are closed or that no connection holds.
    pub fn prune(&mut self) -> usize {
        let before = self.by_addr.len();
        self.by_addr
            .retain(|_, t| !t.is_closed() && Arc::strong_count(t) > 1);
        before - self.by_addr.len()
    }

    pub fn len(&self) -> usize {
        self.by_addr.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_addr.is_empty()
    }
}

/// Receive datagrams on `socket` until `running` clears.
pub fn read_datagrams(
    socket: &UdpSocket,
    running: &AtomicBool,
    mut on_datagram: impl FnMut(Bytes, SocketAddr),
) -> io::Result<()> {
    socket.set_read_timeout(Some(POLL_INTERVAL))?;
    let mut buf = vec![0u8; DATAGRAM_MAX];
    while running.load(Ordering::Relaxed) {
        match socket.recv_from(&mut buf) {
            Ok((n, from)) => on_datagram(Bytes::copy_from_slice(&buf[..n]), from),
            Err(e)
                if matches!(
                    e.kind(),
                    io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut | io::ErrorKind::Interrupted
                ) => {}
            // ICMP unreachable from an earlier send surfaces here
            Err(e) if e.kind() == io::ErrorKind::ConnectionReset => {}
            Err(e) => return Err(e),
        }
    }
    Ok(())
}

// ─── Client Connector ───────────────────────────────────────────────────────

/// What a client's reader threads report.
pub enum ClientIo {
    StreamData {
        transport: Arc<dyn Transport>,
        data: Bytes,
    },
    StreamClosed {
        transport: Arc<dyn Transport>,
        error: Option<io::Error>,
    },
    Datagram(Bytes),
}

/// Dials the server with std sockets and reports everything read over a
/// channel.
pub struct StdConnector {
    server: SocketAddr,
    connect_timeout: Duration,
    write_timeout: Duration,
    io_tx: Sender<ClientIo>,
}

impl StdConnector {
    pub fn new(server: SocketAddr, timeout: Duration, io_tx: Sender<ClientIo>) -> Self {
        StdConnector {
            server,
            connect_timeout: timeout,
            write_timeout: timeout,
            io_tx,
        }
    }
}

impl Connector for StdConnector {
    fn connect(&self) -> io::Result<Arc<dyn Transport>> {
        let stream = TcpStream::connect_timeout(&self.server, self.connect_timeout)?;
        let tcp = TcpTransport::new(stream, self.write_timeout)?;
        let reader = tcp.reader()?;
        let transport: Arc<dyn Transport> = tcp;
        let io_tx = self.io_tx.clone();
        let owner = Arc::clone(&transport);
        thread::Builder::new()
            .name("tandem-client-tcp".into())
            .spawn(move || {
                let error = read_stream(reader, |data| {
                    let _ = io_tx.send(ClientIo::StreamData {
                        transport: Arc::clone(&owner),
                        data: Bytes::copy_from_slice(data),
                    });
                });
                let _ = io_tx.send(ClientIo::StreamClosed {
                    transport: owner,
                    error,
                });
            })?;
        tracing::debug!(server = %self.server, "stream connected");
        Ok(transport)
    }

    fn open_udp(&self, port: u16) -> io::Result<Arc<dyn Transport>> {
        let target = SocketAddr::new(self.server.ip(), port);
        let local: SocketAddr = match target {
            SocketAddr::V4(_) => SocketAddr::from(([0, 0, 0, 0], 0)),
            SocketAddr::V6(_) => SocketAddr::from(([0u16; 8], 0)),
        };
        let socket = Arc::new(UdpSocket::bind(local)?);
        let udp = UdpTransport::new(Arc::clone(&socket), target);
        let watch = Arc::clone(&udp);
        let io_tx = self.io_tx.clone();
        thread::Builder::new()
            .name("tandem-client-udp".into())
            .spawn(move || {
                let running = AtomicBool::new(true);
                let result = read_datagrams(&socket, &running, |data, from| {
                    if from != target {
                        tracing::trace!(%from, "datagram from stranger ignored");
                    } else if watch.is_closed() || io_tx.send(ClientIo::Datagram(data)).is_err() {
                        running.store(false, Ordering::Relaxed);
                    }
                });
                if let Err(e) = result {
                    tracing::debug!(error = %e, "udp reader stopped");
                }
            })?;
        tracing::debug!(%target, "udp socket opened");
        Ok(udp)
    }
}

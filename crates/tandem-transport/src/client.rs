//! # Client
//!
//! The dialing side. Wraps a [`Connection`] with the connect and reconnect
//! attempt policy, the client half of the auth handshake (including key
//! agreement) and the UDP hello.
//!
//! Sockets are opened through a [`Connector`]; inbound bytes are fed back in
//! by whoever reads them, tagged with the transport they came from so that
//! reads from a superseded transport are ignored.

use bytes::Bytes;
use quanta::Instant;
use std::io;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use crate::codec::{Compressor, KeyExchange, KeyPair};
use crate::config::TransportConfig;
use crate::connection::{Connection, Negotiation, Side};
use crate::control::{
    is_control, AuthResult, ControlMessage, SessionAuthAck, SessionAuthReq, AUTH_ACK, UDP_HELLO_ACK,
};
use crate::error::{CodecError, SendError};
use crate::event::{CloseReason, EventSink};
use crate::peer::{PeerId, PeerKind, PeerState, SessionId};
use crate::queue::QueuePool;
use crate::router::{same_transport, Channel, Transport};
use crate::session::{Session, SessionKey};
use crate::stats::ConnectionStats;
use crate::wire::{ReliableFrame, UnreliableFrame};

/// Opens sockets towards the server.
pub trait Connector: Send + Sync {
    /// Open the reliable stream.
    fn connect(&self) -> io::Result<Arc<dyn Transport>>;
    /// Open a datagram transport to the server's UDP `port`.
    fn open_udp(&self, port: u16) -> io::Result<Arc<dyn Transport>>;
}

#[derive(Default)]
struct Attempts {
    count: u32,
    next_at: Option<Instant>,
    session: Option<Arc<Session>>,
    keypair: Option<Box<dyn KeyPair>>,
}

pub struct Client {
    conn: Arc<Connection>,
    connector: Arc<dyn Connector>,
    key_exchange: Option<Arc<dyn KeyExchange>>,
    compressor: Option<Arc<dyn Compressor>>,
    attempts: Mutex<Attempts>,
}

impl Client {
    pub fn new(
        config: TransportConfig,
        connector: Arc<dyn Connector>,
        events: EventSink,
        now: Instant,
    ) -> Self {
        // one queue per channel
        let pool = QueuePool::new(2, 2, config.queue_slots, config.queue_bytes);
        let conn = Connection::new(Side::Client, PeerKind::Server, config, pool, events, now);
        Client {
            conn: Arc::new(conn),
            connector,
            key_exchange: None,
            compressor: None,
            attempts: Mutex::new(Attempts::default()),
        }
    }

    pub fn with_key_exchange(mut self, key_exchange: Arc<dyn KeyExchange>) -> Self {
        self.key_exchange = Some(key_exchange);
        self
    }

    pub fn with_compressor(mut self, compressor: Arc<dyn Compressor>) -> Self {
        self.compressor = Some(compressor);
        self
    }

    pub fn connection(&self) -> &Arc<Connection> {
        &self.conn
    }

    pub fn state(&self) -> PeerState {
        self.conn.state()
    }

    pub fn peer_id(&self) -> PeerId {
        self.conn.peer_id()
    }

    pub fn stats(&self) -> ConnectionStats {
        self.conn.stats()
    }

    fn lock(&self) -> MutexGuard<'_, Attempts> {
        self.attempts.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn is_current(&self, transport: &Arc<dyn Transport>) -> Option<Arc<Session>> {
        self.lock()
            .session
            .as_ref()
            .filter(|s| same_transport(s.transport(), transport))
            .cloned()
    }

    // ─── Connect ────────────────────────────────────────────────────────

    /// Start connecting. Returns false if already started.
    pub fn connect(&self, now: Instant) -> bool {
        if !self.conn.begin_connect(now) {
            return false;
        }
        tracing::info!("connecting");
        self.attempt(now);
        true
    }

    fn attempt(&self, now: Instant) {
        let config = self.conn.config();
        let reconnecting = self.conn.state() == PeerState::Reconnecting;
        let (limit, interval) = if reconnecting {
            (config.reconnect_attempts, config.reconnect_interval)
        } else {
            (config.connect_attempts, config.connect_interval)
        };

        let attempt = {
            let mut attempts = self.lock();
            if attempts.next_at.is_some_and(|at| now < at) {
                return;
            }
            if attempts.count >= limit {
                None
            } else {
                attempts.count += 1;
                attempts.next_at = Some(now + interval);
                Some(attempts.count)
            }
        };
        let Some(attempt) = attempt else {
            let reason = if reconnecting {
                CloseReason::ReconnectFailed
            } else {
                CloseReason::ConnectFailed
            };
            tracing::warn!(attempts = limit, %reason, "giving up");
            self.conn.close(reason, now);
            return;
        };

        match self.connector.connect() {
            Ok(transport) => self.on_transport_open(transport, now),
            Err(e) => tracing::debug!(attempt, limit, error = %e, "connect attempt failed"),
        }
    }

    fn on_transport_open(&self, transport: Arc<dyn Transport>, now: Instant) {
        let config = self.conn.config();
        let resuming = self.conn.has_connected();

        let keypair = match &self.key_exchange {
            Some(kx) if config.use_encrypt && !resuming => match kx.keypair() {
                Ok(kp) => Some(kp),
                Err(e) => {
                    tracing::warn!(error = %e, "cannot generate key pair");
                    transport.close();
                    self.conn
                        .close(CloseReason::HandshakeRejected(AuthResult::KeyExchangeFailed), now);
                    return;
                }
            },
            _ => None,
        };
        let req = SessionAuthReq {
            session_id: resuming.then(|| self.conn.session_id().0),
            peer_id: resuming.then(|| self.conn.peer_id().get()),
            client_public_key: keypair.as_ref().map(|kp| kp.public_key()).unwrap_or_default(),
            key_size: match (&self.key_exchange, &keypair) {
                (Some(kx), Some(_)) => kx.key_size(),
                _ => 0,
            },
        };

        let session = Arc::new(Session::new(
            SessionKey(0),
            Arc::clone(&transport),
            config.max_frame_bytes,
            None,
            now,
        ));
        {
            let mut attempts = self.lock();
            if let Some(old) = attempts.session.replace(Arc::clone(&session)) {
                old.close();
            }
            attempts.keypair = keypair;
        }

        if let Err(e) = self.conn.begin_handshake(transport, req, now) {
            tracing::warn!(error = %e, "cannot start handshake");
            session.close();
            self.lock().session = None;
        }
    }

    // ─── Inbound ────────────────────────────────────────────────────────

    /// Bytes read from the reliable stream `transport`.
    pub fn on_stream_data(&self, transport: &Arc<dyn Transport>, data: &[u8], now: Instant) {
        let Some(session) = self.is_current(transport) else {
            return;
        };
        let ingested = session.ingest(data);
        for frame in ingested.frames {
            if frame.protocol_id == AUTH_ACK && self.conn.state() == PeerState::Handshake {
                self.on_auth_ack(&session, frame, now);
            } else {
                self.conn.on_frame(frame, now);
            }
        }
        if let Some(e) = ingested.error {
            tracing::warn!(error = %e, "malformed stream");
            self.conn.close(CloseReason::ProtocolError, now);
        }
    }

    fn on_auth_ack(&self, session: &Session, frame: ReliableFrame, now: Instant) {
        let ack = match ControlMessage::decode(frame.protocol_id, frame.payload) {
            Ok(ControlMessage::AuthAck(ack)) => ack,
            Ok(_) | Err(_) => {
                tracing::warn!("malformed auth ack");
                self.conn.close(CloseReason::ProtocolError, now);
                return;
            }
        };
        if !ack.result.is_ok() {
            tracing::warn!(result = ?ack.result, "handshake rejected");
            self.conn.close(CloseReason::HandshakeRejected(ack.result), now);
            return;
        }

        let resumed = self.conn.has_connected() && ack.session_id == self.conn.session_id().0;
        let negotiation = if resumed {
            None
        } else {
            let keypair = self.lock().keypair.take();
            match self.negotiate(&ack, keypair) {
                Ok(n) => Some(n),
                Err(e) => {
                    tracing::warn!(error = %e, "key agreement failed");
                    self.conn
                        .close(CloseReason::HandshakeRejected(AuthResult::KeyExchangeFailed), now);
                    return;
                }
            }
        };

        {
            let mut attempts = self.lock();
            attempts.count = 0;
            attempts.next_at = None;
        }
        let peer_id = PeerId(ack.peer_id);
        session.bind(peer_id);
        session.set_max_frame_bytes(ack.max_frame_bytes as usize);
        if !self.conn.complete_handshake(negotiation, now) {
            return;
        }

        if self.conn.config().udp_enabled && ack.udp_open_port != 0 {
            match self.connector.open_udp(ack.udp_open_port) {
                Ok(udp) => {
                    if let Err(e) = self.conn.begin_udp(udp, now) {
                        tracing::warn!(%peer_id, error = %e, "udp setup failed");
                    }
                }
                Err(e) => tracing::warn!(%peer_id, error = %e, "cannot open udp socket"),
            }
        }
    }

    fn negotiate(
        &self,
        ack: &SessionAuthAck,
        keypair: Option<Box<dyn KeyPair>>,
    ) -> Result<Negotiation, CodecError> {
        let encryptor = if ack.use_encrypt {
            let keypair = keypair.ok_or(CodecError::MissingKey)?;
            let remote = ack.server_public_key.as_ref().ok_or(CodecError::MissingKey)?;
            Some(keypair.agree(remote)?)
        } else {
            None
        };
        Ok(Negotiation {
            peer_id: PeerId(ack.peer_id),
            session_id: SessionId(ack.session_id),
            max_frame_bytes: ack.max_frame_bytes as usize,
            send_timeout: Duration::from_millis(ack.send_timeout_ms as u64),
            max_retries: ack.max_retry_count as u32,
            encryptor,
            compressor: self.compressor.clone(),
            use_compress: ack.use_compress,
            compression_threshold: ack.compression_threshold as usize,
        })
    }

    /// One datagram from the server.
    pub fn on_datagram(&self, data: Bytes, now: Instant) {
        let frame = match UnreliableFrame::decode(data) {
            Ok(frame) => frame,
            Err(e) => {
                tracing::debug!(error = %e, "malformed datagram dropped");
                return;
            }
        };
        if frame.protocol_id == UDP_HELLO_ACK {
            match ControlMessage::decode(frame.protocol_id, frame.payload) {
                Ok(ControlMessage::UdpHelloAck(ack)) => self.conn.on_udp_hello_ack(ack),
                _ => tracing::debug!("malformed udp hello ack"),
            }
        } else if !is_control(frame.protocol_id) {
            self.conn.on_datagram(frame, now);
        }
    }

    /// The reliable stream `transport` ended, with the error that ended it.
    pub fn on_stream_closed(&self, transport: &Arc<dyn Transport>, err: Option<io::Error>, now: Instant) {
        if self.is_current(transport).is_none() {
            return;
        }
        if let Some(e) = &err {
            self.conn.report_socket_error(e);
        }
        self.lock().session = None;
        self.conn.on_transport_lost(transport, now);
    }

    // ─── Tick ───────────────────────────────────────────────────────────

    pub fn tick(&self, now: Instant) {
        match self.conn.state() {
            PeerState::Connecting | PeerState::Reconnecting => self.attempt(now),
            PeerState::Handshake => {
                if self.conn.state_age(now) < self.conn.config().handshake_timeout {
                    return;
                }
                if self.conn.has_connected() {
                    // counts as a failed reconnect attempt
                    tracing::debug!("resume handshake timed out");
                    let session = self.lock().session.take();
                    if let Some(session) = session {
                        self.conn.on_transport_lost(session.transport(), now);
                    }
                } else {
                    tracing::warn!("handshake timed out");
                    self.conn.close(CloseReason::HandshakeTimeout, now);
                }
            }
            _ => self.conn.tick(now),
        }
    }

    // ─── Send / Close ───────────────────────────────────────────────────

    pub fn send(
        &self,
        channel: Channel,
        protocol_id: u16,
        payload: Bytes,
        now: Instant,
    ) -> Result<(), SendError> {
        self.conn.send(channel, protocol_id, payload, now)
    }

    pub fn close(&self, now: Instant) {
        self.conn.close(CloseReason::Normal, now);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::control::{SessionAuthAck, AUTH_REQ, CLOSE};
    use crate::event::PeerEvent;
    use crate::loopback::MemoryTransport;
    use crate::wire::FrameDecoder;
    use crossbeam_channel::Receiver;

    struct Dialer {
        tcp: Mutex<Vec<Arc<MemoryTransport>>>,
        refuse: bool,
    }

    impl Dialer {
        fn new(refuse: bool) -> Arc<Self> {
            Arc::new(Dialer {
                tcp: Mutex::new(Vec::new()),
                refuse,
            })
        }

        fn last(&self) -> Arc<MemoryTransport> {
            self.tcp.lock().unwrap().last().cloned().unwrap()
        }

        fn dialed(&self) -> usize {
            self.tcp.lock().unwrap().len()
        }
    }

    impl Connector for Dialer {
        fn connect(&self) -> io::Result<Arc<dyn Transport>> {
            if self.refuse {
                return Err(io::ErrorKind::ConnectionRefused.into());
            }
            let t = MemoryTransport::new(Channel::Reliable);
            self.tcp.lock().unwrap().push(t.clone());
            Ok(t)
        }

        fn open_udp(&self, _port: u16) -> io::Result<Arc<dyn Transport>> {
            Ok(MemoryTransport::new(Channel::Unreliable))
        }
    }

    fn config() -> TransportConfig {
        TransportConfig {
            connect_attempts: 2,
            reconnect_attempts: 2,
            udp_enabled: false,
            auto_ping: false,
            keep_alive: false,
            ..TransportConfig::default()
        }
    }

    fn client(refuse: bool) -> (Client, Arc<Dialer>, Receiver<PeerEvent>, Instant) {
        let now = Instant::now();
        let dialer = Dialer::new(refuse);
        let (events, rx) = EventSink::new();
        (Client::new(config(), dialer.clone(), events, now), dialer, rx, now)
    }

    fn ok_ack(session_id: u64) -> Bytes {
        ControlMessage::AuthAck(SessionAuthAck {
            result: AuthResult::Ok,
            session_id,
            peer_id: 7,
            max_frame_bytes: 64 * 1024,
            send_timeout_ms: 3000,
            max_retry_count: 5,
            server_public_key: None,
            use_encrypt: false,
            use_compress: false,
            compression_threshold: 0,
            udp_open_port: 0,
        })
        .to_frame()
        .to_bytes()
    }

    fn control_ids(raw: Bytes) -> Vec<u16> {
        let mut dec = FrameDecoder::new(1 << 20);
        dec.extend(&raw);
        std::iter::from_fn(|| dec.next_frame().unwrap())
            .map(|f| f.protocol_id)
            .collect()
    }

    #[test]
    fn handshake_opens_and_fires_connected_once() {
        let (client, dialer, rx, now) = client(false);
        assert!(client.connect(now));
        assert!(!client.connect(now));
        assert_eq!(client.state(), PeerState::Handshake);
        let tcp = dialer.last();
        assert_eq!(control_ids(tcp.take_stream()), vec![AUTH_REQ]);

        let t: Arc<dyn Transport> = tcp.clone();
        client.on_stream_data(&t, &ok_ack(99), now);
        assert_eq!(client.state(), PeerState::Open);
        assert_eq!(client.peer_id(), PeerId(7));
        let connected = rx
            .try_iter()
            .filter(|e| matches!(e, PeerEvent::Connected { .. }))
            .count();
        assert_eq!(connected, 1);
    }

    #[test]
    fn rejection_closes_with_result() {
        let (client, dialer, rx, now) = client(false);
        client.connect(now);
        let t: Arc<dyn Transport> = dialer.last();
        let nack = ControlMessage::AuthAck(SessionAuthAck::rejected(AuthResult::ServerFull))
            .to_frame()
            .to_bytes();
        client.on_stream_data(&t, &nack, now);
        assert_eq!(client.state(), PeerState::Closed);
        assert!(rx.try_iter().any(|e| matches!(
            e,
            PeerEvent::Disconnected {
                reason: CloseReason::HandshakeRejected(AuthResult::ServerFull),
                ..
            }
        )));
    }

    #[test]
    fn gives_up_after_connect_attempts() {
        let (client, _dialer, rx, now) = client(true);
        client.connect(now);
        assert_eq!(client.state(), PeerState::Connecting);
        client.tick(now + Duration::from_millis(500));
        client.tick(now + Duration::from_secs(1));
        assert_eq!(client.state(), PeerState::Connecting);
        client.tick(now + Duration::from_secs(2));
        assert_eq!(client.state(), PeerState::Closed);
        assert!(rx
            .try_iter()
            .any(|e| matches!(e, PeerEvent::Disconnected { reason: CloseReason::ConnectFailed, .. })));
    }

    #[test]
    fn first_handshake_timeout_closes() {
        let (client, _dialer, _rx, now) = client(false);
        client.connect(now);
        client.tick(now + Duration::from_secs(5));
        assert_eq!(client.state(), PeerState::Closed);
    }

    #[test]
    fn reconnect_resumes_session_and_flushes_queue() {
        let (client, dialer, _rx, now) = client(false);
        client.connect(now);
        let first: Arc<dyn Transport> = dialer.last();
        client.on_stream_data(&first, &ok_ack(99), now);

        client.on_stream_closed(&first, None, now);
        assert_eq!(client.state(), PeerState::Reconnecting);
        client
            .send(Channel::Reliable, 1, Bytes::from_static(b"later"), now)
            .unwrap();
        // stale reads from the dead transport are ignored
        client.on_stream_data(&first, &ok_ack(99), now);
        assert_eq!(client.state(), PeerState::Reconnecting);

        client.tick(now);
        assert_eq!(dialer.dialed(), 2);
        let second = dialer.last();
        let raw = second.take_stream();
        let mut dec = FrameDecoder::new(1 << 20);
        dec.extend(&raw);
        let req = match dec.next_frame().unwrap() {
            Some(f) => ControlMessage::decode(f.protocol_id, f.payload).unwrap(),
            None => panic!("no auth request"),
        };
        assert!(matches!(
            req,
            ControlMessage::AuthReq(SessionAuthReq { session_id: Some(99), peer_id: Some(7), .. })
        ));

        let t: Arc<dyn Transport> = second.clone();
        client.on_stream_data(&t, &ok_ack(99), now);
        assert_eq!(client.state(), PeerState::Open);
        assert_eq!(client.stats().in_flight, 1);
        assert_eq!(client.stats().pending, 0);
    }

    #[test]
    fn reset_stream_reconnects_quietly() {
        let (client, dialer, rx, now) = client(false);
        client.connect(now);
        let t: Arc<dyn Transport> = dialer.last();
        client.on_stream_data(&t, &ok_ack(5), now);
        rx.try_iter().for_each(drop);

        client.on_stream_closed(&t, Some(io::ErrorKind::ConnectionReset.into()), now);
        assert_eq!(client.state(), PeerState::Reconnecting);
        let events: Vec<_> = rx.try_iter().collect();
        assert!(!events.iter().any(|e| matches!(e, PeerEvent::Error { .. })));
        assert!(events.iter().any(|e| matches!(e, PeerEvent::Offline { .. })));
    }

    #[test]
    fn unexpected_socket_error_is_reported_then_reconnects() {
        let (client, dialer, rx, now) = client(false);
        client.connect(now);
        let t: Arc<dyn Transport> = dialer.last();
        client.on_stream_data(&t, &ok_ack(5), now);
        rx.try_iter().for_each(drop);

        client.on_stream_closed(&t, Some(io::ErrorKind::PermissionDenied.into()), now);
        assert_eq!(client.state(), PeerState::Reconnecting);
        let events: Vec<_> = rx.try_iter().collect();
        assert!(events.iter().any(|e| matches!(
            e,
            PeerEvent::Error { peer_id, message } if *peer_id == PeerId(7) && !message.is_empty()
        )));
    }

    #[test]
    fn error_on_stale_stream_is_not_reported() {
        let (client, dialer, rx, now) = client(false);
        client.connect(now);
        let first: Arc<dyn Transport> = dialer.last();
        client.on_stream_data(&first, &ok_ack(5), now);
        client.on_stream_closed(&first, None, now);
        rx.try_iter().for_each(drop);

        client.on_stream_closed(&first, Some(io::ErrorKind::PermissionDenied.into()), now);
        assert_eq!(client.state(), PeerState::Reconnecting);
        assert!(!rx.try_iter().any(|e| matches!(e, PeerEvent::Error { .. })));
    }

    #[test]
    fn close_sends_close_frame() {
        let (client, dialer, _rx, now) = client(false);
        client.connect(now);
        let tcp = dialer.last();
        let t: Arc<dyn Transport> = tcp.clone();
        client.on_stream_data(&t, &ok_ack(1), now);
        tcp.take_sent();
        client.close(now);
        assert_eq!(client.state(), PeerState::Closing);
        assert_eq!(control_ids(tcp.take_stream()), vec![CLOSE]);
    }
}

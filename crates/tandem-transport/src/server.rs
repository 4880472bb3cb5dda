//! # Server
//!
//! The accepting side. Owns the peer registries and drives admission,
//! authentication, resumption, and the control-plane sweeps.
//!
//! ## Registries
//!
//! | Map          | Key          | Holds                                      |
//! |--------------|--------------|--------------------------------------------|
//! | `sessions`   | `SessionKey` | every accepted stream, bound or not        |
//! | `peers`      | `PeerId`     | every peer not yet removed                 |
//! | `waiting`    | `PeerId`     | when each `Offline` peer was parked        |
//! | `by_session` | `SessionId`  | peer lookup for resuming clients           |
//!
//! Ticks and sweeps snapshot the map before acting, so a peer removed or
//! admitted mid-pass is never touched through a live map guard.
//!
//! A peer id goes back to the allocator only once its connection is
//! `Closed` and both its send and receive paths are idle.

use bytes::Bytes;
use dashmap::DashMap;
use quanta::Instant;
use serde::Serialize;
use std::io;
use std::sync::atomic::{AtomicBool, AtomicU16, AtomicU64, Ordering};
use std::sync::Arc;

use crate::codec::{Compressor, Encryptor, KeyExchange};
use crate::config::TransportConfig;
use crate::connection::{Connection, Negotiation, Side};
use crate::control::{
    is_control, AuthResult, ControlMessage, SessionAuthAck, SessionAuthReq, UdpHelloAck,
    UdpHelloReq, AUTH_REQ, UDP_HELLO_REQ,
};
use crate::error::{AdmissionError, CodecError, SendError};
use crate::event::{CloseReason, EventSink};
use crate::peer::{PeerId, PeerIdAllocator, PeerKind, PeerState, SessionId};
use crate::queue::QueuePool;
use crate::router::{Channel, Transport};
use crate::session::{Session, SessionKey};
use crate::stats::ConnectionStats;
use crate::wire::UnreliableFrame;

/// What one control-plane sweep did.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct SweepReport {
    /// Streams that never completed a handshake.
    pub handshake_expired: usize,
    pub waiting_expired: usize,
    pub idle_closed: usize,
    /// Peers fully removed and their ids released.
    pub removed: usize,
}

impl SweepReport {
    fn is_empty(&self) -> bool {
        *self == SweepReport::default()
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ServerStats {
    pub sessions: usize,
    pub peers: usize,
    pub waiting: usize,
    pub queues_created: usize,
    pub queues_outstanding: usize,
    pub connections: Vec<ConnectionStats>,
}

pub struct Server {
    config: TransportConfig,
    ids: PeerIdAllocator,
    pool: QueuePool,
    events: EventSink,
    key_exchange: Option<Arc<dyn KeyExchange>>,
    compressor: Option<Arc<dyn Compressor>>,
    udp_port: AtomicU16,
    next_key: AtomicU64,
    shutting_down: AtomicBool,
    sessions: DashMap<SessionKey, Arc<Session>>,
    peers: DashMap<u32, Arc<Connection>>,
    waiting: DashMap<u32, Instant>,
    by_session: DashMap<u64, PeerId>,
}

impl Server {
    pub fn new(config: TransportConfig, events: EventSink) -> Self {
        let pool = QueuePool::new(
            config.pool_min,
            config.pool_max,
            config.queue_slots,
            config.queue_bytes,
        );
        Server {
            ids: PeerIdAllocator::new(config.max_peers),
            pool,
            events,
            key_exchange: None,
            compressor: None,
            udp_port: AtomicU16::new(0),
            next_key: AtomicU64::new(1),
            shutting_down: AtomicBool::new(false),
            sessions: DashMap::new(),
            peers: DashMap::new(),
            waiting: DashMap::new(),
            by_session: DashMap::new(),
            config,
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

    pub fn config(&self) -> &TransportConfig {
        &self.config
    }

    /// UDP port announced to clients in the auth ack; 0 disables UDP.
    pub fn set_udp_port(&self, port: u16) {
        self.udp_port.store(port, Ordering::Release);
    }

    pub fn udp_port(&self) -> u16 {
        self.udp_port.load(Ordering::Acquire)
    }

    pub fn connection(&self, peer_id: PeerId) -> Option<Arc<Connection>> {
        self.peers.get(&peer_id.get()).map(|e| Arc::clone(e.value()))
    }

    /// Peers not yet closed, parked ones included.
    pub fn peer_count(&self) -> usize {
        self.peers
            .iter()
            .filter(|e| !e.value().state().is_terminal())
            .count()
    }

    pub fn waiting_count(&self) -> usize {
        self.waiting.len()
    }

    pub fn session_count(&self) -> usize {
        self.sessions.len()
    }

    pub fn pool(&self) -> &QueuePool {
        &self.pool
    }

    // ─── Admission ──────────────────────────────────────────────────────

    /// Admit a freshly accepted stream. Rejected when the queue pool is
    /// exhausted; the transport is closed in that case.
    pub fn accept(&self, transport: Arc<dyn Transport>, now: Instant) -> Result<SessionKey, AdmissionError> {
        if self.shutting_down.load(Ordering::Acquire) {
            transport.close();
            return Err(AdmissionError::ShuttingDown);
        }
        if transport.channel() != Channel::Reliable {
            return Err(AdmissionError::WrongChannel);
        }
        let queue = match self.pool.rent() {
            Ok(queue) => queue,
            Err(e) => {
                tracing::warn!(remote = %transport.describe(), error = %e, "rejecting connection");
                transport.close();
                return Err(e.into());
            }
        };
        let key = SessionKey(self.next_key.fetch_add(1, Ordering::Relaxed));
        let session = Session::new(key, transport, self.config.max_frame_bytes, Some(queue), now);
        tracing::debug!(session = key.0, remote = %session.transport().describe(), "stream accepted");
        self.sessions.insert(key, Arc::new(session));
        Ok(key)
    }

    fn session(&self, key: SessionKey) -> Option<Arc<Session>> {
        self.sessions.get(&key).map(|e| Arc::clone(e.value()))
    }

    fn drop_session(&self, session: &Session) {
        session.close();
        self.sessions.remove(&session.key());
    }

    /// The peer `session` is bound to, if the session is still that peer's
    /// live transport.
    fn live_binding(&self, session: &Session, peer_id: PeerId) -> Option<Arc<Connection>> {
        self.connection(peer_id)
            .filter(|conn| conn.router().is_bound_to(Channel::Reliable, session.transport()))
    }

    // ─── Inbound Stream ─────────────────────────────────────────────────

    /// Bytes read from the stream of session `key`.
    pub fn on_stream_data(&self, key: SessionKey, data: &[u8], now: Instant) {
        let Some(session) = self.session(key) else {
            return;
        };
        let ingested = session.ingest(data);
        for frame in ingested.frames {
            if session.is_closed() {
                return;
            }
            match session.peer() {
                None if frame.protocol_id == AUTH_REQ => self.handle_auth(&session, frame.payload, now),
                None => {
                    tracing::warn!(session = key.0, protocol_id = frame.protocol_id, "frame before auth");
                    self.drop_session(&session);
                    return;
                }
                Some(peer_id) => match self.live_binding(&session, peer_id) {
                    Some(conn) => conn.on_frame(frame, now),
                    None => {
                        tracing::debug!(session = key.0, %peer_id, "dropping superseded stream");
                        self.drop_session(&session);
                        return;
                    }
                },
            }
        }
        if let Some(e) = ingested.error {
            tracing::warn!(session = key.0, error = %e, "malformed stream");
            match session.peer().and_then(|id| self.live_binding(&session, id)) {
                Some(conn) => conn.close(CloseReason::ProtocolError, now),
                None => self.drop_session(&session),
            }
        }
    }

    /// The stream of session `key` ended.
    pub fn on_stream_closed(&self, key: SessionKey, err: Option<io::Error>, now: Instant) {
        let Some((_, session)) = self.sessions.remove(&key) else {
            return;
        };
        session.close();
        let Some(peer_id) = session.peer() else {
            return;
        };
        let Some(conn) = self.connection(peer_id) else {
            return;
        };
        if let Some(e) = &err {
            if conn.router().is_bound_to(Channel::Reliable, session.transport()) {
                conn.report_socket_error(e);
            }
        }
        if conn.on_transport_lost(session.transport(), now) {
            self.park_if_offline(&conn, now);
        }
    }

    fn park_if_offline(&self, conn: &Connection, now: Instant) {
        if conn.state() == PeerState::Offline {
            self.waiting.entry(conn.peer_id().get()).or_insert(now);
        }
    }

    // ─── Handshake ──────────────────────────────────────────────────────

    fn handle_auth(&self, session: &Session, body: Bytes, now: Instant) {
        let req = match ControlMessage::decode(AUTH_REQ, body) {
            Ok(ControlMessage::AuthReq(req)) => req,
            _ => return self.reject(session, AuthResult::InvalidRequest),
        };
        if self.shutting_down.load(Ordering::Acquire) {
            return self.reject(session, AuthResult::Rejected);
        }
        if req.session_id.is_some() || req.peer_id.is_some() {
            self.resume(session, &req, now);
        } else {
            self.admit(session, &req, now);
        }
    }

    fn reject(&self, session: &Session, result: AuthResult) {
        tracing::warn!(session = session.key().0, ?result, "handshake rejected");
        let nack = ControlMessage::AuthAck(SessionAuthAck::rejected(result))
            .to_frame()
            .to_bytes();
        if let Err(e) = session.transport().send(&nack) {
            tracing::debug!(session = session.key().0, error = %e, "rejection not delivered");
        }
        self.drop_session(session);
    }

    fn ack_for(&self, peer_id: PeerId, session_id: SessionId, server_key: Option<Bytes>, compress: bool) -> SessionAuthAck {
        SessionAuthAck {
            result: AuthResult::Ok,
            session_id: session_id.0,
            peer_id: peer_id.get(),
            max_frame_bytes: self.config.max_frame_bytes as u32,
            send_timeout_ms: self.config.send_timeout.as_millis() as u32,
            max_retry_count: self.config.max_retry_count as u16,
            use_encrypt: server_key.is_some(),
            server_public_key: server_key,
            use_compress: compress,
            compression_threshold: self.config.compression_threshold as u32,
            udp_open_port: if self.config.udp_enabled { self.udp_port() } else { 0 },
        }
    }

    fn agree(&self, req: &SessionAuthReq) -> Result<(Box<dyn Encryptor>, Bytes), CodecError> {
        let kx = self.key_exchange.as_ref().ok_or(CodecError::MissingKey)?;
        if req.client_public_key.is_empty() {
            return Err(CodecError::MissingKey);
        }
        let keypair = kx.keypair()?;
        let public = keypair.public_key();
        Ok((keypair.agree(&req.client_public_key)?, public))
    }

    fn admit(&self, session: &Session, req: &SessionAuthReq, now: Instant) {
        let (encryptor, server_key) = if self.config.use_encrypt {
            match self.agree(req) {
                Ok((enc, public)) => (Some(enc), Some(public)),
                Err(e) => {
                    tracing::warn!(session = session.key().0, error = %e, "key agreement failed");
                    return self.reject(session, AuthResult::KeyExchangeFailed);
                }
            }
        } else {
            (None, None)
        };
        let Some(peer_id) = self.ids.allocate() else {
            tracing::warn!(limit = self.config.max_peers, "server full");
            return self.reject(session, AuthResult::ServerFull);
        };
        let session_id = loop {
            let id = SessionId::generate();
            if !self.by_session.contains_key(&id.0) {
                break id;
            }
        };

        let conn = Arc::new(Connection::new(
            Side::Server,
            PeerKind::User,
            self.config.clone(),
            self.pool.clone(),
            self.events.clone(),
            now,
        ));
        if let Some(queue) = session.take_queue() {
            conn.install_queue(queue);
        }
        let compress = self.config.use_compress && self.compressor.is_some();
        let ack = self.ack_for(peer_id, session_id, server_key, compress);
        let negotiation = Negotiation {
            peer_id,
            session_id,
            max_frame_bytes: self.config.max_frame_bytes,
            send_timeout: self.config.send_timeout,
            max_retries: self.config.max_retry_count,
            encryptor,
            compressor: self.compressor.clone(),
            use_compress: compress,
            compression_threshold: self.config.compression_threshold,
        };

        session.bind(peer_id);
        self.peers.insert(peer_id.get(), Arc::clone(&conn));
        self.by_session.insert(session_id.0, peer_id);
        if let Err(e) = conn.establish(Arc::clone(session.transport()), negotiation, ack, now) {
            tracing::warn!(%peer_id, error = %e, "cannot establish peer");
            self.peers.remove(&peer_id.get());
            self.by_session.remove(&session_id.0);
            self.ids.release(peer_id);
            self.drop_session(session);
        }
    }

    fn resume(&self, session: &Session, req: &SessionAuthReq, now: Instant) {
        let by_session = req
            .session_id
            .and_then(|sid| self.by_session.get(&sid).map(|e| *e.value()));
        let by_peer = || {
            req.peer_id
                .map(PeerId)
                .filter(|id| self.waiting.contains_key(&id.get()))
        };
        let Some(peer_id) = by_session.or_else(by_peer) else {
            return self.reject(session, AuthResult::PeerNotFound);
        };
        if req.peer_id.is_some_and(|claimed| claimed != peer_id.get()) {
            return self.reject(session, AuthResult::InvalidRequest);
        }
        let Some(conn) = self.connection(peer_id) else {
            return self.reject(session, AuthResult::PeerNotFound);
        };
        if self.expire_if_due(peer_id, &conn, now) {
            return self.reject(session, AuthResult::PeerNotFound);
        }
        if !matches!(conn.state(), PeerState::Offline | PeerState::Open) {
            return self.reject(session, AuthResult::PeerNotFound);
        }

        let compress = self.config.use_compress && self.compressor.is_some();
        let ack = self.ack_for(peer_id, conn.session_id(), None, compress);
        session.bind(peer_id);
        match conn.restore(Arc::clone(session.transport()), ack, now) {
            Ok(previous) => {
                self.waiting.remove(&peer_id.get());
                // the restored connection keeps the queue it already owns
                drop(session.take_queue());
                if let Some(previous) = previous {
                    previous.close();
                }
            }
            Err(e) => {
                tracing::warn!(%peer_id, error = %e, "cannot restore peer");
                self.drop_session(session);
            }
        }
    }

    /// Close a parked peer whose waiting window has run out.
    fn expire_if_due(&self, peer_id: PeerId, conn: &Connection, now: Instant) -> bool {
        let due = self.waiting.get(&peer_id.get()).is_some_and(|since| {
            now.saturating_duration_since(*since) >= self.config.waiting_reconnect_timeout
        });
        if due {
            self.waiting.remove(&peer_id.get());
            tracing::info!(%peer_id, "waiting window expired");
            conn.close(CloseReason::WaitingExpired, now);
        }
        due
    }

    // ─── Datagrams ──────────────────────────────────────────────────────

    /// One datagram; `reply` reaches its source address.
    pub fn on_datagram(&self, data: Bytes, reply: Arc<dyn Transport>, now: Instant) {
        let frame = match UnreliableFrame::decode(data) {
            Ok(frame) => frame,
            Err(e) => {
                tracing::debug!(error = %e, "malformed datagram dropped");
                return;
            }
        };
        if frame.protocol_id == UDP_HELLO_REQ {
            match ControlMessage::decode(frame.protocol_id, frame.payload) {
                Ok(ControlMessage::UdpHelloReq(req)) => self.on_udp_hello(req, reply, now),
                _ => tracing::debug!("malformed udp hello"),
            }
            return;
        }
        if is_control(frame.protocol_id) {
            return;
        }
        let peer_id = PeerId(frame.peer_id);
        match self.connection(peer_id) {
            Some(conn) if conn.router().is_bound_to(Channel::Unreliable, &reply) => {
                conn.on_datagram(frame, now)
            }
            _ => tracing::debug!(%peer_id, "datagram from unknown source"),
        }
    }

    fn on_udp_hello(&self, req: UdpHelloReq, reply: Arc<dyn Transport>, now: Instant) {
        let peer_id = PeerId(req.peer_id);
        let accepted = self
            .connection(peer_id)
            .is_some_and(|conn| conn.accept_udp(Arc::clone(&reply), &req, now));
        if accepted {
            tracing::debug!(%peer_id, "udp channel bound");
            return;
        }
        tracing::debug!(%peer_id, "udp hello refused");
        let nack = ControlMessage::UdpHelloAck(UdpHelloAck {
            result: AuthResult::PeerNotFound,
            negotiated_mtu: 0,
        })
        .to_datagram(req.peer_id)
        .to_bytes();
        let _ = reply.send(&nack);
    }

    // ─── Tick & Sweep ───────────────────────────────────────────────────

    fn snapshot(&self, index: usize, count: usize) -> Vec<Arc<Connection>> {
        let count = count.max(1);
        self.peers
            .iter()
            .filter(|e| *e.key() as usize % count == index)
            .map(|e| Arc::clone(e.value()))
            .collect()
    }

    /// Tick the peers whose id maps to worker `index` of `count`.
    pub fn tick_partition(&self, index: usize, count: usize, now: Instant) {
        for conn in self.snapshot(index, count) {
            conn.tick(now);
            self.park_if_offline(&conn, now);
        }
    }

    pub fn tick(&self, now: Instant) {
        self.tick_partition(0, 1, now);
    }

    /// Control-plane cleanup: stale handshakes, expired waiting windows,
    /// idle peers, and removal of fully closed peers.
    pub fn sweep(&self, now: Instant) -> SweepReport {
        let mut report = SweepReport::default();

        let stale: Vec<Arc<Session>> = self
            .sessions
            .iter()
            .filter(|e| {
                let s = e.value();
                s.is_closed()
                    || (s.peer().is_none()
                        && now.saturating_duration_since(s.opened_at()) >= self.config.handshake_timeout)
            })
            .map(|e| Arc::clone(e.value()))
            .collect();
        for session in stale {
            if !session.is_closed() {
                tracing::debug!(session = session.key().0, "handshake timed out");
                report.handshake_expired += 1;
            }
            self.drop_session(&session);
        }

        for conn in self.snapshot(0, 1) {
            let peer_id = conn.peer_id();
            match conn.state() {
                PeerState::Offline => {
                    self.park_if_offline(&conn, now);
                    if self.expire_if_due(peer_id, &conn, now) {
                        report.waiting_expired += 1;
                    }
                }
                PeerState::Open => {
                    let silent = now.saturating_duration_since(conn.last_activity());
                    if silent >= self.config.idle_timeout {
                        tracing::info!(%peer_id, silent_ms = silent.as_millis() as u64, "idle timeout");
                        conn.close(CloseReason::IdleTimeout, now);
                        report.idle_closed += 1;
                    }
                }
                _ => {}
            }
            if conn.state() == PeerState::Closed && conn.is_quiescent() {
                self.remove_peer(&conn);
                report.removed += 1;
            }
        }

        if !report.is_empty() {
            tracing::info!(
                handshake_expired = report.handshake_expired,
                waiting_expired = report.waiting_expired,
                idle_closed = report.idle_closed,
                removed = report.removed,
                "sweep"
            );
        }
        report
    }

    fn remove_peer(&self, conn: &Connection) {
        let peer_id = conn.peer_id();
        self.peers.remove(&peer_id.get());
        self.waiting.remove(&peer_id.get());
        self.by_session.remove(&conn.session_id().0);
        self.sessions.retain(|_, s| {
            if s.peer() == Some(peer_id) {
                s.close();
                false
            } else {
                true
            }
        });
        self.ids.release(peer_id);
        tracing::debug!(%peer_id, "peer removed");
    }

    // ─── Send / Close ───────────────────────────────────────────────────

    pub fn send(
        &self,
        peer_id: PeerId,
        channel: Channel,
        protocol_id: u16,
        payload: Bytes,
        now: Instant,
    ) -> Result<(), SendError> {
        self.connection(peer_id)
            .ok_or(SendError::UnknownPeer(peer_id))?
            .send(channel, protocol_id, payload, now)
    }

    pub fn close_peer(&self, peer_id: PeerId, now: Instant) -> bool {
        match self.connection(peer_id) {
            Some(conn) => {
                conn.close(CloseReason::Normal, now);
                true
            }
            None => false,
        }
    }

    /// Stop admitting and close every peer. Closed peers are removed by
    /// later sweeps.
    pub fn shutdown(&self, now: Instant) {
        if self.shutting_down.swap(true, Ordering::AcqRel) {
            return;
        }
        tracing::info!(peers = self.peers.len(), "shutting down");
        for conn in self.snapshot(0, 1) {
            conn.close(CloseReason::Shutdown, now);
        }
        let unbound: Vec<_> = self
            .sessions
            .iter()
            .filter(|e| e.value().peer().is_none())
            .map(|e| Arc::clone(e.value()))
            .collect();
        for session in unbound {
            self.drop_session(&session);
        }
    }

    pub fn is_shutting_down(&self) -> bool {
        self.shutting_down.load(Ordering::Acquire)
    }

    pub fn stats(&self) -> ServerStats {
        let mut connections: Vec<_> = self.snapshot(0, 1).iter().map(|c| c.stats()).collect();
        connections.sort_by_key(|s| s.peer_id);
        ServerStats {
            sessions: self.sessions.len(),
            peers: self.peers.len(),
            waiting: self.waiting.len(),
            queues_created: self.pool.created(),
            queues_outstanding: self.pool.outstanding(),
            connections,
        }
    }
}

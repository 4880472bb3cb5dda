//! # Peer Connection
//!
//! One [`Connection`] per peer, shared by the client and server roles. It
//! owns the delivery state (sequence counter, in-flight set, reorder
//! buffer), the payload codec and the channel router, and drives them
//! through the peer lifecycle:
//!
//! ```text
//!   None ──▶ Connecting ──▶ Handshake ──▶ Open ──▶ Closing ──▶ Closed
//!                ▲              │          │ ▲
//!                │              ▼          ▼ │
//!                └──────── Reconnecting (client)
//!                                     Offline (server)
//! ```
//!
//! Every transition is a compare-and-swap on the state code; a transition
//! from a state other than the expected one does nothing. Transitions that
//! change whether reliable sends go out or wait (into and out of `Open`)
//! happen with the delivery lock held, so a concurrent `send` either sees
//! the old state and queues, or the new one and transmits.
//!
//! Nothing here blocks on a socket. Bytes are queued on the router while the
//! lock is held and written after it is released.

use bytes::Bytes;
use quanta::Instant;
use std::fmt;
use std::io;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use crate::codec::{Compressor, Encryptor, PayloadCodec};
use crate::config::TransportConfig;
use crate::control::{
    is_control, ControlMessage, MessageAck, Ping, Pong, SessionAuthAck, SessionAuthReq,
    UdpHelloAck, UdpHelloReq,
};
use crate::delivery::{AckOutcome, PendingMessage, Receipt, ReliableSender, ReorderBuffer, RetrySchedule};
use crate::error::{is_ignorable, RouterError, SendError};
use crate::event::{CloseReason, EventSink, PeerEvent};
use crate::fragment::{Fragmenter, Reassembler, ReassemblyLimits};
use crate::peer::{AtomicPeerState, PeerId, PeerKind, PeerState, SessionId};
use crate::queue::{PooledQueue, QueuePool};
use crate::router::{Channel, ChannelRouter, Transport};
use crate::stats::{ConnectionStats, QualityMonitor, ReceiverStats, RemoteReport};
use crate::wire::{MessageFlags, ReliableFrame, UnreliableFrame, VarInt, RELIABLE_MAX_HEADER};

/// Which end of the link this connection is.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Side {
    /// Dials out, reconnects on loss, sends pings.
    Client,
    /// Accepts, parks the peer on loss.
    Server,
}

/// Session parameters fixed by the handshake.
pub struct Negotiation {
    pub peer_id: PeerId,
    pub session_id: SessionId,
    pub max_frame_bytes: usize,
    pub send_timeout: Duration,
    pub max_retries: u32,
    pub encryptor: Option<Box<dyn Encryptor>>,
    pub compressor: Option<Arc<dyn Compressor>>,
    pub use_compress: bool,
    pub compression_threshold: usize,
}

impl fmt::Debug for Negotiation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Negotiation")
            .field("peer_id", &self.peer_id)
            .field("session_id", &self.session_id)
            .field("max_frame_bytes", &self.max_frame_bytes)
            .field("send_timeout", &self.send_timeout)
            .field("max_retries", &self.max_retries)
            .field("encrypt", &self.encryptor.is_some())
            .field("compress", &self.use_compress)
            .finish()
    }
}

struct Limits {
    max_frame_bytes: usize,
    send_timeout: Duration,
    max_retries: u32,
}

#[derive(Default)]
struct UdpLink {
    ready: bool,
    last_hello: Option<Instant>,
}

struct Inner {
    sender: ReliableSender,
    reorder: ReorderBuffer<ReliableFrame>,
    received: ReceiverStats,
    codec: PayloadCodec,
    fragmenter: Fragmenter,
    reassembler: Reassembler,
    quality: QualityMonitor,
    limits: Limits,
    udp: UdpLink,
    entered_at: Instant,
    last_recv: Instant,
    last_send: Instant,
    last_ping: Option<Instant>,
    ping_outstanding: bool,
    close_reason: Option<CloseReason>,
    close_deadline: Option<Instant>,
    handshakes: u32,
}

pub struct Connection {
    side: Side,
    kind: PeerKind,
    peer_id: AtomicU32,
    session_id: AtomicU64,
    state: AtomicPeerState,
    router: ChannelRouter,
    events: EventSink,
    config: TransportConfig,
    /// Origin of the microsecond clock carried in pings.
    epoch: Instant,
    inner: Mutex<Inner>,
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("side", &self.side)
            .field("peer_id", &self.peer_id())
            .field("state", &self.state())
            .field("router", &self.router)
            .finish()
    }
}

impl Connection {
    pub fn new(
        side: Side,
        kind: PeerKind,
        config: TransportConfig,
        pool: QueuePool,
        events: EventSink,
        now: Instant,
    ) -> Self {
        let inner = Inner {
            sender: ReliableSender::new(config.max_in_flight, config.max_pending),
            reorder: ReorderBuffer::new(config.reorder_capacity),
            received: ReceiverStats::new(),
            codec: PayloadCodec::plain(),
            fragmenter: Fragmenter::new(config.udp_mtu).with_max_message(config.max_frame_bytes),
            reassembler: Reassembler::new(config.fragment_timeout, ReassemblyLimits::from_config(&config)),
            quality: QualityMonitor::new(config.latency_window),
            limits: Limits {
                max_frame_bytes: config.max_frame_bytes,
                send_timeout: config.send_timeout,
                max_retries: config.max_retry_count,
            },
            udp: UdpLink::default(),
            entered_at: now,
            last_recv: now,
            last_send: now,
            last_ping: None,
            ping_outstanding: false,
            close_reason: None,
            close_deadline: None,
            handshakes: 0,
        };
        Connection {
            side,
            kind,
            peer_id: AtomicU32::new(0),
            session_id: AtomicU64::new(0),
            state: AtomicPeerState::new(PeerState::None),
            router: ChannelRouter::new(pool),
            events,
            config,
            epoch: now,
            inner: Mutex::new(inner),
        }
    }

    // ─── Accessors ──────────────────────────────────────────────────────

    pub fn side(&self) -> Side {
        self.side
    }

    pub fn kind(&self) -> PeerKind {
        self.kind
    }

    pub fn peer_id(&self) -> PeerId {
        PeerId(self.peer_id.load(Ordering::Acquire))
    }

    pub fn session_id(&self) -> SessionId {
        SessionId(self.session_id.load(Ordering::Acquire))
    }

    pub fn state(&self) -> PeerState {
        self.state.load()
    }

    pub fn router(&self) -> &ChannelRouter {
        &self.router
    }

    pub fn config(&self) -> &TransportConfig {
        &self.config
    }

    /// At least one handshake has completed.
    pub fn has_connected(&self) -> bool {
        self.lock().handshakes > 0
    }

    pub fn unreliable_ready(&self) -> bool {
        self.lock().udp.ready
    }

    pub fn last_activity(&self) -> Instant {
        self.lock().last_recv
    }

    /// Time spent in the current state.
    pub fn state_age(&self, now: Instant) -> Duration {
        now.saturating_duration_since(self.lock().entered_at)
    }

    /// Neither channel has a writer mid-drain.
    pub fn is_quiescent(&self) -> bool {
        self.router.is_idle()
    }

    /// Use a send queue rented ahead of time for the reliable channel.
    pub fn install_queue(&self, queue: PooledQueue) {
        self.router.install_queue(Channel::Reliable, queue);
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn micros(&self, now: Instant) -> u64 {
        now.saturating_duration_since(self.epoch).as_micros() as u64
    }

    fn transition(&self, inner: &mut Inner, from: PeerState, to: PeerState, now: Instant) -> bool {
        if !self.state.transition(from, to) {
            return false;
        }
        inner.entered_at = now;
        let peer_id = self.peer_id();
        tracing::debug!(%peer_id, from = from.name(), to = to.name(), "state change");
        self.events.emit(PeerEvent::StateChanged { peer_id, from, to });
        true
    }

    fn apply(&self, inner: &mut Inner, n: Negotiation) {
        self.peer_id.store(n.peer_id.get(), Ordering::Release);
        self.session_id.store(n.session_id.0, Ordering::Release);
        inner.limits = Limits {
            max_frame_bytes: n.max_frame_bytes,
            send_timeout: n.send_timeout,
            max_retries: n.max_retries,
        };
        inner.fragmenter.set_max_message(n.max_frame_bytes);
        inner.reassembler.set_max_message(n.max_frame_bytes);
        inner.codec.set_encryptor(n.encryptor);
        inner
            .codec
            .set_compression(n.compressor, n.use_compress, n.compression_threshold);
    }

    fn enqueue_control(&self, inner: &mut Inner, msg: &ControlMessage, now: Instant) -> Result<(), RouterError> {
        self.router
            .enqueue(Channel::Reliable, msg.to_frame().to_bytes())?;
        inner.last_send = now;
        Ok(())
    }

    /// Replay unacknowledged messages, then release queued ones.
    fn resume_delivery(&self, inner: &mut Inner, now: Instant) {
        let router = &self.router;
        match inner
            .sender
            .replay_in_flight(now, |frame| router.enqueue(Channel::Reliable, frame))
        {
            Ok(0) => {}
            Ok(n) => tracing::debug!(peer_id = %self.peer_id(), replayed = n, "replaying in-flight messages"),
            // left in flight; the retry loop picks them up
            Err(e) => tracing::debug!(peer_id = %self.peer_id(), error = %e, "replay deferred"),
        }
        self.flush_pending(inner, now);
    }

    fn flush_pending(&self, inner: &mut Inner, now: Instant) -> Option<CloseReason> {
        let router = &self.router;
        let codec = &inner.codec;
        match inner.sender.flush_pending(
            now,
            |m| codec.seal(m.payload.clone()),
            |frame| router.enqueue(Channel::Reliable, frame),
        ) {
            Ok(0) => None,
            Ok(_) => {
                inner.last_send = now;
                None
            }
            Err(SendError::Codec(e)) => {
                tracing::warn!(peer_id = %self.peer_id(), error = %e, "cannot seal queued message");
                Some(CloseReason::CodecFailure)
            }
            Err(e) => {
                tracing::debug!(peer_id = %self.peer_id(), error = %e, "pending flush deferred");
                None
            }
        }
    }

    fn flush(&self, channel: Channel, now: Instant) {
        match self.router.flush(channel) {
            Ok(_) => {}
            Err(RouterError::Io(e)) if channel == Channel::Reliable => self.on_socket_error(e, now),
            Err(e) => {
                tracing::debug!(peer_id = %self.peer_id(), ?channel, error = %e, "write failed")
            }
        }
    }

    // ─── Client Lifecycle ───────────────────────────────────────────────

    /// `None → Connecting`.
    pub fn begin_connect(&self, now: Instant) -> bool {
        let mut inner = self.lock();
        self.transition(&mut inner, PeerState::None, PeerState::Connecting, now)
    }

    /// A transport opened: bind it and send the auth request.
    pub fn begin_handshake(
        &self,
        transport: Arc<dyn Transport>,
        req: SessionAuthReq,
        now: Instant,
    ) -> Result<(), SendError> {
        {
            let mut inner = self.lock();
            let state = self.state();
            if !matches!(state, PeerState::Connecting | PeerState::Reconnecting) {
                return Err(SendError::InvalidState(state));
            }
            self.router.unbind(Channel::Reliable);
            self.router.bind(Channel::Reliable, transport)?;
            self.enqueue_control(&mut inner, &ControlMessage::AuthReq(req), now)?;
            self.transition(&mut inner, state, PeerState::Handshake, now);
        }
        self.flush(Channel::Reliable, now);
        Ok(())
    }

    /// `Handshake → Open` on an accepted auth ack. `negotiation` is `None`
    /// when an existing session was resumed and keeps its parameters.
    pub fn complete_handshake(&self, negotiation: Option<Negotiation>, now: Instant) -> bool {
        let peer_id = {
            let mut inner = self.lock();
            if !self.transition(&mut inner, PeerState::Handshake, PeerState::Open, now) {
                return false;
            }
            if let Some(n) = negotiation {
                self.apply(&mut inner, n);
            }
            inner.handshakes += 1;
            inner.last_recv = now;
            inner.last_ping = None;
            self.resume_delivery(&mut inner, now);
            self.peer_id()
        };
        tracing::info!(%peer_id, session = %self.session_id(), "connected");
        self.events.emit(PeerEvent::Connected { peer_id });
        self.flush(Channel::Reliable, now);
        true
    }

    // ─── Server Lifecycle ───────────────────────────────────────────────

    /// Admit a new peer: `None → Handshake → Open`, answering with `ack`.
    pub fn establish(
        &self,
        transport: Arc<dyn Transport>,
        negotiation: Negotiation,
        ack: SessionAuthAck,
        now: Instant,
    ) -> Result<(), SendError> {
        let peer_id = negotiation.peer_id;
        {
            let mut inner = self.lock();
            let state = self.state();
            if state != PeerState::None {
                return Err(SendError::InvalidState(state));
            }
            self.apply(&mut inner, negotiation);
            self.router.bind(Channel::Reliable, transport)?;
            self.transition(&mut inner, PeerState::None, PeerState::Handshake, now);
            self.enqueue_control(&mut inner, &ControlMessage::AuthAck(ack), now)?;
            self.transition(&mut inner, PeerState::Handshake, PeerState::Open, now);
            inner.handshakes += 1;
            inner.last_recv = now;
        }
        tracing::info!(%peer_id, session = %self.session_id(), "peer connected");
        self.events.emit(PeerEvent::Connected { peer_id });
        self.flush(Channel::Reliable, now);
        Ok(())
    }

    /// Resume a parked peer (or take over a live one) on a new transport.
    /// Returns the transport that was replaced, for the caller to close.
    pub fn restore(
        &self,
        transport: Arc<dyn Transport>,
        ack: SessionAuthAck,
        now: Instant,
    ) -> Result<Option<Arc<dyn Transport>>, SendError> {
        let peer_id = self.peer_id();
        let previous = {
            let mut inner = self.lock();
            let state = self.state();
            if !matches!(state, PeerState::Offline | PeerState::Open) {
                return Err(SendError::InvalidState(state));
            }
            // The old stream's unsent bytes are dropped here; everything
            // that matters is still in flight and is replayed below.
            let previous = self.router.unbind(Channel::Reliable);
            if let Some(udp) = self.router.unbind(Channel::Unreliable) {
                udp.close();
            }
            inner.udp = UdpLink::default();
            self.router.bind(Channel::Reliable, transport)?;
            self.enqueue_control(&mut inner, &ControlMessage::AuthAck(ack), now)?;
            if state == PeerState::Offline {
                self.transition(&mut inner, PeerState::Offline, PeerState::Open, now);
            } else {
                tracing::info!(%peer_id, "session taken over by new transport");
            }
            inner.handshakes += 1;
            inner.last_recv = now;
            self.resume_delivery(&mut inner, now);
            previous
        };
        tracing::info!(%peer_id, "peer restored");
        self.events.emit(PeerEvent::Connected { peer_id });
        self.flush(Channel::Reliable, now);
        Ok(previous)
    }

    // ─── Transport Loss ─────────────────────────────────────────────────

    /// The reliable transport went away. Ignored unless `transport` is the
    /// one currently bound. Returns true if the connection reacted.
    pub fn on_transport_lost(&self, transport: &Arc<dyn Transport>, now: Instant) -> bool {
        let mut inner = self.lock();
        if !self.router.unbind_if(Channel::Reliable, transport) {
            return false;
        }
        transport.close();
        if let Some(udp) = self.router.unbind(Channel::Unreliable) {
            udp.close();
        }
        inner.udp = UdpLink::default();

        let peer_id = self.peer_id();
        match self.state() {
            PeerState::Open => {
                let to = match self.side {
                    Side::Server => PeerState::Offline,
                    Side::Client => PeerState::Reconnecting,
                };
                if self.transition(&mut inner, PeerState::Open, to, now) {
                    tracing::info!(
                        %peer_id,
                        in_flight = inner.sender.in_flight(),
                        state = to.name(),
                        "transport lost"
                    );
                    self.events.emit(PeerEvent::Offline { peer_id });
                }
            }
            PeerState::Handshake => {
                let to = if inner.handshakes > 0 {
                    PeerState::Reconnecting
                } else {
                    PeerState::Connecting
                };
                self.transition(&mut inner, PeerState::Handshake, to, now);
            }
            PeerState::Closing => {
                let reason = inner.close_reason.unwrap_or(CloseReason::Normal);
                drop(inner);
                self.finish_close(reason);
            }
            _ => {}
        }
        true
    }

    /// Log a socket error; non-ignorable ones are raised as `Error` events.
    pub fn report_socket_error(&self, err: &io::Error) {
        let peer_id = self.peer_id();
        if is_ignorable(err) {
            tracing::debug!(%peer_id, error = %err, "transport closed by remote");
        } else {
            tracing::warn!(%peer_id, error = %err, "socket error");
            self.events.emit(PeerEvent::Error {
                peer_id,
                message: err.to_string(),
            });
        }
    }

    fn on_socket_error(&self, err: io::Error, now: Instant) {
        self.report_socket_error(&err);
        if let Some(transport) = self.router.transport(Channel::Reliable) {
            self.on_transport_lost(&transport, now);
        }
    }

    // ─── Close ──────────────────────────────────────────────────────────

    /// Close the connection. Idempotent.
    ///
    /// Local closes from a state with a live transport send `Close` and wait
    /// up to `close_grace` for the echo; everything else closes at once.
    pub fn close(&self, reason: CloseReason, now: Instant) {
        let state = self.state();
        if state.is_terminal() {
            return;
        }
        let immediate = !reason.is_graceful()
            || !matches!(state, PeerState::Handshake | PeerState::Open)
            || !self.router.is_bound(Channel::Reliable);
        if immediate {
            self.finish_close(reason);
            return;
        }
        {
            let mut inner = self.lock();
            if !self.transition(&mut inner, state, PeerState::Closing, now) {
                drop(inner);
                // lost a race with another transition; decide again
                return self.close(reason, now);
            }
            inner.close_reason = Some(reason);
            inner.close_deadline = Some(now + self.config.close_grace);
            if let Err(e) = self.enqueue_control(&mut inner, &ControlMessage::Close, now) {
                tracing::debug!(peer_id = %self.peer_id(), error = %e, "close notice not queued");
            }
        }
        self.flush(Channel::Reliable, now);
    }

    fn finish_close(&self, reason: CloseReason) {
        let peer_id = self.peer_id();
        let discarded = {
            let mut inner = self.lock();
            let Some(from) = self.state.transition_unless(&[PeerState::Closed], PeerState::Closed)
            else {
                return;
            };
            self.events.emit(PeerEvent::StateChanged {
                peer_id,
                from,
                to: PeerState::Closed,
            });
            inner.close_deadline = None;
            inner.udp = UdpLink::default();
            inner.codec.clear();
            inner.reorder.clear();
            let limits = inner.reassembler.limits();
            inner.reassembler = Reassembler::new(self.config.fragment_timeout, limits);
            inner.sender.discard_all()
        };
        self.router.close_transports();
        self.router.release();

        if reason.is_error() {
            tracing::warn!(%peer_id, %reason, discarded, "connection closed");
            self.events.emit(PeerEvent::Error {
                peer_id,
                message: reason.to_string(),
            });
        } else {
            tracing::info!(%peer_id, %reason, discarded, "connection closed");
        }
        self.events.emit(PeerEvent::Disconnected { peer_id, reason });
    }

    // ─── Send ───────────────────────────────────────────────────────────

    /// Send an application message.
    ///
    /// Reliable messages sent before the connection is open (or while it is
    /// reconnecting, or with the in-flight window full) wait in the pending
    /// queue. Unreliable messages are never queued.
    pub fn send(
        &self,
        channel: Channel,
        protocol_id: u16,
        payload: Bytes,
        now: Instant,
    ) -> Result<(), SendError> {
        if is_control(protocol_id) {
            return Err(SendError::ReservedProtocol(protocol_id));
        }
        match channel {
            Channel::Reliable => self.send_reliable(protocol_id, payload, now),
            Channel::Unreliable => self.send_unreliable(protocol_id, payload, now),
        }
    }

    fn send_reliable(&self, protocol_id: u16, payload: Bytes, now: Instant) -> Result<(), SendError> {
        {
            let mut guard = self.lock();
            let inner = &mut *guard;
            let state = self.state();
            if state.is_terminal() {
                return Err(SendError::InvalidState(state));
            }
            let max = inner.limits.max_frame_bytes;
            let room = max.saturating_sub(RELIABLE_MAX_HEADER);
            if payload.len() > room {
                return Err(SendError::PayloadTooLarge {
                    len: payload.len(),
                    max: room,
                });
            }
            if state != PeerState::Open || !inner.sender.can_send_now() {
                return inner.sender.queue_pending(PendingMessage {
                    protocol_id,
                    flags: MessageFlags::empty(),
                    payload,
                });
            }

            let payload_len = payload.len();
            let (flags, body) = inner.codec.seal(payload)?;
            let frame = inner.sender.frame_for(&PendingMessage {
                protocol_id,
                flags,
                payload: body,
            });
            if frame.encoded_len() > max {
                return Err(SendError::PayloadTooLarge {
                    len: frame.payload.len(),
                    max: room,
                });
            }
            let bytes = frame.to_bytes();
            self.router.enqueue(Channel::Reliable, bytes.clone())?;
            inner.sender.commit_sent(bytes, payload_len, now);
            inner.last_send = now;
        }
        self.flush(Channel::Reliable, now);
        Ok(())
    }

    fn send_unreliable(&self, protocol_id: u16, payload: Bytes, now: Instant) -> Result<(), SendError> {
        {
            let mut guard = self.lock();
            let inner = &mut *guard;
            let state = self.state();
            if state != PeerState::Open {
                return Err(SendError::InvalidState(state));
            }
            if !inner.udp.ready {
                return Err(SendError::UnreliableUnavailable);
            }
            let body = inner.codec.seal_datagram(payload)?;
            let frames = inner
                .fragmenter
                .split(self.peer_id().get(), protocol_id, body)?;
            let fragmented = frames.len() > 1;
            for frame in &frames {
                self.router.enqueue(Channel::Unreliable, frame.to_bytes())?;
            }
            let stats = inner.sender.stats_mut();
            stats.datagrams_sent += frames.len() as u64;
            if fragmented {
                stats.fragments_sent += frames.len() as u64;
            }
        }
        self.flush(Channel::Unreliable, now);
        Ok(())
    }

    // ─── Receive ────────────────────────────────────────────────────────

    /// Process one reliable frame from the bound transport.
    pub fn on_frame(&self, frame: ReliableFrame, now: Instant) {
        self.lock().last_recv = now;
        if is_control(frame.protocol_id) {
            match ControlMessage::decode(frame.protocol_id, frame.payload) {
                Ok(msg) => self.on_control(msg, now),
                Err(e) => {
                    tracing::warn!(peer_id = %self.peer_id(), error = %e, "malformed control frame");
                    self.close(CloseReason::ProtocolError, now);
                }
            }
            return;
        }

        let state = self.state();
        if !matches!(state, PeerState::Open | PeerState::Closing) {
            tracing::debug!(peer_id = %self.peer_id(), state = state.name(), "dropping early frame");
            return;
        }

        let peer_id = self.peer_id();
        let mut failed = false;
        {
            let mut guard = self.lock();
            let inner = &mut *guard;
            inner.received.messages_received += 1;
            inner.received.bytes_received += frame.payload.len() as u64;

            let sequence = frame.sequence;
            let delivered = if sequence == VarInt::ZERO {
                vec![frame]
            } else {
                let receipt = inner.reorder.accept(sequence.value(), frame);
                if receipt.should_ack() {
                    let ack = ControlMessage::Ack(MessageAck { sequence });
                    if let Err(e) = self.enqueue_control(inner, &ack, now) {
                        tracing::debug!(%peer_id, error = %e, "ack not queued");
                    }
                }
                match receipt {
                    Receipt::Deliver(frames) => frames,
                    Receipt::Buffered => {
                        inner.received.reordered += 1;
                        Vec::new()
                    }
                    Receipt::Duplicate => {
                        tracing::debug!(%peer_id, sequence = sequence.value(), "duplicate message");
                        inner.received.duplicates += 1;
                        Vec::new()
                    }
                    Receipt::Overflow => {
                        tracing::debug!(%peer_id, sequence = sequence.value(), "reorder buffer full");
                        inner.received.reorder_overflows += 1;
                        Vec::new()
                    }
                }
            };

            for frame in delivered {
                match inner.codec.open(frame.flags, frame.payload) {
                    Ok(payload) => {
                        inner.received.messages_delivered += 1;
                        self.events.emit(PeerEvent::MessageReceived {
                            peer_id,
                            channel: Channel::Reliable,
                            protocol_id: frame.protocol_id,
                            payload,
                        });
                    }
                    Err(e) => {
                        tracing::warn!(%peer_id, error = %e, "cannot open payload");
                        failed = true;
                        break;
                    }
                }
            }
        }
        if failed {
            self.close(CloseReason::CodecFailure, now);
        } else {
            self.flush(Channel::Reliable, now);
        }
    }

    fn on_control(&self, msg: ControlMessage, now: Instant) {
        let peer_id = self.peer_id();
        match msg {
            ControlMessage::Ack(ack) => {
                let mut inner = self.lock();
                match inner.sender.on_ack(ack.sequence.value(), now) {
                    AckOutcome::Acked { rtt: Some(rtt) } => inner.quality.on_sample(rtt),
                    AckOutcome::Acked { rtt: None } => {}
                    AckOutcome::Duplicate => {
                        tracing::debug!(%peer_id, sequence = ack.sequence.value(), "duplicate ack")
                    }
                }
            }
            ControlMessage::Ping(ping) => {
                {
                    let mut inner = self.lock();
                    inner.quality.on_remote_report(RemoteReport {
                        raw_rtt_us: ping.raw_rtt_us,
                        avg_rtt_us: ping.avg_rtt_us,
                        jitter_us: ping.jitter_us,
                        loss_rate: ping.packet_loss_rate,
                    });
                    let pong = ControlMessage::Pong(Pong {
                        send_time_us: ping.send_time_us,
                        server_time_us: self.micros(now),
                    });
                    if let Err(e) = self.enqueue_control(&mut inner, &pong, now) {
                        tracing::debug!(%peer_id, error = %e, "pong not queued");
                    }
                }
                self.flush(Channel::Reliable, now);
            }
            ControlMessage::Pong(pong) => {
                let sent_at = self.epoch + Duration::from_micros(pong.send_time_us);
                let mut inner = self.lock();
                inner.ping_outstanding = false;
                if sent_at <= now {
                    inner.quality.on_sample(now - sent_at);
                }
            }
            ControlMessage::Close => self.on_close_received(now),
            other => {
                tracing::warn!(%peer_id, protocol_id = other.protocol_id(), "unexpected control message");
                self.close(CloseReason::ProtocolError, now);
            }
        }
    }

    fn on_close_received(&self, now: Instant) {
        if self.state() == PeerState::Closing {
            // our own close, echoed back
            let reason = self.lock().close_reason.unwrap_or(CloseReason::Normal);
            self.finish_close(reason);
            return;
        }
        {
            let mut inner = self.lock();
            if let Err(e) = self.enqueue_control(&mut inner, &ControlMessage::Close, now) {
                tracing::debug!(peer_id = %self.peer_id(), error = %e, "close echo not queued");
            }
        }
        self.flush(Channel::Reliable, now);
        self.finish_close(CloseReason::RemoteClosed);
    }

    /// Process one application datagram addressed to this peer.
    pub fn on_datagram(&self, frame: UnreliableFrame, now: Instant) {
        if self.state() != PeerState::Open {
            return;
        }
        let peer_id = self.peer_id();
        let mut inner = self.lock();
        inner.last_recv = now;
        inner.received.datagrams_received += 1;
        let payload = if frame.fragmented {
            inner.received.fragments_received += 1;
            match inner.reassembler.push(frame.peer_id, frame.payload, now) {
                Ok(Some(whole)) => {
                    inner.received.fragment_groups_completed += 1;
                    whole
                }
                Ok(None) => return,
                Err(e) => {
                    tracing::debug!(%peer_id, error = %e, "bad fragment dropped");
                    return;
                }
            }
        } else {
            frame.payload
        };
        match inner.codec.open_datagram(payload) {
            Ok(payload) => self.events.emit(PeerEvent::MessageReceived {
                peer_id,
                channel: Channel::Unreliable,
                protocol_id: frame.protocol_id,
                payload,
            }),
            Err(e) => tracing::debug!(%peer_id, error = %e, "undecryptable datagram dropped"),
        }
    }

    // ─── Unreliable Channel Setup ───────────────────────────────────────

    fn hello(&self) -> Bytes {
        let mtu = self.config.udp_mtu.min(u16::MAX as usize) as u16;
        ControlMessage::UdpHelloReq(UdpHelloReq {
            session_id: self.session_id().0,
            peer_id: self.peer_id().get(),
            mtu,
        })
        .to_datagram(self.peer_id().get())
        .to_bytes()
    }

    /// Client: bind the datagram transport and announce it.
    pub fn begin_udp(&self, transport: Arc<dyn Transport>, now: Instant) -> Result<(), RouterError> {
        if let Some(old) = self.router.bind(Channel::Unreliable, transport)? {
            old.close();
        }
        {
            let mut inner = self.lock();
            inner.udp = UdpLink {
                ready: false,
                last_hello: Some(now),
            };
            self.router.enqueue(Channel::Unreliable, self.hello())?;
        }
        self.flush(Channel::Unreliable, now);
        Ok(())
    }

    /// Client: the server answered the UDP hello.
    pub fn on_udp_hello_ack(&self, ack: UdpHelloAck) {
        let peer_id = self.peer_id();
        let mut inner = self.lock();
        if !ack.result.is_ok() {
            tracing::warn!(%peer_id, result = ?ack.result, "udp channel refused");
            drop(inner);
            if let Some(udp) = self.router.unbind(Channel::Unreliable) {
                udp.close();
            }
            return;
        }
        if !inner.udp.ready {
            inner.fragmenter.set_mtu(ack.negotiated_mtu as usize);
            inner.reassembler.set_mtu(ack.negotiated_mtu as usize);
            inner.udp.ready = true;
            tracing::info!(%peer_id, mtu = ack.negotiated_mtu, "udp channel ready");
        }
    }

    /// Server: a UDP hello arrived for this peer over `transport`.
    pub fn accept_udp(&self, transport: Arc<dyn Transport>, req: &UdpHelloReq, now: Instant) -> bool {
        if self.state() != PeerState::Open || req.session_id != self.session_id().0 {
            return false;
        }
        let negotiated = (req.mtu as usize).min(self.config.udp_mtu).max(64) as u16;
        if let Err(e) = self.router.bind(Channel::Unreliable, transport) {
            tracing::warn!(peer_id = %self.peer_id(), error = %e, "cannot bind udp");
            return false;
        }
        {
            let mut inner = self.lock();
            inner.fragmenter.set_mtu(negotiated as usize);
            inner.reassembler.set_mtu(negotiated as usize);
            inner.udp.ready = true;
            inner.last_recv = now;
            let ack = ControlMessage::UdpHelloAck(UdpHelloAck {
                result: crate::control::AuthResult::Ok,
                negotiated_mtu: negotiated,
            });
            if let Err(e) = self
                .router
                .enqueue(Channel::Unreliable, ack.to_datagram(self.peer_id().get()).to_bytes())
            {
                tracing::debug!(peer_id = %self.peer_id(), error = %e, "udp hello ack not queued");
            }
        }
        self.flush(Channel::Unreliable, now);
        true
    }

    // ─── Tick ───────────────────────────────────────────────────────────

    /// Advance timers: pending flush, retransmission, pings, fragment
    /// cleanup and the close grace period.
    pub fn tick(&self, now: Instant) {
        match self.state() {
            PeerState::Open => self.tick_open(now),
            PeerState::Closing => {
                let expired = {
                    let inner = self.lock();
                    inner
                        .close_deadline
                        .filter(|deadline| now >= *deadline)
                        .map(|_| inner.close_reason.unwrap_or(CloseReason::Normal))
                };
                if let Some(reason) = expired {
                    tracing::debug!(peer_id = %self.peer_id(), "close grace expired");
                    self.finish_close(reason);
                } else {
                    self.flush(Channel::Reliable, now);
                }
            }
            _ => {}
        }
    }

    fn tick_open(&self, now: Instant) {
        let peer_id = self.peer_id();
        let failure = {
            let mut guard = self.lock();
            let inner = &mut *guard;
            let mut failure = self.flush_pending(inner, now);

            let schedule = RetrySchedule {
                rto: inner.quality.rto(inner.limits.send_timeout),
                send_timeout: inner.limits.send_timeout,
                max_retries: inner.limits.max_retries,
            };
            let router = &self.router;
            match inner
                .sender
                .retransmit_due(now, &schedule, |frame| router.enqueue(Channel::Reliable, frame))
            {
                Ok(0) => {}
                Ok(n) => {
                    tracing::debug!(%peer_id, resent = n, rto_ms = schedule.rto.as_millis() as u64, "retransmitting");
                    inner.last_send = now;
                }
                Err(e) => {
                    tracing::warn!(%peer_id, error = %e, "retry limit exceeded");
                    failure = Some(CloseReason::RetryLimitExceeded);
                }
            }

            if failure.is_none() {
                self.maybe_ping(inner, now);
                self.maybe_resend_hello(inner, now);
                inner.reassembler.cleanup(now);
            }
            failure
        };
        if let Some(reason) = failure {
            self.close(reason, now);
            return;
        }
        self.flush(Channel::Reliable, now);
        self.flush(Channel::Unreliable, now);
    }

    fn maybe_ping(&self, inner: &mut Inner, now: Instant) {
        let ping_due = self.side == Side::Client
            && self.config.auto_ping
            && inner
                .last_ping
                .map_or(true, |at| now.saturating_duration_since(at) >= self.config.ping_interval);
        let idle_due = self.config.keep_alive
            && now.saturating_duration_since(inner.last_send) >= self.config.keep_alive_interval;
        if !ping_due && !idle_due {
            return;
        }
        if inner.ping_outstanding {
            inner.quality.on_loss();
        }
        let estimator = inner.quality.estimator();
        let window = inner.quality.window();
        let ping = ControlMessage::Ping(Ping {
            send_time_us: self.micros(now),
            raw_rtt_us: estimator.last_us() as u32,
            avg_rtt_us: estimator.srtt_us() as u32,
            jitter_us: window.jitter_us() as u32,
            packet_loss_rate: window.loss_rate() as f32,
        });
        match self.enqueue_control(inner, &ping, now) {
            Ok(()) => {
                inner.last_ping = Some(now);
                inner.ping_outstanding = true;
            }
            Err(e) => tracing::debug!(peer_id = %self.peer_id(), error = %e, "ping not queued"),
        }
    }

    fn maybe_resend_hello(&self, inner: &mut Inner, now: Instant) {
        if self.side != Side::Client || inner.udp.ready || !self.router.is_bound(Channel::Unreliable) {
            return;
        }
        let due = inner
            .udp
            .last_hello
            .map_or(true, |at| now.saturating_duration_since(at) >= self.config.ping_interval);
        if due && self.router.enqueue(Channel::Unreliable, self.hello()).is_ok() {
            inner.udp.last_hello = Some(now);
        }
    }

    // ─── Stats ──────────────────────────────────────────────────────────

    pub fn stats(&self) -> ConnectionStats {
        let inner = self.lock();
        ConnectionStats {
            peer_id: self.peer_id().get(),
            state: self.state().name(),
            in_flight: inner.sender.in_flight(),
            pending: inner.sender.pending(),
            reorder_buffered: inner.reorder.buffered(),
            sender: inner.sender.stats().clone(),
            receiver: inner.received.clone(),
            retransmit_ratio: inner.sender.stats().retransmit_ratio(),
            goodput_ratio: inner.received.goodput_ratio(),
            quality: inner.quality.snapshot(inner.limits.send_timeout),
            remote: inner.quality.remote(),
        }
    }

    /// Sequences still awaiting acknowledgment, oldest first.
    pub fn in_flight_sequences(&self) -> Vec<u64> {
        self.lock().sender.in_flight_sequences()
    }
}

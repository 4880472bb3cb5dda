//! # Integration tests: Client ↔ Server over loopback transports
//!
//! A client and a server are wired together through in-memory transports.
//! Nothing moves until [`Net::pump`] carries the bytes across, which lets a
//! test drop, delay, reorder or duplicate traffic at will.

use bytes::Bytes;
use crossbeam_channel::Receiver;
use proptest::prelude::*;
use quanta::Instant;
use std::io;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tandem_transport::control::{AuthResult, ControlMessage, MessageAck};
use tandem_transport::loopback::MemoryTransport;
use tandem_transport::peer::PeerState;
use tandem_transport::session::SessionKey;
use tandem_transport::wire::{FrameDecoder, ReliableFrame, UnreliableFrame, VarInt};
use tandem_transport::{
    Channel, Client, CloseReason, Connector, EventSink, PeerEvent, PeerId, Server, Transport,
    TransportConfig,
};

// ─── Harness ────────────────────────────────────────────────────────────────

/// One dialed stream: what each side writes, and the server's key for it.
struct Pipe {
    client: Arc<MemoryTransport>,
    server: Arc<MemoryTransport>,
    key: Option<SessionKey>,
}

struct UdpPipe {
    client: Arc<MemoryTransport>,
    server: Arc<MemoryTransport>,
}

#[derive(Default)]
struct Wires {
    streams: Vec<Pipe>,
    udp: Vec<UdpPipe>,
}

struct Dialer(Mutex<Wires>);

impl Connector for Dialer {
    fn connect(&self) -> io::Result<Arc<dyn Transport>> {
        let client = MemoryTransport::new(Channel::Reliable);
        let server = MemoryTransport::new(Channel::Reliable);
        self.0.lock().unwrap().streams.push(Pipe {
            client: client.clone(),
            server,
            key: None,
        });
        Ok(client)
    }

    fn open_udp(&self, _port: u16) -> io::Result<Arc<dyn Transport>> {
        let client = MemoryTransport::new(Channel::Unreliable);
        let server = MemoryTransport::new(Channel::Unreliable);
        self.0.lock().unwrap().udp.push(UdpPipe {
            client: client.clone(),
            server,
        });
        Ok(client)
    }
}

struct Net {
    server: Server,
    server_rx: Receiver<PeerEvent>,
    client: Client,
    client_rx: Receiver<PeerEvent>,
    dialer: Arc<Dialer>,
    start: Instant,
}

fn config() -> TransportConfig {
    TransportConfig {
        auto_ping: false,
        keep_alive: false,
        send_timeout: Duration::from_millis(100),
        max_retry_count: 2,
        pool_min: 2,
        pool_max: 8,
        ..TransportConfig::default()
    }
}

/// Log output for failing tests; `RUST_LOG=debug cargo test` shows it.
fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

impl Net {
    fn new(config: TransportConfig) -> Self {
        init_tracing();
        let start = Instant::now();
        let (server_events, server_rx) = EventSink::new();
        let server = Server::new(config.clone(), server_events);
        server.set_udp_port(7001);
        let (client_events, client_rx) = EventSink::new();
        let dialer = Arc::new(Dialer(Mutex::new(Wires::default())));
        let client = Client::new(config, dialer.clone(), client_events, start);
        Net {
            server,
            server_rx,
            client,
            client_rx,
            dialer,
            start,
        }
    }

    fn at(&self, ms: u64) -> Instant {
        self.start + Duration::from_millis(ms)
    }

    fn connected(config: TransportConfig) -> Self {
        let net = Net::new(config);
        net.client.connect(net.start);
        net.pump(net.start);
        assert_eq!(net.client.state(), PeerState::Open);
        net
    }

    /// Carry everything written so far to the other side until both sides
    /// go quiet.
    fn pump(&self, now: Instant) {
        loop {
            let mut moved = false;
            let streams: Vec<_> = {
                let mut wires = self.dialer.0.lock().unwrap();
                for pipe in wires.streams.iter_mut().filter(|p| p.key.is_none()) {
                    pipe.key = self.server.accept(pipe.server.clone(), now).ok();
                }
                wires
                    .streams
                    .iter()
                    .map(|p| (p.client.clone(), p.server.clone(), p.key))
                    .collect()
            };
            for (client, server, key) in streams {
                let up = client.take_stream();
                if let (false, Some(key)) = (up.is_empty(), key) {
                    self.server.on_stream_data(key, &up, now);
                    moved = true;
                }
                let down = server.take_stream();
                if !down.is_empty() {
                    let t: Arc<dyn Transport> = client.clone();
                    self.client.on_stream_data(&t, &down, now);
                    moved = true;
                }
            }
            let udp: Vec<_> = {
                let wires = self.dialer.0.lock().unwrap();
                wires.udp.iter().map(|p| (p.client.clone(), p.server.clone())).collect()
            };
            for (client, server) in udp {
                for datagram in client.take_sent() {
                    self.server.on_datagram(datagram, server.clone(), now);
                    moved = true;
                }
                for datagram in server.take_sent() {
                    self.client.on_datagram(datagram, now);
                    moved = true;
                }
            }
            if !moved {
                return;
            }
        }
    }

    fn current_pipe(&self) -> (Arc<MemoryTransport>, Arc<MemoryTransport>, SessionKey) {
        let wires = self.dialer.0.lock().unwrap();
        let pipe = wires.streams.last().expect("dialed");
        (pipe.client.clone(), pipe.server.clone(), pipe.key.expect("accepted"))
    }

    /// Both ends observe the stream dying.
    fn cut(&self, now: Instant) {
        let (client, _server, key) = self.current_pipe();
        self.server.on_stream_closed(key, None, now);
        let t: Arc<dyn Transport> = client;
        self.client.on_stream_closed(&t, None, now);
    }

    fn peer(&self) -> PeerId {
        self.client.peer_id()
    }
}

fn received(rx: &Receiver<PeerEvent>) -> Vec<Bytes> {
    rx.try_iter()
        .filter_map(|e| match e {
            PeerEvent::MessageReceived { payload, .. } => Some(payload),
            _ => None,
        })
        .collect()
}

fn decode_stream(raw: &[u8]) -> Vec<ReliableFrame> {
    let mut dec = FrameDecoder::new(1 << 20);
    dec.extend(raw);
    std::iter::from_fn(|| dec.next_frame().unwrap()).collect()
}

// ─── Scenario A: Handshake ──────────────────────────────────────────────────

#[test]
fn handshake_reaches_open_and_connects_once() {
    let net = Net::new(config());
    net.client.connect(net.start);
    assert_eq!(net.client.state(), PeerState::Handshake);
    net.pump(net.start);

    assert_eq!(net.client.state(), PeerState::Open);
    let connected = net
        .client_rx
        .try_iter()
        .filter(|e| matches!(e, PeerEvent::Connected { .. }))
        .count();
    assert_eq!(connected, 1);
    assert_eq!(net.server.peer_count(), 1);
    let conn = net.server.connection(net.peer()).unwrap();
    assert_eq!(conn.state(), PeerState::Open);
    assert!(net.server_rx.try_iter().any(|e| matches!(e, PeerEvent::Connected { .. })));
}

#[test]
fn reliable_messages_flow_both_ways() {
    let net = Net::connected(config());
    let now = net.at(1);
    net.client
        .send(Channel::Reliable, 1, Bytes::from_static(b"up"), now)
        .unwrap();
    net.server
        .send(net.peer(), Channel::Reliable, 2, Bytes::from_static(b"down"), now)
        .unwrap();
    net.pump(now);

    assert_eq!(received(&net.server_rx), vec![Bytes::from_static(b"up")]);
    assert_eq!(received(&net.client_rx), vec![Bytes::from_static(b"down")]);
    // acks came back both ways
    assert_eq!(net.client.stats().in_flight, 0);
    assert_eq!(net.server.connection(net.peer()).unwrap().stats().in_flight, 0);
}

#[test]
fn udp_hello_enables_unreliable_channel() {
    let net = Net::connected(config());
    assert!(net.client.connection().unreliable_ready());
    let now = net.at(1);
    net.client
        .send(Channel::Unreliable, 5, Bytes::from_static(b"pos"), now)
        .unwrap();
    net.pump(now);
    assert_eq!(received(&net.server_rx), vec![Bytes::from_static(b"pos")]);
}

// ─── Scenario B: Queued While Reconnecting ──────────────────────────────────

#[test]
fn sends_while_reconnecting_flush_in_order() {
    let net = Net::connected(config());
    net.cut(net.at(10));
    assert_eq!(net.client.state(), PeerState::Reconnecting);

    let now = net.at(20);
    for body in [&b"one"[..], b"two", b"three"] {
        net.client
            .send(Channel::Reliable, 1, Bytes::copy_from_slice(body), now)
            .unwrap();
    }
    assert_eq!(net.client.stats().pending, 3);
    assert_eq!(net.client.stats().in_flight, 0);

    net.client.tick(now);
    assert_eq!(net.client.state(), PeerState::Handshake);
    net.pump(now);
    assert_eq!(net.client.state(), PeerState::Open);
    assert_eq!(
        received(&net.server_rx),
        vec![
            Bytes::from_static(b"one"),
            Bytes::from_static(b"two"),
            Bytes::from_static(b"three"),
        ]
    );
    assert_eq!(net.client.stats().pending, 0);
}

// ─── Scenario C: Retry Exhaustion ───────────────────────────────────────────

#[test]
fn unacked_message_closes_with_retry_limit() {
    let net = Net::connected(config());
    net.client
        .send(Channel::Reliable, 1, Bytes::from_static(b"lost"), net.start)
        .unwrap();
    // the server never sees anything again
    for ms in [100, 200, 299] {
        net.client.tick(net.at(ms));
        assert_eq!(net.client.state(), PeerState::Open, "closed early at {ms}ms");
    }
    let stats = net.client.stats();
    assert_eq!(stats.sender.retransmissions, 2);
    assert_eq!(stats.retransmit_ratio, 2.0);
    net.client.tick(net.at(300));
    assert_eq!(net.client.state(), PeerState::Closed);

    let events: Vec<_> = net.client_rx.try_iter().collect();
    assert!(events.iter().any(|e| matches!(e, PeerEvent::Error { .. })));
    assert!(events.iter().any(|e| matches!(
        e,
        PeerEvent::Disconnected {
            reason: CloseReason::RetryLimitExceeded,
            ..
        }
    )));
}

// ─── Scenario D: Fragmentation ──────────────────────────────────────────────

#[test]
fn large_datagram_fragments_and_reassembles_in_any_order() {
    let net = Net::connected(config());
    let now = net.at(1);
    let payload: Bytes = (0..3000u32).map(|i| (i % 251) as u8).collect::<Vec<_>>().into();
    net.server
        .send(net.peer(), Channel::Unreliable, 9, payload.clone(), now)
        .unwrap();

    let udp = net.dialer.0.lock().unwrap().udp[0].server.clone();
    let mut fragments = udp.take_sent();
    assert_eq!(fragments.len(), 3);
    fragments.reverse();
    let last = fragments.pop().unwrap();
    for datagram in fragments {
        net.client.on_datagram(datagram, now);
    }
    assert!(received(&net.client_rx).is_empty());
    net.client.on_datagram(last, now);
    assert_eq!(received(&net.client_rx), vec![payload]);
}

#[test]
fn missing_fragment_never_delivers() {
    let net = Net::connected(config());
    let now = net.at(1);
    net.server
        .send(net.peer(), Channel::Unreliable, 9, Bytes::from(vec![7u8; 3000]), now)
        .unwrap();
    let udp = net.dialer.0.lock().unwrap().udp[0].server.clone();
    let fragments = udp.take_sent();
    net.client.on_datagram(fragments[0].clone(), now);
    net.client.on_datagram(fragments[2].clone(), now);
    net.client.tick(net.at(6000));
    assert!(received(&net.client_rx).is_empty());
    assert_eq!(net.client.stats().receiver.fragment_groups_completed, 0);
}

// ─── Scenario E: Parking and Resumption ─────────────────────────────────────

#[test]
fn parked_peer_resumes_with_in_flight_intact() {
    let net = Net::connected(config());
    let now = net.at(10);
    net.server
        .send(net.peer(), Channel::Reliable, 4, Bytes::from_static(b"unacked"), now)
        .unwrap();
    // the reply never makes it across
    net.current_pipe().1.take_sent();
    net.cut(now);

    let conn = net.server.connection(net.peer()).unwrap();
    assert_eq!(conn.state(), PeerState::Offline);
    assert_eq!(conn.in_flight_sequences(), vec![1]);
    assert!(net.server_rx.try_iter().any(|e| matches!(e, PeerEvent::Offline { .. })));

    let later = net.at(5_000);
    net.client.tick(later);
    net.pump(later);
    assert_eq!(net.client.state(), PeerState::Open);
    assert_eq!(conn.state(), PeerState::Open);
    assert_eq!(received(&net.client_rx), vec![Bytes::from_static(b"unacked")]);
    assert!(conn.in_flight_sequences().is_empty());
}

#[test]
fn resume_after_waiting_window_is_rejected() {
    let net = Net::connected(config());
    let peer = net.peer();
    net.cut(net.at(10));

    let expired = net.at(10) + config().waiting_reconnect_timeout;
    net.client.tick(expired);
    net.pump(expired);

    assert_eq!(net.client.state(), PeerState::Closed);
    assert!(net.client_rx.try_iter().any(|e| matches!(
        e,
        PeerEvent::Disconnected {
            reason: CloseReason::HandshakeRejected(AuthResult::PeerNotFound),
            ..
        }
    )));
    assert_eq!(net.server.sweep(expired).removed, 1);
    assert!(net.server.connection(peer).is_none());
}

// ─── Boundaries ─────────────────────────────────────────────────────────────

#[test]
fn frame_at_max_size_accepted_one_over_rejected() {
    let cfg = TransportConfig {
        max_frame_bytes: 256,
        ..config()
    };
    let net = Net::connected(cfg);
    let (_, _, key) = net.current_pipe();
    let overhead = ReliableFrame::new(9, VarInt::from_u32(1), Bytes::new()).encoded_len();

    let exact = ReliableFrame::new(9, VarInt::from_u32(1), Bytes::from(vec![1u8; 256 - overhead]));
    assert_eq!(exact.encoded_len(), 256);
    net.server.on_stream_data(key, &exact.to_bytes(), net.at(1));
    assert_eq!(received(&net.server_rx).len(), 1);

    let over = ReliableFrame::new(9, VarInt::from_u32(2), Bytes::from(vec![1u8; 257 - overhead]));
    net.server.on_stream_data(key, &over.to_bytes(), net.at(2));
    let conn = net.server.connection(net.peer()).unwrap();
    assert_eq!(conn.state(), PeerState::Closed);
    assert!(net.server_rx.try_iter().any(|e| matches!(
        e,
        PeerEvent::Disconnected {
            reason: CloseReason::ProtocolError,
            ..
        }
    )));
}

#[test]
fn duplicate_ack_is_harmless() {
    let net = Net::connected(config());
    let now = net.at(1);
    net.client
        .send(Channel::Reliable, 1, Bytes::from_static(b"x"), now)
        .unwrap();
    net.pump(now);
    let (_, server_tcp, _) = net.current_pipe();
    let ack = ControlMessage::Ack(MessageAck {
        sequence: VarInt::from_u32(1),
    })
    .to_frame()
    .to_bytes();
    let t: Arc<dyn Transport> = net.current_pipe().0;
    net.client.on_stream_data(&t, &ack, now);
    net.client.on_stream_data(&t, &ack, now);
    assert!(server_tcp.take_sent().is_empty());
    assert_eq!(net.client.state(), PeerState::Open);
    assert_eq!(net.client.stats().sender.duplicate_acks, 2);
}

#[test]
fn graceful_close_completes_on_both_sides() {
    let net = Net::connected(config());
    let now = net.at(1);
    net.client.close(now);
    net.pump(now);
    assert_eq!(net.client.state(), PeerState::Closed);
    let conn = net.server.connection(net.peer()).unwrap();
    assert_eq!(conn.state(), PeerState::Closed);
    assert!(net.client_rx.try_iter().any(|e| matches!(
        e,
        PeerEvent::Disconnected {
            reason: CloseReason::Normal,
            ..
        }
    )));
}

// ─── Exactly-Once Delivery ──────────────────────────────────────────────────

/// Indices `0..n` shuffled, with `dups` extra copies spliced in.
fn delivery_order() -> impl Strategy<Value = (usize, Vec<usize>)> {
    (1usize..48).prop_flat_map(|n| {
        let order = Just((0..n).collect::<Vec<_>>()).prop_shuffle();
        let dups = prop::collection::vec((0..n, any::<prop::sample::Index>()), 0..n);
        (Just(n), order, dups).prop_map(|(n, mut order, dups)| {
            for (frame, at) in dups {
                let pos = at.index(order.len() + 1);
                order.insert(pos, frame);
            }
            (n, order)
        })
    })
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    #[test]
    fn reordered_and_duplicated_stream_delivers_exactly_once((n, order) in delivery_order()) {
        let net = Net::connected(config());
        let now = net.at(1);
        let (client_tcp, _, key) = net.current_pipe();
        for i in 0..n {
            net.client
                .send(Channel::Reliable, 1, Bytes::from((i as u32).to_be_bytes().to_vec()), now)
                .unwrap();
        }
        let frames = decode_stream(&client_tcp.take_stream());
        prop_assert_eq!(frames.len(), n);

        for &i in &order {
            net.server.on_stream_data(key, &frames[i].to_bytes(), now);
        }
        let got: Vec<u32> = received(&net.server_rx)
            .iter()
            .map(|b| u32::from_be_bytes([b[0], b[1], b[2], b[3]]))
            .collect();
        let want: Vec<u32> = (0..n as u32).collect();
        prop_assert_eq!(got, want);
    }

    #[test]
    fn unreliable_payload_survives_fragmentation(len in 1usize..=12_000, seed in any::<u8>()) {
        let net = Net::connected(config());
        let now = net.at(1);
        let payload: Bytes = (0..len).map(|i| (i as u8).wrapping_mul(31).wrapping_add(seed)).collect::<Vec<_>>().into();
        net.client.send(Channel::Unreliable, 3, payload.clone(), now).unwrap();
        let udp = net.dialer.0.lock().unwrap().udp[0].client.clone();
        let mut datagrams = udp.take_sent();
        prop_assert!(datagrams.iter().all(|d| d.len() <= config().udp_mtu));
        datagrams.reverse();
        let server_udp = net.dialer.0.lock().unwrap().udp[0].server.clone();
        for d in datagrams {
            prop_assert!(UnreliableFrame::decode(d.clone()).is_ok());
            net.server.on_datagram(d, server_udp.clone(), now);
        }
        prop_assert_eq!(received(&net.server_rx), vec![payload]);
    }
}

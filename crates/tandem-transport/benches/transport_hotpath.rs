//! Per-message processing latency benchmarks for tandem-transport.
//!
//! Measures the hot-path components:
//! - VarInt encode/decode
//! - Reliable frame encode and stream decode (various payload sizes)
//! - Fragment split + reassembly at MTU 1200
//! - Connection::send on the reliable channel through a loopback transport
//! - Reorder buffer delivery of a reversed burst
//!
//! Run with: cargo bench --package tandem-transport

use bytes::{Bytes, BytesMut};
use criterion::{black_box, criterion_group, criterion_main, Criterion, Throughput};
use quanta::Instant;
use std::time::Duration;

use tandem_transport::connection::{Connection, Negotiation, Side};
use tandem_transport::control::{AuthResult, SessionAuthAck};
use tandem_transport::delivery::ReorderBuffer;
use tandem_transport::fragment::{Fragmenter, Reassembler, ReassemblyLimits};
use tandem_transport::loopback::MemoryTransport;
use tandem_transport::peer::{PeerId, PeerKind, SessionId};
use tandem_transport::queue::QueuePool;
use tandem_transport::wire::{FrameDecoder, ReliableFrame, UnreliableFrame, VarInt};
use tandem_transport::{Channel, EventSink, TransportConfig};

// ─── VarInt ──────────────────────────────────────────────────────────────

fn bench_varint(c: &mut Criterion) {
    let mut group = c.benchmark_group("varint");
    for (name, val) in [
        ("1byte", 42u64),
        ("2byte", 1000),
        ("4byte", 100_000),
        ("8byte", 2_000_000_000),
    ] {
        let vi = VarInt::new(val).unwrap();
        group.bench_function(format!("encode_{name}"), |b| {
            b.iter(|| {
                let mut buf = BytesMut::with_capacity(8);
                black_box(vi).encode(&mut buf);
                black_box(buf);
            });
        });

        let mut buf = BytesMut::with_capacity(8);
        vi.encode(&mut buf);
        let encoded = buf.freeze();
        group.bench_function(format!("decode_{name}"), |b| {
            b.iter(|| {
                let mut read = &encoded[..];
                black_box(VarInt::decode(&mut read));
            });
        });
    }
    group.finish();
}

// ─── Frames ──────────────────────────────────────────────────────────────

fn bench_frames(c: &mut Criterion) {
    let mut group = c.benchmark_group("reliable_frame");
    for size in [64usize, 512, 1200, 8192] {
        let frame = ReliableFrame::new(7, VarInt::from_u32(1234), Bytes::from(vec![0xAB; size]));
        let encoded = frame.to_bytes();
        group.throughput(Throughput::Bytes(encoded.len() as u64));

        group.bench_function(format!("encode_{size}"), |b| {
            b.iter(|| black_box(black_box(&frame).to_bytes()));
        });

        group.bench_function(format!("stream_decode_{size}"), |b| {
            let mut dec = FrameDecoder::new(64 * 1024);
            b.iter(|| {
                dec.extend(black_box(&encoded));
                black_box(dec.next_frame().unwrap());
            });
        });
    }
    group.finish();
}

// ─── Fragmentation ───────────────────────────────────────────────────────

fn bench_fragmentation(c: &mut Criterion) {
    let mut group = c.benchmark_group("fragment");
    let payload = Bytes::from(vec![0x5A; 12_000]);
    group.throughput(Throughput::Bytes(payload.len() as u64));

    group.bench_function("split_12000_mtu_1200", |b| {
        let mut fragmenter = Fragmenter::new(1200);
        b.iter(|| black_box(fragmenter.split(1, 9, payload.clone()).unwrap()));
    });

    group.bench_function("roundtrip_12000_mtu_1200", |b| {
        let mut fragmenter = Fragmenter::new(1200);
        let mut reassembler = Reassembler::new(Duration::from_secs(5), ReassemblyLimits::default());
        let now = Instant::now();
        b.iter(|| {
            let frames: Vec<UnreliableFrame> = fragmenter.split(1, 9, payload.clone()).unwrap();
            let mut out = None;
            for f in frames {
                out = reassembler.push(f.peer_id, f.payload, now).unwrap();
            }
            black_box(out)
        });
    });
    group.finish();
}

// ─── Connection ──────────────────────────────────────────────────────────

fn open_connection() -> (Connection, std::sync::Arc<MemoryTransport>) {
    let now = Instant::now();
    let config = TransportConfig::default();
    let (events, _rx) = EventSink::new();
    let conn = Connection::new(
        Side::Server,
        PeerKind::User,
        config.clone(),
        QueuePool::new(2, 2, config.queue_slots, config.queue_bytes),
        events,
        now,
    );
    let tcp = MemoryTransport::new(Channel::Reliable);
    let negotiation = Negotiation {
        peer_id: PeerId(1),
        session_id: SessionId(1),
        max_frame_bytes: config.max_frame_bytes,
        send_timeout: config.send_timeout,
        max_retries: config.max_retry_count,
        encryptor: None,
        compressor: None,
        use_compress: false,
        compression_threshold: 0,
    };
    conn.establish(tcp.clone(), negotiation, SessionAuthAck::rejected(AuthResult::Ok), now)
        .unwrap();
    (conn, tcp)
}

fn bench_connection_send(c: &mut Criterion) {
    let mut group = c.benchmark_group("connection");
    let payload = Bytes::from(vec![0u8; 256]);
    group.throughput(Throughput::Elements(1));

    group.bench_function("send_reliable_256", |b| {
        let (conn, tcp) = open_connection();
        let now = Instant::now();
        let mut sent = 0u32;
        b.iter(|| {
            conn.send(Channel::Reliable, 1, payload.clone(), now).unwrap();
            sent += 1;
            // keep the in-flight set and the loopback buffer bounded
            if sent % 512 == 0 {
                tcp.take_sent();
                for seq in sent - 511..=sent {
                    let ack = tandem_transport::control::ControlMessage::Ack(
                        tandem_transport::control::MessageAck {
                            sequence: VarInt::from_u32(seq),
                        },
                    );
                    conn.on_frame(ack.to_frame(), now);
                }
            }
        });
    });
    group.finish();
}

// ─── Reorder ─────────────────────────────────────────────────────────────

fn bench_reorder(c: &mut Criterion) {
    let mut group = c.benchmark_group("reorder");
    group.throughput(Throughput::Elements(256));
    group.bench_function("reversed_burst_256", |b| {
        b.iter(|| {
            let mut buf = ReorderBuffer::new(1024);
            let mut delivered = 0;
            for seq in (1..=256u64).rev() {
                if let tandem_transport::delivery::Receipt::Deliver(items) = buf.accept(seq, seq) {
                    delivered += items.len();
                }
            }
            black_box(delivered)
        });
    });
    group.finish();
}

criterion_group!(
    benches,
    bench_varint,
    bench_frames,
    bench_fragmentation,
    bench_connection_send,
    bench_reorder,
);
criterion_main!(benches);

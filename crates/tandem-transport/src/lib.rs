//! # tandem-transport
//!
//! Hybrid TCP+UDP peer transport for game networking.
//!
//! Reliable messages travel over a stream with per-peer sequence numbers,
//! acknowledgments, RTO-driven retransmission and in-order delivery through
//! a reorder buffer. Unreliable messages travel as datagrams, fragmented
//! above the negotiated MTU. Peers survive transport loss: the client
//! reconnects, the server parks the peer and resumes it with everything
//! still unacknowledged replayed in order.
//!
//! Everything here is tick-driven and performs no socket I/O of its own.
//! Sockets are supplied through the [`router::Transport`] trait and time is
//! passed in explicitly, so the whole engine runs deterministically under
//! test.
//!
//! ## Crate structure
//!
//! - [`wire`]: VarInt, reliable/unreliable frames, fragment header, stream decoder
//! - [`control`]: Handshake, UDP hello, ping/pong, ack and close messages
//! - [`stats`]: RTT estimator, latency window, quality classification, counters
//! - [`fragment`]: Datagram fragmentation and reassembly
//! - [`queue`]: Generation-tagged send queue and queue pool
//! - [`delivery`]: Sequencing, in-flight tracking, retries, reorder buffer
//! - [`router`]: Channel-to-transport binding and send draining
//! - [`peer`]: Peer ids, states, session ids
//! - [`session`]: One live stream and its frame ingestion
//! - [`connection`]: Peer connection state machine
//! - [`client`]: Connect/reconnect policy and client handshake
//! - [`server`]: Admission, resumption, registries and sweeps
//! - [`codec`]: Encryption/compression seams
//! - [`event`]: Peer notifications
//! - [`dispatch`]: Protocol id to handler table
//! - [`config`]: Transport configuration
//! - [`loopback`]: In-memory transport

pub mod client;
pub mod codec;
pub mod config;
pub mod connection;
pub mod control;
pub mod delivery;
pub mod dispatch;
pub mod error;
pub mod event;
pub mod fragment;
pub mod loopback;
pub mod peer;
pub mod queue;
pub mod router;
pub mod server;
pub mod session;
pub mod stats;
pub mod wire;

pub use client::{Client, Connector};
pub use config::{TransportConfig, TransportConfigInput};
pub use connection::Connection;
pub use dispatch::{DispatchTable, Inbound};
pub use event::{CloseReason, EventSink, PeerEvent};
pub use peer::{PeerId, PeerState};
pub use router::{Channel, Transport};
pub use server::{Server, SweepReport};

//! # Errors
//!
//! Typed failures for every layer of the transport. Decoding never panics;
//! malformed input surfaces as a [`WireError`] and the owning connection is
//! closed with a protocol-error reason.

use std::io;

use thiserror::Error;

use crate::peer::{PeerId, PeerState};
use crate::router::Channel;

// ─── Wire ────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum WireError {
    #[error("frame of {len} bytes exceeds the {max} byte limit")]
    FrameTooLarge { len: usize, max: usize },
    #[error("truncated {0}")]
    Truncated(&'static str),
    #[error("declared payload length {declared} but {actual} bytes follow")]
    LengthMismatch { declared: usize, actual: usize },
    #[error("sequence number out of varint range")]
    InvalidVarInt,
    #[error("unknown flag bits {0:#04x}")]
    UnknownFlags(u8),
    #[error("unknown control message {0:#06x}")]
    UnknownControl(u16),
    #[error("invalid {field} value {value}")]
    InvalidField { field: &'static str, value: u64 },
}

// ─── Queue and pool ──────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum QueueError {
    /// The producer's generation no longer matches the queue.
    #[error("stale enqueue: track {track} but queue is at generation {current}")]
    Stale { track: u64, current: u64 },
    #[error("send queue full ({slots} segments, {bytes} bytes)")]
    Full { slots: usize, bytes: usize },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum PoolError {
    #[error("queue pool exhausted ({limit} queues outstanding)")]
    Exhausted { limit: usize },
}

// ─── Router ──────────────────────────────────────────────────────────────────

#[derive(Debug, Error)]
pub enum RouterError {
    /// A transport or frame was handed to the wrong channel. This is a
    /// programming error, never a network condition.
    #[error("{got:?} transport cannot serve the {expected:?} channel")]
    ChannelMismatch { expected: Channel, got: Channel },
    #[error("no transport bound to the {0:?} channel")]
    Unbound(Channel),
    #[error(transparent)]
    Queue(#[from] QueueError),
    #[error(transparent)]
    Pool(#[from] PoolError),
    #[error("transport write failed: {0}")]
    Io(#[from] io::Error),
}

// ─── Send ────────────────────────────────────────────────────────────────────

#[derive(Debug, Error)]
pub enum SendError {
    #[error("cannot send while {0:?}")]
    InvalidState(PeerState),
    #[error("protocol id {0:#06x} is reserved for control traffic")]
    ReservedProtocol(u16),
    #[error("payload of {len} bytes exceeds the {max} byte frame limit")]
    PayloadTooLarge { len: usize, max: usize },
    #[error("pending queue full ({0} messages)")]
    PendingFull(usize),
    #[error("unreliable channel is not negotiated")]
    UnreliableUnavailable,
    #[error("no peer with id {0}")]
    UnknownPeer(PeerId),
    #[error(transparent)]
    Router(#[from] RouterError),
    #[error(transparent)]
    Codec(#[from] CodecError),
    #[error(transparent)]
    Wire(#[from] WireError),
    #[error(transparent)]
    Fragment(#[from] FragmentError),
}

// ─── Delivery ────────────────────────────────────────────────────────────────

/// An in-flight message ran out of retransmissions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("sequence {sequence} unacknowledged after {retries} retransmissions")]
pub struct RetryExhausted {
    pub sequence: u64,
    pub retries: u32,
}

// ─── Fragments ───────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FragmentError {
    #[error("fragment index {index} outside total {total}")]
    InvalidIndex { index: u16, total: u16 },
    #[error("fragment total {got} disagrees with group total {expected}")]
    TotalMismatch { expected: u16, got: u16 },
    #[error("fragment declares {declared} bytes but carries {actual}")]
    LengthMismatch { declared: usize, actual: usize },
    #[error("message of {len} bytes exceeds the {max} byte limit")]
    TooLarge { len: usize, max: usize },
    #[error("fragment body of {len} bytes exceeds {max} for the mtu")]
    BodyTooLarge { len: usize, max: usize },
    #[error("fragment total {total} exceeds {max}")]
    TooManyFragments { total: u16, max: usize },
    #[error("peer {peer_id} holds {groups} groups and {bytes} bytes of fragments")]
    PeerLimit { peer_id: u32, groups: usize, bytes: usize },
    #[error("mtu {0} leaves no room for a fragment body")]
    MtuTooSmall(usize),
}

// ─── Codec ───────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CodecError {
    #[error("encryption failed: {0}")]
    Encrypt(String),
    #[error("decryption failed: {0}")]
    Decrypt(String),
    #[error("compression failed: {0}")]
    Compress(String),
    #[error("decompression failed: {0}")]
    Decompress(String),
    #[error("key exchange failed: {0}")]
    KeyExchange(String),
    #[error("message is flagged encrypted but no key is installed")]
    MissingKey,
}

// ─── Dispatch ────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum DispatchError {
    #[error("protocol id {0:#06x} registered twice")]
    Duplicate(u16),
    #[error("protocol id {0:#06x} is reserved for control traffic")]
    Reserved(u16),
}

// ─── Config ──────────────────────────────────────────────────────────────────

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("config parse error: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("invalid {field}: {reason}")]
    Invalid { field: &'static str, reason: String },
}

// ─── Admission ───────────────────────────────────────────────────────────────

#[derive(Debug, Error)]
pub enum AdmissionError {
    #[error("connection rejected: {0}")]
    PoolExhausted(#[from] PoolError),
    #[error("server is shutting down")]
    ShuttingDown,
    #[error("transport is not a reliable stream")]
    WrongChannel,
}

/// Socket errors that mean "the other side went away". These close the
/// connection without raising an error notification.
pub fn is_ignorable(err: &io::Error) -> bool {
    matches!(
        err.kind(),
        io::ErrorKind::ConnectionReset
            | io::ErrorKind::ConnectionAborted
            | io::ErrorKind::BrokenPipe
            | io::ErrorKind::NotConnected
            | io::ErrorKind::UnexpectedEof
            | io::ErrorKind::Interrupted
    )
}

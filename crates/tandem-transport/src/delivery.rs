//! # Reliable Delivery
//!
//! Sequencing, acknowledgment and retransmission for the reliable channel,
//! plus the receive-side reorder buffer.
//!
//! ## Send side
//!
//! Every reliable message gets the next sequence number (starting at 1; 0 is
//! the "no ack" sentinel) and stays in the in-flight set until the matching
//! [`MessageAck`](crate::control::MessageAck) arrives. Messages that cannot
//! go out yet (peer not open, in-flight window full) wait in a FIFO pending
//! queue and receive their sequence number when they are actually sent.
//!
//! ## Retry
//!
//! Attempt `n` of a message is due `min(rto * 2^n, send_timeout)` after the
//! previous transmission. A message already retransmitted `max_retries`
//! times that comes due again is reported as [`RetryExhausted`]; the caller
//! closes the connection. Nothing is dropped silently.
//!
//! ## Receive side
//!
//! The [`ReorderBuffer`] hands messages to the application strictly in
//! sequence order, exactly once, walking forward through buffered successors
//! after each gap fills.

use bytes::Bytes;
use quanta::Instant;
use slab::Slab;
use std::collections::{BTreeMap, VecDeque};
use std::time::Duration;

use crate::error::{CodecError, RetryExhausted, RouterError, SendError};
use crate::stats::SenderStats;
use crate::wire::{MessageFlags, ReliableFrame, VarInt};

/// Backoff exponent cap.
const MAX_BACKOFF_SHIFT: u32 = 16;

// ─── Retry Schedule ─────────────────────────────────────────────────────────

/// Capped exponential backoff.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetrySchedule {
    /// Current retransmission timeout from the RTT estimator.
    pub rto: Duration,
    /// Ceiling for any single interval.
    pub send_timeout: Duration,
    pub max_retries: u32,
}

impl RetrySchedule {
    /// Wait before the transmission following `retry_count` retransmissions.
    pub fn interval(&self, retry_count: u32) -> Duration {
        let factor = 1u32 << retry_count.min(MAX_BACKOFF_SHIFT);
        self.rto
            .checked_mul(factor)
            .unwrap_or(self.send_timeout)
            .min(self.send_timeout)
    }
}

// ─── In-Flight Tracking ─────────────────────────────────────────────────────

/// A sent, unacknowledged message.
#[derive(Debug, Clone)]
pub struct InFlightEntry {
    pub sequence: u64,
    /// The encoded frame, resent byte for byte.
    pub frame: Bytes,
    pub sent_at: Instant,
    pub retry_count: u32,
}

/// A reliable message waiting for the connection (or window) to open.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingMessage {
    pub protocol_id: u16,
    pub flags: MessageFlags,
    pub payload: Bytes,
}

/// Result of processing an acknowledgment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AckOutcome {
    /// Entry removed. Carries an RTT sample if it was never retransmitted.
    Acked { rtt: Option<Duration> },
    /// Nothing in flight under that sequence.
    Duplicate,
}

pub struct ReliableSender {
    next_sequence: VarInt,
    entries: Slab<InFlightEntry>,
    /// Sequence → slab key, in send order.
    by_sequence: BTreeMap<u64, usize>,
    pending: VecDeque<PendingMessage>,
    max_in_flight: usize,
    max_pending: usize,
    stats: SenderStats,
}

impl ReliableSender {
    pub fn new(max_in_flight: usize, max_pending: usize) -> Self {
        let max_in_flight = max_in_flight.max(1);
        ReliableSender {
            next_sequence: VarInt::from_u32(1),
            entries: Slab::with_capacity(max_in_flight.min(4096)),
            by_sequence: BTreeMap::new(),
            pending: VecDeque::new(),
            max_in_flight,
            max_pending,
            stats: SenderStats::new(),
        }
    }

    /// Sequence number the next transmitted message will carry.
    pub fn peek_sequence(&self) -> VarInt {
        self.next_sequence
    }

    pub fn in_flight(&self) -> usize {
        self.entries.len()
    }

    pub fn pending(&self) -> usize {
        self.pending.len()
    }

    pub fn window_open(&self) -> bool {
        self.entries.len() < self.max_in_flight
    }

    /// True when a new message may bypass the pending queue.
    pub fn can_send_now(&self) -> bool {
        self.pending.is_empty() && self.window_open()
    }

    pub fn stats(&self) -> &SenderStats {
        &self.stats
    }

    /// Counters for traffic that bypasses the in-flight set (datagrams).
    pub fn stats_mut(&mut self) -> &mut SenderStats {
        &mut self.stats
    }

    pub fn entry(&self, sequence: u64) -> Option<&InFlightEntry> {
        self.by_sequence
            .get(&sequence)
            .and_then(|&key| self.entries.get(key))
    }

    /// Sequences currently in flight, oldest first.
    pub fn in_flight_sequences(&self) -> Vec<u64> {
        self.by_sequence.keys().copied().collect()
    }

    /// Encode `msg` with the next sequence number without consuming it.
    pub fn frame_for(&self, msg: &PendingMessage) -> ReliableFrame {
        ReliableFrame::new(msg.protocol_id, self.next_sequence, msg.payload.clone())
            .with_flags(msg.flags)
    }

    /// Record that the frame built by [`frame_for`](Self::frame_for) was
    /// handed to the router. Consumes the sequence number.
    pub fn commit_sent(&mut self, frame: Bytes, payload_len: usize, now: Instant) -> VarInt {
        let sequence = self.next_sequence;
        self.next_sequence = sequence.next_sequence();
        let key = self.entries.insert(InFlightEntry {
            sequence: sequence.value(),
            frame,
            sent_at: now,
            retry_count: 0,
        });
        self.by_sequence.insert(sequence.value(), key);
        self.stats.messages_sent += 1;
        self.stats.bytes_sent += payload_len as u64;
        sequence
    }

    /// Queue a message for later. Fails once `max_pending` are waiting.
    pub fn queue_pending(&mut self, msg: PendingMessage) -> Result<(), SendError> {
        if self.pending.len() >= self.max_pending {
            return Err(SendError::PendingFull(self.max_pending));
        }
        self.pending.push_back(msg);
        self.stats.messages_queued += 1;
        Ok(())
    }

    /// Send queued messages in FIFO order while the window allows.
    ///
    /// `seal` applies the session's payload transforms at the moment a
    /// message leaves the queue, so messages queued before the handshake
    /// still go out under the negotiated codec. Stops at the first message
    /// the router refuses; that message stays at the head of the queue and
    /// keeps its place.
    pub fn flush_pending(
        &mut self,
        now: Instant,
        mut seal: impl FnMut(&PendingMessage) -> Result<(MessageFlags, Bytes), CodecError>,
        mut emit: impl FnMut(Bytes) -> Result<(), RouterError>,
    ) -> Result<usize, SendError> {
        let mut sent = 0;
        while self.window_open() {
            let Some(msg) = self.pending.front() else {
                break;
            };
            let (flags, body) = seal(msg)?;
            let payload_len = msg.payload.len();
            let frame = ReliableFrame::new(msg.protocol_id, self.next_sequence, body)
                .with_flags(flags)
                .to_bytes();
            emit(frame.clone())?;
            self.pending.pop_front();
            self.commit_sent(frame, payload_len, now);
            sent += 1;
        }
        Ok(sent)
    }

    /// Remove the entry for `sequence`. A second ack for the same sequence
    /// is a no-op.
    pub fn on_ack(&mut self, sequence: u64, now: Instant) -> AckOutcome {
        let Some(key) = self.by_sequence.remove(&sequence) else {
            self.stats.duplicate_acks += 1;
            return AckOutcome::Duplicate;
        };
        let entry = self.entries.remove(key);
        self.stats.messages_acked += 1;
        // Karn: a retransmitted message gives an ambiguous sample
        let rtt = (entry.retry_count == 0).then(|| now.saturating_duration_since(entry.sent_at));
        AckOutcome::Acked { rtt }
    }

    /// Retransmit every entry that has come due.
    ///
    /// Returns the number of frames re-queued. Entries the router refuses
    /// stay due and are tried again on the next tick.
    pub fn retransmit_due(
        &mut self,
        now: Instant,
        schedule: &RetrySchedule,
        mut emit: impl FnMut(Bytes) -> Result<(), RouterError>,
    ) -> Result<usize, RetryExhausted> {
        let mut resent = 0;
        for &key in self.by_sequence.values() {
            let Some(entry) = self.entries.get_mut(key) else {
                continue;
            };
            let due = entry.sent_at + schedule.interval(entry.retry_count);
            if now < due {
                continue;
            }
            if entry.retry_count >= schedule.max_retries {
                return Err(RetryExhausted {
                    sequence: entry.sequence,
                    retries: entry.retry_count,
                });
            }
            if let Err(e) = emit(entry.frame.clone()) {
                tracing::debug!(sequence = entry.sequence, error = %e, "retransmit deferred");
                break;
            }
            entry.retry_count += 1;
            entry.sent_at = now;
            resent += 1;
        }
        self.stats.retransmissions += resent as u64;
        Ok(resent)
    }

    /// Resend every in-flight entry in sequence order over a new transport.
    /// Retry counts restart, since the old transport's losses say nothing
    /// about the new one.
    pub fn replay_in_flight(
        &mut self,
        now: Instant,
        mut emit: impl FnMut(Bytes) -> Result<(), RouterError>,
    ) -> Result<usize, RouterError> {
        let mut replayed = 0;
        for &key in self.by_sequence.values() {
            if let Some(entry) = self.entries.get_mut(key) {
                emit(entry.frame.clone())?;
                entry.sent_at = now;
                entry.retry_count = 0;
                replayed += 1;
            }
        }
        Ok(replayed)
    }

    /// Drop everything in flight and pending. Returns how many messages were
    /// discarded.
    pub fn discard_all(&mut self) -> usize {
        let n = self.entries.len() + self.pending.len();
        self.entries.clear();
        self.by_sequence.clear();
        self.pending.clear();
        n
    }
}

// ─── Reorder Buffer ─────────────────────────────────────────────────────────

/// What happened to an inbound sequenced message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Receipt<T> {
    /// The message and any buffered successors, in order.
    Deliver(Vec<T>),
    /// Held behind a gap.
    Buffered,
    /// Already delivered or already buffered.
    Duplicate,
    /// Buffer full; dropped without acknowledgment so the sender retries.
    Overflow,
}

impl<T> Receipt<T> {
    /// Whether the sender should get an ack for this message.
    pub fn should_ack(&self) -> bool {
        !matches!(self, Receipt::Overflow)
    }
}

pub struct ReorderBuffer<T> {
    next_expected: VarInt,
    buffered: BTreeMap<u64, T>,
    capacity: usize,
}

impl<T> ReorderBuffer<T> {
    pub fn new(capacity: usize) -> Self {
        ReorderBuffer {
            next_expected: VarInt::from_u32(1),
            buffered: BTreeMap::new(),
            capacity,
        }
    }

    pub fn next_expected(&self) -> u64 {
        self.next_expected.value()
    }

    pub fn buffered(&self) -> usize {
        self.buffered.len()
    }

    pub fn accept(&mut self, sequence: u64, item: T) -> Receipt<T> {
        let expected = self.next_expected.value();
        if sequence < expected || self.buffered.contains_key(&sequence) {
            return Receipt::Duplicate;
        }
        if sequence > expected {
            if self.buffered.len() >= self.capacity {
                return Receipt::Overflow;
            }
            self.buffered.insert(sequence, item);
            return Receipt::Buffered;
        }

        let mut out = vec![item];
        self.next_expected = self.next_expected.next_sequence();
        while let Some(next) = self.buffered.remove(&self.next_expected.value()) {
            out.push(next);
            self.next_expected = self.next_expected.next_sequence();
        }
        Receipt::Deliver(out)
    }

    pub fn clear(&mut self) {
        self.buffered.clear();
    }
}

//! # Fragmentation
//!
//! Splits unreliable payloads that would not fit one datagram, and puts them
//! back together on the far side. Every fragment of a message carries the
//! same fragment id, its index and the total count; the body size is uniform
//! except for the last fragment.
//!
//! The reassembler trusts nothing in a fragment header. A group's declared
//! total is checked against what the message limit and MTU allow, parts are
//! stored only as they arrive, and every peer has a budget of open groups
//! and held bytes (bookkeeping included). Incomplete groups are held until
//! [`Reassembler::cleanup`] finds them older than the fragment timeout.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use quanta::Instant;
use std::collections::{BTreeMap, HashMap};
use std::mem::size_of;
use std::time::Duration;

use crate::config::TransportConfig;
use crate::error::FragmentError;
use crate::wire::{FragmentHeader, UnreliableFrame, FRAGMENT_HEADER_LEN, UNRELIABLE_HEADER_LEN};

/// Message limit used until a connection negotiates its own.
pub const DEFAULT_MAX_MESSAGE: usize = 64 * 1024;

/// Accounted cost of one stored part on top of its body.
const PART_OVERHEAD: usize = size_of::<u16>() + size_of::<Bytes>() + 2 * size_of::<usize>();
/// Accounted cost of one open group.
const GROUP_OVERHEAD: usize = size_of::<(u32, u32)>() + size_of::<FragmentGroup>();

/// Body bytes carried by each full fragment at `mtu`.
fn body_len(mtu: usize) -> usize {
    mtu.saturating_sub(UNRELIABLE_HEADER_LEN + FRAGMENT_HEADER_LEN)
        .min(u16::MAX as usize)
}

// ─── Fragmenter ─────────────────────────────────────────────────────────────

pub struct Fragmenter {
    mtu: usize,
    max_message: usize,
    next_fragment_id: u32,
}

impl Fragmenter {
    pub fn new(mtu: usize) -> Self {
        Fragmenter {
            mtu,
            max_message: DEFAULT_MAX_MESSAGE,
            next_fragment_id: 1,
        }
    }

    pub fn with_max_message(mut self, max_message: usize) -> Self {
        self.max_message = max_message;
        self
    }

    pub fn mtu(&self) -> usize {
        self.mtu
    }

    pub fn set_mtu(&mut self, mtu: usize) {
        self.mtu = mtu;
    }

    pub fn set_max_message(&mut self, max_message: usize) {
        self.max_message = max_message;
    }

    /// Largest payload that still fits one unfragmented datagram.
    pub fn max_unfragmented(&self) -> usize {
        self.mtu.saturating_sub(UNRELIABLE_HEADER_LEN)
    }

    /// Body bytes carried by each full fragment.
    pub fn max_body(&self) -> usize {
        body_len(self.mtu)
    }

    /// Frame `payload` for the wire, splitting it when it exceeds the MTU.
    pub fn split(
        &mut self,
        peer_id: u32,
        protocol_id: u16,
        payload: Bytes,
    ) -> Result<Vec<UnreliableFrame>, FragmentError> {
        if payload.len() <= self.max_unfragmented() {
            return Ok(vec![UnreliableFrame {
                peer_id,
                protocol_id,
                fragmented: false,
                payload,
            }]);
        }
        if payload.len() > self.max_message {
            return Err(FragmentError::TooLarge {
                len: payload.len(),
                max: self.max_message,
            });
        }

        let body = self.max_body();
        if body == 0 {
            return Err(FragmentError::MtuTooSmall(self.mtu));
        }
        let count = payload.len().div_ceil(body);
        let total = u16::try_from(count).map_err(|_| FragmentError::TooLarge {
            len: payload.len(),
            max: body * u16::MAX as usize,
        })?;

        let fragment_id = self.next_fragment_id;
        self.next_fragment_id = self.next_fragment_id.wrapping_add(1);

        let frames = payload
            .chunks(body)
            .enumerate()
            .map(|(index, chunk)| {
                let header = FragmentHeader {
                    fragment_id,
                    index: index as u16,
                    total,
                    length: chunk.len() as u16,
                };
                let mut buf = BytesMut::with_capacity(FRAGMENT_HEADER_LEN + chunk.len());
                header.encode(&mut buf);
                buf.put_slice(chunk);
                UnreliableFrame {
                    peer_id,
                    protocol_id,
                    fragmented: true,
                    payload: buf.freeze(),
                }
            })
            .collect();
        Ok(frames)
    }
}

// ─── Reassembler ────────────────────────────────────────────────────────────

/// Bounds on what one peer can make the reassembler hold.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReassemblyLimits {
    /// Datagram size fragments were cut for.
    pub mtu: usize,
    /// Largest message a group may reassemble to.
    pub max_message: usize,
    /// Incomplete groups one peer may have open.
    pub max_groups_per_peer: usize,
    /// Bytes one peer may hold in incomplete groups, bookkeeping included.
    pub max_bytes_per_peer: usize,
}

impl ReassemblyLimits {
    pub fn from_config(config: &TransportConfig) -> Self {
        ReassemblyLimits {
            mtu: config.udp_mtu,
            max_message: config.max_frame_bytes,
            max_groups_per_peer: config.max_fragment_groups,
            max_bytes_per_peer: config.max_fragment_bytes,
        }
    }

    fn max_fragments(&self) -> usize {
        self.max_message.div_ceil(body_len(self.mtu).max(1))
    }

    /// Accounted cost of the largest message a group can legally hold.
    pub fn largest_group(&self) -> usize {
        self.max_message + self.max_fragments() * PART_OVERHEAD + GROUP_OVERHEAD
    }
}

impl Default for ReassemblyLimits {
    fn default() -> Self {
        Self::from_config(&TransportConfig::default())
    }
}

struct FragmentGroup {
    total: u16,
    parts: BTreeMap<u16, Bytes>,
    /// Accounted cost, overhead included.
    cost: usize,
    created_at: Instant,
}

impl FragmentGroup {
    fn is_complete(&self) -> bool {
        self.parts.len() == self.total as usize
    }

    fn assemble(self) -> Bytes {
        let len = self.parts.values().map(Bytes::len).sum();
        let mut out = BytesMut::with_capacity(len);
        for part in self.parts.into_values() {
            out.put_slice(&part);
        }
        out.freeze()
    }
}

#[derive(Debug, Default, Clone, Copy)]
struct PeerUsage {
    groups: usize,
    bytes: usize,
}

/// Inbound fragment groups keyed by (peer id, fragment id).
pub struct Reassembler {
    groups: HashMap<(u32, u32), FragmentGroup>,
    usage: HashMap<u32, PeerUsage>,
    limits: ReassemblyLimits,
    timeout: Duration,
    tracked_bytes: usize,
}

impl Reassembler {
    pub fn new(timeout: Duration, limits: ReassemblyLimits) -> Self {
        Reassembler {
            groups: HashMap::new(),
            usage: HashMap::new(),
            limits,
            timeout,
            tracked_bytes: 0,
        }
    }

    pub fn limits(&self) -> ReassemblyLimits {
        self.limits
    }

    /// Negotiated MTU. Applies to groups opened from now on.
    pub fn set_mtu(&mut self, mtu: usize) {
        self.limits.mtu = mtu;
    }

    pub fn set_max_message(&mut self, max_message: usize) {
        self.limits.max_message = max_message;
    }

    /// Feed one fragmented payload (fragment header included).
    ///
    /// Returns the whole message once every index has arrived. Duplicate
    /// fragments are ignored.
    pub fn push(
        &mut self,
        peer_id: u32,
        mut payload: Bytes,
        now: Instant,
    ) -> Result<Option<Bytes>, FragmentError> {
        let header = FragmentHeader::decode(&mut payload).map_err(|_| FragmentError::LengthMismatch {
            declared: FRAGMENT_HEADER_LEN,
            actual: payload.remaining(),
        })?;
        if header.total == 0 || header.index >= header.total {
            return Err(FragmentError::InvalidIndex {
                index: header.index,
                total: header.total,
            });
        }
        if header.length as usize != payload.len() {
            return Err(FragmentError::LengthMismatch {
                declared: header.length as usize,
                actual: payload.len(),
            });
        }
        let max_body = body_len(self.limits.mtu);
        if max_body == 0 {
            return Err(FragmentError::MtuTooSmall(self.limits.mtu));
        }
        if payload.len() > max_body {
            return Err(FragmentError::BodyTooLarge {
                len: payload.len(),
                max: max_body,
            });
        }
        let max_fragments = self.limits.max_fragments();
        if header.total as usize > max_fragments {
            return Err(FragmentError::TooManyFragments {
                total: header.total,
                max: max_fragments,
            });
        }

        let key = (peer_id, header.fragment_id);
        let opening = match self.groups.get(&key) {
            Some(group) if group.total != header.total => {
                return Err(FragmentError::TotalMismatch {
                    expected: group.total,
                    got: header.total,
                });
            }
            Some(group) if group.parts.contains_key(&header.index) => return Ok(None),
            Some(_) => false,
            None => true,
        };

        let cost = payload.len() + PART_OVERHEAD + if opening { GROUP_OVERHEAD } else { 0 };
        let usage = self.usage.get(&peer_id).copied().unwrap_or_default();
        let over_groups = opening && usage.groups >= self.limits.max_groups_per_peer;
        if over_groups || usage.bytes + cost > self.limits.max_bytes_per_peer {
            return Err(FragmentError::PeerLimit {
                peer_id,
                groups: usage.groups,
                bytes: usage.bytes,
            });
        }

        let group = self.groups.entry(key).or_insert_with(|| FragmentGroup {
            total: header.total,
            parts: BTreeMap::new(),
            cost: 0,
            created_at: now,
        });
        group.parts.insert(header.index, payload);
        group.cost += cost;
        self.tracked_bytes += cost;
        let entry = self.usage.entry(peer_id).or_default();
        entry.bytes += cost;
        if opening {
            entry.groups += 1;
        }

        if !group.is_complete() {
            return Ok(None);
        }
        match self.groups.remove(&key) {
            Some(group) => {
                self.release(peer_id, group.cost);
                Ok(Some(group.assemble()))
            }
            None => Ok(None),
        }
    }

    fn release(&mut self, peer_id: u32, cost: usize) {
        self.tracked_bytes -= cost;
        if let Some(usage) = self.usage.get_mut(&peer_id) {
            usage.groups -= 1;
            usage.bytes -= cost;
            if usage.groups == 0 {
                self.usage.remove(&peer_id);
            }
        }
    }

    /// Drop groups older than the timeout. Returns how many were purged.
    pub fn cleanup(&mut self, now: Instant) -> usize {
        let timeout = self.timeout;
        let mut expired = Vec::new();
        self.groups.retain(|&(peer_id, fragment_id), group| {
            let keep = now.saturating_duration_since(group.created_at) < timeout;
            if !keep {
                tracing::debug!(
                    peer_id,
                    fragment_id,
                    received = group.parts.len(),
                    total = group.total,
                    "purging incomplete fragment group"
                );
                expired.push((peer_id, group.cost));
            }
            keep
        });
        for &(peer_id, cost) in &expired {
            self.release(peer_id, cost);
        }
        expired.len()
    }

    /// Forget every group from one peer.
    pub fn remove_peer(&mut self, peer_id: u32) {
        let mut freed = 0;
        self.groups.retain(|&(owner, _), group| {
            if owner == peer_id {
                freed += group.cost;
                false
            } else {
                true
            }
        });
        self.tracked_bytes -= freed;
        self.usage.remove(&peer_id);
    }

    /// Bytes held in incomplete groups, bookkeeping included.
    pub fn tracked_bytes(&self) -> usize {
        self.tracked_bytes
    }

    pub fn pending_groups(&self) -> usize {
        self.groups.len()
    }
}

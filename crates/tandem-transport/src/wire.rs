//! # Tandem Wire Format
//!
//! Two frame shapes share one protocol-id space.
//!
//! ## Reliable frame (stream transport, variable 8-15 byte header)
//!
//! ```text
//! +----------------+------------------+-------------------+-----------+---------+
//! | ProtocolId u16 | Sequence VarInt  | PayloadLength u32 | Flags u8  | Payload |
//! +----------------+------------------+-------------------+-----------+---------+
//! ```
//!
//! Sequence 0 marks a message that needs no acknowledgment (control traffic).
//!
//! ## Unreliable frame (datagram transport, 11 byte header)
//!
//! ```text
//! +-------------+----------------+-------------------+-----------------+---------+
//! | PeerId u32  | ProtocolId u16 | PayloadLength u32 | Fragmented u8   | Payload |
//! +-------------+----------------+-------------------+-----------------+---------+
//! ```
//!
//! A fragmented payload starts with a 10 byte [`FragmentHeader`].
//!
//! All integers are big-endian.

use bitflags::bitflags;
use bytes::{Buf, BufMut, Bytes, BytesMut};
use std::fmt;

use crate::error::WireError;

// ─── Constants ───────────────────────────────────────────────────────────────

/// Reliable header without the variable-length sequence: 2 + 4 + 1.
pub const RELIABLE_FIXED_HEADER: usize = 7;

/// Largest reliable header: fixed part plus an 8 byte varint.
pub const RELIABLE_MAX_HEADER: usize = RELIABLE_FIXED_HEADER + 8;

/// Unreliable header: 4 + 2 + 4 + 1.
pub const UNRELIABLE_HEADER_LEN: usize = 11;

/// Fragment sub-header: 4 + 2 + 2 + 2.
pub const FRAGMENT_HEADER_LEN: usize = 10;

// ─── VarInt (QUIC-style, RFC 9000 §16) ──────────────────────────────────────

/// A 62-bit variable-length integer encoded in 1, 2, 4, or 8 bytes.
///
/// Encoding:
/// - `0x00..0x3F` → 1 byte  (6 bits)
/// - `0x40..0x3FFF` → 2 bytes (14 bits), prefix `01`
/// - `0x4000..0x3FFF_FFFF` → 4 bytes (30 bits), prefix `10`
/// - `0x4000_0000..0x3FFF_FFFF_FFFF_FFFF` → 8 bytes (62 bits), prefix `11`
#[derive(Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct VarInt(u64);

impl VarInt {
    /// Maximum representable value: 2^62 - 1.
    pub const MAX: u64 = (1 << 62) - 1;

    /// The "no acknowledgment" sequence.
    pub const ZERO: VarInt = VarInt(0);

    /// Create a VarInt, returning `None` if the value exceeds 62 bits.
    #[inline]
    pub fn new(val: u64) -> Option<Self> {
        if val <= Self::MAX {
            Some(VarInt(val))
        } else {
            None
        }
    }

    #[inline]
    pub const fn from_u32(val: u32) -> Self {
        VarInt(val as u64)
    }

    #[inline]
    pub fn value(self) -> u64 {
        self.0
    }

    /// The next reliable sequence number. Wraps back to 1, never to 0.
    #[inline]
    pub fn next_sequence(self) -> Self {
        if self.0 >= Self::MAX {
            VarInt(1)
        } else {
            VarInt(self.0 + 1)
        }
    }

    /// Number of bytes this value encodes to.
    #[inline]
    pub fn encoded_len(self) -> usize {
        if self.0 < 0x40 {
            1
        } else if self.0 < 0x4000 {
            2
        } else if self.0 < 0x4000_0000 {
            4
        } else {
            8
        }
    }

    /// Length announced by the first byte of an encoded varint.
    #[inline]
    pub fn len_from_prefix(first: u8) -> usize {
        1usize << (first >> 6)
    }

    pub fn encode(&self, buf: &mut impl BufMut) {
        match self.encoded_len() {
            1 => buf.put_u8(self.0 as u8),
            2 => buf.put_u16(0x4000 | self.0 as u16),
            4 => buf.put_u32(0x8000_0000 | self.0 as u32),
            _ => buf.put_u64(0xC000_0000_0000_0000 | self.0),
        }
    }

    /// Decode from a buffer. Returns `None` if the buffer is too short.
    pub fn decode(buf: &mut impl Buf) -> Option<Self> {
        if !buf.has_remaining() {
            return None;
        }

        let first = buf.chunk()[0];
        let len = Self::len_from_prefix(first);
        if buf.remaining() < len {
            return None;
        }

        let val = match len {
            1 => {
                buf.advance(1);
                (first & 0x3F) as u64
            }
            2 => (buf.get_u16() & 0x3FFF) as u64,
            4 => (buf.get_u32() & 0x3FFF_FFFF) as u64,
            _ => buf.get_u64() & 0x3FFF_FFFF_FFFF_FFFF,
        };

        Some(VarInt(val))
    }
}

impl fmt::Debug for VarInt {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "VarInt({})", self.0)
    }
}

impl fmt::Display for VarInt {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

// ─── Flags ───────────────────────────────────────────────────────────────────

bitflags! {
    /// Per-message payload transforms.
    #[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct MessageFlags: u8 {
        const ENCRYPTED  = 0b0000_0001;
        const COMPRESSED = 0b0000_0010;
    }
}

// ─── Reliable Frame ──────────────────────────────────────────────────────────

/// One message on the reliable (stream) channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReliableFrame {
    pub protocol_id: u16,
    pub sequence: VarInt,
    pub flags: MessageFlags,
    pub payload: Bytes,
}

impl ReliableFrame {
    pub fn new(protocol_id: u16, sequence: VarInt, payload: Bytes) -> Self {
        ReliableFrame {
            protocol_id,
            sequence,
            flags: MessageFlags::empty(),
            payload,
        }
    }

    /// A sequence-0 frame: never acknowledged, never retransmitted.
    pub fn unsequenced(protocol_id: u16, payload: Bytes) -> Self {
        Self::new(protocol_id, VarInt::ZERO, payload)
    }

    pub fn with_flags(mut self, flags: MessageFlags) -> Self {
        self.flags = flags;
        self
    }

    #[inline]
    pub fn header_len(&self) -> usize {
        RELIABLE_FIXED_HEADER + self.sequence.encoded_len()
    }

    /// Full encoded size. This is what `max_frame_bytes` limits.
    #[inline]
    pub fn encoded_len(&self) -> usize {
        self.header_len() + self.payload.len()
    }

    pub fn encode(&self, buf: &mut impl BufMut) {
        buf.put_u16(self.protocol_id);
        self.sequence.encode(buf);
        buf.put_u32(self.payload.len() as u32);
        buf.put_u8(self.flags.bits());
        buf.put_slice(&self.payload);
    }

    pub fn to_bytes(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(self.encoded_len());
        self.encode(&mut buf);
        buf.freeze()
    }

    /// Decode exactly one frame from a complete buffer.
    pub fn decode(buf: &mut impl Buf) -> Result<Self, WireError> {
        if buf.remaining() < 2 {
            return Err(WireError::Truncated("reliable header"));
        }
        let protocol_id = buf.get_u16();
        let sequence = VarInt::decode(buf).ok_or(WireError::Truncated("sequence"))?;
        if buf.remaining() < 5 {
            return Err(WireError::Truncated("reliable header"));
        }
        let len = buf.get_u32() as usize;
        let raw_flags = buf.get_u8();
        let flags = MessageFlags::from_bits(raw_flags).ok_or(WireError::UnknownFlags(raw_flags))?;
        if buf.remaining() < len {
            return Err(WireError::LengthMismatch {
                declared: len,
                actual: buf.remaining(),
            });
        }
        let payload = buf.copy_to_bytes(len);
        Ok(ReliableFrame {
            protocol_id,
            sequence,
            flags,
            payload,
        })
    }
}

// ─── Frame Decoder ───────────────────────────────────────────────────────────

/// Incremental splitter for the reliable byte stream.
///
/// Bytes are appended as they arrive; whole frames are taken off the front.
/// The frame size limit is checked as soon as the header is readable, so an
/// oversized frame is rejected before its payload is buffered.
#[derive(Debug)]
pub struct FrameDecoder {
    buf: BytesMut,
    max_frame_bytes: usize,
}

impl FrameDecoder {
    pub fn new(max_frame_bytes: usize) -> Self {
        FrameDecoder {
            buf: BytesMut::with_capacity(4096),
            max_frame_bytes,
        }
    }

    pub fn set_max_frame_bytes(&mut self, max: usize) {
        self.max_frame_bytes = max;
    }

    pub fn max_frame_bytes(&self) -> usize {
        self.max_frame_bytes
    }

    pub fn extend(&mut self, data: &[u8]) {
        self.buf.extend_from_slice(data);
    }

    /// Bytes received but not yet part of a returned frame.
    pub fn buffered(&self) -> usize {
        self.buf.len()
    }

    pub fn clear(&mut self) {
        self.buf.clear();
    }

    /// Take the next complete frame, `Ok(None)` if more bytes are needed.
    pub fn next_frame(&mut self) -> Result<Option<ReliableFrame>, WireError> {
        let mut peek = &self.buf[..];
        if peek.len() < 3 {
            return Ok(None);
        }
        let protocol_id = peek.get_u16();
        let varint_len = VarInt::len_from_prefix(peek[0]);
        if peek.len() < varint_len + 5 {
            return Ok(None);
        }
        let sequence = VarInt::decode(&mut peek).ok_or(WireError::InvalidVarInt)?;
        let payload_len = peek.get_u32() as usize;
        let raw_flags = peek.get_u8();

        let header_len = RELIABLE_FIXED_HEADER + varint_len;
        let total = header_len.saturating_add(payload_len);
        if total > self.max_frame_bytes {
            return Err(WireError::FrameTooLarge {
                len: total,
                max: self.max_frame_bytes,
            });
        }
        let flags = MessageFlags::from_bits(raw_flags).ok_or(WireError::UnknownFlags(raw_flags))?;
        if self.buf.len() < total {
            self.buf.reserve(total - self.buf.len());
            return Ok(None);
        }

        let mut frame = self.buf.split_to(total);
        frame.advance(header_len);
        Ok(Some(ReliableFrame {
            protocol_id,
            sequence,
            flags,
            payload: frame.freeze(),
        }))
    }
}

// ─── Unreliable Frame ────────────────────────────────────────────────────────

/// One datagram on the unreliable channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnreliableFrame {
    pub peer_id: u32,
    pub protocol_id: u16,
    pub fragmented: bool,
    pub payload: Bytes,
}

impl UnreliableFrame {
    #[inline]
    pub fn encoded_len(&self) -> usize {
        UNRELIABLE_HEADER_LEN + self.payload.len()
    }

    pub fn encode(&self, buf: &mut impl BufMut) {
        buf.put_u32(self.peer_id);
        buf.put_u16(self.protocol_id);
        buf.put_u32(self.payload.len() as u32);
        buf.put_u8(self.fragmented as u8);
        buf.put_slice(&self.payload);
    }

    pub fn to_bytes(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(self.encoded_len());
        self.encode(&mut buf);
        buf.freeze()
    }

    /// Decode a whole datagram. Trailing or missing bytes are an error.
    pub fn decode(mut buf: Bytes) -> Result<Self, WireError> {
        if buf.len() < UNRELIABLE_HEADER_LEN {
            return Err(WireError::Truncated("unreliable header"));
        }
        let peer_id = buf.get_u32();
        let protocol_id = buf.get_u16();
        let len = buf.get_u32() as usize;
        let fragmented = match buf.get_u8() {
            0 => false,
            1 => true,
            other => {
                return Err(WireError::InvalidField {
                    field: "fragmented flag",
                    value: other as u64,
                })
            }
        };
        if buf.len() != len {
            return Err(WireError::LengthMismatch {
                declared: len,
                actual: buf.len(),
            });
        }
        Ok(UnreliableFrame {
            peer_id,
            protocol_id,
            fragmented,
            payload: buf,
        })
    }
}

// ─── Fragment Header ─────────────────────────────────────────────────────────

/// Prefix of every fragment body inside a fragmented unreliable frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FragmentHeader {
    pub fragment_id: u32,
    pub index: u16,
    pub total: u16,
    /// Body length of this fragment.
    pub length: u16,
}

impl FragmentHeader {
    pub fn encode(&self, buf: &mut impl BufMut) {
        buf.put_u32(self.fragment_id);
        buf.put_u16(self.index);
        buf.put_u16(self.total);
        buf.put_u16(self.length);
    }

    pub fn decode(buf: &mut impl Buf) -> Result<Self, WireError> {
        if buf.remaining() < FRAGMENT_HEADER_LEN {
            return Err(WireError::Truncated("fragment header"));
        }
        Ok(FragmentHeader {
            fragment_id: buf.get_u32(),
            index: buf.get_u16(),
            total: buf.get_u16(),
            length: buf.get_u16(),
        })
    }
}

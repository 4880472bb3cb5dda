//! # Control Messages
//!
//! The handshake, UDP hello, ping/pong, acknowledgment and close messages the
//! transport needs to run itself. They travel as sequence-0 reliable frames
//! (the UDP hello pair as unfragmented datagrams) using protocol ids from the
//! reserved range `0xFF00..=0xFFFF`.

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::error::WireError;
use crate::wire::{ReliableFrame, UnreliableFrame, VarInt};

// ─── Protocol Ids ────────────────────────────────────────────────────────────

/// First protocol id reserved for control traffic.
pub const CONTROL_RANGE_START: u16 = 0xFF00;

pub const AUTH_REQ: u16 = 0xFFF0;
pub const AUTH_ACK: u16 = 0xFFF1;
pub const UDP_HELLO_REQ: u16 = 0xFFF2;
pub const UDP_HELLO_ACK: u16 = 0xFFF3;
pub const PING: u16 = 0xFFF4;
pub const PONG: u16 = 0xFFF5;
pub const MESSAGE_ACK: u16 = 0xFFF6;
pub const CLOSE: u16 = 0xFFF7;

#[inline]
pub fn is_control(protocol_id: u16) -> bool {
    protocol_id >= CONTROL_RANGE_START
}

// ─── Auth Result ─────────────────────────────────────────────────────────────

/// Handshake outcome returned to the connecting side.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum AuthResult {
    Ok = 0,
    InvalidRequest = 1,
    /// No live or parked peer matches the presented session or peer id.
    PeerNotFound = 2,
    SessionExpired = 3,
    KeyExchangeFailed = 4,
    ServerFull = 5,
    UnsupportedOption = 6,
    Rejected = 7,
}

impl AuthResult {
    pub fn from_u8(v: u8) -> Option<Self> {
        Some(match v {
            0 => AuthResult::Ok,
            1 => AuthResult::InvalidRequest,
            2 => AuthResult::PeerNotFound,
            3 => AuthResult::SessionExpired,
            4 => AuthResult::KeyExchangeFailed,
            5 => AuthResult::ServerFull,
            6 => AuthResult::UnsupportedOption,
            7 => AuthResult::Rejected,
            _ => return None,
        })
    }

    pub fn is_ok(self) -> bool {
        self == AuthResult::Ok
    }
}

// ─── Message Bodies ──────────────────────────────────────────────────────────

/// First message on a fresh reliable transport. Empty ids mean "new peer".
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionAuthReq {
    pub session_id: Option<u64>,
    pub peer_id: Option<u32>,
    pub client_public_key: Bytes,
    pub key_size: u16,
}

/// Server reply carrying the negotiated session parameters.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionAuthAck {
    pub result: AuthResult,
    pub session_id: u64,
    pub peer_id: u32,
    pub max_frame_bytes: u32,
    pub send_timeout_ms: u32,
    pub max_retry_count: u16,
    pub server_public_key: Option<Bytes>,
    pub use_encrypt: bool,
    pub use_compress: bool,
    pub compression_threshold: u32,
    /// Datagram port to say hello on; 0 when UDP is disabled.
    pub udp_open_port: u16,
}

impl SessionAuthAck {
    /// A rejection carrying only the result code.
    pub fn rejected(result: AuthResult) -> Self {
        SessionAuthAck {
            result,
            session_id: 0,
            peer_id: 0,
            max_frame_bytes: 0,
            send_timeout_ms: 0,
            max_retry_count: 0,
            server_public_key: None,
            use_encrypt: false,
            use_compress: false,
            compression_threshold: 0,
            udp_open_port: 0,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UdpHelloReq {
    pub session_id: u64,
    pub peer_id: u32,
    pub mtu: u16,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UdpHelloAck {
    pub result: AuthResult,
    pub negotiated_mtu: u16,
}

/// Sender's clock plus its current view of the link, so both ends can log
/// the same quality numbers.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Ping {
    pub send_time_us: u64,
    pub raw_rtt_us: u32,
    pub avg_rtt_us: u32,
    pub jitter_us: u32,
    pub packet_loss_rate: f32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Pong {
    /// Echo of [`Ping::send_time_us`].
    pub send_time_us: u64,
    pub server_time_us: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MessageAck {
    pub sequence: VarInt,
}

// ─── Control Message ─────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq)]
pub enum ControlMessage {
    AuthReq(SessionAuthReq),
    AuthAck(SessionAuthAck),
    UdpHelloReq(UdpHelloReq),
    UdpHelloAck(UdpHelloAck),
    Ping(Ping),
    Pong(Pong),
    Ack(MessageAck),
    Close,
}

impl ControlMessage {
    pub fn protocol_id(&self) -> u16 {
        match self {
            ControlMessage::AuthReq(_) => AUTH_REQ,
            ControlMessage::AuthAck(_) => AUTH_ACK,
            ControlMessage::UdpHelloReq(_) => UDP_HELLO_REQ,
            ControlMessage::UdpHelloAck(_) => UDP_HELLO_ACK,
            ControlMessage::Ping(_) => PING,
            ControlMessage::Pong(_) => PONG,
            ControlMessage::Ack(_) => MESSAGE_ACK,
            ControlMessage::Close => CLOSE,
        }
    }

    pub fn encode_body(&self, buf: &mut BytesMut) {
        match self {
            ControlMessage::AuthReq(m) => {
                put_opt_u64(buf, m.session_id);
                put_opt_u64(buf, m.peer_id.map(u64::from));
                put_blob(buf, &m.client_public_key);
                buf.put_u16(m.key_size);
            }
            ControlMessage::AuthAck(m) => {
                buf.put_u8(m.result as u8);
                buf.put_u64(m.session_id);
                buf.put_u32(m.peer_id);
                buf.put_u32(m.max_frame_bytes);
                buf.put_u32(m.send_timeout_ms);
                buf.put_u16(m.max_retry_count);
                match &m.server_public_key {
                    Some(key) => {
                        buf.put_u8(1);
                        put_blob(buf, key);
                    }
                    None => buf.put_u8(0),
                }
                buf.put_u8(m.use_encrypt as u8);
                buf.put_u8(m.use_compress as u8);
                buf.put_u32(m.compression_threshold);
                buf.put_u16(m.udp_open_port);
            }
            ControlMessage::UdpHelloReq(m) => {
                buf.put_u64(m.session_id);
                buf.put_u32(m.peer_id);
                buf.put_u16(m.mtu);
            }
            ControlMessage::UdpHelloAck(m) => {
                buf.put_u8(m.result as u8);
                buf.put_u16(m.negotiated_mtu);
            }
            ControlMessage::Ping(m) => {
                buf.put_u64(m.send_time_us);
                buf.put_u32(m.raw_rtt_us);
                buf.put_u32(m.avg_rtt_us);
                buf.put_u32(m.jitter_us);
                buf.put_f32(m.packet_loss_rate);
            }
            ControlMessage::Pong(m) => {
                buf.put_u64(m.send_time_us);
                buf.put_u64(m.server_time_us);
            }
            ControlMessage::Ack(m) => m.sequence.encode(buf),
            ControlMessage::Close => {}
        }
    }

    pub fn body(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(32);
        self.encode_body(&mut buf);
        buf.freeze()
    }

    /// Sequence-0 reliable frame carrying this message.
    pub fn to_frame(&self) -> ReliableFrame {
        ReliableFrame::unsequenced(self.protocol_id(), self.body())
    }

    pub fn to_datagram(&self, peer_id: u32) -> UnreliableFrame {
        UnreliableFrame {
            peer_id,
            protocol_id: self.protocol_id(),
            fragmented: false,
            payload: self.body(),
        }
    }

    /// Decode the body of a control frame. The body must be consumed exactly.
    pub fn decode(protocol_id: u16, mut body: Bytes) -> Result<Self, WireError> {
        let buf = &mut body;
        let msg = match protocol_id {
            AUTH_REQ => {
                let session_id = get_opt_u64(buf)?;
                let peer_id = get_opt_u64(buf)?
                    .map(|v| {
                        u32::try_from(v).map_err(|_| WireError::InvalidField {
                            field: "peer id",
                            value: v,
                        })
                    })
                    .transpose()?;
                let client_public_key = get_blob(buf)?;
                need(buf, 2, "auth request")?;
                ControlMessage::AuthReq(SessionAuthReq {
                    session_id,
                    peer_id,
                    client_public_key,
                    key_size: buf.get_u16(),
                })
            }
            AUTH_ACK => {
                need(buf, 1 + 8 + 4 + 4 + 4 + 2 + 1, "auth ack")?;
                let result = get_result(buf)?;
                let session_id = buf.get_u64();
                let peer_id = buf.get_u32();
                let max_frame_bytes = buf.get_u32();
                let send_timeout_ms = buf.get_u32();
                let max_retry_count = buf.get_u16();
                let server_public_key = match get_bool(buf, "server key flag")? {
                    true => Some(get_blob(buf)?),
                    false => None,
                };
                need(buf, 1 + 1 + 4 + 2, "auth ack")?;
                ControlMessage::AuthAck(SessionAuthAck {
                    result,
                    session_id,
                    peer_id,
                    max_frame_bytes,
                    send_timeout_ms,
                    max_retry_count,
                    server_public_key,
                    use_encrypt: get_bool(buf, "use_encrypt")?,
                    use_compress: get_bool(buf, "use_compress")?,
                    compression_threshold: buf.get_u32(),
                    udp_open_port: buf.get_u16(),
                })
            }
            UDP_HELLO_REQ => {
                need(buf, 14, "udp hello")?;
                ControlMessage::UdpHelloReq(UdpHelloReq {
                    session_id: buf.get_u64(),
                    peer_id: buf.get_u32(),
                    mtu: buf.get_u16(),
                })
            }
            UDP_HELLO_ACK => {
                need(buf, 3, "udp hello ack")?;
                ControlMessage::UdpHelloAck(UdpHelloAck {
                    result: get_result(buf)?,
                    negotiated_mtu: buf.get_u16(),
                })
            }
            PING => {
                need(buf, 24, "ping")?;
                ControlMessage::Ping(Ping {
                    send_time_us: buf.get_u64(),
                    raw_rtt_us: buf.get_u32(),
                    avg_rtt_us: buf.get_u32(),
                    jitter_us: buf.get_u32(),
                    packet_loss_rate: buf.get_f32(),
                })
            }
            PONG => {
                need(buf, 16, "pong")?;
                ControlMessage::Pong(Pong {
                    send_time_us: buf.get_u64(),
                    server_time_us: buf.get_u64(),
                })
            }
            MESSAGE_ACK => {
                let sequence = VarInt::decode(buf).ok_or(WireError::Truncated("ack"))?;
                ControlMessage::Ack(MessageAck { sequence })
            }
            CLOSE => ControlMessage::Close,
            other => return Err(WireError::UnknownControl(other)),
        };
        if body.has_remaining() {
            return Err(WireError::LengthMismatch {
                declared: 0,
                actual: body.remaining(),
            });
        }
        Ok(msg)
    }
}

// ─── Field Helpers ───────────────────────────────────────────────────────────

fn need(buf: &Bytes, n: usize, what: &'static str) -> Result<(), WireError> {
    if buf.remaining() < n {
        Err(WireError::Truncated(what))
    } else {
        Ok(())
    }
}

fn put_opt_u64(buf: &mut BytesMut, v: Option<u64>) {
    match v {
        Some(v) => {
            buf.put_u8(1);
            buf.put_u64(v);
        }
        None => buf.put_u8(0),
    }
}

fn get_opt_u64(buf: &mut Bytes) -> Result<Option<u64>, WireError> {
    if get_bool(buf, "option flag")? {
        need(buf, 8, "optional id")?;
        Ok(Some(buf.get_u64()))
    } else {
        Ok(None)
    }
}

fn put_blob(buf: &mut BytesMut, data: &[u8]) {
    buf.put_u16(data.len() as u16);
    buf.put_slice(data);
}

fn get_blob(buf: &mut Bytes) -> Result<Bytes, WireError> {
    need(buf, 2, "blob length")?;
    let len = buf.get_u16() as usize;
    need(buf, len, "blob")?;
    Ok(buf.split_to(len))
}

fn get_bool(buf: &mut Bytes, field: &'static str) -> Result<bool, WireError> {
    need(buf, 1, field)?;
    match buf.get_u8() {
        0 => Ok(false),
        1 => Ok(true),
        value => Err(WireError::InvalidField {
            field,
            value: value as u64,
        }),
    }
}

fn get_result(buf: &mut Bytes) -> Result<AuthResult, WireError> {
    let raw = buf.get_u8();
    AuthResult::from_u8(raw).ok_or(WireError::InvalidField {
        field: "auth result",
        value: raw as u64,
    })
}

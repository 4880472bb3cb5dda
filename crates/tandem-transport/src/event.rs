//! # Peer Events
//!
//! Notifications are delivered over a crossbeam channel that the embedding
//! application polls. Per connection they arrive in the order they happened;
//! `Connected` is sent exactly once per successful handshake.

use bytes::Bytes;
use crossbeam_channel::{Receiver, Sender};
use std::fmt;

use crate::control::AuthResult;
use crate::peer::{PeerId, PeerState};
use crate::router::Channel;

/// Why a connection ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseReason {
    /// Local `close()`.
    Normal,
    /// The remote side sent `Close`.
    RemoteClosed,
    /// Malformed frame, oversized frame, or an unexpected message.
    ProtocolError,
    HandshakeRejected(AuthResult),
    HandshakeTimeout,
    /// Connect attempts exhausted before the first handshake.
    ConnectFailed,
    /// Reconnect attempts exhausted.
    ReconnectFailed,
    RetryLimitExceeded,
    CodecFailure,
    /// The waiting-reconnect window ran out.
    WaitingExpired,
    IdleTimeout,
    Shutdown,
}

impl CloseReason {
    /// Whether the close handshake is attempted before the transport drops.
    pub fn is_graceful(self) -> bool {
        matches!(self, CloseReason::Normal | CloseReason::Shutdown)
    }

    /// Whether the closure is reported through an `Error` event as well.
    pub fn is_error(self) -> bool {
        matches!(
            self,
            CloseReason::ProtocolError
                | CloseReason::HandshakeRejected(_)
                | CloseReason::HandshakeTimeout
                | CloseReason::ConnectFailed
                | CloseReason::ReconnectFailed
                | CloseReason::RetryLimitExceeded
                | CloseReason::CodecFailure
        )
    }
}

impl fmt::Display for CloseReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CloseReason::HandshakeRejected(result) => write!(f, "handshake rejected ({result:?})"),
            other => write!(f, "{other:?}"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PeerEvent {
    StateChanged {
        peer_id: PeerId,
        from: PeerState,
        to: PeerState,
    },
    Connected {
        peer_id: PeerId,
    },
    /// Transport lost; state is retained while a reconnect is possible.
    Offline {
        peer_id: PeerId,
    },
    Disconnected {
        peer_id: PeerId,
        reason: CloseReason,
    },
    Error {
        peer_id: PeerId,
        message: String,
    },
    MessageReceived {
        peer_id: PeerId,
        channel: Channel,
        protocol_id: u16,
        payload: Bytes,
    },
}

/// Cloneable sending half shared by every connection of one endpoint.
#[derive(Clone)]
pub struct EventSink {
    tx: Sender<PeerEvent>,
}

impl EventSink {
    pub fn new() -> (Self, Receiver<PeerEvent>) {
        let (tx, rx) = crossbeam_channel::unbounded();
        (EventSink { tx }, rx)
    }

    pub fn emit(&self, event: PeerEvent) {
        // A dropped receiver means nobody is listening.
        let _ = self.tx.send(event);
    }
}

impl fmt::Debug for EventSink {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventSink").field("queued", &self.tx.len()).finish()
    }
}

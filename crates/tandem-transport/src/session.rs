//! # Session
//!
//! A session is one live reliable transport. It exists from the moment the
//! stream is accepted (or connected) and is bound to a peer once the
//! handshake names one. Reconnects create a new session for the same peer.
//!
//! Inbound bytes are cut into frames here, one receive at a time: the
//! `receiving` flag is held for the length of [`Session::ingest`] and is
//! what lets the owner tell a quiescent session from one still mid-read.

use quanta::Instant;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};

use crate::error::WireError;
use crate::peer::PeerId;
use crate::queue::PooledQueue;
use crate::router::Transport;
use crate::wire::{FrameDecoder, ReliableFrame};

/// Registry key of a session. Unrelated to the wire-level session id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SessionKey(pub u64);

pub struct Session {
    key: SessionKey,
    transport: Arc<dyn Transport>,
    decoder: Mutex<FrameDecoder>,
    receiving: AtomicBool,
    closed: AtomicBool,
    peer: AtomicU32,
    /// Send queue rented at admission, handed to the peer on first bind.
    queue: Mutex<Option<PooledQueue>>,
    opened_at: Instant,
}

/// Frames cut from one receive.
#[derive(Debug)]
pub struct Ingested {
    pub frames: Vec<ReliableFrame>,
    /// Set when the stream turned out to be malformed. Frames decoded before
    /// the bad one are still returned.
    pub error: Option<WireError>,
}

impl Session {
    pub fn new(
        key: SessionKey,
        transport: Arc<dyn Transport>,
        max_frame_bytes: usize,
        queue: Option<PooledQueue>,
        now: Instant,
    ) -> Self {
        Session {
            key,
            transport,
            decoder: Mutex::new(FrameDecoder::new(max_frame_bytes)),
            receiving: AtomicBool::new(false),
            closed: AtomicBool::new(false),
            peer: AtomicU32::new(0),
            queue: Mutex::new(queue),
            opened_at: now,
        }
    }

    pub fn key(&self) -> SessionKey {
        self.key
    }

    pub fn transport(&self) -> &Arc<dyn Transport> {
        &self.transport
    }

    pub fn opened_at(&self) -> Instant {
        self.opened_at
    }

    pub fn peer(&self) -> Option<PeerId> {
        let id = PeerId(self.peer.load(Ordering::Acquire));
        id.is_assigned().then_some(id)
    }

    /// Attach to `peer`. A session binds at most once.
    pub fn bind(&self, peer: PeerId) -> bool {
        self.peer
            .compare_exchange(0, peer.get(), Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    pub fn take_queue(&self) -> Option<PooledQueue> {
        self.queue.lock().ok().and_then(|mut q| q.take())
    }

    pub fn set_max_frame_bytes(&self, max: usize) {
        if let Ok(mut decoder) = self.decoder.lock() {
            decoder.set_max_frame_bytes(max);
        }
    }

    /// Cut `data` into frames. Stops at the first malformed frame; the
    /// owner closes the connection with a protocol error.
    pub fn ingest(&self, data: &[u8]) -> Ingested {
        if self.is_closed() {
            return Ingested {
                frames: Vec::new(),
                error: None,
            };
        }
        self.receiving.store(true, Ordering::Release);
        let mut frames = Vec::new();
        let mut error = None;
        match self.decoder.lock() {
            Ok(mut decoder) => {
                decoder.extend(data);
                loop {
                    match decoder.next_frame() {
                        Ok(Some(frame)) => frames.push(frame),
                        Ok(None) => break,
                        Err(e) => {
                            decoder.clear();
                            error = Some(e);
                            break;
                        }
                    }
                }
            }
            Err(_) => error = Some(WireError::Truncated("poisoned decoder")),
        }
        self.receiving.store(false, Ordering::Release);
        Ingested { frames, error }
    }

    pub fn is_receiving(&self) -> bool {
        self.receiving.load(Ordering::Acquire)
    }

    /// Close the transport once. Returns false if it was already closed.
    pub fn close(&self) -> bool {
        if self.closed.swap(true, Ordering::AcqRel) {
            return false;
        }
        self.transport.close();
        drop(self.take_queue());
        true
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }
}

//! # Peer Identity & State
//!
//! ```text
//!   None ──connect──▶ Connecting ──open──▶ Handshake ──ack──▶ Open
//!                                                          │
//!                              ┌───────── transport lost ──┤
//!                              ▼                           ▼
//!                  Reconnecting (client)        Offline (server)
//!                              │                           │
//!                              └──── resumed ──▶ Open ◀────┘
//!
//!   any ──close──▶ Closing ──ack/grace──▶ Closed
//! ```
//!
//! Transitions go through [`AtomicPeerState::transition`], a compare-and-swap
//! on the state code. A transition from the wrong state does nothing.

use std::collections::{BTreeSet, HashSet};
use std::fmt;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Mutex;

// ─── Identity ───────────────────────────────────────────────────────────────

/// Recyclable peer identity. 0 means "unassigned" and is never allocated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct PeerId(pub u32);

impl PeerId {
    pub const UNASSIGNED: PeerId = PeerId(0);

    pub fn get(self) -> u32 {
        self.0
    }

    pub fn is_assigned(self) -> bool {
        self.0 != 0
    }
}

impl fmt::Display for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Random per-session token presented on reconnect.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SessionId(pub u64);

impl SessionId {
    /// A fresh nonzero session id.
    pub fn generate() -> Self {
        loop {
            let id = rand::random::<u64>();
            if id != 0 {
                return SessionId(id);
            }
        }
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:016x}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerKind {
    /// An end user connected to this server.
    User,
    /// Another server.
    Server,
}

// ─── Id Allocator ───────────────────────────────────────────────────────────

/// Hands out peer ids, lowest free id first.
///
/// Owned by one server instance. An id goes back on the free list only when
/// [`release`](PeerIdAllocator::release) is called, which the server does
/// after the peer has fully left (never while it is online or parked).
pub struct PeerIdAllocator {
    inner: Mutex<AllocState>,
}

struct AllocState {
    free: BTreeSet<u32>,
    live: HashSet<u32>,
    next: u32,
    max: u32,
}

impl PeerIdAllocator {
    pub fn new(max: u32) -> Self {
        PeerIdAllocator {
            inner: Mutex::new(AllocState {
                free: BTreeSet::new(),
                live: HashSet::new(),
                next: 1,
                max: max.max(1),
            }),
        }
    }

    fn state(&self) -> std::sync::MutexGuard<'_, AllocState> {
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// `None` when every id up to the maximum is live.
    pub fn allocate(&self) -> Option<PeerId> {
        let mut st = self.state();
        let id = match st.free.pop_first() {
            Some(id) => id,
            None if st.next <= st.max => {
                let id = st.next;
                st.next += 1;
                id
            }
            None => return None,
        };
        st.live.insert(id);
        Some(PeerId(id))
    }

    /// Return an id. Releasing an id that is not live is a no-op.
    pub fn release(&self, id: PeerId) -> bool {
        let mut st = self.state();
        if st.live.remove(&id.0) {
            st.free.insert(id.0);
            true
        } else {
            false
        }
    }

    pub fn live_count(&self) -> usize {
        self.state().live.len()
    }
}

// ─── Peer State ─────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum PeerState {
    None = 0,
    Connecting = 1,
    Handshake = 2,
    Open = 3,
    /// Client lost its transport and is retrying.
    Reconnecting = 4,
    /// Server parked the peer awaiting a resuming transport.
    Offline = 5,
    Closing = 6,
    Closed = 7,
}

impl PeerState {
    fn from_u8(v: u8) -> Self {
        match v {
            0 => PeerState::None,
            1 => PeerState::Connecting,
            2 => PeerState::Handshake,
            3 => PeerState::Open,
            4 => PeerState::Reconnecting,
            5 => PeerState::Offline,
            6 => PeerState::Closing,
            _ => PeerState::Closed,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            PeerState::None => "none",
            PeerState::Connecting => "connecting",
            PeerState::Handshake => "handshake",
            PeerState::Open => "open",
            PeerState::Reconnecting => "reconnecting",
            PeerState::Offline => "offline",
            PeerState::Closing => "closing",
            PeerState::Closed => "closed",
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, PeerState::Closing | PeerState::Closed)
    }
}

/// State code shared between the tick worker and I/O callbacks.
#[derive(Debug)]
pub struct AtomicPeerState(AtomicU8);

impl AtomicPeerState {
    pub fn new(state: PeerState) -> Self {
        AtomicPeerState(AtomicU8::new(state as u8))
    }

    pub fn load(&self) -> PeerState {
        PeerState::from_u8(self.0.load(Ordering::Acquire))
    }

    /// Move `from → to`. False (and no change) if the state was not `from`.
    pub fn transition(&self, from: PeerState, to: PeerState) -> bool {
        self.0
            .compare_exchange(from as u8, to as u8, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    /// Move to `to` from any state not in `forbidden`. Returns the state
    /// that was replaced, or `None` if the current state was forbidden.
    pub fn transition_unless(&self, forbidden: &[PeerState], to: PeerState) -> Option<PeerState> {
        let mut current = self.0.load(Ordering::Acquire);
        loop {
            let state = PeerState::from_u8(current);
            if forbidden.contains(&state) {
                return None;
            }
            match self.0.compare_exchange_weak(
                current,
                to as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return Some(state),
                Err(actual) => current = actual,
            }
        }
    }
}

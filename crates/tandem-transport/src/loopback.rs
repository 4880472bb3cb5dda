//! In-memory [`Transport`] for tests and simulations. Every write is
//! recorded and can be taken back out and fed to the other side by hand,
//! which makes reordering, duplication and loss easy to script.

use bytes::{BufMut, Bytes, BytesMut};
use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use crate::router::{Channel, Transport};

pub struct MemoryTransport {
    channel: Channel,
    sent: Mutex<Vec<Bytes>>,
    failure: Mutex<Option<io::ErrorKind>>,
    closed: AtomicBool,
}

impl MemoryTransport {
    pub fn new(channel: Channel) -> Arc<Self> {
        Arc::new(MemoryTransport {
            channel,
            sent: Mutex::new(Vec::new()),
            failure: Mutex::new(None),
            closed: AtomicBool::new(false),
        })
    }

    /// Writes since the last call, one entry per `send`.
    pub fn take_sent(&self) -> Vec<Bytes> {
        match self.sent.lock() {
            Ok(mut sent) => std::mem::take(&mut *sent),
            Err(poisoned) => std::mem::take(&mut *poisoned.into_inner()),
        }
    }

    /// Writes since the last call, concatenated as a byte stream.
    pub fn take_stream(&self) -> Bytes {
        let mut out = BytesMut::new();
        for chunk in self.take_sent() {
            out.put_slice(&chunk);
        }
        out.freeze()
    }

    /// Make every later `send` fail with `kind`.
    pub fn fail_with(&self, kind: io::ErrorKind) {
        if let Ok(mut failure) = self.failure.lock() {
            *failure = Some(kind);
        }
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }
}

impl Transport for MemoryTransport {
    fn channel(&self) -> Channel {
        self.channel
    }

    fn send(&self, data: &[u8]) -> io::Result<()> {
        if self.is_closed() {
            return Err(io::ErrorKind::NotConnected.into());
        }
        if let Some(kind) = self.failure.lock().ok().and_then(|f| *f) {
            return Err(kind.into());
        }
        self.sent
            .lock()
            .map_err(|_| io::Error::other("memory transport poisoned"))?
            .push(Bytes::copy_from_slice(data));
        Ok(())
    }

    fn close(&self) {
        self.closed.store(true, Ordering::Release);
    }

    fn describe(&self) -> String {
        format!("memory {:?}", self.channel)
    }
}

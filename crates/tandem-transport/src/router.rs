//! # Channel Router
//!
//! Binds the two logical channels to whatever transports are currently live
//! and moves queued bytes onto them.
//!
//! Each channel slot holds the transport and the send buffer in separate
//! [`ArcSwapOption`]s. Rebinding swaps only the transport, so bytes already
//! queued are written once, to whichever transport is bound when the writer
//! gets to them. Unbinding resets the queue; reliable data is recovered from
//! the delivery engine's in-flight set instead.
//!
//! Writers take an `Arc` to the buffer for the length of a drain, so a buffer
//! released by [`ChannelRouter::release`] goes back to the pool only after
//! the last writer has finished with it.

use arc_swap::ArcSwapOption;
use bytes::{Bytes, BytesMut};
use std::fmt;
use std::io;
use std::sync::Arc;

use crate::error::{PoolError, RouterError};
use crate::queue::{PooledQueue, QueuePool, SendBuffer};

/// Largest coalesced write on the reliable channel.
pub const MAX_STREAM_BATCH: usize = 64 * 1024;

// ─── Channel ────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Channel {
    /// Ordered, acknowledged, retried. Stream backed.
    Reliable,
    /// Best effort, fragmentable. Datagram backed.
    Unreliable,
}

// ─── Transport ──────────────────────────────────────────────────────────────

/// A live socket, supplied by the runtime.
///
/// `send` must not block indefinitely. On a datagram transport every call is
/// exactly one datagram.
pub trait Transport: Send + Sync {
    fn channel(&self) -> Channel;
    fn send(&self, data: &[u8]) -> io::Result<()>;
    /// Shut the underlying socket. Must be idempotent.
    fn close(&self);
    fn describe(&self) -> String {
        format!("{:?} transport", self.channel())
    }
}

/// Identity of two transport handles, by the object they point at.
pub fn same_transport(a: &Arc<dyn Transport>, b: &Arc<dyn Transport>) -> bool {
    std::ptr::eq(Arc::as_ptr(a) as *const (), Arc::as_ptr(b) as *const ())
}

struct Bound {
    transport: Arc<dyn Transport>,
}

struct ChannelSlot {
    transport: ArcSwapOption<Bound>,
    buffer: ArcSwapOption<SendBuffer>,
}

impl ChannelSlot {
    fn new() -> Self {
        ChannelSlot {
            transport: ArcSwapOption::empty(),
            buffer: ArcSwapOption::empty(),
        }
    }
}

// ─── Router ─────────────────────────────────────────────────────────────────

pub struct ChannelRouter {
    reliable: ChannelSlot,
    unreliable: ChannelSlot,
    pool: QueuePool,
}

impl fmt::Debug for ChannelRouter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ChannelRouter")
            .field("reliable_bound", &self.is_bound(Channel::Reliable))
            .field("unreliable_bound", &self.is_bound(Channel::Unreliable))
            .field("reliable_queued", &self.queued(Channel::Reliable))
            .finish()
    }
}

impl ChannelRouter {
    pub fn new(pool: QueuePool) -> Self {
        ChannelRouter {
            reliable: ChannelSlot::new(),
            unreliable: ChannelSlot::new(),
            pool,
        }
    }

    fn slot(&self, channel: Channel) -> &ChannelSlot {
        match channel {
            Channel::Reliable => &self.reliable,
            Channel::Unreliable => &self.unreliable,
        }
    }

    /// Attach `transport` to `channel`, returning the one it replaced.
    pub fn bind(
        &self,
        channel: Channel,
        transport: Arc<dyn Transport>,
    ) -> Result<Option<Arc<dyn Transport>>, RouterError> {
        let got = transport.channel();
        if got != channel {
            return Err(RouterError::ChannelMismatch {
                expected: channel,
                got,
            });
        }
        let previous = self
            .slot(channel)
            .transport
            .swap(Some(Arc::new(Bound { transport })));
        Ok(previous.map(|b| Arc::clone(&b.transport)))
    }

    /// Detach the transport and discard queued bytes.
    pub fn unbind(&self, channel: Channel) -> Option<Arc<dyn Transport>> {
        let slot = self.slot(channel);
        let previous = slot.transport.swap(None);
        if let Some(buffer) = slot.buffer.load_full() {
            buffer.queue().reset();
        }
        previous.map(|b| Arc::clone(&b.transport))
    }

    /// Detach the transport only if it is still `expected`.
    pub fn unbind_if(&self, channel: Channel, expected: &Arc<dyn Transport>) -> bool {
        if self.is_bound_to(channel, expected) {
            self.unbind(channel);
            true
        } else {
            false
        }
    }

    pub fn is_bound(&self, channel: Channel) -> bool {
        self.slot(channel).transport.load().is_some()
    }

    pub fn is_bound_to(&self, channel: Channel, transport: &Arc<dyn Transport>) -> bool {
        match &*self.slot(channel).transport.load() {
            Some(bound) => same_transport(&bound.transport, transport),
            None => false,
        }
    }

    pub fn transport(&self, channel: Channel) -> Option<Arc<dyn Transport>> {
        self.slot(channel)
            .transport
            .load_full()
            .map(|b| Arc::clone(&b.transport))
    }

    /// Install a queue rented ahead of time (at admission).
    pub fn install_queue(&self, channel: Channel, queue: PooledQueue) {
        self.slot(channel)
            .buffer
            .store(Some(Arc::new(SendBuffer::new(queue))));
    }

    pub fn has_queue(&self, channel: Channel) -> bool {
        self.slot(channel).buffer.load().is_some()
    }

    fn buffer(&self, channel: Channel) -> Result<Arc<SendBuffer>, PoolError> {
        let slot = self.slot(channel);
        if let Some(buffer) = slot.buffer.load_full() {
            return Ok(buffer);
        }
        let fresh = Arc::new(SendBuffer::new(self.pool.rent()?));
        let prev = slot
            .buffer
            .compare_and_swap(&None::<Arc<SendBuffer>>, Some(Arc::clone(&fresh)));
        // Lost the race: use the winner's buffer, ours goes back to the pool.
        Ok(match &*prev {
            Some(winner) => Arc::clone(winner),
            None => fresh,
        })
    }

    /// Queue bytes on a bound channel.
    pub fn enqueue(&self, channel: Channel, data: Bytes) -> Result<(), RouterError> {
        if !self.is_bound(channel) {
            return Err(RouterError::Unbound(channel));
        }
        let buffer = self.buffer(channel)?;
        let queue = buffer.queue();
        queue.push(queue.track(), data)?;
        Ok(())
    }

    /// Queue and immediately try to write.
    pub fn send(&self, channel: Channel, data: Bytes) -> Result<(), RouterError> {
        self.enqueue(channel, data)?;
        self.flush(channel).map(|_| ())
    }

    /// Drain the channel's queue onto its transport.
    ///
    /// Only one caller writes at a time; others return `Ok(0)` immediately
    /// and their bytes are picked up by the active writer, which re-checks
    /// the queue after going idle. Returns the number of writes issued.
    pub fn flush(&self, channel: Channel) -> Result<usize, RouterError> {
        let Some(buffer) = self.slot(channel).buffer.load_full() else {
            return Ok(0);
        };
        let mut writes = 0;
        loop {
            if !buffer.try_begin_send() {
                return Ok(writes);
            }
            let result = self.drain(channel, &buffer);
            let more = buffer.end_send();
            writes += result?;
            if !more || !self.is_bound(channel) {
                return Ok(writes);
            }
        }
    }

    fn drain(&self, channel: Channel, buffer: &SendBuffer) -> Result<usize, RouterError> {
        let Some(bound) = self.slot(channel).transport.load_full() else {
            return Ok(0);
        };
        let transport = &bound.transport;
        let queue = buffer.queue();
        let mut writes = 0;
        match channel {
            Channel::Reliable => {
                let mut batch = BytesMut::with_capacity(MAX_STREAM_BATCH);
                while queue.pop_batch(&mut batch, MAX_STREAM_BATCH) > 0 {
                    transport.send(&batch)?;
                    batch.clear();
                    writes += 1;
                }
            }
            Channel::Unreliable => {
                while let Some(datagram) = queue.pop() {
                    transport.send(&datagram)?;
                    writes += 1;
                }
            }
        }
        Ok(writes)
    }

    pub fn queued(&self, channel: Channel) -> usize {
        self.slot(channel)
            .buffer
            .load()
            .as_ref()
            .map_or(0, |b| b.queue().queued_bytes())
    }

    /// No writer is draining either channel.
    pub fn is_idle(&self) -> bool {
        [&self.reliable, &self.unreliable].iter().all(|slot| {
            slot.buffer
                .load()
                .as_ref()
                .map_or(true, |b| !b.is_sending())
        })
    }

    /// Give the send buffers back to the pool. A writer still holding one
    /// keeps it alive until it finishes.
    pub fn release(&self) {
        for slot in [&self.reliable, &self.unreliable] {
            slot.transport.store(None);
            if let Some(buffer) = slot.buffer.swap(None) {
                buffer.queue().reset();
            }
        }
    }

    /// Close and detach both transports.
    pub fn close_transports(&self) {
        for channel in [Channel::Reliable, Channel::Unreliable] {
            if let Some(t) = self.unbind(channel) {
                t.close();
            }
        }
    }

    pub fn pool(&self) -> &QueuePool {
        &self.pool
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::loopback::MemoryTransport;

    fn router() -> ChannelRouter {
        ChannelRouter::new(QueuePool::new(2, 4, 64, 64 * 1024))
    }

    #[test]
    fn bind_rejects_wrong_channel() {
        let r = router();
        let udp: Arc<dyn Transport> = MemoryTransport::new(Channel::Unreliable);
        let err = r.bind(Channel::Reliable, udp).err().expect("bind should fail");
        assert!(matches!(
            err,
            RouterError::ChannelMismatch {
                expected: Channel::Reliable,
                got: Channel::Unreliable
            }
        ));
        assert!(!r.is_bound(Channel::Reliable));
    }

    #[test]
    fn send_requires_binding() {
        let r = router();
        assert!(matches!(
            r.send(Channel::Reliable, Bytes::from_static(b"x")),
            Err(RouterError::Unbound(Channel::Reliable))
        ));
    }

    #[test]
    fn reliable_writes_are_coalesced() {
        let r = router();
        let tcp = MemoryTransport::new(Channel::Reliable);
        r.bind(Channel::Reliable, tcp.clone()).unwrap();
        r.enqueue(Channel::Reliable, Bytes::from_static(b"ab")).unwrap();
        r.enqueue(Channel::Reliable, Bytes::from_static(b"cd")).unwrap();
        assert_eq!(r.flush(Channel::Reliable).unwrap(), 1);
        assert_eq!(tcp.take_sent(), vec![Bytes::from_static(b"abcd")]);
    }

    #[test]
    fn unreliable_writes_stay_separate() {
        let r = router();
        let udp = MemoryTransport::new(Channel::Unreliable);
        r.bind(Channel::Unreliable, udp.clone()).unwrap();
        r.enqueue(Channel::Unreliable, Bytes::from_static(b"ab")).unwrap();
        r.enqueue(Channel::Unreliable, Bytes::from_static(b"cd")).unwrap();
        assert_eq!(r.flush(Channel::Unreliable).unwrap(), 2);
        assert_eq!(udp.take_sent().len(), 2);
    }

    #[test]
    fn rebind_keeps_queued_bytes_exactly_once() {
        let r = router();
        let old = MemoryTransport::new(Channel::Reliable);
        let new = MemoryTransport::new(Channel::Reliable);
        r.bind(Channel::Reliable, old.clone()).unwrap();
        r.enqueue(Channel::Reliable, Bytes::from_static(b"queued")).unwrap();

        let prev = r.bind(Channel::Reliable, new.clone()).unwrap().unwrap();
        let old_dyn: Arc<dyn Transport> = old.clone();
        assert!(Arc::ptr_eq(&prev, &old_dyn));
        r.flush(Channel::Reliable).unwrap();

        assert!(old.take_sent().is_empty());
        assert_eq!(new.take_sent(), vec![Bytes::from_static(b"queued")]);
        r.flush(Channel::Reliable).unwrap();
        assert!(new.take_sent().is_empty());
    }

    #[test]
    fn unbind_discards_queue() {
        let r = router();
        let tcp = MemoryTransport::new(Channel::Reliable);
        r.bind(Channel::Reliable, tcp.clone()).unwrap();
        r.enqueue(Channel::Reliable, Bytes::from_static(b"lost")).unwrap();
        assert!(r.unbind(Channel::Reliable).is_some());
        assert_eq!(r.queued(Channel::Reliable), 0);
        r.bind(Channel::Reliable, tcp.clone()).unwrap();
        r.flush(Channel::Reliable).unwrap();
        assert!(tcp.take_sent().is_empty());
    }

    #[test]
    fn unbind_if_ignores_stale_transport() {
        let r = router();
        let a: Arc<dyn Transport> = MemoryTransport::new(Channel::Reliable);
        let b: Arc<dyn Transport> = MemoryTransport::new(Channel::Reliable);
        r.bind(Channel::Reliable, Arc::clone(&b)).unwrap();
        assert!(!r.unbind_if(Channel::Reliable, &a));
        assert!(r.is_bound_to(Channel::Reliable, &b));
        assert!(r.unbind_if(Channel::Reliable, &b));
    }

    #[test]
    fn pool_exhaustion_fails_the_send_only() {
        let r = ChannelRouter::new(QueuePool::new(1, 1, 64, 1024));
        let _held = r.pool().rent().unwrap();
        let tcp = MemoryTransport::new(Channel::Reliable);
        r.bind(Channel::Reliable, tcp).unwrap();
        assert!(matches!(
            r.enqueue(Channel::Reliable, Bytes::from_static(b"x")),
            Err(RouterError::Pool(PoolError::Exhausted { .. }))
        ));
        assert!(r.is_bound(Channel::Reliable));
    }

    #[test]
    fn write_error_surfaces() {
        let r = router();
        let tcp = MemoryTransport::new(Channel::Reliable);
        r.bind(Channel::Reliable, tcp.clone()).unwrap();
        tcp.fail_with(io::ErrorKind::BrokenPipe);
        r.enqueue(Channel::Reliable, Bytes::from_static(b"x")).unwrap();
        assert!(matches!(r.flush(Channel::Reliable), Err(RouterError::Io(_))));
        assert!(!r.has_queue(Channel::Unreliable));
    }

    #[test]
    fn release_returns_queues_to_pool() {
        let pool = QueuePool::new(2, 2, 64, 1024);
        let r = ChannelRouter::new(pool.clone());
        r.install_queue(Channel::Reliable, pool.rent().unwrap());
        assert_eq!(pool.outstanding(), 1);
        r.release();
        assert_eq!(pool.outstanding(), 0);
    }
}

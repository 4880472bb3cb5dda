//! # Send Queue & Queue Pool
//!
//! Outbound bytes are appended to a bounded [`SegmentQueue`] and written by
//! whichever producer wins the per-connection in-sending flag
//! ([`SendBuffer`]). Producers never block on the writer.
//!
//! Every queue carries a generation. Producers capture it as a [`TrackId`]
//! and present it on every push; [`SegmentQueue::reset`] bumps it, so a
//! producer racing a reset fails with [`QueueError::Stale`] instead of
//! leaking old bytes into the fresh queue. Segments that slip in during the
//! reset window carry the old tag and are discarded on pop.
//!
//! Queues come from a [`QueuePool`] that preallocates `min` queues and
//! doubles its limit up to `max` when every queue is rented.

use bytes::{BufMut, Bytes, BytesMut};
use crossbeam_channel::{Receiver, Sender};
use std::ops::Deref;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

use crate::error::{PoolError, QueueError};

// ─── Segment Queue ───────────────────────────────────────────────────────────

/// Generation a producer observed when it started enqueueing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TrackId(pub u64);

struct Segment {
    generation: u64,
    data: Bytes,
}

pub struct SegmentQueue {
    tx: Sender<Segment>,
    rx: Receiver<Segment>,
    generation: AtomicU64,
    slots: AtomicUsize,
    bytes: AtomicUsize,
    max_slots: usize,
    max_bytes: usize,
}

impl SegmentQueue {
    pub fn new(max_slots: usize, max_bytes: usize) -> Self {
        let (tx, rx) = crossbeam_channel::unbounded();
        SegmentQueue {
            tx,
            rx,
            generation: AtomicU64::new(0),
            slots: AtomicUsize::new(0),
            bytes: AtomicUsize::new(0),
            max_slots,
            max_bytes,
        }
    }

    /// Current generation, to be presented with each push.
    pub fn track(&self) -> TrackId {
        TrackId(self.generation.load(Ordering::Acquire))
    }

    pub fn generation(&self) -> u64 {
        self.generation.load(Ordering::Acquire)
    }

    /// Append one segment. Fails if the generation moved on or a limit would
    /// be exceeded; the queue is left untouched in both cases.
    pub fn push(&self, track: TrackId, data: Bytes) -> Result<(), QueueError> {
        let current = self.generation();
        if current != track.0 {
            return Err(QueueError::Stale {
                track: track.0,
                current,
            });
        }

        let full = || QueueError::Full {
            slots: self.max_slots,
            bytes: self.max_bytes,
        };
        self.slots
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| {
                (n < self.max_slots).then_some(n + 1)
            })
            .map_err(|_| full())?;
        let len = data.len();
        if self
            .bytes
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| {
                (n + len <= self.max_bytes).then_some(n + len)
            })
            .is_err()
        {
            self.slots.fetch_sub(1, Ordering::AcqRel);
            return Err(full());
        }

        // Both ends live in self, so the channel cannot be disconnected.
        let _ = self.tx.send(Segment {
            generation: track.0,
            data,
        });
        Ok(())
    }

    fn take(&self) -> Option<Segment> {
        let seg = self.rx.try_recv().ok()?;
        self.slots.fetch_sub(1, Ordering::AcqRel);
        self.bytes.fetch_sub(seg.data.len(), Ordering::AcqRel);
        Some(seg)
    }

    /// Next live segment. Segments tagged with an old generation are dropped.
    pub fn pop(&self) -> Option<Bytes> {
        loop {
            let seg = self.take()?;
            if seg.generation == self.generation() {
                return Some(seg.data);
            }
        }
    }

    /// Coalesce segments into `out` until it holds at least `max` bytes or
    /// the queue is empty. Returns the number of segments taken.
    pub fn pop_batch(&self, out: &mut BytesMut, max: usize) -> usize {
        let mut taken = 0;
        while out.len() < max {
            match self.pop() {
                Some(data) => {
                    out.put_slice(&data);
                    taken += 1;
                }
                None => break,
            }
        }
        taken
    }

    /// Invalidate every outstanding track and discard queued bytes.
    /// Returns the new generation.
    pub fn reset(&self) -> u64 {
        let next = self.generation.fetch_add(1, Ordering::AcqRel) + 1;
        while self.take().is_some() {}
        next
    }

    pub fn len(&self) -> usize {
        self.slots.load(Ordering::Acquire)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn queued_bytes(&self) -> usize {
        self.bytes.load(Ordering::Acquire)
    }
}

// ─── Queue Pool ──────────────────────────────────────────────────────────────

struct PoolInner {
    free_tx: Sender<SegmentQueue>,
    free_rx: Receiver<SegmentQueue>,
    created: AtomicUsize,
    limit: AtomicUsize,
    outstanding: AtomicUsize,
    max: usize,
    queue_slots: usize,
    queue_bytes: usize,
}

/// Growable set of reusable queues. Cloning shares the pool.
#[derive(Clone)]
pub struct QueuePool {
    inner: Arc<PoolInner>,
}

impl QueuePool {
    /// Preallocate `min` queues; the limit doubles on demand up to `max`.
    pub fn new(min: usize, max: usize, queue_slots: usize, queue_bytes: usize) -> Self {
        let min = min.max(1);
        let max = max.max(min);
        let (free_tx, free_rx) = crossbeam_channel::unbounded();
        for _ in 0..min {
            let _ = free_tx.send(SegmentQueue::new(queue_slots, queue_bytes));
        }
        QueuePool {
            inner: Arc::new(PoolInner {
                free_tx,
                free_rx,
                created: AtomicUsize::new(min),
                limit: AtomicUsize::new(min),
                outstanding: AtomicUsize::new(0),
                max,
                queue_slots,
                queue_bytes,
            }),
        }
    }

    /// Take a queue. Grows the pool if every queue is out and the limit
    /// allows; otherwise fails without side effects.
    pub fn rent(&self) -> Result<PooledQueue, PoolError> {
        let inner = &self.inner;
        let queue = match inner.free_rx.try_recv() {
            Ok(queue) => queue,
            Err(_) => self.grow()?,
        };
        inner.outstanding.fetch_add(1, Ordering::AcqRel);
        Ok(PooledQueue {
            queue: Some(queue),
            pool: Arc::clone(inner),
        })
    }

    fn grow(&self) -> Result<SegmentQueue, PoolError> {
        let inner = &self.inner;
        loop {
            let created = inner.created.load(Ordering::Acquire);
            let limit = inner.limit.load(Ordering::Acquire);
            if created < limit {
                if inner
                    .created
                    .compare_exchange(created, created + 1, Ordering::AcqRel, Ordering::Acquire)
                    .is_ok()
                {
                    return Ok(SegmentQueue::new(inner.queue_slots, inner.queue_bytes));
                }
                continue;
            }
            if limit >= inner.max {
                // A queue may have come back while we were looking.
                return inner
                    .free_rx
                    .try_recv()
                    .map_err(|_| PoolError::Exhausted { limit });
            }
            let doubled = (limit * 2).min(inner.max);
            if inner
                .limit
                .compare_exchange(limit, doubled, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
            {
                tracing::debug!(from = limit, to = doubled, "queue pool grew");
            }
        }
    }

    /// Queues ever allocated.
    pub fn created(&self) -> usize {
        self.inner.created.load(Ordering::Acquire)
    }

    pub fn limit(&self) -> usize {
        self.inner.limit.load(Ordering::Acquire)
    }

    pub fn outstanding(&self) -> usize {
        self.inner.outstanding.load(Ordering::Acquire)
    }

    /// Queues sitting idle in the pool.
    pub fn available(&self) -> usize {
        self.inner.free_rx.len()
    }
}

/// A rented queue. Dropping it resets the queue and hands it back.
pub struct PooledQueue {
    queue: Option<SegmentQueue>,
    pool: Arc<PoolInner>,
}

impl Deref for PooledQueue {
    type Target = SegmentQueue;

    fn deref(&self) -> &SegmentQueue {
        // Only None inside Drop.
        match &self.queue {
            Some(queue) => queue,
            None => unreachable!("pooled queue used after release"),
        }
    }
}

impl Drop for PooledQueue {
    fn drop(&mut self) {
        if let Some(queue) = self.queue.take() {
            queue.reset();
            self.pool.outstanding.fetch_sub(1, Ordering::AcqRel);
            let _ = self.pool.free_tx.send(queue);
        }
    }
}

// ─── Send Buffer ─────────────────────────────────────────────────────────────

/// A rented queue plus the single-writer flag for one channel.
pub struct SendBuffer {
    queue: PooledQueue,
    sending: AtomicBool,
}

impl SendBuffer {
    pub fn new(queue: PooledQueue) -> Self {
        SendBuffer {
            queue,
            sending: AtomicBool::new(false),
        }
    }

    pub fn queue(&self) -> &SegmentQueue {
        &self.queue
    }

    /// Claim the writer role. Exactly one caller wins until [`end_send`].
    ///
    /// [`end_send`]: SendBuffer::end_send
    pub fn try_begin_send(&self) -> bool {
        self.sending
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    /// Give up the writer role. Returns true if bytes arrived after the
    /// writer's last look, in which case the caller should try to write again.
    pub fn end_send(&self) -> bool {
        self.sending.store(false, Ordering::Release);
        !self.queue.is_empty()
    }

    pub fn is_sending(&self) -> bool {
        self.sending.load(Ordering::Acquire)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    fn b(s: &'static [u8]) -> Bytes {
        Bytes::from_static(s)
    }

    // ─── Segment Queue Tests ────────────────────────────────────────────

    #[test]
    fn fifo_push_pop() {
        let q = SegmentQueue::new(8, 1024);
        let t = q.track();
        q.push(t, b(b"one")).unwrap();
        q.push(t, b(b"two")).unwrap();
        assert_eq!(q.len(), 2);
        assert_eq!(q.queued_bytes(), 6);
        assert_eq!(q.pop(), Some(b(b"one")));
        assert_eq!(q.pop(), Some(b(b"two")));
        assert_eq!(q.pop(), None);
        assert!(q.is_empty());
    }

    #[test]
    fn stale_track_is_rejected_after_reset() {
        let q = SegmentQueue::new(8, 1024);
        let old = q.track();
        q.push(old, b(b"before")).unwrap();
        assert_eq!(q.reset(), 1);
        assert!(q.is_empty());
        assert_eq!(
            q.push(old, b(b"late")),
            Err(QueueError::Stale { track: 0, current: 1 })
        );
        q.push(q.track(), b(b"fresh")).unwrap();
        assert_eq!(q.pop(), Some(b(b"fresh")));
    }

    #[test]
    fn slot_limit() {
        let q = SegmentQueue::new(2, 1024);
        let t = q.track();
        q.push(t, b(b"a")).unwrap();
        q.push(t, b(b"b")).unwrap();
        assert!(matches!(q.push(t, b(b"c")), Err(QueueError::Full { .. })));
        q.pop();
        q.push(t, b(b"c")).unwrap();
    }

    #[test]
    fn byte_limit_leaves_queue_untouched() {
        let q = SegmentQueue::new(8, 5);
        let t = q.track();
        q.push(t, b(b"abc")).unwrap();
        assert!(matches!(q.push(t, b(b"def")), Err(QueueError::Full { .. })));
        assert_eq!(q.len(), 1);
        assert_eq!(q.queued_bytes(), 3);
    }

    #[test]
    fn batch_coalesces_until_limit_reached() {
        let q = SegmentQueue::new(16, 1024);
        let t = q.track();
        for _ in 0..4 {
            q.push(t, Bytes::from(vec![1u8; 10])).unwrap();
        }
        let mut out = BytesMut::new();
        let n = q.pop_batch(&mut out, 25);
        assert_eq!(n, 3);
        assert_eq!(out.len(), 30);
        out.clear();
        assert_eq!(q.pop_batch(&mut out, 1000), 1);
        assert_eq!(out.len(), 10);
    }

    #[test]
    fn oversized_segment_still_drains() {
        let q = SegmentQueue::new(16, 1024);
        q.push(q.track(), Bytes::from(vec![0u8; 100])).unwrap();
        let mut out = BytesMut::new();
        assert_eq!(q.pop_batch(&mut out, 10), 1);
        assert_eq!(out.len(), 100);
    }

    #[test]
    fn concurrent_producers_never_exceed_limits() {
        let q = Arc::new(SegmentQueue::new(100, 10_000));
        let handles: Vec<_> = (0..4)
            .map(|_| {
                let q = Arc::clone(&q);
                thread::spawn(move || {
                    let t = q.track();
                    (0..50).filter(|_| q.push(t, b(b"x")).is_ok()).count()
                })
            })
            .collect();
        let accepted: usize = handles.into_iter().map(|h| h.join().unwrap()).sum();
        assert_eq!(accepted, 100);
        assert_eq!(q.len(), 100);
    }

    // ─── Pool Tests ─────────────────────────────────────────────────────

    #[test]
    fn pool_preallocates_minimum() {
        let pool = QueuePool::new(2, 8, 4, 64);
        assert_eq!(pool.created(), 2);
        assert_eq!(pool.available(), 2);
    }

    #[test]
    fn pool_doubles_then_exhausts() {
        let pool = QueuePool::new(2, 5, 4, 64);
        let held: Vec<_> = (0..5).map(|_| pool.rent().unwrap()).collect();
        assert_eq!(pool.limit(), 5);
        assert_eq!(pool.created(), 5);
        assert_eq!(pool.outstanding(), 5);
        assert_eq!(
            pool.rent().err(),
            Some(PoolError::Exhausted { limit: 5 })
        );
        drop(held);
        assert_eq!(pool.outstanding(), 0);
        assert_eq!(pool.available(), 5);
        assert!(pool.rent().is_ok());
    }

    #[test]
    fn returned_queue_is_reset() {
        let pool = QueuePool::new(1, 1, 4, 64);
        let q = pool.rent().unwrap();
        let stale = q.track();
        q.push(stale, b(b"leftover")).unwrap();
        drop(q);

        let q = pool.rent().unwrap();
        assert!(q.is_empty());
        assert!(q.push(stale, b(b"x")).is_err());
    }

    // ─── Send Buffer Tests ──────────────────────────────────────────────

    #[test]
    fn single_writer_flag() {
        let pool = QueuePool::new(1, 1, 4, 64);
        let buf = SendBuffer::new(pool.rent().unwrap());
        assert!(buf.try_begin_send());
        assert!(!buf.try_begin_send());
        assert!(buf.is_sending());

        // A producer slips a segment in while the writer is finishing.
        buf.queue().push(buf.queue().track(), b(b"late")).unwrap();
        assert!(buf.end_send(), "writer must be told to look again");
        assert!(!buf.is_sending());
        assert!(buf.try_begin_send());
    }
}

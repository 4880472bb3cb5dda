//! # Tick Runtime
//!
//! Drives a tick-based endpoint from background threads. `workers` threads
//! each tick their share of peers (`peer_id mod workers`) every
//! `tick_interval`; one more thread runs the control-plane sweep on its own
//! schedule.
//!
//! Threads wait on a crossbeam channel with a timeout, so dropping the stop
//! sender wakes all of them at once. Dropping the runtime stops and joins
//! every thread.

use crossbeam_channel::{bounded, Receiver, RecvTimeoutError, Sender};
use quanta::Instant;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use tandem_transport::{Client, Server};

/// Something the runtime can drive.
pub trait Tickable: Send + Sync + 'static {
    /// Advance the peers owned by worker `index` of `count`.
    fn tick_partition(&self, index: usize, count: usize, now: Instant);

    /// Control-plane cleanup. Nothing by default.
    fn sweep(&self, _now: Instant) {}
}

impl Tickable for Server {
    fn tick_partition(&self, index: usize, count: usize, now: Instant) {
        Server::tick_partition(self, index, count, now);
    }

    fn sweep(&self, now: Instant) {
        Server::sweep(self, now);
    }
}

impl Tickable for Client {
    fn tick_partition(&self, index: usize, _count: usize, now: Instant) {
        // a client is a single peer
        if index == 0 {
            self.tick(now);
        }
    }
}

/// Background tick and sweep threads for one endpoint.
pub struct Runtime {
    stop: Option<Sender<()>>,
    handles: Vec<thread::JoinHandle<()>>,
}

impl Runtime {
    pub fn start<T: Tickable>(
        target: Arc<T>,
        workers: usize,
        tick_interval: Duration,
        sweep_interval: Duration,
    ) -> anyhow::Result<Self> {
        let workers = workers.max(1);
        let (stop_tx, stop_rx) = bounded::<()>(0);
        let mut runtime = Runtime {
            stop: Some(stop_tx),
            handles: Vec::with_capacity(workers + 1),
        };

        for index in 0..workers {
            let target = Arc::clone(&target);
            let stop_rx = stop_rx.clone();
            let handle = thread::Builder::new()
                .name(format!("tandem-tick-{index}"))
                .spawn(move || {
                    every(&stop_rx, tick_interval, |now| {
                        target.tick_partition(index, workers, now)
                    })
                })
                .map_err(|e| anyhow::anyhow!("failed to spawn tick worker {index}: {e}"))?;
            runtime.handles.push(handle);
        }

        let handle = thread::Builder::new()
            .name("tandem-sweep".into())
            .spawn(move || every(&stop_rx, sweep_interval, |now| target.sweep(now)))
            .map_err(|e| anyhow::anyhow!("failed to spawn sweep thread: {e}"))?;
        runtime.handles.push(handle);

        tracing::debug!(
            workers,
            tick_ms = tick_interval.as_millis() as u64,
            sweep_ms = sweep_interval.as_millis() as u64,
            "runtime started"
        );
        Ok(runtime)
    }

    pub fn is_running(&self) -> bool {
        self.stop.is_some()
    }

    /// Stop and join every thread. Idempotent.
    pub fn shutdown(&mut self) {
        if self.stop.take().is_none() {
            return;
        }
        for handle in self.handles.drain(..) {
            let _ = handle.join();
        }
        tracing::debug!("runtime stopped");
    }
}

impl Drop for Runtime {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// Run `f` once per `interval` until the stop channel disconnects.
fn every(stop: &Receiver<()>, interval: Duration, mut f: impl FnMut(Instant)) {
    let mut next = Instant::now() + interval;
    loop {
        let wait = next.saturating_duration_since(Instant::now());
        match stop.recv_timeout(wait) {
            Err(RecvTimeoutError::Timeout) => {}
            Ok(()) | Err(RecvTimeoutError::Disconnected) => return,
        }
        let now = Instant::now();
        f(now);
        next += interval;
        // fell behind: skip missed ticks instead of bursting
        if next < now {
            next = now + interval;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    #[derive(Default)]
    struct Counter {
        ticks: Vec<AtomicUsize>,
        sweeps: AtomicUsize,
        counts: Mutex<Vec<usize>>,
    }

    impl Counter {
        fn new(workers: usize) -> Self {
            Counter {
                ticks: (0..workers).map(|_| AtomicUsize::new(0)).collect(),
                ..Default::default()
            }
        }
    }

    impl Tickable for Counter {
        fn tick_partition(&self, index: usize, count: usize, _now: Instant) {
            self.ticks[index].fetch_add(1, Ordering::Relaxed);
            self.counts.lock().unwrap().push(count);
        }

        fn sweep(&self, _now: Instant) {
            self.sweeps.fetch_add(1, Ordering::Relaxed);
        }
    }

    fn wait_until(cond: impl Fn() -> bool) {
        let deadline = std::time::Instant::now() + Duration::from_secs(5);
        while !cond() {
            assert!(std::time::Instant::now() < deadline, "timed out");
            thread::sleep(Duration::from_millis(2));
        }
    }

    #[test]
    fn every_partition_is_ticked() {
        let counter = Arc::new(Counter::new(3));
        let mut rt = Runtime::start(
            Arc::clone(&counter),
            3,
            Duration::from_millis(1),
            Duration::from_millis(5),
        )
        .unwrap();
        wait_until(|| counter.ticks.iter().all(|t| t.load(Ordering::Relaxed) >= 3));
        wait_until(|| counter.sweeps.load(Ordering::Relaxed) >= 1);
        rt.shutdown();
        assert!(counter.counts.lock().unwrap().iter().all(|&c| c == 3));
    }

    #[test]
    fn shutdown_stops_ticking() {
        let counter = Arc::new(Counter::new(1));
        let mut rt = Runtime::start(
            Arc::clone(&counter),
            1,
            Duration::from_millis(1),
            Duration::from_millis(1),
        )
        .unwrap();
        wait_until(|| counter.ticks[0].load(Ordering::Relaxed) > 0);
        rt.shutdown();
        assert!(!rt.is_running());
        let after = counter.ticks[0].load(Ordering::Relaxed);
        thread::sleep(Duration::from_millis(20));
        assert_eq!(counter.ticks[0].load(Ordering::Relaxed), after);
        // second call is a no-op
        rt.shutdown();
    }

    #[test]
    fn drop_joins_threads() {
        let counter = Arc::new(Counter::new(2));
        let rt = Runtime::start(
            Arc::clone(&counter),
            2,
            Duration::from_millis(1),
            Duration::from_millis(1),
        )
        .unwrap();
        drop(rt);
        // all clones held by the threads are gone
        assert_eq!(Arc::strong_count(&counter), 1);
    }

    #[test]
    fn zero_workers_means_one() {
        let counter = Arc::new(Counter::new(1));
        let mut rt =
            Runtime::start(Arc::clone(&counter), 0, Duration::from_millis(1), Duration::from_secs(60))
                .unwrap();
        wait_until(|| counter.ticks[0].load(Ordering::Relaxed) > 0);
        rt.shutdown();
    }
}

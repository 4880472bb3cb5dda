//! # RTT, Quality and Counters
//!
//! The round-trip estimator that drives retransmission timing, a rolling
//! latency window for diagnostics, and the per-connection counters exported
//! as JSON.

use serde::Serialize;
use std::collections::VecDeque;
use std::time::Duration;

/// Smoothing factor for the RTT average.
pub const RTT_ALPHA: f64 = 0.125;

/// Smoothing factor for the RTT deviation.
pub const RTT_BETA: f64 = 0.25;

/// Lower bound on the retransmission timeout once samples exist.
pub const MIN_RTO: Duration = Duration::from_millis(50);

// ─── Sender Stats ───────────────────────────────────────────────────────────

/// Reliable and unreliable send counters.
#[derive(Debug, Clone, Default, Serialize)]
pub struct SenderStats {
    /// Reliable messages handed to the transport (first transmissions).
    pub messages_sent: u64,
    /// Reliable payload bytes (first transmissions).
    pub bytes_sent: u64,
    /// Messages removed from the in-flight set by an ack.
    pub messages_acked: u64,
    /// Acks naming a sequence that was already gone.
    pub duplicate_acks: u64,
    pub retransmissions: u64,
    /// Messages that waited in the pending queue.
    pub messages_queued: u64,
    pub datagrams_sent: u64,
    pub fragments_sent: u64,
}

impl SenderStats {
    pub fn new() -> Self {
        Self::default()
    }

    /// Retransmission overhead ratio.
    pub fn retransmit_ratio(&self) -> f64 {
        if self.messages_sent == 0 {
            0.0
        } else {
            self.retransmissions as f64 / self.messages_sent as f64
        }
    }
}

// ─── Receiver Stats ─────────────────────────────────────────────────────────

#[derive(Debug, Clone, Default, Serialize)]
pub struct ReceiverStats {
    /// Sequenced frames received, duplicates included.
    pub messages_received: u64,
    pub bytes_received: u64,
    /// Messages handed to the application in order.
    pub messages_delivered: u64,
    pub duplicates: u64,
    /// Frames parked behind a gap.
    pub reordered: u64,
    /// Frames dropped because the reorder buffer was full.
    pub reorder_overflows: u64,
    pub datagrams_received: u64,
    pub fragments_received: u64,
    pub fragment_groups_completed: u64,
}

impl ReceiverStats {
    pub fn new() -> Self {
        Self::default()
    }

    /// Unique messages delivered vs total received.
    pub fn goodput_ratio(&self) -> f64 {
        if self.messages_received == 0 {
            0.0
        } else {
            self.messages_delivered as f64 / self.messages_received as f64
        }
    }
}

// ─── EWMA ───────────────────────────────────────────────────────────────────

/// Exponentially weighted moving average.
#[derive(Debug, Clone)]
pub struct Ewma {
    /// Smoothing factor (0.0 - 1.0). Higher = more responsive.
    alpha: f64,
    value: f64,
    initialized: bool,
}

impl Ewma {
    /// Create a new EWMA. `alpha` is clamped into `[0, 1]`.
    pub fn new(alpha: f64) -> Self {
        Ewma {
            alpha: alpha.clamp(0.0, 1.0),
            value: 0.0,
            initialized: false,
        }
    }

    /// Update with a new sample and return the smoothed value.
    pub fn update(&mut self, sample: f64) -> f64 {
        if !self.initialized {
            self.value = sample;
            self.initialized = true;
        } else {
            self.value = self.alpha * sample + (1.0 - self.alpha) * self.value;
        }
        self.value
    }

    pub fn value(&self) -> f64 {
        self.value
    }

    pub fn is_initialized(&self) -> bool {
        self.initialized
    }
}

// ─── RTT Estimator ──────────────────────────────────────────────────────────

/// Smoothed RTT with outlier clamping.
///
/// The first sample seeds the average directly. Later samples are clamped to
/// `[avg / 2, avg * 2]` before smoothing so one stalled ack cannot drag the
/// estimate. Deviation follows RFC 6298 and feeds `rto = srtt + 4 * rttvar`.
#[derive(Debug, Clone)]
pub struct RttEstimator {
    srtt: Ewma,
    rttvar_us: f64,
    last_us: f64,
    samples: u64,
}

impl RttEstimator {
    pub fn new() -> Self {
        RttEstimator {
            srtt: Ewma::new(RTT_ALPHA),
            rttvar_us: 0.0,
            last_us: 0.0,
            samples: 0,
        }
    }

    /// Fold in one round-trip measurement. Returns the clamped sample.
    pub fn update(&mut self, rtt: Duration) -> f64 {
        let raw_us = rtt.as_secs_f64() * 1e6;
        self.last_us = raw_us;
        self.samples += 1;

        if !self.srtt.is_initialized() {
            self.srtt.update(raw_us);
            self.rttvar_us = raw_us / 2.0;
            return raw_us;
        }

        let avg = self.srtt.value();
        let sample = raw_us.clamp(avg / 2.0, avg * 2.0);
        self.rttvar_us = (1.0 - RTT_BETA) * self.rttvar_us + RTT_BETA * (avg - sample).abs();
        self.srtt.update(sample);
        sample
    }

    pub fn has_samples(&self) -> bool {
        self.samples > 0
    }

    pub fn sample_count(&self) -> u64 {
        self.samples
    }

    /// Smoothed RTT in µs.
    pub fn srtt_us(&self) -> f64 {
        self.srtt.value()
    }

    /// RTT deviation in µs.
    pub fn rttvar_us(&self) -> f64 {
        self.rttvar_us
    }

    /// Most recent unclamped sample in µs.
    pub fn last_us(&self) -> f64 {
        self.last_us
    }

    /// Retransmission timeout. `fallback` applies until the first sample.
    pub fn rto(&self, fallback: Duration) -> Duration {
        if !self.has_samples() {
            return fallback;
        }
        let us = self.srtt_us() + 4.0 * self.rttvar_us;
        Duration::from_micros(us as u64).max(MIN_RTO)
    }
}

impl Default for RttEstimator {
    fn default() -> Self {
        Self::new()
    }
}

// ─── Latency Window ─────────────────────────────────────────────────────────

/// Fixed-size ring of recent RTT samples. `None` records a lost probe.
#[derive(Debug, Clone)]
pub struct LatencyWindow {
    samples: VecDeque<Option<f64>>,
    capacity: usize,
}

impl LatencyWindow {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        LatencyWindow {
            samples: VecDeque::with_capacity(capacity),
            capacity,
        }
    }

    fn push(&mut self, sample: Option<f64>) {
        if self.samples.len() == self.capacity {
            self.samples.pop_front();
        }
        self.samples.push_back(sample);
    }

    pub fn record(&mut self, rtt: Duration) {
        self.push(Some(rtt.as_secs_f64() * 1e6));
    }

    pub fn record_loss(&mut self) {
        self.push(None);
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    fn received(&self) -> impl Iterator<Item = f64> + '_ {
        self.samples.iter().flatten().copied()
    }

    pub fn min_us(&self) -> Option<f64> {
        self.received().reduce(f64::min)
    }

    pub fn max_us(&self) -> Option<f64> {
        self.received().reduce(f64::max)
    }

    pub fn avg_us(&self) -> Option<f64> {
        let (sum, n) = self.received().fold((0.0, 0usize), |(s, n), v| (s + v, n + 1));
        (n > 0).then(|| sum / n as f64)
    }

    pub fn stddev_us(&self) -> Option<f64> {
        let avg = self.avg_us()?;
        let (sum, n) = self
            .received()
            .fold((0.0, 0usize), |(s, n), v| (s + (v - avg).powi(2), n + 1));
        Some((sum / n as f64).sqrt())
    }

    /// Mean absolute difference between consecutive received samples.
    pub fn jitter_us(&self) -> f64 {
        let mut prev: Option<f64> = None;
        let mut total = 0.0;
        let mut n = 0usize;
        for v in self.received() {
            if let Some(p) = prev {
                total += (v - p).abs();
                n += 1;
            }
            prev = Some(v);
        }
        if n == 0 {
            0.0
        } else {
            total / n as f64
        }
    }

    /// Fraction of window entries that were losses.
    pub fn loss_rate(&self) -> f64 {
        if self.samples.is_empty() {
            return 0.0;
        }
        let lost = self.samples.iter().filter(|s| s.is_none()).count();
        lost as f64 / self.samples.len() as f64
    }
}

// ─── Quality ────────────────────────────────────────────────────────────────

/// Coarse link classification for diagnostics.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
pub enum ConnectionQuality {
    Excellent,
    Good,
    Moderate,
    Poor,
    Unstable,
}

impl ConnectionQuality {
    pub fn classify(avg_rtt: Duration, jitter: Duration) -> Self {
        let rtt_ms = avg_rtt.as_millis();
        let jitter_ms = jitter.as_millis();
        match (rtt_ms, jitter_ms) {
            (r, j) if r < 50 && j < 10 => ConnectionQuality::Excellent,
            (r, j) if r < 100 && j < 20 => ConnectionQuality::Good,
            (r, j) if r < 200 && j < 50 => ConnectionQuality::Moderate,
            (r, _) if r < 400 => ConnectionQuality::Poor,
            _ => ConnectionQuality::Unstable,
        }
    }
}

/// Point-in-time view of a connection's latency.
#[derive(Debug, Clone, Serialize)]
pub struct QualitySnapshot {
    pub srtt_us: f64,
    pub rttvar_us: f64,
    pub last_rtt_us: f64,
    pub min_rtt_us: f64,
    pub max_rtt_us: f64,
    pub avg_rtt_us: f64,
    pub stddev_us: f64,
    pub jitter_us: f64,
    pub loss_rate: f64,
    pub rto_ms: u64,
    pub quality: ConnectionQuality,
}

/// Estimator plus window, owned per connection.
#[derive(Debug, Clone)]
pub struct QualityMonitor {
    estimator: RttEstimator,
    window: LatencyWindow,
    /// What the remote side last reported about the link in its ping.
    remote: Option<RemoteReport>,
}

/// Link figures reported by the remote side.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct RemoteReport {
    pub raw_rtt_us: u32,
    pub avg_rtt_us: u32,
    pub jitter_us: u32,
    pub loss_rate: f32,
}

impl QualityMonitor {
    pub fn new(window: usize) -> Self {
        QualityMonitor {
            estimator: RttEstimator::new(),
            window: LatencyWindow::new(window),
            remote: None,
        }
    }

    pub fn on_sample(&mut self, rtt: Duration) {
        self.estimator.update(rtt);
        self.window.record(rtt);
    }

    /// A probe that never came back.
    pub fn on_loss(&mut self) {
        self.window.record_loss();
    }

    pub fn on_remote_report(&mut self, report: RemoteReport) {
        self.remote = Some(report);
    }

    pub fn remote(&self) -> Option<RemoteReport> {
        self.remote
    }

    pub fn estimator(&self) -> &RttEstimator {
        &self.estimator
    }

    pub fn window(&self) -> &LatencyWindow {
        &self.window
    }

    pub fn rto(&self, fallback: Duration) -> Duration {
        self.estimator.rto(fallback)
    }

    pub fn quality(&self) -> ConnectionQuality {
        let avg = Duration::from_micros(self.estimator.srtt_us() as u64);
        let jitter = Duration::from_micros(self.window.jitter_us() as u64);
        ConnectionQuality::classify(avg, jitter)
    }

    pub fn snapshot(&self, fallback_rto: Duration) -> QualitySnapshot {
        QualitySnapshot {
            srtt_us: self.estimator.srtt_us(),
            rttvar_us: self.estimator.rttvar_us(),
            last_rtt_us: self.estimator.last_us(),
            min_rtt_us: self.window.min_us().unwrap_or(0.0),
            max_rtt_us: self.window.max_us().unwrap_or(0.0),
            avg_rtt_us: self.window.avg_us().unwrap_or(0.0),
            stddev_us: self.window.stddev_us().unwrap_or(0.0),
            jitter_us: self.window.jitter_us(),
            loss_rate: self.window.loss_rate(),
            rto_ms: self.rto(fallback_rto).as_millis() as u64,
            quality: self.quality(),
        }
    }
}

// ─── Connection Stats ───────────────────────────────────────────────────────

/// Everything a connection reports about itself.
#[derive(Debug, Clone, Serialize)]
pub struct ConnectionStats {
    pub peer_id: u32,
    pub state: &'static str,
    pub in_flight: usize,
    pub pending: usize,
    pub reorder_buffered: usize,
    pub sender: SenderStats,
    pub receiver: ReceiverStats,
    /// Retransmissions per first transmission.
    pub retransmit_ratio: f64,
    /// Delivered messages per sequenced frame received.
    pub goodput_ratio: f64,
    pub quality: QualitySnapshot,
    pub remote: Option<RemoteReport>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ms(v: u64) -> Duration {
        Duration::from_millis(v)
    }

    // ─── EWMA Tests ────────────────────────────────────────────────────

    #[test]
    fn ewma_first_sample_sets_value() {
        let mut ewma = Ewma::new(0.125);
        ewma.update(100.0);
        assert_eq!(ewma.value(), 100.0);
    }

    #[test]
    fn ewma_smooths_toward_new_value() {
        let mut ewma = Ewma::new(0.5);
        ewma.update(100.0);
        let v = ewma.update(200.0);
        assert!((v - 150.0).abs() < 0.001, "EWMA 0.5 should average: got {v}");
    }

    #[test]
    fn ewma_clamps_alpha() {
        let mut ewma = Ewma::new(4.0);
        assert!(!ewma.is_initialized());
        ewma.update(100.0);
        assert_eq!(ewma.update(50.0), 50.0);
    }

    // ─── RTT Estimator Tests ───────────────────────────────────────────

    #[test]
    fn estimator_seeds_from_first_sample() {
        let mut est = RttEstimator::new();
        est.update(ms(80));
        assert!((est.srtt_us() - 80_000.0).abs() < 1.0);
        assert!((est.rttvar_us() - 40_000.0).abs() < 1.0);
    }

    #[test]
    fn estimator_clamps_outliers() {
        let mut est = RttEstimator::new();
        est.update(ms(100));
        // 1s spike is clamped to 200ms before smoothing
        let used = est.update(ms(1000));
        assert!((used - 200_000.0).abs() < 1.0);
        let expected = 0.875 * 100_000.0 + 0.125 * 200_000.0;
        assert!((est.srtt_us() - expected).abs() < 1.0);

        // And a collapse is clamped to half
        let mut est = RttEstimator::new();
        est.update(ms(100));
        let used = est.update(ms(1));
        assert!((used - 50_000.0).abs() < 1.0);
    }

    #[test]
    fn rto_uses_fallback_before_samples() {
        let est = RttEstimator::new();
        assert_eq!(est.rto(ms(3000)), ms(3000));
    }

    #[test]
    fn rto_tracks_srtt_plus_four_rttvar() {
        let mut est = RttEstimator::new();
        est.update(ms(100));
        // srtt 100ms, rttvar 50ms
        assert_eq!(est.rto(ms(3000)), ms(300));
    }

    #[test]
    fn rto_has_floor() {
        let mut est = RttEstimator::new();
        for _ in 0..50 {
            est.update(Duration::from_micros(200));
        }
        assert_eq!(est.rto(ms(3000)), MIN_RTO);
    }

    // ─── Latency Window Tests ──────────────────────────────────────────

    #[test]
    fn window_statistics() {
        let mut w = LatencyWindow::new(8);
        for v in [10, 20, 30, 20] {
            w.record(ms(v));
        }
        assert_eq!(w.min_us(), Some(10_000.0));
        assert_eq!(w.max_us(), Some(30_000.0));
        assert_eq!(w.avg_us(), Some(20_000.0));
        // |20-10| + |30-20| + |20-30| over 3
        assert!((w.jitter_us() - 10_000.0).abs() < 0.1);
        let sd = w.stddev_us().unwrap();
        assert!((sd - 7071.07).abs() < 1.0, "stddev {sd}");
    }

    #[test]
    fn window_evicts_oldest() {
        let mut w = LatencyWindow::new(2);
        w.record(ms(100));
        w.record(ms(10));
        w.record(ms(20));
        assert_eq!(w.len(), 2);
        assert_eq!(w.max_us(), Some(20_000.0));
    }

    #[test]
    fn window_loss_rate() {
        let mut w = LatencyWindow::new(4);
        w.record(ms(10));
        w.record_loss();
        w.record(ms(10));
        w.record_loss();
        assert_eq!(w.loss_rate(), 0.5);
        assert_eq!(w.avg_us(), Some(10_000.0));
    }

    #[test]
    fn empty_window_has_no_stats() {
        let w = LatencyWindow::new(4);
        assert!(w.is_empty());
        assert_eq!(w.avg_us(), None);
        assert_eq!(w.stddev_us(), None);
        assert_eq!(w.jitter_us(), 0.0);
        assert_eq!(w.loss_rate(), 0.0);
    }

    // ─── Quality Tests ─────────────────────────────────────────────────

    #[test]
    fn quality_thresholds() {
        use ConnectionQuality::*;
        assert_eq!(ConnectionQuality::classify(ms(20), ms(2)), Excellent);
        assert_eq!(ConnectionQuality::classify(ms(20), ms(15)), Good);
        assert_eq!(ConnectionQuality::classify(ms(150), ms(30)), Moderate);
        assert_eq!(ConnectionQuality::classify(ms(150), ms(90)), Poor);
        assert_eq!(ConnectionQuality::classify(ms(500), ms(1)), Unstable);
    }

    #[test]
    fn snapshot_serializes() {
        let mut monitor = QualityMonitor::new(16);
        monitor.on_sample(ms(30));
        monitor.on_sample(ms(32));
        let snap = monitor.snapshot(ms(3000));
        assert_eq!(snap.quality, ConnectionQuality::Excellent);
        let json = serde_json::to_string(&snap).unwrap();
        assert!(json.contains("\"quality\":\"Excellent\""));
    }

    #[test]
    fn sender_retransmit_ratio() {
        let mut stats = SenderStats::new();
        stats.messages_sent = 100;
        stats.retransmissions = 5;
        assert!((stats.retransmit_ratio() - 0.05).abs() < 0.001);
        assert_eq!(SenderStats::new().retransmit_ratio(), 0.0);
    }

    #[test]
    fn receiver_goodput_ratio() {
        let mut stats = ReceiverStats::new();
        stats.messages_received = 110;
        stats.messages_delivered = 100;
        assert!((stats.goodput_ratio() - 100.0 / 110.0).abs() < 0.001);
    }
}

use std::time::Duration;

use serde::Deserialize;

use crate::error::ConfigError;
use crate::fragment::ReassemblyLimits;

/// TOML form: every field optional, times in milliseconds.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct TransportConfigInput {
    pub connect_attempts: Option<u32>,
    pub connect_interval_ms: Option<u64>,
    pub reconnect_attempts: Option<u32>,
    pub reconnect_interval_ms: Option<u64>,
    pub auto_ping: Option<bool>,
    pub ping_interval_ms: Option<u64>,
    pub udp_enabled: Option<bool>,
    pub udp_mtu: Option<usize>,
    pub keep_alive: Option<bool>,
    pub keep_alive_interval_ms: Option<u64>,
    pub use_compress: Option<bool>,
    pub compression_threshold: Option<usize>,
    pub use_encrypt: Option<bool>,
    pub max_frame_bytes: Option<usize>,
    pub send_timeout_ms: Option<u64>,
    pub max_retry_count: Option<u32>,
    pub latency_window: Option<usize>,
    pub handshake_timeout_ms: Option<u64>,
    pub idle_timeout_ms: Option<u64>,
    pub waiting_reconnect_timeout_ms: Option<u64>,
    pub close_grace_ms: Option<u64>,
    pub fragment_timeout_ms: Option<u64>,
    pub max_fragment_groups: Option<usize>,
    pub max_fragment_bytes: Option<usize>,
    pub reorder_capacity: Option<usize>,
    pub max_in_flight: Option<usize>,
    pub max_pending: Option<usize>,
    pub queue_slots: Option<usize>,
    pub queue_bytes: Option<usize>,
    pub pool_min: Option<usize>,
    pub pool_max: Option<usize>,
    pub max_peers: Option<u32>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct TransportConfig {
    /// Connect attempts before giving up on the first connection.
    pub connect_attempts: u32,
    pub connect_interval: Duration,
    pub reconnect_attempts: u32,
    pub reconnect_interval: Duration,
    pub auto_ping: bool,
    pub ping_interval: Duration,
    pub udp_enabled: bool,
    /// Largest datagram, headers included.
    pub udp_mtu: usize,
    pub keep_alive: bool,
    pub keep_alive_interval: Duration,
    pub use_compress: bool,
    pub compression_threshold: usize,
    pub use_encrypt: bool,
    /// Largest reliable frame, header included.
    pub max_frame_bytes: usize,
    pub send_timeout: Duration,
    pub max_retry_count: u32,
    pub latency_window: usize,
    pub handshake_timeout: Duration,
    pub idle_timeout: Duration,
    pub waiting_reconnect_timeout: Duration,
    /// How long a graceful close waits for the peer's `Close`.
    pub close_grace: Duration,
    pub fragment_timeout: Duration,
    /// Incomplete fragment groups one peer may have open.
    pub max_fragment_groups: usize,
    /// Bytes one peer may hold in incomplete fragment groups.
    pub max_fragment_bytes: usize,
    pub reorder_capacity: usize,
    pub max_in_flight: usize,
    pub max_pending: usize,
    pub queue_slots: usize,
    pub queue_bytes: usize,
    pub pool_min: usize,
    pub pool_max: usize,
    pub max_peers: u32,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            connect_attempts: 5,
            connect_interval: Duration::from_millis(1000),
            reconnect_attempts: 10,
            reconnect_interval: Duration::from_millis(1000),
            auto_ping: true,
            ping_interval: Duration::from_millis(1000),
            udp_enabled: true,
            udp_mtu: 1200,
            keep_alive: true,
            keep_alive_interval: Duration::from_secs(5),
            use_compress: false,
            compression_threshold: 1024,
            use_encrypt: false,
            max_frame_bytes: 64 * 1024,
            send_timeout: Duration::from_millis(3000),
            max_retry_count: 5,
            latency_window: 32,
            handshake_timeout: Duration::from_secs(5),
            idle_timeout: Duration::from_secs(30),
            waiting_reconnect_timeout: Duration::from_secs(60),
            close_grace: Duration::from_secs(1),
            fragment_timeout: Duration::from_secs(5),
            max_fragment_groups: 16,
            max_fragment_bytes: 1024 * 1024,
            reorder_capacity: 1024,
            max_in_flight: 1024,
            max_pending: 4096,
            queue_slots: 4096,
            queue_bytes: 4 * 1024 * 1024,
            pool_min: 16,
            pool_max: 1024,
            max_peers: 65_535,
        }
    }
}

fn ms(v: Option<u64>, default: Duration) -> Duration {
    v.map(Duration::from_millis).unwrap_or(default)
}

fn invalid(field: &'static str, reason: impl Into<String>) -> ConfigError {
    ConfigError::Invalid {
        field,
        reason: reason.into(),
    }
}

impl TransportConfigInput {
    pub fn resolve(self) -> Result<TransportConfig, ConfigError> {
        let d = TransportConfig::default();
        let cfg = TransportConfig {
            connect_attempts: self.connect_attempts.unwrap_or(d.connect_attempts),
            connect_interval: ms(self.connect_interval_ms, d.connect_interval),
            reconnect_attempts: self.reconnect_attempts.unwrap_or(d.reconnect_attempts),
            reconnect_interval: ms(self.reconnect_interval_ms, d.reconnect_interval),
            auto_ping: self.auto_ping.unwrap_or(d.auto_ping),
            ping_interval: ms(self.ping_interval_ms, d.ping_interval),
            udp_enabled: self.udp_enabled.unwrap_or(d.udp_enabled),
            udp_mtu: self.udp_mtu.unwrap_or(d.udp_mtu),
            keep_alive: self.keep_alive.unwrap_or(d.keep_alive),
            keep_alive_interval: ms(self.keep_alive_interval_ms, d.keep_alive_interval),
            use_compress: self.use_compress.unwrap_or(d.use_compress),
            compression_threshold: self.compression_threshold.unwrap_or(d.compression_threshold),
            use_encrypt: self.use_encrypt.unwrap_or(d.use_encrypt),
            max_frame_bytes: self.max_frame_bytes.unwrap_or(d.max_frame_bytes),
            send_timeout: ms(self.send_timeout_ms, d.send_timeout),
            max_retry_count: self.max_retry_count.unwrap_or(d.max_retry_count),
            latency_window: self.latency_window.unwrap_or(d.latency_window),
            handshake_timeout: ms(self.handshake_timeout_ms, d.handshake_timeout),
            idle_timeout: ms(self.idle_timeout_ms, d.idle_timeout),
            waiting_reconnect_timeout: ms(
                self.waiting_reconnect_timeout_ms,
                d.waiting_reconnect_timeout,
            ),
            close_grace: ms(self.close_grace_ms, d.close_grace),
            fragment_timeout: ms(self.fragment_timeout_ms, d.fragment_timeout),
            max_fragment_groups: self.max_fragment_groups.unwrap_or(d.max_fragment_groups),
            max_fragment_bytes: self.max_fragment_bytes.unwrap_or(d.max_fragment_bytes),
            reorder_capacity: self.reorder_capacity.unwrap_or(d.reorder_capacity),
            max_in_flight: self.max_in_flight.unwrap_or(d.max_in_flight),
            max_pending: self.max_pending.unwrap_or(d.max_pending),
            queue_slots: self.queue_slots.unwrap_or(d.queue_slots),
            queue_bytes: self.queue_bytes.unwrap_or(d.queue_bytes),
            pool_min: self.pool_min.unwrap_or(d.pool_min),
            pool_max: self.pool_max.unwrap_or(d.pool_max),
            max_peers: self.max_peers.unwrap_or(d.max_peers),
        };
        cfg.validate()?;
        Ok(cfg)
    }
}

impl TransportConfig {
    pub fn from_toml_str(input: &str) -> Result<Self, ConfigError> {
        if input.trim().is_empty() {
            return Ok(TransportConfig::default());
        }
        let parsed: TransportConfigInput = toml::from_str(input)?;
        parsed.resolve()
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if !(64..=65_507).contains(&self.udp_mtu) {
            return Err(invalid("udp_mtu", format!("{} not in 64..=65507", self.udp_mtu)));
        }
        if self.max_frame_bytes < 64 || self.max_frame_bytes > u32::MAX as usize {
            return Err(invalid("max_frame_bytes", "must be at least 64"));
        }
        if self.queue_bytes < self.max_frame_bytes {
            return Err(invalid("queue_bytes", "must hold at least one full frame"));
        }
        if self.queue_slots == 0 {
            return Err(invalid("queue_slots", "must be positive"));
        }
        if self.send_timeout.is_zero() {
            return Err(invalid("send_timeout_ms", "must be positive"));
        }
        if self.send_timeout.as_millis() > u32::MAX as u128 {
            return Err(invalid("send_timeout_ms", "does not fit the handshake field"));
        }
        if self.max_retry_count > u16::MAX as u32 {
            return Err(invalid("max_retry_count", "must fit in 16 bits"));
        }
        if self.pool_min == 0 || self.pool_max < self.pool_min {
            return Err(invalid("pool_max", "pool needs 1 <= pool_min <= pool_max"));
        }
        if self.latency_window == 0 {
            return Err(invalid("latency_window", "must be positive"));
        }
        if self.max_in_flight == 0 {
            return Err(invalid("max_in_flight", "must be positive"));
        }
        if self.auto_ping && self.ping_interval.is_zero() {
            return Err(invalid("ping_interval_ms", "must be positive"));
        }
        if self.max_fragment_groups == 0 {
            return Err(invalid("max_fragment_groups", "must be positive"));
        }
        let largest = ReassemblyLimits::from_config(self).largest_group();
        if self.max_fragment_bytes < largest {
            return Err(invalid(
                "max_fragment_bytes",
                format!("{} cannot hold one {largest} byte message", self.max_fragment_bytes),
            ));
        }
        if self.compression_threshold > u32::MAX as usize {
            return Err(invalid("compression_threshold", "does not fit the handshake field"));
        }
        Ok(())
    }
}

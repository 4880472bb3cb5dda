//! # Node Configuration
//!
//! One TOML file per node. Node-level keys sit at the top; everything the
//! transport understands goes in a `[transport]` table and is resolved by
//! [`TransportConfigInput::resolve`].
//!
//! ```toml
//! role = "server"
//! listen = "0.0.0.0:7000"
//! udp_listen = "0.0.0.0:7001"
//! workers = 4
//! tick_interval_ms = 10
//!
//! [transport]
//! send_timeout_ms = 1500
//! max_retry_count = 4
//! ```

use serde::Deserialize;
use std::net::SocketAddr;
use std::path::Path;
use std::time::Duration;

use tandem_transport::config::{TransportConfig, TransportConfigInput};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Server,
    Client,
}

/// TOML form of [`NodeConfig`].
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct NodeConfigInput {
    pub role: Option<Role>,
    /// Stream listen address (server).
    pub listen: Option<String>,
    /// Datagram listen address (server). Omit to run without UDP.
    pub udp_listen: Option<String>,
    /// Server address to dial (client).
    pub connect: Option<String>,
    pub workers: Option<usize>,
    pub tick_interval_ms: Option<u64>,
    pub sweep_interval_ms: Option<u64>,
    pub transport: TransportConfigInput,
}

#[derive(Debug, Clone, PartialEq)]
pub struct NodeConfig {
    pub role: Role,
    pub listen: SocketAddr,
    pub udp_listen: Option<SocketAddr>,
    pub connect: SocketAddr,
    /// Tick workers; peers are split between them by id.
    pub workers: usize,
    pub tick_interval: Duration,
    /// Period of the control-plane sweep (handshake, idle and waiting
    /// timeouts).
    pub sweep_interval: Duration,
    pub transport: TransportConfig,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            role: Role::Server,
            listen: SocketAddr::from(([0, 0, 0, 0], 7000)),
            udp_listen: Some(SocketAddr::from(([0, 0, 0, 0], 7001))),
            connect: SocketAddr::from(([127, 0, 0, 1], 7000)),
            workers: 2,
            tick_interval: Duration::from_millis(10),
            sweep_interval: Duration::from_millis(500),
            transport: TransportConfig::default(),
        }
    }
}

fn addr(field: &str, value: &str) -> anyhow::Result<SocketAddr> {
    value
        .parse()
        .map_err(|e| anyhow::anyhow!("invalid {field} address '{value}': {e}"))
}

impl NodeConfigInput {
    pub fn resolve(self) -> anyhow::Result<NodeConfig> {
        let d = NodeConfig::default();
        let udp_listen = match self.udp_listen.as_deref() {
            Some("") => None,
            Some(v) => Some(addr("udp_listen", v)?),
            None => d.udp_listen,
        };
        let cfg = NodeConfig {
            role: self.role.unwrap_or(d.role),
            listen: match self.listen.as_deref() {
                Some(v) => addr("listen", v)?,
                None => d.listen,
            },
            udp_listen,
            connect: match self.connect.as_deref() {
                Some(v) => addr("connect", v)?,
                None => d.connect,
            },
            workers: self.workers.unwrap_or(d.workers),
            tick_interval: self
                .tick_interval_ms
                .map(Duration::from_millis)
                .unwrap_or(d.tick_interval),
            sweep_interval: self
                .sweep_interval_ms
                .map(Duration::from_millis)
                .unwrap_or(d.sweep_interval),
            transport: self
                .transport
                .resolve()
                .map_err(|e| anyhow::anyhow!("[transport]: {e}"))?,
        };
        cfg.validate()?;
        Ok(cfg)
    }
}

impl NodeConfig {
    pub fn from_toml_str(input: &str) -> anyhow::Result<Self> {
        if input.trim().is_empty() {
            return Ok(NodeConfig::default());
        }
        let parsed: NodeConfigInput =
            toml::from_str(input).map_err(|e| anyhow::anyhow!("invalid node config: {e}"))?;
        parsed.resolve()
    }

    pub fn load(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)
            .map_err(|e| anyhow::anyhow!("cannot read {}: {e}", path.display()))?;
        Self::from_toml_str(&text)
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if self.workers == 0 || self.workers > 256 {
            anyhow::bail!("workers must be in 1..=256, got {}", self.workers);
        }
        if self.tick_interval.is_zero() {
            anyhow::bail!("tick_interval_ms must be positive");
        }
        if self.sweep_interval.is_zero() {
            anyhow::bail!("sweep_interval_ms must be positive");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_file_gives_defaults() {
        let cfg = NodeConfig::from_toml_str("").unwrap();
        assert_eq!(cfg, NodeConfig::default());
    }

    #[test]
    fn parse_client_with_transport_table() {
        let toml = r#"
            role = "client"
            connect = "10.0.0.5:9000"
            workers = 1

            [transport]
            send_timeout_ms = 400
            udp_enabled = false
        "#;
        let cfg = NodeConfig::from_toml_str(toml).unwrap();
        assert_eq!(cfg.role, Role::Client);
        assert_eq!(cfg.connect, "10.0.0.5:9000".parse().unwrap());
        assert_eq!(cfg.workers, 1);
        assert_eq!(cfg.transport.send_timeout, Duration::from_millis(400));
        assert!(!cfg.transport.udp_enabled);
        // untouched node keys keep defaults
        assert_eq!(cfg.tick_interval, Duration::from_millis(10));
    }

    #[test]
    fn empty_udp_listen_disables_udp() {
        let cfg = NodeConfig::from_toml_str("udp_listen = \"\"").unwrap();
        assert_eq!(cfg.udp_listen, None);
    }

    #[test]
    fn bad_address_is_reported() {
        let err = NodeConfig::from_toml_str("listen = \"nowhere\"").unwrap_err();
        assert!(err.to_string().contains("listen"), "{err}");
    }

    #[test]
    fn transport_errors_are_prefixed() {
        let err = NodeConfig::from_toml_str("[transport]\nudp_mtu = 10").unwrap_err();
        assert!(err.to_string().starts_with("[transport]"), "{err}");
    }

    #[test]
    fn zero_workers_rejected() {
        assert!(NodeConfig::from_toml_str("workers = 0").is_err());
    }

    #[test]
    fn unknown_role_rejected() {
        assert!(NodeConfig::from_toml_str("role = \"relay\"").is_err());
    }
}

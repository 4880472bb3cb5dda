//! # Tandem Echo
//!
//! Demo node for the tandem transport. As a server it echoes every message
//! on protocol 1 back to its sender on the channel it arrived on. As a
//! client it sends a numbered message on both channels once per interval
//! and logs the echoes with the current RTT estimate.
//!
//! ## Usage
//!
//! ```bash
//! tandem-echo server --config node.toml
//! tandem-echo server --listen 0.0.0.0:7000 --udp-listen 0.0.0.0:7001
//! tandem-echo client --connect 127.0.0.1:7000 --interval 500
//! ```

use bytes::Bytes;
use crossbeam_channel::{Receiver, RecvTimeoutError};
use quanta::Instant;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tandem_runtime::{ClientNode, NodeConfig, Role, ServerNode};
use tandem_transport::{Channel, DispatchTable, Inbound, PeerEvent, Server};

/// Protocol id the echo service answers on.
const ECHO: u16 = 1;

fn main() -> anyhow::Result<()> {
    // ── Logging ─────────────────────────────────────────────────
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_target(true)
        .compact()
        .init();

    // ── Parse CLI ───────────────────────────────────────────────
    let args = parse_args()?;
    let config = args.config()?;
    tracing::info!(
        role = ?config.role,
        listen = %config.listen,
        connect = %config.connect,
        workers = config.workers,
        "tandem-echo starting"
    );

    // ── Graceful shutdown ───────────────────────────────────────
    let running = Arc::new(AtomicBool::new(true));
    {
        let running = running.clone();
        ctrlc::set_handler(move || {
            tracing::info!("shutting down...");
            running.store(false, Ordering::Relaxed);
        })
        .map_err(|e| anyhow::anyhow!("cannot install signal handler: {e}"))?;
    }

    match config.role {
        Role::Server => run_server(&config, &running),
        Role::Client => run_client(&config, &running, args.interval),
    }
}

// ─── Server ─────────────────────────────────────────────────────────────────

fn echo_table() -> anyhow::Result<DispatchTable<Arc<Server>>> {
    let table = DispatchTable::builder()
        .on(ECHO, |server: &Arc<Server>, msg: Inbound| {
            let peer_id = msg.peer_id;
            if let Err(e) = server.send(peer_id, msg.channel, ECHO, msg.payload, Instant::now()) {
                tracing::warn!(%peer_id, error = %e, "echo failed");
            }
        })?
        .otherwise(|_, msg| {
            tracing::debug!(peer_id = %msg.peer_id, protocol_id = msg.protocol_id, "ignored");
        })
        .build();
    Ok(table)
}

fn run_server(config: &NodeConfig, running: &AtomicBool) -> anyhow::Result<()> {
    let mut node = ServerNode::start(config)?;
    let table = echo_table()?;
    let server = Arc::clone(node.server());
    let mut last_stats_log = std::time::Instant::now();
    let stats_interval = Duration::from_secs(5);

    while running.load(Ordering::Relaxed) {
        match next_event(&node.events) {
            Ok(Some(PeerEvent::MessageReceived {
                peer_id,
                channel,
                protocol_id,
                payload,
            })) => {
                table.dispatch(
                    &server,
                    Inbound {
                        peer_id,
                        channel,
                        protocol_id,
                        payload,
                    },
                );
            }
            Ok(Some(event)) => log_event(&event),
            Ok(None) => {}
            Err(()) => break,
        }

        if last_stats_log.elapsed() >= stats_interval {
            let stats = server.stats();
            tracing::info!(
                sessions = stats.sessions,
                peers = stats.peers,
                waiting = stats.waiting,
                queues = stats.queues_outstanding,
                "server stats"
            );
            if tracing::enabled!(tracing::Level::DEBUG) {
                match serde_json::to_string(&stats) {
                    Ok(json) => tracing::debug!(stats = %json, "server stats detail"),
                    Err(e) => tracing::debug!(error = %e, "cannot serialize stats"),
                }
            }
            last_stats_log = std::time::Instant::now();
        }
    }

    node.shutdown(config.transport.close_grace + config.sweep_interval * 2);
    Ok(())
}

// ─── Client ─────────────────────────────────────────────────────────────────

fn run_client(config: &NodeConfig, running: &AtomicBool, interval: Duration) -> anyhow::Result<()> {
    let mut node = ClientNode::start(config)?;
    let client = Arc::clone(node.client());
    let mut counter = 0u64;
    let mut next_send = std::time::Instant::now();

    while running.load(Ordering::Relaxed) {
        match next_event(&node.events) {
            Ok(Some(PeerEvent::MessageReceived {
                channel, payload, ..
            })) => {
                let quality = client.stats().quality;
                tracing::info!(
                    ?channel,
                    echo = %String::from_utf8_lossy(&payload),
                    srtt_ms = quality.srtt_us / 1000.0,
                    quality = ?quality.quality,
                    "echo"
                );
            }
            Ok(Some(PeerEvent::Disconnected { reason, .. })) => {
                tracing::info!(%reason, "disconnected");
                break;
            }
            Ok(Some(event)) => log_event(&event),
            Ok(None) => {}
            Err(()) => break,
        }

        if std::time::Instant::now() >= next_send && client.connection().has_connected() {
            counter += 1;
            let now = Instant::now();
            for channel in [Channel::Reliable, Channel::Unreliable] {
                let body = Bytes::from(format!("{channel:?} #{counter}"));
                if let Err(e) = client.send(channel, ECHO, body, now) {
                    tracing::debug!(?channel, error = %e, "send failed");
                }
            }
            next_send += interval;
        }
    }

    node.shutdown(config.transport.close_grace);
    Ok(())
}

// ─── Events ─────────────────────────────────────────────────────────────────

/// One event, `None` on a quiet poll, `Err` once the channel is gone.
fn next_event(events: &Receiver<PeerEvent>) -> Result<Option<PeerEvent>, ()> {
    match events.recv_timeout(Duration::from_millis(100)) {
        Ok(event) => Ok(Some(event)),
        Err(RecvTimeoutError::Timeout) => Ok(None),
        Err(RecvTimeoutError::Disconnected) => Err(()),
    }
}

fn log_event(event: &PeerEvent) {
    match event {
        PeerEvent::Connected { peer_id } => tracing::info!(%peer_id, "peer connected"),
        PeerEvent::Offline { peer_id } => tracing::info!(%peer_id, "peer offline"),
        PeerEvent::Disconnected { peer_id, reason } => {
            tracing::info!(%peer_id, %reason, "peer disconnected")
        }
        PeerEvent::Error { peer_id, message } => tracing::warn!(%peer_id, error = %message, "peer error"),
        other => tracing::debug!(event = ?other, "peer event"),
    }
}

// ─── CLI Parsing ────────────────────────────────────────────────────────────

struct Args {
    role: Option<Role>,
    config_path: Option<String>,
    listen: Option<String>,
    udp_listen: Option<String>,
    connect: Option<String>,
    workers: Option<usize>,
    interval: Duration,
}

impl Args {
    /// The config file (or defaults) with command-line overrides applied.
    fn config(&self) -> anyhow::Result<NodeConfig> {
        let mut config = match &self.config_path {
            Some(path) => NodeConfig::load(path)?,
            None => NodeConfig::default(),
        };
        if let Some(role) = self.role {
            config.role = role;
        }
        let parse = |flag: &str, v: &str| {
            v.parse()
                .map_err(|e| anyhow::anyhow!("invalid {flag} address '{v}': {e}"))
        };
        if let Some(v) = &self.listen {
            config.listen = parse("--listen", v)?;
        }
        if let Some(v) = &self.udp_listen {
            config.udp_listen = if v.is_empty() { None } else { Some(parse("--udp-listen", v)?) };
        }
        if let Some(v) = &self.connect {
            config.connect = parse("--connect", v)?;
        }
        if let Some(w) = self.workers {
            config.workers = w;
        }
        config.validate()?;
        Ok(config)
    }
}

fn parse_args() -> anyhow::Result<Args> {
    let args: Vec<String> = std::env::args().collect();
    let mut parsed = Args {
        role: None,
        config_path: None,
        listen: None,
        udp_listen: None,
        connect: None,
        workers: None,
        interval: Duration::from_millis(1000),
    };

    let mut i = 1;
    while i < args.len() {
        let value = |i: usize, flag: &str| {
            args.get(i + 1)
                .cloned()
                .ok_or_else(|| anyhow::anyhow!("{flag} requires a value"))
        };
        match args[i].as_str() {
            "server" => parsed.role = Some(Role::Server),
            "client" => parsed.role = Some(Role::Client),
            "--config" | "-c" => {
                parsed.config_path = Some(value(i, "--config")?);
                i += 1;
            }
            "--listen" | "-l" => {
                parsed.listen = Some(value(i, "--listen")?);
                i += 1;
            }
            "--udp-listen" | "-u" => {
                parsed.udp_listen = Some(value(i, "--udp-listen")?);
                i += 1;
            }
            "--connect" => {
                parsed.connect = Some(value(i, "--connect")?);
                i += 1;
            }
            "--workers" | "-w" => {
                let v = value(i, "--workers")?;
                parsed.workers = Some(
                    v.parse()
                        .map_err(|e| anyhow::anyhow!("invalid workers '{}': {}", v, e))?,
                );
                i += 1;
            }
            "--interval" | "-i" => {
                let v = value(i, "--interval")?;
                let ms: u64 = v
                    .parse()
                    .map_err(|e| anyhow::anyhow!("invalid interval '{}': {}", v, e))?;
                parsed.interval = Duration::from_millis(ms.max(1));
                i += 1;
            }
            "--help" | "-h" => {
                print_help();
                std::process::exit(0);
            }
            other => {
                anyhow::bail!("unknown argument: {other}\nRun with --help for usage.");
            }
        }
        i += 1;
    }

    // Fallback: env vars
    if parsed.config_path.is_none() {
        parsed.config_path = std::env::var("TANDEM_CONFIG").ok().filter(|s| !s.is_empty());
    }

    Ok(parsed)
}

fn print_help() {
    eprintln!(
        r#"tandem-echo: echo server and client over the tandem transport

USAGE:
  tandem-echo <server|client> [OPTIONS]

OPTIONS:
  --config, -c <path>       Node TOML file (role, addresses, [transport] table)
  --listen, -l <addr>       Stream listen address (server, default 0.0.0.0:7000)
  --udp-listen, -u <addr>   Datagram listen address (server, "" disables UDP)
  --connect <addr>          Server address (client, default 127.0.0.1:7000)
  --workers, -w <n>         Tick worker threads
  --interval, -i <ms>       Client send interval (default: 1000)
  --help, -h                Show this help

ENVIRONMENT VARIABLES:
  TANDEM_CONFIG  Node TOML file (fallback for --config)
  RUST_LOG       Log level filter (e.g. info, debug, tandem_transport=trace)
"#
    );
}

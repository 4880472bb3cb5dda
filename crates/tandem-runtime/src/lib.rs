//! # tandem-runtime
//!
//! Threads and std sockets around `tandem-transport`.
//!
//! - [`config`]: Node TOML file with an embedded `[transport]` table
//! - [`runtime`]: Tick workers (`peer_id mod workers`) and the sweep thread
//! - [`net`]: TCP/UDP [`Transport`](tandem_transport::Transport) adapters and the client connector
//! - [`node`]: Server and client nodes tying the above together

pub mod config;
pub mod net;
pub mod node;
pub mod runtime;

pub use config::{NodeConfig, Role};
pub use node::{ClientNode, ServerNode};
pub use runtime::{Runtime, Tickable};

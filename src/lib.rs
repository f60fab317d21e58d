//! # netlease
//!
//! A DHCPv4 lease server for relayed campus networks.
//!
//! ## Features
//!
//! - Text configuration language with `global`, `network`, `subnet` and
//!   `pool` blocks, cascading options and lease times, includes and vendor
//!   option declarations
//! - Separate settings and subnets for registered and unregistered clients,
//!   driven by a pluggable device registry
//! - Lease allocation with a free-lease-after grace period, a desperate
//!   fallback and ICMP liveness probing of fresh addresses
//! - DISCOVER, REQUEST, RELEASE and DECLINE handling with relay gateway
//!   caching, per-pool locking and panic isolation
//! - Pluggable lease persistence (JSON file store included)
//!
//! ## Quick Start
//!
//! ```no_run
//! use std::sync::Arc;
//!
//! use netlease::{Config, DhcpServer, Handler, IcmpProbe, JsonDeviceStore, JsonLeaseStore, ServerConfig};
//!
//! #[tokio::main]
//! async fn main() -> netlease::Result<()> {
//!     let settings = ServerConfig::load_or_create("server.json")?;
//!     let config = Arc::new(Config::parse_file(&settings.dhcp_config)?);
//!     let leases = Arc::new(JsonLeaseStore::open(&settings.leases_file).await?);
//!     let devices = Arc::new(JsonDeviceStore::open(&settings.devices_file).await?);
//!     let probe = Arc::new(IcmpProbe::new(settings.probe_timeout()));
//!
//!     let handler = Arc::new(Handler::new(config, leases, devices, probe));
//!     handler.load_leases().await?;
//!     DhcpServer::new(handler, &settings)?.run().await
//! }
//! ```
//!
//! ## Architecture
//!
//! - [`lexer`] and `parser` - the configuration language
//! - [`topology`] - the parsed [`Config`] tree with resolved settings
//! - [`Pool`] - address ranges and their lease maps
//! - [`Handler`] - per-message protocol logic
//! - [`DhcpServer`] - UDP transport on port 67
//! - [`LeaseStore`] and [`DeviceStore`] - persistence and registration seams

pub mod config;
pub mod device;
pub mod error;
pub mod gateway;
pub mod handler;
pub mod lease;
pub mod lexer;
pub mod mac;
pub mod option_table;
pub mod options;
pub mod packet;
mod parser;
pub mod pool;
pub mod probe;
pub mod server;
pub mod settings;
pub mod store;
pub mod topology;

pub use config::{Environment, ServerConfig};
pub use device::{Device, DeviceRecord, DeviceStore, JsonDeviceStore};
pub use error::{Error, Result};
pub use handler::Handler;
pub use lease::Lease;
pub use mac::MacAddress;
pub use options::{DhcpOption, MessageType};
pub use packet::DhcpPacket;
pub use pool::{Pool, PoolStats};
pub use probe::{DisabledProbe, IcmpProbe, LivenessProbe};
pub use server::DhcpServer;
pub use store::{JsonLeaseStore, LeaseQuery, LeaseStore};
pub use topology::Config;

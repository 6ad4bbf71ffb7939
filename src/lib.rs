//! Gatehouse - the control plane of a multi-tenant L7 reverse-proxy gateway.
//!
//! Gatehouse decides *where* a connection goes and *whether* it may go there;
//! moving bytes is left to the embedding proxy. It is laid out as a
//! **hexagonal architecture**: domain logic in `core`, traits in `ports`,
//! implementations in `adapters`.
//!
//! # Features
//! - Host-based routing with exact and `*` label wildcard patterns, first match wins
//! - Priority groups with active/standby failover and pluggable load balancing
//!   (round-robin, random, least connections)
//! - Three-tier admission control (global, backend, client) for QPS and
//!   concurrent connections, with transactional connection permits
//! - Atomic registry updates with rollback, versioned change events and
//!   invalidation of connections made stale by a reload
//! - Active TCP / HTTP health checks with success and failure thresholds
//! - Live configuration hot-reload & validation
//! - Metrics via the `metrics` facade & structured tracing via `tracing`
//!
//! # Quick Example
//! ```no_run
//! use std::net::{IpAddr, Ipv4Addr};
//!
//! use gatehouse::{GatewayService, config::loader::load_config};
//!
//! # #[tokio::main] async fn main() -> eyre::Result<()> {
//! let config = load_config("gatehouse.yaml").await?;
//! let gateway = GatewayService::new(config)?;
//! gateway.start_background_tasks();
//!
//! let client = IpAddr::V4(Ipv4Addr::new(192, 0, 2, 10));
//! match gateway.admit("api.example.com", client) {
//!     Ok(lease) => {
//!         // Hand lease.connection().endpoint() to the data path and keep the
//!         // lease alive for as long as the physical connection stays open.
//!         gateway.check_request(&lease)?;
//!     }
//!     Err(e) => eprintln!("reject with {}", e.status_code()),
//! }
//! # Ok(()) }
//! ```
//!
//! # Error Handling
//! Domain operations return [`GatewayError`]; each variant maps to the HTTP
//! status the I/O layer answers with. Configuration and binary level code
//! uses `eyre::Result` with `WrapErr` context.
//!
//! # Concurrency & Data Structures
//! Snapshots are published through `arc-swap`; shared mutable maps use
//! `scc::HashMap`. Limiters are lock-free atomics.
pub mod config;
pub mod metrics;
pub mod ports;
pub mod tracing_setup;
pub mod utils;

pub mod adapters;
pub mod core;

// Re-export the specific types needed by the binary crate
pub use crate::{
    adapters::{FileConfigProvider, HealthCheckManager},
    core::{ConnectionLease, GatewayError, GatewayResult, GatewayService, Resolution},
    ports::config_provider::ConfigProvider,
    utils::GracefulShutdown,
};

//! # Hydra
//!
//! Hydra launches a fleet of synthetic HTTP/HTTPS backends for router
//! performance testing. A single supervisor process issues a per-run CA and
//! server certificate, spawns one worker process per backend, and serves a
//! small metadata service that workers register with and that load generators
//! query for the fleet's topology.
//!
//! ## Architecture
//!
//! ```text
//! CLI → FleetSupervisor ─┬─ certs (CA + leaf issuance, cert store)
//!                        ├─ api (metadata service: /register, /backends, /certs)
//!                        └─ fleet::process → worker processes → worker::client
//! ```
//!
//! ## Module Organization
//!
//! - `domain`: traffic kinds, worker identities and the fleet topology
//! - `fleet`: registration barrier, process supervision and the run state machine
//! - `api`: the metadata service router and its HTTP/TLS listeners
//! - `worker`: the per-backend runtime and metadata clients
//! - `certs`, `config`, `errors`, `observability`: supporting infrastructure

pub mod api;
pub mod certs;
pub mod cli;
pub mod config;
pub mod domain;
pub mod errors;
pub mod fleet;
pub mod observability;
pub mod worker;

// Re-export commonly used types
pub use config::FleetConfig;
pub use errors::{FleetError, Result};
pub use fleet::FleetSupervisor;

/// Application version from Cargo.toml
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Application name from Cargo.toml
pub const APP_NAME: &str = env!("CARGO_PKG_NAME");

//! # Configuration Management
//!
//! Typed settings for a fleet run. Defaults match the long-standing
//! `perf-test-hydra` layout; `HYDRA_*` environment variables and CLI flags
//! override them.

pub mod settings;

pub use settings::{FleetConfig, MetadataServerConfig, ObservabilityConfig};

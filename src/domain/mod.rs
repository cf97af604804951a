//! Domain layer
//!
//! Pure fleet entities with no process, network or HTTP dependencies.
//!
//! ## Module Organization
//!
//! - `traffic`: traffic kinds and their routing conventions
//! - `worker`: worker identities, specs, bound registrations and the fleet topology

pub mod traffic;
pub mod worker;

pub use traffic::{TrafficKind, UnknownTrafficKind};
pub use worker::{BoundWorker, FleetTopology, WorkerIdentity, WorkerSpec};

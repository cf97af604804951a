//! # Fleet Lifecycle
//!
//! ## Module Organization
//!
//! - `barrier`: registration table and the one-shot "all registered" signal
//! - `process`: worker spawning, death fan-in and the parent-death pipe
//! - `supervisor`: the run state machine tying the pieces together
//! - `host`: hostname and host IP discovery

pub mod barrier;
pub mod host;
pub mod process;
pub mod supervisor;

pub use barrier::{BarrierOutcome, RegistrationBarrier};
pub use host::{collect_sans, HostIdentity};
pub use process::{WorkerCommand, WorkerExit, WorkerLaunch, WorkerProcesses, WorkerState};
pub use supervisor::{metadata_url, FleetReady, FleetSupervisor};

//! # Observability Infrastructure
//!
//! Structured logging for the supervisor and its workers, plus request tracing
//! for the metadata service.

pub mod http_tracing;
pub mod logging;

pub use http_tracing::trace_http_requests;
pub use logging::{init_logging, new_run_id};

//! # Metadata Service
//!
//! HTTP control plane owned by the supervisor: workers register their bound
//! addresses here and external tooling reads the resulting topology and the
//! run's certificates.

pub mod error;
pub mod handlers;
pub mod routes;
pub mod server;

pub use error::ApiError;
pub use routes::{build_router, MetadataState};
pub use server::{serve_http, serve_tls, MetadataServer, TlsListener};

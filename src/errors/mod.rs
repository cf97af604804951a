//! # Error Handling
//!
//! Error taxonomy for a fleet run. Every variant of [`FleetError`] is fatal to
//! the run that produced it; per-request registration problems live in
//! [`RegistrationError`] and never escape the metadata service.

pub mod registration;
pub mod tls;

pub use registration::RegistrationError;
pub use tls::TlsError;

use std::process::ExitStatus;
use std::time::Duration;

/// Custom result type for fleet operations
pub type Result<T> = std::result::Result<T, FleetError>;

/// Fatal errors surfaced by the supervisor, the metadata service and workers
#[derive(thiserror::Error, Debug)]
pub enum FleetError {
    /// A worker process could not be created
    #[error("Failed to spawn worker {worker}: {source}")]
    Spawn {
        worker: String,
        #[source]
        source: std::io::Error,
    },

    /// CA or leaf certificate issuance failed
    #[error("Certificate generation failed: {message}")]
    CertificateGeneration {
        message: String,
        #[source]
        source: Option<rcgen::Error>,
    },

    /// Not every worker registered before the deadline
    #[error("Timed out after {waited:?} waiting for backends to register ({registered}/{expected})")]
    RegistrationTimeout { registered: usize, expected: usize, waited: Duration },

    /// A fleet member exited while the run was still active
    #[error("Backend {worker} died unexpectedly ({status})")]
    ChildTerminated { worker: String, status: ExitStatus },

    /// A listener could not be bound
    #[error("Failed to listen on {address}: {source}")]
    Listen {
        address: String,
        #[source]
        source: std::io::Error,
    },

    /// Configuration errors
    #[error("Configuration error: {0}")]
    Config(String),

    /// Network transport errors (HTTP client or server)
    #[error("Transport error: {0}")]
    Transport(String),

    /// TLS material could not be loaded
    #[error("TLS error: {0}")]
    Tls(#[from] TlsError),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Internal errors
    #[error("Internal error: {0}")]
    Internal(String),
}

impl FleetError {
    /// Create a new configuration error
    pub fn config<S: Into<String>>(message: S) -> Self {
        Self::Config(message.into())
    }

    /// Create a new transport error
    pub fn transport<S: Into<String>>(message: S) -> Self {
        Self::Transport(message.into())
    }

    /// Create a new internal error
    pub fn internal<S: Into<String>>(message: S) -> Self {
        Self::Internal(message.into())
    }

    /// Create a certificate generation error without an rcgen source
    pub fn certificate<S: Into<String>>(message: S) -> Self {
        Self::CertificateGeneration { message: message.into(), source: None }
    }

    /// Create a listen error for the given address
    pub fn listen<A: ToString>(address: A, source: std::io::Error) -> Self {
        Self::Listen { address: address.to_string(), source }
    }
}

impl From<rcgen::Error> for FleetError {
    fn from(error: rcgen::Error) -> Self {
        Self::CertificateGeneration { message: error.to_string(), source: Some(error) }
    }
}

impl From<validator::ValidationErrors> for FleetError {
    fn from(errors: validator::ValidationErrors) -> Self {
        let message = errors
            .field_errors()
            .iter()
            .map(|(field, field_errors)| {
                let messages: Vec<String> = field_errors
                    .iter()
                    .map(|e| e.message.as_ref().map_or("Invalid value".to_string(), |m| m.to_string()))
                    .collect();
                format!("{}: {}", field, messages.join(", "))
            })
            .collect::<Vec<_>>()
            .join("; ");

        Self::Config(format!("Validation failed: {}", message))
    }
}

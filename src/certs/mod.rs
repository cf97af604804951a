//! # Certificates
//!
//! Issuance of the per-run CA and shared leaf certificate, and the on-disk
//! store TLS workers load it from.

pub mod issuer;
pub mod store;

pub use issuer::{issue, CertificateBundle, SubjectAltNames};
pub use store::{server_config_from_pem, CertStore};

//! # Configuration Settings
//!
//! Defines the configuration structure for a fleet run.

use std::net::IpAddr;
use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use validator::Validate;

use crate::errors::{FleetError, Result};

/// Settings for one fleet run
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
pub struct FleetConfig {
    /// Prefix of every worker identity (`<prefix>-<kind>-<index>`)
    #[validate(length(min = 1, max = 40, message = "Host prefix must be 1-40 characters"))]
    pub host_prefix: String,

    /// Workers spawned per traffic kind
    #[validate(range(min = 1, max = 1000, message = "Backends per kind must be between 1 and 1000"))]
    pub backends_per_kind: usize,

    /// Address workers bind (with port 0) and report
    #[validate(length(min = 1, message = "Listen address cannot be empty"))]
    pub listen_address: String,

    /// Directory the certificate store is written under
    pub output_dir: PathBuf,

    /// How long to wait for every worker to register
    #[validate(range(
        min = 1,
        max = 3600,
        message = "Registration timeout must be between 1 and 3600 seconds"
    ))]
    pub registration_timeout_seconds: u64,

    /// Metadata service settings
    #[validate(nested)]
    pub metadata: MetadataServerConfig,
}

impl Default for FleetConfig {
    fn default() -> Self {
        Self {
            host_prefix: "perf-test-hydra".to_string(),
            backends_per_kind: 1,
            listen_address: "127.0.0.1".to_string(),
            output_dir: PathBuf::from("/tmp/perf-test-hydra"),
            registration_timeout_seconds: 15,
            metadata: MetadataServerConfig::default(),
        }
    }
}

impl FleetConfig {
    /// Create FleetConfig from `HYDRA_*` environment variables
    pub fn from_env() -> Result<Self> {
        let defaults = Self::default();

        let backends_per_kind = parse_env("HYDRA_BACKENDS_PER_KIND")?.unwrap_or(defaults.backends_per_kind);
        let registration_timeout_seconds =
            parse_env("HYDRA_REGISTRATION_TIMEOUT_SECONDS")?.unwrap_or(defaults.registration_timeout_seconds);

        Ok(Self {
            host_prefix: std::env::var("HYDRA_HOST_PREFIX").unwrap_or(defaults.host_prefix),
            backends_per_kind,
            listen_address: std::env::var("HYDRA_LISTEN_ADDRESS").unwrap_or(defaults.listen_address),
            output_dir: std::env::var("HYDRA_OUTPUT_DIR").map(PathBuf::from).unwrap_or(defaults.output_dir),
            registration_timeout_seconds,
            metadata: MetadataServerConfig::from_env()?,
        })
    }

    /// Validate the entire configuration
    pub fn validate(&self) -> Result<()> {
        Validate::validate(self).map_err(FleetError::from)?;
        self.validate_custom()
    }

    fn validate_custom(&self) -> Result<()> {
        if !is_dns_label_prefix(&self.host_prefix) {
            return Err(FleetError::config(format!(
                "Host prefix '{}' must contain only lowercase letters, digits and '-', and must not start or end with '-'",
                self.host_prefix
            )));
        }

        if self.listen_address.parse::<IpAddr>().is_err() && !is_hostname(&self.listen_address) {
            return Err(FleetError::config(format!(
                "Listen address '{}' is neither an IP address nor a hostname",
                self.listen_address
            )));
        }

        self.metadata.validate_custom()
    }

    pub fn registration_timeout(&self) -> Duration {
        Duration::from_secs(self.registration_timeout_seconds)
    }

    /// Directory the certificate store lives in
    pub fn cert_dir(&self) -> PathBuf {
        self.output_dir.join("certs")
    }
}

/// Metadata service configuration
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
pub struct MetadataServerConfig {
    /// Bind address
    #[validate(length(min = 1, message = "Bind address cannot be empty"))]
    pub bind_address: String,

    /// Port; 0 asks the kernel for one
    pub port: u16,

    /// Grace period for in-flight requests at shutdown
    #[validate(range(max = 300, message = "Shutdown grace must be at most 300 seconds"))]
    pub shutdown_grace_seconds: u64,
}

impl Default for MetadataServerConfig {
    fn default() -> Self {
        Self { bind_address: "0.0.0.0".to_string(), port: 2000, shutdown_grace_seconds: 15 }
    }
}

impl MetadataServerConfig {
    pub fn from_env() -> Result<Self> {
        let defaults = Self::default();
        Ok(Self {
            bind_address: std::env::var("HYDRA_METADATA_BIND_ADDRESS").unwrap_or(defaults.bind_address),
            port: parse_env("HYDRA_METADATA_PORT")?.unwrap_or(defaults.port),
            shutdown_grace_seconds: parse_env("HYDRA_SHUTDOWN_GRACE_SECONDS")?
                .unwrap_or(defaults.shutdown_grace_seconds),
        })
    }

    fn validate_custom(&self) -> Result<()> {
        self.bind_address
            .parse::<IpAddr>()
            .map(|_| ())
            .map_err(|_| FleetError::config(format!("Metadata bind address '{}' is not an IP address", self.bind_address)))
    }

    /// `address:port` string suitable for binding
    pub fn socket_address(&self) -> String {
        match self.bind_address.parse::<IpAddr>() {
            Ok(IpAddr::V6(v6)) => format!("[{}]:{}", v6, self.port),
            _ => format!("{}:{}", self.bind_address, self.port),
        }
    }

    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_secs(self.shutdown_grace_seconds)
    }
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
pub struct ObservabilityConfig {
    /// Log level (trace, debug, info, warn, error) or a full filter directive
    #[validate(length(min = 1, message = "Log level cannot be empty"))]
    pub log_level: String,

    /// Enable JSON structured logging
    pub json_logging: bool,
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self { log_level: "info".to_string(), json_logging: false }
    }
}

impl ObservabilityConfig {
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            log_level: std::env::var("HYDRA_LOG_LEVEL").unwrap_or(defaults.log_level),
            json_logging: std::env::var("HYDRA_JSON_LOGGING")
                .map(|s| s.to_lowercase() == "true" || s == "1")
                .unwrap_or(defaults.json_logging),
        }
    }
}

fn parse_env<T>(name: &str) -> Result<Option<T>>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    match std::env::var(name) {
        Ok(raw) => raw
            .trim()
            .parse::<T>()
            .map(Some)
            .map_err(|e| FleetError::config(format!("Invalid {}: {}", name, e))),
        Err(_) => Ok(None),
    }
}

fn is_dns_label_prefix(s: &str) -> bool {
    !s.is_empty()
        && !s.starts_with('-')
        && !s.ends_with('-')
        && s.chars().all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-')
}

/// RFC 1123 host name: dot-separated ASCII labels
pub(crate) fn is_hostname(s: &str) -> bool {
    !s.is_empty()
        && s.len() <= 253
        && s.split('.').all(|label| {
            !label.is_empty()
                && label.len() <= 63
                && !label.starts_with('-')
                && !label.ends_with('-')
                && label.chars().all(|c| c.is_ascii_alphanumeric() || c == '-')
        })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        let config = FleetConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.host_prefix, "perf-test-hydra");
        assert_eq!(config.metadata.port, 2000);
        assert_eq!(config.cert_dir(), PathBuf::from("/tmp/perf-test-hydra/certs"));
    }

    #[test]
    fn test_backends_per_kind_range() {
        let config = FleetConfig { backends_per_kind: 0, ..Default::default() };
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("backends_per_kind"));

        let config = FleetConfig { backends_per_kind: 1001, ..Default::default() };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_prefix_must_be_label_safe() {
        for bad in ["Perf", "perf_test", "-perf", "perf-", "a.b"] {
            let config = FleetConfig { host_prefix: bad.to_string(), ..Default::default() };
            assert!(config.validate().is_err(), "{bad} should be rejected");
        }
    }

    #[test]
    fn test_listen_address_accepts_ip_and_hostname() {
        for good in ["0.0.0.0", "::", "10.1.2.3", "localhost", "box.example"] {
            let config = FleetConfig { listen_address: good.to_string(), ..Default::default() };
            assert!(config.validate().is_ok(), "{good} should be accepted");
        }
        let config = FleetConfig { listen_address: "not a host".to_string(), ..Default::default() };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_metadata_socket_address_brackets_ipv6() {
        let config = MetadataServerConfig { bind_address: "::1".into(), port: 2000, shutdown_grace_seconds: 1 };
        assert_eq!(config.socket_address(), "[::1]:2000");
        assert_eq!(MetadataServerConfig::default().socket_address(), "0.0.0.0:2000");
    }

    #[test]
    fn test_metadata_bind_address_must_be_ip() {
        let config = FleetConfig {
            metadata: MetadataServerConfig { bind_address: "localhost".into(), ..Default::default() },
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_parse_env_reports_variable() {
        std::env::set_var("HYDRA_TEST_PARSE_ENV_PORT", "not-a-port");
        let err = parse_env::<u16>("HYDRA_TEST_PARSE_ENV_PORT").unwrap_err();
        assert!(err.to_string().contains("HYDRA_TEST_PARSE_ENV_PORT"));
        std::env::remove_var("HYDRA_TEST_PARSE_ENV_PORT");

        assert_eq!(parse_env::<u16>("HYDRA_TEST_PARSE_ENV_UNSET").unwrap(), None);
    }
}

//! Traffic kinds and their routing conventions.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// Termination/transport category of a synthetic backend.
///
/// Variant order is the canonical ordering used for topology construction and
/// every listing produced by the metadata service.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TrafficKind {
    /// TLS terminated at the router, plain HTTP to the backend
    Edge,

    /// Plain HTTP end to end
    Http,

    /// TLS passed through the router untouched
    Passthrough,

    /// TLS terminated at the router and re-established to the backend
    Reencrypt,
}

impl TrafficKind {
    /// Every kind, in canonical order
    pub const ALL: [TrafficKind; 4] =
        [TrafficKind::Edge, TrafficKind::Http, TrafficKind::Passthrough, TrafficKind::Reencrypt];

    /// Wire name used in JSON payloads, worker identities and URLs
    pub fn as_str(&self) -> &'static str {
        match self {
            TrafficKind::Edge => "edge",
            TrafficKind::Http => "http",
            TrafficKind::Passthrough => "passthrough",
            TrafficKind::Reencrypt => "reencrypt",
        }
    }

    /// URL scheme a client uses to reach a route of this kind
    pub fn scheme(&self) -> &'static str {
        match self {
            TrafficKind::Http => "http",
            _ => "https",
        }
    }

    /// Port the downstream router listens on for this kind
    pub fn router_port(&self) -> u16 {
        match self {
            TrafficKind::Http => 8080,
            _ => 8443,
        }
    }

    /// Whether the backend itself speaks TLS
    pub fn terminates_tls_at_backend(&self) -> bool {
        matches!(self, TrafficKind::Passthrough | TrafficKind::Reencrypt)
    }
}

impl fmt::Display for TrafficKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Returned when a string does not name a traffic kind
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown traffic type '{0}'")]
pub struct UnknownTrafficKind(pub String);

impl FromStr for TrafficKind {
    type Err = UnknownTrafficKind;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "edge" => Ok(TrafficKind::Edge),
            "http" => Ok(TrafficKind::Http),
            "passthrough" => Ok(TrafficKind::Passthrough),
            "reencrypt" => Ok(TrafficKind::Reencrypt),
            other => Err(UnknownTrafficKind(other.to_string())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_every_wire_name() {
        for kind in TrafficKind::ALL {
            assert_eq!(kind.as_str().parse::<TrafficKind>(), Ok(kind));
        }
    }

    #[test]
    fn rejects_unknown_kind() {
        let err = "grpc".parse::<TrafficKind>().unwrap_err();
        assert_eq!(err.to_string(), "unknown traffic type 'grpc'");
    }

    #[test]
    fn scheme_and_port_conventions() {
        assert_eq!(TrafficKind::Http.scheme(), "http");
        assert_eq!(TrafficKind::Http.router_port(), 8080);
        for kind in [TrafficKind::Edge, TrafficKind::Passthrough, TrafficKind::Reencrypt] {
            assert_eq!(kind.scheme(), "https");
            assert_eq!(kind.router_port(), 8443);
        }
    }

    #[test]
    fn only_passthrough_and_reencrypt_backends_speak_tls() {
        assert!(!TrafficKind::Http.terminates_tls_at_backend());
        assert!(!TrafficKind::Edge.terminates_tls_at_backend());
        assert!(TrafficKind::Passthrough.terminates_tls_at_backend());
        assert!(TrafficKind::Reencrypt.terminates_tls_at_backend());
    }

    #[test]
    fn serde_uses_lowercase_names() {
        let json = serde_json::to_string(&TrafficKind::Reencrypt).unwrap();
        assert_eq!(json, "\"reencrypt\"");
        let kind: TrafficKind = serde_json::from_str("\"edge\"").unwrap();
        assert_eq!(kind, TrafficKind::Edge);
    }
}

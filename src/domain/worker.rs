//! Worker identities, specs and bound registrations.

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::net::IpAddr;

use serde::{Deserialize, Serialize};

use super::traffic::TrafficKind;
use crate::errors::RegistrationError;

/// Identity of one worker, unique within a fleet run.
///
/// Derived deterministically as `<prefix>-<kind>-<index>`, which doubles as the
/// worker's hostname in the issued certificate and in generated host files.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct WorkerIdentity(String);

impl WorkerIdentity {
    /// Build the identity of the `index`th worker of `kind`
    pub fn new(prefix: &str, kind: TrafficKind, index: usize) -> Self {
        Self(format!("{}-{}-{}", prefix, kind, index))
    }

    /// Wrap an identity received from the outside (CLI argument, JSON payload)
    pub fn from_string(s: String) -> Self {
        Self(s)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn into_string(self) -> String {
        self.0
    }
}

impl fmt::Display for WorkerIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for WorkerIdentity {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

/// Spawn-time intent for a single worker
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct WorkerSpec {
    pub name: WorkerIdentity,
    pub traffic_type: TrafficKind,
}

impl WorkerSpec {
    pub fn new(name: WorkerIdentity, traffic_type: TrafficKind) -> Self {
        Self { name, traffic_type }
    }
}

/// A worker after it has claimed a kernel-assigned port.
///
/// This is also the `/register` wire format, so unknown fields are rejected at
/// the deserialization boundary.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct BoundWorker {
    pub name: WorkerIdentity,
    pub traffic_type: TrafficKind,
    pub listen_address: String,
    pub port: u16,
}

impl BoundWorker {
    pub fn new(spec: WorkerSpec, listen_address: impl Into<String>, port: u16) -> Self {
        Self { name: spec.name, traffic_type: spec.traffic_type, listen_address: listen_address.into(), port }
    }

    /// URL a load-test client uses to fetch the standard payload from this worker
    pub fn url(&self) -> String {
        let host = match self.listen_address.parse::<IpAddr>() {
            Ok(IpAddr::V6(v6)) => format!("[{}]", v6),
            _ => self.listen_address.clone(),
        };
        format!("{}://{}:{}/1024.html", self.traffic_type.scheme(), host, self.port)
    }

    /// Structural checks that serde cannot express
    pub fn validate(&self) -> Result<(), RegistrationError> {
        if self.name.as_str().trim().is_empty() {
            return Err(RegistrationError::malformed("name must not be empty"));
        }
        if self.listen_address.trim().is_empty() {
            return Err(RegistrationError::malformed("listen_address must not be empty"));
        }
        if self.port == 0 {
            return Err(RegistrationError::malformed("port must be a bound, non-zero port"));
        }
        Ok(())
    }
}

/// The fixed set of workers for one run, grouped by traffic kind.
#[derive(Debug, Clone)]
pub struct FleetTopology {
    by_kind: BTreeMap<TrafficKind, Vec<WorkerSpec>>,
    index: HashMap<WorkerIdentity, TrafficKind>,
}

impl FleetTopology {
    /// `backends_per_kind` workers for every traffic kind
    pub fn new(prefix: &str, backends_per_kind: usize) -> Self {
        Self::with_kinds(prefix, backends_per_kind, &TrafficKind::ALL)
    }

    pub fn with_kinds(prefix: &str, backends_per_kind: usize, kinds: &[TrafficKind]) -> Self {
        let mut by_kind = BTreeMap::new();
        let mut index = HashMap::new();

        for &kind in kinds {
            let specs: Vec<WorkerSpec> = (0..backends_per_kind)
                .map(|i| WorkerSpec::new(WorkerIdentity::new(prefix, kind, i), kind))
                .collect();
            for spec in &specs {
                index.insert(spec.name.clone(), kind);
            }
            by_kind.insert(kind, specs);
        }

        Self { by_kind, index }
    }

    /// Total number of workers
    pub fn len(&self) -> usize {
        self.index.len()
    }

    pub fn is_empty(&self) -> bool {
        self.index.is_empty()
    }

    pub fn kinds(&self) -> impl Iterator<Item = TrafficKind> + '_ {
        self.by_kind.keys().copied()
    }

    /// Workers of one kind, in ordinal order
    pub fn workers_of(&self, kind: TrafficKind) -> &[WorkerSpec] {
        self.by_kind.get(&kind).map(Vec::as_slice).unwrap_or(&[])
    }

    /// Every worker, kinds in canonical order and ordinals ascending
    pub fn iter(&self) -> impl Iterator<Item = &WorkerSpec> {
        self.by_kind.values().flatten()
    }

    /// Traffic kind the topology expects for `identity`, if it is a member
    pub fn kind_of(&self, identity: &WorkerIdentity) -> Option<TrafficKind> {
        self.index.get(identity).copied()
    }
}

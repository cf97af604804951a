//! Registration barrier
//!
//! Concurrency-safe table of bound workers plus a one-shot "all registered"
//! signal. The table itself is a [`DashMap`]; the narrow `count` mutex exists
//! only so that "insert, bump the count, maybe release" is a single step and
//! exactly one registration can observe that it was the last.

use std::collections::{BTreeMap, HashMap};
use std::sync::Mutex;
use std::time::Duration;

use dashmap::{mapref::entry::Entry, DashMap};
use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::domain::{BoundWorker, FleetTopology, TrafficKind, WorkerIdentity};
use crate::errors::{FleetError, RegistrationError, Result};

/// Outcome of waiting on the barrier when the wait did not time out
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BarrierOutcome {
    /// Every expected worker registered
    Ready,
    /// The run was canceled before the barrier opened
    Canceled,
}

#[derive(Debug)]
pub struct RegistrationBarrier {
    entries: DashMap<WorkerIdentity, BoundWorker>,
    count: Mutex<usize>,
    expected: usize,
    members: Option<HashMap<WorkerIdentity, TrafficKind>>,
    ready: watch::Sender<bool>,
    accepted: Option<mpsc::UnboundedSender<WorkerIdentity>>,
}

impl RegistrationBarrier {
    /// Barrier releasing after `expected` distinct identities register.
    /// Any identity is accepted.
    pub fn new(expected: usize) -> Self {
        let (ready, _) = watch::channel(expected == 0);
        Self { entries: DashMap::new(), count: Mutex::new(0), expected, members: None, ready, accepted: None }
    }

    /// Barrier that only accepts the workers of `topology`, each with its own traffic kind
    pub fn for_topology(topology: &FleetTopology) -> Self {
        let members = topology.iter().map(|spec| (spec.name.clone(), spec.traffic_type)).collect();
        Self { members: Some(members), ..Self::new(topology.len()) }
    }

    /// Stream of identities as they are accepted, in acceptance order.
    /// Rejected registrations never appear. Replaces any earlier feed.
    pub fn accepted_feed(&mut self) -> mpsc::UnboundedReceiver<WorkerIdentity> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.accepted = Some(tx);
        rx
    }

    pub fn expected(&self) -> usize {
        self.expected
    }

    /// Number of accepted registrations so far
    pub fn registered(&self) -> usize {
        *self.count.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn is_ready(&self) -> bool {
        *self.ready.borrow()
    }

    /// Record `worker` as bound. Rejects duplicates, malformed entries and
    /// identities that do not belong to the fleet.
    pub fn register(&self, worker: BoundWorker) -> std::result::Result<(), RegistrationError> {
        worker.validate()?;

        if let Some(members) = &self.members {
            match members.get(&worker.name) {
                None => {
                    return Err(RegistrationError::Unexpected(format!(
                        "{} is not a member of this fleet",
                        worker.name
                    )))
                }
                Some(kind) if *kind != worker.traffic_type => {
                    return Err(RegistrationError::Unexpected(format!(
                        "{} was spawned as {} but registered as {}",
                        worker.name, kind, worker.traffic_type
                    )))
                }
                Some(_) => {}
            }
        }

        let mut count = self.count.lock().unwrap_or_else(|e| e.into_inner());

        let identity = worker.name.clone();
        match self.entries.entry(identity.clone()) {
            Entry::Occupied(_) => return Err(RegistrationError::Duplicate(worker.name.into_string())),
            Entry::Vacant(slot) => {
                debug!(
                    worker = %worker.name,
                    traffic_type = %worker.traffic_type,
                    listen_address = %worker.listen_address,
                    port = worker.port,
                    "Backend registered"
                );
                slot.insert(worker);
            }
        }

        if let Some(feed) = &self.accepted {
            let _ = feed.send(identity);
        }

        *count += 1;
        if *count == self.expected {
            info!(registered = *count, "All backends registered");
            self.ready.send_replace(true);
        }

        Ok(())
    }

    /// Block until every expected worker registered, `timeout` elapses or
    /// `cancel` fires. A timeout is fatal; cancellation is a clean return.
    pub async fn await_all(&self, timeout: Duration, cancel: &CancellationToken) -> Result<BarrierOutcome> {
        let mut ready = self.ready.subscribe();

        tokio::select! {
            biased;
            _ = cancel.cancelled() => Ok(BarrierOutcome::Canceled),
            // The sender lives in `self`, so wait_for only returns Ok here.
            res = ready.wait_for(|released| *released) => match res {
                Ok(_) => Ok(BarrierOutcome::Ready),
                Err(_) => Err(FleetError::internal("registration barrier dropped")),
            },
            _ = tokio::time::sleep(timeout) => Err(FleetError::RegistrationTimeout {
                registered: self.registered(),
                expected: self.expected,
                waited: timeout,
            }),
        }
    }

    pub fn get(&self, identity: &WorkerIdentity) -> Option<BoundWorker> {
        self.entries.get(identity).map(|entry| entry.value().clone())
    }

    /// Copy of every registration, ordered by identity
    pub fn snapshot(&self) -> Vec<BoundWorker> {
        let mut workers: Vec<BoundWorker> = self.entries.iter().map(|entry| entry.value().clone()).collect();
        workers.sort_by(|a, b| (a.traffic_type, &a.name).cmp(&(b.traffic_type, &b.name)));
        workers
    }

    /// Registrations grouped by kind, following the topology's ordinal order.
    /// Workers that have not registered yet are omitted.
    pub fn snapshot_by_kind(&self, topology: &FleetTopology) -> BTreeMap<TrafficKind, Vec<BoundWorker>> {
        let mut grouped = BTreeMap::new();
        for kind in topology.kinds() {
            let bound: Vec<BoundWorker> =
                topology.workers_of(kind).iter().filter_map(|spec| self.get(&spec.name)).collect();
            if !bound.is_empty() {
                grouped.insert(kind, bound);
            }
        }
        grouped
    }
}

//! Fleet Supervisor
//!
//! Drives a single run: issue certificates, bind the metadata service, spawn
//! every worker, wait on the registration barrier while watching for worker
//! death, then keep the fleet up until cancelled. Every fatal condition
//! cancels the run token, which is the only thing the other tasks observe.

use std::collections::BTreeMap;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::path::PathBuf;
use std::sync::Arc;

use time::OffsetDateTime;
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn, Instrument};

use super::barrier::{BarrierOutcome, RegistrationBarrier};
use super::host::{collect_sans, HostIdentity};
use super::process::{WorkerCommand, WorkerExit, WorkerLaunch, WorkerProcesses};
use crate::api::handlers::BackendsByKind;
use crate::api::{build_router, MetadataServer, MetadataState};
use crate::certs::{issue, CertStore};
use crate::config::FleetConfig;
use crate::domain::{FleetTopology, WorkerIdentity};
use crate::errors::{FleetError, Result};
use crate::observability::new_run_id;

/// Validity of the per-run certificates
const CERTIFICATE_VALIDITY: time::Duration = time::Duration::days(365);

/// Published once every worker has registered
#[derive(Debug, Clone)]
pub struct FleetReady {
    pub metadata_addr: SocketAddr,
    pub metadata_url: String,
    pub cert_dir: PathBuf,
    pub backends: BackendsByKind,
    pub pids: BTreeMap<WorkerIdentity, u32>,
}

pub struct FleetSupervisor {
    config: FleetConfig,
    command: WorkerCommand,
    run_id: String,
    host: Option<HostIdentity>,
    ready: Option<oneshot::Sender<FleetReady>>,
}

impl FleetSupervisor {
    /// Supervisor spawning `command` once per worker
    pub fn new(config: FleetConfig, command: WorkerCommand) -> Self {
        Self { config, command, run_id: new_run_id(), host: None, ready: None }
    }

    /// Skip host discovery and use `host` for SANs and advertised addresses
    pub fn with_host(mut self, host: HostIdentity) -> Self {
        self.host = Some(host);
        self
    }

    /// Receive the topology once the barrier opens
    pub fn notify_ready(&mut self) -> oneshot::Receiver<FleetReady> {
        let (tx, rx) = oneshot::channel();
        self.ready = Some(tx);
        rx
    }

    pub fn run_id(&self) -> &str {
        &self.run_id
    }

    /// Run the fleet until `cancel` fires (clean return) or a fatal condition occurs.
    pub async fn run(self, cancel: CancellationToken) -> Result<()> {
        let span = crate::fleet_span!(
            self.run_id,
            backends_per_kind = self.config.backends_per_kind,
            prefix = %self.config.host_prefix
        );
        self.run_inner(cancel).instrument(span).await
    }

    async fn run_inner(mut self, cancel: CancellationToken) -> Result<()> {
        self.config.validate()?;

        let topology = Arc::new(FleetTopology::new(&self.config.host_prefix, self.config.backends_per_kind));
        let host = self.host.take().unwrap_or_else(HostIdentity::discover);

        let names = collect_sans(&host, &self.config.listen_address, &topology);
        let now = OffsetDateTime::now_utc();
        let bundle = Arc::new(issue(now, now + CERTIFICATE_VALIDITY, &names)?);
        let store = CertStore::write(self.config.cert_dir(), &bundle)?;

        let mut barrier = RegistrationBarrier::for_topology(&topology);
        let mut accepted = barrier.accepted_feed();
        let barrier = Arc::new(barrier);
        let server = MetadataServer::bind(&self.config.metadata).await?;
        let metadata_addr = server.local_addr();
        let metadata_url = metadata_url(metadata_addr);

        let run = cancel.child_token();
        let grace = self.config.metadata.shutdown_grace();

        let state = MetadataState::new(barrier.clone(), topology.clone()).with_certificates(bundle);
        let (server_errors_tx, mut server_errors) = mpsc::channel::<FleetError>(1);
        let server_task = {
            let run = run.clone();
            tokio::spawn(async move {
                let failure = match server.serve(build_router(state), run.clone(), grace).await {
                    Err(e) => Some(e),
                    Ok(()) if !run.is_cancelled() => {
                        Some(FleetError::transport("metadata service stopped unexpectedly"))
                    }
                    Ok(()) => None,
                };
                if let Some(e) = failure {
                    let _ = server_errors_tx.send(e).await;
                }
            })
        };

        let mut procs = WorkerProcesses::new(self.command.clone())?;
        let launch = WorkerLaunch {
            metadata_url: metadata_url.clone(),
            listen_address: self.config.listen_address.clone(),
            cert_dir: store.dir.clone(),
            run_id: self.run_id.clone(),
        };

        let result: Result<()> = async {
            for spec in topology.iter() {
                procs.spawn(spec, &launch)?;
            }
            info!(count = topology.len(), metadata_url = %metadata_url, "Spawned backends");

            let timeout = self.config.registration_timeout();
            let barrier_open = barrier.await_all(timeout, &run);
            tokio::pin!(barrier_open);
            let outcome = loop {
                tokio::select! {
                    res = &mut barrier_open => break res?,
                    Some(worker) = accepted.recv() => mark_ready(&mut procs, &barrier, &worker),
                    Some(exit) = procs.next_exit() => return Err(child_terminated(exit, false)),
                    Some(err) = server_errors.recv() => return Err(err),
                }
            };
            if outcome == BarrierOutcome::Canceled {
                info!(registered = barrier.registered(), "Run cancelled during registration");
                return Ok(());
            }
            while let Ok(worker) = accepted.try_recv() {
                mark_ready(&mut procs, &barrier, &worker);
            }

            let backends = barrier.snapshot_by_kind(&topology);
            info!(backends = topology.len(), "Fleet ready");

            if let Some(tx) = self.ready.take() {
                let pids = topology
                    .iter()
                    .filter_map(|spec| procs.pid(&spec.name).map(|pid| (spec.name.clone(), pid)))
                    .collect();
                let _ = tx.send(FleetReady {
                    metadata_addr,
                    metadata_url: metadata_url.clone(),
                    cert_dir: store.dir.clone(),
                    backends,
                    pids,
                });
            }

            tokio::select! {
                _ = run.cancelled() => {
                    info!("Shutdown requested");
                    Ok(())
                }
                Some(exit) = procs.next_exit() => Err(child_terminated(exit, true)),
                Some(err) = server_errors.recv() => Err(err),
            }
        }
        .await;

        if let Err(e) = &result {
            error!(error = %e, "Fleet run failed; shutting down");
        }

        run.cancel();
        let stragglers = procs.shutdown(grace).await;
        if stragglers > 0 {
            warn!(stragglers, "Some backends did not stop within the grace period");
        }
        if let Err(e) = server_task.await {
            warn!(error = %e, "Metadata service task failed");
        }

        result
    }
}

fn mark_ready(procs: &mut WorkerProcesses, barrier: &RegistrationBarrier, worker: &WorkerIdentity) {
    procs.mark_registered(worker);
    if let Some(bound) = barrier.get(worker) {
        info!(worker = %bound.name, url = %bound.url(), "Backend ready");
    }
}

fn child_terminated(exit: WorkerExit, after_ready: bool) -> FleetError {
    match exit.status {
        Ok(status) => {
            error!(
                worker = %exit.worker,
                traffic_type = %exit.traffic_type,
                %status,
                after_ready,
                "Backend died unexpectedly"
            );
            FleetError::ChildTerminated { worker: exit.worker.into_string(), status }
        }
        Err(e) => FleetError::internal(format!("lost track of backend {}: {}", exit.worker, e)),
    }
}

/// URL workers use to reach the metadata service bound at `addr`
pub fn metadata_url(addr: SocketAddr) -> String {
    let ip = match addr.ip() {
        IpAddr::V4(v4) if v4.is_unspecified() => IpAddr::V4(Ipv4Addr::LOCALHOST),
        IpAddr::V6(v6) if v6.is_unspecified() => IpAddr::V6(Ipv6Addr::LOCALHOST),
        ip => ip,
    };
    format!("http://{}", SocketAddr::new(ip, addr.port()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::MetadataServerConfig;
    use std::time::{Duration, Instant};

    fn config(dir: &std::path::Path, timeout_seconds: u64) -> FleetConfig {
        FleetConfig {
            host_prefix: "sup".into(),
            backends_per_kind: 1,
            listen_address: "127.0.0.1".into(),
            output_dir: dir.to_path_buf(),
            registration_timeout_seconds: timeout_seconds,
            metadata: MetadataServerConfig { bind_address: "127.0.0.1".into(), port: 0, shutdown_grace_seconds: 2 },
        }
    }

    fn host() -> HostIdentity {
        HostIdentity { hostname: Some("sup.example".into()), ip: Some(IpAddr::V4(Ipv4Addr::LOCALHOST)) }
    }

    fn shell(script: &str) -> WorkerCommand {
        WorkerCommand::new("/bin/sh", ["-c", script])
    }

    #[test]
    fn metadata_url_uses_loopback_for_unspecified() {
        assert_eq!(metadata_url("0.0.0.0:2000".parse().unwrap()), "http://127.0.0.1:2000");
        assert_eq!(metadata_url("[::]:2000".parse().unwrap()), "http://[::1]:2000");
        assert_eq!(metadata_url("10.0.0.2:2000".parse().unwrap()), "http://10.0.0.2:2000");
    }

    #[tokio::test]
    async fn early_child_death_beats_registration_timeout() {
        let tmp = tempfile::tempdir().unwrap();
        let supervisor = FleetSupervisor::new(config(tmp.path(), 60), shell("exit 3")).with_host(host());

        let started = Instant::now();
        let err = supervisor.run(CancellationToken::new()).await.unwrap_err();
        match err {
            FleetError::ChildTerminated { worker, status } => {
                assert!(worker.starts_with("sup-"));
                assert_eq!(status.code(), Some(3));
            }
            other => panic!("unexpected error: {other}"),
        }
        assert!(started.elapsed() < Duration::from_secs(30));
    }

    #[tokio::test]
    async fn silent_workers_time_out_and_are_released() {
        let tmp = tempfile::tempdir().unwrap();
        let supervisor =
            FleetSupervisor::new(config(tmp.path(), 1), shell("cat <&3 >/dev/null")).with_host(host());

        let err = supervisor.run(CancellationToken::new()).await.unwrap_err();
        match err {
            FleetError::RegistrationTimeout { registered, expected, .. } => {
                assert_eq!(registered, 0);
                assert_eq!(expected, 4);
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test]
    async fn cancellation_during_registration_is_clean() {
        let tmp = tempfile::tempdir().unwrap();
        let supervisor =
            FleetSupervisor::new(config(tmp.path(), 60), shell("cat <&3 >/dev/null")).with_host(host());

        let cancel = CancellationToken::new();
        let run = tokio::spawn(supervisor.run(cancel.clone()));
        tokio::time::sleep(Duration::from_millis(300)).await;
        cancel.cancel();

        tokio::time::timeout(Duration::from_secs(20), run).await.unwrap().unwrap().unwrap();
    }

    #[tokio::test]
    async fn missing_worker_program_aborts_with_spawn_error() {
        let tmp = tempfile::tempdir().unwrap();
        let command = WorkerCommand::new("/nonexistent/hydra", ["serve-backend"]);
        let err = FleetSupervisor::new(config(tmp.path(), 5), command)
            .with_host(host())
            .run(CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, FleetError::Spawn { .. }));
    }

    #[tokio::test]
    async fn certificates_are_written_before_spawning() {
        let tmp = tempfile::tempdir().unwrap();
        let supervisor = FleetSupervisor::new(config(tmp.path(), 60), shell("exit 0")).with_host(host());
        let _ = supervisor.run(CancellationToken::new()).await;

        let store = CertStore::at(tmp.path().join("certs"));
        assert!(store.domain_file.exists());
        assert!(store.root_ca_key_file.exists());
        assert!(store.load_server_config().is_ok());
    }

    #[tokio::test]
    async fn invalid_config_is_rejected_before_any_work() {
        let tmp = tempfile::tempdir().unwrap();
        let mut cfg = config(tmp.path(), 5);
        cfg.backends_per_kind = 0;
        let err = FleetSupervisor::new(cfg, shell("exit 0")).run(CancellationToken::new()).await.unwrap_err();
        assert!(matches!(err, FleetError::Config(_)));
        assert!(!tmp.path().join("certs").exists());
    }
}

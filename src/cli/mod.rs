//! # Command Line Interface
//!
//! `serve-backends` runs a fleet; the hidden `serve-backend` is what the
//! supervisor re-executes for each worker. The remaining commands are small
//! read-side helpers around a running fleet.

use std::net::IpAddr;
use std::path::PathBuf;
use std::process::ExitCode;
use std::time::Duration;

use anyhow::Context;
use clap::{Args, Parser, Subcommand};
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::api::handlers::render_lines;
use crate::certs::CertStore;
use crate::config::{FleetConfig, ObservabilityConfig};
use crate::domain::{FleetTopology, TrafficKind, WorkerIdentity};
use crate::fleet::process::{cancel_on_signal, RUN_ID_ENV};
use crate::fleet::{FleetSupervisor, HostIdentity, WorkerCommand};
use crate::observability::{init_logging, new_run_id};
use crate::worker::{serve_backend, BackendArgs, MetadataClient, RetryPolicy};

const DEFAULT_METADATA_URL: &str = "http://127.0.0.1:2000";

#[derive(Parser)]
#[command(name = "hydra")]
#[command(about = "Synthetic HTTP/HTTPS backend fleet launcher")]
#[command(version = env!("CARGO_PKG_VERSION"))]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    /// Log level or tracing filter directive
    #[arg(long, global = true, env = "HYDRA_LOG_LEVEL")]
    pub log_level: Option<String>,

    /// Emit logs as JSON
    #[arg(long, global = true, env = "HYDRA_JSON_LOGGING")]
    pub json_logs: bool,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Spawn the backend fleet and serve the metadata service until interrupted
    ServeBackends(FleetArgs),

    /// Run a single backend (started by serve-backends)
    #[command(hide = true)]
    ServeBackend(BackendCommand),

    /// Print /etc/hosts lines for every backend name
    PrintHosts {
        #[arg(long)]
        host_prefix: Option<String>,

        /// Backends per traffic type
        #[arg(short = 'n', long)]
        backends_per_kind: Option<usize>,

        /// Address to map every name to (defaults to this host's address)
        #[arg(long)]
        ip: Option<IpAddr>,
    },

    /// List the registered backends of a running fleet
    Backends {
        #[arg(long, env = "HYDRA_METADATA_URL", default_value = DEFAULT_METADATA_URL)]
        metadata_url: String,

        /// Only list one traffic type
        #[arg(long)]
        traffic_type: Option<TrafficKind>,

        /// Print JSON instead of text lines
        #[arg(long)]
        json: bool,
    },

    /// Fetch the certificates of a running fleet
    Certs {
        #[arg(long, env = "HYDRA_METADATA_URL", default_value = DEFAULT_METADATA_URL)]
        metadata_url: String,

        /// Write a certificate store here instead of printing JSON
        #[arg(long)]
        output_dir: Option<PathBuf>,
    },
}

/// Overrides applied on top of `HYDRA_*` environment settings
#[derive(Args, Debug, Default)]
pub struct FleetArgs {
    /// Backends per traffic type
    #[arg(short = 'n', long)]
    pub backends_per_kind: Option<usize>,

    #[arg(long)]
    pub host_prefix: Option<String>,

    /// Address backends listen on
    #[arg(long)]
    pub listen_address: Option<String>,

    #[arg(long)]
    pub output_dir: Option<PathBuf>,

    /// Seconds to wait for every backend to register
    #[arg(long)]
    pub registration_timeout: Option<u64>,

    #[arg(long)]
    pub metadata_bind_address: Option<String>,

    #[arg(long)]
    pub metadata_port: Option<u16>,

    /// Seconds in-flight metadata requests get at shutdown
    #[arg(long)]
    pub shutdown_grace: Option<u64>,
}

impl FleetArgs {
    pub fn apply(self, mut config: FleetConfig) -> FleetConfig {
        if let Some(n) = self.backends_per_kind {
            config.backends_per_kind = n;
        }
        if let Some(prefix) = self.host_prefix {
            config.host_prefix = prefix;
        }
        if let Some(address) = self.listen_address {
            config.listen_address = address;
        }
        if let Some(dir) = self.output_dir {
            config.output_dir = dir;
        }
        if let Some(seconds) = self.registration_timeout {
            config.registration_timeout_seconds = seconds;
        }
        if let Some(address) = self.metadata_bind_address {
            config.metadata.bind_address = address;
        }
        if let Some(port) = self.metadata_port {
            config.metadata.port = port;
        }
        if let Some(seconds) = self.shutdown_grace {
            config.metadata.shutdown_grace_seconds = seconds;
        }
        config
    }
}

#[derive(Args, Debug)]
pub struct BackendCommand {
    #[arg(long)]
    pub name: String,

    #[arg(long)]
    pub traffic_type: TrafficKind,

    #[arg(long)]
    pub listen_address: String,

    #[arg(long)]
    pub metadata_url: String,

    #[arg(long)]
    pub cert_dir: PathBuf,
}

/// Run CLI commands
pub async fn run_cli() -> anyhow::Result<ExitCode> {
    let cli = Cli::parse();

    let mut observability = ObservabilityConfig::from_env();
    if let Some(level) = cli.log_level {
        observability.log_level = level;
    }
    observability.json_logging |= cli.json_logs;
    init_logging(&observability);

    match cli.command {
        Commands::ServeBackends(args) => {
            let config = args.apply(FleetConfig::from_env()?);
            config.validate()?;

            let cancel = CancellationToken::new();
            tokio::spawn(cancel_on_signal(cancel.clone()));

            let supervisor = FleetSupervisor::new(config, WorkerCommand::current_exe()?);
            info!(run_id = supervisor.run_id(), "Starting fleet");
            supervisor.run(cancel).await?;
        }
        Commands::ServeBackend(cmd) => {
            let run_id = std::env::var(RUN_ID_ENV).unwrap_or_else(|_| new_run_id());
            let args = BackendArgs {
                name: WorkerIdentity::from_string(cmd.name),
                traffic_type: cmd.traffic_type,
                listen_address: cmd.listen_address,
                metadata_url: cmd.metadata_url,
                cert_dir: cmd.cert_dir,
                retry: RetryPolicy::default(),
            };
            let outcome = serve_backend(args, &run_id).await?;
            return Ok(ExitCode::from(outcome.exit_code() as u8));
        }
        Commands::PrintHosts { host_prefix, backends_per_kind, ip } => {
            let config = FleetArgs { host_prefix, backends_per_kind, ..Default::default() }
                .apply(FleetConfig::from_env()?);
            config.validate()?;
            let ip = ip.unwrap_or_else(|| HostIdentity::discover().advertised_ip());
            let topology = FleetTopology::new(&config.host_prefix, config.backends_per_kind);
            print!("{}", hosts_lines(&topology, ip));
        }
        Commands::Backends { metadata_url, traffic_type, json } => {
            let client = MetadataClient::new(&metadata_url, Duration::from_secs(10))?;
            let mut backends = client.fetch_backends().await?;
            if let Some(kind) = traffic_type {
                backends.retain(|k, _| *k == kind);
            }
            if json {
                println!("{}", serde_json::to_string_pretty(&backends)?);
            } else {
                print!("{}", render_lines(backends.values().flatten()));
            }
        }
        Commands::Certs { metadata_url, output_dir } => {
            let client = MetadataClient::new(&metadata_url, Duration::from_secs(10))?;
            let bundle = client.fetch_certificates().await?;
            match output_dir {
                Some(dir) => {
                    let store = CertStore::write(&dir, &bundle)
                        .with_context(|| format!("writing certificates to {}", dir.display()))?;
                    println!("{}", store.dir.display());
                }
                None => println!("{}", serde_json::to_string_pretty(&bundle)?),
            }
        }
    }

    Ok(ExitCode::SUCCESS)
}

/// `/etc/hosts` lines mapping every worker name of `topology` to `ip`
pub fn hosts_lines(topology: &FleetTopology, ip: IpAddr) -> String {
    topology.iter().map(|spec| format!("{} {}\n", ip, spec.name)).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn cli_definition_is_consistent() {
        Cli::command().debug_assert();
    }

    #[test]
    fn serve_backend_parses_spawn_arguments() {
        let cli = Cli::try_parse_from([
            "hydra",
            "serve-backend",
            "--name",
            "p-reencrypt-0",
            "--traffic-type",
            "reencrypt",
            "--listen-address",
            "127.0.0.1",
            "--metadata-url",
            "http://127.0.0.1:2000",
            "--cert-dir",
            "/tmp/certs",
        ])
        .unwrap();
        match cli.command {
            Commands::ServeBackend(cmd) => {
                assert_eq!(cmd.traffic_type, TrafficKind::Reencrypt);
                assert_eq!(cmd.name, "p-reencrypt-0");
            }
            _ => panic!("expected serve-backend"),
        }
    }

    #[test]
    fn unknown_traffic_type_is_a_usage_error() {
        let result = Cli::try_parse_from([
            "hydra",
            "serve-backend",
            "--name",
            "x",
            "--traffic-type",
            "tcp",
            "--listen-address",
            "127.0.0.1",
            "--metadata-url",
            "http://127.0.0.1:2000",
            "--cert-dir",
            "/tmp",
        ]);
        assert!(result.is_err());
    }

    #[test]
    fn fleet_args_override_config() {
        let cli = Cli::try_parse_from(["hydra", "serve-backends", "-n", "3", "--metadata-port", "0"]).unwrap();
        let Commands::ServeBackends(args) = cli.command else { panic!("expected serve-backends") };
        let config = args.apply(FleetConfig::default());
        assert_eq!(config.backends_per_kind, 3);
        assert_eq!(config.metadata.port, 0);
        assert_eq!(config.host_prefix, "perf-test-hydra");
    }

    #[test]
    fn hosts_lines_cover_topology() {
        let topology = FleetTopology::new("perf-test-hydra", 2);
        let lines = hosts_lines(&topology, "10.0.0.5".parse().unwrap());
        assert_eq!(lines.lines().count(), 8);
        assert!(lines.starts_with("10.0.0.5 perf-test-hydra-edge-0\n"));
        assert!(lines.ends_with("10.0.0.5 perf-test-hydra-reencrypt-1\n"));
    }
}

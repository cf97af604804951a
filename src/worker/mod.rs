//! # Worker Process
//!
//! Runtime of one synthetic backend: bind an ephemeral port, register the
//! bound address with the supervisor's metadata service, then serve a static
//! payload (plain or TLS, by traffic kind) until told to stop or until the
//! supervisor disappears.

pub mod client;

use std::net::{IpAddr, SocketAddr};
use std::path::PathBuf;
use std::time::Duration;

use axum::{body::Bytes, response::Html, routing::get, Router};
use tokio::net::TcpListener;
use tokio_rustls::TlsAcceptor;
use tokio_util::sync::CancellationToken;
use tower_http::trace::TraceLayer;
use tracing::{info, Instrument};

use crate::api::{serve_http, serve_tls};
use crate::certs::CertStore;
use crate::domain::{BoundWorker, TrafficKind, WorkerIdentity, WorkerSpec};
use crate::errors::{FleetError, Result};
use crate::fleet::host::HostIdentity;
use crate::fleet::process::{cancel_on_signal, inherited_parent_pipe, watch_parent};

pub use client::{MetadataClient, RegistrationClient, RetryPolicy};

/// Size of the standard payload in bytes
pub const PAYLOAD_SIZE: usize = 1024;

/// Exit status of a worker whose supervisor went away
pub const PARENT_GONE_EXIT_CODE: i32 = 2;

/// Everything a worker is told at spawn time
#[derive(Debug, Clone)]
pub struct BackendArgs {
    pub name: WorkerIdentity,
    pub traffic_type: TrafficKind,
    pub listen_address: String,
    pub metadata_url: String,
    pub cert_dir: PathBuf,
    pub retry: RetryPolicy,
}

/// Why a worker stopped serving
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerOutcome {
    /// Stopped by a signal or an in-process cancellation
    Stopped,
    /// The supervisor's end of the parent pipe closed
    ParentGone,
}

impl WorkerOutcome {
    pub fn exit_code(self) -> i32 {
        match self {
            WorkerOutcome::Stopped => 0,
            WorkerOutcome::ParentGone => PARENT_GONE_EXIT_CODE,
        }
    }
}

/// The 1024-byte HTML document every worker serves
pub fn payload() -> Bytes {
    const HEAD: &str = "<!DOCTYPE html>\n<html><head><title>hydra</title></head><body>\n";
    const TAIL: &str = "\n</body></html>\n";

    let mut page = String::with_capacity(PAYLOAD_SIZE);
    page.push_str(HEAD);
    let filler = PAYLOAD_SIZE - HEAD.len() - TAIL.len();
    page.push_str(&"x".repeat(filler));
    page.push_str(TAIL);
    Bytes::from(page)
}

/// Router serving the payload on `/` and `/1024.html`
pub fn payload_router() -> Router {
    let body = payload();
    let page = move || {
        let body = body.clone();
        async move { Html(body) }
    };
    Router::new()
        .route("/", get(page.clone()))
        .route("/1024.html", get(page))
        .layer(TraceLayer::new_for_http())
}

/// Address to report for a listener bound to `listen_address`
pub fn reported_address(listen_address: &str, host: impl FnOnce() -> HostIdentity) -> String {
    match listen_address.parse::<IpAddr>() {
        Ok(ip) if ip.is_unspecified() => host().advertised_ip().to_string(),
        _ => listen_address.to_string(),
    }
}

/// Run a worker to completion.
///
/// Watches the inherited parent pipe (if any) and SIGTERM/SIGINT, then
/// delegates to [`run_backend`].
pub async fn serve_backend(args: BackendArgs, run_id: &str) -> Result<WorkerOutcome> {
    let span = crate::worker_span!(run_id, args.name, args.traffic_type);

    async move {
        let token = CancellationToken::new();

        let parent = match inherited_parent_pipe()? {
            Some(pipe) => Some(watch_parent(pipe, token.clone())?),
            None => None,
        };
        tokio::spawn(cancel_on_signal(token.clone()));

        let served = run_backend(&args, token.clone()).await;
        token.cancel();

        let parent_gone = match parent {
            Some(handle) => handle.await.unwrap_or(false),
            None => false,
        };
        served?;

        let outcome = if parent_gone { WorkerOutcome::ParentGone } else { WorkerOutcome::Stopped };
        info!(outcome = ?outcome, "Backend stopped");
        Ok(outcome)
    }
    .instrument(span)
    .await
}

/// Bind, register and serve until `token` is cancelled
pub async fn run_backend(args: &BackendArgs, token: CancellationToken) -> Result<()> {
    let acceptor = if args.traffic_type.terminates_tls_at_backend() {
        let config = CertStore::at(&args.cert_dir).load_server_config()?;
        Some(TlsAcceptor::from(config))
    } else {
        None
    };

    let bind_address = bind_address(&args.listen_address);
    let listener = TcpListener::bind(&bind_address).await.map_err(|e| FleetError::listen(&bind_address, e))?;
    let port = listener.local_addr().map_err(|e| FleetError::listen(&bind_address, e))?.port();
    tracing::Span::current().record("port", port);

    let bound = BoundWorker::new(
        WorkerSpec::new(args.name.clone(), args.traffic_type),
        reported_address(&args.listen_address, HostIdentity::discover),
        port,
    );

    let client = RegistrationClient::new(&args.metadata_url, args.retry)?;
    tokio::select! {
        res = client.register(&bound) => res?,
        _ = token.cancelled() => {
            info!("Cancelled before registration completed");
            return Ok(());
        }
    }
    info!(url = %bound.url(), "Serving");

    let grace = Duration::from_secs(1);
    match acceptor {
        Some(acceptor) => serve_tls(listener, acceptor, payload_router(), token, grace).await,
        None => serve_http(listener, payload_router(), token, grace).await,
    }
}

fn bind_address(listen_address: &str) -> String {
    match listen_address.parse::<IpAddr>() {
        Ok(ip) => SocketAddr::new(ip, 0).to_string(),
        Err(_) => format!("{}:0", listen_address),
    }
}

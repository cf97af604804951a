use std::future::IntoFuture;
use std::net::SocketAddr;

use axum::{serve::Listener, Router};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::time::Duration;
use tokio_rustls::{server::TlsStream, TlsAcceptor};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::config::MetadataServerConfig;
use crate::errors::{FleetError, Result};

/// A bound, not yet serving, metadata service listener
pub struct MetadataServer {
    listener: TcpListener,
    local_addr: SocketAddr,
}

impl MetadataServer {
    /// Bind the configured address. Failure is a [`FleetError::Listen`].
    pub async fn bind(config: &MetadataServerConfig) -> Result<Self> {
        let address = config.socket_address();
        let listener = TcpListener::bind(&address).await.map_err(|e| FleetError::listen(&address, e))?;
        let local_addr = listener.local_addr().map_err(|e| FleetError::listen(&address, e))?;
        Ok(Self { listener, local_addr })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Serve `router` until `shutdown` fires, then drain in-flight requests for
    /// at most `grace`.
    pub async fn serve(self, router: Router, shutdown: CancellationToken, grace: Duration) -> Result<()> {
        info!(address = %self.local_addr, "Starting metadata service");
        let server = axum::serve(self.listener, router)
            .with_graceful_shutdown(shutdown.clone().cancelled_owned())
            .into_future();
        drain_within(server, shutdown, grace, "metadata service").await
    }
}

/// Serve plain HTTP on an already bound listener until `shutdown` fires
pub async fn serve_http(listener: TcpListener, router: Router, shutdown: CancellationToken, grace: Duration) -> Result<()> {
    let server = axum::serve(listener, router).with_graceful_shutdown(shutdown.clone().cancelled_owned()).into_future();
    drain_within(server, shutdown, grace, "HTTP server").await
}

/// Serve HTTPS on an already bound listener until `shutdown` fires
pub async fn serve_tls(
    listener: TcpListener,
    acceptor: TlsAcceptor,
    router: Router,
    shutdown: CancellationToken,
    grace: Duration,
) -> Result<()> {
    let tls_listener = TlsListener::new(listener, acceptor)
        .map_err(|e| FleetError::transport(format!("HTTPS listener unusable: {}", e)))?;
    let server =
        axum::serve(tls_listener, router).with_graceful_shutdown(shutdown.clone().cancelled_owned()).into_future();
    drain_within(server, shutdown, grace, "HTTPS server").await
}

async fn drain_within<F>(server: F, shutdown: CancellationToken, grace: Duration, what: &'static str) -> Result<()>
where
    F: std::future::Future<Output = std::io::Result<()>>,
{
    let deadline = async {
        shutdown.cancelled().await;
        tokio::time::sleep(grace).await;
    };

    tokio::select! {
        res = server => {
            res.map_err(|e| FleetError::transport(format!("{} error: {}", what, e)))?;
            info!(server = what, "Shutdown completed");
            Ok(())
        }
        _ = deadline => {
            warn!(server = what, grace_seconds = grace.as_secs(), "Grace period elapsed; dropping open connections");
            Ok(())
        }
    }
}

/// Time a peer gets to complete the TLS handshake before it is dropped
pub const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

/// TLS listener for `axum::serve`.
///
/// A background task accepts TCP connections and runs each handshake in its
/// own task, bounded by the handshake timeout. `accept` only hands out
/// completed TLS streams, so a slow or silent peer never delays the others.
pub struct TlsListener {
    local_addr: SocketAddr,
    ready: mpsc::Receiver<(TlsStream<TcpStream>, SocketAddr)>,
}

impl TlsListener {
    pub fn new(listener: TcpListener, acceptor: TlsAcceptor) -> std::io::Result<Self> {
        Self::with_handshake_timeout(listener, acceptor, HANDSHAKE_TIMEOUT)
    }

    pub fn with_handshake_timeout(
        listener: TcpListener,
        acceptor: TlsAcceptor,
        handshake_timeout: Duration,
    ) -> std::io::Result<Self> {
        let local_addr = listener.local_addr()?;
        let (tx, ready) = mpsc::channel(64);
        tokio::spawn(accept_loop(listener, acceptor, handshake_timeout, tx));
        Ok(Self { local_addr, ready })
    }
}

async fn accept_loop(
    listener: TcpListener,
    acceptor: TlsAcceptor,
    handshake_timeout: Duration,
    tx: mpsc::Sender<(TlsStream<TcpStream>, SocketAddr)>,
) {
    loop {
        let accepted = tokio::select! {
            // The listener was dropped (server shut down).
            _ = tx.closed() => return,
            accepted = listener.accept() => accepted,
        };

        let (stream, addr) = match accepted {
            Ok(conn) => conn,
            Err(err) if is_connection_error(&err) => continue,
            Err(err) => {
                error!("HTTPS accept error: {err}");
                tokio::time::sleep(Duration::from_secs(1)).await;
                continue;
            }
        };

        let acceptor = acceptor.clone();
        let tx = tx.clone();
        tokio::spawn(async move {
            match tokio::time::timeout(handshake_timeout, acceptor.accept(stream)).await {
                Ok(Ok(tls_stream)) => {
                    let _ = tx.send((tls_stream, addr)).await;
                }
                Ok(Err(err)) => warn!(error = %err, %addr, "TLS handshake failed"),
                Err(_) => warn!(%addr, timeout_ms = handshake_timeout.as_millis() as u64, "TLS handshake timed out"),
            }
        });
    }
}

impl Listener for TlsListener {
    type Io = TlsStream<TcpStream>;
    type Addr = SocketAddr;

    async fn accept(&mut self) -> (Self::Io, Self::Addr) {
        match self.ready.recv().await {
            Some(conn) => conn,
            // The accept loop only exits once this receiver is gone.
            None => std::future::pending().await,
        }
    }

    fn local_addr(&self) -> std::io::Result<Self::Addr> {
        Ok(self.local_addr)
    }
}

fn is_connection_error(error: &std::io::Error) -> bool {
    matches!(
        error.kind(),
        std::io::ErrorKind::ConnectionRefused
            | std::io::ErrorKind::ConnectionAborted
            | std::io::ErrorKind::ConnectionReset
    )
}

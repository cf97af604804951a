//! HTTP clients for the metadata service
//!
//! [`RegistrationClient`] is what a worker uses to announce itself;
//! [`MetadataClient`] is the read side used by the CLI and by tests.

use std::time::Duration;

use reqwest::{Client, StatusCode};
use tracing::{debug, warn};

use crate::api::handlers::BackendsByKind;
use crate::certs::CertificateBundle;
use crate::domain::BoundWorker;
use crate::errors::{FleetError, Result};

/// How a worker retries its registration call
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub attempts: u32,
    pub backoff: Duration,
    pub request_timeout: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self { attempts: 17, backoff: Duration::from_millis(250), request_timeout: Duration::from_secs(10) }
    }
}

fn base_url(url: &str) -> String {
    url.trim_end_matches('/').to_string()
}

fn build_client(timeout: Duration) -> Result<Client> {
    Client::builder()
        .timeout(timeout)
        .build()
        .map_err(|e| FleetError::transport(format!("Failed to build HTTP client: {}", e)))
}

/// Posts a worker's bound address to `/register`
#[derive(Debug, Clone)]
pub struct RegistrationClient {
    client: Client,
    base_url: String,
    policy: RetryPolicy,
}

impl RegistrationClient {
    pub fn new(metadata_url: &str, policy: RetryPolicy) -> Result<Self> {
        Ok(Self { client: build_client(policy.request_timeout)?, base_url: base_url(metadata_url), policy })
    }

    /// Register `worker`, retrying while the service is unreachable.
    ///
    /// A response other than 200 is returned as an error immediately: the
    /// service has seen the request and a retry would be refused the same way.
    pub async fn register(&self, worker: &BoundWorker) -> Result<()> {
        let url = format!("{}/register", self.base_url);
        let mut last_error = String::new();

        for attempt in 1..=self.policy.attempts {
            match self.client.post(&url).json(worker).send().await {
                Ok(response) if response.status() == StatusCode::OK => {
                    debug!(worker = %worker.name, attempt, "Registered with metadata service");
                    return Ok(());
                }
                Ok(response) => {
                    let status = response.status();
                    let body = response.text().await.unwrap_or_default();
                    return Err(FleetError::transport(format!(
                        "registration of {} refused with {}: {}",
                        worker.name,
                        status,
                        body.trim()
                    )));
                }
                Err(e) if e.is_connect() || e.is_timeout() => {
                    last_error = e.to_string();
                    debug!(worker = %worker.name, attempt, error = %e, "Metadata service unreachable; retrying");
                }
                Err(e) => {
                    return Err(FleetError::transport(format!("registration of {} failed: {}", worker.name, e)));
                }
            }

            if attempt < self.policy.attempts {
                tokio::time::sleep(self.policy.backoff).await;
            }
        }

        warn!(worker = %worker.name, attempts = self.policy.attempts, "Giving up on registration");
        Err(FleetError::transport(format!(
            "could not reach metadata service at {} after {} attempts: {}",
            url, self.policy.attempts, last_error
        )))
    }
}

/// Read-only client for the topology and certificate endpoints
#[derive(Debug, Clone)]
pub struct MetadataClient {
    client: Client,
    base_url: String,
}

impl MetadataClient {
    pub fn new(metadata_url: &str, timeout: Duration) -> Result<Self> {
        Ok(Self { client: build_client(timeout)?, base_url: base_url(metadata_url) })
    }

    /// `GET /backends?json=1`
    pub async fn fetch_backends(&self) -> Result<BackendsByKind> {
        self.get_json("/backends?json=1").await
    }

    /// `GET /certs`
    pub async fn fetch_certificates(&self) -> Result<CertificateBundle> {
        self.get_json("/certs").await
    }

    async fn get_json<T: serde::de::DeserializeOwned>(&self, path: &str) -> Result<T> {
        let url = format!("{}{}", self.base_url, path);
        debug!("GET {}", url);

        let response = self
            .client
            .get(&url)
            .send()
            .await
            .map_err(|e| FleetError::transport(format!("GET {} failed: {}", url, e)))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(FleetError::transport(format!("GET {} returned {}: {}", url, status, body.trim())));
        }

        response
            .json::<T>()
            .await
            .map_err(|e| FleetError::transport(format!("GET {} returned an unreadable body: {}", url, e)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::{build_router, MetadataState};
    use crate::domain::{FleetTopology, TrafficKind, WorkerIdentity, WorkerSpec};
    use crate::fleet::RegistrationBarrier;
    use std::sync::Arc;
    use tokio::net::TcpListener;

    async fn spawn_service(topology: FleetTopology) -> (String, Arc<RegistrationBarrier>) {
        let topology = Arc::new(topology);
        let barrier = Arc::new(RegistrationBarrier::for_topology(&topology));
        let router = build_router(MetadataState::new(barrier.clone(), topology));
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move { axum::serve(listener, router).await });
        (format!("http://{}", addr), barrier)
    }

    fn worker(kind: TrafficKind, port: u16) -> BoundWorker {
        BoundWorker::new(WorkerSpec::new(WorkerIdentity::new("p", kind, 0), kind), "127.0.0.1", port)
    }

    fn quick() -> RetryPolicy {
        RetryPolicy { attempts: 3, backoff: Duration::from_millis(10), request_timeout: Duration::from_secs(2) }
    }

    #[test]
    fn default_policy_matches_long_standing_values() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.attempts, 17);
        assert_eq!(policy.backoff, Duration::from_millis(250));
        assert_eq!(policy.request_timeout, Duration::from_secs(10));
    }

    #[tokio::test]
    async fn register_then_fetch_round_trips() {
        let (url, barrier) = spawn_service(FleetTopology::new("p", 1)).await;
        let client = RegistrationClient::new(&url, quick()).unwrap();

        let sent = worker(TrafficKind::Reencrypt, 4555);
        client.register(&sent).await.unwrap();
        assert_eq!(barrier.registered(), 1);

        let fetched = MetadataClient::new(&url, Duration::from_secs(2)).unwrap().fetch_backends().await.unwrap();
        assert_eq!(fetched[&TrafficKind::Reencrypt], vec![sent]);
    }

    #[tokio::test]
    async fn rejection_is_not_retried() {
        let (url, _barrier) = spawn_service(FleetTopology::new("p", 1)).await;
        let client = RegistrationClient::new(&url, quick()).unwrap();

        client.register(&worker(TrafficKind::Http, 4000)).await.unwrap();
        let err = client.register(&worker(TrafficKind::Http, 4001)).await.unwrap_err();
        assert!(err.to_string().contains("duplicate registration"));
    }

    #[tokio::test]
    async fn unreachable_service_exhausts_attempts() {
        let port = reserve_port::ReservedPort::random().unwrap();
        let url = format!("http://127.0.0.1:{}", port.port());
        drop(port);

        let client = RegistrationClient::new(&url, quick()).unwrap();
        let err = client.register(&worker(TrafficKind::Http, 4000)).await.unwrap_err();
        assert!(err.to_string().contains("after 3 attempts"));
    }

    #[tokio::test]
    async fn certificates_are_404_before_issuance() {
        let (url, _barrier) = spawn_service(FleetTopology::new("p", 1)).await;
        let err = MetadataClient::new(&url, Duration::from_secs(2)).unwrap().fetch_certificates().await.unwrap_err();
        assert!(err.to_string().contains("404"));
    }
}

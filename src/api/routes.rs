use std::sync::Arc;

use axum::{
    middleware,
    routing::{get, post},
    Router,
};

use crate::certs::CertificateBundle;
use crate::domain::FleetTopology;
use crate::fleet::RegistrationBarrier;
use crate::observability::trace_http_requests;

use super::handlers::{
    certs_handler, list_backends_handler, list_backends_of_kind_handler, register_handler,
};

/// Shared, read-only handles the metadata service answers from
#[derive(Clone)]
pub struct MetadataState {
    pub barrier: Arc<RegistrationBarrier>,
    pub topology: Arc<FleetTopology>,
    pub certificates: Option<Arc<CertificateBundle>>,
}

impl MetadataState {
    pub fn new(barrier: Arc<RegistrationBarrier>, topology: Arc<FleetTopology>) -> Self {
        Self { barrier, topology, certificates: None }
    }

    pub fn with_certificates(mut self, bundle: Arc<CertificateBundle>) -> Self {
        self.certificates = Some(bundle);
        self
    }
}

/// Build the metadata service router.
///
/// `/certs` is only routed when the state carries a bundle, so a request made
/// before issuance is a plain 404 rather than a partial answer.
pub fn build_router(state: MetadataState) -> Router {
    let mut router = Router::new()
        .route("/register", post(register_handler))
        .route("/backends", get(list_backends_handler))
        .route("/backends/{kind}", get(list_backends_of_kind_handler));

    if state.certificates.is_some() {
        router = router.route("/certs", get(certs_handler));
    }

    router.layer(middleware::from_fn(trace_http_requests)).with_state(state)
}

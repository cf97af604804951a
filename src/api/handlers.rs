//! Metadata service handlers
//!
//! The registration path is the only writer; everything else reads snapshots
//! of the barrier, so listing never waits on an in-progress registration for
//! longer than a copy.

use std::collections::BTreeMap;
use std::fmt::Write;

use axum::{
    body::Bytes,
    extract::{Path, Query, State},
    http::{header, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use serde::Deserialize;
use tracing::{info, warn};

use super::error::ApiError;
use super::routes::MetadataState;
use crate::certs::CertificateBundle;
use crate::domain::{BoundWorker, TrafficKind};
use crate::errors::RegistrationError;

/// `?json` flag of the listing endpoints.
///
/// Presence selects JSON; `json=0` and `json=false` keep text.
#[derive(Debug, Default, Deserialize)]
pub struct FormatQuery {
    json: Option<String>,
}

impl FormatQuery {
    pub fn wants_json(&self) -> bool {
        match self.json.as_deref() {
            None => false,
            Some(v) => !matches!(v.trim().to_ascii_lowercase().as_str(), "0" | "false" | "no"),
        }
    }
}

/// `POST /register`
pub async fn register_handler(State(state): State<MetadataState>, body: Bytes) -> Result<StatusCode, ApiError> {
    let worker: BoundWorker = serde_json::from_slice(&body)
        .map_err(|e| ApiError::from(RegistrationError::malformed(e.to_string())))?;

    let name = worker.name.clone();
    let port = worker.port;
    match state.barrier.register(worker) {
        Ok(()) => {
            info!(
                worker = %name,
                port,
                registered = state.barrier.registered(),
                expected = state.barrier.expected(),
                "Accepted registration"
            );
            Ok(StatusCode::OK)
        }
        Err(err) => {
            warn!(worker = %name, error = %err, "Rejected registration");
            Err(err.into())
        }
    }
}

/// `GET /backends`
pub async fn list_backends_handler(
    State(state): State<MetadataState>,
    Query(format): Query<FormatQuery>,
) -> Result<Response, ApiError> {
    let grouped = state.barrier.snapshot_by_kind(&state.topology);
    if format.wants_json() {
        return Ok(Json(grouped).into_response());
    }
    Ok(text_response(render_lines(grouped.values().flatten())))
}

/// `GET /backends/{kind}`
pub async fn list_backends_of_kind_handler(
    State(state): State<MetadataState>,
    Path(kind): Path<String>,
    Query(format): Query<FormatQuery>,
) -> Result<Response, ApiError> {
    let kind: TrafficKind = kind.parse()?;
    let workers = state.barrier.snapshot_by_kind(&state.topology).remove(&kind).unwrap_or_default();

    if format.wants_json() {
        return Ok(Json(workers).into_response());
    }
    Ok(text_response(render_lines(workers.iter())))
}

/// `GET /certs`. Only routed once the bundle exists.
pub async fn certs_handler(State(state): State<MetadataState>) -> Result<Json<CertificateBundle>, ApiError> {
    state
        .certificates
        .as_deref()
        .cloned()
        .map(Json)
        .ok_or_else(|| ApiError::NotFound("certificates have not been issued".to_string()))
}

/// `name listen_address port`, one worker per line
pub fn render_lines<'a>(workers: impl Iterator<Item = &'a BoundWorker>) -> String {
    let mut out = String::new();
    for worker in workers {
        let _ = writeln!(out, "{} {} {}", worker.name, worker.listen_address, worker.port);
    }
    out
}

fn text_response(body: String) -> Response {
    ([(header::CONTENT_TYPE, "text/plain; charset=utf-8")], body).into_response()
}

/// JSON shape of `GET /backends?json=1`
pub type BackendsByKind = BTreeMap<TrafficKind, Vec<BoundWorker>>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn json_flag_presence() {
        let q = |v: Option<&str>| FormatQuery { json: v.map(str::to_string) };
        assert!(!q(None).wants_json());
        assert!(q(Some("")).wants_json());
        assert!(q(Some("1")).wants_json());
        assert!(q(Some("true")).wants_json());
        assert!(!q(Some("0")).wants_json());
        assert!(!q(Some("false")).wants_json());
    }
}

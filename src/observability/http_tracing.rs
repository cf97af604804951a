//! # HTTP Request Tracing Middleware
//!
//! Axum middleware that wraps each request of the metadata service in a
//! tracing span and logs its outcome.

use std::time::Instant;

use axum::{extract::Request, middleware::Next, response::Response};
use tracing::{debug, warn, Instrument};

/// Axum middleware recording method, path, status and latency of every request
pub async fn trace_http_requests(request: Request, next: Next) -> Response {
    let method = request.method().clone();
    let path = request.uri().path().to_string();
    let start = Instant::now();

    let span = tracing::debug_span!("http_request", method = %method, path = %path);
    let response = next.run(request).instrument(span).await;

    let status = response.status().as_u16();
    let elapsed_ms = start.elapsed().as_millis() as u64;

    if status >= 500 {
        warn!(%method, %path, status, elapsed_ms, "Request failed");
    } else if status >= 400 {
        debug!(%method, %path, status, elapsed_ms, "Request rejected");
    } else {
        debug!(%method, %path, status, elapsed_ms, "Request completed");
    }

    response
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::{body::Body, http::Request, http::StatusCode, routing::get, Router};
    use tower::ServiceExt;

    async fn test_handler() -> &'static str {
        "OK"
    }

    #[tokio::test]
    async fn test_trace_middleware_passes_response_through() {
        let app = Router::new()
            .route("/test", get(test_handler))
            .layer(axum::middleware::from_fn(trace_http_requests));

        let request = Request::builder().uri("/test").method("GET").body(Body::empty()).unwrap();
        let response = app.oneshot(request).await.unwrap();

        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn test_trace_middleware_keeps_not_found() {
        let app = Router::new()
            .route("/test", get(test_handler))
            .layer(axum::middleware::from_fn(trace_http_requests));

        let request = Request::builder().uri("/missing").body(Body::empty()).unwrap();
        let response = app.oneshot(request).await.unwrap();

        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }
}

//! # Structured Logging
//!
//! Subscriber initialisation and span macros built on the tracing ecosystem.
//!
//! Every process of a run (the supervisor and each worker) carries the same
//! `run_id` in its root span, so interleaved output from many processes can be
//! grouped by run.

use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use crate::config::ObservabilityConfig;

/// Create the root span of a supervisor run.
///
/// ```rust,ignore
/// let span = fleet_span!(run_id, backends_per_kind = 4);
/// ```
#[macro_export]
macro_rules! fleet_span {
    ($run_id:expr) => {
        tracing::info_span!("fleet", run_id = %$run_id)
    };
    ($run_id:expr, $($field:tt)*) => {
        tracing::info_span!("fleet", run_id = %$run_id, $($field)*)
    };
}

/// Create the root span of one worker process
#[macro_export]
macro_rules! worker_span {
    ($run_id:expr, $worker:expr, $traffic_type:expr) => {
        tracing::info_span!(
            "backend",
            run_id = %$run_id,
            worker = %$worker,
            traffic_type = %$traffic_type,
            port = tracing::field::Empty
        )
    };
}

/// Install the global subscriber.
///
/// `RUST_LOG` wins over the configured level. Calling this more than once is
/// harmless; later calls leave the first subscriber in place.
pub fn init_logging(config: &ObservabilityConfig) {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&config.log_level))
        .unwrap_or_else(|_| EnvFilter::new("info"));

    let registry = tracing_subscriber::registry().with(filter);

    // A subscriber installed earlier (tests, embedding callers) stays in place.
    let _ = if config.json_logging {
        registry.with(fmt::layer().json().with_current_span(true).with_target(false)).try_init()
    } else {
        registry.with(fmt::layer().with_target(false)).try_init()
    };
}

/// A fresh run identifier
pub fn new_run_id() -> String {
    uuid::Uuid::new_v4().to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_macros_compile() {
        let _span = fleet_span!("run-1");
        let _span = fleet_span!("run-1", backends_per_kind = 4);
        let _span = worker_span!("run-1", "p-http-0", "http");
    }

    #[test]
    fn test_init_logging_is_idempotent() {
        let config = ObservabilityConfig { log_level: "debug".into(), json_logging: true };
        init_logging(&config);
        init_logging(&ObservabilityConfig::default());
    }

    #[test]
    fn test_run_ids_differ() {
        assert_ne!(new_run_id(), new_run_id());
    }
}

//! Structured logging.
//!
//! Uses the tracing crate throughout; access-log entries are ordinary
//! events under the `access` target so deployments can route or drop them
//! with an `EnvFilter` directive.

use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Initialize the tracing subscriber. `json` switches the format for
/// machine-parsed production logs.
pub fn init(json: bool) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| "rmirror=info,access=info".into());
    if json {
        tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer().json())
            .init();
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer())
            .init();
    }
}

/// Emit one access-log event for a finished request.
pub fn access_log(
    method: &str,
    path: &str,
    status: u16,
    bytes: u64,
    duration_ms: u128,
    route: &str,
    upstream: Option<&str>,
) {
    match upstream {
        Some(upstream) => tracing::info!(
            target: "access",
            method = %method,
            path = %path,
            status = status,
            bytes = bytes,
            duration = duration_ms as u64,
            route = %route,
            upstream = %upstream,
            "request"
        ),
        None => tracing::info!(
            target: "access",
            method = %method,
            path = %path,
            status = status,
            bytes = bytes,
            duration = duration_ms as u64,
            route = %route,
            "request"
        ),
    }
}

//! Upstream liveness probes.
//!
//! Run before serving and again on each reload when `--check-upstreams` is
//! set. Each route's upstream origin is probed through the real transport:
//! `HEAD` first, and when that errors or the origin rejects the method, a
//! `GET` with a one-byte range. Any status below 500 counts as alive.

use std::time::Duration;

use axum::body::Body;
use axum::http::request::Parts;
use axum::http::{Method, Request, StatusCode};
use thiserror::Error;

use crate::config::RuntimeConfig;
use crate::transport::{ReplayBody, RoundTrip};

#[derive(Debug, Error)]
#[error("{0}")]
pub struct ProbeError(String);

/// Probe every route's upstream; collect all failures into one error.
pub async fn check_upstreams(
    cfg: &RuntimeConfig,
    transport: &dyn RoundTrip,
) -> Result<(), ProbeError> {
    let timeout = if cfg.transport.response_header_timeout.is_zero() {
        Duration::from_secs(10)
    } else {
        cfg.transport.response_header_timeout
    };

    let mut failures = Vec::new();
    for route in &cfg.routes {
        let target = route.upstream_url();
        if let Err(reason) = probe(transport, &target, timeout).await {
            failures.push(format!("{target}: {reason}"));
        }
    }
    if failures.is_empty() {
        Ok(())
    } else {
        Err(ProbeError(failures.join("; ")))
    }
}

async fn probe(transport: &dyn RoundTrip, target: &str, timeout: Duration) -> Result<(), String> {
    let head = request_parts(Method::HEAD, target, false)?;
    match attempt(transport, head, timeout).await {
        Ok(status) if status != StatusCode::METHOD_NOT_ALLOWED => check_status(status),
        _ => {
            let get = request_parts(Method::GET, target, true)?;
            let status = attempt(transport, get, timeout).await?;
            check_status(status)
        }
    }
}

async fn attempt(
    transport: &dyn RoundTrip,
    parts: Parts,
    timeout: Duration,
) -> Result<StatusCode, String> {
    let pending = transport.round_trip(parts, ReplayBody::Empty);
    match tokio::time::timeout(timeout, pending).await {
        Ok(Ok(response)) => Ok(response.status()),
        Ok(Err(err)) => Err(err.to_string()),
        Err(_) => Err("probe timed out".to_string()),
    }
}

fn request_parts(method: Method, target: &str, ranged: bool) -> Result<Parts, String> {
    let mut builder = Request::builder().method(method).uri(target);
    if ranged {
        builder = builder.header("range", "bytes=0-0");
    }
    let request = builder.body(Body::empty()).map_err(|e| e.to_string())?;
    let (parts, _) = request.into_parts();
    Ok(parts)
}

fn check_status(status: StatusCode) -> Result<(), String> {
    if status.as_u16() >= 500 {
        Err(format!("upstream returned {status}"))
    } else {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    use async_trait::async_trait;
    use axum::http::Response;

    use crate::config::{build_runtime, default_config};
    use crate::transport::{full_body, ProxyBody, TransportError};

    struct ScriptedTransport {
        calls: AtomicUsize,
        statuses: Vec<u16>,
    }

    #[async_trait]
    impl RoundTrip for ScriptedTransport {
        async fn round_trip(
            &self,
            _parts: Parts,
            _body: ReplayBody,
        ) -> Result<Response<ProxyBody>, TransportError> {
            let i = self.calls.fetch_add(1, Ordering::SeqCst);
            let status = *self.statuses.get(i).unwrap_or(&200);
            Ok(Response::builder()
                .status(status)
                .body(full_body(""))
                .unwrap())
        }
    }

    fn runtime() -> RuntimeConfig {
        let mut cfg = default_config();
        cfg.routes.truncate(1);
        build_runtime(&cfg).unwrap()
    }

    #[tokio::test]
    async fn healthy_upstream_passes() {
        let transport = Arc::new(ScriptedTransport {
            calls: AtomicUsize::new(0),
            statuses: vec![200],
        });
        check_upstreams(&runtime(), transport.as_ref()).await.unwrap();
        assert_eq!(transport.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn method_not_allowed_falls_back_to_ranged_get() {
        let transport = Arc::new(ScriptedTransport {
            calls: AtomicUsize::new(0),
            statuses: vec![405, 206],
        });
        check_upstreams(&runtime(), transport.as_ref()).await.unwrap();
        assert_eq!(transport.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn server_error_fails_the_check() {
        let transport = Arc::new(ScriptedTransport {
            calls: AtomicUsize::new(0),
            statuses: vec![503, 503],
        });
        let err = check_upstreams(&runtime(), transport.as_ref())
            .await
            .unwrap_err();
        assert!(err.to_string().contains("503"));
    }
}

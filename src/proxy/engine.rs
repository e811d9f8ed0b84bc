//! Per-request proxy pipeline.
//!
//! # Responsibilities
//! - Serve the internal endpoints before any routing
//! - Longest-prefix route match, admission, request rewrite
//! - Round trip through the fallback transport
//! - Response header rewrite before the first body byte moves
//! - Stream the body while counting bytes, and record exactly one terminal
//!   observation per request on every exit path

use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Instant;

use axum::body::Body;
use axum::http::header::{HeaderValue, CONNECTION, CONTENT_LENGTH, CONTENT_TYPE, HOST};
use axum::http::request::Parts;
use axum::http::{HeaderMap, Method, Request, Response, StatusCode, Uri};
use bytes::Bytes;
use http_body::{Body as HttpBody, Frame};
use metrics_exporter_prometheus::PrometheusHandle;

use crate::config::RuntimeConfig;
use crate::net::ClientAddr;
use crate::observability::logging;
use crate::observability::metrics::{self, UNMATCHED_ROUTE};
use crate::proxy::admission::{AdmissionGate, AdmissionPermit, AdmissionRejected};
use crate::rewrite::{rewrite_response_headers, PublicBase};
use crate::routing::{Route, RouteTable};
use crate::transport::{BoxError, ProxyBody, ReplayBody, RoundTrip};

/// The live request handler: immutable once built, replaced wholesale on
/// reload.
pub struct ProxyEngine {
    table: RouteTable,
    transport: Arc<dyn RoundTrip>,
    public_base: Option<PublicBase>,
    listener_tls: bool,
    access_log: bool,
    gate: AdmissionGate,
    metrics_handle: Option<PrometheusHandle>,
}

impl ProxyEngine {
    pub fn new(
        cfg: &RuntimeConfig,
        transport: Arc<dyn RoundTrip>,
        metrics_handle: Option<PrometheusHandle>,
    ) -> Self {
        Self {
            table: RouteTable::new(&cfg.routes),
            transport,
            public_base: cfg.public_base.clone(),
            listener_tls: cfg.tls.is_some(),
            access_log: cfg.access_log,
            gate: AdmissionGate::new(cfg.limits.max_inflight, cfg.limits.max_inflight_wait),
            metrics_handle,
        }
    }

    pub async fn handle(&self, req: Request<Body>) -> Response<Body> {
        if let Some(response) = self.serve_internal(&req) {
            return response;
        }

        let start = Instant::now();
        let method = req.method().clone();
        let path = req.uri().path().to_string();
        let request_bytes = content_length(req.headers());

        let Some(route) = self.table.match_path(&path) else {
            let response = text_response(StatusCode::NOT_FOUND, "no route matched");
            self.observe_local(UNMATCHED_ROUTE, &method, &path, &response, start, request_bytes);
            return response;
        };
        let route_label = route.metric_label().to_string();

        let permit = match self.gate.acquire().await {
            Ok(permit) => permit,
            Err(rejection) => {
                let status = match rejection {
                    AdmissionRejected::Full => StatusCode::TOO_MANY_REQUESTS,
                    AdmissionRejected::WaitElapsed => StatusCode::SERVICE_UNAVAILABLE,
                };
                let response = text_response(status, "server busy");
                self.observe_local(&route_label, &method, &path, &response, start, request_bytes);
                return response;
            }
        };

        let mut observation = Observation::new(
            permit,
            start,
            method.clone(),
            route_label.clone(),
            path.clone(),
            request_bytes,
            self.access_log,
            route.upstream.host.clone(),
        );

        let public_base = self.resolve_public_base(&req);
        let client_addr = req.extensions().get::<ClientAddr>().copied();
        let (mut parts, body) = req.into_parts();
        rewrite_request(&route, &mut parts, client_addr, &public_base);
        let replay = ReplayBody::from_inbound(body);

        match self.transport.round_trip(parts, replay).await {
            Ok(upstream_response) => {
                let (mut parts, body) = upstream_response.into_parts();
                strip_hop_by_hop(&mut parts.headers);
                rewrite_response_headers(&self.table, &mut parts.headers, &public_base);
                observation.status = parts.status.as_u16();
                let metered = MeteredBody::new(body, observation);
                Response::from_parts(parts, Body::new(metered))
            }
            Err(err) => {
                let (status, message) = if err.is_canceled() {
                    (StatusCode::REQUEST_TIMEOUT, "request canceled")
                } else {
                    (StatusCode::BAD_GATEWAY, "upstream error")
                };
                tracing::error!(
                    method = %method,
                    path = %path,
                    upstream = %route.upstream.host,
                    error = %err,
                    "upstream error"
                );
                metrics::record_upstream_error(&route_label);
                observation.status = status.as_u16();
                observation.response_bytes = message.len() as u64;
                drop(observation);
                text_response(status, message)
            }
        }
    }

    /// Internal endpoints are served before routing and are never counted
    /// as proxied requests.
    fn serve_internal(&self, req: &Request<Body>) -> Option<Response<Body>> {
        match req.uri().path() {
            "/_rmirror/healthz" => Some(text_response(StatusCode::OK, "ok")),
            "/_rmirror/readyz" => {
                if self.gate.is_saturated() {
                    Some(text_response(StatusCode::SERVICE_UNAVAILABLE, "busy"))
                } else {
                    Some(text_response(StatusCode::OK, "ok"))
                }
            }
            "/metrics" => match &self.metrics_handle {
                Some(handle) => {
                    let mut response = Response::new(Body::from(handle.render()));
                    response.headers_mut().insert(
                        CONTENT_TYPE,
                        HeaderValue::from_static("text/plain; version=0.0.4"),
                    );
                    Some(response)
                }
                None => Some(text_response(StatusCode::NOT_FOUND, "metrics unavailable")),
            },
            _ => None,
        }
    }

    /// PublicBase for this request: the configured static origin, or the
    /// per-request derivation from X-Forwarded-Proto / listener TLS / Host.
    fn resolve_public_base(&self, req: &Request<Body>) -> PublicBase {
        if let Some(public_base) = &self.public_base {
            return public_base.clone();
        }
        let scheme = req
            .headers()
            .get("x-forwarded-proto")
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.split(',').next())
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .unwrap_or_else(|| {
                if self.listener_tls {
                    "https".to_string()
                } else {
                    "http".to_string()
                }
            });
        let host = req
            .headers()
            .get(HOST)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string)
            .or_else(|| req.uri().authority().map(|a| a.to_string()))
            .unwrap_or_default();
        PublicBase { scheme, host }
    }

    fn observe_local(
        &self,
        route_label: &str,
        method: &Method,
        path: &str,
        response: &Response<Body>,
        start: Instant,
        request_bytes: u64,
    ) {
        let response_bytes = content_length(response.headers());
        metrics::record_request(
            route_label,
            method.as_str(),
            response.status().as_u16(),
            start.elapsed(),
            request_bytes,
            response_bytes,
        );
        if self.access_log {
            logging::access_log(
                method.as_str(),
                path,
                response.status().as_u16(),
                response_bytes,
                start.elapsed().as_millis(),
                route_label,
                None,
            );
        }
    }
}

/// Outbound leg of the rewrite: upstream scheme/host/path on the URI, Host
/// header policy, hop-by-hop stripping, X-Forwarded-For.
fn rewrite_request(
    route: &Route,
    parts: &mut Parts,
    client_addr: Option<ClientAddr>,
    public_base: &PublicBase,
) {
    let stripped = route.strip_prefix(parts.uri.path());
    let upstream_path = route.join_upstream_path(&stripped);
    let path_and_query = match parts.uri.query() {
        Some(query) => format!("{upstream_path}?{query}"),
        None => upstream_path,
    };
    if let Ok(uri) = Uri::builder()
        .scheme(route.upstream.scheme.as_str())
        .authority(route.upstream.host.as_str())
        .path_and_query(path_and_query)
        .build()
    {
        parts.uri = uri;
    }

    strip_hop_by_hop(&mut parts.headers);

    if route.preserve_host {
        if !parts.headers.contains_key(HOST) {
            // HTTP/2 inbound carries the client host in :authority only.
            if let Ok(value) = HeaderValue::from_str(&public_base.host) {
                parts.headers.insert(HOST, value);
            }
        }
    } else if let Ok(value) = HeaderValue::from_str(&route.upstream.host) {
        parts.headers.insert(HOST, value);
    }

    if let Some(ClientAddr(addr)) = client_addr {
        let ip = addr.ip().to_string();
        let value = match parts
            .headers
            .get("x-forwarded-for")
            .and_then(|v| v.to_str().ok())
        {
            Some(existing) => format!("{existing}, {ip}"),
            None => ip,
        };
        if let Ok(value) = HeaderValue::from_str(&value) {
            parts.headers.insert("x-forwarded-for", value);
        }
    }
}

/// Remove hop-by-hop headers: the fixed RFC set plus anything the
/// Connection header names.
fn strip_hop_by_hop(headers: &mut HeaderMap) {
    let mut named: Vec<String> = Vec::new();
    for value in headers.get_all(CONNECTION) {
        if let Ok(value) = value.to_str() {
            named.extend(
                value
                    .split(',')
                    .map(|t| t.trim().to_ascii_lowercase())
                    .filter(|t| !t.is_empty()),
            );
        }
    }
    for name in named {
        headers.remove(name.as_str());
    }
    for name in [
        "connection",
        "proxy-connection",
        "keep-alive",
        "proxy-authenticate",
        "proxy-authorization",
        "te",
        "trailer",
        "transfer-encoding",
        "upgrade",
    ] {
        headers.remove(name);
    }
}

fn content_length(headers: &HeaderMap) -> u64 {
    headers
        .get(CONTENT_LENGTH)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.parse().ok())
        .unwrap_or(0)
}

fn text_response(status: StatusCode, message: &'static str) -> Response<Body> {
    let mut response = Response::new(Body::from(message));
    *response.status_mut() = status;
    response
        .headers_mut()
        .insert(CONTENT_TYPE, HeaderValue::from_static("text/plain; charset=utf-8"));
    response
        .headers_mut()
        .insert(CONTENT_LENGTH, HeaderValue::from(message.len()));
    response
}

/// Per-request accounting. Holds the admission permit for the lifetime of
/// the response body; dropping it records the terminal observation exactly
/// once, on completion, error, or client disconnect alike.
struct Observation {
    _permit: AdmissionPermit,
    start: Instant,
    method: Method,
    route: String,
    path: String,
    status: u16,
    request_bytes: u64,
    response_bytes: u64,
    access_log: bool,
    upstream: String,
}

impl Observation {
    #[allow(clippy::too_many_arguments)]
    fn new(
        permit: AdmissionPermit,
        start: Instant,
        method: Method,
        route: String,
        path: String,
        request_bytes: u64,
        access_log: bool,
        upstream: String,
    ) -> Self {
        metrics::inflight_inc();
        Self {
            _permit: permit,
            start,
            method,
            route,
            path,
            status: StatusCode::OK.as_u16(),
            request_bytes,
            response_bytes: 0,
            access_log,
            upstream,
        }
    }
}

impl Drop for Observation {
    fn drop(&mut self) {
        metrics::inflight_dec();
        metrics::record_request(
            &self.route,
            self.method.as_str(),
            self.status,
            self.start.elapsed(),
            self.request_bytes,
            self.response_bytes,
        );
        if self.access_log {
            logging::access_log(
                self.method.as_str(),
                &self.path,
                self.status,
                self.response_bytes,
                self.start.elapsed().as_millis(),
                &self.route,
                Some(&self.upstream),
            );
        }
    }
}

/// Streams the upstream body to the client while counting bytes into the
/// owned [`Observation`].
struct MeteredBody {
    inner: ProxyBody,
    observation: Option<Observation>,
}

impl MeteredBody {
    fn new(inner: ProxyBody, observation: Observation) -> Self {
        Self {
            inner,
            observation: Some(observation),
        }
    }
}

impl HttpBody for MeteredBody {
    type Data = Bytes;
    type Error = BoxError;

    fn poll_frame(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
    ) -> Poll<Option<Result<Frame<Self::Data>, Self::Error>>> {
        let this = self.get_mut();
        match Pin::new(&mut this.inner).poll_frame(cx) {
            Poll::Ready(Some(Ok(frame))) => {
                if let Some(data) = frame.data_ref() {
                    if let Some(observation) = &mut this.observation {
                        observation.response_bytes += data.len() as u64;
                    }
                }
                Poll::Ready(Some(Ok(frame)))
            }
            Poll::Ready(Some(Err(err))) => {
                this.observation.take();
                Poll::Ready(Some(Err(err)))
            }
            Poll::Ready(None) => {
                this.observation.take();
                Poll::Ready(None)
            }
            Poll::Pending => Poll::Pending,
        }
    }

    fn is_end_stream(&self) -> bool {
        self.inner.is_end_stream()
    }

    fn size_hint(&self) -> http_body::SizeHint {
        self.inner.size_hint()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::sync::Mutex;

    use crate::config::schema::{default_config, MirrorConfig, RouteConfig};
    use crate::config::validation::build_runtime;
    use crate::transport::{full_body, TransportError};

    /// Stub transport returning a canned response and capturing the
    /// outbound request parts.
    struct StubTransport {
        response: Box<dyn Fn() -> Response<ProxyBody> + Send + Sync>,
        seen: Mutex<Vec<Parts>>,
    }

    impl StubTransport {
        fn with_response(
            response: impl Fn() -> Response<ProxyBody> + Send + Sync + 'static,
        ) -> Arc<Self> {
            Arc::new(Self {
                response: Box::new(response),
                seen: Mutex::new(Vec::new()),
            })
        }
    }

    #[async_trait]
    impl RoundTrip for StubTransport {
        async fn round_trip(
            &self,
            parts: Parts,
            _body: ReplayBody,
        ) -> Result<Response<ProxyBody>, TransportError> {
            self.seen.lock().unwrap().push(parts);
            Ok((self.response)())
        }
    }

    fn config(routes: Vec<RouteConfig>) -> MirrorConfig {
        let mut cfg = default_config();
        cfg.access_log = false;
        cfg.routes = routes;
        cfg
    }

    fn engine(cfg: &MirrorConfig, transport: Arc<StubTransport>) -> ProxyEngine {
        let runtime = build_runtime(cfg).unwrap();
        ProxyEngine::new(&runtime, transport, None)
    }

    fn get(path: &str) -> Request<Body> {
        Request::builder()
            .uri(path)
            .header(HOST, "mirror.local:5000")
            .body(Body::empty())
            .unwrap()
    }

    #[tokio::test]
    async fn miss_returns_404() {
        let transport = StubTransport::with_response(|| {
            Response::builder().status(200).body(full_body("")).unwrap()
        });
        let cfg = config(vec![RouteConfig {
            name: "auth".into(),
            public_prefix: "/_auth".into(),
            upstream: "https://auth.example.com".into(),
            preserve_host: false,
        }]);
        let engine = engine(&cfg, transport.clone());

        let response = engine.handle(get("/other")).await;
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
        assert!(transport.seen.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn request_rewritten_for_matched_route() {
        let transport = StubTransport::with_response(|| {
            Response::builder().status(200).body(full_body("ok")).unwrap()
        });
        let cfg = config(vec![RouteConfig {
            name: "api".into(),
            public_prefix: "/api".into(),
            upstream: "http://upstream.example.com:8080/v1".into(),
            preserve_host: false,
        }]);
        let engine = engine(&cfg, transport.clone());

        let response = engine.handle(get("/api/users?id=42")).await;
        assert_eq!(response.status(), StatusCode::OK);

        let seen = transport.seen.lock().unwrap();
        let parts = &seen[0];
        assert_eq!(parts.uri.scheme_str(), Some("http"));
        assert_eq!(parts.uri.authority().unwrap().as_str(), "upstream.example.com:8080");
        assert_eq!(parts.uri.path(), "/v1/users");
        assert_eq!(parts.uri.query(), Some("id=42"));
        assert_eq!(parts.headers.get(HOST).unwrap(), "upstream.example.com:8080");
    }

    #[tokio::test]
    async fn preserve_host_keeps_client_host() {
        let transport = StubTransport::with_response(|| {
            Response::builder().status(200).body(full_body("ok")).unwrap()
        });
        let cfg = config(vec![RouteConfig {
            name: "root".into(),
            public_prefix: "/".into(),
            upstream: "http://upstream.example.com".into(),
            preserve_host: true,
        }]);
        let engine = engine(&cfg, transport.clone());

        engine.handle(get("/x")).await;
        let seen = transport.seen.lock().unwrap();
        assert_eq!(seen[0].headers.get(HOST).unwrap(), "mirror.local:5000");
    }

    #[tokio::test]
    async fn location_header_rewritten() {
        let transport = StubTransport::with_response(|| {
            Response::builder()
                .status(StatusCode::TEMPORARY_REDIRECT)
                .header("location", "https://cdn.example.com/data")
                .body(full_body(""))
                .unwrap()
        });
        let cfg = config(vec![
            RouteConfig {
                name: "root".into(),
                public_prefix: "/".into(),
                upstream: "https://registry.example.com".into(),
                preserve_host: false,
            },
            RouteConfig {
                name: "blob".into(),
                public_prefix: "/_blob".into(),
                upstream: "https://cdn.example.com".into(),
                preserve_host: false,
            },
        ]);
        let engine = engine(&cfg, transport);

        let response = engine.handle(get("/v2/thing")).await;
        assert_eq!(
            response.headers().get("location").unwrap(),
            "http://mirror.local:5000/_blob/data"
        );
    }

    #[tokio::test]
    async fn internal_endpoints_bypass_routing() {
        let transport = StubTransport::with_response(|| {
            Response::builder().status(200).body(full_body("")).unwrap()
        });
        let cfg = config(vec![RouteConfig {
            name: "root".into(),
            public_prefix: "/".into(),
            upstream: "https://registry.example.com".into(),
            preserve_host: false,
        }]);
        let engine = engine(&cfg, transport.clone());

        let health = engine.handle(get("/_rmirror/healthz")).await;
        assert_eq!(health.status(), StatusCode::OK);
        let ready = engine.handle(get("/_rmirror/readyz")).await;
        assert_eq!(ready.status(), StatusCode::OK);
        let metrics = engine.handle(get("/metrics")).await;
        assert_eq!(metrics.status(), StatusCode::NOT_FOUND);
        assert!(transport.seen.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn upstream_error_maps_to_502() {
        struct FailingTransport;

        #[async_trait]
        impl RoundTrip for FailingTransport {
            async fn round_trip(
                &self,
                _parts: Parts,
                _body: ReplayBody,
            ) -> Result<Response<ProxyBody>, TransportError> {
                Err(TransportError::ResponseHeaders)
            }
        }

        let cfg = config(vec![RouteConfig {
            name: "root".into(),
            public_prefix: "/".into(),
            upstream: "https://registry.example.com".into(),
            preserve_host: false,
        }]);
        let runtime = build_runtime(&cfg).unwrap();
        let engine = ProxyEngine::new(&runtime, Arc::new(FailingTransport), None);

        let response = engine.handle(get("/v2/")).await;
        assert_eq!(response.status(), StatusCode::BAD_GATEWAY);
    }

    #[tokio::test]
    async fn hop_by_hop_headers_removed() {
        let transport = StubTransport::with_response(|| {
            Response::builder().status(200).body(full_body("")).unwrap()
        });
        let cfg = config(vec![RouteConfig {
            name: "root".into(),
            public_prefix: "/".into(),
            upstream: "https://registry.example.com".into(),
            preserve_host: false,
        }]);
        let engine = engine(&cfg, transport.clone());

        let request = Request::builder()
            .uri("/v2/")
            .header(HOST, "mirror.local:5000")
            .header(CONNECTION, "keep-alive, x-custom-hop")
            .header("keep-alive", "timeout=5")
            .header("x-custom-hop", "1")
            .header("x-kept", "1")
            .body(Body::empty())
            .unwrap();
        engine.handle(request).await;

        let seen = transport.seen.lock().unwrap();
        let headers = &seen[0].headers;
        assert!(!headers.contains_key(CONNECTION));
        assert!(!headers.contains_key("keep-alive"));
        assert!(!headers.contains_key("x-custom-hop"));
        assert!(headers.contains_key("x-kept"));
    }
}

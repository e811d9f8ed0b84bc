//! Fallback chain over progressively smaller fragment lengths.
//!
//! The chain holds one pooled client per fragment length: the configured
//! primary plus the derived fallback sequence. A response from the primary,
//! whatever its status, ends the chain. Only a connection-reset-class error
//! on a safely retriable request moves to the next client; every transition
//! is recorded in metrics. The chain is polymorphic over the single-attempt
//! capability so tests can substitute stubs.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use axum::body::Body;
use axum::http::request::Parts;
use axum::http::{Request, Response};
use bytes::Bytes;
use http_body_util::BodyExt;
use hyper_util::client::legacy::Client;
use hyper_util::rt::{TokioExecutor, TokioTimer};

use crate::config::TransportSettings;
use crate::observability::metrics;
use crate::transport::connector::FragmentingConnector;
use crate::transport::dns::UpstreamResolver;
use crate::transport::{ProxyBody, RoundTrip, TransportError};

/// Outbound request body with replay capability.
///
/// `Empty` and `Buffered` act as fresh-body producers; a `Streaming` body
/// can be sent exactly once and is never retried.
pub enum ReplayBody {
    Empty,
    Buffered(Bytes),
    Streaming(Option<Body>),
}

impl ReplayBody {
    /// Classify an inbound body: bodies known to be empty stay replayable,
    /// everything else streams through once.
    pub fn from_inbound(body: Body) -> Self {
        if http_body::Body::size_hint(&body).exact() == Some(0) {
            ReplayBody::Empty
        } else {
            ReplayBody::Streaming(Some(body))
        }
    }

    pub fn is_replayable(&self) -> bool {
        !matches!(self, ReplayBody::Streaming(_))
    }

    /// Produce a body for one attempt. `None` once a streaming body has
    /// been consumed.
    pub fn produce(&mut self) -> Option<Body> {
        match self {
            ReplayBody::Empty => Some(Body::empty()),
            ReplayBody::Buffered(bytes) => Some(Body::from(bytes.clone())),
            ReplayBody::Streaming(body) => body.take(),
        }
    }
}

/// Whether the fallback chain may re-send this request at all.
///
/// Idempotent methods (GET, HEAD, OPTIONS) carry empty bodies, which are
/// always replayable; buffered bodies act as an explicit fresh-body
/// producer. What remains is a consumed stream, which can never be resent,
/// so the whole rule collapses to body replayability.
pub fn is_safely_retriable(body: &ReplayBody) -> bool {
    body.is_replayable()
}

/// Reset-class errors: ECONNRESET, EPIPE, unexpected end of stream, or a
/// "connection reset by peer" message anywhere in the chain.
pub fn is_reset_error(err: &(dyn std::error::Error + 'static)) -> bool {
    let mut current: Option<&(dyn std::error::Error + 'static)> = Some(err);
    while let Some(e) = current {
        if let Some(io_err) = e.downcast_ref::<std::io::Error>() {
            match io_err.kind() {
                std::io::ErrorKind::ConnectionReset
                | std::io::ErrorKind::BrokenPipe
                | std::io::ErrorKind::UnexpectedEof => return true,
                _ => {}
            }
        }
        if let Some(hyper_err) = e.downcast_ref::<hyper::Error>() {
            if hyper_err.is_incomplete_message() {
                return true;
            }
        }
        if e.to_string().to_lowercase().contains("connection reset by peer") {
            return true;
        }
        current = e.source();
    }
    false
}

/// One attempt at a fixed fragment length.
#[async_trait]
pub trait Attempt: Send + Sync {
    async fn send(&self, parts: &Parts, body: Body) -> Result<Response<ProxyBody>, TransportError>;
}

/// Pooled hyper client over the fragmenting connector.
pub struct FragmentClient {
    client: Client<FragmentingConnector, Body>,
    response_header_timeout: Duration,
}

impl FragmentClient {
    pub fn new(
        resolver: Arc<UpstreamResolver>,
        settings: &TransportSettings,
        fragment_len: u8,
    ) -> Self {
        let connector = FragmentingConnector::new(resolver, settings, fragment_len);
        let mut builder = Client::builder(TokioExecutor::new());
        builder
            .pool_idle_timeout(settings.idle_conn_timeout)
            .pool_max_idle_per_host(settings.max_idle_conns_per_host)
            .pool_timer(TokioTimer::new());
        Self {
            client: builder.build(connector),
            response_header_timeout: settings.response_header_timeout,
        }
    }
}

#[async_trait]
impl Attempt for FragmentClient {
    async fn send(&self, parts: &Parts, body: Body) -> Result<Response<ProxyBody>, TransportError> {
        let request = Request::from_parts(parts.clone(), body);
        let pending = self.client.request(request);
        let result = if self.response_header_timeout > Duration::ZERO {
            match tokio::time::timeout(self.response_header_timeout, pending).await {
                Ok(r) => r,
                Err(_) => return Err(TransportError::ResponseHeaders),
            }
        } else {
            pending.await
        };
        let response = result.map_err(TransportError::Request)?;
        Ok(response.map(|incoming| {
            incoming
                .map_err(|e| Box::new(e) as Box<dyn std::error::Error + Send + Sync>)
                .boxed_unsync()
        }))
    }
}

struct Chain<A> {
    /// (fragment length, client) in attempt order: primary first.
    attempts: Vec<(u8, Arc<A>)>,
}

/// The transport handed to the proxy engine.
pub struct FallbackTransport<A> {
    inner: Mutex<Option<Chain<A>>>,
}

impl<A: Attempt> FallbackTransport<A> {
    pub fn new(attempts: Vec<(u8, Arc<A>)>) -> Self {
        Self {
            inner: Mutex::new(Some(Chain { attempts })),
        }
    }

    fn attempts(&self) -> Result<Vec<(u8, Arc<A>)>, TransportError> {
        let guard = self.inner.lock().expect("transport mutex poisoned");
        guard
            .as_ref()
            .map(|chain| chain.attempts.clone())
            .ok_or(TransportError::Closed)
    }
}

#[async_trait]
impl<A: Attempt + 'static> RoundTrip for FallbackTransport<A> {
    async fn round_trip(
        &self,
        parts: Parts,
        mut body: ReplayBody,
    ) -> Result<Response<ProxyBody>, TransportError> {
        let attempts = self.attempts()?;
        let retriable = is_safely_retriable(&body);
        let mut previous_fragment = attempts.first().map(|(f, _)| *f).unwrap_or(0);
        let mut last_err = None;

        for (i, (fragment, attempt)) in attempts.iter().enumerate() {
            if i > 0 {
                metrics::record_fallback(previous_fragment, *fragment);
            }
            let Some(attempt_body) = body.produce() else {
                break;
            };
            match attempt.send(&parts, attempt_body).await {
                Ok(response) => return Ok(response),
                Err(err) => {
                    let retry = retriable && is_reset_error(&err);
                    last_err = Some(err);
                    if !retry {
                        break;
                    }
                    previous_fragment = *fragment;
                }
            }
        }
        Err(last_err.unwrap_or(TransportError::Closed))
    }

    /// Drop the pooled clients, closing their idle connections. Requests
    /// already in flight hold their own client handles and finish on the
    /// old connections.
    fn release_idle(&self) {
        let _ = self.inner.lock().expect("transport mutex poisoned").take();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io;
    use std::net::SocketAddr;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use axum::http::Method;

    use crate::transport::{full_body, DialError};

    struct StubAttempt {
        calls: AtomicUsize,
        outcome: Box<dyn Fn() -> Result<Response<ProxyBody>, TransportError> + Send + Sync>,
    }

    impl StubAttempt {
        fn new(
            outcome: impl Fn() -> Result<Response<ProxyBody>, TransportError> + Send + Sync + 'static,
        ) -> Arc<Self> {
            Arc::new(Self {
                calls: AtomicUsize::new(0),
                outcome: Box::new(outcome),
            })
        }

        fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl Attempt for StubAttempt {
        async fn send(&self, _parts: &Parts, _body: Body) -> Result<Response<ProxyBody>, TransportError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            (self.outcome)()
        }
    }

    fn reset_error() -> TransportError {
        let addr: SocketAddr = "203.0.113.9:443".parse().unwrap();
        TransportError::Dial(DialError::Connect {
            addr,
            source: io::Error::new(io::ErrorKind::ConnectionReset, "connection reset by peer"),
        })
    }

    fn refused_error() -> TransportError {
        let addr: SocketAddr = "203.0.113.9:443".parse().unwrap();
        TransportError::Dial(DialError::Connect {
            addr,
            source: io::Error::new(io::ErrorKind::ConnectionRefused, "connection refused"),
        })
    }

    fn ok_response() -> Response<ProxyBody> {
        Response::builder().status(200).body(full_body("ok")).unwrap()
    }

    fn get_parts() -> Parts {
        let (parts, _) = Request::builder()
            .method(Method::GET)
            .uri("http://upstream.example.com/")
            .body(Body::empty())
            .unwrap()
            .into_parts();
        parts
    }

    fn post_parts() -> Parts {
        let (parts, _) = Request::builder()
            .method(Method::POST)
            .uri("http://upstream.example.com/")
            .body(Body::empty())
            .unwrap()
            .into_parts();
        parts
    }

    #[tokio::test]
    async fn falls_back_on_reset_for_get() {
        let primary = StubAttempt::new(|| Err(reset_error()));
        let fallback = StubAttempt::new(|| Ok(ok_response()));
        let transport =
            FallbackTransport::new(vec![(3, primary.clone()), (1, fallback.clone())]);

        let response = transport
            .round_trip(get_parts(), ReplayBody::Empty)
            .await
            .unwrap();
        assert_eq!(response.status(), 200);
        assert_eq!(primary.calls(), 1);
        assert_eq!(fallback.calls(), 1);
    }

    #[tokio::test]
    async fn no_retry_for_streaming_body() {
        let primary = StubAttempt::new(|| Err(reset_error()));
        let fallback = StubAttempt::new(|| Ok(ok_response()));
        let transport =
            FallbackTransport::new(vec![(3, primary.clone()), (1, fallback.clone())]);

        let body = ReplayBody::Streaming(Some(Body::from("data")));
        let err = transport.round_trip(post_parts(), body).await.unwrap_err();
        assert!(matches!(err, TransportError::Dial(_)));
        assert_eq!(primary.calls(), 1);
        assert_eq!(fallback.calls(), 0);
    }

    #[tokio::test]
    async fn no_retry_on_non_reset_error() {
        let primary = StubAttempt::new(|| Err(refused_error()));
        let fallback = StubAttempt::new(|| Ok(ok_response()));
        let transport =
            FallbackTransport::new(vec![(3, primary.clone()), (1, fallback.clone())]);

        let err = transport
            .round_trip(get_parts(), ReplayBody::Empty)
            .await
            .unwrap_err();
        assert!(matches!(err, TransportError::Dial(_)));
        assert_eq!(primary.calls(), 1);
        assert_eq!(fallback.calls(), 0);
    }

    #[tokio::test]
    async fn buffered_body_is_replayed() {
        let primary = StubAttempt::new(|| Err(reset_error()));
        let fallback = StubAttempt::new(|| Ok(ok_response()));
        let transport =
            FallbackTransport::new(vec![(3, primary.clone()), (0, fallback.clone())]);

        let body = ReplayBody::Buffered(Bytes::from_static(b"payload"));
        let response = transport.round_trip(post_parts(), body).await.unwrap();
        assert_eq!(response.status(), 200);
        assert_eq!(fallback.calls(), 1);
    }

    #[tokio::test]
    async fn exhaustion_returns_last_error() {
        let primary = StubAttempt::new(|| Err(reset_error()));
        let secondary = StubAttempt::new(|| Err(reset_error()));
        let transport =
            FallbackTransport::new(vec![(3, primary.clone()), (1, secondary.clone())]);

        let err = transport
            .round_trip(get_parts(), ReplayBody::Empty)
            .await
            .unwrap_err();
        assert!(is_reset_error(&err));
        assert_eq!(primary.calls(), 1);
        assert_eq!(secondary.calls(), 1);
    }

    #[tokio::test]
    async fn released_transport_refuses_requests() {
        let primary = StubAttempt::new(|| Ok(ok_response()));
        let transport = FallbackTransport::new(vec![(3, primary.clone())]);
        transport.release_idle();

        let err = transport
            .round_trip(get_parts(), ReplayBody::Empty)
            .await
            .unwrap_err();
        assert!(matches!(err, TransportError::Closed));
        assert_eq!(primary.calls(), 0);
    }

    #[test]
    fn reset_classification() {
        assert!(is_reset_error(&reset_error()));
        assert!(!is_reset_error(&refused_error()));
        let eof = TransportError::Dial(DialError::Connect {
            addr: "203.0.113.9:443".parse().unwrap(),
            source: io::Error::new(io::ErrorKind::UnexpectedEof, "eof"),
        });
        assert!(is_reset_error(&eof));
    }

    #[test]
    fn retriability_rules() {
        assert!(is_safely_retriable(&ReplayBody::Empty));
        assert!(is_safely_retriable(&ReplayBody::Buffered(Bytes::from_static(b"x"))));
        assert!(!is_safely_retriable(&ReplayBody::Streaming(Some(Body::from("x")))));
    }
}

//! Outbound transport: DNS, dialing, TLS fragmentation, fallback chain.
//!
//! # Data Flow
//! ```text
//! proxy engine
//!     → RoundTrip (FallbackTransport)
//!     → FragmentClient (pooled hyper client, one per fragment length)
//!     → FragmentingConnector (resolve → connect → fragmented handshake)
//!     → upstream
//! ```

pub mod connector;
pub mod dns;
pub mod fallback;
pub mod fragment;

use std::net::SocketAddr;
use std::sync::Arc;

use async_trait::async_trait;
use axum::http::request::Parts;
use axum::http::Response;
use bytes::Bytes;
use http_body_util::combinators::UnsyncBoxBody;
use http_body_util::{BodyExt, Full};
use thiserror::Error;

use crate::config::TransportSettings;

pub use dns::{ipv6_available, UpstreamResolver};
pub use fallback::{is_reset_error, is_safely_retriable, FallbackTransport, FragmentClient, ReplayBody};
pub use fragment::FragmentStream;

/// Boxed error used across body and transport boundaries.
pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Install the ring crypto provider as the process default exactly once.
/// Multiple rustls providers may be compiled in via transitive features;
/// pinning one keeps `ClientConfig::builder()` deterministic.
pub(crate) fn ensure_crypto_provider() {
    use std::sync::OnceLock;
    static INSTALLED: OnceLock<()> = OnceLock::new();
    INSTALLED.get_or_init(|| {
        let _ = rustls::crypto::ring::default_provider().install_default();
    });
}

/// Response body type every transport hands back.
pub type ProxyBody = UnsyncBoxBody<Bytes, BoxError>;

/// Build a `ProxyBody` from in-memory bytes.
pub fn full_body(data: impl Into<Bytes>) -> ProxyBody {
    Full::new(data.into())
        .map_err(|never| match never {})
        .boxed_unsync()
}

/// Errors produced while dialing an upstream.
#[derive(Debug, Error)]
pub enum DialError {
    #[error("request uri missing host")]
    MissingHost,

    #[error("invalid tls server name {host:?}")]
    InvalidServerName { host: String },

    #[error("resolve {host}: {source}")]
    Resolve {
        host: String,
        #[source]
        source: BoxError,
    },

    #[error("no upstream addresses for {host}")]
    NoAddresses { host: String },

    #[error("connect {addr}: {source}")]
    Connect {
        addr: SocketAddr,
        #[source]
        source: std::io::Error,
    },

    #[error("tls handshake with {addr}: {source}")]
    Handshake {
        addr: SocketAddr,
        #[source]
        source: std::io::Error,
    },
}

/// Errors surfaced by a transport round trip.
#[derive(Debug, Error)]
pub enum TransportError {
    #[error(transparent)]
    Dial(#[from] DialError),

    #[error("upstream request failed: {0}")]
    Request(#[source] hyper_util::client::legacy::Error),

    #[error("timed out waiting for upstream response headers")]
    ResponseHeaders,

    #[error("request canceled")]
    Canceled,

    #[error("transport closed")]
    Closed,
}

impl TransportError {
    /// Cancellation surfaced from below maps to 408 rather than 502.
    pub fn is_canceled(&self) -> bool {
        if matches!(self, TransportError::Canceled) {
            return true;
        }
        let mut current: Option<&(dyn std::error::Error + 'static)> = Some(self);
        while let Some(e) = current {
            if let Some(hyper_err) = e.downcast_ref::<hyper::Error>() {
                if hyper_err.is_canceled() {
                    return true;
                }
            }
            current = e.source();
        }
        false
    }
}

/// Round-trip capability the proxy engine is polymorphic over.
///
/// `release_idle` exists so a superseded transport can drop its pooled
/// connections after a reload; stubs keep the default no-op.
#[async_trait]
pub trait RoundTrip: Send + Sync {
    async fn round_trip(
        &self,
        parts: Parts,
        body: ReplayBody,
    ) -> Result<Response<ProxyBody>, TransportError>;

    fn release_idle(&self) {}
}

/// Fallback fragment lengths derived from the primary: anything above 1
/// retries at 1 then 0; 1 retries at 0; 0 has nothing to fall back to.
pub fn fallback_fragment_lens(primary: u8) -> Vec<u8> {
    match primary {
        2..=u8::MAX => vec![1, 0],
        1 => vec![0],
        0 => Vec::new(),
    }
}

/// Build the production transport: one pooled client per fragment length,
/// sharing a resolver, wrapped in the fallback chain.
pub fn build(settings: &TransportSettings) -> Arc<FallbackTransport<FragmentClient>> {
    let resolver = Arc::new(UpstreamResolver::new());
    let mut lens = vec![settings.first_fragment_len];
    lens.extend(fallback_fragment_lens(settings.first_fragment_len));
    let attempts = lens
        .into_iter()
        .map(|len| {
            (
                len,
                Arc::new(FragmentClient::new(resolver.clone(), settings, len)),
            )
        })
        .collect();
    Arc::new(FallbackTransport::new(attempts))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fallback_sequence_derivation() {
        assert_eq!(fallback_fragment_lens(3), vec![1, 0]);
        assert_eq!(fallback_fragment_lens(255), vec![1, 0]);
        assert_eq!(fallback_fragment_lens(2), vec![1, 0]);
        assert_eq!(fallback_fragment_lens(1), vec![0]);
        assert!(fallback_fragment_lens(0).is_empty());
    }
}

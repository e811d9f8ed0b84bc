//! Configuration schema definitions.
//!
//! This module defines the on-disk configuration structure for the proxy.
//! All types derive Serde traits for deserialization from TOML files.
//! Durations are strings in Go notation (`"10s"`, `"250ms"`, `"1m30s"`);
//! parsing them into typed values is part of [`crate::config::validation`].

use serde::{Deserialize, Serialize};

/// Root configuration for the mirror.
#[derive(Debug, Clone, Deserialize, Serialize, Default)]
#[serde(default)]
pub struct MirrorConfig {
    /// Listen address (e.g., "127.0.0.1:5000").
    pub listen: String,

    /// Optional public base origin (scheme + host, no path) used when
    /// rewriting upstream URLs regardless of the incoming Host header.
    pub public_base_url: String,

    /// Emit one structured log event per proxied request.
    pub access_log: bool,

    /// Optional listener TLS. Presence switches the listener to TLS.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tls: Option<TlsConfig>,

    /// Server-side timeouts. Not hot-reloadable.
    pub timeouts: TimeoutConfig,

    /// Outbound transport tuning.
    pub transport: TransportConfig,

    /// Admission limits.
    pub limits: LimitsConfig,

    /// Route definitions mapping public prefixes to upstreams.
    pub routes: Vec<RouteConfig>,
}

/// Listener TLS material.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct TlsConfig {
    /// Path to certificate chain file (PEM).
    pub cert_file: String,

    /// Path to private key file (PEM).
    pub key_file: String,
}

/// Server-side timeouts and header limits.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct TimeoutConfig {
    /// Time allowed to read the request header.
    pub read_header: String,

    /// Time allowed to read the full request. Empty disables.
    pub read: String,

    /// Time allowed to write the response. Empty disables.
    pub write: String,

    /// Keep-alive idle timeout for client connections.
    pub idle: String,

    /// Grace period for in-flight requests on shutdown.
    pub shutdown: String,

    /// Maximum request header size in bytes.
    pub max_header_bytes: usize,
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            read_header: "10s".to_string(),
            read: String::new(),
            write: String::new(),
            idle: "60s".to_string(),
            shutdown: "5s".to_string(),
            max_header_bytes: 1 << 20,
        }
    }
}

/// Outbound transport configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct TransportConfig {
    /// Bytes of the first outbound TLS record flushed separately.
    /// 0 disables fragmentation.
    pub first_fragment_len: u8,

    /// TCP connect timeout per resolved address.
    pub dial_timeout: String,

    /// TCP keep-alive interval.
    pub keepalive: String,

    /// Total idle connections kept in the pool. Non-positive means default.
    pub max_idle_conns: usize,

    /// Idle connections kept per upstream host. Non-positive means default.
    pub max_idle_conns_per_host: usize,

    /// Hard cap on connections per upstream host. 0 means unlimited.
    pub max_conns_per_host: usize,

    /// How long an idle pooled connection is kept open.
    pub idle_conn_timeout: String,

    /// TLS handshake deadline per connection attempt.
    pub tls_handshake_timeout: String,

    /// Time allowed for upstream response headers.
    pub response_header_timeout: String,

    /// Wait for a 100 Continue before sending the body.
    pub expect_continue_timeout: String,

    /// Offer h2 via ALPN and speak HTTP/2 when negotiated.
    pub force_http2: bool,

    /// Disable transparent response decompression.
    pub disable_compression: bool,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            first_fragment_len: 3,
            dial_timeout: "10s".to_string(),
            keepalive: "30s".to_string(),
            max_idle_conns: 256,
            max_idle_conns_per_host: 64,
            max_conns_per_host: 0,
            idle_conn_timeout: "90s".to_string(),
            tls_handshake_timeout: "10s".to_string(),
            response_header_timeout: "30s".to_string(),
            expect_continue_timeout: "1s".to_string(),
            force_http2: true,
            disable_compression: false,
        }
    }
}

/// Admission limits.
#[derive(Debug, Clone, Deserialize, Serialize, Default)]
#[serde(default)]
pub struct LimitsConfig {
    /// Maximum proxied requests in flight. 0 disables the gate.
    pub max_inflight: usize,

    /// How long a request may wait for a permit before rejection.
    pub max_inflight_wait: String,
}

/// One route binding a public prefix to an upstream origin.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct RouteConfig {
    /// Label used in metrics and logs. Falls back to the public prefix.
    pub name: String,

    /// Public path prefix this route is exposed at. Empty means "/".
    pub public_prefix: String,

    /// Upstream origin, e.g. "https://registry-1.docker.io" or
    /// "registry-1.docker.io" (scheme defaults to https).
    pub upstream: String,

    /// Forward the client's Host header instead of the upstream host.
    pub preserve_host: bool,
}

impl Default for RouteConfig {
    fn default() -> Self {
        Self {
            name: String::new(),
            public_prefix: "/".to_string(),
            upstream: String::new(),
            preserve_host: false,
        }
    }
}

/// Default listen address.
pub const DEFAULT_LISTEN: &str = "127.0.0.1:5000";

/// Built-in configuration mirroring the Docker registry split across the
/// registry, auth, and blob origins. Emitted by `--print-default-config`.
pub fn default_config() -> MirrorConfig {
    MirrorConfig {
        listen: DEFAULT_LISTEN.to_string(),
        public_base_url: String::new(),
        access_log: true,
        tls: None,
        timeouts: TimeoutConfig::default(),
        transport: TransportConfig::default(),
        limits: LimitsConfig::default(),
        routes: vec![
            RouteConfig {
                name: "docker-registry".to_string(),
                public_prefix: "/".to_string(),
                upstream: "https://registry-1.docker.io".to_string(),
                preserve_host: false,
            },
            RouteConfig {
                name: "docker-auth".to_string(),
                public_prefix: "/_auth".to_string(),
                upstream: "https://auth.docker.io".to_string(),
                preserve_host: false,
            },
            RouteConfig {
                name: "docker-blob".to_string(),
                public_prefix: "/_blob".to_string(),
                upstream: "https://production.cloudflare.docker.com".to_string(),
                preserve_host: false,
            },
        ],
    }
}

impl MirrorConfig {
    /// Listen address with the default applied.
    pub fn listen_or_default(&self) -> &str {
        if self.listen.is_empty() {
            DEFAULT_LISTEN
        } else {
            &self.listen
        }
    }
}

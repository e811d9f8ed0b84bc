//! Configuration validation logic.
//!
//! Separates syntactic concerns (serde, in `schema`) from semantic checks.
//! The output is the typed [`RuntimeConfig`] consumed by the proxy builder;
//! it is immutable once built and replaced wholesale on reload.

use std::collections::HashSet;
use std::path::PathBuf;
use std::time::Duration;

use url::Url;

use crate::config::schema::MirrorConfig;
use crate::rewrite::PublicBase;
use crate::routing::Route;

/// Error type for configuration validation failures.
#[derive(Debug, Clone, PartialEq)]
pub struct ValidationError(pub String);

impl std::fmt::Display for ValidationError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Validated runtime configuration. Listen address, server timeouts, and
/// listener TLS are immutable for the process lifetime; everything else is
/// replaced atomically on reload.
#[derive(Debug, Clone)]
pub struct RuntimeConfig {
    pub listen: String,
    pub public_base: Option<PublicBase>,
    pub access_log: bool,
    pub tls: Option<TlsSettings>,
    pub timeouts: ServerTimeouts,
    pub transport: TransportSettings,
    pub limits: Limits,
    pub routes: Vec<Route>,
}

#[derive(Debug, Clone)]
pub struct TlsSettings {
    pub cert_file: PathBuf,
    pub key_file: PathBuf,
}

#[derive(Debug, Clone, Copy)]
pub struct ServerTimeouts {
    pub read_header: Duration,
    pub read: Duration,
    pub write: Duration,
    pub idle: Duration,
    pub shutdown: Duration,
    pub max_header_bytes: usize,
}

#[derive(Debug, Clone, Copy)]
pub struct TransportSettings {
    pub first_fragment_len: u8,
    pub dial_timeout: Duration,
    pub keepalive: Duration,
    pub max_idle_conns: usize,
    pub max_idle_conns_per_host: usize,
    pub max_conns_per_host: usize,
    pub idle_conn_timeout: Duration,
    pub tls_handshake_timeout: Duration,
    pub response_header_timeout: Duration,
    pub expect_continue_timeout: Duration,
    pub force_http2: bool,
    pub disable_compression: bool,
}

#[derive(Debug, Clone, Copy)]
pub struct Limits {
    pub max_inflight: usize,
    pub max_inflight_wait: Duration,
}

const DEFAULT_MAX_IDLE_CONNS: usize = 256;
const DEFAULT_MAX_IDLE_CONNS_PER_HOST: usize = 64;
const DEFAULT_MAX_HEADER_BYTES: usize = 1 << 20;

/// Validate a parsed configuration and produce its runtime form.
///
/// All failures are collected so a broken config reports every problem in
/// one pass rather than one per reload attempt.
pub fn build_runtime(cfg: &MirrorConfig) -> Result<RuntimeConfig, Vec<ValidationError>> {
    let mut errors = Vec::new();

    let public_base = match parse_public_base(&cfg.public_base_url) {
        Ok(pb) => pb,
        Err(e) => {
            errors.push(ValidationError(format!("public_base_url: {e}")));
            None
        }
    };

    let timeouts = ServerTimeouts {
        read_header: dur(&mut errors, "timeouts.read_header", &cfg.timeouts.read_header, Duration::from_secs(10)),
        read: dur(&mut errors, "timeouts.read", &cfg.timeouts.read, Duration::ZERO),
        write: dur(&mut errors, "timeouts.write", &cfg.timeouts.write, Duration::ZERO),
        idle: dur(&mut errors, "timeouts.idle", &cfg.timeouts.idle, Duration::from_secs(60)),
        shutdown: dur(&mut errors, "timeouts.shutdown", &cfg.timeouts.shutdown, Duration::from_secs(5)),
        max_header_bytes: if cfg.timeouts.max_header_bytes == 0 {
            DEFAULT_MAX_HEADER_BYTES
        } else {
            cfg.timeouts.max_header_bytes
        },
    };

    let t = &cfg.transport;
    let transport = TransportSettings {
        first_fragment_len: t.first_fragment_len,
        dial_timeout: dur(&mut errors, "transport.dial_timeout", &t.dial_timeout, Duration::from_secs(10)),
        keepalive: dur(&mut errors, "transport.keepalive", &t.keepalive, Duration::from_secs(30)),
        max_idle_conns: if t.max_idle_conns == 0 {
            DEFAULT_MAX_IDLE_CONNS
        } else {
            t.max_idle_conns
        },
        max_idle_conns_per_host: if t.max_idle_conns_per_host == 0 {
            DEFAULT_MAX_IDLE_CONNS_PER_HOST
        } else {
            t.max_idle_conns_per_host
        },
        max_conns_per_host: t.max_conns_per_host,
        idle_conn_timeout: dur(&mut errors, "transport.idle_conn_timeout", &t.idle_conn_timeout, Duration::from_secs(90)),
        tls_handshake_timeout: dur(&mut errors, "transport.tls_handshake_timeout", &t.tls_handshake_timeout, Duration::from_secs(10)),
        response_header_timeout: dur(&mut errors, "transport.response_header_timeout", &t.response_header_timeout, Duration::from_secs(30)),
        expect_continue_timeout: dur(&mut errors, "transport.expect_continue_timeout", &t.expect_continue_timeout, Duration::from_secs(1)),
        force_http2: t.force_http2,
        disable_compression: t.disable_compression,
    };

    let limits = Limits {
        max_inflight: cfg.limits.max_inflight,
        max_inflight_wait: dur(&mut errors, "limits.max_inflight_wait", &cfg.limits.max_inflight_wait, Duration::ZERO),
    };

    let tls = cfg.tls.as_ref().map(|t| TlsSettings {
        cert_file: PathBuf::from(&t.cert_file),
        key_file: PathBuf::from(&t.key_file),
    });
    if let Some(t) = &cfg.tls {
        if t.cert_file.is_empty() || t.key_file.is_empty() {
            errors.push(ValidationError(
                "tls.cert_file and tls.key_file must both be set".to_string(),
            ));
        }
    }

    let routes = build_routes(cfg, &mut errors);

    if errors.is_empty() {
        Ok(RuntimeConfig {
            listen: cfg.listen_or_default().to_string(),
            public_base,
            access_log: cfg.access_log,
            tls,
            timeouts,
            transport,
            limits,
            routes,
        })
    } else {
        Err(errors)
    }
}

fn build_routes(cfg: &MirrorConfig, errors: &mut Vec<ValidationError>) -> Vec<Route> {
    if cfg.routes.is_empty() {
        errors.push(ValidationError("routes must not be empty".to_string()));
        return Vec::new();
    }
    let mut seen: HashSet<String> = HashSet::new();
    let mut routes = Vec::with_capacity(cfg.routes.len());
    for (i, rc) in cfg.routes.iter().enumerate() {
        match Route::new(rc) {
            Ok(route) => {
                if !seen.insert(route.public_prefix.clone()) {
                    errors.push(ValidationError(format!(
                        "routes[{i}].public_prefix duplicates another route"
                    )));
                }
                routes.push(route);
            }
            Err(e) => errors.push(ValidationError(format!("routes[{i}]: {e}"))),
        }
    }
    routes
}

fn parse_public_base(raw: &str) -> Result<Option<PublicBase>, String> {
    let raw = raw.trim();
    if raw.is_empty() {
        return Ok(None);
    }
    let url = Url::parse(raw).map_err(|e| e.to_string())?;
    if url.host_str().is_none() {
        return Err("must include scheme and host".to_string());
    }
    if url.path() != "" && url.path() != "/" {
        return Err("must not include a path".to_string());
    }
    if url.query().is_some() || url.fragment().is_some() {
        return Err("must not include a query or fragment".to_string());
    }
    Ok(Some(PublicBase {
        scheme: url.scheme().to_string(),
        host: host_with_port(&url),
    }))
}

/// Host component including any explicit port, as it appears on the wire.
pub(crate) fn host_with_port(url: &Url) -> String {
    match (url.host_str(), url.port()) {
        (Some(host), Some(port)) => format!("{host}:{port}"),
        (Some(host), None) => host.to_string(),
        (None, _) => String::new(),
    }
}

fn dur(errors: &mut Vec<ValidationError>, field: &str, raw: &str, fallback: Duration) -> Duration {
    match parse_duration(raw, fallback) {
        Ok(d) => d,
        Err(e) => {
            errors.push(ValidationError(format!("{field}: {e}")));
            fallback
        }
    }
}

/// Parse a Go-style duration string ("300ms", "1.5s", "2m30s", "1h").
/// An empty string yields the fallback.
pub fn parse_duration(raw: &str, fallback: Duration) -> Result<Duration, String> {
    let s = raw.trim();
    if s.is_empty() {
        return Ok(fallback);
    }
    if s == "0" {
        return Ok(Duration::ZERO);
    }
    let mut total = Duration::ZERO;
    let mut rest = s;
    while !rest.is_empty() {
        let digits_end = rest
            .find(|c: char| !c.is_ascii_digit() && c != '.')
            .ok_or_else(|| format!("missing unit in duration {raw:?}"))?;
        if digits_end == 0 {
            return Err(format!("invalid duration {raw:?}"));
        }
        let value: f64 = rest[..digits_end]
            .parse()
            .map_err(|_| format!("invalid duration {raw:?}"))?;
        rest = &rest[digits_end..];
        let (unit_len, scale) = match rest.as_bytes() {
            [b'n', b's', ..] => (2, 1e-9),
            [b'u', b's', ..] => (2, 1e-6),
            [b'm', b's', ..] => (2, 1e-3),
            [b'm', ..] => (1, 60.0),
            [b's', ..] => (1, 1.0),
            [b'h', ..] => (1, 3600.0),
            _ => return Err(format!("unknown unit in duration {raw:?}")),
        };
        rest = &rest[unit_len..];
        total += Duration::from_secs_f64(value * scale);
    }
    Ok(total)
}

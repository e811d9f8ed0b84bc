//! Route model and path rewriting.
//!
//! A route binds a normalized public path prefix to an upstream origin.
//! All path arithmetic lives here so the table and the rewriter share one
//! set of rules:
//! - `public_prefix` is `/` or starts with `/` and has no trailing slash
//! - `base_path` is `/` or starts with `/` and has no trailing slash
//! - joining collapses exactly one separator

use thiserror::Error;
use url::Url;

use crate::config::schema::RouteConfig;
use crate::config::validation::host_with_port;

#[derive(Debug, Error)]
pub enum RouteError {
    #[error("upstream must not be empty")]
    EmptyUpstream,

    #[error("upstream: {0}")]
    InvalidUpstream(String),

    #[error("upstream scheme must be http or https")]
    BadScheme,

    #[error("upstream must include host")]
    MissingHost,
}

/// Upstream origin a route forwards to.
#[derive(Debug, Clone)]
pub struct Upstream {
    /// "http" or "https".
    pub scheme: String,

    /// Host with any explicit port, as sent on the wire.
    pub host: String,

    /// Normalized base path prepended to every forwarded request.
    pub base_path: String,
}

/// One compiled route.
#[derive(Debug, Clone)]
pub struct Route {
    pub name: String,
    pub public_prefix: String,
    pub public_prefix_slash: String,
    pub upstream: Upstream,
    pub preserve_host: bool,
}

impl Route {
    pub fn new(cfg: &RouteConfig) -> Result<Self, RouteError> {
        let prefix = normalize_path(&cfg.public_prefix);
        let upstream = parse_upstream(&cfg.upstream)?;
        let public_prefix_slash = if prefix == "/" {
            "/".to_string()
        } else {
            format!("{prefix}/")
        };
        Ok(Self {
            name: cfg.name.clone(),
            public_prefix: prefix,
            public_prefix_slash,
            upstream,
            preserve_host: cfg.preserve_host,
        })
    }

    /// A route with prefix `/` matches any path; otherwise the path must
    /// equal the prefix or continue it at a slash boundary.
    pub fn matches_path(&self, path: &str) -> bool {
        if self.public_prefix == "/" {
            return true;
        }
        path == self.public_prefix || path.starts_with(&self.public_prefix_slash)
    }

    /// Suffix of `path` after the public prefix, always starting with `/`.
    pub fn strip_prefix<'a>(&self, path: &'a str) -> String {
        if self.public_prefix == "/" {
            if path.is_empty() {
                return "/".to_string();
            }
            return path.to_string();
        }
        let trimmed = path.strip_prefix(&self.public_prefix).unwrap_or(path);
        if trimmed.is_empty() {
            "/".to_string()
        } else if trimmed.starts_with('/') {
            trimmed.to_string()
        } else {
            format!("/{trimmed}")
        }
    }

    /// Forward direction: public suffix onto the upstream base path.
    pub fn join_upstream_path(&self, path: &str) -> String {
        join_paths(&self.upstream.base_path, path)
    }

    /// Reverse direction: upstream path back onto the public prefix.
    pub fn map_upstream_path(&self, upstream_path: &str) -> String {
        let mut p = upstream_path;
        if self.upstream.base_path != "/" && has_path_prefix(p, &self.upstream.base_path) {
            p = if p == self.upstream.base_path {
                "/"
            } else {
                let stripped = p.strip_prefix(self.upstream.base_path.as_str()).unwrap_or("");
                if stripped.is_empty() {
                    "/"
                } else {
                    stripped
                }
            };
        }
        join_paths(&self.public_prefix, p)
    }

    /// Label used for the `route` metric dimension.
    pub fn metric_label(&self) -> &str {
        if !self.name.is_empty() {
            &self.name
        } else if self.public_prefix.is_empty() {
            "/"
        } else {
            &self.public_prefix
        }
    }

    /// Upstream origin URL including the base path, for liveness probes.
    pub fn upstream_url(&self) -> String {
        format!(
            "{}://{}{}",
            self.upstream.scheme, self.upstream.host, self.upstream.base_path
        )
    }
}

/// Normalize a configured path: leading slash, dot segments resolved,
/// no trailing slash except for the root.
pub fn normalize_path(raw: &str) -> String {
    if raw.is_empty() {
        return "/".to_string();
    }
    let mut segments: Vec<&str> = Vec::new();
    for seg in raw.split('/') {
        match seg {
            "" | "." => {}
            ".." => {
                segments.pop();
            }
            other => segments.push(other),
        }
    }
    if segments.is_empty() {
        "/".to_string()
    } else {
        format!("/{}", segments.join("/"))
    }
}

/// Concatenate two path pieces, collapsing exactly one separator.
pub fn join_paths(a: &str, b: &str) -> String {
    let a_slash = a.ends_with('/');
    let b_slash = b.starts_with('/');
    match (a_slash, b_slash) {
        (true, true) => format!("{a}{}", &b[1..]),
        (false, false) => format!("{a}/{b}"),
        _ => format!("{a}{b}"),
    }
}

/// Prefix check at slash boundaries; `/` means "any".
pub fn has_path_prefix(path: &str, prefix: &str) -> bool {
    if prefix == "/" {
        return true;
    }
    if path == prefix {
        return true;
    }
    path.starts_with(&format!("{prefix}/"))
}

fn parse_upstream(raw: &str) -> Result<Upstream, RouteError> {
    let candidate = raw.trim();
    if candidate.is_empty() {
        return Err(RouteError::EmptyUpstream);
    }
    let candidate = if candidate.contains("://") {
        candidate.to_string()
    } else {
        format!("https://{candidate}")
    };
    let url = Url::parse(&candidate).map_err(|e| RouteError::InvalidUpstream(e.to_string()))?;
    if url.scheme() != "http" && url.scheme() != "https" {
        return Err(RouteError::BadScheme);
    }
    let host = host_with_port(&url);
    if host.is_empty() {
        return Err(RouteError::MissingHost);
    }
    Ok(Upstream {
        scheme: url.scheme().to_string(),
        host,
        base_path: normalize_path(url.path()),
    })
}

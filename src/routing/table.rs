//! Route lookup in both directions.
//!
//! # Responsibilities
//! - Hold compiled routes in longest-public-prefix order (forward match)
//! - Hold a second ordering by longest upstream base path (reverse match)
//! - Return matched route or explicit no-match
//!
//! # Design Decisions
//! - Immutable after construction (thread-safe without locks)
//! - O(n) linear scan; route counts are small and the scan is cache-friendly
//! - Both sorts are stable so configured order breaks length ties

use std::sync::Arc;

use url::Url;

use crate::routing::route::{has_path_prefix, Route};

/// Immutable, pre-sorted collection of routes.
#[derive(Debug)]
pub struct RouteTable {
    /// Descending by public prefix length; longest prefix wins.
    by_public: Vec<Arc<Route>>,

    /// Descending by upstream base path length, for reverse matching of
    /// absolute upstream URLs found in response headers.
    by_upstream: Vec<Arc<Route>>,
}

impl RouteTable {
    pub fn new(routes: &[Route]) -> Self {
        let routes: Vec<Arc<Route>> = routes.iter().cloned().map(Arc::new).collect();

        let mut by_public = routes.clone();
        by_public.sort_by(|a, b| b.public_prefix.len().cmp(&a.public_prefix.len()));

        let mut by_upstream = routes;
        by_upstream.sort_by(|a, b| {
            b.upstream
                .base_path
                .len()
                .cmp(&a.upstream.base_path.len())
        });

        Self {
            by_public,
            by_upstream,
        }
    }

    /// Longest-prefix match of a request path against the public prefixes.
    pub fn match_path(&self, path: &str) -> Option<Arc<Route>> {
        self.by_public
            .iter()
            .find(|r| r.matches_path(path))
            .cloned()
    }

    /// Reverse match of an absolute upstream URL: hosts equal
    /// case-insensitively, schemes equal when both known, and the URL path
    /// extends the route's base path at a slash boundary.
    pub fn match_upstream_url(&self, url: &Url) -> Option<Arc<Route>> {
        let host = match (url.host_str(), url.port()) {
            (Some(h), Some(p)) => format!("{h}:{p}"),
            (Some(h), None) => h.to_string(),
            (None, _) => return None,
        };
        self.by_upstream
            .iter()
            .find(|r| {
                if !r.upstream.host.eq_ignore_ascii_case(&host) {
                    return false;
                }
                if r.upstream.base_path != "/" && !has_path_prefix(url.path(), &r.upstream.base_path)
                {
                    return false;
                }
                r.upstream.scheme.eq_ignore_ascii_case(url.scheme())
                    || r.upstream.scheme.is_empty()
                    || url.scheme().is_empty()
            })
            .cloned()
    }

    pub fn len(&self) -> usize {
        self.by_public.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_public.is_empty()
    }
}

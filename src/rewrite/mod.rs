//! Response URL rewriting.
//!
//! Upstream registries answer with absolute URLs pointing at themselves or
//! at sibling origins (blob CDNs, token services). For the proxy to stay in
//! the path, every such URL that maps onto a configured route is rewritten
//! to the public origin. Two headers carry them:
//!
//! - `Location`: a single absolute URL.
//! - `WWW-Authenticate`: challenge syntax with one or more `realm=` tokens,
//!   quoted or bare, that carry the token-service URL.
//!
//! URLs whose host/path do not map onto any route pass through verbatim.

use axum::http::header::{HeaderValue, LOCATION, WWW_AUTHENTICATE};
use axum::http::HeaderMap;
use url::Url;

use crate::routing::RouteTable;

/// Scheme + host pair used to build public URLs during response rewriting.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PublicBase {
    pub scheme: String,
    pub host: String,
}

/// Rewrite one absolute URL into the public origin if it reverse-matches a
/// configured route. Returns `None` when the URL is not absolute, matches no
/// route, or cannot be reassembled.
pub fn rewrite_url(table: &RouteTable, raw: &str, public_base: &PublicBase) -> Option<String> {
    if public_base.scheme.is_empty() || public_base.host.is_empty() {
        return None;
    }
    let url = Url::parse(raw).ok()?;
    if url.host_str().is_none() {
        return None;
    }
    let route = table.match_upstream_url(&url)?;
    let mapped = route.map_upstream_path(url.path());

    let mut out = format!("{}://{}{}", public_base.scheme, public_base.host, mapped);
    if let Some(query) = url.query() {
        out.push('?');
        out.push_str(query);
    }
    if let Some(fragment) = url.fragment() {
        out.push('#');
        out.push_str(fragment);
    }
    Some(out)
}

/// Apply the `Location` and `WWW-Authenticate` rewrites to a response
/// header map in place.
pub fn rewrite_response_headers(table: &RouteTable, headers: &mut HeaderMap, public_base: &PublicBase) {
    if let Some(loc) = headers.get(LOCATION).and_then(|v| v.to_str().ok()) {
        if let Some(rewritten) = rewrite_url(table, loc, public_base) {
            if let Ok(value) = HeaderValue::from_str(&rewritten) {
                headers.insert(LOCATION, value);
            }
        }
    }

    let values: Vec<String> = headers
        .get_all(WWW_AUTHENTICATE)
        .iter()
        .filter_map(|v| v.to_str().ok().map(str::to_string))
        .collect();
    if values.is_empty() {
        return;
    }
    let mut changed = false;
    let mut rewritten_values = Vec::with_capacity(values.len());
    for value in &values {
        match rewrite_auth_header(table, value, public_base) {
            Some(updated) => {
                changed = true;
                rewritten_values.push(updated);
            }
            None => rewritten_values.push(value.clone()),
        }
    }
    if changed {
        headers.remove(WWW_AUTHENTICATE);
        for value in rewritten_values {
            if let Ok(value) = HeaderValue::from_str(&value) {
                headers.append(WWW_AUTHENTICATE, value);
            }
        }
    }
}

/// Scan one `WWW-Authenticate` value for `realm=` tokens (case-insensitive)
/// and rewrite the URL inside each. Quoted realms stay quoted; bare realms
/// run to the next comma and are emitted without quoting. Untouched bytes
/// pass through verbatim. Returns `None` when nothing changed.
pub fn rewrite_auth_header(table: &RouteTable, value: &str, public_base: &PublicBase) -> Option<String> {
    const NEEDLE: &str = "realm=";
    let lower = value.to_ascii_lowercase();
    let mut out = String::with_capacity(value.len());
    let mut idx = 0;
    let mut changed = false;

    while let Some(pos) = lower[idx..].find(NEEDLE) {
        let pos = idx + pos;
        out.push_str(&value[idx..pos + NEEDLE.len()]);
        let start = pos + NEEDLE.len();
        if start >= value.len() {
            idx = start;
            break;
        }
        if value.as_bytes()[start] == b'"' {
            let Some(end) = value[start + 1..].find('"') else {
                idx = start;
                break;
            };
            let end = start + 1 + end;
            let realm = &value[start + 1..end];
            match rewrite_url(table, realm, public_base) {
                Some(rewritten) => {
                    out.push('"');
                    out.push_str(&rewritten);
                    out.push('"');
                    changed = true;
                }
                None => out.push_str(&value[start..=end]),
            }
            idx = end + 1;
        } else {
            let end = value[start..]
                .find(',')
                .map(|i| start + i)
                .unwrap_or(value.len());
            let realm = value[start..end].trim();
            match rewrite_url(table, realm, public_base) {
                Some(rewritten) => {
                    out.push_str(&rewritten);
                    changed = true;
                }
                None => out.push_str(&value[start..end]),
            }
            idx = end;
        }
    }
    out.push_str(&value[idx..]);
    changed.then_some(out)
}

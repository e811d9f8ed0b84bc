//! Upstream name resolution.
//!
//! Resolution goes through hickory with a DoH-capable upstream so lookups
//! succeed on networks that tamper with plain UDP DNS. IP literals skip the
//! resolver. When the one-shot process-wide probe concludes IPv6 is
//! unusable, AAAA results are filtered out before dialing.

use std::net::IpAddr;
use std::sync::OnceLock;

use hickory_resolver::config::ResolverConfig;
use hickory_resolver::name_server::TokioConnectionProvider;
use hickory_resolver::Resolver;

use crate::transport::DialError;

pub struct UpstreamResolver {
    inner: Resolver<TokioConnectionProvider>,
}

impl UpstreamResolver {
    pub fn new() -> Self {
        let inner = Resolver::builder_with_config(
            ResolverConfig::cloudflare_https(),
            TokioConnectionProvider::default(),
        )
        .build();
        Self { inner }
    }

    /// Resolve `host` into dialable addresses, IPv4-only when the probe
    /// has concluded IPv6 is unavailable.
    pub async fn resolve(&self, host: &str) -> Result<Vec<IpAddr>, DialError> {
        if let Ok(ip) = host.parse::<IpAddr>() {
            return Ok(vec![ip]);
        }
        let lookup = self.inner.lookup_ip(host).await.map_err(|e| DialError::Resolve {
            host: host.to_string(),
            source: Box::new(e),
        })?;
        let mut addrs: Vec<IpAddr> = lookup.iter().collect();
        if !ipv6_available() {
            addrs.retain(IpAddr::is_ipv4);
        }
        if addrs.is_empty() {
            return Err(DialError::NoAddresses {
                host: host.to_string(),
            });
        }
        Ok(addrs)
    }
}

impl Default for UpstreamResolver {
    fn default() -> Self {
        Self::new()
    }
}

static IPV6_AVAILABLE: OnceLock<bool> = OnceLock::new();

/// Process-wide IPv6 availability, computed at most once on first use.
pub fn ipv6_available() -> bool {
    *IPV6_AVAILABLE.get_or_init(probe_ipv6)
}

fn probe_ipv6() -> bool {
    match std::fs::read_to_string("/proc/net/ipv6_route") {
        // Unreadable routing state: assume IPv6 works.
        Err(_) => true,
        Ok(table) => has_ipv6_default_route(&table) && has_global_ipv6(),
    }
}

/// A default route is a line whose destination is all zeroes with prefix
/// length 00 on an interface other than loopback.
fn has_ipv6_default_route(table: &str) -> bool {
    const ZERO_DEST: &str = "00000000000000000000000000000000";
    for line in table.lines() {
        let fields: Vec<&str> = line.split_whitespace().collect();
        if fields.len() < 10 {
            continue;
        }
        if fields[0] == ZERO_DEST && fields[1] == "00" && fields[9] != "lo" {
            return true;
        }
    }
    false
}

/// Whether a globally-routable IPv6 source address exists. Connecting a UDP
/// socket performs route selection without sending packets; it fails when no
/// non-loopback global address is usable.
fn has_global_ipv6() -> bool {
    std::net::UdpSocket::bind("[::]:0")
        .and_then(|s| s.connect("[2001:4860:4860::8888]:53"))
        .is_ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_route_detected() {
        let table = "00000000000000000000000000000000 00 00000000000000000000000000000000 00 fe800000000000000000000000000001 00000400 00000001 00000000 00000003 eth0";
        assert!(has_ipv6_default_route(table));
    }

    #[test]
    fn loopback_default_route_ignored() {
        let table = "00000000000000000000000000000000 00 00000000000000000000000000000000 00 00000000000000000000000000000000 00000400 00000001 00000000 00000003 lo";
        assert!(!has_ipv6_default_route(table));
    }

    #[test]
    fn non_default_routes_ignored() {
        let table = "fe800000000000000000000000000000 40 00000000000000000000000000000000 00 00000000000000000000000000000000 00000100 00000001 00000000 00000001 eth0";
        assert!(!has_ipv6_default_route(table));
    }

    #[test]
    fn short_lines_skipped() {
        assert!(!has_ipv6_default_route("garbage\n00000000000000000000000000000000 00"));
    }

    #[tokio::test]
    async fn ip_literal_skips_resolution() {
        let resolver = UpstreamResolver::new();
        let addrs = resolver.resolve("127.0.0.1").await.unwrap();
        assert_eq!(addrs, vec!["127.0.0.1".parse::<IpAddr>().unwrap()]);
    }
}

//! Client IP resolution.
//!
//! The socket peer comes from Axum's `ConnectInfo<SocketAddr>` extension
//! (the server is started with `into_make_service_with_connect_info`).
//! Forwarding headers are honoured only when that peer is a trusted proxy:
//!
//! ```text
//!   TRUSTED_PROXIES empty        → X-Forwarded-For / X-Real-IP, else peer
//!   peer inside a trusted range  → X-Forwarded-For / X-Real-IP, else peer
//!   peer outside every range     → peer (headers ignored)
//! ```
//!
//! With no trusted proxies configured any client can spoof its address via
//! the headers, so per-IP throttling is only as strong as the edge proxy in
//! front of the gateway.

use std::net::{IpAddr, SocketAddr};

use axum::extract::ConnectInfo;
use axum::http::{Extensions, HeaderMap};
use tracing::{debug, warn};

/// Throttling key shared by requests whose address cannot be determined.
pub const UNKNOWN_IP: &str = "unknown";

/// Resolved client address, inserted into request extensions by the
/// authentication middleware for the audit trail.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ClientIp(pub Option<String>);

impl ClientIp {
    /// The address, or [`UNKNOWN_IP`].
    pub fn as_key(&self) -> &str {
        self.0.as_deref().unwrap_or(UNKNOWN_IP)
    }
}

// =============================================================================
// Trusted Proxy CIDR Matching
// =============================================================================

/// Parsed CIDR network range.
#[derive(Debug, Clone)]
pub struct CidrRange {
    network: IpAddr,
    prefix_len: u8,
}

impl CidrRange {
    /// Parse CIDR notation (`10.0.0.0/8`, `::1/128`) or a bare address.
    ///
    /// Returns `None` if the format is invalid.
    pub fn parse(cidr: &str) -> Option<Self> {
        let parts: Vec<&str> = cidr.trim().split('/').collect();

        if parts.len() != 2 {
            let ip = parts.first()?.parse::<IpAddr>().ok()?;
            return Some(Self {
                network: ip,
                prefix_len: max_prefix(&ip),
            });
        }

        let ip: IpAddr = parts.first()?.parse().ok()?;
        let prefix_len: u8 = parts.get(1)?.parse().ok()?;

        if prefix_len > max_prefix(&ip) {
            return None;
        }

        Some(Self {
            network: ip,
            prefix_len,
        })
    }

    pub fn contains(&self, ip: &IpAddr) -> bool {
        match (&self.network, ip) {
            (IpAddr::V4(net), IpAddr::V4(addr)) => {
                let mask = if self.prefix_len == 0 {
                    0
                } else {
                    u32::MAX << (32 - self.prefix_len)
                };
                (u32::from(*net) & mask) == (u32::from(*addr) & mask)
            }
            (IpAddr::V6(net), IpAddr::V6(addr)) => {
                let mask = if self.prefix_len == 0 {
                    0
                } else {
                    u128::MAX << (128 - self.prefix_len)
                };
                (u128::from(*net) & mask) == (u128::from(*addr) & mask)
            }
            _ => false,
        }
    }
}

fn max_prefix(ip: &IpAddr) -> u8 {
    match ip {
        IpAddr::V4(_) => 32,
        IpAddr::V6(_) => 128,
    }
}

/// Proxies whose forwarding headers are believed.
#[derive(Debug, Clone, Default)]
pub struct TrustedProxyConfig {
    ranges: Vec<CidrRange>,
}

impl TrustedProxyConfig {
    /// Invalid CIDR strings are logged and skipped.
    pub fn new(cidrs: &[String]) -> Self {
        let ranges: Vec<CidrRange> = cidrs
            .iter()
            .filter_map(|cidr| {
                let parsed = CidrRange::parse(cidr);
                if parsed.is_none() {
                    warn!(cidr = %cidr, "Invalid CIDR range in TRUSTED_PROXIES, skipping");
                }
                parsed
            })
            .collect();

        if !ranges.is_empty() {
            debug!(count = ranges.len(), "Trusted proxy validation enabled");
        }

        Self { ranges }
    }

    pub fn is_enabled(&self) -> bool {
        !self.ranges.is_empty()
    }

    /// `true` if `ip` is inside a configured range, or if none are configured.
    pub fn is_trusted(&self, ip: &IpAddr) -> bool {
        self.ranges.is_empty() || self.ranges.iter().any(|range| range.contains(ip))
    }
}

// =============================================================================
// Extraction
// =============================================================================

/// First address in `X-Forwarded-For`, else `X-Real-IP`.
fn forwarded_ip(headers: &HeaderMap) -> Option<&str> {
    if let Some(forwarded) = headers.get("x-forwarded-for")
        && let Ok(value) = forwarded.to_str()
        && let Some(first_ip) = value.split(',').next()
        && !first_ip.trim().is_empty()
    {
        return Some(first_ip.trim());
    }

    headers
        .get("x-real-ip")
        .and_then(|value| value.to_str().ok())
        .map(str::trim)
        .filter(|value| !value.is_empty())
}

/// Socket peer from `ConnectInfo`, when the server recorded one.
pub fn peer_ip(extensions: &Extensions) -> Option<IpAddr> {
    extensions
        .get::<ConnectInfo<SocketAddr>>()
        .map(|ConnectInfo(addr)| addr.ip())
}

/// Resolve the caller's address from the socket peer and forwarding headers.
pub fn client_ip(
    headers: &HeaderMap,
    extensions: &Extensions,
    trusted_proxies: &TrustedProxyConfig,
) -> ClientIp {
    let ip = match peer_ip(extensions) {
        Some(peer) if trusted_proxies.is_trusted(&peer) => forwarded_ip(headers)
            .map(str::to_string)
            .or_else(|| Some(peer.to_string())),
        Some(peer) => {
            if forwarded_ip(headers).is_some() {
                debug!(peer = %peer, "Ignoring forwarding headers from untrusted peer");
            }
            Some(peer.to_string())
        }
        // No socket info (in-process callers): headers are all there is,
        // unless proxy validation demands a peer to check against.
        None if !trusted_proxies.is_enabled() => forwarded_ip(headers).map(str::to_string),
        None => None,
    };

    ClientIp(ip)
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;

    fn headers(pairs: &[(&'static str, &'static str)]) -> HeaderMap {
        let mut map = HeaderMap::new();
        for (name, value) in pairs {
            map.insert(*name, HeaderValue::from_static(value));
        }
        map
    }

    fn with_peer(addr: &str) -> Extensions {
        let mut extensions = Extensions::new();
        extensions.insert(ConnectInfo(addr.parse::<SocketAddr>().unwrap()));
        extensions
    }

    #[test]
    fn test_cidr_parse() {
        assert!(CidrRange::parse("10.0.0.0/8").is_some());
        assert!(CidrRange::parse("::1/128").is_some());
        assert!(CidrRange::parse("192.168.1.1").is_some());
        assert!(CidrRange::parse("not-an-ip").is_none());
        assert!(CidrRange::parse("10.0.0.0/33").is_none());
    }

    #[test]
    fn test_cidr_contains() {
        let cidr = CidrRange::parse("192.168.1.0/24").unwrap();
        assert!(cidr.contains(&"192.168.1.200".parse().unwrap()));
        assert!(!cidr.contains(&"192.168.2.1".parse().unwrap()));
        assert!(!cidr.contains(&"::1".parse().unwrap()));
    }

    #[test]
    fn test_trusted_proxy_config() {
        let empty = TrustedProxyConfig::new(&[]);
        assert!(!empty.is_enabled());
        assert!(empty.is_trusted(&"8.8.8.8".parse().unwrap()));

        let config = TrustedProxyConfig::new(&["10.0.0.0/8".to_string(), "bogus".to_string()]);
        assert!(config.is_enabled());
        assert!(config.is_trusted(&"10.1.2.3".parse().unwrap()));
        assert!(!config.is_trusted(&"8.8.8.8".parse().unwrap()));
    }

    #[test]
    fn test_headers_trusted_without_proxy_config() {
        let ip = client_ip(
            &headers(&[("x-forwarded-for", "203.0.113.50, 70.41.3.18")]),
            &with_peer("10.0.0.2:4000"),
            &TrustedProxyConfig::default(),
        );
        assert_eq!(ip.0.as_deref(), Some("203.0.113.50"));
    }

    #[test]
    fn test_headers_from_trusted_proxy() {
        let trusted = TrustedProxyConfig::new(&["10.0.0.0/8".to_string()]);
        let ip = client_ip(
            &headers(&[("x-real-ip", "198.51.100.7")]),
            &with_peer("10.0.0.2:4000"),
            &trusted,
        );
        assert_eq!(ip.0.as_deref(), Some("198.51.100.7"));
    }

    #[test]
    fn test_headers_ignored_from_untrusted_peer() {
        let trusted = TrustedProxyConfig::new(&["10.0.0.0/8".to_string()]);
        let ip = client_ip(
            &headers(&[("x-forwarded-for", "1.2.3.4")]),
            &with_peer("203.0.113.9:5000"),
            &trusted,
        );
        assert_eq!(ip.0.as_deref(), Some("203.0.113.9"));
    }

    #[test]
    fn test_peer_used_without_headers() {
        let ip = client_ip(
            &HeaderMap::new(),
            &with_peer("127.0.0.1:6000"),
            &TrustedProxyConfig::default(),
        );
        assert_eq!(ip.0.as_deref(), Some("127.0.0.1"));
    }

    #[test]
    fn test_unknown_without_peer_or_headers() {
        let ip = client_ip(&HeaderMap::new(), &Extensions::new(), &TrustedProxyConfig::default());
        assert_eq!(ip.0, None);
        assert_eq!(ip.as_key(), UNKNOWN_IP);
    }

    #[test]
    fn test_empty_forwarded_header_falls_back() {
        let ip = client_ip(
            &headers(&[("x-forwarded-for", "  "), ("x-real-ip", "192.0.2.1")]),
            &Extensions::new(),
            &TrustedProxyConfig::default(),
        );
        assert_eq!(ip.0.as_deref(), Some("192.0.2.1"));
    }
}

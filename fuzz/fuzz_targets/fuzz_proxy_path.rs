//! Fuzz testing for proxy path handling.
//!
//! Feeds arbitrary request paths, base URLs, query strings and header values
//! through the pieces of the proxy that parse client input, checking that
//! they never panic and that a built upstream URL always stays on the
//! service's scheme and host.
//!
//! # Running the Fuzz Tests
//!
//! ```bash
//! # Install cargo-fuzz (requires nightly)
//! cargo +nightly install cargo-fuzz
//!
//! # Run the proxy path fuzz target
//! cargo +nightly fuzz run fuzz_proxy_path
//!
//! # Run with a time limit (e.g., 60 seconds)
//! cargo +nightly fuzz run fuzz_proxy_path -- -max_total_time=60
//! ```
//!
//! # What This Tests
//!
//! - `proxy_segments`: Splitting `/proxy/...` into routing segments
//! - `build_upstream_url`: Joining a base URL, remaining segments and query
//! - `extract_api_key`: Reading the credential header

#![no_main]

use arbitrary::Arbitrary;
use axum::http::{HeaderMap, HeaderValue};
use libfuzzer_sys::fuzz_target;
use metered_gateway::middleware::extract_api_key;
use metered_gateway::services::forwarder::build_upstream_url;
use metered_gateway::services::router::proxy_segments;

#[derive(Debug, Arbitrary)]
struct ProxyInput<'a> {
    path: &'a str,
    base_url: &'a str,
    query: Option<&'a str>,
    api_key: &'a [u8],
}

fuzz_target!(|input: ProxyInput<'_>| {
    let segments = proxy_segments(input.path);
    assert!(segments.iter().all(|segment| !segment.is_empty() && !segment.contains('/')));

    // Skip the prefix the way the router does for a matched service.
    let remaining = segments.get(1..).unwrap_or_default();

    for base in [input.base_url, "http://upstream.internal/api"] {
        if let Ok(url) = build_upstream_url(base, remaining, input.query) {
            assert!(matches!(url.scheme(), "http" | "https"));
            if base == "http://upstream.internal/api" {
                assert_eq!(url.host_str(), Some("upstream.internal"));
            }
        }
    }

    if let Ok(value) = HeaderValue::from_bytes(input.api_key) {
        let mut headers = HeaderMap::new();
        headers.insert("x-api-key", value);
        if let Some(key) = extract_api_key(&headers) {
            assert!(!key.is_empty());
        }
    }
});

//! Upstream forwarding.
//!
//! ```text
//!   inbound request                         upstream request
//!   ───────────────                         ────────────────
//!   /proxy/{prefix}/a/b?x=1     ──►    {base_url path}/a/b?x=1
//!   X-API-Key                   ──►    (dropped)
//!   Connection, TE, ...         ──►    (dropped, hop-by-hop)
//!   Content-Length              ──►    (recomputed)
//!   Host                        ──►    upstream authority
//!   everything else             ──►    copied
//! ```
//!
//! Bodies are buffered in full in both directions. The upstream call is made
//! exactly once; network failures surface as `UpstreamError` and are never
//! retried.

use std::time::Duration;

use axum::body::Body;
use axum::http::header::{CONTENT_LENGTH, HOST};
use axum::http::request::Parts;
use axum::http::{HeaderMap, HeaderName, HeaderValue, Method, StatusCode};
use bytes::Bytes;
use reqwest::Url;
use tracing::{debug, warn};

use super::router::Route;
use crate::error::{AppError, AppResult};
use crate::metrics;
use crate::middleware::auth::API_KEY_HEADER;
use crate::middleware::timeout::{REQUEST_TIMEOUT_HEADER, RequestTimeoutExt};

/// Connection-scoped headers that must not cross a proxy (RFC 9110 §7.6.1).
pub const HOP_BY_HOP_HEADERS: [&str; 8] = [
    "connection",
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "te",
    "trailer",
    "transfer-encoding",
    "upgrade",
];

/// Upstream URL: base URL path segments, then `remaining`, then the original
/// query string verbatim. Any query on the base URL is replaced.
///
/// # Errors
///
/// `Internal` if the base URL is not an absolute http(s) URL.
pub fn build_upstream_url(
    base_url: &str,
    remaining: &[String],
    query: Option<&str>,
) -> AppResult<Url> {
    let mut url = Url::parse(base_url)
        .map_err(|e| AppError::Internal(format!("invalid service base URL `{base_url}`: {e}")))?;

    if url.cannot_be_a_base() || !matches!(url.scheme(), "http" | "https") {
        return Err(AppError::Internal(format!(
            "service base URL `{base_url}` is not an http(s) URL"
        )));
    }

    let mut segments: Vec<String> = url
        .path()
        .split('/')
        .filter(|segment| !segment.is_empty())
        .map(str::to_string)
        .collect();
    segments.extend(remaining.iter().cloned());

    url.set_path(&format!("/{}", segments.join("/")));
    url.set_query(query);

    Ok(url)
}

/// `host[:port]` as it belongs in a `Host` header.
fn authority(url: &Url) -> Option<String> {
    let host = url.host_str()?;
    Some(match url.port() {
        Some(port) => format!("{host}:{port}"),
        None => host.to_string(),
    })
}

/// Headers to send upstream: inbound headers minus the credential, the
/// gateway's own timeout hint, hop-by-hop headers and `Content-Length`, with
/// `Host` rewritten to the upstream authority.
pub fn outbound_headers(inbound: &HeaderMap, upstream: &Url) -> HeaderMap {
    let mut headers = strip_hop_by_hop(inbound);
    headers.remove(API_KEY_HEADER);
    headers.remove(REQUEST_TIMEOUT_HEADER);

    match authority(upstream).map(HeaderValue::try_from) {
        Some(Ok(value)) => {
            headers.insert(HOST, value);
        }
        _ => {
            headers.remove(HOST);
        }
    }

    headers
}

/// Upstream response headers minus hop-by-hop headers and `Content-Length`.
///
/// A HEAD response has no body to measure, so its upstream `Content-Length`
/// is passed through.
pub fn inbound_response_headers(method: &Method, upstream: &HeaderMap) -> HeaderMap {
    let mut headers = strip_hop_by_hop(upstream);
    let head_length = upstream.get(CONTENT_LENGTH).filter(|_| *method == Method::HEAD);
    if let Some(length) = head_length {
        headers.insert(CONTENT_LENGTH, length.clone());
    }
    headers
}

fn strip_hop_by_hop(source: &HeaderMap) -> HeaderMap {
    // Headers named in `Connection` are connection-scoped too.
    let listed: Vec<HeaderName> = source
        .get_all(axum::http::header::CONNECTION)
        .iter()
        .filter_map(|value| value.to_str().ok())
        .flat_map(|value| value.split(','))
        .filter_map(|name| HeaderName::try_from(name.trim()).ok())
        .collect();

    let mut headers = source.clone();
    for name in HOP_BY_HOP_HEADERS {
        headers.remove(name);
    }
    for name in &listed {
        headers.remove(name);
    }
    headers.remove(CONTENT_LENGTH);
    headers
}

/// Buffer the request body. GET and HEAD are forwarded without one.
///
/// # Errors
///
/// `BadRequest` if the body exceeds `limit` bytes or cannot be read.
pub async fn read_request_body(method: &Method, body: Body, limit: usize) -> AppResult<Bytes> {
    if *method == Method::GET || *method == Method::HEAD {
        return Ok(Bytes::new());
    }

    axum::body::to_bytes(body, limit)
        .await
        .map_err(|e| AppError::BadRequest(format!("failed to read request body: {e}")))
}

/// A fully buffered upstream response.
#[derive(Debug)]
pub struct UpstreamResponse {
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub body: Bytes,
}

/// Sends proxied requests upstream.
#[derive(Clone)]
pub struct Forwarder {
    client: reqwest::Client,
    default_timeout: Duration,
}

impl Forwarder {
    /// Build the shared HTTP client. Redirects are returned to the caller
    /// rather than followed.
    ///
    /// # Errors
    ///
    /// `ConfigError` if the TLS backend cannot be initialised.
    pub fn new(default_timeout: Duration) -> AppResult<Self> {
        let client = reqwest::Client::builder()
            .redirect(reqwest::redirect::Policy::none())
            .connect_timeout(default_timeout.min(Duration::from_secs(10)))
            .build()
            .map_err(|e| AppError::ConfigError(format!("failed to build HTTP client: {e}")))?;

        Ok(Self {
            client,
            default_timeout,
        })
    }

    /// Forward one request to `route`'s service and read the whole response.
    ///
    /// The timeout is the client's `X-Request-Timeout` when present, else the
    /// configured default.
    ///
    /// # Errors
    ///
    /// `UpstreamError` on connect, timeout or body-read failures.
    pub async fn forward(&self, route: &Route, parts: &Parts, body: Bytes) -> AppResult<UpstreamResponse> {
        let service = &route.service;
        let url = build_upstream_url(&service.base_url, &route.remaining, parts.uri.query())?;
        let headers = outbound_headers(&parts.headers, &url);
        let timeout = parts.effective_timeout(self.default_timeout);

        debug!(service = %service.name, url = %url, timeout_ms = timeout.as_millis() as u64, "Proxying request");

        let mut request = self
            .client
            .request(parts.method.clone(), url.clone())
            .headers(headers)
            .timeout(timeout);
        if !body.is_empty() {
            request = request.body(body);
        }

        let upstream_failure = |e: reqwest::Error| {
            metrics::record_upstream_error(&service.name);
            warn!(service = %service.name, url = %url, error = %e, "Upstream request failed");
            AppError::UpstreamError(e.to_string())
        };

        let response = request.send().await.map_err(upstream_failure)?;
        let status = response.status();
        let headers = inbound_response_headers(&parts.method, response.headers());
        let body = response.bytes().await.map_err(upstream_failure)?;

        Ok(UpstreamResponse {
            status,
            headers,
            body,
        })
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    fn remaining(segments: &[&str]) -> Vec<String> {
        segments.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_url_appends_segments_to_base_path() {
        let url = build_upstream_url(
            "https://api.example.com/v2/",
            &remaining(&["forecast", "today"]),
            Some("city=Jakarta&units=metric"),
        )
        .unwrap();

        assert_eq!(
            url.as_str(),
            "https://api.example.com/v2/forecast/today?city=Jakarta&units=metric"
        );
    }

    #[test]
    fn test_url_root_when_no_segments() {
        let url = build_upstream_url("http://upstream:8080", &[], None).unwrap();
        assert_eq!(url.as_str(), "http://upstream:8080/");
    }

    #[test]
    fn test_url_replaces_base_query() {
        let url = build_upstream_url("http://u/api?key=server", &remaining(&["x"]), None).unwrap();
        assert_eq!(url.as_str(), "http://u/api/x");
    }

    #[test]
    fn test_url_keeps_encoded_segments() {
        let url = build_upstream_url("http://u", &remaining(&["a%20b", "c"]), None).unwrap();
        assert_eq!(url.path(), "/a%20b/c");
    }

    #[test]
    fn test_url_rejects_non_http_base() {
        assert!(build_upstream_url("mailto:ops@example.com", &[], None).is_err());
        assert!(build_upstream_url("not a url", &[], None).is_err());
    }

    #[test]
    fn test_outbound_headers_strip_credential_and_hop_by_hop() {
        let mut inbound = HeaderMap::new();
        inbound.insert("x-api-key", HeaderValue::from_static("sk_secret"));
        inbound.insert("connection", HeaderValue::from_static("keep-alive, x-trace-hop"));
        inbound.insert("x-trace-hop", HeaderValue::from_static("1"));
        inbound.insert("keep-alive", HeaderValue::from_static("timeout=5"));
        inbound.insert("content-length", HeaderValue::from_static("12"));
        inbound.insert("x-request-timeout", HeaderValue::from_static("5000"));
        inbound.insert("host", HeaderValue::from_static("gateway.local"));
        inbound.insert("accept", HeaderValue::from_static("application/json"));
        inbound.insert("x-custom", HeaderValue::from_static("kept"));

        let url = Url::parse("http://weather.internal:8081/v1").unwrap();
        let headers = outbound_headers(&inbound, &url);

        assert!(headers.get("x-api-key").is_none());
        assert!(headers.get("connection").is_none());
        assert!(headers.get("x-trace-hop").is_none());
        assert!(headers.get("keep-alive").is_none());
        assert!(headers.get("content-length").is_none());
        assert!(headers.get("x-request-timeout").is_none());
        assert_eq!(headers["host"], "weather.internal:8081");
        assert_eq!(headers["accept"], "application/json");
        assert_eq!(headers["x-custom"], "kept");
    }

    #[test]
    fn test_host_omits_default_port() {
        let url = Url::parse("https://api.example.com:443/").unwrap();
        let headers = outbound_headers(&HeaderMap::new(), &url);
        assert_eq!(headers["host"], "api.example.com");
    }

    #[test]
    fn test_response_headers_drop_transfer_encoding() {
        let mut upstream = HeaderMap::new();
        upstream.insert("transfer-encoding", HeaderValue::from_static("chunked"));
        upstream.insert("content-length", HeaderValue::from_static("99"));
        upstream.insert("content-type", HeaderValue::from_static("text/plain"));

        let headers = inbound_response_headers(&Method::GET, &upstream);
        assert!(headers.get("transfer-encoding").is_none());
        assert!(headers.get("content-length").is_none());
        assert_eq!(headers["content-type"], "text/plain");
    }

    #[test]
    fn test_head_response_keeps_content_length() {
        let mut upstream = HeaderMap::new();
        upstream.insert("content-length", HeaderValue::from_static("1234"));
        upstream.insert("connection", HeaderValue::from_static("keep-alive"));

        let headers = inbound_response_headers(&Method::HEAD, &upstream);
        assert_eq!(headers["content-length"], "1234");
        assert!(headers.get("connection").is_none());

        let mut without = HeaderMap::new();
        without.insert("etag", HeaderValue::from_static("\"v1\""));
        let headers = inbound_response_headers(&Method::HEAD, &without);
        assert!(headers.get("content-length").is_none());
    }

    #[tokio::test]
    async fn test_get_body_is_not_read() {
        let body = read_request_body(&Method::GET, Body::from("ignored"), 1024).await.unwrap();
        assert!(body.is_empty());
    }

    #[tokio::test]
    async fn test_body_limit_enforced() {
        let err = read_request_body(&Method::POST, Body::from(vec![0u8; 64]), 16)
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::BadRequest(_)));

        let ok = read_request_body(&Method::POST, Body::from("hello"), 16).await.unwrap();
        assert_eq!(&ok[..], b"hello");
    }

    #[test]
    fn test_forwarder_builds() {
        assert!(Forwarder::new(Duration::from_secs(30)).is_ok());
    }
}

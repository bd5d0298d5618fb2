//! Client-specified upstream timeouts.
//!
//! Callers may shorten (or lengthen, within bounds) the time the gateway waits
//! on the upstream service:
//!
//! ```text
//! X-Request-Timeout: 5000  # milliseconds
//! ```
//!
//! Values outside `[MIN_REQUEST_TIMEOUT_MS, MAX_REQUEST_TIMEOUT_MS]` or that do
//! not parse are ignored and the configured upstream timeout applies. The
//! header itself is never forwarded.

use std::time::Duration;

use axum::extract::Request;
use axum::http::Extensions;
use axum::http::request::Parts;
use axum::middleware::Next;
use axum::response::Response;
use tracing::debug;

/// Minimum accepted request timeout.
pub const MIN_REQUEST_TIMEOUT_MS: u64 = 100;

/// Maximum accepted request timeout (5 minutes).
pub const MAX_REQUEST_TIMEOUT_MS: u64 = 300_000;

pub const REQUEST_TIMEOUT_HEADER: &str = "x-request-timeout";

/// Validated client timeout, stored in request extensions.
#[derive(Debug, Clone, Copy)]
pub struct RequestTimeout {
    pub duration: Duration,
    /// The original value from the header (for logging).
    pub original_ms: u64,
}

impl RequestTimeout {
    /// Returns `None` if the value is outside the allowed range.
    pub fn from_millis(ms: u64) -> Option<Self> {
        if !(MIN_REQUEST_TIMEOUT_MS..=MAX_REQUEST_TIMEOUT_MS).contains(&ms) {
            return None;
        }
        Some(Self {
            duration: Duration::from_millis(ms),
            original_ms: ms,
        })
    }
}

/// Parse `X-Request-Timeout` into a [`RequestTimeout`] extension.
pub async fn extract_request_timeout(mut request: Request, next: Next) -> Response {
    if let Some(timeout_value) = request.headers().get(REQUEST_TIMEOUT_HEADER)
        && let Ok(value_str) = timeout_value.to_str()
    {
        match value_str.trim().parse::<u64>().ok().map(|ms| (ms, RequestTimeout::from_millis(ms))) {
            Some((ms, Some(timeout))) => {
                debug!(timeout_ms = ms, "Client specified upstream timeout");
                request.extensions_mut().insert(timeout);
            }
            Some((ms, None)) => {
                debug!(
                    timeout_ms = ms,
                    min = MIN_REQUEST_TIMEOUT_MS,
                    max = MAX_REQUEST_TIMEOUT_MS,
                    "Client timeout outside allowed range, ignoring"
                );
            }
            None => {
                debug!(value = value_str, "Invalid X-Request-Timeout header value, ignoring");
            }
        }
    }

    next.run(request).await
}

/// Client timeout from request extensions, or a default.
pub trait RequestTimeoutExt {
    fn effective_timeout(&self, default: Duration) -> Duration;
}

fn from_extensions(extensions: &Extensions, default: Duration) -> Duration {
    extensions
        .get::<RequestTimeout>()
        .map(|t| t.duration)
        .unwrap_or(default)
}

impl<B> RequestTimeoutExt for axum::http::Request<B> {
    fn effective_timeout(&self, default: Duration) -> Duration {
        from_extensions(self.extensions(), default)
    }
}

impl RequestTimeoutExt for Parts {
    fn effective_timeout(&self, default: Duration) -> Duration {
        from_extensions(&self.extensions, default)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn test_request_timeout_bounds() {
        assert!(RequestTimeout::from_millis(MIN_REQUEST_TIMEOUT_MS).is_some());
        assert!(RequestTimeout::from_millis(MAX_REQUEST_TIMEOUT_MS).is_some());
        assert!(RequestTimeout::from_millis(MIN_REQUEST_TIMEOUT_MS - 1).is_none());
        assert!(RequestTimeout::from_millis(MAX_REQUEST_TIMEOUT_MS + 1).is_none());
        assert!(RequestTimeout::from_millis(0).is_none());
    }

    #[test]
    fn test_effective_timeout_on_parts() {
        let default = Duration::from_secs(30);

        let (mut parts, _) = axum::http::Request::new(()).into_parts();
        assert_eq!(parts.effective_timeout(default), default);

        parts
            .extensions
            .insert(RequestTimeout::from_millis(2500).unwrap());
        assert_eq!(parts.effective_timeout(default), Duration::from_millis(2500));
    }
}

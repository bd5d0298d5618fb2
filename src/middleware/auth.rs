//! API key authentication middleware.
//!
//! Every authenticated route runs [`require_api_key`], which:
//!
//! 1. resolves the client IP and refuses IPs throttled for repeated failures
//! 2. reads `X-API-Key` (case-insensitive header name)
//! 3. resolves the key to a [`Principal`] through the credential resolver
//! 4. inserts the `Principal` and the [`ClientIp`] into request extensions
//!
//! ```bash
//! curl -H "X-API-Key: sk_live_..." http://localhost:9990/proxy/weather/today
//! ```
//!
//! # Brute Force Protection
//!
//! Missing and invalid keys count as failures against a per-IP `governor`
//! quota (`AUTH_FAILURE_LIMIT_PER_MINUTE`). Once an IP exhausts it, its
//! requests are answered with `429 AUTH_THROTTLED` and a `Retry-After` until
//! the quota replenishes, before any key lookup happens.

use std::collections::HashMap;
use std::num::NonZeroU32;
use std::sync::Arc;
use std::time::{Duration, Instant};

use axum::extract::{Request, State};
use axum::http::HeaderMap;
use axum::middleware::Next;
use axum::response::Response;
use governor::clock::{Clock, DefaultClock};
use governor::state::keyed::DefaultKeyedStateStore;
use governor::{Quota, RateLimiter};
use tokio::sync::Mutex;
use tracing::{debug, warn};

use super::ip::{ClientIp, client_ip};
use crate::error::AppError;
use crate::services::credentials::Principal;
use crate::state::AppState;

/// Header carrying the caller's API key.
pub const API_KEY_HEADER: &str = "x-api-key";

/// Limiter state beyond which idle per-IP entries are pruned.
const LIMITER_PRUNE_THRESHOLD: usize = 10_000;

type AuthFailureLimiter = RateLimiter<String, DefaultKeyedStateStore<String>, DefaultClock>;

/// The presented key, if it is non-empty visible ASCII.
pub fn extract_api_key(headers: &HeaderMap) -> Option<&str> {
    headers
        .get(API_KEY_HEADER)
        .and_then(|value| value.to_str().ok())
        .map(str::trim)
        .filter(|key| !key.is_empty())
}

struct GuardState {
    limiter: AuthFailureLimiter,
    /// IP -> instant the block lifts
    blocked: Mutex<HashMap<String, Instant>>,
}

/// Per-IP throttle on failed authentication attempts.
#[derive(Clone, Default)]
pub struct AuthFailureGuard {
    inner: Option<Arc<GuardState>>,
}

impl AuthFailureGuard {
    /// `per_minute == 0` disables throttling.
    pub fn new(per_minute: u32) -> Self {
        let inner = NonZeroU32::new(per_minute).map(|limit| {
            Arc::new(GuardState {
                limiter: RateLimiter::keyed(Quota::per_minute(limit)),
                blocked: Mutex::new(HashMap::new()),
            })
        });
        Self { inner }
    }

    pub fn is_enabled(&self) -> bool {
        self.inner.is_some()
    }

    /// `Err(retry_after_secs)` while `ip` is blocked.
    pub async fn check_blocked(&self, ip: &str) -> Result<(), u64> {
        let Some(state) = &self.inner else {
            return Ok(());
        };

        let mut blocked = state.blocked.lock().await;
        match blocked.get(ip) {
            Some(until) => {
                let now = Instant::now();
                if *until > now {
                    Err(retry_after_secs(*until - now))
                } else {
                    blocked.remove(ip);
                    Ok(())
                }
            }
            None => Ok(()),
        }
    }

    /// Count one failed attempt. `Err(retry_after_secs)` when it exhausted
    /// the IP's quota and the IP is now blocked.
    pub async fn record_failure(&self, ip: &str) -> Result<(), u64> {
        let Some(state) = &self.inner else {
            return Ok(());
        };

        if state.limiter.len() > LIMITER_PRUNE_THRESHOLD {
            state.limiter.retain_recent();
        }

        match state.limiter.check_key(&ip.to_string()) {
            Ok(()) => Ok(()),
            Err(not_until) => {
                let wait = not_until.wait_time_from(DefaultClock::default().now());
                let now = Instant::now();

                let mut blocked = state.blocked.lock().await;
                blocked.retain(|_, until| *until > now);
                blocked.insert(ip.to_string(), now + wait);

                Err(retry_after_secs(wait))
            }
        }
    }
}

fn retry_after_secs(wait: Duration) -> u64 {
    wait.as_secs_f64().ceil().max(1.0) as u64
}

/// Authenticate the request and attach the [`Principal`].
pub async fn require_api_key(
    State(state): State<AppState>,
    mut request: Request,
    next: Next,
) -> Result<Response, AppError> {
    let started_at = Instant::now();
    let ip = client_ip(request.headers(), request.extensions(), &state.trusted_proxies);
    let ip_key = ip.as_key().to_string();

    if let Err(retry_after_secs) = state.auth_failures.check_blocked(&ip_key).await {
        warn!(client_ip = %ip_key, retry_after_secs, "IP blocked due to excessive auth failures");
        return Err(AppError::AuthThrottled { retry_after_secs });
    }

    let outcome = match extract_api_key(request.headers()) {
        Some(key) => state.credentials.resolve(key, started_at).await,
        None => Err(AppError::MissingCredential),
    };

    let principal = match outcome {
        Ok(principal) => principal,
        Err(err @ (AppError::MissingCredential | AppError::InvalidCredential)) => {
            warn!(
                client_ip = %ip_key,
                path = %request.uri().path(),
                error_code = err.error_code(),
                "API key authentication failed"
            );
            if let Err(retry_after_secs) = state.auth_failures.record_failure(&ip_key).await {
                warn!(client_ip = %ip_key, retry_after_secs, "Auth failure limit reached, blocking IP");
            }
            return Err(err);
        }
        Err(err) => return Err(err),
    };

    debug!(user_id = %principal.user.id, plan = %principal.plan.plan_id, "API key authenticated");

    request.extensions_mut().insert::<Principal>(principal);
    request.extensions_mut().insert::<ClientIp>(ip);
    Ok(next.run(request).await)
}

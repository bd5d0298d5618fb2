//! Plan-level rate limiting middleware.
//!
//! Runs after [`require_api_key`](super::auth::require_api_key) on the proxy
//! routes. Charges the request to the caller's anti-spam minute bucket and
//! plan window, rejecting with 429 when either is exceeded, and leaves the
//! resulting [`PlanQuota`] in request extensions so the proxy handler can
//! echo it in `X-RateLimit-*` headers.
//!
//! Per-service quotas depend on the resolved service and are checked in the
//! proxy handler instead.

use axum::Extension;
use axum::extract::{Request, State};
use axum::middleware::Next;
use axum::response::Response;
use chrono::Utc;
use tracing::debug;

use crate::error::AppError;
use crate::ratelimit::PlanQuota;
use crate::services::credentials::Principal;
use crate::state::AppState;

/// Anti-spam, then plan quota.
pub async fn enforce_plan_limits(
    State(state): State<AppState>,
    Extension(principal): Extension<Principal>,
    mut request: Request,
    next: Next,
) -> Result<Response, AppError> {
    let quota = state
        .limits
        .enforce_plan_limits(&principal.user.id, &principal.plan, Utc::now())
        .await?;

    debug!(
        user_id = %principal.user.id,
        used = quota.used,
        remaining = quota.remaining,
        "Plan quota charged"
    );

    request.extensions_mut().insert::<PlanQuota>(quota);
    Ok(next.run(request).await)
}

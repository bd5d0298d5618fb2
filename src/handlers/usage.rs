use axum::extract::State;
use axum::{Extension, Json};
use chrono::{DateTime, Duration, Utc};
use tracing::instrument;

use crate::error::{AppError, AppResult};
use crate::models::{ApiResponse, PlanInfo, UsageData, UsageInfo};
use crate::services::Principal;
use crate::state::AppState;

/// `GET /user/usage`: the caller's plan and current window, without
/// charging the window.
///
/// ```json
/// {
///   "status": true,
///   "data": {
///     "plan": { "name": "Free", "limit": 100, "interval": "daily", "expiredAt": null },
///     "usage": { "used": 12, "remaining": 88, "resetAt": "2024-01-15T23:59:59.999Z" }
///   }
/// }
/// ```
#[instrument(skip_all, fields(user_id = %principal.user.id))]
pub async fn usage(
    State(state): State<AppState>,
    Extension(principal): Extension<Principal>,
) -> AppResult<Json<ApiResponse<UsageData>>> {
    let usage = state
        .limits
        .plan_usage(&principal.user.id, &principal.plan, Utc::now())
        .await?;

    // The window's last millisecond, one before the next window starts.
    let reset_at = DateTime::<Utc>::from_timestamp(usage.reset, 0)
        .map(|next_window| next_window - Duration::milliseconds(1))
        .ok_or_else(|| AppError::Internal(format!("invalid window reset {}", usage.reset)))?;

    Ok(Json(ApiResponse::ok(UsageData {
        plan: PlanInfo {
            name: principal.plan.name.clone(),
            limit: usage.limit,
            interval: usage.interval.as_str().to_string(),
            expired_at: principal.user.plan_expires_at,
        },
        usage: UsageInfo {
            used: usage.used,
            remaining: usage.remaining,
            reset_at,
        },
    })))
}

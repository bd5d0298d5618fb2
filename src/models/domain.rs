use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{AppError, AppResult};

/// An account that calls the gateway with an API key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, sqlx::FromRow)]
pub struct User {
    pub id: String,
    /// Lowercase hex SHA-256 of the API key. Plaintext keys are never stored.
    pub api_key_hash: Option<String>,
    pub plan_id: Option<String>,
    pub plan_expires_at: Option<DateTime<Utc>>,
}

impl User {
    /// True when the assigned plan has an expiry in the past.
    pub fn plan_expired(&self, now: DateTime<Utc>) -> bool {
        self.plan_expires_at.is_some_and(|expires| expires < now)
    }
}

/// Window a plan quota is counted over.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RateInterval {
    Hourly,
    Daily,
}

impl RateInterval {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Hourly => "hourly",
            Self::Daily => "daily",
        }
    }
}

impl std::str::FromStr for RateInterval {
    type Err = AppError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "hourly" => Ok(Self::Hourly),
            "daily" => Ok(Self::Daily),
            other => Err(AppError::InvalidRateInterval(other.to_string())),
        }
    }
}

/// A quota tier. `rate_interval` stays textual because the store may hold
/// values the gateway does not support.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, sqlx::FromRow)]
pub struct Plan {
    pub plan_id: String,
    pub name: String,
    pub rate_limit: i32,
    pub rate_interval: String,
    pub req_per_minute: Option<i32>,
}

impl Plan {
    /// Parsed quota window.
    ///
    /// # Errors
    ///
    /// Returns `AppError::InvalidRateInterval` for anything but `hourly`/`daily`.
    pub fn interval(&self) -> AppResult<RateInterval> {
        self.rate_interval.parse()
    }

    /// Per-minute ceiling, if anti-spam is enabled for this plan.
    pub fn anti_spam_limit(&self) -> Option<i64> {
        self.req_per_minute
            .filter(|limit| *limit > 0)
            .map(i64::from)
    }
}

/// A user together with its resolved plan (if any).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UserWithPlan {
    pub user: User,
    pub plan: Option<Plan>,
}

/// An upstream API reachable through the gateway.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, sqlx::FromRow)]
pub struct Service {
    pub id: String,
    pub name: String,
    pub base_url: String,
    /// First path segment that selects this service. `None` marks the default.
    pub prefix: Option<String>,
    pub is_active: bool,
}

/// Per-plan, per-service caps. A `None` limit means unlimited.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ServiceLimits {
    pub daily_limit: Option<i32>,
    pub monthly_limit: Option<i32>,
}

/// One audited request, as handed to the audit queue.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewRequestLog {
    pub log_id: Uuid,
    pub user_id: String,
    pub timestamp: DateTime<Utc>,
    pub endpoint: String,
    pub method: String,
    pub status_code: i32,
    pub latency_ms: i32,
    pub ip_address: Option<String>,
    pub query_params: BTreeMap<String, String>,
    pub request_headers: BTreeMap<String, String>,
    pub response_headers: BTreeMap<String, String>,
    pub response_body: Option<String>,
}

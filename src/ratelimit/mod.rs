//! Three-tier quota enforcement.
//!
//! ```text
//!   request ──► anti-spam (per minute) ──► plan quota (hour/day) ──► service quota (day/month)
//!                 INCR, reject > limit       INCR, reject > limit      GET, reject used >= limit
//!                                                                       INCR after upstream success
//! ```
//!
//! The first two tiers count the attempt before deciding, so rejected
//! requests still consume the window. The service tier only peeks before
//! forwarding and is charged once the upstream has answered, so failed
//! upstream calls are free.

pub mod buckets;

use std::sync::Arc;

use axum::http::{HeaderMap, HeaderName, HeaderValue};
use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{debug, warn};

use crate::counter::CounterStore;
use crate::error::{AppError, AppResult};
use crate::models::{Plan, RateInterval, Service, ServiceLimits};

use self::buckets::{
    ANTI_SPAM_TTL, SERVICE_DAILY_TTL, SERVICE_MONTHLY_TTL, anti_spam_key, plan_window,
    seconds_until_next_minute, service_daily_key, service_monthly_key,
};

// =============================================================================
// Quota snapshots
// =============================================================================

/// Plan-quota snapshot taken when the request was counted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct PlanQuota {
    pub limit: i64,
    pub remaining: i64,
    pub used: i64,
    /// Start of the next window, in epoch seconds
    pub reset: i64,
}

impl PlanQuota {
    pub fn new(limit: i64, used: i64, reset: i64) -> Self {
        Self {
            limit,
            remaining: (limit - used).max(0),
            used,
            reset,
        }
    }

    /// Snapshot reported on rejection: the window is full.
    pub fn exhausted(self) -> Self {
        Self {
            remaining: 0,
            used: self.limit,
            ..self
        }
    }

    /// Write the `X-RateLimit-*` headers.
    pub fn apply_headers(&self, headers: &mut HeaderMap) {
        headers.insert(X_RATELIMIT_LIMIT, HeaderValue::from(self.limit));
        headers.insert(X_RATELIMIT_REMAINING, HeaderValue::from(self.remaining));
        headers.insert(X_RATELIMIT_USED, HeaderValue::from(self.used));
        headers.insert(X_RATELIMIT_RESET, HeaderValue::from(self.reset));
    }
}

/// Which service counter a limit applies to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum QuotaDimension {
    Daily,
    Monthly,
}

impl QuotaDimension {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Daily => "daily",
            Self::Monthly => "monthly",
        }
    }
}

impl std::fmt::Display for QuotaDimension {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One configured service dimension, read before forwarding.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DimensionUsage {
    pub limit: i64,
    pub used: i64,
}

impl DimensionUsage {
    pub fn is_exhausted(&self) -> bool {
        self.used >= self.limit
    }

    /// Usage once the current request has been charged.
    pub fn used_after_request(&self) -> i64 {
        self.used + 1
    }

    pub fn remaining_after_request(&self) -> i64 {
        (self.limit - self.used - 1).max(0)
    }
}

/// Service-quota snapshot. Unconfigured dimensions are `None`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceQuota {
    pub service_name: String,
    pub daily: Option<DimensionUsage>,
    pub monthly: Option<DimensionUsage>,
}

impl ServiceQuota {
    /// Write `X-Service` and the `X-Service-Daily*`/`X-Service-Monthly*`
    /// headers for configured dimensions.
    pub fn apply_headers(&self, headers: &mut HeaderMap) {
        match HeaderValue::from_str(&self.service_name) {
            Ok(value) => {
                headers.insert(X_SERVICE, value);
            }
            Err(_) => warn!(service = %self.service_name, "Service name is not a valid header value"),
        }

        let dimensions = [
            (
                self.daily,
                [X_SERVICE_DAILY_LIMIT, X_SERVICE_DAILY_USED, X_SERVICE_DAILY_REMAINING],
            ),
            (
                self.monthly,
                [X_SERVICE_MONTHLY_LIMIT, X_SERVICE_MONTHLY_USED, X_SERVICE_MONTHLY_REMAINING],
            ),
        ];
        for (usage, [limit, used, remaining]) in dimensions {
            if let Some(usage) = usage {
                headers.insert(limit, HeaderValue::from(usage.limit));
                headers.insert(used, HeaderValue::from(usage.used_after_request()));
                headers.insert(remaining, HeaderValue::from(usage.remaining_after_request()));
            }
        }
    }
}

/// Read-only view of the plan window for the usage endpoint.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlanUsage {
    pub interval: RateInterval,
    pub limit: i64,
    pub used: i64,
    pub remaining: i64,
    /// Start of the next window, in epoch seconds
    pub reset: i64,
}

pub const X_RATELIMIT_LIMIT: HeaderName = HeaderName::from_static("x-ratelimit-limit");
pub const X_RATELIMIT_REMAINING: HeaderName = HeaderName::from_static("x-ratelimit-remaining");
pub const X_RATELIMIT_USED: HeaderName = HeaderName::from_static("x-ratelimit-used");
pub const X_RATELIMIT_RESET: HeaderName = HeaderName::from_static("x-ratelimit-reset");
pub const X_SERVICE: HeaderName = HeaderName::from_static("x-service");
pub const X_SERVICE_DAILY_LIMIT: HeaderName = HeaderName::from_static("x-service-dailylimit");
pub const X_SERVICE_DAILY_USED: HeaderName = HeaderName::from_static("x-service-dailyused");
pub const X_SERVICE_DAILY_REMAINING: HeaderName =
    HeaderName::from_static("x-service-dailyremaining");
pub const X_SERVICE_MONTHLY_LIMIT: HeaderName = HeaderName::from_static("x-service-monthlylimit");
pub const X_SERVICE_MONTHLY_USED: HeaderName = HeaderName::from_static("x-service-monthlyused");
pub const X_SERVICE_MONTHLY_REMAINING: HeaderName =
    HeaderName::from_static("x-service-monthlyremaining");

// =============================================================================
// Engine
// =============================================================================

/// Quota checks over a shared [`CounterStore`].
///
/// Every method takes `now` explicitly so window selection is deterministic
/// under test.
#[derive(Clone)]
pub struct RateLimitEngine {
    counters: Arc<dyn CounterStore>,
}

impl RateLimitEngine {
    pub fn new(counters: Arc<dyn CounterStore>) -> Self {
        Self { counters }
    }

    /// Count this request against the per-minute ceiling, if the plan has one.
    ///
    /// # Errors
    ///
    /// `AntiSpamExceeded` once the minute's count passes `req_per_minute`.
    pub async fn check_anti_spam(
        &self,
        user_id: &str,
        plan: &Plan,
        now: DateTime<Utc>,
    ) -> AppResult<()> {
        let Some(limit) = plan.anti_spam_limit() else {
            return Ok(());
        };

        let count = self
            .counters
            .increment(&anti_spam_key(user_id, now), ANTI_SPAM_TTL)
            .await?;

        if count > limit {
            return Err(AppError::AntiSpamExceeded {
                limit,
                retry_after_secs: seconds_until_next_minute(now),
            });
        }

        Ok(())
    }

    /// Count this request against the plan's hourly or daily quota.
    ///
    /// # Errors
    ///
    /// `InvalidRateInterval` for unsupported intervals (nothing is counted),
    /// `RateLimitExceeded` once the window's count passes `rate_limit`.
    pub async fn check_plan_quota(
        &self,
        user_id: &str,
        plan: &Plan,
        now: DateTime<Utc>,
    ) -> AppResult<PlanQuota> {
        let interval = plan.interval()?;
        let window = plan_window(user_id, interval, now);
        let limit = i64::from(plan.rate_limit);

        let count = self.counters.increment(&window.key, window.ttl).await?;
        let quota = PlanQuota::new(limit, count, window.reset_at);

        if count > limit {
            return Err(AppError::RateLimitExceeded(quota.exhausted()));
        }

        debug!(user_id, used = count, limit, "Plan quota charged");
        Ok(quota)
    }

    /// Anti-spam then plan quota, as applied to every proxied request.
    pub async fn enforce_plan_limits(
        &self,
        user_id: &str,
        plan: &Plan,
        now: DateTime<Utc>,
    ) -> AppResult<PlanQuota> {
        self.check_anti_spam(user_id, plan, now).await?;
        self.check_plan_quota(user_id, plan, now).await
    }

    /// Current plan window without charging it.
    pub async fn plan_usage(
        &self,
        user_id: &str,
        plan: &Plan,
        now: DateTime<Utc>,
    ) -> AppResult<PlanUsage> {
        let interval = plan.interval()?;
        let window = plan_window(user_id, interval, now);
        let limit = i64::from(plan.rate_limit);
        let used = self.counters.current(&window.key).await?;

        Ok(PlanUsage {
            interval,
            limit,
            used,
            remaining: (limit - used).max(0),
            reset: window.reset_at,
        })
    }

    /// Check the per-service caps without charging them. No override means
    /// no caps and no counter reads.
    ///
    /// # Errors
    ///
    /// `ServiceLimitExceeded` naming the first exhausted dimension, daily
    /// before monthly.
    pub async fn check_service_quota(
        &self,
        user_id: &str,
        service: &Service,
        limits: Option<ServiceLimits>,
        now: DateTime<Utc>,
    ) -> AppResult<ServiceQuota> {
        let mut quota = ServiceQuota {
            service_name: service.name.clone(),
            daily: None,
            monthly: None,
        };
        let Some(limits) = limits else {
            return Ok(quota);
        };

        if let Some(limit) = limits.daily_limit {
            let used = self
                .counters
                .current(&service_daily_key(user_id, &service.id, now))
                .await?;
            quota.daily = Some(Self::within(service, QuotaDimension::Daily, limit, used)?);
        }

        if let Some(limit) = limits.monthly_limit {
            let used = self
                .counters
                .current(&service_monthly_key(user_id, &service.id, now))
                .await?;
            quota.monthly = Some(Self::within(service, QuotaDimension::Monthly, limit, used)?);
        }

        Ok(quota)
    }

    /// Charge one forwarded request to both service counters.
    pub async fn record_service_usage(
        &self,
        user_id: &str,
        service_id: &str,
        now: DateTime<Utc>,
    ) -> AppResult<()> {
        self.counters
            .increment(&service_daily_key(user_id, service_id, now), SERVICE_DAILY_TTL)
            .await?;
        self.counters
            .increment(&service_monthly_key(user_id, service_id, now), SERVICE_MONTHLY_TTL)
            .await?;
        Ok(())
    }

    fn within(
        service: &Service,
        dimension: QuotaDimension,
        limit: i32,
        used: i64,
    ) -> AppResult<DimensionUsage> {
        let usage = DimensionUsage {
            limit: i64::from(limit),
            used,
        };
        if usage.is_exhausted() {
            return Err(AppError::ServiceLimitExceeded {
                service: service.name.clone(),
                dimension,
                limit: usage.limit,
            });
        }
        Ok(usage)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::counter::MemoryCounterStore;
    use chrono::TimeZone;

    fn plan(limit: i32, interval: &str, per_minute: Option<i32>) -> Plan {
        Plan {
            plan_id: "pro".into(),
            name: "Pro".into(),
            rate_limit: limit,
            rate_interval: interval.into(),
            req_per_minute: per_minute,
        }
    }

    fn weather() -> Service {
        Service {
            id: "weather".into(),
            name: "Weather".into(),
            base_url: "http://weather.internal".into(),
            prefix: Some("weather".into()),
            is_active: true,
        }
    }

    fn noon() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 6, 1, 12, 0, 0).unwrap()
    }

    fn engine() -> (RateLimitEngine, Arc<MemoryCounterStore>) {
        let counters = Arc::new(MemoryCounterStore::new());
        (RateLimitEngine::new(counters.clone()), counters)
    }

    #[tokio::test]
    async fn test_hundred_and_first_daily_request_is_rejected() {
        let (engine, _) = engine();
        let plan = plan(100, "daily", None);

        for i in 1..=100 {
            let quota = engine.check_plan_quota("u1", &plan, noon()).await.unwrap();
            assert_eq!(quota.used, i);
            assert_eq!(quota.remaining, 100 - i);
        }

        let err = engine.check_plan_quota("u1", &plan, noon()).await.unwrap_err();
        match err {
            AppError::RateLimitExceeded(quota) => {
                assert_eq!(quota.remaining, 0);
                assert_eq!(quota.used, 100);
                assert_eq!(quota.limit, 100);
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_unsupported_interval_fails_without_counting() {
        let (engine, counters) = engine();
        let err = engine
            .check_plan_quota("u1", &plan(10, "weekly", None), noon())
            .await
            .unwrap_err();

        assert!(matches!(err, AppError::InvalidRateInterval(_)));
        assert!(counters.is_empty().await);
    }

    #[tokio::test]
    async fn test_anti_spam_rejects_over_ceiling() {
        let (engine, _) = engine();
        let plan = plan(1000, "daily", Some(2));
        let now = noon() + chrono::Duration::seconds(45);

        engine.check_anti_spam("u1", &plan, now).await.unwrap();
        engine.check_anti_spam("u1", &plan, now).await.unwrap();
        let err = engine.check_anti_spam("u1", &plan, now).await.unwrap_err();

        match err {
            AppError::AntiSpamExceeded {
                limit,
                retry_after_secs,
            } => {
                assert_eq!(limit, 2);
                assert_eq!(retry_after_secs, 15);
            }
            other => panic!("unexpected error: {other:?}"),
        }

        // A new minute starts a new bucket
        let next_minute = noon() + chrono::Duration::seconds(61);
        engine.check_anti_spam("u1", &plan, next_minute).await.unwrap();
    }

    #[tokio::test]
    async fn test_anti_spam_disabled_without_ceiling() {
        let (engine, counters) = engine();
        engine
            .check_anti_spam("u1", &plan(10, "daily", Some(0)), noon())
            .await
            .unwrap();
        assert!(counters.is_empty().await);
    }

    #[tokio::test]
    async fn test_plan_usage_does_not_charge() {
        let (engine, _) = engine();
        let plan = plan(5, "hourly", None);
        engine.check_plan_quota("u1", &plan, noon()).await.unwrap();

        let usage = engine.plan_usage("u1", &plan, noon()).await.unwrap();
        let again = engine.plan_usage("u1", &plan, noon()).await.unwrap();

        assert_eq!(usage.used, 1);
        assert_eq!(usage.remaining, 4);
        assert_eq!(usage, again);
        assert_eq!(usage.reset, noon().timestamp() + 3600);
    }

    #[tokio::test]
    async fn test_no_override_means_unlimited() {
        let (engine, _) = engine();
        for _ in 0..20 {
            engine.record_service_usage("u1", "weather", noon()).await.unwrap();
        }

        let quota = engine
            .check_service_quota("u1", &weather(), None, noon())
            .await
            .unwrap();
        assert!(quota.daily.is_none());
        assert!(quota.monthly.is_none());
    }

    #[tokio::test]
    async fn test_daily_service_limit_sixth_call_fails() {
        let (engine, _) = engine();
        let limits = Some(ServiceLimits {
            daily_limit: Some(5),
            monthly_limit: None,
        });

        for used in 0..5 {
            let quota = engine
                .check_service_quota("u1", &weather(), limits, noon())
                .await
                .unwrap();
            let daily = quota.daily.unwrap();
            assert_eq!(daily.used, used);
            assert_eq!(daily.used_after_request(), used + 1);
            engine.record_service_usage("u1", "weather", noon()).await.unwrap();
        }

        let err = engine
            .check_service_quota("u1", &weather(), limits, noon())
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            AppError::ServiceLimitExceeded { dimension: QuotaDimension::Daily, limit: 5, .. }
        ));
    }

    #[tokio::test]
    async fn test_daily_checked_before_monthly() {
        let (engine, _) = engine();
        let limits = Some(ServiceLimits {
            daily_limit: Some(1),
            monthly_limit: Some(1),
        });
        engine.record_service_usage("u1", "weather", noon()).await.unwrap();

        let err = engine
            .check_service_quota("u1", &weather(), limits, noon())
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            AppError::ServiceLimitExceeded { dimension: QuotaDimension::Daily, .. }
        ));
    }

    #[tokio::test]
    async fn test_monthly_limit_spans_days() {
        let (engine, _) = engine();
        let limits = Some(ServiceLimits {
            daily_limit: Some(10),
            monthly_limit: Some(2),
        });
        let day_one = noon();
        let day_two = noon() + chrono::Duration::days(1);

        engine.record_service_usage("u1", "weather", day_one).await.unwrap();
        engine.record_service_usage("u1", "weather", day_two).await.unwrap();

        let err = engine
            .check_service_quota("u1", &weather(), limits, day_two)
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            AppError::ServiceLimitExceeded { dimension: QuotaDimension::Monthly, .. }
        ));
    }

    #[test]
    fn test_plan_quota_remaining_never_negative() {
        let quota = PlanQuota::new(10, 25, 0);
        assert_eq!(quota.remaining, 0);
    }

    #[test]
    fn test_service_headers_use_post_request_values() {
        let quota = ServiceQuota {
            service_name: "Weather".into(),
            daily: Some(DimensionUsage { limit: 5, used: 4 }),
            monthly: None,
        };
        let mut headers = HeaderMap::new();
        quota.apply_headers(&mut headers);

        assert_eq!(headers["x-service"], "Weather");
        assert_eq!(headers["x-service-dailylimit"], "5");
        assert_eq!(headers["x-service-dailyused"], "5");
        assert_eq!(headers["x-service-dailyremaining"], "0");
        assert!(headers.get("x-service-monthlylimit").is_none());
    }
}

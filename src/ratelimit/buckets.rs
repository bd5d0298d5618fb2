//! Counter keys and window boundaries, as pure functions of the clock.
//!
//! ```text
//! antispam:min:{user}:{epoch_ms / 60000}      TTL 120s
//! ratelimit:{user}:{YYYY-MM-DD}               TTL 1d   (daily plans)
//! ratelimit:{user}:{YYYY-MM-DDTHH}            TTL 1h   (hourly plans)
//! svc:daily:{user}:{service}:{YYYY-MM-DD}     TTL 2d
//! svc:monthly:{user}:{service}:{YYYY-MM}      TTL 35d
//! ```
//!
//! All windows are UTC.

use std::time::Duration;

use chrono::{DateTime, Utc};

use crate::models::RateInterval;

pub const ANTI_SPAM_TTL: Duration = Duration::from_secs(120);
pub const DAILY_TTL: Duration = Duration::from_secs(86_400);
pub const HOURLY_TTL: Duration = Duration::from_secs(3_600);
pub const SERVICE_DAILY_TTL: Duration = Duration::from_secs(2 * 86_400);
pub const SERVICE_MONTHLY_TTL: Duration = Duration::from_secs(35 * 86_400);

const SECONDS_PER_HOUR: i64 = 3_600;
const SECONDS_PER_DAY: i64 = 86_400;

/// Key of the per-minute anti-spam bucket containing `now`.
pub fn anti_spam_key(user_id: &str, now: DateTime<Utc>) -> String {
    let minute = now.timestamp_millis().div_euclid(60_000);
    format!("antispam:min:{user_id}:{minute}")
}

/// Seconds until the next minute boundary, in `1..=60`.
pub fn seconds_until_next_minute(now: DateTime<Utc>) -> u64 {
    let elapsed = now.timestamp_millis().rem_euclid(60_000) / 1_000;
    // elapsed is in 0..=59
    (60 - elapsed).unsigned_abs()
}

/// A plan-quota bucket.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlanWindow {
    pub key: String,
    pub ttl: Duration,
    /// Start of the next window, in epoch seconds
    pub reset_at: i64,
}

/// Bucket for `user_id`'s plan quota at `now`.
pub fn plan_window(user_id: &str, interval: RateInterval, now: DateTime<Utc>) -> PlanWindow {
    match interval {
        RateInterval::Daily => PlanWindow {
            key: format!("ratelimit:{user_id}:{}", now.format("%Y-%m-%d")),
            ttl: DAILY_TTL,
            reset_at: next_boundary(now, SECONDS_PER_DAY),
        },
        RateInterval::Hourly => PlanWindow {
            key: format!("ratelimit:{user_id}:{}", now.format("%Y-%m-%dT%H")),
            ttl: HOURLY_TTL,
            reset_at: next_boundary(now, SECONDS_PER_HOUR),
        },
    }
}

pub fn service_daily_key(user_id: &str, service_id: &str, now: DateTime<Utc>) -> String {
    format!("svc:daily:{user_id}:{service_id}:{}", now.format("%Y-%m-%d"))
}

pub fn service_monthly_key(user_id: &str, service_id: &str, now: DateTime<Utc>) -> String {
    format!("svc:monthly:{user_id}:{service_id}:{}", now.format("%Y-%m"))
}

fn next_boundary(now: DateTime<Utc>, period_secs: i64) -> i64 {
    let ts = now.timestamp();
    ts - ts.rem_euclid(period_secs) + period_secs
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn at(h: u32, m: u32, s: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 3, 9, h, m, s).unwrap()
    }

    #[test]
    fn test_minute_buckets_split_at_boundary() {
        let before = at(10, 15, 59);
        let after = at(10, 16, 1);

        assert_ne!(anti_spam_key("u1", before), anti_spam_key("u1", after));
        assert_eq!(anti_spam_key("u1", at(10, 15, 0)), anti_spam_key("u1", before));
    }

    #[test]
    fn test_anti_spam_key_format() {
        let now = at(0, 0, 0);
        let minute = now.timestamp() / 60;
        assert_eq!(anti_spam_key("abc", now), format!("antispam:min:abc:{minute}"));
    }

    #[test]
    fn test_seconds_until_next_minute_range() {
        assert_eq!(seconds_until_next_minute(at(1, 2, 0)), 60);
        assert_eq!(seconds_until_next_minute(at(1, 2, 1)), 59);
        assert_eq!(seconds_until_next_minute(at(1, 2, 59)), 1);

        let with_millis = at(1, 2, 30) + chrono::Duration::milliseconds(999);
        assert_eq!(seconds_until_next_minute(with_millis), 30);
    }

    #[test]
    fn test_daily_window() {
        let window = plan_window("u1", RateInterval::Daily, at(13, 45, 10));

        assert_eq!(window.key, "ratelimit:u1:2024-03-09");
        assert_eq!(window.ttl, DAILY_TTL);
        assert_eq!(
            window.reset_at,
            Utc.with_ymd_and_hms(2024, 3, 10, 0, 0, 0).unwrap().timestamp()
        );
    }

    #[test]
    fn test_hourly_window() {
        let window = plan_window("u1", RateInterval::Hourly, at(7, 5, 0));

        assert_eq!(window.key, "ratelimit:u1:2024-03-09T07");
        assert_eq!(window.ttl, HOURLY_TTL);
        assert_eq!(window.reset_at, at(8, 0, 0).timestamp());
    }

    #[test]
    fn test_window_reset_at_exact_boundary_moves_forward() {
        let midnight = at(0, 0, 0);
        let window = plan_window("u1", RateInterval::Daily, midnight);
        assert_eq!(window.reset_at, midnight.timestamp() + SECONDS_PER_DAY);
    }

    #[test]
    fn test_service_keys() {
        let now = at(23, 59, 59);
        assert_eq!(service_daily_key("u1", "weather", now), "svc:daily:u1:weather:2024-03-09");
        assert_eq!(service_monthly_key("u1", "weather", now), "svc:monthly:u1:weather:2024-03");
    }
}

//! Per-user, per-day aggregation of request logs.
//!
//! The retention compactor folds expiring request logs into [`DailyRollup`]s
//! and then merges each rollup into the stored [`LogSummary`] for the same
//! `(user, day)`. Merging is additive, so compacting a day in several passes
//! yields the same summary as compacting it at once.

use std::collections::BTreeMap;

use chrono::{DateTime, NaiveDate, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::NewRequestLog;

/// The columns of a request log the compactor needs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompactableLog {
    pub user_id: String,
    pub timestamp: DateTime<Utc>,
    pub endpoint: String,
    pub status_code: i32,
    pub latency_ms: i32,
}

impl From<&NewRequestLog> for CompactableLog {
    fn from(entry: &NewRequestLog) -> Self {
        Self {
            user_id: entry.user_id.clone(),
            timestamp: entry.timestamp,
            endpoint: entry.endpoint.clone(),
            status_code: entry.status_code,
            latency_ms: entry.latency_ms,
        }
    }
}

/// Aggregate of the logs of one user on one UTC day, from a single pass.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DailyRollup {
    pub user_id: String,
    pub date: NaiveDate,
    pub total: i64,
    pub successful: i64,
    pub failed: i64,
    pub latency_sum: i64,
    pub endpoint_usage: BTreeMap<String, i64>,
}

impl DailyRollup {
    fn empty(user_id: &str, date: NaiveDate) -> Self {
        Self {
            user_id: user_id.to_string(),
            date,
            total: 0,
            successful: 0,
            failed: 0,
            latency_sum: 0,
            endpoint_usage: BTreeMap::new(),
        }
    }

    fn add(&mut self, log: &CompactableLog) {
        self.total += 1;
        if (200..300).contains(&log.status_code) {
            self.successful += 1;
        }
        if log.status_code >= 400 {
            self.failed += 1;
        }
        self.latency_sum += i64::from(log.latency_ms);
        *self.endpoint_usage.entry(log.endpoint.clone()).or_insert(0) += 1;
    }

    /// Mean latency rounded to two decimal places.
    pub fn average_latency_ms(&self) -> Decimal {
        Decimal::from(self.latency_sum)
            .checked_div(Decimal::from(self.total))
            .unwrap_or(Decimal::ZERO)
            .round_dp(2)
    }
}

/// Group logs by `(user, UTC day)`. Output is ordered by user, then day.
///
/// 2xx counts as successful and `>= 400` as failed; 1xx/3xx count only
/// towards the total.
pub fn summarize<'a, I>(logs: I) -> Vec<DailyRollup>
where
    I: IntoIterator<Item = &'a CompactableLog>,
{
    let mut groups: BTreeMap<(String, NaiveDate), DailyRollup> = BTreeMap::new();

    for log in logs {
        let date = log.timestamp.date_naive();
        groups
            .entry((log.user_id.clone(), date))
            .or_insert_with(|| DailyRollup::empty(&log.user_id, date))
            .add(log);
    }

    groups.into_values().collect()
}

/// Stored per-user, per-day summary.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LogSummary {
    pub summary_id: Uuid,
    pub user_id: String,
    pub date: NaiveDate,
    pub total_requests: i32,
    pub successful_requests: i32,
    pub failed_requests: i32,
    pub average_latency_ms: Decimal,
    pub endpoint_usage: BTreeMap<String, i64>,
    pub last_updated: DateTime<Utc>,
}

impl LogSummary {
    /// First summary for a day.
    pub fn from_rollup(rollup: &DailyRollup, now: DateTime<Utc>) -> Self {
        Self {
            summary_id: Uuid::new_v4(),
            user_id: rollup.user_id.clone(),
            date: rollup.date,
            total_requests: saturate(rollup.total),
            successful_requests: saturate(rollup.successful),
            failed_requests: saturate(rollup.failed),
            average_latency_ms: rollup.average_latency_ms(),
            endpoint_usage: rollup.endpoint_usage.clone(),
            last_updated: now,
        }
    }

    /// Merge a later rollup for the same day. The stored counts are kept and
    /// the rollup's are added to them, not written over them; the latency
    /// average is weighted by request count.
    pub fn absorb(&mut self, rollup: &DailyRollup, now: DateTime<Utc>) {
        let previous_total = i64::from(self.total_requests);
        let combined_total = previous_total + rollup.total;

        if combined_total > 0 {
            let weighted = self.average_latency_ms * Decimal::from(previous_total)
                + Decimal::from(rollup.latency_sum);
            self.average_latency_ms = weighted
                .checked_div(Decimal::from(combined_total))
                .unwrap_or(Decimal::ZERO)
                .round_dp(2);
        }

        self.total_requests = saturate(combined_total);
        self.successful_requests =
            saturate(i64::from(self.successful_requests) + rollup.successful);
        self.failed_requests = saturate(i64::from(self.failed_requests) + rollup.failed);
        for (endpoint, hits) in &rollup.endpoint_usage {
            *self.endpoint_usage.entry(endpoint.clone()).or_insert(0) += hits;
        }
        self.last_updated = now;
    }
}

fn saturate(value: i64) -> i32 {
    i32::try_from(value).unwrap_or(if value < 0 { i32::MIN } else { i32::MAX })
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use std::str::FromStr;

    fn log(user: &str, ts: DateTime<Utc>, endpoint: &str, status: i32, latency: i32) -> CompactableLog {
        CompactableLog {
            user_id: user.into(),
            timestamp: ts,
            endpoint: endpoint.into(),
            status_code: status,
            latency_ms: latency,
        }
    }

    fn at(day: u32, hour: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 5, day, hour, 0, 0).unwrap()
    }

    #[test]
    fn test_single_created_entry_counts_as_success() {
        let logs = [log("u1", at(1, 10), "/proxy/svc/x", 201, 42)];
        let rollups = summarize(&logs);

        assert_eq!(rollups.len(), 1);
        let rollup = &rollups[0];
        assert_eq!(rollup.total, 1);
        assert_eq!(rollup.successful, 1);
        assert_eq!(rollup.failed, 0);
        assert_eq!(rollup.average_latency_ms(), Decimal::from(42));
        assert_eq!(rollup.endpoint_usage["/proxy/svc/x"], 1);
    }

    #[test]
    fn test_groups_by_user_and_utc_day() {
        let logs = [
            log("u1", at(1, 1), "/proxy/a", 200, 10),
            log("u1", at(1, 23), "/proxy/a", 500, 20),
            log("u1", at(2, 0), "/proxy/b", 302, 30),
            log("u2", at(1, 12), "/proxy/a", 404, 40),
        ];
        let rollups = summarize(&logs);

        assert_eq!(rollups.len(), 3);
        let first = &rollups[0];
        assert_eq!((first.user_id.as_str(), first.date.to_string().as_str()), ("u1", "2024-05-01"));
        assert_eq!(first.total, 2);
        assert_eq!(first.successful, 1);
        assert_eq!(first.failed, 1);
        assert_eq!(first.average_latency_ms(), Decimal::from(15));

        // 3xx is neither success nor failure
        let second = &rollups[1];
        assert_eq!((second.total, second.successful, second.failed), (1, 0, 0));

        assert_eq!(rollups[2].user_id, "u2");
        assert_eq!(rollups[2].failed, 1);
    }

    #[test]
    fn test_average_rounds_to_two_places() {
        let logs = [
            log("u1", at(1, 1), "/a", 200, 1),
            log("u1", at(1, 2), "/a", 200, 1),
            log("u1", at(1, 3), "/a", 200, 2),
        ];
        let rollups = summarize(&logs);
        assert_eq!(rollups[0].average_latency_ms(), Decimal::from_str("1.33").unwrap());
    }

    #[test]
    fn test_absorb_weights_latency_and_sums_counts() {
        let now = at(5, 0);
        let first = summarize(&[
            log("u1", at(1, 1), "/a", 200, 10),
            log("u1", at(1, 2), "/a", 200, 30),
        ]);
        let mut summary = LogSummary::from_rollup(&first[0], now);
        assert_eq!(summary.average_latency_ms, Decimal::from(20));

        let second = summarize(&[
            log("u1", at(1, 3), "/b", 503, 50),
            log("u1", at(1, 4), "/a", 200, 50),
        ]);
        summary.absorb(&second[0], at(6, 0));

        assert_eq!(summary.total_requests, 4);
        assert_eq!(summary.successful_requests, 3);
        assert_eq!(summary.failed_requests, 1);
        assert_eq!(summary.average_latency_ms, Decimal::from(35));
        assert_eq!(summary.endpoint_usage["/a"], 3);
        assert_eq!(summary.endpoint_usage["/b"], 1);
        assert_eq!(summary.last_updated, at(6, 0));
    }

    #[test]
    fn test_empty_input_yields_no_rollups() {
        let logs: Vec<CompactableLog> = Vec::new();
        assert!(summarize(&logs).is_empty());
    }
}

use std::collections::BTreeMap;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use rust_decimal::Decimal;
use sqlx::postgres::PgPoolOptions;
use sqlx::types::Json;
use sqlx::{PgPool, Postgres, Transaction};
use tracing::{debug, info};
use uuid::Uuid;

use super::{CompactionReport, GatewayStore};
use crate::error::AppResult;
use crate::models::{
    DailyRollup, LogSummary, NewRequestLog, Plan, Service, ServiceLimits, User, UserWithPlan,
};

/// PostgreSQL-backed store.
#[derive(Clone)]
pub struct PgStore {
    pool: PgPool,
}

/// `user LEFT JOIN plans`; plan columns are all null when the join misses.
#[derive(sqlx::FromRow)]
struct UserPlanRow {
    id: String,
    api_key_hash: Option<String>,
    plan_id: Option<String>,
    plan_expires_at: Option<DateTime<Utc>>,
    joined_plan_id: Option<String>,
    plan_name: Option<String>,
    rate_limit: Option<i32>,
    rate_interval: Option<String>,
    req_per_minute: Option<i32>,
}

impl From<UserPlanRow> for UserWithPlan {
    fn from(row: UserPlanRow) -> Self {
        let plan = match (row.joined_plan_id, row.plan_name, row.rate_limit, row.rate_interval) {
            (Some(plan_id), Some(name), Some(rate_limit), Some(rate_interval)) => Some(Plan {
                plan_id,
                name,
                rate_limit,
                rate_interval,
                req_per_minute: row.req_per_minute,
            }),
            _ => None,
        };

        Self {
            user: User {
                id: row.id,
                api_key_hash: row.api_key_hash,
                plan_id: row.plan_id,
                plan_expires_at: row.plan_expires_at,
            },
            plan,
        }
    }
}

#[derive(sqlx::FromRow)]
struct SummaryRow {
    summary_id: Uuid,
    user_id: String,
    date: NaiveDate,
    total_requests: i32,
    successful_requests: i32,
    failed_requests: i32,
    average_latency_ms: Decimal,
    endpoint_usage: Json<BTreeMap<String, i64>>,
    last_updated: DateTime<Utc>,
}

impl From<SummaryRow> for LogSummary {
    fn from(row: SummaryRow) -> Self {
        Self {
            summary_id: row.summary_id,
            user_id: row.user_id,
            date: row.date,
            total_requests: row.total_requests,
            successful_requests: row.successful_requests,
            failed_requests: row.failed_requests,
            average_latency_ms: row.average_latency_ms,
            endpoint_usage: row.endpoint_usage.0,
            last_updated: row.last_updated,
        }
    }
}

/// One `(user, day)` group of the rows a compaction pass deleted.
#[derive(sqlx::FromRow)]
struct RollupRow {
    user_id: String,
    date: NaiveDate,
    total: i64,
    successful: i64,
    failed: i64,
    latency_sum: i64,
    endpoint_usage: Json<BTreeMap<String, i64>>,
}

impl From<RollupRow> for DailyRollup {
    fn from(row: RollupRow) -> Self {
        Self {
            user_id: row.user_id,
            date: row.date,
            total: row.total,
            successful: row.successful,
            failed: row.failed,
            latency_sum: row.latency_sum,
            endpoint_usage: row.endpoint_usage.0,
        }
    }
}

/// Deletes expired logs and groups them by `(user, UTC day)` in one
/// statement, so only one row per group leaves the database. Endpoint counts
/// are grouped first because `jsonb_object_agg` needs one key per endpoint.
const COMPACT_EXPIRED_LOGS: &str = r#"
    WITH deleted AS (
        DELETE FROM request_logs
        WHERE timestamp < $1
        RETURNING user_id, (timestamp AT TIME ZONE 'UTC')::date AS day,
                  endpoint, status_code, latency_ms
    ),
    per_endpoint AS (
        SELECT user_id, day, endpoint,
               count(*) AS hits,
               count(*) FILTER (WHERE status_code BETWEEN 200 AND 299) AS successful,
               count(*) FILTER (WHERE status_code >= 400) AS failed,
               sum(latency_ms) AS latency_sum
        FROM deleted
        GROUP BY user_id, day, endpoint
    )
    SELECT user_id,
           day AS date,
           sum(hits)::BIGINT AS total,
           sum(successful)::BIGINT AS successful,
           sum(failed)::BIGINT AS failed,
           sum(latency_sum)::BIGINT AS latency_sum,
           jsonb_object_agg(endpoint, hits) AS endpoint_usage
    FROM per_endpoint
    GROUP BY user_id, day
    ORDER BY user_id, day
"#;

const SERVICE_COLUMNS: &str = "id, name, base_url, prefix, is_active";

impl PgStore {
    /// Connect a pool to `database_url`.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Database` if no connection can be established.
    pub async fn connect(database_url: &str, max_connections: u32) -> AppResult<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .acquire_timeout(Duration::from_secs(5))
            .connect(database_url)
            .await?;

        info!(max_connections, "Connected to relational store");
        Ok(Self { pool })
    }

    /// Apply the embedded schema migrations.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Migration` if a migration fails or has been altered.
    pub async fn migrate(&self) -> AppResult<()> {
        sqlx::migrate!("./migrations").run(&self.pool).await?;
        info!("Database migrations applied");
        Ok(())
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Upsert `rollup` into the stored summary for its day. A day that
    /// already has a summary gets the rollup added to its counts rather than
    /// replaced, see [`LogSummary::absorb`].
    async fn merge_rollup(
        tx: &mut Transaction<'_, Postgres>,
        rollup: &DailyRollup,
        now: DateTime<Utc>,
    ) -> AppResult<()> {
        let existing = sqlx::query_as::<_, SummaryRow>(
            r#"
            SELECT summary_id, user_id, date, total_requests, successful_requests,
                   failed_requests, average_latency_ms, endpoint_usage, last_updated
            FROM log_summaries
            WHERE user_id = $1 AND date = $2
            FOR UPDATE
            "#,
        )
        .bind(&rollup.user_id)
        .bind(rollup.date)
        .fetch_optional(&mut **tx)
        .await?;

        let summary = match existing {
            Some(row) => {
                let mut summary = LogSummary::from(row);
                summary.absorb(rollup, now);
                summary
            }
            None => LogSummary::from_rollup(rollup, now),
        };

        sqlx::query(
            r#"
            INSERT INTO log_summaries (
                summary_id, user_id, date, total_requests, successful_requests,
                failed_requests, average_latency_ms, endpoint_usage, last_updated
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
            ON CONFLICT (user_id, date) DO UPDATE SET
                total_requests = EXCLUDED.total_requests,
                successful_requests = EXCLUDED.successful_requests,
                failed_requests = EXCLUDED.failed_requests,
                average_latency_ms = EXCLUDED.average_latency_ms,
                endpoint_usage = EXCLUDED.endpoint_usage,
                last_updated = EXCLUDED.last_updated
            "#,
        )
        .bind(summary.summary_id)
        .bind(&summary.user_id)
        .bind(summary.date)
        .bind(summary.total_requests)
        .bind(summary.successful_requests)
        .bind(summary.failed_requests)
        .bind(summary.average_latency_ms)
        .bind(Json(&summary.endpoint_usage))
        .bind(summary.last_updated)
        .execute(&mut **tx)
        .await?;

        Ok(())
    }
}

#[async_trait]
impl GatewayStore for PgStore {
    async fn find_user_by_key_digest(&self, digest: &str) -> AppResult<Option<UserWithPlan>> {
        let row = sqlx::query_as::<_, UserPlanRow>(
            r#"
            SELECT u.id, u.api_key_hash, u.plan_id, u.plan_expires_at,
                   p.plan_id AS joined_plan_id, p.name AS plan_name,
                   p.rate_limit, p.rate_interval, p.req_per_minute
            FROM "user" u
            LEFT JOIN plans p ON p.plan_id = u.plan_id
            WHERE u.api_key_hash = $1
            LIMIT 1
            "#,
        )
        .bind(digest)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(UserWithPlan::from))
    }

    async fn find_plan(&self, plan_id: &str) -> AppResult<Option<Plan>> {
        let plan = sqlx::query_as::<_, Plan>(
            r#"
            SELECT plan_id, name, rate_limit, rate_interval, req_per_minute
            FROM plans
            WHERE plan_id = $1
            "#,
        )
        .bind(plan_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(plan)
    }

    async fn assign_plan(&self, user_id: &str, plan_id: &str) -> AppResult<()> {
        sqlx::query(
            r#"
            UPDATE "user"
            SET plan_id = $1, plan_expires_at = NULL
            WHERE id = $2
            "#,
        )
        .bind(plan_id)
        .bind(user_id)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn find_service_by_prefix(&self, prefix: &str) -> AppResult<Option<Service>> {
        let service = sqlx::query_as::<_, Service>(&format!(
            "SELECT {SERVICE_COLUMNS} FROM services WHERE prefix = $1 LIMIT 1"
        ))
        .bind(prefix)
        .fetch_optional(&self.pool)
        .await?;

        Ok(service)
    }

    async fn find_default_service(&self) -> AppResult<Option<Service>> {
        let service = sqlx::query_as::<_, Service>(&format!(
            "SELECT {SERVICE_COLUMNS} FROM services WHERE prefix IS NULL \
             ORDER BY is_active DESC, name ASC LIMIT 1"
        ))
        .fetch_optional(&self.pool)
        .await?;

        Ok(service)
    }

    async fn find_any_active_service(&self) -> AppResult<Option<Service>> {
        let service = sqlx::query_as::<_, Service>(&format!(
            "SELECT {SERVICE_COLUMNS} FROM services WHERE is_active ORDER BY name ASC LIMIT 1"
        ))
        .fetch_optional(&self.pool)
        .await?;

        Ok(service)
    }

    async fn find_service_limits(
        &self,
        plan_id: &str,
        service_id: &str,
    ) -> AppResult<Option<ServiceLimits>> {
        let row = sqlx::query_as::<_, (Option<i32>, Option<i32>)>(
            r#"
            SELECT daily_limit, monthly_limit
            FROM plan_services
            WHERE plan_id = $1 AND service_id = $2
            "#,
        )
        .bind(plan_id)
        .bind(service_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(|(daily_limit, monthly_limit)| ServiceLimits {
            daily_limit,
            monthly_limit,
        }))
    }

    async fn insert_request_log(&self, entry: &NewRequestLog) -> AppResult<()> {
        sqlx::query(
            r#"
            INSERT INTO request_logs (
                log_id, user_id, timestamp, endpoint, method, status_code, latency_ms,
                ip_address, query_params, request_headers, response_headers, response_body
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12)
            "#,
        )
        .bind(entry.log_id)
        .bind(&entry.user_id)
        .bind(entry.timestamp)
        .bind(&entry.endpoint)
        .bind(&entry.method)
        .bind(entry.status_code)
        .bind(entry.latency_ms)
        .bind(&entry.ip_address)
        .bind(Json(&entry.query_params))
        .bind(Json(&entry.request_headers))
        .bind(Json(&entry.response_headers))
        .bind(&entry.response_body)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn compact_request_logs(&self, cutoff: DateTime<Utc>) -> AppResult<CompactionReport> {
        let now = Utc::now();
        let mut tx = self.pool.begin().await?;

        // Deleting and grouping in one statement summarises exactly the rows removed.
        let rollups: Vec<DailyRollup> = sqlx::query_as::<_, RollupRow>(COMPACT_EXPIRED_LOGS)
            .bind(cutoff)
            .fetch_all(&mut *tx)
            .await?
            .into_iter()
            .map(DailyRollup::from)
            .collect();

        for rollup in &rollups {
            Self::merge_rollup(&mut tx, rollup, now).await?;
        }

        tx.commit().await?;

        let rows_deleted = rollups
            .iter()
            .map(|rollup| u64::try_from(rollup.total).unwrap_or(0))
            .sum::<u64>();
        debug!(
            rows = rows_deleted,
            summaries = rollups.len(),
            "Compaction transaction committed"
        );

        Ok(CompactionReport {
            cutoff,
            rows_deleted,
            summaries_written: rollups.len(),
        })
    }

    async fn ping(&self) -> AppResult<()> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }
}

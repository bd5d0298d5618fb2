//! Relational state: users, plans, services, overrides, request logs and
//! their daily summaries.
//!
//! Everything the request path reads is a point lookup; the only write on the
//! request path is the plan downgrade, and the only multi-statement operation
//! is [`GatewayStore::compact_request_logs`], which must be all-or-nothing.

mod memory;
mod postgres;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::error::AppResult;
use crate::models::{NewRequestLog, Plan, Service, ServiceLimits, UserWithPlan};

pub use self::memory::MemoryStore;
pub use self::postgres::PgStore;

/// Outcome of one compaction pass.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompactionReport {
    /// Logs strictly older than this instant were compacted
    pub cutoff: DateTime<Utc>,
    /// Request log rows deleted
    pub rows_deleted: u64,
    /// `(user, day)` summaries created or merged
    pub summaries_written: usize,
}

#[async_trait]
pub trait GatewayStore: Send + Sync {
    /// User owning the given API key digest, joined with its plan.
    async fn find_user_by_key_digest(&self, digest: &str) -> AppResult<Option<UserWithPlan>>;

    async fn find_plan(&self, plan_id: &str) -> AppResult<Option<Plan>>;

    /// Point the user at `plan_id` and clear its expiry.
    async fn assign_plan(&self, user_id: &str, plan_id: &str) -> AppResult<()>;

    /// Service registered under `prefix`, active or not.
    async fn find_service_by_prefix(&self, prefix: &str) -> AppResult<Option<Service>>;

    /// Prefix-less service, preferring an active one.
    async fn find_default_service(&self) -> AppResult<Option<Service>>;

    /// First active service by name.
    async fn find_any_active_service(&self) -> AppResult<Option<Service>>;

    /// Caps for `(plan, service)`; `None` when no override row exists.
    async fn find_service_limits(
        &self,
        plan_id: &str,
        service_id: &str,
    ) -> AppResult<Option<ServiceLimits>>;

    async fn insert_request_log(&self, entry: &NewRequestLog) -> AppResult<()>;

    /// Fold every request log older than `cutoff` into its daily summary and
    /// delete it, in one transaction.
    async fn compact_request_logs(&self, cutoff: DateTime<Utc>) -> AppResult<CompactionReport>;

    async fn ping(&self) -> AppResult<()>;
}

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use tokio::sync::RwLock;

use super::{CompactionReport, GatewayStore};
use crate::error::{AppError, AppResult};
use crate::models::{
    CompactableLog, LogSummary, NewRequestLog, Plan, Service, ServiceLimits, User, UserWithPlan,
    summarize,
};

#[derive(Debug, Default)]
struct Tables {
    users: HashMap<String, User>,
    plans: HashMap<String, Plan>,
    services: HashMap<String, Service>,
    limits: HashMap<(String, String), ServiceLimits>,
    request_logs: Vec<NewRequestLog>,
    summaries: BTreeMap<(String, NaiveDate), LogSummary>,
}

/// In-process store for tests and local development.
///
/// All tables sit behind one lock. Compaction stages its deletes and summary
/// merges and applies them together, so a failed pass leaves both untouched.
#[derive(Debug, Default)]
pub struct MemoryStore {
    tables: RwLock<Tables>,
    fail_log_inserts: AtomicBool,
    fail_compaction: AtomicBool,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn insert_user(&self, user: User) {
        self.tables.write().await.users.insert(user.id.clone(), user);
    }

    pub async fn insert_plan(&self, plan: Plan) {
        self.tables
            .write()
            .await
            .plans
            .insert(plan.plan_id.clone(), plan);
    }

    pub async fn insert_service(&self, service: Service) {
        self.tables
            .write()
            .await
            .services
            .insert(service.id.clone(), service);
    }

    pub async fn set_service_limits(&self, plan_id: &str, service_id: &str, limits: ServiceLimits) {
        self.tables
            .write()
            .await
            .limits
            .insert((plan_id.to_string(), service_id.to_string()), limits);
    }

    pub async fn user(&self, user_id: &str) -> Option<User> {
        self.tables.read().await.users.get(user_id).cloned()
    }

    /// Snapshot of stored request logs in insertion order.
    pub async fn request_logs(&self) -> Vec<NewRequestLog> {
        self.tables.read().await.request_logs.clone()
    }

    /// Snapshot of summaries ordered by user, then day.
    pub async fn summaries(&self) -> Vec<LogSummary> {
        self.tables.read().await.summaries.values().cloned().collect()
    }

    /// Make subsequent request log inserts fail, to exercise error paths.
    pub fn fail_log_inserts(&self, fail: bool) {
        self.fail_log_inserts.store(fail, Ordering::SeqCst);
    }

    /// Make subsequent compactions fail after the summaries are staged but
    /// before anything is applied.
    pub fn fail_compaction(&self, fail: bool) {
        self.fail_compaction.store(fail, Ordering::SeqCst);
    }
}

#[async_trait]
impl GatewayStore for MemoryStore {
    async fn find_user_by_key_digest(&self, digest: &str) -> AppResult<Option<UserWithPlan>> {
        let tables = self.tables.read().await;
        Ok(tables
            .users
            .values()
            .find(|u| u.api_key_hash.as_deref() == Some(digest))
            .map(|user| UserWithPlan {
                plan: user
                    .plan_id
                    .as_ref()
                    .and_then(|id| tables.plans.get(id))
                    .cloned(),
                user: user.clone(),
            }))
    }

    async fn find_plan(&self, plan_id: &str) -> AppResult<Option<Plan>> {
        Ok(self.tables.read().await.plans.get(plan_id).cloned())
    }

    async fn assign_plan(&self, user_id: &str, plan_id: &str) -> AppResult<()> {
        let mut tables = self.tables.write().await;
        let user = tables
            .users
            .get_mut(user_id)
            .ok_or_else(|| AppError::Internal(format!("user {user_id} disappeared")))?;
        user.plan_id = Some(plan_id.to_string());
        user.plan_expires_at = None;
        Ok(())
    }

    async fn find_service_by_prefix(&self, prefix: &str) -> AppResult<Option<Service>> {
        Ok(self
            .tables
            .read()
            .await
            .services
            .values()
            .find(|s| s.prefix.as_deref() == Some(prefix))
            .cloned())
    }

    async fn find_default_service(&self) -> AppResult<Option<Service>> {
        let tables = self.tables.read().await;
        Ok(tables
            .services
            .values()
            .filter(|s| s.prefix.is_none())
            .min_by(|a, b| b.is_active.cmp(&a.is_active).then_with(|| a.name.cmp(&b.name)))
            .cloned())
    }

    async fn find_any_active_service(&self) -> AppResult<Option<Service>> {
        let tables = self.tables.read().await;
        Ok(tables
            .services
            .values()
            .filter(|s| s.is_active)
            .min_by(|a, b| a.name.cmp(&b.name))
            .cloned())
    }

    async fn find_service_limits(
        &self,
        plan_id: &str,
        service_id: &str,
    ) -> AppResult<Option<ServiceLimits>> {
        Ok(self
            .tables
            .read()
            .await
            .limits
            .get(&(plan_id.to_string(), service_id.to_string()))
            .copied())
    }

    async fn insert_request_log(&self, entry: &NewRequestLog) -> AppResult<()> {
        if self.fail_log_inserts.load(Ordering::SeqCst) {
            return Err(AppError::Internal("request log insert rejected".to_string()));
        }
        self.tables.write().await.request_logs.push(entry.clone());
        Ok(())
    }

    async fn compact_request_logs(&self, cutoff: DateTime<Utc>) -> AppResult<CompactionReport> {
        let now = Utc::now();
        let mut tables = self.tables.write().await;

        let (expired, kept): (Vec<_>, Vec<_>) = tables
            .request_logs
            .iter()
            .cloned()
            .partition(|entry| entry.timestamp < cutoff);

        let projected: Vec<CompactableLog> = expired.iter().map(CompactableLog::from).collect();
        let rollups = summarize(&projected);

        let mut summaries = tables.summaries.clone();
        for rollup in &rollups {
            summaries
                .entry((rollup.user_id.clone(), rollup.date))
                .and_modify(|summary| summary.absorb(rollup, now))
                .or_insert_with(|| LogSummary::from_rollup(rollup, now));
        }

        if self.fail_compaction.load(Ordering::SeqCst) {
            return Err(AppError::Internal("summary upsert rejected".to_string()));
        }

        tables.request_logs = kept;
        tables.summaries = summaries;

        Ok(CompactionReport {
            cutoff,
            rows_deleted: expired.len() as u64,
            summaries_written: rollups.len(),
        })
    }

    async fn ping(&self) -> AppResult<()> {
        Ok(())
    }
}

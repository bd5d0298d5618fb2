//! Shared application state for Axum handlers.
//!
//! This module provides thread-safe, clonable state that is shared across
//! all request handlers and middleware. It includes:
//!
//! - **Stores**: The relational store (users, plans, services, logs) and the
//!   counter store backing every quota window
//! - **Gateway services**: Credential resolver, rate limit engine, service
//!   router, forwarder and audit logger
//! - **Configuration**: Runtime configuration access
//!
//! # Structured Concurrency
//!
//! Background tasks (the audit writer and the retention scheduler) are
//! managed using `tokio_util::task::TaskTracker` and `CancellationToken`.
//! Call `shutdown()` after the HTTP server stops so queued audit entries are
//! written before the process exits.

use std::sync::Arc;
use std::time::Instant;

use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::info;

use crate::config::Config;
use crate::counter::CounterStore;
use crate::error::AppResult;
use crate::middleware::{AuthFailureGuard, TrustedProxyConfig};
use crate::ratelimit::RateLimitEngine;
use crate::services::{
    AuditLogger, CredentialResolver, CronSchedule, Forwarder, RetentionCompactor, RetentionJob,
    ServiceRouter,
};
use crate::store::GatewayStore;

/// Shared application state for Axum handlers.
///
/// Cloned for each request; every field is cheap to clone.
///
/// # Lifecycle
///
/// The audit worker is spawned when the state is created. Call `shutdown()`
/// before dropping to drain it:
///
/// ```rust,ignore
/// let state = AppState::new(config, store, counters)?;
/// state.spawn_retention_task();
/// // ... serve ...
/// state.shutdown().await;  // Cancel the scheduler, drain the audit queue
/// ```
#[derive(Clone)]
pub struct AppState {
    /// Application configuration
    pub config: Arc<Config>,
    /// Users, plans, services, request logs and summaries
    pub store: Arc<dyn GatewayStore>,
    /// Quota window counters
    pub counters: Arc<dyn CounterStore>,
    /// API key to principal resolution
    pub credentials: CredentialResolver,
    /// Per-IP throttle on failed API keys
    pub auth_failures: AuthFailureGuard,
    /// Anti-spam, plan and per-service quotas
    pub limits: RateLimitEngine,
    /// Proxy path to upstream service
    pub router: ServiceRouter,
    /// Upstream HTTP client
    pub forwarder: Forwarder,
    /// Non-blocking request log writer
    pub audit: AuditLogger,
    /// Networks whose forwarding headers are honoured
    pub trusted_proxies: Arc<TrustedProxyConfig>,
    /// Timestamp when the application started
    pub started_at: Instant,
    /// Scheduled log retention, `None` when disabled
    retention: Option<Arc<RetentionJob>>,
    /// Tracks spawned background tasks for graceful shutdown
    task_tracker: TaskTracker,
    /// Cancellation token for signaling background tasks to stop
    cancellation_token: CancellationToken,
}

impl AppState {
    /// Build the gateway services on top of the given stores.
    ///
    /// Spawns the audit worker. The retention scheduler is started separately
    /// with [`spawn_retention_task`](Self::spawn_retention_task).
    ///
    /// # Errors
    ///
    /// Returns `AppError::ConfigError` if the upstream client cannot be built
    /// or the retention schedule does not parse.
    pub fn new(
        config: Config,
        store: Arc<dyn GatewayStore>,
        counters: Arc<dyn CounterStore>,
    ) -> AppResult<Self> {
        let task_tracker = TaskTracker::new();
        let cancellation_token = CancellationToken::new();

        let retention = if config.log_retention_enabled {
            let schedule =
                CronSchedule::parse(&config.log_retention_cron, config.log_retention_timezone)?;
            let compactor = RetentionCompactor::new(store.clone(), config.retention_period());
            Some(Arc::new(RetentionJob::new(compactor, schedule)))
        } else {
            None
        };

        let audit = AuditLogger::spawn(
            store.clone(),
            config.audit_queue_capacity,
            config.audit_body_max_chars,
            &task_tracker,
            cancellation_token.clone(),
        );

        Ok(Self {
            credentials: CredentialResolver::new(store.clone(), config.default_plan_id.clone()),
            auth_failures: AuthFailureGuard::new(config.auth_failure_limit_per_minute),
            limits: RateLimitEngine::new(counters.clone()),
            router: ServiceRouter::new(store.clone(), config.router_any_active_fallback),
            forwarder: Forwarder::new(config.upstream_timeout)?,
            trusted_proxies: Arc::new(TrustedProxyConfig::new(&config.trusted_proxies)),
            audit,
            store,
            counters,
            started_at: Instant::now(),
            config: Arc::new(config),
            retention,
            task_tracker,
            cancellation_token,
        })
    }

    /// Start the retention scheduler if log retention is enabled.
    ///
    /// Runs once immediately, then on every cron firing until `shutdown()`.
    pub fn spawn_retention_task(&self) {
        match &self.retention {
            Some(job) => {
                info!(
                    cron = %self.config.log_retention_cron,
                    timezone = %job.schedule().timezone(),
                    retention_days = self.config.log_retention_days,
                    "Log retention scheduled"
                );
                job.clone()
                    .spawn(&self.task_tracker, self.cancellation_token.clone());
            }
            None => info!("Log retention disabled (LOG_RETENTION_ENABLED=false)"),
        }
    }

    /// The retention job, if enabled.
    pub fn retention(&self) -> Option<&Arc<RetentionJob>> {
        self.retention.as_ref()
    }

    /// Gracefully shutdown all background tasks.
    ///
    /// This method:
    /// 1. Signals all tasks to stop via cancellation token
    /// 2. Closes the task tracker (prevents new tasks)
    /// 3. Waits for all tasks to complete, including the audit drain
    pub async fn shutdown(&self) {
        info!("Initiating graceful shutdown of background tasks");

        self.cancellation_token.cancel();
        self.task_tracker.close();
        self.task_tracker.wait().await;

        info!(
            audit_dropped = self.audit.dropped(),
            "All background tasks have completed"
        );
    }

    /// Get the application uptime in seconds.
    pub fn uptime_seconds(&self) -> u64 {
        self.started_at.elapsed().as_secs()
    }
}

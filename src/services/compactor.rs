//! Request log retention.
//!
//! [`RetentionCompactor`] folds request logs older than the retention window
//! into per-user daily summaries and deletes them. [`RetentionJob`] runs it
//! once at startup and then on a cron schedule, never twice at once.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, instrument, warn};

use super::scheduler::{CronSchedule, SingleFlight};
use crate::error::AppResult;
use crate::metrics;
use crate::store::{CompactionReport, GatewayStore};

#[derive(Clone)]
pub struct RetentionCompactor {
    store: Arc<dyn GatewayStore>,
    retention: chrono::Duration,
}

impl RetentionCompactor {
    pub fn new(store: Arc<dyn GatewayStore>, retention: chrono::Duration) -> Self {
        Self { store, retention }
    }

    /// Logs strictly older than this are compacted.
    pub fn cutoff(&self, now: DateTime<Utc>) -> DateTime<Utc> {
        now - self.retention
    }

    /// Compact everything older than `now - retention` in one transaction.
    #[instrument(skip(self), fields(cutoff = %self.cutoff(now)))]
    pub async fn run_at(&self, now: DateTime<Utc>) -> AppResult<CompactionReport> {
        self.store.compact_request_logs(self.cutoff(now)).await
    }
}

/// Result of one [`RetentionJob::trigger`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RunOutcome {
    Ran(CompactionReport),
    /// Another run was in progress
    Skipped,
    Failed(String),
}

/// Scheduled, single-flight driver for the [`RetentionCompactor`].
pub struct RetentionJob {
    compactor: RetentionCompactor,
    schedule: CronSchedule,
    flight: SingleFlight,
}

impl RetentionJob {
    pub fn new(compactor: RetentionCompactor, schedule: CronSchedule) -> Self {
        Self {
            compactor,
            schedule,
            flight: SingleFlight::new(),
        }
    }

    pub fn schedule(&self) -> &CronSchedule {
        &self.schedule
    }

    /// Run now unless a run is already in progress.
    pub async fn trigger(&self) -> RunOutcome {
        self.trigger_at(Utc::now()).await
    }

    pub async fn trigger_at(&self, now: DateTime<Utc>) -> RunOutcome {
        let Some(_flight) = self.flight.try_acquire() else {
            metrics::record_compaction_run("skipped", 0);
            info!("Log retention already running, skipping this firing");
            return RunOutcome::Skipped;
        };

        match self.compactor.run_at(now).await {
            Ok(report) => {
                metrics::record_compaction_run("success", report.rows_deleted);
                info!(
                    cutoff = %report.cutoff,
                    rows_deleted = report.rows_deleted,
                    summaries_written = report.summaries_written,
                    "Log retention completed"
                );
                RunOutcome::Ran(report)
            }
            Err(e) => {
                metrics::record_compaction_run("failure", 0);
                error!(error = %e, "Log retention failed, transaction rolled back");
                RunOutcome::Failed(e.to_string())
            }
        }
    }

    /// Warm-up run, then one run per cron firing until `cancel`.
    ///
    /// Each firing is its own tracked task so a slow run does not delay the
    /// schedule; overlapping firings are skipped by the single-flight guard.
    pub fn spawn(self: Arc<Self>, tracker: &TaskTracker, cancel: CancellationToken) {
        let runs = tracker.clone();

        tracker.spawn(async move {
            let warm_up = self.clone();
            runs.spawn(async move {
                warm_up.trigger().await;
            });

            loop {
                let Some(wait) = self.schedule.until_next(Utc::now()) else {
                    warn!("Retention schedule has no upcoming firing, scheduler stopping");
                    break;
                };
                debug!(wait_secs = wait.as_secs(), "Next log retention run scheduled");

                tokio::select! {
                    biased;

                    _ = cancel.cancelled() => {
                        debug!("Retention scheduler received cancellation signal");
                        break;
                    }
                    _ = tokio::time::sleep(wait) => {
                        let job = self.clone();
                        runs.spawn(async move {
                            job.trigger().await;
                        });
                    }
                }
            }

            debug!("Retention scheduler shutting down");
        });
    }
}

//! Prometheus metrics for gateway observability.
//!
//! Metrics are exposed via a dedicated HTTP listener (default: `0.0.0.0:9090`),
//! separate from the public API port.
//!
//! # Available Metrics
//!
//! ## Counters
//! - `gateway_proxied_requests_total` - Requests answered by an upstream (labels: service, status)
//! - `gateway_upstream_errors_total` - Upstream calls that failed at the network level (labels: service)
//! - `gateway_limit_rejections_total` - Requests rejected by a quota tier (labels: kind)
//! - `gateway_plan_downgrades_total` - Expired plans downgraded to the default plan
//! - `gateway_audit_dropped_total` - Audit entries dropped because the queue was full
//! - `gateway_audit_write_failures_total` - Audit entries the store refused
//! - `gateway_compaction_runs_total` - Retention compactor runs (labels: outcome)
//! - `gateway_compacted_rows_total` - Request log rows folded into summaries
//!
//! ## Histograms
//! - `gateway_upstream_duration_seconds` - Time from authentication to upstream body read (labels: service)
//!
//! ## Gauges
//! - `gateway_audit_queue_depth` - Entries waiting for the audit worker
//!
//! # Usage
//!
//! ```rust,ignore
//! use metered_gateway::metrics::{init_metrics, record_proxied_request};
//!
//! // Initialize metrics (call once at startup)
//! init_metrics(addr)?;
//!
//! // Record metrics in handlers
//! record_proxied_request("weather", 200, 0.045);
//! ```

use metrics::{counter, describe_counter, describe_gauge, describe_histogram, gauge, histogram};
use metrics_exporter_prometheus::PrometheusBuilder;
use std::net::SocketAddr;
use tracing::{error, info};

/// Metric names as constants for consistency.
pub mod names {
    pub const PROXIED_REQUESTS_TOTAL: &str = "gateway_proxied_requests_total";
    pub const UPSTREAM_ERRORS_TOTAL: &str = "gateway_upstream_errors_total";
    pub const LIMIT_REJECTIONS_TOTAL: &str = "gateway_limit_rejections_total";
    pub const PLAN_DOWNGRADES_TOTAL: &str = "gateway_plan_downgrades_total";
    pub const AUDIT_DROPPED_TOTAL: &str = "gateway_audit_dropped_total";
    pub const AUDIT_WRITE_FAILURES_TOTAL: &str = "gateway_audit_write_failures_total";
    pub const COMPACTION_RUNS_TOTAL: &str = "gateway_compaction_runs_total";
    pub const COMPACTED_ROWS_TOTAL: &str = "gateway_compacted_rows_total";
    pub const UPSTREAM_DURATION_SECONDS: &str = "gateway_upstream_duration_seconds";
    pub const AUDIT_QUEUE_DEPTH: &str = "gateway_audit_queue_depth";
}

/// Initialize the Prometheus metrics exporter.
///
/// This sets up metric descriptions and starts the Prometheus HTTP listener
/// on the specified address.
///
/// # Errors
///
/// Returns a message if the exporter cannot be installed (e.g. port in use).
pub fn init_metrics(metrics_addr: SocketAddr) -> Result<(), String> {
    PrometheusBuilder::new()
        .with_http_listener(metrics_addr)
        .install()
        .map_err(|e| format!("Failed to install Prometheus exporter: {e}"))?;

    describe_counter!(
        names::PROXIED_REQUESTS_TOTAL,
        "Requests forwarded to an upstream that returned a response"
    );
    describe_counter!(
        names::UPSTREAM_ERRORS_TOTAL,
        "Upstream calls that failed before a response was read"
    );
    describe_counter!(
        names::LIMIT_REJECTIONS_TOTAL,
        "Requests rejected by anti-spam, plan or service quotas"
    );
    describe_counter!(
        names::PLAN_DOWNGRADES_TOTAL,
        "Users moved to the default plan after their plan expired"
    );
    describe_counter!(
        names::AUDIT_DROPPED_TOTAL,
        "Audit entries dropped because the queue was full"
    );
    describe_counter!(
        names::AUDIT_WRITE_FAILURES_TOTAL,
        "Audit entries that failed to persist"
    );
    describe_counter!(
        names::COMPACTION_RUNS_TOTAL,
        "Retention compactor runs by outcome"
    );
    describe_counter!(
        names::COMPACTED_ROWS_TOTAL,
        "Request log rows summarised and deleted"
    );

    describe_histogram!(
        names::UPSTREAM_DURATION_SECONDS,
        "Latency from authentication to upstream body read in seconds"
    );

    describe_gauge!(
        names::AUDIT_QUEUE_DEPTH,
        "Audit entries waiting to be written"
    );

    info!(addr = %metrics_addr, "Prometheus metrics endpoint started");
    Ok(())
}

/// Try to initialize metrics, logging any errors but not failing.
pub fn try_init_metrics(metrics_addr: SocketAddr) {
    if let Err(e) = init_metrics(metrics_addr) {
        error!(error = %e, "Failed to initialize metrics, continuing without metrics");
    }
}

// =============================================================================
// Counter Recording Functions
// =============================================================================

/// Record a request the upstream answered, with its latency.
pub fn record_proxied_request(service: &str, status: u16, duration_secs: f64) {
    counter!(names::PROXIED_REQUESTS_TOTAL, "service" => service.to_string(), "status" => status.to_string())
        .increment(1);
    histogram!(names::UPSTREAM_DURATION_SECONDS, "service" => service.to_string())
        .record(duration_secs);
}

/// Record an upstream network failure.
pub fn record_upstream_error(service: &str) {
    counter!(names::UPSTREAM_ERRORS_TOTAL, "service" => service.to_string()).increment(1);
}

/// Record a quota rejection (`anti_spam`, `plan`, `service_daily`, ...).
pub fn record_limit_rejection(kind: &'static str) {
    counter!(names::LIMIT_REJECTIONS_TOTAL, "kind" => kind).increment(1);
}

pub fn record_plan_downgrade() {
    counter!(names::PLAN_DOWNGRADES_TOTAL).increment(1);
}

pub fn record_audit_dropped() {
    counter!(names::AUDIT_DROPPED_TOTAL).increment(1);
}

pub fn record_audit_write_failure() {
    counter!(names::AUDIT_WRITE_FAILURES_TOTAL).increment(1);
}

/// Record a compactor run. `outcome` is `success`, `failure` or `skipped`.
pub fn record_compaction_run(outcome: &'static str, rows_deleted: u64) {
    counter!(names::COMPACTION_RUNS_TOTAL, "outcome" => outcome).increment(1);
    if rows_deleted > 0 {
        counter!(names::COMPACTED_ROWS_TOTAL).increment(rows_deleted);
    }
}

// =============================================================================
// Gauge Recording Functions
// =============================================================================

pub fn set_audit_queue_depth(depth: usize) {
    gauge!(names::AUDIT_QUEUE_DEPTH).set(depth as f64);
}

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Success envelope shared by every JSON endpoint.
#[derive(Debug, Serialize, Deserialize)]
pub struct ApiResponse<T> {
    /// Always `true` for successful responses
    pub status: bool,
    /// Endpoint payload
    pub data: T,
}

impl<T> ApiResponse<T> {
    pub fn ok(data: T) -> Self {
        Self { status: true, data }
    }
}

/// Payload of `GET /`.
#[derive(Debug, Serialize, Deserialize)]
pub struct IndexData {
    /// Gateway display name
    pub name: String,
    /// Crate version
    pub version: String,
    /// Public endpoint paths
    pub endpoints: EndpointIndex,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct EndpointIndex {
    pub health: String,
    pub usage: String,
    pub proxy: String,
}

/// Payload of `GET /health`.
#[derive(Debug, Serialize, Deserialize)]
pub struct HealthData {
    /// Liveness flag; the process answering is enough
    pub healthy: bool,
    /// Current timestamp
    pub timestamp: DateTime<Utc>,
}

/// Payload of `GET /ready`.
#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReadinessData {
    /// Whether every dependency answered
    pub ready: bool,
    /// Relational store reachable
    pub store: bool,
    /// Counter store reachable
    pub counters: bool,
    /// Audit entries dropped since startup because the queue was full
    pub audit_dropped: u64,
    /// Uptime in seconds
    pub uptime_seconds: u64,
}

/// Payload of `GET /user/usage`.
#[derive(Debug, Serialize, Deserialize)]
pub struct UsageData {
    pub plan: PlanInfo,
    pub usage: UsageInfo,
}

/// The caller's plan as shown on the usage endpoint.
#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PlanInfo {
    pub name: String,
    pub limit: i64,
    pub interval: String,
    /// Plan expiry, `null` for plans that never expire
    pub expired_at: Option<DateTime<Utc>>,
}

/// Counter snapshot for the current plan window.
#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UsageInfo {
    pub used: i64,
    pub remaining: i64,
    /// Last instant of the current window
    pub reset_at: DateTime<Utc>,
}

//! Index, health and readiness endpoints.
//!
//! # Endpoints
//!
//! - `GET /` - Gateway name, version and public endpoints
//! - `GET /health` - Liveness; 200 whenever the process can answer
//! - `GET /ready` - Readiness; 503 unless both stores respond
//! - fallback - `404 NOT_FOUND` for every other route
//!
//! None of these require an API key.

use axum::Json;
use axum::extract::State;
use axum::http::StatusCode;
use chrono::Utc;
use tracing::{instrument, warn};

use crate::error::AppError;
use crate::models::{ApiResponse, EndpointIndex, HealthData, IndexData, ReadinessData};
use crate::state::AppState;

pub const GATEWAY_NAME: &str = "Metered API Gateway";

/// Index endpoint.
pub async fn index() -> Json<ApiResponse<IndexData>> {
    Json(ApiResponse::ok(IndexData {
        name: GATEWAY_NAME.to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        endpoints: EndpointIndex {
            health: "GET /health".to_string(),
            usage: "GET /user/usage".to_string(),
            proxy: "ALL /proxy/*".to_string(),
        },
    }))
}

/// Health check endpoint.
///
/// ```json
/// { "status": true, "data": { "healthy": true, "timestamp": "2024-01-15T10:30:00Z" } }
/// ```
pub async fn health_check() -> Json<ApiResponse<HealthData>> {
    Json(ApiResponse::ok(HealthData {
        healthy: true,
        timestamp: Utc::now(),
    }))
}

/// Readiness check endpoint for load balancer and Kubernetes probes.
///
/// Pings the relational store and the counter store; answers 503 with the
/// same body when either fails.
#[instrument(skip(state))]
pub async fn readiness_check(
    State(state): State<AppState>,
) -> (StatusCode, Json<ApiResponse<ReadinessData>>) {
    let (store, counters) = tokio::join!(state.store.ping(), state.counters.ping());

    if let Err(e) = &store {
        warn!(error = %e, "Readiness: relational store unreachable");
    }
    if let Err(e) = &counters {
        warn!(error = %e, "Readiness: counter store unreachable");
    }

    let data = ReadinessData {
        ready: store.is_ok() && counters.is_ok(),
        store: store.is_ok(),
        counters: counters.is_ok(),
        audit_dropped: state.audit.dropped(),
        uptime_seconds: state.uptime_seconds(),
    };
    let status = if data.ready {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };

    (
        status,
        Json(ApiResponse {
            status: data.ready,
            data,
        }),
    )
}

/// JSON 404 for unknown routes.
pub async fn not_found() -> AppError {
    AppError::NotFound
}

//! `ALL /proxy/*`: the metered proxy.
//!
//! By the time [`proxy`] runs, the middleware has authenticated the caller
//! and charged the anti-spam and plan windows. The handler then:
//!
//! 1. resolves the target service from the path
//! 2. checks the per-service daily/monthly caps (read only)
//! 3. forwards the request and buffers the upstream response
//! 4. charges the service counters
//! 5. overlays quota headers and queues an audit entry
//!
//! Failures from step 1 onward are audited too, with the JSON error body as
//! the recorded response.

use std::collections::BTreeMap;

use axum::body::Body;
use axum::extract::{Request, State};
use axum::http::request::Parts;
use axum::http::{HeaderMap, StatusCode};
use axum::Extension;
use axum::response::{IntoResponse, Response};
use bytes::Bytes;
use chrono::Utc;
use tracing::{info, instrument, warn};
use uuid::Uuid;

use crate::error::AppResult;
use crate::metrics;
use crate::middleware::ClientIp;
use crate::models::NewRequestLog;
use crate::ratelimit::PlanQuota;
use crate::services::audit::{header_snapshot, query_params};
use crate::services::forwarder::read_request_body;
use crate::services::router::proxy_segments;
use crate::services::Principal;
use crate::state::AppState;

/// Request-side fields of the audit entry, captured before forwarding.
struct AuditContext {
    user_id: String,
    endpoint: String,
    method: String,
    ip_address: Option<String>,
    query_params: BTreeMap<String, String>,
    request_headers: BTreeMap<String, String>,
}

impl AuditContext {
    fn capture(principal: &Principal, parts: &Parts, client_ip: ClientIp) -> Self {
        Self {
            user_id: principal.user.id.clone(),
            endpoint: parts.uri.path().to_string(),
            method: parts.method.to_string(),
            ip_address: client_ip.0,
            query_params: query_params(&parts.uri),
            request_headers: header_snapshot(&parts.headers),
        }
    }

    fn into_entry(
        self,
        status: StatusCode,
        latency_ms: i32,
        response_headers: BTreeMap<String, String>,
        response_body: Option<String>,
    ) -> NewRequestLog {
        NewRequestLog {
            log_id: Uuid::new_v4(),
            user_id: self.user_id,
            timestamp: Utc::now(),
            endpoint: self.endpoint,
            method: self.method,
            status_code: i32::from(status.as_u16()),
            latency_ms,
            ip_address: self.ip_address,
            query_params: self.query_params,
            request_headers: self.request_headers,
            response_headers,
            response_body,
        }
    }
}

/// A buffered upstream response with quota headers applied.
struct Proxied {
    status: StatusCode,
    headers: HeaderMap,
    body: Bytes,
    latency_ms: i32,
}

impl IntoResponse for Proxied {
    fn into_response(self) -> Response {
        (self.status, self.headers, self.body).into_response()
    }
}

/// Proxy handler.
#[instrument(
    skip_all,
    fields(user_id = %principal.user.id, method = %request.method(), path = %request.uri().path())
)]
pub async fn proxy(
    State(state): State<AppState>,
    Extension(principal): Extension<Principal>,
    Extension(plan_quota): Extension<PlanQuota>,
    Extension(client_ip): Extension<ClientIp>,
    request: Request,
) -> Response {
    let (parts, body) = request.into_parts();
    let audit = AuditContext::capture(&principal, &parts, client_ip);

    match forward(&state, &principal, plan_quota, &parts, body).await {
        Ok(proxied) => {
            let entry = audit.into_entry(
                proxied.status,
                proxied.latency_ms,
                header_snapshot(&proxied.headers),
                Some(state.audit.body_text(&proxied.body)),
            );
            state.audit.record(entry);
            proxied.into_response()
        }
        Err(err) => {
            let recorded_body = serde_json::to_string(&err.body()).ok();
            let entry = audit.into_entry(
                err.status_code(),
                principal.elapsed_ms(),
                BTreeMap::new(),
                recorded_body,
            );
            state.audit.record(entry);
            err.into_response()
        }
    }
}

async fn forward(
    state: &AppState,
    principal: &Principal,
    plan_quota: PlanQuota,
    parts: &Parts,
    body: Body,
) -> AppResult<Proxied> {
    let route = state.router.resolve(&proxy_segments(parts.uri.path())).await?;
    let service = &route.service;
    let now = Utc::now();

    let limits = state
        .store
        .find_service_limits(&principal.plan.plan_id, &service.id)
        .await?;
    let service_quota = state
        .limits
        .check_service_quota(&principal.user.id, service, limits, now)
        .await?;

    let body = read_request_body(&parts.method, body, state.config.max_request_body_size).await?;
    let upstream = state.forwarder.forward(&route, parts, body).await?;
    let latency_ms = principal.elapsed_ms();

    if let Err(e) = state
        .limits
        .record_service_usage(&principal.user.id, &service.id, now)
        .await
    {
        warn!(error = %e, service = %service.name, "Failed to record service usage");
    }

    metrics::record_proxied_request(
        &service.name,
        upstream.status.as_u16(),
        principal.started_at.elapsed().as_secs_f64(),
    );
    info!(
        service = %service.name,
        status = upstream.status.as_u16(),
        latency_ms,
        "Proxied request"
    );

    let mut headers = upstream.headers;
    plan_quota.apply_headers(&mut headers);
    service_quota.apply_headers(&mut headers);

    Ok(Proxied {
        status: upstream.status,
        headers,
        body: upstream.body,
        latency_ms,
    })
}

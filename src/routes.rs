//! Application routing configuration with middleware stack.
//!
//! # Middleware Stack
//!
//! ```text
//! Request
//!    │
//!    ▼
//! ┌──────────────────┐
//! │   Request ID     │ ← Sets/propagates X-Request-Id
//! └────────┬─────────┘
//!          ▼
//! ┌──────────────────┐
//! │     Tracing      │ ← HTTP request/response logging
//! └────────┬─────────┘
//!          ▼
//! ┌──────────────────┐
//! │   CORS / Body    │ ← Cross-origin headers, body size limit
//! └────────┬─────────┘
//!          ▼
//! ┌──────────────────┐
//! │  Authentication  │ ← 401 / 429 (/user/usage and /proxy only)
//! └────────┬─────────┘
//!          ▼
//! ┌──────────────────┐
//! │   Plan Limits    │ ← 429 anti-spam or plan quota (/proxy only)
//! └────────┬─────────┘
//!          ▼
//! ┌──────────────────┐
//! │ Request Timeout  │ ← X-Request-Timeout override (/proxy only)
//! └────────┬─────────┘
//!          ▼
//!      Handler
//! ```
//!
//! # Route Groups
//!
//! - `/`, `/health`, `/ready` - Index and probes (no API key)
//! - `/user/usage` - Caller's plan usage (API key, not metered)
//! - `/proxy`, `/proxy/*` - Metered reverse proxy, any method

use axum::Router;
use axum::extract::DefaultBodyLimit;
use axum::middleware::{from_fn, from_fn_with_state};
use axum::routing::{any, get};
use tower_http::cors::{Any, CorsLayer};
use tower_http::request_id::{MakeRequestUuid, PropagateRequestIdLayer, SetRequestIdLayer};
use tower_http::trace::TraceLayer;
use tracing::info;

use crate::handlers;
use crate::middleware::{enforce_plan_limits, extract_request_timeout, require_api_key};
use crate::state::AppState;

/// Build the application router with all routes and middleware configured.
///
/// Serve it with `into_make_service_with_connect_info::<SocketAddr>()` so
/// client IPs can be checked against the trusted proxy list.
pub fn build_router(state: AppState) -> Router {
    let config = &state.config;

    let cors = build_cors_layer(&config.cors_allowed_origins);

    let public = Router::new()
        .route("/", get(handlers::index))
        .route("/health", get(handlers::health_check))
        .route("/ready", get(handlers::readiness_check));

    let account = Router::new()
        .route("/user/usage", get(handlers::usage))
        .route_layer(from_fn_with_state(state.clone(), require_api_key));

    // route_layer: the last layer added runs first.
    let proxy = Router::new()
        .route("/proxy", any(handlers::proxy))
        .route("/proxy/", any(handlers::proxy))
        .route("/proxy/{*path}", any(handlers::proxy))
        .route_layer(from_fn(extract_request_timeout))
        .route_layer(from_fn_with_state(state.clone(), enforce_plan_limits))
        .route_layer(from_fn_with_state(state.clone(), require_api_key));

    if config.auth_throttling_enabled() {
        info!(
            per_minute = config.auth_failure_limit_per_minute,
            trusted_proxies = config.trusted_proxies.len(),
            "Failed API key throttling enabled"
        );
    } else {
        info!("Failed API key throttling disabled (AUTH_FAILURE_LIMIT_PER_MINUTE=0)");
    }

    info!(
        max_size_mb = config.max_request_body_size / (1024 * 1024),
        "Request body size limit configured"
    );

    // Layers wrap bottom to top: request ID is outermost.
    Router::new()
        .merge(public)
        .merge(account)
        .merge(proxy)
        .fallback(handlers::not_found)
        .layer(DefaultBodyLimit::max(config.max_request_body_size))
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .layer(PropagateRequestIdLayer::x_request_id())
        .layer(SetRequestIdLayer::x_request_id(MakeRequestUuid))
        .with_state(state)
}

/// Build CORS layer from configuration.
///
/// # Security Note
///
/// Using `*` (any origin) is convenient for development but should be
/// avoided in production. Specify explicit origins instead.
fn build_cors_layer(allowed_origins: &[String]) -> CorsLayer {
    let allow_any = allowed_origins.iter().any(|o| o == "*");

    if allow_any {
        CorsLayer::new()
            .allow_origin(Any)
            .allow_methods(Any)
            .allow_headers(Any)
    } else {
        let origins: Vec<_> = allowed_origins
            .iter()
            .filter_map(|o| o.parse().ok())
            .collect();

        CorsLayer::new()
            .allow_origin(origins)
            .allow_methods(Any)
            .allow_headers(Any)
    }
}

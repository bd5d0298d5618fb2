//! HTTP middleware for authentication, quotas and request plumbing.
//!
//! # Architecture
//!
//! ```text
//! /proxy/*:     Auth → Plan limits → Timeout → proxy handler
//!                 ↓          ↓           ↓
//!            401/403/429    429      extension
//! /user/usage:  Auth → usage handler
//! ```
//!
//! Request IDs, CORS and HTTP tracing are `tower-http` layers applied to the
//! whole router (see [`crate::routes`]).

pub mod auth;
pub mod ip;
pub mod rate_limit;
pub mod timeout;

pub use auth::{API_KEY_HEADER, AuthFailureGuard, extract_api_key, require_api_key};
pub use ip::{ClientIp, TrustedProxyConfig, UNKNOWN_IP, client_ip};
pub use rate_limit::enforce_plan_limits;
pub use timeout::{
    MAX_REQUEST_TIMEOUT_MS, MIN_REQUEST_TIMEOUT_MS, REQUEST_TIMEOUT_HEADER, RequestTimeout,
    RequestTimeoutExt, extract_request_timeout,
};

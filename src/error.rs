use axum::http::header::RETRY_AFTER;
use axum::http::{HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::metrics;
use crate::ratelimit::{PlanQuota, QuotaDimension};

/// Application-wide error types with appropriate HTTP status codes.
///
/// # Error Classes
///
/// Every variant falls into one of three classes, which decides how much of
/// it the client sees and how loudly it is logged:
///
/// - caller-fixable (`401`, `403`, `404`, `400`, `429`, `503`): message and
///   code are returned as-is, logged at debug/warn
/// - upstream-fixable (`502`): the upstream failure is summarised for the
///   client, logged at warn
/// - gateway-internal (`500`): the client gets `INTERNAL_ERROR` and a generic
///   message, the full detail is logged at error
#[derive(Error, Debug)]
pub enum AppError {
    #[error("API Key is required")]
    MissingCredential,

    #[error("Invalid API Key")]
    InvalidCredential,

    #[error("No plan assigned to this account")]
    NoPlanAssigned,

    #[error("Too many failed authentication attempts")]
    AuthThrottled { retry_after_secs: u64 },

    #[error("Too many requests: limit is {limit} requests per minute")]
    AntiSpamExceeded { limit: i64, retry_after_secs: u64 },

    #[error("Rate limit exceeded")]
    RateLimitExceeded(PlanQuota),

    #[error("Service {dimension} limit exceeded for {service} ({limit} requests/{dimension})")]
    ServiceLimitExceeded {
        service: String,
        dimension: QuotaDimension,
        limit: i64,
    },

    #[error("No service configured for this route")]
    ServiceNotFound,

    #[error("Service {0} is temporarily unavailable")]
    ServiceUnavailable(String),

    #[error("Upstream request failed: {0}")]
    UpstreamError(String),

    #[error("Unsupported rate interval: {0}")]
    InvalidRateInterval(String),

    #[error("Endpoint not found")]
    NotFound,

    #[error("Invalid request: {0}")]
    BadRequest(String),

    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Migration error: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),

    #[error("Counter store error: {0}")]
    CounterStore(#[from] redis::RedisError),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error("Internal server error: {0}")]
    Internal(String),
}

impl AppError {
    /// HTTP status returned to the client.
    pub fn status_code(&self) -> StatusCode {
        match self {
            Self::MissingCredential | Self::InvalidCredential => StatusCode::UNAUTHORIZED,
            Self::NoPlanAssigned => StatusCode::FORBIDDEN,
            Self::AuthThrottled { .. }
            | Self::AntiSpamExceeded { .. }
            | Self::RateLimitExceeded(_)
            | Self::ServiceLimitExceeded { .. } => StatusCode::TOO_MANY_REQUESTS,
            Self::ServiceNotFound | Self::NotFound => StatusCode::NOT_FOUND,
            Self::ServiceUnavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
            Self::UpstreamError(_) => StatusCode::BAD_GATEWAY,
            Self::BadRequest(_) => StatusCode::BAD_REQUEST,
            Self::InvalidRateInterval(_)
            | Self::Database(_)
            | Self::Migration(_)
            | Self::CounterStore(_)
            | Self::Serialization(_)
            | Self::ConfigError(_)
            | Self::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Stable machine-readable code carried in the `error` field.
    pub fn error_code(&self) -> &'static str {
        match self {
            Self::MissingCredential => "MISSING_API_KEY",
            Self::InvalidCredential => "INVALID_API_KEY",
            Self::NoPlanAssigned => "NO_PLAN",
            Self::AuthThrottled { .. } => "AUTH_THROTTLED",
            Self::AntiSpamExceeded { .. } => "ANTI_SPAM_LIMIT_EXCEEDED",
            Self::RateLimitExceeded(_) => "RATE_LIMIT_EXCEEDED",
            Self::ServiceLimitExceeded { .. } => "SERVICE_LIMIT_EXCEEDED",
            Self::ServiceNotFound => "SERVICE_NOT_FOUND",
            Self::ServiceUnavailable(_) => "SERVICE_UNAVAILABLE",
            Self::UpstreamError(_) => "UPSTREAM_ERROR",
            Self::NotFound => "NOT_FOUND",
            Self::BadRequest(_) => "BAD_REQUEST",
            _ => "INTERNAL_ERROR",
        }
    }

    /// True for failures the gateway itself is responsible for.
    pub fn is_internal(&self) -> bool {
        self.status_code() == StatusCode::INTERNAL_SERVER_ERROR
    }

    /// Label for the limit-rejection metric, if this error is a quota rejection.
    fn rejection_kind(&self) -> Option<&'static str> {
        match self {
            Self::AuthThrottled { .. } => Some("auth_throttled"),
            Self::AntiSpamExceeded { .. } => Some("anti_spam"),
            Self::RateLimitExceeded(_) => Some("plan"),
            Self::ServiceLimitExceeded { dimension, .. } => Some(match dimension {
                QuotaDimension::Daily => "service_daily",
                QuotaDimension::Monthly => "service_monthly",
            }),
            _ => None,
        }
    }

    /// Client-facing message. Internal details never leave the process.
    fn client_message(&self) -> String {
        match self {
            Self::UpstreamError(_) => "Failed to connect to upstream service".to_string(),
            Self::ServiceUnavailable(_) => "Service is temporarily unavailable".to_string(),
            e if e.is_internal() => {
                "An internal error occurred. Please contact support if the issue persists."
                    .to_string()
            }
            e => e.to_string(),
        }
    }

    /// JSON body sent to the client for this error.
    pub fn body(&self) -> ErrorBody {
        let (service, limit_type) = match self {
            Self::ServiceLimitExceeded {
                service, dimension, ..
            } => (Some(service.clone()), Some(dimension.as_str().to_string())),
            _ => (None, None),
        };

        ErrorBody {
            status: false,
            message: self.client_message(),
            code: self.status_code().as_u16(),
            error: self.error_code().to_string(),
            service,
            limit_type,
        }
    }

    fn log(&self) {
        match self.status_code() {
            StatusCode::INTERNAL_SERVER_ERROR => {
                tracing::error!(error = %self, code = self.error_code(), "Request failed");
            }
            StatusCode::BAD_GATEWAY => {
                tracing::warn!(error = %self, "Upstream request failed");
            }
            StatusCode::TOO_MANY_REQUESTS | StatusCode::SERVICE_UNAVAILABLE => {
                tracing::warn!(code = self.error_code(), "Request rejected: {self}");
            }
            _ => {
                tracing::debug!(code = self.error_code(), "Request rejected: {self}");
            }
        }
    }
}

/// Error response body for API endpoints.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ErrorBody {
    pub status: bool,
    pub message: String,
    pub code: u16,
    pub error: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub service: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub limit_type: Option<String>,
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        self.log();
        if let Some(kind) = self.rejection_kind() {
            metrics::record_limit_rejection(kind);
        }

        let mut response = (self.status_code(), axum::Json(self.body())).into_response();
        let headers = response.headers_mut();

        match &self {
            Self::AuthThrottled { retry_after_secs } | Self::AntiSpamExceeded { retry_after_secs, .. } => {
                headers.insert(RETRY_AFTER, HeaderValue::from(*retry_after_secs));
            }
            Self::RateLimitExceeded(quota) => quota.apply_headers(headers),
            _ => {}
        }

        response
    }
}

/// Convenience type alias for Results with AppError.
pub type AppResult<T> = Result<T, AppError>;

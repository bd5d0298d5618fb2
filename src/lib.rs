//! # Metered API Gateway
//!
//! A reverse proxy that sits in front of one or more upstream HTTP APIs and
//! meters every call by API key:
//!
//! - **Authentication**: API keys resolved to a user and plan, with expired
//!   plans downgraded on the fly
//! - **Quotas**: Per-minute anti-spam, hourly/daily plan windows and
//!   per-service daily/monthly caps, all in a shared counter store
//! - **Routing**: First path segment selects the upstream service
//! - **Audit**: Every proxied call is logged asynchronously and old logs are
//!   compacted into daily summaries on a cron schedule
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                      Axum HTTP Server                       │
//! ├─────────────────────────────────────────────────────────────┤
//! │  Middleware (Request ID → Trace → Auth → Plan Limits)       │
//! ├─────────────────────────────────────────────────────────────┤
//! │  Handlers (health, usage, proxy)                            │
//! ├─────────────────────────────────────────────────────────────┤
//! │  Services (router, forwarder, audit, retention)             │
//! ├──────────────────────────────┬──────────────────────────────┤
//! │  GatewayStore (PostgreSQL)   │  CounterStore (Redis)        │
//! └──────────────────────────────┴──────────────────────────────┘
//! ```
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use metered_gateway::{AppState, Config, build_router};
//! use metered_gateway::counter::RedisCounterStore;
//! use metered_gateway::store::PgStore;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), metered_gateway::AppError> {
//!     let config = Config::from_env()?;
//!     let store = PgStore::connect(&config.database_url, config.database_max_connections).await?;
//!     let counters = RedisCounterStore::connect(&config.redis_url).await?;
//!
//!     let state = AppState::new(config, Arc::new(store), Arc::new(counters))?;
//!     let app = build_router(state);
//!
//!     // Start the server...
//!     Ok(())
//! }
//! ```

pub mod config;
pub mod counter;
pub mod error;
pub mod handlers;
pub mod metrics;
pub mod middleware;
pub mod models;
pub mod ratelimit;
pub mod routes;
pub mod services;
pub mod state;
pub mod store;
pub mod utils;

// Re-exports for convenience
pub use config::Config;
pub use error::{AppError, AppResult};
pub use routes::build_router;
pub use state::AppState;

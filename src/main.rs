use std::net::SocketAddr;
use std::process::ExitCode;
use std::sync::Arc;

use tokio::net::TcpListener;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use metered_gateway::config::LogFormat;
use metered_gateway::counter::RedisCounterStore;
use metered_gateway::store::PgStore;
use metered_gateway::{AppState, Config, build_router, metrics, utils};

#[tokio::main]
async fn main() -> ExitCode {
    let config = Config::from_env();

    let (log_format, log_level) = match &config {
        Ok(config) => (config.log_format, config.log_level.clone()),
        Err(_) => (LogFormat::default(), "info".to_string()),
    };
    init_tracing(log_format, &log_level);

    info!(
        "Starting Metered API Gateway v{}",
        env!("CARGO_PKG_VERSION")
    );

    let config = match config {
        Ok(config) => config,
        Err(e) => {
            error!("Configuration error: {e}");
            return ExitCode::from(exitcode::CONFIG as u8);
        }
    };

    match run(config).await {
        Ok(()) => ExitCode::from(exitcode::OK as u8),
        Err(exit_code) => ExitCode::from(exit_code as u8),
    }
}

fn init_tracing(format: LogFormat, level: &str) {
    let filter = EnvFilter::try_new(level).unwrap_or_else(|_| EnvFilter::new("info"));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_thread_ids(true);

    match format {
        LogFormat::Json => builder.json().init(),
        LogFormat::Text => builder.init(),
    }
}

/// Run the application, returning an exit code on error.
async fn run(config: Config) -> Result<(), exitcode::ExitCode> {
    info!(
        host = %config.host,
        port = %config.port,
        default_plan = %config.default_plan_id,
        retention_days = config.log_retention_days,
        "Configuration loaded"
    );

    if let Some(metrics_addr) = config.metrics_addr() {
        metrics::try_init_metrics(metrics_addr);
    } else {
        info!("Prometheus metrics disabled (METRICS_PORT=0)");
    }

    // Relational store
    info!("Connecting to relational store...");
    let store = utils::retry_with_backoff(
        "relational store",
        config.startup_connect_attempts,
        config.startup_base_delay,
        config.startup_max_delay,
        || PgStore::connect(&config.database_url, config.database_max_connections),
    )
    .await
    .map_err(|e| {
        error!("Failed to connect to relational store: {e}");
        exitcode::UNAVAILABLE
    })?;

    if config.database_run_migrations {
        store.migrate().await.map_err(|e| {
            error!("Failed to apply migrations: {e}");
            exitcode::SOFTWARE
        })?;
    }

    // Counter store
    info!("Connecting to counter store...");
    let counters = utils::retry_with_backoff(
        "counter store",
        config.startup_connect_attempts,
        config.startup_base_delay,
        config.startup_max_delay,
        || RedisCounterStore::connect(&config.redis_url),
    )
    .await
    .map_err(|e| {
        error!("Failed to connect to counter store: {e}");
        exitcode::UNAVAILABLE
    })?;

    // Build application state and router
    let state = AppState::new(config.clone(), Arc::new(store), Arc::new(counters)).map_err(|e| {
        error!("Failed to build application state: {e}");
        exitcode::CONFIG
    })?;
    state.spawn_retention_task();
    let app = build_router(state.clone());

    // Start server
    let addr: SocketAddr = config.server_addr().parse().map_err(|e| {
        error!("Invalid server address: {e}");
        exitcode::CONFIG
    })?;
    let listener = TcpListener::bind(addr).await.map_err(|e| {
        error!("Failed to bind to {addr}: {e}");
        exitcode::UNAVAILABLE
    })?;

    info!("Server listening on http://{addr}");
    info!("API endpoints:");
    info!("  GET  /            - Gateway info");
    info!("  GET  /health      - Health check");
    info!("  GET  /ready       - Readiness check");
    info!("  GET  /user/usage  - Plan usage for the calling API key");
    info!("  ANY  /proxy/*     - Metered proxy to upstream services");

    // Start server with graceful shutdown
    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(utils::shutdown_signal())
    .await
    .map_err(|e| {
        error!("Server error: {e}");
        exitcode::SOFTWARE
    })?;

    // Drain the audit queue and stop the scheduler
    info!("HTTP server stopped, shutting down background tasks...");
    state.shutdown().await;

    info!("Server shutdown complete");
    Ok(())
}

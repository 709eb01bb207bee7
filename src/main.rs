mod admission;
mod cache;
mod config;
mod dispatch;
mod error;
mod extractors;
mod middleware;
mod openapi;
mod queue;
mod routes;
mod scheduler;
mod stats;
mod store;
mod tiers;
mod window;

use axum::{error_handling::HandleErrorLayer, http::StatusCode, BoxError};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use reqwest::Client;
use std::{sync::Arc, time::Duration};
use tower::ServiceBuilder;
use tower_http::{
    compression::CompressionLayer,
    cors::{Any, CorsLayer},
    trace::TraceLayer,
};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use crate::admission::AdmissionController;
use crate::config::AppConfig;
use crate::scheduler::{Drainer, SchedulerService, WindowResetTask};
use crate::stats::StatsService;
use crate::store::SharedStore;
use crate::tiers::TierRegistry;
use crate::window::{Clock, SystemClock};

/// Shared HTTP client configuration
const HTTP_TIMEOUT_SECS: u64 = 30;
const HTTP_CONNECT_TIMEOUT_SECS: u64 = 5;
const HTTP_POOL_IDLE_TIMEOUT_SECS: u64 = 90;

/// Upper bound for any inbound request
const REQUEST_TIMEOUT_SECS: u64 = 30;

/// How often stale last-known stats are evicted
const STATS_CACHE_CLEANUP_SECS: u64 = 15 * 60;

#[derive(Clone)]
pub struct AppState {
    pub config: Arc<AppConfig>,
    pub store: SharedStore,
    pub admission: Arc<AdmissionController>,
    pub stats: Arc<StatsService>,
    pub scheduler: Arc<SchedulerService>,
    pub metrics: PrometheusHandle,
}

/// Create shared HTTP client with connection pooling
fn create_http_client() -> Result<Client, reqwest::Error> {
    Client::builder()
        .timeout(Duration::from_secs(HTTP_TIMEOUT_SECS))
        .connect_timeout(Duration::from_secs(HTTP_CONNECT_TIMEOUT_SECS))
        .pool_idle_timeout(Duration::from_secs(HTTP_POOL_IDLE_TIMEOUT_SECS))
        .pool_max_idle_per_host(10)
        .build()
}

/// Handle request timeout errors
async fn handle_timeout_error(err: BoxError) -> (StatusCode, String) {
    if err.is::<tower::timeout::error::Elapsed>() {
        (StatusCode::REQUEST_TIMEOUT, "Request timed out".to_string())
    } else {
        (
            StatusCode::INTERNAL_SERVER_ERROR,
            format!("Internal error: {}", err),
        )
    }
}

/// Graceful shutdown signal handler
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "Failed to listen for ctrl+c");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "Failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    tracing::info!("Shutdown signal received, starting graceful shutdown");
}

fn secs(value: u64) -> chrono::Duration {
    chrono::Duration::seconds(i64::try_from(value).unwrap_or(i64::MAX / 1000))
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "callgate=debug,tower_http=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    // Load configuration
    let config = AppConfig::load()?;
    tracing::info!("Configuration loaded successfully");

    let metrics = PrometheusBuilder::new().install_recorder()?;

    let tiers = Arc::new(TierRegistry::new(
        &config.tier_limits,
        config.meta_api_limit_per_account,
    )?);
    for tier in tiers.tiers() {
        tracing::info!(tier = %tier.tier_id, hourly_limit = tier.hourly_limit, "Tier configured");
    }
    tracing::info!(
        global_limit = tiers.global_limit(),
        fallback_tier = %tiers.fallback_tier(),
        "App-wide hourly ceiling configured"
    );

    let clock: Arc<dyn Clock> = Arc::new(SystemClock);
    let store = store::connect(&config.store).await;
    let grace = secs(config.window.grace_secs);

    let admission = Arc::new(AdmissionController::new(
        store.clone(),
        Arc::clone(&tiers),
        Arc::clone(&clock),
        grace,
        config.allowed_action_types.clone(),
    ));

    // Create shared HTTP client with connection pooling
    let http_client = create_http_client()?;
    let dispatcher = dispatch::from_config(http_client, &config.dispatch);

    // Initialize the window reset scheduler
    let drainer = Drainer::new(
        store.clone(),
        Arc::clone(&admission),
        dispatcher,
        Arc::clone(&clock),
        secs(config.reset.drain_lease_secs),
        config.reset.max_replay_attempts,
    );
    let reset_task = Arc::new(WindowResetTask::new(
        drainer,
        store.clone(),
        Arc::clone(&clock),
        secs(config.reset.boundary_tolerance_secs),
        grace,
    ));
    let scheduler = Arc::new(SchedulerService::new(reset_task, &config.reset).await?);
    scheduler.start().await?;

    let stats = Arc::new(StatsService::new(
        store.clone(),
        tiers,
        clock,
        config.display_timezone()?,
        Duration::from_secs(config.stats.last_known_ttl_secs),
    ));
    stats.start_cache_cleanup(Duration::from_secs(STATS_CACHE_CLEANUP_SECS));

    // Create shared application state
    let state = AppState {
        config: Arc::new(config.clone()),
        store,
        admission,
        stats,
        scheduler: Arc::clone(&scheduler),
        metrics,
    };

    let app = routes::build_router(&state)
        .layer(
            ServiceBuilder::new()
                // Handle timeout errors
                .layer(HandleErrorLayer::new(handle_timeout_error))
                .timeout(Duration::from_secs(REQUEST_TIMEOUT_SECS)),
        )
        .layer(CompressionLayer::new())
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any),
        )
        .layer(TraceLayer::new_for_http())
        .with_state(state);

    // Start server with graceful shutdown
    let addr = format!("{}:{}", config.host, config.port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    tracing::info!("Server listening on {}", addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    scheduler.shutdown().await?;
    tracing::info!("Server shutdown complete");

    Ok(())
}

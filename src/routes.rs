use axum::{
    extract::State,
    middleware,
    routing::{get, post},
    Extension, Json, Router,
};
use serde::Serialize;
use utoipa::ToSchema;

use crate::admission::handlers as admission_handlers;
use crate::middleware::{require_api_key, ApiKey};
use crate::openapi::swagger_ui;
use crate::scheduler::handlers as scheduler_handlers;
use crate::stats::handlers as stats_handlers;
use crate::AppState;

#[derive(Debug, Serialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct HealthResponse {
    pub status: String,
    pub version: String,
    /// True while the store circuit is open and admission runs fail-open
    pub store_degraded: bool,
}

/// Health check endpoint
pub async fn health(State(state): State<AppState>) -> Json<HealthResponse> {
    let store_degraded = state.store.is_degraded();
    Json(HealthResponse {
        status: (if store_degraded { "degraded" } else { "ok" }).to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        store_degraded,
    })
}

/// Prometheus scrape endpoint
async fn metrics(State(state): State<AppState>) -> String {
    state.metrics.render()
}

/// Build the admission API routes
fn admission_routes() -> Router<AppState> {
    Router::new().route(
        "/admission/attempt",
        post(admission_handlers::attempt),
    )
}

/// Build the stats API routes
fn stats_routes() -> Router<AppState> {
    Router::new()
        .route("/stats/window", get(stats_handlers::window_stats))
        .route(
            "/stats/users/{scope_id}",
            get(stats_handlers::user_stats),
        )
        .route("/stats/app-limit", get(stats_handlers::app_limit))
        .route("/tiers", get(stats_handlers::list_tiers))
}

/// Build the scheduler API routes
fn scheduler_routes() -> Router<AppState> {
    Router::new()
        .route(
            "/scheduler/status",
            get(scheduler_handlers::scheduler_status),
        )
        .route("/scheduler/drain", post(scheduler_handlers::trigger_drain))
}

/// Build all API v1 routes (protected by API key auth)
pub fn api_v1_routes(api_key: Option<String>) -> Router<AppState> {
    Router::new()
        .merge(admission_routes())
        .merge(stats_routes())
        .merge(scheduler_routes())
        .layer(middleware::from_fn(require_api_key))
        .layer(Extension(ApiKey(api_key)))
}

/// Build the complete application router
pub fn build_router(state: &AppState) -> Router<AppState> {
    let api_key = state.config.api_key.clone();
    Router::new()
        // Health check at root level
        .route("/", get(health))
        .route("/health", get(health))
        .route("/metrics", get(metrics))
        // API v1 routes
        .nest("/api/v1", api_v1_routes(api_key))
        // Swagger UI for API documentation
        .merge(swagger_ui())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::admission::AdmissionController;
    use crate::config::AppConfig;
    use crate::dispatch::LogDispatcher;
    use crate::scheduler::{Drainer, SchedulerService, WindowResetTask};
    use crate::stats::StatsService;
    use crate::store::{MemoryStore, SharedStore};
    use crate::tiers::TierRegistry;
    use crate::window::{Clock, ManualClock};
    use axum::body::Body;
    use axum::http::{Request, StatusCode};
    use chrono::{Duration, TimeZone, Utc};
    use metrics_exporter_prometheus::PrometheusBuilder;
    use serde_json::{json, Value};
    use std::sync::Arc;
    use tower::ServiceExt;

    async fn test_state() -> AppState {
        let config: AppConfig = ::config::Config::builder()
            .build()
            .unwrap()
            .try_deserialize()
            .unwrap();
        let tiers = Arc::new(
            TierRegistry::new(&config.tier_limits, config.meta_api_limit_per_account).unwrap(),
        );
        let clock: Arc<dyn Clock> = Arc::new(ManualClock::new(
            Utc.with_ymd_and_hms(2024, 1, 1, 10, 15, 0).unwrap(),
        ));
        let store: SharedStore = Arc::new(MemoryStore::default());
        let admission = Arc::new(AdmissionController::new(
            store.clone(),
            tiers.clone(),
            clock.clone(),
            Duration::hours(1),
            Vec::new(),
        ));
        let drainer = Drainer::new(
            store.clone(),
            admission.clone(),
            Arc::new(LogDispatcher),
            clock.clone(),
            Duration::minutes(5),
            3,
        );
        let task = Arc::new(WindowResetTask::new(
            drainer,
            store.clone(),
            clock.clone(),
            Duration::seconds(60),
            Duration::hours(1),
        ));
        let scheduler = Arc::new(SchedulerService::new(task, &config.reset).await.unwrap());
        let stats = Arc::new(StatsService::new(
            store.clone(),
            tiers,
            clock,
            chrono_tz::Tz::UTC,
            std::time::Duration::from_secs(3600),
        ));

        AppState {
            config: Arc::new(config),
            store,
            admission,
            stats,
            scheduler,
            metrics: PrometheusBuilder::new().build_recorder().handle(),
        }
    }

    async fn post_attempt(body: Value) -> (StatusCode, Value) {
        let state = test_state().await;
        let app = build_router(&state).with_state(state);
        let response = app
            .oneshot(
                Request::post("/api/v1/admission/attempt")
                    .header("content-type", "application/json")
                    .body(Body::from(body.to_string()))
                    .unwrap(),
            )
            .await
            .unwrap();
        let status = response.status();
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        (status, serde_json::from_slice(&bytes).unwrap())
    }

    #[tokio::test]
    async fn test_rejected_attempt_is_bad_request() {
        let (status, body) = post_attempt(json!({
            "scopeId": "   ",
            "tier": "free",
            "actionType": "dm_send"
        }))
        .await;

        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["code"], json!("INVALID_REQUEST"));
        assert!(body["error"].is_string());
    }

    #[tokio::test]
    async fn test_admitted_attempt_is_ok() {
        let (status, body) = post_attempt(json!({
            "scopeId": "u1",
            "tier": "free",
            "actionType": "dm_send"
        }))
        .await;

        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["decision"], json!("ADMIT"));
        assert_eq!(body["count"], json!(1));
    }
}

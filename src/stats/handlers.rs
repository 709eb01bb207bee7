use axum::{
    extract::{Path, Query, State},
    Json,
};
use serde::Deserialize;

use super::models::{AppLimitView, UserStatsView, WindowStatsView};
use super::service::StatsError;
use crate::extractors::WindowParam;
use crate::store::ScopeType;
use crate::tiers::TierInfo;
use crate::AppState;

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserStatsQuery {
    pub tier: Option<String>,
    #[serde(default = "default_scope_type")]
    pub scope_type: ScopeType,
}

fn default_scope_type() -> ScopeType {
    ScopeType::User
}

/// Usage, queue and tier breakdown for a window (current window by default)
/// GET /api/v1/stats/window?window=2024-01-01T10:00Z
pub async fn window_stats(
    State(state): State<AppState>,
    WindowParam(window): WindowParam,
) -> Json<WindowStatsView> {
    Json(state.stats.window_stats(window).await)
}

/// Quota usage for one user or account in the current window
/// GET /api/v1/stats/users/{scope_id}?tier=pro
pub async fn user_stats(
    State(state): State<AppState>,
    Path(scope_id): Path<String>,
    Query(query): Query<UserStatsQuery>,
) -> Result<Json<UserStatsView>, StatsError> {
    let view = state
        .stats
        .user_stats(&scope_id, query.scope_type, query.tier.as_deref())
        .await?;
    Ok(Json(view))
}

/// Usage of the app-wide ceiling in the current window
/// GET /api/v1/stats/app-limit
pub async fn app_limit(State(state): State<AppState>) -> Json<AppLimitView> {
    Json(state.stats.app_limit().await)
}

/// Configured tiers and their hourly limits
/// GET /api/v1/tiers
pub async fn list_tiers(State(state): State<AppState>) -> Json<Vec<TierInfo>> {
    Json(state.stats.tiers().tiers())
}

use axum::{extract::State, Json};

use super::{DrainReport, ResetStatus, SchedulerError};
use crate::AppState;

/// Reset task state and the last drain
/// GET /api/v1/scheduler/status
pub async fn scheduler_status(State(state): State<AppState>) -> Json<ResetStatus> {
    Json(state.scheduler.status())
}

/// Drain queued calls into the current window now
/// POST /api/v1/scheduler/drain
///
/// Same idempotent drain the reset task runs; a window already drained
/// reports `already_drained`.
pub async fn trigger_drain(
    State(state): State<AppState>,
) -> Result<Json<DrainReport>, SchedulerError> {
    tracing::info!("Manual drain requested");
    let report = state.scheduler.task().drain_now().await?;
    Ok(Json(report))
}

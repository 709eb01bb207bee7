use utoipa::OpenApi;
use utoipa_swagger_ui::SwaggerUi;

use crate::admission::{AdmissionOutcome, AttemptRequest, Decision};
use crate::error::ErrorResponse;
use crate::queue::{GroupCount, QueueReason};
use crate::routes::HealthResponse;
use crate::scheduler::{DrainOutcome, DrainReport, ResetState, ResetStatus};
use crate::stats::models::{
    AccountSummary, AppLimitView, GlobalUsage, QueueSummary, TierUsage, UserStatsView,
    UserSummary, WindowStatsView,
};
use crate::store::ScopeType;
use crate::tiers::TierInfo;

/// OpenAPI documentation for the Callgate API
///
/// Schema documentation for request and response bodies.
#[derive(OpenApi)]
#[openapi(
    info(
        title = "Callgate API",
        version = "1.0.0",
        description = "Hourly call admission for third-party API quotas. Admits, queues or rejects outbound calls against per-tier and app-wide hourly limits, replays queued calls when the window rolls over, and reports usage.",
        license(
            name = "MIT",
            url = "https://opensource.org/licenses/MIT"
        )
    ),
    tags(
        (name = "admission", description = "Call admission decisions"),
        (name = "stats", description = "Window, user and app-limit usage"),
        (name = "scheduler", description = "Window reset and queue drain")
    ),
    components(
        schemas(
            ErrorResponse,
            HealthResponse,
            AttemptRequest,
            AdmissionOutcome,
            Decision,
            QueueReason,
            ScopeType,
            GroupCount,
            TierInfo,
            WindowStatsView,
            GlobalUsage,
            QueueSummary,
            UserSummary,
            TierUsage,
            AccountSummary,
            UserStatsView,
            AppLimitView,
            ResetStatus,
            ResetState,
            DrainReport,
            DrainOutcome,
        )
    )
)]
pub struct ApiDoc;

/// Create the Swagger UI router
pub fn swagger_ui() -> SwaggerUi {
    SwaggerUi::new("/swagger-ui").url("/api-docs/openapi.json", ApiDoc::openapi())
}

use axum::{extract::State, Json};

use super::controller::AdmissionError;
use super::models::{AdmissionOutcome, AttemptRequest, Decision};
use crate::AppState;

/// Ask for quota for one outbound call
/// POST /api/v1/admission/attempt
///
/// ADMIT and QUEUE both answer 200 with the outcome; REJECT answers 400.
pub async fn attempt(
    State(state): State<AppState>,
    Json(request): Json<AttemptRequest>,
) -> Result<Json<AdmissionOutcome>, AdmissionError> {
    let outcome = state.admission.attempt(request).await;
    if outcome.decision == Decision::Reject {
        return Err(AdmissionError::Rejected(
            outcome.error.unwrap_or_else(|| "Invalid request".to_string()),
        ));
    }
    Ok(Json(outcome))
}

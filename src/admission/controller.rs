use std::sync::Arc;

use chrono::Duration;
use thiserror::Error;

use super::models::{AdmissionOutcome, AttemptRequest, Capacity, Decision};
use crate::queue::{QueueItem, QueueReason};
use crate::store::{CounterKey, CounterMeta, Scope, ScopeType, SharedStore, StoreError, StoreResult};
use crate::tiers::TierRegistry;
use crate::window::{Clock, Window};

const MAX_SCOPE_ID_LEN: usize = 128;
const MAX_ACTION_TYPE_LEN: usize = 64;

#[derive(Error, Debug, PartialEq, Eq)]
pub enum AdmissionError {
    #[error("scopeId must not be empty")]
    EmptyScopeId,

    #[error("scopeId must be at most 128 characters")]
    ScopeIdTooLong,

    #[error("scopeType 'global' is reserved for the app-wide counter")]
    GlobalScope,

    #[error("Malformed actionType: '{0}'")]
    MalformedActionType(String),

    #[error("actionType '{0}' is not allowed")]
    ActionTypeNotAllowed(String),

    #[error("{0}")]
    Rejected(String),
}

impl crate::error::HttpError for AdmissionError {
    fn status_code(&self) -> axum::http::StatusCode {
        axum::http::StatusCode::BAD_REQUEST
    }

    fn error_code(&self) -> Option<&'static str> {
        Some("INVALID_REQUEST")
    }
}

crate::impl_into_response!(AdmissionError);

/// Decides whether an outbound call may proceed in the current window.
///
/// Counters are only touched through the store's bounded atomic increment
/// and decrement. A call first reserves a slot on its scope counter, then on
/// the global counter; a scope slot whose global reservation is refused is
/// handed back before the call is queued, so concurrent attempts never admit
/// more than the remaining quota.
pub struct AdmissionController {
    store: SharedStore,
    tiers: Arc<TierRegistry>,
    clock: Arc<dyn Clock>,
    grace: Duration,
    allowed_action_types: Vec<String>,
}

impl AdmissionController {
    pub fn new(
        store: SharedStore,
        tiers: Arc<TierRegistry>,
        clock: Arc<dyn Clock>,
        grace: Duration,
        allowed_action_types: Vec<String>,
    ) -> Self {
        Self {
            store,
            tiers,
            clock,
            grace,
            allowed_action_types,
        }
    }

    /// Check an inbound call against the current window and admit, queue or reject it.
    pub async fn attempt(&self, request: AttemptRequest) -> AdmissionOutcome {
        let window = self.clock.current_window();

        if let Err(e) = self.validate(&request) {
            tracing::warn!(scope_id = %request.scope_id, action_type = %request.action_type, error = %e, "Rejected admission attempt");
            metrics::counter!("callgate_admissions_total", "decision" => Decision::Reject.as_str())
                .increment(1);
            return AdmissionOutcome {
                decision: Decision::Reject,
                reason: None,
                window: window.key(),
                count: None,
                limit: 0,
                queue_item_id: None,
                degraded: false,
                error: Some(e.to_string()),
            };
        }

        let tier = self
            .tiers
            .resolve(request.tier.as_deref().unwrap_or(self.tiers.fallback_tier()));
        let scope = Scope::new(request.scope_type, request.scope_id.trim());
        let action_type = request.action_type.trim();

        let outcome = match self
            .check_and_reserve(window, &scope, &tier.tier_id, tier.hourly_limit)
            .await
        {
            Ok(Capacity::Admitted { count, global_count }) => {
                tracing::debug!(
                    scope = %scope,
                    window = %window,
                    count,
                    global_count,
                    "Admitted call"
                );
                AdmissionOutcome {
                    decision: Decision::Admit,
                    reason: None,
                    window: window.key(),
                    count: Some(count),
                    limit: tier.hourly_limit,
                    queue_item_id: None,
                    degraded: false,
                    error: None,
                }
            }
            Ok(Capacity::Exhausted(reason)) => {
                let item = QueueItem::new(
                    &scope,
                    &tier.tier_id,
                    action_type,
                    reason,
                    request.payload,
                    self.clock.now(),
                );
                let id = item.id.clone();
                match self.store.push(item).await {
                    Ok(()) => {
                        tracing::info!(
                            scope = %scope,
                            window = %window,
                            action_type = %action_type,
                            reason = reason.as_str(),
                            item_id = %id,
                            "Queued call until next window"
                        );
                        AdmissionOutcome {
                            decision: Decision::Queue,
                            reason: Some(reason),
                            window: window.key(),
                            count: None,
                            limit: tier.hourly_limit,
                            queue_item_id: Some(id),
                            degraded: false,
                            error: None,
                        }
                    }
                    Err(e) => self.fail_open(window, &scope, tier.hourly_limit, &e),
                }
            }
            Err(e) => self.fail_open(window, &scope, tier.hourly_limit, &e),
        };

        metrics::counter!("callgate_admissions_total", "decision" => outcome.decision.as_str())
            .increment(1);
        outcome
    }

    /// Re-run the capacity check for a deferred call against `window`.
    ///
    /// Nothing is enqueued here; the caller decides what happens to an item
    /// that still does not fit.
    pub async fn replay(&self, item: &QueueItem, window: Window) -> StoreResult<Capacity> {
        let tier = self.tiers.resolve(&item.tier);
        self.check_and_reserve(window, &item.scope(), &tier.tier_id, tier.hourly_limit)
            .await
    }

    pub fn validate(&self, request: &AttemptRequest) -> Result<(), AdmissionError> {
        let scope_id = request.scope_id.trim();
        if scope_id.is_empty() {
            return Err(AdmissionError::EmptyScopeId);
        }
        if scope_id.chars().count() > MAX_SCOPE_ID_LEN {
            return Err(AdmissionError::ScopeIdTooLong);
        }
        if request.scope_type == ScopeType::Global {
            return Err(AdmissionError::GlobalScope);
        }

        let action_type = request.action_type.trim();
        if !is_well_formed_action_type(action_type) {
            return Err(AdmissionError::MalformedActionType(
                request.action_type.clone(),
            ));
        }
        if !self.allowed_action_types.is_empty()
            && !self.allowed_action_types.iter().any(|a| a == action_type)
        {
            return Err(AdmissionError::ActionTypeNotAllowed(action_type.to_string()));
        }
        Ok(())
    }

    async fn check_and_reserve(
        &self,
        window: Window,
        scope: &Scope,
        tier: &str,
        limit: u64,
    ) -> StoreResult<Capacity> {
        let global_limit = self.tiers.global_limit();
        let global_key = CounterKey::new(window, Scope::global());
        let scope_key = CounterKey::new(window, scope.clone());

        // Fast path: read before reserving
        let global_count = self.store.get(&global_key).await?;
        let scope_count = self.store.get(&scope_key).await?;
        if global_count >= global_limit {
            // When both are spent the scope's own quota is the cause reported
            if scope_count >= limit {
                return Ok(Capacity::Exhausted(QueueReason::AccountLimitReached));
            }
            return Ok(Capacity::Exhausted(QueueReason::GlobalLimitReached));
        }
        if scope_count >= limit {
            return Ok(Capacity::Exhausted(QueueReason::AccountLimitReached));
        }

        // The scope slot is taken first and only it is handed back on a global
        // miss, so a refused call never inflates the app-wide counter.
        let scope_meta = CounterMeta {
            tier: Some(tier.to_string()),
            limit,
        };
        let Some(count) = self.store.increment_below(&scope_key, &scope_meta).await? else {
            return Ok(Capacity::Exhausted(QueueReason::AccountLimitReached));
        };
        if count == 1 {
            self.expire_at_window_end(&scope_key).await?;
        }

        let global_meta = CounterMeta {
            tier: None,
            limit: global_limit,
        };
        let global_count = match self.store.increment_below(&global_key, &global_meta).await {
            Ok(Some(global_count)) => global_count,
            Ok(None) => {
                self.store.decrement(&scope_key).await?;
                return Ok(Capacity::Exhausted(QueueReason::GlobalLimitReached));
            }
            Err(e) => {
                if let Err(release) = self.store.decrement(&scope_key).await {
                    tracing::warn!(scope = %scope, error = %release, "Failed to release scope reservation");
                }
                return Err(e);
            }
        };
        if global_count == 1 {
            self.expire_at_window_end(&global_key).await?;
        }

        Ok(Capacity::Admitted {
            count,
            global_count,
        })
    }

    async fn expire_at_window_end(&self, key: &CounterKey) -> StoreResult<()> {
        self.store
            .set_expiry(key, key.window.end() + self.grace)
            .await
    }

    fn fail_open(
        &self,
        window: Window,
        scope: &Scope,
        limit: u64,
        error: &StoreError,
    ) -> AdmissionOutcome {
        tracing::warn!(
            scope = %scope,
            window = %window,
            error = %error,
            "Counter store unavailable, admitting call without accounting"
        );
        metrics::counter!("callgate_admission_fail_open_total").increment(1);
        AdmissionOutcome {
            decision: Decision::Admit,
            reason: None,
            window: window.key(),
            count: None,
            limit,
            queue_item_id: None,
            degraded: true,
            error: Some(error.to_string()),
        }
    }
}

/// Lowercase ascii letters, digits, `_`, `.` and `-`, starting with a letter.
fn is_well_formed_action_type(action_type: &str) -> bool {
    action_type.len() <= MAX_ACTION_TYPE_LEN
        && action_type
            .chars()
            .next()
            .is_some_and(|c| c.is_ascii_lowercase())
        && action_type
            .chars()
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || matches!(c, '_' | '.' | '-'))
}

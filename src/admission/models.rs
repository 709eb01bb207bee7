use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

use crate::queue::QueueReason;
use crate::store::ScopeType;

/// Verdict for one call attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, ToSchema)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Decision {
    Admit,
    Queue,
    Reject,
}

impl Decision {
    pub fn as_str(self) -> &'static str {
        match self {
            Decision::Admit => "admit",
            Decision::Queue => "queue",
            Decision::Reject => "reject",
        }
    }
}

/// An outbound call asking for quota
#[derive(Debug, Clone, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct AttemptRequest {
    /// Account or user the call is made for
    pub scope_id: String,
    #[serde(default = "default_scope_type")]
    pub scope_type: ScopeType,
    /// Tier of the scope; unknown or missing tiers get the fallback quota
    #[serde(default)]
    pub tier: Option<String>,
    /// Kind of upstream call, e.g. `comment_reply` or `dm_send`
    pub action_type: String,
    /// Arguments needed to perform the call later if it is queued
    #[serde(default)]
    #[schema(value_type = Object)]
    pub payload: serde_json::Value,
}

fn default_scope_type() -> ScopeType {
    ScopeType::User
}

impl AttemptRequest {
    pub fn new(scope_id: &str, tier: &str, action_type: &str) -> Self {
        Self {
            scope_id: scope_id.to_string(),
            scope_type: ScopeType::User,
            tier: Some(tier.to_string()),
            action_type: action_type.to_string(),
            payload: serde_json::Value::Null,
        }
    }

    pub fn with_scope_type(mut self, scope_type: ScopeType) -> Self {
        self.scope_type = scope_type;
        self
    }

    pub fn with_payload(mut self, payload: serde_json::Value) -> Self {
        self.payload = payload;
        self
    }
}

/// Result of an admission attempt
#[derive(Debug, Clone, Serialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct AdmissionOutcome {
    pub decision: Decision,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<QueueReason>,
    /// Key of the window the attempt was accounted in
    pub window: String,
    /// Scope counter after an admitted call
    #[serde(skip_serializing_if = "Option::is_none")]
    pub count: Option<u64>,
    /// Hourly limit applied to the scope
    pub limit: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub queue_item_id: Option<String>,
    /// True when the store could not be consulted and the call was admitted blind
    pub degraded: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Capacity check against one window
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Capacity {
    /// Both counters were incremented
    Admitted { count: u64, global_count: u64 },
    /// No quota left; nothing was incremented
    Exhausted(QueueReason),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_attempt_request_defaults() {
        let request: AttemptRequest =
            serde_json::from_str(r#"{"scopeId": "u1", "actionType": "dm_send"}"#).unwrap();
        assert_eq!(request.scope_type, ScopeType::User);
        assert!(request.tier.is_none());
        assert!(request.payload.is_null());
    }

    #[test]
    fn test_outcome_serialization() {
        let outcome = AdmissionOutcome {
            decision: Decision::Queue,
            reason: Some(QueueReason::AccountLimitReached),
            window: "2024-01-01T10:00Z".to_string(),
            count: None,
            limit: 200,
            queue_item_id: Some("abc".to_string()),
            degraded: false,
            error: None,
        };
        let json = serde_json::to_value(&outcome).unwrap();
        assert_eq!(
            json,
            serde_json::json!({
                "decision": "QUEUE",
                "reason": "account_limit_reached",
                "window": "2024-01-01T10:00Z",
                "limit": 200,
                "queueItemId": "abc",
                "degraded": false
            })
        );
    }
}

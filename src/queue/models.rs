use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;
use uuid::Uuid;

use crate::store::{Scope, ScopeType};
use crate::window::Window;

/// Lifecycle of a deferred call
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum QueueStatus {
    Pending,
    Processing,
    Completed,
    Failed,
}

impl QueueStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            QueueStatus::Pending => "pending",
            QueueStatus::Processing => "processing",
            QueueStatus::Completed => "completed",
            QueueStatus::Failed => "failed",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "pending" => Some(QueueStatus::Pending),
            "processing" => Some(QueueStatus::Processing),
            "completed" => Some(QueueStatus::Completed),
            "failed" => Some(QueueStatus::Failed),
            _ => None,
        }
    }
}

/// Why a call lost admission
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum QueueReason {
    GlobalLimitReached,
    AccountLimitReached,
}

impl QueueReason {
    pub fn as_str(self) -> &'static str {
        match self {
            QueueReason::GlobalLimitReached => "global_limit_reached",
            QueueReason::AccountLimitReached => "account_limit_reached",
        }
    }
}

/// One deferred call waiting for quota
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueueItem {
    pub id: String,
    pub action_type: String,
    pub scope_id: String,
    pub scope_type: ScopeType,
    pub tier: String,
    pub enqueued_at_window: Window,
    pub status: QueueStatus,
    pub reason: QueueReason,
    #[serde(default)]
    pub attempts: u32,
    /// Opaque call arguments, handed back to the dispatcher on replay
    #[serde(default)]
    pub payload: serde_json::Value,
    pub enqueued_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
}

impl QueueItem {
    pub fn new(
        scope: &Scope,
        tier: &str,
        action_type: &str,
        reason: QueueReason,
        payload: serde_json::Value,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            action_type: action_type.to_string(),
            scope_id: scope.id.clone(),
            scope_type: scope.scope_type,
            tier: tier.to_string(),
            enqueued_at_window: Window::containing(now),
            status: QueueStatus::Pending,
            reason,
            attempts: 0,
            payload,
            enqueued_at: now,
            updated_at: now,
            last_error: None,
        }
    }

    pub fn scope(&self) -> Scope {
        Scope::new(self.scope_type, &self.scope_id)
    }

    /// Key of the FIFO list this item belongs to.
    pub fn list_key(&self) -> (Window, String) {
        (self.enqueued_at_window, self.action_type.clone())
    }
}

/// Item counts per lifecycle status
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct StatusCounts {
    pub pending: u64,
    pub processing: u64,
    pub completed: u64,
    pub failed: u64,
}

impl StatusCounts {
    pub fn add(&mut self, status: QueueStatus) {
        match status {
            QueueStatus::Pending => self.pending += 1,
            QueueStatus::Processing => self.processing += 1,
            QueueStatus::Completed => self.completed += 1,
            QueueStatus::Failed => self.failed += 1,
        }
    }
}

/// A grouped count, shaped like an aggregation bucket (`{_id, count}`)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, ToSchema)]
pub struct GroupCount {
    #[serde(rename = "_id")]
    pub id: String,
    pub count: u64,
}

/// Sort buckets by descending count, then by id.
pub fn sort_buckets(buckets: &mut [GroupCount]) {
    buckets.sort_by(|a, b| b.count.cmp(&a.count).then_with(|| a.id.cmp(&b.id)));
}

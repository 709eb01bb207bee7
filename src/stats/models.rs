use indexmap::IndexMap;
use serde::Serialize;
use utoipa::ToSchema;

use crate::queue::GroupCount;

/// Dashboard view of one window
#[derive(Debug, Clone, Serialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct WindowStatsView {
    pub window: String,
    pub window_label: String,
    pub is_current_window: bool,
    /// Set when the store could not be read and the view is stale or zeroed
    pub degraded: bool,
    pub global: GlobalUsage,
    pub queue: QueueSummary,
    pub users: UserSummary,
    pub accounts: AccountSummary,
}

#[derive(Debug, Clone, Serialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct GlobalUsage {
    pub total_calls: u64,
    pub app_limit: u64,
    /// Distinct accounts and users with at least one call
    pub accounts_processed: u64,
    pub usage_percentage: f64,
    pub is_automation_paused: bool,
}

#[derive(Debug, Clone, Serialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct QueueSummary {
    pub queued_items: u64,
    pub by_type: Vec<GroupCount>,
    pub by_reason: Vec<GroupCount>,
    pub completed: u64,
    pub failed: u64,
    pub pending: u64,
    pub processing: u64,
    pub note: String,
}

#[derive(Debug, Clone, Serialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct UserSummary {
    pub total_users: u64,
    pub total_calls: u64,
    pub average_calls_per_user: f64,
    /// Keyed by tier id, smallest quota first
    #[schema(value_type = Object)]
    pub by_tier: IndexMap<String, TierUsage>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct TierUsage {
    pub count: u64,
    pub total_calls: u64,
    pub limit: u64,
    pub average_calls_per_user: f64,
}

#[derive(Debug, Clone, Serialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct AccountSummary {
    pub total_active: u64,
    pub app_limit_per_account: u64,
    pub total_app_limit: u64,
}

/// Quota view for one user or account in the current window
#[derive(Debug, Clone, Serialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct UserStatsView {
    pub tier: String,
    pub tier_limit: u64,
    pub calls_made: u64,
    pub remaining_calls: u64,
    pub usage_percentage: f64,
    /// Start of the next window, RFC 3339
    pub next_reset: String,
    pub queued_items: u64,
    pub degraded: bool,
}

/// Usage of the app-wide ceiling in the current window
#[derive(Debug, Clone, Serialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct AppLimitView {
    pub current: u64,
    pub limit: u64,
    pub percentage: f64,
    pub reached: bool,
    pub degraded: bool,
}

/// Share of `limit` used, in percent, rounded to two decimals. Zero when
/// there is no limit to measure against.
pub fn percentage(used: u64, limit: u64) -> f64 {
    if limit == 0 {
        return 0.0;
    }
    round2(used as f64 / limit as f64 * 100.0)
}

pub fn average(total: u64, count: u64) -> f64 {
    if count == 0 {
        return 0.0;
    }
    round2(total as f64 / count as f64)
}

pub fn round2(value: f64) -> f64 {
    (value * 100.0).round() / 100.0
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn window_view() -> WindowStatsView {
        let mut by_tier = IndexMap::new();
        by_tier.insert(
            "free".to_string(),
            TierUsage {
                count: 2,
                total_calls: 5,
                limit: 200,
                average_calls_per_user: 2.5,
            },
        );
        WindowStatsView {
            window: "2024-01-01T10:00Z".to_string(),
            window_label: "2024-01-01 10:00-11:00 UTC".to_string(),
            is_current_window: true,
            degraded: false,
            global: GlobalUsage {
                total_calls: 5,
                app_limit: 200,
                accounts_processed: 2,
                usage_percentage: 2.5,
                is_automation_paused: false,
            },
            queue: QueueSummary {
                queued_items: 1,
                by_type: vec![GroupCount {
                    id: "dm_send".to_string(),
                    count: 1,
                }],
                by_reason: vec![GroupCount {
                    id: "account_limit_reached".to_string(),
                    count: 1,
                }],
                completed: 0,
                failed: 0,
                pending: 1,
                processing: 0,
                note: "Counts for items enqueued in this window".to_string(),
            },
            users: UserSummary {
                total_users: 2,
                total_calls: 5,
                average_calls_per_user: 2.5,
                by_tier,
            },
            accounts: AccountSummary {
                total_active: 0,
                app_limit_per_account: 200,
                total_app_limit: 0,
            },
        }
    }

    #[test]
    fn test_window_view_json_shape() {
        let value = serde_json::to_value(window_view()).unwrap();

        assert_eq!(value["isCurrentWindow"], json!(true));
        assert_eq!(value["global"]["appLimit"], json!(200));
        assert_eq!(value["global"]["totalCalls"], json!(5));
        assert_eq!(value["global"]["isAutomationPaused"], json!(false));
        assert_eq!(value["queue"]["byType"][0]["_id"], json!("dm_send"));
        assert_eq!(value["queue"]["byType"][0]["count"], json!(1));
        assert_eq!(
            value["queue"]["byReason"][0]["_id"],
            json!("account_limit_reached")
        );
        assert_eq!(
            value["users"]["byTier"]["free"]["averageCallsPerUser"],
            json!(2.5)
        );
        assert_eq!(value["users"]["byTier"]["free"]["totalCalls"], json!(5));
        assert_eq!(value["accounts"]["appLimitPerAccount"], json!(200));
        assert_eq!(value["accounts"]["totalActive"], json!(0));
        assert!(value.get("window_label").is_none());
    }

    #[test]
    fn test_user_and_app_limit_json_shape() {
        let user = serde_json::to_value(UserStatsView {
            tier: "free".to_string(),
            tier_limit: 200,
            calls_made: 150,
            remaining_calls: 50,
            usage_percentage: 75.0,
            next_reset: "2024-01-01T11:00:00Z".to_string(),
            queued_items: 0,
            degraded: false,
        })
        .unwrap();
        assert_eq!(user["tierLimit"], json!(200));
        assert_eq!(user["callsMade"], json!(150));
        assert_eq!(user["remainingCalls"], json!(50));
        assert_eq!(user["nextReset"], json!("2024-01-01T11:00:00Z"));
        assert_eq!(user["queuedItems"], json!(0));

        let app = serde_json::to_value(AppLimitView {
            current: 200,
            limit: 200,
            percentage: 100.0,
            reached: true,
            degraded: false,
        })
        .unwrap();
        assert_eq!(
            app,
            json!({
                "current": 200,
                "limit": 200,
                "percentage": 100.0,
                "reached": true,
                "degraded": false,
            })
        );
    }

    #[test]
    fn test_percentage_zero_safe() {
        assert_eq!(percentage(0, 0), 0.0);
        assert_eq!(percentage(5, 0), 0.0);
        assert_eq!(percentage(0, 200), 0.0);
        assert_eq!(percentage(1, 3), 33.33);
        assert_eq!(percentage(200, 200), 100.0);
    }

    #[test]
    fn test_average_zero_safe() {
        assert_eq!(average(0, 0), 0.0);
        assert_eq!(average(10, 3), 3.33);
        assert_eq!(average(10, 4), 2.5);
    }
}

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use axum::http::StatusCode;
use chrono::{DateTime, SecondsFormat, Utc};
use chrono_tz::Tz;
use indexmap::IndexMap;
use thiserror::Error;

use super::models::{
    average, percentage, AccountSummary, AppLimitView, GlobalUsage, QueueSummary, TierUsage,
    UserStatsView, UserSummary, WindowStatsView,
};
use crate::cache::{start_cleanup_task, TtlCache};
use crate::error::HttpError;
use crate::queue::{GroupCount, StatusCounts};
use crate::store::{CallCounter, CounterKey, Scope, ScopeType, SharedStore, StoreResult};
use crate::tiers::TierRegistry;
use crate::window::{Clock, Window, WindowParseError};

const QUEUE_NOTE: &str = "Pending and processing count live queue entries; completed and failed come from the bounded audit trail";

#[derive(Error, Debug)]
pub enum StatsError {
    #[error(transparent)]
    InvalidWindow(#[from] WindowParseError),

    #[error("Invalid scope: {0}")]
    InvalidScope(String),
}

impl HttpError for StatsError {
    fn status_code(&self) -> StatusCode {
        StatusCode::BAD_REQUEST
    }

    fn error_code(&self) -> Option<&'static str> {
        Some(match self {
            StatsError::InvalidWindow(_) => "INVALID_WINDOW",
            StatsError::InvalidScope(_) => "INVALID_SCOPE",
        })
    }
}

crate::impl_into_response!(StatsError);

/// Everything the window view is projected from
#[derive(Debug, Clone)]
pub struct WindowSnapshot {
    pub window: Window,
    pub counters: Vec<CallCounter>,
    pub queued: u64,
    pub by_type: Vec<GroupCount>,
    pub by_reason: Vec<GroupCount>,
    pub statuses: StatusCounts,
}

impl WindowSnapshot {
    pub fn empty(window: Window) -> Self {
        Self {
            window,
            counters: Vec::new(),
            queued: 0,
            by_type: Vec::new(),
            by_reason: Vec::new(),
            statuses: StatusCounts::default(),
        }
    }
}

/// Build the dashboard view of a window. Pure; never divides by zero.
pub fn project_window(
    snapshot: &WindowSnapshot,
    tiers: &TierRegistry,
    now: DateTime<Utc>,
    tz: &Tz,
) -> WindowStatsView {
    let app_limit = tiers.global_limit();
    let global_calls = snapshot
        .counters
        .iter()
        .find(|c| c.scope_type == ScopeType::Global)
        .map(|c| c.count)
        .unwrap_or(0);

    let mut by_tier: IndexMap<String, TierUsage> = tiers
        .tiers()
        .into_iter()
        .map(|tier| {
            (
                tier.tier_id,
                TierUsage {
                    limit: tier.hourly_limit,
                    ..TierUsage::default()
                },
            )
        })
        .collect();

    let mut processed = HashSet::new();
    let mut total_users = 0;
    let mut user_calls = 0;
    let mut active_accounts = 0;

    for counter in snapshot.counters.iter().filter(|c| c.count > 0) {
        match counter.scope_type {
            ScopeType::Global => continue,
            ScopeType::Account => active_accounts += 1,
            ScopeType::User => {
                total_users += 1;
                user_calls += counter.count;

                // Attribute to the tier whose limit was actually applied
                let tier = tiers.resolve(counter.tier.as_deref().unwrap_or(tiers.fallback_tier()));
                let usage = by_tier.entry(tier.tier_id).or_insert_with(|| TierUsage {
                    limit: tier.hourly_limit,
                    ..TierUsage::default()
                });
                usage.count += 1;
                usage.total_calls += counter.count;
            }
        }
        processed.insert((counter.scope_type, counter.scope_id.as_str()));
    }

    for usage in by_tier.values_mut() {
        usage.average_calls_per_user = average(usage.total_calls, usage.count);
    }

    WindowStatsView {
        window: snapshot.window.key(),
        window_label: snapshot.window.label(tz),
        is_current_window: snapshot.window.is_current(now),
        degraded: false,
        global: GlobalUsage {
            total_calls: global_calls,
            app_limit,
            accounts_processed: processed.len() as u64,
            usage_percentage: percentage(global_calls, app_limit),
            is_automation_paused: global_calls >= app_limit,
        },
        queue: QueueSummary {
            queued_items: snapshot.queued,
            by_type: snapshot.by_type.clone(),
            by_reason: snapshot.by_reason.clone(),
            completed: snapshot.statuses.completed,
            failed: snapshot.statuses.failed,
            pending: snapshot.statuses.pending,
            processing: snapshot.statuses.processing,
            note: QUEUE_NOTE.to_string(),
        },
        users: UserSummary {
            total_users,
            total_calls: user_calls,
            average_calls_per_user: average(user_calls, total_users),
            by_tier,
        },
        accounts: AccountSummary {
            total_active: active_accounts,
            app_limit_per_account: app_limit,
            total_app_limit: app_limit.saturating_mul(active_accounts),
        },
    }
}

/// Read-only projections over counters and queues.
///
/// Stats never fail because of the store: on a read error the last good view
/// is served, marked degraded, or a zeroed view when none is cached.
pub struct StatsService {
    store: SharedStore,
    tiers: Arc<TierRegistry>,
    clock: Arc<dyn Clock>,
    timezone: Tz,
    windows: Arc<TtlCache<Window, WindowStatsView>>,
    users: Arc<TtlCache<(Window, Scope), UserStatsView>>,
    app_limits: Arc<TtlCache<Window, AppLimitView>>,
}

impl StatsService {
    pub fn new(
        store: SharedStore,
        tiers: Arc<TierRegistry>,
        clock: Arc<dyn Clock>,
        timezone: Tz,
        last_known_ttl: Duration,
    ) -> Self {
        Self {
            store,
            tiers,
            clock,
            timezone,
            windows: Arc::new(TtlCache::new(last_known_ttl)),
            users: Arc::new(TtlCache::new(last_known_ttl)),
            app_limits: Arc::new(TtlCache::new(last_known_ttl)),
        }
    }

    /// Evict stale last-known views periodically
    pub fn start_cache_cleanup(&self, every: Duration) {
        start_cleanup_task(Arc::clone(&self.windows), every, "window_stats");
        start_cleanup_task(Arc::clone(&self.users), every, "user_stats");
        start_cleanup_task(Arc::clone(&self.app_limits), every, "app_limit");
    }

    pub async fn window_stats(&self, window: Option<Window>) -> WindowStatsView {
        let now = self.clock.now();
        let window = window.unwrap_or_else(|| Window::containing(now));

        match self.load_window(window).await {
            Ok(snapshot) => {
                let view = project_window(&snapshot, &self.tiers, now, &self.timezone);
                self.windows.insert(window, view.clone());
                view
            }
            Err(e) => {
                tracing::warn!(window = %window, error = %e, "Serving degraded window stats");
                let mut view = self.windows.get(&window).unwrap_or_else(|| {
                    project_window(
                        &WindowSnapshot::empty(window),
                        &self.tiers,
                        now,
                        &self.timezone,
                    )
                });
                view.degraded = true;
                view.is_current_window = window.is_current(now);
                view
            }
        }
    }

    async fn load_window(&self, window: Window) -> StoreResult<WindowSnapshot> {
        let (counters, queued, by_type, by_reason, statuses) = tokio::try_join!(
            self.store.counters(window),
            self.store.length_all(window),
            self.store.count_by_type(window),
            self.store.count_by_reason(window),
            self.store.count_by_status(window),
        )?;
        Ok(WindowSnapshot {
            window,
            counters,
            queued,
            by_type,
            by_reason,
            statuses,
        })
    }

    pub async fn user_stats(
        &self,
        scope_id: &str,
        scope_type: ScopeType,
        tier: Option<&str>,
    ) -> Result<UserStatsView, StatsError> {
        let scope_id = scope_id.trim();
        if scope_id.is_empty() {
            return Err(StatsError::InvalidScope("scopeId must not be empty".into()));
        }
        if scope_type == ScopeType::Global {
            return Err(StatsError::InvalidScope(
                "use the app-limit endpoint for the global counter".into(),
            ));
        }

        let window = self.clock.current_window();
        let scope = Scope::new(scope_type, scope_id);
        let tier = self.tiers.resolve(tier.unwrap_or(self.tiers.fallback_tier()));
        let key = CounterKey::new(window, scope.clone());

        let loaded = tokio::try_join!(
            self.store.get(&key),
            self.store.pending_for_scope(&scope),
        );

        let (calls_made, queued_items, degraded) = match loaded {
            Ok((count, queued)) => (count, queued, false),
            Err(e) => {
                tracing::warn!(scope = %scope, error = %e, "Serving degraded user stats");
                if let Some(mut view) = self.users.get(&(window, scope.clone())) {
                    view.degraded = true;
                    return Ok(view);
                }
                (0, 0, true)
            }
        };

        let view = UserStatsView {
            tier: tier.tier_id,
            tier_limit: tier.hourly_limit,
            calls_made,
            remaining_calls: tier.hourly_limit.saturating_sub(calls_made),
            usage_percentage: percentage(calls_made, tier.hourly_limit),
            next_reset: window.end().to_rfc3339_opts(SecondsFormat::Secs, true),
            queued_items,
            degraded,
        };
        if !degraded {
            self.users.insert((window, scope), view.clone());
        }
        Ok(view)
    }

    pub async fn app_limit(&self) -> AppLimitView {
        let window = self.clock.current_window();
        let limit = self.tiers.global_limit();

        match self.store.get(&CounterKey::new(window, Scope::global())).await {
            Ok(current) => {
                let view = AppLimitView {
                    current,
                    limit,
                    percentage: percentage(current, limit),
                    reached: current >= limit,
                    degraded: false,
                };
                self.app_limits.insert(window, view.clone());
                view
            }
            Err(e) => {
                tracing::warn!(window = %window, error = %e, "Serving degraded app limit");
                let mut view = self.app_limits.get(&window).unwrap_or(AppLimitView {
                    current: 0,
                    limit,
                    percentage: 0.0,
                    reached: false,
                    degraded: true,
                });
                view.degraded = true;
                view
            }
        }
    }

    pub fn tiers(&self) -> &TierRegistry {
        &self.tiers
    }
}

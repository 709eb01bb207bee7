use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::SqlitePool;

use super::{
    CallCounter, CounterKey, CounterMeta, CounterStore, DrainClaim, QueueStore, Scope,
    ScopeType, StoreError, StoreResult,
};
use crate::config::StoreConfig;
use crate::queue::models::sort_buckets;
use crate::queue::{GroupCount, QueueItem, QueueStatus, StatusCounts};
use crate::window::Window;

/// Durable store on SQLite.
///
/// Every mutation is a single statement, so atomicity comes from SQLite's
/// write serialization rather than from application locks.
pub struct SqliteStore {
    pool: SqlitePool,
    audit_capacity: i64,
}

/// Internal row structure for counter queries
#[derive(sqlx::FromRow)]
struct CounterRow {
    window_hour: i64,
    scope_type: String,
    scope_id: String,
    tier: Option<String>,
    count: i64,
    call_limit: i64,
    expires_at: Option<i64>,
}

impl CounterRow {
    fn into_counter(self) -> StoreResult<CallCounter> {
        let scope_type = ScopeType::parse(&self.scope_type)
            .ok_or_else(|| StoreError::Corrupt(format!("unknown scope type '{}'", self.scope_type)))?;
        Ok(CallCounter {
            window: Window::from_hour(self.window_hour),
            scope_id: self.scope_id,
            scope_type,
            tier: self.tier,
            count: to_u64(self.count),
            limit: to_u64(self.call_limit),
            expires_at: self.expires_at.and_then(|ts| DateTime::from_timestamp(ts, 0)),
        })
    }
}

fn to_u64(value: i64) -> u64 {
    u64::try_from(value).unwrap_or(0)
}

impl SqliteStore {
    /// Open (creating if needed) the database named by the config and run migrations.
    pub async fn connect(config: &StoreConfig) -> StoreResult<Self> {
        // Ensure the data directory exists
        if let Some(db_path) = config.database_url.strip_prefix("sqlite:") {
            if let Some(parent) = Path::new(db_path.trim_start_matches("//")).parent() {
                if !parent.as_os_str().is_empty() {
                    tokio::fs::create_dir_all(parent).await.map_err(|e| {
                        StoreError::Unavailable(format!("Failed to create database directory: {}", e))
                    })?;
                }
            }
        }

        let options = SqliteConnectOptions::from_str(&config.database_url)?
            .create_if_missing(true)
            .busy_timeout(Duration::from_millis(config.op_timeout_ms));

        let pool = SqlitePoolOptions::new()
            .max_connections(config.max_connections)
            .connect_with(options)
            .await?;

        Self::from_pool(pool, config.audit_capacity).await
    }

    pub async fn from_pool(pool: SqlitePool, audit_capacity: usize) -> StoreResult<Self> {
        run_migrations(&pool).await?;
        Ok(Self {
            pool,
            audit_capacity: i64::try_from(audit_capacity.max(1)).unwrap_or(i64::MAX),
        })
    }
}

/// Create tables if they do not exist yet
pub async fn run_migrations(pool: &SqlitePool) -> StoreResult<()> {
    let migration_001 = include_str!("../../migrations/001_create_tables.sql");
    sqlx::raw_sql(migration_001).execute(pool).await?;

    tracing::info!("Database migrations completed");
    Ok(())
}

#[async_trait]
impl CounterStore for SqliteStore {
    async fn increment_below(
        &self,
        key: &CounterKey,
        meta: &CounterMeta,
    ) -> StoreResult<Option<u64>> {
        if meta.limit == 0 {
            return Ok(None);
        }

        // A full counter skips the update, so RETURNING yields no row
        let count: Option<i64> = sqlx::query_scalar(
            "INSERT INTO call_counters (window_hour, scope_type, scope_id, tier, count, call_limit)
             VALUES (?, ?, ?, ?, 1, ?)
             ON CONFLICT(window_hour, scope_type, scope_id) DO UPDATE SET
                count = call_counters.count + 1,
                tier = COALESCE(call_counters.tier, excluded.tier)
             WHERE call_counters.count < excluded.call_limit
             RETURNING count",
        )
        .bind(key.window.hour_index())
        .bind(key.scope.scope_type.as_str())
        .bind(&key.scope.id)
        .bind(meta.tier.as_deref())
        .bind(i64::try_from(meta.limit).unwrap_or(i64::MAX))
        .fetch_optional(&self.pool)
        .await?;

        Ok(count.map(to_u64))
    }

    async fn decrement(&self, key: &CounterKey) -> StoreResult<u64> {
        let count: Option<i64> = sqlx::query_scalar(
            "UPDATE call_counters SET count = MAX(count - 1, 0)
             WHERE window_hour = ? AND scope_type = ? AND scope_id = ?
             RETURNING count",
        )
        .bind(key.window.hour_index())
        .bind(key.scope.scope_type.as_str())
        .bind(&key.scope.id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(count.map_or(0, to_u64))
    }

    async fn get(&self, key: &CounterKey) -> StoreResult<u64> {
        let count: Option<i64> = sqlx::query_scalar(
            "SELECT count FROM call_counters
             WHERE window_hour = ? AND scope_type = ? AND scope_id = ?",
        )
        .bind(key.window.hour_index())
        .bind(key.scope.scope_type.as_str())
        .bind(&key.scope.id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(count.map_or(0, to_u64))
    }

    async fn set_expiry(&self, key: &CounterKey, expires_at: DateTime<Utc>) -> StoreResult<()> {
        sqlx::query(
            "UPDATE call_counters SET expires_at = ?
             WHERE window_hour = ? AND scope_type = ? AND scope_id = ?",
        )
        .bind(expires_at.timestamp())
        .bind(key.window.hour_index())
        .bind(key.scope.scope_type.as_str())
        .bind(&key.scope.id)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn counters(&self, window: Window) -> StoreResult<Vec<CallCounter>> {
        let rows: Vec<CounterRow> = sqlx::query_as(
            "SELECT window_hour, scope_type, scope_id, tier, count, call_limit, expires_at
             FROM call_counters WHERE window_hour = ?
             ORDER BY scope_type, scope_id",
        )
        .bind(window.hour_index())
        .fetch_all(&self.pool)
        .await?;

        let mut counters = rows
            .into_iter()
            .map(CounterRow::into_counter)
            .collect::<StoreResult<Vec<_>>>()?;
        counters.sort_by(|a, b| (a.scope_type, &a.scope_id).cmp(&(b.scope_type, &b.scope_id)));
        Ok(counters)
    }

    async fn purge_expired(
        &self,
        now: DateTime<Utc>,
        stale_before: DateTime<Utc>,
    ) -> StoreResult<usize> {
        let stale_hour = Window::containing(stale_before).hour_index();

        let result = sqlx::query(
            "DELETE FROM call_counters
             WHERE (expires_at IS NOT NULL AND expires_at <= ?)
                OR (expires_at IS NULL AND window_hour < ?)",
        )
        .bind(now.timestamp())
        .bind(stale_hour)
        .execute(&self.pool)
        .await?;

        sqlx::query("DELETE FROM drain_runs WHERE window_hour < ?")
            .bind(stale_hour)
            .execute(&self.pool)
            .await?;

        Ok(usize::try_from(result.rows_affected()).unwrap_or(usize::MAX))
    }
}

#[async_trait]
impl QueueStore for SqliteStore {
    async fn push(&self, item: QueueItem) -> StoreResult<()> {
        let body = serde_json::to_string(&item)?;

        sqlx::query(
            "INSERT INTO queue_items (id, window_hour, action_type, scope_type, scope_id, status, reason, position, body, updated_at)
             SELECT ?, ?, ?, ?, ?, 'pending', ?, COALESCE(MAX(position), 0) + 1, ?, ?
             FROM queue_items WHERE window_hour = ? AND action_type = ?",
        )
        .bind(&item.id)
        .bind(item.enqueued_at_window.hour_index())
        .bind(&item.action_type)
        .bind(item.scope_type.as_str())
        .bind(&item.scope_id)
        .bind(item.reason.as_str())
        .bind(&body)
        .bind(item.updated_at.timestamp())
        .bind(item.enqueued_at_window.hour_index())
        .bind(&item.action_type)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn pop(
        &self,
        window: Window,
        action_type: &str,
        now: DateTime<Utc>,
    ) -> StoreResult<Option<QueueItem>> {
        let body: Option<String> = sqlx::query_scalar(
            "UPDATE queue_items SET status = 'processing', updated_at = ?
             WHERE seq = (
                SELECT seq FROM queue_items
                WHERE window_hour = ? AND action_type = ? AND status = 'pending'
                ORDER BY position, seq LIMIT 1
             )
             RETURNING body",
        )
        .bind(now.timestamp())
        .bind(window.hour_index())
        .bind(action_type)
        .fetch_optional(&self.pool)
        .await?;

        body.map(|body| {
            let mut item: QueueItem = serde_json::from_str(&body)?;
            item.status = QueueStatus::Processing;
            item.updated_at = now;
            Ok(item)
        })
        .transpose()
    }

    async fn length(&self, window: Window, action_type: &str) -> StoreResult<u64> {
        let count: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM queue_items
             WHERE window_hour = ? AND action_type = ? AND status = 'pending'",
        )
        .bind(window.hour_index())
        .bind(action_type)
        .fetch_one(&self.pool)
        .await?;

        Ok(to_u64(count))
    }

    async fn length_all(&self, window: Window) -> StoreResult<u64> {
        let count: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM queue_items WHERE window_hour = ? AND status = 'pending'",
        )
        .bind(window.hour_index())
        .fetch_one(&self.pool)
        .await?;

        Ok(to_u64(count))
    }

    async fn count_by_status(&self, window: Window) -> StoreResult<StatusCounts> {
        let rows: Vec<(String, i64)> = sqlx::query_as(
            "SELECT status, COUNT(*) FROM queue_items WHERE window_hour = ? GROUP BY status",
        )
        .bind(window.hour_index())
        .fetch_all(&self.pool)
        .await?;

        let mut counts = StatusCounts::default();
        for (status, count) in rows {
            let count = to_u64(count);
            match QueueStatus::parse(&status) {
                Some(QueueStatus::Pending) => counts.pending += count,
                Some(QueueStatus::Processing) => counts.processing += count,
                Some(QueueStatus::Completed) => counts.completed += count,
                Some(QueueStatus::Failed) => counts.failed += count,
                None => {
                    return Err(StoreError::Corrupt(format!("unknown queue status '{}'", status)))
                }
            }
        }
        Ok(counts)
    }

    async fn count_by_type(&self, window: Window) -> StoreResult<Vec<GroupCount>> {
        let rows: Vec<(String, i64)> = sqlx::query_as(
            "SELECT action_type, COUNT(*) FROM queue_items
             WHERE window_hour = ? AND status = 'pending'
             GROUP BY action_type",
        )
        .bind(window.hour_index())
        .fetch_all(&self.pool)
        .await?;

        Ok(into_buckets(rows))
    }

    async fn count_by_reason(&self, window: Window) -> StoreResult<Vec<GroupCount>> {
        let rows: Vec<(String, i64)> = sqlx::query_as(
            "SELECT reason, COUNT(*) FROM queue_items
             WHERE window_hour = ? AND status = 'pending'
             GROUP BY reason",
        )
        .bind(window.hour_index())
        .fetch_all(&self.pool)
        .await?;

        Ok(into_buckets(rows))
    }

    async fn ack(&self, item: &QueueItem) -> StoreResult<bool> {
        let body = serde_json::to_string(item)?;

        let result = sqlx::query(
            "UPDATE queue_items SET status = ?, body = ?, updated_at = ?
             WHERE id = ? AND status IN ('pending', 'processing')",
        )
        .bind(item.status.as_str())
        .bind(&body)
        .bind(item.updated_at.timestamp())
        .bind(&item.id)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Ok(false);
        }

        // Keep only the most recent settled items
        sqlx::query(
            "DELETE FROM queue_items
             WHERE status IN ('completed', 'failed') AND seq NOT IN (
                SELECT seq FROM queue_items
                WHERE status IN ('completed', 'failed')
                ORDER BY updated_at DESC, seq DESC
                LIMIT ?
             )",
        )
        .bind(self.audit_capacity)
        .execute(&self.pool)
        .await?;

        Ok(true)
    }

    async fn requeue_front(&self, items: Vec<QueueItem>) -> StoreResult<usize> {
        // Popping never changes an item's position, so restoring the pending
        // status puts it back at the head of its list.
        let mut moved = 0;
        let mut tx = self.pool.begin().await?;
        for mut item in items {
            item.status = QueueStatus::Pending;
            let body = serde_json::to_string(&item)?;
            let result = sqlx::query(
                "UPDATE queue_items SET status = 'pending', reason = ?, body = ?, updated_at = ?
                 WHERE id = ? AND status = 'processing'",
            )
            .bind(item.reason.as_str())
            .bind(&body)
            .bind(item.updated_at.timestamp())
            .bind(&item.id)
            .execute(&mut *tx)
            .await?;
            moved += usize::try_from(result.rows_affected()).unwrap_or(0);
        }
        tx.commit().await?;
        Ok(moved)
    }

    async fn recover_in_flight(&self) -> StoreResult<usize> {
        let result =
            sqlx::query("UPDATE queue_items SET status = 'pending' WHERE status = 'processing'")
                .execute(&self.pool)
                .await?;

        Ok(usize::try_from(result.rows_affected()).unwrap_or(usize::MAX))
    }

    async fn pending_lists(&self) -> StoreResult<Vec<(Window, String)>> {
        let rows: Vec<(i64, String)> = sqlx::query_as(
            "SELECT DISTINCT window_hour, action_type FROM queue_items
             WHERE status = 'pending'
             ORDER BY window_hour, action_type",
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|(hour, action_type)| (Window::from_hour(hour), action_type))
            .collect())
    }

    async fn pending_for_scope(&self, scope: &Scope) -> StoreResult<u64> {
        let count: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM queue_items
             WHERE scope_type = ? AND scope_id = ? AND status = 'pending'",
        )
        .bind(scope.scope_type.as_str())
        .bind(&scope.id)
        .fetch_one(&self.pool)
        .await?;

        Ok(to_u64(count))
    }

    async fn try_claim_drain(
        &self,
        window: Window,
        owner: &str,
        lease_until: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> StoreResult<DrainClaim> {
        let result = sqlx::query(
            "INSERT INTO drain_runs (window_hour, owner, lease_until, completed)
             VALUES (?, ?, ?, 0)
             ON CONFLICT(window_hour) DO UPDATE SET
                owner = excluded.owner,
                lease_until = excluded.lease_until
             WHERE drain_runs.completed = 0
               AND (drain_runs.owner = excluded.owner OR drain_runs.lease_until <= ?)",
        )
        .bind(window.hour_index())
        .bind(owner)
        .bind(lease_until.timestamp())
        .bind(now.timestamp())
        .execute(&self.pool)
        .await?;

        if result.rows_affected() > 0 {
            return Ok(DrainClaim::Acquired);
        }

        let completed: i64 =
            sqlx::query_scalar("SELECT completed FROM drain_runs WHERE window_hour = ?")
                .bind(window.hour_index())
                .fetch_one(&self.pool)
                .await?;

        Ok(if completed != 0 {
            DrainClaim::Completed
        } else {
            DrainClaim::Held
        })
    }

    async fn complete_drain(&self, window: Window, owner: &str) -> StoreResult<()> {
        sqlx::query("UPDATE drain_runs SET completed = 1 WHERE window_hour = ? AND owner = ?")
            .bind(window.hour_index())
            .bind(owner)
            .execute(&self.pool)
            .await?;

        Ok(())
    }
}

fn into_buckets(rows: Vec<(String, i64)>) -> Vec<GroupCount> {
    let mut buckets: Vec<GroupCount> = rows
        .into_iter()
        .map(|(id, count)| GroupCount {
            id,
            count: to_u64(count),
        })
        .collect();
    sort_buckets(&mut buckets);
    buckets
}

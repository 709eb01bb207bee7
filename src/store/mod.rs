//! Counter and queue storage.
//!
//! The engine talks to its key-value store through two traits: [`CounterStore`]
//! for per-window call counters and [`QueueStore`] for deferred calls. Both are
//! implemented in memory (`dashmap`) and on SQLite (`sqlx`), and any
//! implementation can be wrapped in a [`GuardedStore`] that bounds every call
//! with a timeout and a circuit breaker.

mod guarded;
mod memory;
mod sqlite;

pub use guarded::{CircuitBreaker, GuardedStore};
pub use memory::MemoryStore;
pub use sqlite::SqliteStore;

#[cfg(test)]
pub(crate) use guarded::testing;

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use utoipa::ToSchema;

use crate::config::{StoreBackend, StoreConfig};
use crate::queue::{GroupCount, QueueItem, StatusCounts};
use crate::window::Window;

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("Store unavailable: {0}")]
    Unavailable(String),

    #[error("Store operation timed out after {0:?}")]
    Timeout(Duration),

    #[error("Database error: {0}")]
    Sqlx(#[from] sqlx::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Corrupt record: {0}")]
    Corrupt(String),
}

pub type StoreResult<T> = Result<T, StoreError>;

/// Which kind of principal a counter accounts for
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "lowercase")]
pub enum ScopeType {
    Global,
    Account,
    User,
}

impl ScopeType {
    pub fn as_str(self) -> &'static str {
        match self {
            ScopeType::Global => "global",
            ScopeType::Account => "account",
            ScopeType::User => "user",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "global" => Some(ScopeType::Global),
            "account" => Some(ScopeType::Account),
            "user" => Some(ScopeType::User),
            _ => None,
        }
    }
}

/// Identity of a counter's owner within a window
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Scope {
    pub scope_type: ScopeType,
    pub id: String,
}

impl Scope {
    pub const GLOBAL_ID: &'static str = "global";

    pub fn new(scope_type: ScopeType, id: &str) -> Self {
        Self {
            scope_type,
            id: id.to_string(),
        }
    }

    pub fn global() -> Self {
        Self::new(ScopeType::Global, Self::GLOBAL_ID)
    }

    pub fn account(id: &str) -> Self {
        Self::new(ScopeType::Account, id)
    }

    pub fn user(id: &str) -> Self {
        Self::new(ScopeType::User, id)
    }
}

impl fmt::Display for Scope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.scope_type.as_str(), self.id)
    }
}

/// Address of one counter: a scope within a window
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CounterKey {
    pub window: Window,
    pub scope: Scope,
}

impl CounterKey {
    pub fn new(window: Window, scope: Scope) -> Self {
        Self { window, scope }
    }
}

/// Attributes recorded alongside a counter when it is created
#[derive(Debug, Clone, Default)]
pub struct CounterMeta {
    pub tier: Option<String>,
    pub limit: u64,
}

/// Snapshot of one counter row
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CallCounter {
    pub window: Window,
    pub scope_id: String,
    pub scope_type: ScopeType,
    pub tier: Option<String>,
    pub count: u64,
    pub limit: u64,
    pub expires_at: Option<DateTime<Utc>>,
}

/// Outcome of trying to claim the drain of a window
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DrainClaim {
    /// This owner may drain the window
    Acquired,
    /// The window has already been drained to completion
    Completed,
    /// Another owner holds an unexpired lease
    Held,
}

/// Per-window call counters backed by an atomic-increment store.
#[async_trait]
pub trait CounterStore: Send + Sync {
    /// Atomically add one to the counter, creating it on first use, unless it
    /// has already reached `meta.limit`. Returns the new value, or `None` when
    /// the counter was full and left untouched.
    async fn increment_below(&self, key: &CounterKey, meta: &CounterMeta)
        -> StoreResult<Option<u64>>;

    /// Atomically subtract one, flooring at zero. Used to release a reservation.
    async fn decrement(&self, key: &CounterKey) -> StoreResult<u64>;

    /// Current value without mutating; missing counters read as zero.
    async fn get(&self, key: &CounterKey) -> StoreResult<u64>;

    /// Set when the counter may be reclaimed.
    async fn set_expiry(&self, key: &CounterKey, expires_at: DateTime<Utc>) -> StoreResult<()>;

    /// All counters recorded in a window.
    async fn counters(&self, window: Window) -> StoreResult<Vec<CallCounter>>;

    /// Evict counters that expired before `now`, plus counters without an
    /// expiry whose window ended before `stale_before`.
    async fn purge_expired(
        &self,
        now: DateTime<Utc>,
        stale_before: DateTime<Utc>,
    ) -> StoreResult<usize>;

    /// Whether the store is currently refusing work (e.g. circuit open).
    fn is_degraded(&self) -> bool {
        false
    }
}

/// FIFO lists of deferred calls keyed by (window, action type).
#[async_trait]
pub trait QueueStore: Send + Sync {
    /// Append to the tail of the item's list.
    async fn push(&self, item: QueueItem) -> StoreResult<()>;

    /// Take the head of a list and move it to the in-flight set.
    async fn pop(
        &self,
        window: Window,
        action_type: &str,
        now: DateTime<Utc>,
    ) -> StoreResult<Option<QueueItem>>;

    /// Pending items in one list.
    async fn length(&self, window: Window, action_type: &str) -> StoreResult<u64>;

    /// Pending items across every list of a window.
    async fn length_all(&self, window: Window) -> StoreResult<u64>;

    async fn count_by_status(&self, window: Window) -> StoreResult<StatusCounts>;

    /// Pending items per action type.
    async fn count_by_type(&self, window: Window) -> StoreResult<Vec<GroupCount>>;

    /// Pending items per deferral reason.
    async fn count_by_reason(&self, window: Window) -> StoreResult<Vec<GroupCount>>;

    /// Settle an item with its terminal status and keep it in the bounded
    /// audit trail.
    ///
    /// The item is settled whether it is still in flight or was recovered to
    /// its list by another drain. Returns false when it had already been
    /// settled, in which case nothing changes.
    async fn ack(&self, item: &QueueItem) -> StoreResult<bool>;

    /// Return in-flight items to the head of their lists, keeping their order.
    /// Items no longer in flight (recovered or settled elsewhere) are skipped.
    /// Returns how many moved.
    async fn requeue_front(&self, items: Vec<QueueItem>) -> StoreResult<usize>;

    /// Return every in-flight item to its list. Returns how many moved.
    async fn recover_in_flight(&self) -> StoreResult<usize>;

    /// Non-empty lists, oldest window first.
    async fn pending_lists(&self) -> StoreResult<Vec<(Window, String)>>;

    /// Pending items belonging to one scope, across all windows.
    async fn pending_for_scope(&self, scope: &Scope) -> StoreResult<u64>;

    /// Claim the drain of a window, or renew a lease this owner already holds.
    /// Another owner may only take over once the lease has expired.
    async fn try_claim_drain(
        &self,
        window: Window,
        owner: &str,
        lease_until: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> StoreResult<DrainClaim>;

    async fn complete_drain(&self, window: Window, owner: &str) -> StoreResult<()>;
}

/// A store that provides both counters and queues.
pub trait Store: CounterStore + QueueStore {}

impl<T: CounterStore + QueueStore> Store for T {}

pub type SharedStore = Arc<dyn Store>;

/// Open the configured backend and wrap it with timeout and circuit breaking.
///
/// If the durable backend cannot be opened the service still starts on the
/// in-memory store, logged as a warning.
pub async fn connect(config: &StoreConfig) -> SharedStore {
    let inner: SharedStore = match config.backend {
        StoreBackend::Memory => {
            tracing::info!("Using in-memory counter store");
            Arc::new(MemoryStore::new(config.audit_capacity))
        }
        StoreBackend::Sqlite => match SqliteStore::connect(config).await {
            Ok(store) => {
                tracing::info!(url = %config.database_url, "Using SQLite counter store");
                Arc::new(store)
            }
            Err(e) => {
                tracing::warn!(
                    error = %e,
                    url = %config.database_url,
                    "SQLite store unavailable, falling back to in-memory store"
                );
                Arc::new(MemoryStore::new(config.audit_capacity))
            }
        },
    };

    Arc::new(GuardedStore::new(
        inner,
        Duration::from_millis(config.op_timeout_ms),
        CircuitBreaker::new(
            config.breaker_failure_threshold,
            Duration::from_secs(config.breaker_cooldown_secs),
        ),
    ))
}

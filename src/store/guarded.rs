use std::future::Future;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use super::{
    CallCounter, CounterKey, CounterMeta, CounterStore, DrainClaim, QueueStore, Scope,
    SharedStore, StoreError, StoreResult,
};
use crate::queue::{GroupCount, QueueItem, StatusCounts};
use crate::window::Window;

/// Opens after `threshold` consecutive failures and stays open for `cooldown`.
#[derive(Debug, Clone)]
pub struct CircuitBreaker {
    failures: u32,
    threshold: u32,
    cooldown: Duration,
    open_until: Option<Instant>,
}

impl CircuitBreaker {
    pub fn new(threshold: u32, cooldown: Duration) -> Self {
        Self {
            failures: 0,
            threshold: threshold.max(1),
            cooldown,
            open_until: None,
        }
    }

    /// Returns true when this failure tripped the breaker.
    pub fn record_failure(&mut self, now: Instant) -> bool {
        if self.is_open(now) {
            return false;
        }
        self.failures = self.failures.saturating_add(1);
        if self.failures >= self.threshold {
            self.open_until = Some(now + self.cooldown);
            return true;
        }
        false
    }

    pub fn record_success(&mut self) {
        self.failures = 0;
        self.open_until = None;
    }

    pub fn is_open(&mut self, now: Instant) -> bool {
        if let Some(until) = self.open_until {
            if now >= until {
                self.open_until = None;
                self.failures = 0;
                return false;
            }
            return true;
        }
        false
    }

    pub fn cooldown_remaining_ms(&self, now: Instant) -> Option<u64> {
        self.open_until
            .and_then(|until| until.checked_duration_since(now))
            .map(|duration| duration.as_millis() as u64)
    }
}

/// Bounds every store call with a timeout and short-circuits while the
/// breaker is open, so a stalled store degrades callers instead of hanging them.
pub struct GuardedStore {
    inner: SharedStore,
    timeout: Duration,
    breaker: Mutex<CircuitBreaker>,
}

impl GuardedStore {
    pub fn new(inner: SharedStore, timeout: Duration, breaker: CircuitBreaker) -> Self {
        Self {
            inner,
            timeout,
            breaker: Mutex::new(breaker),
        }
    }

    fn with_breaker<T>(&self, f: impl FnOnce(&mut CircuitBreaker) -> T) -> T {
        let mut breaker = match self.breaker.lock() {
            Ok(breaker) => breaker,
            Err(poisoned) => poisoned.into_inner(),
        };
        f(&mut breaker)
    }

    async fn guard<T, F>(&self, op: &'static str, fut: F) -> StoreResult<T>
    where
        F: Future<Output = StoreResult<T>> + Send,
    {
        let now = Instant::now();
        if let Some(remaining_ms) =
            self.with_breaker(|b| b.is_open(now).then(|| b.cooldown_remaining_ms(now).unwrap_or(0)))
        {
            return Err(StoreError::Unavailable(format!(
                "circuit open, retrying in {}ms",
                remaining_ms
            )));
        }

        let result = match tokio::time::timeout(self.timeout, fut).await {
            Ok(result) => result,
            Err(_) => Err(StoreError::Timeout(self.timeout)),
        };

        match &result {
            Ok(_) => self.with_breaker(CircuitBreaker::record_success),
            Err(e) => {
                let tripped = self.with_breaker(|b| b.record_failure(Instant::now()));
                if tripped {
                    tracing::warn!(op = op, error = %e, "Store circuit opened");
                } else {
                    tracing::debug!(op = op, error = %e, "Store operation failed");
                }
            }
        }
        result
    }
}

#[async_trait]
impl CounterStore for GuardedStore {
    async fn increment_below(
        &self,
        key: &CounterKey,
        meta: &CounterMeta,
    ) -> StoreResult<Option<u64>> {
        self.guard("increment_below", self.inner.increment_below(key, meta))
            .await
    }

    async fn decrement(&self, key: &CounterKey) -> StoreResult<u64> {
        self.guard("decrement", self.inner.decrement(key)).await
    }

    async fn get(&self, key: &CounterKey) -> StoreResult<u64> {
        self.guard("get", self.inner.get(key)).await
    }

    async fn set_expiry(&self, key: &CounterKey, expires_at: DateTime<Utc>) -> StoreResult<()> {
        self.guard("set_expiry", self.inner.set_expiry(key, expires_at))
            .await
    }

    async fn counters(&self, window: Window) -> StoreResult<Vec<CallCounter>> {
        self.guard("counters", self.inner.counters(window)).await
    }

    async fn purge_expired(
        &self,
        now: DateTime<Utc>,
        stale_before: DateTime<Utc>,
    ) -> StoreResult<usize> {
        self.guard("purge_expired", self.inner.purge_expired(now, stale_before))
            .await
    }

    fn is_degraded(&self) -> bool {
        let now = Instant::now();
        self.with_breaker(|b| b.is_open(now))
    }
}

#[async_trait]
impl QueueStore for GuardedStore {
    async fn push(&self, item: QueueItem) -> StoreResult<()> {
        self.guard("push", self.inner.push(item)).await
    }

    async fn pop(
        &self,
        window: Window,
        action_type: &str,
        now: DateTime<Utc>,
    ) -> StoreResult<Option<QueueItem>> {
        self.guard("pop", self.inner.pop(window, action_type, now))
            .await
    }

    async fn length(&self, window: Window, action_type: &str) -> StoreResult<u64> {
        self.guard("length", self.inner.length(window, action_type))
            .await
    }

    async fn length_all(&self, window: Window) -> StoreResult<u64> {
        self.guard("length_all", self.inner.length_all(window)).await
    }

    async fn count_by_status(&self, window: Window) -> StoreResult<StatusCounts> {
        self.guard("count_by_status", self.inner.count_by_status(window))
            .await
    }

    async fn count_by_type(&self, window: Window) -> StoreResult<Vec<GroupCount>> {
        self.guard("count_by_type", self.inner.count_by_type(window))
            .await
    }

    async fn count_by_reason(&self, window: Window) -> StoreResult<Vec<GroupCount>> {
        self.guard("count_by_reason", self.inner.count_by_reason(window))
            .await
    }

    async fn ack(&self, item: &QueueItem) -> StoreResult<bool> {
        self.guard("ack", self.inner.ack(item)).await
    }

    async fn requeue_front(&self, items: Vec<QueueItem>) -> StoreResult<usize> {
        self.guard("requeue_front", self.inner.requeue_front(items))
            .await
    }

    async fn recover_in_flight(&self) -> StoreResult<usize> {
        self.guard("recover_in_flight", self.inner.recover_in_flight())
            .await
    }

    async fn pending_lists(&self) -> StoreResult<Vec<(Window, String)>> {
        self.guard("pending_lists", self.inner.pending_lists()).await
    }

    async fn pending_for_scope(&self, scope: &Scope) -> StoreResult<u64> {
        self.guard("pending_for_scope", self.inner.pending_for_scope(scope))
            .await
    }

    async fn try_claim_drain(
        &self,
        window: Window,
        owner: &str,
        lease_until: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> StoreResult<DrainClaim> {
        self.guard(
            "try_claim_drain",
            self.inner.try_claim_drain(window, owner, lease_until, now),
        )
        .await
    }

    async fn complete_drain(&self, window: Window, owner: &str) -> StoreResult<()> {
        self.guard("complete_drain", self.inner.complete_drain(window, owner))
            .await
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;

    /// A store whose every operation fails or stalls, for exercising fail-open paths.
    pub struct BrokenStore {
        pub stall: Option<Duration>,
    }

    impl BrokenStore {
        async fn fail<T>(&self) -> StoreResult<T> {
            if let Some(stall) = self.stall {
                tokio::time::sleep(stall).await;
            }
            Err(StoreError::Unavailable("connection refused".to_string()))
        }
    }

    #[async_trait]
    impl CounterStore for BrokenStore {
        async fn increment_below(&self, _: &CounterKey, _: &CounterMeta) -> StoreResult<Option<u64>> {
            self.fail().await
        }
        async fn decrement(&self, _: &CounterKey) -> StoreResult<u64> {
            self.fail().await
        }
        async fn get(&self, _: &CounterKey) -> StoreResult<u64> {
            self.fail().await
        }
        async fn set_expiry(&self, _: &CounterKey, _: DateTime<Utc>) -> StoreResult<()> {
            self.fail().await
        }
        async fn counters(&self, _: Window) -> StoreResult<Vec<CallCounter>> {
            self.fail().await
        }
        async fn purge_expired(&self, _: DateTime<Utc>, _: DateTime<Utc>) -> StoreResult<usize> {
            self.fail().await
        }
    }

    #[async_trait]
    impl QueueStore for BrokenStore {
        async fn push(&self, _: QueueItem) -> StoreResult<()> {
            self.fail().await
        }
        async fn pop(&self, _: Window, _: &str, _: DateTime<Utc>) -> StoreResult<Option<QueueItem>> {
            self.fail().await
        }
        async fn length(&self, _: Window, _: &str) -> StoreResult<u64> {
            self.fail().await
        }
        async fn length_all(&self, _: Window) -> StoreResult<u64> {
            self.fail().await
        }
        async fn count_by_status(&self, _: Window) -> StoreResult<StatusCounts> {
            self.fail().await
        }
        async fn count_by_type(&self, _: Window) -> StoreResult<Vec<GroupCount>> {
            self.fail().await
        }
        async fn count_by_reason(&self, _: Window) -> StoreResult<Vec<GroupCount>> {
            self.fail().await
        }
        async fn ack(&self, _: &QueueItem) -> StoreResult<bool> {
            self.fail().await
        }
        async fn requeue_front(&self, _: Vec<QueueItem>) -> StoreResult<usize> {
            self.fail().await
        }
        async fn recover_in_flight(&self) -> StoreResult<usize> {
            self.fail().await
        }
        async fn pending_lists(&self) -> StoreResult<Vec<(Window, String)>> {
            self.fail().await
        }
        async fn pending_for_scope(&self, _: &Scope) -> StoreResult<u64> {
            self.fail().await
        }
        async fn try_claim_drain(
            &self,
            _: Window,
            _: &str,
            _: DateTime<Utc>,
            _: DateTime<Utc>,
        ) -> StoreResult<DrainClaim> {
            self.fail().await
        }
        async fn complete_drain(&self, _: Window, _: &str) -> StoreResult<()> {
            self.fail().await
        }
    }
}

#[cfg(test)]
mod tests {
    use super::testing::BrokenStore;
    use super::*;
    use crate::store::{MemoryStore, Scope};
    use std::sync::Arc;

    fn key() -> CounterKey {
        CounterKey::new(Window::from_hour(1000), Scope::global())
    }

    #[test]
    fn test_breaker_opens_after_threshold() {
        let mut breaker = CircuitBreaker::new(2, Duration::from_secs(30));
        let now = Instant::now();
        assert!(!breaker.record_failure(now));
        assert!(breaker.record_failure(now));
        assert!(breaker.is_open(now));
        assert!(!breaker.is_open(now + Duration::from_secs(31)));
    }

    #[test]
    fn test_breaker_success_resets() {
        let mut breaker = CircuitBreaker::new(2, Duration::from_secs(30));
        let now = Instant::now();
        breaker.record_failure(now);
        breaker.record_success();
        assert!(!breaker.record_failure(now));
        assert!(!breaker.is_open(now));
    }

    #[tokio::test]
    async fn test_guarded_passes_through() {
        let store = GuardedStore::new(
            Arc::new(MemoryStore::default()),
            Duration::from_secs(1),
            CircuitBreaker::new(3, Duration::from_secs(30)),
        );
        let meta = CounterMeta {
            tier: None,
            limit: 5,
        };
        assert_eq!(store.increment_below(&key(), &meta).await.unwrap(), Some(1));
        assert_eq!(store.get(&key()).await.unwrap(), 1);
        assert!(!store.is_degraded());
    }

    #[tokio::test]
    async fn test_guarded_times_out_stalled_store() {
        let store = GuardedStore::new(
            Arc::new(BrokenStore {
                stall: Some(Duration::from_secs(10)),
            }),
            Duration::from_millis(20),
            CircuitBreaker::new(3, Duration::from_secs(30)),
        );
        let started = Instant::now();
        let result = store.get(&key()).await;
        assert!(matches!(result, Err(StoreError::Timeout(_))));
        assert!(started.elapsed() < Duration::from_secs(5));
    }

    #[tokio::test]
    async fn test_guarded_opens_circuit() {
        let store = GuardedStore::new(
            Arc::new(BrokenStore { stall: None }),
            Duration::from_secs(1),
            CircuitBreaker::new(2, Duration::from_secs(30)),
        );
        assert!(store.get(&key()).await.is_err());
        assert!(store.get(&key()).await.is_err());
        assert!(store.is_degraded());
        match store.get(&key()).await {
            Err(StoreError::Unavailable(msg)) => assert!(msg.contains("circuit open")),
            other => panic!("expected open circuit, got {:?}", other),
        }
    }
}

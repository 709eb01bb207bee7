use std::collections::VecDeque;
use std::sync::Mutex;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use indexmap::IndexMap;

use super::{
    CallCounter, CounterKey, CounterMeta, CounterStore, DrainClaim, QueueStore, Scope,
    StoreResult,
};
use crate::queue::models::sort_buckets;
use crate::queue::{GroupCount, QueueItem, QueueStatus, StatusCounts};
use crate::window::Window;

struct CounterEntry {
    count: u64,
    limit: u64,
    tier: Option<String>,
    expires_at: Option<DateTime<Utc>>,
}

struct DrainRecord {
    owner: String,
    lease_until: DateTime<Utc>,
    completed: bool,
}

/// Process-local store for single-instance deployments and tests.
///
/// Counter updates are atomic per key through the map's entry API. Nothing
/// survives a restart.
pub struct MemoryStore {
    counters: DashMap<CounterKey, CounterEntry>,
    lists: DashMap<(Window, String), VecDeque<QueueItem>>,
    in_flight: DashMap<String, QueueItem>,
    audit: Mutex<VecDeque<QueueItem>>,
    audit_capacity: usize,
    drains: DashMap<Window, DrainRecord>,
}

impl MemoryStore {
    pub fn new(audit_capacity: usize) -> Self {
        Self {
            counters: DashMap::new(),
            lists: DashMap::new(),
            in_flight: DashMap::new(),
            audit: Mutex::new(VecDeque::new()),
            audit_capacity: audit_capacity.max(1),
            drains: DashMap::new(),
        }
    }

    fn audit_snapshot(&self) -> Vec<QueueItem> {
        match self.audit.lock() {
            Ok(audit) => audit.iter().cloned().collect(),
            Err(poisoned) => poisoned.into_inner().iter().cloned().collect(),
        }
    }

    fn push_front(&self, mut item: QueueItem) {
        item.status = QueueStatus::Pending;
        self.lists.entry(item.list_key()).or_default().push_front(item);
    }

    /// Take a pending item out of its list, dropping the list once empty.
    fn remove_pending(&self, item: &QueueItem) -> bool {
        let key = item.list_key();
        let removed = match self.lists.get_mut(&key) {
            Some(mut list) => match list.iter().position(|queued| queued.id == item.id) {
                Some(index) => list.remove(index).is_some(),
                None => false,
            },
            None => false,
        };
        self.lists.remove_if(&key, |_, list| list.is_empty());
        removed
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new(1000)
    }
}

#[async_trait]
impl CounterStore for MemoryStore {
    async fn increment_below(
        &self,
        key: &CounterKey,
        meta: &CounterMeta,
    ) -> StoreResult<Option<u64>> {
        if meta.limit == 0 {
            return Ok(None);
        }
        let mut entry = self
            .counters
            .entry(key.clone())
            .or_insert_with(|| CounterEntry {
                count: 0,
                limit: meta.limit,
                tier: meta.tier.clone(),
                expires_at: None,
            });
        if entry.count >= meta.limit {
            return Ok(None);
        }
        entry.count += 1;
        if entry.tier.is_none() {
            entry.tier = meta.tier.clone();
        }
        Ok(Some(entry.count))
    }

    async fn decrement(&self, key: &CounterKey) -> StoreResult<u64> {
        Ok(match self.counters.get_mut(key) {
            Some(mut entry) => {
                entry.count = entry.count.saturating_sub(1);
                entry.count
            }
            None => 0,
        })
    }

    async fn get(&self, key: &CounterKey) -> StoreResult<u64> {
        Ok(self.counters.get(key).map_or(0, |entry| entry.count))
    }

    async fn set_expiry(&self, key: &CounterKey, expires_at: DateTime<Utc>) -> StoreResult<()> {
        if let Some(mut entry) = self.counters.get_mut(key) {
            entry.expires_at = Some(expires_at);
        }
        Ok(())
    }

    async fn counters(&self, window: Window) -> StoreResult<Vec<CallCounter>> {
        let mut counters: Vec<CallCounter> = self
            .counters
            .iter()
            .filter(|entry| entry.key().window == window)
            .map(|entry| CallCounter {
                window,
                scope_id: entry.key().scope.id.clone(),
                scope_type: entry.key().scope.scope_type,
                tier: entry.tier.clone(),
                count: entry.count,
                limit: entry.limit,
                expires_at: entry.expires_at,
            })
            .collect();
        counters.sort_by(|a, b| (a.scope_type, &a.scope_id).cmp(&(b.scope_type, &b.scope_id)));
        Ok(counters)
    }

    async fn purge_expired(
        &self,
        now: DateTime<Utc>,
        stale_before: DateTime<Utc>,
    ) -> StoreResult<usize> {
        let before = self.counters.len();
        self.counters.retain(|key, entry| match entry.expires_at {
            Some(expires_at) => expires_at > now,
            None => key.window.end() > stale_before,
        });
        self.drains
            .retain(|window, _| window.end() > stale_before);
        self.lists.retain(|_, list| !list.is_empty());
        Ok(before.saturating_sub(self.counters.len()))
    }
}

#[async_trait]
impl QueueStore for MemoryStore {
    async fn push(&self, item: QueueItem) -> StoreResult<()> {
        self.lists.entry(item.list_key()).or_default().push_back(item);
        Ok(())
    }

    async fn pop(
        &self,
        window: Window,
        action_type: &str,
        now: DateTime<Utc>,
    ) -> StoreResult<Option<QueueItem>> {
        let key = (window, action_type.to_string());
        let popped = self
            .lists
            .get_mut(&key)
            .and_then(|mut list| list.pop_front());
        self.lists.remove_if(&key, |_, list| list.is_empty());

        Ok(popped.map(|mut item| {
            item.status = QueueStatus::Processing;
            item.updated_at = now;
            self.in_flight.insert(item.id.clone(), item.clone());
            item
        }))
    }

    async fn length(&self, window: Window, action_type: &str) -> StoreResult<u64> {
        Ok(self
            .lists
            .get(&(window, action_type.to_string()))
            .map_or(0, |list| list.len() as u64))
    }

    async fn length_all(&self, window: Window) -> StoreResult<u64> {
        Ok(self
            .lists
            .iter()
            .filter(|list| list.key().0 == window)
            .map(|list| list.len() as u64)
            .sum())
    }

    async fn count_by_status(&self, window: Window) -> StoreResult<StatusCounts> {
        let mut counts = StatusCounts {
            pending: self.length_all(window).await?,
            ..StatusCounts::default()
        };
        for item in self.in_flight.iter() {
            if item.enqueued_at_window == window {
                counts.add(QueueStatus::Processing);
            }
        }
        for item in self.audit_snapshot() {
            if item.enqueued_at_window == window {
                counts.add(item.status);
            }
        }
        Ok(counts)
    }

    async fn count_by_type(&self, window: Window) -> StoreResult<Vec<GroupCount>> {
        let mut buckets: Vec<GroupCount> = self
            .lists
            .iter()
            .filter(|list| list.key().0 == window && !list.is_empty())
            .map(|list| GroupCount {
                id: list.key().1.clone(),
                count: list.len() as u64,
            })
            .collect();
        sort_buckets(&mut buckets);
        Ok(buckets)
    }

    async fn count_by_reason(&self, window: Window) -> StoreResult<Vec<GroupCount>> {
        let mut totals: IndexMap<&'static str, u64> = IndexMap::new();
        for list in self.lists.iter().filter(|list| list.key().0 == window) {
            for item in list.iter() {
                *totals.entry(item.reason.as_str()).or_default() += 1;
            }
        }
        let mut buckets: Vec<GroupCount> = totals
            .into_iter()
            .map(|(id, count)| GroupCount {
                id: id.to_string(),
                count,
            })
            .collect();
        sort_buckets(&mut buckets);
        Ok(buckets)
    }

    async fn ack(&self, item: &QueueItem) -> StoreResult<bool> {
        let settled = self.in_flight.remove(&item.id).is_some() || self.remove_pending(item);
        if !settled {
            return Ok(false);
        }
        let mut audit = match self.audit.lock() {
            Ok(audit) => audit,
            Err(poisoned) => poisoned.into_inner(),
        };
        audit.push_back(item.clone());
        while audit.len() > self.audit_capacity {
            audit.pop_front();
        }
        Ok(true)
    }

    async fn requeue_front(&self, items: Vec<QueueItem>) -> StoreResult<usize> {
        let mut moved = 0;
        for item in items.into_iter().rev() {
            if self.in_flight.remove(&item.id).is_some() {
                self.push_front(item);
                moved += 1;
            }
        }
        Ok(moved)
    }

    async fn recover_in_flight(&self) -> StoreResult<usize> {
        let ids: Vec<String> = self.in_flight.iter().map(|item| item.key().clone()).collect();
        let mut recovered: Vec<QueueItem> = ids
            .iter()
            .filter_map(|id| self.in_flight.remove(id).map(|(_, item)| item))
            .collect();
        recovered.sort_by(|a, b| a.enqueued_at.cmp(&b.enqueued_at));

        let count = recovered.len();
        for item in recovered.into_iter().rev() {
            self.push_front(item);
        }
        Ok(count)
    }

    async fn pending_lists(&self) -> StoreResult<Vec<(Window, String)>> {
        let mut keys: Vec<(Window, String)> = self
            .lists
            .iter()
            .filter(|list| !list.is_empty())
            .map(|list| list.key().clone())
            .collect();
        keys.sort();
        Ok(keys)
    }

    async fn pending_for_scope(&self, scope: &Scope) -> StoreResult<u64> {
        Ok(self
            .lists
            .iter()
            .map(|list| {
                list.iter()
                    .filter(|item| item.scope_type == scope.scope_type && item.scope_id == scope.id)
                    .count() as u64
            })
            .sum())
    }

    async fn try_claim_drain(
        &self,
        window: Window,
        owner: &str,
        lease_until: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> StoreResult<DrainClaim> {
        Ok(match self.drains.entry(window) {
            Entry::Vacant(vacant) => {
                vacant.insert(DrainRecord {
                    owner: owner.to_string(),
                    lease_until,
                    completed: false,
                });
                DrainClaim::Acquired
            }
            Entry::Occupied(mut occupied) => {
                let record = occupied.get_mut();
                if record.completed {
                    DrainClaim::Completed
                } else if record.owner == owner || record.lease_until <= now {
                    record.owner = owner.to_string();
                    record.lease_until = lease_until;
                    DrainClaim::Acquired
                } else {
                    DrainClaim::Held
                }
            }
        })
    }

    async fn complete_drain(&self, window: Window, owner: &str) -> StoreResult<()> {
        if let Some(mut record) = self.drains.get_mut(&window) {
            if record.owner == owner {
                record.completed = true;
            }
        }
        Ok(())
    }
}

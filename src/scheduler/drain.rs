use std::sync::Arc;

use chrono::Duration;
use serde::Serialize;
use utoipa::ToSchema;

use crate::admission::{AdmissionController, Capacity};
use crate::dispatch::CallDispatcher;
use crate::queue::{QueueItem, QueueReason, QueueStatus};
use crate::store::{DrainClaim, SharedStore, StoreResult};
use crate::window::{Clock, Window};

/// How a drain request ended
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum DrainOutcome {
    Drained,
    /// The window had already been drained; nothing was replayed
    AlreadyDrained,
    /// Another instance holds the drain lease
    Held,
    /// Another instance took over the lease mid-run
    LeaseLost,
}

/// Summary of one drain run
#[derive(Debug, Clone, Serialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct DrainReport {
    pub window: String,
    pub outcome: DrainOutcome,
    /// Items found in flight from an interrupted run
    pub recovered: usize,
    /// Items admitted and handed to the dispatcher
    pub replayed: u64,
    pub dispatch_failed: u64,
    /// Items still without quota, returned to their queue
    pub retained: u64,
    /// Items that ran out of replay attempts
    pub exhausted: u64,
    pub stopped_at_global_limit: bool,
}

impl DrainReport {
    fn new(window: Window, outcome: DrainOutcome) -> Self {
        Self {
            window: window.key(),
            outcome,
            recovered: 0,
            replayed: 0,
            dispatch_failed: 0,
            retained: 0,
            exhausted: 0,
            stopped_at_global_limit: false,
        }
    }
}

/// Replays deferred calls from earlier windows against a fresh window.
pub struct Drainer {
    store: SharedStore,
    admission: Arc<AdmissionController>,
    dispatcher: Arc<dyn CallDispatcher>,
    clock: Arc<dyn Clock>,
    owner: String,
    lease: Duration,
    max_replay_attempts: u32,
}

impl Drainer {
    pub fn new(
        store: SharedStore,
        admission: Arc<AdmissionController>,
        dispatcher: Arc<dyn CallDispatcher>,
        clock: Arc<dyn Clock>,
        lease: Duration,
        max_replay_attempts: u32,
    ) -> Self {
        Self {
            store,
            admission,
            dispatcher,
            clock,
            owner: uuid::Uuid::new_v4().to_string(),
            lease,
            max_replay_attempts: max_replay_attempts.max(1),
        }
    }

    /// Drain every queue from windows before `window`.
    ///
    /// Safe to call repeatedly: once a window has been drained to completion
    /// later calls return [`DrainOutcome::AlreadyDrained`] without side effects.
    pub async fn drain(&self, window: Window) -> StoreResult<DrainReport> {
        let now = self.clock.now();
        match self
            .store
            .try_claim_drain(window, &self.owner, now + self.lease, now)
            .await?
        {
            DrainClaim::Acquired => {}
            DrainClaim::Completed => {
                tracing::debug!(window = %window, "Window already drained");
                return Ok(DrainReport::new(window, DrainOutcome::AlreadyDrained));
            }
            DrainClaim::Held => {
                tracing::info!(window = %window, "Drain lease held by another instance");
                return Ok(DrainReport::new(window, DrainOutcome::Held));
            }
        }

        let mut report = DrainReport::new(window, DrainOutcome::Drained);
        report.recovered = self.store.recover_in_flight().await?;
        if report.recovered > 0 {
            tracing::warn!(
                count = report.recovered,
                "Recovered in-flight items from an interrupted drain"
            );
        }

        let mut retained = Vec::new();
        let drained = self.replay_lists(window, &mut report, &mut retained).await;

        // Retained items go back to the head of their lists even if the run failed
        if !retained.is_empty() {
            let count = retained.len();
            match self.store.requeue_front(retained).await {
                Ok(moved) if moved < count => {
                    tracing::debug!(
                        count,
                        moved,
                        "Some retained items were recovered by another drain"
                    );
                }
                Ok(_) => {}
                Err(e) => {
                    tracing::warn!(error = %e, "Failed to requeue retained items, they will be recovered next run");
                    drained?;
                    return Err(e);
                }
            }
        }
        drained?;

        if report.outcome == DrainOutcome::LeaseLost {
            tracing::warn!(
                window = %window,
                replayed = report.replayed,
                "Drain lease lost to another instance, stopping"
            );
            return Ok(report);
        }

        self.store.complete_drain(window, &self.owner).await?;

        tracing::info!(
            window = %window,
            replayed = report.replayed,
            dispatch_failed = report.dispatch_failed,
            retained = report.retained,
            exhausted = report.exhausted,
            stopped_at_global_limit = report.stopped_at_global_limit,
            "Queue drain finished"
        );
        Ok(report)
    }

    async fn replay_lists(
        &self,
        window: Window,
        report: &mut DrainReport,
        retained: &mut Vec<QueueItem>,
    ) -> StoreResult<()> {
        for (list_window, action_type) in self.store.pending_lists().await? {
            // Items queued during the window being drained wait for the next one
            if list_window >= window {
                continue;
            }

            loop {
                if !self.hold_lease(window).await? {
                    report.outcome = DrainOutcome::LeaseLost;
                    return Ok(());
                }
                let Some(mut item) = self
                    .store
                    .pop(list_window, &action_type, self.clock.now())
                    .await?
                else {
                    break;
                };

                let capacity = match self.admission.replay(&item, window).await {
                    Ok(capacity) => capacity,
                    Err(e) => {
                        retained.push(item);
                        return Err(e);
                    }
                };

                match capacity {
                    Capacity::Admitted { .. } => {
                        self.dispatch(&mut item, report).await;
                        self.settle(&item).await?;
                    }
                    Capacity::Exhausted(reason) => {
                        item.attempts += 1;
                        item.reason = reason;
                        item.updated_at = self.clock.now();

                        if item.attempts >= self.max_replay_attempts {
                            self.fail_exhausted(&mut item);
                            report.exhausted += 1;
                            self.settle(&item).await?;
                        } else {
                            report.retained += 1;
                            retained.push(item);
                        }

                        if reason == QueueReason::GlobalLimitReached {
                            // Nothing else fits in this window
                            report.stopped_at_global_limit = true;
                            return Ok(());
                        }
                    }
                }
            }
        }
        Ok(())
    }

    /// Extend the lease before taking another item. False once another owner has it.
    async fn hold_lease(&self, window: Window) -> StoreResult<bool> {
        let now = self.clock.now();
        let claim = self
            .store
            .try_claim_drain(window, &self.owner, now + self.lease, now)
            .await?;
        Ok(claim == DrainClaim::Acquired)
    }

    async fn settle(&self, item: &QueueItem) -> StoreResult<()> {
        if !self.store.ack(item).await? {
            tracing::debug!(item_id = %item.id, "Item was already settled by another drain");
        }
        Ok(())
    }

    async fn dispatch(&self, item: &mut QueueItem, report: &mut DrainReport) {
        match self.dispatcher.dispatch(item).await {
            Ok(()) => {
                item.status = QueueStatus::Completed;
                report.replayed += 1;
                metrics::counter!("callgate_queue_replayed_total").increment(1);
            }
            Err(e) => {
                tracing::warn!(item_id = %item.id, action_type = %item.action_type, error = %e, "Deferred call dispatch failed");
                item.status = QueueStatus::Failed;
                item.last_error = Some(e.to_string());
                report.dispatch_failed += 1;
                metrics::counter!("callgate_queue_dispatch_failed_total").increment(1);
            }
        }
        item.updated_at = self.clock.now();
    }

    fn fail_exhausted(&self, item: &mut QueueItem) {
        item.status = QueueStatus::Failed;
        item.last_error = Some(format!(
            "no quota after {} replay attempts ({})",
            item.attempts,
            item.reason.as_str()
        ));
        tracing::error!(
            alert = "QueueReplayExhausted",
            item_id = %item.id,
            scope_id = %item.scope_id,
            action_type = %item.action_type,
            enqueued_window = %item.enqueued_at_window,
            attempts = item.attempts,
            "Deferred call exceeded its replay attempts and was dropped"
        );
        metrics::counter!("callgate_queue_replay_exhausted_total").increment(1);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::admission::{AttemptRequest, Decision};
    use crate::dispatch::testing::RecordingDispatcher;
    use crate::dispatch::DispatchError;
    use crate::store::{CounterKey, CounterStore, MemoryStore, QueueStore, Scope};
    use crate::tiers::TierRegistry;
    use crate::window::ManualClock;
    use async_trait::async_trait;
    use chrono::{TimeZone, Utc};
    use serde_json::json;
    use std::collections::BTreeMap;
    use std::sync::Mutex;

    struct Harness {
        store: Arc<MemoryStore>,
        clock: Arc<ManualClock>,
        admission: Arc<AdmissionController>,
        dispatcher: Arc<RecordingDispatcher>,
        drainer: Drainer,
    }

    fn harness(free: u64, global: u64, max_attempts: u32, dispatcher: RecordingDispatcher) -> Harness {
        let store = Arc::new(MemoryStore::default());
        let clock = Arc::new(ManualClock::new(
            Utc.with_ymd_and_hms(2024, 1, 1, 10, 30, 0).unwrap(),
        ));
        let limits = BTreeMap::from([("free".to_string(), free)]);
        let admission = Arc::new(AdmissionController::new(
            store.clone(),
            Arc::new(TierRegistry::new(&limits, global).unwrap()),
            clock.clone(),
            Duration::hours(1),
            Vec::new(),
        ));
        let dispatcher = Arc::new(dispatcher);
        let drainer = Drainer::new(
            store.clone(),
            admission.clone(),
            dispatcher.clone(),
            clock.clone(),
            Duration::minutes(5),
            max_attempts,
        );
        Harness {
            store,
            clock,
            admission,
            dispatcher,
            drainer,
        }
    }

    impl Harness {
        async fn attempt(&self, scope_id: &str, action_type: &str) -> Decision {
            self.admission
                .attempt(AttemptRequest::new(scope_id, "free", action_type))
                .await
                .decision
        }

        fn next_hour(&self) -> Window {
            self.clock.advance(Duration::hours(1));
            self.clock.current_window()
        }
    }

    /// Stalls past the lease on its first call while a second drainer runs.
    struct StallingDispatcher {
        clock: Arc<ManualClock>,
        rival: Drainer,
        window: Window,
        rival_report: Mutex<Option<DrainReport>>,
    }

    #[async_trait]
    impl CallDispatcher for StallingDispatcher {
        async fn dispatch(&self, _item: &QueueItem) -> Result<(), DispatchError> {
            let rival_ran = self.rival_report.lock().unwrap().is_some();
            if rival_ran {
                return Ok(());
            }
            self.clock.set(self.clock.now() + Duration::minutes(6));
            let report = self
                .rival
                .drain(self.window)
                .await
                .map_err(|e| DispatchError::ServiceError(e.to_string()))?;
            *self.rival_report.lock().unwrap() = Some(report);
            Ok(())
        }
    }

    /// Takes four minutes per call and checks whether a rival could claim the window.
    struct SlowDispatcher {
        clock: Arc<ManualClock>,
        store: Arc<MemoryStore>,
        window: Window,
        rival_claims: Mutex<Vec<DrainClaim>>,
    }

    #[async_trait]
    impl CallDispatcher for SlowDispatcher {
        async fn dispatch(&self, _item: &QueueItem) -> Result<(), DispatchError> {
            self.clock.advance(Duration::minutes(4));
            let now = self.clock.now();
            let claim = self
                .store
                .try_claim_drain(self.window, "rival", now + Duration::minutes(5), now)
                .await
                .map_err(|e| DispatchError::ServiceError(e.to_string()))?;
            self.rival_claims.lock().unwrap().push(claim);
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_rollover_replays_queued_call() {
        let h = harness(200, 10_000, 3, RecordingDispatcher::default());
        let ten = h.clock.current_window();

        for _ in 0..200 {
            assert_eq!(h.attempt("u1", "dm_send").await, Decision::Admit);
        }
        assert_eq!(h.attempt("u1", "dm_send").await, Decision::Queue);

        let eleven = h.next_hour();
        let report = h.drainer.drain(eleven).await.unwrap();

        assert_eq!(report.outcome, DrainOutcome::Drained);
        assert_eq!(report.replayed, 1);
        assert_eq!(h.dispatcher.ids().len(), 1);
        assert_eq!(h.store.length_all(ten).await.unwrap(), 0);
        assert_eq!(h.store.count_by_status(ten).await.unwrap().completed, 1);

        let key = CounterKey::new(eleven, Scope::user("u1"));
        assert_eq!(h.store.get(&key).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_drain_is_idempotent() {
        let h = harness(1, 10_000, 3, RecordingDispatcher::default());
        h.attempt("u1", "dm_send").await;
        h.attempt("u1", "dm_send").await;

        let eleven = h.next_hour();
        let first = h.drainer.drain(eleven).await.unwrap();
        let second = h.drainer.drain(eleven).await.unwrap();

        assert_eq!(first.replayed, 1);
        assert_eq!(second.outcome, DrainOutcome::AlreadyDrained);
        assert_eq!(second.replayed, 0);
        assert_eq!(h.dispatcher.ids().len(), 1);
    }

    #[tokio::test]
    async fn test_fifo_order_within_action_type() {
        let h = harness(1, 10_000, 3, RecordingDispatcher::default());
        h.attempt("a", "dm_send").await;
        h.attempt("b", "dm_send").await;
        // Queued in order: a, b
        h.attempt("a", "dm_send").await;
        h.attempt("b", "dm_send").await;

        let ten = h.clock.current_window();
        let first = h.store.pop(ten, "dm_send", h.clock.now()).await.unwrap().unwrap();
        let second = h.store.pop(ten, "dm_send", h.clock.now()).await.unwrap().unwrap();
        h.store
            .requeue_front(vec![first.clone(), second.clone()])
            .await
            .unwrap();

        h.drainer.drain(h.next_hour()).await.unwrap();
        assert_eq!(h.dispatcher.ids(), vec![first.id, second.id]);
    }

    #[tokio::test]
    async fn test_replay_exhaustion_marks_failed() {
        let h = harness(1, 10_000, 2, RecordingDispatcher::default());
        let ten = h.clock.current_window();
        h.attempt("u1", "dm_send").await;
        assert_eq!(h.attempt("u1", "dm_send").await, Decision::Queue);

        // Fill each following window before the drain runs
        let eleven = h.next_hour();
        h.attempt("u1", "dm_send").await;
        let report = h.drainer.drain(eleven).await.unwrap();
        assert_eq!(report.retained, 1);
        assert_eq!(h.store.length(ten, "dm_send").await.unwrap(), 1);

        let twelve = h.next_hour();
        h.attempt("u1", "dm_send").await;
        let report = h.drainer.drain(twelve).await.unwrap();
        assert_eq!(report.exhausted, 1);
        assert_eq!(h.store.length_all(ten).await.unwrap(), 0);
        assert_eq!(h.store.count_by_status(ten).await.unwrap().failed, 1);
        assert!(h.dispatcher.ids().is_empty());
    }

    #[tokio::test]
    async fn test_global_limit_stops_drain() {
        let h = harness(1, 1, 3, RecordingDispatcher::default());
        let ten = h.clock.current_window();
        h.attempt("a", "dm_send").await;
        assert_eq!(h.attempt("b", "dm_send").await, Decision::Queue);
        assert_eq!(h.attempt("c", "dm_send").await, Decision::Queue);
        assert_eq!(h.attempt("d", "story_reply").await, Decision::Queue);

        let report = h.drainer.drain(h.next_hour()).await.unwrap();
        assert_eq!(report.replayed, 1);
        assert!(report.stopped_at_global_limit);
        assert_eq!(report.retained, 1);
        // The retained item keeps its place at the head
        let head = h.store.pop(ten, "dm_send", h.clock.now()).await.unwrap().unwrap();
        assert_eq!(head.scope_id, "c");
        assert_eq!(head.attempts, 1);
        assert_eq!(h.store.length(ten, "story_reply").await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_dispatch_failure_is_recorded() {
        let h = harness(
            1,
            10_000,
            3,
            RecordingDispatcher {
                fail_action: Some("dm_send".to_string()),
                ..Default::default()
            },
        );
        let ten = h.clock.current_window();
        h.attempt("u1", "dm_send").await;
        h.attempt("u1", "dm_send").await;

        let report = h.drainer.drain(h.next_hour()).await.unwrap();
        assert_eq!(report.dispatch_failed, 1);
        assert_eq!(h.store.count_by_status(ten).await.unwrap().failed, 1);
    }

    #[tokio::test]
    async fn test_in_flight_items_recovered() {
        let h = harness(1, 10_000, 3, RecordingDispatcher::default());
        let ten = h.clock.current_window();
        h.attempt("u1", "dm_send").await;
        h.attempt("u1", "dm_send").await;

        // A previous run popped the item and died before settling it
        let orphan = h.store.pop(ten, "dm_send", h.clock.now()).await.unwrap().unwrap();

        let report = h.drainer.drain(h.next_hour()).await.unwrap();
        assert_eq!(report.recovered, 1);
        assert_eq!(h.dispatcher.ids(), vec![orphan.id]);
    }

    #[tokio::test]
    async fn test_held_lease_skips_drain() {
        let h = harness(1, 10_000, 3, RecordingDispatcher::default());
        h.attempt("u1", "dm_send").await;
        h.attempt("u1", "dm_send").await;

        let eleven = h.next_hour();
        let now = h.clock.now();
        h.store
            .try_claim_drain(eleven, "other-instance", now + Duration::minutes(5), now)
            .await
            .unwrap();

        let report = h.drainer.drain(eleven).await.unwrap();
        assert_eq!(report.outcome, DrainOutcome::Held);
        assert!(h.dispatcher.ids().is_empty());
    }

    #[tokio::test]
    async fn test_current_window_items_wait() {
        let h = harness(1, 10_000, 3, RecordingDispatcher::default());
        let ten = h.clock.current_window();
        h.attempt("u1", "dm_send").await;
        h.attempt("u1", "dm_send").await;

        let report = h.drainer.drain(ten).await.unwrap();
        assert_eq!(report.replayed, 0);
        assert_eq!(h.store.length(ten, "dm_send").await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_stalled_drainer_yields_to_takeover() {
        let h = harness(1, 10_000, 3, RecordingDispatcher::default());
        let ten = h.clock.current_window();
        h.attempt("u1", "dm_send").await;
        assert_eq!(h.attempt("u1", "dm_send").await, Decision::Queue);
        let eleven = h.next_hour();

        let rival = Drainer::new(
            h.store.clone(),
            h.admission.clone(),
            Arc::new(RecordingDispatcher::default()),
            h.clock.clone(),
            Duration::minutes(5),
            3,
        );
        let stalling = Arc::new(StallingDispatcher {
            clock: h.clock.clone(),
            rival,
            window: eleven,
            rival_report: Mutex::new(None),
        });
        let drainer = Drainer::new(
            h.store.clone(),
            h.admission.clone(),
            stalling.clone(),
            h.clock.clone(),
            Duration::minutes(5),
            3,
        );

        let report = drainer.drain(eleven).await.unwrap();
        assert_eq!(report.outcome, DrainOutcome::LeaseLost);
        assert_eq!(report.replayed, 1);

        let rival_report = stalling.rival_report.lock().unwrap().clone().unwrap();
        assert_eq!(rival_report.recovered, 1);
        assert_eq!(rival_report.replayed, 0);

        // Delivered once, settled once, nothing left behind
        let counts = h.store.count_by_status(ten).await.unwrap();
        assert_eq!(h.store.length_all(ten).await.unwrap(), 0);
        assert_eq!(counts.pending, 0);
        assert_eq!(counts.completed, 1);
    }

    #[tokio::test]
    async fn test_lease_renewed_while_draining() {
        let h = harness(1, 10_000, 3, RecordingDispatcher::default());
        for scope in ["a", "b", "c"] {
            h.attempt(scope, "dm_send").await;
            assert_eq!(h.attempt(scope, "dm_send").await, Decision::Queue);
        }
        let eleven = h.next_hour();

        let slow = Arc::new(SlowDispatcher {
            clock: h.clock.clone(),
            store: h.store.clone(),
            window: eleven,
            rival_claims: Mutex::new(Vec::new()),
        });
        let drainer = Drainer::new(
            h.store.clone(),
            h.admission.clone(),
            slow.clone(),
            h.clock.clone(),
            Duration::minutes(5),
            3,
        );

        let report = drainer.drain(eleven).await.unwrap();
        assert_eq!(report.outcome, DrainOutcome::Drained);
        assert_eq!(report.replayed, 3);
        assert_eq!(
            *slow.rival_claims.lock().unwrap(),
            vec![DrainClaim::Held, DrainClaim::Held, DrainClaim::Held]
        );
    }

    #[tokio::test]
    async fn test_replay_delivers_caller_payload() {
        let h = harness(1, 10_000, 3, RecordingDispatcher::default());
        let payload = json!({"recipient": "r-42", "text": "see you at noon"});
        h.attempt("u1", "dm_send").await;
        let queued = h
            .admission
            .attempt(AttemptRequest::new("u1", "free", "dm_send").with_payload(payload.clone()))
            .await;
        assert_eq!(queued.decision, Decision::Queue);

        h.drainer.drain(h.next_hour()).await.unwrap();
        let dispatched = h.dispatcher.dispatched.lock().unwrap();
        assert_eq!(dispatched.len(), 1);
        assert_eq!(dispatched[0].payload, payload);
    }
}

use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU8, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration as StdDuration;

use axum::http::StatusCode;
use chrono::Duration;
use serde::Serialize;
use thiserror::Error;
use tokio_cron_scheduler::{Job, JobScheduler};
use utoipa::ToSchema;

use super::drain::{DrainOutcome, DrainReport, Drainer};
use crate::config::ResetConfig;
use crate::error::HttpError;
use crate::store::{SharedStore, StoreError};
use crate::window::{Clock, CurrentWindowCache, Window};

#[derive(Error, Debug)]
pub enum SchedulerError {
    #[error("A drain is already running")]
    Busy,

    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    #[error("Scheduler error: {0}")]
    Scheduler(String),
}

impl HttpError for SchedulerError {
    fn status_code(&self) -> StatusCode {
        match self {
            SchedulerError::Busy => StatusCode::CONFLICT,
            SchedulerError::Store(_) => StatusCode::SERVICE_UNAVAILABLE,
            SchedulerError::Scheduler(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    fn error_code(&self) -> Option<&'static str> {
        Some(match self {
            SchedulerError::Busy => "DRAIN_IN_PROGRESS",
            SchedulerError::Store(_) => "STORE_UNAVAILABLE",
            SchedulerError::Scheduler(_) => "SCHEDULER_ERROR",
        })
    }
}

crate::impl_into_response!(SchedulerError);

/// Phase of the reset task
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, ToSchema)]
#[serde(rename_all = "snake_case")]
#[repr(u8)]
pub enum ResetState {
    Idle = 0,
    DetectingBoundary = 1,
    Draining = 2,
}

impl ResetState {
    fn from_u8(value: u8) -> Self {
        match value {
            1 => ResetState::DetectingBoundary,
            2 => ResetState::Draining,
            _ => ResetState::Idle,
        }
    }
}

/// Snapshot served by the status endpoint
#[derive(Debug, Clone, Serialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct ResetStatus {
    pub running: bool,
    pub state: ResetState,
    pub current_window: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_drained_window: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_report: Option<DrainReport>,
    pub store_degraded: bool,
}

const NOT_DRAINED: i64 = i64::MIN;

/// Watches for hour boundaries and drains the queues into the new window.
pub struct WindowResetTask {
    drainer: Drainer,
    store: SharedStore,
    clock: Arc<dyn Clock>,
    window_cache: CurrentWindowCache,
    tolerance: Duration,
    grace: Duration,
    state: AtomicU8,
    busy: AtomicBool,
    retry: AtomicBool,
    last_drained: AtomicI64,
    last_report: Mutex<Option<DrainReport>>,
}

/// Clears the busy flag when a drain ends, however it ends.
struct BusyGuard<'a>(&'a AtomicBool);

impl Drop for BusyGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

impl WindowResetTask {
    pub fn new(
        drainer: Drainer,
        store: SharedStore,
        clock: Arc<dyn Clock>,
        tolerance: Duration,
        grace: Duration,
    ) -> Self {
        let current = clock.current_window();
        Self {
            drainer,
            store,
            clock,
            window_cache: CurrentWindowCache::new(current),
            tolerance,
            grace,
            state: AtomicU8::new(ResetState::Idle as u8),
            busy: AtomicBool::new(false),
            retry: AtomicBool::new(false),
            last_drained: AtomicI64::new(NOT_DRAINED),
            last_report: Mutex::new(None),
        }
    }

    /// One poll: drain when the hour has just turned over.
    ///
    /// A boundary is the cached window changing, or being within the
    /// tolerance of the hour start while this window is still undrained.
    /// Windows whose drain failed or was held elsewhere are retried on every
    /// poll until they complete.
    pub async fn tick(&self) -> Option<DrainReport> {
        if self.busy.load(Ordering::Acquire) {
            return None;
        }
        self.set_state(ResetState::DetectingBoundary);

        let now = self.clock.now();
        let current = Window::containing(now);
        let rolled = self.window_cache.observe(current);
        if let Some(previous) = rolled {
            tracing::info!(from = %previous, to = %current, "Window boundary crossed");
        }

        let undrained = self.last_drained.load(Ordering::Acquire) != current.hour_index();
        let near_start = current.elapsed(now) <= self.tolerance;
        let boundary =
            rolled.is_some() || (undrained && (near_start || self.retry.load(Ordering::Acquire)));

        if !boundary {
            self.set_state(ResetState::Idle);
            return None;
        }

        match self.drain(current).await {
            Ok(report) => Some(report),
            Err(SchedulerError::Busy) => None,
            Err(e) => {
                tracing::warn!(window = %current, error = %e, "Window drain failed, will retry");
                None
            }
        }
    }

    /// Drain the current window now, regardless of boundary detection.
    pub async fn drain_now(&self) -> Result<DrainReport, SchedulerError> {
        self.drain(self.clock.current_window()).await
    }

    async fn drain(&self, window: Window) -> Result<DrainReport, SchedulerError> {
        if self
            .busy
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return Err(SchedulerError::Busy);
        }
        let _guard = BusyGuard(&self.busy);
        self.set_state(ResetState::Draining);

        let result = self.drainer.drain(window).await;
        let result = match result {
            Ok(report) => {
                match report.outcome {
                    DrainOutcome::Drained | DrainOutcome::AlreadyDrained => {
                        self.last_drained
                            .store(window.hour_index(), Ordering::Release);
                        self.retry.store(false, Ordering::Release);
                        self.purge().await;
                    }
                    DrainOutcome::Held | DrainOutcome::LeaseLost => {
                        self.retry.store(true, Ordering::Release)
                    }
                }
                self.remember(&report);
                Ok(report)
            }
            Err(e) => {
                self.retry.store(true, Ordering::Release);
                Err(SchedulerError::Store(e))
            }
        };

        self.set_state(ResetState::Idle);
        result
    }

    async fn purge(&self) {
        let now = self.clock.now();
        match self.store.purge_expired(now, now - self.grace).await {
            Ok(0) => {}
            Ok(removed) => tracing::debug!(removed, "Purged expired counters"),
            Err(e) => tracing::warn!(error = %e, "Failed to purge expired counters"),
        }
    }

    fn remember(&self, report: &DrainReport) {
        let mut last = match self.last_report.lock() {
            Ok(last) => last,
            Err(poisoned) => poisoned.into_inner(),
        };
        *last = Some(report.clone());
    }

    fn set_state(&self, state: ResetState) {
        self.state.store(state as u8, Ordering::Release);
    }

    pub fn state(&self) -> ResetState {
        ResetState::from_u8(self.state.load(Ordering::Acquire))
    }

    pub fn status(&self, running: bool) -> ResetStatus {
        let last_drained = self.last_drained.load(Ordering::Acquire);
        let last_report = match self.last_report.lock() {
            Ok(last) => last.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        };
        ResetStatus {
            running,
            state: self.state(),
            current_window: self.clock.current_window().key(),
            last_drained_window: (last_drained != NOT_DRAINED)
                .then(|| Window::from_hour(last_drained).key()),
            last_report,
            store_degraded: self.store.is_degraded(),
        }
    }
}

/// Owns the cron scheduler that polls the reset task.
pub struct SchedulerService {
    scheduler: JobScheduler,
    task: Arc<WindowResetTask>,
    poll_interval: StdDuration,
    enabled: bool,
    running: AtomicBool,
}

impl SchedulerService {
    pub async fn new(
        task: Arc<WindowResetTask>,
        config: &ResetConfig,
    ) -> Result<Self, SchedulerError> {
        let scheduler = JobScheduler::new()
            .await
            .map_err(|e| SchedulerError::Scheduler(e.to_string()))?;

        Ok(Self {
            scheduler,
            task,
            poll_interval: StdDuration::from_secs(config.poll_interval_secs),
            enabled: config.enabled,
            running: AtomicBool::new(false),
        })
    }

    /// Catch up on a drain missed while the service was down, then start polling.
    pub async fn start(&self) -> Result<(), SchedulerError> {
        if !self.enabled {
            tracing::info!("Window reset task disabled");
            return Ok(());
        }

        match self.task.drain_now().await {
            Ok(report) => tracing::info!(
                window = %report.window,
                outcome = ?report.outcome,
                "Startup drain finished"
            ),
            Err(e) => tracing::warn!(error = %e, "Startup drain failed, will retry on next poll"),
        }

        let task = Arc::clone(&self.task);
        let job = Job::new_repeated_async(self.poll_interval, move |_uuid, _lock| {
            let task = Arc::clone(&task);
            Box::pin(async move {
                task.tick().await;
            })
        })
        .map_err(|e| SchedulerError::Scheduler(e.to_string()))?;

        self.scheduler
            .add(job)
            .await
            .map_err(|e| SchedulerError::Scheduler(e.to_string()))?;

        tracing::info!(
            poll_interval_secs = self.poll_interval.as_secs(),
            "Starting window reset scheduler"
        );
        self.scheduler
            .start()
            .await
            .map_err(|e| SchedulerError::Scheduler(e.to_string()))?;
        self.running.store(true, Ordering::Release);
        Ok(())
    }

    pub async fn shutdown(&self) -> Result<(), SchedulerError> {
        if !self.running.swap(false, Ordering::AcqRel) {
            return Ok(());
        }
        let mut scheduler = self.scheduler.clone();
        scheduler
            .shutdown()
            .await
            .map_err(|e| SchedulerError::Scheduler(e.to_string()))?;
        tracing::info!("Window reset scheduler stopped");
        Ok(())
    }

    pub fn task(&self) -> &Arc<WindowResetTask> {
        &self.task
    }

    pub fn status(&self) -> ResetStatus {
        self.task.status(self.running.load(Ordering::Acquire))
    }
}

//! Scheduler loop: top-level control loop and orchestrator
//! lifecycle. Wakes periodically, enumerates eligible workers in the active
//! group, dispatches follow actions concurrently, and advances state.
//!
//! A redundant `start()` stops first; `reconfigure()` is a
//! stop-then-conditional-start. Cancellation is cooperative, via a
//! `tokio_util::sync::CancellationToken` held by the scheduler and cloned
//! into the loop task.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration as StdDuration;

use chrono::{Duration as ChronoDuration, Timelike, Utc};
use tokio::sync::Mutex as AsyncMutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, instrument, warn};

use crate::client::WorkerClient;
use crate::eligibility;
use crate::errors::{FollowOutcome, SchedulerError};
use crate::follow_action::{follow_user, resolve_user_id};
use crate::group_rotator::{self, RotatorState};
use crate::metrics::SchedulerMetrics;
use crate::models::Worker;
use crate::selector;
use crate::signing::CookieAuthHeaders;
use crate::store::ProgressStore;

/// Public web bearer token used for the cookie-and-CSRF endpoint family
/// — shared across workers, unlike the per-worker OAuth1 quintuple.
const PUBLIC_BEARER: &str = "AAAAAAAAAAAAAAAAAAAAANRILgAAAAAAnNwIzUejRCOuH5E6I8xnZz4puTs%3D1Zv7ttfk8LF81IUq16cHjhLTvJu4FA33AGWWjCpTnA";

const TICK_INTERVAL: StdDuration = StdDuration::from_secs(60);
const RATE_LIMIT_COOLDOWN: StdDuration = StdDuration::from_secs(900);

#[derive(Debug, Default, Clone, Copy)]
struct LoopState {
    running: bool,
    rotator: RotatorState,
    last_daily_reset_hour: Option<u32>,
}

/// The orchestrator. Owns the progress store, a per-worker HTTP client
/// cache, and the mutex-protected lifecycle state.
pub struct Scheduler {
    store: ProgressStore,
    metrics: Arc<SchedulerMetrics>,
    state: Arc<AsyncMutex<LoopState>>,
    clients: Arc<AsyncMutex<HashMap<i64, Arc<WorkerClient>>>>,
    cancel: Arc<AsyncMutex<Option<CancellationToken>>>,
    task: Arc<AsyncMutex<Option<JoinHandle<()>>>>,
}

impl Scheduler {
    pub fn new(store: ProgressStore, metrics: Arc<SchedulerMetrics>) -> Self {
        Self {
            store,
            metrics,
            state: Arc::new(AsyncMutex::new(LoopState::default())),
            clients: Arc::new(AsyncMutex::new(HashMap::new())),
            cancel: Arc::new(AsyncMutex::new(None)),
            task: Arc::new(AsyncMutex::new(None)),
        }
    }

    pub async fn is_running(&self) -> bool {
        self.state.lock().await.running
    }

    /// `start()`: stop first if already running, refuse if settings
    /// are inactive, activate all credentialed workers into the current
    /// group, and spawn the loop task.
    #[instrument(skip(self))]
    pub async fn start(&self) -> Result<(), SchedulerError> {
        if self.is_running().await {
            info!("scheduler already running, stopping before restart");
            self.stop().await?;
        }

        let settings = self
            .store
            .get_settings()
            .await
            .map_err(|e| SchedulerError::SettingsFetch(e.to_string()))?;

        if !settings.is_active {
            warn!("refusing to start: settings.is_active == false");
            return Err(SchedulerError::NotActive);
        }
        if settings.schedule_groups <= 0 {
            return Err(SchedulerError::InvalidConfiguration(
                "schedule_groups must be >= 1".to_string(),
            ));
        }
        if settings.interval_minutes <= 0 {
            return Err(SchedulerError::InvalidConfiguration(
                "interval_minutes must be >= 1".to_string(),
            ));
        }

        let now = Utc::now();
        let group = group_rotator::active_group(now.hour(), settings.schedule_groups);

        let activated = self
            .store
            .activate_all_workers(group)
            .await
            .map_err(SchedulerError::Database)?;
        info!(activated, group, "activated workers for scheduler start");

        let mut state = self.state.lock().await;
        state.running = true;
        state.rotator = RotatorState { current_group: Some(group), next_group_start: None };
        state.last_daily_reset_hour = None;
        drop(state);

        let cancel = CancellationToken::new();
        *self.cancel.lock().await = Some(cancel.clone());

        let loop_self = self.clone_handles();
        let handle = tokio::spawn(async move { loop_self.run(cancel).await });
        *self.task.lock().await = Some(handle);

        Ok(())
    }

    /// `stop()`: cancel the loop task, wait for it to exit, deactivate
    /// all active workers in one transaction.
    #[instrument(skip(self))]
    pub async fn stop(&self) -> Result<(), SchedulerError> {
        {
            let mut state = self.state.lock().await;
            state.running = false;
        }

        if let Some(cancel) = self.cancel.lock().await.take() {
            cancel.cancel();
        }
        if let Some(handle) = self.task.lock().await.take() {
            let _ = handle.await;
        }

        let deactivated = self
            .store
            .deactivate_all_workers()
            .await
            .map_err(SchedulerError::Database)?;
        info!(deactivated, "deactivated workers for scheduler stop");

        Ok(())
    }

    /// `reconfigure()`: snapshot running state, stop, re-read
    /// settings, and restart if it was running or settings are active.
    #[instrument(skip(self))]
    pub async fn reconfigure(&self) -> Result<(), SchedulerError> {
        let was_running = self.is_running().await;
        self.stop().await?;

        let settings = self
            .store
            .get_settings()
            .await
            .map_err(|e| SchedulerError::SettingsFetch(e.to_string()))?;

        if was_running || settings.is_active {
            self.start().await?;
        } else {
            info!("scheduler remains stopped after reconfigure");
        }

        Ok(())
    }

    fn clone_handles(&self) -> Self {
        Self {
            store: self.store.clone(),
            metrics: self.metrics.clone(),
            state: self.state.clone(),
            clients: self.clients.clone(),
            cancel: self.cancel.clone(),
            task: self.task.clone(),
        }
    }

    /// The loop body, repeated while `running`.
    async fn run(&self, cancel: CancellationToken) {
        loop {
            if cancel.is_cancelled() || !self.is_running().await {
                break;
            }

            if let Err(e) = self.tick(&cancel).await {
                warn!(error = %e, "scheduler tick failed, sleeping 60s");
            }

            if !sleep_cancellable(TICK_INTERVAL, &cancel).await {
                break;
            }
        }
        info!("scheduler loop task exiting");
    }

    async fn tick(&self, cancel: &CancellationToken) -> Result<(), SchedulerError> {
        let settings = self
            .store
            .get_settings()
            .await
            .map_err(|e| SchedulerError::SettingsFetch(e.to_string()))?;

        if !settings.is_active {
            return Ok(());
        }

        let now = Utc::now();
        let mut state = self.state.lock().await;
        let transitioned = group_rotator::tick(&mut state.rotator, &self.store, now, settings.schedule_groups)
            .await
            .map_err(SchedulerError::Database)?;
        let current_group = state.rotator.current_group.unwrap_or(0);
        if transitioned {
            self.metrics.record_group(current_group);
        }

        // Daily reset at the first tick of UTC hour 0.
        if now.hour() == 0 && state.last_daily_reset_hour != Some(0) {
            state.last_daily_reset_hour = Some(0);
            drop(state);
            let reset = self.store.daily_reset().await.map_err(SchedulerError::Database)?;
            self.metrics.record_daily_reset(reset);
            info!(reset_count = reset, "daily_reset observed at UTC hour 0");
        } else {
            if now.hour() != 0 {
                state.last_daily_reset_hour = None;
            }
            drop(state);
        }

        let workers = self
            .store
            .workers_in_group(current_group)
            .await
            .map_err(SchedulerError::Database)?;

        if workers.is_empty() {
            return Ok(());
        }

        info!(count = workers.len(), group = current_group, "dispatching follow actions");

        let mut handles = Vec::with_capacity(workers.len());
        for worker in workers {
            let this = self.clone_handles();
            let settings = settings.clone();
            let cancel = cancel.clone();
            handles.push(tokio::spawn(async move {
                this.process_worker(worker, &settings, cancel).await
            }));
        }
        for handle in handles {
            let _ = handle.await;
        }

        Ok(())
    }

    /// Per-worker routine: eligibility, selection, serialized
    /// follow attempts, then a 24h advisory plan.
    #[instrument(skip(self, settings, cancel), fields(worker_id = worker.id))]
    async fn process_worker(
        &self,
        worker: Worker,
        settings: &crate::models::Settings,
        cancel: CancellationToken,
    ) {
        let now = Utc::now();
        if let Err(failure) = eligibility::check(&self.store, &worker, settings, now).await {
            self.metrics.record_eligibility_skip(failure.reason());
            return;
        }

        let group = worker.group().unwrap_or(0);
        let batch = match selector::select_targets_for_worker(
            &self.store,
            worker.id,
            &worker.handle,
            worker.daily_follows,
            settings,
            group,
        )
        .await
        {
            Ok(batch) => batch,
            Err(e) => {
                warn!(error = %e, "target selection failed");
                return;
            }
        };

        if batch.is_empty() {
            return;
        }

        let client = match self.client_for(&worker).await {
            Some(c) => c,
            None => {
                warn!("worker missing proxy configuration, skipping");
                return;
            }
        };

        let Some(oauth) = worker.oauth_credentials() else {
            warn!("worker missing oauth credentials, skipping");
            return;
        };
        let cookie_auth = CookieAuthHeaders {
            public_bearer: PUBLIC_BEARER.to_string(),
            csrf_token: worker.csrf_cookie.clone().unwrap_or_default(),
            auth_cookie: worker.auth_cookie.clone().unwrap_or_default(),
            csrf_cookie: worker.csrf_cookie.clone().unwrap_or_default(),
        };

        let per_follow_sleep = StdDuration::from_secs_f64(
            (settings.interval_minutes as f64 * 60.0) / (settings.max_follows_per_interval.max(1) as f64),
        );

        let mut follows_completed = 0i32;
        for (target, _pool) in &batch {
            let progress_id = match self.store.find_pending_id(worker.id, target.id).await {
                Ok(Some(id)) => id,
                _ => continue, // selector's pending row vanished or lost a race
            };
            if self.store.mark_in_progress(progress_id).await.is_err() {
                continue;
            }

            let started = std::time::Instant::now();
            let outcome = if cancel.is_cancelled() {
                FollowOutcome::Cancelled
            } else {
                match resolve_user_id(client.as_ref(), &target.handle, &cookie_auth, &cancel).await {
                    Ok(target_user_id) => {
                        follow_user(client.as_ref(), &target_user_id, &oauth, RATE_LIMIT_COOLDOWN, &cancel).await
                    }
                    Err(outcome) => outcome,
                }
            };
            let duration = started.elapsed();

            self.metrics.record_follow_outcome(outcome.label(), duration);

            if let Err(e) = self.store.record_outcome(worker.id, progress_id, &outcome).await {
                warn!(error = %e, "failed to record follow outcome; upstream idempotence covers a retry");
            }

            if outcome.is_ok() {
                follows_completed += 1;
            } else {
                break; // stop the batch early on the first non-ok outcome
            }

            if !sleep_cancellable(per_follow_sleep, &cancel).await {
                break;
            }
        }

        self.plan_ahead(&worker, settings, now, follows_completed, group).await;
    }

    /// Writes the 24h advisory plan from fresh, never-attempted candidates
    /// (not the targets this tick's batch just drove to a terminal state) —
    /// sized off what remains of the worker's daily quota and spaced at
    /// `settings.interval_minutes` out to a 24h horizon.
    async fn plan_ahead(
        &self,
        worker: &Worker,
        settings: &crate::models::Settings,
        now: chrono::DateTime<Utc>,
        follows_completed: i32,
        group: i32,
    ) {
        let remaining_today = settings.max_follows_per_day - worker.daily_follows - follows_completed;
        if remaining_today <= 0 {
            return;
        }

        let plan = selector::compute_horizon_plan(settings, remaining_today);
        if plan.total() == 0 {
            return;
        }

        let candidates = match selector::fetch_horizon_candidates(
            &self.store,
            worker.id,
            &worker.handle,
            settings,
            plan,
        )
        .await
        {
            Ok(candidates) => candidates,
            Err(e) => {
                warn!(error = %e, "failed to fetch candidates for 24h advisory plan");
                return;
            }
        };

        if candidates.is_empty() {
            return;
        }

        let stride = ChronoDuration::minutes(settings.interval_minutes.max(1) as i64);
        let start = now + stride;
        let horizon = now + ChronoDuration::hours(24);
        if let Err(e) = self
            .store
            .schedule_future(worker.id, &candidates, start, stride, horizon, group)
            .await
        {
            warn!(error = %e, "failed to write 24h advisory plan");
        }
    }

    async fn client_for(&self, worker: &Worker) -> Option<Arc<WorkerClient>> {
        let mut clients = self.clients.lock().await;
        if let Some(client) = clients.get(&worker.id) {
            return Some(client.clone());
        }
        let proxy = worker.proxy_config()?;
        let client = Arc::new(WorkerClient::build(&proxy).ok()?);
        clients.insert(worker.id, client.clone());
        Some(client)
    }
}

/// Sleeps for `duration`, returning `false` if cancelled first.
async fn sleep_cancellable(duration: StdDuration, cancel: &CancellationToken) -> bool {
    tokio::select! {
        _ = tokio::time::sleep(duration) => true,
        _ = cancel.cancelled() => false,
    }
}

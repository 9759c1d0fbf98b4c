use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use chrono::{Local, NaiveTime, TimeZone};
use tokio::sync::{watch, Mutex};

use crate::error::Result;
use crate::history::{HistoryRecord, HistoryStore, TriggerSource, TriggerType};
use crate::interfaces::accounts::{AccountDirectory, AccountInfo, ModelCatalog, ModelSpec};
use crate::interfaces::refresh::QuotaRefresh;
use crate::reset::{GateDecision, ResetGate, ResetStore};
use crate::runner::{BatchSummary, TaskRunner};
use crate::schedule;
use crate::tasks::{ScheduleConfig, TaskDraft, TaskStore, TimeWindow, TriggerConfig, WakeupTask};

pub struct SchedulerDeps {
    pub tasks: Arc<TaskStore>,
    pub resets: Arc<ResetStore>,
    pub history: Arc<HistoryStore>,
    pub runner: Arc<TaskRunner>,
    pub directory: Arc<dyn AccountDirectory>,
    pub catalog: Arc<dyn ModelCatalog>,
    pub refresh: Arc<dyn QuotaRefresh>,
    pub gate: ResetGate,
    pub poll_interval: Duration,
}

// Cancellation is cancel-by-id: dropping or signalling the watch sender stops
// the timer loop at its next await point without aborting an in-flight batch.
struct TimerHandle {
    cancel: watch::Sender<bool>,
}

impl TimerHandle {
    fn cancel(&self) {
        let _ = self.cancel.send(true);
    }
}

struct Inner {
    tasks: Arc<TaskStore>,
    resets: Arc<ResetStore>,
    history: Arc<HistoryStore>,
    runner: Arc<TaskRunner>,
    directory: Arc<dyn AccountDirectory>,
    catalog: Arc<dyn ModelCatalog>,
    refresh: Arc<dyn QuotaRefresh>,
    gate: ResetGate,
    poll_interval: Duration,
    timers: Mutex<HashMap<i32, TimerHandle>>,
    poller: Mutex<Option<TimerHandle>>,
}

#[derive(Clone)]
pub struct WakeupScheduler {
    inner: Arc<Inner>,
}

impl WakeupScheduler {
    pub fn new(deps: SchedulerDeps) -> Self {
        Self {
            inner: Arc::new(Inner {
                tasks: deps.tasks,
                resets: deps.resets,
                history: deps.history,
                runner: deps.runner,
                directory: deps.directory,
                catalog: deps.catalog,
                refresh: deps.refresh,
                gate: deps.gate,
                poll_interval: deps.poll_interval,
                timers: Mutex::new(HashMap::new()),
                poller: Mutex::new(None),
            }),
        }
    }

    pub async fn start(&self) -> Result<()> {
        if !self.inner.tasks.global_enabled().await? {
            tracing::info!("wakeup scheduling globally disabled; no timers armed");
            return Ok(());
        }
        let tasks = self.inner.tasks.list_tasks().await?;
        for task in tasks.iter().filter(|task| task.enabled) {
            self.arm(task).await;
        }
        self.ensure_poller().await?;
        Ok(())
    }

    pub async fn stop(&self) {
        let mut timers = self.inner.timers.lock().await;
        for (task_id, handle) in timers.drain() {
            tracing::debug!(task_id, "cancelling wakeup timer");
            handle.cancel();
        }
        drop(timers);
        let mut poller = self.inner.poller.lock().await;
        if let Some(handle) = poller.take() {
            handle.cancel();
        }
    }

    pub async fn global_enabled(&self) -> Result<bool> {
        self.inner.tasks.global_enabled().await
    }

    pub async fn set_global_enabled(&self, enabled: bool) -> Result<()> {
        self.inner.tasks.set_global_enabled(enabled).await?;
        if enabled {
            self.start().await
        } else {
            self.stop().await;
            Ok(())
        }
    }

    pub async fn list_tasks(&self) -> Result<Vec<WakeupTask>> {
        self.inner.tasks.list_tasks().await
    }

    pub async fn create_task(&self, draft: TaskDraft) -> Result<WakeupTask> {
        let task = self.inner.tasks.create_task(draft).await?;
        self.rearm(task.id).await?;
        Ok(task)
    }

    pub async fn update_task(&self, id: i32, draft: TaskDraft) -> Result<WakeupTask> {
        let task = self.inner.tasks.update_task(id, draft).await?;
        self.rearm(task.id).await?;
        Ok(task)
    }

    pub async fn toggle_task(&self, id: i32, enabled: bool) -> Result<WakeupTask> {
        let task = self.inner.tasks.set_enabled(id, enabled).await?;
        self.rearm(task.id).await?;
        Ok(task)
    }

    pub async fn delete_task(&self, id: i32) -> Result<bool> {
        self.cancel_timer(id).await;
        let deleted = self.inner.tasks.delete_task(id).await?;
        if deleted {
            self.inner.resets.prune_task(id).await?;
        }
        self.ensure_poller().await?;
        Ok(deleted)
    }

    pub async fn run_task_now(&self, id: i32) -> Result<Option<BatchSummary>> {
        let task = self
            .inner
            .tasks
            .get_task(id)
            .await?
            .ok_or_else(|| crate::QuotaSentryError::Runtime(format!("no task with id {id}")))?;
        self.inner
            .runner
            .run_task(&task, TriggerType::Manual, TriggerSource::Manual)
            .await
    }

    pub async fn run_test(&self, name: &str, schedule: &ScheduleConfig) -> Result<BatchSummary> {
        self.inner.runner.run_adhoc(name, schedule).await
    }

    pub fn preview(&self, trigger: &TriggerConfig, count: usize) -> Vec<chrono::NaiveDateTime> {
        schedule::preview_runs(trigger, count, Local::now().naive_local())
    }

    pub async fn history(&self, limit: usize) -> Result<Vec<HistoryRecord>> {
        self.inner.history.list(limit).await
    }

    pub async fn clear_history(&self) -> Result<usize> {
        self.inner.history.clear().await
    }

    async fn rearm(&self, id: i32) -> Result<()> {
        self.cancel_timer(id).await;
        if self.inner.tasks.global_enabled().await? {
            if let Some(task) = self.inner.tasks.get_task(id).await? {
                if task.enabled {
                    self.arm(&task).await;
                }
            }
        }
        self.ensure_poller().await
    }

    async fn arm(&self, task: &WakeupTask) {
        if !has_timer_trigger(&task.schedule.trigger) {
            return;
        }
        let handle = spawn_timer_loop(self.inner.clone(), task.id);
        let mut timers = self.inner.timers.lock().await;
        if let Some(old) = timers.insert(task.id, handle) {
            old.cancel();
        }
    }

    async fn cancel_timer(&self, id: i32) {
        let mut timers = self.inner.timers.lock().await;
        if let Some(handle) = timers.remove(&id) {
            handle.cancel();
        }
    }

    async fn ensure_poller(&self) -> Result<()> {
        let global = self.inner.tasks.global_enabled().await?;
        let wants_poller = global
            && self
                .inner
                .tasks
                .list_tasks()
                .await?
                .iter()
                .any(|task| task.enabled && task.is_quota_reset());

        let mut poller = self.inner.poller.lock().await;
        if wants_poller && poller.is_none() {
            // keep quota observations fresh enough for timely detection
            self.inner
                .refresh
                .ensure_refresh_interval(self.inner.poll_interval)
                .await;
            *poller = Some(spawn_poller(self.inner.clone()));
        } else if !wants_poller {
            if let Some(handle) = poller.take() {
                handle.cancel();
            }
        }
        Ok(())
    }
}

fn has_timer_trigger(trigger: &TriggerConfig) -> bool {
    match trigger {
        TriggerConfig::Scheduled { .. } | TriggerConfig::Crontab { .. } => true,
        // quota-reset tasks only get a timer for their fallback times; live
        // detection belongs to the shared poller
        TriggerConfig::QuotaReset { fallback_times, .. } => !fallback_times.is_empty(),
    }
}

fn next_instant(trigger: &TriggerConfig, now: chrono::NaiveDateTime) -> Option<chrono::NaiveDateTime> {
    schedule::preview_runs(trigger, 1, now).into_iter().next()
}

fn trigger_source(trigger: &TriggerConfig) -> TriggerSource {
    match trigger {
        TriggerConfig::Scheduled { .. } => TriggerSource::Scheduled,
        TriggerConfig::Crontab { .. } => TriggerSource::Crontab,
        TriggerConfig::QuotaReset { .. } => TriggerSource::QuotaReset,
    }
}

// One loop per armed task: sleep until the next instant, fire, rearm. Every
// fire schedules its successor unless the task was cancelled mid-flight.
fn spawn_timer_loop(inner: Arc<Inner>, task_id: i32) -> TimerHandle {
    let (cancel_tx, mut cancel_rx) = watch::channel(false);
    tokio::spawn(async move {
        loop {
            let task = match inner.tasks.get_task(task_id).await {
                Ok(Some(task)) if task.enabled => task,
                Ok(_) => break,
                Err(err) => {
                    tracing::warn!(task_id, error = %err, "timer loop could not load task");
                    break;
                }
            };
            let now = Local::now().naive_local();
            let Some(next) = next_instant(&task.schedule.trigger, now) else {
                tracing::info!(task_id, "no upcoming runs for task; timer idles");
                break;
            };
            let delay = (next - now).to_std().unwrap_or(Duration::ZERO);
            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                changed = cancel_rx.changed() => {
                    match changed {
                        Ok(()) if !*cancel_rx.borrow() => continue,
                        _ => break,
                    }
                }
            }

            let source = trigger_source(&task.schedule.trigger);
            if source == TriggerSource::QuotaReset && reset_fired_today(&inner, task.id).await {
                tracing::debug!(task_id, "reset already detected today; skipping fallback run");
            } else if let Err(err) = inner
                .runner
                .run_task(&task, TriggerType::Auto, source)
                .await
            {
                tracing::warn!(task_id, error = %err, "wakeup batch failed");
            }

            // disabled mid-flight: results landed, but no successor is armed
            if *cancel_rx.borrow() {
                break;
            }
        }
    });
    TimerHandle { cancel: cancel_tx }
}

fn spawn_poller(inner: Arc<Inner>) -> TimerHandle {
    let (cancel_tx, mut cancel_rx) = watch::channel(false);
    let period = inner.poll_interval;
    tokio::spawn(async move {
        let mut tick = tokio::time::interval(period);
        loop {
            tokio::select! {
                _ = tick.tick() => {}
                changed = cancel_rx.changed() => {
                    match changed {
                        Ok(()) if !*cancel_rx.borrow() => continue,
                        _ => break,
                    }
                }
            }
            poll_quota_resets(&inner).await;
            if *cancel_rx.borrow() {
                break;
            }
        }
    });
    TimerHandle { cancel: cancel_tx }
}

// One tick: run the detector for every (task, account, model) combination.
// Failures stay scoped to their task; other tasks keep polling.
async fn poll_quota_resets(inner: &Arc<Inner>) {
    let tasks = match inner.tasks.list_tasks().await {
        Ok(tasks) => tasks,
        Err(err) => {
            tracing::warn!(error = %err, "reset poller could not list tasks");
            return;
        }
    };
    let reset_tasks: Vec<&WakeupTask> = tasks
        .iter()
        .filter(|task| task.enabled && task.is_quota_reset())
        .collect();
    if reset_tasks.is_empty() {
        return;
    }
    let accounts = match inner.directory.accounts().await {
        Ok(accounts) => accounts,
        Err(err) => {
            tracing::warn!(error = %err, "reset poller could not read account directory");
            return;
        }
    };
    let models = inner.catalog.models();
    let local_time = Local::now().time();
    let now = now_ts();

    for task in reset_tasks {
        let TriggerConfig::QuotaReset { window, .. } = &task.schedule.trigger else {
            continue;
        };
        if let Some(window) = window {
            if !window_contains(window, local_time) {
                continue;
            }
        }
        let fired = detect_for_task(inner, task, &accounts, &models, now).await;
        if fired {
            if let Err(err) = inner
                .runner
                .run_task(task, TriggerType::Auto, TriggerSource::QuotaReset)
                .await
            {
                tracing::warn!(task_id = task.id, error = %err, "quota-reset wakeup batch failed");
            }
        }
    }
}

async fn detect_for_task(
    inner: &Arc<Inner>,
    task: &WakeupTask,
    accounts: &[AccountInfo],
    models: &[ModelSpec],
    now: i64,
) -> bool {
    let selected_models: Vec<&ModelSpec> = models
        .iter()
        .filter(|model| task.schedule.models.contains(&model.id))
        .collect();
    let mut fired = false;
    for account in accounts
        .iter()
        .filter(|account| task.schedule.accounts.contains(&account.id))
    {
        let Some(quota) = &account.quota else {
            continue;
        };
        for model in &selected_models {
            let Some(observed) = quota
                .models
                .iter()
                .find(|entry| entry.name == model.id || entry.name == model.model_constant)
            else {
                continue;
            };
            let key = model.stable_key();
            // no reset token reported means nothing to deduplicate against;
            // park and keep the diagnostic reading
            let Some(token) = observed.reset_time.as_deref() else {
                if let Err(err) = inner
                    .resets
                    .record_observation(task.id, key, observed.percentage)
                    .await
                {
                    tracing::warn!(task_id = task.id, error = %err, "failed to persist reset observation");
                }
                continue;
            };
            let state = inner.resets.load(task.id, key).await;
            match inner.gate.evaluate(&state, observed.percentage, token, now) {
                GateDecision::Fire => {
                    match inner.resets.record_trigger(task.id, key, token, now).await {
                        Ok(()) => {
                            tracing::info!(
                                task_id = task.id,
                                model_key = key,
                                account_id = %account.id,
                                "quota reset detected"
                            );
                            fired = true;
                        }
                        Err(err) => {
                            tracing::warn!(task_id = task.id, error = %err, "failed to persist reset trigger");
                        }
                    }
                }
                GateDecision::Parked(reason) => {
                    tracing::debug!(
                        task_id = task.id,
                        model_key = key,
                        reason = ?reason,
                        percent = observed.percentage,
                        "reset gate parked"
                    );
                    if let Err(err) = inner
                        .resets
                        .record_observation(task.id, key, observed.percentage)
                        .await
                    {
                        tracing::warn!(task_id = task.id, error = %err, "failed to persist reset observation");
                    }
                }
            }
        }
    }
    fired
}

async fn reset_fired_today(inner: &Arc<Inner>, task_id: i32) -> bool {
    match inner.resets.latest_trigger_at(task_id).await {
        Ok(Some(ts)) => Local
            .timestamp_opt(ts, 0)
            .single()
            .map(|fired| fired.date_naive() == Local::now().date_naive())
            .unwrap_or(false),
        Ok(None) => false,
        Err(err) => {
            tracing::warn!(task_id, error = %err, "could not read reset trigger history");
            false
        }
    }
}

fn window_contains(window: &TimeWindow, time: NaiveTime) -> bool {
    let parse = |raw: &str| NaiveTime::parse_from_str(raw, "%H:%M").ok();
    match (parse(&window.start), parse(&window.end)) {
        (Some(start), Some(end)) => time >= start && time <= end,
        // an unparsable window never restricts detection
        _ => true,
    }
}

fn now_ts() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs() as i64
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tasks::RepeatRule;
    use chrono::NaiveDate;

    #[test]
    fn window_bounds_are_inclusive() {
        let window = TimeWindow {
            start: "09:00".to_string(),
            end: "17:30".to_string(),
        };
        let at = |h, m| NaiveTime::from_hms_opt(h, m, 0).unwrap();
        assert!(window_contains(&window, at(9, 0)));
        assert!(window_contains(&window, at(12, 15)));
        assert!(window_contains(&window, at(17, 30)));
        assert!(!window_contains(&window, at(8, 59)));
        assert!(!window_contains(&window, at(17, 31)));
    }

    #[test]
    fn quota_reset_without_fallbacks_gets_no_timer() {
        let trigger = TriggerConfig::QuotaReset {
            window: None,
            fallback_times: Vec::new(),
        };
        assert!(!has_timer_trigger(&trigger));

        let trigger = TriggerConfig::QuotaReset {
            window: None,
            fallback_times: vec!["23:00".to_string()],
        };
        assert!(has_timer_trigger(&trigger));
    }

    #[test]
    fn next_instant_covers_all_trigger_modes() {
        let now = NaiveDate::from_ymd_opt(2026, 3, 2)
            .unwrap()
            .and_hms_opt(9, 0, 0)
            .unwrap();

        let scheduled = TriggerConfig::Scheduled {
            rule: RepeatRule::Daily {
                times: vec!["10:00".to_string()],
            },
        };
        assert!(next_instant(&scheduled, now).is_some());

        let crontab = TriggerConfig::Crontab {
            expression: "0 10 * * *".to_string(),
        };
        assert_eq!(next_instant(&crontab, now), next_instant(&scheduled, now));

        let invalid = TriggerConfig::Crontab {
            expression: "0 10".to_string(),
        };
        assert!(next_instant(&invalid, now).is_none());
    }
}

use std::collections::HashSet;
use std::sync::Arc;
use std::time::{Instant, SystemTime, UNIX_EPOCH};

use serde::Serialize;
use tokio::sync::Mutex;

use crate::error::{QuotaSentryError, Result};
use crate::history::{HistoryStore, NewHistoryEntry, TriggerSource, TriggerType};
use crate::interfaces::accounts::{AccountDirectory, AccountInfo, ModelCatalog, ModelSpec};
use crate::interfaces::probe::{ProbeRequest, WakeupProbe};
use crate::tasks::{ScheduleConfig, TaskStore, WakeupTask};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum BatchOutcome {
    AllSuccess,
    Partial,
    AllFailed,
}

impl BatchOutcome {
    fn classify(succeeded: usize, failed: usize) -> Self {
        if failed == 0 {
            BatchOutcome::AllSuccess
        } else if succeeded == 0 {
            BatchOutcome::AllFailed
        } else {
            BatchOutcome::Partial
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct BatchSummary {
    pub task_name: String,
    pub timestamp: i64,
    pub total: usize,
    pub succeeded: usize,
    pub failed: usize,
    pub outcome: BatchOutcome,
}

struct ActionOutcome {
    account_id: String,
    account_email: String,
    model_id: String,
    success: bool,
    message: String,
    duration_ms: i64,
}

pub struct TaskRunner {
    directory: Arc<dyn AccountDirectory>,
    catalog: Arc<dyn ModelCatalog>,
    probe: Arc<dyn WakeupProbe>,
    tasks: Arc<TaskStore>,
    history: Arc<HistoryStore>,
    default_prompt: String,
    default_max_output_tokens: Option<u32>,
    running: Mutex<HashSet<i32>>,
}

impl TaskRunner {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        directory: Arc<dyn AccountDirectory>,
        catalog: Arc<dyn ModelCatalog>,
        probe: Arc<dyn WakeupProbe>,
        tasks: Arc<TaskStore>,
        history: Arc<HistoryStore>,
        default_prompt: String,
        default_max_output_tokens: Option<u32>,
    ) -> Self {
        Self {
            directory,
            catalog,
            probe,
            tasks,
            history,
            default_prompt,
            default_max_output_tokens,
            running: Mutex::new(HashSet::new()),
        }
    }

    // Returns Ok(None) when a batch for this task id is already in flight;
    // shared credentials must not be probed concurrently.
    pub async fn run_task(
        &self,
        task: &WakeupTask,
        trigger_type: TriggerType,
        trigger_source: TriggerSource,
    ) -> Result<Option<BatchSummary>> {
        {
            let mut running = self.running.lock().await;
            if !running.insert(task.id) {
                tracing::debug!(task_id = task.id, "batch already in flight, skipping run");
                return Ok(None);
            }
        }
        let result = self
            .execute_batch(
                Some(task.id),
                &task.name,
                &task.schedule,
                trigger_type,
                trigger_source,
            )
            .await;
        self.running.lock().await.remove(&task.id);
        result.map(Some)
    }

    // Ad hoc "run test" batch: no persisted task, no running-set entry.
    pub async fn run_adhoc(&self, name: &str, schedule: &ScheduleConfig) -> Result<BatchSummary> {
        self.execute_batch(None, name, schedule, TriggerType::Manual, TriggerSource::Manual)
            .await
    }

    async fn execute_batch(
        &self,
        task_id: Option<i32>,
        task_name: &str,
        schedule: &ScheduleConfig,
        trigger_type: TriggerType,
        trigger_source: TriggerSource,
    ) -> Result<BatchSummary> {
        let accounts = self.resolve_accounts(&schedule.accounts).await?;
        let models = self.resolve_models(&schedule.models);
        if accounts.is_empty() || models.is_empty() {
            return Err(QuotaSentryError::Runtime(format!(
                "task '{task_name}' resolves to no live account/model pairs"
            )));
        }

        let prompt = schedule
            .custom_prompt
            .as_deref()
            .map(str::trim)
            .filter(|prompt| !prompt.is_empty())
            .unwrap_or(&self.default_prompt)
            .to_string();
        let max_output_tokens = schedule.max_output_tokens.or(self.default_max_output_tokens);

        let mut invocations = Vec::with_capacity(accounts.len() * models.len());
        for account in &accounts {
            for model in &models {
                let probe = self.probe.clone();
                let request = ProbeRequest {
                    account_id: account.id.clone(),
                    model_id: model.id.clone(),
                    prompt: Some(prompt.clone()),
                    max_output_tokens,
                };
                let account_id = account.id.clone();
                let account_email = account.email.clone();
                let model_id = model.id.clone();
                invocations.push(async move {
                    let started = Instant::now();
                    match probe.trigger_wakeup(request).await {
                        Ok(reply) => ActionOutcome {
                            account_id,
                            account_email,
                            model_id,
                            success: true,
                            message: reply.reply,
                            duration_ms: reply
                                .duration_ms
                                .unwrap_or_else(|| started.elapsed().as_millis() as u64)
                                as i64,
                        },
                        Err(err) => ActionOutcome {
                            account_id,
                            account_email,
                            model_id,
                            success: false,
                            message: err.to_string(),
                            duration_ms: started.elapsed().as_millis() as i64,
                        },
                    }
                });
            }
        }

        let outcomes = futures::future::join_all(invocations).await;
        let finished_at = now_ts();

        if let Some(task_id) = task_id {
            if let Err(err) = self.tasks.mark_run(task_id, finished_at).await {
                tracing::warn!(task_id, error = %err, "failed to persist last_run_at");
            }
        }

        let succeeded = outcomes.iter().filter(|outcome| outcome.success).count();
        let failed = outcomes.len() - succeeded;
        let entries: Vec<NewHistoryEntry> = outcomes
            .into_iter()
            .map(|outcome| NewHistoryEntry {
                timestamp: finished_at,
                trigger_type: trigger_type.as_str().to_string(),
                trigger_source: trigger_source.as_str().to_string(),
                task_name: task_name.to_string(),
                account_id: outcome.account_id,
                account_email: outcome.account_email,
                model_id: outcome.model_id,
                prompt: prompt.clone(),
                success: outcome.success,
                message: outcome.message,
                duration_ms: outcome.duration_ms,
            })
            .collect();
        let total = entries.len();
        self.history.append_batch(entries).await?;

        let summary = BatchSummary {
            task_name: task_name.to_string(),
            timestamp: finished_at,
            total,
            succeeded,
            failed,
            outcome: BatchOutcome::classify(succeeded, failed),
        };
        match summary.outcome {
            BatchOutcome::AllSuccess => {
                tracing::info!(task = task_name, total, "wakeup batch succeeded")
            }
            BatchOutcome::Partial => tracing::warn!(
                task = task_name,
                total,
                failed,
                "wakeup batch partially failed"
            ),
            BatchOutcome::AllFailed => {
                tracing::error!(task = task_name, total, "wakeup batch failed entirely")
            }
        }
        Ok(summary)
    }

    // Stale references are dropped; an emptied selection falls back to the
    // first live account rather than dangling.
    async fn resolve_accounts(&self, selected: &[String]) -> Result<Vec<AccountInfo>> {
        let all = self.directory.accounts().await?;
        let mut resolved: Vec<AccountInfo> = all
            .iter()
            .filter(|account| selected.contains(&account.id))
            .cloned()
            .collect();
        if resolved.is_empty() {
            if let Some(first) = all.first() {
                tracing::debug!(
                    fallback = %first.id,
                    "selected accounts are stale; falling back to first live account"
                );
                resolved.push(first.clone());
            }
        }
        Ok(resolved)
    }

    fn resolve_models(&self, selected: &[String]) -> Vec<ModelSpec> {
        let all = self.catalog.models();
        let mut resolved: Vec<ModelSpec> = all
            .iter()
            .filter(|model| selected.contains(&model.id))
            .cloned()
            .collect();
        if resolved.is_empty() {
            if let Some(fallback) = all
                .iter()
                .find(|model| model.recommended)
                .or_else(|| all.first())
            {
                tracing::debug!(
                    fallback = %fallback.id,
                    "selected models are stale; falling back to recommended model"
                );
                resolved.push(fallback.clone());
            }
        }
        resolved
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
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    use crate::interfaces::accounts::{StaticAccountDirectory, StaticModelCatalog};
    use crate::interfaces::probe::ProbeReply;
    use crate::tasks::{RepeatRule, TriggerConfig};

    struct CountingProbe {
        calls: AtomicUsize,
        fail_account: Option<String>,
        delay: Duration,
    }

    impl CountingProbe {
        fn new() -> Self {
            Self {
                calls: AtomicUsize::new(0),
                fail_account: None,
                delay: Duration::ZERO,
            }
        }

        fn failing_for(account: &str) -> Self {
            Self {
                calls: AtomicUsize::new(0),
                fail_account: Some(account.to_string()),
                delay: Duration::ZERO,
            }
        }

        fn slow(delay: Duration) -> Self {
            Self {
                calls: AtomicUsize::new(0),
                fail_account: None,
                delay,
            }
        }
    }

    #[async_trait]
    impl WakeupProbe for CountingProbe {
        async fn trigger_wakeup(&self, request: ProbeRequest) -> Result<ProbeReply> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if !self.delay.is_zero() {
                tokio::time::sleep(self.delay).await;
            }
            if self.fail_account.as_deref() == Some(request.account_id.as_str()) {
                return Err(QuotaSentryError::Probe("simulated outage".to_string()));
            }
            Ok(ProbeReply {
                reply: format!("pong from {}", request.model_id),
                prompt_tokens: Some(1),
                completion_tokens: Some(1),
                total_tokens: Some(2),
                trace_id: None,
                duration_ms: Some(7),
            })
        }
    }

    fn account(id: &str) -> AccountInfo {
        AccountInfo {
            id: id.to_string(),
            email: format!("{id}@example.com"),
            quota: None,
        }
    }

    fn schedule(accounts: Vec<&str>, models: Vec<&str>) -> ScheduleConfig {
        ScheduleConfig {
            trigger: TriggerConfig::Scheduled {
                rule: RepeatRule::Daily {
                    times: vec!["09:00".to_string()],
                },
            },
            accounts: accounts.into_iter().map(str::to_string).collect(),
            models: models.into_iter().map(str::to_string).collect(),
            custom_prompt: None,
            max_output_tokens: None,
        }
    }

    async fn runner_with(
        probe: Arc<CountingProbe>,
        accounts: Vec<AccountInfo>,
    ) -> (tempfile::TempDir, Arc<TaskRunner>, Arc<HistoryStore>, Arc<TaskStore>) {
        let dir = tempfile::tempdir().expect("temp dir");
        let db = dir.path().join("runner.db").to_string_lossy().to_string();
        let tasks = Arc::new(TaskStore::new(&db).await.unwrap());
        let history = Arc::new(HistoryStore::new(&db, 50).await.unwrap());
        let runner = Arc::new(TaskRunner::new(
            Arc::new(StaticAccountDirectory::new(accounts)),
            Arc::new(StaticModelCatalog::builtin()),
            probe,
            tasks.clone(),
            history.clone(),
            "ping".to_string(),
            None,
        ));
        (dir, runner, history, tasks)
    }

    fn task(id: i32, schedule: ScheduleConfig) -> WakeupTask {
        WakeupTask {
            id,
            name: format!("task-{id}"),
            enabled: true,
            created_at: 0,
            last_run_at: None,
            schedule,
        }
    }

    #[tokio::test]
    async fn batch_covers_account_model_cross_product() {
        let probe = Arc::new(CountingProbe::new());
        let (_dir, runner, history, _tasks) =
            runner_with(probe.clone(), vec![account("a1"), account("a2")]).await;

        let schedule = schedule(vec!["a1", "a2"], vec!["claude-sonnet-4", "claude-opus-4"]);
        let summary = runner
            .run_task(&task(1, schedule), TriggerType::Auto, TriggerSource::Scheduled)
            .await
            .unwrap()
            .expect("summary");

        assert_eq!(summary.total, 4);
        assert_eq!(summary.outcome, BatchOutcome::AllSuccess);
        assert_eq!(probe.calls.load(Ordering::SeqCst), 4);

        let records = history.list(0).await.unwrap();
        assert_eq!(records.len(), 4);
        // one shared batch timestamp
        assert!(records
            .iter()
            .all(|record| record.timestamp == summary.timestamp));
    }

    #[tokio::test]
    async fn per_action_failure_is_isolated() {
        let probe = Arc::new(CountingProbe::failing_for("a2"));
        let (_dir, runner, history, _tasks) =
            runner_with(probe, vec![account("a1"), account("a2")]).await;

        let summary = runner
            .run_task(
                &task(1, schedule(vec!["a1", "a2"], vec!["claude-sonnet-4"])),
                TriggerType::Auto,
                TriggerSource::Scheduled,
            )
            .await
            .unwrap()
            .expect("summary");

        assert_eq!(summary.total, 2);
        assert_eq!(summary.succeeded, 1);
        assert_eq!(summary.failed, 1);
        assert_eq!(summary.outcome, BatchOutcome::Partial);

        let records = history.list(0).await.unwrap();
        let failure = records.iter().find(|record| !record.success).unwrap();
        assert_eq!(failure.account_id, "a2");
        assert!(failure.message.contains("simulated outage"));
    }

    #[tokio::test]
    async fn concurrent_runs_of_same_task_yield_one_batch() {
        let probe = Arc::new(CountingProbe::slow(Duration::from_millis(100)));
        let (_dir, runner, history, _tasks) = runner_with(probe.clone(), vec![account("a1")]).await;

        let task = task(7, schedule(vec!["a1"], vec!["claude-sonnet-4"]));
        let first = runner.run_task(&task, TriggerType::Manual, TriggerSource::Manual);
        let second = runner.run_task(&task, TriggerType::Manual, TriggerSource::Manual);
        let (first, second) = tokio::join!(first, second);

        let summaries: Vec<BatchSummary> = [first.unwrap(), second.unwrap()]
            .into_iter()
            .flatten()
            .collect();
        assert_eq!(summaries.len(), 1);
        assert_eq!(probe.calls.load(Ordering::SeqCst), 1);
        assert_eq!(history.list(0).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn stale_references_fall_back_to_defaults() {
        let probe = Arc::new(CountingProbe::new());
        let (_dir, runner, history, _tasks) = runner_with(probe, vec![account("live")]).await;

        let summary = runner
            .run_adhoc("probe test", &schedule(vec!["deleted"], vec!["gone-model"]))
            .await
            .unwrap();

        assert_eq!(summary.total, 1);
        let records = history.list(0).await.unwrap();
        assert_eq!(records[0].account_id, "live");
        // recommended model substitutes the stale selection
        assert_eq!(records[0].model_id, "claude-sonnet-4");
        assert_eq!(records[0].trigger_type, "manual");
        assert_eq!(records[0].trigger_source, "manual");
    }

    #[tokio::test]
    async fn empty_directory_is_a_runtime_error() {
        let probe = Arc::new(CountingProbe::new());
        let (_dir, runner, _history, _tasks) = runner_with(probe, Vec::new()).await;
        let err = runner
            .run_adhoc("probe test", &schedule(vec!["any"], vec!["claude-sonnet-4"]))
            .await
            .unwrap_err();
        assert!(matches!(err, QuotaSentryError::Runtime(_)));
    }

    #[tokio::test]
    async fn last_run_at_is_stamped_after_batch() {
        let probe = Arc::new(CountingProbe::new());
        let (_dir, runner, _history, tasks) = runner_with(probe, vec![account("a1")]).await;

        let created = tasks
            .create_task(crate::tasks::TaskDraft {
                name: "stamped".to_string(),
                enabled: true,
                schedule: schedule(vec!["a1"], vec!["claude-sonnet-4"]),
            })
            .await
            .unwrap();
        assert!(created.last_run_at.is_none());

        runner
            .run_task(&created, TriggerType::Auto, TriggerSource::Scheduled)
            .await
            .unwrap();

        let reloaded = tasks.get_task(created.id).await.unwrap().unwrap();
        assert!(reloaded.last_run_at.is_some());
    }
}

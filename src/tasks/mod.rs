use std::time::{SystemTime, UNIX_EPOCH};

use chrono::NaiveTime;
use diesel::prelude::*;
use diesel_async::RunQueryDsl;
use serde::{Deserialize, Serialize};

use crate::db::{open_pool, SqlitePool, SqlitePooledConn};
use crate::error::{QuotaSentryError, Result};

mod schema;
use schema::{wakeup_settings, wakeup_tasks};

const GLOBAL_ENABLED_KEY: &str = "wakeup_enabled";

pub const DEFAULT_DAILY_TIME: &str = "09:00";

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TimeWindow {
    pub start: String,
    pub end: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "repeat", rename_all = "snake_case")]
pub enum RepeatRule {
    Daily {
        times: Vec<String>,
    },
    Weekly {
        days: Vec<u8>,
        times: Vec<String>,
    },
    Interval {
        start_hour: u8,
        end_hour: u8,
        step_hours: u8,
        minute: u8,
    },
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "mode", rename_all = "snake_case")]
pub enum TriggerConfig {
    Scheduled {
        rule: RepeatRule,
    },
    Crontab {
        expression: String,
    },
    QuotaReset {
        #[serde(default)]
        window: Option<TimeWindow>,
        #[serde(default)]
        fallback_times: Vec<String>,
    },
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ScheduleConfig {
    pub trigger: TriggerConfig,
    #[serde(default)]
    pub accounts: Vec<String>,
    #[serde(default)]
    pub models: Vec<String>,
    #[serde(default)]
    pub custom_prompt: Option<String>,
    #[serde(default)]
    pub max_output_tokens: Option<u32>,
}

#[derive(Debug, Clone, Serialize)]
pub struct WakeupTask {
    pub id: i32,
    pub name: String,
    pub enabled: bool,
    pub created_at: i64,
    pub last_run_at: Option<i64>,
    pub schedule: ScheduleConfig,
}

impl WakeupTask {
    pub fn is_quota_reset(&self) -> bool {
        matches!(self.schedule.trigger, TriggerConfig::QuotaReset { .. })
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct TaskDraft {
    pub name: String,
    #[serde(default = "default_true")]
    pub enabled: bool,
    pub schedule: ScheduleConfig,
}

fn default_true() -> bool {
    true
}

pub fn normalize_time(raw: &str) -> Option<String> {
    let time = NaiveTime::parse_from_str(raw.trim(), "%H:%M").ok()?;
    Some(time.format("%H:%M").to_string())
}

// Dedup + sort; substitute the default when the cleanup empties the list.
fn normalize_times(times: &[String], default: Option<&str>) -> Vec<String> {
    let mut cleaned: Vec<String> = times.iter().filter_map(|raw| normalize_time(raw)).collect();
    cleaned.sort();
    cleaned.dedup();
    if cleaned.is_empty() {
        if let Some(default) = default {
            cleaned.push(default.to_string());
        }
    }
    cleaned
}

fn normalize_days(days: &[u8]) -> Vec<u8> {
    let mut cleaned: Vec<u8> = days.iter().copied().filter(|day| *day <= 6).collect();
    cleaned.sort_unstable();
    cleaned.dedup();
    if cleaned.is_empty() {
        cleaned = (0..=6).collect();
    }
    cleaned
}

fn normalize_window(window: Option<TimeWindow>) -> Option<TimeWindow> {
    let window = window?;
    let start = normalize_time(&window.start)?;
    let end = normalize_time(&window.end)?;
    if end < start {
        return Some(TimeWindow { start: end, end: start });
    }
    Some(TimeWindow { start, end })
}

pub fn normalize_schedule(mut schedule: ScheduleConfig) -> ScheduleConfig {
    schedule.trigger = match schedule.trigger {
        TriggerConfig::Scheduled { rule } => TriggerConfig::Scheduled {
            rule: match rule {
                RepeatRule::Daily { times } => RepeatRule::Daily {
                    times: normalize_times(&times, Some(DEFAULT_DAILY_TIME)),
                },
                RepeatRule::Weekly { days, times } => RepeatRule::Weekly {
                    days: normalize_days(&days),
                    times: normalize_times(&times, Some(DEFAULT_DAILY_TIME)),
                },
                RepeatRule::Interval {
                    start_hour,
                    end_hour,
                    step_hours,
                    minute,
                } => {
                    let start_hour = start_hour.min(23);
                    RepeatRule::Interval {
                        start_hour,
                        end_hour: end_hour.clamp(start_hour, 23),
                        step_hours: step_hours.max(1),
                        minute: minute.min(59),
                    }
                }
            },
        },
        TriggerConfig::Crontab { expression } => TriggerConfig::Crontab {
            expression: expression.trim().to_string(),
        },
        TriggerConfig::QuotaReset {
            window,
            fallback_times,
        } => TriggerConfig::QuotaReset {
            window: normalize_window(window),
            // Fallback times are optional; no default is substituted here.
            fallback_times: normalize_times(&fallback_times, None),
        },
    };
    schedule.accounts.retain(|id| !id.trim().is_empty());
    schedule.accounts.dedup();
    schedule.models.retain(|id| !id.trim().is_empty());
    schedule.models.dedup();
    if let Some(prompt) = &schedule.custom_prompt {
        if prompt.trim().is_empty() {
            schedule.custom_prompt = None;
        }
    }
    schedule
}

pub fn validate_draft(draft: &TaskDraft) -> Result<()> {
    if draft.name.trim().is_empty() {
        return Err(QuotaSentryError::Config("task name is empty".to_string()));
    }
    if draft.schedule.accounts.iter().all(|id| id.trim().is_empty()) {
        return Err(QuotaSentryError::Config(
            "task selects no accounts".to_string(),
        ));
    }
    if draft.schedule.models.iter().all(|id| id.trim().is_empty()) {
        return Err(QuotaSentryError::Config("task selects no models".to_string()));
    }
    if let TriggerConfig::Crontab { expression } = &draft.schedule.trigger {
        if expression.trim().is_empty() {
            return Err(QuotaSentryError::Config(
                "crontab expression is empty".to_string(),
            ));
        }
    }
    Ok(())
}

#[derive(Queryable)]
struct TaskRow {
    id: i32,
    name: String,
    enabled: bool,
    created_at: i64,
    last_run_at: Option<i64>,
    config: String,
}

#[derive(Insertable)]
#[diesel(table_name = wakeup_tasks)]
struct NewTaskRow<'a> {
    name: &'a str,
    enabled: bool,
    created_at: i64,
    last_run_at: Option<i64>,
    config: &'a str,
}

pub struct TaskStore {
    pool: SqlitePool,
}

impl TaskStore {
    pub async fn new(sqlite_path: impl AsRef<str>) -> Result<Self> {
        let pool = open_pool(sqlite_path.as_ref()).await?;
        Ok(Self { pool })
    }

    pub async fn create_task(&self, draft: TaskDraft) -> Result<WakeupTask> {
        validate_draft(&draft)?;
        let schedule = normalize_schedule(draft.schedule);
        let config = serde_json::to_string(&schedule)
            .map_err(|e| QuotaSentryError::Serialization(e.to_string()))?;
        let now = now_ts();
        let mut conn = self.conn().await?;

        let new = NewTaskRow {
            name: draft.name.trim(),
            enabled: draft.enabled,
            created_at: now,
            last_run_at: None,
            config: &config,
        };
        diesel::insert_into(wakeup_tasks::table)
            .values(&new)
            .execute(&mut conn)
            .await
            .map_err(|e| QuotaSentryError::Runtime(e.to_string()))?;

        let row: TaskRow = wakeup_tasks::table
            .order(wakeup_tasks::id.desc())
            .first(&mut conn)
            .await
            .map_err(|e| QuotaSentryError::Runtime(e.to_string()))?;
        map_row(row).ok_or_else(|| {
            QuotaSentryError::Serialization("freshly inserted task failed to decode".to_string())
        })
    }

    pub async fn update_task(&self, id: i32, draft: TaskDraft) -> Result<WakeupTask> {
        validate_draft(&draft)?;
        let schedule = normalize_schedule(draft.schedule);
        let config = serde_json::to_string(&schedule)
            .map_err(|e| QuotaSentryError::Serialization(e.to_string()))?;
        let mut conn = self.conn().await?;

        let updated = diesel::update(wakeup_tasks::table.filter(wakeup_tasks::id.eq(id)))
            .set((
                wakeup_tasks::name.eq(draft.name.trim()),
                wakeup_tasks::enabled.eq(draft.enabled),
                wakeup_tasks::config.eq(&config),
            ))
            .execute(&mut conn)
            .await
            .map_err(|e| QuotaSentryError::Runtime(e.to_string()))?;
        if updated == 0 {
            return Err(QuotaSentryError::Runtime(format!("no task with id {id}")));
        }
        drop(conn);

        self.get_task(id).await?.ok_or_else(|| {
            QuotaSentryError::Runtime(format!("task {id} disappeared during update"))
        })
    }

    pub async fn get_task(&self, id: i32) -> Result<Option<WakeupTask>> {
        let mut conn = self.conn().await?;
        let row = wakeup_tasks::table
            .filter(wakeup_tasks::id.eq(id))
            .first::<TaskRow>(&mut conn)
            .await
            .optional()
            .map_err(|e| QuotaSentryError::Runtime(e.to_string()))?;
        Ok(row.and_then(map_row))
    }

    pub async fn list_tasks(&self) -> Result<Vec<WakeupTask>> {
        let mut conn = self.conn().await?;
        let rows: Vec<TaskRow> = wakeup_tasks::table
            .order(wakeup_tasks::id.asc())
            .load(&mut conn)
            .await
            .map_err(|e| QuotaSentryError::Runtime(e.to_string()))?;
        Ok(rows.into_iter().filter_map(map_row).collect())
    }

    pub async fn set_enabled(&self, id: i32, enabled: bool) -> Result<WakeupTask> {
        let mut conn = self.conn().await?;
        let updated = diesel::update(wakeup_tasks::table.filter(wakeup_tasks::id.eq(id)))
            .set(wakeup_tasks::enabled.eq(enabled))
            .execute(&mut conn)
            .await
            .map_err(|e| QuotaSentryError::Runtime(e.to_string()))?;
        if updated == 0 {
            return Err(QuotaSentryError::Runtime(format!("no task with id {id}")));
        }
        drop(conn);

        self.get_task(id).await?.ok_or_else(|| {
            QuotaSentryError::Runtime(format!("task {id} disappeared during toggle"))
        })
    }

    pub async fn delete_task(&self, id: i32) -> Result<bool> {
        let mut conn = self.conn().await?;
        let deleted = diesel::delete(wakeup_tasks::table.filter(wakeup_tasks::id.eq(id)))
            .execute(&mut conn)
            .await
            .map_err(|e| QuotaSentryError::Runtime(e.to_string()))?;
        Ok(deleted > 0)
    }

    pub async fn mark_run(&self, id: i32, last_run_at: i64) -> Result<()> {
        let mut conn = self.conn().await?;
        diesel::update(wakeup_tasks::table.filter(wakeup_tasks::id.eq(id)))
            .set(wakeup_tasks::last_run_at.eq(Some(last_run_at)))
            .execute(&mut conn)
            .await
            .map_err(|e| QuotaSentryError::Runtime(e.to_string()))?;
        Ok(())
    }

    pub async fn global_enabled(&self) -> Result<bool> {
        let mut conn = self.conn().await?;
        let value = wakeup_settings::table
            .filter(wakeup_settings::key.eq(GLOBAL_ENABLED_KEY))
            .select(wakeup_settings::value)
            .first::<String>(&mut conn)
            .await
            .optional()
            .map_err(|e| QuotaSentryError::Runtime(e.to_string()))?;
        Ok(value.map(|raw| raw != "0").unwrap_or(true))
    }

    pub async fn set_global_enabled(&self, enabled: bool) -> Result<()> {
        let mut conn = self.conn().await?;
        diesel::replace_into(wakeup_settings::table)
            .values((
                wakeup_settings::key.eq(GLOBAL_ENABLED_KEY),
                wakeup_settings::value.eq(if enabled { "1" } else { "0" }),
            ))
            .execute(&mut conn)
            .await
            .map_err(|e| QuotaSentryError::Runtime(e.to_string()))?;
        Ok(())
    }

    async fn conn(&self) -> Result<SqlitePooledConn<'_>> {
        self.pool
            .get()
            .await
            .map_err(|e| QuotaSentryError::Runtime(e.to_string()))
    }
}

fn map_row(row: TaskRow) -> Option<WakeupTask> {
    match serde_json::from_str::<ScheduleConfig>(&row.config) {
        Ok(schedule) => Some(WakeupTask {
            id: row.id,
            name: row.name,
            enabled: row.enabled,
            created_at: row.created_at,
            last_run_at: row.last_run_at,
            schedule,
        }),
        Err(err) => {
            tracing::warn!(task_id = row.id, error = %err, "skipping task with undecodable config");
            None
        }
    }
}

fn now_ts() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs() as i64
}

use chrono::DateTime;
use diesel::prelude::*;
use diesel_async::RunQueryDsl;

use crate::db::{open_pool, SqlitePool, SqlitePooledConn};
use crate::error::{QuotaSentryError, Result};

mod schema;
use schema::reset_states;

pub const DEFAULT_MARGIN_SECONDS: i64 = 120;
pub const DEFAULT_COOLDOWN_SECONDS: i64 = 600;

const FULL_PERCENT: f64 = 100.0;

#[derive(Debug, Clone, Default, PartialEq)]
pub struct ModelResetState {
    pub last_trigger_token: Option<String>,
    pub last_trigger_at: Option<i64>,
    pub last_observed_percent: Option<f64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParkReason {
    NotFull,
    MarginNotElapsed,
    CooldownActive,
    DuplicateToken,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GateDecision {
    Fire,
    Parked(ParkReason),
}

impl GateDecision {
    pub fn fires(&self) -> bool {
        matches!(self, GateDecision::Fire)
    }
}

#[derive(Debug, Clone, Copy)]
pub struct ResetGate {
    pub margin_seconds: i64,
    pub cooldown_seconds: i64,
}

impl Default for ResetGate {
    fn default() -> Self {
        Self {
            margin_seconds: DEFAULT_MARGIN_SECONDS,
            cooldown_seconds: DEFAULT_COOLDOWN_SECONDS,
        }
    }
}

impl ResetGate {
    // The four gating conditions, in order: fullness, safety margin,
    // cooldown, novelty. A reset token fires at most once per key.
    pub fn evaluate(
        &self,
        state: &ModelResetState,
        remaining_percent: f64,
        reset_token: &str,
        now: i64,
    ) -> GateDecision {
        if remaining_percent < FULL_PERCENT {
            return GateDecision::Parked(ParkReason::NotFull);
        }

        let has_prior_trigger =
            state.last_trigger_token.is_some() || state.last_trigger_at.is_some();
        if has_prior_trigger {
            if let Some(epoch) = parse_token_epoch(reset_token) {
                if now < epoch + self.margin_seconds {
                    return GateDecision::Parked(ParkReason::MarginNotElapsed);
                }
            }
        }

        if let Some(last_at) = state.last_trigger_at {
            if now - last_at <= self.cooldown_seconds {
                return GateDecision::Parked(ParkReason::CooldownActive);
            }
        }

        if state.last_trigger_token.as_deref() == Some(reset_token) {
            return GateDecision::Parked(ParkReason::DuplicateToken);
        }

        GateDecision::Fire
    }
}

// Tokens are opaque but usually carry the reset instant: unix seconds, unix
// milliseconds, or RFC 3339. Anything else passes the margin gate.
pub fn parse_token_epoch(token: &str) -> Option<i64> {
    let token = token.trim();
    if let Ok(numeric) = token.parse::<i64>() {
        // Heuristic: values past the year 33658 in seconds are milliseconds.
        if numeric > 1_000_000_000_000 {
            return Some(numeric / 1000);
        }
        return Some(numeric);
    }
    DateTime::parse_from_rfc3339(token)
        .ok()
        .map(|parsed| parsed.timestamp())
}

#[derive(Queryable)]
struct ResetStateRow {
    #[allow(dead_code)]
    id: i32,
    #[allow(dead_code)]
    task_id: i32,
    #[allow(dead_code)]
    model_key: String,
    last_trigger_token: Option<String>,
    last_trigger_at: Option<i64>,
    last_observed_percent: Option<f64>,
}

pub struct ResetStore {
    pool: SqlitePool,
}

impl ResetStore {
    pub async fn new(sqlite_path: impl AsRef<str>) -> Result<Self> {
        let pool = open_pool(sqlite_path.as_ref()).await?;
        Ok(Self { pool })
    }

    // Missing or undecodable rows read as "no prior trigger history".
    pub async fn load(&self, task_id: i32, model_key: &str) -> ModelResetState {
        match self.try_load(task_id, model_key).await {
            Ok(state) => state,
            Err(err) => {
                tracing::warn!(
                    task_id,
                    model_key,
                    error = %err,
                    "treating unreadable reset state as empty"
                );
                ModelResetState::default()
            }
        }
    }

    async fn try_load(&self, task_id: i32, model_key: &str) -> Result<ModelResetState> {
        let mut conn = self.conn().await?;
        let row = reset_states::table
            .filter(reset_states::task_id.eq(task_id))
            .filter(reset_states::model_key.eq(model_key))
            .first::<ResetStateRow>(&mut conn)
            .await
            .optional()
            .map_err(|e| QuotaSentryError::Runtime(e.to_string()))?;
        Ok(row
            .map(|row| ModelResetState {
                last_trigger_token: row.last_trigger_token,
                last_trigger_at: row.last_trigger_at,
                last_observed_percent: row.last_observed_percent,
            })
            .unwrap_or_default())
    }

    pub async fn record_trigger(
        &self,
        task_id: i32,
        model_key: &str,
        reset_token: &str,
        now: i64,
    ) -> Result<()> {
        let mut conn = self.conn().await?;
        diesel::insert_into(reset_states::table)
            .values((
                reset_states::task_id.eq(task_id),
                reset_states::model_key.eq(model_key),
                reset_states::last_trigger_token.eq(Some(reset_token)),
                reset_states::last_trigger_at.eq(Some(now)),
                reset_states::last_observed_percent.eq(Some(FULL_PERCENT)),
            ))
            .on_conflict((reset_states::task_id, reset_states::model_key))
            .do_update()
            .set((
                reset_states::last_trigger_token.eq(Some(reset_token)),
                reset_states::last_trigger_at.eq(Some(now)),
                reset_states::last_observed_percent.eq(Some(FULL_PERCENT)),
            ))
            .execute(&mut conn)
            .await
            .map_err(|e| QuotaSentryError::Runtime(e.to_string()))?;
        Ok(())
    }

    pub async fn record_observation(
        &self,
        task_id: i32,
        model_key: &str,
        percent: f64,
    ) -> Result<()> {
        let mut conn = self.conn().await?;
        diesel::insert_into(reset_states::table)
            .values((
                reset_states::task_id.eq(task_id),
                reset_states::model_key.eq(model_key),
                reset_states::last_observed_percent.eq(Some(percent)),
            ))
            .on_conflict((reset_states::task_id, reset_states::model_key))
            .do_update()
            .set(reset_states::last_observed_percent.eq(Some(percent)))
            .execute(&mut conn)
            .await
            .map_err(|e| QuotaSentryError::Runtime(e.to_string()))?;
        Ok(())
    }

    pub async fn latest_trigger_at(&self, task_id: i32) -> Result<Option<i64>> {
        let mut conn = self.conn().await?;
        let latest = reset_states::table
            .filter(reset_states::task_id.eq(task_id))
            .select(diesel::dsl::max(reset_states::last_trigger_at))
            .first::<Option<i64>>(&mut conn)
            .await
            .map_err(|e| QuotaSentryError::Runtime(e.to_string()))?;
        Ok(latest)
    }

    pub async fn prune_task(&self, task_id: i32) -> Result<usize> {
        let mut conn = self.conn().await?;
        diesel::delete(reset_states::table.filter(reset_states::task_id.eq(task_id)))
            .execute(&mut conn)
            .await
            .map_err(|e| QuotaSentryError::Runtime(e.to_string()))
    }

    async fn conn(&self) -> Result<SqlitePooledConn<'_>> {
        self.pool
            .get()
            .await
            .map_err(|e| QuotaSentryError::Runtime(e.to_string()))
    }
}

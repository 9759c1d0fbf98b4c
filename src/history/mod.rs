use diesel::prelude::*;
use diesel_async::RunQueryDsl;
use serde::Serialize;

use crate::db::{open_pool, SqlitePool, SqlitePooledConn};
use crate::error::{QuotaSentryError, Result};

mod schema;
use schema::wakeup_history;

pub const DEFAULT_HISTORY_CAP: usize = 200;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TriggerType {
    Manual,
    Auto,
}

impl TriggerType {
    pub fn as_str(&self) -> &'static str {
        match self {
            TriggerType::Manual => "manual",
            TriggerType::Auto => "auto",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TriggerSource {
    Scheduled,
    Crontab,
    QuotaReset,
    Manual,
}

impl TriggerSource {
    pub fn as_str(&self) -> &'static str {
        match self {
            TriggerSource::Scheduled => "scheduled",
            TriggerSource::Crontab => "crontab",
            TriggerSource::QuotaReset => "quota_reset",
            TriggerSource::Manual => "manual",
        }
    }
}

#[derive(Debug, Clone, Serialize, Queryable)]
pub struct HistoryRecord {
    pub id: i32,
    pub timestamp: i64,
    pub trigger_type: String,
    pub trigger_source: String,
    pub task_name: String,
    pub account_id: String,
    pub account_email: String,
    pub model_id: String,
    pub prompt: String,
    pub success: bool,
    pub message: String,
    pub duration_ms: i64,
}

#[derive(Debug, Clone, Insertable)]
#[diesel(table_name = wakeup_history)]
pub struct NewHistoryEntry {
    pub timestamp: i64,
    pub trigger_type: String,
    pub trigger_source: String,
    pub task_name: String,
    pub account_id: String,
    pub account_email: String,
    pub model_id: String,
    pub prompt: String,
    pub success: bool,
    pub message: String,
    pub duration_ms: i64,
}

pub struct HistoryStore {
    pool: SqlitePool,
    cap: usize,
}

impl HistoryStore {
    pub async fn new(sqlite_path: impl AsRef<str>, cap: usize) -> Result<Self> {
        let pool = open_pool(sqlite_path.as_ref()).await?;
        Ok(Self {
            pool,
            cap: cap.max(1),
        })
    }

    // Rows are append-only; the cap evicts oldest (timestamp, id) first.
    pub async fn append_batch(&self, entries: Vec<NewHistoryEntry>) -> Result<()> {
        if entries.is_empty() {
            return Ok(());
        }
        let mut conn = self.conn().await?;
        // SQLite through diesel-async's SyncConnectionWrapper does not support
        // multi-row batch inserts, so each row is inserted individually.
        for entry in &entries {
            diesel::insert_into(wakeup_history::table)
                .values(entry)
                .execute(&mut conn)
                .await
                .map_err(|e| QuotaSentryError::Runtime(e.to_string()))?;
        }
        drop(conn);
        self.trim().await
    }

    pub async fn list(&self, limit: usize) -> Result<Vec<HistoryRecord>> {
        let mut conn = self.conn().await?;
        let mut query = wakeup_history::table
            .order((
                wakeup_history::timestamp.desc(),
                wakeup_history::id.desc(),
            ))
            .into_boxed();
        if limit > 0 {
            query = query.limit(limit as i64);
        }
        query
            .load(&mut conn)
            .await
            .map_err(|e| QuotaSentryError::Runtime(e.to_string()))
    }

    pub async fn clear(&self) -> Result<usize> {
        let mut conn = self.conn().await?;
        diesel::delete(wakeup_history::table)
            .execute(&mut conn)
            .await
            .map_err(|e| QuotaSentryError::Runtime(e.to_string()))
    }

    async fn trim(&self) -> Result<()> {
        let mut conn = self.conn().await?;
        let total: i64 = wakeup_history::table
            .count()
            .get_result(&mut conn)
            .await
            .map_err(|e| QuotaSentryError::Runtime(e.to_string()))?;
        let excess = total - self.cap as i64;
        if excess <= 0 {
            return Ok(());
        }
        let evicted: Vec<i32> = wakeup_history::table
            .order((wakeup_history::timestamp.asc(), wakeup_history::id.asc()))
            .limit(excess)
            .select(wakeup_history::id)
            .load(&mut conn)
            .await
            .map_err(|e| QuotaSentryError::Runtime(e.to_string()))?;
        diesel::delete(wakeup_history::table.filter(wakeup_history::id.eq_any(&evicted)))
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

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(timestamp: i64, task_name: &str, success: bool) -> NewHistoryEntry {
        NewHistoryEntry {
            timestamp,
            trigger_type: TriggerType::Auto.as_str().to_string(),
            trigger_source: TriggerSource::Scheduled.as_str().to_string(),
            task_name: task_name.to_string(),
            account_id: "acc-1".to_string(),
            account_email: "dev@example.com".to_string(),
            model_id: "claude-sonnet-4".to_string(),
            prompt: "ping".to_string(),
            success,
            message: if success { "ok" } else { "boom" }.to_string(),
            duration_ms: 12,
        }
    }

    async fn store(cap: usize) -> (tempfile::TempDir, HistoryStore) {
        let dir = tempfile::tempdir().expect("temp dir");
        let db_path = dir.path().join("history.db").to_string_lossy().to_string();
        let store = HistoryStore::new(&db_path, cap).await.expect("store");
        (dir, store)
    }

    #[tokio::test]
    async fn list_is_newest_first() {
        let (_dir, store) = store(10).await;
        store
            .append_batch(vec![
                entry(100, "a", true),
                entry(300, "b", true),
                entry(200, "c", false),
            ])
            .await
            .unwrap();

        let records = store.list(0).await.unwrap();
        let timestamps: Vec<i64> = records.iter().map(|record| record.timestamp).collect();
        assert_eq!(timestamps, vec![300, 200, 100]);
    }

    #[tokio::test]
    async fn cap_evicts_oldest_first() {
        let (_dir, store) = store(3).await;
        store
            .append_batch(vec![entry(100, "a", true), entry(200, "b", true)])
            .await
            .unwrap();
        store
            .append_batch(vec![entry(300, "c", true), entry(400, "d", true)])
            .await
            .unwrap();

        let records = store.list(0).await.unwrap();
        assert_eq!(records.len(), 3);
        let names: Vec<&str> = records.iter().map(|record| record.task_name.as_str()).collect();
        assert_eq!(names, vec!["d", "c", "b"]);
        let timestamps: Vec<i64> = records.iter().map(|record| record.timestamp).collect();
        assert!(timestamps.windows(2).all(|pair| pair[0] >= pair[1]));
    }

    #[tokio::test]
    async fn clear_empties_the_log() {
        let (_dir, store) = store(10).await;
        store.append_batch(vec![entry(100, "a", true)]).await.unwrap();
        assert_eq!(store.clear().await.unwrap(), 1);
        assert!(store.list(0).await.unwrap().is_empty());
    }
}

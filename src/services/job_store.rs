use async_trait::async_trait;
use chrono::Utc;
use sqlx::PgPool;
use std::collections::HashMap;
use tokio::sync::RwLock;

use crate::db::job_queries;
use crate::models::job::{merge_progress, JobRecord, JobState, LogEntry, ProgressData};

/// Per-tenant job state and append-only log.
///
/// Writes for one tenant are last-write-wins through the backend's upsert.
/// There is no transaction spanning a state write and a log append; a reader
/// may see either one first.
#[async_trait]
pub trait JobStore: Send + Sync {
    /// Upsert the record, set `state` and `updatedAt`, merge `progress`.
    async fn set_state(
        &self,
        db_name: &str,
        state: JobState,
        progress: ProgressData,
    ) -> Result<(), StoreError>;

    /// Append `entries` in order without touching state. Empty input is a no-op.
    async fn append_logs(&self, db_name: &str, entries: Vec<LogEntry>) -> Result<(), StoreError>;

    /// Merge progress fields, leaving `state` and `updatedAt` as they are.
    async fn merge_progress(&self, db_name: &str, progress: ProgressData) -> Result<(), StoreError>;

    /// Full record, or `None` when the tenant has never been written.
    async fn get_status(&self, db_name: &str) -> Result<Option<JobRecord>, StoreError>;

    /// Tenants whose record is currently in `state`.
    async fn list_by_state(&self, state: JobState) -> Result<Vec<String>, StoreError>;

    async fn log_count(&self, db_name: &str) -> Result<usize, StoreError> {
        Ok(self
            .get_status(db_name)
            .await?
            .map(|record| record.logs.len())
            .unwrap_or(0))
    }

    /// Logs for a tenant, empty when no record exists.
    async fn get_logs(&self, db_name: &str) -> Result<Vec<LogEntry>, StoreError> {
        Ok(self
            .get_status(db_name)
            .await?
            .map(|record| record.logs)
            .unwrap_or_default())
    }
}

/// PostgreSQL-backed store; layout in `migrations/`.
pub struct PgJobStore {
    pool: PgPool,
}

impl PgJobStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl JobStore for PgJobStore {
    async fn set_state(
        &self,
        db_name: &str,
        state: JobState,
        progress: ProgressData,
    ) -> Result<(), StoreError> {
        job_queries::upsert_state(&self.pool, db_name, state, &progress, Utc::now()).await?;
        Ok(())
    }

    async fn append_logs(&self, db_name: &str, entries: Vec<LogEntry>) -> Result<(), StoreError> {
        if entries.is_empty() {
            return Ok(());
        }
        job_queries::append_logs(&self.pool, db_name, &entries, Utc::now()).await?;
        Ok(())
    }

    async fn merge_progress(&self, db_name: &str, progress: ProgressData) -> Result<(), StoreError> {
        job_queries::merge_progress(&self.pool, db_name, &progress, Utc::now()).await?;
        Ok(())
    }

    async fn get_status(&self, db_name: &str) -> Result<Option<JobRecord>, StoreError> {
        Ok(job_queries::get_record(&self.pool, db_name).await?)
    }

    async fn list_by_state(&self, state: JobState) -> Result<Vec<String>, StoreError> {
        Ok(job_queries::list_by_state(&self.pool, state).await?)
    }

    async fn log_count(&self, db_name: &str) -> Result<usize, StoreError> {
        Ok(job_queries::log_count(&self.pool, db_name).await?)
    }
}

/// Process-local store. Not durable; used without a database and in tests.
#[derive(Default)]
pub struct MemoryJobStore {
    records: RwLock<HashMap<String, JobRecord>>,
}

impl MemoryJobStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl JobStore for MemoryJobStore {
    async fn set_state(
        &self,
        db_name: &str,
        state: JobState,
        progress: ProgressData,
    ) -> Result<(), StoreError> {
        let now = Utc::now();
        let mut records = self.records.write().await;
        let record = records
            .entry(db_name.to_string())
            .or_insert_with(|| JobRecord::idle(db_name, now));
        record.state = state;
        record.updated_at = now;
        merge_progress(&mut record.progress_data, progress);
        Ok(())
    }

    async fn append_logs(&self, db_name: &str, entries: Vec<LogEntry>) -> Result<(), StoreError> {
        if entries.is_empty() {
            return Ok(());
        }
        let mut records = self.records.write().await;
        records
            .entry(db_name.to_string())
            .or_insert_with(|| JobRecord::idle(db_name, Utc::now()))
            .logs
            .extend(entries);
        Ok(())
    }

    async fn merge_progress(&self, db_name: &str, progress: ProgressData) -> Result<(), StoreError> {
        let mut records = self.records.write().await;
        let record = records
            .entry(db_name.to_string())
            .or_insert_with(|| JobRecord::idle(db_name, Utc::now()));
        merge_progress(&mut record.progress_data, progress);
        Ok(())
    }

    async fn get_status(&self, db_name: &str) -> Result<Option<JobRecord>, StoreError> {
        Ok(self.records.read().await.get(db_name).cloned())
    }

    async fn list_by_state(&self, state: JobState) -> Result<Vec<String>, StoreError> {
        let records = self.records.read().await;
        let mut tenants: Vec<String> = records
            .values()
            .filter(|record| record.state == state)
            .map(|record| record.db_name.clone())
            .collect();
        tenants.sort();
        Ok(tenants)
    }

    async fn log_count(&self, db_name: &str) -> Result<usize, StoreError> {
        Ok(self
            .records
            .read()
            .await
            .get(db_name)
            .map_or(0, |record| record.logs.len()))
    }
}

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn progress(value: serde_json::Value) -> ProgressData {
        value.as_object().cloned().unwrap()
    }

    #[tokio::test]
    async fn test_set_state_creates_record() {
        let store = MemoryJobStore::new();
        let before = Utc::now();

        store
            .set_state("shop-a", JobState::Running, ProgressData::new())
            .await
            .unwrap();

        let record = store.get_status("shop-a").await.unwrap().unwrap();
        assert_eq!(record.state, JobState::Running);
        assert!(record.updated_at >= before);
        assert!(record.logs.is_empty());
    }

    #[tokio::test]
    async fn test_unknown_tenant_has_no_record() {
        let store = MemoryJobStore::new();
        assert!(store.get_status("nobody").await.unwrap().is_none());
        assert!(store.get_logs("nobody").await.unwrap().is_empty());
        assert_eq!(store.log_count("nobody").await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_progress_is_merged_across_updates() {
        let store = MemoryJobStore::new();
        store
            .set_state("shop-a", JobState::Running, progress(json!({"processed": 1, "total": 9})))
            .await
            .unwrap();
        store
            .set_state("shop-a", JobState::Running, progress(json!({"processed": 5})))
            .await
            .unwrap();

        let record = store.get_status("shop-a").await.unwrap().unwrap();
        assert_eq!(record.progress_data["processed"], 5);
        assert_eq!(record.progress_data["total"], 9);
    }

    #[tokio::test]
    async fn test_empty_append_is_noop() {
        let store = MemoryJobStore::new();
        store
            .set_state("shop-a", JobState::Running, ProgressData::new())
            .await
            .unwrap();
        store
            .append_logs("shop-a", vec![LogEntry::message("first")])
            .await
            .unwrap();
        let before = store.get_status("shop-a").await.unwrap().unwrap();

        store.append_logs("shop-a", Vec::new()).await.unwrap();
        store.append_logs("fresh", Vec::new()).await.unwrap();

        let after = store.get_status("shop-a").await.unwrap().unwrap();
        assert_eq!(before, after);
        assert!(store.get_status("fresh").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_append_preserves_order_and_state() {
        let store = MemoryJobStore::new();
        store
            .set_state("shop-a", JobState::Running, ProgressData::new())
            .await
            .unwrap();
        let updated_at = store.get_status("shop-a").await.unwrap().unwrap().updated_at;

        store
            .append_logs("shop-a", vec![LogEntry::message("a")])
            .await
            .unwrap();
        store
            .append_logs("shop-a", vec![LogEntry::message("b"), LogEntry::message("c")])
            .await
            .unwrap();

        let record = store.get_status("shop-a").await.unwrap().unwrap();
        assert_eq!(record.state, JobState::Running);
        assert_eq!(record.updated_at, updated_at);
        assert_eq!(
            record.logs,
            vec![
                LogEntry::message("a"),
                LogEntry::message("b"),
                LogEntry::message("c")
            ]
        );
    }

    #[tokio::test]
    async fn test_merge_progress_keeps_state() {
        let store = MemoryJobStore::new();
        store
            .set_state("shop-a", JobState::Running, ProgressData::new())
            .await
            .unwrap();
        let updated_at = store.get_status("shop-a").await.unwrap().unwrap().updated_at;

        store
            .merge_progress("shop-a", progress(json!({"stopped": true})))
            .await
            .unwrap();

        let record = store.get_status("shop-a").await.unwrap().unwrap();
        assert_eq!(record.state, JobState::Running);
        assert_eq!(record.updated_at, updated_at);
        assert_eq!(record.progress_data["stopped"], true);
    }

    #[tokio::test]
    async fn test_list_by_state() {
        let store = MemoryJobStore::new();
        for (tenant, state) in [
            ("shop-b", JobState::Running),
            ("shop-a", JobState::Running),
            ("shop-c", JobState::Done),
        ] {
            store
                .set_state(tenant, state, ProgressData::new())
                .await
                .unwrap();
        }

        assert_eq!(
            store.list_by_state(JobState::Running).await.unwrap(),
            vec!["shop-a", "shop-b"]
        );
        assert!(store.list_by_state(JobState::Error).await.unwrap().is_empty());
    }
}

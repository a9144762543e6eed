//! Test store that delegates to libSQL but can be told to fail writes.

use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::error::DatabaseError;
use crate::queue::backoff::Transition;
use crate::queue::model::{QueueRecord, QueueStats};
use crate::store::{Database, LibSqlBackend};

pub struct FaultyStore {
    inner: LibSqlBackend,
    /// `set_setting` fails while set.
    pub fail_setting_writes: AtomicBool,
    /// `complete_record` and `reschedule_record` fail while set.
    pub fail_record_writes: AtomicBool,
}

impl FaultyStore {
    pub async fn new() -> Self {
        Self {
            inner: LibSqlBackend::new_memory().await.unwrap(),
            fail_setting_writes: AtomicBool::new(false),
            fail_record_writes: AtomicBool::new(false),
        }
    }

    fn check(flag: &AtomicBool, op: &str) -> Result<(), DatabaseError> {
        if flag.load(Ordering::SeqCst) {
            return Err(DatabaseError::Query(format!("{op}: disk I/O error")));
        }
        Ok(())
    }
}

#[async_trait]
impl Database for FaultyStore {
    async fn run_migrations(&self) -> Result<(), DatabaseError> {
        self.inner.run_migrations().await
    }

    async fn upsert_coalesced(&self, record: &QueueRecord) -> Result<(), DatabaseError> {
        self.inner.upsert_coalesced(record).await
    }

    async fn get_record(&self, id: &str) -> Result<Option<QueueRecord>, DatabaseError> {
        self.inner.get_record(id).await
    }

    async fn due_records(
        &self,
        now: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<QueueRecord>, DatabaseError> {
        self.inner.due_records(now, limit).await
    }

    async fn complete_record(&self, id: &str, revision: u64) -> Result<bool, DatabaseError> {
        Self::check(&self.fail_record_writes, "complete_record")?;
        self.inner.complete_record(id, revision).await
    }

    async fn reschedule_record(
        &self,
        id: &str,
        transition: &Transition,
    ) -> Result<bool, DatabaseError> {
        Self::check(&self.fail_record_writes, "reschedule_record")?;
        self.inner.reschedule_record(id, transition).await
    }

    async fn clear_records(&self) -> Result<usize, DatabaseError> {
        self.inner.clear_records().await
    }

    async fn dead_letters(&self, limit: usize) -> Result<Vec<QueueRecord>, DatabaseError> {
        self.inner.dead_letters(limit).await
    }

    async fn record_success(&self) -> Result<(), DatabaseError> {
        self.inner.record_success().await
    }

    async fn record_failure(&self) -> Result<(), DatabaseError> {
        self.inner.record_failure().await
    }

    async fn record_dead_letter(&self) -> Result<(), DatabaseError> {
        self.inner.record_dead_letter().await
    }

    async fn reset_stats(&self) -> Result<(), DatabaseError> {
        self.inner.reset_stats().await
    }

    async fn stats(&self) -> Result<QueueStats, DatabaseError> {
        self.inner.stats().await
    }

    async fn get_setting(&self, key: &str) -> Result<Option<serde_json::Value>, DatabaseError> {
        self.inner.get_setting(key).await
    }

    async fn set_setting(
        &self,
        key: &str,
        value: &serde_json::Value,
    ) -> Result<(), DatabaseError> {
        Self::check(&self.fail_setting_writes, "set_setting")?;
        self.inner.set_setting(key, value).await
    }
}

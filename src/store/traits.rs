//! `Database` trait: the durable record store behind the queue.
//!
//! Every mutation is a single statement so that no caller reads, modifies
//! and writes back a record on its own.

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::error::DatabaseError;
use crate::queue::backoff::Transition;
use crate::queue::model::{QueueRecord, QueueStats};

/// Backend-agnostic store for queue records, settings and counters.
#[async_trait]
pub trait Database: Send + Sync {
    /// Run all pending schema migrations.
    async fn run_migrations(&self) -> Result<(), DatabaseError>;

    // ── Queue records ───────────────────────────────────────────────

    /// Insert `record`, or if its id already exists overwrite only the
    /// payload and `last_updated_at` (and bump the revision).
    async fn upsert_coalesced(&self, record: &QueueRecord) -> Result<(), DatabaseError>;

    /// Get a record by id.
    async fn get_record(&self, id: &str) -> Result<Option<QueueRecord>, DatabaseError>;

    /// Records with `next_attempt_at <= now`, oldest `first_enqueued_at` first.
    async fn due_records(
        &self,
        now: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<QueueRecord>, DatabaseError>;

    /// Delete a processed record unless it was coalesced after `revision`.
    /// Returns `true` if the row was deleted.
    async fn complete_record(&self, id: &str, revision: u64) -> Result<bool, DatabaseError>;

    /// Apply a retry engine transition. Returns `false` if the record is gone.
    async fn reschedule_record(
        &self,
        id: &str,
        transition: &Transition,
    ) -> Result<bool, DatabaseError>;

    /// Delete every record. Returns the number removed.
    async fn clear_records(&self) -> Result<usize, DatabaseError>;

    /// Dead-lettered records, most recently updated first.
    async fn dead_letters(&self, limit: usize) -> Result<Vec<QueueRecord>, DatabaseError>;

    // ── Stats ───────────────────────────────────────────────────────

    async fn record_success(&self) -> Result<(), DatabaseError>;

    async fn record_failure(&self) -> Result<(), DatabaseError>;

    async fn record_dead_letter(&self) -> Result<(), DatabaseError>;

    /// Zero all counters.
    async fn reset_stats(&self) -> Result<(), DatabaseError>;

    /// Record counts plus counters.
    async fn stats(&self) -> Result<QueueStats, DatabaseError>;

    // ── Settings ────────────────────────────────────────────────────

    /// Get a setting value by key.
    async fn get_setting(&self, key: &str) -> Result<Option<serde_json::Value>, DatabaseError>;

    /// Set a setting value (upsert).
    async fn set_setting(&self, key: &str, value: &serde_json::Value)
    -> Result<(), DatabaseError>;
}

//! libSQL backend: async `Database` trait implementation.
//!
//! Supports local file and in-memory databases. Timestamps are stored as
//! epoch milliseconds so `next_attempt_at` can be range-scanned directly;
//! dead letters carry `i64::MAX`.

use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use libsql::{Connection, Database as LibSqlDatabase, params};
use tracing::{debug, info};

use crate::error::DatabaseError;
use crate::queue::backoff::Transition;
use crate::queue::model::{NextAttempt, QueueRecord, QueueStats};
use crate::store::migrations;
use crate::store::traits::Database;

/// Column list for `row_to_record`.
const RECORD_COLUMNS: &str = "id, source_key, payload, first_enqueued_at, last_updated_at, attempt, next_attempt_at, revision";

/// libSQL database backend.
///
/// Stores a single connection that is reused for all operations.
/// `libsql::Connection` is `Send + Sync` and safe for concurrent async use.
pub struct LibSqlBackend {
    #[allow(dead_code)]
    db: Arc<LibSqlDatabase>,
    conn: Connection,
}

impl LibSqlBackend {
    /// Open (or create) a local database file and run migrations.
    pub async fn new_local(path: &Path) -> Result<Self, DatabaseError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| {
                DatabaseError::Pool(format!("Failed to create database directory: {e}"))
            })?;
        }

        let db = libsql::Builder::new_local(path)
            .build()
            .await
            .map_err(|e| DatabaseError::Pool(format!("Failed to open libSQL database: {e}")))?;

        let conn = db
            .connect()
            .map_err(|e| DatabaseError::Pool(format!("Failed to create connection: {e}")))?;

        let backend = Self {
            db: Arc::new(db),
            conn,
        };
        backend.run_migrations().await?;
        info!(path = %path.display(), "Database opened");
        Ok(backend)
    }

    /// Create an in-memory database (for tests).
    pub async fn new_memory() -> Result<Self, DatabaseError> {
        let db = libsql::Builder::new_local(":memory:")
            .build()
            .await
            .map_err(|e| {
                DatabaseError::Pool(format!("Failed to create in-memory database: {e}"))
            })?;

        let conn = db
            .connect()
            .map_err(|e| DatabaseError::Pool(format!("Failed to create connection: {e}")))?;

        let backend = Self {
            db: Arc::new(db),
            conn,
        };
        backend.run_migrations().await?;
        Ok(backend)
    }

    /// Get the connection.
    fn conn(&self) -> &Connection {
        &self.conn
    }

    async fn query_records(
        &self,
        sql: &str,
        params: impl libsql::params::IntoParams,
        op: &str,
    ) -> Result<Vec<QueueRecord>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(sql, params)
            .await
            .map_err(|e| DatabaseError::Query(format!("{op}: {e}")))?;

        let mut records = Vec::new();
        while let Some(row) = rows
            .next()
            .await
            .map_err(|e| DatabaseError::Query(format!("{op}: {e}")))?
        {
            match row_to_record(&row) {
                Ok(record) => records.push(record),
                Err(e) => tracing::warn!("Skipping queue record row in {op}: {e}"),
            }
        }
        Ok(records)
    }

    async fn bump_counter(&self, column: &str) -> Result<(), DatabaseError> {
        self.conn()
            .execute(
                &format!("UPDATE queue_stats SET {column} = {column} + 1 WHERE id = 1"),
                (),
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("bump {column}: {e}")))?;
        Ok(())
    }
}

// ── Helper functions ────────────────────────────────────────────────

fn millis_to_datetime(ms: i64) -> DateTime<Utc> {
    DateTime::from_timestamp_millis(ms).unwrap_or(DateTime::<Utc>::MIN_UTC)
}

/// Map a libsql Row to a QueueRecord.
///
/// Column order matches RECORD_COLUMNS.
fn row_to_record(row: &libsql::Row) -> Result<QueueRecord, DatabaseError> {
    let get_err = |e: libsql::Error| DatabaseError::Query(format!("row decode: {e}"));

    let id: String = row.get(0).map_err(get_err)?;
    let source_key: String = row.get(1).map_err(get_err)?;
    let payload_str: String = row.get(2).map_err(get_err)?;
    let first_enqueued_at: i64 = row.get(3).map_err(get_err)?;
    let last_updated_at: i64 = row.get(4).map_err(get_err)?;
    let attempt: i64 = row.get(5).map_err(get_err)?;
    let next_attempt_at: i64 = row.get(6).map_err(get_err)?;
    let revision: i64 = row.get(7).map_err(get_err)?;

    let payload = serde_json::from_str(&payload_str)
        .map_err(|e| DatabaseError::Serialization(format!("payload of {id}: {e}")))?;

    Ok(QueueRecord {
        id,
        source_key,
        payload,
        first_enqueued_at: millis_to_datetime(first_enqueued_at),
        last_updated_at: millis_to_datetime(last_updated_at),
        attempt: attempt.clamp(0, u32::MAX as i64) as u32,
        next_attempt: NextAttempt::from_millis(next_attempt_at),
        revision: revision.max(0) as u64,
    })
}

async fn single_i64(rows: &mut libsql::Rows, op: &str) -> Result<i64, DatabaseError> {
    match rows.next().await {
        Ok(Some(row)) => row
            .get::<i64>(0)
            .map_err(|e| DatabaseError::Query(format!("{op}: {e}"))),
        Ok(None) => Ok(0),
        Err(e) => Err(DatabaseError::Query(format!("{op}: {e}"))),
    }
}

#[async_trait]
impl Database for LibSqlBackend {
    async fn run_migrations(&self) -> Result<(), DatabaseError> {
        migrations::run_migrations(self.conn()).await
    }

    // ── Queue records ───────────────────────────────────────────────

    async fn upsert_coalesced(&self, record: &QueueRecord) -> Result<(), DatabaseError> {
        let payload = serde_json::to_string(&record.payload)
            .map_err(|e| DatabaseError::Serialization(e.to_string()))?;

        self.conn()
            .execute(
                "INSERT INTO queue_records (id, source_key, payload, first_enqueued_at, last_updated_at, attempt, next_attempt_at, revision)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, 0)
                 ON CONFLICT (id) DO UPDATE SET
                    payload = excluded.payload,
                    last_updated_at = excluded.last_updated_at,
                    revision = queue_records.revision + 1",
                params![
                    record.id.clone(),
                    record.source_key.clone(),
                    payload,
                    record.first_enqueued_at.timestamp_millis(),
                    record.last_updated_at.timestamp_millis(),
                    record.attempt as i64,
                    record.next_attempt.to_millis(),
                ],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("upsert_coalesced: {e}")))?;

        debug!(id = %record.id, "Queue record upserted");
        Ok(())
    }

    async fn get_record(&self, id: &str) -> Result<Option<QueueRecord>, DatabaseError> {
        let records = self
            .query_records(
                &format!("SELECT {RECORD_COLUMNS} FROM queue_records WHERE id = ?1"),
                params![id],
                "get_record",
            )
            .await?;
        Ok(records.into_iter().next())
    }

    async fn due_records(
        &self,
        now: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<QueueRecord>, DatabaseError> {
        self.query_records(
            &format!(
                "SELECT {RECORD_COLUMNS} FROM queue_records
                 WHERE next_attempt_at <= ?1
                 ORDER BY first_enqueued_at ASC, id ASC
                 LIMIT ?2"
            ),
            params![now.timestamp_millis(), limit as i64],
            "due_records",
        )
        .await
    }

    async fn complete_record(&self, id: &str, revision: u64) -> Result<bool, DatabaseError> {
        let deleted = self
            .conn()
            .execute(
                "DELETE FROM queue_records WHERE id = ?1 AND revision = ?2",
                params![id, revision as i64],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("complete_record: {e}")))?;
        Ok(deleted > 0)
    }

    async fn reschedule_record(
        &self,
        id: &str,
        transition: &Transition,
    ) -> Result<bool, DatabaseError> {
        let updated = self
            .conn()
            .execute(
                "UPDATE queue_records SET attempt = ?1, next_attempt_at = ?2 WHERE id = ?3",
                params![
                    transition.attempt() as i64,
                    transition.next_attempt().to_millis(),
                    id
                ],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("reschedule_record: {e}")))?;
        Ok(updated > 0)
    }

    async fn clear_records(&self) -> Result<usize, DatabaseError> {
        let deleted = self
            .conn()
            .execute("DELETE FROM queue_records", ())
            .await
            .map_err(|e| DatabaseError::Query(format!("clear_records: {e}")))?;
        Ok(deleted as usize)
    }

    async fn dead_letters(&self, limit: usize) -> Result<Vec<QueueRecord>, DatabaseError> {
        self.query_records(
            &format!(
                "SELECT {RECORD_COLUMNS} FROM queue_records
                 WHERE next_attempt_at = ?1
                 ORDER BY last_updated_at DESC, id ASC
                 LIMIT ?2"
            ),
            params![NextAttempt::NEVER_MILLIS, limit as i64],
            "dead_letters",
        )
        .await
    }

    // ── Stats ───────────────────────────────────────────────────────

    async fn record_success(&self) -> Result<(), DatabaseError> {
        self.bump_counter("successes").await
    }

    async fn record_failure(&self) -> Result<(), DatabaseError> {
        self.bump_counter("failures").await
    }

    async fn record_dead_letter(&self) -> Result<(), DatabaseError> {
        self.bump_counter("dead_letters").await
    }

    async fn reset_stats(&self) -> Result<(), DatabaseError> {
        self.conn()
            .execute(
                "UPDATE queue_stats SET successes = 0, failures = 0, dead_letters = 0 WHERE id = 1",
                (),
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("reset_stats: {e}")))?;
        Ok(())
    }

    async fn stats(&self) -> Result<QueueStats, DatabaseError> {
        let conn = self.conn();

        let mut rows = conn
            .query(
                "SELECT COUNT(*) FROM queue_records WHERE next_attempt_at != ?1",
                params![NextAttempt::NEVER_MILLIS],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("stats: {e}")))?;
        let pending = single_i64(&mut rows, "stats pending").await?;

        let mut rows = conn
            .query(
                "SELECT COUNT(*) FROM queue_records WHERE next_attempt_at = ?1",
                params![NextAttempt::NEVER_MILLIS],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("stats: {e}")))?;
        let dead_lettered = single_i64(&mut rows, "stats dead_lettered").await?;

        let mut rows = conn
            .query(
                "SELECT successes, failures, dead_letters FROM queue_stats WHERE id = 1",
                (),
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("stats: {e}")))?;

        let (successes, failures, dead_letters_total) = match rows.next().await {
            Ok(Some(row)) => (
                row.get::<i64>(0).unwrap_or(0),
                row.get::<i64>(1).unwrap_or(0),
                row.get::<i64>(2).unwrap_or(0),
            ),
            Ok(None) => (0, 0, 0),
            Err(e) => return Err(DatabaseError::Query(format!("stats: {e}"))),
        };

        Ok(QueueStats {
            pending: pending.max(0) as u64,
            dead_lettered: dead_lettered.max(0) as u64,
            successes: successes.max(0) as u64,
            failures: failures.max(0) as u64,
            dead_letters_total: dead_letters_total.max(0) as u64,
        })
    }

    // ── Settings ────────────────────────────────────────────────────

    async fn get_setting(&self, key: &str) -> Result<Option<serde_json::Value>, DatabaseError> {
        let conn = self.conn();
        let mut rows = conn
            .query("SELECT value FROM settings WHERE key = ?1", params![key])
            .await
            .map_err(|e| DatabaseError::Query(format!("get_setting: {e}")))?;

        match rows.next().await {
            Ok(Some(row)) => {
                let value_str: String = row.get(0).unwrap_or_else(|_| "null".to_string());
                let value: serde_json::Value =
                    serde_json::from_str(&value_str).unwrap_or(serde_json::Value::Null);
                Ok(Some(value))
            }
            Ok(None) => Ok(None),
            Err(e) => Err(DatabaseError::Query(format!("get_setting: {e}"))),
        }
    }

    async fn set_setting(
        &self,
        key: &str,
        value: &serde_json::Value,
    ) -> Result<(), DatabaseError> {
        let conn = self.conn();
        let now = Utc::now().to_rfc3339();
        let value_str = serde_json::to_string(value)
            .map_err(|e| DatabaseError::Serialization(e.to_string()))?;

        conn.execute(
            "INSERT INTO settings (key, value, updated_at) VALUES (?1, ?2, ?3)
             ON CONFLICT (key) DO UPDATE SET value = ?2, updated_at = ?3",
            params![key, value_str, now],
        )
        .await
        .map_err(|e| DatabaseError::Query(format!("set_setting: {e}")))?;
        Ok(())
    }
}

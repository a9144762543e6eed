//! Queue record model.

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// When a record becomes eligible for dequeue.
///
/// `Never` is the dead-letter state: the record stays in the store for
/// inspection but no tick will pick it up again.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "at", rename_all = "snake_case")]
pub enum NextAttempt {
    At(DateTime<Utc>),
    Never,
}

impl NextAttempt {
    /// Persisted sentinel for `Never`; sorts after every real timestamp.
    pub const NEVER_MILLIS: i64 = i64::MAX;

    pub fn is_never(&self) -> bool {
        matches!(self, Self::Never)
    }

    /// Eligible at `now`.
    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        match self {
            Self::At(at) => *at <= now,
            Self::Never => false,
        }
    }

    pub fn to_millis(self) -> i64 {
        match self {
            Self::At(at) => at.timestamp_millis(),
            Self::Never => Self::NEVER_MILLIS,
        }
    }

    pub fn from_millis(ms: i64) -> Self {
        if ms == Self::NEVER_MILLIS {
            return Self::Never;
        }
        match DateTime::from_timestamp_millis(ms) {
            Some(at) => Self::At(at),
            None => Self::Never,
        }
    }
}

/// One pending, retrying or dead-lettered unit of work.
///
/// Absence from the store means the record completed successfully.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueueRecord {
    /// `{source_key}#{bucket}`, the natural dedup key.
    pub id: String,
    pub source_key: String,
    pub payload: serde_json::Value,
    pub first_enqueued_at: DateTime<Utc>,
    pub last_updated_at: DateTime<Utc>,
    pub attempt: u32,
    pub next_attempt: NextAttempt,
    /// Bumped on every coalesce; lets completion detect a newer payload.
    #[serde(default)]
    pub revision: u64,
}

impl QueueRecord {
    /// A fresh record for the bucket containing `now`, eligible immediately.
    pub fn new(
        source_key: &str,
        payload: serde_json::Value,
        now: DateTime<Utc>,
        bucket_width: Duration,
    ) -> Self {
        let bucket = time_bucket(now, bucket_width);
        Self {
            id: record_id(source_key, bucket),
            source_key: source_key.to_string(),
            payload,
            first_enqueued_at: now,
            last_updated_at: now,
            attempt: 0,
            next_attempt: NextAttempt::At(now),
            revision: 0,
        }
    }

    pub fn is_dead_lettered(&self) -> bool {
        self.next_attempt.is_never()
    }
}

/// `floor(now / width)` in milliseconds since the epoch.
pub fn time_bucket(now: DateTime<Utc>, width: Duration) -> i64 {
    let width_ms = (width.as_millis() as i64).max(1);
    now.timestamp_millis().div_euclid(width_ms)
}

/// Composite record id for a source and bucket.
pub fn record_id(source_key: &str, bucket: i64) -> String {
    format!("{source_key}#{bucket}")
}

/// Result of processing one record inside the worker host.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Outcome {
    Success,
    /// Recoverable; consumes a retry attempt.
    Retriable,
    /// Permanent rejection; dead-lettered without consuming an attempt.
    Fatal,
}

impl std::fmt::Display for Outcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Success => write!(f, "success"),
            Self::Retriable => write!(f, "retriable"),
            Self::Fatal => write!(f, "fatal"),
        }
    }
}

/// Read-only queue statistics.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueStats {
    /// Records waiting for their first or a retry attempt.
    pub pending: u64,
    /// Records currently parked in the dead-letter state.
    pub dead_lettered: u64,
    pub successes: u64,
    pub failures: u64,
    /// Records ever dead-lettered since the last reset.
    pub dead_letters_total: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn at(secs: i64) -> DateTime<Utc> {
        DateTime::from_timestamp(secs, 0).unwrap()
    }

    #[test]
    fn bucket_floors_to_width() {
        let width = Duration::from_secs(60);
        assert_eq!(time_bucket(at(0), width), 0);
        assert_eq!(time_bucket(at(59), width), 0);
        assert_eq!(time_bucket(at(60), width), 1);
        assert_eq!(time_bucket(at(125), width), 2);
    }

    #[test]
    fn new_record_is_due_immediately() {
        let now = at(1_000);
        let record = QueueRecord::new("https://a", serde_json::json!({"t": 1}), now, Duration::from_secs(60));
        assert_eq!(record.id, "https://a#16");
        assert_eq!(record.attempt, 0);
        assert!(record.next_attempt.is_due(now));
        assert!(!record.is_dead_lettered());
    }

    #[test]
    fn never_round_trips_through_sentinel() {
        assert_eq!(NextAttempt::from_millis(NextAttempt::Never.to_millis()), NextAttempt::Never);
        let when = NextAttempt::At(at(42));
        assert_eq!(NextAttempt::from_millis(when.to_millis()), when);
        assert!(!NextAttempt::Never.is_due(at(i32::MAX as i64)));
    }

    #[test]
    fn outcome_wire_names() {
        let json = serde_json::to_string(&Outcome::Retriable).unwrap();
        assert_eq!(json, "\"retriable\"");
        let parsed: Outcome = serde_json::from_str("\"fatal\"").unwrap();
        assert_eq!(parsed, Outcome::Fatal);
    }
}

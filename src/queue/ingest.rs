//! Coalescing ingest.
//!
//! Rapid repeats of the same source collapse into one record per time
//! bucket. The newest payload wins; arrival order and retry state of the
//! existing record are left alone.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tracing::debug;

use crate::error::{Error, QueueError};
use crate::queue::gate::{Closed, Gate};
use crate::queue::model::{QueueRecord, time_bucket};
use crate::store::Database;

/// What happened to an ingested event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IngestOutcome {
    /// Stored (new record or coalesced into an existing one).
    Queued { id: String },
    /// Dropped because the gate refused.
    Refused(Closed),
}

/// Accepts `(source_key, payload)` events from observers.
pub struct Ingest {
    store: Arc<dyn Database>,
    gate: Gate,
    bucket_width: Duration,
}

impl Ingest {
    pub fn new(store: Arc<dyn Database>, gate: Gate, bucket_width: Duration) -> Self {
        Self {
            store,
            gate,
            bucket_width,
        }
    }

    /// Store or coalesce one event. A single store write.
    pub async fn ingest(
        &self,
        source_key: &str,
        payload: serde_json::Value,
        now: DateTime<Utc>,
    ) -> Result<IngestOutcome, Error> {
        if source_key.trim().is_empty() {
            return Err(QueueError::InvalidSourceKey.into());
        }

        if let Err(closed) = self.gate.check_ingest().await {
            debug!(source_key, reason = %closed, "Ingest refused");
            return Ok(IngestOutcome::Refused(closed));
        }

        let record = QueueRecord::new(source_key, payload, now, self.bucket_width);
        self.store.upsert_coalesced(&record).await?;

        debug!(
            source_key,
            bucket = time_bucket(now, self.bucket_width),
            id = %record.id,
            "Event ingested"
        );
        Ok(IngestOutcome::Queued { id: record.id })
    }
}

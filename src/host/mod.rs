//! Worker host: the isolated execution context that processes batches.
//!
//! - `manager`: lazy creation, single-flight, idle teardown
//! - `local`: in-process host running a `BatchProcessor` on its own task
//! - `process`: subprocess host speaking newline-delimited JSON
//!
//! Hosts are fire-and-forget on submit; results arrive later through the
//! `ResultSink` the host was created with.

pub mod local;
pub mod manager;
pub mod process;

use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::HostError;
use crate::queue::model::{Outcome, QueueRecord};

pub use local::{BatchProcessor, LocalHostFactory};
pub use manager::{DispatchGuard, HostManager};
pub use process::ProcessHostFactory;

/// Outbound `ProcessBatch` request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BatchRequest {
    pub request_id: Uuid,
    pub records: Vec<QueueRecord>,
}

/// Per-record result reported by the host.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecordResult {
    pub id: String,
    pub outcome: Outcome,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl RecordResult {
    pub fn success(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            outcome: Outcome::Success,
            error: None,
        }
    }

    pub fn retriable(id: impl Into<String>, error: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            outcome: Outcome::Retriable,
            error: Some(error.into()),
        }
    }

    pub fn fatal(id: impl Into<String>, error: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            outcome: Outcome::Fatal,
            error: Some(error.into()),
        }
    }
}

/// Results for one `BatchRequest`, keyed by record id.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BatchResponse {
    pub request_id: Uuid,
    pub results: Vec<RecordResult>,
}

/// Where hosts deliver asynchronous batch results.
pub trait ResultSink: Send + Sync {
    fn deliver(&self, response: BatchResponse);
}

/// A live worker host.
#[async_trait]
pub trait WorkerHost: Send + Sync {
    /// Short name for logs.
    fn name(&self) -> &str;

    /// Hand a batch to the host. Returns once the host has accepted it.
    async fn submit(&self, request: BatchRequest) -> Result<(), HostError>;

    /// Tear the host down. Work still inside it is abandoned.
    async fn close(&self);
}

/// Creates worker hosts on demand.
#[async_trait]
pub trait HostFactory: Send + Sync {
    async fn create(&self, sink: Arc<dyn ResultSink>) -> Result<Arc<dyn WorkerHost>, HostError>;
}

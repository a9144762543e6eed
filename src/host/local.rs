//! In-process worker host.
//!
//! Runs a `BatchProcessor` on a dedicated tokio task fed through an mpsc
//! channel. Nothing is shared with the caller except the channel, so the
//! host can be torn down by dropping the sender and aborting the task.

use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::error::HostError;
use crate::host::{
    BatchRequest, BatchResponse, HostFactory, RecordResult, ResultSink, WorkerHost,
};
use crate::queue::model::QueueRecord;

/// Requests buffered inside one host before `submit` waits.
const REQUEST_BUFFER: usize = 16;

/// The actual processing logic run inside the host.
#[async_trait]
pub trait BatchProcessor: Send + Sync {
    /// Process a batch, returning one result per record id.
    async fn process(&self, records: Vec<QueueRecord>) -> Vec<RecordResult>;
}

/// Builds `LocalHost`s around a shared processor.
pub struct LocalHostFactory {
    processor: Arc<dyn BatchProcessor>,
}

impl LocalHostFactory {
    pub fn new(processor: Arc<dyn BatchProcessor>) -> Self {
        Self { processor }
    }
}

#[async_trait]
impl HostFactory for LocalHostFactory {
    async fn create(&self, sink: Arc<dyn ResultSink>) -> Result<Arc<dyn WorkerHost>, HostError> {
        Ok(Arc::new(LocalHost::spawn(Arc::clone(&self.processor), sink)))
    }
}

/// A worker host living on its own tokio task.
pub struct LocalHost {
    tx: Mutex<Option<mpsc::Sender<BatchRequest>>>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl LocalHost {
    pub fn spawn(processor: Arc<dyn BatchProcessor>, sink: Arc<dyn ResultSink>) -> Self {
        let (tx, mut rx) = mpsc::channel::<BatchRequest>(REQUEST_BUFFER);

        let task = tokio::spawn(async move {
            while let Some(request) = rx.recv().await {
                debug!(
                    request_id = %request.request_id,
                    records = request.records.len(),
                    "Local host processing batch"
                );
                let results = processor.process(request.records).await;
                sink.deliver(BatchResponse {
                    request_id: request.request_id,
                    results,
                });
            }
        });

        Self {
            tx: Mutex::new(Some(tx)),
            task: Mutex::new(Some(task)),
        }
    }

    fn sender(&self) -> Option<mpsc::Sender<BatchRequest>> {
        self.tx
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }
}

#[async_trait]
impl WorkerHost for LocalHost {
    fn name(&self) -> &str {
        "local"
    }

    async fn submit(&self, request: BatchRequest) -> Result<(), HostError> {
        let tx = self.sender().ok_or(HostError::Closed)?;
        tx.send(request).await.map_err(|_| HostError::Unreachable {
            reason: "local host task has stopped".to_string(),
        })
    }

    async fn close(&self) {
        self.tx
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take();
        let task = self
            .task
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take();
        if let Some(task) = task {
            task.abort();
            if let Err(e) = task.await
                && e.is_panic()
            {
                warn!("Local host task panicked: {}", e);
            }
        }
    }
}

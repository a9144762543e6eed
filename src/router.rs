//! Message router.
//!
//! The single entry point for inbound events. One task drains the inbox in
//! order, so state changes made through the router are serialized.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::error::{QueueError, Result};
use crate::host::{BatchResponse, ResultSink};
use crate::processor::Processor;
use crate::queue::model::{QueueRecord, QueueStats};
use crate::queue::{Gate, Ingest, IngestOutcome};
use crate::store::Database;

fn default_dead_letter_limit() -> usize {
    50
}

/// Inbound messages.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Message {
    Enqueue {
        source_key: String,
        payload: serde_json::Value,
        /// Observation time; defaults to the time the router handles it.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        timestamp: Option<DateTime<Utc>>,
    },
    TogglePause {
        paused: bool,
    },
    ClearQueue,
    GetStats,
    ReadinessAchieved,
    /// Asynchronous batch result from the worker host.
    WorkerResult(BatchResponse),
    ListDeadLetters {
        #[serde(default = "default_dead_letter_limit")]
        limit: usize,
    },
}

/// Replies to inbound messages.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Reply {
    Ack,
    Enqueued { id: String },
    /// The message was valid but had no effect (gate closed).
    Ignored { reason: String },
    Cleared { removed: usize },
    Stats(QueueStats),
    DeadLetters { records: Vec<QueueRecord> },
    Error { message: String },
}

pub struct Router {
    store: Arc<dyn Database>,
    gate: Gate,
    ingest: Ingest,
    processor: Arc<Processor>,
}

impl Router {
    pub fn new(
        store: Arc<dyn Database>,
        gate: Gate,
        ingest: Ingest,
        processor: Arc<Processor>,
    ) -> Self {
        Self {
            store,
            gate,
            ingest,
            processor,
        }
    }

    /// Handle one message.
    pub async fn handle(&self, message: Message) -> Result<Reply> {
        match message {
            Message::Enqueue {
                source_key,
                payload,
                timestamp,
            } => {
                let now = timestamp.unwrap_or_else(Utc::now);
                match self.ingest.ingest(&source_key, payload, now).await? {
                    IngestOutcome::Queued { id } => Ok(Reply::Enqueued { id }),
                    IngestOutcome::Refused(closed) => Ok(Reply::Ignored {
                        reason: closed.to_string(),
                    }),
                }
            }
            Message::TogglePause { paused } => {
                // In-flight ticks are not cancelled; the next one sees the flag
                self.gate.set_paused(paused).await?;
                Ok(Reply::Ack)
            }
            Message::ClearQueue => {
                let removed = self.store.clear_records().await?;
                self.store.reset_stats().await?;
                info!(removed, "Queue cleared");
                Ok(Reply::Cleared { removed })
            }
            Message::GetStats => Ok(Reply::Stats(self.store.stats().await?)),
            Message::ReadinessAchieved => {
                // Takes effect on the next scheduled tick
                self.gate.mark_ready().await?;
                Ok(Reply::Ack)
            }
            Message::WorkerResult(response) => {
                self.processor.deliver(response);
                Ok(Reply::Ack)
            }
            Message::ListDeadLetters { limit } => Ok(Reply::DeadLetters {
                records: self.store.dead_letters(limit).await?,
            }),
        }
    }
}

struct Envelope {
    message: Message,
    reply: Option<oneshot::Sender<Result<Reply>>>,
}

/// Cloneable sender side of the router inbox.
#[derive(Clone)]
pub struct RouterHandle {
    tx: mpsc::UnboundedSender<Envelope>,
}

/// Receiver side, consumed by [`spawn_router`].
pub struct RouterInbox {
    rx: mpsc::UnboundedReceiver<Envelope>,
}

impl RouterHandle {
    /// Create the inbox before the router exists, so the handle can be
    /// given to components the router itself depends on.
    pub fn channel() -> (RouterHandle, RouterInbox) {
        let (tx, rx) = mpsc::unbounded_channel();
        (RouterHandle { tx }, RouterInbox { rx })
    }

    /// Send a message and wait for its reply.
    pub async fn request(&self, message: Message) -> Result<Reply> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.tx
            .send(Envelope {
                message,
                reply: Some(reply_tx),
            })
            .map_err(|_| QueueError::RouterClosed)?;
        reply_rx.await.map_err(|_| QueueError::RouterClosed)?
    }

    /// Send a message without waiting.
    pub fn post(&self, message: Message) -> Result<()> {
        self.tx
            .send(Envelope {
                message,
                reply: None,
            })
            .map_err(|_| QueueError::RouterClosed.into())
    }
}

impl ResultSink for RouterHandle {
    fn deliver(&self, response: BatchResponse) {
        let request_id = response.request_id;
        if self.post(Message::WorkerResult(response)).is_err() {
            warn!(%request_id, "Router closed, dropping worker result");
        }
    }
}

/// Spawn the router task. It runs until every handle is dropped.
pub fn spawn_router(router: Router, mut inbox: RouterInbox) -> JoinHandle<()> {
    tokio::spawn(async move {
        info!("Message router started");
        while let Some(envelope) = inbox.rx.recv().await {
            let result = router.handle(envelope.message).await;
            match envelope.reply {
                Some(reply) => {
                    if reply.send(result).is_err() {
                        debug!("Requester went away before the reply");
                    }
                }
                None => {
                    if let Err(e) = result {
                        warn!("Posted message failed: {}", e);
                    }
                }
            }
        }
        info!("Message router stopped");
    })
}

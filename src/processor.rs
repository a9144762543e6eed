//! Processing loop: the tick handler.
//!
//! One tick: guard against overlap, check the gate, pull a FIFO batch of due
//! records, hand it to the worker host, and fold the results back into the
//! store through the retry engine. Every failure below the tick boundary is
//! turned into record-level state; nothing propagates to the scheduler
//! except store failures while selecting a batch.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::oneshot;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::config::QueueConfig;
use crate::error::{Error, HostError};
use crate::host::{BatchRequest, BatchResponse, HostManager};
use crate::queue::backoff::{RetryPolicy, Transition};
use crate::queue::gate::{Closed, Gate};
use crate::queue::model::{Outcome, QueueRecord};
use crate::scheduler::TickHandler;
use crate::store::Database;

/// Tells the processor whether the system is otherwise idle.
pub trait IdleProbe: Send + Sync {
    fn is_idle(&self) -> bool;
}

impl IdleProbe for AtomicBool {
    fn is_idle(&self) -> bool {
        self.load(Ordering::Relaxed)
    }
}

/// Default probe: never idle, always the normal batch size.
pub struct NeverIdle;

impl IdleProbe for NeverIdle {
    fn is_idle(&self) -> bool {
        false
    }
}

/// Why a tick did no work.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipReason {
    /// Another tick is still running.
    InFlight,
    Gate(Closed),
    /// Nothing was due.
    Empty,
}

/// Summary of one tick.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TickReport {
    pub batches: usize,
    pub dispatched: usize,
    pub succeeded: usize,
    pub retried: usize,
    pub dead_lettered: usize,
    pub skipped: Option<SkipReason>,
    /// Stopped because the local orchestration budget ran out.
    pub budget_exhausted: bool,
}

impl TickReport {
    fn skipped(reason: SkipReason) -> Self {
        Self {
            skipped: Some(reason),
            ..Default::default()
        }
    }
}

/// Clears the in-flight flag when the tick ends, however it ends.
struct InFlightGuard<'a>(&'a AtomicBool);

impl<'a> InFlightGuard<'a> {
    fn acquire(flag: &'a AtomicBool) -> Option<Self> {
        flag.compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| Self(flag))
    }
}

impl Drop for InFlightGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

/// The tick handler.
pub struct Processor {
    store: Arc<dyn Database>,
    gate: Gate,
    policy: RetryPolicy,
    hosts: HostManager,
    idle: Arc<dyn IdleProbe>,
    batch_size: usize,
    idle_batch_size: usize,
    tick_budget: Duration,
    dispatch_timeout: Duration,
    max_batches_per_tick: usize,
    in_flight: AtomicBool,
    /// Result slots for dispatched batches, keyed by request id.
    pending: Mutex<HashMap<Uuid, oneshot::Sender<BatchResponse>>>,
}

impl Processor {
    pub fn new(
        store: Arc<dyn Database>,
        gate: Gate,
        policy: RetryPolicy,
        hosts: HostManager,
        config: &QueueConfig,
    ) -> Self {
        Self {
            store,
            gate,
            policy,
            hosts,
            idle: Arc::new(NeverIdle),
            batch_size: config.batch_size,
            idle_batch_size: config.idle_batch_size,
            tick_budget: config.tick_budget,
            dispatch_timeout: config.dispatch_timeout,
            max_batches_per_tick: config.max_batches_per_tick.max(1),
            in_flight: AtomicBool::new(false),
            pending: Mutex::new(HashMap::new()),
        }
    }

    /// Use a caller-supplied idle signal for batch sizing.
    pub fn with_idle_probe(mut self, idle: Arc<dyn IdleProbe>) -> Self {
        self.idle = idle;
        self
    }

    pub fn hosts(&self) -> &HostManager {
        &self.hosts
    }

    pub fn is_in_flight(&self) -> bool {
        self.in_flight.load(Ordering::Acquire)
    }

    fn current_batch_size(&self) -> usize {
        if self.idle.is_idle() {
            self.idle_batch_size
        } else {
            self.batch_size
        }
    }

    fn pending_slots(&self) -> MutexGuard<'_, HashMap<Uuid, oneshot::Sender<BatchResponse>>> {
        self.pending
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Run one tick at `now`.
    pub async fn run_tick(&self, now: DateTime<Utc>) -> Result<TickReport, Error> {
        let Some(_in_flight) = InFlightGuard::acquire(&self.in_flight) else {
            debug!("Tick skipped: previous tick still in flight");
            return Ok(TickReport::skipped(SkipReason::InFlight));
        };

        if let Err(closed) = self.gate.check_processing().await {
            debug!(reason = %closed, "Tick skipped by gate");
            return Ok(TickReport::skipped(SkipReason::Gate(closed)));
        }

        let mut report = TickReport::default();
        let mut local = Duration::ZERO;
        let mut dispatched_ids: HashSet<String> = HashSet::new();

        loop {
            if report.batches >= self.max_batches_per_tick {
                break;
            }
            if local >= self.tick_budget {
                report.budget_exhausted = true;
                info!(
                    elapsed_ms = local.as_millis() as u64,
                    batches = report.batches,
                    "Tick budget exhausted, deferring to next tick"
                );
                break;
            }

            let started = Instant::now();
            let limit = self.current_batch_size();
            let batch = self.store.due_records(now, limit).await?;
            if batch.is_empty() {
                if report.batches == 0 {
                    report.skipped = Some(SkipReason::Empty);
                }
                break;
            }
            // Records still due after being sent once this tick (a result
            // that could not be written, or a coalesce mid-flight) wait for
            // the next tick instead of being sent again.
            if batch.iter().any(|r| dispatched_ids.contains(&r.id)) {
                debug!(batches = report.batches, "Due records already dispatched this tick");
                break;
            }
            dispatched_ids.extend(batch.iter().map(|r| r.id.clone()));
            let full = batch.len() >= limit;
            local += started.elapsed();

            let response = self.dispatch(&batch).await;

            let started = Instant::now();
            report.batches += 1;
            report.dispatched += batch.len();
            self.apply(&batch, response, now, &mut report).await;
            local += started.elapsed();

            if !full {
                break;
            }
        }

        if report.dispatched > 0 {
            info!(
                batches = report.batches,
                dispatched = report.dispatched,
                succeeded = report.succeeded,
                retried = report.retried,
                dead_lettered = report.dead_lettered,
                "Tick complete"
            );
        }
        Ok(report)
    }

    /// Send a batch to the worker host and wait for its `WorkerResult`.
    async fn dispatch(&self, batch: &[QueueRecord]) -> Result<BatchResponse, HostError> {
        let request_id = Uuid::new_v4();
        let (tx, rx) = oneshot::channel();
        self.pending_slots().insert(request_id, tx);

        let result = self.submit_and_wait(request_id, batch, rx).await;
        self.pending_slots().remove(&request_id);
        result
    }

    async fn submit_and_wait(
        &self,
        request_id: Uuid,
        batch: &[QueueRecord],
        rx: oneshot::Receiver<BatchResponse>,
    ) -> Result<BatchResponse, HostError> {
        let guard = self.hosts.begin_dispatch().await?;
        let request = BatchRequest {
            request_id,
            records: batch.to_vec(),
        };
        if let Err(e) = guard.host().submit(request).await {
            self.hosts.discard(guard.host()).await;
            return Err(e);
        }
        debug!(%request_id, records = batch.len(), "Batch dispatched");

        match tokio::time::timeout(self.dispatch_timeout, rx).await {
            Ok(Ok(response)) => Ok(response),
            Ok(Err(_)) => Err(HostError::Unreachable {
                reason: "result slot dropped".to_string(),
            }),
            Err(_) => Err(HostError::Timeout {
                request_id,
                timeout: self.dispatch_timeout,
            }),
        }
    }

    /// Route an asynchronous batch result to the tick waiting for it.
    pub fn deliver(&self, response: BatchResponse) {
        let slot = self.pending_slots().remove(&response.request_id);
        match slot {
            Some(tx) => {
                if tx.send(response).is_err() {
                    debug!("Batch result arrived after its tick gave up");
                }
            }
            None => warn!(
                request_id = %response.request_id,
                "Dropping result for unknown batch"
            ),
        }
    }

    async fn apply(
        &self,
        batch: &[QueueRecord],
        response: Result<BatchResponse, HostError>,
        now: DateTime<Utc>,
        report: &mut TickReport,
    ) {
        let mut outcomes: HashMap<String, (Outcome, Option<String>)> = HashMap::new();
        match response {
            Ok(response) => {
                for result in response.results {
                    if batch.iter().any(|r| r.id == result.id) {
                        outcomes.insert(result.id, (result.outcome, result.error));
                    } else {
                        warn!(id = %result.id, "Host reported a record outside the batch");
                    }
                }
            }
            Err(e) => {
                warn!(records = batch.len(), "Dispatch failed, retrying whole batch: {}", e);
            }
        }

        for record in batch {
            let (outcome, reason) = outcomes
                .remove(&record.id)
                .unwrap_or((Outcome::Retriable, Some("no result".to_string())));

            let applied = match outcome {
                Outcome::Success => self.mark_success(record).await,
                Outcome::Retriable => {
                    let transition = self.policy.mark_failure(record, now);
                    self.mark_failed(record, transition, reason.as_deref()).await
                }
                Outcome::Fatal => {
                    let transition = self.policy.dead_letter(record);
                    self.mark_failed(record, transition, reason.as_deref()).await
                }
            };

            match applied {
                Ok(Applied::Succeeded) => report.succeeded += 1,
                Ok(Applied::Retried) => report.retried += 1,
                Ok(Applied::DeadLettered) => report.dead_lettered += 1,
                Ok(Applied::Vanished) => {}
                Err(e) => error!(id = %record.id, "Failed to apply {} result: {}", outcome, e),
            }
        }
    }

    async fn mark_success(&self, record: &QueueRecord) -> Result<Applied, Error> {
        let deleted = self.store.complete_record(&record.id, record.revision).await?;
        if !deleted {
            debug!(id = %record.id, "Record coalesced during processing, kept for next tick");
        }
        self.store.record_success().await?;
        Ok(Applied::Succeeded)
    }

    async fn mark_failed(
        &self,
        record: &QueueRecord,
        transition: Transition,
        reason: Option<&str>,
    ) -> Result<Applied, Error> {
        if !self.store.reschedule_record(&record.id, &transition).await? {
            debug!(id = %record.id, "Record removed before its failure could be applied");
            return Ok(Applied::Vanished);
        }
        self.store.record_failure().await?;

        if transition.is_dead_letter() {
            self.store.record_dead_letter().await?;
            error!(
                id = %record.id,
                attempt = transition.attempt(),
                reason = reason.unwrap_or(""),
                "Record dead-lettered"
            );
            Ok(Applied::DeadLettered)
        } else {
            warn!(
                id = %record.id,
                attempt = transition.attempt(),
                reason = reason.unwrap_or(""),
                "Record failed, scheduled for retry"
            );
            Ok(Applied::Retried)
        }
    }
}

enum Applied {
    Succeeded,
    Retried,
    DeadLettered,
    Vanished,
}

#[async_trait]
impl TickHandler for Processor {
    async fn on_tick(&self, now: DateTime<Utc>) -> Result<(), Error> {
        self.run_tick(now).await.map(|_| ())
    }
}

//! Durable queue core: record model, coalescing ingest, retry engine and gates.
//!
//! - `model`: `QueueRecord`, `NextAttempt`, stats
//! - `ingest`: coalesces bursts of events into one record per time bucket
//! - `backoff`: retry/backoff engine, the only source of reschedule transitions
//! - `gate`: readiness and pause predicates

pub mod backoff;
pub mod gate;
pub mod ingest;
pub mod model;

pub use backoff::{RetryPolicy, Transition};
pub use gate::Gate;
pub use ingest::{Ingest, IngestOutcome};
pub use model::{NextAttempt, Outcome, QueueRecord, QueueStats};

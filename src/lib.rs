//! Embed queue: durable, coalescing work queue for "page seen" events.
//!
//! Events are coalesced per source and time bucket into a libSQL-backed
//! queue, drained by a periodic tick into an ephemeral worker host, and
//! retried with exponential backoff until they succeed or dead-letter.

pub mod config;
pub mod error;
pub mod host;
pub mod processor;
pub mod queue;
pub mod router;
pub mod runtime;
pub mod scheduler;
pub mod store;

//! Error types for the embed queue.

use std::time::Duration;

/// Top-level error type for the queue core.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Database error: {0}")]
    Database(#[from] DatabaseError),

    #[error("Worker host error: {0}")]
    Host(#[from] HostError),

    #[error("Queue error: {0}")]
    Queue(#[from] QueueError),
}

/// Configuration-related errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Missing required environment variable: {0}")]
    MissingEnvVar(String),

    #[error("Invalid configuration value for {key}: {message}")]
    InvalidValue { key: String, message: String },
}

/// Database-related errors.
#[derive(Debug, thiserror::Error)]
pub enum DatabaseError {
    #[error("Connection pool error: {0}")]
    Pool(String),

    #[error("Query failed: {0}")]
    Query(String),

    #[error("Migration failed: {0}")]
    Migration(String),

    #[error("Serialization error: {0}")]
    Serialization(String),
}

/// Worker host errors. Every variant is treated as a retriable batch failure.
#[derive(Debug, thiserror::Error)]
pub enum HostError {
    #[error("Worker host failed to start: {reason}")]
    StartupFailed { reason: String },

    #[error("Worker host unreachable: {reason}")]
    Unreachable { reason: String },

    #[error("Batch serialization failed: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Batch {request_id} timed out after {timeout:?}")]
    Timeout {
        request_id: uuid::Uuid,
        timeout: Duration,
    },

    #[error("Worker host is closed")]
    Closed,
}

/// Queue contract violations.
#[derive(Debug, thiserror::Error)]
pub enum QueueError {
    #[error("Source key must not be empty")]
    InvalidSourceKey,

    #[error("Router is not running")]
    RouterClosed,
}

/// Result type alias for the queue core.
pub type Result<T> = std::result::Result<T, Error>;

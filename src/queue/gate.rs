//! Readiness and pause gate.
//!
//! Both flags live in the `settings` collection and are read fresh on every
//! check. A store failure closes the gate.

use std::sync::Arc;

use tracing::{info, warn};

use crate::error::DatabaseError;
use crate::store::Database;

pub const READY_KEY: &str = "ready";
pub const PAUSED_KEY: &str = "paused";

/// Why a gate refused.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Closed {
    Paused,
    NotReady,
    StoreUnavailable,
}

impl std::fmt::Display for Closed {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Paused => write!(f, "paused"),
            Self::NotReady => write!(f, "not_ready"),
            Self::StoreUnavailable => write!(f, "store_unavailable"),
        }
    }
}

/// Boolean preconditions consulted before any enqueue or dequeue.
#[derive(Clone)]
pub struct Gate {
    store: Arc<dyn Database>,
}

impl Gate {
    pub fn new(store: Arc<dyn Database>) -> Self {
        Self { store }
    }

    async fn flag(&self, key: &str) -> Result<bool, DatabaseError> {
        let value = self.store.get_setting(key).await?;
        Ok(value.and_then(|v| v.as_bool()).unwrap_or(false))
    }

    pub async fn is_paused(&self) -> Result<bool, DatabaseError> {
        self.flag(PAUSED_KEY).await
    }

    pub async fn is_ready(&self) -> Result<bool, DatabaseError> {
        self.flag(READY_KEY).await
    }

    /// Ingest is refused only while paused.
    pub async fn check_ingest(&self) -> Result<(), Closed> {
        match self.is_paused().await {
            Ok(false) => Ok(()),
            Ok(true) => Err(Closed::Paused),
            Err(e) => {
                warn!("Gate check failed, refusing ingest: {}", e);
                Err(Closed::StoreUnavailable)
            }
        }
    }

    /// Processing needs both "not paused" and "ready".
    pub async fn check_processing(&self) -> Result<(), Closed> {
        let paused = self.is_paused().await;
        let ready = self.is_ready().await;
        match (paused, ready) {
            (Ok(true), _) => Err(Closed::Paused),
            (Ok(false), Ok(true)) => Ok(()),
            (Ok(false), Ok(false)) => Err(Closed::NotReady),
            (Err(e), _) | (_, Err(e)) => {
                warn!("Gate check failed, skipping processing: {}", e);
                Err(Closed::StoreUnavailable)
            }
        }
    }

    pub async fn set_paused(&self, paused: bool) -> Result<(), DatabaseError> {
        self.store
            .set_setting(PAUSED_KEY, &serde_json::Value::Bool(paused))
            .await?;
        info!(paused, "Queue pause toggled");
        Ok(())
    }

    /// One-way: readiness is never revoked by the queue itself.
    pub async fn mark_ready(&self) -> Result<(), DatabaseError> {
        self.store
            .set_setting(READY_KEY, &serde_json::Value::Bool(true))
            .await?;
        info!("Processing dependency ready");
        Ok(())
    }
}

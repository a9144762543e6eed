//! Retry/backoff engine.
//!
//! The only code allowed to decide a record's `attempt` and `next_attempt`.
//! The store accepts a [`Transition`] produced here and nothing else.

use std::time::Duration;

use chrono::{DateTime, Utc};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use crate::config::QueueConfig;
use crate::queue::model::{NextAttempt, QueueRecord};

const JITTER_MIN: f64 = 0.5;
const JITTER_MAX: f64 = 1.5;

/// Exponent cap; 2^62 times any base already exceeds every sane maximum.
const MAX_EXPONENT: u32 = 62;

/// 64-bit FNV-1a. Unlike `DefaultHasher` its output is fixed by definition.
fn fnv1a(bytes: &[u8]) -> u64 {
    const OFFSET: u64 = 0xcbf2_9ce4_8422_2325;
    const PRIME: u64 = 0x0000_0100_0000_01b3;
    bytes
        .iter()
        .fold(OFFSET, |hash, b| (hash ^ u64::from(*b)).wrapping_mul(PRIME))
}

/// New retry state for a record after a failed attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Transition {
    attempt: u32,
    next_attempt: NextAttempt,
}

impl Transition {
    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    pub fn next_attempt(&self) -> NextAttempt {
        self.next_attempt
    }

    pub fn is_dead_letter(&self) -> bool {
        self.next_attempt.is_never()
    }
}

/// Exponential backoff with per-record jitter and a dead-letter threshold.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    base: Duration,
    max_backoff: Duration,
    max_attempts: u32,
    seed: u64,
}

impl RetryPolicy {
    pub fn new(base: Duration, max_backoff: Duration, max_attempts: u32, seed: u64) -> Self {
        Self {
            base,
            max_backoff,
            max_attempts,
            seed,
        }
    }

    /// Build from config; an unset seed is drawn once here.
    pub fn from_config(config: &QueueConfig) -> Self {
        let seed = config.jitter_seed.unwrap_or_else(rand::random);
        Self::new(
            config.backoff_base,
            config.backoff_max,
            config.max_attempts,
            seed,
        )
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    /// `min(base * 2^attempt * jitter, max_backoff)`.
    ///
    /// `jitter` is clamped to `[0.5, 1.5]`. For a fixed jitter the result is
    /// non-decreasing in `attempt`.
    pub fn compute_backoff(&self, attempt: u32, jitter: f64) -> Duration {
        let jitter = if jitter.is_nan() {
            1.0
        } else {
            jitter.clamp(JITTER_MIN, JITTER_MAX)
        };
        let factor = 2f64.powi(attempt.min(MAX_EXPONENT) as i32);
        let secs = self.base.as_secs_f64() * factor * jitter;
        let capped = secs.min(self.max_backoff.as_secs_f64());
        Duration::from_secs_f64(capped)
    }

    /// Jitter for a record. Fixed for a given seed and id, across restarts
    /// and rebuilds.
    pub fn jitter_for(&self, record_id: &str) -> f64 {
        let mut rng = StdRng::seed_from_u64(self.seed ^ fnv1a(record_id.as_bytes()));
        rng.gen_range(JITTER_MIN..=JITTER_MAX)
    }

    /// Backoff the record would get for `attempt`.
    pub fn backoff_for(&self, record_id: &str, attempt: u32) -> Duration {
        self.compute_backoff(attempt, self.jitter_for(record_id))
    }

    /// Count a failed attempt. Dead-letters once the budget is spent.
    pub fn mark_failure(&self, record: &QueueRecord, now: DateTime<Utc>) -> Transition {
        let attempt = record.attempt.saturating_add(1);
        if attempt >= self.max_attempts {
            return Transition {
                attempt,
                next_attempt: NextAttempt::Never,
            };
        }

        let delay = self.backoff_for(&record.id, attempt);
        let next_attempt = chrono::Duration::from_std(delay)
            .ok()
            .and_then(|delta| now.checked_add_signed(delta))
            .map(NextAttempt::At)
            .unwrap_or(NextAttempt::Never);

        Transition {
            attempt,
            next_attempt,
        }
    }

    /// Terminal failure that does not consume an attempt.
    pub fn dead_letter(&self, record: &QueueRecord) -> Transition {
        Transition {
            attempt: record.attempt,
            next_attempt: NextAttempt::Never,
        }
    }
}

//! Durable periodic alarm and the tick driver that fires it.
//!
//! The alarm lives in the settings table under `alarm:<name>` so a restart
//! finds it already armed. A missed fire time (process was down) fires once
//! immediately and then resumes the normal cadence.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::error::{DatabaseError, Error};
use crate::store::Database;

/// Something the scheduler invokes on every alarm.
#[async_trait]
pub trait TickHandler: Send + Sync {
    async fn on_tick(&self, now: DateTime<Utc>) -> Result<(), Error>;
}

/// Persisted alarm state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Alarm {
    pub period_ms: i64,
    pub next_fire_at_ms: i64,
}

impl Alarm {
    pub fn next_fire_at(&self) -> DateTime<Utc> {
        DateTime::from_timestamp_millis(self.next_fire_at_ms).unwrap_or(DateTime::<Utc>::MAX_UTC)
    }
}

/// Result of [`Scheduler::ensure_armed`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Armed {
    /// A matching alarm was already registered and was left untouched.
    Existing(Alarm),
    Created(Alarm),
}

impl Armed {
    pub fn alarm(&self) -> Alarm {
        match self {
            Armed::Existing(a) | Armed::Created(a) => *a,
        }
    }
}

pub struct Scheduler {
    store: Arc<dyn Database>,
    name: String,
    period: Duration,
}

impl Scheduler {
    pub fn new(store: Arc<dyn Database>, name: impl Into<String>, period: Duration) -> Self {
        Self {
            store,
            name: name.into(),
            period,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn period(&self) -> Duration {
        self.period
    }

    fn key(&self) -> String {
        format!("alarm:{}", self.name)
    }

    fn alarm_after(&self, now: DateTime<Utc>) -> Alarm {
        let period_ms = self.period.as_millis().min(i64::MAX as u128) as i64;
        Alarm {
            period_ms,
            next_fire_at_ms: now.timestamp_millis().saturating_add(period_ms),
        }
    }

    /// Load the persisted alarm. A malformed value reads as absent.
    pub async fn load(&self) -> Result<Option<Alarm>, DatabaseError> {
        let Some(value) = self.store.get_setting(&self.key()).await? else {
            return Ok(None);
        };
        match serde_json::from_value(value) {
            Ok(alarm) => Ok(Some(alarm)),
            Err(e) => {
                warn!(alarm = %self.name, "Ignoring malformed alarm state: {}", e);
                Ok(None)
            }
        }
    }

    async fn save(&self, alarm: &Alarm) -> Result<(), DatabaseError> {
        let value =
            serde_json::to_value(alarm).map_err(|e| DatabaseError::Serialization(e.to_string()))?;
        self.store.set_setting(&self.key(), &value).await
    }

    /// Register the alarm unless one with the same period is already
    /// registered.
    pub async fn ensure_armed(&self, now: DateTime<Utc>) -> Result<Armed, DatabaseError> {
        let alarm = self.alarm_after(now);
        if let Some(existing) = self.load().await? {
            if existing.period_ms == alarm.period_ms {
                return Ok(Armed::Existing(existing));
            }
            info!(
                alarm = %self.name,
                old_period_ms = existing.period_ms,
                "Alarm period changed, re-registering"
            );
        }
        self.save(&alarm).await?;
        info!(
            alarm = %self.name,
            period_ms = alarm.period_ms,
            "Periodic alarm registered"
        );
        Ok(Armed::Created(alarm))
    }

    /// Push the next fire time one period past `now`.
    pub async fn rearm(&self, now: DateTime<Utc>) -> Result<Alarm, DatabaseError> {
        let alarm = self.alarm_after(now);
        self.save(&alarm).await?;
        Ok(alarm)
    }
}

/// Spawn the background task that sleeps until each fire time and invokes
/// the handler.
///
/// The alarm is re-armed before the handler runs, so a crash mid-tick still
/// leaves the next fire persisted. Handler errors and panics are logged and
/// the driver keeps going. If the store is unreachable the driver keeps an
/// in-memory cadence until it recovers.
pub fn spawn_tick_driver(
    scheduler: Arc<Scheduler>,
    handler: Arc<dyn TickHandler>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        info!(
            alarm = %scheduler.name(),
            period_ms = scheduler.period().as_millis() as u64,
            "Tick driver started"
        );
        let period = chrono::Duration::milliseconds(scheduler.alarm_after(Utc::now()).period_ms);
        let mut fallback: Option<DateTime<Utc>> = None;

        loop {
            let now = Utc::now();
            // A failed re-arm leaves a stale fire time in the store; the
            // in-memory deadline holds until a write succeeds again.
            let fire_at = match scheduler.ensure_armed(now).await {
                Ok(armed) => {
                    let persisted = armed.alarm().next_fire_at();
                    fallback.map_or(persisted, |deadline| persisted.max(deadline))
                }
                Err(e) => {
                    error!(alarm = %scheduler.name(), "Alarm store unavailable: {}", e);
                    *fallback.get_or_insert(now + period)
                }
            };

            let wait = (fire_at - now).to_std().unwrap_or(Duration::ZERO);
            tokio::time::sleep(wait).await;

            let now = Utc::now();
            match scheduler.rearm(now).await {
                Ok(_) => fallback = None,
                Err(e) => {
                    warn!(alarm = %scheduler.name(), "Failed to re-arm alarm: {}", e);
                    fallback = Some(now + period);
                }
            }

            debug!(alarm = %scheduler.name(), "Alarm fired");
            let handler = Arc::clone(&handler);
            match tokio::spawn(async move { handler.on_tick(now).await }).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => error!(alarm = %scheduler.name(), "Tick failed: {}", e),
                Err(e) => error!(alarm = %scheduler.name(), "Tick task aborted: {}", e),
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;
    use crate::store::LibSqlBackend;
    use crate::store::faulty::FaultyStore;

    async fn store() -> Arc<dyn Database> {
        Arc::new(LibSqlBackend::new_memory().await.unwrap())
    }

    fn at(ms: i64) -> DateTime<Utc> {
        DateTime::from_timestamp_millis(ms).unwrap()
    }

    #[tokio::test]
    async fn ensure_armed_registers_once() {
        let scheduler = Scheduler::new(store().await, "embed", Duration::from_secs(60));

        let first = scheduler.ensure_armed(at(1_000)).await.unwrap();
        assert_eq!(
            first,
            Armed::Created(Alarm {
                period_ms: 60_000,
                next_fire_at_ms: 61_000
            })
        );

        let second = scheduler.ensure_armed(at(5_000)).await.unwrap();
        assert_eq!(second, Armed::Existing(first.alarm()));
    }

    #[tokio::test]
    async fn alarm_survives_restart() {
        let db = store().await;
        let before = Scheduler::new(Arc::clone(&db), "embed", Duration::from_secs(60));
        before.ensure_armed(at(0)).await.unwrap();
        before.rearm(at(120_000)).await.unwrap();

        let after = Scheduler::new(db, "embed", Duration::from_secs(60));
        match after.ensure_armed(at(130_000)).await.unwrap() {
            Armed::Existing(alarm) => assert_eq!(alarm.next_fire_at_ms, 180_000),
            other => panic!("expected existing alarm, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn alarms_are_namespaced() {
        let db = store().await;
        let a = Scheduler::new(Arc::clone(&db), "a", Duration::from_secs(1));
        let b = Scheduler::new(db, "b", Duration::from_secs(1));

        assert!(matches!(a.ensure_armed(at(0)).await.unwrap(), Armed::Created(_)));
        assert!(matches!(b.ensure_armed(at(0)).await.unwrap(), Armed::Created(_)));
    }

    #[tokio::test]
    async fn period_change_rewrites_alarm() {
        let db = store().await;
        Scheduler::new(Arc::clone(&db), "embed", Duration::from_secs(60))
            .ensure_armed(at(0))
            .await
            .unwrap();

        let faster = Scheduler::new(db, "embed", Duration::from_secs(10));
        assert_eq!(
            faster.ensure_armed(at(1_000)).await.unwrap(),
            Armed::Created(Alarm {
                period_ms: 10_000,
                next_fire_at_ms: 11_000
            })
        );
    }

    #[tokio::test]
    async fn malformed_alarm_is_replaced() {
        let db = store().await;
        db.set_setting("alarm:embed", &serde_json::json!("garbage"))
            .await
            .unwrap();

        let scheduler = Scheduler::new(db, "embed", Duration::from_secs(60));
        assert!(matches!(
            scheduler.ensure_armed(at(0)).await.unwrap(),
            Armed::Created(_)
        ));
    }

    struct Counting {
        ticks: AtomicUsize,
        fail: bool,
    }

    #[async_trait]
    impl TickHandler for Counting {
        async fn on_tick(&self, _now: DateTime<Utc>) -> Result<(), Error> {
            self.ticks.fetch_add(1, Ordering::SeqCst);
            if self.fail {
                return Err(crate::error::QueueError::RouterClosed.into());
            }
            Ok(())
        }
    }

    #[tokio::test]
    async fn driver_fires_repeatedly_and_survives_errors() {
        let scheduler = Arc::new(Scheduler::new(store().await, "embed", Duration::from_millis(30)));
        let handler = Arc::new(Counting {
            ticks: AtomicUsize::new(0),
            fail: true,
        });

        let driver = spawn_tick_driver(Arc::clone(&scheduler), handler.clone());
        tokio::time::sleep(Duration::from_millis(250)).await;
        driver.abort();

        assert!(handler.ticks.load(Ordering::SeqCst) >= 3);
        let alarm = scheduler.load().await.unwrap().unwrap();
        assert_eq!(alarm.period_ms, 30);
    }

    #[tokio::test]
    async fn failed_rearm_keeps_normal_cadence() {
        let db = Arc::new(FaultyStore::new().await);
        let scheduler = Arc::new(Scheduler::new(
            db.clone(),
            "embed",
            Duration::from_secs(60),
        ));
        // Overdue alarm that can be read but never rewritten
        scheduler.rearm(at(0)).await.unwrap();
        db.fail_setting_writes.store(true, Ordering::SeqCst);

        let handler = Arc::new(Counting {
            ticks: AtomicUsize::new(0),
            fail: false,
        });
        let driver = spawn_tick_driver(Arc::clone(&scheduler), handler.clone());
        tokio::time::sleep(Duration::from_millis(300)).await;
        driver.abort();

        assert_eq!(handler.ticks.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn overdue_alarm_fires_immediately() {
        let db = store().await;
        let scheduler = Arc::new(Scheduler::new(Arc::clone(&db), "embed", Duration::from_secs(3600)));
        // Persisted fire time long in the past, as after a restart
        scheduler.rearm(at(0)).await.unwrap();

        let handler = Arc::new(Counting {
            ticks: AtomicUsize::new(0),
            fail: false,
        });
        let driver = spawn_tick_driver(Arc::clone(&scheduler), handler.clone());
        tokio::time::sleep(Duration::from_millis(100)).await;
        driver.abort();

        assert_eq!(handler.ticks.load(Ordering::SeqCst), 1);
        let alarm = scheduler.load().await.unwrap().unwrap();
        assert!(alarm.next_fire_at() > Utc::now());
    }
}

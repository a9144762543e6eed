//! Integration tests for the full queue: router, scheduler, processing loop
//! and worker host lifecycle.
//!
//! Each test runs a real `QueueRuntime` over libSQL with an in-process
//! worker host whose outcomes are scripted per source key.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::json;
use tokio::time::timeout;

use embed_queue::config::QueueConfig;
use embed_queue::host::{BatchProcessor, LocalHostFactory, RecordResult};
use embed_queue::queue::{NextAttempt, Outcome, QueueRecord, QueueStats};
use embed_queue::router::{Message, Reply, RouterHandle};
use embed_queue::runtime::{QueueRuntime, TICK_ALARM};
use embed_queue::scheduler::{Armed, Scheduler};
use embed_queue::store::{Database, LibSqlBackend};

/// Maximum time any test is allowed to wait for background progress.
const TEST_TIMEOUT: Duration = Duration::from_secs(5);

/// Worker that answers with a fixed outcome per source key (default success).
struct Scripted {
    outcomes: HashMap<String, Outcome>,
    processed: AtomicUsize,
}

impl Scripted {
    fn new(outcomes: &[(&str, Outcome)]) -> Arc<Self> {
        Arc::new(Self {
            outcomes: outcomes.iter().map(|(k, o)| (k.to_string(), *o)).collect(),
            processed: AtomicUsize::new(0),
        })
    }
}

#[async_trait]
impl BatchProcessor for Scripted {
    async fn process(&self, records: Vec<QueueRecord>) -> Vec<RecordResult> {
        self.processed.fetch_add(records.len(), Ordering::SeqCst);
        records
            .iter()
            .map(|r| match self.outcomes.get(&r.source_key) {
                Some(Outcome::Retriable) => RecordResult::retriable(&r.id, "embedder busy"),
                Some(Outcome::Fatal) => RecordResult::fatal(&r.id, "malformed payload"),
                _ => RecordResult::success(&r.id),
            })
            .collect()
    }
}

fn config() -> QueueConfig {
    QueueConfig {
        // Keep the background driver out of the way unless a test wants it
        tick_interval: Duration::from_secs(3600),
        dispatch_timeout: Duration::from_secs(2),
        ..Default::default()
    }
}

fn at(secs: i64) -> DateTime<Utc> {
    DateTime::from_timestamp(secs, 0).unwrap()
}

async fn memory_store() -> Arc<dyn Database> {
    Arc::new(LibSqlBackend::new_memory().await.unwrap())
}

async fn enqueue(
    router: &RouterHandle,
    key: &str,
    payload: serde_json::Value,
    ts: DateTime<Utc>,
) -> Reply {
    router
        .request(Message::Enqueue {
            source_key: key.to_string(),
            payload,
            timestamp: Some(ts),
        })
        .await
        .unwrap()
}

async fn stats(router: &RouterHandle) -> QueueStats {
    match router.request(Message::GetStats).await.unwrap() {
        Reply::Stats(stats) => stats,
        other => panic!("expected stats, got {:?}", other),
    }
}

#[tokio::test]
async fn coalesce_then_dead_letter_after_eight_failures() {
    let worker = Scripted::new(&[("A", Outcome::Retriable)]);
    let runtime = QueueRuntime::start(
        memory_store().await,
        Arc::new(LocalHostFactory::new(worker.clone())),
        &config(),
    );
    let router = runtime.handle();
    router.request(Message::ReadinessAchieved).await.unwrap();

    let t0 = at(1_700_000_000 - 1_700_000_000 % 60);
    for (i, payload) in ["p1", "p2", "p3"].iter().enumerate() {
        let ts = t0 + chrono::Duration::seconds(i as i64 * 10);
        let reply = enqueue(&router, "A", json!(payload), ts).await;
        assert!(matches!(reply, Reply::Enqueued { .. }));
    }
    assert_eq!(stats(&router).await.pending, 1);

    let mut now = t0 + chrono::Duration::seconds(30);
    for _ in 0..8 {
        runtime.processor().run_tick(now).await.unwrap();
        now += chrono::Duration::hours(10);
    }

    let stats_after = stats(&router).await;
    assert_eq!(stats_after.dead_lettered, 1);
    assert_eq!(stats_after.pending, 0);
    assert_eq!(stats_after.failures, 8);

    let Reply::DeadLetters { records } = router
        .request(Message::ListDeadLetters { limit: 10 })
        .await
        .unwrap()
    else {
        panic!("expected dead letters");
    };
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].payload, json!("p3"));
    assert_eq!(records[0].first_enqueued_at, t0);
    assert_eq!(records[0].next_attempt, NextAttempt::Never);

    // Terminal: later ticks never pick it up again
    let processed = worker.processed.load(Ordering::SeqCst);
    runtime
        .processor()
        .run_tick(now + chrono::Duration::days(365))
        .await
        .unwrap();
    assert_eq!(worker.processed.load(Ordering::SeqCst), processed);

    runtime.shutdown().await;
}

#[tokio::test]
async fn mixed_outcomes_in_one_batch() {
    let worker = Scripted::new(&[("retry", Outcome::Retriable), ("bad", Outcome::Fatal)]);
    let runtime = QueueRuntime::start(
        memory_store().await,
        Arc::new(LocalHostFactory::new(worker)),
        &config(),
    );
    let router = runtime.handle();
    router.request(Message::ReadinessAchieved).await.unwrap();

    let t0 = at(1_000);
    enqueue(&router, "ok", json!(1), t0).await;
    enqueue(&router, "retry", json!(2), t0).await;
    enqueue(&router, "bad", json!(3), t0).await;

    let report = runtime.processor().run_tick(t0).await.unwrap();
    assert_eq!(report.succeeded, 1);
    assert_eq!(report.retried, 1);
    assert_eq!(report.dead_lettered, 1);

    let s = stats(&router).await;
    assert_eq!(s.pending, 1);
    assert_eq!(s.dead_lettered, 1);
    assert_eq!(s.successes, 1);
    assert_eq!(s.failures, 2);

    runtime.shutdown().await;
}

#[tokio::test]
async fn paused_queue_is_inert_across_ticks() {
    let worker = Scripted::new(&[]);
    let runtime = QueueRuntime::start(
        memory_store().await,
        Arc::new(LocalHostFactory::new(worker.clone())),
        &config(),
    );
    let router = runtime.handle();
    router.request(Message::ReadinessAchieved).await.unwrap();
    enqueue(&router, "A", json!(1), at(1_000)).await;

    router
        .request(Message::TogglePause { paused: true })
        .await
        .unwrap();
    let before = stats(&router).await;

    let reply = enqueue(&router, "B", json!(1), at(1_001)).await;
    assert!(matches!(reply, Reply::Ignored { .. }));
    for i in 0..5 {
        runtime.processor().run_tick(at(2_000 + i * 60)).await.unwrap();
    }

    assert_eq!(stats(&router).await, before);
    assert_eq!(worker.processed.load(Ordering::SeqCst), 0);
    assert!(!runtime.processor().hosts().is_running().await);

    runtime.shutdown().await;
}

#[tokio::test]
async fn worker_host_torn_down_when_idle_and_recreated() {
    let worker = Scripted::new(&[]);
    let cfg = QueueConfig {
        host_idle_timeout: Duration::from_millis(100),
        ..config()
    };
    let runtime = QueueRuntime::start(
        memory_store().await,
        Arc::new(LocalHostFactory::new(worker)),
        &cfg,
    );
    let router = runtime.handle();
    router.request(Message::ReadinessAchieved).await.unwrap();

    enqueue(&router, "A", json!(1), at(1_000)).await;
    runtime.processor().run_tick(at(1_000)).await.unwrap();
    let hosts = runtime.processor().hosts().clone();
    assert!(hosts.is_running().await);

    tokio::time::sleep(Duration::from_millis(400)).await;
    assert!(!hosts.is_running().await);

    enqueue(&router, "B", json!(1), at(1_100)).await;
    runtime.processor().run_tick(at(1_100)).await.unwrap();
    assert_eq!(hosts.creations(), 2);
    assert_eq!(stats(&router).await.successes, 2);

    runtime.shutdown().await;
}

#[tokio::test]
async fn restart_recovers_pending_work() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("queue.db");

    // First run: records queued and alarm armed, then the process "dies"
    {
        let store: Arc<dyn Database> = Arc::new(LibSqlBackend::new_local(&path).await.unwrap());
        let runtime = QueueRuntime::start(
            Arc::clone(&store),
            Arc::new(LocalHostFactory::new(Scripted::new(&[]))),
            &config(),
        );
        let router = runtime.handle();
        router.request(Message::ReadinessAchieved).await.unwrap();
        enqueue(&router, "A", json!(1), at(1_000)).await;
        enqueue(&router, "B", json!(2), at(1_010)).await;

        runtime.shutdown().await;

        let scheduler = Scheduler::new(Arc::clone(&store), TICK_ALARM, Duration::from_millis(50));
        // Fire time in the past, as if the process was down when it was due
        scheduler.rearm(at(0)).await.unwrap();
    }

    let store: Arc<dyn Database> = Arc::new(LibSqlBackend::new_local(&path).await.unwrap());
    let probe = Scheduler::new(Arc::clone(&store), TICK_ALARM, Duration::from_millis(50));
    assert!(matches!(
        probe.ensure_armed(Utc::now()).await.unwrap(),
        Armed::Existing(_)
    ));

    let worker = Scripted::new(&[]);
    let runtime = QueueRuntime::start(
        Arc::clone(&store),
        Arc::new(LocalHostFactory::new(worker.clone())),
        &QueueConfig {
            tick_interval: Duration::from_millis(50),
            ..config()
        },
    );
    let router = runtime.handle();

    timeout(TEST_TIMEOUT, async {
        loop {
            if stats(&router).await.pending == 0 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    })
    .await
    .expect("pending records were not processed after restart");

    assert_eq!(worker.processed.load(Ordering::SeqCst), 2);
    assert_eq!(stats(&router).await.successes, 2);

    runtime.shutdown().await;
}

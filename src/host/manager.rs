//! Worker host lifecycle manager.
//!
//! Creates the host lazily on first use, keeps it warm while batches keep
//! coming and closes it after an idle window. Creation is single-flight:
//! the slot lock is held across `HostFactory::create`, so concurrent
//! `ensure()` calls wait for the same creation instead of starting their own.

use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use tokio::sync::{Mutex, watch};
use tracing::{debug, info, warn};

use crate::error::HostError;
use crate::host::{HostFactory, ResultSink, WorkerHost};

struct Inner {
    factory: Arc<dyn HostFactory>,
    sink: Arc<dyn ResultSink>,
    idle_timeout: Duration,
    slot: Mutex<Option<Arc<dyn WorkerHost>>>,
    /// Dispatches currently awaiting a result.
    outstanding: AtomicUsize,
    /// Bumped whenever the idle timer is (re)armed. The single timer task
    /// restarts its sleep on every change.
    idle_generation: watch::Sender<u64>,
    timer_started: AtomicBool,
    /// Hosts created over the manager's lifetime.
    created: AtomicU64,
}

/// Owns the single worker host slot.
#[derive(Clone)]
pub struct HostManager {
    inner: Arc<Inner>,
}

impl HostManager {
    pub fn new(
        factory: Arc<dyn HostFactory>,
        sink: Arc<dyn ResultSink>,
        idle_timeout: Duration,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                factory,
                sink,
                idle_timeout,
                slot: Mutex::new(None),
                outstanding: AtomicUsize::new(0),
                idle_generation: watch::Sender::new(0),
                timer_started: AtomicBool::new(false),
                created: AtomicU64::new(0),
            }),
        }
    }

    /// Return the live host, creating it if absent. Resets the idle timer.
    pub async fn ensure(&self) -> Result<Arc<dyn WorkerHost>, HostError> {
        let host = {
            let mut slot = self.inner.slot.lock().await;
            match slot.as_ref() {
                Some(host) => Arc::clone(host),
                None => {
                    let host = self.inner.factory.create(Arc::clone(&self.inner.sink)).await?;
                    let n = self.inner.created.fetch_add(1, Ordering::SeqCst) + 1;
                    info!(host = host.name(), created = n, "Worker host started");
                    *slot = Some(Arc::clone(&host));
                    host
                }
            }
        };
        self.arm_idle_timer();
        Ok(host)
    }

    /// Mark a dispatch as outstanding for as long as the guard lives.
    ///
    /// The idle timer cannot close the host while any guard exists; it is
    /// re-armed when the last guard drops.
    pub async fn begin_dispatch(&self) -> Result<DispatchGuard, HostError> {
        self.inner.outstanding.fetch_add(1, Ordering::SeqCst);
        match self.ensure().await {
            Ok(host) => Ok(DispatchGuard {
                manager: self.clone(),
                host,
            }),
            Err(e) => {
                self.end_dispatch();
                Err(e)
            }
        }
    }

    /// Close the host if nothing is in flight. Returns `true` if one was closed.
    pub async fn on_idle_timeout(&self) -> bool {
        self.close_if_idle(None).await
    }

    async fn close_if_idle(&self, generation: Option<u64>) -> bool {
        let host = {
            let mut slot = self.inner.slot.lock().await;
            if let Some(generation) = generation
                && *self.inner.idle_generation.borrow() != generation
            {
                return false;
            }
            if self.inner.outstanding.load(Ordering::SeqCst) > 0 {
                debug!("Idle timeout ignored: dispatch outstanding");
                return false;
            }
            slot.take()
        };
        match host {
            Some(host) => {
                host.close().await;
                info!(host = host.name(), "Worker host closed after idle window");
                true
            }
            None => false,
        }
    }

    /// Drop `host` from the slot if it is still the live one, so the next
    /// `ensure()` starts a fresh host. Used when a host stops accepting work.
    pub async fn discard(&self, host: &Arc<dyn WorkerHost>) {
        let taken = {
            let mut slot = self.inner.slot.lock().await;
            match slot.as_ref() {
                Some(live) if Arc::ptr_eq(live, host) => slot.take(),
                _ => None,
            }
        };
        if let Some(host) = taken {
            host.close().await;
            warn!(host = host.name(), "Worker host discarded");
        }
    }

    /// Close any live host unconditionally.
    pub async fn shutdown(&self) {
        self.inner.idle_generation.send_modify(|g| *g += 1);
        let host = self.inner.slot.lock().await.take();
        if let Some(host) = host {
            host.close().await;
            info!(host = host.name(), "Worker host shut down");
        }
    }

    pub async fn is_running(&self) -> bool {
        self.inner.slot.lock().await.is_some()
    }

    /// Total hosts created so far.
    pub fn creations(&self) -> u64 {
        self.inner.created.load(Ordering::SeqCst)
    }

    pub fn outstanding(&self) -> usize {
        self.inner.outstanding.load(Ordering::SeqCst)
    }

    fn arm_idle_timer(&self) {
        self.inner.idle_generation.send_modify(|g| *g += 1);
        if self.inner.timer_started.load(Ordering::SeqCst) {
            return;
        }
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            return;
        };
        if self.inner.timer_started.swap(true, Ordering::SeqCst) {
            return;
        }
        let rx = self.inner.idle_generation.subscribe();
        runtime.spawn(idle_timer(
            Arc::downgrade(&self.inner),
            rx,
            self.inner.idle_timeout,
        ));
    }

    fn end_dispatch(&self) {
        let previous = self.inner.outstanding.fetch_sub(1, Ordering::SeqCst);
        if previous == 1 {
            self.arm_idle_timer();
        }
    }
}

/// Sleeps for `idle_timeout` after the latest arm, then tries to close the
/// host. Exits once the manager is dropped.
async fn idle_timer(inner: Weak<Inner>, mut rx: watch::Receiver<u64>, idle_timeout: Duration) {
    loop {
        let generation = *rx.borrow_and_update();
        tokio::select! {
            changed = rx.changed() => {
                if changed.is_err() {
                    return;
                }
            }
            _ = tokio::time::sleep(idle_timeout) => {
                let Some(inner) = inner.upgrade() else {
                    return;
                };
                HostManager { inner }.close_if_idle(Some(generation)).await;
                // Nothing to time until the next arm
                if rx.changed().await.is_err() {
                    return;
                }
            }
        }
    }
}

/// Holds the host busy for one dispatch round trip.
pub struct DispatchGuard {
    manager: HostManager,
    host: Arc<dyn WorkerHost>,
}

impl DispatchGuard {
    pub fn host(&self) -> &Arc<dyn WorkerHost> {
        &self.host
    }
}

impl Drop for DispatchGuard {
    fn drop(&mut self) {
        self.manager.end_dispatch();
    }
}

//! Wires the queue components into a running service.

use std::sync::Arc;

use tokio::task::JoinHandle;
use tracing::info;

use crate::config::QueueConfig;
use crate::host::{HostFactory, HostManager};
use crate::processor::{IdleProbe, NeverIdle, Processor};
use crate::queue::{Gate, Ingest, RetryPolicy};
use crate::router::{Router, RouterHandle, spawn_router};
use crate::scheduler::{Scheduler, spawn_tick_driver};
use crate::store::Database;

/// Name of the durable alarm driving the processing loop.
pub const TICK_ALARM: &str = "embed-tick";

/// A running queue: router task, tick driver and worker host manager.
pub struct QueueRuntime {
    router: RouterHandle,
    processor: Arc<Processor>,
    scheduler: Arc<Scheduler>,
    router_task: JoinHandle<()>,
    tick_task: JoinHandle<()>,
}

impl QueueRuntime {
    pub fn start(
        store: Arc<dyn Database>,
        factory: Arc<dyn HostFactory>,
        config: &QueueConfig,
    ) -> Self {
        Self::start_with_idle_probe(store, factory, config, Arc::new(NeverIdle))
    }

    pub fn start_with_idle_probe(
        store: Arc<dyn Database>,
        factory: Arc<dyn HostFactory>,
        config: &QueueConfig,
        idle: Arc<dyn IdleProbe>,
    ) -> Self {
        let gate = Gate::new(Arc::clone(&store));
        let (router, inbox) = RouterHandle::channel();

        // Host results are posted back through the router
        let hosts = HostManager::new(factory, Arc::new(router.clone()), config.host_idle_timeout);
        let processor = Arc::new(
            Processor::new(
                Arc::clone(&store),
                gate.clone(),
                RetryPolicy::from_config(config),
                hosts,
                config,
            )
            .with_idle_probe(idle),
        );

        let router_task = spawn_router(
            Router::new(
                Arc::clone(&store),
                gate.clone(),
                Ingest::new(Arc::clone(&store), gate, config.bucket_width),
                Arc::clone(&processor),
            ),
            inbox,
        );

        let scheduler = Arc::new(Scheduler::new(store, TICK_ALARM, config.tick_interval));
        let tick_task = spawn_tick_driver(Arc::clone(&scheduler), processor.clone());

        info!(
            tick_ms = config.tick_interval.as_millis() as u64,
            batch_size = config.batch_size,
            "Queue runtime started"
        );

        Self {
            router,
            processor,
            scheduler,
            router_task,
            tick_task,
        }
    }

    /// Handle for sending messages to the router.
    pub fn handle(&self) -> RouterHandle {
        self.router.clone()
    }

    pub fn processor(&self) -> &Arc<Processor> {
        &self.processor
    }

    pub fn scheduler(&self) -> &Arc<Scheduler> {
        &self.scheduler
    }

    /// Stop ticking, close the worker host and stop the router.
    pub async fn shutdown(self) {
        self.tick_task.abort();
        self.processor.hosts().shutdown().await;
        self.router_task.abort();
        info!("Queue runtime stopped");
    }
}

pub mod config;
pub mod error;
pub mod grading;
pub mod metrics;
pub mod models;
pub mod outcome;
pub mod queue;
pub mod sandbox;
pub mod worker;

use std::sync::Arc;

use tokio::task::JoinHandle;

use crate::engine::{
    config::{EngineConfig, LogFormat},
    metrics::MetricsRegistry,
    queue::Scheduler,
    sandbox::{ExecutionSupervisor, ProcessRegistry},
    worker::spawn_worker_pool,
};

/// A running worker pool with its queue and shared bookkeeping.
pub struct Engine {
    pub scheduler: Scheduler,
    pub metrics: Arc<MetricsRegistry>,
    pub registry: ProcessRegistry,
    workers: Vec<JoinHandle<()>>,
}

impl Engine {
    pub fn start(config: &EngineConfig) -> Self {
        let metrics = Arc::new(MetricsRegistry::new());
        let registry = ProcessRegistry::new();
        let scheduler = Scheduler::new(config.queue_capacity, metrics.clone());
        let supervisor =
            ExecutionSupervisor::new(registry.clone()).with_drain_grace(config.drain_grace());

        let workers = spawn_worker_pool(
            config.worker_count.max(1),
            scheduler.receiver(),
            scheduler.closed(),
            metrics.clone(),
            Arc::new(supervisor),
        );
        tracing::info!(
            workers = workers.len(),
            queue_capacity = config.queue_capacity,
            "sandbox execution engine ready"
        );

        Self {
            scheduler,
            metrics,
            registry,
            workers,
        }
    }

    /// Closes the queue, including for other clones of the scheduler, and
    /// waits for in-flight runs to finish. Queued runs that no worker picked
    /// up are dropped.
    pub async fn shutdown(self) {
        let Self {
            scheduler,
            registry,
            workers,
            ..
        } = self;
        scheduler.close();
        for worker in workers {
            if let Err(err) = worker.await {
                tracing::warn!(error = %err, "worker task ended abnormally");
            }
        }
        let receiver = scheduler.receiver();
        let mut queue = receiver.lock().await;
        queue.close();
        let mut dropped = 0usize;
        while queue.try_recv().is_ok() {
            dropped += 1;
        }
        if dropped > 0 {
            tracing::warn!(dropped, "queued runs dropped at shutdown");
        }

        for (run_id, process) in registry.snapshot() {
            tracing::warn!(%run_id, pid = process.pid, "process still registered after shutdown");
        }
    }
}

pub fn init_tracing(config: &EngineConfig) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(config.log_level.clone()));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr);
    match config.log_format {
        LogFormat::Json => builder
            .json()
            .with_current_span(false)
            .with_span_list(false)
            .init(),
        LogFormat::Compact => builder.with_target(false).compact().init(),
    }
}

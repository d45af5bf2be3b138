use std::sync::Arc;

use tokio::{
    sync::{Mutex, mpsc::Receiver},
    task::JoinHandle,
};
use tokio_util::sync::CancellationToken;

use crate::engine::{metrics::MetricsRegistry, queue::Job, sandbox::SandboxBackend};

pub fn spawn_worker_pool(
    workers: usize,
    receiver: Arc<Mutex<Receiver<Job>>>,
    closed: CancellationToken,
    metrics: Arc<MetricsRegistry>,
    sandbox: Arc<dyn SandboxBackend>,
) -> Vec<JoinHandle<()>> {
    (0..workers)
        .map(|worker_id| {
            let receiver = receiver.clone();
            let closed = closed.clone();
            let metrics = metrics.clone();
            let sandbox = sandbox.clone();
            tokio::spawn(async move {
                worker_loop(worker_id, receiver, closed, metrics, sandbox).await;
            })
        })
        .collect()
}

async fn worker_loop(
    worker_id: usize,
    receiver: Arc<Mutex<Receiver<Job>>>,
    closed: CancellationToken,
    metrics: Arc<MetricsRegistry>,
    sandbox: Arc<dyn SandboxBackend>,
) {
    loop {
        let job = tokio::select! {
            biased;
            _ = closed.cancelled() => None,
            job = async { receiver.lock().await.recv().await } => job,
        };
        let Some(Job { request, reply }) = job else {
            tracing::info!(worker_id, "job queue closed, worker exiting");
            break;
        };

        let run_id = request.id;
        tracing::info!(worker_id, run_id = %run_id, backend = sandbox.name(), "starting run");
        metrics.started();

        let report = sandbox.execute(request).await;
        metrics.finished(report.reason);

        if reply.send(report).is_err() {
            tracing::debug!(worker_id, run_id = %run_id, "submitter went away before the report");
        }
    }
}

#[cfg(test)]
mod tests {
    use async_trait::async_trait;
    use chrono::Utc;

    use super::*;
    use crate::engine::{
        models::{Invocation, Limits, RunReport, RunRequest},
        outcome::{ReasonCode, RunOutcome},
        queue::Scheduler,
        sandbox::Captured,
    };

    struct EchoBackend;

    #[async_trait]
    impl SandboxBackend for EchoBackend {
        fn name(&self) -> &'static str {
            "echo"
        }

        async fn execute(&self, request: RunRequest) -> RunReport {
            RunReport {
                id: request.id,
                reason: ReasonCode::Completed,
                summary: ReasonCode::Completed.describe(),
                outcome: RunOutcome::NormalExit {
                    exit_code: 0,
                    signal: None,
                    stdout: Captured::Memory {
                        bytes: request.input.clone(),
                    },
                    stderr: Captured::default(),
                },
                pid: None,
                input_delivered_bytes: request.input.len() as u64,
                input_truncated: false,
                duration_ms: 0,
                started_at: Utc::now(),
                finished_at: Utc::now(),
            }
        }
    }

    #[tokio::test]
    async fn workers_answer_each_job() {
        let metrics = Arc::new(MetricsRegistry::new());
        let scheduler = Scheduler::new(8, metrics.clone());
        let workers = spawn_worker_pool(
            2,
            scheduler.receiver(),
            scheduler.closed(),
            metrics.clone(),
            Arc::new(EchoBackend),
        );

        let mut pending = Vec::new();
        for i in 0..5 {
            let request = RunRequest::new(
                Invocation::new("/bin/cat"),
                format!("case-{i}").into_bytes(),
                Limits::default(),
            );
            pending.push((i, scheduler.submit(request).unwrap()));
        }
        for (i, report) in pending {
            let report = report.await.unwrap();
            assert_eq!(report.reason, ReasonCode::Completed);
            assert_eq!(
                report.outcome.stdout().text().as_deref(),
                Some(format!("case-{i}").as_str())
            );
        }

        let rendered = metrics.render_prometheus();
        assert!(rendered.contains("run_normal_exit_total 5"));
        assert!(rendered.contains("run_queue_depth 0"));

        drop(scheduler);
        for worker in workers {
            worker.await.unwrap();
        }
    }

    #[tokio::test]
    async fn closing_stops_workers_while_clones_are_alive() {
        let metrics = Arc::new(MetricsRegistry::new());
        let scheduler = Scheduler::new(8, metrics.clone());
        let held_elsewhere = scheduler.clone();
        let workers = spawn_worker_pool(
            3,
            scheduler.receiver(),
            scheduler.closed(),
            metrics,
            Arc::new(EchoBackend),
        );

        scheduler.close();
        for worker in workers {
            tokio::time::timeout(std::time::Duration::from_secs(5), worker)
                .await
                .expect("worker did not exit after close")
                .unwrap();
        }
        drop(held_elsewhere);
    }
}

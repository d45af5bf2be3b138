use std::sync::Arc;

use tokio::sync::{
    Mutex,
    mpsc::{self, Receiver, Sender, error::TrySendError},
    oneshot,
};
use tokio_util::sync::CancellationToken;

use crate::engine::{
    error::EngineError,
    metrics::MetricsRegistry,
    models::{RunReport, RunRequest},
};

pub struct Job {
    pub request: RunRequest,
    pub reply: oneshot::Sender<RunReport>,
}

#[derive(Clone)]
pub struct Scheduler {
    sender: Sender<Job>,
    receiver: Arc<Mutex<Receiver<Job>>>,
    closed: CancellationToken,
    metrics: Arc<MetricsRegistry>,
}

impl Scheduler {
    pub fn new(capacity: usize, metrics: Arc<MetricsRegistry>) -> Self {
        let (sender, receiver) = mpsc::channel(capacity.max(1));
        Self {
            sender,
            receiver: Arc::new(Mutex::new(receiver)),
            closed: CancellationToken::new(),
            metrics,
        }
    }

    /// Queues a run without waiting for room; the report arrives on the
    /// returned receiver.
    pub fn submit(&self, request: RunRequest) -> Result<oneshot::Receiver<RunReport>, EngineError> {
        self.ensure_open()?;
        request.limits.validate()?;
        let (reply, report) = oneshot::channel();
        self.sender
            .try_send(Job { request, reply })
            .map_err(|err| match err {
                TrySendError::Full(_) => EngineError::QueueFull,
                TrySendError::Closed(_) => EngineError::QueueClosed,
            })?;
        self.metrics.submitted();
        Ok(report)
    }

    /// Queues a run, waiting for queue space, and waits for its report.
    pub async fn run(&self, request: RunRequest) -> Result<RunReport, EngineError> {
        self.ensure_open()?;
        request.limits.validate()?;
        let (reply, report) = oneshot::channel();
        self.sender
            .send(Job { request, reply })
            .await
            .map_err(|_| EngineError::QueueClosed)?;
        self.metrics.submitted();
        report.await.map_err(|_| EngineError::WorkerDropped)
    }

    pub fn receiver(&self) -> Arc<Mutex<Receiver<Job>>> {
        self.receiver.clone()
    }

    /// Closes the queue for every clone of this scheduler. Workers finish
    /// the run they hold and exit; jobs still queued are dropped and their
    /// submitters get `WorkerDropped`.
    pub fn close(&self) {
        self.closed.cancel();
    }

    pub fn closed(&self) -> CancellationToken {
        self.closed.clone()
    }

    fn ensure_open(&self) -> Result<(), EngineError> {
        if self.closed.is_cancelled() {
            return Err(EngineError::QueueClosed);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use bytes::Bytes;

    use super::*;
    use crate::engine::models::{Invocation, Limits};

    fn request() -> RunRequest {
        RunRequest::new(Invocation::new("/bin/true"), Bytes::new(), Limits::default())
    }

    #[tokio::test]
    async fn rejects_invalid_limits_before_queueing() {
        let scheduler = Scheduler::new(4, Arc::new(MetricsRegistry::new()));
        let mut bad = request();
        bad.limits.timeout_ms = 0;
        assert!(matches!(
            scheduler.submit(bad),
            Err(EngineError::InvalidLimits(_))
        ));
    }

    #[tokio::test]
    async fn closed_queue_refuses_new_runs_from_every_clone() {
        let scheduler = Scheduler::new(4, Arc::new(MetricsRegistry::new()));
        let other = scheduler.clone();
        scheduler.close();
        assert!(matches!(other.submit(request()), Err(EngineError::QueueClosed)));
        assert!(matches!(
            other.run(request()).await,
            Err(EngineError::QueueClosed)
        ));
    }

    #[tokio::test]
    async fn full_queue_is_reported() {
        let scheduler = Scheduler::new(1, Arc::new(MetricsRegistry::new()));
        let _first = scheduler.submit(request()).unwrap();
        assert!(matches!(
            scheduler.submit(request()),
            Err(EngineError::QueueFull)
        ));
    }
}

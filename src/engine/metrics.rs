use std::sync::atomic::{AtomicU64, Ordering};

use crate::engine::outcome::ReasonCode;

#[derive(Debug, Default)]
pub struct MetricsRegistry {
    submitted_total: AtomicU64,
    started_total: AtomicU64,
    completed_total: AtomicU64,
    normal_exit_total: AtomicU64,
    timed_out_total: AtomicU64,
    quota_exceeded_total: AtomicU64,
    spawn_failed_total: AtomicU64,
    supervisor_failed_total: AtomicU64,
    queue_depth: AtomicU64,
}

impl MetricsRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn submitted(&self) {
        self.submitted_total.fetch_add(1, Ordering::Relaxed);
        self.queue_depth.fetch_add(1, Ordering::Relaxed);
    }

    pub fn started(&self) {
        self.started_total.fetch_add(1, Ordering::Relaxed);
        self.decrement_queue_depth();
    }

    pub fn finished(&self, reason: ReasonCode) {
        self.completed_total.fetch_add(1, Ordering::Relaxed);
        let counter = match reason {
            ReasonCode::Completed => &self.normal_exit_total,
            ReasonCode::TimedOut => &self.timed_out_total,
            ReasonCode::QuotaExceeded(_) => &self.quota_exceeded_total,
            ReasonCode::SpawnFailed => &self.spawn_failed_total,
            ReasonCode::SupervisorFailed => &self.supervisor_failed_total,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn render_prometheus(&self) -> String {
        format!(
            concat!(
                "# TYPE run_submitted_total counter\n",
                "run_submitted_total {}\n",
                "# TYPE run_started_total counter\n",
                "run_started_total {}\n",
                "# TYPE run_completed_total counter\n",
                "run_completed_total {}\n",
                "# TYPE run_normal_exit_total counter\n",
                "run_normal_exit_total {}\n",
                "# TYPE run_timed_out_total counter\n",
                "run_timed_out_total {}\n",
                "# TYPE run_quota_exceeded_total counter\n",
                "run_quota_exceeded_total {}\n",
                "# TYPE run_spawn_failed_total counter\n",
                "run_spawn_failed_total {}\n",
                "# TYPE run_supervisor_failed_total counter\n",
                "run_supervisor_failed_total {}\n",
                "# TYPE run_queue_depth gauge\n",
                "run_queue_depth {}\n"
            ),
            self.submitted_total.load(Ordering::Relaxed),
            self.started_total.load(Ordering::Relaxed),
            self.completed_total.load(Ordering::Relaxed),
            self.normal_exit_total.load(Ordering::Relaxed),
            self.timed_out_total.load(Ordering::Relaxed),
            self.quota_exceeded_total.load(Ordering::Relaxed),
            self.spawn_failed_total.load(Ordering::Relaxed),
            self.supervisor_failed_total.load(Ordering::Relaxed),
            self.queue_depth.load(Ordering::Relaxed),
        )
    }

    fn decrement_queue_depth(&self) {
        let mut current = self.queue_depth.load(Ordering::Relaxed);
        while current > 0 {
            match self.queue_depth.compare_exchange_weak(
                current,
                current - 1,
                Ordering::Relaxed,
                Ordering::Relaxed,
            ) {
                Ok(_) => return,
                Err(actual) => current = actual,
            }
        }
    }
}

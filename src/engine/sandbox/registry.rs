use std::{path::PathBuf, sync::Arc};

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use uuid::Uuid;

#[derive(Debug, Clone)]
pub struct LiveProcess {
    pub pid: u32,
    pub executable: PathBuf,
    pub started_at: DateTime<Utc>,
}

/// Table of children currently alive under this engine, keyed by run id.
///
/// Owned by the worker pool and handed to each supervisor; entries exist from
/// spawn until the child has been reaped.
#[derive(Clone, Default)]
pub struct ProcessRegistry {
    live: Arc<DashMap<Uuid, LiveProcess>>,
}

impl ProcessRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, run_id: Uuid, pid: u32, executable: PathBuf) {
        self.live.insert(
            run_id,
            LiveProcess {
                pid,
                executable,
                started_at: Utc::now(),
            },
        );
    }

    pub fn deregister(&self, run_id: &Uuid) -> Option<LiveProcess> {
        self.live.remove(run_id).map(|(_, process)| process)
    }

    pub fn is_empty(&self) -> bool {
        self.live.is_empty()
    }

    pub fn snapshot(&self) -> Vec<(Uuid, LiveProcess)> {
        self.live
            .iter()
            .map(|entry| (*entry.key(), entry.value().clone()))
            .collect()
    }
}

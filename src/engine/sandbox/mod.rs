mod bounded;
mod classifier;
mod process;
mod pump;
mod registry;
mod sink;
mod supervisor;
mod termination;

use async_trait::async_trait;

use crate::engine::models::{RunReport, RunRequest};

pub use bounded::{
    BoundedReader, BoundedWriter, Overflow, QuotaExceeded, ReadOutcome, StreamRole, WriteOutcome,
};
pub use classifier::classify;
pub use process::{ExitState, KillSwitch, ProcessHandle};
pub use pump::{DrainReport, FeedReport, PumpStatus, drain, feed};
pub use registry::{LiveProcess, ProcessRegistry};
pub use sink::{Captured, FileSink, MemorySink, OutputSink, SinkKind, open_sink};
pub use supervisor::{DEFAULT_DRAIN_GRACE, ExecutionSupervisor, SupervisorState, TerminalState};
pub use termination::{TerminationReason, TerminationSignal};

#[async_trait]
pub trait SandboxBackend: Send + Sync {
    fn name(&self) -> &'static str;
    async fn execute(&self, request: RunRequest) -> RunReport;
}

#[async_trait]
impl SandboxBackend for ExecutionSupervisor {
    fn name(&self) -> &'static str {
        "process"
    }

    async fn execute(&self, request: RunRequest) -> RunReport {
        self.run(request).await
    }
}

pub mod engine;

pub use engine::{
    Engine,
    config::EngineConfig,
    error::{EngineError, SpawnError},
    grading::{CaseResult, TestCase, Verdict},
    models::{InputOverflow, Invocation, Limits, RunReport, RunRequest},
    outcome::{FailureCause, ReasonCode, RunOutcome},
    sandbox::{ExecutionSupervisor, ProcessRegistry, SandboxBackend, StreamRole},
};

use std::{collections::BTreeMap, path::PathBuf, str::FromStr, time::Duration};

use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::engine::{
    error::EngineError,
    outcome::{ReasonCode, RunOutcome},
    sandbox::{SinkKind, StreamRole},
};

/// What happens when the input payload is larger than `max_input_bytes`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InputOverflow {
    /// Refuse the payload and end the run as a stdin quota violation.
    #[default]
    Abort,
    /// Deliver the prefix that fits, close stdin and keep running.
    Truncate,
}

impl FromStr for InputOverflow {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "abort" => Ok(Self::Abort),
            "truncate" => Ok(Self::Truncate),
            _ => Err(format!("unsupported input overflow policy: {s}")),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Limits {
    pub timeout_ms: u64,
    pub max_stdout_bytes: u64,
    pub max_stderr_bytes: u64,
    pub max_input_bytes: u64,
    #[serde(default)]
    pub input_overflow: InputOverflow,
}

impl Default for Limits {
    fn default() -> Self {
        Self {
            timeout_ms: 5_000,
            max_stdout_bytes: 64 * 1024,
            max_stderr_bytes: 64 * 1024,
            max_input_bytes: 1024 * 1024,
            input_overflow: InputOverflow::Abort,
        }
    }
}

impl Limits {
    pub fn normalized(mut self) -> Self {
        self.timeout_ms = self.timeout_ms.clamp(1, 600_000);
        self.max_stdout_bytes = self.max_stdout_bytes.min(64 * 1024 * 1024);
        self.max_stderr_bytes = self.max_stderr_bytes.min(64 * 1024 * 1024);
        self.max_input_bytes = self.max_input_bytes.min(256 * 1024 * 1024);
        self
    }

    pub fn validate(&self) -> Result<(), EngineError> {
        if self.timeout_ms == 0 {
            return Err(EngineError::InvalidLimits(
                "timeout_ms must be greater than zero".to_string(),
            ));
        }
        Ok(())
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    pub fn ceiling(&self, role: StreamRole) -> u64 {
        match role {
            StreamRole::Stdin => self.max_input_bytes,
            StreamRole::Stdout => self.max_stdout_bytes,
            StreamRole::Stderr => self.max_stderr_bytes,
        }
    }
}

/// The already-built artifact to launch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Invocation {
    pub executable: PathBuf,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default)]
    pub working_dir: Option<PathBuf>,
    #[serde(default)]
    pub env: BTreeMap<String, String>,
}

impl Invocation {
    pub fn new(executable: impl Into<PathBuf>) -> Self {
        Self {
            executable: executable.into(),
            args: Vec::new(),
            working_dir: None,
            env: BTreeMap::new(),
        }
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn working_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.working_dir = Some(dir.into());
        self
    }
}

#[derive(Debug, Clone)]
pub struct RunRequest {
    pub id: Uuid,
    pub invocation: Invocation,
    pub input: Bytes,
    pub limits: Limits,
    pub capture: SinkKind,
}

impl RunRequest {
    pub fn new(invocation: Invocation, input: impl Into<Bytes>, limits: Limits) -> Self {
        Self {
            id: Uuid::new_v4(),
            invocation,
            input: input.into(),
            limits,
            capture: SinkKind::Memory,
        }
    }

    pub fn with_capture(mut self, capture: SinkKind) -> Self {
        self.capture = capture;
        self
    }
}

/// Everything the grading side learns about one run.
#[derive(Debug, Clone, Serialize)]
pub struct RunReport {
    pub id: Uuid,
    pub reason: ReasonCode,
    /// Human-readable wording of `reason`.
    pub summary: &'static str,
    #[serde(flatten)]
    pub outcome: RunOutcome,
    pub pid: Option<u32>,
    pub input_delivered_bytes: u64,
    pub input_truncated: bool,
    pub duration_ms: u128,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
}

impl RunReport {
    pub fn exit_code(&self) -> Option<i32> {
        self.outcome.exit_code()
    }
}

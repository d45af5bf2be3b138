use std::fmt;

use serde::Serialize;

use crate::engine::sandbox::{Captured, StreamRole};

/// Why the supervisor itself could not produce a normal result.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", content = "message", rename_all = "snake_case")]
pub enum FailureCause {
    Spawn(String),
    StreamIo(String),
    Wait(String),
    Capture(String),
    MalformedState(String),
}

impl fmt::Display for FailureCause {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Spawn(msg) => write!(f, "spawn failed: {msg}"),
            Self::StreamIo(msg) => write!(f, "stream i/o failed: {msg}"),
            Self::Wait(msg) => write!(f, "waiting on process failed: {msg}"),
            Self::Capture(msg) => write!(f, "output capture failed: {msg}"),
            Self::MalformedState(msg) => write!(f, "malformed terminal state: {msg}"),
        }
    }
}

/// Terminal result of one supervised run. Exactly one is produced per run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum RunOutcome {
    NormalExit {
        exit_code: i32,
        /// Set when the child died from a signal the supervisor did not send.
        signal: Option<i32>,
        stdout: Captured,
        stderr: Captured,
    },
    TimedOut {
        stdout: Captured,
        stderr: Captured,
    },
    QuotaExceeded {
        stream: StreamRole,
        ceiling: u64,
        observed_bytes: u64,
        stdout: Captured,
        stderr: Captured,
    },
    SupervisorFailure {
        cause: FailureCause,
        stdout: Captured,
        stderr: Captured,
    },
}

impl RunOutcome {
    pub fn reason(&self) -> ReasonCode {
        match self {
            Self::NormalExit { .. } => ReasonCode::Completed,
            Self::TimedOut { .. } => ReasonCode::TimedOut,
            Self::QuotaExceeded { stream, .. } => ReasonCode::QuotaExceeded(*stream),
            Self::SupervisorFailure {
                cause: FailureCause::Spawn(_),
                ..
            } => ReasonCode::SpawnFailed,
            Self::SupervisorFailure { .. } => ReasonCode::SupervisorFailed,
        }
    }

    pub fn exit_code(&self) -> Option<i32> {
        match self {
            Self::NormalExit { exit_code, .. } => Some(*exit_code),
            _ => None,
        }
    }

    pub fn stdout(&self) -> &Captured {
        match self {
            Self::NormalExit { stdout, .. }
            | Self::TimedOut { stdout, .. }
            | Self::QuotaExceeded { stdout, .. }
            | Self::SupervisorFailure { stdout, .. } => stdout,
        }
    }

    pub fn stderr(&self) -> &Captured {
        match self {
            Self::NormalExit { stderr, .. }
            | Self::TimedOut { stderr, .. }
            | Self::QuotaExceeded { stderr, .. }
            | Self::SupervisorFailure { stderr, .. } => stderr,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "code", content = "stream", rename_all = "snake_case")]
pub enum ReasonCode {
    Completed,
    TimedOut,
    QuotaExceeded(StreamRole),
    SpawnFailed,
    SupervisorFailed,
}

impl ReasonCode {
    /// Wording suitable for showing to the student.
    pub fn describe(&self) -> &'static str {
        match self {
            Self::Completed => "program finished",
            Self::TimedOut => "program did not finish in time",
            Self::QuotaExceeded(StreamRole::Stdin) => "test input was larger than allowed",
            Self::QuotaExceeded(_) => "program produced too much output",
            Self::SpawnFailed => "program could not be started",
            Self::SupervisorFailed => "internal error while running program",
        }
    }
}

impl fmt::Display for ReasonCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Completed => f.write_str("completed"),
            Self::TimedOut => f.write_str("timed_out"),
            Self::QuotaExceeded(stream) => write!(f, "quota_exceeded({stream})"),
            Self::SpawnFailed => f.write_str("spawn_failed"),
            Self::SupervisorFailed => f.write_str("supervisor_failed"),
        }
    }
}

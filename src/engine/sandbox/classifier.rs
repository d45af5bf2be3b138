use crate::engine::{
    outcome::{FailureCause, RunOutcome},
    sandbox::{
        process::ExitState,
        sink::Captured,
        supervisor::{SupervisorState, TerminalState},
    },
};

/// Maps a finished run onto its outcome. Inconsistent input becomes a
/// `SupervisorFailure` rather than a panic.
pub fn classify(terminal: TerminalState) -> RunOutcome {
    let quota = terminal.quota();
    let stream_failure = terminal.stream_failure();
    let TerminalState {
        state,
        exit,
        stdout,
        stderr,
        failure,
        ..
    } = terminal;
    let stdout = stdout.map(|report| report.captured).unwrap_or_default();
    let stderr = stderr.map(|report| report.captured).unwrap_or_default();

    match state {
        SupervisorState::Completed => match exit {
            Some(exit @ ExitState::Exited { signal, .. }) => match exit.exit_code() {
                Some(exit_code) => RunOutcome::NormalExit {
                    exit_code,
                    signal,
                    stdout,
                    stderr,
                },
                None => malformed("process exited without a code or signal", stdout, stderr),
            },
            Some(ExitState::Killed) => malformed("completed run was killed", stdout, stderr),
            None => malformed("completed run has no exit status", stdout, stderr),
        },
        SupervisorState::TimedOut => RunOutcome::TimedOut { stdout, stderr },
        SupervisorState::QuotaExceeded => match quota {
            Some(quota) => RunOutcome::QuotaExceeded {
                stream: quota.role,
                ceiling: quota.ceiling,
                observed_bytes: quota.observed,
                stdout,
                stderr,
            },
            None => malformed("quota state without a violated quota", stdout, stderr),
        },
        SupervisorState::Failed => {
            let cause = failure
                .or_else(|| stream_failure.map(FailureCause::StreamIo))
                .unwrap_or_else(|| {
                    FailureCause::MalformedState("failed run has no recorded cause".to_string())
                });
            RunOutcome::SupervisorFailure {
                cause,
                stdout,
                stderr,
            }
        }
        SupervisorState::Starting | SupervisorState::Running => malformed(
            &format!("run ended in non-terminal state {state:?}"),
            stdout,
            stderr,
        ),
    }
}

fn malformed(message: &str, stdout: Captured, stderr: Captured) -> RunOutcome {
    tracing::error!(detail = message, "malformed terminal state");
    RunOutcome::SupervisorFailure {
        cause: FailureCause::MalformedState(message.to_string()),
        stdout,
        stderr,
    }
}

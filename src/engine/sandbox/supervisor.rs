use std::{io, time::Duration};

use chrono::Utc;
use serde::Serialize;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::Instrument;

use crate::engine::{
    models::{RunReport, RunRequest},
    outcome::FailureCause,
    sandbox::{
        bounded::{QuotaExceeded, StreamRole},
        classifier::classify,
        process::{ExitState, ProcessHandle},
        pump::{self, DrainReport, FeedReport, PumpStatus},
        registry::ProcessRegistry,
        sink::{OutputSink, open_sink},
        termination::{TerminationReason, TerminationSignal},
    },
};

/// How long drainers may keep reading after the child is gone before the
/// process group is killed and the drainers are stopped.
pub const DEFAULT_DRAIN_GRACE: Duration = Duration::from_millis(500);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SupervisorState {
    Starting,
    Running,
    Completed,
    TimedOut,
    QuotaExceeded,
    Failed,
}

impl SupervisorState {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            Self::Completed | Self::TimedOut | Self::QuotaExceeded | Self::Failed
        )
    }

    pub fn can_advance_to(self, next: Self) -> bool {
        match self {
            Self::Starting => matches!(next, Self::Running | Self::Failed),
            Self::Running => next.is_terminal(),
            _ => false,
        }
    }
}

/// Everything known about a run once it has stopped; input to the classifier.
#[derive(Debug, Clone)]
pub struct TerminalState {
    pub state: SupervisorState,
    pub reason: Option<TerminationReason>,
    pub exit: Option<ExitState>,
    pub stdout: Option<DrainReport>,
    pub stderr: Option<DrainReport>,
    pub stdin: Option<FeedReport>,
    pub failure: Option<FailureCause>,
}

impl TerminalState {
    pub fn failed(cause: FailureCause) -> Self {
        Self {
            state: SupervisorState::Failed,
            reason: None,
            exit: None,
            stdout: None,
            stderr: None,
            stdin: None,
            failure: Some(cause),
        }
    }

    /// The violated quota: the one that won the signal, else the first one a
    /// pumper recorded while flushing.
    pub fn quota(&self) -> Option<QuotaExceeded> {
        if let Some(TerminationReason::Quota(quota)) = &self.reason {
            return Some(*quota);
        }
        self.pump_statuses().find_map(|status| match status {
            PumpStatus::QuotaExceeded(quota) => Some(*quota),
            _ => None,
        })
    }

    pub fn stream_failure(&self) -> Option<String> {
        if let Some(TerminationReason::Failure(message)) = &self.reason {
            return Some(message.clone());
        }
        self.pump_statuses().find_map(|status| match status {
            PumpStatus::Failed(message) => Some(message.clone()),
            _ => None,
        })
    }

    fn pump_statuses(&self) -> impl Iterator<Item = &PumpStatus> {
        self.stdout
            .iter()
            .chain(self.stderr.iter())
            .map(|report| &report.status)
            .chain(self.stdin.iter().map(|report| &report.status))
    }

    /// Picks the terminal state. The signal's first writer decides, except
    /// that a natural exit followed by a quota found while flushing is still
    /// a quota violation: the captured output is already cut short.
    pub fn resolve(&self) -> SupervisorState {
        match &self.reason {
            Some(TerminationReason::Deadline) => SupervisorState::TimedOut,
            Some(TerminationReason::Quota(_)) => SupervisorState::QuotaExceeded,
            Some(TerminationReason::Failure(_)) => SupervisorState::Failed,
            Some(TerminationReason::Exited) | None => {
                if self.quota().is_some() {
                    SupervisorState::QuotaExceeded
                } else if self.failure.is_some() || self.stream_failure().is_some() {
                    SupervisorState::Failed
                } else if matches!(self.exit, Some(ExitState::Exited { .. })) {
                    SupervisorState::Completed
                } else {
                    SupervisorState::Failed
                }
            }
        }
    }
}

struct Lifecycle {
    state: SupervisorState,
}

impl Lifecycle {
    fn new() -> Self {
        Self {
            state: SupervisorState::Starting,
        }
    }

    fn advance(&mut self, next: SupervisorState) {
        if !self.state.can_advance_to(next) {
            tracing::warn!(from = ?self.state, to = ?next, "unexpected supervisor transition");
        }
        tracing::debug!(from = ?self.state, to = ?next, "supervisor transition");
        self.state = next;
    }
}

enum Observed {
    Tripped(TerminationReason),
    Exited(io::Result<ExitState>),
}

/// Runs one submission end to end and always produces a report.
#[derive(Clone)]
pub struct ExecutionSupervisor {
    registry: ProcessRegistry,
    drain_grace: Duration,
}

impl ExecutionSupervisor {
    pub fn new(registry: ProcessRegistry) -> Self {
        Self {
            registry,
            drain_grace: DEFAULT_DRAIN_GRACE,
        }
    }

    pub fn with_drain_grace(mut self, drain_grace: Duration) -> Self {
        self.drain_grace = drain_grace;
        self
    }

    pub fn registry(&self) -> &ProcessRegistry {
        &self.registry
    }

    pub async fn run(&self, request: RunRequest) -> RunReport {
        let span = tracing::info_span!("run", run_id = %request.id);
        self.run_in_span(request).instrument(span).await
    }

    async fn run_in_span(&self, request: RunRequest) -> RunReport {
        let started_at = Utc::now();
        let clock = Instant::now();

        let (terminal, pid) = self.supervise(&request).await;
        let input_delivered_bytes = terminal.stdin.as_ref().map_or(0, |feed| feed.delivered);
        let input_truncated = terminal.stdin.as_ref().is_some_and(|feed| feed.truncated);
        let state = terminal.state;

        let outcome = classify(terminal);
        let reason = outcome.reason();
        let elapsed = clock.elapsed();
        tracing::info!(
            %reason,
            ?state,
            exit_code = ?outcome.exit_code(),
            duration_ms = elapsed.as_millis() as u64,
            "run finished"
        );

        RunReport {
            id: request.id,
            reason,
            summary: reason.describe(),
            outcome,
            pid,
            input_delivered_bytes,
            input_truncated,
            duration_ms: elapsed.as_millis(),
            started_at,
            finished_at: Utc::now(),
        }
    }

    async fn supervise(&self, request: &RunRequest) -> (TerminalState, Option<u32>) {
        let mut lifecycle = Lifecycle::new();
        let run_id = request.id;
        let limits = request.limits;

        let (stdout_sink, stderr_sink) = match open_sinks(request).await {
            Ok(sinks) => sinks,
            Err(err) => {
                tracing::warn!(error = %err, "could not open output sinks");
                lifecycle.advance(SupervisorState::Failed);
                return (
                    TerminalState::failed(FailureCause::Capture(err.to_string())),
                    None,
                );
            }
        };

        let mut handle = match ProcessHandle::start(&request.invocation) {
            Ok(handle) => handle,
            Err(err) => {
                tracing::warn!(error = %err, "spawn failed");
                lifecycle.advance(SupervisorState::Failed);
                return (
                    TerminalState::failed(FailureCause::Spawn(err.to_string())),
                    None,
                );
            }
        };
        let pid = handle.pid();
        if let Some(pid) = pid {
            self.registry
                .register(run_id, pid, handle.executable().clone());
        }

        let (stdin, stdout, stderr) = match handle.take_pipes() {
            Ok(pipes) => pipes,
            Err(err) => {
                tracing::error!(error = %err, ?pid, "child started without its pipes");
                handle.kill();
                let _ = handle.wait().await;
                self.registry.deregister(&run_id);
                lifecycle.advance(SupervisorState::Failed);
                return (
                    TerminalState::failed(FailureCause::StreamIo(err.to_string())),
                    pid,
                );
            }
        };

        let signal = TerminationSignal::new();
        let stop = CancellationToken::new();
        let feeder = tokio::spawn(pump::feed(
            stdin,
            request.input.clone(),
            limits.ceiling(StreamRole::Stdin),
            limits.input_overflow,
            signal.clone(),
            stop.clone(),
        ));
        let mut stdout_task = tokio::spawn(pump::drain(
            stdout,
            StreamRole::Stdout,
            limits.ceiling(StreamRole::Stdout),
            stdout_sink,
            signal.clone(),
            stop.clone(),
        ));
        let mut stderr_task = tokio::spawn(pump::drain(
            stderr,
            StreamRole::Stderr,
            limits.ceiling(StreamRole::Stderr),
            stderr_sink,
            signal.clone(),
            stop.clone(),
        ));
        let timer = tokio::spawn(deadline_timer(limits.timeout(), signal.clone()));
        lifecycle.advance(SupervisorState::Running);

        let observed = tokio::select! {
            biased;
            reason = signal.tripped() => Observed::Tripped(reason),
            waited = handle.wait() => Observed::Exited(waited),
        };
        let waited = match observed {
            Observed::Tripped(reason) => {
                tracing::info!(%reason, ?pid, "terminating child");
                handle.kill();
                handle.wait().await
            }
            Observed::Exited(waited) => {
                match &waited {
                    Ok(_) => {
                        signal.trip(TerminationReason::Exited);
                    }
                    Err(err) => {
                        signal.trip(TerminationReason::Failure(format!(
                            "waiting on child failed: {err}"
                        )));
                        handle.kill();
                    }
                }
                waited
            }
        };
        timer.abort();

        let mut failure = None;
        let exit = match waited {
            Ok(exit) => Some(exit),
            Err(err) => {
                tracing::error!(error = %err, ?pid, "lost track of child process");
                failure = Some(FailureCause::Wait(err.to_string()));
                None
            }
        };

        let flushed = tokio::time::timeout(self.drain_grace, async {
            tokio::join!(&mut stdout_task, &mut stderr_task)
        })
        .await;
        let (stdout_joined, stderr_joined) = match flushed {
            Ok(joined) => joined,
            Err(_) => {
                tracing::warn!(
                    grace_ms = self.drain_grace.as_millis() as u64,
                    "output pipes still open after child ended; killing process group"
                );
                handle.kill_group();
                stop.cancel();
                tokio::join!(stdout_task, stderr_task)
            }
        };
        stop.cancel();
        let stdin_report = feeder.await.unwrap_or_else(|err| {
            FeedReport::failed(format!("stdin feeder task failed: {err}"))
        });

        self.registry.deregister(&run_id);
        drop(handle);

        let mut terminal = TerminalState {
            state: lifecycle.state,
            reason: signal.reason(),
            exit,
            stdout: Some(joined_drain(StreamRole::Stdout, stdout_joined)),
            stderr: Some(joined_drain(StreamRole::Stderr, stderr_joined)),
            stdin: Some(stdin_report),
            failure,
        };
        let state = terminal.resolve();
        lifecycle.advance(state);
        terminal.state = state;
        (terminal, pid)
    }
}

async fn open_sinks(
    request: &RunRequest,
) -> io::Result<(Box<dyn OutputSink>, Box<dyn OutputSink>)> {
    let stdout = open_sink(&request.capture, request.id, StreamRole::Stdout).await?;
    let stderr = open_sink(&request.capture, request.id, StreamRole::Stderr).await?;
    Ok((stdout, stderr))
}

async fn deadline_timer(deadline: Duration, signal: TerminationSignal) {
    tokio::time::sleep(deadline).await;
    if signal.trip(TerminationReason::Deadline) {
        tracing::info!(deadline_ms = deadline.as_millis() as u64, "deadline elapsed");
    }
}

fn joined_drain(
    role: StreamRole,
    joined: Result<DrainReport, tokio::task::JoinError>,
) -> DrainReport {
    joined.unwrap_or_else(|err| DrainReport::failed(role, format!("{role} drainer task failed: {err}")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::sandbox::sink::Captured;

    fn drain_report(role: StreamRole, status: PumpStatus) -> DrainReport {
        DrainReport {
            role,
            status,
            captured: Captured::default(),
        }
    }

    fn exited(code: i32) -> Option<ExitState> {
        Some(ExitState::Exited {
            code: Some(code),
            signal: None,
        })
    }

    fn running(reason: Option<TerminationReason>, exit: Option<ExitState>) -> TerminalState {
        TerminalState {
            state: SupervisorState::Running,
            reason,
            exit,
            stdout: Some(drain_report(StreamRole::Stdout, PumpStatus::Finished)),
            stderr: Some(drain_report(StreamRole::Stderr, PumpStatus::Finished)),
            stdin: None,
            failure: None,
        }
    }

    #[test]
    fn transitions_follow_the_state_machine() {
        use SupervisorState::*;
        assert!(Starting.can_advance_to(Running));
        assert!(Starting.can_advance_to(Failed));
        assert!(!Starting.can_advance_to(Completed));
        for terminal in [Completed, TimedOut, QuotaExceeded, Failed] {
            assert!(Running.can_advance_to(terminal));
            assert!(terminal.is_terminal());
            assert!(!terminal.can_advance_to(Running));
        }
        assert!(!Running.is_terminal());
    }

    #[test]
    fn natural_exit_resolves_to_completed() {
        let terminal = running(Some(TerminationReason::Exited), exited(0));
        assert_eq!(terminal.resolve(), SupervisorState::Completed);
    }

    #[test]
    fn deadline_wins_over_later_observations() {
        let mut terminal = running(Some(TerminationReason::Deadline), Some(ExitState::Killed));
        terminal.stdout = Some(drain_report(
            StreamRole::Stdout,
            PumpStatus::QuotaExceeded(QuotaExceeded {
                role: StreamRole::Stdout,
                ceiling: 1,
                observed: 2,
            }),
        ));
        assert_eq!(terminal.resolve(), SupervisorState::TimedOut);
    }

    #[test]
    fn quota_found_while_flushing_after_exit_is_a_violation() {
        let mut terminal = running(Some(TerminationReason::Exited), exited(0));
        let quota = QuotaExceeded {
            role: StreamRole::Stderr,
            ceiling: 10,
            observed: 11,
        };
        terminal.stderr = Some(drain_report(
            StreamRole::Stderr,
            PumpStatus::QuotaExceeded(quota),
        ));
        assert_eq!(terminal.resolve(), SupervisorState::QuotaExceeded);
        assert_eq!(terminal.quota(), Some(quota));
    }

    #[test]
    fn pipe_failure_after_exit_is_a_supervisor_failure() {
        let mut terminal = running(Some(TerminationReason::Exited), exited(0));
        terminal.stdout = Some(drain_report(
            StreamRole::Stdout,
            PumpStatus::Failed("reading stdout failed".into()),
        ));
        assert_eq!(terminal.resolve(), SupervisorState::Failed);
        assert_eq!(
            terminal.stream_failure().as_deref(),
            Some("reading stdout failed")
        );
    }

    #[test]
    fn missing_exit_status_is_a_failure() {
        let terminal = running(None, None);
        assert_eq!(terminal.resolve(), SupervisorState::Failed);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn late_kill_does_not_change_a_completed_run() {
        let invocation =
            crate::engine::models::Invocation::new("/bin/sh").args(["-c", "exit 0"]);
        let mut handle = ProcessHandle::start(&invocation).unwrap();
        let signal = TerminationSignal::new();
        let exit = handle.wait().await.unwrap();
        assert!(signal.trip(TerminationReason::Exited));

        handle.kill();
        handle.kill();
        assert!(!signal.trip(TerminationReason::Deadline));
        assert_eq!(handle.wait().await.unwrap(), exit);

        let mut terminal = running(signal.reason(), Some(exit));
        terminal.state = terminal.resolve();
        assert_eq!(terminal.state, SupervisorState::Completed);
        assert_eq!(classify(terminal).exit_code(), Some(0));
    }
}

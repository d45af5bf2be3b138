use bytes::Bytes;
use serde::{Deserialize, Serialize};

use crate::engine::{
    error::EngineError,
    models::{Invocation, Limits, RunReport, RunRequest},
    outcome::{FailureCause, RunOutcome},
    queue::Scheduler,
    sandbox::{SinkKind, StreamRole},
};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TestCase {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub input: String,
    pub expected_output: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "verdict", content = "detail", rename_all = "snake_case")]
pub enum Verdict {
    Passed,
    WrongAnswer,
    RuntimeError(i32),
    TimeLimit,
    OutputLimit(StreamRole),
    InputLimit,
    SpawnFailed,
    InternalError,
}

impl Verdict {
    pub fn is_passed(&self) -> bool {
        matches!(self, Self::Passed)
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct CaseResult {
    pub name: String,
    pub verdict: Verdict,
    pub report: RunReport,
}

/// Judges one finished run against its test case. A case without an
/// expected output passes on a zero exit code.
pub fn judge(case: &TestCase, outcome: &RunOutcome) -> Verdict {
    match outcome {
        RunOutcome::NormalExit { exit_code: 0, stdout, .. } => match &case.expected_output {
            None => Verdict::Passed,
            Some(expected) => match stdout.text() {
                Some(actual) if actual.trim_end() == expected.trim_end() => Verdict::Passed,
                Some(_) => Verdict::WrongAnswer,
                None => Verdict::InternalError,
            },
        },
        RunOutcome::NormalExit { exit_code, .. } => Verdict::RuntimeError(*exit_code),
        RunOutcome::TimedOut { .. } => Verdict::TimeLimit,
        RunOutcome::QuotaExceeded {
            stream: StreamRole::Stdin,
            ..
        } => Verdict::InputLimit,
        RunOutcome::QuotaExceeded { stream, .. } => Verdict::OutputLimit(*stream),
        RunOutcome::SupervisorFailure {
            cause: FailureCause::Spawn(_),
            ..
        } => Verdict::SpawnFailed,
        RunOutcome::SupervisorFailure { .. } => Verdict::InternalError,
    }
}

/// Runs every case through the scheduler and judges the reports. Cases run
/// concurrently up to the pool's worker count; results keep case order.
pub async fn grade_cases(
    scheduler: &Scheduler,
    invocation: &Invocation,
    limits: Limits,
    cases: Vec<TestCase>,
) -> Result<Vec<CaseResult>, EngineError> {
    let mut pending = Vec::with_capacity(cases.len());
    for (index, case) in cases.into_iter().enumerate() {
        let request = RunRequest::new(
            invocation.clone(),
            Bytes::from(case.input.clone().into_bytes()),
            limits,
        )
        .with_capture(SinkKind::Memory);
        let scheduler = scheduler.clone();
        pending.push((
            index,
            case,
            tokio::spawn(async move { scheduler.run(request).await }),
        ));
    }

    let mut results = Vec::with_capacity(pending.len());
    for (index, case, handle) in pending {
        let report = handle
            .await
            .map_err(|err| EngineError::Internal(format!("grading task failed: {err}")))??;
        let verdict = judge(&case, &report.outcome);
        let name = if case.name.is_empty() {
            format!("case-{}", index + 1)
        } else {
            case.name
        };
        tracing::info!(case = %name, verdict = ?verdict, reason = %report.reason, "case graded");
        results.push(CaseResult {
            name,
            verdict,
            report,
        });
    }
    Ok(results)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::sandbox::Captured;

    fn case(expected: Option<&str>) -> TestCase {
        TestCase {
            name: "sum".to_string(),
            input: "1 2\n".to_string(),
            expected_output: expected.map(str::to_string),
        }
    }

    fn exit(code: i32, stdout: &'static str) -> RunOutcome {
        RunOutcome::NormalExit {
            exit_code: code,
            signal: None,
            stdout: Captured::Memory {
                bytes: Bytes::from_static(stdout.as_bytes()),
            },
            stderr: Captured::default(),
        }
    }

    #[test]
    fn trailing_whitespace_is_ignored() {
        assert_eq!(judge(&case(Some("3")), &exit(0, "3\n\n")), Verdict::Passed);
        assert_eq!(judge(&case(Some("3\n")), &exit(0, "3 ")), Verdict::Passed);
        assert_eq!(judge(&case(Some("3")), &exit(0, " 3")), Verdict::WrongAnswer);
    }

    #[test]
    fn non_zero_exit_is_a_runtime_error() {
        assert_eq!(
            judge(&case(Some("3")), &exit(1, "3")),
            Verdict::RuntimeError(1)
        );
        assert_eq!(judge(&case(None), &exit(0, "")), Verdict::Passed);
    }

    #[test]
    fn limit_outcomes_map_to_limit_verdicts() {
        let quota = |stream| RunOutcome::QuotaExceeded {
            stream,
            ceiling: 10,
            observed_bytes: 11,
            stdout: Captured::default(),
            stderr: Captured::default(),
        };
        assert_eq!(
            judge(&case(None), &quota(StreamRole::Stderr)),
            Verdict::OutputLimit(StreamRole::Stderr)
        );
        assert_eq!(judge(&case(None), &quota(StreamRole::Stdin)), Verdict::InputLimit);
        assert_eq!(
            judge(
                &case(None),
                &RunOutcome::TimedOut {
                    stdout: Captured::default(),
                    stderr: Captured::default(),
                }
            ),
            Verdict::TimeLimit
        );
    }

    #[test]
    fn supervisor_failures_are_not_blamed_on_the_program() {
        let failure = |cause| RunOutcome::SupervisorFailure {
            cause,
            stdout: Captured::default(),
            stderr: Captured::default(),
        };
        assert_eq!(
            judge(&case(None), &failure(FailureCause::Spawn("gone".into()))),
            Verdict::SpawnFailed
        );
        assert_eq!(
            judge(&case(None), &failure(FailureCause::Wait("lost".into()))),
            Verdict::InternalError
        );
    }

    #[test]
    fn verdicts_serialize_with_detail() {
        let json = serde_json::to_value(Verdict::RuntimeError(2)).unwrap();
        assert_eq!(json["verdict"], "runtime_error");
        assert_eq!(json["detail"], 2);
    }
}

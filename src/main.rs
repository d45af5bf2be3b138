use std::{path::PathBuf, process::ExitCode};

use anyhow::Context;
use bytes::Bytes;
use clap::{Args, Parser, Subcommand};
use submission_sandbox::{
    Engine, EngineConfig, InputOverflow, Invocation, Limits, RunRequest, TestCase,
    engine::{grading::grade_cases, init_tracing, sandbox::SinkKind},
};

#[derive(Parser)]
#[command(name = "submission-sandbox")]
#[command(version, about = "Run untrusted submissions under time and output limits")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run one submission and print its report as JSON
    Run {
        #[command(flatten)]
        limits: LimitArgs,

        /// File whose contents are fed to the program's stdin
        #[arg(long)]
        input: Option<PathBuf>,

        /// Working directory for the program
        #[arg(long)]
        cwd: Option<PathBuf>,

        /// Write captured output to files in this directory
        #[arg(long)]
        capture_dir: Option<PathBuf>,

        /// Executable followed by its arguments
        #[arg(last = true, required = true)]
        command: Vec<String>,
    },

    /// Run a submission against a JSON list of test cases
    Grade {
        #[command(flatten)]
        limits: LimitArgs,

        /// JSON file holding `[{"name", "input", "expected_output"}]`
        #[arg(long)]
        cases: PathBuf,

        /// Number of cases run at once
        #[arg(long)]
        workers: Option<usize>,

        /// Working directory for the program
        #[arg(long)]
        cwd: Option<PathBuf>,

        /// Print run counters to stderr when done
        #[arg(long)]
        metrics: bool,

        /// Executable followed by its arguments
        #[arg(last = true, required = true)]
        command: Vec<String>,
    },
}

#[derive(Args)]
struct LimitArgs {
    /// Wall-clock limit in milliseconds
    #[arg(long)]
    timeout_ms: Option<u64>,

    /// Stdout ceiling in bytes
    #[arg(long)]
    max_stdout: Option<u64>,

    /// Stderr ceiling in bytes
    #[arg(long)]
    max_stderr: Option<u64>,

    /// Input ceiling in bytes
    #[arg(long)]
    max_input: Option<u64>,

    /// Deliver the part of an oversized input that fits instead of refusing it
    #[arg(long)]
    truncate_input: bool,
}

impl LimitArgs {
    fn apply(&self, base: Limits) -> Limits {
        Limits {
            timeout_ms: self.timeout_ms.unwrap_or(base.timeout_ms),
            max_stdout_bytes: self.max_stdout.unwrap_or(base.max_stdout_bytes),
            max_stderr_bytes: self.max_stderr.unwrap_or(base.max_stderr_bytes),
            max_input_bytes: self.max_input.unwrap_or(base.max_input_bytes),
            input_overflow: if self.truncate_input {
                InputOverflow::Truncate
            } else {
                base.input_overflow
            },
        }
        .normalized()
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<ExitCode> {
    let cli = Cli::parse();
    let mut config = EngineConfig::from_env();
    init_tracing(&config);

    match cli.command {
        Command::Run {
            limits,
            input,
            cwd,
            capture_dir,
            command,
        } => {
            let invocation = invocation(command, cwd)?;
            let payload = match input {
                Some(path) => tokio::fs::read(&path)
                    .await
                    .with_context(|| format!("failed to read input file {}", path.display()))?,
                None => Vec::new(),
            };
            if let Some(dir) = capture_dir {
                config.capture = SinkKind::File { dir };
            }
            config.worker_count = 1;

            let request = RunRequest::new(
                invocation,
                Bytes::from(payload),
                limits.apply(config.default_limits),
            )
            .with_capture(config.capture.clone());

            let engine = Engine::start(&config);
            let report = engine
                .scheduler
                .run(request)
                .await
                .context("run was not executed")?;
            engine.shutdown().await;

            println!(
                "{}",
                serde_json::to_string_pretty(&report).context("failed to encode report")?
            );
            Ok(ExitCode::SUCCESS)
        }
        Command::Grade {
            limits,
            cases,
            workers,
            cwd,
            metrics,
            command,
        } => {
            let invocation = invocation(command, cwd)?;
            let raw = tokio::fs::read_to_string(&cases)
                .await
                .with_context(|| format!("failed to read cases file {}", cases.display()))?;
            let cases: Vec<TestCase> =
                serde_json::from_str(&raw).context("cases file is not a JSON list of cases")?;
            if let Some(workers) = workers {
                config.worker_count = workers.max(1);
            }
            config.queue_capacity = config.queue_capacity.max(cases.len());

            let engine = Engine::start(&config);
            let results = grade_cases(
                &engine.scheduler,
                &invocation,
                limits.apply(config.default_limits),
                cases,
            )
            .await
            .context("grading failed")?;
            let all_passed = results.iter().all(|result| result.verdict.is_passed());
            if metrics {
                eprint!("{}", engine.metrics.render_prometheus());
            }
            engine.shutdown().await;

            println!(
                "{}",
                serde_json::to_string_pretty(&results).context("failed to encode results")?
            );
            Ok(if all_passed {
                ExitCode::SUCCESS
            } else {
                ExitCode::FAILURE
            })
        }
    }
}

fn invocation(command: Vec<String>, cwd: Option<PathBuf>) -> anyhow::Result<Invocation> {
    let mut parts = command.into_iter();
    let executable = parts.next().context("no executable given")?;
    let mut invocation = Invocation::new(executable).args(parts);
    if let Some(dir) = cwd {
        invocation = invocation.working_dir(dir);
    }
    Ok(invocation)
}

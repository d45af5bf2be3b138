use std::{env, path::PathBuf, str::FromStr, time::Duration};

use crate::engine::{
    models::{InputOverflow, Limits},
    sandbox::{DEFAULT_DRAIN_GRACE, SinkKind},
};

/// Drainers always get some time to empty pipes the child filled before it
/// exited; a zero grace would cut buffered output off.
const DRAIN_GRACE_MS_RANGE: (u64, u64) = (50, 60_000);

#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub worker_count: usize,
    pub queue_capacity: usize,
    pub default_limits: Limits,
    pub drain_grace_ms: u64,
    pub capture: SinkKind,
    pub log_level: String,
    pub log_format: LogFormat,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            worker_count: 4,
            queue_capacity: 1024,
            default_limits: Limits::default(),
            drain_grace_ms: DEFAULT_DRAIN_GRACE.as_millis() as u64,
            capture: SinkKind::Memory,
            log_level: "info".to_string(),
            log_format: LogFormat::Json,
        }
    }
}

impl EngineConfig {
    pub fn from_env() -> Self {
        Self::from_lookup(|key| env::var(key).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let defaults = Self::default();
        let limits = defaults.default_limits;
        Self {
            worker_count: parse_or(&lookup, "WORKER_COUNT", defaults.worker_count).max(1),
            queue_capacity: parse_or(&lookup, "QUEUE_CAPACITY", defaults.queue_capacity).max(1),
            default_limits: Limits {
                timeout_ms: parse_or(&lookup, "DEFAULT_TIMEOUT_MS", limits.timeout_ms),
                max_stdout_bytes: parse_or(
                    &lookup,
                    "DEFAULT_MAX_STDOUT_BYTES",
                    limits.max_stdout_bytes,
                ),
                max_stderr_bytes: parse_or(
                    &lookup,
                    "DEFAULT_MAX_STDERR_BYTES",
                    limits.max_stderr_bytes,
                ),
                max_input_bytes: parse_or(&lookup, "DEFAULT_MAX_INPUT_BYTES", limits.max_input_bytes),
                input_overflow: parse_or(&lookup, "INPUT_OVERFLOW", InputOverflow::Abort),
            }
            .normalized(),
            drain_grace_ms: parse_or(&lookup, "DRAIN_GRACE_MS", defaults.drain_grace_ms)
                .clamp(DRAIN_GRACE_MS_RANGE.0, DRAIN_GRACE_MS_RANGE.1),
            capture: lookup("CAPTURE_DIR")
                .filter(|dir| !dir.trim().is_empty())
                .map(|dir| SinkKind::File {
                    dir: PathBuf::from(dir),
                })
                .unwrap_or(SinkKind::Memory),
            log_level: lookup("LOG_LEVEL").unwrap_or(defaults.log_level),
            log_format: parse_or(&lookup, "LOG_FORMAT", defaults.log_format),
        }
    }

    pub fn drain_grace(&self) -> Duration {
        Duration::from_millis(self.drain_grace_ms)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum LogFormat {
    #[default]
    Json,
    Compact,
}

impl FromStr for LogFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "json" => Ok(Self::Json),
            "compact" => Ok(Self::Compact),
            _ => Err(format!("unsupported log format: {s}")),
        }
    }
}

fn parse_or<T>(lookup: &impl Fn(&str) -> Option<String>, key: &str, default: T) -> T
where
    T: FromStr,
{
    lookup(key)
        .and_then(|raw| raw.trim().parse().ok())
        .unwrap_or(default)
}

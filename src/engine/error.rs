use std::{io, path::PathBuf};

use thiserror::Error;

use crate::engine::sandbox::StreamRole;

/// The submission could not be launched at all.
#[derive(Debug, Error)]
pub enum SpawnError {
    #[error("executable not found: {}", .0.display())]
    NotFound(PathBuf),
    #[error("permission denied launching {}", .0.display())]
    PermissionDenied(PathBuf),
    #[error("working directory {} is not accessible", .0.display())]
    WorkingDirectory(PathBuf),
    #[error("{role} pipe was not captured")]
    MissingPipe { role: StreamRole },
    #[error("failed to spawn {}: {source}", .path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

impl SpawnError {
    pub(crate) fn from_io(path: PathBuf, source: io::Error) -> Self {
        match source.kind() {
            io::ErrorKind::NotFound => Self::NotFound(path),
            io::ErrorKind::PermissionDenied => Self::PermissionDenied(path),
            _ => Self::Io { path, source },
        }
    }
}

/// Errors surfaced to whoever dispatches runs into the engine.
///
/// Misbehaving submissions never show up here; they are folded into the
/// run's outcome instead.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("invalid limits: {0}")]
    InvalidLimits(String),
    #[error("queue is full")]
    QueueFull,
    #[error("queue is closed")]
    QueueClosed,
    #[error("worker dropped the job before reporting")]
    WorkerDropped,
    #[error("internal error: {0}")]
    Internal(String),
}

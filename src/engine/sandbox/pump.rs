use std::io;

use bytes::Bytes;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_util::sync::CancellationToken;

use crate::engine::{
    models::InputOverflow,
    sandbox::{
        bounded::{
            BoundedReader, BoundedWriter, Overflow, QuotaExceeded, ReadOutcome, StreamRole,
            WriteOutcome,
        },
        sink::{Captured, OutputSink},
        termination::{TerminationReason, TerminationSignal},
    },
};

const READ_CHUNK_SIZE: usize = 8192;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PumpStatus {
    /// Stream reached its natural end.
    Finished,
    QuotaExceeded(QuotaExceeded),
    /// Released by the supervisor's stop token.
    Stopped,
    Failed(String),
}

#[derive(Debug, Clone)]
pub struct DrainReport {
    pub role: StreamRole,
    pub status: PumpStatus,
    pub captured: Captured,
}

impl DrainReport {
    pub(crate) fn failed(role: StreamRole, message: String) -> Self {
        Self {
            role,
            status: PumpStatus::Failed(message),
            captured: Captured::default(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct FeedReport {
    pub status: PumpStatus,
    pub delivered: u64,
    /// The payload was cut at the input ceiling under the truncate policy.
    pub truncated: bool,
    /// The child closed its end before the whole payload was written.
    pub closed_early: bool,
}

impl FeedReport {
    pub(crate) fn failed(message: String) -> Self {
        Self {
            status: PumpStatus::Failed(message),
            delivered: 0,
            truncated: false,
            closed_early: false,
        }
    }
}

/// Copies one output stream into `sink` until end-of-stream, quota, failure
/// or stop. Quota and failure trip `signal`; killing the child is left to the
/// supervisor.
pub async fn drain<R>(
    reader: R,
    role: StreamRole,
    ceiling: u64,
    mut sink: Box<dyn OutputSink>,
    signal: TerminationSignal,
    stop: CancellationToken,
) -> DrainReport
where
    R: AsyncRead + Unpin,
{
    let mut bounded = BoundedReader::new(reader, role, ceiling);
    let mut chunk = vec![0u8; READ_CHUNK_SIZE];

    let status = loop {
        let read = tokio::select! {
            biased;
            _ = stop.cancelled() => break PumpStatus::Stopped,
            read = bounded.read(&mut chunk) => read,
        };
        match read {
            Ok(ReadOutcome::Data(n)) => {
                if let Err(err) = sink.accept(&chunk[..n]).await {
                    let message = format!("writing captured {role} failed: {err}");
                    signal.trip(TerminationReason::Failure(message.clone()));
                    break PumpStatus::Failed(message);
                }
            }
            Ok(ReadOutcome::Eof) => break PumpStatus::Finished,
            Ok(ReadOutcome::QuotaExceeded(quota)) => {
                tracing::info!(stream = %role, ceiling, "output quota exceeded");
                signal.trip(TerminationReason::Quota(quota));
                break PumpStatus::QuotaExceeded(quota);
            }
            Err(err) => {
                let message = format!("reading {role} failed: {err}");
                signal.trip(TerminationReason::Failure(message.clone()));
                break PumpStatus::Failed(message);
            }
        }
    };

    let transferred = bounded.transferred();
    match sink.finish().await {
        Ok(captured) => {
            tracing::debug!(stream = %role, bytes = transferred, ?status, "drain finished");
            DrainReport {
                role,
                status,
                captured,
            }
        }
        Err(err) => {
            let message = format!("finalising captured {role} failed: {err}");
            signal.trip(TerminationReason::Failure(message.clone()));
            DrainReport::failed(role, message)
        }
    }
}

/// Writes `payload` to the child's stdin and then closes it.
///
/// A child that stops reading and exits surfaces as a broken pipe, which ends
/// feeding normally.
pub async fn feed<W>(
    writer: W,
    payload: Bytes,
    ceiling: u64,
    policy: InputOverflow,
    signal: TerminationSignal,
    stop: CancellationToken,
) -> FeedReport
where
    W: AsyncWrite + Unpin,
{
    let overflow = match policy {
        InputOverflow::Abort => Overflow::Refuse,
        InputOverflow::Truncate => Overflow::Partial,
    };
    let mut bounded = BoundedWriter::new(writer, StreamRole::Stdin, ceiling, overflow);

    let written = tokio::select! {
        biased;
        _ = stop.cancelled() => None,
        written = bounded.write_all(&payload) => Some(written),
    };

    let mut report = FeedReport {
        status: PumpStatus::Finished,
        delivered: 0,
        truncated: false,
        closed_early: false,
    };
    match written {
        None => report.status = PumpStatus::Stopped,
        Some(Ok(WriteOutcome::Written(_))) => {}
        Some(Ok(WriteOutcome::QuotaExceeded { written, quota })) => match policy {
            InputOverflow::Abort => {
                tracing::info!(ceiling, payload = payload.len(), "input quota exceeded");
                signal.trip(TerminationReason::Quota(quota));
                report.status = PumpStatus::QuotaExceeded(quota);
            }
            InputOverflow::Truncate => {
                tracing::debug!(written, payload = payload.len(), "input truncated at quota");
                report.truncated = true;
            }
        },
        Some(Err(err)) if is_closed_pipe(&err) => report.closed_early = true,
        Some(Err(err)) => {
            let message = format!("writing stdin failed: {err}");
            signal.trip(TerminationReason::Failure(message.clone()));
            report.status = PumpStatus::Failed(message);
        }
    }

    if let Err(err) = bounded.shutdown().await {
        if !is_closed_pipe(&err) {
            tracing::debug!(error = %err, "closing stdin failed");
        }
    }
    report.delivered = bounded.transferred();
    report
}

fn is_closed_pipe(err: &io::Error) -> bool {
    matches!(
        err.kind(),
        io::ErrorKind::BrokenPipe | io::ErrorKind::ConnectionReset
    )
}

use std::{fmt, io};

use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Which standard stream of the child a bounded stream wraps.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StreamRole {
    Stdin,
    Stdout,
    Stderr,
}

impl StreamRole {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Stdin => "stdin",
            Self::Stdout => "stdout",
            Self::Stderr => "stderr",
        }
    }
}

impl fmt::Display for StreamRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A byte ceiling was crossed on one stream.
///
/// `observed` is the total the stream would have reached had the operation
/// gone through, so it is always strictly greater than `ceiling`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct QuotaExceeded {
    pub role: StreamRole,
    pub ceiling: u64,
    pub observed: u64,
}

impl fmt::Display for QuotaExceeded {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} quota of {} bytes exceeded ({} bytes observed)",
            self.role, self.ceiling, self.observed
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadOutcome {
    Data(usize),
    Eof,
    QuotaExceeded(QuotaExceeded),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteOutcome {
    Written(usize),
    /// `written` bytes of the buffer reached the underlying stream before the
    /// ceiling stopped the rest.
    QuotaExceeded {
        written: usize,
        quota: QuotaExceeded,
    },
}

/// What a writer does with a buffer that does not fit under its ceiling.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Overflow {
    /// Write the prefix that fits, then report the quota.
    Partial,
    /// Write nothing from the offending buffer.
    Refuse,
}

/// Read half of a bounded stream.
///
/// Reads never request more than the bytes left under the ceiling. Once the
/// ceiling is reached a single-byte probe decides between end-of-stream and a
/// quota violation; the probe byte is never handed to the caller.
pub struct BoundedReader<R> {
    inner: R,
    role: StreamRole,
    ceiling: u64,
    transferred: u64,
    tripped: Option<QuotaExceeded>,
}

impl<R> BoundedReader<R>
where
    R: AsyncRead + Unpin,
{
    pub fn new(inner: R, role: StreamRole, ceiling: u64) -> Self {
        Self {
            inner,
            role,
            ceiling,
            transferred: 0,
            tripped: None,
        }
    }

    pub async fn read(&mut self, buf: &mut [u8]) -> io::Result<ReadOutcome> {
        if let Some(quota) = self.tripped {
            return Ok(ReadOutcome::QuotaExceeded(quota));
        }
        if buf.is_empty() {
            return Ok(ReadOutcome::Data(0));
        }

        let remaining = self.ceiling.saturating_sub(self.transferred);
        if remaining == 0 {
            let mut probe = [0u8; 1];
            if self.inner.read(&mut probe).await? == 0 {
                return Ok(ReadOutcome::Eof);
            }
            let quota = QuotaExceeded {
                role: self.role,
                ceiling: self.ceiling,
                observed: self.transferred + 1,
            };
            self.tripped = Some(quota);
            return Ok(ReadOutcome::QuotaExceeded(quota));
        }

        let want = usize::try_from(remaining).map_or(buf.len(), |r| r.min(buf.len()));
        let n = self.inner.read(&mut buf[..want]).await?;
        if n == 0 {
            return Ok(ReadOutcome::Eof);
        }
        self.transferred += n as u64;
        Ok(ReadOutcome::Data(n))
    }

    pub fn transferred(&self) -> u64 {
        self.transferred
    }
}

/// Write half of a bounded stream.
pub struct BoundedWriter<W> {
    inner: W,
    role: StreamRole,
    ceiling: u64,
    overflow: Overflow,
    transferred: u64,
    tripped: Option<QuotaExceeded>,
}

impl<W> BoundedWriter<W>
where
    W: AsyncWrite + Unpin,
{
    pub fn new(inner: W, role: StreamRole, ceiling: u64, overflow: Overflow) -> Self {
        Self {
            inner,
            role,
            ceiling,
            overflow,
            transferred: 0,
            tripped: None,
        }
    }

    /// Writes the whole buffer, or as much of it as the overflow mode allows.
    pub async fn write_all(&mut self, buf: &[u8]) -> io::Result<WriteOutcome> {
        if let Some(quota) = self.tripped {
            return Ok(WriteOutcome::QuotaExceeded { written: 0, quota });
        }

        let remaining = self.ceiling.saturating_sub(self.transferred);
        let len = buf.len() as u64;
        if len <= remaining {
            self.inner.write_all(buf).await?;
            self.transferred += len;
            return Ok(WriteOutcome::Written(buf.len()));
        }

        let observed = self.transferred + len;
        let fits = match self.overflow {
            Overflow::Partial => remaining as usize,
            Overflow::Refuse => 0,
        };
        if fits > 0 {
            self.inner.write_all(&buf[..fits]).await?;
            self.transferred += fits as u64;
        }

        let quota = QuotaExceeded {
            role: self.role,
            ceiling: self.ceiling,
            observed,
        };
        self.tripped = Some(quota);
        Ok(WriteOutcome::QuotaExceeded {
            written: fits,
            quota,
        })
    }

    pub async fn shutdown(&mut self) -> io::Result<()> {
        self.inner.shutdown().await
    }

    pub fn transferred(&self) -> u64 {
        self.transferred
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn drain_all<R: AsyncRead + Unpin>(
        reader: &mut BoundedReader<R>,
    ) -> (Vec<u8>, ReadOutcome) {
        let mut out = Vec::new();
        let mut chunk = [0u8; 7];
        loop {
            match reader.read(&mut chunk).await.unwrap() {
                ReadOutcome::Data(n) => out.extend_from_slice(&chunk[..n]),
                other => return (out, other),
            }
        }
    }

    #[tokio::test]
    async fn reader_under_ceiling_reaches_eof() {
        let mut reader = BoundedReader::new(&b"hello world"[..], StreamRole::Stdout, 100);
        let (out, end) = drain_all(&mut reader).await;
        assert_eq!(out, b"hello world");
        assert_eq!(end, ReadOutcome::Eof);
        assert_eq!(reader.transferred(), 11);
    }

    #[tokio::test]
    async fn reader_exactly_at_ceiling_is_not_a_violation() {
        let mut reader = BoundedReader::new(&b"0123456789"[..], StreamRole::Stdout, 10);
        let (out, end) = drain_all(&mut reader).await;
        assert_eq!(out.len(), 10);
        assert_eq!(end, ReadOutcome::Eof);
        assert_eq!(
            reader.read(&mut [0u8; 4]).await.unwrap(),
            ReadOutcome::Eof
        );
    }

    #[tokio::test]
    async fn reader_over_ceiling_stops_at_the_boundary() {
        let data = vec![b'x'; 1000];
        let mut reader = BoundedReader::new(&data[..], StreamRole::Stderr, 100);
        let (out, end) = drain_all(&mut reader).await;
        assert_eq!(out.len(), 100);
        let ReadOutcome::QuotaExceeded(quota) = end else {
            panic!("expected quota violation, got {end:?}");
        };
        assert_eq!(quota.role, StreamRole::Stderr);
        assert_eq!(quota.ceiling, 100);
        assert_eq!(quota.observed, 101);

        // Sticky: later reads keep reporting the violation.
        let mut chunk = [0u8; 4];
        assert_eq!(
            reader.read(&mut chunk).await.unwrap(),
            ReadOutcome::QuotaExceeded(quota)
        );
    }

    #[tokio::test]
    async fn zero_ceiling_rejects_first_byte() {
        let mut reader = BoundedReader::new(&b"a"[..], StreamRole::Stdout, 0);
        let mut chunk = [0u8; 16];
        let outcome = reader.read(&mut chunk).await.unwrap();
        assert!(matches!(outcome, ReadOutcome::QuotaExceeded(_)));
        assert_eq!(reader.transferred(), 0);
    }

    #[tokio::test]
    async fn writer_partial_mode_writes_the_prefix() {
        let mut sink = Vec::new();
        let mut writer = BoundedWriter::new(&mut sink, StreamRole::Stdin, 4, Overflow::Partial);
        let outcome = writer.write_all(b"abcdef").await.unwrap();
        assert_eq!(
            outcome,
            WriteOutcome::QuotaExceeded {
                written: 4,
                quota: QuotaExceeded {
                    role: StreamRole::Stdin,
                    ceiling: 4,
                    observed: 6,
                },
            }
        );
        assert_eq!(writer.transferred(), 4);
        let again = writer.write_all(b"z").await.unwrap();
        assert!(matches!(again, WriteOutcome::QuotaExceeded { written: 0, .. }));
        drop(writer);
        assert_eq!(sink, b"abcd");
    }

    #[tokio::test]
    async fn writer_refuse_mode_writes_nothing_of_the_offending_buffer() {
        let mut sink = Vec::new();
        let mut writer = BoundedWriter::new(&mut sink, StreamRole::Stdin, 5, Overflow::Refuse);
        assert_eq!(
            writer.write_all(b"abc").await.unwrap(),
            WriteOutcome::Written(3)
        );
        let outcome = writer.write_all(b"defg").await.unwrap();
        assert!(matches!(outcome, WriteOutcome::QuotaExceeded { written: 0, .. }));
        drop(writer);
        assert_eq!(sink, b"abc");
    }
}

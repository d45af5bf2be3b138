use std::{io, path::PathBuf};

use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use serde::{Deserialize, Serialize, Serializer};
use tokio::io::AsyncWriteExt;
use uuid::Uuid;

use crate::engine::sandbox::bounded::StreamRole;

/// Where drained output ends up.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum SinkKind {
    #[default]
    Memory,
    File {
        dir: PathBuf,
    },
}

/// Output captured from one stream, possibly cut short at its ceiling.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Captured {
    Memory {
        #[serde(rename = "text", serialize_with = "lossy_utf8")]
        bytes: Bytes,
    },
    File {
        path: PathBuf,
        len: u64,
    },
}

impl Default for Captured {
    fn default() -> Self {
        Self::Memory {
            bytes: Bytes::new(),
        }
    }
}

impl Captured {
    pub fn len(&self) -> u64 {
        match self {
            Self::Memory { bytes } => bytes.len() as u64,
            Self::File { len, .. } => *len,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// In-memory bytes; `None` for file captures.
    pub fn as_bytes(&self) -> Option<&[u8]> {
        match self {
            Self::Memory { bytes } => Some(bytes),
            Self::File { .. } => None,
        }
    }

    pub fn text(&self) -> Option<String> {
        self.as_bytes()
            .map(|bytes| String::from_utf8_lossy(bytes).into_owned())
    }
}

fn lossy_utf8<S: Serializer>(bytes: &Bytes, serializer: S) -> Result<S::Ok, S::Error> {
    serializer.serialize_str(&String::from_utf8_lossy(bytes))
}

#[async_trait]
pub trait OutputSink: Send {
    async fn accept(&mut self, chunk: &[u8]) -> io::Result<()>;
    async fn finish(self: Box<Self>) -> io::Result<Captured>;
}

#[derive(Default)]
pub struct MemorySink {
    buf: BytesMut,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl OutputSink for MemorySink {
    async fn accept(&mut self, chunk: &[u8]) -> io::Result<()> {
        self.buf.extend_from_slice(chunk);
        Ok(())
    }

    async fn finish(self: Box<Self>) -> io::Result<Captured> {
        Ok(Captured::Memory {
            bytes: self.buf.freeze(),
        })
    }
}

pub struct FileSink {
    path: PathBuf,
    file: tokio::fs::File,
    len: u64,
}

impl FileSink {
    pub async fn create(dir: &std::path::Path, run_id: Uuid, role: StreamRole) -> io::Result<Self> {
        tokio::fs::create_dir_all(dir).await?;
        let path = dir.join(format!("{}-{}.out", run_id.as_simple(), role));
        let file = tokio::fs::File::create(&path).await?;
        Ok(Self { path, file, len: 0 })
    }
}

#[async_trait]
impl OutputSink for FileSink {
    async fn accept(&mut self, chunk: &[u8]) -> io::Result<()> {
        self.file.write_all(chunk).await?;
        self.len += chunk.len() as u64;
        Ok(())
    }

    async fn finish(mut self: Box<Self>) -> io::Result<Captured> {
        self.file.flush().await?;
        Ok(Captured::File {
            path: self.path,
            len: self.len,
        })
    }
}

pub async fn open_sink(
    kind: &SinkKind,
    run_id: Uuid,
    role: StreamRole,
) -> io::Result<Box<dyn OutputSink>> {
    match kind {
        SinkKind::Memory => Ok(Box::new(MemorySink::new())),
        SinkKind::File { dir } => Ok(Box::new(FileSink::create(dir, run_id, role).await?)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn memory_sink_accumulates_chunks() {
        let mut sink = open_sink(&SinkKind::Memory, Uuid::new_v4(), StreamRole::Stdout)
            .await
            .unwrap();
        sink.accept(b"abc").await.unwrap();
        sink.accept(b"def").await.unwrap();
        let captured = sink.finish().await.unwrap();
        assert_eq!(captured.as_bytes(), Some(&b"abcdef"[..]));
        assert_eq!(captured.len(), 6);
    }

    #[tokio::test]
    async fn file_sink_writes_under_capture_dir() {
        let dir = tempfile::tempdir().unwrap();
        let kind = SinkKind::File {
            dir: dir.path().to_path_buf(),
        };
        let mut sink = open_sink(&kind, Uuid::new_v4(), StreamRole::Stderr)
            .await
            .unwrap();
        sink.accept(b"oops\n").await.unwrap();
        let captured = sink.finish().await.unwrap();
        let Captured::File { path, len } = &captured else {
            panic!("expected file capture, got {captured:?}");
        };
        assert_eq!(*len, 5);
        assert!(path.starts_with(dir.path()));
        assert!(path.to_string_lossy().ends_with("-stderr.out"));
        assert_eq!(std::fs::read(path).unwrap(), b"oops\n");
        assert!(captured.as_bytes().is_none());
    }

    #[test]
    fn memory_capture_serializes_as_text() {
        let captured = Captured::Memory {
            bytes: Bytes::from_static(b"hi"),
        };
        let json = serde_json::to_value(&captured).unwrap();
        assert_eq!(json["kind"], "memory");
        assert_eq!(json["text"], "hi");
    }
}

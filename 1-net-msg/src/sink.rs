//! Append-only log of accepted payloads, one per line.

use std::path::Path;

use tokio::{
    fs::{File, OpenOptions},
    io::{AsyncWrite, AsyncWriteExt},
};

use crate::error::{NetMsgError, Result};

/// Opened once for the life of the server. Every line is flushed before
/// `append` returns, so an acknowledged payload is already with the OS.
pub struct LogSink<W = File> {
    writer: W,
}

impl LogSink<File> {
    pub async fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let file = OpenOptions::new()
            .append(true)
            .create(true)
            .open(path)
            .await
            .map_err(|source| NetMsgError::OpenSink {
                path: path.display().to_string(),
                source,
            })?;
        Ok(Self::new(file))
    }
}

impl<W> LogSink<W>
where
    W: AsyncWrite + Unpin,
{
    pub fn new(writer: W) -> Self {
        Self { writer }
    }

    pub async fn append(&mut self, payload: &str) -> std::io::Result<()> {
        let mut line = Vec::with_capacity(payload.len() + 1);
        line.extend_from_slice(payload.as_bytes());
        line.push(b'\n');
        self.writer.write_all(&line).await?;
        self.writer.flush().await
    }

    pub async fn flush(&mut self) -> std::io::Result<()> {
        self.writer.flush().await
    }

    pub fn into_inner(self) -> W {
        self.writer
    }
}

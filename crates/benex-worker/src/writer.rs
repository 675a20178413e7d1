//! Buffered NDJSON writer for sub-job staging output.

use std::path::Path;

use serde_json::Value;
use tokio::fs::File;
use tokio::io::{AsyncWriteExt, BufWriter};

use crate::error::WorkerError;

/// Writes one resource per line into a staging file.
pub struct NdjsonWriter {
    writer: BufWriter<File>,
    bytes_written: u64,
}

impl NdjsonWriter {
    /// Creates (truncating) the staging file.
    pub async fn create(path: &Path) -> Result<Self, WorkerError> {
        let file = File::create(path).await?;
        Ok(Self {
            writer: BufWriter::new(file),
            bytes_written: 0,
        })
    }

    /// Appends one resource as a single NDJSON line.
    pub async fn write_resource(&mut self, resource: &Value) -> Result<(), WorkerError> {
        let mut line = serde_json::to_vec(resource)?;
        line.push(b'\n');
        self.writer.write_all(&line).await?;
        self.bytes_written += line.len() as u64;
        Ok(())
    }

    /// Flushes and closes the file, returning the number of bytes written.
    /// A zero return means the file carries no output at all.
    pub async fn finish(mut self) -> Result<u64, WorkerError> {
        self.writer.flush().await?;
        self.writer.into_inner().sync_all().await?;
        Ok(self.bytes_written)
    }
}

//! Row exporters.

use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::io::{AsyncWrite, AsyncWriteExt, BufWriter};
use tokio::sync::Mutex;

use crate::Result;
use crate::error::IngressError;
use crate::row::Row;
use crate::source::RowExporter;

/// Writes one JSON document per row, newline separated.
pub struct JsonLinesExporter<W: AsyncWrite + Unpin + Send> {
    writer: BufWriter<W>,
}

impl<W: AsyncWrite + Unpin + Send> JsonLinesExporter<W> {
    /// Wraps `writer` in a buffered JSON-lines exporter.
    pub fn new(writer: W) -> Self {
        Self {
            writer: BufWriter::new(writer),
        }
    }

    /// Returns the inner writer. Unflushed output is discarded.
    pub fn into_inner(self) -> W {
        self.writer.into_inner()
    }
}

impl JsonLinesExporter<tokio::fs::File> {
    /// Creates (or truncates) `path` and exports into it.
    ///
    /// # Errors
    /// Returns an I/O error if the file cannot be created.
    pub async fn create(path: &Path) -> Result<Self> {
        let file = tokio::fs::File::create(path)
            .await
            .map_err(|e| IngressError::Io {
                context: format!("Failed to create output file {}", path.display()),
                source: e,
            })?;
        Ok(Self::new(file))
    }
}

impl JsonLinesExporter<tokio::io::Stdout> {
    /// Exports to standard output.
    pub fn stdout() -> Self {
        Self::new(tokio::io::stdout())
    }
}

#[async_trait]
impl<W: AsyncWrite + Unpin + Send> RowExporter for JsonLinesExporter<W> {
    async fn export(&mut self, row: Row) -> Result<()> {
        let mut line = serde_json::to_vec(&row).map_err(|e| IngressError::Serialization {
            context: "Failed to serialize exported row".to_string(),
            source: e,
        })?;
        line.push(b'\n');

        self.writer
            .write_all(&line)
            .await
            .map_err(|e| IngressError::export_failed("Failed to write row", e))
    }

    async fn finish(&mut self) -> Result<()> {
        self.writer
            .flush()
            .await
            .map_err(|e| IngressError::export_failed("Failed to flush exported rows", e))
    }
}

/// Collects exported rows in memory.
///
/// Clones share the same row buffer, so a handle kept by the caller sees the
/// rows exported through a clone moved into a puller.
#[derive(Debug, Clone, Default)]
pub struct MemoryExporter {
    rows: Arc<Mutex<Vec<Row>>>,
    fail_after: Option<usize>,
}

impl MemoryExporter {
    /// Creates an empty exporter.
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder method rejecting every row once `count` rows were accepted.
    pub fn with_failure_after(mut self, count: usize) -> Self {
        self.fail_after = Some(count);
        self
    }

    /// Rows exported so far, in export order.
    pub async fn rows(&self) -> Vec<Row> {
        self.rows.lock().await.clone()
    }

    /// Number of rows exported so far.
    pub async fn len(&self) -> usize {
        self.rows.lock().await.len()
    }

    /// Returns true if nothing was exported yet.
    pub async fn is_empty(&self) -> bool {
        self.rows.lock().await.is_empty()
    }
}

#[async_trait]
impl RowExporter for MemoryExporter {
    async fn export(&mut self, row: Row) -> Result<()> {
        let mut rows = self.rows.lock().await;
        if self.fail_after.is_some_and(|limit| rows.len() >= limit) {
            return Err(IngressError::export_failed(
                "Exporter rejected row",
                std::io::Error::other("export capacity reached"),
            ));
        }
        rows.push(row);
        Ok(())
    }
}

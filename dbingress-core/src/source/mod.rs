//! Collaborator contracts consumed by the planner and the pullers.
//!
//! Everything that touches the outside world sits behind one of these traits:
//! the live data rows ([`DataSource`]), schema metadata ([`RelationReader`]),
//! descriptor persistence ([`DescriptorStorage`]) and the output stream
//! ([`RowExporter`]). All traits are object-safe so the pullers work through
//! `Arc<dyn DataSource>` and `Box<dyn RowExporter>`.
//!
//! # Module Structure
//! - `memory`: in-memory data source and relation reader
//! - `sqlite`: SQLite data source and relation reader (feature `sqlite`)

pub mod memory;
#[cfg(feature = "sqlite")]
pub mod sqlite;

use async_trait::async_trait;

use crate::Result;
use crate::models::{Catalog, IngressDescriptor, Table};
use crate::row::{Filter, Row};

pub use memory::MemorySource;
#[cfg(feature = "sqlite")]
pub use sqlite::SqliteSource;

/// Optional query capabilities of a data source.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SourceFeature {
    /// Free-form predicates in [`Filter::predicate`]
    Predicate,
    /// `DISTINCT` reads
    Distinct,
    /// Row-count limits
    Limit,
    /// Concurrent `query` calls from several workers
    ConcurrentQueries,
}

/// Live row source.
///
/// # Concurrency
/// The parallel puller shares one instance across all workers, so `query` may
/// be called concurrently once `open` has returned.
#[async_trait]
pub trait DataSource: Send + Sync {
    /// Short name used in logs and errors.
    fn kind(&self) -> &'static str;

    /// Checks if the source supports a specific capability.
    fn supports_feature(&self, feature: SourceFeature) -> bool;

    /// Prepares the source for reading.
    ///
    /// # Errors
    /// Returns a data-source error if the source cannot be reached.
    async fn open(&self) -> Result<()>;

    /// Releases resources held by the source.
    ///
    /// # Errors
    /// Returns a data-source error if shutdown fails.
    async fn close(&self) -> Result<()>;

    /// Reads the rows of `table` matching `filter`, in source order.
    ///
    /// Equality values are positional over composite keys. The limit, when
    /// present, caps the number of returned rows.
    ///
    /// # Errors
    /// Returns a data-source error on any read failure.
    async fn query(&self, table: &Table, filter: &Filter) -> Result<Vec<Row>>;
}

/// Supplier of table and relation metadata.
#[async_trait]
pub trait RelationReader: Send + Sync {
    /// Reads every known table and relation.
    ///
    /// # Errors
    /// Returns a data-source error if the metadata cannot be read.
    async fn read_catalog(&self) -> Result<Catalog>;
}

/// Persistence for ingress descriptors.
#[async_trait]
pub trait DescriptorStorage: Send + Sync {
    /// Reads the stored descriptor.
    ///
    /// # Errors
    /// Returns an I/O or serialization error if no valid descriptor is stored.
    async fn read_descriptor(&self) -> Result<IngressDescriptor>;

    /// Replaces the stored descriptor.
    ///
    /// # Errors
    /// Returns an I/O or serialization error if the descriptor cannot be written.
    async fn store_descriptor(&self, descriptor: &IngressDescriptor) -> Result<()>;
}

/// Sink receiving fully assembled rows, one at a time.
#[async_trait]
pub trait RowExporter: Send {
    /// Writes one row.
    ///
    /// # Errors
    /// Returns an export error if the row cannot be written.
    async fn export(&mut self, row: Row) -> Result<()>;

    /// Flushes buffered output once the pull is over.
    ///
    /// # Errors
    /// Returns an export error if buffered rows cannot be written.
    async fn finish(&mut self) -> Result<()> {
        Ok(())
    }
}

#[async_trait]
impl<T: RowExporter + ?Sized> RowExporter for Box<T> {
    async fn export(&mut self, row: Row) -> Result<()> {
        (**self).export(row).await
    }

    async fn finish(&mut self) -> Result<()> {
        (**self).finish().await
    }
}

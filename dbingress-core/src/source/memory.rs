//! In-memory data source.
//!
//! Holds rows per table in insertion order and answers equality filters,
//! limits and distinct reads. Counts queries and can be told to fail on a
//! table, which is what the engine tests use instead of a database.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use tracing::{debug, warn};

use super::{DataSource, RelationReader, SourceFeature};
use crate::Result;
use crate::error::IngressError;
use crate::models::{Catalog, Table};
use crate::row::{Filter, Row};

/// Data source backed by rows held in memory.
#[derive(Debug, Default)]
pub struct MemorySource {
    tables: BTreeMap<String, Vec<Row>>,
    catalog: Catalog,
    failing_table: Option<String>,
    latency: Option<Duration>,
    queries: AtomicU64,
    opened: AtomicU64,
    closed: AtomicU64,
}

impl MemorySource {
    /// Creates an empty source.
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder method to add rows to `table`.
    pub fn with_rows<I>(mut self, table: impl Into<String>, rows: I) -> Self
    where
        I: IntoIterator<Item = Row>,
    {
        self.tables.entry(table.into()).or_default().extend(rows);
        self
    }

    /// Builder method to add rows given as JSON objects.
    ///
    /// Values that are not objects are skipped with a warning.
    pub fn with_json_rows<I>(self, table: impl Into<String>, rows: I) -> Self
    where
        I: IntoIterator<Item = serde_json::Value>,
    {
        let table = table.into();
        let rows: Vec<Row> = rows
            .into_iter()
            .filter_map(|value| match value {
                serde_json::Value::Object(object) => Some(Row::from_json_object(object)),
                other => {
                    warn!("Skipping non-object row for table '{}': {}", table, other);
                    None
                }
            })
            .collect();
        self.with_rows(table, rows)
    }

    /// Builder method to set the metadata returned by [`RelationReader`].
    pub fn with_catalog(mut self, catalog: Catalog) -> Self {
        self.catalog = catalog;
        self
    }

    /// Builder method making every read of `table` fail.
    pub fn with_failure_on(mut self, table: impl Into<String>) -> Self {
        self.failing_table = Some(table.into());
        self
    }

    /// Builder method delaying every read, to simulate I/O.
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = Some(latency);
        self
    }

    /// Number of `query` calls served so far.
    pub fn query_count(&self) -> u64 {
        self.queries.load(Ordering::SeqCst)
    }

    /// Number of `open` calls.
    pub fn open_count(&self) -> u64 {
        self.opened.load(Ordering::SeqCst)
    }

    /// Number of `close` calls.
    pub fn close_count(&self) -> u64 {
        self.closed.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl DataSource for MemorySource {
    fn kind(&self) -> &'static str {
        "in-memory source"
    }

    fn supports_feature(&self, feature: SourceFeature) -> bool {
        matches!(
            feature,
            SourceFeature::Distinct | SourceFeature::Limit | SourceFeature::ConcurrentQueries
        )
        // Free-form predicates need a query language, which this source lacks.
    }

    async fn open(&self) -> Result<()> {
        self.opened.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        self.closed.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn query(&self, table: &Table, filter: &Filter) -> Result<Vec<Row>> {
        self.queries.fetch_add(1, Ordering::SeqCst);

        if let Some(latency) = self.latency {
            tokio::time::sleep(latency).await;
        }

        if filter.predicate.is_some() {
            return Err(IngressError::unsupported_feature(
                "free-form predicates",
                self.kind(),
            ));
        }

        if self.failing_table.as_deref() == Some(table.name.as_str()) {
            return Err(IngressError::query_failed(
                &table.name,
                std::io::Error::other("injected read failure"),
            ));
        }

        let limit = filter
            .limit
            .and_then(|limit| usize::try_from(limit).ok())
            .unwrap_or(usize::MAX);
        let mut distinct = BTreeSet::new();

        let rows: Vec<Row> = self
            .tables
            .get(&table.name)
            .into_iter()
            .flatten()
            .filter(|row| filter.matches(row))
            .filter(|row| !filter.distinct || distinct.insert(row.to_json().to_string()))
            .take(limit)
            .cloned()
            .collect();

        debug!(
            "Read {} row(s) from '{}' with {} constraint(s)",
            rows.len(),
            table.name,
            filter.values.len()
        );
        Ok(rows)
    }
}

#[async_trait]
impl RelationReader for MemorySource {
    async fn read_catalog(&self) -> Result<Catalog> {
        Ok(self.catalog.clone())
    }
}

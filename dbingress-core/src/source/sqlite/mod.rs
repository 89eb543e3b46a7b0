//! SQLite data source and relation reader.
//!
//! # Module Structure
//! - `connection`: connection targets and pool creation
//! - `query`: SELECT generation, parameter binding and row decoding
//! - `catalog`: table and foreign-key metadata via PRAGMA commands
//!
//! # Guarantees
//! - All operations are read-only (SELECT/PRAGMA only)
//! - Filter values are always bound as parameters, never inlined
//! - Connection strings are redacted before being logged

pub mod catalog;
pub mod connection;
pub mod query;

#[cfg(test)]
mod tests;

use async_trait::async_trait;
use sqlx::SqlitePool;
use tracing::debug;

use super::{DataSource, RelationReader, SourceFeature};
use crate::Result;
use crate::config::SourceConfig;
use crate::error::{IngressError, redact_database_url};
use crate::models::{Catalog, Table};
use crate::row::{Filter, Row};

pub use connection::SqliteTarget;
pub use query::{build_select, quote_identifier};

/// SQLite-backed data source.
///
/// The pool is shared by every worker of a parallel pull.
pub struct SqliteSource {
    pool: SqlitePool,
    config: SourceConfig,
    target: Option<SqliteTarget>,
}

impl std::fmt::Debug for SqliteSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SqliteSource")
            .field("config", &self.config)
            .field("is_in_memory", &self.is_in_memory())
            .finish_non_exhaustive()
    }
}

impl SqliteSource {
    /// Opens a pool on `connection_string`.
    ///
    /// # Connection String Formats
    /// - `sqlite:///path/to/database.db` - Absolute file path
    /// - `sqlite://./relative/path.db` - Relative file path
    /// - `sqlite::memory:` or `:memory:` - In-memory database
    ///
    /// # Errors
    /// Returns a configuration error for an invalid string or configuration,
    /// and a data-source error if the database cannot be opened.
    pub async fn connect(connection_string: &str, config: SourceConfig) -> Result<Self> {
        config.validate()?;
        let target = SqliteTarget::parse(connection_string)?;
        let pool = connection::create_pool(&target, &config).await?;

        debug!(
            "Opened SQLite pool on {} ({} connection(s), read-only: {})",
            redact_database_url(connection_string),
            config.max_connections,
            config.read_only
        );

        Ok(Self {
            pool,
            config,
            target: Some(target),
        })
    }

    /// Wraps a pool owned by the caller.
    ///
    /// `close` leaves a borrowed pool open.
    pub fn from_pool(pool: SqlitePool) -> Self {
        Self {
            pool,
            config: SourceConfig::default(),
            target: None,
        }
    }

    /// The underlying pool.
    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// Checks if the connection is to an in-memory database.
    pub fn is_in_memory(&self) -> bool {
        self.target.as_ref().is_some_and(SqliteTarget::is_memory)
    }
}

#[async_trait]
impl DataSource for SqliteSource {
    fn kind(&self) -> &'static str {
        "SQLite"
    }

    fn supports_feature(&self, feature: SourceFeature) -> bool {
        matches!(
            feature,
            SourceFeature::Predicate
                | SourceFeature::Distinct
                | SourceFeature::Limit
                | SourceFeature::ConcurrentQueries
        )
    }

    async fn open(&self) -> Result<()> {
        let connectivity: i32 = sqlx::query_scalar("SELECT 1")
            .fetch_one(&self.pool)
            .await
            .map_err(|e| IngressError::data_source("SQLite connectivity check failed", e))?;

        if connectivity != 1 {
            return Err(IngressError::configuration(
                "Basic connectivity test failed: unexpected result",
            ));
        }
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        if self.target.is_some() {
            self.pool.close().await;
        }
        Ok(())
    }

    async fn query(&self, table: &Table, filter: &Filter) -> Result<Vec<Row>> {
        query::fetch_rows(&self.pool, table, filter).await
    }
}

#[async_trait]
impl RelationReader for SqliteSource {
    async fn read_catalog(&self) -> Result<Catalog> {
        catalog::read_catalog(&self.pool).await
    }
}

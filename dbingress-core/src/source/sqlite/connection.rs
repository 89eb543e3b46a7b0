//! SQLite connection targets and pool creation.
//!
//! # Accepted Forms
//! - `sqlite:///abs/path.db`, `sqlite://./rel.db`, `sqlite:rel.db`
//! - A bare path ending in `.db`, `.sqlite` or `.sqlite3`
//! - `:memory:`, `sqlite::memory:` or any `sqlite:` URL with `mode=memory`

use std::str::FromStr;

use sqlx::SqlitePool;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use tracing::debug;
use url::Url;

use crate::Result;
use crate::config::SourceConfig;
use crate::error::IngressError;

const FILE_EXTENSIONS: [&str; 3] = [".db", ".sqlite", ".sqlite3"];

/// Database a SQLite connection string points at.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SqliteTarget {
    /// A private in-memory database.
    Memory,
    /// A database file, kept as a `sqlite:` URL.
    File(String),
}

impl SqliteTarget {
    /// Classifies `connection_string`.
    ///
    /// # Errors
    /// Returns a configuration error for another URL scheme, an empty path,
    /// or a bare path without a SQLite file extension.
    pub fn parse(connection_string: &str) -> Result<Self> {
        let trimmed = connection_string.trim();
        if trimmed == ":memory:" {
            return Ok(Self::Memory);
        }

        if let Some(rest) = trimmed.strip_prefix("sqlite:") {
            if rest.contains(":memory:") || rest.contains("mode=memory") {
                return Ok(Self::Memory);
            }
            if rest.trim_start_matches('/').is_empty() {
                return Err(IngressError::configuration(
                    "SQLite connection string has no database path",
                ));
            }
            return Ok(Self::File(trimmed.to_string()));
        }

        // Drive letters parse as one-character schemes
        if let Ok(url) = Url::parse(trimmed) {
            if url.scheme().len() > 1 {
                return Err(IngressError::configuration(format!(
                    "Unsupported scheme '{}', expected sqlite://",
                    url.scheme()
                )));
            }
        }

        if FILE_EXTENSIONS.iter().any(|ext| trimmed.ends_with(ext)) {
            return Ok(Self::File(format!("sqlite://{trimmed}")));
        }

        Err(IngressError::configuration(
            "Invalid SQLite connection string: expected a sqlite: URL, a .db/.sqlite/.sqlite3 path or :memory:",
        ))
    }

    /// Whether this target is an in-memory database.
    pub fn is_memory(&self) -> bool {
        matches!(self, Self::Memory)
    }

    fn connect_options(&self, read_only: bool) -> Result<SqliteConnectOptions> {
        match self {
            Self::Memory => Ok(SqliteConnectOptions::new().in_memory(true)),
            Self::File(url) => SqliteConnectOptions::from_str(url)
                .map(|options| options.read_only(read_only))
                .map_err(|e| {
                    IngressError::configuration(format!("Invalid SQLite connection string: {e}"))
                }),
        }
    }
}

/// Opens a pool on `target`.
///
/// Every connection of an in-memory pool would see its own empty database,
/// so those pools are capped at one connection.
pub(crate) async fn create_pool(target: &SqliteTarget, config: &SourceConfig) -> Result<SqlitePool> {
    let max_connections = if target.is_memory() {
        if config.max_connections > 1 {
            debug!(
                "In-memory SQLite database, using 1 connection instead of {}",
                config.max_connections
            );
        }
        1
    } else {
        config.max_connections.max(1)
    };

    SqlitePoolOptions::new()
        .max_connections(max_connections)
        .acquire_timeout(config.connect_timeout)
        .connect_with(target.connect_options(config.read_only)?)
        .await
        .map_err(|e| IngressError::data_source("Failed to open SQLite database", e))
}

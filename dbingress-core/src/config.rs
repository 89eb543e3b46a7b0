//! Runtime configuration for pulls and data sources.

use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::error::IngressError;

/// Upper bound on parallel workers.
pub const MAX_WORKERS: usize = 64;

/// Configuration of the parallel execution pool.
///
/// # Example
/// ```rust
/// use dbingress_core::config::PullerConfig;
///
/// let config = PullerConfig::default()
///     .with_workers(8)
///     .with_fail_fast(false);
///
/// assert!(config.validate().is_ok());
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PullerConfig {
    /// Number of worker tasks expanding root rows
    pub workers: usize,
    /// Capacity of the row-in, row-out and error queues
    pub channel_capacity: usize,
    /// Cancel sibling workers as soon as one worker fails
    pub fail_fast: bool,
}

impl Default for PullerConfig {
    fn default() -> Self {
        Self {
            workers: 4,
            channel_capacity: 64,
            fail_fast: true,
        }
    }
}

impl PullerConfig {
    /// Validates pool parameters.
    ///
    /// # Errors
    /// Returns a configuration error if the worker count or the queue capacity
    /// is out of range.
    pub fn validate(&self) -> crate::Result<()> {
        if self.workers == 0 {
            return Err(IngressError::configuration(
                "workers must be greater than 0",
            ));
        }

        if self.workers > MAX_WORKERS {
            return Err(IngressError::configuration(format!(
                "workers should not exceed {}",
                MAX_WORKERS
            )));
        }

        if self.channel_capacity == 0 {
            return Err(IngressError::configuration(
                "channel_capacity must be greater than 0",
            ));
        }

        Ok(())
    }

    /// Builder method to set the worker count.
    pub fn with_workers(mut self, workers: usize) -> Self {
        self.workers = workers;
        self
    }

    /// Builder method to set the queue capacity.
    pub fn with_channel_capacity(mut self, capacity: usize) -> Self {
        self.channel_capacity = capacity;
        self
    }

    /// Builder method to toggle fail-fast cancellation.
    pub fn with_fail_fast(mut self, fail_fast: bool) -> Self {
        self.fail_fast = fail_fast;
        self
    }
}

/// Connection settings for database-backed sources.
///
/// Never carries credentials; those stay in the connection string, which is
/// redacted before it is logged.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SourceConfig {
    /// Maximum number of pooled connections shared by all workers
    pub max_connections: u32,
    /// Timeout for acquiring a connection
    pub connect_timeout: Duration,
    /// Open the database read-only
    pub read_only: bool,
}

impl Default for SourceConfig {
    fn default() -> Self {
        Self {
            max_connections: 4,
            connect_timeout: Duration::from_secs(30),
            read_only: true,
        }
    }
}

impl SourceConfig {
    /// Validates connection parameters.
    ///
    /// # Errors
    /// Returns a configuration error if a value is zero or unsafe.
    pub fn validate(&self) -> crate::Result<()> {
        if self.max_connections == 0 {
            return Err(IngressError::configuration(
                "max_connections must be greater than 0",
            ));
        }

        if self.max_connections > 100 {
            return Err(IngressError::configuration(
                "max_connections should not exceed 100 for safety",
            ));
        }

        if self.connect_timeout.is_zero() {
            return Err(IngressError::configuration(
                "connect_timeout must be greater than 0",
            ));
        }

        Ok(())
    }

    /// Builder method to set the pool size.
    pub fn with_max_connections(mut self, max_connections: u32) -> Self {
        self.max_connections = max_connections;
        self
    }

    /// Builder method to set the connection timeout.
    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }
}

//! Extraction planning and execution engine for DBIngress.
//!
//! DBIngress pulls a relationally consistent subset of a database: starting
//! from the rows of one table, it follows the relations an ingress descriptor
//! flags as active and exports every root row with its related rows nested
//! under the relation names.
//!
//! # Pipeline
//! - [`ingress::create`] derives a default [`IngressDescriptor`] from live
//!   schema metadata
//! - [`Plan::build`] decomposes the active relation graph into strongly
//!   connected components and lays them out as a tree of steps
//! - [`puller::pull`] or a [`ParallelPuller`] executes the plan, exhausting
//!   relation cycles inside each component until no unseen row turns up
//!
//! # Guarantees
//! - All database operations are read-only
//! - Plans are deterministic for a given descriptor
//! - No row is nested twice under the same root row through cycle exhaustion

pub mod config;
pub mod error;
pub mod export;
pub mod graph;
pub mod ingress;
pub mod logging;
pub mod models;
pub mod parallel;
pub mod plan;
pub mod puller;
pub mod row;
pub mod source;
pub mod storage;

// Re-export commonly used types
pub use config::{PullerConfig, SourceConfig};
pub use error::{IngressError, Result};
pub use export::{JsonLinesExporter, MemoryExporter};
pub use graph::{Component, Cycle, Graph};
pub use models::{Catalog, Column, Direction, IngressDescriptor, IngressRelation, Relation, Table};
pub use parallel::ParallelPuller;
pub use plan::{Plan, Step};
pub use puller::{PullStats, Puller, SequentialPuller};
pub use row::{Filter, Row, Value};
pub use source::{DataSource, DescriptorStorage, MemorySource, RelationReader, RowExporter, SourceFeature};
#[cfg(feature = "sqlite")]
pub use source::SqliteSource;
pub use storage::{JsonFileStorage, MemoryStorage};

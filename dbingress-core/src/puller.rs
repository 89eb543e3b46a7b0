//! Sequential execution engine.
//!
//! Every row of a step is expanded on its own: the rows of the step's
//! component are gathered by exhausting the component's cycles, then each
//! border crossing is pulled recursively from every gathered row of its
//! source table. The expansion is assembled into one nested [`Row`] only
//! once everything below it has been read, so exporters never see partial
//! rows.
//!
//! Deduplication is scoped to one expansion: a row is nested at most once per
//! table and primary-key tuple, which is what makes cycle exhaustion reach a
//! fixed point on real foreign-key loops.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::future::{BoxFuture, FutureExt};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::error::{IngressError, Result};
use crate::graph::Cycle;
use crate::models::{Direction, Table};
use crate::plan::{Plan, Step};
use crate::row::{Filter, Row};
use crate::source::{DataSource, RowExporter, SourceFeature};

/// Counters collected while pulling.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PullStats {
    pub started_at: DateTime<Utc>,
    pub duration_ms: u64,
    /// Root rows handed to the exporter
    pub rows_exported: u64,
    /// Rows returned by the data source, all tables included
    pub rows_read: u64,
    /// Data-source queries issued
    pub queries: u64,
    /// Follows issued while exhausting cycles, one per row and relation
    pub cycle_iterations: u64,
    /// Rows read per table
    pub per_table: BTreeMap<String, u64>,
}

impl Default for PullStats {
    fn default() -> Self {
        Self {
            started_at: Utc::now(),
            duration_ms: 0,
            rows_exported: 0,
            rows_read: 0,
            queries: 0,
            cycle_iterations: 0,
            per_table: BTreeMap::new(),
        }
    }
}

impl PullStats {
    /// Creates counters starting now.
    pub fn new() -> Self {
        Self::default()
    }

    fn record_read(&mut self, table: &str, rows: usize) {
        let rows = rows as u64;
        self.queries += 1;
        self.rows_read += rows;
        *self.per_table.entry(table.to_string()).or_default() += rows;
    }

    /// Adds the counters of `other`, keeping the earliest start.
    pub fn merge(&mut self, other: &Self) {
        self.started_at = self.started_at.min(other.started_at);
        self.duration_ms = self.duration_ms.max(other.duration_ms);
        self.rows_exported += other.rows_exported;
        self.rows_read += other.rows_read;
        self.queries += other.queries;
        self.cycle_iterations += other.cycle_iterations;
        for (table, rows) in &other.per_table {
            *self.per_table.entry(table.clone()).or_default() += rows;
        }
    }

    /// Sets `duration_ms` from `started_at` to now.
    pub fn finish(&mut self) {
        let elapsed = Utc::now() - self.started_at;
        self.duration_ms = u64::try_from(elapsed.num_milliseconds()).unwrap_or(0);
    }
}

enum Payload {
    Node(usize),
    Assembled(Row),
}

struct Attachment {
    relation: String,
    direction: Direction,
    payload: Payload,
}

struct Node {
    table: String,
    row: Row,
    children: Vec<Attachment>,
}

/// Rows gathered for one step row, as a tree of arena nodes.
///
/// Node 0 is the row being expanded; every other node hangs under the node it
/// was fetched from, so children always have a higher index than their parent.
struct Expansion {
    nodes: Vec<Node>,
    /// Key tuples already nested, per table
    seen: BTreeMap<String, BTreeSet<String>>,
    /// (node, relation, direction) follows already issued
    followed: BTreeSet<(usize, String, Direction)>,
}

impl Expansion {
    fn new(table: &Table, row: Row) -> Self {
        let mut expansion = Self {
            nodes: Vec::new(),
            seen: BTreeMap::new(),
            followed: BTreeSet::new(),
        };
        expansion.admit(table, &row);
        expansion.nodes.push(Node {
            table: table.name.clone(),
            row,
            children: Vec::new(),
        });
        expansion
    }

    fn row(&self, node: usize) -> &Row {
        &self.nodes[node].row
    }

    /// Marks `row` as seen; false if it was already.
    fn admit(&mut self, table: &Table, row: &Row) -> bool {
        self.seen
            .entry(table.name.clone())
            .or_default()
            .insert(row.key_tuple(table))
    }

    fn nodes_of(&self, table: &str) -> Vec<usize> {
        self.nodes
            .iter()
            .enumerate()
            .filter(|(_, node)| node.table == table)
            .map(|(index, _)| index)
            .collect()
    }

    /// Nodes of `table` not yet followed through `relation`, now marked followed.
    fn pending(&mut self, table: &str, relation: &str, direction: Direction) -> Vec<usize> {
        let candidates = self.nodes_of(table);
        candidates
            .into_iter()
            .filter(|&node| {
                self.followed
                    .insert((node, relation.to_string(), direction))
            })
            .collect()
    }

    fn push(&mut self, parent: usize, relation: &str, direction: Direction, table: &str, row: Row) {
        let index = self.nodes.len();
        self.nodes.push(Node {
            table: table.to_string(),
            row,
            children: Vec::new(),
        });
        self.nodes[parent].children.push(Attachment {
            relation: relation.to_string(),
            direction,
            payload: Payload::Node(index),
        });
    }

    fn attach(&mut self, parent: usize, relation: &str, direction: Direction, row: Row) {
        self.nodes[parent].children.push(Attachment {
            relation: relation.to_string(),
            direction,
            payload: Payload::Assembled(row),
        });
    }

    /// Folds the arena into the nested row of node 0.
    fn assemble(self, plan: &Plan) -> Result<Row> {
        let mut built: Vec<Option<Row>> = vec![None; self.nodes.len()];

        for (index, node) in self.nodes.into_iter().enumerate().rev() {
            let mut row = node.row;
            row.retain_exported(&plan.table(&node.table));
            for attachment in node.children {
                let related = match attachment.payload {
                    Payload::Node(child) => built[child].take(),
                    Payload::Assembled(related) => Some(related),
                };
                if let Some(related) = related {
                    row.nest(&node.table, &attachment.relation, attachment.direction, related)?;
                }
            }
            built[index] = Some(row);
        }

        built
            .first_mut()
            .and_then(Option::take)
            .ok_or_else(|| IngressError::configuration("cannot assemble an empty expansion"))
    }
}

/// Runs plan steps against a data source.
///
/// Holds no mutable state of its own, so one executor per worker is enough
/// for the parallel puller.
pub struct StepExecutor<'a> {
    plan: &'a Plan,
    source: &'a dyn DataSource,
}

impl<'a> StepExecutor<'a> {
    /// Creates an executor for `plan` reading from `source`.
    pub fn new(plan: &'a Plan, source: &'a dyn DataSource) -> Self {
        Self { plan, source }
    }

    /// Reads the root table under the caller's filter, limit included.
    ///
    /// # Errors
    /// Returns a configuration error for a plan without steps, or the data
    /// source's error.
    pub async fn read_root(&self, filter: &Filter, stats: &mut PullStats) -> Result<Vec<Row>> {
        let root = self.root()?;
        self.read(&root.entry, filter, stats).await
    }

    /// Fully expands one row of the root table.
    ///
    /// # Errors
    /// Returns the first data-source or column-collision error.
    pub async fn expand_root(&self, row: Row, stats: &mut PullStats) -> Result<Row> {
        let root = self.root()?;
        self.expand(root, row, stats).await
    }

    fn root(&self) -> Result<&'a Step> {
        self.plan
            .root()
            .ok_or_else(|| IngressError::configuration("plan has no steps"))
    }

    async fn read(&self, table: &str, filter: &Filter, stats: &mut PullStats) -> Result<Vec<Row>> {
        if self.plan.is_missing_table(table) {
            debug!("Table '{}' has no metadata, reading it as empty", table);
            return Ok(Vec::new());
        }

        let rows = self.source.query(&self.plan.table(table), filter).await?;
        stats.record_read(table, rows.len());
        Ok(rows)
    }

    fn pull_step<'s>(&'s self, step: &'s Step, filter: Filter, stats: &'s mut PullStats) -> BoxFuture<'s, Result<Vec<Row>>> {
        async move {
            debug!("Pulling step {} ('{}')", step.index, step.entry);
            let rows = self.read(&step.entry, &filter, stats).await?;
            let mut expanded = Vec::with_capacity(rows.len());
            for row in rows {
                expanded.push(self.expand(step, row, stats).await?);
            }
            Ok(expanded)
        }
        .boxed()
    }

    async fn expand(&self, step: &Step, row: Row, stats: &mut PullStats) -> Result<Row> {
        let mut expansion = Expansion::new(&self.plan.table(&step.entry), row);

        if step.has_inner_relations() {
            loop {
                let mut added = 0;
                for cycle in &step.cycles {
                    added += self.exhaust(cycle, &mut expansion, stats).await?;
                }
                if added == 0 {
                    break;
                }
            }
        }

        for &next in &step.next {
            let child = self.plan.step(next).ok_or_else(|| {
                IngressError::configuration(format!(
                    "step {} refers to unknown step {}",
                    step.index, next
                ))
            })?;
            let (Some(relation), Some(direction)) = (child.following.as_ref(), child.direction) else {
                continue;
            };
            if self.plan.is_missing_relation(relation.name()) {
                continue;
            }

            for node in expansion.nodes_of(relation.relation.source(direction)) {
                let Some(filter) = Filter::follow(&relation.relation, direction, expansion.row(node)) else {
                    continue;
                };
                for related in self.pull_step(child, filter, stats).await? {
                    expansion.attach(node, relation.name(), direction, related);
                }
            }
        }

        expansion.assemble(self.plan)
    }

    /// Follows every hop of `cycle` once from each node not yet followed
    /// through it. Returns the number of rows added to the expansion.
    ///
    /// A hop is taken even when the previous one added nothing, since rows of
    /// its source table may have come in through another cycle. The caller
    /// repeats the cycle list until a full pass adds nothing.
    async fn exhaust(&self, cycle: &Cycle, expansion: &mut Expansion, stats: &mut PullStats) -> Result<usize> {
        let mut table = cycle.start.clone();
        let mut added = 0;

        for relation in &cycle.relations {
            let Some(direction) = relation.relation.direction_from(&table) else {
                debug!(
                    "Cycle relation '{}' does not touch '{}', stopping",
                    relation.name(),
                    table
                );
                break;
            };
            if !relation.is_active_towards(direction) || self.plan.is_missing_relation(relation.name()) {
                break;
            }

            let target_name = relation.relation.target(direction).to_string();
            let target = self.plan.table(&target_name);

            let mut fresh = 0;
            for node in expansion.pending(&table, relation.name(), direction) {
                let Some(filter) = Filter::follow(&relation.relation, direction, expansion.row(node)) else {
                    continue;
                };
                stats.cycle_iterations += 1;
                let mut rows = self.read(&target_name, &filter, stats).await?;
                if direction == Direction::ToParent && rows.len() > 1 {
                    warn!(
                        "Relation '{}' returned {} parent rows for table '{}', keeping the first",
                        relation.name(),
                        rows.len(),
                        table
                    );
                    rows.truncate(1);
                }
                for row in rows {
                    if expansion.admit(&target, &row) {
                        expansion.push(node, relation.name(), direction, &target_name, row);
                        fresh += 1;
                    }
                }
            }

            debug!(
                "Cycle hop '{}' {} -> {}: {} new row(s)",
                relation.name(),
                table,
                target_name,
                fresh
            );
            added += fresh;
            table = target_name;
        }

        Ok(added)
    }
}

/// Common interface of the sequential and parallel pullers.
#[async_trait]
pub trait Puller: Send {
    /// Pulls every root row matching `filter` and exports the expansions.
    ///
    /// # Errors
    /// Returns the first fatal error (sequential) or an aggregate of all
    /// worker errors (parallel).
    async fn pull(&mut self, filter: &Filter) -> Result<PullStats>;
}

/// Puller owning its plan, source and exporter.
pub struct SequentialPuller {
    plan: Arc<Plan>,
    source: Arc<dyn DataSource>,
    exporter: Box<dyn RowExporter>,
}

impl SequentialPuller {
    /// Creates a sequential puller.
    pub fn new(plan: Arc<Plan>, source: Arc<dyn DataSource>, exporter: Box<dyn RowExporter>) -> Self {
        Self {
            plan,
            source,
            exporter,
        }
    }
}

#[async_trait]
impl Puller for SequentialPuller {
    async fn pull(&mut self, filter: &Filter) -> Result<PullStats> {
        pull(&self.plan, filter, self.source.as_ref(), self.exporter.as_mut()).await
    }
}

/// Rejects filters the source cannot evaluate.
pub(crate) fn check_filter(filter: &Filter, source: &dyn DataSource) -> Result<()> {
    if filter.predicate.is_some() && !source.supports_feature(SourceFeature::Predicate) {
        return Err(IngressError::unsupported_feature(
            "free-form predicates",
            source.kind(),
        ));
    }
    if filter.distinct && !source.supports_feature(SourceFeature::Distinct) {
        return Err(IngressError::unsupported_feature("distinct reads", source.kind()));
    }
    Ok(())
}

/// Pulls `plan` from `source`, exporting one nested row per root row.
///
/// Root rows are exported in the order the source returns them, each one only
/// after its whole expansion is assembled. The first error aborts the pull;
/// the source is closed in every case.
///
/// # Errors
/// Returns the first data-source, column-collision or export error.
pub async fn pull(
    plan: &Plan,
    filter: &Filter,
    source: &dyn DataSource,
    exporter: &mut dyn RowExporter,
) -> Result<PullStats> {
    check_filter(filter, source)?;
    info!(
        "Pulling '{}' with {} step(s) from {}",
        plan.start_table,
        plan.len(),
        source.kind()
    );

    source.open().await?;
    let result = run(plan, filter, source, exporter).await;
    let closed = source.close().await;

    let stats = result?;
    closed?;

    info!(
        "Pull finished: {} row(s) exported, {} row(s) read in {} quer(ies), {} ms",
        stats.rows_exported, stats.rows_read, stats.queries, stats.duration_ms
    );
    Ok(stats)
}

async fn run(
    plan: &Plan,
    filter: &Filter,
    source: &dyn DataSource,
    exporter: &mut dyn RowExporter,
) -> Result<PullStats> {
    let executor = StepExecutor::new(plan, source);
    let mut stats = PullStats::new();

    for row in executor.read_root(filter, &mut stats).await? {
        let row = executor.expand_root(row, &mut stats).await?;
        exporter.export(row).await?;
        stats.rows_exported += 1;
    }
    exporter.finish().await?;

    stats.finish();
    Ok(stats)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::export::MemoryExporter;
    use crate::models::{IngressDescriptor, IngressRelation, Relation};
    use crate::source::MemorySource;
    use serde_json::json;

    fn plan(start: &str, relations: Vec<IngressRelation>) -> Plan {
        Plan::build(&IngressDescriptor {
            start_table: start.to_string(),
            relations,
        })
        .unwrap()
    }

    #[tokio::test]
    async fn test_self_referencing_rows_are_not_followed() -> Result<()> {
        let plan = plan(
            "employees",
            vec![
                IngressRelation::new(Relation::new("manager", "employees", "id", "employees", "manager_id"))
                    .with_look_up_child(true),
            ],
        );
        let source = MemorySource::new().with_json_rows(
            "employees",
            vec![json!({"id": 1, "manager_id": null}), json!({"id": 2, "manager_id": 1})],
        );
        let exporter = MemoryExporter::new();
        let mut sink = exporter.clone();

        let stats = pull(&plan, &Filter::new(), &source, &mut sink).await?;
        assert_eq!(stats.rows_exported, 2);
        assert_eq!(stats.queries, 1);
        assert!(exporter.rows().await.iter().all(|row| !row.has_nested()));
        Ok(())
    }

    #[tokio::test]
    async fn test_null_foreign_key_issues_no_query() -> Result<()> {
        let plan = plan(
            "items",
            vec![
                IngressRelation::new(Relation::new("orders_items", "orders", "id", "items", "order_id"))
                    .with_look_up_parent(true),
            ],
        );
        let source = MemorySource::new()
            .with_json_rows("items", vec![json!({"sku": "x", "order_id": null})])
            .with_json_rows("orders", vec![json!({"id": 1})]);
        let exporter = MemoryExporter::new();
        let mut sink = exporter.clone();

        pull(&plan, &Filter::new(), &source, &mut sink).await?;
        assert_eq!(source.query_count(), 1);
        assert_eq!(exporter.rows().await[0].to_json(), json!({"sku": "x", "order_id": null}));
        Ok(())
    }

    #[tokio::test]
    async fn test_column_collision_aborts_pull() {
        let plan = plan(
            "orders",
            vec![
                IngressRelation::new(Relation::new("items", "orders", "id", "items", "order_id"))
                    .with_look_up_child(true),
            ],
        );
        let source = MemorySource::new()
            .with_json_rows("orders", vec![json!({"id": 1, "items": 3})])
            .with_json_rows("items", vec![json!({"order_id": 1})]);
        let mut sink = MemoryExporter::new();

        let error = pull(&plan, &Filter::new(), &source, &mut sink).await.unwrap_err();
        assert!(matches!(error, IngressError::ColumnCollision { .. }));
        assert_eq!(source.close_count(), 1);
        assert!(sink.is_empty().await);
    }

    #[tokio::test]
    async fn test_predicate_rejected_before_open() {
        let plan = plan("orders", vec![]);
        let source = MemorySource::new();
        let mut sink = MemoryExporter::new();

        let error = pull(&plan, &Filter::new().with_predicate("id > 1"), &source, &mut sink)
            .await
            .unwrap_err();
        assert!(matches!(error, IngressError::UnsupportedFeature { .. }));
        assert_eq!(source.open_count(), 0);
    }

    #[tokio::test]
    async fn test_missing_table_reads_as_empty() -> Result<()> {
        let mut plan = plan(
            "orders",
            vec![
                IngressRelation::new(Relation::new("orders_items", "orders", "id", "items", "order_id"))
                    .with_look_up_child(true),
            ],
        );
        plan.resolve(
            &crate::models::Catalog::new()
                .with_table(Table::new("orders").with_keys(["id"]))
                .with_relation(Relation::new("orders_items", "orders", "id", "items", "order_id")),
        );
        let source = MemorySource::new()
            .with_json_rows("orders", vec![json!({"id": 1})])
            .with_json_rows("items", vec![json!({"order_id": 1})]);
        let exporter = MemoryExporter::new();
        let mut sink = exporter.clone();

        let stats = pull(&plan, &Filter::new(), &source, &mut sink).await?;
        assert_eq!(stats.rows_exported, 1);
        assert_eq!(source.query_count(), 1);
        assert_eq!(exporter.rows().await[0].to_json(), json!({"id": 1}));
        Ok(())
    }

    #[tokio::test]
    async fn test_sequential_puller_runs_repeatedly() -> Result<()> {
        let plan = Arc::new(plan(
            "orders",
            vec![
                IngressRelation::new(Relation::new("orders_items", "orders", "id", "items", "order_id"))
                    .with_look_up_child(true),
            ],
        ));
        let source = Arc::new(
            MemorySource::new()
                .with_json_rows("orders", vec![json!({"id": 1}), json!({"id": 2})])
                .with_json_rows("items", vec![json!({"id": 10, "order_id": 2})]),
        );
        let exporter = MemoryExporter::new();
        let mut puller = SequentialPuller::new(plan, source.clone(), Box::new(exporter.clone()));

        let stats = puller.pull(&Filter::new().with_value("id", 2)).await?;
        assert_eq!(stats.rows_exported, 1);
        puller.pull(&Filter::new()).await?;

        let rows: Vec<_> = exporter.rows().await.iter().map(Row::to_json).collect();
        assert_eq!(
            rows,
            vec![
                json!({"id": 2, "orders_items": [{"id": 10, "order_id": 2}]}),
                json!({"id": 1}),
                json!({"id": 2, "orders_items": [{"id": 10, "order_id": 2}]}),
            ]
        );
        assert_eq!(source.open_count(), 2);
        assert_eq!(source.close_count(), 2);
        Ok(())
    }

    #[test]
    fn test_stats_merge() {
        let mut total = PullStats::new();
        let mut other = PullStats::new();
        other.rows_exported = 2;
        other.queries = 5;
        other.per_table.insert("orders".to_string(), 3);
        total.merge(&other);
        total.merge(&other);

        assert_eq!(total.rows_exported, 4);
        assert_eq!(total.queries, 10);
        assert_eq!(total.per_table["orders"], 6);
    }
}

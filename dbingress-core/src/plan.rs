//! Extraction plans.
//!
//! A [`Plan`] is a tree of [`Step`]s derived from an ingress descriptor. Each
//! step enters one strongly connected component of the active graph through
//! its `entry` table; relations inside the component are resolved by cycle
//! exhaustion at pull time, and every relation leaving the component spawns a
//! child step. Steps are numbered from 1 in creation order, so only border
//! crossings consume an index.

use std::collections::{BTreeMap, BTreeSet};

use serde::Serialize;
use tracing::{debug, info, warn};

use crate::error::{IngressError, Result};
use crate::graph::{Component, Cycle, Graph, find_components, relation_cycles};
use crate::models::{Catalog, Direction, IngressDescriptor, IngressRelation, Table};
use crate::row::Filter;

/// One node of the extraction plan tree.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Step {
    /// 1-based position in the plan
    pub index: usize,
    /// Table this step reads first
    pub entry: String,
    /// Border-crossing relation that led here; `None` for the root step
    pub following: Option<IngressRelation>,
    /// Direction `following` is walked in
    pub direction: Option<Direction>,
    /// Active relations inside this step's component, in declaration order
    pub relations: Vec<IngressRelation>,
    /// Tables of this step's component
    pub tables: BTreeSet<String>,
    /// Elementary cycles of the component, rotated onto `entry`
    pub cycles: Vec<Cycle>,
    /// Index of the step whose border crossing produced this one, 0 for the root
    pub previous: usize,
    /// Indices of the child steps, in crossing order
    pub next: Vec<usize>,
}

impl Step {
    /// Returns true for the root step.
    pub fn is_root(&self) -> bool {
        self.previous == 0
    }

    /// Table of the previous step the crossing starts from.
    pub fn from_table(&self) -> Option<&str> {
        let relation = self.following.as_ref()?;
        let direction = self.direction?;
        Some(relation.relation.source(direction))
    }

    /// Returns true if rows of this step need cycle exhaustion.
    pub fn has_inner_relations(&self) -> bool {
        !self.relations.is_empty()
    }
}

/// Ordered step tree plus the registries the puller resolves against.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Plan {
    pub start_table: String,
    pub steps: Vec<Step>,
    /// Every active relation of the descriptor
    pub relations: BTreeMap<String, IngressRelation>,
    /// Metadata of every table reachable from the start table
    pub tables: BTreeMap<String, Table>,
    /// Tables absent from the catalog the plan was resolved against
    pub missing_tables: BTreeSet<String>,
    /// Relations absent from the catalog the plan was resolved against
    pub missing_relations: BTreeSet<String>,
    /// Filter applied to the root read
    pub filter: Filter,
}

impl Plan {
    /// Builds the plan for `descriptor`.
    ///
    /// # Errors
    /// Returns a configuration error for an invalid descriptor and
    /// [`IngressError::StartTableNotFound`] when the start table is not an
    /// endpoint of any descriptor relation.
    pub fn build(descriptor: &IngressDescriptor) -> Result<Self> {
        descriptor.validate()?;

        let start = descriptor.start_table.as_str();
        let known = descriptor.relations.is_empty()
            || descriptor
                .relations
                .iter()
                .any(|r| r.relation.parent == start || r.relation.child == start);
        if !known {
            return Err(IngressError::StartTableNotFound {
                table: start.to_string(),
            });
        }

        let mut graph = Graph::from_relations(&descriptor.relations);
        graph.add_table(start);
        let slim = graph.slim();

        let mut builder = PlanBuilder::new(&slim);
        builder.spawn(start, None, 0);

        let relations: BTreeMap<String, IngressRelation> = descriptor
            .active_relations()
            .map(|r| (r.name().to_string(), r.clone()))
            .collect();
        let tables: BTreeMap<String, Table> = builder
            .steps
            .iter()
            .flat_map(|step| step.tables.iter())
            .map(|name| (name.clone(), Table::new(name.clone())))
            .collect();

        let plan = Self {
            start_table: start.to_string(),
            steps: builder.steps,
            relations,
            tables,
            missing_tables: BTreeSet::new(),
            missing_relations: BTreeSet::new(),
            filter: Filter::default(),
        };

        info!(
            "Built plan for '{}': {} step(s), {} table(s), {} active relation(s)",
            plan.start_table,
            plan.steps.len(),
            plan.tables.len(),
            plan.relations.len()
        );
        Ok(plan)
    }

    /// Builder method to set the root filter.
    pub fn with_filter(mut self, filter: Filter) -> Self {
        self.filter = filter;
        self
    }

    /// Attaches live metadata to the plan's tables.
    ///
    /// Tables and relations the catalog does not know are recorded and logged;
    /// the puller reads them as empty.
    pub fn resolve(&mut self, catalog: &Catalog) {
        for (name, table) in &mut self.tables {
            match catalog.table(name) {
                Some(metadata) => *table = metadata.clone(),
                None => {
                    warn!("Table '{}' has no metadata, it will be read as empty", name);
                    self.missing_tables.insert(name.clone());
                }
            }
        }

        let used: BTreeSet<&str> = self
            .steps
            .iter()
            .flat_map(|step| {
                step.relations
                    .iter()
                    .chain(step.following.iter())
                    .map(IngressRelation::name)
            })
            .collect();
        for name in used {
            if catalog.relation(name).is_none() {
                warn!(
                    "Relation '{}' has no metadata, it will not be followed",
                    name
                );
                self.missing_relations.insert(name.to_string());
            }
        }
    }

    /// The root step.
    ///
    /// Every built plan has one; an empty step list only comes from a
    /// hand-assembled plan.
    pub fn root(&self) -> Option<&Step> {
        self.steps.first()
    }

    /// Looks up a step by its 1-based index.
    pub fn step(&self, index: usize) -> Option<&Step> {
        index.checked_sub(1).and_then(|i| self.steps.get(i))
    }

    /// Number of steps.
    pub fn len(&self) -> usize {
        self.steps.len()
    }

    /// Returns true if the plan has no step.
    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }

    /// Metadata for `name`, or bare metadata when the plan has none.
    pub fn table(&self, name: &str) -> Table {
        self.tables
            .get(name)
            .cloned()
            .unwrap_or_else(|| Table::new(name))
    }

    /// Returns true if `name` was missing from the resolved catalog.
    pub fn is_missing_table(&self, name: &str) -> bool {
        self.missing_tables.contains(name)
    }

    /// Returns true if `name` was missing from the resolved catalog.
    pub fn is_missing_relation(&self, name: &str) -> bool {
        self.missing_relations.contains(name)
    }

    /// Set of `(entry, following, relations, cycles)` per step, for comparing
    /// plan shapes regardless of numbering and declaration order.
    #[allow(clippy::type_complexity)]
    pub fn shape(&self) -> BTreeSet<(String, Option<String>, BTreeSet<String>, BTreeSet<Vec<String>>)> {
        self.steps
            .iter()
            .map(|step| {
                (
                    step.entry.clone(),
                    step.following.as_ref().map(|r| r.name().to_string()),
                    step.relations.iter().map(|r| r.name().to_string()).collect(),
                    step.cycles
                        .iter()
                        .map(|c| c.relation_names().into_iter().map(String::from).collect())
                        .collect(),
                )
            })
            .collect()
    }

    fn fmt_step(&self, f: &mut std::fmt::Formatter<'_>, step: &Step, depth: usize) -> std::fmt::Result {
        let indent = "  ".repeat(depth);
        write!(f, "{}Step {}: {}", indent, step.index, step.entry)?;
        if let (Some(relation), Some(direction)) = (&step.following, step.direction) {
            write!(
                f,
                " via {} from {} ({})",
                relation.name(),
                relation.relation.source(direction),
                direction
            )?;
        }
        writeln!(f)?;

        if step.tables.len() > 1 {
            let tables: Vec<&str> = step.tables.iter().map(String::as_str).collect();
            writeln!(f, "{}  component: {}", indent, tables.join(", "))?;
        }
        for cycle in &step.cycles {
            writeln!(f, "{}  cycle: {}", indent, cycle)?;
        }
        if self.is_missing_table(&step.entry) {
            writeln!(f, "{}  (no metadata, read as empty)", indent)?;
        }

        for &next in &step.next {
            if let Some(child) = self.step(next) {
                self.fmt_step(f, child, depth + 1)?;
            }
        }
        Ok(())
    }
}

impl std::fmt::Display for Plan {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        writeln!(
            f,
            "Plan for '{}' ({} step(s))",
            self.start_table,
            self.steps.len()
        )?;
        match self.root() {
            Some(root) => self.fmt_step(f, root, 1),
            None => Ok(()),
        }
    }
}

/// Walks the slim graph component by component, creating steps.
struct PlanBuilder<'g> {
    graph: &'g Graph,
    components: Vec<Component>,
    steps: Vec<Step>,
}

impl<'g> PlanBuilder<'g> {
    fn new(graph: &'g Graph) -> Self {
        Self {
            graph,
            components: find_components(graph),
            steps: Vec::new(),
        }
    }

    fn component_of(&self, table: &str) -> Component {
        self.components
            .iter()
            .find(|component| component.contains(table))
            .cloned()
            .unwrap_or_else(|| Component::new([table]))
    }

    /// Creates the step entering `entry` and, recursively, its child steps.
    fn spawn(&mut self, entry: &str, following: Option<(IngressRelation, Direction)>, previous: usize) -> usize {
        let component = self.component_of(entry);
        let sub_graph = self.graph.sub_graph(component.tables());
        let relations: Vec<IngressRelation> = sub_graph.relations().cloned().collect();
        let cycles = relation_cycles(&sub_graph, entry);

        let index = self.steps.len() + 1;
        let (following, direction) = match following {
            Some((relation, direction)) => (Some(relation), Some(direction)),
            None => (None, None),
        };
        self.steps.push(Step {
            index,
            entry: entry.to_string(),
            following,
            direction,
            relations,
            tables: component.tables().clone(),
            cycles,
            previous,
            next: Vec::new(),
        });
        debug!(
            "Step {}: entry '{}', {} table(s), previous step {}",
            index,
            entry,
            component.len(),
            previous
        );

        let mut visited = BTreeSet::new();
        self.walk(index, entry, &component, &mut visited);
        index
    }

    /// Pre-order walk of one component: inner arcs first, then crossings.
    fn walk(&mut self, index: usize, table: &str, component: &Component, visited: &mut BTreeSet<String>) {
        if !visited.insert(table.to_string()) {
            return;
        }

        let graph = self.graph;
        let edges = graph.outgoing(table);

        for edge in edges.iter().filter(|edge| component.contains(&edge.to)) {
            self.walk(index, &edge.to, component, visited);
        }

        for edge in edges.iter().filter(|edge| !component.contains(&edge.to)) {
            let Some(relation) = graph.relation(&edge.relation) else {
                continue;
            };
            let child = self.spawn(&edge.to, Some((relation.clone(), edge.direction)), index);
            if let Some(step) = self.steps.get_mut(index - 1) {
                step.next.push(child);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{Catalog, Relation};

    fn rel(name: &str, parent: &str, child: &str, up: bool, down: bool) -> IngressRelation {
        IngressRelation::new(Relation::new(name, parent, "id", child, format!("{parent}_id")))
            .with_look_up_parent(up)
            .with_look_up_child(down)
    }

    fn descriptor(start: &str, relations: Vec<IngressRelation>) -> IngressDescriptor {
        IngressDescriptor {
            start_table: start.to_string(),
            relations,
        }
    }

    #[test]
    fn test_isolated_start_table_single_step() {
        let plan = Plan::build(&descriptor("a", vec![])).unwrap();
        assert_eq!(plan.len(), 1);
        let root = plan.root().unwrap();
        assert_eq!(root.index, 1);
        assert_eq!(root.entry, "a");
        assert!(root.following.is_none());
        assert!(root.relations.is_empty());
        assert!(root.cycles.is_empty());
        assert_eq!(root.previous, 0);
    }

    #[test]
    fn test_start_table_without_active_relations() {
        let plan = Plan::build(&descriptor("a", vec![rel("a_b", "a", "b", false, false)])).unwrap();
        assert_eq!(plan.len(), 1);
        assert!(plan.relations.is_empty());
    }

    #[test]
    fn test_unknown_start_table() {
        let error = Plan::build(&descriptor("z", vec![rel("a_b", "a", "b", false, true)])).unwrap_err();
        assert!(matches!(error, IngressError::StartTableNotFound { ref table } if table == "z"));
    }

    #[test]
    fn test_chain_produces_linked_steps() {
        let plan = Plan::build(&descriptor(
            "a",
            vec![rel("a_b", "a", "b", false, true), rel("b_c", "b", "c", false, true)],
        ))
        .unwrap();

        assert_eq!(plan.len(), 3);
        let b = plan.step(2).unwrap();
        assert_eq!(b.entry, "b");
        assert_eq!(b.previous, 1);
        assert_eq!(b.direction, Some(Direction::ToChild));
        assert_eq!(b.from_table(), Some("a"));
        let c = plan.step(3).unwrap();
        assert_eq!(c.entry, "c");
        assert_eq!(c.previous, 2);
        assert_eq!(plan.root().unwrap().next, vec![2]);
        assert_eq!(b.next, vec![3]);
    }

    #[test]
    fn test_parent_lookup_crossing() {
        let plan = Plan::build(&descriptor("items", vec![rel("orders_items", "orders", "items", true, false)])).unwrap();
        let orders = plan.step(2).unwrap();
        assert_eq!(orders.entry, "orders");
        assert_eq!(orders.direction, Some(Direction::ToParent));
        assert_eq!(orders.from_table(), Some("items"));
    }

    #[test]
    fn test_round_trip_keeps_single_step() {
        let plan = Plan::build(&descriptor("a", vec![rel("a_b", "a", "b", true, true)])).unwrap();
        assert_eq!(plan.len(), 1);
        let root = plan.root().unwrap();
        assert_eq!(root.tables.len(), 2);
        assert_eq!(root.relations.len(), 1);
        assert_eq!(root.cycles.len(), 1);
        assert_eq!(root.cycles[0].start, "a");
    }

    #[test]
    fn test_diamond_of_components_reenters() {
        // a -> b -> d and a -> c -> d: d is entered once per path.
        let plan = Plan::build(&descriptor(
            "a",
            vec![
                rel("a_b", "a", "b", false, true),
                rel("a_c", "a", "c", false, true),
                rel("b_d", "b", "d", false, true),
                rel("c_d", "c", "d", false, true),
            ],
        ))
        .unwrap();

        let entries: Vec<&str> = plan.steps.iter().map(|s| s.entry.as_str()).collect();
        assert_eq!(entries, vec!["a", "b", "d", "c", "d"]);
        assert_eq!(plan.step(5).unwrap().previous, 4);
    }

    #[test]
    fn test_plan_shape_ignores_declaration_order() {
        let forward = Plan::build(&descriptor(
            "a",
            vec![rel("a_b", "a", "b", false, true), rel("a_c", "a", "c", false, true)],
        ))
        .unwrap();
        let backward = Plan::build(&descriptor(
            "a",
            vec![rel("a_c", "a", "c", false, true), rel("a_b", "a", "b", false, true)],
        ))
        .unwrap();
        assert_eq!(forward.shape(), backward.shape());
    }

    #[test]
    fn test_resolve_records_missing_metadata() {
        let mut plan = Plan::build(&descriptor("a", vec![rel("a_b", "a", "b", false, true)])).unwrap();
        let catalog = Catalog::new()
            .with_table(Table::new("a").with_keys(["id"]))
            .with_relation(Relation::new("other", "a", "id", "x", "a_id"));
        plan.resolve(&catalog);

        assert_eq!(plan.table("a").keys, vec!["id"]);
        assert!(plan.is_missing_table("b"));
        assert!(!plan.is_missing_table("a"));
        assert!(plan.is_missing_relation("a_b"));
    }

    #[test]
    fn test_display_renders_tree() {
        let plan = Plan::build(&descriptor(
            "a",
            vec![rel("a_b", "a", "b", true, true), rel("b_c", "b", "c", false, true)],
        ))
        .unwrap();
        let rendered = plan.to_string();
        assert!(rendered.starts_with("Plan for 'a' (2 step(s))"));
        assert!(rendered.contains("  Step 1: a\n"));
        assert!(rendered.contains("cycle: a -[a_b]-> b"));
        assert!(rendered.contains("    Step 2: c via b_c from b (child)"));
    }

    #[test]
    fn test_plan_serializes() {
        let plan = Plan::build(&descriptor("a", vec![rel("a_b", "a", "b", false, true)])).unwrap();
        let json = serde_json::to_value(&plan).unwrap();
        assert_eq!(json["start_table"], "a");
        assert_eq!(json["steps"][1]["following"]["name"], "a_b");
        assert_eq!(json["steps"][1]["direction"], "to_child");
    }
}

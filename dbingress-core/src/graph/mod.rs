//! Relationship graph over tables.
//!
//! Every relation contributes an undirected neighbourhood link and a
//! parent-to-child link. Only active relations contribute directed arcs: a
//! `look_up_child` flag gives an arc from parent to child, a `look_up_parent`
//! flag an arc from child to parent. All registries are ordered so component,
//! step and cycle enumeration is the same on every run.
//!
//! # Module Structure
//! - `components`: strongly connected components of the active arcs
//! - `cycles`: elementary cycles inside a component

pub mod components;
pub mod cycles;

use std::collections::{BTreeMap, BTreeSet, VecDeque};

use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::models::{Direction, IngressRelation};

pub use components::{Component, find_components};
pub use cycles::{Cycle, relation_cycles};

/// A directed, traversable arc produced by an active relation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Edge {
    pub relation: String,
    pub direction: Direction,
    pub from: String,
    pub to: String,
}

/// Adjacency model over tables and flag-annotated relations.
#[derive(Debug, Clone, Default)]
pub struct Graph {
    tables: BTreeSet<String>,
    relations: BTreeMap<String, IngressRelation>,
    /// Relation names in insertion order
    order: Vec<String>,
    neighbors: BTreeMap<String, BTreeSet<String>>,
    children: BTreeMap<String, BTreeSet<String>>,
    outgoing: BTreeMap<String, Vec<Edge>>,
    incoming: BTreeMap<String, Vec<Edge>>,
}

impl Graph {
    /// Creates an empty graph.
    pub fn new() -> Self {
        Self::default()
    }

    /// Builds a graph from relations, in the given order.
    pub fn from_relations<'a, I>(relations: I) -> Self
    where
        I: IntoIterator<Item = &'a IngressRelation>,
    {
        let mut graph = Self::new();
        for relation in relations {
            graph.add_relation(relation.clone());
        }
        graph
    }

    /// Registers a table that may have no relation at all.
    pub fn add_table(&mut self, table: impl Into<String>) {
        self.tables.insert(table.into());
    }

    /// Registers a relation, both of its tables and its arcs.
    ///
    /// A relation name seen before replaces the earlier relation and all of
    /// its arcs.
    pub fn add_relation(&mut self, relation: IngressRelation) {
        let name = relation.name().to_string();
        if self.relations.contains_key(&name) {
            warn!(
                "Relation '{}' registered twice, replacing the earlier definition",
                name
            );
            self.relations.insert(name, relation);
            self.rebuild();
            return;
        }

        self.link(&relation);
        self.order.push(name.clone());
        self.relations.insert(name, relation);
    }

    fn link(&mut self, relation: &IngressRelation) {
        let parent = relation.relation.parent.clone();
        let child = relation.relation.child.clone();

        self.tables.insert(parent.clone());
        self.tables.insert(child.clone());

        self.neighbors
            .entry(parent.clone())
            .or_default()
            .insert(child.clone());
        self.neighbors
            .entry(child.clone())
            .or_default()
            .insert(parent.clone());
        self.children
            .entry(parent.clone())
            .or_default()
            .insert(child.clone());

        if relation.look_up_child {
            self.push_edge(relation.name(), Direction::ToChild, &parent, &child);
        }
        if relation.look_up_parent {
            self.push_edge(relation.name(), Direction::ToParent, &child, &parent);
        }
    }

    fn push_edge(&mut self, relation: &str, direction: Direction, from: &str, to: &str) {
        let edge = Edge {
            relation: relation.to_string(),
            direction,
            from: from.to_string(),
            to: to.to_string(),
        };
        self.incoming
            .entry(to.to_string())
            .or_default()
            .push(edge.clone());
        self.outgoing.entry(from.to_string()).or_default().push(edge);
    }

    fn rebuild(&mut self) {
        self.neighbors.clear();
        self.children.clear();
        self.outgoing.clear();
        self.incoming.clear();

        let order = self.order.clone();
        for name in &order {
            if let Some(relation) = self.relations.get(name).cloned() {
                self.link(&relation);
            }
        }
    }

    /// All tables, sorted by name.
    pub fn tables(&self) -> &BTreeSet<String> {
        &self.tables
    }

    /// Returns true if `table` is registered.
    pub fn contains_table(&self, table: &str) -> bool {
        self.tables.contains(table)
    }

    /// Looks up a relation by name.
    pub fn relation(&self, name: &str) -> Option<&IngressRelation> {
        self.relations.get(name)
    }

    /// Relations in insertion order.
    pub fn relations(&self) -> impl Iterator<Item = &IngressRelation> {
        self.order.iter().filter_map(|name| self.relations.get(name))
    }

    /// Number of relations.
    pub fn relation_count(&self) -> usize {
        self.order.len()
    }

    /// Tables linked to `table` by any relation, active or not.
    pub fn neighbors(&self, table: &str) -> impl Iterator<Item = &str> {
        self.neighbors
            .get(table)
            .into_iter()
            .flat_map(|set| set.iter().map(String::as_str))
    }

    /// Tables referencing `table` as their parent.
    pub fn children(&self, table: &str) -> impl Iterator<Item = &str> {
        self.children
            .get(table)
            .into_iter()
            .flat_map(|set| set.iter().map(String::as_str))
    }

    /// Active arcs leaving `table`, in relation insertion order.
    pub fn outgoing(&self, table: &str) -> &[Edge] {
        self.outgoing.get(table).map_or(&[], Vec::as_slice)
    }

    /// Active arcs entering `table`, in relation insertion order.
    pub fn incoming(&self, table: &str) -> &[Edge] {
        self.incoming.get(table).map_or(&[], Vec::as_slice)
    }

    /// Distinct tables reachable from `table` over one active arc.
    pub fn successors(&self, table: &str) -> BTreeSet<&str> {
        self.outgoing(table)
            .iter()
            .map(|edge| edge.to.as_str())
            .collect()
    }

    /// Graph restricted to `tables` and the relations between them.
    pub fn sub_graph(&self, tables: &BTreeSet<String>) -> Self {
        let mut graph = Self::new();
        for table in self.tables.intersection(tables) {
            graph.add_table(table.clone());
        }
        for relation in self.relations() {
            if tables.contains(&relation.relation.parent) && tables.contains(&relation.relation.child)
            {
                graph.add_relation(relation.clone());
            }
        }
        graph
    }

    /// Graph restricted to active relations. Tables are all kept.
    pub fn slim(&self) -> Self {
        let mut graph = Self::new();
        for table in &self.tables {
            graph.add_table(table.clone());
        }
        for relation in self.relations().filter(|r| r.is_active()) {
            graph.add_relation(relation.clone());
        }
        graph
    }

    /// Tables reachable from `table` by walking parent-to-child links.
    ///
    /// `table` itself is only included when it lies on a referential loop.
    pub fn descendants(&self, table: &str) -> BTreeSet<String> {
        let mut found = BTreeSet::new();
        let mut queue: VecDeque<&str> = self.children(table).collect();
        while let Some(current) = queue.pop_front() {
            if found.insert(current.to_string()) {
                queue.extend(self.children(current));
            }
        }
        found
    }

    /// Graph of every table connected to `table` through any relation.
    pub fn connected_subgraph(&self, table: &str) -> Self {
        let mut reached = BTreeSet::new();
        if self.contains_table(table) {
            reached.insert(table.to_string());
        }
        let mut queue: VecDeque<&str> = self.neighbors(table).collect();
        while let Some(current) = queue.pop_front() {
            if reached.insert(current.to_string()) {
                queue.extend(self.neighbors(current));
            }
        }
        self.sub_graph(&reached)
    }

    /// Strongly connected components of the active arcs.
    pub fn components(&self) -> Vec<Component> {
        find_components(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::Relation;

    fn relation(name: &str, parent: &str, child: &str) -> IngressRelation {
        IngressRelation::new(Relation::new(name, parent, "id", child, format!("{parent}_id")))
    }

    #[test]
    fn test_add_relation_registers_tables_and_neighbors() {
        let mut graph = Graph::new();
        graph.add_relation(relation("a_b", "a", "b"));

        assert!(graph.contains_table("a"));
        assert!(graph.contains_table("b"));
        assert_eq!(graph.neighbors("a").collect::<Vec<_>>(), vec!["b"]);
        assert_eq!(graph.neighbors("b").collect::<Vec<_>>(), vec!["a"]);
        assert_eq!(graph.children("a").collect::<Vec<_>>(), vec!["b"]);
        assert!(graph.children("b").next().is_none());
        assert!(graph.outgoing("a").is_empty());
    }

    #[test]
    fn test_active_edges_follow_flags() {
        let mut graph = Graph::new();
        graph.add_relation(relation("a_b", "a", "b").with_look_up_child(true));
        graph.add_relation(relation("b_c", "b", "c").with_look_up_parent(true));

        let out_a = graph.outgoing("a");
        assert_eq!(out_a.len(), 1);
        assert_eq!(out_a[0].to, "b");
        assert_eq!(out_a[0].direction, Direction::ToChild);

        let out_c = graph.outgoing("c");
        assert_eq!(out_c.len(), 1);
        assert_eq!(out_c[0].to, "b");
        assert_eq!(out_c[0].direction, Direction::ToParent);

        assert_eq!(graph.incoming("b").len(), 2);
        assert!(graph.outgoing("b").is_empty());
    }

    #[test]
    fn test_duplicate_name_replaces_edges() {
        let mut graph = Graph::new();
        graph.add_relation(relation("r", "a", "b").with_look_up_child(true));
        graph.add_relation(relation("r", "a", "c").with_look_up_child(true));

        assert_eq!(graph.relation_count(), 1);
        assert_eq!(graph.successors("a").into_iter().collect::<Vec<_>>(), vec!["c"]);
        assert!(graph.neighbors("b").next().is_none());
    }

    #[test]
    fn test_slim_and_sub_graph() {
        let mut graph = Graph::new();
        graph.add_relation(relation("a_b", "a", "b").with_look_up_child(true));
        graph.add_relation(relation("b_c", "b", "c"));
        graph.add_relation(relation("c_d", "c", "d").with_look_up_child(true));

        let slim = graph.slim();
        assert_eq!(slim.relation_count(), 2);
        assert!(slim.relation("b_c").is_none());
        assert_eq!(slim.tables().len(), 4);

        let tables: BTreeSet<String> = ["a", "b", "c"].iter().map(ToString::to_string).collect();
        let sub = graph.sub_graph(&tables);
        assert_eq!(sub.relation_count(), 2);
        assert!(sub.relation("c_d").is_none());
        assert!(!sub.contains_table("d"));
    }

    #[test]
    fn test_descendants_and_connected_subgraph() {
        let mut graph = Graph::new();
        graph.add_relation(relation("a_b", "a", "b"));
        graph.add_relation(relation("b_c", "b", "c"));
        graph.add_relation(relation("x_b", "x", "b"));
        graph.add_relation(relation("y_z", "y", "z"));

        let descendants = graph.descendants("a");
        assert_eq!(
            descendants.into_iter().collect::<Vec<_>>(),
            vec!["b".to_string(), "c".to_string()]
        );

        let connected = graph.connected_subgraph("a");
        assert_eq!(connected.tables().len(), 4);
        assert!(connected.contains_table("x"));
        assert!(!connected.contains_table("y"));
        assert_eq!(connected.relation_count(), 3);
    }
}

//! Elementary cycle enumeration inside a component.
//!
//! Johnson's algorithm finds every simple table cycle of the active arcs. Each
//! table cycle is rotated onto the requested start table and then developed
//! into relation cycles, one per combination of parallel relations between
//! consecutive tables.

use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use super::Graph;
use super::components::strongly_connected;
use crate::models::IngressRelation;

/// One elementary cycle of relations, starting and ending at `start`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Cycle {
    /// Table the cycle starts and ends at
    pub start: String,
    /// Tables in visiting order, `start` first
    pub tables: Vec<String>,
    /// Relations in traversal order, each name at most once
    pub relations: Vec<IngressRelation>,
}

impl Cycle {
    /// Relation names in traversal order.
    pub fn relation_names(&self) -> Vec<&str> {
        self.relations.iter().map(IngressRelation::name).collect()
    }
}

impl std::fmt::Display for Cycle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.start)?;
        let mut table = self.start.as_str();
        for relation in &self.relations {
            let next = relation
                .relation
                .direction_from(table)
                .map_or(table, |direction| relation.relation.target(direction));
            write!(f, " -[{}]-> {}", relation.name(), next)?;
            table = next;
        }
        Ok(())
    }
}

/// Enumerates every elementary table cycle of `graph`'s active arcs.
///
/// Each cycle lists its tables once, starting at its least table by name.
/// Self-referencing arcs are not cycles at this level.
pub fn table_cycles(graph: &Graph) -> Vec<Vec<String>> {
    let tables: Vec<&str> = graph.tables().iter().map(String::as_str).collect();
    let positions: BTreeMap<&str, usize> = tables
        .iter()
        .enumerate()
        .map(|(i, table)| (*table, i))
        .collect();
    let adjacency: Vec<Vec<usize>> = tables
        .iter()
        .enumerate()
        .map(|(i, table)| {
            graph
                .successors(table)
                .into_iter()
                .filter_map(|to| positions.get(to).copied())
                .filter(|&j| j != i)
                .collect()
        })
        .collect();

    let mut johnson = Johnson::new(&adjacency);
    let mut start = 0;
    while start < adjacency.len() {
        // Components of the subgraph induced by nodes >= start.
        let restricted: Vec<Vec<usize>> = adjacency
            .iter()
            .enumerate()
            .map(|(i, next)| {
                if i < start {
                    Vec::new()
                } else {
                    next.iter().copied().filter(|&j| j >= start).collect()
                }
            })
            .collect();

        let least = strongly_connected(&restricted)
            .into_iter()
            .filter(|members| members.len() > 1)
            .filter_map(|members| {
                let first = members.iter().copied().filter(|&i| i >= start).min()?;
                Some((first, members))
            })
            .min_by_key(|(first, _)| *first);

        let Some((node, members)) = least else {
            break;
        };

        johnson.search(node, &members);
        start = node + 1;
    }

    johnson
        .cycles
        .into_iter()
        .map(|cycle| cycle.into_iter().map(|i| tables[i].to_string()).collect())
        .collect()
}

/// Blocked-search state of Johnson's algorithm.
struct Johnson<'a> {
    adjacency: &'a [Vec<usize>],
    member: Vec<bool>,
    blocked: Vec<bool>,
    blocked_by: Vec<BTreeSet<usize>>,
    path: Vec<usize>,
    cycles: Vec<Vec<usize>>,
}

impl<'a> Johnson<'a> {
    fn new(adjacency: &'a [Vec<usize>]) -> Self {
        let n = adjacency.len();
        Self {
            adjacency,
            member: vec![false; n],
            blocked: vec![false; n],
            blocked_by: vec![BTreeSet::new(); n],
            path: Vec::new(),
            cycles: Vec::new(),
        }
    }

    /// Finds every cycle through `start` inside `members`.
    fn search(&mut self, start: usize, members: &[usize]) {
        self.member.iter_mut().for_each(|m| *m = false);
        for &i in members {
            self.member[i] = true;
            self.blocked[i] = false;
            self.blocked_by[i].clear();
        }
        self.circuit(start, start);
    }

    fn circuit(&mut self, v: usize, start: usize) -> bool {
        let mut found = false;
        self.path.push(v);
        self.blocked[v] = true;

        let next: Vec<usize> = self.adjacency[v]
            .iter()
            .copied()
            .filter(|&w| self.member[w])
            .collect();
        for &w in &next {
            if w == start {
                self.cycles.push(self.path.clone());
                found = true;
            } else if !self.blocked[w] && self.circuit(w, start) {
                found = true;
            }
        }

        if found {
            self.unblock(v);
        } else {
            for &w in &next {
                self.blocked_by[w].insert(v);
            }
        }

        self.path.pop();
        found
    }

    fn unblock(&mut self, u: usize) {
        let mut pending = vec![u];
        while let Some(node) = pending.pop() {
            self.blocked[node] = false;
            for w in std::mem::take(&mut self.blocked_by[node]) {
                if self.blocked[w] {
                    pending.push(w);
                }
            }
        }
    }
}

/// Rotates `cycle` so it starts at `start`, when `start` is part of it.
fn rotate(mut cycle: Vec<String>, start: &str) -> Vec<String> {
    if let Some(position) = cycle.iter().position(|table| table == start) {
        cycle.rotate_left(position);
    }
    cycle
}

/// Expands a table cycle into every relation cycle over parallel relations.
fn develop(graph: &Graph, tables: &[String]) -> Vec<Vec<IngressRelation>> {
    let mut developed: Vec<Vec<IngressRelation>> = vec![Vec::new()];

    for (i, from) in tables.iter().enumerate() {
        let to = &tables[(i + 1) % tables.len()];
        let candidates: Vec<&IngressRelation> = graph
            .outgoing(from)
            .iter()
            .filter(|edge| edge.to == *to)
            .filter_map(|edge| graph.relation(&edge.relation))
            .collect();

        if candidates.is_empty() {
            return Vec::new();
        }

        developed = developed
            .into_iter()
            .flat_map(|prefix| {
                candidates.iter().map(move |candidate| {
                    let mut cycle = prefix.clone();
                    if !cycle.iter().any(|r| r.name() == candidate.name()) {
                        cycle.push((*candidate).clone());
                    }
                    cycle
                })
            })
            .collect();
    }

    developed
}

/// Relation cycles of the component `graph`, rotated onto `start`.
///
/// `graph` is expected to be the active subgraph of one component. Cycles not
/// passing through `start` keep their least table as starting point. The
/// result is empty for a single-table component.
pub fn relation_cycles(graph: &Graph, start: &str) -> Vec<Cycle> {
    if graph.tables().len() < 2 {
        for relation in graph.relations().filter(|r| r.relation.is_self_referencing()) {
            warn!(
                "Self-referencing relation '{}' on table '{}' is not traversed",
                relation.name(),
                relation.relation.parent
            );
        }
        return Vec::new();
    }

    let mut cycles: Vec<Cycle> = Vec::new();
    for tables in table_cycles(graph) {
        let tables = rotate(tables, start);
        let Some(first) = tables.first().cloned() else {
            continue;
        };
        for relations in develop(graph, &tables) {
            let names: Vec<&str> = relations.iter().map(IngressRelation::name).collect();
            let duplicate = cycles
                .iter()
                .any(|known| known.start == first && known.relation_names() == names);
            if !duplicate {
                cycles.push(Cycle {
                    start: first.clone(),
                    tables: tables.clone(),
                    relations,
                });
            }
        }
    }

    debug!(
        "Found {} relation cycle(s) among {} table(s) from '{}'",
        cycles.len(),
        graph.tables().len(),
        start
    );
    cycles
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::Relation;

    fn rel(name: &str, parent: &str, child: &str, up: bool, down: bool) -> IngressRelation {
        IngressRelation::new(Relation::new(name, parent, "id", child, "ref"))
            .with_look_up_parent(up)
            .with_look_up_child(down)
    }

    #[test]
    fn test_triangle_single_cycle() {
        let graph = Graph::from_relations(&[
            rel("a_b", "a", "b", false, true),
            rel("b_c", "b", "c", false, true),
            rel("c_a", "c", "a", false, true),
        ]);

        assert_eq!(table_cycles(&graph), vec![vec!["a", "b", "c"]]);

        let cycles = relation_cycles(&graph, "b");
        assert_eq!(cycles.len(), 1);
        assert_eq!(cycles[0].start, "b");
        assert_eq!(cycles[0].relation_names(), vec!["b_c", "c_a", "a_b"]);
    }

    #[test]
    fn test_round_trip_relation_collapses() {
        let graph = Graph::from_relations(&[rel("a_b", "a", "b", true, true)]);

        let cycles = relation_cycles(&graph, "a");
        assert_eq!(cycles.len(), 1);
        assert_eq!(cycles[0].tables, vec!["a", "b"]);
        assert_eq!(cycles[0].relation_names(), vec!["a_b"]);
        assert_eq!(cycles[0].to_string(), "a -[a_b]-> b");
    }

    #[test]
    fn test_parallel_relations_are_developed() {
        let graph = Graph::from_relations(&[
            rel("a_b_1", "a", "b", false, true),
            rel("a_b_2", "a", "b", false, true),
            rel("b_a", "b", "a", false, true),
        ]);

        let cycles = relation_cycles(&graph, "a");
        let names: Vec<Vec<&str>> = cycles.iter().map(Cycle::relation_names).collect();
        assert_eq!(names, vec![vec!["a_b_1", "b_a"], vec!["a_b_2", "b_a"]]);
    }

    #[test]
    fn test_complete_graph_cycle_count() {
        // Every ordered pair linked: K3 has 3 two-cycles and 2 three-cycles.
        let graph = Graph::from_relations(&[
            rel("a_b", "a", "b", true, true),
            rel("b_c", "b", "c", true, true),
            rel("a_c", "a", "c", true, true),
        ]);

        let cycles = table_cycles(&graph);
        assert_eq!(cycles.len(), 5);
        let unique: BTreeSet<Vec<String>> = cycles.into_iter().collect();
        assert_eq!(unique.len(), 5);
    }

    #[test]
    fn test_cycle_outside_start_keeps_least_table() {
        let graph = Graph::from_relations(&[
            rel("a_b", "a", "b", true, true),
            rel("b_c", "b", "c", true, true),
        ]);

        let cycles = relation_cycles(&graph, "a");
        let starts: Vec<&str> = cycles.iter().map(|c| c.start.as_str()).collect();
        assert_eq!(starts, vec!["a", "b"]);
    }

    #[test]
    fn test_singleton_has_no_cycles() {
        let graph = Graph::from_relations(&[rel("a_a", "a", "a", true, true)]);
        assert!(relation_cycles(&graph, "a").is_empty());
        assert!(table_cycles(&graph).is_empty());
    }
}

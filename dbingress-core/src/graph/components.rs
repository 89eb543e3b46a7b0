//! Strongly connected components of the active-arc digraph.
//!
//! Tarjan's algorithm over the tables sorted by name, run with an explicit
//! work stack so deep relation chains cannot overflow the call stack.

use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};

use super::Graph;

/// A maximal set of tables mutually reachable through active arcs.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Component(BTreeSet<String>);

impl Component {
    /// Creates a component from table names.
    pub fn new<I, S>(tables: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self(tables.into_iter().map(Into::into).collect())
    }

    /// Returns true if `table` belongs to the component.
    pub fn contains(&self, table: &str) -> bool {
        self.0.contains(table)
    }

    /// Number of tables.
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Returns true if the component holds no table.
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Returns true if the component can hold a referential cycle.
    pub fn is_cyclic(&self) -> bool {
        self.0.len() > 1
    }

    /// Tables, sorted by name.
    pub fn tables(&self) -> &BTreeSet<String> {
        &self.0
    }

    /// Least table by name.
    pub fn first(&self) -> Option<&str> {
        self.0.first().map(String::as_str)
    }
}

/// Returns the strongly connected components of `graph`'s active arcs.
///
/// Components are emitted in Tarjan order, which is reverse topological: a
/// component is listed before every component that can reach it.
pub fn find_components(graph: &Graph) -> Vec<Component> {
    let tables: Vec<&str> = graph.tables().iter().map(String::as_str).collect();
    let positions: BTreeMap<&str, usize> = tables
        .iter()
        .enumerate()
        .map(|(i, table)| (*table, i))
        .collect();

    let adjacency: Vec<Vec<usize>> = tables
        .iter()
        .map(|table| {
            graph
                .successors(table)
                .into_iter()
                .filter_map(|to| positions.get(to).copied())
                .collect()
        })
        .collect();

    strongly_connected(&adjacency)
        .into_iter()
        .map(|members| Component::new(members.into_iter().map(|i| tables[i])))
        .collect()
}

/// Tarjan's algorithm over an index adjacency list.
///
/// Returns every component as a list of node indices, in emission order.
pub(crate) fn strongly_connected(adjacency: &[Vec<usize>]) -> Vec<Vec<usize>> {
    let mut state = TarjanState::new(adjacency.len());
    for node in 0..adjacency.len() {
        if state.index[node].is_none() {
            tarjan_dfs(node, adjacency, &mut state);
        }
    }
    state.components
}

struct TarjanState {
    /// Discovery index for each node
    index: Vec<Option<usize>>,
    lowlink: Vec<usize>,
    on_stack: Vec<bool>,
    stack: Vec<usize>,
    current_index: usize,
    components: Vec<Vec<usize>>,
}

impl TarjanState {
    fn new(n: usize) -> Self {
        Self {
            index: vec![None; n],
            lowlink: vec![0; n],
            on_stack: vec![false; n],
            stack: Vec::new(),
            current_index: 0,
            components: Vec::new(),
        }
    }
}

#[derive(Clone, Copy)]
enum Phase {
    Visit,
    Neighbors,
    Return,
}

fn tarjan_dfs(start: usize, adjacency: &[Vec<usize>], state: &mut TarjanState) {
    // (node, next neighbour position, phase)
    let mut work: Vec<(usize, usize, Phase)> = vec![(start, 0, Phase::Visit)];

    while let Some((v, position, phase)) = work.pop() {
        match phase {
            Phase::Visit => {
                state.index[v] = Some(state.current_index);
                state.lowlink[v] = state.current_index;
                state.current_index += 1;
                state.on_stack[v] = true;
                state.stack.push(v);
                work.push((v, 0, Phase::Neighbors));
            }
            Phase::Neighbors => {
                if let Some(&w) = adjacency[v].get(position) {
                    match state.index[w] {
                        None => {
                            work.push((v, position + 1, Phase::Return));
                            work.push((w, 0, Phase::Visit));
                        }
                        Some(w_index) => {
                            if state.on_stack[w] {
                                state.lowlink[v] = state.lowlink[v].min(w_index);
                            }
                            work.push((v, position + 1, Phase::Neighbors));
                        }
                    }
                } else if state.index[v] == Some(state.lowlink[v]) {
                    let mut component = Vec::new();
                    while let Some(w) = state.stack.pop() {
                        state.on_stack[w] = false;
                        component.push(w);
                        if w == v {
                            break;
                        }
                    }
                    component.sort_unstable();
                    state.components.push(component);
                }
            }
            Phase::Return => {
                let w = adjacency[v][position - 1];
                state.lowlink[v] = state.lowlink[v].min(state.lowlink[w]);
                work.push((v, position, Phase::Neighbors));
            }
        }
    }
}

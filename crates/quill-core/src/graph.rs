//! Dependency graph engine.
//!
//! The graph is a pure projection of the cells' read/write sets: an edge
//! `a → b` exists iff `a ≠ b` and `W(a) ∩ R(b) ≠ ∅`. It is rebuilt in full
//! after every mutation. Cell position in the notebook is the deterministic
//! tie-break for execution order; self-edges cannot arise because the
//! analyzer excludes a cell's own writes from its reads.

use std::cmp::Reverse;
use std::collections::{BTreeMap, BTreeSet, BinaryHeap, VecDeque};

use petgraph::algo::kosaraju_scc;
use petgraph::graph::{DiGraph, NodeIndex};
use petgraph::Direction;
use rustc_hash::{FxHashMap, FxHashSet};

use crate::error::{Error, Result};
use crate::notebook::{Cell, CellId};

/// The reactive dependency graph over a notebook's cells.
#[derive(Debug, Default)]
pub struct DependencyGraph {
    /// Directed graph: edges go from writer to reader.
    graph: DiGraph<CellId, ()>,
    /// Cell ID to node index mapping.
    nodes: FxHashMap<CellId, NodeIndex>,
    /// Cell ID to notebook position (the scheduling tie-break).
    positions: FxHashMap<CellId, usize>,
}

impl DependencyGraph {
    /// Rebuild the graph from the cells' read/write sets.
    ///
    /// O(n²) in the cell count; negligible at notebook scale.
    pub fn rebuild(&mut self, cells: &[Cell]) {
        self.graph = DiGraph::new();
        self.nodes.clear();
        self.positions.clear();

        for (position, cell) in cells.iter().enumerate() {
            let index = self.graph.add_node(cell.id.clone());
            self.nodes.insert(cell.id.clone(), index);
            self.positions.insert(cell.id.clone(), position);
        }

        for writer in cells {
            for reader in cells {
                if writer.id == reader.id {
                    continue;
                }
                if writer.writes.intersection(&reader.reads).next().is_some() {
                    self.graph
                        .add_edge(self.nodes[&writer.id], self.nodes[&reader.id], ());
                }
            }
        }
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn position(&self, id: &CellId) -> Option<usize> {
        self.positions.get(id).copied()
    }

    /// Cells that directly depend on `id` (forward edges).
    pub fn dependents(&self, id: &CellId) -> Vec<CellId> {
        self.neighbors(id, Direction::Outgoing)
    }

    /// Cells `id` directly depends on (reverse edges).
    pub fn dependencies(&self, id: &CellId) -> Vec<CellId> {
        self.neighbors(id, Direction::Incoming)
    }

    fn neighbors(&self, id: &CellId, direction: Direction) -> Vec<CellId> {
        self.nodes
            .get(id)
            .map(|&index| {
                self.graph
                    .neighbors_directed(index, direction)
                    .map(|n| self.graph[n].clone())
                    .collect()
            })
            .unwrap_or_default()
    }

    /// The full forward edge map, for observers and invariant checks.
    pub fn edges(&self) -> BTreeMap<CellId, BTreeSet<CellId>> {
        self.edge_map(Direction::Outgoing)
    }

    /// The full reverse edge map.
    pub fn reverse_edges(&self) -> BTreeMap<CellId, BTreeSet<CellId>> {
        self.edge_map(Direction::Incoming)
    }

    fn edge_map(&self, direction: Direction) -> BTreeMap<CellId, BTreeSet<CellId>> {
        self.nodes
            .iter()
            .map(|(id, &index)| {
                let targets = self
                    .graph
                    .neighbors_directed(index, direction)
                    .map(|n| self.graph[n].clone())
                    .collect();
                (id.clone(), targets)
            })
            .collect()
    }

    /// The root cell plus all transitive dependents: the exact set a run
    /// considers. Empty if the root is unknown.
    pub fn affected_set(&self, root: &CellId) -> FxHashSet<CellId> {
        let mut affected = FxHashSet::default();
        let Some(&start) = self.nodes.get(root) else {
            return affected;
        };

        affected.insert(root.clone());
        let mut queue = VecDeque::from([start]);
        while let Some(index) = queue.pop_front() {
            for neighbor in self.graph.neighbors_directed(index, Direction::Outgoing) {
                let id = self.graph[neighbor].clone();
                if affected.insert(id) {
                    queue.push_back(neighbor);
                }
            }
        }
        affected
    }

    /// Every cell id in the graph.
    pub fn all_cells(&self) -> FxHashSet<CellId> {
        self.nodes.keys().cloned().collect()
    }

    /// All cells participating in some cycle, grouped per cycle and ordered
    /// by notebook position within each group.
    pub fn cycles(&self) -> Vec<Vec<CellId>> {
        let mut cycles = Vec::new();
        for scc in kosaraju_scc(&self.graph) {
            if scc.len() > 1 {
                let mut members: Vec<CellId> =
                    scc.iter().map(|&index| self.graph[index].clone()).collect();
                members.sort_by_key(|id| self.position(id).unwrap_or(usize::MAX));
                cycles.push(members);
            }
        }
        cycles
    }

    /// A witness cycle, if the graph contains one.
    pub fn detect_cycle(&self) -> Option<Vec<CellId>> {
        self.cycles().into_iter().next()
    }

    /// Kahn's algorithm restricted to `set`, tie-broken by cell position.
    ///
    /// Ready cells are executed top-down in notebook order, which makes the
    /// schedule deterministic when the graph alone does not order them.
    pub fn topological_order(&self, set: &FxHashSet<CellId>) -> Result<Vec<CellId>> {
        let mut indegree: FxHashMap<&CellId, usize> = FxHashMap::default();
        for id in set {
            let within = self
                .dependencies(id)
                .into_iter()
                .filter(|dep| set.contains(dep))
                .count();
            indegree.insert(id, within);
        }

        let mut ready: BinaryHeap<Reverse<(usize, CellId)>> = indegree
            .iter()
            .filter(|(_, &degree)| degree == 0)
            .map(|(&id, _)| Reverse((self.position(id).unwrap_or(usize::MAX), id.clone())))
            .collect();

        let mut order = Vec::with_capacity(set.len());
        while let Some(Reverse((_, id))) = ready.pop() {
            for dependent in self.dependents(&id) {
                if let Some(degree) = indegree.get_mut(&dependent) {
                    *degree -= 1;
                    if *degree == 0 {
                        ready.push(Reverse((
                            self.position(&dependent).unwrap_or(usize::MAX),
                            dependent.clone(),
                        )));
                    }
                }
            }
            order.push(id);
        }

        if order.len() != set.len() {
            return Err(Error::CyclicDependency(
                "topological order requested for a cyclic subgraph".to_string(),
            ));
        }
        Ok(order)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::notebook::CellKind;

    fn make_cell(id: &str, reads: &[&str], writes: &[&str]) -> Cell {
        let mut cell = Cell::new(CellKind::Python);
        cell.id = CellId::new(id);
        cell.reads = reads.iter().map(|s| s.to_string()).collect();
        cell.writes = writes.iter().map(|s| s.to_string()).collect();
        cell
    }

    fn rebuild(cells: &[Cell]) -> DependencyGraph {
        let mut graph = DependencyGraph::default();
        graph.rebuild(cells);
        graph
    }

    #[test]
    fn test_empty_graph() {
        let graph = rebuild(&[]);
        assert!(graph.is_empty());
        assert!(graph.detect_cycle().is_none());
    }

    #[test]
    fn test_linear_chain() {
        let cells = vec![
            make_cell("a", &[], &["x"]),
            make_cell("b", &["x"], &["y"]),
            make_cell("c", &["y"], &[]),
        ];
        let graph = rebuild(&cells);

        assert_eq!(graph.dependents(&CellId::new("a")), vec![CellId::new("b")]);
        assert_eq!(graph.dependencies(&CellId::new("c")), vec![CellId::new("b")]);

        let affected = graph.affected_set(&CellId::new("a"));
        assert_eq!(affected.len(), 3);

        let order = graph.topological_order(&affected).unwrap();
        assert_eq!(order, vec![CellId::new("a"), CellId::new("b"), CellId::new("c")]);
    }

    #[test]
    fn test_edges_match_rw_projection() {
        let cells = vec![
            make_cell("a", &[], &["x", "y"]),
            make_cell("b", &["x"], &[]),
            make_cell("c", &["y", "z"], &[]),
        ];
        let graph = rebuild(&cells);
        let edges = graph.edges();

        let expected: BTreeSet<CellId> = [CellId::new("b"), CellId::new("c")].into();
        assert_eq!(edges[&CellId::new("a")], expected);
        assert!(edges[&CellId::new("b")].is_empty());
        assert!(edges[&CellId::new("c")].is_empty());
    }

    #[test]
    fn test_rebuild_is_idempotent() {
        let cells = vec![
            make_cell("a", &[], &["x"]),
            make_cell("b", &["x"], &["y"]),
        ];
        let first = rebuild(&cells);
        let second = rebuild(&cells);
        assert_eq!(first.edges(), second.edges());
        assert_eq!(first.reverse_edges(), second.reverse_edges());
    }

    #[test]
    fn test_no_self_edge_for_read_write_cell() {
        // `x = x + 1` analyzes to R=∅, W={x}; no self-edge, no cycle.
        let cells = vec![make_cell("a", &[], &["x"])];
        let graph = rebuild(&cells);
        assert!(graph.dependents(&CellId::new("a")).is_empty());
        assert!(graph.detect_cycle().is_none());
    }

    #[test]
    fn test_two_cell_cycle() {
        // A: y = x + 1, B: x = y + 1.
        let cells = vec![
            make_cell("a", &["x"], &["y"]),
            make_cell("b", &["y"], &["x"]),
        ];
        let graph = rebuild(&cells);

        let cycle = graph.detect_cycle().expect("cycle expected");
        assert_eq!(cycle, vec![CellId::new("a"), CellId::new("b")]);

        let affected = graph.affected_set(&CellId::new("a"));
        assert!(graph.topological_order(&affected).is_err());
    }

    #[test]
    fn test_affected_set_ignores_upstream() {
        let cells = vec![
            make_cell("a", &[], &["x"]),
            make_cell("b", &["x"], &["y"]),
            make_cell("c", &["y"], &[]),
        ];
        let graph = rebuild(&cells);

        let affected = graph.affected_set(&CellId::new("b"));
        assert!(affected.contains(&CellId::new("b")));
        assert!(affected.contains(&CellId::new("c")));
        assert!(!affected.contains(&CellId::new("a")));
    }

    #[test]
    fn test_isolated_cell_affects_only_itself() {
        let cells = vec![
            make_cell("a", &[], &[]),
            make_cell("b", &["x"], &[]),
        ];
        let graph = rebuild(&cells);
        let affected = graph.affected_set(&CellId::new("a"));
        assert_eq!(affected.len(), 1);
    }

    #[test]
    fn test_topological_tiebreak_uses_position() {
        // b and c are both ready after a; b comes first in the notebook.
        let cells = vec![
            make_cell("a", &[], &["x"]),
            make_cell("b", &["x"], &[]),
            make_cell("c", &["x"], &[]),
        ];
        let graph = rebuild(&cells);
        let order = graph.topological_order(&graph.affected_set(&CellId::new("a"))).unwrap();
        assert_eq!(order, vec![CellId::new("a"), CellId::new("b"), CellId::new("c")]);
    }

    #[test]
    fn test_diamond_order_is_deterministic() {
        let cells = vec![
            make_cell("a", &[], &["x"]),
            make_cell("b", &["x"], &["y"]),
            make_cell("c", &["x"], &["z"]),
            make_cell("d", &["y", "z"], &[]),
        ];
        let graph = rebuild(&cells);
        let order = graph.topological_order(&graph.affected_set(&CellId::new("a"))).unwrap();
        assert_eq!(
            order,
            vec![CellId::new("a"), CellId::new("b"), CellId::new("c"), CellId::new("d")]
        );
    }

    #[test]
    fn test_unknown_root_has_empty_affected_set() {
        let graph = rebuild(&[make_cell("a", &[], &[])]);
        assert!(graph.affected_set(&CellId::new("ghost")).is_empty());
    }
}

//! Run planning for the scheduler.
//!
//! A run starts at a root cell, considers the affected set (the root plus
//! its transitive dependents), and either yields a topological execution
//! order or the cycle that makes execution impossible. The runtime half,
//! driving the kernel cell by cell and propagating failures as `blocked`,
//! lives in the coordinator; everything here is a pure function of the
//! graph, which keeps it testable without a kernel.

use rustc_hash::FxHashSet;

use crate::error::{Error, Result};
use crate::graph::DependencyGraph;
use crate::notebook::CellId;

/// What a run should do, decided before any cell executes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RunPlan {
    /// Execute `order` sequentially, blocking downstream of failures.
    Cascade { order: Vec<CellId> },
    /// The affected set intersects one or more cycles: `members` get a cycle
    /// error, the remaining affected cells are blocked. Nothing executes.
    Cycle {
        members: Vec<CellId>,
        blocked: Vec<CellId>,
    },
}

/// Plan a run rooted at `root`.
pub fn plan(graph: &DependencyGraph, root: &CellId) -> Result<RunPlan> {
    let affected = graph.affected_set(root);
    if affected.is_empty() {
        return Err(Error::CellNotFound(root.to_string()));
    }
    plan_set(graph, affected)
}

/// Plan a run over every cell in the notebook.
pub fn plan_all(graph: &DependencyGraph) -> Result<RunPlan> {
    plan_set(graph, graph.all_cells())
}

fn plan_set(graph: &DependencyGraph, affected: FxHashSet<CellId>) -> Result<RunPlan> {
    let mut members: Vec<CellId> = Vec::new();
    for cycle in graph.cycles() {
        if cycle.iter().any(|id| affected.contains(id)) {
            members.extend(cycle);
        }
    }

    if !members.is_empty() {
        members.sort_by_key(|id| graph.position(id).unwrap_or(usize::MAX));
        let in_cycle: FxHashSet<&CellId> = members.iter().collect();
        let mut blocked: Vec<CellId> = affected
            .into_iter()
            .filter(|id| !in_cycle.contains(id))
            .collect();
        blocked.sort_by_key(|id| graph.position(id).unwrap_or(usize::MAX));
        return Ok(RunPlan::Cycle { members, blocked });
    }

    Ok(RunPlan::Cascade {
        order: graph.topological_order(&affected)?,
    })
}

/// The error text attached to every cell of a detected cycle.
pub fn cycle_message(members: &[CellId]) -> String {
    let names: Vec<&str> = members.iter().map(|id| id.as_str()).collect();
    match names.first() {
        Some(first) => format!(
            "Cyclic dependency detected: {} → {}",
            names.join(" → "),
            first
        ),
        None => "Cyclic dependency detected".to_string(),
    }
}

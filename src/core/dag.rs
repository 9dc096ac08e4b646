//! Dependency graph for a parsed plan.
//!
//! Edges point from a dependency to its dependent. Three sources contribute:
//! explicit `(depends: ...)` annotations, sequential-group chains, and phase
//! gating. Phase gates are not edges; they are a per-task flag evaluated by
//! the scheduler against the previous phase's completion fraction.

use petgraph::algo::{tarjan_scc, toposort};
use petgraph::graph::{DiGraph, NodeIndex};
use petgraph::Direction;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};

use crate::blog_debug;
use crate::core::plan::Plan;
use crate::core::task::TaskId;
use crate::error::{Error, Result};

/// Why one task must finish before another starts.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case", tag = "type")]
pub enum DependencyType {
    /// Author-declared `(depends: ...)`.
    Explicit,
    /// Consecutive members of a `[SEQUENTIAL]` group.
    Sequential { group: String },
}

impl std::fmt::Display for DependencyType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DependencyType::Explicit => write!(f, "explicit"),
            DependencyType::Sequential { group } => write!(f, "sequential: {}", group),
        }
    }
}

/// The resolved task dependency graph. Immutable once built.
pub struct DependencyGraph {
    graph: DiGraph<TaskId, DependencyType>,
    index: HashMap<TaskId, NodeIndex>,
    /// Tasks that wait on the previous phase's completion threshold.
    gated: HashSet<TaskId>,
}

/// Build the dependency graph for `plan`, treating phases without an explicit
/// threshold as hard gates.
pub fn resolve(plan: &Plan) -> Result<DependencyGraph> {
    resolve_with_threshold(plan, 1.0)
}

/// Build the dependency graph for `plan`.
///
/// `default_threshold` applies to phases whose header carries none; it only
/// affects which gates take part in cycle checking.
///
/// # Errors
/// - [`Error::MalformedPlan`] for a dependency on an unknown task.
/// - [`Error::CyclicDependency`] when the edges (plus hard phase gates) form a cycle.
pub fn resolve_with_threshold(plan: &Plan, default_threshold: f64) -> Result<DependencyGraph> {
    let mut dg = DependencyGraph {
        graph: DiGraph::new(),
        index: HashMap::new(),
        gated: HashSet::new(),
    };
    for task in &plan.tasks {
        let node = dg.graph.add_node(task.id.clone());
        dg.index.insert(task.id.clone(), node);
    }

    for task in &plan.tasks {
        for dep in &task.depends_on {
            if !plan.contains_task(dep) {
                return Err(Error::MalformedPlan {
                    line: task.line,
                    reason: format!("task {} depends on unknown task {}", task.id, dep),
                });
            }
            dg.add_edge(dep, &task.id, DependencyType::Explicit);
        }
    }

    let mut last_in_group: HashMap<&str, &TaskId> = HashMap::new();
    for task in &plan.tasks {
        if let Some(group) = task.sequential_group.as_deref() {
            if let Some(prev) = last_in_group.insert(group, &task.id) {
                dg.add_edge(
                    prev,
                    &task.id,
                    DependencyType::Sequential {
                        group: group.to_string(),
                    },
                );
            }
        }
    }

    for (pos, phase) in plan.phases.iter().enumerate().skip(1) {
        for id in &phase.task_ids {
            let Some(task) = plan.task(id) else { continue };
            let overlaps = !task.depends_on.is_empty()
                && task
                    .depends_on
                    .iter()
                    .all(|dep| plan.phase_position_of(dep).is_some_and(|p| p < pos));
            if !overlaps {
                dg.gated.insert(id.clone());
            }
        }
    }

    dg.check_acyclic(plan, default_threshold)?;

    blog_debug!(
        "resolve: plan={} tasks={} edges={} gated={}",
        plan.id,
        dg.task_count(),
        dg.dependency_count(),
        dg.gated.len()
    );
    Ok(dg)
}

impl DependencyGraph {
    fn add_edge(&mut self, from: &TaskId, to: &TaskId, dep_type: DependencyType) {
        let (Some(&a), Some(&b)) = (self.index.get(from), self.index.get(to)) else {
            return;
        };
        // The first source wins, so explicit edges keep their type.
        if self.graph.find_edge(a, b).is_none() {
            self.graph.add_edge(a, b, dep_type);
        }
    }

    /// Cycle check over the real edges plus hard phase gates.
    fn check_acyclic(&self, plan: &Plan, default_threshold: f64) -> Result<()> {
        let mut check = self.graph.map(|_, id| id.clone(), |_, _| ());
        for pair in plan.phases.windows(2) {
            let (prev, next) = (&pair[0], &pair[1]);
            if prev.threshold_or(default_threshold) < 1.0 {
                continue;
            }
            for gated in next.task_ids.iter().filter(|id| self.gated.contains(*id)) {
                for before in &prev.task_ids {
                    if let (Some(&a), Some(&b)) = (self.index.get(before), self.index.get(gated)) {
                        check.update_edge(a, b, ());
                    }
                }
            }
        }

        let cycle = match toposort(&check, None) {
            Ok(_) => return Ok(()),
            Err(cycle) => cycle.node_id(),
        };
        let mut cycle_nodes: Vec<TaskId> = tarjan_scc(&check)
            .into_iter()
            .find(|scc| scc.contains(&cycle))
            .unwrap_or_else(|| vec![cycle])
            .into_iter()
            .map(|n| check[n].clone())
            .collect();
        cycle_nodes.sort();
        Err(Error::CyclicDependency {
            cycle_nodes: cycle_nodes.into_iter().map(|id| id.to_string()).collect(),
        })
    }

    /// Tasks `id` waits on, sorted.
    pub fn dependencies(&self, id: &TaskId) -> Vec<&TaskId> {
        self.neighbors(id, Direction::Incoming)
    }

    /// Tasks waiting on `id`, sorted.
    pub fn dependents(&self, id: &TaskId) -> Vec<&TaskId> {
        self.neighbors(id, Direction::Outgoing)
    }

    fn neighbors(&self, id: &TaskId, dir: Direction) -> Vec<&TaskId> {
        let Some(&node) = self.index.get(id) else {
            return Vec::new();
        };
        let mut out: Vec<&TaskId> = self
            .graph
            .neighbors_directed(node, dir)
            .map(|n| &self.graph[n])
            .collect();
        out.sort();
        out.dedup();
        out
    }

    pub fn dependency_type(&self, from: &TaskId, to: &TaskId) -> Option<&DependencyType> {
        let edge = self.graph.find_edge(*self.index.get(from)?, *self.index.get(to)?)?;
        self.graph.edge_weight(edge)
    }

    /// Whether `id` must wait for the previous phase's completion threshold.
    pub fn is_phase_gated(&self, id: &TaskId) -> bool {
        self.gated.contains(id)
    }

    /// Tasks in an order where each comes after all of its dependencies.
    pub fn topological_order(&self) -> Result<Vec<&TaskId>> {
        let sorted = toposort(&self.graph, None).map_err(|cycle| Error::CyclicDependency {
            cycle_nodes: vec![self.graph[cycle.node_id()].to_string()],
        })?;
        Ok(sorted.into_iter().map(|n| &self.graph[n]).collect())
    }

    pub fn contains_task(&self, id: &TaskId) -> bool {
        self.index.contains_key(id)
    }

    pub fn task_count(&self) -> usize {
        self.graph.node_count()
    }

    pub fn dependency_count(&self) -> usize {
        self.graph.edge_count()
    }
}

impl std::fmt::Debug for DependencyGraph {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DependencyGraph")
            .field("tasks", &self.task_count())
            .field("dependencies", &self.dependency_count())
            .field("gated", &self.gated.len())
            .finish()
    }
}

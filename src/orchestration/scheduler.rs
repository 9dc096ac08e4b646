//! Batch selection.
//!
//! The scheduler is a pure function of the dependency graph, the conflict
//! relation and the current status document. It never touches the store or
//! spawns anything; the coordinator owns all side effects.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::HashMap;
use uuid::Uuid;

use crate::config::SchedulerConfig;
use crate::core::conflict::ConflictRelation;
use crate::core::dag::DependencyGraph;
use crate::core::task::{TaskId, TaskStatus};
use crate::state::{PlanState, TaskRecord};

/// Tolerance when comparing a phase fraction with its threshold.
const THRESHOLD_EPSILON: f64 = 1e-9;

/// Tasks dispatched together in one cycle.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionBatch {
    pub batch_id: String,
    pub task_ids: Vec<TaskId>,
    pub started_at: DateTime<Utc>,
}

impl ExecutionBatch {
    pub fn len(&self) -> usize {
        self.task_ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.task_ids.is_empty()
    }
}

#[derive(Debug, Clone)]
pub struct Scheduler {
    max_batch_size: usize,
    skip_through: bool,
}

impl Scheduler {
    pub fn new(max_batch_size: usize) -> Self {
        Self {
            max_batch_size: max_batch_size.max(1),
            skip_through: true,
        }
    }

    pub fn from_config(config: &SchedulerConfig) -> Self {
        Self::new(config.max_batch_size).with_skip_through(config.skip_through)
    }

    pub fn with_skip_through(mut self, skip_through: bool) -> Self {
        self.skip_through = skip_through;
        self
    }

    pub fn max_batch_size(&self) -> usize {
        self.max_batch_size
    }

    /// Ready tasks in priority order: earliest phase, then lowest id.
    pub fn ready_tasks(
        &self,
        graph: &DependencyGraph,
        state: &PlanState,
        now: DateTime<Utc>,
    ) -> Vec<TaskId> {
        self.collect_ready(graph, state, Some(now))
    }

    fn collect_ready(
        &self,
        graph: &DependencyGraph,
        state: &PlanState,
        now: Option<DateTime<Utc>>,
    ) -> Vec<TaskId> {
        let positions = phase_positions(state);
        let mut ready: Vec<(usize, &TaskRecord)> = state
            .tasks
            .iter()
            .filter(|task| self.is_ready(task, graph, state, &positions, now))
            .map(|task| (positions.get(task.phase_id.as_str()).copied().unwrap_or(usize::MAX), task))
            .collect();
        ready.sort_by(|(pa, a), (pb, b)| pa.cmp(pb).then_with(|| a.id.cmp(&b.id)));
        ready.into_iter().map(|(_, task)| task.id.clone()).collect()
    }

    fn is_ready(
        &self,
        task: &TaskRecord,
        graph: &DependencyGraph,
        state: &PlanState,
        positions: &HashMap<&str, usize>,
        now: Option<DateTime<Utc>>,
    ) -> bool {
        if task.status != TaskStatus::Pending {
            return false;
        }
        if let (Some(now), Some(at)) = (now, task.next_retry_at) {
            if at > now {
                return false;
            }
        }
        let deps_satisfied = graph.dependencies(&task.id).into_iter().all(|dep| {
            state
                .status_of(dep)
                .is_some_and(|s| s.satisfies_dependency(self.skip_through))
        });
        deps_satisfied && self.gate_open(task, graph, state, positions)
    }

    /// Whether the previous phase has reached its completion threshold.
    fn gate_open(
        &self,
        task: &TaskRecord,
        graph: &DependencyGraph,
        state: &PlanState,
        positions: &HashMap<&str, usize>,
    ) -> bool {
        if !graph.is_phase_gated(&task.id) {
            return true;
        }
        let Some(&position) = positions.get(task.phase_id.as_str()) else {
            return true;
        };
        if position == 0 {
            return true;
        }
        let previous = &state.phases[position - 1];
        state.phase_fraction(&previous.id, self.skip_through) + THRESHOLD_EPSILON
            >= previous.completion_threshold
    }

    /// Compute the next batch, or `None` when nothing ready can start
    /// alongside the tasks already running.
    pub fn next_batch(
        &self,
        graph: &DependencyGraph,
        conflicts: &ConflictRelation,
        state: &PlanState,
        now: DateTime<Utc>,
    ) -> Option<ExecutionBatch> {
        let ready = self.ready_tasks(graph, state, now);
        if ready.is_empty() {
            return None;
        }

        let serial_phases: HashMap<&str, bool> = state
            .phases
            .iter()
            .map(|p| (p.id.as_str(), !p.parallel_allowed))
            .collect();
        let is_serial =
            |phase_id: &str| serial_phases.get(phase_id).copied().unwrap_or(false);

        let running: Vec<&TaskRecord> = state
            .tasks
            .iter()
            .filter(|t| t.status == TaskStatus::InProgress)
            .collect();
        // A serial phase with a task already running admits nothing more.
        let mut busy_phases: Vec<&str> = running
            .iter()
            .filter(|t| is_serial(&t.phase_id))
            .map(|t| t.phase_id.as_str())
            .collect();

        let mut selected: Vec<TaskId> = Vec::new();
        for id in &ready {
            if selected.len() >= self.max_batch_size {
                break;
            }
            let Some(task) = state.task(id) else {
                continue;
            };
            if selected.iter().any(|chosen| conflicts.conflicts(chosen, id))
                || running.iter().any(|r| conflicts.conflicts(&r.id, id))
            {
                continue;
            }
            if is_serial(&task.phase_id) {
                if busy_phases.contains(&task.phase_id.as_str()) {
                    continue;
                }
                busy_phases.push(task.phase_id.as_str());
            }
            selected.push(id.clone());
        }

        if selected.is_empty() {
            return None;
        }

        Some(ExecutionBatch {
            batch_id: Uuid::new_v4().to_string(),
            task_ids: selected,
            started_at: now,
        })
    }

    /// No task is pending or running.
    pub fn is_finished(&self, state: &PlanState) -> bool {
        state
            .tasks
            .iter()
            .all(|t| !matches!(t.status, TaskStatus::Pending | TaskStatus::InProgress))
    }

    /// Earliest scheduled re-queue among pending tasks.
    pub fn earliest_retry(&self, state: &PlanState) -> Option<DateTime<Utc>> {
        state
            .tasks
            .iter()
            .filter(|t| t.status == TaskStatus::Pending)
            .filter_map(|t| t.next_retry_at)
            .min()
    }

    /// Pending work exists but can never become ready: nothing is running
    /// and no pending task would be ready even after its backoff elapsed.
    pub fn is_blocked(&self, graph: &DependencyGraph, state: &PlanState) -> bool {
        let counts = state.counts();
        counts.pending > 0
            && counts.in_progress == 0
            && self.collect_ready(graph, state, None).is_empty()
    }
}

fn phase_positions(state: &PlanState) -> HashMap<&str, usize> {
    state
        .phases
        .iter()
        .enumerate()
        .map(|(i, p)| (p.id.as_str(), i))
        .collect()
}

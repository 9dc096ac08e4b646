//! The persisted status document.
//!
//! One JSON document per plan run, camelCase on disk. Statuses are closed
//! enums, so an unknown status string fails at read time.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;

use crate::core::dag::DependencyGraph;
use crate::core::plan::{PhaseStatus, Plan, PlanStatus};
use crate::core::task::{TaskId, TaskStatus};

pub const STATE_VERSION: u32 = 1;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PlanState {
    pub version: u32,
    pub plan: PlanRecord,
    pub phases: Vec<PhaseRecord>,
    pub tasks: Vec<TaskRecord>,
    pub last_updated: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PlanRecord {
    pub id: String,
    pub name: String,
    pub status: PlanStatus,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PhaseRecord {
    pub id: String,
    pub name: String,
    pub task_ids: Vec<TaskId>,
    pub parallel_allowed: bool,
    pub completion_threshold: f64,
    pub status: PhaseStatus,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskRecord {
    pub id: TaskId,
    pub phase_id: String,
    pub description: String,
    pub status: TaskStatus,
    #[serde(default)]
    pub retry_count: u32,
    #[serde(default)]
    pub last_error: Option<String>,
    /// Explicit plus inferred dependencies.
    #[serde(default)]
    pub depends_on: Vec<TaskId>,
    #[serde(default)]
    pub file_refs: Vec<String>,
    #[serde(default)]
    pub sequential_group: Option<String>,
    #[serde(default)]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub completed_at: Option<DateTime<Utc>>,
    /// A pending task is not dispatched before this instant.
    #[serde(default)]
    pub next_retry_at: Option<DateTime<Utc>>,
    /// Set when a shutdown stopped waiting on this `in_progress` task.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub released_at: Option<DateTime<Utc>>,
}

/// Task counts by status.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusCounts {
    pub pending: usize,
    pub in_progress: usize,
    pub completed: usize,
    pub failed: usize,
    pub skipped: usize,
}

impl StatusCounts {
    pub fn total(&self) -> usize {
        self.pending + self.in_progress + self.completed + self.failed + self.skipped
    }
}

impl PlanState {
    /// Fresh state for a plan that has never run.
    pub fn from_plan(plan: &Plan, graph: &DependencyGraph, default_threshold: f64) -> Self {
        let phases = plan
            .phases
            .iter()
            .map(|phase| PhaseRecord {
                id: phase.id.clone(),
                name: phase.name.clone(),
                task_ids: phase.task_ids.clone(),
                parallel_allowed: phase.parallel_allowed,
                completion_threshold: phase.threshold_or(default_threshold),
                status: PhaseStatus::Pending,
            })
            .collect();
        let tasks = plan
            .tasks
            .iter()
            .map(|task| TaskRecord {
                id: task.id.clone(),
                phase_id: task.phase_id.clone(),
                description: task.description.clone(),
                status: task.status,
                retry_count: 0,
                last_error: None,
                depends_on: graph.dependencies(&task.id).into_iter().cloned().collect(),
                file_refs: task.file_refs.iter().cloned().collect(),
                sequential_group: task.sequential_group.clone(),
                started_at: None,
                completed_at: None,
                next_retry_at: None,
                released_at: None,
            })
            .collect();

        let mut state = Self {
            version: STATE_VERSION,
            plan: PlanRecord {
                id: plan.id.clone(),
                name: plan.name.clone(),
                status: PlanStatus::Pending,
                created_at: plan.created_at,
            },
            phases,
            tasks,
            last_updated: Utc::now(),
        };
        state.recompute(true);
        state
    }

    pub fn task(&self, id: &TaskId) -> Option<&TaskRecord> {
        self.tasks.iter().find(|t| &t.id == id)
    }

    pub fn task_mut(&mut self, id: &TaskId) -> Option<&mut TaskRecord> {
        self.tasks.iter_mut().find(|t| &t.id == id)
    }

    pub fn status_of(&self, id: &TaskId) -> Option<TaskStatus> {
        self.task(id).map(|t| t.status)
    }

    /// Whether this document describes `plan` (same id and task set).
    pub fn matches(&self, plan: &Plan) -> bool {
        if self.plan.id != plan.id || self.tasks.len() != plan.task_count() {
            return false;
        }
        let stored: HashSet<&TaskId> = self.tasks.iter().map(|t| &t.id).collect();
        plan.tasks.iter().all(|t| stored.contains(&t.id))
    }

    pub fn counts(&self) -> StatusCounts {
        let mut counts = StatusCounts::default();
        for task in &self.tasks {
            match task.status {
                TaskStatus::Pending => counts.pending += 1,
                TaskStatus::InProgress => counts.in_progress += 1,
                TaskStatus::Completed => counts.completed += 1,
                TaskStatus::Failed => counts.failed += 1,
                TaskStatus::Skipped => counts.skipped += 1,
            }
        }
        counts
    }

    pub fn in_progress(&self) -> Vec<TaskId> {
        self.tasks
            .iter()
            .filter(|t| t.status == TaskStatus::InProgress)
            .map(|t| t.id.clone())
            .collect()
    }

    /// Fraction of a phase's tasks that count toward its threshold.
    /// An empty or unknown phase counts as fully complete.
    pub fn phase_fraction(&self, phase_id: &str, skip_through: bool) -> f64 {
        let Some(phase) = self.phases.iter().find(|p| p.id == phase_id) else {
            return 1.0;
        };
        if phase.task_ids.is_empty() {
            return 1.0;
        }
        let done = phase
            .task_ids
            .iter()
            .filter_map(|id| self.status_of(id))
            .filter(|s| s.satisfies_dependency(skip_through))
            .count();
        done as f64 / phase.task_ids.len() as f64
    }

    /// Recompute phase and plan aggregates from task statuses.
    pub fn recompute(&mut self, skip_through: bool) {
        let mut phase_statuses = Vec::with_capacity(self.phases.len());
        for phase in &self.phases {
            let statuses: Vec<TaskStatus> = phase
                .task_ids
                .iter()
                .filter_map(|id| self.status_of(id))
                .collect();
            let status = if statuses.iter().all(|s| s.is_terminal()) {
                if self.phase_fraction(&phase.id, skip_through) >= phase.completion_threshold {
                    PhaseStatus::Completed
                } else {
                    PhaseStatus::Failed
                }
            } else if statuses.iter().any(|s| *s != TaskStatus::Pending) {
                PhaseStatus::InProgress
            } else {
                PhaseStatus::Pending
            };
            phase_statuses.push(status);
        }
        for (phase, status) in self.phases.iter_mut().zip(phase_statuses) {
            phase.status = status;
        }

        if self.tasks.iter().all(|t| t.status.is_terminal()) {
            self.plan.status = if self.phases.iter().all(|p| p.status == PhaseStatus::Completed) {
                PlanStatus::Completed
            } else {
                PlanStatus::Failed
            };
        } else if matches!(self.plan.status, PlanStatus::Completed | PlanStatus::Failed) {
            self.plan.status = PlanStatus::Pending;
        }
    }
}

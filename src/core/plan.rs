//! Plan and phase model.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use crate::core::task::{Task, TaskId};

/// A phase groups tasks and gates the phase after it.
#[derive(Debug, Clone, PartialEq)]
pub struct Phase {
    pub id: String,
    pub name: String,
    pub task_ids: Vec<TaskId>,
    /// `false` for `[SEQUENTIAL]` phases: their tasks never share a batch.
    pub parallel_allowed: bool,
    /// Explicit `(threshold: ...)` from the header, if any.
    pub completion_threshold: Option<f64>,
}

impl Phase {
    pub fn new(id: &str, name: &str) -> Self {
        Self {
            id: id.to_string(),
            name: name.to_string(),
            task_ids: Vec::new(),
            parallel_allowed: true,
            completion_threshold: None,
        }
    }

    pub fn threshold_or(&self, default: f64) -> f64 {
        self.completion_threshold.unwrap_or(default)
    }
}

/// Aggregate plan status, recomputed by the status store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum PlanStatus {
    #[default]
    Pending,
    Running,
    Paused,
    Completed,
    Failed,
    /// Nothing is runnable but pending tasks remain behind terminal failures.
    Blocked,
}

impl std::fmt::Display for PlanStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            PlanStatus::Pending => "pending",
            PlanStatus::Running => "running",
            PlanStatus::Paused => "paused",
            PlanStatus::Completed => "completed",
            PlanStatus::Failed => "failed",
            PlanStatus::Blocked => "blocked",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum PhaseStatus {
    #[default]
    Pending,
    InProgress,
    Completed,
    Failed,
}

impl std::fmt::Display for PhaseStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            PhaseStatus::Pending => "pending",
            PhaseStatus::InProgress => "in_progress",
            PhaseStatus::Completed => "completed",
            PhaseStatus::Failed => "failed",
        };
        f.write_str(s)
    }
}

/// A parsed plan. Owns its phases and tasks; never restructured after load.
#[derive(Debug, Clone)]
pub struct Plan {
    pub id: String,
    pub name: String,
    pub phases: Vec<Phase>,
    /// Tasks in source order.
    pub tasks: Vec<Task>,
    pub created_at: DateTime<Utc>,
    task_index: HashMap<TaskId, usize>,
    phase_index: HashMap<String, usize>,
}

impl Plan {
    /// Build a plan from parts. Callers are responsible for id uniqueness
    /// (the parser checks it).
    pub fn new(name: &str, phases: Vec<Phase>, tasks: Vec<Task>) -> Self {
        let task_index = tasks
            .iter()
            .enumerate()
            .map(|(i, t)| (t.id.clone(), i))
            .collect();
        let phase_index = phases
            .iter()
            .enumerate()
            .map(|(i, p)| (p.id.clone(), i))
            .collect();
        Self {
            id: slugify(name),
            name: name.to_string(),
            phases,
            tasks,
            created_at: Utc::now(),
            task_index,
            phase_index,
        }
    }

    pub fn task(&self, id: &TaskId) -> Option<&Task> {
        self.task_index.get(id).map(|&i| &self.tasks[i])
    }

    pub fn task_mut(&mut self, id: &TaskId) -> Option<&mut Task> {
        match self.task_index.get(id) {
            Some(&i) => self.tasks.get_mut(i),
            None => None,
        }
    }

    pub fn contains_task(&self, id: &TaskId) -> bool {
        self.task_index.contains_key(id)
    }

    pub fn phase(&self, id: &str) -> Option<&Phase> {
        self.phase_index.get(id).map(|&i| &self.phases[i])
    }

    /// Position of the phase in plan order.
    pub fn phase_position(&self, id: &str) -> Option<usize> {
        self.phase_index.get(id).copied()
    }

    /// Position of the task's phase in plan order.
    pub fn phase_position_of(&self, task: &TaskId) -> Option<usize> {
        self.task(task).and_then(|t| self.phase_position(&t.phase_id))
    }

    pub fn task_count(&self) -> usize {
        self.tasks.len()
    }
}

/// Lowercase, ASCII alphanumerics separated by single dashes.
pub fn slugify(name: &str) -> String {
    let mut slug = String::with_capacity(name.len());
    for c in name.chars() {
        if c.is_ascii_alphanumeric() {
            slug.push(c.to_ascii_lowercase());
        } else if !slug.ends_with('-') && !slug.is_empty() {
            slug.push('-');
        }
    }
    let slug = slug.trim_end_matches('-').to_string();
    if slug.is_empty() {
        "plan".to_string()
    } else {
        slug
    }
}

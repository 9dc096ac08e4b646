//! Task data model.
//!
//! Tasks are the atomic units of work in a plan. The plan model is immutable
//! after parsing; runtime state (status changes, retries, timestamps) lives in
//! the status store.

use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::collections::BTreeSet;

/// Stable dotted numeric task identifier such as `"3.2"`.
///
/// Ordering compares numeric components, so `1.10` sorts after `1.9`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TaskId(String);

impl TaskId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Numeric components of the id; non-numeric parts sort last.
    pub fn components(&self) -> Vec<u64> {
        self.0
            .split('.')
            .map(|part| part.parse::<u64>().unwrap_or(u64::MAX))
            .collect()
    }

    /// The leading component, which by convention names the phase.
    pub fn major(&self) -> Option<u64> {
        self.0.split('.').next().and_then(|p| p.parse().ok())
    }
}

impl Ord for TaskId {
    fn cmp(&self, other: &Self) -> Ordering {
        self.components()
            .cmp(&other.components())
            .then_with(|| self.0.cmp(&other.0))
    }
}

impl PartialOrd for TaskId {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl std::fmt::Display for TaskId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for TaskId {
    fn from(s: &str) -> Self {
        Self::new(s)
    }
}

/// Task status in its lifecycle.
///
/// Closed set: unknown values in a status file fail deserialization.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    #[default]
    Pending,
    InProgress,
    Completed,
    Failed,
    Skipped,
}

impl TaskStatus {
    /// The monotonic transition table.
    ///
    /// `Failed -> Pending` is the explicit retry re-queue; nothing else moves
    /// backwards, and terminal states never move sideways.
    pub fn can_transition_to(self, to: TaskStatus) -> bool {
        use TaskStatus::*;
        matches!(
            (self, to),
            (Pending, InProgress)
                | (Pending, Skipped)
                | (InProgress, Completed)
                | (InProgress, Failed)
                | (InProgress, Skipped)
                | (Failed, Pending)
        )
    }

    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            TaskStatus::Completed | TaskStatus::Failed | TaskStatus::Skipped
        )
    }

    /// Whether a dependent may proceed past a task in this state.
    pub fn satisfies_dependency(self, skip_through: bool) -> bool {
        match self {
            TaskStatus::Completed => true,
            TaskStatus::Skipped => skip_through,
            _ => false,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            TaskStatus::Pending => "pending",
            TaskStatus::InProgress => "in_progress",
            TaskStatus::Completed => "completed",
            TaskStatus::Failed => "failed",
            TaskStatus::Skipped => "skipped",
        }
    }
}

impl std::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A single task as parsed from the plan outline.
#[derive(Debug, Clone, PartialEq)]
pub struct Task {
    pub id: TaskId,
    pub phase_id: String,
    /// Description with annotations stripped; continuation lines appended.
    pub description: String,
    /// Status at load time: `Completed` for checked boxes, else `Pending`.
    pub status: TaskStatus,
    /// Explicit `(depends: ...)` annotations. Inferred edges live in the graph.
    pub depends_on: BTreeSet<TaskId>,
    /// Paths the task is expected to touch, filled by the conflict detector.
    pub file_refs: BTreeSet<String>,
    pub sequential_group: Option<String>,
    /// 1-based source line, for diagnostics.
    pub line: usize,
}

impl Task {
    pub fn new(id: impl Into<TaskId>, phase_id: &str, description: &str) -> Self {
        Self {
            id: id.into(),
            phase_id: phase_id.to_string(),
            description: description.to_string(),
            status: TaskStatus::Pending,
            depends_on: BTreeSet::new(),
            file_refs: BTreeSet::new(),
            sequential_group: None,
            line: 0,
        }
    }

    pub fn depends_on(mut self, ids: &[&str]) -> Self {
        self.depends_on.extend(ids.iter().map(|id| TaskId::new(*id)));
        self
    }

    pub fn in_group(mut self, group: &str) -> Self {
        self.sequential_group = Some(group.to_string());
        self
    }
}

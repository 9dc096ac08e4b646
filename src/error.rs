use std::time::Duration;

use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Git error: {0}")]
    Git(#[from] git2::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("TOML parse error: {0}")]
    TomlParse(#[from] toml::de::Error),

    #[error("TOML serialize error: {0}")]
    TomlSerialize(#[from] toml::ser::Error),

    #[error("Malformed plan at line {line}: {reason}")]
    MalformedPlan { line: usize, reason: String },

    #[error("Duplicate {kind} id: {id}")]
    DuplicateId { kind: &'static str, id: String },

    #[error("Cyclic dependency between tasks: {}", cycle_nodes.join(", "))]
    CyclicDependency { cycle_nodes: Vec<String> },

    #[error("Invalid transition for task {task_id}: {from} -> {to}")]
    InvalidTransition {
        task_id: String,
        from: String,
        to: String,
    },

    #[error("Task not found: {0}")]
    TaskNotFound(String),

    #[error("Commit for task {task_id} timed out after {timeout:?}")]
    CommitTimeout { task_id: String, timeout: Duration },

    #[error("Commit queue is closed")]
    CommitQueueClosed,

    #[error("Status store is locked by another writer (gave up after {attempts} attempts)")]
    StoreContention { attempts: u32 },

    #[error("Status file and all backups are unreadable: {0}")]
    StateCorrupted(String),

    #[error("Status file belongs to a different plan: {0}")]
    PlanMismatch(String),

    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("No home directory")]
    NoHomeDir,

    #[error("Operation timed out after {0:?}")]
    Timeout(Duration),

    #[error("Task join error: {0}")]
    TaskJoin(String),
}

impl Error {
    /// Load-time errors reject the plan before any scheduling happens.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Error::MalformedPlan { .. }
                | Error::DuplicateId { .. }
                | Error::CyclicDependency { .. }
                | Error::PlanMismatch(_)
                | Error::StateCorrupted(_)
        )
    }
}

pub type Result<T> = std::result::Result<T, Error>;

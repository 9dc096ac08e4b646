//! Plan model and build-time analysis.
//!
//! Everything here is pure: parsing the outline, resolving dependencies and
//! computing file conflicts happen once, before any scheduling.

pub mod conflict;
pub mod dag;
pub mod parser;
pub mod plan;
pub mod task;

pub use conflict::{ConflictDetector, ConflictRelation, ConflictStrategy, HeuristicConflictStrategy};
pub use dag::{resolve, resolve_with_threshold, DependencyGraph, DependencyType};
pub use parser::parse;
pub use plan::{Phase, PhaseStatus, Plan, PlanStatus};
pub use task::{Task, TaskId, TaskStatus};

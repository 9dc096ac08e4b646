//! Durable run state: the status document and the store that owns it.

mod document;
mod store;

pub use document::{PhaseRecord, PlanRecord, PlanState, StatusCounts, TaskRecord, STATE_VERSION};
pub use store::{transition, OpenOutcome, StatusStore, TransitionMeta, MAX_BACKUPS};

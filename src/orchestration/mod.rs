//! Runtime side of the orchestrator.
//!
//! The scheduler decides, the coordinator acts: it spawns workers through
//! the pool, watches them with the health monitor, records results in the
//! status store, serializes commits through the commit queue, and publishes
//! every change on the event bus. Operators steer it over the control socket.

mod commit_queue;
mod context;
mod coordinator;
mod events;
mod health;
mod ipc;
mod pool;
mod scheduler;

pub use commit_queue::{CommitQueue, CommitResult, CommitTicket, Committer, GitCommitRequest};
pub use context::OrchestratorContext;
pub use coordinator::{BatchResult, ControlHandle, Coordinator, RunSummary};
pub use events::{
    Callback, Emitter, Event, EventBus, EventFilter, EventPayload, EventType, RunState,
    SubscriptionHandle,
};
pub use health::{HealthConfig, HealthMonitor, RetryDecision, RetryPolicy, StuckReport};
pub use ipc::{send_command, ControlCommand, ControlRequest, ControlResponse, IpcServer};
pub use pool::{
    log_tail, render_command, resolve_worker, WorkerEvent, WorkerExit, WorkerHandle, WorkerPool,
    WorkerSpec,
};
pub use scheduler::{ExecutionBatch, Scheduler};

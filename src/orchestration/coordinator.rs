//! Execution coordinator: the decision loop.
//!
//! Each cycle asks the scheduler for a batch, spawns one worker per task,
//! and supervises the batch until every worker has ended. Results go through
//! the status store, which emits the state the event bus fans out. Operator
//! commands are served between and during batches.

use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, oneshot};

use crate::core::plan::PlanStatus;
use crate::core::task::{TaskId, TaskStatus};
use crate::orchestration::commit_queue::{CommitQueue, Committer, GitCommitRequest};
use crate::orchestration::context::OrchestratorContext;
use crate::orchestration::events::{Emitter, EventBus, EventPayload, RunState};
use crate::orchestration::health::{HealthConfig, HealthMonitor, RetryDecision, RetryPolicy};
use crate::orchestration::ipc::{ControlCommand, ControlRequest, ControlResponse};
use crate::orchestration::pool::{log_tail, WorkerEvent, WorkerExit, WorkerPool, WorkerSpec};
use crate::orchestration::scheduler::{ExecutionBatch, Scheduler};
use crate::state::{PlanState, StatusStore, TransitionMeta};
use crate::util::blocking;
use crate::{blog, blog_debug, blog_error, blog_trace, blog_warn, Error, Result};

const CONTROL_CHANNEL_CAPACITY: usize = 32;
const WORKER_CHANNEL_CAPACITY: usize = 64;
/// Shortest sleep while waiting for a backoff to elapse.
const MIN_IDLE: Duration = Duration::from_millis(10);

/// Outcome of one batch, read back from the store once it settled.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BatchResult {
    pub batch_id: String,
    pub completed: Vec<TaskId>,
    /// Attempts that failed, whether re-queued or terminal.
    pub failed: Vec<TaskId>,
    pub skipped: Vec<TaskId>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RunSummary {
    pub plan_status: PlanStatus,
    pub completed: usize,
    pub failed: usize,
    pub skipped: usize,
    pub pending: usize,
    pub batches: usize,
}

/// Override a worker may write to `BATON_COMMIT_FILE`.
#[derive(Debug, Default, Deserialize)]
struct CommitOverride {
    message: Option<String>,
    files: Option<Vec<String>>,
}

/// In-process access to the coordinator's control channel.
#[derive(Debug, Clone)]
pub struct ControlHandle {
    tx: mpsc::Sender<ControlRequest>,
}

impl ControlHandle {
    pub fn sender(&self) -> mpsc::Sender<ControlRequest> {
        self.tx.clone()
    }

    pub async fn send(&self, command: ControlCommand) -> Result<ControlResponse> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(ControlRequest { command, reply })
            .await
            .map_err(|_| Error::Protocol("orchestrator is not running".to_string()))?;
        rx.await
            .map_err(|_| Error::Protocol("orchestrator stopped before answering".to_string()))
    }
}

/// A worker result waiting to be written to the status store.
enum Settlement {
    Completed { commit_file: PathBuf },
    Failed { error: String },
}

enum Wake {
    Worker(WorkerEvent),
    Control(ControlRequest),
    Tick,
}

pub struct Coordinator {
    ctx: OrchestratorContext,
    store: StatusStore,
    state: PlanState,
    scheduler: Scheduler,
    pool: WorkerPool,
    worker_rx: mpsc::Receiver<WorkerEvent>,
    control_tx: mpsc::Sender<ControlRequest>,
    control_rx: mpsc::Receiver<ControlRequest>,
    monitor: HealthMonitor,
    retry: RetryPolicy,
    emitter: Emitter,
    committer: Option<Arc<dyn Committer>>,
    commits: Option<CommitQueue>,
    poll_interval: Duration,
    shutdown_grace: Duration,
    recovered_from: Option<usize>,
    interrupted: Vec<TaskId>,
    released: Vec<TaskId>,
    unsettled: VecDeque<(TaskId, Settlement)>,
    started: bool,
    paused: bool,
    shutdown_deadline: Option<Instant>,
    batches: usize,
}

impl Coordinator {
    /// Open the status store for the context's plan and prepare a run.
    ///
    /// # Errors
    /// Store errors from [`StatusStore::open_or_init`].
    pub fn new(ctx: OrchestratorContext, bus: EventBus) -> Result<Self> {
        let outcome = ctx.open_store()?;
        let (worker_tx, worker_rx) = mpsc::channel(WORKER_CHANNEL_CAPACITY);
        let (control_tx, control_rx) = mpsc::channel(CONTROL_CHANNEL_CAPACITY);
        let pool = WorkerPool::new(
            &ctx.config.execution.worker_command,
            ctx.config.log_dir(),
            worker_tx,
        );
        let health = ctx.health();
        let emitter = Emitter::new(bus, ctx.instance_id.clone());

        Ok(Self {
            scheduler: ctx.scheduler(),
            poll_interval: ctx.config.execution.poll_interval(),
            shutdown_grace: ctx.config.execution.shutdown_grace(),
            store: outcome.store,
            state: outcome.state,
            recovered_from: outcome.recovered_from,
            interrupted: outcome.interrupted,
            released: outcome.released,
            unsettled: VecDeque::new(),
            pool,
            worker_rx,
            control_tx,
            control_rx,
            monitor: HealthMonitor::new(health.stuck_threshold),
            retry: health.retry_policy(),
            emitter,
            committer: None,
            commits: None,
            started: false,
            paused: false,
            shutdown_deadline: None,
            batches: 0,
            ctx,
        })
    }

    pub fn with_health(mut self, health: HealthConfig) -> Self {
        self.monitor = HealthMonitor::new(health.stuck_threshold);
        self.retry = health.retry_policy();
        self
    }

    /// Commit each successful task's files through `committer`.
    pub fn with_committer(mut self, committer: Arc<dyn Committer>) -> Self {
        self.committer = Some(committer);
        self
    }

    /// Run workers in `dir` instead of the current directory.
    pub fn with_working_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.pool.set_working_dir(dir);
        self
    }

    pub fn control_handle(&self) -> ControlHandle {
        ControlHandle {
            tx: self.control_tx.clone(),
        }
    }

    pub fn state(&self) -> &PlanState {
        &self.state
    }

    pub fn context(&self) -> &OrchestratorContext {
        &self.ctx
    }

    pub fn instance_id(&self) -> &str {
        self.emitter.instance_id()
    }

    /// Drive the plan until it finishes, blocks, or is shut down.
    pub async fn run(&mut self) -> Result<RunSummary> {
        self.start().await?;
        let mut blocked = false;

        loop {
            while let Ok(request) = self.control_rx.try_recv() {
                self.handle_control(request).await;
            }
            if self.shutdown_deadline.is_some() {
                break;
            }
            if self.paused {
                if let Some(request) = self.control_rx.recv().await {
                    self.handle_control(request).await;
                }
                continue;
            }
            if self.scheduler.is_finished(&self.state) {
                break;
            }

            let now = Utc::now();
            match self
                .scheduler
                .next_batch(&self.ctx.graph, &self.ctx.conflicts, &self.state, now)
            {
                Some(batch) => {
                    self.run_batch(&batch).await;
                }
                None if self.scheduler.is_blocked(&self.ctx.graph, &self.state) => {
                    blocked = true;
                    break;
                }
                None => {
                    let wait = self
                        .scheduler
                        .earliest_retry(&self.state)
                        .map(|at| (at - now).to_std().unwrap_or(MIN_IDLE))
                        .unwrap_or(self.poll_interval)
                        .clamp(MIN_IDLE, self.poll_interval);
                    blog_trace!("Nothing ready; waiting {:?}", wait);
                    let wake = tokio::select! {
                        Some(request) = self.control_rx.recv() => Wake::Control(request),
                        _ = tokio::time::sleep(wait) => Wake::Tick,
                    };
                    if let Wake::Control(request) = wake {
                        self.handle_control(request).await;
                    }
                }
            }
        }

        Ok(self.finish(blocked).await)
    }

    async fn start(&mut self) -> Result<()> {
        if self.started {
            return Ok(());
        }
        self.started = true;
        self.emitter.emit(EventPayload::state(RunState::Started));

        if let Some(slot) = self.recovered_from {
            self.emitter.emit(EventPayload::OrchestratorState {
                state: RunState::Recovered,
                task_id: None,
                detail: Some(format!("restored from backup {}", slot)),
            });
        }
        for id in std::mem::take(&mut self.released) {
            self.emitter.emit(EventPayload::TaskChanged {
                task_id: id,
                from: TaskStatus::InProgress,
                to: TaskStatus::Pending,
            });
        }
        for id in std::mem::take(&mut self.interrupted) {
            self.emitter.emit(EventPayload::TaskChanged {
                task_id: id.clone(),
                from: TaskStatus::InProgress,
                to: TaskStatus::Failed,
            });
            let retry_count = self.state.task(&id).map(|t| t.retry_count).unwrap_or(0);
            self.apply_retry_policy(&id, retry_count).await?;
        }

        let state = self.store_op(|store| store.set_plan_status(PlanStatus::Running)).await?;
        self.adopt(state);

        if let Some(committer) = self.committer.clone() {
            if self.ctx.config.commit.enabled {
                self.commits = Some(CommitQueue::start(committer, self.ctx.config.commit.timeout()));
            }
        }
        blog!(
            "Orchestrator {} started for plan {:?}",
            self.emitter.instance_id(),
            self.ctx.plan.name
        );
        Ok(())
    }

    /// Dispatch one batch and supervise it until every worker has ended and
    /// every result is written.
    pub async fn run_batch(&mut self, batch: &ExecutionBatch) -> BatchResult {
        self.batches += 1;
        blog!(
            "Dispatching batch {} with {} task(s): {:?}",
            batch.batch_id,
            batch.len(),
            batch.task_ids.iter().map(TaskId::as_str).collect::<Vec<_>>()
        );

        for id in &batch.task_ids {
            self.dispatch(id).await;
        }

        loop {
            let settled = self.flush_unsettled().await;
            if self.pool.is_empty() && (settled || self.shutdown_expired()) {
                if !settled {
                    blog_warn!(
                        "Exiting with {} unwritten result(s): {:?}",
                        self.unsettled.len(),
                        self.unsettled.iter().map(|(id, _)| id.as_str()).collect::<Vec<_>>()
                    );
                }
                break;
            }
            let tick = match self.shutdown_deadline {
                Some(deadline) => deadline
                    .saturating_duration_since(Instant::now())
                    .clamp(MIN_IDLE, self.poll_interval),
                None => self.poll_interval,
            };
            let wake = tokio::select! {
                Some(event) = self.worker_rx.recv() => Wake::Worker(event),
                Some(request) = self.control_rx.recv() => Wake::Control(request),
                _ = tokio::time::sleep(tick) => Wake::Tick,
            };
            match wake {
                Wake::Worker(event) => self.handle_worker_event(event).await,
                Wake::Control(request) => self.handle_control(request).await,
                Wake::Tick => {}
            }

            self.report_stuck();
            if self.shutdown_expired() && !self.pool.is_empty() {
                self.release_in_flight().await;
            }
        }

        self.batch_result(batch)
    }

    fn shutdown_expired(&self) -> bool {
        self.shutdown_deadline
            .is_some_and(|deadline| Instant::now() >= deadline)
    }

    async fn dispatch(&mut self, id: &TaskId) {
        if let Err(e) = self
            .transition(id, TaskStatus::InProgress, TransitionMeta::default())
            .await
        {
            // The task stays pending and is offered again next cycle.
            self.report_store_error(Some(id), &e);
            return;
        }
        let Some(task) = self.state.task(id) else {
            blog_error!("Task {} vanished from the status document", id);
            return;
        };
        let spec = WorkerSpec {
            task_id: id.clone(),
            phase_id: task.phase_id.clone(),
            plan_id: self.ctx.plan.id.clone(),
            instance_id: self.emitter.instance_id().to_string(),
            description: task.description.clone(),
        };

        match self.pool.spawn(&spec) {
            Ok(_) => {
                let pid = self.pool.get(id).and_then(|h| h.pid);
                self.emitter.emit(EventPayload::ToolStarted {
                    task_id: id.clone(),
                    pid,
                });
            }
            Err(e) => {
                blog_error!("Failed to start worker for task {}: {}", id, e);
                let error = format!("failed to start worker: {}", e);
                self.settle_or_defer(id.clone(), Settlement::Failed { error })
                    .await;
            }
        }
    }

    async fn handle_worker_event(&mut self, event: WorkerEvent) {
        let Some(handle) = self.pool.finish(&event.task_id, event.generation) else {
            return;
        };
        self.monitor.forget(&event.task_id);
        let id = event.task_id;

        let (success, exit_code) = match &event.exit {
            WorkerExit::Succeeded => (true, Some(0)),
            WorkerExit::Failed { code, .. } => (false, *code),
            WorkerExit::Killed => (false, None),
        };
        self.emitter.emit(EventPayload::ToolCompleted {
            task_id: id.clone(),
            success,
            exit_code,
            elapsed_ms: event.elapsed.as_millis() as u64,
        });

        let settlement = match event.exit {
            WorkerExit::Succeeded => {
                blog!("Task {} completed in {:?}", id, event.elapsed);
                Settlement::Completed {
                    commit_file: handle.commit_file,
                }
            }
            WorkerExit::Failed { error, .. } => {
                let error = match log_tail(&handle.log_path) {
                    Some(tail) => format!("{}\n{}", error, tail),
                    None => error,
                };
                blog_warn!("Task {} failed: {}", id, error.lines().next().unwrap_or(""));
                Settlement::Failed { error }
            }
            WorkerExit::Killed => Settlement::Failed {
                error: "worker was killed".to_string(),
            },
        };
        self.settle_or_defer(id, settlement).await;
    }

    /// Write a worker result, or keep it for [`Self::flush_unsettled`].
    async fn settle_or_defer(&mut self, id: TaskId, settlement: Settlement) {
        if let Err(e) = self.settle(&id, &settlement).await {
            self.report_store_error(Some(&id), &e);
            self.unsettled.push_back((id, settlement));
        }
    }

    /// Retry deferred results in arrival order. `true` once none remain.
    async fn flush_unsettled(&mut self) -> bool {
        while let Some((id, settlement)) = self.unsettled.pop_front() {
            if let Err(e) = self.settle(&id, &settlement).await {
                blog_debug!("Result for task {} still unwritten: {}", id, e);
                self.unsettled.push_front((id, settlement));
                return false;
            }
            blog!("Recorded deferred result for task {}", id);
        }
        true
    }

    /// Apply a worker result. Safe to repeat after a partial failure.
    async fn settle(&mut self, id: &TaskId, settlement: &Settlement) -> Result<()> {
        match settlement {
            Settlement::Completed { commit_file } => {
                if self.state.status_of(id) == Some(TaskStatus::InProgress) {
                    self.transition(id, TaskStatus::Completed, TransitionMeta::default())
                        .await?;
                    self.enqueue_commit(id, commit_file);
                }
                Ok(())
            }
            Settlement::Failed { error } => self.record_failure(id, error.clone()).await,
        }
    }

    /// Mark a failed attempt and re-queue or give up per the retry policy.
    async fn record_failure(&mut self, id: &TaskId, error: String) -> Result<()> {
        if self.state.status_of(id) == Some(TaskStatus::InProgress) {
            self.transition(id, TaskStatus::Failed, TransitionMeta::error(error).retried())
                .await?;
        }
        if self.state.status_of(id) != Some(TaskStatus::Failed) {
            return Ok(());
        }
        let retry_count = self.state.task(id).map(|t| t.retry_count).unwrap_or(u32::MAX);
        self.apply_retry_policy(id, retry_count).await
    }

    fn report_store_error(&self, task_id: Option<&TaskId>, error: &Error) {
        match task_id {
            Some(id) => blog_error!("Status write for task {} failed: {}", id, error),
            None => blog_error!("Status write failed: {}", error),
        }
        self.emitter.emit(EventPayload::OrchestratorState {
            state: RunState::StoreUnavailable,
            task_id: task_id.cloned(),
            detail: Some(error.to_string()),
        });
    }

    async fn apply_retry_policy(&mut self, id: &TaskId, retry_count: u32) -> Result<()> {
        match self.retry.decide(retry_count) {
            RetryDecision::Requeue { delay } => {
                let at = Utc::now() + chrono::Duration::from_std(delay).unwrap_or_else(|_| chrono::Duration::zero());
                blog_warn!(
                    "Task {} will retry in {:?} (attempt {} of {})",
                    id,
                    delay,
                    retry_count + 1,
                    self.retry.max_retries
                );
                self.transition(id, TaskStatus::Pending, TransitionMeta::default().retry_at(at))
                    .await
            }
            RetryDecision::GiveUp => {
                blog_warn!("Task {} failed permanently after {} attempt(s)", id, retry_count);
                Ok(())
            }
        }
    }

    fn enqueue_commit(&self, id: &TaskId, commit_file: &Path) {
        let Some(queue) = &self.commits else {
            return;
        };
        let Some(task) = self.state.task(id) else {
            return;
        };
        let mut request = GitCommitRequest {
            task_id: id.clone(),
            message: format!("{}: {}", id, task.description),
            files: task.file_refs.clone(),
        };
        match fs::read_to_string(commit_file) {
            Ok(text) => match serde_json::from_str::<CommitOverride>(&text) {
                Ok(over) => {
                    if let Some(message) = over.message {
                        request.message = message;
                    }
                    if let Some(files) = over.files {
                        request.files = files;
                    }
                }
                Err(e) => blog_warn!("Ignoring unreadable commit file for task {}: {}", id, e),
            },
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => blog_warn!("Failed to read commit file for task {}: {}", id, e),
        }
        if request.files.is_empty() {
            blog_debug!("Task {} has no files to commit", id);
            return;
        }

        let ticket = queue.enqueue(request);
        let emitter = self.emitter.clone();
        tokio::spawn(async move {
            let task_id = ticket.task_id().clone();
            if let Err(e) = ticket.await {
                emitter.emit(EventPayload::OrchestratorState {
                    state: RunState::CommitFailed,
                    task_id: Some(task_id),
                    detail: Some(e.to_string()),
                });
            }
        });
    }

    fn report_stuck(&mut self) {
        let reports = self.monitor.check(self.pool.running(), Instant::now());
        for report in reports {
            blog_warn!(
                "Task {} looks stuck: running for {:?} (retry, skip or keep waiting)",
                report.task_id,
                report.elapsed
            );
            self.emitter.emit(EventPayload::OrchestratorState {
                state: RunState::Stuck,
                task_id: Some(report.task_id),
                detail: Some(format!("running for {}s", report.elapsed.as_secs())),
            });
        }
    }

    /// Shutdown grace expired: stop waiting and leave the workers running.
    ///
    /// Their tasks stay `in_progress`, marked released, and are requeued
    /// without a retry charge when the plan is next opened.
    async fn release_in_flight(&mut self) {
        let ids = self.pool.release_all();
        blog_warn!(
            "Shutdown grace expired; leaving {} worker(s) running: {:?}",
            ids.len(),
            ids.iter().map(TaskId::as_str).collect::<Vec<_>>()
        );
        for id in &ids {
            self.monitor.forget(id);
        }
        let released = ids.clone();
        match self.store_op(move |store| store.release(&released)).await {
            Ok(state) => self.adopt(state),
            Err(e) => self.report_store_error(None, &e),
        }
        for id in ids {
            self.emitter.emit(EventPayload::OrchestratorState {
                state: RunState::ShuttingDown,
                task_id: Some(id),
                detail: Some("worker left running; task requeued on next start".to_string()),
            });
        }
    }

    fn kill_worker(&mut self, id: &TaskId) -> bool {
        let elapsed = self.pool.get(id).map(|h| h.started.elapsed());
        if !self.pool.kill(id) {
            return false;
        }
        self.monitor.forget(id);
        self.emitter.emit(EventPayload::ToolCompleted {
            task_id: id.clone(),
            success: false,
            exit_code: None,
            elapsed_ms: elapsed.unwrap_or_default().as_millis() as u64,
        });
        true
    }

    async fn handle_control(&mut self, request: ControlRequest) {
        let result = match &request.command {
            ControlCommand::Pause => self.pause().await,
            ControlCommand::Resume => self.resume().await,
            ControlCommand::Shutdown => self.request_shutdown(),
            ControlCommand::SkipTask { task_id } => self.skip_task(task_id).await,
            ControlCommand::RetryTask { task_id } => self.retry_task(task_id).await,
        };
        match &result {
            Ok(()) => blog!("Control command applied: {}", request.command),
            Err(e) => blog_warn!("Control command {} rejected: {}", request.command, e),
        }
        request.respond(ControlResponse::from_result(result));
    }

    async fn pause(&mut self) -> Result<()> {
        if self.paused {
            return Err(Error::Validation("orchestrator is already paused".to_string()));
        }
        if self.shutdown_deadline.is_some() {
            return Err(Error::Validation("orchestrator is shutting down".to_string()));
        }
        let state = self.store_op(|store| store.set_plan_status(PlanStatus::Paused)).await?;
        self.paused = true;
        self.adopt(state);
        self.emitter.emit(EventPayload::state(RunState::Paused));
        Ok(())
    }

    async fn resume(&mut self) -> Result<()> {
        if !self.paused {
            return Err(Error::Validation("orchestrator is not paused".to_string()));
        }
        let state = self.store_op(|store| store.set_plan_status(PlanStatus::Running)).await?;
        self.paused = false;
        self.adopt(state);
        self.emitter.emit(EventPayload::state(RunState::Resumed));
        Ok(())
    }

    fn request_shutdown(&mut self) -> Result<()> {
        if self.shutdown_deadline.is_some() {
            return Err(Error::Validation("shutdown already in progress".to_string()));
        }
        self.shutdown_deadline = Some(Instant::now() + self.shutdown_grace);
        self.paused = false;
        self.emitter.emit(EventPayload::OrchestratorState {
            state: RunState::ShuttingDown,
            task_id: None,
            detail: Some(format!("{} worker(s) in flight", self.pool.active_count())),
        });
        Ok(())
    }

    async fn skip_task(&mut self, id: &TaskId) -> Result<()> {
        let status = self
            .state
            .status_of(id)
            .ok_or_else(|| Error::TaskNotFound(id.to_string()))?;
        if !status.can_transition_to(TaskStatus::Skipped) {
            return Err(Error::InvalidTransition {
                task_id: id.to_string(),
                from: status.to_string(),
                to: TaskStatus::Skipped.to_string(),
            });
        }
        if status == TaskStatus::InProgress {
            self.kill_worker(id);
        }
        self.transition(id, TaskStatus::Skipped, TransitionMeta::default())
            .await
    }

    async fn retry_task(&mut self, id: &TaskId) -> Result<()> {
        let status = self
            .state
            .status_of(id)
            .ok_or_else(|| Error::TaskNotFound(id.to_string()))?;
        match status {
            TaskStatus::InProgress => {
                self.kill_worker(id);
                self.transition(
                    id,
                    TaskStatus::Failed,
                    TransitionMeta::error("retried by operator").retried(),
                )
                .await?;
            }
            TaskStatus::Failed => {}
            other => {
                return Err(Error::InvalidTransition {
                    task_id: id.to_string(),
                    from: other.to_string(),
                    to: TaskStatus::Pending.to_string(),
                })
            }
        }
        self.transition(id, TaskStatus::Pending, TransitionMeta::default())
            .await
    }

    async fn finish(&mut self, blocked: bool) -> RunSummary {
        if let Some(mut queue) = self.commits.take() {
            queue.shutdown().await;
        }

        let final_status = if self.scheduler.is_finished(&self.state) {
            None
        } else if blocked {
            Some(PlanStatus::Blocked)
        } else {
            Some(PlanStatus::Paused)
        };
        if let Some(status) = final_status {
            match self.store_op(move |store| store.set_plan_status(status)).await {
                Ok(state) => self.adopt(state),
                Err(e) => self.report_store_error(None, &e),
            }
        }

        let counts = self.state.counts();
        let summary = RunSummary {
            plan_status: self.state.plan.status,
            completed: counts.completed,
            failed: counts.failed,
            skipped: counts.skipped,
            pending: counts.pending,
            batches: self.batches,
        };
        let state = if blocked {
            RunState::Blocked
        } else {
            RunState::Finished
        };
        self.emitter.emit(EventPayload::OrchestratorState {
            state,
            task_id: None,
            detail: Some(self.state.plan.status.to_string()),
        });
        blog!(
            "Run finished: plan {} ({} completed, {} failed, {} skipped, {} pending, {} batch(es))",
            summary.plan_status,
            summary.completed,
            summary.failed,
            summary.skipped,
            summary.pending,
            summary.batches
        );
        summary
    }

    fn batch_result(&self, batch: &ExecutionBatch) -> BatchResult {
        let mut result = BatchResult {
            batch_id: batch.batch_id.clone(),
            ..BatchResult::default()
        };
        for id in &batch.task_ids {
            match self.state.status_of(id) {
                Some(TaskStatus::Completed) => result.completed.push(id.clone()),
                Some(TaskStatus::Skipped) => result.skipped.push(id.clone()),
                _ => result.failed.push(id.clone()),
            }
        }
        result
    }

    async fn transition(&mut self, id: &TaskId, to: TaskStatus, meta: TransitionMeta) -> Result<()> {
        let task_id = id.clone();
        let state = self
            .store_op(move |store| store.apply_transition(&task_id, to, meta))
            .await?;
        self.adopt(state);
        Ok(())
    }

    async fn store_op<F>(&self, f: F) -> Result<PlanState>
    where
        F: FnOnce(&StatusStore) -> Result<PlanState> + Send + 'static,
    {
        let store = self.store.clone();
        blocking(move || f(&store)).await
    }

    /// Replace the cached document and publish what changed.
    fn adopt(&mut self, state: PlanState) {
        let previous = std::mem::replace(&mut self.state, state);
        for task in &self.state.tasks {
            if let Some(from) = previous.status_of(&task.id) {
                if from != task.status {
                    self.emitter.emit(EventPayload::TaskChanged {
                        task_id: task.id.clone(),
                        from,
                        to: task.status,
                    });
                }
            }
        }
        for (before, after) in previous.phases.iter().zip(&self.state.phases) {
            if before.status != after.status {
                self.emitter.emit(EventPayload::PhaseChanged {
                    phase_id: after.id.clone(),
                    status: after.status,
                });
            }
        }
        self.emitter.emit(EventPayload::StatusUpdated {
            plan_status: self.state.plan.status,
            counts: self.state.counts(),
        });
    }
}

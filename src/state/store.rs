//! Durable status store.
//!
//! Every mutation is a read-modify-write under an exclusive advisory lock on
//! `<state>.lock`. Writes go to `<state>.tmp` and are renamed over the
//! canonical file, after rotating the previous file into `<state>.bak.1..5`.

use chrono::{DateTime, Utc};
use fs2::FileExt;
use std::fs::{self, File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::thread;
use std::time::Duration;

use crate::core::dag::DependencyGraph;
use crate::core::plan::{Plan, PlanStatus};
use crate::core::task::{TaskId, TaskStatus};
use crate::state::document::PlanState;
use crate::util::backoff_delay;
use crate::{blog, blog_debug, blog_warn, Error, Result};

pub const MAX_BACKUPS: usize = 5;
const LOCK_ATTEMPTS: u32 = 8;
const LOCK_BACKOFF_BASE: Duration = Duration::from_millis(10);
const LOCK_BACKOFF_MAX: Duration = Duration::from_millis(500);

/// Side data recorded alongside a status transition.
#[derive(Debug, Clone, Default)]
pub struct TransitionMeta {
    pub error: Option<String>,
    pub increment_retry: bool,
    pub next_retry_at: Option<DateTime<Utc>>,
}

impl TransitionMeta {
    pub fn error(message: impl Into<String>) -> Self {
        Self {
            error: Some(message.into()),
            ..Self::default()
        }
    }

    /// Count this transition as one more failed attempt.
    pub fn retried(mut self) -> Self {
        self.increment_retry = true;
        self
    }

    pub fn retry_at(mut self, at: DateTime<Utc>) -> Self {
        self.next_retry_at = Some(at);
        self
    }
}

/// Result of [`StatusStore::open_or_init`].
#[derive(Debug)]
pub struct OpenOutcome {
    pub store: StatusStore,
    pub state: PlanState,
    /// `true` when an existing document for the same plan was resumed.
    pub resumed: bool,
    /// Backup slot the state was recovered from, when the canonical file was unusable.
    pub recovered_from: Option<usize>,
    /// Tasks that were `in_progress` when the previous process died, now `failed`.
    pub interrupted: Vec<TaskId>,
    /// Tasks left running by an orderly shutdown, now `pending` again.
    pub released: Vec<TaskId>,
}

#[derive(Debug, Clone)]
pub struct StatusStore {
    path: PathBuf,
    skip_through: bool,
}

struct LockGuard {
    file: File,
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        if let Err(e) = FileExt::unlock(&self.file) {
            blog_warn!("Failed to release status lock: {}", e);
        }
    }
}

fn with_suffix(path: &Path, suffix: &str) -> PathBuf {
    let mut os = path.as_os_str().to_owned();
    os.push(suffix);
    PathBuf::from(os)
}

impl StatusStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            skip_through: true,
        }
    }

    pub fn with_skip_through(mut self, skip_through: bool) -> Self {
        self.skip_through = skip_through;
        self
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn lock_path(&self) -> PathBuf {
        with_suffix(&self.path, ".lock")
    }

    pub fn temp_path(&self) -> PathBuf {
        with_suffix(&self.path, ".tmp")
    }

    /// `n` is 1-based; 1 is the newest backup.
    pub fn backup_path(&self, n: usize) -> PathBuf {
        with_suffix(&self.path, &format!(".bak.{}", n))
    }

    /// Open the store for `plan`, resuming a matching document or creating one.
    ///
    /// # Errors
    /// - [`Error::PlanMismatch`] when the stored document describes another plan.
    /// - [`Error::StateCorrupted`] when files exist but none of them parse.
    pub fn open_or_init(
        path: impl Into<PathBuf>,
        plan: &Plan,
        graph: &DependencyGraph,
        default_threshold: f64,
        skip_through: bool,
    ) -> Result<OpenOutcome> {
        let store = Self::new(path).with_skip_through(skip_through);
        if let Some(parent) = store.path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }
        let _lock = store.lock()?;

        let Some((mut state, recovered_from)) = store.load_recovering()? else {
            let mut state = PlanState::from_plan(plan, graph, default_threshold);
            store.write_unlocked(&mut state)?;
            blog!(
                "Initialized status store {} for plan {} ({} tasks)",
                store.path.display(),
                plan.id,
                plan.task_count()
            );
            return Ok(OpenOutcome {
                store: store.clone(),
                state,
                resumed: false,
                recovered_from: None,
                interrupted: Vec::new(),
                released: Vec::new(),
            });
        };

        if !state.matches(plan) {
            return Err(Error::PlanMismatch(format!(
                "{} holds plan {:?}, expected {:?}",
                store.path.display(),
                state.plan.id,
                plan.id
            )));
        }

        let (released, interrupted): (Vec<TaskId>, Vec<TaskId>) = state
            .in_progress()
            .into_iter()
            .partition(|id| state.task(id).is_some_and(|t| t.released_at.is_some()));
        let now = Utc::now();
        for id in &released {
            if let Some(task) = state.task_mut(id) {
                task.status = TaskStatus::Pending;
                task.started_at = None;
                task.next_retry_at = None;
                task.released_at = None;
            }
        }
        for id in &interrupted {
            if let Some(task) = state.task_mut(id) {
                task.status = TaskStatus::Failed;
                task.retry_count += 1;
                task.last_error = Some("interrupted".to_string());
                task.completed_at = Some(now);
            }
        }
        if !released.is_empty() {
            blog!(
                "Requeued {} task(s) released at shutdown: {:?}",
                released.len(),
                released.iter().map(TaskId::as_str).collect::<Vec<_>>()
            );
        }
        if !interrupted.is_empty() {
            blog_warn!(
                "Resumed plan {} with {} interrupted task(s): {:?}",
                plan.id,
                interrupted.len(),
                interrupted.iter().map(TaskId::as_str).collect::<Vec<_>>()
            );
        }
        if recovered_from.is_some() || !interrupted.is_empty() || !released.is_empty() {
            store.write_unlocked(&mut state)?;
        }
        blog!("Resumed status store {} for plan {}", store.path.display(), plan.id);

        Ok(OpenOutcome {
            store: store.clone(),
            state,
            resumed: true,
            recovered_from,
            interrupted,
            released,
        })
    }

    /// Read the current document, falling back to backups.
    pub fn read(&self) -> Result<PlanState> {
        match self.load_recovering()? {
            Some((state, _)) => Ok(state),
            None => Err(Error::Io(io::Error::new(
                io::ErrorKind::NotFound,
                format!("no status file at {}", self.path.display()),
            ))),
        }
    }

    /// Validate and apply one task transition.
    ///
    /// # Errors
    /// [`Error::InvalidTransition`] when `to` is not reachable from the
    /// current status, [`Error::TaskNotFound`] for an unknown id.
    pub fn apply_transition(
        &self,
        id: &TaskId,
        to: TaskStatus,
        meta: TransitionMeta,
    ) -> Result<PlanState> {
        self.update(|state| transition(state, id, to, meta))
    }

    pub fn set_plan_status(&self, status: PlanStatus) -> Result<PlanState> {
        self.update(|state| {
            state.plan.status = status;
            Ok(())
        })
    }

    /// Mark `in_progress` tasks whose workers are left running at shutdown.
    ///
    /// The next [`StatusStore::open_or_init`] requeues them without charging
    /// a retry. Tasks no longer `in_progress` are left alone.
    pub fn release(&self, ids: &[TaskId]) -> Result<PlanState> {
        let now = Utc::now();
        self.update(|state| {
            for id in ids {
                if let Some(task) = state.task_mut(id) {
                    if task.status == TaskStatus::InProgress {
                        task.released_at = Some(now);
                    }
                }
            }
            Ok(())
        })
    }

    /// Read-modify-write under the lock. Nothing is written if `f` fails.
    pub fn update<F>(&self, f: F) -> Result<PlanState>
    where
        F: FnOnce(&mut PlanState) -> Result<()>,
    {
        let _lock = self.lock()?;
        let mut state = self.read()?;
        f(&mut state)?;
        self.write_unlocked(&mut state)?;
        Ok(state)
    }

    /// Replace the document wholesale.
    pub fn write(&self, state: &mut PlanState) -> Result<()> {
        let _lock = self.lock()?;
        self.write_unlocked(state)
    }

    fn lock(&self) -> Result<LockGuard> {
        let file = OpenOptions::new()
            .create(true)
            .truncate(false)
            .write(true)
            .open(self.lock_path())?;
        for attempt in 1..=LOCK_ATTEMPTS {
            match file.try_lock_exclusive() {
                Ok(()) => return Ok(LockGuard { file }),
                Err(e) if e.kind() == fs2::lock_contended_error().kind() => {
                    let delay = backoff_delay(LOCK_BACKOFF_BASE, attempt, LOCK_BACKOFF_MAX);
                    blog_debug!("Status lock contended (attempt {}), waiting {:?}", attempt, delay);
                    thread::sleep(delay);
                }
                Err(e) => return Err(e.into()),
            }
        }
        blog_warn!("Gave up on status lock after {} attempts", LOCK_ATTEMPTS);
        Err(Error::StoreContention {
            attempts: LOCK_ATTEMPTS,
        })
    }

    /// `Ok(None)` when neither the canonical file nor any backup exists.
    fn load_recovering(&self) -> Result<Option<(PlanState, Option<usize>)>> {
        let mut seen_any = false;
        match read_document(&self.path) {
            Ok(Some(state)) => return Ok(Some((state, None))),
            Ok(None) => {}
            Err(e) => {
                seen_any = true;
                blog_warn!("Status file {} is unreadable: {}", self.path.display(), e);
            }
        }

        for n in 1..=MAX_BACKUPS {
            let backup = self.backup_path(n);
            match read_document(&backup) {
                Ok(Some(state)) => {
                    blog_warn!(
                        "Degraded recovery: restored status from {}",
                        backup.display()
                    );
                    return Ok(Some((state, Some(n))));
                }
                Ok(None) => {}
                Err(e) => {
                    seen_any = true;
                    blog_warn!("Backup {} is unreadable: {}", backup.display(), e);
                }
            }
        }

        if seen_any {
            return Err(Error::StateCorrupted(format!(
                "{} and its backups",
                self.path.display()
            )));
        }
        Ok(None)
    }

    fn write_unlocked(&self, state: &mut PlanState) -> Result<()> {
        state.recompute(self.skip_through);
        state.last_updated = Utc::now();
        let contents = serde_json::to_string_pretty(state)?;

        if self.path.exists() {
            self.rotate_backups()?;
        }

        let temp_path = self.temp_path();
        {
            let mut file = File::create(&temp_path)?;
            file.write_all(contents.as_bytes())?;
            file.sync_all()?;
        }
        fs::rename(&temp_path, &self.path)?;
        blog_debug!(
            "Status saved: {} (plan status {})",
            self.path.display(),
            state.plan.status
        );
        Ok(())
    }

    fn rotate_backups(&self) -> Result<()> {
        let oldest = self.backup_path(MAX_BACKUPS);
        if oldest.exists() {
            fs::remove_file(&oldest)?;
        }
        for n in (1..MAX_BACKUPS).rev() {
            let from = self.backup_path(n);
            if from.exists() {
                fs::rename(&from, self.backup_path(n + 1))?;
            }
        }
        fs::copy(&self.path, self.backup_path(1))?;
        Ok(())
    }
}

fn read_document(path: &Path) -> Result<Option<PlanState>> {
    let contents = match fs::read_to_string(path) {
        Ok(c) => c,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(e.into()),
    };
    Ok(Some(serde_json::from_str(&contents)?))
}

/// Apply one status transition to an in-memory document.
pub fn transition(
    state: &mut PlanState,
    id: &TaskId,
    to: TaskStatus,
    meta: TransitionMeta,
) -> Result<()> {
    let task = state
        .task_mut(id)
        .ok_or_else(|| Error::TaskNotFound(id.to_string()))?;
    let from = task.status;
    if !from.can_transition_to(to) {
        return Err(Error::InvalidTransition {
            task_id: id.to_string(),
            from: from.to_string(),
            to: to.to_string(),
        });
    }

    let now = Utc::now();
    task.status = to;
    task.released_at = None;
    match to {
        TaskStatus::InProgress => {
            task.started_at = Some(now);
            task.completed_at = None;
            task.next_retry_at = None;
        }
        TaskStatus::Completed | TaskStatus::Skipped => {
            task.completed_at = Some(now);
            task.next_retry_at = None;
        }
        TaskStatus::Failed => {
            task.completed_at = Some(now);
        }
        TaskStatus::Pending => {
            task.started_at = None;
            task.completed_at = None;
            task.next_retry_at = meta.next_retry_at;
        }
    }
    if meta.increment_retry {
        task.retry_count += 1;
    }
    if meta.error.is_some() {
        task.last_error = meta.error;
    }
    blog_debug!("Task {}: {} -> {}", id, from, to);
    Ok(())
}

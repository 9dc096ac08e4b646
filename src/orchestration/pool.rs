//! Worker pool: one OS process per running task.
//!
//! Each worker is supervised by its own tokio task, which reports the exit
//! over a channel. Workers carry a generation number so that a result from a
//! killed worker can be told apart from its replacement.

use std::collections::HashMap;
use std::fs::{self, File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::{Duration, Instant};

use tokio::process::Command;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::core::task::TaskId;
use crate::error::Result;
use crate::{blog, blog_debug, blog_warn, Error};

/// Bytes of worker output kept in `lastError`.
const LOG_TAIL_BYTES: u64 = 2048;

/// How a worker process ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WorkerExit {
    Succeeded,
    Failed { code: Option<i32>, error: String },
    /// Terminated on operator request.
    Killed,
}

/// Emitted once per worker when it ends.
#[derive(Debug, Clone)]
pub struct WorkerEvent {
    pub task_id: TaskId,
    pub generation: u64,
    pub exit: WorkerExit,
    pub elapsed: Duration,
}

/// Everything needed to launch one worker.
#[derive(Debug, Clone)]
pub struct WorkerSpec {
    pub task_id: TaskId,
    pub phase_id: String,
    pub plan_id: String,
    pub instance_id: String,
    pub description: String,
}

/// A live worker.
#[derive(Debug)]
pub struct WorkerHandle {
    pub task_id: TaskId,
    pub generation: u64,
    pub started: Instant,
    pub pid: Option<u32>,
    pub log_path: PathBuf,
    pub commit_file: PathBuf,
    cancel: CancellationToken,
    supervisor: JoinHandle<()>,
}

pub struct WorkerPool {
    template: Vec<String>,
    log_dir: PathBuf,
    working_dir: Option<PathBuf>,
    workers: HashMap<TaskId, WorkerHandle>,
    event_tx: mpsc::Sender<WorkerEvent>,
    next_generation: u64,
}

/// Substitute `{task_id}`, `{phase_id}`, `{plan_id}` and `{description}` in
/// each whitespace-separated argument of `template`.
pub fn render_command(template: &[String], spec: &WorkerSpec) -> Vec<String> {
    template
        .iter()
        .map(|arg| {
            arg.replace("{task_id}", spec.task_id.as_str())
                .replace("{phase_id}", &spec.phase_id)
                .replace("{plan_id}", &spec.plan_id)
                .replace("{description}", &spec.description)
        })
        .collect()
}

/// Locate the worker binary named by `worker_command` on PATH.
///
/// # Errors
/// `Error::Validation` when the command is empty or the binary is missing.
pub fn resolve_worker(worker_command: &str) -> Result<PathBuf> {
    let Some(program) = worker_command.split_whitespace().next() else {
        return Err(Error::Validation("worker command is empty".to_string()));
    };
    which::which(program)
        .map_err(|e| Error::Validation(format!("worker binary {:?} not found: {}", program, e)))
}

/// Last bytes of a worker log, trimmed to whole lines where possible.
pub fn log_tail(path: &Path) -> Option<String> {
    let mut file = File::open(path).ok()?;
    let len = file.metadata().ok()?.len();
    let start = len.saturating_sub(LOG_TAIL_BYTES);
    file.seek(SeekFrom::Start(start)).ok()?;
    let mut buf = Vec::new();
    file.read_to_end(&mut buf).ok()?;
    let text = String::from_utf8_lossy(&buf);
    let text = if start > 0 {
        text.split_once('\n').map(|(_, rest)| rest).unwrap_or(&text)
    } else {
        &text
    };
    let text = text.trim();
    if text.is_empty() {
        None
    } else {
        Some(text.to_string())
    }
}

impl WorkerPool {
    pub fn new(worker_command: &str, log_dir: impl Into<PathBuf>, event_tx: mpsc::Sender<WorkerEvent>) -> Self {
        Self {
            template: worker_command.split_whitespace().map(String::from).collect(),
            log_dir: log_dir.into(),
            working_dir: None,
            workers: HashMap::new(),
            event_tx,
            next_generation: 1,
        }
    }

    /// Run workers in `dir` instead of the current directory.
    pub fn with_working_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.set_working_dir(dir);
        self
    }

    pub fn set_working_dir(&mut self, dir: impl Into<PathBuf>) {
        self.working_dir = Some(dir.into());
    }

    fn file_stem(id: &TaskId) -> String {
        id.as_str().replace(['/', '\\'], "_")
    }

    pub fn log_path(&self, id: &TaskId) -> PathBuf {
        self.log_dir.join(format!("{}.log", Self::file_stem(id)))
    }

    pub fn commit_file(&self, id: &TaskId) -> PathBuf {
        self.log_dir.join(format!("{}.commit.json", Self::file_stem(id)))
    }

    /// Start a worker for `spec`. Returns the worker's generation.
    ///
    /// # Errors
    /// Spawn failures (missing binary, unwritable log directory).
    pub fn spawn(&mut self, spec: &WorkerSpec) -> Result<u64> {
        if self.workers.contains_key(&spec.task_id) {
            return Err(Error::Validation(format!(
                "task {} already has a running worker",
                spec.task_id
            )));
        }
        let argv = render_command(&self.template, spec);
        let Some((program, args)) = argv.split_first() else {
            return Err(Error::Validation("worker command is empty".to_string()));
        };

        fs::create_dir_all(&self.log_dir)?;
        let log_path = self.log_path(&spec.task_id);
        let commit_file = self.commit_file(&spec.task_id);
        if commit_file.exists() {
            fs::remove_file(&commit_file)?;
        }
        let mut log = OpenOptions::new().create(true).append(true).open(&log_path)?;
        writeln!(
            log,
            "--- {} task {} ---",
            chrono::Utc::now().to_rfc3339(),
            spec.task_id
        )?;
        let stderr = log.try_clone()?;

        let mut command = Command::new(program);
        command
            .args(args)
            .env("BATON_TASK_ID", spec.task_id.as_str())
            .env("BATON_PHASE_ID", &spec.phase_id)
            .env("BATON_PLAN_ID", &spec.plan_id)
            .env("BATON_INSTANCE_ID", &spec.instance_id)
            .env("BATON_COMMIT_FILE", &commit_file)
            .stdin(Stdio::null())
            .stdout(Stdio::from(log))
            .stderr(Stdio::from(stderr));
        if let Some(dir) = &self.working_dir {
            command.current_dir(dir);
        }

        let mut child = command.spawn()?;
        let pid = child.id();
        let generation = self.next_generation;
        self.next_generation += 1;

        let cancel = CancellationToken::new();
        let token = cancel.clone();
        let tx = self.event_tx.clone();
        let task_id = spec.task_id.clone();
        let started = Instant::now();
        let supervisor = tokio::spawn(async move {
            let exit = tokio::select! {
                status = child.wait() => match status {
                    Ok(s) if s.success() => WorkerExit::Succeeded,
                    Ok(s) => WorkerExit::Failed {
                        code: s.code(),
                        error: format!("worker exited with {}", s),
                    },
                    Err(e) => WorkerExit::Failed {
                        code: None,
                        error: format!("failed to wait for worker: {}", e),
                    },
                },
                _ = token.cancelled() => {
                    if let Err(e) = child.kill().await {
                        blog_warn!("Failed to kill worker for task {}: {}", task_id, e);
                    }
                    WorkerExit::Killed
                }
            };
            let event = WorkerEvent {
                task_id,
                generation,
                exit,
                elapsed: started.elapsed(),
            };
            // The receiver is gone only when the coordinator has stopped.
            let _ = tx.send(event).await;
        });

        blog!(
            "Spawned worker for task {} (gen {}, pid {:?}): {}",
            spec.task_id,
            generation,
            pid,
            program
        );
        self.workers.insert(
            spec.task_id.clone(),
            WorkerHandle {
                task_id: spec.task_id.clone(),
                generation,
                started,
                pid,
                log_path,
                commit_file,
                cancel,
                supervisor,
            },
        );
        Ok(generation)
    }

    /// Claim the handle for a finished worker. `None` for stale generations.
    pub fn finish(&mut self, id: &TaskId, generation: u64) -> Option<WorkerHandle> {
        match self.workers.get(id) {
            Some(handle) if handle.generation == generation => self.workers.remove(id),
            _ => {
                blog_debug!("Discarding stale worker result for task {} (gen {})", id, generation);
                None
            }
        }
    }

    /// Terminate a worker. Its eventual result is stale.
    pub fn kill(&mut self, id: &TaskId) -> bool {
        match self.workers.remove(id) {
            Some(handle) => {
                blog!("Killing worker for task {} (gen {})", id, handle.generation);
                handle.cancel.cancel();
                true
            }
            None => false,
        }
    }

    /// Stop tracking every worker without terminating it. The processes
    /// keep running and their results are never collected.
    pub fn release_all(&mut self) -> Vec<TaskId> {
        let mut ids: Vec<TaskId> = self.workers.drain().map(|(id, _)| id).collect();
        ids.sort();
        for id in &ids {
            blog!("Releasing worker for task {}", id);
        }
        ids
    }

    pub fn is_running(&self, id: &TaskId) -> bool {
        self.workers.contains_key(id)
    }

    pub fn get(&self, id: &TaskId) -> Option<&WorkerHandle> {
        self.workers.get(id)
    }

    /// `(task, started)` for every live worker.
    pub fn running(&self) -> impl Iterator<Item = (&TaskId, Instant)> {
        self.workers.iter().map(|(id, h)| (id, h.started))
    }

    pub fn active_count(&self) -> usize {
        self.workers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.workers.is_empty()
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        for handle in self.workers.values() {
            handle.supervisor.abort();
        }
    }
}

//! FIFO serialization point for git commits.
//!
//! Workers finish concurrently but the repository index is shared, so every
//! commit goes through one background task that handles requests strictly in
//! the order they were enqueued.

use serde::{Deserialize, Serialize};
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::task::{spawn_blocking, JoinHandle};

use crate::core::task::TaskId;
use crate::{blog, blog_debug, blog_warn, Error, Result};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GitCommitRequest {
    pub task_id: TaskId,
    pub message: String,
    #[serde(default)]
    pub files: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CommitResult {
    pub task_id: TaskId,
    /// `None` when the requested files had no changes to record.
    pub commit: Option<String>,
}

/// Backend that records one commit. Runs on the blocking pool.
pub trait Committer: Send + Sync + 'static {
    fn commit(&self, files: &[String], message: &str) -> Result<Option<String>>;
}

struct Job {
    request: GitCommitRequest,
    reply: oneshot::Sender<Result<CommitResult>>,
}

/// Resolves once the queue worker has handled the request.
pub struct CommitTicket {
    task_id: TaskId,
    rx: oneshot::Receiver<Result<CommitResult>>,
}

impl CommitTicket {
    pub fn task_id(&self) -> &TaskId {
        &self.task_id
    }
}

impl Future for CommitTicket {
    type Output = Result<CommitResult>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        Pin::new(&mut self.rx)
            .poll(cx)
            .map(|reply| reply.unwrap_or(Err(Error::CommitQueueClosed)))
    }
}

pub struct CommitQueue {
    tx: Option<mpsc::UnboundedSender<Job>>,
    worker: Option<JoinHandle<()>>,
    queued: Arc<AtomicUsize>,
}

impl CommitQueue {
    /// Start the queue worker on the current runtime.
    pub fn start(committer: Arc<dyn Committer>, timeout: Duration) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        let queued = Arc::new(AtomicUsize::new(0));
        let worker = tokio::spawn(run_worker(committer, timeout, rx, queued.clone()));
        Self {
            tx: Some(tx),
            worker: Some(worker),
            queued,
        }
    }

    pub fn enqueue(&self, request: GitCommitRequest) -> CommitTicket {
        let (reply, rx) = oneshot::channel();
        let task_id = request.task_id.clone();
        match &self.tx {
            Some(tx) => {
                self.queued.fetch_add(1, Ordering::SeqCst);
                if tx.send(Job { request, reply }).is_err() {
                    // The dropped reply resolves the ticket as closed.
                    self.queued.fetch_sub(1, Ordering::SeqCst);
                }
            }
            None => drop(reply),
        }
        CommitTicket { task_id, rx }
    }

    /// Requests accepted but not yet finished.
    pub fn pending(&self) -> usize {
        self.queued.load(Ordering::SeqCst)
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_none()
    }

    /// Stop accepting requests and wait for queued commits to drain.
    pub async fn shutdown(&mut self) {
        self.tx.take();
        if let Some(worker) = self.worker.take() {
            if let Err(e) = worker.await {
                blog_warn!("Commit queue worker ended abnormally: {}", e);
            }
        }
    }
}

impl Drop for CommitQueue {
    fn drop(&mut self) {
        // Dropping the sender lets the worker finish what is queued and exit.
        self.tx.take();
    }
}

async fn run_worker(
    committer: Arc<dyn Committer>,
    timeout: Duration,
    mut rx: mpsc::UnboundedReceiver<Job>,
    queued: Arc<AtomicUsize>,
) {
    while let Some(Job { request, reply }) = rx.recv().await {
        let GitCommitRequest {
            task_id,
            message,
            files,
        } = request;
        blog_debug!("Committing {} file(s) for task {}", files.len(), task_id);

        let backend = committer.clone();
        let mut job = spawn_blocking(move || backend.commit(&files, &message));
        let outcome = match tokio::time::timeout(timeout, &mut job).await {
            Ok(joined) => joined.map_err(|e| Error::TaskJoin(e.to_string())).and_then(|r| r),
            Err(_) => {
                blog_warn!("Commit for task {} timed out after {:?}", task_id, timeout);
                let _ = reply.send(Err(Error::CommitTimeout {
                    task_id: task_id.to_string(),
                    timeout,
                }));
                // The git work cannot be cancelled; the next commit waits for it.
                match job.await {
                    Ok(Ok(commit)) => {
                        blog_warn!("Timed-out commit for task {} landed late: {:?}", task_id, commit)
                    }
                    Ok(Err(e)) => blog_warn!("Timed-out commit for task {} failed: {}", task_id, e),
                    Err(e) => blog_warn!("Timed-out commit for task {} panicked: {}", task_id, e),
                }
                queued.fetch_sub(1, Ordering::SeqCst);
                continue;
            }
        };
        let result = match outcome {
            Ok(commit) => {
                match &commit {
                    Some(oid) => blog!("Task {} committed as {}", task_id, oid),
                    None => blog_debug!("Task {} had nothing to commit", task_id),
                }
                Ok(CommitResult { task_id, commit })
            }
            Err(e) => {
                blog_warn!("Commit for task {} failed: {}", task_id, e);
                Err(e)
            }
        };

        queued.fetch_sub(1, Ordering::SeqCst);
        // The requester may have stopped waiting; the commit still happened.
        let _ = reply.send(result);
    }
    blog_debug!("Commit queue drained");
}

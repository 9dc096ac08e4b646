//! Operator control over a Unix domain socket.
//!
//! One newline-delimited JSON request and one response per connection:
//! `{"command":"skip-task","taskId":"2.1"}` → `{"ok":true}`. The server only
//! parses and forwards; validation against orchestrator state happens in the
//! coordinator, which answers through a oneshot reply.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::net::{UnixListener, UnixStream};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::core::task::TaskId;
use crate::{blog, blog_debug, blog_warn, Error, Result};

/// How long a client may take to send its request line.
const READ_TIMEOUT: Duration = Duration::from_secs(10);
/// How long a client waits for the orchestrator to answer.
const RESPONSE_TIMEOUT: Duration = Duration::from_secs(60);

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "command", rename_all = "kebab-case")]
pub enum ControlCommand {
    Pause,
    Resume,
    Shutdown,
    SkipTask {
        #[serde(rename = "taskId")]
        task_id: TaskId,
    },
    RetryTask {
        #[serde(rename = "taskId")]
        task_id: TaskId,
    },
}

impl ControlCommand {
    pub fn name(&self) -> &'static str {
        match self {
            ControlCommand::Pause => "pause",
            ControlCommand::Resume => "resume",
            ControlCommand::Shutdown => "shutdown",
            ControlCommand::SkipTask { .. } => "skip-task",
            ControlCommand::RetryTask { .. } => "retry-task",
        }
    }
}

impl std::fmt::Display for ControlCommand {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ControlCommand::SkipTask { task_id } | ControlCommand::RetryTask { task_id } => {
                write!(f, "{} {}", self.name(), task_id)
            }
            _ => f.write_str(self.name()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ControlResponse {
    pub ok: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl ControlResponse {
    pub fn ok() -> Self {
        Self {
            ok: true,
            error: None,
        }
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self {
            ok: false,
            error: Some(message.into()),
        }
    }

    pub fn from_result(result: Result<()>) -> Self {
        match result {
            Ok(()) => Self::ok(),
            Err(e) => Self::error(e.to_string()),
        }
    }
}

/// A parsed command waiting for the coordinator's answer.
#[derive(Debug)]
pub struct ControlRequest {
    pub command: ControlCommand,
    pub reply: oneshot::Sender<ControlResponse>,
}

impl ControlRequest {
    pub fn respond(self, response: ControlResponse) {
        // The client may already have hung up.
        let _ = self.reply.send(response);
    }
}

pub struct IpcServer {
    path: PathBuf,
    cancel: CancellationToken,
    accept_loop: Option<JoinHandle<()>>,
}

impl IpcServer {
    /// Bind the socket and start accepting. A stale socket file left by a
    /// dead process is replaced; a live one is an error.
    pub fn bind(
        path: impl Into<PathBuf>,
        requests: mpsc::Sender<ControlRequest>,
        cancel: CancellationToken,
    ) -> Result<Self> {
        let path = path.into();
        if path.exists() {
            if std::os::unix::net::UnixStream::connect(&path).is_ok() {
                return Err(Error::Validation(format!(
                    "another orchestrator is listening on {}",
                    path.display()
                )));
            }
            blog_debug!("Removing stale control socket {}", path.display());
            std::fs::remove_file(&path)?;
        }
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let listener = UnixListener::bind(&path)?;
        blog!("Control socket listening on {}", path.display());
        let accept_loop = tokio::spawn(accept_loop(listener, requests, cancel.clone()));
        Ok(Self {
            path,
            cancel,
            accept_loop: Some(accept_loop),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Stop accepting and remove the socket file.
    pub async fn shutdown(mut self) {
        self.cancel.cancel();
        if let Some(handle) = self.accept_loop.take() {
            let _ = handle.await;
        }
        self.remove_socket();
    }

    fn remove_socket(&self) {
        if let Err(e) = std::fs::remove_file(&self.path) {
            if e.kind() != std::io::ErrorKind::NotFound {
                blog_warn!("Failed to remove control socket {}: {}", self.path.display(), e);
            }
        }
    }
}

impl Drop for IpcServer {
    fn drop(&mut self) {
        if let Some(handle) = self.accept_loop.take() {
            self.cancel.cancel();
            handle.abort();
            self.remove_socket();
        }
    }
}

async fn accept_loop(
    listener: UnixListener,
    requests: mpsc::Sender<ControlRequest>,
    cancel: CancellationToken,
) {
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            accepted = listener.accept() => match accepted {
                Ok((stream, _)) => {
                    tokio::spawn(handle_connection(stream, requests.clone()));
                }
                Err(e) => {
                    blog_warn!("Control socket accept failed: {}", e);
                    tokio::time::sleep(Duration::from_millis(100)).await;
                }
            },
        }
    }
    blog_debug!("Control socket closed");
}

async fn handle_connection(stream: UnixStream, requests: mpsc::Sender<ControlRequest>) {
    let (read_half, mut write_half) = stream.into_split();
    let mut lines = BufReader::new(read_half).lines();

    let response = match tokio::time::timeout(READ_TIMEOUT, lines.next_line()).await {
        Ok(Ok(Some(line))) => match serde_json::from_str::<ControlCommand>(line.trim()) {
            Ok(command) => forward(command, &requests).await,
            Err(e) => {
                blog_warn!("Rejected malformed control request: {}", e);
                ControlResponse::error(format!("malformed command: {}", e))
            }
        },
        Ok(Ok(None)) => ControlResponse::error("empty request"),
        Ok(Err(e)) => ControlResponse::error(format!("read failed: {}", e)),
        Err(_) => ControlResponse::error("timed out waiting for request"),
    };

    if let Err(e) = write_response(&mut write_half, &response).await {
        blog_debug!("Failed to answer control client: {}", e);
    }
}

async fn forward(command: ControlCommand, requests: &mpsc::Sender<ControlRequest>) -> ControlResponse {
    blog!("Control command received: {}", command);
    let (reply, rx) = oneshot::channel();
    if requests.send(ControlRequest { command, reply }).await.is_err() {
        return ControlResponse::error("orchestrator is not running");
    }
    rx.await
        .unwrap_or_else(|_| ControlResponse::error("orchestrator stopped before answering"))
}

async fn write_response<W>(writer: &mut W, response: &ControlResponse) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    let mut body = serde_json::to_vec(response)?;
    body.push(b'\n');
    writer.write_all(&body).await?;
    writer.flush().await?;
    Ok(())
}

/// Send one command to a running orchestrator and wait for its answer.
pub async fn send_command(socket: &Path, command: &ControlCommand) -> Result<ControlResponse> {
    let stream = UnixStream::connect(socket).await.map_err(|e| {
        Error::Protocol(format!(
            "cannot reach orchestrator at {}: {}",
            socket.display(),
            e
        ))
    })?;
    let (read_half, mut write_half) = stream.into_split();

    let mut body = serde_json::to_vec(command)?;
    body.push(b'\n');
    write_half.write_all(&body).await?;
    write_half.flush().await?;

    let mut lines = BufReader::new(read_half).lines();
    let reply = tokio::time::timeout(RESPONSE_TIMEOUT, lines.next_line())
        .await
        .map_err(|_| Error::Timeout(RESPONSE_TIMEOUT))?;
    match reply? {
        Some(line) => Ok(serde_json::from_str(&line)?),
        None => Err(Error::Protocol("orchestrator closed the connection".to_string())),
    }
}

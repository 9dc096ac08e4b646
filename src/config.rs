use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::{blog_debug, Error, Result};

pub const DEFAULT_MAX_BATCH_SIZE: usize = 4;
pub const DEFAULT_STUCK_TIMEOUT_SECS: u64 = 30 * 60;
pub const DEFAULT_MAX_RETRIES: u32 = 3;
pub const DEFAULT_COMMIT_TIMEOUT_SECS: u64 = 5 * 60;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Directory holding the status file, its backups, worker logs and the socket.
    pub state_dir: PathBuf,
    pub scheduler: SchedulerConfig,
    pub execution: ExecutionConfig,
    pub commit: CommitConfig,
    pub conflicts: ConflictConfig,
    pub ipc: IpcConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    pub max_batch_size: usize,
    /// Used for phases whose header does not carry a threshold.
    pub phase_completion_threshold: f64,
    /// Treat `skipped` dependencies as satisfied.
    pub skip_through: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ExecutionConfig {
    /// Worker command template. Split on whitespace; `{task_id}`, `{phase_id}`,
    /// `{plan_id}` and `{description}` are substituted per argument.
    pub worker_command: String,
    pub stuck_timeout_secs: u64,
    pub max_retries: u32,
    pub retry_backoff_base_secs: u64,
    pub retry_backoff_max_secs: u64,
    pub poll_interval_ms: u64,
    pub shutdown_grace_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CommitConfig {
    pub enabled: bool,
    pub timeout_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ConflictConfig {
    pub path_prefixes: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct IpcConfig {
    pub socket_path: Option<PathBuf>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            state_dir: PathBuf::from(".baton"),
            scheduler: SchedulerConfig::default(),
            execution: ExecutionConfig::default(),
            commit: CommitConfig::default(),
            conflicts: ConflictConfig::default(),
            ipc: IpcConfig::default(),
        }
    }
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            max_batch_size: DEFAULT_MAX_BATCH_SIZE,
            phase_completion_threshold: 1.0,
            skip_through: true,
        }
    }
}

impl Default for ExecutionConfig {
    fn default() -> Self {
        Self {
            worker_command: "claude -p {description}".to_string(),
            stuck_timeout_secs: DEFAULT_STUCK_TIMEOUT_SECS,
            max_retries: DEFAULT_MAX_RETRIES,
            retry_backoff_base_secs: 30,
            retry_backoff_max_secs: 15 * 60,
            poll_interval_ms: 500,
            shutdown_grace_secs: 120,
        }
    }
}

impl Default for CommitConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            timeout_secs: DEFAULT_COMMIT_TIMEOUT_SECS,
        }
    }
}

impl Default for ConflictConfig {
    fn default() -> Self {
        Self {
            path_prefixes: vec!["src/".into(), "tests/".into(), "docs/".into()],
        }
    }
}

impl ExecutionConfig {
    pub fn stuck_timeout(&self) -> Duration {
        Duration::from_secs(self.stuck_timeout_secs)
    }

    pub fn retry_backoff_base(&self) -> Duration {
        Duration::from_secs(self.retry_backoff_base_secs)
    }

    pub fn retry_backoff_max(&self) -> Duration {
        Duration::from_secs(self.retry_backoff_max_secs)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms.max(1))
    }

    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_secs(self.shutdown_grace_secs)
    }
}

impl CommitConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

impl Config {
    pub fn baton_dir() -> Result<PathBuf> {
        Ok(dirs::home_dir().ok_or(Error::NoHomeDir)?.join(".baton"))
    }

    pub fn default_config_path() -> Result<PathBuf> {
        Ok(Self::baton_dir()?.join("baton.toml"))
    }

    pub fn state_path(&self) -> PathBuf {
        self.state_dir.join("state.json")
    }

    pub fn log_dir(&self) -> PathBuf {
        self.state_dir.join("logs")
    }

    pub fn socket_path(&self) -> PathBuf {
        self.ipc
            .socket_path
            .clone()
            .unwrap_or_else(|| self.state_dir.join("baton.sock"))
    }

    /// Load from `path`, or from `~/.baton/baton.toml` when `None`.
    /// A missing file yields defaults.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let path = match path {
            Some(p) => p.to_path_buf(),
            None => Self::default_config_path()?,
        };
        blog_debug!("Config::load path={}", path.display());
        if !path.exists() {
            blog_debug!("Config file not found, using defaults");
            return Ok(Self::default());
        }
        let config = Self::from_toml(&fs::read_to_string(&path)?)?;
        blog_debug!(
            "Config loaded: max_batch_size={}, stuck_timeout_secs={}, max_retries={}",
            config.scheduler.max_batch_size,
            config.execution.stuck_timeout_secs,
            config.execution.max_retries
        );
        Ok(config)
    }

    pub fn from_toml(text: &str) -> Result<Self> {
        let mut config: Self = toml::from_str(text)?;
        config.state_dir = expand_tilde(&config.state_dir.to_string_lossy());
        config.validate()?;
        Ok(config)
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(path, toml::to_string_pretty(self)?)?;
        blog_debug!("Config saved to {}", path.display());
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        if self.scheduler.max_batch_size == 0 {
            return Err(Error::Validation(
                "scheduler.max_batch_size must be at least 1".to_string(),
            ));
        }
        let threshold = self.scheduler.phase_completion_threshold;
        if !(0.0..=1.0).contains(&threshold) {
            return Err(Error::Validation(format!(
                "scheduler.phase_completion_threshold must be within 0.0..=1.0, got {}",
                threshold
            )));
        }
        if self.execution.worker_command.split_whitespace().next().is_none() {
            return Err(Error::Validation(
                "execution.worker_command must not be empty".to_string(),
            ));
        }
        Ok(())
    }
}

fn expand_tilde(path: &str) -> PathBuf {
    if let Some(rest) = path.strip_prefix("~/") {
        if let Some(home) = dirs::home_dir() {
            return home.join(rest);
        }
    }
    PathBuf::from(path)
}

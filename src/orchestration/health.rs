//! Worker health: stuck detection and the retry policy.
//!
//! Stuck workers are reported, never killed. The operator decides through
//! the control interface whether to retry, skip, or keep waiting.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use crate::config::ExecutionConfig;
use crate::core::task::TaskId;
use crate::util::backoff_delay;

/// Health-related settings, taken from [`ExecutionConfig`].
#[derive(Debug, Clone)]
pub struct HealthConfig {
    /// Runtime after which a worker is reported as stuck.
    pub stuck_threshold: Duration,
    pub max_retries: u32,
    pub backoff_base: Duration,
    pub backoff_max: Duration,
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self::from_execution(&ExecutionConfig::default())
    }
}

impl HealthConfig {
    pub fn from_execution(config: &ExecutionConfig) -> Self {
        Self {
            stuck_threshold: config.stuck_timeout(),
            max_retries: config.max_retries,
            backoff_base: config.retry_backoff_base(),
            backoff_max: config.retry_backoff_max(),
        }
    }

    pub fn with_stuck_threshold(mut self, threshold: Duration) -> Self {
        self.stuck_threshold = threshold;
        self
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_retries: self.max_retries,
            base: self.backoff_base,
            max: self.backoff_max,
        }
    }
}

/// A worker that has run longer than the stuck threshold.
#[derive(Debug, Clone, PartialEq)]
pub struct StuckReport {
    pub task_id: TaskId,
    pub elapsed: Duration,
}

/// What to do with a task after a failed attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    /// Re-queue as pending once `delay` has passed.
    Requeue { delay: Duration },
    /// Leave the task terminally failed.
    GiveUp,
}

#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub base: Duration,
    pub max: Duration,
}

impl RetryPolicy {
    /// `retry_count` is the count after the failure was recorded.
    pub fn decide(&self, retry_count: u32) -> RetryDecision {
        if retry_count < self.max_retries {
            RetryDecision::Requeue {
                delay: backoff_delay(self.base, retry_count, self.max),
            }
        } else {
            RetryDecision::GiveUp
        }
    }
}

/// Tracks when each stuck worker was last reported.
///
/// A worker is reported once it passes the threshold and again every
/// threshold interval while it keeps running.
#[derive(Debug, Default)]
pub struct HealthMonitor {
    threshold: Duration,
    last_reported: HashMap<TaskId, Instant>,
}

impl HealthMonitor {
    pub fn new(threshold: Duration) -> Self {
        Self {
            threshold,
            last_reported: HashMap::new(),
        }
    }

    pub fn threshold(&self) -> Duration {
        self.threshold
    }

    /// Check running workers, given as `(task, started)` pairs.
    pub fn check<'a, I>(&mut self, running: I, now: Instant) -> Vec<StuckReport>
    where
        I: IntoIterator<Item = (&'a TaskId, Instant)>,
    {
        let mut reports = Vec::new();
        for (id, started) in running {
            let elapsed = now.saturating_duration_since(started);
            if elapsed < self.threshold {
                continue;
            }
            let due = match self.last_reported.get(id) {
                Some(last) => now.saturating_duration_since(*last) >= self.threshold,
                None => true,
            };
            if due {
                self.last_reported.insert(id.clone(), now);
                reports.push(StuckReport {
                    task_id: id.clone(),
                    elapsed,
                });
            }
        }
        reports.sort_by(|a, b| a.task_id.cmp(&b.task_id));
        reports
    }

    /// Drop tracking for a worker that finished or was killed.
    pub fn forget(&mut self, id: &TaskId) {
        self.last_reported.remove(id);
    }

    pub fn is_reported(&self, id: &TaskId) -> bool {
        self.last_reported.contains_key(id)
    }
}

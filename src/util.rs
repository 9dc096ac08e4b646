//! Shared helpers: off-loop blocking work and backoff arithmetic.

use std::time::Duration;

use tokio::task::spawn_blocking;

use crate::{Error, Result};

/// Run blocking file or git work on the blocking pool.
pub async fn blocking<F, T>(f: F) -> Result<T>
where
    F: FnOnce() -> Result<T> + Send + 'static,
    T: Send + 'static,
{
    spawn_blocking(f)
        .await
        .map_err(|e| Error::TaskJoin(e.to_string()))?
}

/// Exponential backoff: `base * 2^(attempt - 1)`, capped at `max`.
///
/// `attempt` is 1-based; attempt 0 yields no delay.
pub fn backoff_delay(base: Duration, attempt: u32, max: Duration) -> Duration {
    if attempt == 0 {
        return Duration::ZERO;
    }
    let factor = 1u32.checked_shl(attempt - 1).unwrap_or(u32::MAX);
    base.checked_mul(factor).unwrap_or(max).min(max)
}

use std::future::Future;
use std::time::Duration;

use tracing::debug;

use crate::TransferError;

/// Bounded retry with exponential backoff.
///
/// Attempts are numbered from 0. Before attempt `k >= 1` the policy waits
/// `base_delay * factor^(k-1)`, so with the defaults (1 s, factor 2) the
/// waits are 1 s, 2 s, 4 s. Only errors for which
/// [`TransferError::is_retryable`] holds are retried.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub base_delay: Duration,
    pub factor: u32,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: crate::DEFAULT_MAX_RETRIES,
            base_delay: Duration::from_millis(crate::DEFAULT_RETRY_DELAY_MS),
            factor: 2,
        }
    }
}

impl RetryPolicy {
    pub fn new(max_retries: u32, base_delay: Duration) -> Self {
        Self {
            max_retries,
            base_delay,
            factor: 2,
        }
    }

    /// Total attempts before giving up.
    pub fn max_attempts(&self) -> u32 {
        self.max_retries.saturating_add(1)
    }

    /// Delay to wait before `attempt` (0 for the first attempt).
    pub fn delay_for(&self, attempt: u32) -> Duration {
        if attempt == 0 {
            return Duration::ZERO;
        }
        let multiplier = self.factor.saturating_pow(attempt - 1);
        self.base_delay.saturating_mul(multiplier)
    }

    /// Runs `op` until it succeeds, fails with a terminal error, or the
    /// attempt budget is spent.
    ///
    /// `op` receives the attempt number. `on_retry` is told about every
    /// failed attempt that will be retried, with the upcoming delay.
    pub async fn run<T, F, Fut, R>(&self, mut op: F, mut on_retry: R) -> Result<T, TransferError>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T, TransferError>>,
        R: FnMut(u32, Duration, &TransferError),
    {
        let mut attempt = 0;
        loop {
            match op(attempt).await {
                Ok(value) => return Ok(value),
                Err(e) if e.is_retryable() && attempt < self.max_retries => {
                    attempt += 1;
                    let delay = self.delay_for(attempt);
                    debug!(attempt, delay_ms = delay.as_millis() as u64, "retrying after: {}", e);
                    on_retry(attempt, delay, &e);
                    tokio::time::sleep(delay).await;
                }
                Err(e) => return Err(e),
            }
        }
    }
}

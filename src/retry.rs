use std::future::Future;
use std::time::Duration;

use rand::Rng as _;

/// Retry decision returned by the error classifier callback.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryAction {
    Retry,
    Abort,
}

/// Exponential backoff bounded to `[min_delay_secs, max_delay_secs]`, plus
/// up to one second of jitter.
#[derive(Debug, Clone)]
pub struct RetryConfig {
    pub max_retries: u32,
    pub min_delay_secs: u64,
    pub max_delay_secs: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        // 3 attempts, waits between 4 and 10 seconds
        Self {
            max_retries: 2,
            min_delay_secs: 4,
            max_delay_secs: 10,
        }
    }
}

impl RetryConfig {
    /// Delay before retry number `retry` (0-indexed).
    ///
    /// Formula: `clamp(2^retry, min_delay, max_delay) + jitter(0..1000ms)`.
    /// A zero `max_delay_secs` disables waiting entirely.
    pub fn delay_for_retry(&self, retry: u32) -> Duration {
        if self.max_delay_secs == 0 {
            return Duration::ZERO;
        }
        let exp = 1u64.checked_shl(retry).unwrap_or(u64::MAX);
        let secs = exp.clamp(self.min_delay_secs.min(self.max_delay_secs), self.max_delay_secs);
        let jitter_ms = rand::thread_rng().gen_range(0..1000);
        Duration::from_secs(secs) + Duration::from_millis(jitter_ms)
    }
}

/// Retry an async operation with exponential backoff and jitter.
///
/// `what` names the operation in log output. The classifier decides whether
/// a given error is worth another attempt. Returns the first `Ok`, or the
/// last error once retries are exhausted or the classifier aborts.
pub async fn retry_with_backoff<F, Fut, T, E, C>(
    config: &RetryConfig,
    what: &str,
    classifier: C,
    operation: F,
) -> Result<T, E>
where
    F: Fn() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    C: Fn(&E) -> RetryAction,
    E: std::fmt::Display,
{
    let total_attempts = config.max_retries + 1;
    let mut attempt = 0;

    loop {
        let err = match operation().await {
            Ok(val) => return Ok(val),
            Err(e) => e,
        };
        attempt += 1;
        if classifier(&err) == RetryAction::Abort || attempt >= total_attempts {
            return Err(err);
        }
        let delay = config.delay_for_retry(attempt - 1);
        tracing::warn!(
            "{} failed (attempt {}/{}), retrying in {:.1}s: {}",
            what,
            attempt,
            total_attempts,
            delay.as_secs_f64(),
            err
        );
        tokio::time::sleep(delay).await;
    }
}

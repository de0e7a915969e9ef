//! Retry and timeout utilities.
//!
//! The helpers in this module are transport-agnostic. The stream client uses
//! [`RetryPolicy`] to pace automatic reconnects and the bootstrap client uses
//! [`retry_async`] for bounded request retries.

use std::future::Future;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use tracing::debug;

/// Policy controlling retry attempts and exponential backoff behavior.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Maximum number of attempts.
    ///
    /// For [`retry_async`] this includes the first attempt. For stream
    /// reconnects it bounds the automatic reconnects made after a loss.
    pub max_attempts: usize,
    /// Delay used before the first retry.
    pub initial_backoff: Duration,
    /// Upper bound for exponential backoff delay growth.
    pub max_backoff: Duration,
    /// Maximum random jitter added to each retry delay.
    pub jitter: Duration,
}

impl RetryPolicy {
    /// Returns the reconnect pacing used by the stream client: 1s doubling up
    /// to 30s, three attempts, no jitter.
    pub fn reconnect() -> Self {
        Self {
            max_attempts: 3,
            initial_backoff: Duration::from_millis(1_000),
            max_backoff: Duration::from_millis(30_000),
            jitter: Duration::ZERO,
        }
    }

    /// Computes the delay to apply before a retry.
    ///
    /// `retries_so_far` is 0-based: the first retry waits `initial_backoff`,
    /// the second twice that, and so on until `max_backoff`.
    pub fn delay_for_attempt(&self, retries_so_far: usize) -> Duration {
        let shift = retries_so_far.min(31) as u32;
        let delay = self
            .initial_backoff
            .saturating_mul(1_u32 << shift)
            .min(self.max_backoff);
        delay + jitter_duration(self.jitter, retries_so_far)
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::reconnect()
    }
}

/// Executes an async operation with retry behavior controlled by `policy`.
///
/// `op` receives the 1-based attempt number and must return a future that
/// resolves to the operation result. `should_retry` determines whether each
/// error is retryable.
pub async fn retry_async<T, E, Op, Fut, ShouldRetry>(
    policy: &RetryPolicy,
    mut op: Op,
    mut should_retry: ShouldRetry,
) -> Result<T, E>
where
    Op: FnMut(usize) -> Fut,
    Fut: Future<Output = Result<T, E>>,
    ShouldRetry: FnMut(&E) -> bool,
{
    let max_attempts = policy.max_attempts.max(1);
    let mut attempt = 1;

    loop {
        match op(attempt).await {
            Ok(value) => return Ok(value),
            Err(error) => {
                if attempt >= max_attempts || !should_retry(&error) {
                    return Err(error);
                }

                let delay = policy.delay_for_attempt(attempt - 1);
                debug!(
                    event = "retry_attempt_failed",
                    attempt,
                    max_attempts,
                    delay_ms = delay.as_millis() as u64
                );
                if !delay.is_zero() {
                    tokio::time::sleep(delay).await;
                }
                attempt += 1;
            }
        }
    }
}

/// Applies a timeout to an async computation.
pub async fn with_timeout<T, Fut>(
    timeout: Duration,
    future: Fut,
) -> Result<T, tokio::time::error::Elapsed>
where
    Fut: Future<Output = T>,
{
    tokio::time::timeout(timeout, future).await
}

fn jitter_duration(max_jitter: Duration, attempt: usize) -> Duration {
    if max_jitter.is_zero() {
        return Duration::ZERO;
    }

    let limit_nanos = max_jitter.as_nanos().min(u64::MAX as u128) as u64;
    if limit_nanos == 0 {
        return Duration::ZERO;
    }

    let now_nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .subsec_nanos() as u64;
    let mixed = now_nanos ^ ((attempt as u64).wrapping_mul(0x9E37_79B9_7F4A_7C15));
    Duration::from_nanos(mixed % (limit_nanos + 1))
}

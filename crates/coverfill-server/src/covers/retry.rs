//! Exponential backoff retries
//!
//! One combinator shared by provider uploads and the upload coordinator. Callers
//! decide what is worth retrying through a predicate; the combinator only owns
//! attempt counting and the timed backoff.

use std::future::Future;
use std::time::Duration;

/// Bounded exponential backoff policy
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Retries after the first attempt; total attempts = max_retries + 1
    pub max_retries: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl RetryPolicy {
    pub fn new(max_retries: u32, base_delay: Duration, max_delay: Duration) -> Self {
        Self {
            max_retries,
            base_delay,
            max_delay,
        }
    }

    /// Delay before retry number `retry` (1-based): base * 2^(retry-1), capped
    pub fn delay_for(&self, retry: u32) -> Duration {
        let factor = 1u32
            .checked_shl(retry.saturating_sub(1))
            .unwrap_or(u32::MAX);
        self.base_delay.saturating_mul(factor).min(self.max_delay)
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(10),
        }
    }
}

/// Run `op` until it succeeds, fails with a non-retryable error, or the policy
/// runs out of retries.
///
/// `op` receives the 1-based attempt number. `on_retry` is called with the retry
/// number, the delay about to be slept, and the error that caused it.
pub async fn retry_with_backoff<T, E, Op, Fut, P, N>(
    policy: &RetryPolicy,
    mut op: Op,
    is_retryable: P,
    mut on_retry: N,
) -> Result<T, E>
where
    Op: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<T, E>>,
    P: Fn(&E) -> bool,
    N: FnMut(u32, Duration, &E),
{
    let mut retries = 0u32;

    loop {
        match op(retries + 1).await {
            Ok(value) => return Ok(value),
            Err(err) if retries < policy.max_retries && is_retryable(&err) => {
                retries += 1;
                let delay = policy.delay_for(retries);
                on_retry(retries, delay, &err);
                tokio::time::sleep(delay).await;
            }
            Err(err) => return Err(err),
        }
    }
}

//! Retry with exponential backoff and jitter.
//!
//! Policies are plain records; [`retry`] is the single higher-order helper
//! wrapped around every registry operation. Rate-limit responses use a
//! longer multiplier than plain transient failures.

use std::future::Future;
use std::time::Duration;

use ferry_core::error::{FerryError, Result};
use rand::Rng;

/// Backoff policy for retriable registry operations.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Total attempts, including the first.
    pub max_attempts: u32,
    /// Base delay before the first retry.
    pub base: Duration,
    /// Upper bound on any single delay.
    pub cap: Duration,
    /// Extra multiplier applied when the failure was a rate limit.
    pub rate_limit_multiplier: u32,
    /// Add up to 50% random jitter to each delay.
    pub jitter: bool,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            base: Duration::from_millis(500),
            cap: Duration::from_secs(30),
            rate_limit_multiplier: 4,
            jitter: true,
        }
    }
}

impl RetryPolicy {
    /// Delay before retry number `attempt` (1-based).
    pub fn delay(&self, attempt: u32, rate_limited: bool) -> Duration {
        let exp = self.base.saturating_mul(1u32 << attempt.min(16));
        let mut delay = if rate_limited {
            exp.saturating_mul(self.rate_limit_multiplier)
        } else {
            exp
        };
        if delay > self.cap {
            delay = self.cap;
        }
        if self.jitter {
            let jitter_ms = rand::thread_rng().gen_range(0..=delay.as_millis().max(1) as u64 / 2);
            delay += Duration::from_millis(jitter_ms);
        }
        delay
    }
}

/// Run `op` until it succeeds, a non-retriable error occurs, or the policy
/// is exhausted. Only `Transient` and `RateLimited` failures are retried;
/// everything else (including dedup `Conflict`, which has its own loop)
/// surfaces immediately.
pub async fn retry<T, F, Fut>(policy: &RetryPolicy, mut op: F) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let mut attempt = 0u32;
    loop {
        match op().await {
            Ok(value) => return Ok(value),
            Err(err) => {
                attempt += 1;
                let retriable = matches!(
                    err,
                    FerryError::Transient(_) | FerryError::RateLimited(_)
                );
                if !retriable || attempt >= policy.max_attempts {
                    return Err(err);
                }
                let delay = policy.delay(attempt, err.is_rate_limit());
                tracing::debug!(
                    attempt,
                    max_attempts = policy.max_attempts,
                    delay_ms = delay.as_millis() as u64,
                    error = %err,
                    "Retrying after transient failure"
                );
                tokio::time::sleep(delay).await;
            }
        }
    }
}

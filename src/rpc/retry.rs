//! Retry with backoff and rate-limit override
//!
//! One combinator shared by every protocol stage and both capability probes.
//! A failed attempt is retried after a delay: the server's `Retry-After`
//! hint when it sent one, otherwise the configured (optionally exponential)
//! backoff. A rate-limit delay longer than the configured ceiling ends the
//! stage immediately instead of parking the worker.

use std::future::Future;
use std::time::{Duration, Instant};
use tracing::debug;

use crate::config::ProbeConfig;
use crate::tester::TestStatus;
use crate::types::ProbeError;

/// Retry policy for one stage
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Additional attempts after the first one
    pub max_retries: u32,

    /// Base delay between attempts
    pub base_delay: Duration,

    /// Double the delay after every failed attempt
    pub exponential_backoff: bool,

    /// Longest rate-limit wait we are willing to sit through
    pub max_retry_after: Duration,
}

impl RetryPolicy {
    pub fn from_config(config: &ProbeConfig) -> Self {
        Self {
            max_retries: config.max_retries,
            base_delay: Duration::from_millis(config.retry_delay_ms),
            exponential_backoff: config.exponential_backoff,
            max_retry_after: Duration::from_millis(config.max_retry_after_timeout_ms),
        }
    }

    /// Backoff after the given (1-based) failed attempt
    pub fn backoff(&self, attempt: u32) -> Duration {
        if !self.exponential_backoff {
            return self.base_delay;
        }
        let factor = 1u32.checked_shl(attempt.saturating_sub(1)).unwrap_or(u32::MAX);
        self.base_delay.saturating_mul(factor)
    }

    /// Delay before the next attempt, or `None` when the stage should give up now
    fn next_delay(&self, attempt: u32, error: &ProbeError) -> Option<Duration> {
        match error {
            ProbeError::RateLimited { retry_after_ms } => {
                let delay = retry_after_ms
                    .map(Duration::from_millis)
                    .unwrap_or_else(|| self.backoff(attempt));
                (delay <= self.max_retry_after).then_some(delay)
            }
            _ => Some(self.backoff(attempt)),
        }
    }
}

/// Successful result of a retried operation
#[derive(Debug, Clone, PartialEq)]
pub struct Retried<T> {
    pub value: T,

    /// Attempts used, including the successful one
    pub attempts: u32,
}

/// Terminal failure of a retried operation
#[derive(Debug, Clone, thiserror::Error)]
#[error("gave up after {attempts} attempt(s) in {elapsed:?}: {last_error}")]
pub struct RetryExhausted {
    pub last_error: ProbeError,

    pub attempts: u32,

    pub elapsed: Duration,

    /// Stopped early because a rate-limit delay exceeded the ceiling
    pub retry_after_exceeded: bool,
}

/// Run `op` until it succeeds or the retry budget is spent
///
/// `status`, when given, is updated with the attempt number and the waiting
/// window so that progress reports can tell backing-off testers apart from
/// busy ones.
pub async fn execute_with_retries<T, F, Fut>(
    policy: &RetryPolicy,
    status: Option<&TestStatus>,
    mut op: F,
) -> Result<Retried<T>, RetryExhausted>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, ProbeError>>,
{
    let started = Instant::now();
    let max_attempts = policy.max_retries.saturating_add(1);
    let mut attempt = 0u32;

    loop {
        attempt += 1;
        if let Some(status) = status {
            status.set_attempt(attempt);
        }

        let error = match op().await {
            Ok(value) => {
                return Ok(Retried {
                    value,
                    attempts: attempt,
                })
            }
            Err(error) => error,
        };

        if attempt >= max_attempts {
            return Err(RetryExhausted {
                last_error: error,
                attempts: attempt,
                elapsed: started.elapsed(),
                retry_after_exceeded: false,
            });
        }

        let Some(delay) = policy.next_delay(attempt, &error) else {
            debug!("Retry-After exceeds {:?}, giving up: {}", policy.max_retry_after, error);
            return Err(RetryExhausted {
                last_error: error,
                attempts: attempt,
                elapsed: started.elapsed(),
                retry_after_exceeded: true,
            });
        };

        debug!("Attempt {}/{} failed ({}), retrying in {:?}", attempt, max_attempts, error, delay);

        if let Some(status) = status {
            let retry_after_ms = match &error {
                ProbeError::RateLimited { retry_after_ms } => *retry_after_ms,
                _ => None,
            };
            status.begin_wait(delay, retry_after_ms);
        }

        tokio::time::sleep(delay).await;

        if let Some(status) = status {
            status.end_wait();
        }
    }
}

//! Bounded retries with exponential backoff and jitter.
//!
//! Delay schedule with the defaults (1s base, x2):
//!
//! - Attempt 1: immediate
//! - Attempt 2: 1s + jitter
//! - Attempt 3: 2s + jitter
//!
//! Only [`ErrorKind::is_retryable`] failures are retried. Extraction
//! failures have their own, smaller allowance since they usually mean the
//! page rendered without the expected data.

use std::future::Future;
use std::time::Duration;

use crate::error::{AppError, ErrorKind};
use crate::util;

/// Retry policy.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Total attempts including the first one.
    pub max_attempts: u32,

    /// Delay before the second attempt.
    pub base_delay: Duration,

    /// Growth factor per subsequent attempt.
    pub multiplier: f64,

    /// Upper bound of the uniform jitter added to each delay.
    pub max_jitter: Duration,

    /// How many times an extraction failure may be retried.
    pub max_extraction_retries: u32,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_secs(1),
            multiplier: 2.0,
            max_jitter: Duration::from_millis(500),
            max_extraction_retries: 1,
        }
    }
}

impl RetryPolicy {
    /// Backoff step before attempt `attempt` (1-indexed), without jitter.
    pub fn delay_before(&self, attempt: u32) -> Duration {
        if attempt <= 1 {
            return Duration::ZERO;
        }
        let exponent = (attempt - 2).min(i32::MAX as u32) as i32;
        let secs = self.base_delay.as_secs_f64() * self.multiplier.powi(exponent);
        Duration::try_from_secs_f64(secs).unwrap_or(Duration::MAX)
    }

    /// Backoff step plus a random jitter in `[0, max_jitter)`.
    pub fn jittered_delay_before(&self, attempt: u32) -> Duration {
        self.delay_before(attempt)
            .saturating_add(util::jitter(self.max_jitter))
    }
}

/// What to do after a failed attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    /// Sleep for the given delay, then try again.
    Retry(Duration),
    GiveUp,
}

/// Final failure of [`RetryController::run`].
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
#[error("{error} (after {attempts} attempt(s))")]
pub struct RetryError {
    pub attempts: u32,
    pub error: AppError,
}

/// Applies a [`RetryPolicy`] to fallible async operations.
#[derive(Debug, Clone, Default)]
pub struct RetryController {
    policy: RetryPolicy,
}

impl RetryController {
    pub fn new(policy: RetryPolicy) -> Self {
        Self { policy }
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    /// Decides whether attempt `attempt` (1-indexed, just failed with `error`)
    /// is followed by another one. `extraction_failures` counts extraction
    /// errors seen so far, including this one.
    pub fn decide(&self, attempt: u32, error: &AppError, extraction_failures: u32) -> RetryDecision {
        if attempt >= self.policy.max_attempts || !error.is_retryable() {
            return RetryDecision::GiveUp;
        }
        if error.kind() == ErrorKind::Extraction
            && extraction_failures > self.policy.max_extraction_retries
        {
            return RetryDecision::GiveUp;
        }
        RetryDecision::Retry(self.policy.jittered_delay_before(attempt + 1))
    }

    /// Runs `operation` until it succeeds, fails with a non-retryable
    /// error, or the attempt budget is spent. The closure receives the
    /// 1-indexed attempt number.
    pub async fn run<T, Op, Fut>(&self, mut operation: Op) -> Result<T, RetryError>
    where
        Op: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T, AppError>>,
    {
        let mut attempt = 0;
        let mut extraction_failures = 0;

        loop {
            attempt += 1;
            let error = match operation(attempt).await {
                Ok(value) => return Ok(value),
                Err(e) => e,
            };

            if error.kind() == ErrorKind::Extraction {
                extraction_failures += 1;
            }

            match self.decide(attempt, &error, extraction_failures) {
                RetryDecision::Retry(delay) => {
                    tracing::debug!(
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        error = %error,
                        "Retrying after backoff"
                    );
                    tokio::time::sleep(delay).await;
                }
                RetryDecision::GiveUp => {
                    return Err(RetryError {
                        attempts: attempt,
                        error,
                    });
                }
            }
        }
    }
}

//! Bounded retry with exponential backoff
//!
//! Retry decisions are made on the error's `ErrorKind`, never on its text.

use crate::error::OrchestrationError;
use crate::Result;
use std::future::Future;
use std::time::Duration;
use tracing::{debug, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total attempts, including the first
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub factor: u32,
    /// Per-attempt deadline; an elapsed deadline counts as a `Timeout`
    pub attempt_timeout: Option<Duration>,
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, base_delay: Duration) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            base_delay,
            factor: 2,
            attempt_timeout: None,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.attempt_timeout = Some(timeout);
        self
    }

    /// Same policy with the base delay multiplied
    pub fn scaled(mut self, multiplier: u32) -> Self {
        self.base_delay = self.base_delay.saturating_mul(multiplier);
        self
    }

    /// Delay after the given (1-based) failed attempt
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(16);
        self.base_delay
            .saturating_mul(self.factor.saturating_pow(exponent))
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new(3, Duration::from_millis(1000))
    }
}

/// Run `op` until it succeeds, fails with an error `should_retry` rejects,
/// or the attempt budget is spent.
pub async fn retry_with<T, F, Fut, P>(
    label: &str,
    policy: &RetryPolicy,
    should_retry: P,
    mut op: F,
) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
    P: Fn(&OrchestrationError) -> bool,
{
    let mut attempt = 0;

    loop {
        attempt += 1;
        debug!(step = label, attempt, "Attempting step");

        let outcome = match policy.attempt_timeout {
            Some(limit) => match tokio::time::timeout(limit, op()).await {
                Ok(result) => result,
                Err(_) => Err(OrchestrationError::Timeout(format!(
                    "{} exceeded {}s",
                    label,
                    limit.as_secs_f32()
                ))),
            },
            None => op().await,
        };

        match outcome {
            Ok(value) => return Ok(value),
            Err(e) if attempt < policy.max_attempts && should_retry(&e) => {
                let delay = policy.delay_for(attempt);
                warn!(
                    step = label,
                    attempt,
                    delay_ms = delay.as_millis() as u64,
                    error = %e,
                    "Retryable failure, backing off"
                );
                tokio::time::sleep(delay).await;
            }
            Err(e) => return Err(e),
        }
    }
}

/// Retry only on rate limits, timeouts and connection failures
pub async fn retry_transient<T, F, Fut>(label: &str, policy: &RetryPolicy, op: F) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    retry_with(label, policy, OrchestrationError::is_transient, op).await
}

//! Bounded retry with exponential backoff.
//!
//! Attempts return [`RetryError::Transient`] to be retried or
//! [`RetryError::Fatal`] to stop immediately. Each attempt is bounded by the
//! policy's per-attempt timeout; a timed out attempt counts as transient.

use std::future::Future;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::warn;

/// Retry policy for remote calls
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// When disabled every call gets exactly one attempt
    #[serde(default = "default_enabled")]
    pub enabled: bool,

    /// Maximum number of attempts (including first try)
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    /// Initial delay between retries in milliseconds
    #[serde(default = "default_initial_delay")]
    pub initial_delay_ms: u64,

    /// Maximum delay between retries in milliseconds
    #[serde(default = "default_max_delay")]
    pub max_delay_ms: u64,

    /// Backoff multiplier (delay *= multiplier after each retry)
    #[serde(default = "default_backoff_multiplier")]
    pub backoff_multiplier: f64,

    /// Upper bound for a single attempt in milliseconds
    #[serde(default = "default_attempt_timeout")]
    pub attempt_timeout_ms: u64,
}

fn default_enabled() -> bool {
    true
}
fn default_max_attempts() -> u32 {
    3
}
fn default_initial_delay() -> u64 {
    1000
}
fn default_max_delay() -> u64 {
    30000
}
fn default_backoff_multiplier() -> f64 {
    2.0
}
fn default_attempt_timeout() -> u64 {
    30000
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            enabled: default_enabled(),
            max_attempts: default_max_attempts(),
            initial_delay_ms: default_initial_delay(),
            max_delay_ms: default_max_delay(),
            backoff_multiplier: default_backoff_multiplier(),
            attempt_timeout_ms: default_attempt_timeout(),
        }
    }
}

impl RetryPolicy {
    /// Calculate delay for a specific attempt (1-indexed)
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        if attempt <= 1 {
            return Duration::from_millis(self.initial_delay_ms);
        }

        let delay = self.initial_delay_ms as f64
            * self.backoff_multiplier.powi((attempt - 1) as i32);

        let capped = delay.min(self.max_delay_ms as f64) as u64;
        Duration::from_millis(capped)
    }

    /// Check if we should retry based on attempt count
    pub fn should_retry(&self, attempt: u32) -> bool {
        self.enabled && attempt < self.max_attempts
    }

    pub fn attempt_timeout(&self) -> Duration {
        Duration::from_millis(self.attempt_timeout_ms)
    }
}

/// Delay schedule between attempts
pub trait Backoff: Send + Sync {
    /// Delay after the given failed attempt (1-indexed)
    fn delay(&self, attempt: u32) -> Duration;
}

impl Backoff for RetryPolicy {
    fn delay(&self, attempt: u32) -> Duration {
        self.delay_for_attempt(attempt)
    }
}

/// Outcome of a failed attempt, or of the whole retry loop
#[derive(Debug, Error)]
pub enum RetryError {
    /// Stops the loop immediately
    #[error("{0:#}")]
    Fatal(anyhow::Error),

    /// Retried while attempts remain
    #[error("{0:#}")]
    Transient(anyhow::Error),

    #[error("gave up after {attempts} attempts: {last:#}")]
    Exhausted { attempts: u32, last: anyhow::Error },
}

impl RetryError {
    pub fn fatal(err: impl Into<anyhow::Error>) -> Self {
        Self::Fatal(err.into())
    }

    pub fn transient(err: impl Into<anyhow::Error>) -> Self {
        Self::Transient(err.into())
    }

    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::Fatal(_))
    }
}

/// Run `op` under `policy`, backing off with the policy itself
pub async fn retry<T, F, Fut>(policy: &RetryPolicy, op: F) -> Result<T, RetryError>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<T, RetryError>>,
{
    retry_with_backoff(policy, policy, op).await
}

/// Run `op` under `policy`, taking delays from `backoff`
pub async fn retry_with_backoff<T, F, Fut>(
    policy: &RetryPolicy,
    backoff: &dyn Backoff,
    mut op: F,
) -> Result<T, RetryError>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<T, RetryError>>,
{
    let attempt_timeout = policy.attempt_timeout();
    let mut attempt = 0u32;

    loop {
        attempt += 1;

        let result = match tokio::time::timeout(attempt_timeout, op(attempt)).await {
            Ok(result) => result,
            Err(_) => Err(RetryError::Transient(anyhow::anyhow!(
                "attempt {} timed out after {:?}",
                attempt,
                attempt_timeout
            ))),
        };

        match result {
            Ok(value) => return Ok(value),
            Err(RetryError::Transient(err)) => {
                if !policy.should_retry(attempt) {
                    return Err(RetryError::Exhausted {
                        attempts: attempt,
                        last: err,
                    });
                }

                let delay = backoff.delay(attempt);
                warn!(
                    attempt,
                    delay_ms = delay.as_millis() as u64,
                    error = %format!("{:#}", err),
                    "Attempt failed, retrying"
                );
                tokio::time::sleep(delay).await;
            }
            Err(other) => return Err(other),
        }
    }
}

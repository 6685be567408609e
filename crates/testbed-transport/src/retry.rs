//! Fixed-interval retry and readiness polling.
//!
//! Two kinds of waiting show up while provisioning:
//!
//! - [`retry`] re-runs an operation that failed transiently (the directory
//!   service right after a reboot) until it succeeds or the policy runs out.
//! - [`poll_until`] re-runs a check that succeeded but reported "not ready
//!   yet" (a loopback adapter still waiting for its address). Check errors
//!   are not retried.
//!
//! Both are bounded by a [`RetryPolicy`]. A policy with neither an attempt
//! limit nor a timeout waits forever.

use std::fmt;
use std::future::Future;
use std::time::Duration;
use thiserror::Error;
use tokio::time::Instant;
use tracing::{debug, error, warn};

/// How long and how often to wait
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Delay between attempts
    pub interval: Duration,
    /// Maximum number of attempts (`None` = no limit)
    pub max_attempts: Option<u32>,
    /// Overall deadline measured from the first attempt (`None` = no limit)
    pub timeout: Option<Duration>,
}

impl RetryPolicy {
    /// Retry forever with a fixed delay
    pub fn unbounded(interval: Duration) -> Self {
        Self {
            interval,
            max_attempts: None,
            timeout: None,
        }
    }

    pub fn with_max_attempts(mut self, attempts: u32) -> Self {
        self.max_attempts = Some(attempts);
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Whether the policy can ever give up
    pub fn is_bounded(&self) -> bool {
        self.max_attempts.is_some() || self.timeout.is_some()
    }

    /// Decide whether another attempt may start after `attempt` attempts,
    /// given the time spent so far
    fn may_continue(&self, attempt: u32, elapsed: Duration) -> Continue {
        if let Some(max) = self.max_attempts {
            if attempt >= max {
                return Continue::AttemptsExhausted;
            }
        }
        if let Some(timeout) = self.timeout {
            if elapsed + self.interval > timeout {
                return Continue::DeadlineReached;
            }
        }
        Continue::Yes
    }
}

enum Continue {
    Yes,
    AttemptsExhausted,
    DeadlineReached,
}

/// Why waiting stopped without a result
#[derive(Debug, Error)]
pub enum WaitError<E> {
    /// The check itself failed; polling does not retry these
    #[error("{operation} failed: {cause}")]
    Failed { operation: String, cause: E },

    #[error("{operation} still failing after {attempts} attempts: {last}")]
    Exhausted {
        operation: String,
        attempts: u32,
        last: E,
    },

    #[error("{operation} did not complete within {waited:?} ({attempts} attempts)")]
    TimedOut {
        operation: String,
        attempts: u32,
        waited: Duration,
    },
}

/// Run `operation` until it succeeds or the policy gives up
pub async fn retry<F, Fut, T, E>(
    policy: &RetryPolicy,
    operation_name: &str,
    mut operation: F,
) -> Result<T, WaitError<E>>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: fmt::Display,
{
    let started = Instant::now();
    let mut attempt = 0u32;

    loop {
        attempt += 1;

        match operation().await {
            Ok(value) => {
                if attempt > 1 {
                    debug!(operation = %operation_name, attempt, "Operation succeeded after retry");
                }
                return Ok(value);
            }
            Err(e) => match policy.may_continue(attempt, started.elapsed()) {
                Continue::Yes => {
                    warn!(
                        operation = %operation_name,
                        attempt,
                        error = %e,
                        delay_ms = policy.interval.as_millis() as u64,
                        "Operation failed, retrying"
                    );
                    tokio::time::sleep(policy.interval).await;
                }
                Continue::AttemptsExhausted => {
                    error!(operation = %operation_name, attempt, error = %e, "Operation failed after max retries");
                    return Err(WaitError::Exhausted {
                        operation: operation_name.to_string(),
                        attempts: attempt,
                        last: e,
                    });
                }
                Continue::DeadlineReached => {
                    error!(operation = %operation_name, attempt, error = %e, "Operation failed before deadline");
                    return Err(WaitError::TimedOut {
                        operation: operation_name.to_string(),
                        attempts: attempt,
                        waited: started.elapsed(),
                    });
                }
            },
        }
    }
}

/// Run `check` until it yields a value
///
/// `Ok(None)` means "not ready yet" and is polled again after the policy
/// interval; `Err` aborts immediately.
pub async fn poll_until<F, Fut, T, E>(
    policy: &RetryPolicy,
    operation_name: &str,
    mut check: F,
) -> Result<T, WaitError<E>>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<Option<T>, E>>,
{
    let started = Instant::now();
    let mut attempt = 0u32;

    loop {
        attempt += 1;

        match check().await {
            Ok(Some(value)) => return Ok(value),
            Ok(None) => {}
            Err(cause) => {
                return Err(WaitError::Failed {
                    operation: operation_name.to_string(),
                    cause,
                })
            }
        }

        match policy.may_continue(attempt, started.elapsed()) {
            Continue::Yes => {
                debug!(operation = %operation_name, attempt, "Not ready, polling again");
                tokio::time::sleep(policy.interval).await;
            }
            Continue::AttemptsExhausted | Continue::DeadlineReached => {
                return Err(WaitError::TimedOut {
                    operation: operation_name.to_string(),
                    attempts: attempt,
                    waited: started.elapsed(),
                });
            }
        }
    }
}

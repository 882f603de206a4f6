//! Retry policies.
//!
//! A `RetryPolicy` is a plain value (`max_attempts` + `Backoff`) applied at
//! the call site with [`RetryPolicy::run`]. The caller decides which errors
//! are worth another attempt; anything else aborts immediately. Every wait
//! between attempts races the shutdown signal.

use std::fmt::Display;
use std::future::Future;
use std::time::Duration;

use thiserror::Error;
use tokio::sync::watch;
use tracing::debug;

use crate::shutdown::{is_shutdown, wait_for_shutdown};

/// Delay strategy between attempts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Backoff {
    /// Same delay after every failure.
    Fixed { delay: Duration },
    /// Doubling delay starting at `initial`, capped at `max`.
    Exponential { initial: Duration, max: Duration },
}

/// How many times to try an operation and how long to wait in between.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total attempts, including the first one.
    pub max_attempts: u32,
    pub backoff: Backoff,
}

/// Outcome of a retried operation that did not succeed.
#[derive(Debug, Error)]
pub enum RetryError<E> {
    #[error("cancelled")]
    Cancelled,

    #[error("gave up after {attempts} attempts: {last}")]
    Exhausted { attempts: u32, last: E },

    #[error("{0}")]
    Aborted(E),
}

impl<E> RetryError<E> {
    /// The underlying error, if any.
    pub fn into_inner(self) -> Option<E> {
        match self {
            RetryError::Cancelled => None,
            RetryError::Exhausted { last, .. } => Some(last),
            RetryError::Aborted(e) => Some(e),
        }
    }
}

impl RetryPolicy {
    pub const fn fixed(max_attempts: u32, delay: Duration) -> Self {
        Self {
            max_attempts,
            backoff: Backoff::Fixed { delay },
        }
    }

    pub const fn exponential(max_attempts: u32, initial: Duration, max: Duration) -> Self {
        Self {
            max_attempts,
            backoff: Backoff::Exponential { initial, max },
        }
    }

    /// A single attempt, no waiting.
    pub const fn once() -> Self {
        Self::fixed(1, Duration::ZERO)
    }

    /// Delay to wait after the given (1-based) failed attempt.
    pub fn delay_after(&self, attempt: u32) -> Duration {
        match self.backoff {
            Backoff::Fixed { delay } => delay,
            Backoff::Exponential { initial, max } => {
                let shift = attempt.saturating_sub(1).min(31);
                initial.saturating_mul(1u32 << shift).min(max)
            }
        }
    }

    /// Run `op` until it succeeds, returns a non-retryable error, runs out of
    /// attempts, or shutdown is requested.
    pub async fn run<T, E, F, Fut, R>(
        &self,
        shutdown: &watch::Receiver<bool>,
        is_retryable: R,
        mut op: F,
    ) -> Result<T, RetryError<E>>
    where
        E: Display,
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        R: Fn(&E) -> bool,
    {
        let mut shutdown = shutdown.clone();
        let max_attempts = self.max_attempts.max(1);
        let mut attempt = 0;

        loop {
            if is_shutdown(&shutdown) {
                return Err(RetryError::Cancelled);
            }
            attempt += 1;

            let err = match op().await {
                Ok(value) => return Ok(value),
                Err(e) => e,
            };

            if !is_retryable(&err) {
                return Err(RetryError::Aborted(err));
            }
            if attempt >= max_attempts {
                return Err(RetryError::Exhausted {
                    attempts: attempt,
                    last: err,
                });
            }

            let delay = self.delay_after(attempt);
            debug!(attempt, max_attempts, ?delay, error = %err, "attempt failed, retrying");

            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                _ = wait_for_shutdown(&mut shutdown) => return Err(RetryError::Cancelled),
            }
        }
    }
}

//! Retry policy shared by the fetch worker and the repair loop.
//!
//! Exponential backoff: the n-th retry waits `base_delay * 2^(n-1)`, capped at
//! `max_delay`. With `jitter` the wait is drawn uniformly from `[0, backoff]`
//! so parallel workers hitting the same rate limit do not retry in lockstep.

use rand::Rng;
use std::fmt::Display;
use std::time::Duration;
use tracing::warn;

/// Classifies errors for the retry loop.
pub trait Retryable {
    /// Transient failures (network, timeout, rate limit, 5xx) return true.
    fn is_retryable(&self) -> bool;

    /// Minimum wait requested by the server, if any (e.g. `Retry-After`).
    fn retry_after(&self) -> Option<Duration> {
        None
    }
}

/// Error returned once the policy gives up, with the attempt count.
#[derive(Debug)]
pub struct RetryFailure<E> {
    pub attempts: u32,
    pub error: E,
}

#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    /// Total attempts including the first one (minimum 1).
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
    pub jitter: bool,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 4,
            base_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(30),
            jitter: false,
        }
    }
}

impl RetryPolicy {
    /// Policy that never waits; used by tests and dry runs.
    pub fn immediate(max_attempts: u32) -> Self {
        Self {
            max_attempts,
            base_delay: Duration::ZERO,
            max_delay: Duration::ZERO,
            jitter: false,
        }
    }

    /// Deterministic backoff before retry number `retry` (1-based).
    pub fn backoff(&self, retry: u32) -> Duration {
        if retry == 0 {
            return Duration::ZERO;
        }
        let shift = (retry - 1).min(31);
        self.base_delay
            .checked_mul(1u32 << shift)
            .unwrap_or(self.max_delay)
            .min(self.max_delay)
    }

    fn wait_before(&self, retry: u32, hint: Option<Duration>) -> Duration {
        let mut wait = self.backoff(retry);
        if self.jitter && !wait.is_zero() {
            let ms = wait.as_millis() as u64;
            wait = Duration::from_millis(rand::thread_rng().gen_range(0..=ms));
        }
        match hint {
            Some(h) => wait.max(h.min(self.max_delay)),
            None => wait,
        }
    }

    /// Run `op` until it succeeds, fails with a non-retryable error, or the
    /// attempt budget is spent. `op` receives the 1-based attempt number.
    pub fn run<T, E, F>(&self, what: &str, mut op: F) -> Result<T, RetryFailure<E>>
    where
        E: Retryable + Display,
        F: FnMut(u32) -> Result<T, E>,
    {
        let max_attempts = self.max_attempts.max(1);
        let mut attempt = 1;
        loop {
            match op(attempt) {
                Ok(value) => return Ok(value),
                Err(error) => {
                    if !error.is_retryable() || attempt >= max_attempts {
                        return Err(RetryFailure {
                            attempts: attempt,
                            error,
                        });
                    }
                    let wait = self.wait_before(attempt, error.retry_after());
                    warn!(
                        target: "klinevault::retry",
                        what,
                        attempt,
                        max_attempts,
                        wait_ms = wait.as_millis() as u64,
                        "transient failure: {error}"
                    );
                    if !wait.is_zero() {
                        std::thread::sleep(wait);
                    }
                    attempt += 1;
                }
            }
        }
    }
}

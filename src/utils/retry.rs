/// Bounded retry with exponential backoff for transient OS contention
use log::{debug, warn};
use serde::{Deserialize, Serialize};
use std::thread;
use std::time::Duration;

/// Retry schedule: `attempts` tries, sleeping `initial_backoff_ms * multiplier^n`
/// between consecutive tries.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    pub attempts: u32,
    pub initial_backoff_ms: u64,
    pub multiplier: u32,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        RetryPolicy {
            attempts: 3,
            initial_backoff_ms: 100,
            multiplier: 2,
        }
    }
}

/// Why a retried operation gave up
#[derive(Debug)]
pub enum RetryError<E> {
    /// The predicate rejected the error; no further attempts were made
    Permanent(E),
    /// Every attempt failed with a retryable error
    Exhausted { attempts: u32, last: E },
}

impl RetryPolicy {
    /// Delay after the `attempt`-th failure (1-based)
    pub fn backoff(&self, attempt: u32) -> Duration {
        let factor = u64::from(self.multiplier.max(1)).saturating_pow(attempt.saturating_sub(1));
        Duration::from_millis(self.initial_backoff_ms.saturating_mul(factor))
    }

    /// Run `op` until it succeeds, hits a non-retryable error, or the attempts
    /// run out. `op` receives the 1-based attempt number.
    pub fn run<T, E, F, P>(&self, mut op: F, retryable: P) -> std::result::Result<T, RetryError<E>>
    where
        F: FnMut(u32) -> std::result::Result<T, E>,
        P: Fn(&E) -> bool,
        E: std::fmt::Display,
    {
        let attempts = self.attempts.max(1);
        let mut attempt = 1;
        loop {
            match op(attempt) {
                Ok(value) => {
                    if attempt > 1 {
                        debug!("Operation succeeded on attempt {}", attempt);
                    }
                    return Ok(value);
                }
                Err(err) if !retryable(&err) => return Err(RetryError::Permanent(err)),
                Err(err) if attempt >= attempts => {
                    return Err(RetryError::Exhausted {
                        attempts: attempt,
                        last: err,
                    })
                }
                Err(err) => {
                    let delay = self.backoff(attempt);
                    warn!(
                        "Attempt {}/{} failed ({}), retrying in {:?}",
                        attempt, attempts, err, delay
                    );
                    thread::sleep(delay);
                    attempt += 1;
                }
            }
        }
    }
}

//! Bounded retry with exponential backoff for collaborator calls.
//!
//! Only recoverable errors ([`EngineError::is_recoverable`]) are retried.
//! Running out of attempts yields `EngineError::RetriesExhausted`, which the
//! engine treats as a batch-level failure.

use std::thread;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::errors::{EngineError, EngineResult};

/// Retry schedule
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    /// Total attempts including the first one
    pub max_attempts: u32,
    /// Delay before the second attempt (milliseconds)
    pub initial_backoff_ms: u64,
    /// Delay ceiling (milliseconds)
    pub max_backoff_ms: u64,
    /// Growth factor between consecutive delays
    pub multiplier: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        RetryPolicy {
            max_attempts: 3,
            initial_backoff_ms: 250,
            max_backoff_ms: 5_000,
            multiplier: 2.0,
        }
    }
}

impl RetryPolicy {
    /// Policy without sleeping between attempts
    pub fn immediate(max_attempts: u32) -> Self {
        RetryPolicy {
            max_attempts,
            initial_backoff_ms: 0,
            max_backoff_ms: 0,
            multiplier: 1.0,
        }
    }

    /// Delay after failed attempt number `attempt` (1-based)
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        if attempt == 0 {
            return Duration::ZERO;
        }
        let delay = (self.initial_backoff_ms as f64) * self.multiplier.powi(attempt as i32 - 1);
        let delay = delay.min(self.max_backoff_ms as f64).max(0.0);
        Duration::from_millis(delay as u64)
    }
}

/// Run `op` until it succeeds, fails unrecoverably, or attempts run out.
///
/// `op` receives the 1-based attempt number.
pub fn with_retry<T, F>(policy: &RetryPolicy, operation: &str, mut op: F) -> EngineResult<T>
where
    F: FnMut(u32) -> EngineResult<T>,
{
    let max_attempts = policy.max_attempts.max(1);
    let mut attempt = 1;
    loop {
        match op(attempt) {
            Ok(value) => {
                if attempt > 1 {
                    debug!(operation, attempt, "succeeded after retry");
                }
                return Ok(value);
            }
            Err(e) if !e.is_recoverable() => return Err(e),
            Err(e) if attempt >= max_attempts => {
                return Err(EngineError::RetriesExhausted {
                    operation: operation.to_string(),
                    attempts: attempt,
                    last_error: e.to_string(),
                });
            }
            Err(e) => {
                let delay = policy.delay_for_attempt(attempt);
                warn!(operation, attempt, delay_ms = delay.as_millis() as u64, error = %e, "retrying");
                if !delay.is_zero() {
                    thread::sleep(delay);
                }
                attempt += 1;
            }
        }
    }
}

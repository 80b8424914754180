use std::thread;
use std::time::Duration;
use tracing::warn;

use ragdb_core::config::RetryConfig;
use ragdb_core::error::{Error, Result};
use ragdb_core::types::IndexKind;

/// Bounded exponential backoff for transient index failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from(&RetryConfig::default())
    }
}

impl From<&RetryConfig> for RetryPolicy {
    fn from(cfg: &RetryConfig) -> Self {
        Self {
            max_attempts: cfg.max_attempts.max(1),
            initial_backoff: Duration::from_millis(cfg.initial_backoff_ms),
            max_backoff: Duration::from_millis(cfg.max_backoff_ms),
        }
    }
}

impl RetryPolicy {
    pub fn none() -> Self {
        Self { max_attempts: 1, initial_backoff: Duration::ZERO, max_backoff: Duration::ZERO }
    }

    fn delay(&self, attempt: u32) -> Duration {
        let factor = 2_u32.saturating_pow(attempt.saturating_sub(1));
        self.initial_backoff.saturating_mul(factor).min(self.max_backoff)
    }

    /// Run `f`, retrying only `IndexUnavailable`. The error returned after
    /// the last attempt carries the total attempt count.
    pub fn run<T>(&self, kind: IndexKind, op: &str, mut f: impl FnMut() -> Result<T>) -> Result<T> {
        let mut attempt = 1;
        loop {
            match f() {
                Ok(v) => return Ok(v),
                Err(e) if e.is_retryable() && attempt < self.max_attempts => {
                    let delay = self.delay(attempt);
                    warn!(%kind, op, attempt, delay_ms = delay.as_millis() as u64, error = %e, "retrying index operation");
                    thread::sleep(delay);
                    attempt += 1;
                }
                Err(Error::IndexUnavailable { reason, .. }) => {
                    return Err(Error::IndexUnavailable { kind, attempts: attempt, reason });
                }
                Err(e) => return Err(e),
            }
        }
    }
}

use std::{fmt, future::Future, time::Duration};
use thiserror::Error;
use tracing::{debug, warn};

use crate::error::Retryable;

/// Límites de reintento ante rate limits
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Intentos totales, incluyendo el primero
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(16),
        }
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum GateError<E> {
    /// Rate limited on every attempt.
    #[error("reintentos agotados tras {attempts} intentos: {last}")]
    Exhausted { attempts: u32, last: E },

    /// Non rate-limit failure, surfaced without retrying.
    #[error("{0}")]
    Failed(E),
}

/// Wraps a single outbound call with bounded exponential backoff.
///
/// Only rate-limit signals are retried. The delay before attempt `n + 1` is
/// `base_delay * 2^(n - 1)` capped at `max_delay`, or the remote
/// `retry_after` when that is longer.
#[derive(Debug, Clone, Copy)]
pub struct RetryGate {
    policy: RetryPolicy,
}

impl RetryGate {
    pub fn new(policy: RetryPolicy) -> Self {
        Self { policy }
    }

    pub async fn run<T, E, F, Fut>(&self, operation: &str, mut call: F) -> Result<T, GateError<E>>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: Retryable + fmt::Display,
    {
        let max_attempts = self.policy.max_attempts.max(1);
        let mut attempt = 1;

        loop {
            match call().await {
                Ok(value) => {
                    if attempt > 1 {
                        debug!("✅ {} completado en el intento {}", operation, attempt);
                    }
                    return Ok(value);
                }
                Err(e) if e.is_rate_limited() => {
                    if attempt >= max_attempts {
                        warn!("🚫 {}: rate limit persistente tras {} intentos", operation, attempt);
                        return Err(GateError::Exhausted { attempts: attempt, last: e });
                    }

                    let delay = self.backoff(attempt).max(e.retry_after().unwrap_or_default());
                    warn!(
                        "⏳ {}: rate limited (intento {}/{}), reintentando en {:?}",
                        operation, attempt, max_attempts, delay
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(e) => return Err(GateError::Failed(e)),
            }
        }
    }

    fn backoff(&self, attempt: u32) -> Duration {
        let factor = 2u32.saturating_pow(attempt.saturating_sub(1));
        self.policy
            .base_delay
            .checked_mul(factor)
            .unwrap_or(self.policy.max_delay)
            .min(self.policy.max_delay)
    }
}

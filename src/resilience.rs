//! Bounded retry around OCR backend calls.
//!
//! OCR is best effort: when the backend keeps failing, or fails with an error
//! that retrying cannot fix, the caller gets `T::default()` and a `degraded`
//! flag instead of an error. That conversion is logged here.

use crate::ocr::OcrError;
use std::future::Future;
use std::time::Duration;
use tracing::{error, warn};

/// Exponential backoff: `multiplier * 2^(n-1)` after the n-th failure,
/// clamped to `[min_delay, max_delay]`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub multiplier: Duration,
    pub min_delay: Duration,
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 2,
            multiplier: Duration::from_millis(200),
            min_delay: Duration::from_millis(200),
            max_delay: Duration::from_secs(1),
        }
    }
}

impl RetryPolicy {
    /// Delay before the attempt that follows failed attempt `attempt` (1-based).
    pub fn backoff(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(31) as i32;
        self.multiplier
            .mul_f64(2f64.powi(exponent))
            .clamp(self.min_delay, self.max_delay.max(self.min_delay))
    }

    /// Same attempt budget, no sleeping.
    #[cfg(test)]
    pub fn immediate(max_attempts: u32) -> Self {
        Self {
            max_attempts,
            multiplier: Duration::ZERO,
            min_delay: Duration::ZERO,
            max_delay: Duration::ZERO,
        }
    }
}

/// Result of one resilient call.
#[derive(Debug, Clone, PartialEq)]
pub struct Invocation<T> {
    pub value: T,
    pub attempts: u32,
    /// The value is the empty fallback, not a backend answer.
    pub degraded: bool,
}

impl<T> Invocation<T> {
    pub fn map<U>(self, f: impl FnOnce(T) -> U) -> Invocation<U> {
        Invocation {
            value: f(self.value),
            attempts: self.attempts,
            degraded: self.degraded,
        }
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct ResilientInvoker {
    policy: RetryPolicy,
}

impl ResilientInvoker {
    pub fn new(policy: RetryPolicy) -> Self {
        Self { policy }
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    /// Run `call` until it succeeds, hits a non-retryable error, or the
    /// attempt budget is spent. Attempts run one after another.
    pub async fn invoke<T, F, Fut>(&self, operation: &str, mut call: F) -> Invocation<T>
    where
        T: Default,
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, OcrError>>,
    {
        let max_attempts = self.policy.max_attempts.max(1);
        let mut attempt = 0;

        loop {
            attempt += 1;
            match call().await {
                Ok(value) => {
                    return Invocation {
                        value,
                        attempts: attempt,
                        degraded: false,
                    }
                }
                Err(err) if err.is_retryable() && attempt < max_attempts => {
                    let delay = self.policy.backoff(attempt);
                    warn!(
                        operation,
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        error = %err,
                        "OCR backend call failed, retrying"
                    );
                    tokio::time::sleep(delay).await;
                }
                Err(err) => {
                    error!(
                        operation,
                        attempts = attempt,
                        retryable = err.is_retryable(),
                        error = %err,
                        "OCR backend call failed, returning empty result"
                    );
                    return Invocation {
                        value: T::default(),
                        attempts: attempt,
                        degraded: true,
                    };
                }
            }
        }
    }
}

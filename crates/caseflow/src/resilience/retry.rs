//! Retry policy.
//!
//! Classifies a failed call and either schedules another attempt or surfaces
//! the error. Delays follow capped exponential backoff with multiplicative
//! jitter; a server-provided `Retry-After` hint overrides the computed delay
//! for throttled calls.

use std::time::Duration;

use crate::config::RetryConfig;
use crate::error::CallError;

/// Outcome of consulting the policy after a failed attempt.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum RetryDecision {
    /// Sleep for the given delay, then re-enter the call pipeline.
    Retry(Duration),
    /// Give up and surface the error.
    Surface,
}

/// Per-provider retry policy.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    config: RetryConfig,
}

impl RetryPolicy {
    /// Policy from a retry shape.
    pub fn new(config: RetryConfig) -> Self {
        Self { config }
    }

    /// Maximum attempts, including the first.
    pub fn max_attempts(&self) -> u32 {
        self.config.max_attempts
    }

    /// Decide what to do after attempt `attempt` (1-based) failed with `error`.
    pub fn decide(&self, error: &CallError, attempt: u32) -> RetryDecision {
        if attempt >= self.config.max_attempts || !error.kind.is_retriable() {
            return RetryDecision::Surface;
        }

        // Retry-After takes precedence over the computed curve.
        if let Some(retry_after) = error.hints.and_then(|h| h.retry_after) {
            return RetryDecision::Retry(retry_after);
        }

        RetryDecision::Retry(self.backoff(attempt))
    }

    /// Backoff before attempt `attempt + 1`:
    /// `min(cap, base * factor^(attempt-1)) * (1 + jitter * random())`.
    pub fn backoff(&self, attempt: u32) -> Duration {
        let exp = i32::try_from(attempt.saturating_sub(1)).unwrap_or(i32::MAX);
        let raw = self.config.base_ms as f64 * self.config.factor.powi(exp);
        let capped = raw.min(self.config.cap_ms as f64);
        let jittered = if self.config.jitter > 0.0 {
            capped * (1.0 + self.config.jitter * rand::random::<f64>())
        } else {
            capped
        };
        Duration::from_millis(jittered as u64)
    }
}

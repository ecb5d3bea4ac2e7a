//! Adaptive token-bucket rate limiter.
//!
//! One bucket per provider: capacity `C`, refill `R` tokens/second. Callers
//! take one token or suspend until the next refill; a fair semaphore
//! turnstile keeps waiters strictly first-in-first-out. Server throttling
//! signals adapt the bucket: `Retry-After` sets an absolute not-before
//! instant, `X-RateLimit-Remaining`/`-Reset` re-seed the tokens and the
//! refill curve, and a bare 429 applies an exponentially growing refill
//! delay up to a cap.
//!
//! All timing uses `tokio::time::Instant` so tests run under paused time.

use std::time::Duration;

use parking_lot::Mutex;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::config::RateConfig;
use crate::error::{CallError, ThrottleHints};

const DEFAULT_PENALTY_BASE: Duration = Duration::from_millis(500);
const DEFAULT_PENALTY_CAP: Duration = Duration::from_secs(30);

#[derive(Debug)]
struct Bucket {
    capacity: f64,
    tokens: f64,
    refill_per_sec: f64,
    last_refill: Instant,
    not_before: Option<Instant>,
    next_penalty: Duration,
}

impl Bucket {
    fn refill(&mut self, now: Instant) {
        let elapsed = now.saturating_duration_since(self.last_refill);
        self.tokens = (self.tokens + elapsed.as_secs_f64() * self.refill_per_sec).min(self.capacity);
        self.last_refill = now;
    }

    /// Take one token or report how long to wait before asking again.
    fn try_take(&mut self, now: Instant) -> Option<Duration> {
        self.refill(now);
        if let Some(not_before) = self.not_before {
            if not_before > now {
                return Some(not_before - now);
            }
            self.not_before = None;
        }
        if self.tokens >= 1.0 {
            self.tokens -= 1.0;
            None
        } else {
            let deficit = 1.0 - self.tokens;
            Some(Duration::from_secs_f64(deficit / self.refill_per_sec))
        }
    }
}

/// Per-provider token bucket with FIFO fairness and server-hint adaptation.
#[derive(Debug)]
pub struct RateLimiter {
    turnstile: tokio::sync::Semaphore,
    bucket: Mutex<Bucket>,
    penalty_cap: Duration,
}

impl RateLimiter {
    /// Limiter from a rate shape.
    pub fn new(config: RateConfig) -> Self {
        Self {
            turnstile: tokio::sync::Semaphore::new(1),
            bucket: Mutex::new(Bucket {
                capacity: f64::from(config.capacity),
                tokens: f64::from(config.capacity),
                refill_per_sec: config.refill_per_sec,
                last_refill: Instant::now(),
                not_before: None,
                next_penalty: DEFAULT_PENALTY_BASE,
            }),
            penalty_cap: DEFAULT_PENALTY_CAP,
        }
    }

    /// Take one token, suspending until the bucket allows it.
    ///
    /// Waiters are served in arrival order: the single-permit turnstile is a
    /// fair queue, and the bucket lock is only held to compute the next wait,
    /// never across a sleep.
    pub async fn acquire(&self, cancel: &CancellationToken) -> std::result::Result<(), CallError> {
        let _turn = tokio::select! {
            permit = self.turnstile.acquire() => {
                permit.map_err(|_| CallError::cancelled())?
            }
            () = cancel.cancelled() => return Err(CallError::cancelled()),
        };

        loop {
            let wait = self.bucket.lock().try_take(Instant::now());
            match wait {
                None => return Ok(()),
                Some(delay) => {
                    tokio::select! {
                        () = tokio::time::sleep(delay) => {}
                        () = cancel.cancelled() => return Err(CallError::cancelled()),
                    }
                }
            }
        }
    }

    /// Adapt the bucket from server throttling signals.
    pub fn adapt(&self, hints: &ThrottleHints) {
        let now = Instant::now();
        let mut bucket = self.bucket.lock();
        bucket.refill(now);

        if let Some(retry_after) = hints.retry_after {
            bucket.not_before = Some(now + retry_after);
        }
        if let Some(remaining) = hints.remaining {
            bucket.tokens = f64::from(remaining).min(bucket.capacity);
            match hints.reset_after {
                Some(reset) if remaining == 0 => {
                    let blocked = now + reset;
                    bucket.not_before = Some(bucket.not_before.map_or(blocked, |nb| nb.max(blocked)));
                }
                Some(reset) if reset > Duration::ZERO => {
                    // Spread the remaining server budget over the window.
                    bucket.refill_per_sec = f64::from(remaining) / reset.as_secs_f64();
                }
                _ => {}
            }
        }
        tracing::debug!(
            tokens = bucket.tokens,
            refill_per_sec = bucket.refill_per_sec,
            "rate limiter adapted from server hints"
        );
    }

    /// Apply the exponential penalty for a throttling response that carried
    /// no signals: delay the next refill, doubling up to the cap.
    pub fn penalize(&self) {
        let now = Instant::now();
        let mut bucket = self.bucket.lock();
        let penalty = bucket.next_penalty;
        bucket.not_before = Some(now + penalty);
        bucket.next_penalty = (penalty * 2).min(self.penalty_cap);
        tracing::debug!(delay_ms = penalty.as_millis() as u64, "unsignalled throttle, refill delayed");
    }

    /// Reset the penalty curve after a successful call.
    pub fn on_success(&self) {
        self.bucket.lock().next_penalty = DEFAULT_PENALTY_BASE;
    }

    /// Tokens currently available (test/diagnostic).
    pub fn available(&self) -> f64 {
        let mut bucket = self.bucket.lock();
        bucket.refill(Instant::now());
        bucket.tokens
    }
}

//! Resilient call pipeline.
//!
//! Around every outbound provider call, outermost first:
//!
//! 1. **Circuit breaker** ([`circuit`]) - fast-fail before consuming anything
//! 2. **Rate limiter** ([`rate_limit`]) - token bucket, FIFO, server-hint aware
//! 3. **Bulkhead** ([`bulkhead`]) - per-provider concurrency cap
//! 4. **Session attachment** - bearer token from the session manager
//! 5. **Execution** - the adapter call under the request deadline
//! 6. **Retry** ([`retry`]) - capped exponential backoff with jitter
//! 7. **Categorization** - every outcome maps onto the error taxonomy
//!
//! [`caller::ResilientCaller`] composes the pieces; state is per provider and
//! shared across runs.

pub mod bulkhead;
pub mod caller;
pub mod circuit;
pub mod rate_limit;
pub mod retry;

pub use bulkhead::{Bulkhead, BulkheadPermit};
pub use caller::{CallOutcome, ProviderResilience, ResilientCaller};
pub use circuit::{CircuitBreaker, CircuitState};
pub use rate_limit::RateLimiter;
pub use retry::{RetryDecision, RetryPolicy};

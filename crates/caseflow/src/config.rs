//! Run configuration.
//!
//! One flat options struct with enumerated recognized keys and defaults.
//! Unknown keys are rejected at deserialization time (`deny_unknown_fields`),
//! so a typo'd option fails the run up front instead of silently using a
//! default. Credentials are never part of the configuration - they are
//! registered with the session manager - so a persisted config snapshot is
//! redacted by construction.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Which artifacts a run migrates.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Selection {
    /// Every artifact the source enumerates.
    #[default]
    All,
    /// An explicit identifier list.
    Ids(Vec<String>),
}

impl Selection {
    /// Whether a source artifact id is selected.
    pub fn matches(&self, source_id: &str) -> bool {
        match self {
            Selection::All => true,
            Selection::Ids(ids) => ids.iter().any(|id| id == source_id),
        }
    }
}

/// Retry shape (applied per provider).
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct RetryConfig {
    /// Maximum attempts, including the first.
    pub max_attempts: u32,
    /// Base delay in milliseconds.
    pub base_ms: u64,
    /// Delay cap in milliseconds.
    pub cap_ms: u64,
    /// Exponential factor.
    pub factor: f64,
    /// Jitter fraction in `[0, 1]`; 0 disables jitter.
    pub jitter: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_ms: 100,
            cap_ms: 30_000,
            factor: 2.0,
            jitter: 0.1,
        }
    }
}

/// Whether circuit-breaker state is keyed per provider or per
/// provider-and-endpoint class.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitScope {
    /// One breaker per provider.
    #[default]
    PerProvider,
    /// One breaker per (provider, endpoint class).
    PerEndpointClass,
}

/// Circuit-breaker shape (applied per provider).
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct CircuitConfig {
    /// Consecutive counted failures that open the circuit.
    pub failure_threshold: u32,
    /// Time the circuit stays open before probing, in milliseconds.
    pub reset_ms: u64,
    /// Concurrent probes allowed in half-open.
    pub half_open_probes: u32,
    /// State granularity.
    pub scope: CircuitScope,
}

impl Default for CircuitConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            reset_ms: 30_000,
            half_open_probes: 1,
            scope: CircuitScope::PerProvider,
        }
    }
}

/// Token-bucket shape (applied per provider).
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct RateConfig {
    /// Bucket capacity.
    pub capacity: u32,
    /// Refill rate in tokens per second.
    pub refill_per_sec: f64,
}

impl Default for RateConfig {
    fn default() -> Self {
        Self {
            capacity: 10,
            refill_per_sec: 5.0,
        }
    }
}

/// Bulkhead shape (applied per provider).
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct BulkheadConfig {
    /// Maximum concurrent in-flight calls.
    pub max_concurrent: usize,
    /// How long a caller waits for a slot before `bulkhead_timeout`.
    pub wait_timeout_ms: u64,
}

impl Default for BulkheadConfig {
    fn default() -> Self {
        Self {
            max_concurrent: 8,
            wait_timeout_ms: 30_000,
        }
    }
}

/// Configuration for one migration run.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RunConfig {
    /// Source adapter id.
    pub source_provider_id: String,

    /// Target adapter id.
    pub target_provider_id: String,

    /// Which artifacts to migrate.
    #[serde(default)]
    pub selection: Selection,

    /// Max items concurrently in flight.
    #[serde(default = "defaults::item_parallelism")]
    pub item_parallelism: usize,

    /// Max operations in flight within one item; `None` means the layer width.
    #[serde(default)]
    pub op_parallelism: Option<usize>,

    /// Retry shape, per provider.
    #[serde(default)]
    pub retry: RetryConfig,

    /// Breaker shape, per provider.
    #[serde(default)]
    pub circuit: CircuitConfig,

    /// Token bucket, per provider.
    #[serde(default)]
    pub rate: RateConfig,

    /// Bulkhead cap, per provider.
    #[serde(default)]
    pub bulkhead: BulkheadConfig,

    /// Network-level deadline for a single request.
    #[serde(default = "defaults::request_timeout_ms")]
    pub request_timeout_ms: u64,

    /// Deadline for one operation handler (subsumes request timeouts).
    #[serde(default = "defaults::operation_timeout_ms")]
    pub operation_timeout_ms: u64,

    /// Deadline for the whole run (subsumes operation timeouts).
    #[serde(default = "defaults::run_timeout_ms")]
    pub run_timeout_ms: u64,

    /// Delete target artifacts created by this run if it ends cancelled or
    /// failed. Off by default: destructive cleanup is opt-in.
    #[serde(default)]
    pub compensate_on_abort: bool,

    /// Flush checkpoint records every N item outcomes.
    #[serde(default = "defaults::checkpoint_interval")]
    pub checkpoint_interval: usize,
}

mod defaults {
    pub fn item_parallelism() -> usize {
        4
    }
    pub fn request_timeout_ms() -> u64 {
        30_000
    }
    pub fn operation_timeout_ms() -> u64 {
        120_000
    }
    pub fn run_timeout_ms() -> u64 {
        3_600_000
    }
    pub fn checkpoint_interval() -> usize {
        1
    }
}

impl RunConfig {
    /// A config with defaults for everything but the provider pair.
    pub fn new(source_provider_id: impl Into<String>, target_provider_id: impl Into<String>) -> Self {
        Self {
            source_provider_id: source_provider_id.into(),
            target_provider_id: target_provider_id.into(),
            selection: Selection::default(),
            item_parallelism: defaults::item_parallelism(),
            op_parallelism: None,
            retry: RetryConfig::default(),
            circuit: CircuitConfig::default(),
            rate: RateConfig::default(),
            bulkhead: BulkheadConfig::default(),
            request_timeout_ms: defaults::request_timeout_ms(),
            operation_timeout_ms: defaults::operation_timeout_ms(),
            run_timeout_ms: defaults::run_timeout_ms(),
            compensate_on_abort: false,
            checkpoint_interval: defaults::checkpoint_interval(),
        }
    }

    /// Validate option values.
    pub fn validate(&self) -> Result<()> {
        if self.source_provider_id.is_empty() || self.target_provider_id.is_empty() {
            return Err(Error::Config("provider ids must not be empty".into()));
        }
        if self.source_provider_id == self.target_provider_id {
            return Err(Error::Config(
                "source and target providers must differ".into(),
            ));
        }
        if self.item_parallelism == 0 {
            return Err(Error::Config("item_parallelism must be at least 1".into()));
        }
        if self.op_parallelism == Some(0) {
            return Err(Error::Config("op_parallelism must be at least 1".into()));
        }
        if self.retry.max_attempts == 0 {
            return Err(Error::Config("retry.max_attempts must be at least 1".into()));
        }
        if !(0.0..=1.0).contains(&self.retry.jitter) {
            return Err(Error::Config("retry.jitter must be within [0, 1]".into()));
        }
        if self.retry.factor < 1.0 {
            return Err(Error::Config("retry.factor must be at least 1".into()));
        }
        if self.rate.capacity == 0 || self.rate.refill_per_sec <= 0.0 {
            return Err(Error::Config("rate limiter needs positive capacity and refill".into()));
        }
        if self.bulkhead.max_concurrent == 0 {
            return Err(Error::Config("bulkhead.max_concurrent must be at least 1".into()));
        }
        if self.circuit.failure_threshold == 0 || self.circuit.half_open_probes == 0 {
            return Err(Error::Config(
                "circuit breaker needs positive threshold and probe budget".into(),
            ));
        }
        if self.checkpoint_interval == 0 {
            return Err(Error::Config("checkpoint_interval must be at least 1".into()));
        }
        Ok(())
    }

    /// Network-level request deadline.
    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    /// Per-operation deadline.
    pub fn operation_timeout(&self) -> Duration {
        Duration::from_millis(self.operation_timeout_ms)
    }

    /// Whole-run deadline.
    pub fn run_timeout(&self) -> Duration {
        Duration::from_millis(self.run_timeout_ms)
    }
}

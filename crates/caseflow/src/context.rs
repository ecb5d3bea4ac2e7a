//! Operation context and results.
//!
//! The context is the single mapping threaded through a run: input parameters,
//! per-operation results, the two provider handles, and the run's cancellation
//! token. Results are single-writer (the producing operation) and multi-reader;
//! readers only ever observe completed writes because the executor publishes a
//! layer's results before dispatching the next layer.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

use crate::contract::OperationId;
use crate::error::{CallError, Error, Result};
use crate::provider::ProviderAdapter;

/// Terminal status of one executed operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OperationStatus {
    /// Completed and produced a payload.
    Success,
    /// Failed with a categorized error.
    Failure,
    /// Not dispatched (predecessor failure or resume skip).
    Skipped,
    /// Interrupted by cancellation.
    Cancelled,
}

/// Record of one operation's execution.
#[derive(Debug, Clone)]
pub struct OperationResult {
    /// The operation this result belongs to.
    pub op: OperationId,
    /// Terminal status.
    pub status: OperationStatus,
    /// Payload on success.
    pub data: Option<serde_json::Value>,
    /// Categorized error on failure.
    pub error: Option<CallError>,
    /// Dispatch instant.
    pub started_at: DateTime<Utc>,
    /// Completion instant.
    pub finished_at: DateTime<Utc>,
    /// Retries consumed by the resilient caller (0 = first attempt succeeded).
    pub retries: u32,
}

impl OperationResult {
    /// A successful result.
    pub fn success(
        op: OperationId,
        data: serde_json::Value,
        started_at: DateTime<Utc>,
        retries: u32,
    ) -> Self {
        Self {
            op,
            status: OperationStatus::Success,
            data: Some(data),
            error: None,
            started_at,
            finished_at: Utc::now(),
            retries,
        }
    }

    /// A failed result.
    pub fn failure(op: OperationId, error: CallError, started_at: DateTime<Utc>, retries: u32) -> Self {
        let status = if error.kind == crate::error::ErrorKind::Cancelled {
            OperationStatus::Cancelled
        } else {
            OperationStatus::Failure
        };
        Self {
            op,
            status,
            data: None,
            error: Some(error),
            started_at,
            finished_at: Utc::now(),
            retries,
        }
    }

    /// A result for an operation that was never dispatched.
    pub fn skipped(op: OperationId) -> Self {
        let now = Utc::now();
        Self {
            op,
            status: OperationStatus::Skipped,
            data: None,
            error: None,
            started_at: now,
            finished_at: now,
            retries: 0,
        }
    }

    /// Whether the operation succeeded.
    pub fn is_success(&self) -> bool {
        self.status == OperationStatus::Success
    }
}

/// Shared, concurrency-safe context for one run (or one item sub-plan).
#[derive(Clone)]
pub struct OperationContext {
    source: Arc<dyn ProviderAdapter>,
    target: Arc<dyn ProviderAdapter>,
    params: Arc<DashMap<String, serde_json::Value>>,
    results: Arc<DashMap<OperationId, OperationResult>>,
    retries: Arc<DashMap<OperationId, u32>>,
    cancel: CancellationToken,
}

impl OperationContext {
    /// Create a context bound to a source and target adapter and a
    /// cancellation token (child tokens cascade from the run token).
    pub fn new(
        source: Arc<dyn ProviderAdapter>,
        target: Arc<dyn ProviderAdapter>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            source,
            target,
            params: Arc::new(DashMap::new()),
            results: Arc::new(DashMap::new()),
            retries: Arc::new(DashMap::new()),
            cancel,
        }
    }

    /// The source provider handle.
    pub fn source(&self) -> &Arc<dyn ProviderAdapter> {
        &self.source
    }

    /// The target provider handle.
    pub fn target(&self) -> &Arc<dyn ProviderAdapter> {
        &self.target
    }

    /// The cancellation token consulted at every suspension point.
    pub fn cancel_token(&self) -> &CancellationToken {
        &self.cancel
    }

    /// The same shared context under a different cancellation token (the
    /// executor scopes each operation to a child token so a per-operation
    /// timeout can cancel one handler without touching the run).
    #[must_use]
    pub fn with_cancel(&self, cancel: CancellationToken) -> Self {
        Self {
            source: Arc::clone(&self.source),
            target: Arc::clone(&self.target),
            params: Arc::clone(&self.params),
            results: Arc::clone(&self.results),
            retries: Arc::clone(&self.retries),
            cancel,
        }
    }

    /// Record how many retries the resilient caller consumed for an
    /// operation; the executor folds this into the published result.
    pub fn note_retries(&self, op: &OperationId, retries: u32) {
        if retries > 0 {
            self.retries.insert(op.clone(), retries);
        }
    }

    /// Retries noted for an operation.
    pub fn retries_for(&self, op: &OperationId) -> u32 {
        self.retries.get(op).map(|r| *r).unwrap_or(0)
    }

    /// Whether cancellation was requested.
    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Set an input parameter.
    pub fn set_param(&self, name: impl Into<String>, value: serde_json::Value) {
        self.params.insert(name.into(), value);
    }

    /// Read an input parameter.
    pub fn param(&self, name: &str) -> Option<serde_json::Value> {
        self.params.get(name).map(|v| v.clone())
    }

    /// Record an operation's result.
    ///
    /// Single-writer invariant: only the producing operation (via the
    /// executor) writes under its own id. A duplicate write indicates an
    /// executor bug and is ignored with a warning rather than clobbering
    /// what readers may have observed.
    pub fn record(&self, result: OperationResult) {
        match self.results.entry(result.op.clone()) {
            dashmap::mapref::entry::Entry::Occupied(_) => {
                tracing::warn!(op = %result.op, "duplicate result write ignored");
            }
            dashmap::mapref::entry::Entry::Vacant(slot) => {
                slot.insert(result);
            }
        }
    }

    /// Read a completed result by operation id.
    pub fn result(&self, op: &OperationId) -> Option<OperationResult> {
        self.results.get(op).map(|r| r.clone())
    }

    /// Read the success payload of a predecessor, or fail with the
    /// contract-violation error the taxonomy maps to `dependency_missing`.
    pub fn expect_data(&self, reader: &str, dep: &OperationId) -> Result<serde_json::Value> {
        match self.results.get(dep) {
            Some(r) if r.is_success() => Ok(r.data.clone().unwrap_or(serde_json::Value::Null)),
            _ => Err(Error::MissingResult {
                missing: dep.as_str().to_string(),
                op: reader.to_string(),
            }),
        }
    }

    /// Snapshot of all recorded results, in no particular order.
    pub fn results(&self) -> Vec<OperationResult> {
        self.results.iter().map(|r| r.clone()).collect()
    }
}

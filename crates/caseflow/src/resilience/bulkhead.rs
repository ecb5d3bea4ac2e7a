//! Bulkhead: per-provider concurrency cap.
//!
//! A fair counting semaphore bounds in-flight calls to a provider so one slow
//! endpoint cannot exhaust the task budget of the whole run. Waiters queue in
//! first-in-first-out order; waiting longer than the configured timeout
//! surfaces `bulkhead_timeout`, which is retriable.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio_util::sync::CancellationToken;

use crate::config::BulkheadConfig;
use crate::error::{CallError, ErrorKind};

/// Per-provider concurrency gate.
#[derive(Debug)]
pub struct Bulkhead {
    semaphore: Arc<Semaphore>,
    max_concurrent: usize,
    wait_timeout: Duration,
}

/// Slot held for the duration of one in-flight call; released on drop.
#[derive(Debug)]
pub struct BulkheadPermit {
    _permit: OwnedSemaphorePermit,
}

impl Bulkhead {
    /// Bulkhead from a shape.
    pub fn new(config: BulkheadConfig) -> Self {
        Self {
            semaphore: Arc::new(Semaphore::new(config.max_concurrent)),
            max_concurrent: config.max_concurrent,
            wait_timeout: Duration::from_millis(config.wait_timeout_ms),
        }
    }

    /// Acquire a slot, waiting up to the configured timeout.
    pub async fn acquire(
        &self,
        cancel: &CancellationToken,
    ) -> std::result::Result<BulkheadPermit, CallError> {
        tokio::select! {
            permit = Arc::clone(&self.semaphore).acquire_owned() => {
                let permit = permit.map_err(|_| CallError::cancelled())?;
                Ok(BulkheadPermit { _permit: permit })
            }
            () = tokio::time::sleep(self.wait_timeout) => Err(CallError::new(
                ErrorKind::BulkheadTimeout,
                format!("no bulkhead slot within {}ms", self.wait_timeout.as_millis()),
            )),
            () = cancel.cancelled() => Err(CallError::cancelled()),
        }
    }

    /// Slots currently free.
    pub fn available(&self) -> usize {
        self.semaphore.available_permits()
    }

    /// Configured cap.
    pub fn max_concurrent(&self) -> usize {
        self.max_concurrent
    }
}

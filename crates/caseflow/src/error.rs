//! Error types for the CaseFlow migration core.
//!
//! Every failure in the system maps onto exactly one [`ErrorKind`]. The kind
//! decides two things downstream: whether the retry policy may re-attempt the
//! call, and whether the circuit breaker counts it as provider instability.
//! Components never branch on error message text.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Closed taxonomy of failure kinds.
///
/// | Kind | Retriable | Counts toward circuit |
/// |---|---|---|
/// | `AuthenticationFailed` | no | no |
/// | `AuthorizationFailed` | no | no |
/// | `ValidationFailed` | no | no |
/// | `NotFound` | no | no |
/// | `Throttled` | yes | no |
/// | `NetworkError` | yes | yes |
/// | `ServerError` | yes | yes |
/// | `Timeout` | yes | yes |
/// | `CircuitOpen` | no | no |
/// | `BulkheadTimeout` | yes | no |
/// | `Cancelled` | no | no |
/// | `DependencyMissing` | no | no |
/// | `MappingError` | no | no |
/// | `Unknown` | no | yes |
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// Credentials invalid or the session is unrecoverable.
    AuthenticationFailed,
    /// Authenticated but forbidden.
    AuthorizationFailed,
    /// Request payload rejected by the remote.
    ValidationFailed,
    /// Referenced resource absent.
    NotFound,
    /// Remote rate-limited this caller.
    Throttled,
    /// Connection lost, DNS failure, TCP reset.
    NetworkError,
    /// Remote 5xx.
    ServerError,
    /// Local deadline expired.
    Timeout,
    /// Local circuit fast-fail; the provider was not contacted.
    CircuitOpen,
    /// Local concurrency gate timed out.
    BulkheadTimeout,
    /// External cancellation.
    Cancelled,
    /// Required predecessor result absent or failed.
    DependencyMissing,
    /// Canonical/target mapping rejected the input.
    MappingError,
    /// Unclassified.
    Unknown,
}

impl ErrorKind {
    /// Whether the retry policy may re-attempt a call that failed this way.
    pub fn is_retriable(self) -> bool {
        matches!(
            self,
            ErrorKind::Throttled
                | ErrorKind::NetworkError
                | ErrorKind::ServerError
                | ErrorKind::Timeout
                | ErrorKind::BulkheadTimeout
        )
    }

    /// Whether this failure counts toward opening the circuit breaker.
    ///
    /// Throttling and caller-side errors say nothing about provider health,
    /// so they are excluded.
    pub fn counts_toward_circuit(self) -> bool {
        matches!(
            self,
            ErrorKind::NetworkError | ErrorKind::ServerError | ErrorKind::Timeout | ErrorKind::Unknown
        )
    }

    /// Categorize an HTTP-class status code reported by a provider adapter.
    pub fn from_status(status: u16) -> Self {
        match status {
            401 => ErrorKind::AuthenticationFailed,
            403 => ErrorKind::AuthorizationFailed,
            404 => ErrorKind::NotFound,
            429 => ErrorKind::Throttled,
            400..=499 => ErrorKind::ValidationFailed,
            500..=599 => ErrorKind::ServerError,
            _ => ErrorKind::Unknown,
        }
    }

    /// Stable wire name, e.g. `authentication_failed`.
    pub fn as_str(self) -> &'static str {
        match self {
            ErrorKind::AuthenticationFailed => "authentication_failed",
            ErrorKind::AuthorizationFailed => "authorization_failed",
            ErrorKind::ValidationFailed => "validation_failed",
            ErrorKind::NotFound => "not_found",
            ErrorKind::Throttled => "throttled",
            ErrorKind::NetworkError => "network_error",
            ErrorKind::ServerError => "server_error",
            ErrorKind::Timeout => "timeout",
            ErrorKind::CircuitOpen => "circuit_open",
            ErrorKind::BulkheadTimeout => "bulkhead_timeout",
            ErrorKind::Cancelled => "cancelled",
            ErrorKind::DependencyMissing => "dependency_missing",
            ErrorKind::MappingError => "mapping_error",
            ErrorKind::Unknown => "unknown",
        }
    }
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Server-side throttling signals attached to a failed call.
///
/// Adapters populate these from `Retry-After` / `X-RateLimit-*` response
/// headers; the rate limiter re-seeds its bucket from them.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct ThrottleHints {
    /// Absolute "do not call before" delay requested by the remote.
    pub retry_after: Option<Duration>,
    /// Remaining request budget in the current server window.
    pub remaining: Option<u32>,
    /// Seconds until the server window resets.
    pub reset_after: Option<Duration>,
}

/// A categorized outbound-call failure.
///
/// This is the error shape that flows through the resilient caller, into
/// operation results, and onto item outcomes. The `kind` is authoritative;
/// `message` is for operators and never parsed.
#[derive(Debug, Clone, Error)]
#[error("{kind}: {message}")]
pub struct CallError {
    /// Taxonomy classification.
    pub kind: ErrorKind,
    /// Short human-readable description. No stack traces.
    pub message: String,
    /// HTTP-class status reported by the adapter, if any.
    pub status: Option<u16>,
    /// Throttling signals, present on `throttled` failures that carried them.
    pub hints: Option<ThrottleHints>,
}

impl CallError {
    /// Build a call error with just a kind and message.
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            status: None,
            hints: None,
        }
    }

    /// Build a call error categorized from an HTTP-class status code.
    pub fn from_status(status: u16, message: impl Into<String>) -> Self {
        Self {
            kind: ErrorKind::from_status(status),
            message: message.into(),
            status: Some(status),
            hints: None,
        }
    }

    /// Attach throttling signals.
    #[must_use]
    pub fn with_hints(mut self, hints: ThrottleHints) -> Self {
        self.hints = Some(hints);
        self
    }

    /// A local cancellation error.
    pub fn cancelled() -> Self {
        Self::new(ErrorKind::Cancelled, "operation cancelled")
    }

    /// A local deadline error.
    pub fn timeout(what: &str, after: Duration) -> Self {
        Self::new(
            ErrorKind::Timeout,
            format!("{what} did not complete within {}ms", after.as_millis()),
        )
    }
}

/// Errors raised by the migration core itself (plan construction, registry
/// lookups, checkpoint I/O). Outbound-call failures are wrapped as [`Error::Call`].
#[derive(Debug, Error)]
pub enum Error {
    /// The operation graph contains a cycle; the witness lists the nodes along it.
    #[error("operation graph contains a cycle: {}", witness.join(" -> "))]
    CycleDetected {
        /// Nodes along the cycle, first node repeated at the end.
        witness: Vec<String>,
    },

    /// An operation depends on an operation that is not in the graph.
    #[error("operation '{referenced_by}' depends on unknown operation '{missing}'")]
    MissingReference {
        /// The dependency that does not exist.
        missing: String,
        /// The operation that declared it.
        referenced_by: String,
    },

    /// A handler read a predecessor result that was never produced.
    #[error("operation '{op}' expected a result from '{missing}' but none was recorded")]
    MissingResult {
        /// The operation whose result is absent.
        missing: String,
        /// The reading operation.
        op: String,
    },

    /// No adapter registered under this provider id.
    #[error("unknown provider '{0}'")]
    UnknownProvider(String),

    /// An adapter is already registered under this provider id.
    #[error("provider '{0}' is already registered")]
    DuplicateProvider(String),

    /// No run with this id is known to the orchestrator.
    #[error("unknown run '{0}'")]
    UnknownRun(String),

    /// Run configuration rejected.
    #[error("configuration error: {0}")]
    Config(String),

    /// Checkpoint store failure.
    #[error("checkpoint error: {0}")]
    Checkpoint(String),

    /// A checkpoint frame failed integrity verification.
    #[error("checkpoint frame corrupt: {0}")]
    CorruptFrame(#[from] crate::checkpoint::FrameError),

    /// Underlying I/O failure (file checkpoint store).
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// Categorized outbound-call failure.
    #[error(transparent)]
    Call(#[from] CallError),
}

impl Error {
    /// Map this error onto the closed taxonomy.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::CycleDetected { .. }
            | Error::MissingReference { .. }
            | Error::MissingResult { .. } => ErrorKind::DependencyMissing,
            Error::UnknownProvider(_)
            | Error::DuplicateProvider(_)
            | Error::UnknownRun(_)
            | Error::Config(_) => ErrorKind::ValidationFailed,
            Error::Checkpoint(_) | Error::CorruptFrame(_) | Error::Io(_) => ErrorKind::Unknown,
            Error::Call(e) => e.kind,
        }
    }
}

/// Result type alias for the CaseFlow core.
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retriable_kinds_match_taxonomy() {
        assert!(ErrorKind::Throttled.is_retriable());
        assert!(ErrorKind::NetworkError.is_retriable());
        assert!(ErrorKind::ServerError.is_retriable());
        assert!(ErrorKind::Timeout.is_retriable());
        assert!(ErrorKind::BulkheadTimeout.is_retriable());

        assert!(!ErrorKind::AuthenticationFailed.is_retriable());
        assert!(!ErrorKind::AuthorizationFailed.is_retriable());
        assert!(!ErrorKind::ValidationFailed.is_retriable());
        assert!(!ErrorKind::NotFound.is_retriable());
        assert!(!ErrorKind::CircuitOpen.is_retriable());
        assert!(!ErrorKind::Cancelled.is_retriable());
        assert!(!ErrorKind::DependencyMissing.is_retriable());
        assert!(!ErrorKind::MappingError.is_retriable());
        assert!(!ErrorKind::Unknown.is_retriable());
    }

    #[test]
    fn circuit_counting_excludes_throttling_and_local_gates() {
        assert!(ErrorKind::NetworkError.counts_toward_circuit());
        assert!(ErrorKind::ServerError.counts_toward_circuit());
        assert!(ErrorKind::Timeout.counts_toward_circuit());
        assert!(ErrorKind::Unknown.counts_toward_circuit());

        assert!(!ErrorKind::Throttled.counts_toward_circuit());
        assert!(!ErrorKind::ValidationFailed.counts_toward_circuit());
        assert!(!ErrorKind::NotFound.counts_toward_circuit());
        assert!(!ErrorKind::CircuitOpen.counts_toward_circuit());
        assert!(!ErrorKind::BulkheadTimeout.counts_toward_circuit());
        assert!(!ErrorKind::Cancelled.counts_toward_circuit());
    }

    #[test]
    fn status_categorization() {
        assert_eq!(ErrorKind::from_status(401), ErrorKind::AuthenticationFailed);
        assert_eq!(ErrorKind::from_status(403), ErrorKind::AuthorizationFailed);
        assert_eq!(ErrorKind::from_status(404), ErrorKind::NotFound);
        assert_eq!(ErrorKind::from_status(429), ErrorKind::Throttled);
        assert_eq!(ErrorKind::from_status(400), ErrorKind::ValidationFailed);
        assert_eq!(ErrorKind::from_status(422), ErrorKind::ValidationFailed);
        assert_eq!(ErrorKind::from_status(500), ErrorKind::ServerError);
        assert_eq!(ErrorKind::from_status(503), ErrorKind::ServerError);
        assert_eq!(ErrorKind::from_status(302), ErrorKind::Unknown);
    }

    #[test]
    fn wire_names_are_snake_case() {
        assert_eq!(ErrorKind::AuthenticationFailed.as_str(), "authentication_failed");
        assert_eq!(ErrorKind::CircuitOpen.to_string(), "circuit_open");
        let json = serde_json::to_string(&ErrorKind::BulkheadTimeout).unwrap();
        assert_eq!(json, "\"bulkhead_timeout\"");
    }

    #[test]
    fn cycle_error_formats_witness() {
        let err = Error::CycleDetected {
            witness: vec!["A".into(), "B".into(), "C".into(), "A".into()],
        };
        assert_eq!(
            err.to_string(),
            "operation graph contains a cycle: A -> B -> C -> A"
        );
        assert_eq!(err.kind(), ErrorKind::DependencyMissing);
    }

    #[test]
    fn call_error_from_status_keeps_status() {
        let err = CallError::from_status(503, "upstream unavailable");
        assert_eq!(err.kind, ErrorKind::ServerError);
        assert_eq!(err.status, Some(503));
        assert_eq!(err.to_string(), "server_error: upstream unavailable");
    }
}

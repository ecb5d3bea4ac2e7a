// Allow unwrap in testing utilities - test code should panic on errors
#![allow(clippy::unwrap_used)]

//! # CaseFlow Testing Utilities
//!
//! This crate provides testing utilities for CaseFlow applications, including:
//!
//! - **MockProvider**: an in-memory provider adapter that can play source or
//!   target, with scripted per-operation failures (status sequences such as
//!   `[503, 503, 200]`), call counting, and created-artifact inspection
//! - **fixtures**: canonical-shaped test-case payload builders
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use caseflow_testing::{fixtures, MockProvider};
//!
//! let source = MockProvider::source("alpha")
//!     .with_case(fixtures::test_case("TC-1", "Login works"))
//!     .failing("get_test_case", &[503, 503]); // two failures, then success
//!
//! let target = MockProvider::target("beta");
//! ```

mod mock_provider;

pub use mock_provider::MockProvider;

/// Canonical-shaped payload builders.
pub mod fixtures {
    /// A source test-case payload the default field mapper understands.
    pub fn test_case(id: &str, title: &str) -> serde_json::Value {
        serde_json::json!({
            "source_id": id,
            "title": title,
            "description": format!("Steps for {title}"),
            "steps": [
                { "action": "open the page", "expected": "page renders" },
                { "action": "submit the form", "expected": "confirmation shown" },
            ],
            "priority": "HIGH",
            "status": "READY",
            "tags": ["migrated"],
        })
    }

    /// An attachment reference payload.
    pub fn attachment(id: &str, file_name: &str) -> serde_json::Value {
        serde_json::json!({
            "id": id,
            "file_name": file_name,
            "content_type": "text/plain",
            "size_bytes": 64,
        })
    }
}

/// Prelude module for convenient imports.
pub mod prelude {
    pub use crate::fixtures;
    pub use crate::MockProvider;
}

// Copyright 2026 Dropbox (created by Andrew Yates <ayates@dropbox.com>)

//! # CaseFlow
//!
//! A resilient migration core for test-management artifacts. CaseFlow moves
//! projects, folders, test cases (with steps and attachments), and trace
//! links between heterogeneous systems whose APIs disagree about ordering
//! prerequisites - one target wants modules before test cases, another wants
//! a session refresh before any mutation - and whose networks fail.
//!
//! Four tightly coupled parts:
//!
//! - **Dependency engine** ([`graph`], [`plan`]) - operations and their
//!   prerequisites as a DAG with deterministic ordering, cycle witnesses,
//!   parallel layers, and goal-directed minimal subsets.
//! - **Operation executor** ([`executor`]) - layer-by-layer dispatch with a
//!   typed context, per-operation timeouts, and cooperative cancellation.
//! - **Resilient call pipeline** ([`resilience`], [`session`]) - circuit
//!   breaker → rate limiter → bulkhead → session → execution → retry →
//!   categorization around every outbound call.
//! - **Migration orchestrator** ([`orchestrator`]) - plans a source→target
//!   pair, maps artifacts through the canonical form ([`canonical`],
//!   [`mapper`]), records per-item outcomes, checkpoints ([`checkpoint`]),
//!   and compensates aborted runs.
//!
//! # Example
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use caseflow::prelude::*;
//!
//! # async fn example(source: Arc<dyn ProviderAdapter>, target: Arc<dyn ProviderAdapter>) -> caseflow::Result<()> {
//! let providers = Arc::new(ProviderRegistry::new());
//! providers.register(source)?;
//! providers.register(target)?;
//!
//! let sessions = Arc::new(SessionManager::new());
//! let orchestrator = MigrationOrchestrator::new(providers, sessions);
//!
//! let run_id = orchestrator.start_run(RunConfig::new("qtest", "zephyr")).await?;
//! let report = orchestrator.wait_for(&run_id).await?;
//! println!("{:?}: {} migrated", report.status, report.counters.succeeded);
//! # Ok(())
//! # }
//! ```

pub mod canonical;
pub mod checkpoint;
pub mod config;
pub mod context;
pub mod contract;
pub mod error;
pub mod executor;
pub mod graph;
pub mod mapper;
pub mod orchestrator;
pub mod plan;
pub mod provider;
pub mod resilience;
pub mod session;

pub use canonical::{AttachmentRef, CanonicalArtifact, Priority, Status, TestStep};
pub use checkpoint::{
    CheckpointStore, FileCheckpointStore, FrameError, ItemRecord, MemoryCheckpointStore,
    RunCounters, RunHeader,
};
pub use config::{
    BulkheadConfig, CircuitConfig, CircuitScope, RateConfig, RetryConfig, RunConfig, Selection,
};
pub use context::{OperationContext, OperationResult, OperationStatus};
pub use contract::{ContractRegistry, OperationContract, OperationId};
pub use error::{CallError, Error, ErrorKind, Result, ThrottleHints};
pub use executor::{
    ExecutionStatus, ExecutionSummary, ExecutorConfig, HandlerRegistry, OperationExecutor,
    OperationHandler,
};
pub use graph::DependencyGraph;
pub use mapper::{DefaultFieldMapper, FieldMapper};
pub use orchestrator::{
    ItemOutcome, MigrationOrchestrator, MigrationOrchestratorBuilder, RunReport, RunStatus,
};
pub use plan::ExecutionPlan;
pub use provider::{
    Capabilities, ConnectionStatus, EndpointClass, ProviderAdapter, ProviderCall, ProviderRegistry,
};
pub use resilience::{ResilientCaller, RetryPolicy};
pub use session::{Credentials, Secret, SessionManager, SessionState, SessionToken};

/// Prelude module for convenient imports.
pub mod prelude {
    pub use crate::canonical::{CanonicalArtifact, Priority, Status};
    pub use crate::checkpoint::{CheckpointStore, FileCheckpointStore, MemoryCheckpointStore};
    pub use crate::config::{RunConfig, Selection};
    pub use crate::error::{CallError, Error, ErrorKind, Result};
    pub use crate::mapper::FieldMapper;
    pub use crate::orchestrator::{MigrationOrchestrator, RunStatus};
    pub use crate::provider::{Capabilities, ProviderAdapter, ProviderCall, ProviderRegistry};
    pub use crate::session::{Credentials, SessionManager};
}

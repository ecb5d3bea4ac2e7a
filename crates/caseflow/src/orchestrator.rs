// Copyright 2026 Dropbox (created by Andrew Yates <ayates@dropbox.com>)

//! Migration orchestrator.
//!
//! Drives one migration run end to end:
//!
//! 1. **Plan** - combine both adapters' contracts, add glue operations, build
//!    and validate the dependency graph.
//! 2. **Enumerate** - execute the source's read operations and materialize the
//!    selection into concrete artifact ids.
//! 3. **Per-item loop** - run each item's sub-plan (fetch → map → create →
//!    attachments → links) through the executor, bounded by `item_parallelism`.
//! 4. **Checkpoint** - append an item record per terminal outcome; resumed
//!    runs skip items already recorded successful.
//! 5. **Compensate** - optionally delete created target artifacts when a run
//!    ends cancelled or failed.
//!
//! Every outbound call goes through the resilient caller; per-item failures
//! are confined to the item.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::canonical::{AttachmentRef, CanonicalArtifact};
use crate::checkpoint::{
    completed_source_ids, CheckpointStore, ItemRecord, MemoryCheckpointStore, RunCounters, RunHeader,
};
use crate::config::RunConfig;
use crate::context::{OperationContext, OperationStatus};
use crate::contract::{ContractRegistry, OperationContract, OperationId};
use crate::error::{CallError, Error, ErrorKind, Result};
use crate::executor::{ExecutionStatus, ExecutorConfig, HandlerRegistry, OperationExecutor};
use crate::graph::DependencyGraph;
use crate::mapper::{DefaultFieldMapper, FieldMapper};
use crate::plan::ExecutionPlan;
use crate::provider::{ConnectionStatus, EndpointClass, ProviderAdapter, ProviderCall, ProviderRegistry};
use crate::resilience::ResilientCaller;
use crate::session::SessionManager;

/// Orchestrator glue operation: materializes the selection after the source
/// reads complete.
const SELECT_ITEMS: &str = "select_items";

/// Item outcomes kept in memory per run; older entries are paged from the
/// checkpoint store.
const MAX_OUTCOMES_IN_MEMORY: usize = 10_000;

/// Terminal and in-flight run states.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    /// The driver task is active.
    Running,
    /// Every selected item migrated successfully.
    Completed,
    /// The run finished but some items failed.
    CompletedWithErrors,
    /// A required run-level operation failed, or the run deadline fired.
    Failed,
    /// Externally cancelled.
    Cancelled,
}

/// One item's terminal outcome.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ItemOutcome {
    /// Source artifact id.
    pub source_id: String,
    /// Created target id, when the item reached the target.
    pub target_id: Option<String>,
    /// Terminal status.
    pub status: OperationStatus,
    /// Taxonomy kind on failure.
    pub error_kind: Option<ErrorKind>,
    /// Short human-readable message on failure. No stack traces.
    pub message: Option<String>,
    /// When the outcome was recorded.
    pub finished_at: DateTime<Utc>,
}

/// Aggregate run report.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunReport {
    /// Run id.
    pub run_id: String,
    /// Current status.
    pub status: RunStatus,
    /// Aggregate counters.
    pub counters: RunCounters,
    /// Start instant.
    pub started_at: DateTime<Utc>,
    /// Finish instant, once terminal.
    pub finished_at: Option<DateTime<Utc>>,
    /// Failure counts grouped by taxonomy kind.
    pub failures_by_kind: BTreeMap<String, u64>,
    /// True when any failure was an authentication/authorization kind -
    /// operators check credentials first.
    pub auth_failures: bool,
    /// True when any failure was a network/server/timeout kind - remote
    /// instability rather than bad input.
    pub network_failures: bool,
}

#[derive(Debug)]
struct RunState {
    run_id: String,
    config: RunConfig,
    cancel: CancellationToken,
    timed_out: AtomicBool,
    status: RwLock<RunStatus>,
    counters: RwLock<RunCounters>,
    outcomes: RwLock<Vec<ItemOutcome>>,
    failures_by_kind: RwLock<BTreeMap<String, u64>>,
    started_at: DateTime<Utc>,
    finished_at: RwLock<Option<DateTime<Utc>>>,
}

impl RunState {
    fn new(run_id: String, config: RunConfig) -> Self {
        Self {
            run_id,
            config,
            cancel: CancellationToken::new(),
            timed_out: AtomicBool::new(false),
            status: RwLock::new(RunStatus::Running),
            counters: RwLock::new(RunCounters::default()),
            outcomes: RwLock::new(Vec::new()),
            failures_by_kind: RwLock::new(BTreeMap::new()),
            started_at: Utc::now(),
            finished_at: RwLock::new(None),
        }
    }

    fn push_outcome(&self, outcome: ItemOutcome) {
        let mut counters = self.counters.write();
        match outcome.status {
            OperationStatus::Success => counters.succeeded += 1,
            OperationStatus::Skipped => counters.skipped += 1,
            OperationStatus::Failure | OperationStatus::Cancelled => counters.failed += 1,
        }
        drop(counters);

        if let Some(kind) = outcome.error_kind {
            *self
                .failures_by_kind
                .write()
                .entry(kind.as_str().to_string())
                .or_insert(0) += 1;
        }

        let mut outcomes = self.outcomes.write();
        if outcomes.len() >= MAX_OUTCOMES_IN_MEMORY {
            outcomes.remove(0);
        }
        outcomes.push(outcome);
    }

    fn finish(&self, status: RunStatus) {
        *self.status.write() = status;
        *self.finished_at.write() = Some(Utc::now());
    }

    fn report(&self) -> RunReport {
        let failures_by_kind = self.failures_by_kind.read().clone();
        let auth_failures = failures_by_kind.contains_key(ErrorKind::AuthenticationFailed.as_str())
            || failures_by_kind.contains_key(ErrorKind::AuthorizationFailed.as_str());
        let network_failures = [
            ErrorKind::NetworkError,
            ErrorKind::ServerError,
            ErrorKind::Timeout,
        ]
        .iter()
        .any(|k| failures_by_kind.contains_key(k.as_str()));

        RunReport {
            run_id: self.run_id.clone(),
            status: *self.status.read(),
            counters: *self.counters.read(),
            started_at: self.started_at,
            finished_at: *self.finished_at.read(),
            failures_by_kind,
            auth_failures,
            network_failures,
        }
    }
}

struct Inner {
    providers: Arc<ProviderRegistry>,
    contracts: ContractRegistry,
    sessions: Arc<SessionManager>,
    caller: ResilientCaller,
    mapper: Arc<dyn FieldMapper>,
    checkpoints: Arc<dyn CheckpointStore>,
    runs: DashMap<String, Arc<RunState>>,
    tasks: DashMap<String, tokio::task::JoinHandle<()>>,
}

/// Builds a [`MigrationOrchestrator`], letting callers swap the field mapper
/// and checkpoint store before the orchestrator is shared.
pub struct MigrationOrchestratorBuilder {
    providers: Arc<ProviderRegistry>,
    sessions: Arc<SessionManager>,
    mapper: Arc<dyn FieldMapper>,
    checkpoints: Arc<dyn CheckpointStore>,
}

impl MigrationOrchestratorBuilder {
    /// Inject a field mapper.
    #[must_use]
    pub fn mapper(mut self, mapper: Arc<dyn FieldMapper>) -> Self {
        self.mapper = mapper;
        self
    }

    /// Use a specific checkpoint store.
    #[must_use]
    pub fn checkpoint_store(mut self, store: Arc<dyn CheckpointStore>) -> Self {
        self.checkpoints = store;
        self
    }

    /// Finish construction.
    pub fn build(self) -> MigrationOrchestrator {
        MigrationOrchestrator {
            inner: Arc::new(Inner {
                providers: self.providers,
                contracts: ContractRegistry::new(),
                caller: ResilientCaller::new(Arc::clone(&self.sessions)),
                sessions: self.sessions,
                mapper: self.mapper,
                checkpoints: self.checkpoints,
                runs: DashMap::new(),
                tasks: DashMap::new(),
            }),
        }
    }
}

/// Composes the dependency engine, executor, and resilient pipeline around a
/// source→target provider pair and exposes the migration-run control API.
#[derive(Clone)]
pub struct MigrationOrchestrator {
    inner: Arc<Inner>,
}

impl MigrationOrchestrator {
    /// Orchestrator over a registered adapter set, with the default field
    /// mapper and an in-memory checkpoint store.
    pub fn new(providers: Arc<ProviderRegistry>, sessions: Arc<SessionManager>) -> Self {
        Self::builder(providers, sessions).build()
    }

    /// Start building an orchestrator with custom parts.
    pub fn builder(
        providers: Arc<ProviderRegistry>,
        sessions: Arc<SessionManager>,
    ) -> MigrationOrchestratorBuilder {
        MigrationOrchestratorBuilder {
            providers,
            sessions,
            mapper: Arc::new(DefaultFieldMapper),
            checkpoints: Arc::new(MemoryCheckpointStore::new()),
        }
    }

    /// Start a migration run; returns its id immediately.
    pub async fn start_run(&self, config: RunConfig) -> Result<String> {
        config.validate()?;
        let source = self.inner.providers.get(&config.source_provider_id)?;
        let target = self.inner.providers.get(&config.target_provider_id)?;
        if !source.capabilities().may_be_source {
            return Err(Error::Config(format!(
                "provider '{}' cannot act as a source",
                source.id()
            )));
        }
        if !target.capabilities().may_be_target {
            return Err(Error::Config(format!(
                "provider '{}' cannot act as a target",
                target.id()
            )));
        }

        let run_id = Uuid::new_v4().to_string();
        self.spawn_run(run_id.clone(), config, false).await?;
        Ok(run_id)
    }

    /// Resume a checkpointed run: items already recorded successful are
    /// skipped, everything else is migrated again under the stored config.
    pub async fn resume_run(&self, run_id: &str) -> Result<()> {
        if let Some(state) = self.inner.runs.get(run_id) {
            if *state.status.read() == RunStatus::Running {
                return Err(Error::Config(format!("run '{run_id}' is still running")));
            }
        }
        let header = self
            .inner
            .checkpoints
            .read_header(run_id)
            .await?
            .ok_or_else(|| Error::UnknownRun(run_id.to_string()))?;
        self.spawn_run(run_id.to_string(), header.config, true).await
    }

    async fn spawn_run(&self, run_id: String, config: RunConfig, resume: bool) -> Result<()> {
        let state = Arc::new(RunState::new(run_id.clone(), config.clone()));
        self.inner.runs.insert(run_id.clone(), Arc::clone(&state));

        self.inner
            .checkpoints
            .write_header(&RunHeader {
                run_id: run_id.clone(),
                config,
                started_at: state.started_at,
                counters: RunCounters::default(),
            })
            .await?;

        let inner = Arc::clone(&self.inner);
        let task_state = Arc::clone(&state);
        let task = tokio::spawn(async move {
            drive_run(inner, task_state, resume).await;
        });
        self.inner.tasks.insert(run_id, task);
        Ok(())
    }

    /// Current status and counters for a run.
    pub fn get_status(&self, run_id: &str) -> Result<RunReport> {
        self.inner
            .runs
            .get(run_id)
            .map(|state| state.report())
            .ok_or_else(|| Error::UnknownRun(run_id.to_string()))
    }

    /// Page through a run's item outcomes (most recent kept in memory).
    pub fn get_item_outcomes(
        &self,
        run_id: &str,
        offset: usize,
        limit: usize,
    ) -> Result<Vec<ItemOutcome>> {
        let state = self
            .inner
            .runs
            .get(run_id)
            .ok_or_else(|| Error::UnknownRun(run_id.to_string()))?;
        let outcomes = state.outcomes.read();
        Ok(outcomes.iter().skip(offset).take(limit).cloned().collect())
    }

    /// Request cancellation. Idempotent; in-flight operations observe the
    /// token at their next suspension point.
    pub fn cancel_run(&self, run_id: &str) -> Result<()> {
        let state = self
            .inner
            .runs
            .get(run_id)
            .ok_or_else(|| Error::UnknownRun(run_id.to_string()))?;
        state.cancel.cancel();
        Ok(())
    }

    /// Block until a run's driver task finishes, then return the report.
    pub async fn wait_for(&self, run_id: &str) -> Result<RunReport> {
        if let Some((_, task)) = self.inner.tasks.remove(run_id) {
            let _ = task.await;
        }
        self.get_status(run_id)
    }

    /// The combined dependency graph for a provider pair, rendered as a
    /// Mermaid diagram.
    pub fn get_dependency_visualization(
        &self,
        source_provider_id: &str,
        target_provider_id: &str,
    ) -> Result<String> {
        let source = self.inner.providers.get(source_provider_id)?;
        let target = self.inner.providers.get(target_provider_id)?;
        self.inner
            .contracts
            .register(source.id(), source.api_contract());
        self.inner
            .contracts
            .register(target.id(), target.api_contract());
        // The full combined surface, not the filtered run-level plan:
        // operators want to see every declared dependency of the pair.
        let combined = self.inner.contracts.combined(source.id(), target.id());
        Ok(DependencyGraph::from_contracts(&combined).to_mermaid())
    }

    /// Probe both providers of a pair.
    pub async fn test_providers(
        &self,
        source_provider_id: &str,
        target_provider_id: &str,
    ) -> Result<(ConnectionStatus, ConnectionStatus)> {
        let source = self.inner.providers.get(source_provider_id)?;
        let target = self.inner.providers.get(target_provider_id)?;
        Ok((source.test_connection().await, target.test_connection().await))
    }

    /// Cancel every active run, await their drivers, and drop shared
    /// resilience state.
    pub async fn shutdown(&self) {
        for entry in self.inner.runs.iter() {
            entry.value().cancel.cancel();
        }
        let ids: Vec<String> = self.inner.tasks.iter().map(|e| e.key().clone()).collect();
        for id in ids {
            if let Some((_, task)) = self.inner.tasks.remove(&id) {
                let _ = task.await;
            }
        }
        self.inner.caller.clear();
    }
}

/// Combined contract set plus the orchestrator's glue operations.
///
/// The run-level plan is read-only and run-scoped: every mutation (both
/// providers') and every item-scoped read (a contract that reads the
/// `source_id` parameter) happens inside item sub-plans, so only run-wide
/// queries and auth survive here. Dependencies on dropped operations are
/// cleared with them.
fn combined_contracts(
    contracts: &ContractRegistry,
    source_id: &str,
    target_id: &str,
) -> Vec<OperationContract> {
    let mut combined = contracts.combined(source_id, target_id);
    combined.retain(|c| !c.mutates && !c.params.iter().any(|p| p == "source_id"));
    let retained: std::collections::BTreeSet<OperationId> =
        combined.iter().map(|c| c.id.clone()).collect();
    for contract in &mut combined {
        contract.depends_on.retain(|dep| retained.contains(dep));
    }

    // Selection materializes only after every source read has completed.
    let source_reads: Vec<OperationId> = combined
        .iter()
        .filter(|c| !c.id.as_str().starts_with("target:"))
        .map(|c| c.id.clone())
        .collect();
    combined.push(
        OperationContract::new(SELECT_ITEMS)
            .depends_on(source_reads)
            .required(),
    );
    combined
}

/// Deterministic idempotency key for one created target artifact.
fn idempotency_key(source_provider: &str, source_id: &str, run_id: &str) -> String {
    Uuid::new_v5(
        &Uuid::NAMESPACE_OID,
        format!("{source_provider}:{source_id}:{run_id}").as_bytes(),
    )
    .to_string()
}

/// Build handlers for every contract-declared operation: each one calls its
/// adapter through the resilient caller, passing the parameters its contract
/// declares it reads.
fn register_contract_handlers(
    handlers: &mut HandlerRegistry,
    plan_ops: &[OperationContract],
    inner: &Arc<Inner>,
    source: &Arc<dyn ProviderAdapter>,
    target: &Arc<dyn ProviderAdapter>,
    config: &Arc<RunConfig>,
) {
    for contract in plan_ops {
        let op = contract.id.clone();
        let is_target = op.as_str().starts_with("target:");
        let adapter = if is_target { Arc::clone(target) } else { Arc::clone(source) };
        let remote_op = OperationId::new(op.as_str().trim_start_matches("target:"));
        let endpoint_class = if remote_op.as_str() == "authenticate" {
            EndpointClass::Auth
        } else if contract.mutates {
            EndpointClass::Mutate
        } else {
            EndpointClass::Read
        };
        let params: Vec<String> = contract.params.clone();
        let inner = Arc::clone(inner);
        let config = Arc::clone(config);

        handlers.insert_fn(op.clone(), move |ctx: OperationContext| {
            let inner = Arc::clone(&inner);
            let adapter = Arc::clone(&adapter);
            let config = Arc::clone(&config);
            let op = op.clone();
            let remote_op = remote_op.clone();
            let params = params.clone();
            Box::pin(async move {
                if remote_op.as_str() == "authenticate" {
                    // The session manager owns token exchange; the operation
                    // exists so dependents order after a warm session.
                    if inner.sessions.has_credentials(adapter.id()) {
                        inner.sessions.get_token(&adapter).await?;
                    }
                    return Ok(serde_json::json!({ "authenticated": true }));
                }

                let mut call_params = serde_json::Map::new();
                for name in &params {
                    call_params.insert(
                        name.clone(),
                        ctx.param(name).unwrap_or(serde_json::Value::Null),
                    );
                }
                let call = ProviderCall {
                    op: remote_op,
                    endpoint_class,
                    params: serde_json::Value::Object(call_params),
                    token: None,
                };
                let outcome = inner
                    .caller
                    .call(&adapter, call, &config, ctx.cancel_token())
                    .await?;
                ctx.note_retries(&op, outcome.retries);
                Ok(outcome.data)
            })
        });
    }
}

async fn drive_run(inner: Arc<Inner>, state: Arc<RunState>, resume: bool) {
    let run_id = state.run_id.clone();
    let deadline = state.config.run_timeout();
    let body = run_body(Arc::clone(&inner), Arc::clone(&state), resume);

    tokio::select! {
        () = body => {}
        () = tokio::time::sleep(deadline) => {
            // Dropping the body aborts in-flight item tasks with it: the
            // outer deadline subsumes every inner one.
            tracing::warn!(run_id = %run_id, "run deadline fired, cancelling");
            state.timed_out.store(true, Ordering::SeqCst);
            state.cancel.cancel();
        }
    }

    // Finalize: body may have finished the status already; the timeout path
    // has not.
    if *state.status.read() == RunStatus::Running {
        let status = if state.timed_out.load(Ordering::SeqCst) {
            RunStatus::Failed
        } else if state.cancel.is_cancelled() {
            RunStatus::Cancelled
        } else {
            RunStatus::Failed
        };
        state.finish(status);
    }

    finalize_run(&inner, &state).await;
}

/// Compensation plus the final header write.
async fn finalize_run(inner: &Arc<Inner>, state: &Arc<RunState>) {
    let status = *state.status.read();
    let aborted = matches!(status, RunStatus::Failed | RunStatus::Cancelled);
    if aborted && state.config.compensate_on_abort {
        compensate(inner, state).await;
    }

    let header = RunHeader {
        run_id: state.run_id.clone(),
        config: state.config.clone(),
        started_at: state.started_at,
        counters: *state.counters.read(),
    };
    if let Err(e) = inner.checkpoints.write_header(&header).await {
        tracing::error!(run_id = %state.run_id, error = %e, "final header write failed");
    }
    tracing::info!(run_id = %state.run_id, status = ?status, "run finished");
}

/// Delete every target artifact this run created. Uses the resilient caller
/// with a fresh (uncancelled) token so compensation survives the run's own
/// cancellation; `not_found` is tolerated as already-gone.
async fn compensate(inner: &Arc<Inner>, state: &Arc<RunState>) {
    let Ok(target) = inner.providers.get(&state.config.target_provider_id) else {
        return;
    };
    let config = Arc::new(state.config.clone());
    let cancel = CancellationToken::new();

    // Read created targets from the checkpoint store: it outlives the run's
    // in-memory outcome window.
    let created: Vec<(String, String)> = match inner.checkpoints.read_items(&state.run_id).await {
        Ok(records) => records
            .into_iter()
            .filter(|r| !r.compensation && r.status == OperationStatus::Success)
            .filter_map(|r| r.target_id.map(|t| (r.source_id, t)))
            .collect(),
        Err(e) => {
            tracing::error!(run_id = %state.run_id, error = %e, "cannot read checkpoint for compensation");
            return;
        }
    };

    let mut records = Vec::new();
    for (source_id, target_id) in created {
        let call = ProviderCall::mutate(
            "delete_test_case",
            serde_json::json!({ "id": target_id }),
        );
        let outcome = inner.caller.call(&target, call, &config, &cancel).await;
        let record = match outcome {
            Ok(_) => ItemRecord::success(&state.run_id, &source_id, target_id).compensating(),
            Err(err) if err.kind == ErrorKind::NotFound => {
                // Already gone; compensation goal reached.
                ItemRecord::success(&state.run_id, &source_id, target_id).compensating()
            }
            Err(err) => {
                tracing::warn!(
                    run_id = %state.run_id,
                    source_id = %source_id,
                    kind = %err.kind,
                    "compensation delete failed"
                );
                ItemRecord::failure(&state.run_id, &source_id, err.kind, err.message).compensating()
            }
        };
        records.push(record);
    }
    if let Err(e) = inner.checkpoints.append_items(&records).await {
        tracing::error!(run_id = %state.run_id, error = %e, "compensation checkpoint failed");
    }
}

async fn run_body(inner: Arc<Inner>, state: Arc<RunState>, resume: bool) {
    match run_phases(&inner, &state, resume).await {
        Ok(status) => state.finish(status),
        Err(err) => {
            tracing::warn!(run_id = %state.run_id, error = %err, "run failed");
            *state
                .failures_by_kind
                .write()
                .entry(err.kind().as_str().to_string())
                .or_insert(0) += 1;
            let status = if state.cancel.is_cancelled() && !state.timed_out.load(Ordering::SeqCst) {
                RunStatus::Cancelled
            } else {
                RunStatus::Failed
            };
            state.finish(status);
        }
    }
}

async fn run_phases(inner: &Arc<Inner>, state: &Arc<RunState>, resume: bool) -> Result<RunStatus> {
    let config = Arc::new(state.config.clone());
    let source = inner.providers.get(&config.source_provider_id)?;
    let target = inner.providers.get(&config.target_provider_id)?;

    // Phase 1: plan. Contracts are static per provider; glue ops are per run.
    inner.contracts.register(source.id(), source.api_contract());
    inner.contracts.register(target.id(), target.api_contract());
    let combined = combined_contracts(&inner.contracts, source.id(), target.id());
    let plan = ExecutionPlan::new(combined.clone())?;
    tracing::info!(
        run_id = %state.run_id,
        operations = plan.len(),
        layers = plan.layers().len(),
        "run plan built"
    );

    // Phase 2: enumerate. Run-level context and handlers.
    let run_ctx = OperationContext::new(
        Arc::clone(&source),
        Arc::clone(&target),
        state.cancel.child_token(),
    );
    let mut handlers = HandlerRegistry::new();
    register_contract_handlers(&mut handlers, &combined, inner, &source, &target, &config);

    let completed = if resume {
        completed_source_ids(inner.checkpoints.as_ref(), &state.run_id).await?
    } else {
        Default::default()
    };

    {
        let selection = config.selection.clone();
        let completed = completed.clone();
        handlers.insert_fn(SELECT_ITEMS, move |ctx: OperationContext| {
            let selection = selection.clone();
            let completed = completed.clone();
            Box::pin(async move {
                let listing = ctx
                    .expect_data(SELECT_ITEMS, &"get_test_cases".into())
                    .map_err(|e| CallError::new(ErrorKind::DependencyMissing, e.to_string()))?;
                let Some(entries) = listing.as_array() else {
                    return Err(CallError::new(
                        ErrorKind::ValidationFailed,
                        "source 'get_test_cases' did not return a list",
                    ));
                };
                let mut selected = Vec::new();
                let mut skipped = Vec::new();
                for entry in entries {
                    let Some(id) = entry.get("id").and_then(|v| v.as_str()) else {
                        continue;
                    };
                    if !selection.matches(id) {
                        continue;
                    }
                    if completed.contains(id) {
                        skipped.push(id.to_string());
                    } else {
                        selected.push(id.to_string());
                    }
                }
                Ok(serde_json::json!({ "selected": selected, "already_migrated": skipped }))
            })
        });
    }

    let executor = OperationExecutor::new(ExecutorConfig {
        op_parallelism: config.op_parallelism,
        operation_timeout: config.operation_timeout(),
    });
    let summary = executor.execute(&plan, &run_ctx, &handlers).await?;
    match summary.status {
        ExecutionStatus::Completed => {}
        ExecutionStatus::Cancelled => return Ok(RunStatus::Cancelled),
        ExecutionStatus::Failed => {
            record_plan_failures(state, &run_ctx);
            return Ok(RunStatus::Failed);
        }
    }

    let selection_data = run_ctx.expect_data("run", &SELECT_ITEMS.into())?;
    let selected: Vec<String> = selection_data["selected"]
        .as_array()
        .map(|a| {
            a.iter()
                .filter_map(|v| v.as_str().map(str::to_string))
                .collect()
        })
        .unwrap_or_default();
    let already_migrated: Vec<String> = selection_data["already_migrated"]
        .as_array()
        .map(|a| {
            a.iter()
                .filter_map(|v| v.as_str().map(str::to_string))
                .collect()
        })
        .unwrap_or_default();

    {
        let mut counters = state.counters.write();
        counters.total = (selected.len() + already_migrated.len()) as u64;
    }
    for source_id in &already_migrated {
        state.push_outcome(ItemOutcome {
            source_id: source_id.clone(),
            target_id: None,
            status: OperationStatus::Skipped,
            error_kind: None,
            message: Some("already migrated in a previous attempt".to_string()),
            finished_at: Utc::now(),
        });
    }
    tracing::info!(
        run_id = %state.run_id,
        selected = selected.len(),
        resumed_skips = already_migrated.len(),
        "selection materialized"
    );

    // Cache field definitions once per run; item sub-plans read the param.
    let field_definitions = run_ctx
        .result(&"get_field_definitions".into())
        .and_then(|r| r.data);

    // Phase 3: per-item loop.
    let gate = Arc::new(tokio::sync::Semaphore::new(config.item_parallelism));
    let mut tasks = tokio::task::JoinSet::new();
    let mut pending_records: Vec<ItemRecord> = Vec::new();
    let mut item_failures = false;

    for source_id in selected {
        if state.cancel.is_cancelled() {
            state.push_outcome(ItemOutcome {
                source_id: source_id.clone(),
                target_id: None,
                status: OperationStatus::Skipped,
                error_kind: Some(ErrorKind::Cancelled),
                message: Some("run cancelled before dispatch".to_string()),
                finished_at: Utc::now(),
            });
            pending_records.push(ItemRecord::skipped(&state.run_id, &source_id));
            continue;
        }

        let permit = match Arc::clone(&gate).acquire_owned().await {
            Ok(permit) => permit,
            Err(_) => break,
        };
        let inner_task = Arc::clone(inner);
        let state_task = Arc::clone(state);
        let source_task = Arc::clone(&source);
        let target_task = Arc::clone(&target);
        let config_task = Arc::clone(&config);
        let field_definitions = field_definitions.clone();

        tasks.spawn(async move {
            let outcome = migrate_item(
                &inner_task,
                &state_task,
                &source_task,
                &target_task,
                &config_task,
                &source_id,
                field_definitions,
            )
            .await;
            drop(permit);
            outcome
        });

        // Drain completions opportunistically to checkpoint at the interval.
        while let Some(joined) = tasks.try_join_next() {
            if let Ok(outcome) = joined {
                item_failures |= outcome.status != OperationStatus::Success;
                pending_records.push(outcome_record(&state.run_id, &outcome));
                state.push_outcome(outcome);
            }
            if pending_records.len() >= config.checkpoint_interval {
                flush_records(inner, state, &mut pending_records).await;
            }
        }
    }

    while let Some(joined) = tasks.join_next().await {
        if let Ok(outcome) = joined {
            item_failures |= outcome.status != OperationStatus::Success;
            pending_records.push(outcome_record(&state.run_id, &outcome));
            state.push_outcome(outcome);
        }
        if pending_records.len() >= config.checkpoint_interval {
            flush_records(inner, state, &mut pending_records).await;
        }
    }
    flush_records(inner, state, &mut pending_records).await;

    if state.cancel.is_cancelled() {
        return Ok(RunStatus::Cancelled);
    }
    Ok(if item_failures {
        RunStatus::CompletedWithErrors
    } else {
        RunStatus::Completed
    })
}

fn record_plan_failures(state: &Arc<RunState>, run_ctx: &OperationContext) {
    for result in run_ctx.results() {
        if let Some(error) = result.error {
            *state
                .failures_by_kind
                .write()
                .entry(error.kind.as_str().to_string())
                .or_insert(0) += 1;
        }
    }
}

fn outcome_record(run_id: &str, outcome: &ItemOutcome) -> ItemRecord {
    ItemRecord {
        run_id: run_id.to_string(),
        source_id: outcome.source_id.clone(),
        target_id: outcome.target_id.clone(),
        status: outcome.status,
        error_kind: outcome.error_kind,
        message: outcome.message.clone(),
        compensation: false,
        finished_at: outcome.finished_at,
    }
}

async fn flush_records(inner: &Arc<Inner>, state: &Arc<RunState>, records: &mut Vec<ItemRecord>) {
    if records.is_empty() {
        return;
    }
    if let Err(e) = inner.checkpoints.append_items(records).await {
        tracing::error!(run_id = %state.run_id, error = %e, "checkpoint append failed");
    }
    records.clear();

    let header = RunHeader {
        run_id: state.run_id.clone(),
        config: state.config.clone(),
        started_at: state.started_at,
        counters: *state.counters.read(),
    };
    if let Err(e) = inner.checkpoints.write_header(&header).await {
        tracing::error!(run_id = %state.run_id, error = %e, "header update failed");
    }
}

/// Execute one item's sub-plan and reduce it to an item outcome.
#[allow(clippy::too_many_arguments)]
async fn migrate_item(
    inner: &Arc<Inner>,
    state: &Arc<RunState>,
    source: &Arc<dyn ProviderAdapter>,
    target: &Arc<dyn ProviderAdapter>,
    config: &Arc<RunConfig>,
    source_id: &str,
    field_definitions: Option<serde_json::Value>,
) -> ItemOutcome {
    tracing::debug!(run_id = %state.run_id, source_id, "migrating item");

    let item_ctx = OperationContext::new(
        Arc::clone(source),
        Arc::clone(target),
        state.cancel.child_token(),
    );
    item_ctx.set_param("source_id", serde_json::json!(source_id));
    item_ctx.set_param(
        "idempotency_key",
        serde_json::json!(idempotency_key(source.id(), source_id, &state.run_id)),
    );
    if let Some(defs) = field_definitions {
        item_ctx.set_param("field_definitions", defs);
    }

    let attachments_supported = source.capabilities().supports_attachments
        && target.capabilities().supports_attachments;
    let plan = match item_plan(attachments_supported, target) {
        Ok(plan) => plan,
        Err(err) => {
            return ItemOutcome {
                source_id: source_id.to_string(),
                target_id: None,
                status: OperationStatus::Failure,
                error_kind: Some(err.kind()),
                message: Some(err.to_string()),
                finished_at: Utc::now(),
            }
        }
    };
    let handlers = item_handlers(inner, source, target, config, attachments_supported);

    let executor = OperationExecutor::new(ExecutorConfig {
        op_parallelism: config.op_parallelism,
        operation_timeout: config.operation_timeout(),
    });
    let summary = match executor.execute(&plan, &item_ctx, &handlers).await {
        Ok(summary) => summary,
        Err(err) => {
            return ItemOutcome {
                source_id: source_id.to_string(),
                target_id: None,
                status: OperationStatus::Failure,
                error_kind: Some(err.kind()),
                message: Some(err.to_string()),
                finished_at: Utc::now(),
            }
        }
    };

    let target_id = item_ctx
        .result(&"create_target".into())
        .and_then(|r| r.data)
        .and_then(|d| d.get("id").and_then(|v| v.as_str().map(str::to_string)));

    match summary.status {
        ExecutionStatus::Completed => ItemOutcome {
            source_id: source_id.to_string(),
            target_id,
            status: OperationStatus::Success,
            error_kind: None,
            message: None,
            finished_at: Utc::now(),
        },
        ExecutionStatus::Cancelled => ItemOutcome {
            source_id: source_id.to_string(),
            target_id,
            status: OperationStatus::Cancelled,
            error_kind: Some(ErrorKind::Cancelled),
            message: Some("run cancelled".to_string()),
            finished_at: Utc::now(),
        },
        ExecutionStatus::Failed => {
            let failing = summary
                .aborted_by
                .as_ref()
                .and_then(|op| item_ctx.result(op))
                .and_then(|r| r.error);
            ItemOutcome {
                source_id: source_id.to_string(),
                target_id,
                status: OperationStatus::Failure,
                error_kind: failing.as_ref().map(|e| e.kind),
                message: failing.map(|e| e.message),
                finished_at: Utc::now(),
            }
        }
    }
}

/// The per-item sub-plan: fetch → map → create → attachments/links.
fn item_plan(attachments: bool, target: &Arc<dyn ProviderAdapter>) -> Result<ExecutionPlan> {
    let mut contracts = vec![OperationContract::new("fetch_detail").required()];

    let mut map_deps: Vec<&str> = vec!["fetch_detail"];
    if attachments {
        contracts.push(OperationContract::new("fetch_attachments").depends_on(["fetch_detail"]));
        map_deps.push("fetch_attachments");
    }
    contracts.push(OperationContract::new("map_to_canonical").depends_on(map_deps).required());
    contracts.push(
        OperationContract::new("map_to_target")
            .depends_on(["map_to_canonical"])
            .required(),
    );
    contracts.push(
        OperationContract::new("create_target")
            .depends_on(["map_to_target"])
            .required()
            .mutates(),
    );
    if attachments {
        contracts.push(
            OperationContract::new("upload_attachments")
                .depends_on(["create_target", "fetch_attachments"])
                .mutates(),
        );
    }
    let target_has_links = target
        .api_contract()
        .iter()
        .any(|c| c.id.as_str() == "create_trace_link");
    if target_has_links {
        contracts.push(
            OperationContract::new("create_links")
                .depends_on(["create_target"])
                .mutates(),
        );
    }
    ExecutionPlan::new(contracts)
}

fn item_handlers(
    inner: &Arc<Inner>,
    source: &Arc<dyn ProviderAdapter>,
    target: &Arc<dyn ProviderAdapter>,
    config: &Arc<RunConfig>,
    attachments: bool,
) -> HandlerRegistry {
    let mut handlers = HandlerRegistry::new();

    // fetch_detail: the source artifact payload.
    {
        let inner = Arc::clone(inner);
        let source = Arc::clone(source);
        let config = Arc::clone(config);
        handlers.insert_fn("fetch_detail", move |ctx: OperationContext| {
            let inner = Arc::clone(&inner);
            let source = Arc::clone(&source);
            let config = Arc::clone(&config);
            Box::pin(async move {
                let id = ctx.param("source_id").unwrap_or(serde_json::Value::Null);
                let call = ProviderCall::read("get_test_case", serde_json::json!({ "id": id }));
                let outcome = inner.caller.call(&source, call, &config, ctx.cancel_token()).await?;
                ctx.note_retries(&"fetch_detail".into(), outcome.retries);
                Ok(outcome.data)
            })
        });
    }

    if attachments {
        let inner_c = Arc::clone(inner);
        let source_c = Arc::clone(source);
        let config_c = Arc::clone(config);
        handlers.insert_fn("fetch_attachments", move |ctx: OperationContext| {
            let inner = Arc::clone(&inner_c);
            let source = Arc::clone(&source_c);
            let config = Arc::clone(&config_c);
            Box::pin(async move {
                let id = ctx.param("source_id").unwrap_or(serde_json::Value::Null);
                let call = ProviderCall::read("get_attachments", serde_json::json!({ "id": id }));
                let outcome = inner.caller.call(&source, call, &config, ctx.cancel_token()).await?;
                ctx.note_retries(&"fetch_attachments".into(), outcome.retries);
                Ok(outcome.data)
            })
        });
    }

    // map_to_canonical: injected mapper, plus the attachment list.
    {
        let inner_c = Arc::clone(inner);
        let source_c = Arc::clone(source);
        let include_attachments = attachments;
        handlers.insert_fn("map_to_canonical", move |ctx: OperationContext| {
            let inner = Arc::clone(&inner_c);
            let source = Arc::clone(&source_c);
            Box::pin(async move {
                let detail = ctx
                    .expect_data("map_to_canonical", &"fetch_detail".into())
                    .map_err(|e| CallError::new(ErrorKind::DependencyMissing, e.to_string()))?;
                let mut artifact = inner.mapper.source_to_canonical(source.id(), &detail)?;
                if include_attachments {
                    let listing = ctx
                        .expect_data("map_to_canonical", &"fetch_attachments".into())
                        .map_err(|e| CallError::new(ErrorKind::DependencyMissing, e.to_string()))?;
                    let refs: Vec<AttachmentRef> =
                        serde_json::from_value(listing).unwrap_or_default();
                    artifact.attachments = refs;
                }
                serde_json::to_value(&artifact)
                    .map_err(|e| CallError::new(ErrorKind::MappingError, e.to_string()))
            })
        });
    }

    // map_to_target: canonical → target payload.
    {
        let inner_c = Arc::clone(inner);
        let target_c = Arc::clone(target);
        handlers.insert_fn("map_to_target", move |ctx: OperationContext| {
            let inner = Arc::clone(&inner_c);
            let target = Arc::clone(&target_c);
            Box::pin(async move {
                let canonical_json = ctx
                    .expect_data("map_to_target", &"map_to_canonical".into())
                    .map_err(|e| CallError::new(ErrorKind::DependencyMissing, e.to_string()))?;
                let artifact: CanonicalArtifact = serde_json::from_value(canonical_json)
                    .map_err(|e| CallError::new(ErrorKind::MappingError, e.to_string()))?;
                inner.mapper.canonical_to_target(target.id(), &artifact)
            })
        });
    }

    // create_target: the mutation, tagged with the idempotency key. A target
    // receiving a duplicate key returns the prior identifier.
    {
        let inner_c = Arc::clone(inner);
        let target_c = Arc::clone(target);
        let config_c = Arc::clone(config);
        handlers.insert_fn("create_target", move |ctx: OperationContext| {
            let inner = Arc::clone(&inner_c);
            let target = Arc::clone(&target_c);
            let config = Arc::clone(&config_c);
            Box::pin(async move {
                let payload = ctx
                    .expect_data("create_target", &"map_to_target".into())
                    .map_err(|e| CallError::new(ErrorKind::DependencyMissing, e.to_string()))?;
                let call = ProviderCall::mutate(
                    "create_test_case",
                    serde_json::json!({
                        "artifact": payload,
                        "idempotency_key": ctx.param("idempotency_key"),
                    }),
                );
                let outcome = inner.caller.call(&target, call, &config, ctx.cancel_token()).await?;
                ctx.note_retries(&"create_target".into(), outcome.retries);
                Ok(outcome.data)
            })
        });
    }

    if attachments {
        let inner_c = Arc::clone(inner);
        let source_c = Arc::clone(source);
        let target_c = Arc::clone(target);
        let config_c = Arc::clone(config);
        handlers.insert_fn("upload_attachments", move |ctx: OperationContext| {
            let inner = Arc::clone(&inner_c);
            let source = Arc::clone(&source_c);
            let target = Arc::clone(&target_c);
            let config = Arc::clone(&config_c);
            Box::pin(async move {
                let created = ctx
                    .expect_data("upload_attachments", &"create_target".into())
                    .map_err(|e| CallError::new(ErrorKind::DependencyMissing, e.to_string()))?;
                let target_case = created.get("id").cloned().unwrap_or(serde_json::Value::Null);
                let listing = ctx
                    .expect_data("upload_attachments", &"fetch_attachments".into())
                    .map_err(|e| CallError::new(ErrorKind::DependencyMissing, e.to_string()))?;
                let refs: Vec<AttachmentRef> = serde_json::from_value(listing).unwrap_or_default();

                let mut uploaded = 0u64;
                for attachment in refs {
                    let content = inner
                        .caller
                        .call(
                            &source,
                            ProviderCall::read(
                                "get_attachment_content",
                                serde_json::json!({ "id": attachment.id }),
                            ),
                            &config,
                            ctx.cancel_token(),
                        )
                        .await?;
                    inner
                        .caller
                        .call(
                            &target,
                            ProviderCall::mutate(
                                "upload_attachment",
                                serde_json::json!({
                                    "test_case_id": target_case,
                                    "file_name": attachment.file_name,
                                    "content_type": attachment.content_type,
                                    "content": content,
                                }),
                            ),
                            &config,
                            ctx.cancel_token(),
                        )
                        .await?;
                    uploaded += 1;
                }
                Ok(serde_json::json!({ "uploaded": uploaded }))
            })
        });
    }

    // create_links: trace link from the migrated case back to its source.
    {
        let inner_c = Arc::clone(inner);
        let target_c = Arc::clone(target);
        let config_c = Arc::clone(config);
        handlers.insert_fn("create_links", move |ctx: OperationContext| {
            let inner = Arc::clone(&inner_c);
            let target = Arc::clone(&target_c);
            let config = Arc::clone(&config_c);
            Box::pin(async move {
                let created = ctx
                    .expect_data("create_links", &"create_target".into())
                    .map_err(|e| CallError::new(ErrorKind::DependencyMissing, e.to_string()))?;
                let call = ProviderCall::mutate(
                    "create_trace_link",
                    serde_json::json!({
                        "test_case_id": created.get("id"),
                        "source_id": ctx.param("source_id"),
                    }),
                );
                let outcome = inner.caller.call(&target, call, &config, ctx.cancel_token()).await?;
                ctx.note_retries(&"create_links".into(), outcome.retries);
                Ok(outcome.data)
            })
        });
    }

    handlers
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn idempotency_key_is_deterministic() {
        let a = idempotency_key("alpha", "TC-1", "run-1");
        let b = idempotency_key("alpha", "TC-1", "run-1");
        let c = idempotency_key("alpha", "TC-1", "run-2");
        assert_eq!(a, b);
        assert_ne!(a, c);
    }

    #[test]
    fn glue_contract_depends_on_source_reads_only() {
        let registry = ContractRegistry::new();
        registry.register(
            "alpha",
            vec![
                OperationContract::new("authenticate"),
                OperationContract::new("get_projects").depends_on(["authenticate"]),
                OperationContract::new("get_test_cases").depends_on(["get_projects"]),
                OperationContract::new("delete_test_case").depends_on(["authenticate"]).mutates(),
            ],
        );
        registry.register(
            "beta",
            vec![
                OperationContract::new("authenticate"),
                OperationContract::new("create_test_case").depends_on(["authenticate"]).mutates(),
            ],
        );

        let combined = combined_contracts(&registry, "alpha", "beta");
        let select = combined
            .iter()
            .find(|c| c.id.as_str() == SELECT_ITEMS)
            .unwrap();
        let deps: Vec<&str> = select.depends_on.iter().map(OperationId::as_str).collect();
        assert!(deps.contains(&"get_test_cases"));
        assert!(deps.contains(&"get_projects"));
        assert!(!deps.contains(&"delete_test_case"));
        assert!(!deps.iter().any(|d| d.starts_with("target:")));

        // Target mutations stay out of the run-level plan.
        assert!(!combined.iter().any(|c| c.id.as_str() == "target:create_test_case"));
        assert!(combined.iter().any(|c| c.id.as_str() == "target:authenticate"));

        // And the combined plan is valid.
        assert!(ExecutionPlan::new(combined).is_ok());
    }
}

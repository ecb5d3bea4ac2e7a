//! Operation executor.
//!
//! Dispatches an execution plan layer by layer: operations within a layer
//! have no pairwise dependency and run concurrently up to the configured
//! parallelism cap. A layer's results are published to the context before the
//! next layer is dispatched, so a dependent always observes its
//! prerequisites' completed writes.
//!
//! Failure semantics: a failed **required** operation stops dispatch - the
//! current layer finishes (those handlers may already have side effects in
//! flight) and every undispatched operation is recorded as `skipped`. A
//! failed non-required operation is recorded and the plan continues.
//! Cancellation cascades through per-operation child tokens.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use futures::future::BoxFuture;

use crate::context::{OperationContext, OperationResult, OperationStatus};
use crate::contract::OperationId;
use crate::error::{CallError, Error, Result};
use crate::plan::ExecutionPlan;

/// One operation's work: read the context, call providers through the
/// resilient caller, return a payload.
#[async_trait]
pub trait OperationHandler: Send + Sync {
    /// Execute the operation.
    async fn run(&self, ctx: OperationContext) -> std::result::Result<serde_json::Value, CallError>;
}

struct FnHandler<F> {
    f: F,
}

#[async_trait]
impl<F> OperationHandler for FnHandler<F>
where
    F: Fn(OperationContext) -> BoxFuture<'static, std::result::Result<serde_json::Value, CallError>>
        + Send
        + Sync,
{
    async fn run(&self, ctx: OperationContext) -> std::result::Result<serde_json::Value, CallError> {
        (self.f)(ctx).await
    }
}

/// Identifier → handler registry for one plan.
#[derive(Default)]
pub struct HandlerRegistry {
    handlers: HashMap<OperationId, Arc<dyn OperationHandler>>,
}

impl HandlerRegistry {
    /// Empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a handler object.
    pub fn insert(&mut self, op: impl Into<OperationId>, handler: Arc<dyn OperationHandler>) {
        self.handlers.insert(op.into(), handler);
    }

    /// Register a closure returning a boxed future.
    pub fn insert_fn<F>(&mut self, op: impl Into<OperationId>, f: F)
    where
        F: Fn(OperationContext) -> BoxFuture<'static, std::result::Result<serde_json::Value, CallError>>
            + Send
            + Sync
            + 'static,
    {
        self.handlers.insert(op.into(), Arc::new(FnHandler { f }));
    }

    /// Look up a handler.
    pub fn get(&self, op: &OperationId) -> Option<Arc<dyn OperationHandler>> {
        self.handlers.get(op).map(Arc::clone)
    }
}

/// Terminal status of one executed plan.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecutionStatus {
    /// Every dispatched operation finished; no required operation failed.
    Completed,
    /// A required operation failed; undispatched operations were skipped.
    Failed,
    /// External cancellation ended the plan.
    Cancelled,
}

/// Aggregate outcome of one plan execution. Individual results live in the
/// operation context.
#[derive(Debug, Clone)]
pub struct ExecutionSummary {
    /// Terminal status.
    pub status: ExecutionStatus,
    /// The required operation whose failure aborted the plan, if any.
    pub aborted_by: Option<OperationId>,
    /// Operations dispatched to handlers.
    pub dispatched: usize,
    /// Operations that succeeded.
    pub succeeded: usize,
    /// Operations that failed (including timeouts).
    pub failed: usize,
    /// Operations never dispatched.
    pub skipped: usize,
    /// Operations interrupted by cancellation.
    pub cancelled: usize,
}

/// Executor settings for one plan.
#[derive(Debug, Clone, Copy)]
pub struct ExecutorConfig {
    /// Max operations in flight within one layer; `None` means layer width.
    pub op_parallelism: Option<usize>,
    /// Per-operation deadline.
    pub operation_timeout: Duration,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            op_parallelism: None,
            operation_timeout: Duration::from_millis(120_000),
        }
    }
}

/// Runs execution plans against handler registries.
#[derive(Debug, Clone, Default)]
pub struct OperationExecutor {
    config: ExecutorConfig,
}

impl OperationExecutor {
    /// Executor with the given settings.
    pub fn new(config: ExecutorConfig) -> Self {
        Self { config }
    }

    /// Execute a plan. Fails fast (before dispatching anything) when a
    /// planned operation has no handler.
    pub async fn execute(
        &self,
        plan: &ExecutionPlan,
        ctx: &OperationContext,
        handlers: &HandlerRegistry,
    ) -> Result<ExecutionSummary> {
        for op in plan.ordered() {
            if handlers.get(op).is_none() {
                return Err(Error::Config(format!("no handler registered for operation '{op}'")));
            }
        }

        let mut summary = ExecutionSummary {
            status: ExecutionStatus::Completed,
            aborted_by: None,
            dispatched: 0,
            succeeded: 0,
            failed: 0,
            skipped: 0,
            cancelled: 0,
        };

        for (depth, layer) in plan.layers().iter().enumerate() {
            if ctx.is_cancelled() || summary.aborted_by.is_some() {
                for op in layer {
                    ctx.record(OperationResult::skipped(op.clone()));
                    summary.skipped += 1;
                }
                continue;
            }

            tracing::debug!(depth, width = layer.len(), "dispatching layer");
            let results = self.run_layer(layer, ctx, handlers).await;

            // Publish the whole layer before looking at the next one.
            for result in results {
                match result.status {
                    OperationStatus::Success => summary.succeeded += 1,
                    OperationStatus::Cancelled => summary.cancelled += 1,
                    OperationStatus::Failure => {
                        summary.failed += 1;
                        if summary.aborted_by.is_none() && plan.is_required(&result.op) {
                            tracing::warn!(op = %result.op, "required operation failed, aborting plan");
                            summary.aborted_by = Some(result.op.clone());
                        }
                    }
                    OperationStatus::Skipped => summary.skipped += 1,
                }
                summary.dispatched += 1;
                ctx.record(result);
            }
        }

        summary.status = if ctx.is_cancelled() {
            ExecutionStatus::Cancelled
        } else if summary.aborted_by.is_some() {
            ExecutionStatus::Failed
        } else {
            ExecutionStatus::Completed
        };
        Ok(summary)
    }

    async fn run_layer(
        &self,
        layer: &[OperationId],
        ctx: &OperationContext,
        handlers: &HandlerRegistry,
    ) -> Vec<OperationResult> {
        let cap = self.config.op_parallelism.unwrap_or(layer.len()).max(1);
        let gate = Arc::new(tokio::sync::Semaphore::new(cap));
        let timeout = self.config.operation_timeout;

        let mut tasks = tokio::task::JoinSet::new();
        for op in layer {
            let Some(handler) = handlers.get(op) else {
                // Checked before dispatch; unreachable in practice.
                continue;
            };
            let op = op.clone();
            let gate = Arc::clone(&gate);
            let op_cancel = ctx.cancel_token().child_token();
            let op_ctx = ctx.with_cancel(op_cancel.clone());

            tasks.spawn(async move {
                let _slot = match gate.acquire_owned().await {
                    Ok(slot) => slot,
                    Err(_) => return OperationResult::skipped(op),
                };
                let started = Utc::now();
                if op_cancel.is_cancelled() {
                    return OperationResult::failure(op, CallError::cancelled(), started, 0);
                }

                tokio::select! {
                    result = handler.run(op_ctx.clone()) => {
                        let retries = op_ctx.retries_for(&op);
                        match result {
                            Ok(data) => OperationResult::success(op, data, started, retries),
                            Err(error) => OperationResult::failure(op, error, started, retries),
                        }
                    },
                    () = tokio::time::sleep(timeout) => {
                        // Raise the handler's cancellation signal; the handler
                        // future is dropped with this branch.
                        op_cancel.cancel();
                        OperationResult::failure(
                            op.clone(),
                            CallError::timeout(&format!("operation '{op}'"), timeout),
                            started,
                            0,
                        )
                    }
                }
            });
        }

        let mut results = Vec::with_capacity(layer.len());
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok(result) => results.push(result),
                Err(join_error) => {
                    tracing::error!(error = %join_error, "operation task panicked");
                }
            }
        }
        results
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::contract::OperationContract;
    use crate::error::ErrorKind;
    use crate::provider::{Capabilities, ConnectionStatus, ProviderAdapter, ProviderCall};
    use crate::session::{Credentials, SessionToken};
    use parking_lot::Mutex;
    use tokio_util::sync::CancellationToken;

    #[derive(Debug)]
    struct NullAdapter;

    #[async_trait]
    impl ProviderAdapter for NullAdapter {
        fn id(&self) -> &str {
            "null"
        }
        fn name(&self) -> &str {
            "null"
        }
        fn version(&self) -> &str {
            "0.0.0"
        }
        fn capabilities(&self) -> Capabilities {
            Capabilities::default()
        }
        async fn test_connection(&self) -> ConnectionStatus {
            ConnectionStatus::Connected
        }
        fn api_contract(&self) -> Vec<OperationContract> {
            Vec::new()
        }
        async fn authenticate(
            &self,
            _credentials: &Credentials,
        ) -> std::result::Result<SessionToken, CallError> {
            Ok(SessionToken::bearer("tok"))
        }
        async fn call(
            &self,
            _call: ProviderCall,
        ) -> std::result::Result<serde_json::Value, CallError> {
            Ok(serde_json::Value::Null)
        }
    }

    fn context() -> OperationContext {
        OperationContext::new(
            Arc::new(NullAdapter),
            Arc::new(NullAdapter),
            CancellationToken::new(),
        )
    }

    fn linear_plan() -> ExecutionPlan {
        ExecutionPlan::new(vec![
            OperationContract::new("authenticate").required(),
            OperationContract::new("get_projects").depends_on(["authenticate"]).required(),
            OperationContract::new("get_modules")
                .depends_on(["authenticate", "get_projects"])
                .required(),
            OperationContract::new("get_test_cases")
                .depends_on(["authenticate", "get_projects", "get_modules"]),
        ])
        .unwrap()
    }

    fn ok_handler(value: serde_json::Value) -> impl Fn(OperationContext) -> BoxFuture<'static, std::result::Result<serde_json::Value, CallError>> {
        move |_ctx| {
            let value = value.clone();
            Box::pin(async move { Ok(value) })
        }
    }

    #[tokio::test]
    async fn executes_in_dependency_order_and_publishes_results() {
        let plan = linear_plan();
        let ctx = context();
        let order: Arc<Mutex<Vec<String>>> = Arc::new(Mutex::new(Vec::new()));

        let mut handlers = HandlerRegistry::new();
        for op in ["authenticate", "get_projects", "get_modules", "get_test_cases"] {
            let order = Arc::clone(&order);
            handlers.insert_fn(op, move |_ctx| {
                let order = Arc::clone(&order);
                Box::pin(async move {
                    order.lock().push(op.to_string());
                    Ok(serde_json::json!({ "op": op }))
                })
            });
        }

        let summary = OperationExecutor::default()
            .execute(&plan, &ctx, &handlers)
            .await
            .unwrap();

        assert_eq!(summary.status, ExecutionStatus::Completed);
        assert_eq!(summary.succeeded, 4);
        assert_eq!(
            *order.lock(),
            vec!["authenticate", "get_projects", "get_modules", "get_test_cases"]
        );
        assert!(ctx.result(&"get_modules".into()).unwrap().is_success());
    }

    #[tokio::test]
    async fn dependent_observes_predecessor_data() {
        let plan = ExecutionPlan::new(vec![
            OperationContract::new("get_projects").required(),
            OperationContract::new("get_modules").depends_on(["get_projects"]).required(),
        ])
        .unwrap();
        let ctx = context();

        let mut handlers = HandlerRegistry::new();
        handlers.insert_fn("get_projects", ok_handler(serde_json::json!({"project": "PRJ-1"})));
        handlers.insert_fn("get_modules", |ctx: OperationContext| {
            Box::pin(async move {
                let projects = ctx
                    .expect_data("get_modules", &"get_projects".into())
                    .map_err(|e| CallError::new(ErrorKind::DependencyMissing, e.to_string()))?;
                Ok(serde_json::json!({ "from": projects["project"] }))
            })
        });

        let summary = OperationExecutor::default()
            .execute(&plan, &ctx, &handlers)
            .await
            .unwrap();
        assert_eq!(summary.status, ExecutionStatus::Completed);
        let result = ctx.result(&"get_modules".into()).unwrap();
        assert_eq!(result.data.unwrap()["from"], "PRJ-1");
    }

    #[tokio::test]
    async fn required_failure_skips_later_layers() {
        let plan = linear_plan();
        let ctx = context();

        let mut handlers = HandlerRegistry::new();
        handlers.insert_fn("authenticate", ok_handler(serde_json::Value::Null));
        handlers.insert_fn("get_projects", |_ctx| {
            Box::pin(async { Err(CallError::new(ErrorKind::ServerError, "boom")) })
        });
        handlers.insert_fn("get_modules", ok_handler(serde_json::Value::Null));
        handlers.insert_fn("get_test_cases", ok_handler(serde_json::Value::Null));

        let summary = OperationExecutor::default()
            .execute(&plan, &ctx, &handlers)
            .await
            .unwrap();

        assert_eq!(summary.status, ExecutionStatus::Failed);
        assert_eq!(summary.aborted_by, Some("get_projects".into()));
        assert_eq!(summary.failed, 1);
        assert_eq!(summary.skipped, 2);
        assert_eq!(
            ctx.result(&"get_modules".into()).unwrap().status,
            OperationStatus::Skipped
        );
        assert_eq!(
            ctx.result(&"get_test_cases".into()).unwrap().status,
            OperationStatus::Skipped
        );
    }

    #[tokio::test]
    async fn non_required_failure_lets_the_plan_continue() {
        let plan = ExecutionPlan::new(vec![
            OperationContract::new("get_projects").required(),
            OperationContract::new("get_attachments").depends_on(["get_projects"]),
            OperationContract::new("get_test_cases").depends_on(["get_projects"]).required(),
        ])
        .unwrap();
        let ctx = context();

        let mut handlers = HandlerRegistry::new();
        handlers.insert_fn("get_projects", ok_handler(serde_json::Value::Null));
        handlers.insert_fn("get_attachments", |_ctx| {
            Box::pin(async { Err(CallError::new(ErrorKind::NotFound, "none")) })
        });
        handlers.insert_fn("get_test_cases", ok_handler(serde_json::json!([1, 2])));

        let summary = OperationExecutor::default()
            .execute(&plan, &ctx, &handlers)
            .await
            .unwrap();

        assert_eq!(summary.status, ExecutionStatus::Completed);
        assert_eq!(summary.failed, 1);
        assert_eq!(summary.succeeded, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn slow_handler_times_out_and_is_cancelled() {
        let plan = ExecutionPlan::new(vec![OperationContract::new("get_projects").required()]).unwrap();
        let ctx = context();

        let mut handlers = HandlerRegistry::new();
        handlers.insert_fn("get_projects", |_ctx| {
            Box::pin(async move {
                tokio::time::sleep(Duration::from_secs(3600)).await;
                Ok(serde_json::Value::Null)
            })
        });

        let executor = OperationExecutor::new(ExecutorConfig {
            op_parallelism: None,
            operation_timeout: Duration::from_millis(50),
        });
        let summary = executor.execute(&plan, &ctx, &handlers).await.unwrap();

        assert_eq!(summary.status, ExecutionStatus::Failed);
        let result = ctx.result(&"get_projects".into()).unwrap();
        assert_eq!(result.status, OperationStatus::Failure);
        assert_eq!(result.error.unwrap().kind, ErrorKind::Timeout);
    }

    #[tokio::test]
    async fn run_cancellation_ends_with_cancelled_status() {
        let plan = linear_plan();
        let ctx = context();
        ctx.cancel_token().cancel();

        let mut handlers = HandlerRegistry::new();
        for op in ["authenticate", "get_projects", "get_modules", "get_test_cases"] {
            handlers.insert_fn(op, ok_handler(serde_json::Value::Null));
        }

        let summary = OperationExecutor::default()
            .execute(&plan, &ctx, &handlers)
            .await
            .unwrap();
        assert_eq!(summary.status, ExecutionStatus::Cancelled);
        assert_eq!(summary.skipped, 4);
    }

    #[tokio::test]
    async fn missing_handler_fails_before_dispatch() {
        let plan = linear_plan();
        let ctx = context();
        let handlers = HandlerRegistry::new();

        let err = OperationExecutor::default()
            .execute(&plan, &ctx, &handlers)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Config(_)));
        assert!(ctx.results().is_empty());
    }

    #[tokio::test]
    async fn layer_parallelism_respects_the_cap() {
        let plan = ExecutionPlan::new(vec![
            OperationContract::new("a"),
            OperationContract::new("b"),
            OperationContract::new("c"),
            OperationContract::new("d"),
        ])
        .unwrap();
        let ctx = context();

        let current = Arc::new(std::sync::atomic::AtomicUsize::new(0));
        let peak = Arc::new(std::sync::atomic::AtomicUsize::new(0));
        let mut handlers = HandlerRegistry::new();
        for op in ["a", "b", "c", "d"] {
            let current = Arc::clone(&current);
            let peak = Arc::clone(&peak);
            handlers.insert_fn(op, move |_ctx| {
                let current = Arc::clone(&current);
                let peak = Arc::clone(&peak);
                Box::pin(async move {
                    let now = current.fetch_add(1, std::sync::atomic::Ordering::SeqCst) + 1;
                    peak.fetch_max(now, std::sync::atomic::Ordering::SeqCst);
                    tokio::time::sleep(Duration::from_millis(10)).await;
                    current.fetch_sub(1, std::sync::atomic::Ordering::SeqCst);
                    Ok(serde_json::Value::Null)
                })
            });
        }

        let executor = OperationExecutor::new(ExecutorConfig {
            op_parallelism: Some(2),
            operation_timeout: Duration::from_secs(10),
        });
        let summary = executor.execute(&plan, &ctx, &handlers).await.unwrap();
        assert_eq!(summary.succeeded, 4);
        assert!(peak.load(std::sync::atomic::Ordering::SeqCst) <= 2);
    }
}

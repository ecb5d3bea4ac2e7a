//! Resilient caller: the per-request composition.
//!
//! Order, outermost first: circuit breaker, rate limiter, bulkhead, session
//! attachment, execution, retry, categorization. The breaker is consulted
//! before anything else so an open circuit fast-fails without consuming a
//! token or a bulkhead slot; throttled callers wait before taking a slot so
//! they never occupy concurrency capacity; a retry re-enters at the rate
//! limiter with the bulkhead slot released.
//!
//! Resilience state (breakers, buckets, bulkheads) is owned here, one set per
//! provider, created on first use and shared across runs. Explicit teardown
//! happens in the orchestrator's shutdown path via [`ResilientCaller::clear`].

use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use tokio_util::sync::CancellationToken;

use crate::config::{CircuitScope, RunConfig};
use crate::error::{CallError, ErrorKind};
use crate::provider::{EndpointClass, ProviderAdapter, ProviderCall};
use crate::resilience::bulkhead::Bulkhead;
use crate::resilience::circuit::CircuitBreaker;
use crate::resilience::rate_limit::RateLimiter;
use crate::resilience::retry::{RetryDecision, RetryPolicy};
use crate::session::SessionManager;

/// Successful call result plus how many retries it took.
#[derive(Debug, Clone, serde::Serialize)]
pub struct CallOutcome {
    /// The adapter's payload.
    pub data: serde_json::Value,
    /// Retries consumed; 0 means the first attempt succeeded.
    pub retries: u32,
}

/// One provider's shared resilience state.
#[derive(Debug)]
pub struct ProviderResilience {
    scope: CircuitScope,
    circuit_shape: crate::config::CircuitConfig,
    breakers: DashMap<Option<EndpointClass>, Arc<CircuitBreaker>>,
    rate: RateLimiter,
    bulkhead: Bulkhead,
    retry: RetryPolicy,
}

impl ProviderResilience {
    fn new(config: &RunConfig) -> Self {
        Self {
            scope: config.circuit.scope,
            circuit_shape: config.circuit,
            breakers: DashMap::new(),
            rate: RateLimiter::new(config.rate),
            bulkhead: Bulkhead::new(config.bulkhead),
            retry: RetryPolicy::new(config.retry),
        }
    }

    /// The breaker for an endpoint class, honoring the configured scope.
    pub fn breaker(&self, class: EndpointClass) -> Arc<CircuitBreaker> {
        let key = match self.scope {
            CircuitScope::PerProvider => None,
            CircuitScope::PerEndpointClass => Some(class),
        };
        Arc::clone(
            self.breakers
                .entry(key)
                .or_insert_with(|| Arc::new(CircuitBreaker::new(self.circuit_shape)))
                .value(),
        )
    }

    /// The provider's rate limiter.
    pub fn rate(&self) -> &RateLimiter {
        &self.rate
    }

    /// The provider's bulkhead.
    pub fn bulkhead(&self) -> &Bulkhead {
        &self.bulkhead
    }
}

/// Wraps every outbound request with the resilience pipeline.
#[derive(Debug)]
pub struct ResilientCaller {
    sessions: Arc<SessionManager>,
    providers: DashMap<String, Arc<ProviderResilience>>,
}

impl ResilientCaller {
    /// Caller sharing the given session manager.
    pub fn new(sessions: Arc<SessionManager>) -> Self {
        Self {
            sessions,
            providers: DashMap::new(),
        }
    }

    /// The shared resilience state for a provider, created from `config`'s
    /// shapes on first use. Later runs reuse the existing state: breakers and
    /// buckets deliberately span runs.
    pub fn provider_state(&self, provider_id: &str, config: &RunConfig) -> Arc<ProviderResilience> {
        Arc::clone(
            self.providers
                .entry(provider_id.to_string())
                .or_insert_with(|| Arc::new(ProviderResilience::new(config)))
                .value(),
        )
    }

    /// Drop all per-provider state (run shutdown path).
    pub fn clear(&self) {
        self.providers.clear();
    }

    /// Execute one call through the full pipeline.
    pub async fn call(
        &self,
        adapter: &Arc<dyn ProviderAdapter>,
        call: ProviderCall,
        config: &RunConfig,
        cancel: &CancellationToken,
    ) -> std::result::Result<CallOutcome, CallError> {
        let state = self.provider_state(adapter.id(), config);
        let breaker = state.breaker(call.endpoint_class);

        // Fast-fail before consuming a token or a slot.
        let _admission = breaker.admit()?;

        let mut attempt: u32 = 1;
        loop {
            if cancel.is_cancelled() {
                return Err(CallError::cancelled());
            }

            // Rate limiter before the bulkhead: a throttled caller must not
            // occupy concurrency capacity while it waits.
            state.rate.acquire(cancel).await?;

            let error = match state.bulkhead.acquire(cancel).await {
                Ok(slot) => {
                    let result = self
                        .execute_once(adapter, &call, config.request_timeout(), cancel)
                        .await;
                    drop(slot);

                    match result {
                        Ok(data) => {
                            breaker.on_success();
                            state.rate.on_success();
                            return Ok(CallOutcome {
                                data,
                                retries: attempt - 1,
                            });
                        }
                        Err(error) => error,
                    }
                }
                Err(error) => error,
            };

            breaker.on_error(error.kind);
            if error.kind == ErrorKind::Throttled {
                match &error.hints {
                    Some(hints) => state.rate.adapt(hints),
                    None => state.rate.penalize(),
                }
            }

            match state.retry.decide(&error, attempt) {
                RetryDecision::Surface => {
                    tracing::debug!(
                        provider = adapter.id(),
                        op = %call.op,
                        kind = %error.kind,
                        attempt,
                        "call failed, surfacing"
                    );
                    return Err(error);
                }
                RetryDecision::Retry(delay) => {
                    tracing::debug!(
                        provider = adapter.id(),
                        op = %call.op,
                        kind = %error.kind,
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        "call failed, retry scheduled"
                    );
                    attempt += 1;
                    tokio::select! {
                        () = tokio::time::sleep(delay) => {}
                        () = cancel.cancelled() => return Err(CallError::cancelled()),
                    }
                }
            }
        }
    }

    /// Session attachment + execution + the single 401 replay.
    async fn execute_once(
        &self,
        adapter: &Arc<dyn ProviderAdapter>,
        call: &ProviderCall,
        request_timeout: Duration,
        cancel: &CancellationToken,
    ) -> std::result::Result<serde_json::Value, CallError> {
        let mut outbound = call.clone();
        if self.sessions.has_credentials(adapter.id()) {
            outbound.token = Some(self.sessions.get_token(adapter).await?);
        }

        let result = execute_with_deadline(adapter, outbound, request_timeout, cancel).await;
        let Err(error) = &result else {
            return result;
        };

        // A 401 forces one synchronous reauthentication and one replay.
        if error.status == Some(401) && self.sessions.has_credentials(adapter.id()) {
            tracing::debug!(provider = adapter.id(), op = %call.op, "401 received, replaying once");
            let token = self.sessions.force_refresh(adapter).await?;
            let replay = call.clone().with_token(token);
            return match execute_with_deadline(adapter, replay, request_timeout, cancel).await {
                Err(err) if err.status == Some(401) => Err(CallError {
                    kind: ErrorKind::AuthenticationFailed,
                    message: format!("provider '{}' rejected a freshly minted token", adapter.id()),
                    status: Some(401),
                    hints: None,
                }),
                other => other,
            };
        }

        result
    }
}

async fn execute_with_deadline(
    adapter: &Arc<dyn ProviderAdapter>,
    call: ProviderCall,
    request_timeout: Duration,
    cancel: &CancellationToken,
) -> std::result::Result<serde_json::Value, CallError> {
    let op = call.op.clone();
    tokio::select! {
        result = adapter.call(call) => result,
        () = tokio::time::sleep(request_timeout) => {
            Err(CallError::timeout(&format!("request '{op}'"), request_timeout))
        }
        () = cancel.cancelled() => Err(CallError::cancelled()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::contract::OperationContract;
    use crate::provider::{Capabilities, ConnectionStatus};
    use crate::session::{Credentials, SessionToken};
    use async_trait::async_trait;
    use parking_lot::Mutex;
    use std::sync::atomic::{AtomicU32, Ordering};

    /// Adapter that replays a scripted status sequence; `0` means success.
    #[derive(Debug)]
    struct ScriptedAdapter {
        id: &'static str,
        script: Mutex<Vec<u16>>,
        calls: AtomicU32,
        auth_calls: AtomicU32,
        delay: Option<Duration>,
    }

    impl ScriptedAdapter {
        fn new(id: &'static str, script: Vec<u16>) -> Self {
            Self {
                id,
                script: Mutex::new(script),
                calls: AtomicU32::new(0),
                auth_calls: AtomicU32::new(0),
                delay: None,
            }
        }

        fn calls(&self) -> u32 {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl ProviderAdapter for ScriptedAdapter {
        fn id(&self) -> &str {
            self.id
        }
        fn name(&self) -> &str {
            self.id
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
            let n = self.auth_calls.fetch_add(1, Ordering::SeqCst) + 1;
            Ok(SessionToken::bearer(format!("tok-{n}")))
        }
        async fn call(
            &self,
            call: ProviderCall,
        ) -> std::result::Result<serde_json::Value, CallError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if let Some(delay) = self.delay {
                tokio::time::sleep(delay).await;
            }
            let next = self.script.lock().pop();
            match next {
                Some(0) | None => Ok(serde_json::json!({
                    "id": "X",
                    "token": call.token,
                })),
                Some(429) => Err(CallError::from_status(429, "slow down")),
                Some(status) => Err(CallError::from_status(status, "scripted failure")),
            }
        }
    }

    fn caller() -> (ResilientCaller, Arc<SessionManager>) {
        let sessions = Arc::new(SessionManager::new());
        (ResilientCaller::new(Arc::clone(&sessions)), sessions)
    }

    fn fast_config() -> RunConfig {
        let mut config = RunConfig::new("src", "dst");
        config.retry.base_ms = 10;
        config.retry.factor = 2.0;
        config.retry.jitter = 0.0;
        config.retry.cap_ms = 100;
        config.retry.max_attempts = 3;
        config
    }

    #[tokio::test(start_paused = true)]
    async fn transient_server_errors_recover_via_retry() {
        let (caller, _) = caller();
        // Script pops from the end: 503, 503, then success.
        let adapter: Arc<dyn ProviderAdapter> =
            Arc::new(ScriptedAdapter::new("src", vec![0, 503, 503]));
        let config = fast_config();
        let cancel = CancellationToken::new();

        let outcome = caller
            .call(
                &adapter,
                ProviderCall::read("get_projects", serde_json::Value::Null),
                &config,
                &cancel,
            )
            .await
            .unwrap();

        assert_eq!(outcome.data["id"], "X");
        assert_eq!(outcome.retries, 2);

        let state = caller.provider_state("src", &config);
        assert_eq!(state.breaker(EndpointClass::Read).failure_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn bare_throttle_applies_penalty_then_succeeds() {
        let (caller, _) = caller();
        // Pops from the end: 429 first, then success.
        let adapter: Arc<dyn ProviderAdapter> =
            Arc::new(ScriptedAdapter::new("src", vec![0, 429]));
        let config = fast_config();
        let cancel = CancellationToken::new();

        let start = tokio::time::Instant::now();
        let outcome = caller
            .call(
                &adapter,
                ProviderCall::read("get_projects", serde_json::Value::Null),
                &config,
                &cancel,
            )
            .await
            .unwrap();
        assert_eq!(outcome.retries, 1);
        // Bare 429 applies the penalty delay before the next token grant.
        assert!(start.elapsed() >= Duration::from_millis(10));

        let state = caller.provider_state("src", &config);
        assert_eq!(state.breaker(EndpointClass::Read).failure_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn non_retriable_failures_surface_immediately() {
        let (caller, _) = caller();
        let adapter: Arc<dyn ProviderAdapter> =
            Arc::new(ScriptedAdapter::new("src", vec![404]));
        let config = fast_config();
        let cancel = CancellationToken::new();

        let err = caller
            .call(
                &adapter,
                ProviderCall::read("get_test_case", serde_json::Value::Null),
                &config,
                &cancel,
            )
            .await
            .unwrap_err();
        assert_eq!(err.kind, ErrorKind::NotFound);
    }

    #[tokio::test(start_paused = true)]
    async fn circuit_opens_and_fast_fails_without_contacting_the_remote() {
        let (caller, _) = caller();
        let scripted = Arc::new(ScriptedAdapter::new("src", vec![500, 500, 500]));
        let adapter: Arc<dyn ProviderAdapter> = Arc::clone(&scripted) as Arc<dyn ProviderAdapter>;
        let mut config = fast_config();
        config.circuit.failure_threshold = 3;
        config.circuit.reset_ms = 500;
        config.retry.max_attempts = 3;
        let cancel = CancellationToken::new();

        // One call burns 3 attempts = 3 counted failures; circuit opens.
        let err = caller
            .call(
                &adapter,
                ProviderCall::read("get_projects", serde_json::Value::Null),
                &config,
                &cancel,
            )
            .await
            .unwrap_err();
        assert_eq!(err.kind, ErrorKind::ServerError);

        let before = scripted.calls();

        let err = caller
            .call(
                &adapter,
                ProviderCall::read("get_projects", serde_json::Value::Null),
                &config,
                &cancel,
            )
            .await
            .unwrap_err();
        assert_eq!(err.kind, ErrorKind::CircuitOpen);
        assert_eq!(scripted.calls(), before, "open circuit must not contact the remote");

        // After the reset period one probe passes; success closes the circuit.
        tokio::time::sleep(Duration::from_millis(510)).await;
        let outcome = caller
            .call(
                &adapter,
                ProviderCall::read("get_projects", serde_json::Value::Null),
                &config,
                &cancel,
            )
            .await;
        // Script is exhausted so the probe succeeds.
        assert!(outcome.is_ok());
        let state = caller.provider_state("src", &config);
        assert_eq!(
            state.breaker(EndpointClass::Read).failure_count(),
            0
        );
    }

    #[tokio::test(start_paused = true)]
    async fn a_401_forces_one_reauth_and_replay() {
        let (caller, sessions) = caller();
        sessions.set_credentials(
            "src",
            Credentials::Bearer {
                token: "seed".into(),
                expires_at: None,
            },
        );
        let adapter: Arc<dyn ProviderAdapter> =
            Arc::new(ScriptedAdapter::new("src", vec![0, 401]));
        let config = fast_config();
        let cancel = CancellationToken::new();

        let outcome = caller
            .call(
                &adapter,
                ProviderCall::read("get_projects", serde_json::Value::Null),
                &config,
                &cancel,
            )
            .await
            .unwrap();
        // The replay carried the second minted token.
        assert_eq!(outcome.data["token"], "tok-2");
        // The replay is not a retry.
        assert_eq!(outcome.retries, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn a_second_401_is_authentication_failed() {
        let (caller, sessions) = caller();
        sessions.set_credentials(
            "src",
            Credentials::Bearer {
                token: "seed".into(),
                expires_at: None,
            },
        );
        let adapter: Arc<dyn ProviderAdapter> =
            Arc::new(ScriptedAdapter::new("src", vec![401, 401]));
        let config = fast_config();
        let cancel = CancellationToken::new();

        let err = caller
            .call(
                &adapter,
                ProviderCall::read("get_projects", serde_json::Value::Null),
                &config,
                &cancel,
            )
            .await
            .unwrap_err();
        assert_eq!(err.kind, ErrorKind::AuthenticationFailed);
    }

    #[tokio::test(start_paused = true)]
    async fn request_deadline_maps_to_timeout() {
        let (caller, _) = caller();
        let mut scripted = ScriptedAdapter::new("src", vec![0]);
        scripted.delay = Some(Duration::from_secs(60));
        let adapter: Arc<dyn ProviderAdapter> = Arc::new(scripted);
        let mut config = fast_config();
        config.request_timeout_ms = 50;
        config.retry.max_attempts = 1;
        let cancel = CancellationToken::new();

        let err = caller
            .call(
                &adapter,
                ProviderCall::read("get_projects", serde_json::Value::Null),
                &config,
                &cancel,
            )
            .await
            .unwrap_err();
        assert_eq!(err.kind, ErrorKind::Timeout);
    }

    #[tokio::test]
    async fn cancellation_surfaces_cancelled() {
        let (caller, _) = caller();
        let adapter: Arc<dyn ProviderAdapter> = Arc::new(ScriptedAdapter::new("src", vec![0]));
        let config = fast_config();
        let cancel = CancellationToken::new();
        cancel.cancel();

        let err = caller
            .call(
                &adapter,
                ProviderCall::read("get_projects", serde_json::Value::Null),
                &config,
                &cancel,
            )
            .await
            .unwrap_err();
        assert_eq!(err.kind, ErrorKind::Cancelled);
    }
}

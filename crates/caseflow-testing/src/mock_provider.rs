//! In-memory provider adapter for tests.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use caseflow::contract::OperationContract;
use caseflow::error::{CallError, ErrorKind, ThrottleHints};
use caseflow::provider::{Capabilities, ConnectionStatus, ProviderAdapter, ProviderCall};
use caseflow::session::{Credentials, SessionToken};
use parking_lot::Mutex;

/// A scriptable in-memory provider.
///
/// Plays source (seed it with [`with_case`](Self::with_case)) or target
/// (inspect [`created`](Self::created) / [`deleted`](Self::deleted)).
/// Failures are scripted per operation as HTTP-class status sequences; `0`
/// (or an exhausted script) means success.
#[derive(Debug)]
pub struct MockProvider {
    id: String,
    capabilities: Capabilities,
    contracts: Vec<OperationContract>,
    cases: Mutex<Vec<serde_json::Value>>,
    attachments: Mutex<HashMap<String, Vec<serde_json::Value>>>,
    attachment_content: Mutex<HashMap<String, serde_json::Value>>,
    created: Mutex<Vec<serde_json::Value>>,
    idempotency: Mutex<HashMap<String, String>>,
    deleted: Mutex<Vec<String>>,
    links: Mutex<Vec<serde_json::Value>>,
    scripts: Mutex<HashMap<String, VecDeque<u16>>>,
    throttle_hints: Mutex<HashMap<String, ThrottleHints>>,
    calls: Mutex<Vec<String>>,
    auth_count: AtomicU64,
    next_id: AtomicU64,
    call_delay: Mutex<Option<Duration>>,
    connection: Mutex<ConnectionStatus>,
}

impl MockProvider {
    /// A provider wired as a migration source with the standard read contract
    /// set (`authenticate` → `get_projects`/`get_field_definitions` →
    /// `get_folders` → `get_test_cases`).
    pub fn source(id: impl Into<String>) -> Self {
        let contracts = vec![
            OperationContract::new("authenticate").required(),
            OperationContract::new("get_projects").depends_on(["authenticate"]).required(),
            OperationContract::new("get_field_definitions").depends_on(["authenticate"]),
            OperationContract::new("get_folders")
                .depends_on(["authenticate", "get_projects"])
                .required(),
            OperationContract::new("get_test_cases")
                .depends_on(["authenticate", "get_projects", "get_folders"])
                .required(),
            OperationContract::new("get_test_case").depends_on(["authenticate"]).reads(["source_id"]),
            OperationContract::new("get_attachments")
                .depends_on(["authenticate"])
                .reads(["source_id"]),
            OperationContract::new("get_attachment_content")
                .depends_on(["authenticate"])
                .reads(["source_id"]),
        ];
        Self::new(
            id,
            Capabilities {
                may_be_source: true,
                may_be_target: false,
                supports_attachments: true,
                supports_steps: true,
                supports_hierarchy: true,
                supports_custom_fields: true,
                supports_executions: false,
            },
            contracts,
        )
    }

    /// A provider wired as a migration target with the standard write
    /// contract set.
    pub fn target(id: impl Into<String>) -> Self {
        let contracts = vec![
            OperationContract::new("authenticate").required(),
            OperationContract::new("get_projects").depends_on(["authenticate"]).required(),
            OperationContract::new("create_folder").depends_on(["authenticate"]).mutates(),
            OperationContract::new("create_test_case").depends_on(["authenticate"]).mutates(),
            OperationContract::new("upload_attachment")
                .depends_on(["authenticate"])
                .mutates(),
            OperationContract::new("create_trace_link")
                .depends_on(["authenticate"])
                .mutates(),
            OperationContract::new("delete_test_case").depends_on(["authenticate"]).mutates(),
        ];
        Self::new(
            id,
            Capabilities {
                may_be_source: false,
                may_be_target: true,
                supports_attachments: true,
                supports_steps: true,
                supports_hierarchy: true,
                supports_custom_fields: true,
                supports_executions: false,
            },
            contracts,
        )
    }

    /// A provider with explicit capabilities and contracts.
    pub fn new(
        id: impl Into<String>,
        capabilities: Capabilities,
        contracts: Vec<OperationContract>,
    ) -> Self {
        Self {
            id: id.into(),
            capabilities,
            contracts,
            cases: Mutex::new(Vec::new()),
            attachments: Mutex::new(HashMap::new()),
            attachment_content: Mutex::new(HashMap::new()),
            created: Mutex::new(Vec::new()),
            idempotency: Mutex::new(HashMap::new()),
            deleted: Mutex::new(Vec::new()),
            links: Mutex::new(Vec::new()),
            scripts: Mutex::new(HashMap::new()),
            throttle_hints: Mutex::new(HashMap::new()),
            calls: Mutex::new(Vec::new()),
            auth_count: AtomicU64::new(0),
            next_id: AtomicU64::new(1),
            call_delay: Mutex::new(None),
            connection: Mutex::new(ConnectionStatus::Connected),
        }
    }

    /// Replace the contract set.
    #[must_use]
    pub fn with_contracts(mut self, contracts: Vec<OperationContract>) -> Self {
        self.contracts = contracts;
        self
    }

    /// Disable attachment support.
    #[must_use]
    pub fn without_attachments(mut self) -> Self {
        self.capabilities.supports_attachments = false;
        self
    }

    /// Seed a source test case (canonical-shaped payload with `source_id`).
    #[must_use]
    pub fn with_case(self, case: serde_json::Value) -> Self {
        self.cases.lock().push(case);
        self
    }

    /// Seed an attachment (reference plus content) for a source case.
    #[must_use]
    pub fn with_attachment(
        self,
        case_id: &str,
        reference: serde_json::Value,
        content: serde_json::Value,
    ) -> Self {
        let attachment_id = reference["id"].as_str().unwrap_or_default().to_string();
        self.attachments
            .lock()
            .entry(case_id.to_string())
            .or_default()
            .push(reference);
        self.attachment_content.lock().insert(attachment_id, content);
        self
    }

    /// Script failures for an operation: each listed status fails one call in
    /// order; calls after the script is exhausted succeed.
    #[must_use]
    pub fn failing(self, op: &str, statuses: &[u16]) -> Self {
        self.scripts
            .lock()
            .entry(op.to_string())
            .or_default()
            .extend(statuses.iter().copied());
        self
    }

    /// Attach throttle hints to scripted 429s for an operation.
    #[must_use]
    pub fn with_throttle_hints(self, op: &str, hints: ThrottleHints) -> Self {
        self.throttle_hints.lock().insert(op.to_string(), hints);
        self
    }

    /// Delay every call (for timeout tests).
    #[must_use]
    pub fn with_call_delay(self, delay: Duration) -> Self {
        *self.call_delay.lock() = Some(delay);
        self
    }

    /// Report this status from `test_connection`.
    pub fn set_connection(&self, status: ConnectionStatus) {
        *self.connection.lock() = status;
    }

    /// Artifacts created on this provider (target role).
    pub fn created(&self) -> Vec<serde_json::Value> {
        self.created.lock().clone()
    }

    /// Target ids deleted on this provider.
    pub fn deleted(&self) -> Vec<String> {
        self.deleted.lock().clone()
    }

    /// Trace links created on this provider.
    pub fn links(&self) -> Vec<serde_json::Value> {
        self.links.lock().clone()
    }

    /// Calls made to one operation.
    pub fn call_count(&self, op: &str) -> usize {
        self.calls.lock().iter().filter(|c| c.as_str() == op).count()
    }

    /// Total authentications performed.
    pub fn auth_count(&self) -> u64 {
        self.auth_count.load(Ordering::SeqCst)
    }

    fn scripted_failure(&self, op: &str) -> Option<CallError> {
        let status = self.scripts.lock().get_mut(op).and_then(VecDeque::pop_front)?;
        if status == 0 {
            return None;
        }
        let mut error = CallError::from_status(status, format!("scripted {status} for '{op}'"));
        if status == 429 {
            if let Some(hints) = self.throttle_hints.lock().get(op) {
                error = error.with_hints(*hints);
            }
        }
        Some(error)
    }

    fn fresh_id(&self, prefix: &str) -> String {
        format!("{prefix}-{}", self.next_id.fetch_add(1, Ordering::SeqCst))
    }
}

#[async_trait]
impl ProviderAdapter for MockProvider {
    fn id(&self) -> &str {
        &self.id
    }

    fn name(&self) -> &str {
        "mock"
    }

    fn version(&self) -> &str {
        "0.0.0-test"
    }

    fn capabilities(&self) -> Capabilities {
        self.capabilities
    }

    async fn test_connection(&self) -> ConnectionStatus {
        self.connection.lock().clone()
    }

    fn api_contract(&self) -> Vec<OperationContract> {
        self.contracts.clone()
    }

    async fn authenticate(
        &self,
        _credentials: &Credentials,
    ) -> std::result::Result<SessionToken, CallError> {
        let n = self.auth_count.fetch_add(1, Ordering::SeqCst) + 1;
        if let Some(error) = self.scripted_failure("authenticate_grant") {
            return Err(error);
        }
        Ok(SessionToken::bearer(format!("mock-token-{n}")))
    }

    async fn call(&self, call: ProviderCall) -> std::result::Result<serde_json::Value, CallError> {
        let op = call.op.as_str().to_string();
        self.calls.lock().push(op.clone());

        let delay = *self.call_delay.lock();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        if let Some(error) = self.scripted_failure(&op) {
            return Err(error);
        }

        match op.as_str() {
            "get_projects" => Ok(serde_json::json!([
                { "id": "P-1", "name": "Default project" }
            ])),
            "get_folders" => Ok(serde_json::json!([
                { "id": "F-1", "name": "Regression", "parent": null }
            ])),
            "get_field_definitions" => Ok(serde_json::json!([
                { "name": "priority", "kind": "enum" },
                { "name": "status", "kind": "enum" },
            ])),
            "get_test_cases" => {
                let listing: Vec<serde_json::Value> = self
                    .cases
                    .lock()
                    .iter()
                    .map(|c| {
                        serde_json::json!({
                            "id": c["source_id"],
                            "title": c["title"],
                        })
                    })
                    .collect();
                Ok(serde_json::Value::Array(listing))
            }
            "get_test_case" => {
                let wanted = call.params["id"].as_str().unwrap_or_default().to_string();
                self.cases
                    .lock()
                    .iter()
                    .find(|c| c["source_id"] == wanted.as_str())
                    .cloned()
                    .ok_or_else(|| {
                        CallError::new(ErrorKind::NotFound, format!("no test case '{wanted}'"))
                    })
            }
            "get_attachments" => {
                let wanted = call.params["id"].as_str().unwrap_or_default().to_string();
                Ok(serde_json::Value::Array(
                    self.attachments.lock().get(&wanted).cloned().unwrap_or_default(),
                ))
            }
            "get_attachment_content" => {
                let wanted = call.params["id"].as_str().unwrap_or_default().to_string();
                self.attachment_content
                    .lock()
                    .get(&wanted)
                    .cloned()
                    .ok_or_else(|| {
                        CallError::new(ErrorKind::NotFound, format!("no attachment '{wanted}'"))
                    })
            }
            "create_folder" => Ok(serde_json::json!({ "id": self.fresh_id("F") })),
            "create_test_case" => {
                let key = call.params["idempotency_key"].as_str().map(str::to_string);
                if let Some(key) = &key {
                    if let Some(existing) = self.idempotency.lock().get(key) {
                        return Ok(serde_json::json!({ "id": existing, "duplicate": true }));
                    }
                }
                let id = self.fresh_id("T");
                let mut record = call.params.clone();
                record["id"] = serde_json::json!(id);
                self.created.lock().push(record);
                if let Some(key) = key {
                    self.idempotency.lock().insert(key, id.clone());
                }
                Ok(serde_json::json!({ "id": id }))
            }
            "upload_attachment" => Ok(serde_json::json!({ "id": self.fresh_id("A") })),
            "create_trace_link" => {
                self.links.lock().push(call.params.clone());
                Ok(serde_json::json!({ "id": self.fresh_id("L") }))
            }
            "delete_test_case" => {
                let wanted = call.params["id"].as_str().unwrap_or_default().to_string();
                let mut created = self.created.lock();
                let before = created.len();
                created.retain(|c| c["id"] != wanted.as_str());
                if created.len() == before {
                    return Err(CallError::new(
                        ErrorKind::NotFound,
                        format!("no created case '{wanted}'"),
                    ));
                }
                drop(created);
                self.deleted.lock().push(wanted);
                Ok(serde_json::json!({ "deleted": true }))
            }
            other => Err(CallError::new(
                ErrorKind::ValidationFailed,
                format!("mock provider does not implement '{other}'"),
            )),
        }
    }
}

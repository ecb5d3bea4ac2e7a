//! Provider adapter interface.
//!
//! Each external test-management system is represented by one adapter. The
//! core never speaks a provider's wire format; it declares what it needs
//! through [`ProviderCall`] and lets the adapter translate. Adapters must not
//! retry internally - the resilient caller owns retry, throttling, and
//! circuit-breaking for every outbound call.

use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};

use crate::contract::{OperationContract, OperationId};
use crate::error::{CallError, Error, ErrorKind, Result};
use crate::session::{Credentials, SessionToken};

/// What an adapter can do. Consulted at plan time; a migration that needs a
/// capability the target lacks skips the corresponding operations.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Capabilities {
    /// Can act as the source of a migration.
    pub may_be_source: bool,
    /// Can act as the target of a migration.
    pub may_be_target: bool,
    /// Stores binary attachments.
    pub supports_attachments: bool,
    /// Stores ordered test steps.
    pub supports_steps: bool,
    /// Has a folder/module hierarchy.
    pub supports_hierarchy: bool,
    /// Accepts custom attribute fields.
    pub supports_custom_fields: bool,
    /// Records executions/results.
    pub supports_executions: bool,
}

/// Result of probing a provider's reachability and credentials.
#[derive(Debug, Clone, PartialEq)]
pub enum ConnectionStatus {
    /// Reachable and authenticated.
    Connected,
    /// Unreachable or rejected; the kind distinguishes credentials problems
    /// from remote instability.
    Disconnected {
        /// Taxonomy classification of the probe failure.
        kind: ErrorKind,
        /// Short operator-facing description.
        message: String,
    },
}

impl ConnectionStatus {
    /// True when the probe succeeded.
    pub fn is_connected(&self) -> bool {
        matches!(self, ConnectionStatus::Connected)
    }
}

/// Coarse endpoint class of one call, used to sub-key circuit-breaker state
/// when `CircuitScope::PerEndpointClass` is configured.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EndpointClass {
    /// Queries: projects, folders, test cases, attachments, field definitions.
    Read,
    /// Mutations: create/update/delete, attachment upload, trace links.
    Mutate,
    /// Token exchange and refresh.
    Auth,
}

/// One outbound request, fully described.
///
/// The resilient caller attaches the session token immediately before
/// execution; adapters treat `token` as opaque bearer material and never log it.
#[derive(Debug, Clone)]
pub struct ProviderCall {
    /// The operation being performed (same ids as the adapter's contracts).
    pub op: OperationId,
    /// Endpoint class for circuit sub-keying.
    pub endpoint_class: EndpointClass,
    /// Operation parameters (adapter-interpreted).
    pub params: serde_json::Value,
    /// Bearer token attached by the session layer.
    pub token: Option<String>,
}

impl ProviderCall {
    /// A read-class call.
    pub fn read(op: impl Into<OperationId>, params: serde_json::Value) -> Self {
        Self {
            op: op.into(),
            endpoint_class: EndpointClass::Read,
            params,
            token: None,
        }
    }

    /// A mutate-class call.
    pub fn mutate(op: impl Into<OperationId>, params: serde_json::Value) -> Self {
        Self {
            op: op.into(),
            endpoint_class: EndpointClass::Mutate,
            params,
            token: None,
        }
    }

    /// Attach a bearer token.
    #[must_use]
    pub fn with_token(mut self, token: impl Into<String>) -> Self {
        self.token = Some(token.into());
        self
    }
}

/// A provider adapter: identity, capabilities, contracts, and data operations.
///
/// Data operations are dispatched through [`call`](Self::call) by operation id
/// (`get_projects`, `get_folders`, `get_test_cases`, `get_test_case`,
/// `get_attachments`, `get_attachment_content`, `get_field_definitions`,
/// `create_folder`, `create_test_case`, `create_test_steps`,
/// `upload_attachment`, `create_trace_link`, `delete_test_case`, ...); the
/// adapter returns a data payload or a categorized [`CallError`].
#[async_trait]
pub trait ProviderAdapter: Send + Sync + std::fmt::Debug {
    /// Stable provider id (e.g. `qtest`, `zephyr`).
    fn id(&self) -> &str;

    /// Human-readable name.
    fn name(&self) -> &str;

    /// Adapter version.
    fn version(&self) -> &str;

    /// Capability set.
    fn capabilities(&self) -> Capabilities;

    /// Probe reachability and credentials.
    async fn test_connection(&self) -> ConnectionStatus;

    /// The operation-contract set this adapter exposes.
    fn api_contract(&self) -> Vec<OperationContract>;

    /// Exchange credentials for a session token.
    ///
    /// Called only by the session manager; adapters never cache tokens.
    async fn authenticate(
        &self,
        credentials: &Credentials,
    ) -> std::result::Result<SessionToken, CallError>;

    /// Execute one data operation. No internal retry.
    async fn call(&self, call: ProviderCall) -> std::result::Result<serde_json::Value, CallError>;
}

/// Startup-registered set of adapters. No runtime discovery.
#[derive(Debug, Default)]
pub struct ProviderRegistry {
    adapters: DashMap<String, Arc<dyn ProviderAdapter>>,
}

impl ProviderRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an adapter under its own id.
    pub fn register(&self, adapter: Arc<dyn ProviderAdapter>) -> Result<()> {
        let id = adapter.id().to_string();
        match self.adapters.entry(id.clone()) {
            dashmap::mapref::entry::Entry::Occupied(_) => Err(Error::DuplicateProvider(id)),
            dashmap::mapref::entry::Entry::Vacant(slot) => {
                slot.insert(adapter);
                Ok(())
            }
        }
    }

    /// Look up an adapter.
    pub fn get(&self, provider_id: &str) -> Result<Arc<dyn ProviderAdapter>> {
        self.adapters
            .get(provider_id)
            .map(|a| Arc::clone(a.value()))
            .ok_or_else(|| Error::UnknownProvider(provider_id.to_string()))
    }

    /// Registered provider ids, sorted.
    pub fn ids(&self) -> Vec<String> {
        let mut ids: Vec<_> = self.adapters.iter().map(|e| e.key().clone()).collect();
        ids.sort();
        ids
    }
}

//! Operation contracts.
//!
//! A provider adapter declares, per operation, what must run before it and
//! what it reads from the operation context. Contracts are static for the
//! lifetime of the adapter; the orchestrator combines the source's and
//! target's contract sets into one graph per run.

use std::collections::HashMap;
use std::fmt;

use dashmap::DashMap;
use serde::{Deserialize, Serialize};

/// Stable symbolic name of one operation, unique per provider.
///
/// Target-side operations are namespaced (`target:create_test_case`) when
/// combined with source operations so both providers can use the same names.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct OperationId(String);

impl OperationId {
    /// Create an operation id.
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    /// Prefix this id with a namespace, producing `ns:name`.
    #[must_use]
    pub fn namespaced(&self, ns: &str) -> Self {
        Self(format!("{ns}:{}", self.0))
    }

    /// The underlying name.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for OperationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for OperationId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for OperationId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

/// Static declaration of one operation's prerequisites and shape.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OperationContract {
    /// Operation identifier, unique within the provider.
    pub id: OperationId,

    /// Operations (same provider) that must complete before this one.
    #[serde(default)]
    pub depends_on: Vec<OperationId>,

    /// Whether a complete migration requires this operation to succeed.
    #[serde(default)]
    pub required: bool,

    /// Names of parameters this operation reads from the operation context.
    #[serde(default)]
    pub params: Vec<String>,

    /// Relative work units, used only for scheduling diagnostics.
    #[serde(default)]
    pub cost_hint: Option<u32>,

    /// Whether the operation mutates remote state (as opposed to a query).
    #[serde(default)]
    pub mutates: bool,
}

impl OperationContract {
    /// A contract with no dependencies, not required, non-mutating.
    pub fn new(id: impl Into<OperationId>) -> Self {
        Self {
            id: id.into(),
            depends_on: Vec::new(),
            required: false,
            params: Vec::new(),
            cost_hint: None,
            mutates: false,
        }
    }

    /// Declare prerequisite operations.
    #[must_use]
    pub fn depends_on<I, T>(mut self, deps: I) -> Self
    where
        I: IntoIterator<Item = T>,
        T: Into<OperationId>,
    {
        self.depends_on = deps.into_iter().map(Into::into).collect();
        self
    }

    /// Mark the operation as required for a complete migration.
    #[must_use]
    pub fn required(mut self) -> Self {
        self.required = true;
        self
    }

    /// Declare context parameters the operation reads.
    #[must_use]
    pub fn reads<I, S>(mut self, params: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.params = params.into_iter().map(Into::into).collect();
        self
    }

    /// Attach a relative cost hint.
    #[must_use]
    pub fn cost(mut self, units: u32) -> Self {
        self.cost_hint = Some(units);
        self
    }

    /// Mark the operation as a mutation.
    #[must_use]
    pub fn mutates(mut self) -> Self {
        self.mutates = true;
        self
    }

    /// Clone this contract with the id and every dependency namespaced.
    #[must_use]
    pub fn into_namespaced(self, ns: &str) -> Self {
        Self {
            id: self.id.namespaced(ns),
            depends_on: self.depends_on.iter().map(|d| d.namespaced(ns)).collect(),
            ..self
        }
    }
}

/// Per-provider store of operation contracts.
///
/// Populated at startup from each adapter's `api_contract()`; safe for
/// concurrent lookup during runs.
#[derive(Debug, Default)]
pub struct ContractRegistry {
    providers: DashMap<String, HashMap<OperationId, OperationContract>>,
}

impl ContractRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the contract set for a provider.
    pub fn register(&self, provider_id: &str, contracts: Vec<OperationContract>) {
        let map = contracts.into_iter().map(|c| (c.id.clone(), c)).collect();
        self.providers.insert(provider_id.to_string(), map);
    }

    /// Look up one contract.
    pub fn get(&self, provider_id: &str, op: &OperationId) -> Option<OperationContract> {
        self.providers
            .get(provider_id)
            .and_then(|m| m.get(op).cloned())
    }

    /// All contracts for a provider, in id order for determinism.
    pub fn contracts_for(&self, provider_id: &str) -> Vec<OperationContract> {
        let Some(map) = self.providers.get(provider_id) else {
            return Vec::new();
        };
        let mut contracts: Vec<_> = map.values().cloned().collect();
        contracts.sort_by(|a, b| a.id.cmp(&b.id));
        contracts
    }

    /// Combine a source provider's contracts with a target provider's.
    ///
    /// Source operations keep their ids; target operations (ids and their
    /// dependencies) are namespaced with `target:` so the two providers may
    /// share operation names without collision. Cross-provider edges are the
    /// orchestrator's business, not the registry's.
    pub fn combined(&self, source_provider: &str, target_provider: &str) -> Vec<OperationContract> {
        let mut contracts = self.contracts_for(source_provider);
        contracts.extend(
            self.contracts_for(target_provider)
                .into_iter()
                .map(|c| c.into_namespaced("target")),
        );
        contracts
    }
}

//! Execution plans.
//!
//! A plan is the validated, ordered form of a contract set: a deterministic
//! topological order plus the parallel-group partition the executor dispatches
//! layer by layer. Plans are immutable once built.

use std::collections::HashMap;

use crate::contract::{OperationContract, OperationId};
use crate::error::Result;
use crate::graph::DependencyGraph;

/// An ordered, layered sequence of operations for one run.
#[derive(Debug, Clone)]
pub struct ExecutionPlan {
    contracts: HashMap<OperationId, OperationContract>,
    ordered: Vec<OperationId>,
    layers: Vec<Vec<OperationId>>,
    graph: DependencyGraph,
}

impl ExecutionPlan {
    /// Build a plan covering every operation in the contract set.
    ///
    /// Fails at plan time on cycles or missing references.
    pub fn new(contracts: Vec<OperationContract>) -> Result<Self> {
        let graph = DependencyGraph::from_contracts(&contracts);
        graph.validate().into_result()?;
        let ordered = graph.topological_order()?;
        let layers = graph.parallel_layers()?;
        Ok(Self {
            contracts: contracts.into_iter().map(|c| (c.id.clone(), c)).collect(),
            ordered,
            layers,
            graph,
        })
    }

    /// Build the minimal plan sufficient to reach `goal`: only operations the
    /// goal transitively depends on (and the goal itself) are included.
    pub fn for_goal(contracts: Vec<OperationContract>, goal: &OperationId) -> Result<Self> {
        let full = DependencyGraph::from_contracts(&contracts);
        full.validate().into_result()?;
        let subset = full.minimal_subset(goal)?;
        let keep: Vec<OperationContract> = contracts
            .into_iter()
            .filter(|c| subset.contains(&c.id))
            .collect();
        Self::new(keep)
    }

    /// Operations in execution order.
    pub fn ordered(&self) -> &[OperationId] {
        &self.ordered
    }

    /// The parallel-group partition; operations within a group have no
    /// pairwise dependency and may be dispatched concurrently.
    pub fn layers(&self) -> &[Vec<OperationId>] {
        &self.layers
    }

    /// The contract for one planned operation.
    pub fn contract(&self, op: &OperationId) -> Option<&OperationContract> {
        self.contracts.get(op)
    }

    /// Whether a failure of this operation aborts the whole run.
    ///
    /// Operations present in the graph but lacking a contract (glue nodes)
    /// default to required.
    pub fn is_required(&self, op: &OperationId) -> bool {
        self.contracts.get(op).map_or(true, |c| c.required)
    }

    /// The underlying dependency graph (immutable after plan time).
    pub fn graph(&self) -> &DependencyGraph {
        &self.graph
    }

    /// Number of planned operations.
    pub fn len(&self) -> usize {
        self.ordered.len()
    }

    /// True when the plan contains no operations.
    pub fn is_empty(&self) -> bool {
        self.ordered.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Error;

    fn contracts() -> Vec<OperationContract> {
        vec![
            OperationContract::new("authenticate").required(),
            OperationContract::new("get_projects").depends_on(["authenticate"]).required(),
            OperationContract::new("get_modules")
                .depends_on(["authenticate", "get_projects"])
                .required(),
            OperationContract::new("get_test_cases")
                .depends_on(["authenticate", "get_projects", "get_modules"]),
            OperationContract::new("create_test_case").depends_on(["get_modules"]).mutates(),
            OperationContract::new("upload_attachment").depends_on(["create_test_case"]).mutates(),
        ]
    }

    #[test]
    fn plan_orders_every_dependency_before_its_dependent() {
        let plan = ExecutionPlan::new(contracts()).unwrap();
        let index: HashMap<_, _> = plan
            .ordered()
            .iter()
            .enumerate()
            .map(|(i, op)| (op.clone(), i))
            .collect();
        for op in plan.ordered() {
            let deps: Vec<_> = plan.graph().dependencies_of(op).cloned().collect();
            for dep in deps {
                assert!(index[&dep] < index[op], "{dep} must precede {op}");
            }
        }
    }

    #[test]
    fn goal_plan_is_minimal() {
        let plan = ExecutionPlan::for_goal(contracts(), &"upload_attachment".into()).unwrap();
        let names: Vec<_> = plan.ordered().iter().map(|o| o.as_str().to_string()).collect();
        assert_eq!(
            names,
            vec![
                "authenticate",
                "get_projects",
                "get_modules",
                "create_test_case",
                "upload_attachment"
            ]
        );
    }

    #[test]
    fn cyclic_contracts_fail_at_plan_time() {
        let cyclic = vec![
            OperationContract::new("A").depends_on(["B"]),
            OperationContract::new("B").depends_on(["C"]),
            OperationContract::new("C").depends_on(["A"]),
        ];
        assert!(matches!(
            ExecutionPlan::new(cyclic),
            Err(Error::CycleDetected { .. })
        ));
    }

    #[test]
    fn missing_reference_fails_at_plan_time() {
        let bad = vec![OperationContract::new("get_projects").depends_on(["authenticate"])];
        assert!(matches!(
            ExecutionPlan::new(bad),
            Err(Error::MissingReference { .. })
        ));
    }

    #[test]
    fn glue_nodes_default_to_required() {
        let plan = ExecutionPlan::new(contracts()).unwrap();
        assert!(plan.is_required(&"authenticate".into()));
        assert!(!plan.is_required(&"get_test_cases".into()));
        assert!(plan.is_required(&"not_in_contracts".into()));
    }
}

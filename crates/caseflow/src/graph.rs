// Copyright 2026 Dropbox (created by Andrew Yates <ayates@dropbox.com>)

//! Operation dependency graph.
//!
//! Nodes are operation identifiers; edges point from a dependency to its
//! dependent. The graph is immutable after plan time and supports:
//!
//! - cycle detection with a witness for diagnostics
//! - a deterministic topological order
//! - a layered partition for parallel dispatch
//! - reverse reachability for goal-directed minimal subsets
//! - Mermaid export for the dependency visualization endpoint
//!
//! Determinism: ties in the topological order are broken by fewer dependents
//! first, then lexicographically by identifier, so the same contract set
//! always produces the same plan.

use std::collections::{BTreeMap, BTreeSet};

use crate::contract::{OperationContract, OperationId};
use crate::error::{Error, Result};

/// Outcome of [`DependencyGraph::validate`].
#[derive(Debug, Clone, Default)]
pub struct ValidationReport {
    /// `(referenced_by, missing)` pairs for dependencies on undeclared operations.
    pub missing: Vec<(OperationId, OperationId)>,
    /// Nodes along a cycle (first repeated at the end), if any cycle exists.
    pub cycle: Option<Vec<OperationId>>,
}

impl ValidationReport {
    /// True when the graph has no missing references and no cycle.
    pub fn is_ok(&self) -> bool {
        self.missing.is_empty() && self.cycle.is_none()
    }

    /// Convert the first defect into an error, if any.
    pub fn into_result(self) -> Result<()> {
        if let Some(witness) = self.cycle {
            return Err(Error::CycleDetected {
                witness: witness.into_iter().map(|o| o.as_str().to_string()).collect(),
            });
        }
        if let Some((referenced_by, missing)) = self.missing.into_iter().next() {
            return Err(Error::MissingReference {
                missing: missing.as_str().to_string(),
                referenced_by: referenced_by.as_str().to_string(),
            });
        }
        Ok(())
    }
}

/// Directed acyclic graph of operations.
#[derive(Debug, Clone, Default)]
pub struct DependencyGraph {
    /// Operations declared via [`add_node`](Self::add_node) or a contract.
    declared: BTreeSet<OperationId>,
    /// dependency -> dependents (forward edges).
    dependents: BTreeMap<OperationId, BTreeSet<OperationId>>,
    /// dependent -> dependencies (reverse index, kept in lockstep).
    dependencies: BTreeMap<OperationId, BTreeSet<OperationId>>,
}

impl DependencyGraph {
    /// Create an empty graph.
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a graph from a contract set: one declared node per contract,
    /// one edge per declared dependency.
    pub fn from_contracts(contracts: &[OperationContract]) -> Self {
        let mut graph = Self::new();
        for contract in contracts {
            graph.add_node(contract.id.clone());
            for dep in &contract.depends_on {
                graph.add_edge(dep.clone(), contract.id.clone());
            }
        }
        graph
    }

    /// Declare a node. Idempotent.
    pub fn add_node(&mut self, op: impl Into<OperationId>) {
        let op = op.into();
        self.declared.insert(op.clone());
        self.dependents.entry(op.clone()).or_default();
        self.dependencies.entry(op).or_default();
    }

    /// Add an edge from a dependency to its dependent.
    ///
    /// Both endpoints are materialized as nodes if absent, but only
    /// [`add_node`](Self::add_node) (or a contract) marks a node declared;
    /// [`validate`](Self::validate) reports edges into undeclared nodes.
    pub fn add_edge(&mut self, from: impl Into<OperationId>, to: impl Into<OperationId>) {
        let from = from.into();
        let to = to.into();
        self.dependents.entry(from.clone()).or_default().insert(to.clone());
        self.dependencies.entry(to.clone()).or_default().insert(from.clone());
        self.dependents.entry(to).or_default();
        self.dependencies.entry(from).or_default();
    }

    /// All nodes, declared or referenced, in lexicographic order.
    pub fn nodes(&self) -> impl Iterator<Item = &OperationId> {
        self.dependents.keys()
    }

    /// Number of nodes.
    pub fn len(&self) -> usize {
        self.dependents.len()
    }

    /// True when the graph has no nodes.
    pub fn is_empty(&self) -> bool {
        self.dependents.is_empty()
    }

    /// Dependencies of one operation.
    pub fn dependencies_of(&self, op: &OperationId) -> impl Iterator<Item = &OperationId> {
        self.dependencies.get(op).into_iter().flatten()
    }

    /// Whether any cycle exists.
    pub fn has_cycle(&self) -> bool {
        self.find_cycle().is_some()
    }

    /// Find one cycle and return its witness: the nodes along the cycle in
    /// dependency order, with the first node repeated at the end
    /// (`[A, B, C, A]` for A→B→C→A).
    pub fn find_cycle(&self) -> Option<Vec<OperationId>> {
        #[derive(Clone, Copy, PartialEq)]
        enum Color {
            White,
            Gray,
            Black,
        }

        let mut color: BTreeMap<&OperationId, Color> =
            self.dependencies.keys().map(|k| (k, Color::White)).collect();
        let mut stack: Vec<&OperationId> = Vec::new();

        // Iterative DFS over the dependency direction (dependent -> its deps)
        // so the witness reads "A depends on B depends on ... depends on A".
        fn visit<'a>(
            node: &'a OperationId,
            deps: &'a BTreeMap<OperationId, BTreeSet<OperationId>>,
            color: &mut BTreeMap<&'a OperationId, Color>,
            stack: &mut Vec<&'a OperationId>,
        ) -> Option<Vec<OperationId>> {
            color.insert(node, Color::Gray);
            stack.push(node);
            for dep in deps.get(node).into_iter().flatten() {
                match color.get(dep).copied().unwrap_or(Color::White) {
                    Color::Gray => {
                        // Back edge: slice the stack from the first occurrence.
                        let start = stack.iter().position(|n| *n == dep).unwrap_or(0);
                        let mut witness: Vec<OperationId> =
                            stack[start..].iter().map(|n| (*n).clone()).collect();
                        witness.push(dep.clone());
                        return Some(witness);
                    }
                    Color::White => {
                        if let Some(w) = visit(dep, deps, color, stack) {
                            return Some(w);
                        }
                    }
                    Color::Black => {}
                }
            }
            stack.pop();
            color.insert(node, Color::Black);
            None
        }

        let keys: Vec<&OperationId> = self.dependencies.keys().collect();
        for node in keys {
            if color.get(node) == Some(&Color::White) {
                if let Some(witness) = visit(node, &self.dependencies, &mut color, &mut stack) {
                    return Some(witness);
                }
            }
        }
        None
    }

    /// Check that every referenced dependency is declared and that no cycle
    /// exists. Both defects are fatal at plan time.
    pub fn validate(&self) -> ValidationReport {
        let mut missing = Vec::new();
        for (dependent, deps) in &self.dependencies {
            for dep in deps {
                if !self.declared.contains(dep) {
                    missing.push((dependent.clone(), dep.clone()));
                }
            }
        }
        ValidationReport {
            missing,
            cycle: self.find_cycle(),
        }
    }

    /// Deterministic topological order: every dependency precedes its
    /// dependents; ties go to the node with fewer dependents, then to the
    /// lexicographically smaller identifier.
    pub fn topological_order(&self) -> Result<Vec<OperationId>> {
        if let Some(witness) = self.find_cycle() {
            return Err(Error::CycleDetected {
                witness: witness.into_iter().map(|o| o.as_str().to_string()).collect(),
            });
        }

        let mut remaining: BTreeMap<&OperationId, usize> = self
            .dependencies
            .iter()
            .map(|(op, deps)| (op, deps.len()))
            .collect();
        let mut order = Vec::with_capacity(remaining.len());

        while !remaining.is_empty() {
            // Kahn's algorithm with a full scan per step: plans are small
            // (tens of operations) and the scan keeps the tie-break exact.
            let next = remaining
                .iter()
                .filter(|(_, indegree)| **indegree == 0)
                .map(|(op, _)| *op)
                .min_by_key(|op| (self.dependents.get(*op).map_or(0, BTreeSet::len), (*op).clone()));

            let Some(next) = next else {
                // Unreachable: a node with no ready candidate implies a cycle,
                // which was rejected above.
                return Err(Error::CycleDetected { witness: Vec::new() });
            };

            remaining.remove(next);
            for dependent in self.dependents.get(next).into_iter().flatten() {
                if let Some(indegree) = remaining.get_mut(dependent) {
                    *indegree -= 1;
                }
            }
            order.push(next.clone());
        }

        Ok(order)
    }

    /// Minimum layering for parallel dispatch: group 0 is every node with no
    /// dependencies; group k+1 is every node all of whose dependencies are in
    /// groups 0..=k. Nodes within a group have no pairwise path.
    pub fn parallel_layers(&self) -> Result<Vec<Vec<OperationId>>> {
        if let Some(witness) = self.find_cycle() {
            return Err(Error::CycleDetected {
                witness: witness.into_iter().map(|o| o.as_str().to_string()).collect(),
            });
        }

        let mut depth: BTreeMap<OperationId, usize> = BTreeMap::new();
        for op in self.topological_order()? {
            let d = self
                .dependencies
                .get(&op)
                .into_iter()
                .flatten()
                .map(|dep| depth.get(dep).copied().unwrap_or(0) + 1)
                .max()
                .unwrap_or(0);
            depth.insert(op, d);
        }

        let max_depth = depth.values().copied().max().unwrap_or(0);
        let mut layers: Vec<Vec<OperationId>> =
            vec![Vec::new(); if self.is_empty() { 0 } else { max_depth + 1 }];
        for (op, d) in depth {
            layers[d].push(op);
        }
        for layer in &mut layers {
            layer.sort_by_key(|op| (self.dependents.get(op).map_or(0, BTreeSet::len), op.clone()));
        }
        Ok(layers)
    }

    /// Every operation reachable by walking dependencies backward from the
    /// goal, in topological order. The goal itself is included.
    pub fn minimal_subset(&self, goal: &OperationId) -> Result<Vec<OperationId>> {
        if !self.dependencies.contains_key(goal) {
            return Err(Error::MissingReference {
                missing: goal.as_str().to_string(),
                referenced_by: "<goal>".to_string(),
            });
        }

        let mut needed: BTreeSet<&OperationId> = BTreeSet::new();
        let mut frontier = vec![goal];
        while let Some(op) = frontier.pop() {
            let (op, deps) = match self.dependencies.get_key_value(op) {
                Some(entry) => entry,
                None => continue,
            };
            if needed.insert(op) {
                frontier.extend(deps.iter());
            }
        }

        Ok(self
            .topological_order()?
            .into_iter()
            .filter(|op| needed.contains(op))
            .collect())
    }

    /// Export the graph as a Mermaid `graph TD` diagram.
    pub fn to_mermaid(&self) -> String {
        let mut out = String::from("graph TD\n");
        for op in self.dependents.keys() {
            if self.dependencies.get(op).map_or(true, BTreeSet::is_empty)
                && self.dependents.get(op).map_or(true, BTreeSet::is_empty)
            {
                out.push_str(&format!("    {}\n", mermaid_id(op)));
            }
        }
        for (from, tos) in &self.dependents {
            for to in tos {
                out.push_str(&format!("    {} --> {}\n", mermaid_id(from), mermaid_id(to)));
            }
        }
        out
    }
}

/// Mermaid node ids cannot contain `:`; the `target:` namespace uses `__`.
fn mermaid_id(op: &OperationId) -> String {
    op.as_str().replace(':', "__")
}

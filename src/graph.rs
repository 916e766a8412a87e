use std::collections::{BinaryHeap, HashMap};

use anyhow::{bail, Result};
use petgraph::graph::{DiGraph, NodeIndex};
use petgraph::Direction;
use tracing::debug;

use crate::store::models::{Action, DeploymentKey, StepErrorKind};

/// Runtime status of a step.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepStatus {
    Pending,
    Skipped,
    Ongoing,
    Completed,
    Failed,
}

/// Per-step bookkeeping carried on each graph node.
#[derive(Debug, Clone)]
pub struct StepDetails {
    pub action: Action,
    /// True if the step is out of the CLI scope filters or needs no action.
    pub skip: bool,
    pub status: StepStatus,
    pub nb_attempts: u32,
    pub max_attempts: u32,
    pub delay_secs: u64,
    pub result: String,
    pub detailed_results: Option<serde_json::Value>,
    pub made_changes: bool,
    pub error: Option<StepErrorKind>,
}

impl StepDetails {
    fn new(action: Action, skip: bool, max_attempts: u32, delay_secs: u64) -> Self {
        Self {
            action,
            skip,
            status: StepStatus::Pending,
            nb_attempts: 0,
            max_attempts,
            delay_secs,
            result: String::new(),
            detailed_results: None,
            made_changes: false,
            error: None,
        }
    }
}

#[derive(Debug)]
struct StepNode {
    key: DeploymentKey,
    details: StepDetails,
}

/// The deployment graph: one node per step, edges from dependency to
/// dependent. Edge weight records whether the dependency comes from
/// `VariablesFromOutputs` (which prevails when a pair is referenced both
/// ways).
#[derive(Debug)]
pub struct DeploymentGraph {
    graph: DiGraph<StepNode, bool>,
    nodes: HashMap<DeploymentKey, NodeIndex>,
}

impl Default for DeploymentGraph {
    fn default() -> Self {
        Self::new()
    }
}

impl DeploymentGraph {
    pub fn new() -> Self {
        Self {
            graph: DiGraph::new(),
            nodes: HashMap::new(),
        }
    }

    pub fn add_step(
        &mut self,
        key: DeploymentKey,
        action: Action,
        skip: bool,
        max_attempts: u32,
        delay_secs: u64,
    ) {
        let details = StepDetails::new(action, skip, max_attempts, delay_secs);
        let index = self.graph.add_node(StepNode {
            key: key.clone(),
            details,
        });
        self.nodes.insert(key, index);
    }

    /// Record that `to_key` depends on `from_key`. A reference to a key with
    /// no step is fatal unless the dependent is a Destroy step (nothing to
    /// wait for) or the reference carries `IgnoreIfNotExists`.
    pub fn add_dependency(
        &mut self,
        from_key: &DeploymentKey,
        to_key: &DeploymentKey,
        is_var: bool,
        ignore_if_not_exists: bool,
    ) -> Result<()> {
        let to_index = self.nodes[to_key];
        let Some(&from_index) = self.nodes.get(from_key) else {
            if self.graph[to_index].details.action == Action::Destroy || ignore_if_not_exists {
                return Ok(());
            }
            bail!(
                "UnmetDependencyMissing: {} depends on {} which does not exist",
                to_key,
                from_key
            );
        };
        match self.graph.find_edge(from_index, to_index) {
            Some(edge) => {
                // `VariablesFromOutputs` prevails over `Dependencies`.
                let weight = self.graph.edge_weight_mut(edge).unwrap();
                *weight = *weight || is_var;
            }
            None => {
                self.graph.add_edge(from_index, to_index, is_var);
            }
        }
        Ok(())
    }

    /// Validate the graph against the planned action mix and make the
    /// initial status changes.
    pub fn validate(&mut self) -> Result<()> {
        self.check_for_cycles()?;
        self.check_creatable()?;
        self.check_destroyable()?;
        self.propagate_conditional_update();
        self.set_skipped_statuses();
        debug!(
            steps = self.graph.node_count(),
            dependencies = self.graph.edge_count(),
            "The deployment graph is valid"
        );
        Ok(())
    }

    fn check_for_cycles(&self) -> Result<()> {
        let components = petgraph::algo::tarjan_scc(&self.graph);
        let mut cycles = Vec::new();
        for component in components {
            if component.len() > 1 {
                let mut keys: Vec<String> = component
                    .iter()
                    .map(|&index| self.graph[index].key.to_string())
                    .collect();
                keys.sort();
                cycles.push(keys.join(">"));
            } else if let Some(&index) = component.first() {
                if self.graph.find_edge(index, index).is_some() {
                    cycles.push(self.graph[index].key.to_string());
                }
            }
        }
        if !cycles.is_empty() {
            bail!(
                "The package contains circular dependencies: {}",
                cycles.join(" and ")
            );
        }
        Ok(())
    }

    /// Steps with pending changes can only run once their dependencies
    /// exist: a dependency scheduled for destruction, or a Create skipped
    /// out of scope, is fatal.
    fn check_creatable(&self) -> Result<()> {
        for to_index in self.graph.node_indices() {
            let to = &self.graph[to_index];
            let applies = matches!(
                to.details.action,
                Action::Create | Action::Update | Action::ConditionalUpdate
            );
            if !applies || to.details.skip {
                continue;
            }
            for from_index in self.graph.neighbors_directed(to_index, Direction::Incoming) {
                let from = &self.graph[from_index];
                if from.details.action == Action::Destroy && !from.details.skip {
                    bail!(
                        "DependencyScheduledForDestroy: {} depends on {} which will be destroyed during this run",
                        to.key,
                        from.key
                    );
                }
                if from.details.action == Action::Create && from.details.skip {
                    bail!(
                        "UnmetDependencyMissing: {} depends on {} which has not been created and will not be created during this run",
                        to.key,
                        from.key
                    );
                }
            }
        }
        Ok(())
    }

    /// A deployment can only be destroyed once nothing depends on it
    /// anymore: every dependent must either be destroyed in this run or
    /// never have existed.
    fn check_destroyable(&self) -> Result<()> {
        for from_index in self.graph.node_indices() {
            let from = &self.graph[from_index];
            if from.details.action != Action::Destroy || from.details.skip {
                continue;
            }
            for to_index in self.graph.neighbors_directed(from_index, Direction::Outgoing) {
                let to = &self.graph[to_index];
                let never_existed = to.details.action == Action::Create && to.details.skip;
                let destroyed_too = to.details.action == Action::Destroy && !to.details.skip;
                if !never_existed && !destroyed_too {
                    bail!(
                        "DependentRemainsAfterDestroy: {} cannot be destroyed because {} still depends on it after this run",
                        from.key,
                        to.key
                    );
                }
            }
        }
        Ok(())
    }

    /// When A reads the outputs of B and B may change, A may need an update
    /// if those output values drift. Repeat until the propagation reaches a
    /// fixpoint.
    fn propagate_conditional_update(&mut self) {
        loop {
            let mut changes = Vec::new();
            for edge in self.graph.edge_indices() {
                if !self.graph[edge] {
                    continue;
                }
                let (from_index, to_index) = self.graph.edge_endpoints(edge).unwrap();
                let from_action = self.graph[from_index].details.action;
                let to_action = self.graph[to_index].details.action;
                if matches!(from_action, Action::Update | Action::ConditionalUpdate)
                    && to_action == Action::NoChange
                {
                    changes.push(to_index);
                }
            }
            if changes.is_empty() {
                break;
            }
            for index in changes {
                self.graph[index].details.action = Action::ConditionalUpdate;
            }
        }
    }

    fn set_skipped_statuses(&mut self) {
        for index in self.graph.node_indices() {
            let details = &mut self.graph[index].details;
            if details.action == Action::NoChange || details.skip {
                details.status = StepStatus::Skipped;
            }
        }
    }

    // ─── Accessors ──────────────────────────────────────────────────────────

    pub fn contains(&self, key: &DeploymentKey) -> bool {
        self.nodes.contains_key(key)
    }

    pub fn details(&self, key: &DeploymentKey) -> &StepDetails {
        &self.graph[self.nodes[key]].details
    }

    pub fn details_mut(&mut self, key: &DeploymentKey) -> &mut StepDetails {
        let index = self.nodes[key];
        &mut self.graph[index].details
    }

    pub fn steps(&self) -> impl Iterator<Item = (&DeploymentKey, &StepDetails)> {
        self.graph
            .node_indices()
            .map(move |index| (&self.graph[index].key, &self.graph[index].details))
    }

    /// Keys whose outputs (or existence) this step depends on.
    pub fn predecessors(&self, key: &DeploymentKey) -> Vec<DeploymentKey> {
        self.graph
            .neighbors_directed(self.nodes[key], Direction::Incoming)
            .map(|index| self.graph[index].key.clone())
            .collect()
    }

    /// Keys that depend on this step.
    pub fn successors(&self, key: &DeploymentKey) -> Vec<DeploymentKey> {
        self.graph
            .neighbors_directed(self.nodes[key], Direction::Outgoing)
            .map(|index| self.graph[index].key.clone())
            .collect()
    }

    /// The steps that must reach a terminal state before this one may run.
    /// Creates and updates wait for their dependencies; a destroy waits for
    /// its dependents, which must disappear first.
    pub fn scheduling_predecessors(&self, key: &DeploymentKey) -> Vec<DeploymentKey> {
        if self.details(key).action == Action::Destroy {
            self.successors(key)
        } else {
            self.predecessors(key)
        }
    }

    /// Inverse of `scheduling_predecessors`: the steps whose readiness may
    /// change when this one reaches a terminal state.
    pub fn scheduling_successors(&self, key: &DeploymentKey) -> Vec<DeploymentKey> {
        let mut result = Vec::new();
        for candidate in self.successors(key) {
            if self.details(&candidate).action != Action::Destroy {
                result.push(candidate);
            }
        }
        for candidate in self.predecessors(key) {
            if self.details(&candidate).action == Action::Destroy {
                result.push(candidate);
            }
        }
        result
    }

    /// True if at least one dependency of this step has pending changes:
    /// a create or destroy, or an update that turned out to make changes.
    /// Dependencies reconciled to NoChange never count.
    pub fn has_upstream_pending_changes(&self, key: &DeploymentKey) -> bool {
        self.graph
            .neighbors_directed(self.nodes[key], Direction::Incoming)
            .any(|index| {
                let details = &self.graph[index].details;
                !details.skip
                    && (matches!(details.action, Action::Create | Action::Destroy)
                        || (matches!(
                            details.action,
                            Action::Update | Action::ConditionalUpdate
                        ) && details.made_changes))
            })
    }

    /// Deterministic topological order: ready keys are emitted in
    /// lexicographic order. Used for reproducibility; the scheduler itself
    /// is event-driven.
    pub fn topological_order(&self) -> Vec<DeploymentKey> {
        let mut in_degree: HashMap<NodeIndex, usize> = self
            .graph
            .node_indices()
            .map(|index| {
                (
                    index,
                    self.graph
                        .neighbors_directed(index, Direction::Incoming)
                        .count(),
                )
            })
            .collect();
        let mut heap: BinaryHeap<std::cmp::Reverse<(DeploymentKey, NodeIndex)>> = in_degree
            .iter()
            .filter(|(_, &degree)| degree == 0)
            .map(|(&index, _)| std::cmp::Reverse((self.graph[index].key.clone(), index)))
            .collect();
        let mut order = Vec::with_capacity(self.graph.node_count());
        while let Some(std::cmp::Reverse((key, index))) = heap.pop() {
            order.push(key);
            for next in self.graph.neighbors_directed(index, Direction::Outgoing) {
                let degree = in_degree.get_mut(&next).unwrap();
                *degree -= 1;
                if *degree == 0 {
                    heap.push(std::cmp::Reverse((self.graph[next].key.clone(), next)));
                }
            }
        }
        order
    }

    pub fn node_count(&self) -> usize {
        self.graph.node_count()
    }
}

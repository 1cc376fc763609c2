//! Stage scheduler: orders stacks into sequential stages and parallel waves.
//!
//! Without explicit stages every Kahn layer becomes its own stage. With
//! explicit stages, each declared stage is a hard barrier and layering only
//! partitions its members into waves.

use crate::dag::builder::{DagBuilder, StackGraph, StackIndex};
use crate::errors::GraphError;
use crate::stack::Stack;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;

/// A set of mutually independent stacks, eligible for parallel execution.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Wave {
    pub name: String,
    pub members: Vec<String>,
}

/// A sequential step of the pipeline.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Stage {
    pub name: String,
    pub waves: Vec<Wave>,
}

impl Stage {
    /// Every stack in the stage, wave by wave.
    pub fn stacks(&self) -> impl Iterator<Item = &str> {
        self.waves
            .iter()
            .flat_map(|w| w.members.iter().map(String::as_str))
    }
}

/// An operator-declared stage boundary.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExplicitStage {
    pub name: String,
    pub members: Vec<String>,
    /// Run members one at a time even when independent.
    #[serde(default)]
    pub sequential: bool,
}

impl ExplicitStage {
    pub fn new<I, S>(name: impl Into<String>, members: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            name: name.into(),
            members: members.into_iter().map(Into::into).collect(),
            sequential: false,
        }
    }

    pub fn sequential(mut self) -> Self {
        self.sequential = true;
        self
    }
}

/// Status of a stack during a run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum StackStatus {
    /// Stack is waiting to run
    #[default]
    Pending,
    /// Stack is being provisioned
    Running,
    /// Stack provisioned and resolved its handles
    Completed,
    /// Provisioning failed
    Failed { error: String },
    /// Not run because its stage, or an earlier one, failed
    Skipped,
}

impl StackStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed { .. } | Self::Skipped)
    }

    pub fn is_success(&self) -> bool {
        matches!(self, Self::Completed)
    }
}

/// A stack in the graph with its current status.
#[derive(Debug, Clone)]
pub struct StackNode {
    pub stack: Arc<Stack>,
    pub status: StackStatus,
    pub index: StackIndex,
}

impl StackNode {
    pub fn new(stack: Arc<Stack>, index: StackIndex) -> Self {
        Self {
            stack,
            status: StackStatus::Pending,
            index,
        }
    }
}

/// Plans stages over a validated stack graph and tracks stack status.
#[derive(Debug)]
pub struct StageScheduler {
    graph: StackGraph,
    nodes: Vec<StackNode>,
}

impl StageScheduler {
    /// Validate the stacks and build the dependency graph.
    pub fn from_stacks(stacks: Vec<Arc<Stack>>) -> Result<Self, GraphError> {
        let graph = DagBuilder::new(stacks).build()?;

        let nodes = graph
            .stacks()
            .iter()
            .enumerate()
            .map(|(i, s)| StackNode::new(s.clone(), i))
            .collect();

        Ok(Self { graph, nodes })
    }

    pub fn stack_count(&self) -> usize {
        self.graph.len()
    }

    pub fn graph(&self) -> &StackGraph {
        &self.graph
    }

    pub fn stack(&self, name: &str) -> Option<&Arc<Stack>> {
        self.graph.get_stack_by_name(name)
    }

    pub fn get_node(&self, name: &str) -> Option<&StackNode> {
        self.graph.get_index(name).and_then(|i| self.nodes.get(i))
    }

    fn get_node_mut(&mut self, name: &str) -> Option<&mut StackNode> {
        let index = self.graph.get_index(name)?;
        self.nodes.get_mut(index)
    }

    pub fn nodes(&self) -> &[StackNode] {
        &self.nodes
    }

    /// Kahn layering over the whole graph, ties kept in declaration order.
    pub fn compute_waves(&self) -> Result<Vec<Vec<String>>, GraphError> {
        let members: Vec<StackIndex> = (0..self.graph.len()).collect();
        let layers = self.layer(&members, &HashSet::new())?;
        Ok(layers.into_iter().map(|l| self.names(&l)).collect())
    }

    /// Order the stacks into stages.
    ///
    /// With no explicit stages, each layer is one stage holding one wave.
    /// Otherwise every stack must belong to exactly one explicit stage and may
    /// only depend on stacks of the same or an earlier stage.
    pub fn plan(&self, explicit: &[ExplicitStage]) -> Result<Vec<Stage>, GraphError> {
        if explicit.is_empty() {
            return Ok(self
                .compute_waves()?
                .into_iter()
                .enumerate()
                .map(|(i, members)| {
                    let name = format!("stage-{}", i + 1);
                    Stage {
                        waves: vec![Wave {
                            name: format!("{}-wave-1", name),
                            members,
                        }],
                        name,
                    }
                })
                .collect());
        }

        let assignment = self.assign(explicit)?;

        for index in 0..self.graph.len() {
            let stage = assignment[&index];
            for &dep in self.graph.dependencies(index) {
                if assignment[&dep] > stage {
                    return Err(GraphError::StageOrderViolation {
                        stack: self.name(index),
                        dependency: self.name(dep),
                    });
                }
            }
        }

        let mut placed: HashSet<StackIndex> = HashSet::new();
        let mut stages = Vec::with_capacity(explicit.len());

        for (position, declared) in explicit.iter().enumerate() {
            let mut members: Vec<StackIndex> = assignment
                .iter()
                .filter(|&(_, &stage)| stage == position)
                .map(|(&index, _)| index)
                .collect();
            members.sort_unstable();

            let mut layers = self.layer(&members, &placed)?;
            if declared.sequential {
                layers = layers.into_iter().flatten().map(|i| vec![i]).collect();
            }

            let waves = layers
                .iter()
                .enumerate()
                .map(|(j, layer)| Wave {
                    name: format!("{}-wave-{}", declared.name, j + 1),
                    members: self.names(layer),
                })
                .collect();

            placed.extend(members);
            stages.push(Stage {
                name: declared.name.clone(),
                waves,
            });
        }

        Ok(stages)
    }

    /// Map every stack to the position of its explicit stage.
    fn assign(&self, explicit: &[ExplicitStage]) -> Result<HashMap<StackIndex, usize>, GraphError> {
        let mut assignment = HashMap::new();
        for (position, declared) in explicit.iter().enumerate() {
            for member in &declared.members {
                let index = self.graph.get_index(member).ok_or_else(|| {
                    GraphError::UnknownStageMember {
                        stage: declared.name.clone(),
                        stack: member.clone(),
                    }
                })?;
                if assignment.insert(index, position).is_some() {
                    return Err(GraphError::DuplicateStageMember {
                        stack: member.clone(),
                    });
                }
            }
        }

        if let Some(unassigned) = (0..self.graph.len()).find(|i| !assignment.contains_key(i)) {
            return Err(GraphError::UnassignedStack {
                stack: self.name(unassigned),
            });
        }

        Ok(assignment)
    }

    /// Repeatedly extract the members whose dependencies are all placed.
    fn layer(
        &self,
        members: &[StackIndex],
        already_placed: &HashSet<StackIndex>,
    ) -> Result<Vec<Vec<StackIndex>>, GraphError> {
        let mut placed = already_placed.clone();
        let mut remaining: Vec<StackIndex> = members.to_vec();
        let mut layers = Vec::new();

        while !remaining.is_empty() {
            let ready: Vec<StackIndex> = remaining
                .iter()
                .copied()
                .filter(|&i| self.graph.dependencies_satisfied(i, &placed))
                .collect();

            if ready.is_empty() {
                return Err(GraphError::DependencyCycle {
                    stacks: self.names(&remaining),
                });
            }

            remaining.retain(|i| !ready.contains(i));
            placed.extend(ready.iter().copied());
            layers.push(ready);
        }

        Ok(layers)
    }

    fn name(&self, index: StackIndex) -> String {
        self.graph
            .get_stack(index)
            .map(|s| s.name().to_string())
            .unwrap_or_default()
    }

    fn names(&self, indices: &[StackIndex]) -> Vec<String> {
        indices.iter().map(|&i| self.name(i)).collect()
    }

    pub fn mark_running(&mut self, name: &str) {
        if let Some(node) = self.get_node_mut(name) {
            node.status = StackStatus::Running;
        }
    }

    pub fn mark_completed(&mut self, name: &str) {
        if let Some(node) = self.get_node_mut(name) {
            node.status = StackStatus::Completed;
        }
    }

    pub fn mark_failed(&mut self, name: &str, error: &str) {
        if let Some(node) = self.get_node_mut(name) {
            node.status = StackStatus::Failed {
                error: error.to_string(),
            };
        }
    }

    pub fn mark_skipped(&mut self, name: &str) {
        if let Some(node) = self.get_node_mut(name)
            && !node.status.is_terminal()
        {
            node.status = StackStatus::Skipped;
        }
    }

    pub fn is_completed(&self, name: &str) -> bool {
        self.get_node(name).is_some_and(|n| n.status.is_success())
    }

    pub fn all_complete(&self) -> bool {
        self.nodes.iter().all(|n| n.status.is_terminal())
    }

    pub fn all_success(&self) -> bool {
        self.nodes.iter().all(|n| n.status.is_success())
    }

    pub fn completed_count(&self) -> usize {
        self.nodes.iter().filter(|n| n.status.is_success()).count()
    }

    pub fn completion_percentage(&self) -> f64 {
        if self.nodes.is_empty() {
            return 100.0;
        }
        let terminal = self.nodes.iter().filter(|n| n.status.is_terminal()).count();
        (terminal as f64 / self.nodes.len() as f64) * 100.0
    }
}

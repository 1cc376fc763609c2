//! DAG builder for constructing dependency graphs from stacks.
//!
//! Edges are derived from consumption: a stack that consumes a handle
//! depends on the stack producing it. Nothing about nesting or declaration
//! scope is implied; the graph is validated before any execution.

use crate::errors::GraphError;
use crate::stack::Stack;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;

/// Index into the stack list (declaration order).
pub type StackIndex = usize;

/// A directed acyclic graph of stacks.
#[derive(Debug)]
pub struct StackGraph {
    /// Stacks in declaration order
    stacks: Vec<Arc<Stack>>,
    /// Map from stack name to index
    index_map: HashMap<String, StackIndex>,
    /// Forward edges: index -> stacks that consume from it
    forward_edges: Vec<Vec<StackIndex>>,
    /// Reverse edges: index -> stacks it consumes from
    reverse_edges: Vec<Vec<StackIndex>>,
}

impl StackGraph {
    pub fn len(&self) -> usize {
        self.stacks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.stacks.is_empty()
    }

    pub fn get_stack(&self, index: StackIndex) -> Option<&Arc<Stack>> {
        self.stacks.get(index)
    }

    pub fn get_stack_by_name(&self, name: &str) -> Option<&Arc<Stack>> {
        self.index_map.get(name).and_then(|&i| self.stacks.get(i))
    }

    pub fn get_index(&self, name: &str) -> Option<StackIndex> {
        self.index_map.get(name).copied()
    }

    pub fn stacks(&self) -> &[Arc<Stack>] {
        &self.stacks
    }

    /// Stacks that consume from the given stack.
    pub fn dependents(&self, index: StackIndex) -> &[StackIndex] {
        self.forward_edges.get(index).map_or(&[], |v| v.as_slice())
    }

    /// Stacks the given stack consumes from.
    pub fn dependencies(&self, index: StackIndex) -> &[StackIndex] {
        self.reverse_edges.get(index).map_or(&[], |v| v.as_slice())
    }

    /// Stacks with no dependencies.
    pub fn root_stacks(&self) -> Vec<StackIndex> {
        self.reverse_edges
            .iter()
            .enumerate()
            .filter(|(_, deps)| deps.is_empty())
            .map(|(i, _)| i)
            .collect()
    }

    /// Stacks nothing consumes from.
    pub fn leaf_stacks(&self) -> Vec<StackIndex> {
        self.forward_edges
            .iter()
            .enumerate()
            .filter(|(_, deps)| deps.is_empty())
            .map(|(i, _)| i)
            .collect()
    }

    pub fn dependencies_satisfied(&self, index: StackIndex, placed: &HashSet<StackIndex>) -> bool {
        self.dependencies(index)
            .iter()
            .all(|dep| placed.contains(dep))
    }
}

/// Builder for constructing stack graphs.
pub struct DagBuilder {
    stacks: Vec<Arc<Stack>>,
}

impl DagBuilder {
    pub fn new(stacks: Vec<Arc<Stack>>) -> Self {
        Self { stacks }
    }

    /// Build the stack graph.
    ///
    /// This validates the graph structure:
    /// - Stack names and produced handle ids are unique
    /// - Every consumed handle has a producer in the set
    /// - No cycles, including a stack consuming its own handle
    pub fn build(self) -> Result<StackGraph, GraphError> {
        let mut index_map = HashMap::new();
        for (i, stack) in self.stacks.iter().enumerate() {
            if index_map.insert(stack.name().to_string(), i).is_some() {
                return Err(GraphError::DuplicateStack(stack.name().to_string()));
            }
        }

        let mut producers: HashMap<&str, StackIndex> = HashMap::new();
        for (i, stack) in self.stacks.iter().enumerate() {
            for handle in stack.produced() {
                if let Some(&first) = producers.get(handle.id()) {
                    return Err(GraphError::DuplicateProducer {
                        handle: handle.id().to_string(),
                        first: self.stacks[first].name().to_string(),
                        second: stack.name().to_string(),
                    });
                }
                producers.insert(handle.id(), i);
            }
        }

        let mut forward_edges: Vec<Vec<StackIndex>> = vec![Vec::new(); self.stacks.len()];
        let mut reverse_edges: Vec<Vec<StackIndex>> = vec![Vec::new(); self.stacks.len()];

        for (to_idx, stack) in self.stacks.iter().enumerate() {
            for handle in stack.consumed() {
                let from_idx = *producers
                    .get(handle.id())
                    .ok_or_else(|| GraphError::UnknownProducer {
                        stack: stack.name().to_string(),
                        handle: handle.id().to_string(),
                    })?;

                // Several handles from one producer collapse into one edge
                if !reverse_edges[to_idx].contains(&from_idx) {
                    forward_edges[from_idx].push(to_idx);
                    reverse_edges[to_idx].push(from_idx);
                }
            }
        }

        let graph = StackGraph {
            stacks: self.stacks,
            index_map,
            forward_edges,
            reverse_edges,
        };

        Self::validate_no_cycles(&graph)?;

        Ok(graph)
    }

    /// Validate that the graph has no cycles using Kahn's algorithm.
    fn validate_no_cycles(graph: &StackGraph) -> Result<(), GraphError> {
        let mut in_degree: Vec<usize> = graph.reverse_edges.iter().map(|deps| deps.len()).collect();

        let mut queue: Vec<StackIndex> = in_degree
            .iter()
            .enumerate()
            .filter(|&(_, deg)| *deg == 0)
            .map(|(i, _)| i)
            .collect();

        let mut processed = 0;

        while let Some(node) = queue.pop() {
            processed += 1;

            for &dependent in graph.dependents(node) {
                in_degree[dependent] -= 1;
                if in_degree[dependent] == 0 {
                    queue.push(dependent);
                }
            }
        }

        if processed != graph.len() {
            let stacks: Vec<String> = in_degree
                .iter()
                .enumerate()
                .filter(|&(_, deg)| *deg > 0)
                .filter_map(|(i, _)| graph.get_stack(i).map(|s| s.name().to_string()))
                .collect();

            return Err(GraphError::DependencyCycle { stacks });
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::resource::{ResourceHandle, ResourceKind};

    /// Stack `name` producing `produces` and consuming handles named in `consumes`.
    fn stack(name: &str, produces: &[&str], consumes: &[&str]) -> Arc<Stack> {
        let mut s = Stack::new(name, "us-east-1", "123456789012");
        for id in produces {
            s.declare_produced(ResourceHandle::create(ResourceKind::Table, *id));
        }
        for id in consumes {
            s.declare_consumed(ResourceHandle::create(ResourceKind::Table, *id));
        }
        Arc::new(s)
    }

    #[test]
    fn test_build_simple_graph() {
        let stacks = vec![
            stack("api", &["api-out"], &[]),
            stack("dynamo", &["orders"], &["api-out"]),
            stack("bucket", &["assets"], &["api-out"]),
            stack("permission", &["role"], &["orders", "assets"]),
        ];

        let graph = DagBuilder::new(stacks).build().unwrap();

        assert_eq!(graph.len(), 4);
        assert_eq!(graph.root_stacks(), vec![0]);
        assert_eq!(graph.leaf_stacks(), vec![3]);
        assert_eq!(graph.dependencies(3), &[1, 2]);
        assert!(graph.dependents(0).contains(&1));
        assert!(graph.dependents(0).contains(&2));
    }

    #[test]
    fn test_multiple_handles_from_one_producer_make_one_edge() {
        let stacks = vec![
            stack("dynamo", &["orders", "products"], &[]),
            stack("permission", &[], &["orders", "products"]),
        ];

        let graph = DagBuilder::new(stacks).build().unwrap();
        assert_eq!(graph.dependencies(1), &[0]);
        assert_eq!(graph.dependents(0), &[1]);
    }

    #[test]
    fn test_mutual_reference_is_a_cycle() {
        let stacks = vec![stack("a", &["a-out"], &["b-out"]), stack("b", &["b-out"], &["a-out"])];

        let err = DagBuilder::new(stacks).build().unwrap_err();
        assert_eq!(
            err,
            GraphError::DependencyCycle {
                stacks: vec!["a".to_string(), "b".to_string()]
            }
        );
    }

    #[test]
    fn test_self_reference_is_a_cycle() {
        let stacks = vec![stack("a", &["a-out"], &["a-out"])];
        let err = DagBuilder::new(stacks).build().unwrap_err();
        assert!(matches!(err, GraphError::DependencyCycle { .. }));
    }

    #[test]
    fn test_unknown_producer() {
        let stacks = vec![stack("a", &[], &["nonexistent"])];

        let err = DagBuilder::new(stacks).build().unwrap_err();
        assert!(err.to_string().contains("nonexistent"));
        assert!(matches!(err, GraphError::UnknownProducer { .. }));
    }

    #[test]
    fn test_duplicate_stack_name() {
        let stacks = vec![stack("a", &[], &[]), stack("a", &[], &[])];
        let err = DagBuilder::new(stacks).build().unwrap_err();
        assert_eq!(err, GraphError::DuplicateStack("a".to_string()));
    }

    #[test]
    fn test_duplicate_producer() {
        let stacks = vec![stack("a", &["shared"], &[]), stack("b", &["shared"], &[])];
        let err = DagBuilder::new(stacks).build().unwrap_err();
        assert!(matches!(
            err,
            GraphError::DuplicateProducer { ref handle, .. } if handle == "shared"
        ));
    }

    #[test]
    fn test_empty_graph() {
        let graph = DagBuilder::new(vec![]).build().unwrap();
        assert!(graph.is_empty());
    }

    #[test]
    fn test_dependencies_satisfied() {
        let stacks = vec![
            stack("a", &["a-out"], &[]),
            stack("b", &["b-out"], &["a-out"]),
            stack("c", &[], &["a-out", "b-out"]),
        ];

        let graph = DagBuilder::new(stacks).build().unwrap();
        let mut placed = HashSet::new();

        assert!(graph.dependencies_satisfied(0, &placed));
        assert!(!graph.dependencies_satisfied(1, &placed));

        placed.insert(0);
        assert!(graph.dependencies_satisfied(1, &placed));
        assert!(!graph.dependencies_satisfied(2, &placed));

        placed.insert(1);
        assert!(graph.dependencies_satisfied(2, &placed));
    }
}

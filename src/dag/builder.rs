//! Graph builder for constructing step dependency graphs.
//!
//! The builder takes step keys with their dependency keys and constructs a
//! directed acyclic graph. Structural validation happens here, once, when a
//! plan is accepted; the scheduler assumes a valid graph afterwards.

use std::collections::{HashMap, HashSet};

use thiserror::Error;

/// Index into the node list.
pub type StepIndex = usize;

/// Structural errors detected while building a step graph.
#[derive(Debug, Error)]
pub enum GraphError {
    #[error("Duplicate step key: {0}")]
    DuplicateKey(String),

    #[error("Unknown dependency '{dependency}' in step '{step}': no step with that key exists")]
    UnknownDependency { step: String, dependency: String },

    #[error("Cycle detected in step dependencies; involved steps: {keys:?}")]
    Cycle { keys: Vec<String> },
}

/// One node handed to the builder: a step key plus its dependency keys.
#[derive(Debug, Clone)]
pub struct GraphNode {
    pub key: String,
    pub depends_on: Vec<String>,
}

impl GraphNode {
    pub fn new(key: &str, depends_on: &[String]) -> Self {
        Self {
            key: key.to_string(),
            depends_on: depends_on.to_vec(),
        }
    }
}

/// A validated directed acyclic graph of step keys.
#[derive(Debug)]
pub struct StepGraph {
    keys: Vec<String>,
    index_map: HashMap<String, StepIndex>,
    /// index -> steps that depend on it
    forward_edges: Vec<Vec<StepIndex>>,
    /// index -> steps it depends on
    reverse_edges: Vec<Vec<StepIndex>>,
}

impl StepGraph {
    pub fn len(&self) -> usize {
        self.keys.len()
    }

    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }

    pub fn keys(&self) -> &[String] {
        &self.keys
    }

    pub fn key_at(&self, index: StepIndex) -> Option<&str> {
        self.keys.get(index).map(String::as_str)
    }

    pub fn index_of(&self, key: &str) -> Option<StepIndex> {
        self.index_map.get(key).copied()
    }

    /// Steps that depend on the given step (forward edges).
    pub fn dependents(&self, index: StepIndex) -> &[StepIndex] {
        self.forward_edges.get(index).map_or(&[], |v| v.as_slice())
    }

    /// Steps that the given step depends on (reverse edges).
    pub fn dependencies(&self, index: StepIndex) -> &[StepIndex] {
        self.reverse_edges.get(index).map_or(&[], |v| v.as_slice())
    }

    /// Steps with no dependencies (entry points).
    pub fn roots(&self) -> Vec<StepIndex> {
        self.reverse_edges
            .iter()
            .enumerate()
            .filter(|(_, deps)| deps.is_empty())
            .map(|(i, _)| i)
            .collect()
    }

    /// Check if every dependency of a step is in the satisfied set.
    pub fn dependencies_satisfied(&self, index: StepIndex, satisfied: &HashSet<StepIndex>) -> bool {
        self.dependencies(index)
            .iter()
            .all(|dep| satisfied.contains(dep))
    }
}

/// Builder for constructing validated step graphs.
pub struct GraphBuilder {
    nodes: Vec<GraphNode>,
}

impl GraphBuilder {
    pub fn new(nodes: Vec<GraphNode>) -> Self {
        Self { nodes }
    }

    /// Build the graph, validating structure:
    /// - step keys must be unique
    /// - all dependencies must reference keys in the same set
    /// - no cycles
    pub fn build(self) -> Result<StepGraph, GraphError> {
        let mut index_map = HashMap::new();
        for (i, node) in self.nodes.iter().enumerate() {
            if index_map.contains_key(&node.key) {
                return Err(GraphError::DuplicateKey(node.key.clone()));
            }
            index_map.insert(node.key.clone(), i);
        }

        let mut forward_edges: Vec<Vec<StepIndex>> = vec![Vec::new(); self.nodes.len()];
        let mut reverse_edges: Vec<Vec<StepIndex>> = vec![Vec::new(); self.nodes.len()];

        for (to_idx, node) in self.nodes.iter().enumerate() {
            for dep in &node.depends_on {
                let from_idx =
                    *index_map
                        .get(dep)
                        .ok_or_else(|| GraphError::UnknownDependency {
                            step: node.key.clone(),
                            dependency: dep.clone(),
                        })?;
                forward_edges[from_idx].push(to_idx);
                reverse_edges[to_idx].push(from_idx);
            }
        }

        let graph = StepGraph {
            keys: self.nodes.into_iter().map(|n| n.key).collect(),
            index_map,
            forward_edges,
            reverse_edges,
        };

        Self::validate_no_cycles(&graph)?;

        Ok(graph)
    }

    /// Validate that the graph has no cycles using Kahn's algorithm.
    fn validate_no_cycles(graph: &StepGraph) -> Result<(), GraphError> {
        let mut in_degree: Vec<usize> = graph.reverse_edges.iter().map(|deps| deps.len()).collect();

        let mut queue: Vec<StepIndex> = in_degree
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
            let keys: Vec<String> = in_degree
                .iter()
                .enumerate()
                .filter(|&(_, deg)| *deg > 0)
                .filter_map(|(i, _)| graph.key_at(i).map(String::from))
                .collect();
            return Err(GraphError::Cycle { keys });
        }

        Ok(())
    }
}

//! Ready-set computation over a plan's step statuses.
//!
//! The scheduler is a pure in-memory view owned by the orchestrator's run
//! loop: it never persists or emits anything. Acyclicity was enforced when
//! the plan was accepted; here a tick that finds nothing ready, nothing in
//! flight, and non-terminal steps is an internal-consistency error, not a
//! retryable condition.

use std::collections::{HashMap, HashSet};

use crate::dag::builder::{GraphBuilder, GraphError, GraphNode, StepGraph, StepIndex};
use crate::model::{Step, StepStatus};

/// Tracks step statuses against the dependency graph of one plan version.
#[derive(Debug)]
pub struct StepScheduler {
    graph: StepGraph,
    statuses: Vec<StepStatus>,
    /// Indices whose status satisfies dependents (completed or skipped).
    satisfied: HashSet<StepIndex>,
}

impl StepScheduler {
    /// Build a scheduler from a plan's steps, preserving their current
    /// statuses (a resumed plan may already contain completed steps).
    pub fn from_steps(steps: &[Step]) -> Result<Self, GraphError> {
        let nodes: Vec<GraphNode> = steps
            .iter()
            .map(|s| GraphNode::new(&s.key, &s.depends_on))
            .collect();
        let graph = GraphBuilder::new(nodes).build()?;

        let statuses: Vec<StepStatus> = steps.iter().map(|s| s.status).collect();
        let satisfied = statuses
            .iter()
            .enumerate()
            .filter(|(_, s)| s.satisfies_dependents())
            .map(|(i, _)| i)
            .collect();

        Ok(Self {
            graph,
            statuses,
            satisfied,
        })
    }

    pub fn len(&self) -> usize {
        self.graph.len()
    }

    pub fn is_empty(&self) -> bool {
        self.graph.is_empty()
    }

    pub fn status_of(&self, key: &str) -> Option<StepStatus> {
        self.graph.index_of(key).map(|i| self.statuses[i])
    }

    /// Record a status transition applied by the orchestrator.
    pub fn mark(&mut self, key: &str, status: StepStatus) {
        if let Some(idx) = self.graph.index_of(key) {
            self.statuses[idx] = status;
            if status.satisfies_dependents() {
                self.satisfied.insert(idx);
            } else {
                self.satisfied.remove(&idx);
            }
        }
    }

    /// Keys of steps that may be dispatched now: dispatchable status and
    /// every dependency completed or skipped.
    pub fn ready_keys(&self) -> Vec<String> {
        self.statuses
            .iter()
            .enumerate()
            .filter(|(i, status)| {
                status.is_dispatchable() && self.graph.dependencies_satisfied(*i, &self.satisfied)
            })
            .filter_map(|(i, _)| self.graph.key_at(i).map(String::from))
            .collect()
    }

    /// Keys of steps still waiting to run (not terminal, not in flight).
    pub fn waiting_keys(&self) -> Vec<String> {
        self.statuses
            .iter()
            .enumerate()
            .filter(|(_, s)| s.is_dispatchable())
            .filter_map(|(i, _)| self.graph.key_at(i).map(String::from))
            .collect()
    }

    /// True when every step reached a terminal status.
    pub fn all_terminal(&self) -> bool {
        self.statuses.iter().all(|s| s.is_terminal())
    }

    /// True when every step completed or was skipped: the plan succeeded.
    pub fn is_complete(&self) -> bool {
        self.statuses.iter().all(|s| s.satisfies_dependents())
    }

    /// True when progress is impossible: nothing ready, nothing running,
    /// yet non-terminal steps remain. With acyclicity enforced at plan
    /// acceptance this indicates internal state corruption.
    pub fn is_stalled(&self) -> bool {
        let in_flight = self
            .statuses
            .iter()
            .any(|s| matches!(s, StepStatus::InProgress | StepStatus::Evaluating));
        !in_flight && !self.all_terminal() && self.ready_keys().is_empty()
    }

    /// Per-status counts, used for progress reporting.
    pub fn status_counts(&self) -> HashMap<StepStatus, usize> {
        let mut counts = HashMap::new();
        for status in &self.statuses {
            *counts.entry(*status).or_insert(0) += 1;
        }
        counts
    }
}

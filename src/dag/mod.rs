//! Dependency graph handling for plan steps.
//!
//! Steps within a plan form a directed acyclic graph keyed by step key.
//! The builder validates structure (unique keys, known dependencies, no
//! cycles) at plan-acceptance time; the scheduler computes the ready set
//! over step statuses at each tick.

mod builder;
mod scheduler;

pub use builder::{GraphBuilder, GraphError, GraphNode, StepGraph, StepIndex};
pub use scheduler::StepScheduler;

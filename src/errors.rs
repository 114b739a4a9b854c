//! Typed error hierarchy for the Waypoint engine.
//!
//! Three top-level enums cover the three subsystems:
//! - `OrchestrateError` — planning, replanning, and workflow failures
//! - `CapabilityError` — tool invocation failures
//! - `InferenceError` — inference provider and gateway failures

use thiserror::Error;

/// Errors from the orchestration subsystem (planner, replanner, workflow).
#[derive(Debug, Error)]
pub enum OrchestrateError {
    #[error("Planning failed after {attempts} attempts: {message}")]
    Planning { attempts: u32, message: String },

    #[error("Replanning budget exhausted: {replans} replans used for goal {goal_id}")]
    ReplanExhausted { goal_id: String, replans: u32 },

    #[error("Goal {0} not found")]
    GoalNotFound(String),

    #[error("No steps are ready, none in flight, and the plan is not terminal")]
    Stalled,

    #[error("Persistence failure: {0}")]
    Persistence(#[source] anyhow::Error),

    #[error(transparent)]
    Inference(#[from] InferenceError),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// Errors from a single capability invocation.
#[derive(Debug, Error)]
pub enum CapabilityError {
    #[error("Capability '{name}' is not registered (available: {available:?})")]
    NotFound { name: String, available: Vec<String> },

    #[error("Capability '{name}' timed out after {timeout_ms}ms")]
    Timeout { name: String, timeout_ms: u64 },

    #[error("Capability '{name}' failed: {message}")]
    Failed { name: String, message: String },

    #[error("Capability '{name}' rejected its parameters: {message}")]
    InvalidParams { name: String, message: String },
}

/// Errors from the inference gateway and its providers.
#[derive(Debug, Error)]
pub enum InferenceError {
    #[error("Provider '{provider}' request failed: {message}")]
    Provider { provider: String, message: String },

    #[error("Provider '{provider}' timed out after {timeout_ms}ms")]
    Timeout { provider: String, timeout_ms: u64 },

    #[error("Provider '{provider}' returned a malformed response: {message}")]
    MalformedResponse { provider: String, message: String },

    #[error("All inference providers failed; last error: {last}")]
    AllProvidersFailed { last: String },
}

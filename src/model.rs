use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

/// Default retry budget for a step.
pub const DEFAULT_MAX_RETRIES: u32 = 3;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum GoalStatus {
    Received,
    Planning,
    Executing,
    Replanning,
    Paused,
    Completed,
    Failed,
}

impl GoalStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Received => "received",
            Self::Planning => "planning",
            Self::Executing => "executing",
            Self::Replanning => "replanning",
            Self::Paused => "paused",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }

    /// Terminal goal states never transition again.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }
}

impl FromStr for GoalStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "received" => Ok(Self::Received),
            "planning" => Ok(Self::Planning),
            "executing" => Ok(Self::Executing),
            "replanning" => Ok(Self::Replanning),
            "paused" => Ok(Self::Paused),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            _ => Err(format!("Invalid goal status: {}", s)),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    Pending,
    InProgress,
    Evaluating,
    Completed,
    Failed,
    Skipped,
    Retrying,
    /// Initial status of the successor step written into a repair plan,
    /// marking the causal link to the exhausted step it replaces.
    Replanned,
}

impl StepStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::InProgress => "in_progress",
            Self::Evaluating => "evaluating",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Skipped => "skipped",
            Self::Retrying => "retrying",
            Self::Replanned => "replanned",
        }
    }

    /// Check if the step can never run again within its plan.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Skipped)
    }

    /// Check if the step may be dispatched once its dependencies are met.
    pub fn is_dispatchable(&self) -> bool {
        matches!(self, Self::Pending | Self::Retrying | Self::Replanned)
    }

    /// Check if a dependency in this status unblocks its dependents.
    pub fn satisfies_dependents(&self) -> bool {
        matches!(self, Self::Completed | Self::Skipped)
    }
}

impl FromStr for StepStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "in_progress" => Ok(Self::InProgress),
            "evaluating" => Ok(Self::Evaluating),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            "skipped" => Ok(Self::Skipped),
            "retrying" => Ok(Self::Retrying),
            "replanned" => Ok(Self::Replanned),
            _ => Err(format!("Invalid step status: {}", s)),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum StepPriority {
    High,
    Medium,
    Low,
}

impl StepPriority {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::High => "high",
            Self::Medium => "medium",
            Self::Low => "low",
        }
    }
}

impl Default for StepPriority {
    fn default() -> Self {
        Self::Medium
    }
}

impl FromStr for StepPriority {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "high" => Ok(Self::High),
            "medium" => Ok(Self::Medium),
            "low" => Ok(Self::Low),
            _ => Err(format!("Invalid step priority: {}", s)),
        }
    }
}

/// Which agent made an inference call. Recorded on every audit log row.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum AgentRole {
    Planner,
    Executor,
    Evaluator,
    Replanner,
    Summariser,
}

impl AgentRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Planner => "planner",
            Self::Executor => "executor",
            Self::Evaluator => "evaluator",
            Self::Replanner => "replanner",
            Self::Summariser => "summariser",
        }
    }
}

impl FromStr for AgentRole {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "planner" => Ok(Self::Planner),
            "executor" => Ok(Self::Executor),
            "evaluator" => Ok(Self::Evaluator),
            "replanner" => Ok(Self::Replanner),
            "summariser" => Ok(Self::Summariser),
            _ => Err(format!("Invalid agent role: {}", s)),
        }
    }
}

/// A user-submitted natural-language objective driving one workflow instance.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Goal {
    pub id: String,
    pub raw_input: String,
    pub status: GoalStatus,
    /// Human-readable status detail; always set when the goal fails.
    pub message: Option<String>,
    pub active_plan_id: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Goal {
    pub fn new(raw_input: &str) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4().to_string(),
            raw_input: raw_input.to_string(),
            status: GoalStatus::Received,
            message: None,
            active_plan_id: None,
            created_at: now,
            updated_at: now,
        }
    }
}

/// A versioned set of steps produced to satisfy a goal. Immutable once
/// created except for `is_active` and the status of its steps.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Plan {
    pub id: String,
    pub goal_id: String,
    pub version: i64,
    pub is_active: bool,
    pub created_at: DateTime<Utc>,
}

impl Plan {
    pub fn new(goal_id: &str, version: i64) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            goal_id: goal_id.to_string(),
            version,
            is_active: true,
            created_at: Utc::now(),
        }
    }
}

/// A single unit of work within a plan: a node in the execution DAG.
///
/// Dependencies are step keys within the same plan, never object links,
/// so acyclicity stays checkable by plain topological traversal.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Step {
    pub id: String,
    pub plan_id: String,
    /// Planner-chosen key, unique within the plan. Stable across retries.
    pub key: String,
    pub title: String,
    pub description: String,
    pub expected_outcome: String,
    pub rationale: String,
    pub priority: StepPriority,
    pub depends_on: Vec<String>,
    pub capabilities: Vec<String>,
    pub status: StepStatus,
    pub result: Option<Value>,
    pub error: Option<String>,
    pub retry_count: u32,
    pub max_retries: u32,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

/// Immutable audit record of one inference call attempt.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentLog {
    pub id: String,
    pub goal_id: String,
    pub plan_id: Option<String>,
    pub step_key: Option<String>,
    pub role: AgentRole,
    pub provider: String,
    pub model: String,
    pub prompt_summary: String,
    pub response_summary: String,
    pub tokens_in: u32,
    pub tokens_out: u32,
    pub latency_ms: u64,
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// Output of the evaluator for one step result.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Evaluation {
    pub confidence: f64,
    pub passed: bool,
    pub rationale: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn goal_status_roundtrips_through_str() {
        for status in [
            GoalStatus::Received,
            GoalStatus::Planning,
            GoalStatus::Executing,
            GoalStatus::Replanning,
            GoalStatus::Paused,
            GoalStatus::Completed,
            GoalStatus::Failed,
        ] {
            assert_eq!(GoalStatus::from_str(status.as_str()).unwrap(), status);
        }
    }

    #[test]
    fn unknown_status_is_an_error_not_a_default() {
        assert!(GoalStatus::from_str("finished").is_err());
        assert!(StepStatus::from_str("done").is_err());
        assert!(StepPriority::from_str("urgent").is_err());
        assert!(AgentRole::from_str("judge").is_err());
    }

    #[test]
    fn step_status_terminality() {
        assert!(StepStatus::Completed.is_terminal());
        assert!(StepStatus::Failed.is_terminal());
        assert!(StepStatus::Skipped.is_terminal());
        assert!(!StepStatus::Pending.is_terminal());
        assert!(!StepStatus::Retrying.is_terminal());
        assert!(!StepStatus::Replanned.is_terminal());
    }

    #[test]
    fn retrying_and_replanned_steps_are_dispatchable() {
        assert!(StepStatus::Pending.is_dispatchable());
        assert!(StepStatus::Retrying.is_dispatchable());
        assert!(StepStatus::Replanned.is_dispatchable());
        assert!(!StepStatus::InProgress.is_dispatchable());
        assert!(!StepStatus::Completed.is_dispatchable());
    }

    #[test]
    fn skipped_dependency_unblocks_dependents() {
        assert!(StepStatus::Completed.satisfies_dependents());
        assert!(StepStatus::Skipped.satisfies_dependents());
        assert!(!StepStatus::Failed.satisfies_dependents());
        assert!(!StepStatus::Pending.satisfies_dependents());
    }

    #[test]
    fn new_goal_starts_received() {
        let goal = Goal::new("learn Rust in six weeks");
        assert_eq!(goal.status, GoalStatus::Received);
        assert!(goal.active_plan_id.is_none());
        assert!(goal.message.is_none());
    }

    #[test]
    fn goal_status_serializes_snake_case() {
        let json = serde_json::to_string(&GoalStatus::Replanning).unwrap();
        assert_eq!(json, "\"replanning\"");
        let json = serde_json::to_string(&StepStatus::InProgress).unwrap();
        assert_eq!(json, "\"in_progress\"");
    }
}

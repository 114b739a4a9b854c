//! Goal decomposition into a validated plan draft.
//!
//! The planner asks the inference gateway to break a goal into 4-10 steps
//! forming a DAG, validates the draft structurally before acceptance, and
//! retries the inference call with the validation error as feedback -
//! bounded attempts, then a fatal `PlanningError`.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::dag::{GraphBuilder, GraphNode};
use crate::errors::OrchestrateError;
use crate::gateway::{InferenceGateway, LogContext, extract_json};
use crate::model::{AgentRole, Step, StepPriority, StepStatus};

/// Step-count bounds for an initial decomposition.
pub const MIN_STEPS: usize = 4;
pub const MAX_STEPS: usize = 10;

/// How the planner is being invoked.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlanMode {
    /// First decomposition of a goal.
    Initial,
    /// Repair after a step exhausted its retries. Completed work is given
    /// as context and not re-planned, so the lower step bound is relaxed.
    Repair,
}

/// One step as produced by the inference call.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepDraft {
    pub key: String,
    pub title: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub expected_outcome: String,
    #[serde(default)]
    pub rationale: String,
    #[serde(default)]
    pub priority: StepPriority,
    #[serde(default)]
    pub depends_on: Vec<String>,
    #[serde(default)]
    pub capabilities: Vec<String>,
}

/// A parsed, not-yet-validated plan draft.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlanDraft {
    pub steps: Vec<StepDraft>,
}

impl PlanDraft {
    pub fn parse(text: &str) -> Result<Self, String> {
        serde_json::from_str(extract_json(text))
            .map_err(|e| format!("draft is not valid JSON for the plan schema: {}", e))
    }

    /// Structural validation: step-count bounds, unique keys, dependencies
    /// referencing keys in the same draft, acyclic.
    pub fn validate(&self, mode: PlanMode) -> Result<(), String> {
        let min = match mode {
            PlanMode::Initial => MIN_STEPS,
            PlanMode::Repair => 1,
        };
        if self.steps.len() < min || self.steps.len() > MAX_STEPS {
            return Err(format!(
                "draft has {} steps; expected between {} and {}",
                self.steps.len(),
                min,
                MAX_STEPS
            ));
        }
        for step in &self.steps {
            if step.key.trim().is_empty() {
                return Err("draft contains a step with an empty key".to_string());
            }
            if step.title.trim().is_empty() {
                return Err(format!("step '{}' has an empty title", step.key));
            }
        }

        let nodes: Vec<GraphNode> = self
            .steps
            .iter()
            .map(|s| GraphNode::new(&s.key, &s.depends_on))
            .collect();
        GraphBuilder::new(nodes).build().map_err(|e| e.to_string())?;

        Ok(())
    }

    /// Materialize the draft into step records for a plan. The step whose
    /// key matches `replanned_key` starts as `replanned`, marking the
    /// causal link to the exhausted step it replaces.
    pub fn into_steps(
        self,
        plan_id: &str,
        default_max_retries: u32,
        replanned_key: Option<&str>,
    ) -> Vec<Step> {
        self.steps
            .into_iter()
            .map(|draft| {
                let status = if Some(draft.key.as_str()) == replanned_key {
                    StepStatus::Replanned
                } else {
                    StepStatus::Pending
                };
                Step {
                    id: Uuid::new_v4().to_string(),
                    plan_id: plan_id.to_string(),
                    key: draft.key,
                    title: draft.title,
                    description: draft.description,
                    expected_outcome: draft.expected_outcome,
                    rationale: draft.rationale,
                    priority: draft.priority,
                    depends_on: draft.depends_on,
                    capabilities: draft.capabilities,
                    status,
                    result: None,
                    error: None,
                    retry_count: 0,
                    max_retries: default_max_retries,
                    started_at: None,
                    completed_at: None,
                }
            })
            .collect()
    }
}

const PLANNER_SYSTEM_PROMPT: &str = r#"You are the planning agent of a goal orchestration engine.

Decompose the user's goal into a structured, dependency-aware execution plan.

RULES:
1. Produce between 4 and 10 concrete, actionable steps.
2. Each step must have a verifiable expected_outcome.
3. Choose a short snake_case key for each step, unique within the plan.
4. depends_on lists keys of other steps in this plan; the graph must be acyclic.
5. List required capabilities per step from the AVAILABLE CAPABILITIES section.
6. Steps with no dependency on each other run in parallel; exploit that.
7. Provide a rationale explaining why each step exists.

Respond with ONLY a JSON object:
{
  "steps": [
    {
      "key": "short_key",
      "title": "Step title",
      "description": "What this step does",
      "expected_outcome": "What success looks like",
      "rationale": "Why this step is needed",
      "priority": "high|medium|low",
      "depends_on": [],
      "capabilities": ["capability_name"]
    }
  ]
}"#;

/// Turns a goal's text into a validated plan draft.
pub struct Planner {
    gateway: std::sync::Arc<InferenceGateway>,
    /// Total inference attempts: 1 + bounded validation retries.
    max_attempts: u32,
}

impl Planner {
    pub fn new(gateway: std::sync::Arc<InferenceGateway>, max_attempts: u32) -> Self {
        Self {
            gateway,
            max_attempts: max_attempts.max(1),
        }
    }

    /// Decompose a goal into a plan draft, retrying the inference call with
    /// validation feedback on invalid output.
    pub async fn decompose(
        &self,
        goal_id: &str,
        goal_text: &str,
        capability_names: &[String],
        prior_context: Option<&str>,
    ) -> Result<PlanDraft, OrchestrateError> {
        let base_prompt = format!(
            "GOAL: {}\n\nAVAILABLE CAPABILITIES: {}\n{}\nGenerate the execution plan.",
            goal_text,
            capability_names.join(", "),
            prior_context
                .map(|c| format!("\nPRIOR EXPERIENCE:\n{}\n", c))
                .unwrap_or_default(),
        );

        self.request_draft(
            AgentRole::Planner,
            PLANNER_SYSTEM_PROMPT,
            &base_prompt,
            PlanMode::Initial,
            &LogContext::goal(goal_id),
        )
        .await
    }

    /// Shared request/parse/validate/retry loop, also used by the
    /// replanner with its own prompt and `PlanMode::Repair`.
    pub(crate) async fn request_draft(
        &self,
        role: AgentRole,
        system: &str,
        base_prompt: &str,
        mode: PlanMode,
        ctx: &LogContext,
    ) -> Result<PlanDraft, OrchestrateError> {
        let mut last_error = String::new();

        for attempt in 1..=self.max_attempts {
            let prompt = if last_error.is_empty() {
                base_prompt.to_string()
            } else {
                format!(
                    "{}\n\nYour previous response was rejected: {}\nRespond again with ONLY valid JSON matching the schema.",
                    base_prompt, last_error
                )
            };

            let response = self
                .gateway
                .complete(role, system, &prompt, ctx)
                .await
                .map_err(|e| OrchestrateError::Planning {
                    attempts: attempt,
                    message: e.to_string(),
                })?;

            match PlanDraft::parse(&response.text).and_then(|draft| {
                draft.validate(mode)?;
                Ok(draft)
            }) {
                Ok(draft) => {
                    tracing::info!(
                        role = role.as_str(),
                        steps = draft.steps.len(),
                        attempt,
                        "plan draft accepted"
                    );
                    return Ok(draft);
                }
                Err(message) => {
                    tracing::warn!(role = role.as_str(), attempt, %message, "plan draft rejected");
                    last_error = message;
                }
            }
        }

        Err(OrchestrateError::Planning {
            attempts: self.max_attempts,
            message: last_error,
        })
    }
}

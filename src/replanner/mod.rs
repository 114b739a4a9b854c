//! Plan repair after a step exhausts its retries.
//!
//! The replanner reuses the planner's request/validate/retry loop with a
//! repair prompt: the current plan state, the exhausted step and its
//! error, and the completed steps' results as immutable context. Completed
//! work is never re-planned; its results stay available to the new plan's
//! steps as carried context.

use serde_json::Value;
use std::collections::HashMap;

use crate::errors::OrchestrateError;
use crate::gateway::LogContext;
use crate::model::{AgentRole, Goal, Plan, Step};
use crate::planner::{PlanDraft, PlanMode, Planner};

const REPLANNER_SYSTEM_PROMPT: &str = r#"You are the replanner agent of a goal orchestration engine.

A step exhausted its retry budget. Produce a repair plan covering ONLY the
remaining work: the failed step (fixed, split, or replaced) and every step
that had not completed. Completed steps are NOT part of the new plan; their
results are provided as context and stay available to your steps, so do not
re-plan them and do not list their keys in depends_on.

RULES:
1. Keep the failed step's key when repairing it in place; choose a new key
   only when the repair fundamentally changes the step.
2. Address the failure cause described in the error; do not repeat the same
   approach unchanged.
3. Between 1 and 10 steps, acyclic, dependencies only on keys in this plan.
4. List required capabilities per step from the AVAILABLE CAPABILITIES section.

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

/// Produces a repair draft for the next plan version.
pub struct Replanner {
    planner: std::sync::Arc<Planner>,
}

impl Replanner {
    pub fn new(planner: std::sync::Arc<Planner>) -> Self {
        Self { planner }
    }

    /// Ask for a repair of the failed portion of the plan. The caller
    /// (orchestrator) materializes the draft, marks the successor step
    /// `replanned`, and performs the atomic version switch.
    pub async fn replan(
        &self,
        goal: &Goal,
        plan: &Plan,
        steps: &[Step],
        exhausted: &Step,
        completed_context: &HashMap<String, Value>,
        capability_names: &[String],
    ) -> Result<PlanDraft, OrchestrateError> {
        let prompt = format!(
            "GOAL: {}\n\nCURRENT PLAN (version {}):\n{}\n\nFAILED STEP:\nKey: {}\nTitle: {}\nDescription: {}\nExpected outcome: {}\nError: {}\nRetries used: {}/{}\n\nCOMPLETED RESULTS (available as context, do not re-plan):\n{}\n\nAVAILABLE CAPABILITIES: {}\n\nProduce the repair plan.",
            goal.raw_input,
            plan.version,
            describe_plan_state(steps),
            exhausted.key,
            exhausted.title,
            exhausted.description,
            exhausted.expected_outcome,
            exhausted.error.as_deref().unwrap_or("unknown"),
            exhausted.retry_count,
            exhausted.max_retries,
            serde_json::to_string_pretty(completed_context).unwrap_or_else(|_| "{}".to_string()),
            capability_names.join(", "),
        );

        let ctx = LogContext {
            goal_id: goal.id.clone(),
            plan_id: Some(plan.id.clone()),
            step_key: Some(exhausted.key.clone()),
        };

        self.planner
            .request_draft(
                AgentRole::Replanner,
                REPLANNER_SYSTEM_PROMPT,
                &prompt,
                PlanMode::Repair,
                &ctx,
            )
            .await
    }
}

/// Textual summary of a plan's steps and statuses for the repair prompt.
fn describe_plan_state(steps: &[Step]) -> String {
    steps
        .iter()
        .map(|s| {
            let deps = if s.depends_on.is_empty() {
                String::new()
            } else {
                format!(" (depends on: {})", s.depends_on.join(", "))
            };
            format!("  [{}] {}: {}{}", s.status.as_str(), s.key, s.title, deps)
        })
        .collect::<Vec<_>>()
        .join("\n")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gateway::{InferenceGateway, ScriptedProvider};
    use crate::model::{StepPriority, StepStatus};
    use crate::store::{Store, StoreHandle};
    use std::sync::Arc;
    use std::time::Duration;

    fn step(key: &str, status: StepStatus) -> Step {
        Step {
            id: key.to_string(),
            plan_id: "p-1".to_string(),
            key: key.to_string(),
            title: format!("Step {}", key),
            description: "desc".to_string(),
            expected_outcome: "outcome".to_string(),
            rationale: String::new(),
            priority: StepPriority::Medium,
            depends_on: vec![],
            capabilities: vec![],
            status,
            result: None,
            error: Some("capability timed out".to_string()),
            retry_count: 3,
            max_retries: 3,
            started_at: None,
            completed_at: None,
        }
    }

    fn replanner_with(provider: ScriptedProvider) -> Replanner {
        let store = StoreHandle::new(Store::open_in_memory().unwrap());
        let gateway = Arc::new(InferenceGateway::new(
            vec![Arc::new(provider)],
            Duration::from_secs(5),
            store,
        ));
        Replanner::new(Arc::new(Planner::new(gateway, 3)))
    }

    #[test]
    fn plan_state_description_lists_statuses_and_deps() {
        let mut b = step("b", StepStatus::Failed);
        b.depends_on = vec!["a".to_string()];
        let steps = vec![step("a", StepStatus::Completed), b];

        let description = describe_plan_state(&steps);
        assert!(description.contains("[completed] a"));
        assert!(description.contains("[failed] b"));
        assert!(description.contains("depends on: a"));
    }

    #[tokio::test]
    async fn repair_draft_may_be_smaller_than_an_initial_plan() {
        let provider = ScriptedProvider::new().with_replan_response(
            r#"{"steps": [
                {"key": "b", "title": "Retry with smaller scope", "capabilities": ["draft_outline"]},
                {"key": "c", "title": "Consolidate", "depends_on": ["b"]}
            ]}"#,
        );
        let replanner = replanner_with(provider);

        let goal = Goal::new("the goal");
        let plan = Plan::new(&goal.id, 1);
        let steps = vec![step("a", StepStatus::Completed), step("b", StepStatus::Failed)];
        let mut completed = HashMap::new();
        completed.insert("a".to_string(), serde_json::json!({"outputs": {}}));

        let draft = replanner
            .replan(&goal, &plan, &steps, &steps[1], &completed, &[])
            .await
            .unwrap();
        assert_eq!(draft.steps.len(), 2);
        assert_eq!(draft.steps[0].key, "b");
    }

    #[tokio::test]
    async fn invalid_repair_draft_surfaces_planning_error() {
        let provider = ScriptedProvider::new()
            .with_replan_response("nonsense")
            .with_replan_response("still nonsense")
            .with_replan_response("more nonsense");
        let replanner = replanner_with(provider);

        let goal = Goal::new("the goal");
        let plan = Plan::new(&goal.id, 1);
        let steps = vec![step("b", StepStatus::Failed)];

        let err = replanner
            .replan(&goal, &plan, &steps, &steps[0], &HashMap::new(), &[])
            .await
            .unwrap_err();
        assert!(matches!(err, OrchestrateError::Planning { .. }));
    }
}

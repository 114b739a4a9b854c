//! Scripted inference provider for tests and offline runs.
//!
//! Planner and replanner responses are queued in order; evaluator
//! responses are selected by prompt-substring rules with a default.

use std::collections::VecDeque;
use std::sync::Mutex;

use async_trait::async_trait;

use crate::errors::InferenceError;
use crate::gateway::{InferenceProvider, InferenceResponse};
use crate::model::AgentRole;

struct EvalRule {
    needle: String,
    responses: VecDeque<String>,
}

pub struct ScriptedProvider {
    planner: Mutex<VecDeque<String>>,
    planner_default: Option<String>,
    replanner: Mutex<VecDeque<String>>,
    evaluator_rules: Mutex<Vec<EvalRule>>,
    default_response: String,
}

impl ScriptedProvider {
    pub fn new() -> Self {
        Self {
            planner: Mutex::new(VecDeque::new()),
            planner_default: None,
            replanner: Mutex::new(VecDeque::new()),
            evaluator_rules: Mutex::new(Vec::new()),
            default_response: String::new(),
        }
    }

    /// Response returned when no queue or rule matches.
    pub fn with_default(mut self, response: &str) -> Self {
        self.default_response = response.to_string();
        self
    }

    /// Queue a planner response; popped in order.
    pub fn with_plan_response(self, response: &str) -> Self {
        self.planner.lock().unwrap().push_back(response.to_string());
        self
    }

    /// Planner response used whenever the planner queue is empty.
    pub fn with_plan_default(mut self, response: &str) -> Self {
        self.planner_default = Some(response.to_string());
        self
    }

    /// Queue a replanner response; popped in order.
    pub fn with_replan_response(self, response: &str) -> Self {
        self.replanner
            .lock()
            .unwrap()
            .push_back(response.to_string());
        self
    }

    /// Evaluator responses for prompts containing `needle`, popped in
    /// order; once exhausted the rule no longer matches.
    pub fn with_eval_rule(self, needle: &str, responses: &[&str]) -> Self {
        self.evaluator_rules.lock().unwrap().push(EvalRule {
            needle: needle.to_string(),
            responses: responses.iter().map(|s| s.to_string()).collect(),
        });
        self
    }

    /// A self-contained script producing a small four-step plan over the
    /// built-in capabilities, with every evaluation passing. Lets one-shot
    /// runs work without any live provider configured.
    pub fn canned() -> Self {
        let plan = r#"{
          "steps": [
            {
              "key": "orient",
              "title": "Establish the current date",
              "description": "Anchor the schedule against today's date.",
              "expected_outcome": "Current date and weekday recorded",
              "rationale": "Every downstream step positions work relative to today.",
              "priority": "high",
              "depends_on": [],
              "capabilities": ["current_datetime"]
            },
            {
              "key": "outline_work",
              "title": "Outline the work implied by the goal",
              "description": "Draft an outline of the concrete work items.",
              "expected_outcome": "A plain-text outline of work items",
              "rationale": "An explicit outline makes the remaining steps checkable.",
              "priority": "high",
              "depends_on": ["orient"],
              "capabilities": ["draft_outline"]
            },
            {
              "key": "outline_risks",
              "title": "Outline risks and constraints",
              "description": "Draft an outline of risks, constraints, and open questions.",
              "expected_outcome": "A plain-text outline of risks",
              "rationale": "Risks surface early while the plan can still absorb them.",
              "priority": "medium",
              "depends_on": ["orient"],
              "capabilities": ["draft_outline"]
            },
            {
              "key": "consolidate",
              "title": "Consolidate results",
              "description": "Merge the outlines into one deliverable.",
              "expected_outcome": "A single merged result object",
              "rationale": "One artifact is easier to review than scattered outputs.",
              "priority": "medium",
              "depends_on": ["outline_work", "outline_risks"],
              "capabilities": ["collect_results"]
            }
          ]
        }"#;
        Self::new()
            .with_plan_default(plan)
            .with_default(r#"{"confidence": 0.9, "rationale": "Output matches the expected outcome."}"#)
    }

    fn pop(&self, queue: &Mutex<VecDeque<String>>) -> Option<String> {
        queue.lock().unwrap().pop_front()
    }
}

impl Default for ScriptedProvider {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl InferenceProvider for ScriptedProvider {
    fn name(&self) -> &str {
        "scripted"
    }

    fn model(&self) -> &str {
        "scripted-v1"
    }

    async fn complete(
        &self,
        role: AgentRole,
        _system: &str,
        prompt: &str,
    ) -> Result<InferenceResponse, InferenceError> {
        let text = match role {
            AgentRole::Planner => self
                .pop(&self.planner)
                .or_else(|| self.planner_default.clone()),
            AgentRole::Replanner => self.pop(&self.replanner),
            AgentRole::Evaluator => {
                let mut rules = self.evaluator_rules.lock().unwrap();
                rules
                    .iter_mut()
                    .find(|r| prompt.contains(&r.needle) && !r.responses.is_empty())
                    .and_then(|r| r.responses.pop_front())
            }
            _ => None,
        };

        let text = match text {
            Some(t) => t,
            None if !self.default_response.is_empty() => self.default_response.clone(),
            None => {
                return Err(InferenceError::Provider {
                    provider: "scripted".to_string(),
                    message: format!("script exhausted for role {}", role.as_str()),
                });
            }
        };

        // Rough usage estimate, good enough for audit rows.
        Ok(InferenceResponse {
            tokens_in: (prompt.len() / 4) as u32,
            tokens_out: (text.len() / 4) as u32,
            text,
        })
    }
}

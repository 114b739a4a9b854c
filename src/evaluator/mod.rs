//! Step result evaluation.
//!
//! Scores one completed step's result against its expected outcome via the
//! inference gateway. A fixed threshold turns the confidence score into
//! pass/fail; a malformed response falls back to a deterministic check of
//! the capability outputs instead of crashing the workflow.

use serde::Deserialize;
use serde_json::Value;

use crate::gateway::{InferenceGateway, LogContext, extract_json};
use crate::model::{AgentRole, Evaluation, Step};

/// Default confidence threshold gating step success.
pub const DEFAULT_PASS_THRESHOLD: f64 = 0.6;

const EVALUATOR_SYSTEM_PROMPT: &str = r#"You are the evaluator agent of a goal orchestration engine.

Assess whether one executed step's result satisfies its expected outcome,
with strict and objective criteria.

Respond with ONLY a JSON object:
{
  "confidence": <float between 0 and 1>,
  "rationale": "concise objective justification citing concrete evidence"
}

CONSTRAINTS:
- confidence MUST satisfy 0.0 <= x <= 1.0
- rationale MUST reference the expected outcome and the actual output"#;

#[derive(Debug, Deserialize)]
struct EvalResponse {
    confidence: f64,
    #[serde(default)]
    rationale: String,
}

/// Scores step results. Never sees or mutates any step other than the one
/// it is scoring.
pub struct Evaluator {
    gateway: std::sync::Arc<InferenceGateway>,
    threshold: f64,
}

impl Evaluator {
    pub fn new(gateway: std::sync::Arc<InferenceGateway>, threshold: f64) -> Self {
        Self { gateway, threshold }
    }

    pub fn threshold(&self) -> f64 {
        self.threshold
    }

    /// Evaluate one step's result payload. Inference-level failures
    /// degrade to the deterministic fallback; the caller treats a failed
    /// evaluation like any other step failure.
    pub async fn evaluate(&self, goal_id: &str, step: &Step, result: &Value) -> Evaluation {
        let prompt = format!(
            "STEP UNDER EVALUATION:\nTitle: {}\nDescription: {}\nExpected outcome: {}\n\nRESULT PAYLOAD:\n{}\n\nEvaluate this result.",
            step.title,
            step.description,
            step.expected_outcome,
            serde_json::to_string_pretty(result).unwrap_or_else(|_| result.to_string()),
        );
        let ctx = LogContext::step(goal_id, &step.plan_id, &step.key);

        let text = match self
            .gateway
            .complete(AgentRole::Evaluator, EVALUATOR_SYSTEM_PROMPT, &prompt, &ctx)
            .await
        {
            Ok(response) => response.text,
            Err(err) => {
                tracing::warn!(step_key = %step.key, error = %err, "evaluator inference failed, using fallback");
                return self.fallback(result, &format!("evaluator unavailable: {}", err));
            }
        };

        match serde_json::from_str::<EvalResponse>(extract_json(&text)) {
            Ok(parsed) => {
                let confidence = parsed.confidence.clamp(0.0, 1.0);
                Evaluation {
                    confidence,
                    passed: confidence >= self.threshold,
                    rationale: if parsed.rationale.is_empty() {
                        "no rationale provided".to_string()
                    } else {
                        parsed.rationale
                    },
                }
            }
            Err(err) => {
                tracing::warn!(step_key = %step.key, error = %err, "evaluator response malformed, using fallback");
                self.fallback(result, "evaluator response was not valid JSON")
            }
        }
    }

    /// Deterministic fallback: when the judge is unavailable, trust the
    /// capability outputs directly. Non-empty outputs with no recorded
    /// errors pass at the threshold; anything else fails low.
    fn fallback(&self, result: &Value, reason: &str) -> Evaluation {
        let outputs_usable = result
            .get("outputs")
            .and_then(Value::as_object)
            .map(|outputs| {
                !outputs.is_empty() && !outputs.values().any(|v| v.get("error").is_some())
            })
            .unwrap_or(false);

        if outputs_usable {
            Evaluation {
                confidence: self.threshold,
                passed: true,
                rationale: format!(
                    "{}; capability outputs present and error-free, accepting result",
                    reason
                ),
            }
        } else {
            Evaluation {
                confidence: 0.3,
                passed: false,
                rationale: format!("{}; no usable capability output to fall back on", reason),
            }
        }
    }
}

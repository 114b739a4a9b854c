//! Inference gateway: ordered provider fallback with audit logging.
//!
//! The gateway routes one structured request through an ordered provider
//! chain (primary, then fallbacks), bounding each attempt with a timeout
//! and appending one agent log row per attempt. Providers themselves are
//! opaque behind the [`InferenceProvider`] trait.

mod openai;
mod scripted;

pub use openai::OpenAiCompatProvider;
pub use scripted::ScriptedProvider;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use uuid::Uuid;

use crate::errors::InferenceError;
use crate::model::{AgentLog, AgentRole};
use crate::store::StoreHandle;

/// One inference response: text plus usage counters.
#[derive(Debug, Clone)]
pub struct InferenceResponse {
    pub text: String,
    pub tokens_in: u32,
    pub tokens_out: u32,
}

/// An opaque language-reasoning backend.
#[async_trait]
pub trait InferenceProvider: Send + Sync {
    fn name(&self) -> &str;

    fn model(&self) -> &str;

    async fn complete(
        &self,
        role: AgentRole,
        system: &str,
        prompt: &str,
    ) -> Result<InferenceResponse, InferenceError>;
}

/// Records which goal/plan/step an inference call belongs to.
#[derive(Debug, Clone)]
pub struct LogContext {
    pub goal_id: String,
    pub plan_id: Option<String>,
    pub step_key: Option<String>,
}

impl LogContext {
    pub fn goal(goal_id: &str) -> Self {
        Self {
            goal_id: goal_id.to_string(),
            plan_id: None,
            step_key: None,
        }
    }

    pub fn step(goal_id: &str, plan_id: &str, step_key: &str) -> Self {
        Self {
            goal_id: goal_id.to_string(),
            plan_id: Some(plan_id.to_string()),
            step_key: Some(step_key.to_string()),
        }
    }
}

/// Routes requests through the provider chain in order, falling back on
/// failure or timeout.
pub struct InferenceGateway {
    providers: Vec<Arc<dyn InferenceProvider>>,
    timeout: Duration,
    store: StoreHandle,
}

impl InferenceGateway {
    pub fn new(
        providers: Vec<Arc<dyn InferenceProvider>>,
        timeout: Duration,
        store: StoreHandle,
    ) -> Self {
        Self {
            providers,
            timeout,
            store,
        }
    }

    pub fn provider_names(&self) -> Vec<String> {
        self.providers.iter().map(|p| p.name().to_string()).collect()
    }

    /// Try each provider in order; return the first success. Every attempt,
    /// successful or not, appends one agent log row.
    pub async fn complete(
        &self,
        role: AgentRole,
        system: &str,
        prompt: &str,
        ctx: &LogContext,
    ) -> Result<InferenceResponse, InferenceError> {
        let mut last_error = InferenceError::AllProvidersFailed {
            last: "no providers configured".to_string(),
        };

        for provider in &self.providers {
            let started = std::time::Instant::now();
            let attempt =
                tokio::time::timeout(self.timeout, provider.complete(role, system, prompt)).await;
            let latency_ms = started.elapsed().as_millis() as u64;

            let outcome = match attempt {
                Ok(result) => result,
                Err(_) => Err(InferenceError::Timeout {
                    provider: provider.name().to_string(),
                    timeout_ms: self.timeout.as_millis() as u64,
                }),
            };

            match outcome {
                Ok(response) => {
                    tracing::info!(
                        provider = provider.name(),
                        role = role.as_str(),
                        latency_ms,
                        "inference success"
                    );
                    self.append_log(provider.as_ref(), role, prompt, ctx, latency_ms, Ok(&response))
                        .await;
                    return Ok(response);
                }
                Err(err) => {
                    tracing::warn!(
                        provider = provider.name(),
                        role = role.as_str(),
                        error = %err,
                        "inference provider failed, trying next"
                    );
                    self.append_log(provider.as_ref(), role, prompt, ctx, latency_ms, Err(&err))
                        .await;
                    last_error = err;
                }
            }
        }

        Err(InferenceError::AllProvidersFailed {
            last: last_error.to_string(),
        })
    }

    async fn append_log(
        &self,
        provider: &dyn InferenceProvider,
        role: AgentRole,
        prompt: &str,
        ctx: &LogContext,
        latency_ms: u64,
        outcome: Result<&InferenceResponse, &InferenceError>,
    ) {
        let log = AgentLog {
            id: Uuid::new_v4().to_string(),
            goal_id: ctx.goal_id.clone(),
            plan_id: ctx.plan_id.clone(),
            step_key: ctx.step_key.clone(),
            role,
            provider: provider.name().to_string(),
            model: provider.model().to_string(),
            prompt_summary: truncate(prompt, 200),
            response_summary: match outcome {
                Ok(response) => truncate(&response.text, 300),
                Err(_) => String::new(),
            },
            tokens_in: outcome.map(|r| r.tokens_in).unwrap_or(0),
            tokens_out: outcome.map(|r| r.tokens_out).unwrap_or(0),
            latency_ms,
            error: outcome.err().map(|e| e.to_string()),
            created_at: Utc::now(),
        };
        // Log rows are observability, never control flow; a failed append
        // must not fail the inference call.
        if let Err(e) = self.store.call(move |store| store.append_log(&log)).await {
            tracing::warn!(error = %e, "failed to append agent log");
        }
    }
}

/// Extract the JSON object from a model response that may wrap it in
/// markdown fences or conversational text: everything between the first
/// `{` and the last `}`.
pub fn extract_json(text: &str) -> &str {
    match (text.find('{'), text.rfind('}')) {
        (Some(start), Some(end)) if end > start => &text[start..=end],
        _ => text,
    }
}

fn truncate(s: &str, max_chars: usize) -> String {
    s.chars().take(max_chars).collect()
}

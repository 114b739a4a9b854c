//! Capability registry: named, pluggable execution units invoked per step.
//!
//! Capabilities are opaque to the engine. The registry owns lookup and
//! timeout enforcement; a timed-out invocation is a failure for the step's
//! retry budget, never a hang.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use serde_json::{Map, Value, json};

use crate::errors::CapabilityError;

/// An external, pluggable execution unit a step invokes.
///
/// `params` carries the step's own fields (title, description, expected
/// outcome, goal text); `dependency_results` the result payloads of the
/// step's completed dependencies plus any context carried across replans.
#[async_trait]
pub trait Capability: Send + Sync {
    fn name(&self) -> &str;

    fn description(&self) -> &str;

    async fn invoke(
        &self,
        params: &Value,
        dependency_results: &Map<String, Value>,
    ) -> Result<Value, CapabilityError>;
}

/// Maps capability names to executables and bounds every invocation with a
/// timeout.
pub struct CapabilityRegistry {
    capabilities: HashMap<String, Arc<dyn Capability>>,
    timeout: Duration,
}

impl CapabilityRegistry {
    pub fn new(timeout: Duration) -> Self {
        Self {
            capabilities: HashMap::new(),
            timeout,
        }
    }

    pub fn register(&mut self, capability: Arc<dyn Capability>) {
        tracing::debug!(name = capability.name(), "capability registered");
        self.capabilities
            .insert(capability.name().to_string(), capability);
    }

    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.capabilities.keys().cloned().collect();
        names.sort();
        names
    }

    pub fn get(&self, name: &str) -> Option<&Arc<dyn Capability>> {
        self.capabilities.get(name)
    }

    pub fn len(&self) -> usize {
        self.capabilities.len()
    }

    pub fn is_empty(&self) -> bool {
        self.capabilities.is_empty()
    }

    /// Invoke a capability by name. Synchronous from the caller's
    /// perspective; bounded by the registry timeout.
    pub async fn invoke(
        &self,
        name: &str,
        params: &Value,
        dependency_results: &Map<String, Value>,
    ) -> Result<Value, CapabilityError> {
        let capability = self
            .capabilities
            .get(name)
            .ok_or_else(|| CapabilityError::NotFound {
                name: name.to_string(),
                available: self.names(),
            })?;

        tracing::info!(name, "invoking capability");
        match tokio::time::timeout(self.timeout, capability.invoke(params, dependency_results))
            .await
        {
            Ok(result) => result,
            Err(_) => Err(CapabilityError::Timeout {
                name: name.to_string(),
                timeout_ms: self.timeout.as_millis() as u64,
            }),
        }
    }
}

// ── Built-in capabilities ─────────────────────────────────────────────
//
// Deterministic demonstration capabilities so one-shot runs and tests can
// exercise the registry without external services.

/// Reports the current UTC date and time.
pub struct CurrentDatetime;

#[async_trait]
impl Capability for CurrentDatetime {
    fn name(&self) -> &str {
        "current_datetime"
    }

    fn description(&self) -> &str {
        "Report the current UTC date and time"
    }

    async fn invoke(
        &self,
        _params: &Value,
        _dependency_results: &Map<String, Value>,
    ) -> Result<Value, CapabilityError> {
        let now = Utc::now();
        Ok(json!({
            "iso": now.to_rfc3339(),
            "date": now.format("%Y-%m-%d").to_string(),
            "weekday": now.format("%A").to_string(),
        }))
    }
}

/// Merges the result payloads of all dependencies into one object.
pub struct CollectResults;

#[async_trait]
impl Capability for CollectResults {
    fn name(&self) -> &str {
        "collect_results"
    }

    fn description(&self) -> &str {
        "Merge dependency results into a single object"
    }

    async fn invoke(
        &self,
        _params: &Value,
        dependency_results: &Map<String, Value>,
    ) -> Result<Value, CapabilityError> {
        Ok(json!({
            "merged": Value::Object(dependency_results.clone()),
            "source_count": dependency_results.len(),
        }))
    }
}

/// Produces a plain-text outline from the step description and its
/// dependency results.
pub struct DraftOutline;

#[async_trait]
impl Capability for DraftOutline {
    fn name(&self) -> &str {
        "draft_outline"
    }

    fn description(&self) -> &str {
        "Draft a plain-text outline from the step description and prior results"
    }

    async fn invoke(
        &self,
        params: &Value,
        dependency_results: &Map<String, Value>,
    ) -> Result<Value, CapabilityError> {
        let title = params
            .get("title")
            .and_then(Value::as_str)
            .ok_or_else(|| CapabilityError::InvalidParams {
                name: "draft_outline".to_string(),
                message: "missing 'title'".to_string(),
            })?;
        let description = params
            .get("description")
            .and_then(Value::as_str)
            .unwrap_or("");

        let mut lines = vec![format!("# {}", title)];
        if !description.is_empty() {
            lines.push(description.to_string());
        }
        for key in dependency_results.keys() {
            lines.push(format!("- builds on: {}", key));
        }

        Ok(json!({ "outline": lines.join("\n") }))
    }
}

/// Register the built-in demonstration capabilities.
pub fn register_builtins(registry: &mut CapabilityRegistry) {
    registry.register(Arc::new(CurrentDatetime));
    registry.register(Arc::new(CollectResults));
    registry.register(Arc::new(DraftOutline));
}

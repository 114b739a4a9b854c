//! The goal workflow engine.
//!
//! One workflow per goal: plan, execute the DAG with bounded concurrency,
//! evaluate every result, replan on exhaustion. The orchestrator is the
//! single writer of goal status, plan activation, and step status for its
//! goal; workers hand outcomes back over a channel and each transition is
//! applied individually, so readiness recomputation always sees a
//! consistent snapshot.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use anyhow::{Context, anyhow};
use chrono::Utc;
use serde_json::{Map, Value, json};
use tokio::sync::{Semaphore, mpsc, watch};

use crate::capability::CapabilityRegistry;
use crate::dag::StepScheduler;
use crate::errors::OrchestrateError;
use crate::evaluator::Evaluator;
use crate::events::{EventBus, GoalEvent, StepSummary};
use crate::model::{Evaluation, Goal, GoalStatus, Plan, Step, StepStatus};
use crate::planner::{PlanDraft, Planner};
use crate::replanner::Replanner;
use crate::store::StoreHandle;

/// Engine tuning knobs.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Maximum steps in flight per goal.
    pub max_concurrency: usize,
    /// Replans allowed across a goal's lifetime.
    pub max_replans: u32,
    /// Retry budget written onto newly created steps.
    pub default_max_retries: u32,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_concurrency: 3,
            max_replans: 3,
            default_max_retries: crate::model::DEFAULT_MAX_RETRIES,
        }
    }
}

/// How one plan version's run ended.
enum PlanRunOutcome {
    /// Every step completed or was skipped.
    Completed,
    /// Pause requested; in-flight steps finished, the rest were skipped.
    Paused,
    /// A step exhausted its retries; replanning is needed.
    Exhausted { step_key: String, steps: Vec<Step> },
}

/// Signals workers send back to the engine loop. Each is applied as one
/// discrete transition.
enum StepSignal {
    /// Capabilities succeeded; the step is entering evaluation.
    Evaluating { key: String },
    /// Final worker outcome: a passed result or a failure message.
    Outcome {
        key: String,
        result: Result<(Value, Evaluation), String>,
    },
}

pub struct Orchestrator {
    store: StoreHandle,
    planner: Arc<Planner>,
    evaluator: Arc<Evaluator>,
    replanner: Replanner,
    capabilities: Arc<CapabilityRegistry>,
    events: Arc<EventBus>,
    config: EngineConfig,
    /// Pause flags for running workflows, keyed by goal id.
    controls: Mutex<HashMap<String, watch::Sender<bool>>>,
}

impl Orchestrator {
    pub fn new(
        store: StoreHandle,
        planner: Arc<Planner>,
        evaluator: Arc<Evaluator>,
        replanner: Replanner,
        capabilities: Arc<CapabilityRegistry>,
        events: Arc<EventBus>,
        config: EngineConfig,
    ) -> Self {
        Self {
            store,
            planner,
            evaluator,
            replanner,
            capabilities,
            events,
            config,
            controls: Mutex::new(HashMap::new()),
        }
    }

    pub fn events(&self) -> Arc<EventBus> {
        self.events.clone()
    }

    /// Fire-and-forget processing for async API responses.
    pub fn spawn_goal(self: Arc<Self>, goal_id: &str) {
        let goal_id = goal_id.to_string();
        tokio::spawn(async move {
            if let Err(err) = self.process_goal(&goal_id).await {
                tracing::error!(goal_id = %goal_id, error = %err, "goal workflow error");
            }
        });
    }

    /// Request a pause: no new steps are dispatched, in-flight steps
    /// finish or fail normally. Returns false when no workflow is running
    /// for the goal.
    pub fn pause_goal(&self, goal_id: &str) -> bool {
        let controls = self.controls.lock().unwrap();
        match controls.get(goal_id) {
            Some(tx) => tx.send(true).is_ok(),
            None => false,
        }
    }

    /// Full lifecycle processing of one goal. Exactly one workflow runs
    /// per goal id; a second call while one is active is rejected.
    pub async fn process_goal(&self, goal_id: &str) -> Result<Goal, OrchestrateError> {
        let pause_rx = {
            let mut controls = self.controls.lock().unwrap();
            if controls.contains_key(goal_id) {
                return Err(anyhow!("goal {} already has a running workflow", goal_id).into());
            }
            let (tx, rx) = watch::channel(false);
            controls.insert(goal_id.to_string(), tx);
            rx
        };

        let result = self.run_workflow(goal_id, pause_rx).await;
        self.controls.lock().unwrap().remove(goal_id);

        match result {
            Ok(goal) => Ok(goal),
            Err(err) => {
                let goal = self.fail_goal(goal_id, &err.to_string()).await;
                goal.ok_or(err)
            }
        }
    }

    async fn run_workflow(
        &self,
        goal_id: &str,
        mut pause_rx: watch::Receiver<bool>,
    ) -> Result<Goal, OrchestrateError> {
        let goal = {
            let id = goal_id.to_string();
            self.store
                .call(move |store| store.get_goal(&id))
                .await
                .map_err(OrchestrateError::Persistence)?
                .ok_or_else(|| OrchestrateError::GoalNotFound(goal_id.to_string()))?
        };
        tracing::info!(goal_id = %goal.id, "workflow started");

        // ── Planning ──────────────────────────────────────────────────
        self.set_goal_status(
            goal_id,
            GoalStatus::Planning,
            "Decomposing goal into an execution plan",
            None,
        )
        .await?;

        let capability_names = self.capabilities.names();
        let draft = self
            .planner
            .decompose(goal_id, &goal.raw_input, &capability_names, None)
            .await?;
        let (mut plan, mut steps) = self.materialize_plan(goal_id, draft, None).await?;

        self.set_goal_status(goal_id, GoalStatus::Executing, "Executing plan", Some(&plan.id))
            .await?;
        self.events.publish(
            goal_id,
            GoalEvent::PlanCreated {
                plan_id: plan.id.clone(),
                version: plan.version,
                steps: steps.iter().map(StepSummary::from).collect(),
                message: None,
            },
        );

        // Results of completed steps from earlier plan versions, available
        // to later versions as read-only context.
        let mut carried: HashMap<String, Value> = HashMap::new();
        let mut replans = 0u32;

        // ── Execute / replan loop ─────────────────────────────────────
        loop {
            let outcome = self
                .execute_plan(&goal, steps, &carried, &mut pause_rx)
                .await?;

            match outcome {
                PlanRunOutcome::Completed => {
                    let goal = self
                        .set_goal_status(
                            goal_id,
                            GoalStatus::Completed,
                            "All steps completed successfully",
                            None,
                        )
                        .await?;
                    self.events.publish(goal_id, GoalEvent::GoalCompleted {});
                    tracing::info!(goal_id, plan_version = plan.version, "goal completed");
                    return Ok(goal);
                }
                PlanRunOutcome::Paused => {
                    let goal = self
                        .set_goal_status(goal_id, GoalStatus::Paused, "Paused by request", None)
                        .await?;
                    tracing::info!(goal_id, "goal paused");
                    return Ok(goal);
                }
                PlanRunOutcome::Exhausted {
                    step_key,
                    steps: final_steps,
                } => {
                    replans += 1;
                    if replans > self.config.max_replans {
                        return Err(OrchestrateError::ReplanExhausted {
                            goal_id: goal_id.to_string(),
                            replans: replans - 1,
                        });
                    }

                    let exhausted = final_steps
                        .iter()
                        .find(|s| s.key == step_key)
                        .cloned()
                        .ok_or_else(|| anyhow!("exhausted step {} missing from plan", step_key))?;

                    self.set_goal_status(
                        goal_id,
                        GoalStatus::Replanning,
                        "Repairing plan after step failure",
                        None,
                    )
                    .await?;
                    self.events.publish(
                        goal_id,
                        GoalEvent::Replanning {
                            message: format!(
                                "Replanning after step '{}' exhausted its retries",
                                exhausted.title
                            ),
                            triggering_step_id: step_key.clone(),
                        },
                    );
                    tracing::warn!(goal_id, step_key = %step_key, replans, "replanning");

                    for step in &final_steps {
                        if step.status == StepStatus::Completed
                            && let Some(result) = &step.result
                        {
                            carried.insert(step.key.clone(), result.clone());
                        }
                    }

                    let draft = self
                        .replanner
                        .replan(
                            &goal,
                            &plan,
                            &final_steps,
                            &exhausted,
                            &carried,
                            &capability_names,
                        )
                        .await?;
                    let (new_plan, new_steps) = self
                        .materialize_plan(goal_id, draft, Some(&step_key))
                        .await?;

                    self.set_goal_status(
                        goal_id,
                        GoalStatus::Executing,
                        "Executing repaired plan",
                        Some(&new_plan.id),
                    )
                    .await?;
                    self.events.publish(
                        goal_id,
                        GoalEvent::PlanCreated {
                            plan_id: new_plan.id.clone(),
                            version: new_plan.version,
                            steps: new_steps.iter().map(StepSummary::from).collect(),
                            message: Some("Plan updated after failure recovery".to_string()),
                        },
                    );

                    plan = new_plan;
                    steps = new_steps;
                }
            }
        }
    }

    /// Run one plan version to a terminal outcome. The engine loop here is
    /// the only writer of step status; workers execute and report.
    async fn execute_plan(
        &self,
        goal: &Goal,
        steps: Vec<Step>,
        carried: &HashMap<String, Value>,
        pause_rx: &mut watch::Receiver<bool>,
    ) -> Result<PlanRunOutcome, OrchestrateError> {
        let mut sched = StepScheduler::from_steps(&steps)
            .map_err(|e| anyhow!("accepted plan failed graph validation: {}", e))?;

        let key_order: Vec<String> = steps.iter().map(|s| s.key.clone()).collect();
        let mut step_map: HashMap<String, Step> =
            steps.into_iter().map(|s| (s.key.clone(), s)).collect();

        // Result payloads of steps completed in this plan version.
        let mut results: HashMap<String, Value> = step_map
            .values()
            .filter(|s| s.status == StepStatus::Completed)
            .filter_map(|s| s.result.clone().map(|r| (s.key.clone(), r)))
            .collect();

        let semaphore = Arc::new(Semaphore::new(self.config.max_concurrency));
        let (tx, mut rx) = mpsc::channel::<StepSignal>(64);
        let mut in_flight = 0usize;
        let mut exhausted_key: Option<String> = None;

        loop {
            let paused = *pause_rx.borrow();

            // ── Dispatch ──────────────────────────────────────────────
            if !paused && exhausted_key.is_none() {
                for key in sched.ready_keys() {
                    if in_flight >= self.config.max_concurrency {
                        break;
                    }
                    let step = step_map
                        .get_mut(&key)
                        .ok_or_else(|| anyhow!("scheduler produced unknown key {}", key))?;

                    step.status = StepStatus::InProgress;
                    step.started_at = Some(Utc::now());
                    self.persist_step(step).await?;
                    sched.mark(&key, StepStatus::InProgress);
                    self.events.publish(
                        &goal.id,
                        GoalEvent::StepUpdate {
                            step_id: key.clone(),
                            title: step.title.clone(),
                            status: StepStatus::InProgress,
                            error: None,
                            retry_count: None,
                        },
                    );

                    let mut dependency_results = Map::new();
                    for (carried_key, value) in carried {
                        dependency_results.insert(carried_key.clone(), value.clone());
                    }
                    for dep in &step.depends_on {
                        if let Some(value) = results.get(dep) {
                            dependency_results.insert(dep.clone(), value.clone());
                        }
                    }

                    let permit = semaphore
                        .clone()
                        .acquire_owned()
                        .await
                        .context("semaphore closed")?;
                    let worker_tx = tx.clone();
                    let registry = self.capabilities.clone();
                    let evaluator = self.evaluator.clone();
                    let goal_id = goal.id.clone();
                    let goal_text = goal.raw_input.clone();
                    let step_snapshot = step.clone();

                    in_flight += 1;
                    tokio::spawn(async move {
                        let _permit = permit;
                        run_step(
                            step_snapshot,
                            goal_id,
                            goal_text,
                            registry,
                            evaluator,
                            dependency_results,
                            worker_tx,
                        )
                        .await;
                    });
                }
            }

            // ── Terminal checks when nothing is in flight ─────────────
            if in_flight == 0 {
                if let Some(step_key) = exhausted_key.take() {
                    let steps = collect_steps(&key_order, step_map);
                    return Ok(PlanRunOutcome::Exhausted { step_key, steps });
                }
                let snapshot: Vec<Step> = key_order
                    .iter()
                    .filter_map(|key| step_map.get(key).cloned())
                    .collect();
                if derive_goal_outcome(&snapshot) == Some(GoalStatus::Completed) {
                    return Ok(PlanRunOutcome::Completed);
                }
                if paused {
                    self.skip_waiting_steps(goal, &mut sched, &mut step_map)
                        .await?;
                    return Ok(PlanRunOutcome::Paused);
                }
                if sched.is_stalled() || sched.all_terminal() {
                    return Err(OrchestrateError::Stalled);
                }
                // Ready steps exist; dispatch on the next iteration.
                continue;
            }

            // ── Apply one signal at a time ────────────────────────────
            tokio::select! {
                changed = pause_rx.changed(), if !paused => {
                    // A dropped control handle just means no pause can
                    // arrive anymore; keep executing.
                    let _ = changed;
                    continue;
                }
                signal = rx.recv() => {
                    let signal = signal.ok_or_else(|| anyhow!("step signal channel closed"))?;
                    self.apply_signal(
                        goal,
                        signal,
                        &mut sched,
                        &mut step_map,
                        &mut results,
                        &mut in_flight,
                        &mut exhausted_key,
                    )
                    .await?;
                }
            }
        }
    }

    /// Apply one worker signal as a discrete, individually-persisted
    /// transition.
    #[allow(clippy::too_many_arguments)]
    async fn apply_signal(
        &self,
        goal: &Goal,
        signal: StepSignal,
        sched: &mut StepScheduler,
        step_map: &mut HashMap<String, Step>,
        results: &mut HashMap<String, Value>,
        in_flight: &mut usize,
        exhausted_key: &mut Option<String>,
    ) -> Result<(), OrchestrateError> {
        match signal {
            StepSignal::Evaluating { key } => {
                let step = step_map
                    .get_mut(&key)
                    .ok_or_else(|| anyhow!("signal for unknown step {}", key))?;
                step.status = StepStatus::Evaluating;
                self.persist_step(step).await?;
                sched.mark(&key, StepStatus::Evaluating);
                self.events.publish(
                    &goal.id,
                    GoalEvent::StepUpdate {
                        step_id: key,
                        title: step.title.clone(),
                        status: StepStatus::Evaluating,
                        error: None,
                        retry_count: None,
                    },
                );
            }
            StepSignal::Outcome { key, result } => {
                *in_flight -= 1;
                let step = step_map
                    .get_mut(&key)
                    .ok_or_else(|| anyhow!("signal for unknown step {}", key))?;

                match result {
                    Ok((payload, evaluation)) => {
                        step.status = StepStatus::Completed;
                        step.result = Some(payload.clone());
                        step.error = None;
                        step.completed_at = Some(Utc::now());
                        self.persist_step(step).await?;
                        sched.mark(&key, StepStatus::Completed);
                        results.insert(key.clone(), payload);
                        tracing::info!(
                            goal_id = %goal.id,
                            step_key = %key,
                            confidence = evaluation.confidence,
                            "step completed"
                        );
                        self.events.publish(
                            &goal.id,
                            GoalEvent::StepUpdate {
                                step_id: key,
                                title: step.title.clone(),
                                status: StepStatus::Completed,
                                error: None,
                                retry_count: None,
                            },
                        );
                    }
                    Err(message) => {
                        step.retry_count += 1;
                        step.error = Some(message.clone());

                        if step.retry_count >= step.max_retries {
                            step.status = StepStatus::Failed;
                            self.persist_step(step).await?;
                            sched.mark(&key, StepStatus::Failed);
                            tracing::warn!(
                                goal_id = %goal.id,
                                step_key = %key,
                                retries = step.retry_count,
                                "step exhausted its retries"
                            );
                            self.events.publish(
                                &goal.id,
                                GoalEvent::StepUpdate {
                                    step_id: key.clone(),
                                    title: step.title.clone(),
                                    status: StepStatus::Failed,
                                    error: Some(message),
                                    retry_count: Some(step.retry_count),
                                },
                            );
                            // Exactly one replanning trigger per run; a
                            // concurrent second exhaustion keeps the first.
                            if exhausted_key.is_none() {
                                *exhausted_key = Some(key);
                            }
                        } else {
                            step.status = StepStatus::Retrying;
                            self.persist_step(step).await?;
                            sched.mark(&key, StepStatus::Retrying);
                            tracing::info!(
                                goal_id = %goal.id,
                                step_key = %key,
                                retry = step.retry_count,
                                "step retrying"
                            );
                            self.events.publish(
                                &goal.id,
                                GoalEvent::StepUpdate {
                                    step_id: key,
                                    title: step.title.clone(),
                                    status: StepStatus::Retrying,
                                    error: Some(message),
                                    retry_count: Some(step.retry_count),
                                },
                            );
                        }
                    }
                }
            }
        }
        Ok(())
    }

    /// On pause, remaining dispatchable steps transition to skipped.
    async fn skip_waiting_steps(
        &self,
        goal: &Goal,
        sched: &mut StepScheduler,
        step_map: &mut HashMap<String, Step>,
    ) -> Result<(), OrchestrateError> {
        for key in sched.waiting_keys() {
            if let Some(step) = step_map.get_mut(&key) {
                step.status = StepStatus::Skipped;
                self.persist_step(step).await?;
                sched.mark(&key, StepStatus::Skipped);
                self.events.publish(
                    &goal.id,
                    GoalEvent::StepUpdate {
                        step_id: key,
                        title: step.title.clone(),
                        status: StepStatus::Skipped,
                        error: None,
                        retry_count: None,
                    },
                );
            }
        }
        Ok(())
    }

    /// Create the next plan version with its steps in one transaction.
    async fn materialize_plan(
        &self,
        goal_id: &str,
        draft: PlanDraft,
        replanned_key: Option<&str>,
    ) -> Result<(Plan, Vec<Step>), OrchestrateError> {
        let goal_id = goal_id.to_string();
        let replanned_key = replanned_key.map(String::from);
        let default_max_retries = self.config.default_max_retries;

        self.store
            .call(move |store| {
                let version = store.next_plan_version(&goal_id)?;
                let plan = Plan::new(&goal_id, version);
                let steps =
                    draft.into_steps(&plan.id, default_max_retries, replanned_key.as_deref());
                store.create_plan(&plan, &steps)?;
                Ok((plan, steps))
            })
            .await
            .map_err(OrchestrateError::Persistence)
    }

    async fn persist_step(&self, step: &Step) -> Result<(), OrchestrateError> {
        let step = step.clone();
        self.store
            .call(move |store| store.update_step(&step))
            .await
            .map_err(OrchestrateError::Persistence)
    }

    /// Single writer of goal status; publishes the matching event.
    async fn set_goal_status(
        &self,
        goal_id: &str,
        status: GoalStatus,
        message: &str,
        active_plan_id: Option<&str>,
    ) -> Result<Goal, OrchestrateError> {
        let goal = {
            let goal_id = goal_id.to_string();
            let message = message.to_string();
            let active_plan_id = active_plan_id.map(String::from);
            self.store
                .call(move |store| {
                    store.update_goal_status(
                        &goal_id,
                        status,
                        Some(&message),
                        active_plan_id.as_deref(),
                    )
                })
                .await
                .map_err(OrchestrateError::Persistence)?
        };

        if !status.is_terminal() {
            self.events.publish(
                goal_id,
                GoalEvent::GoalStatus {
                    status,
                    message: message.to_string(),
                },
            );
        }
        Ok(goal)
    }

    /// Terminal failure path: persist the failure with its message and
    /// publish `goal_failed`. A failed goal always carries a
    /// human-readable message; completed steps stay queryable.
    async fn fail_goal(&self, goal_id: &str, message: &str) -> Option<Goal> {
        tracing::error!(goal_id, message, "goal failed");
        let goal = self
            .set_goal_status(goal_id, GoalStatus::Failed, message, None)
            .await;
        self.events.publish(
            goal_id,
            GoalEvent::GoalFailed {
                message: message.to_string(),
            },
        );
        match goal {
            Ok(goal) => Some(goal),
            Err(err) => {
                tracing::error!(goal_id, error = %err, "failed to persist goal failure");
                None
            }
        }
    }
}

/// Derive the aggregate goal outcome from a plan's step statuses. The one
/// place this rule lives; consumers read `Goal.status` instead of
/// recomputing their own.
pub fn derive_goal_outcome(steps: &[Step]) -> Option<GoalStatus> {
    if steps.iter().all(|s| s.status.satisfies_dependents()) {
        Some(GoalStatus::Completed)
    } else if steps.iter().any(|s| s.status == StepStatus::Failed) {
        Some(GoalStatus::Failed)
    } else {
        None
    }
}

/// Worker body: invoke the step's capabilities, then hand the result to
/// the evaluator. Never touches shared state; everything flows back
/// through the signal channel.
async fn run_step(
    step: Step,
    goal_id: String,
    goal_text: String,
    registry: Arc<CapabilityRegistry>,
    evaluator: Arc<Evaluator>,
    dependency_results: Map<String, Value>,
    tx: mpsc::Sender<StepSignal>,
) {
    let params = json!({
        "goal": goal_text,
        "title": step.title,
        "description": step.description,
        "expected_outcome": step.expected_outcome,
    });

    let mut outputs = Map::new();
    for name in &step.capabilities {
        match registry.invoke(name, &params, &dependency_results).await {
            Ok(value) => {
                outputs.insert(name.clone(), value);
            }
            Err(err) => {
                let _ = tx
                    .send(StepSignal::Outcome {
                        key: step.key.clone(),
                        result: Err(err.to_string()),
                    })
                    .await;
                return;
            }
        }
    }

    let payload = json!({
        "outputs": Value::Object(outputs),
        "summary": format!("Executed capabilities: {}", step.capabilities.join(", ")),
    });

    let _ = tx
        .send(StepSignal::Evaluating {
            key: step.key.clone(),
        })
        .await;

    let evaluation = evaluator.evaluate(&goal_id, &step, &payload).await;
    let result = if evaluation.passed {
        Ok((payload, evaluation))
    } else {
        Err(evaluation.rationale)
    };
    let _ = tx
        .send(StepSignal::Outcome {
            key: step.key,
            result,
        })
        .await;
}

/// Rebuild the plan's steps in creation order from the working map.
fn collect_steps(key_order: &[String], mut step_map: HashMap<String, Step>) -> Vec<Step> {
    key_order
        .iter()
        .filter_map(|key| step_map.remove(key))
        .collect()
}

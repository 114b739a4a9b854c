//! Integration tests for the Waypoint engine.
//!
//! Each scenario drives a full goal workflow end-to-end with a scripted
//! inference provider and recording capabilities over an in-memory store,
//! then asserts on the persisted records and the published event stream.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{Map, Value, json};

use waypoint::capability::{Capability, CapabilityRegistry};
use waypoint::errors::{CapabilityError, OrchestrateError};
use waypoint::evaluator::Evaluator;
use waypoint::events::{EventBus, EventEnvelope, GoalEvent, ReconnectBackoff};
use waypoint::gateway::{InferenceGateway, ScriptedProvider};
use waypoint::model::{Goal, GoalStatus, StepStatus};
use waypoint::orchestrator::{EngineConfig, Orchestrator};
use waypoint::planner::Planner;
use waypoint::replanner::Replanner;
use waypoint::store::{Store, StoreHandle};

// =============================================================================
// Harness
// =============================================================================

#[derive(Debug, Clone)]
struct RecordedCall {
    title: String,
    dep_keys: Vec<String>,
}

/// Capability that records every invocation: which step called it and
/// which dependency results it could see.
struct Recorder {
    log: Arc<Mutex<Vec<RecordedCall>>>,
    delay: Duration,
}

#[async_trait]
impl Capability for Recorder {
    fn name(&self) -> &str {
        "probe"
    }

    fn description(&self) -> &str {
        "records invocations for test assertions"
    }

    async fn invoke(
        &self,
        params: &Value,
        dependency_results: &Map<String, Value>,
    ) -> Result<Value, CapabilityError> {
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        let title = params
            .get("title")
            .and_then(Value::as_str)
            .unwrap_or("")
            .to_string();
        let mut dep_keys: Vec<String> = dependency_results.keys().cloned().collect();
        dep_keys.sort();
        self.log.lock().unwrap().push(RecordedCall {
            title: title.clone(),
            dep_keys,
        });
        Ok(json!({"ok": true, "title": title}))
    }
}

/// Capability that fails its first `failures` invocations.
struct Flaky {
    failures: AtomicU32,
}

#[async_trait]
impl Capability for Flaky {
    fn name(&self) -> &str {
        "flaky"
    }

    fn description(&self) -> &str {
        "fails a fixed number of times, then succeeds"
    }

    async fn invoke(
        &self,
        _params: &Value,
        _deps: &Map<String, Value>,
    ) -> Result<Value, CapabilityError> {
        let remaining = self.failures.load(Ordering::SeqCst);
        if remaining > 0 {
            self.failures.fetch_sub(1, Ordering::SeqCst);
            return Err(CapabilityError::Failed {
                name: "flaky".to_string(),
                message: "transient backend failure".to_string(),
            });
        }
        Ok(json!({"ok": true}))
    }
}

struct Harness {
    store: StoreHandle,
    orchestrator: Arc<Orchestrator>,
    events: Arc<EventBus>,
    call_log: Arc<Mutex<Vec<RecordedCall>>>,
}

fn harness_with(provider: ScriptedProvider, engine: EngineConfig, probe_delay: Duration) -> Harness {
    let store = StoreHandle::new(Store::open_in_memory().unwrap());
    let call_log = Arc::new(Mutex::new(Vec::new()));

    let mut registry = CapabilityRegistry::new(Duration::from_secs(5));
    registry.register(Arc::new(Recorder {
        log: call_log.clone(),
        delay: probe_delay,
    }));
    registry.register(Arc::new(Flaky {
        failures: AtomicU32::new(2),
    }));

    let gateway = Arc::new(InferenceGateway::new(
        vec![Arc::new(provider)],
        Duration::from_secs(5),
        store.clone(),
    ));
    let planner = Arc::new(Planner::new(gateway.clone(), 3));
    let evaluator = Arc::new(Evaluator::new(gateway, 0.6));
    let replanner = Replanner::new(planner.clone());
    let events = Arc::new(EventBus::new());

    let orchestrator = Arc::new(Orchestrator::new(
        store.clone(),
        planner,
        evaluator,
        replanner,
        Arc::new(registry),
        events.clone(),
        engine,
    ));

    Harness {
        store,
        orchestrator,
        events,
        call_log,
    }
}

async fn create_goal(harness: &Harness, text: &str) -> String {
    let goal = Goal::new(text);
    let id = goal.id.clone();
    harness
        .store
        .call(move |store| store.create_goal(&goal))
        .await
        .unwrap();
    id
}

/// Drain all buffered events for a goal after its workflow finished.
fn drain_events(rx: &mut tokio::sync::broadcast::Receiver<EventEnvelope>) -> Vec<EventEnvelope> {
    let mut events = Vec::new();
    while let Ok(envelope) = rx.try_recv() {
        events.push(envelope);
    }
    events
}

/// A diamond plan: a, then b and c in parallel, then d.
fn diamond_plan(capability: &str) -> String {
    json!({
        "steps": [
            {"key": "a", "title": "Step a", "expected_outcome": "a done",
             "priority": "high", "depends_on": [], "capabilities": [capability]},
            {"key": "b", "title": "Step b", "expected_outcome": "b done",
             "depends_on": ["a"], "capabilities": [capability]},
            {"key": "c", "title": "Step c", "expected_outcome": "c done",
             "depends_on": ["a"], "capabilities": [capability]},
            {"key": "d", "title": "Step d", "expected_outcome": "d done",
             "depends_on": ["b", "c"], "capabilities": [capability]}
        ]
    })
    .to_string()
}

fn event_positions(events: &[EventEnvelope], pred: impl Fn(&GoalEvent) -> bool) -> Vec<usize> {
    events
        .iter()
        .enumerate()
        .filter(|(_, e)| pred(&e.event))
        .map(|(i, _)| i)
        .collect()
}

fn step_update_position(events: &[EventEnvelope], key: &str, status: StepStatus) -> Option<usize> {
    event_positions(events, |e| {
        matches!(e, GoalEvent::StepUpdate { step_id, status: s, .. }
            if step_id.as_str() == key && *s == status)
    })
    .first()
    .copied()
}

// =============================================================================
// Scenario A: dependency-ordered execution with parallel siblings
// =============================================================================

mod scheduling {
    use super::*;

    #[tokio::test]
    async fn diamond_plan_runs_in_dependency_order() {
        let provider = ScriptedProvider::new()
            .with_plan_response(&diamond_plan("probe"))
            .with_default(r#"{"confidence": 0.9, "rationale": "looks right"}"#);
        let harness = harness_with(provider, EngineConfig::default(), Duration::ZERO);

        let goal_id = create_goal(&harness, "run the diamond").await;
        let mut rx = harness.events.subscribe(&goal_id);

        let goal = harness.orchestrator.process_goal(&goal_id).await.unwrap();
        assert_eq!(goal.status, GoalStatus::Completed);

        let events = drain_events(&mut rx);

        // b and c start only after a completed; d only after both.
        let a_done = step_update_position(&events, "a", StepStatus::Completed).unwrap();
        let b_start = step_update_position(&events, "b", StepStatus::InProgress).unwrap();
        let c_start = step_update_position(&events, "c", StepStatus::InProgress).unwrap();
        let b_done = step_update_position(&events, "b", StepStatus::Completed).unwrap();
        let c_done = step_update_position(&events, "c", StepStatus::Completed).unwrap();
        let d_start = step_update_position(&events, "d", StepStatus::InProgress).unwrap();

        assert!(a_done < b_start, "b started before a completed");
        assert!(a_done < c_start, "c started before a completed");
        assert!(b_done < d_start && c_done < d_start, "d started early");

        // b and c were both dispatched before either completed: they ran
        // concurrently.
        assert!(b_start < c_done || c_start < b_done);
    }

    #[tokio::test]
    async fn event_sequence_is_monotonic_and_completion_is_singular() {
        let provider = ScriptedProvider::new()
            .with_plan_response(&diamond_plan("probe"))
            .with_default(r#"{"confidence": 0.9, "rationale": "fine"}"#);
        let harness = harness_with(provider, EngineConfig::default(), Duration::ZERO);

        let goal_id = create_goal(&harness, "sequence check goal").await;
        let mut rx = harness.events.subscribe(&goal_id);

        harness.orchestrator.process_goal(&goal_id).await.unwrap();
        let events = drain_events(&mut rx);

        // Scenario D: exactly one goal_completed event.
        let completions = event_positions(&events, |e| matches!(e, GoalEvent::GoalCompleted {}));
        assert_eq!(completions.len(), 1);

        // Per-goal sequence numbers increase by one with no gaps.
        for (i, envelope) in events.iter().enumerate() {
            assert_eq!(envelope.seq, (i + 1) as u64);
            assert_eq!(envelope.goal_id, goal_id);
        }

        // Dependency results reached dependent steps.
        let log = harness.call_log.lock().unwrap();
        let d_call = log.iter().find(|c| c.title == "Step d").unwrap();
        assert_eq!(d_call.dep_keys, vec!["b", "c"]);
    }
}

// =============================================================================
// Scenario B: low-confidence evaluation retries in place
// =============================================================================

mod retries {
    use super::*;

    #[tokio::test]
    async fn low_confidence_step_retries_while_siblings_proceed() {
        let provider = ScriptedProvider::new()
            .with_plan_response(&diamond_plan("probe"))
            .with_eval_rule("Step b", &[r#"{"confidence": 0.4, "rationale": "incomplete"}"#])
            .with_default(r#"{"confidence": 0.9, "rationale": "fine"}"#);
        let harness = harness_with(provider, EngineConfig::default(), Duration::ZERO);

        let goal_id = create_goal(&harness, "retry scenario goal").await;
        let mut rx = harness.events.subscribe(&goal_id);

        let goal = harness.orchestrator.process_goal(&goal_id).await.unwrap();
        assert_eq!(goal.status, GoalStatus::Completed);

        let events = drain_events(&mut rx);

        // b went through retrying with retry_count 1, then completed.
        let retrying = events
            .iter()
            .find_map(|e| match &e.event {
                GoalEvent::StepUpdate {
                    step_id,
                    status: StepStatus::Retrying,
                    retry_count,
                    error,
                    ..
                } if step_id.as_str() == "b" => Some((*retry_count, error.clone())),
                _ => None,
            })
            .expect("no retrying event for b");
        assert_eq!(retrying.0, Some(1));
        assert!(retrying.1.is_some());

        assert!(step_update_position(&events, "b", StepStatus::Completed).is_some());
        // c was never disturbed by b's retry.
        assert!(step_update_position(&events, "c", StepStatus::Retrying).is_none());

        // Persisted retry accounting matches.
        let plan = {
            let id = goal_id.clone();
            harness
                .store
                .call(move |s| s.get_active_plan(&id))
                .await
                .unwrap()
                .unwrap()
        };
        let steps = harness
            .store
            .call(move |s| s.get_steps(&plan.id))
            .await
            .unwrap();
        let b = steps.iter().find(|s| s.key == "b").unwrap();
        assert_eq!(b.retry_count, 1);
        assert_eq!(b.status, StepStatus::Completed);
    }

    #[tokio::test]
    async fn capability_failure_consumes_retry_budget_then_succeeds() {
        // The flaky capability fails twice; with max_retries 3 the step
        // recovers on its third attempt.
        let plan = json!({
            "steps": [
                {"key": "w", "title": "Wobbly step", "capabilities": ["flaky"]},
                {"key": "x", "title": "Step x", "depends_on": ["w"], "capabilities": ["probe"]},
                {"key": "y", "title": "Step y", "depends_on": ["w"], "capabilities": ["probe"]},
                {"key": "z", "title": "Step z", "depends_on": ["x", "y"], "capabilities": ["probe"]}
            ]
        })
        .to_string();
        let provider = ScriptedProvider::new()
            .with_plan_response(&plan)
            .with_default(r#"{"confidence": 0.8, "rationale": "fine"}"#);
        let harness = harness_with(provider, EngineConfig::default(), Duration::ZERO);

        let goal_id = create_goal(&harness, "flaky capability goal").await;
        let goal = harness.orchestrator.process_goal(&goal_id).await.unwrap();
        assert_eq!(goal.status, GoalStatus::Completed);

        let plan = {
            let id = goal_id.clone();
            harness
                .store
                .call(move |s| s.get_active_plan(&id))
                .await
                .unwrap()
                .unwrap()
        };
        let steps = harness
            .store
            .call(move |s| s.get_steps(&plan.id))
            .await
            .unwrap();
        let w = steps.iter().find(|s| s.key == "w").unwrap();
        assert_eq!(w.retry_count, 2);
        assert_eq!(w.status, StepStatus::Completed);
        assert!(w.retry_count <= w.max_retries);
    }
}

// =============================================================================
// Scenario C: exhaustion triggers exactly one replan with carried context
// =============================================================================

mod replanning {
    use super::*;

    fn repair_plan() -> String {
        json!({
            "steps": [
                {"key": "b", "title": "Step b repaired", "expected_outcome": "b done",
                 "depends_on": [], "capabilities": ["probe"]},
                {"key": "d", "title": "Step d", "expected_outcome": "d done",
                 "depends_on": ["b"], "capabilities": ["probe"]}
            ]
        })
        .to_string()
    }

    #[tokio::test]
    async fn exhausted_step_triggers_replan_and_carries_completed_results() {
        let provider = ScriptedProvider::new()
            .with_plan_response(&diamond_plan("probe"))
            .with_replan_response(&repair_plan())
            .with_eval_rule(
                "Step b",
                &[
                    r#"{"confidence": 0.4, "rationale": "missing detail"}"#,
                    r#"{"confidence": 0.35, "rationale": "still missing"}"#,
                    r#"{"confidence": 0.2, "rationale": "wrong entirely"}"#,
                ],
            )
            .with_default(r#"{"confidence": 0.9, "rationale": "fine"}"#);
        let harness = harness_with(provider, EngineConfig::default(), Duration::ZERO);

        let goal_id = create_goal(&harness, "replan scenario goal").await;
        let mut rx = harness.events.subscribe(&goal_id);

        let goal = harness.orchestrator.process_goal(&goal_id).await.unwrap();
        assert_eq!(goal.status, GoalStatus::Completed);

        let events = drain_events(&mut rx);

        // Exactly one replanning event, naming the triggering step.
        let replans: Vec<&EventEnvelope> = events
            .iter()
            .filter(|e| matches!(e.event, GoalEvent::Replanning { .. }))
            .collect();
        assert_eq!(replans.len(), 1);
        match &replans[0].event {
            GoalEvent::Replanning {
                triggering_step_id,
                ..
            } => assert_eq!(triggering_step_id, "b"),
            _ => unreachable!(),
        }

        // Two plan versions, v1 inactive, v2 active; versions gapless.
        let history = {
            let id = goal_id.clone();
            harness
                .store
                .call(move |s| s.plan_history(&id))
                .await
                .unwrap()
        };
        assert_eq!(history.len(), 2);
        assert_eq!(history[0].version, 1);
        assert!(!history[0].is_active);
        assert_eq!(history[1].version, 2);
        assert!(history[1].is_active);

        // In v1, b is failed with retry_count == max_retries; a and c kept
        // their completed results (partial progress stays queryable).
        let v1_id = history[0].id.clone();
        let v1_steps = harness
            .store
            .call(move |s| s.get_steps(&v1_id))
            .await
            .unwrap();
        let b1 = v1_steps.iter().find(|s| s.key == "b").unwrap();
        assert_eq!(b1.status, StepStatus::Failed);
        assert_eq!(b1.retry_count, b1.max_retries);
        let c1 = v1_steps.iter().find(|s| s.key == "c").unwrap();
        assert_eq!(c1.status, StepStatus::Completed);
        assert!(c1.result.is_some());

        // In v2, the successor b started as replanned and then ran to
        // completion.
        let v2_id = history[1].id.clone();
        let v2_steps = harness
            .store
            .call(move |s| s.get_steps(&v2_id))
            .await
            .unwrap();
        let b2 = v2_steps.iter().find(|s| s.key == "b").unwrap();
        assert_eq!(b2.status, StepStatus::Completed);
        let replanned_event = events.iter().any(|e| {
            matches!(&e.event, GoalEvent::PlanCreated { version: 2, steps, .. }
                if steps.iter().any(|s| s.key == "b" && s.status == StepStatus::Replanned))
        });
        assert!(replanned_event, "v2 plan_created must show b as replanned");

        // The repaired b saw the completed results of a and c as carried
        // context even though v2 declares no dependency on them.
        let log = harness.call_log.lock().unwrap();
        let repaired_call = log.iter().find(|c| c.title == "Step b repaired").unwrap();
        assert!(repaired_call.dep_keys.contains(&"a".to_string()));
        assert!(repaired_call.dep_keys.contains(&"c".to_string()));
    }

    #[tokio::test]
    async fn replan_budget_exhaustion_fails_the_goal_with_a_message() {
        // Every evaluation of step b fails, and every repair reproduces a
        // failing b, so the replan budget runs dry.
        let failing_eval = r#"{"confidence": 0.1, "rationale": "never good enough"}"#;
        let provider = ScriptedProvider::new()
            .with_plan_response(&diamond_plan("probe"))
            .with_replan_response(&repair_plan())
            .with_replan_response(&repair_plan())
            .with_eval_rule("Step b", &[failing_eval; 12])
            .with_default(r#"{"confidence": 0.9, "rationale": "fine"}"#);
        let harness = harness_with(
            provider,
            EngineConfig {
                max_replans: 2,
                ..EngineConfig::default()
            },
            Duration::ZERO,
        );

        let goal_id = create_goal(&harness, "replan exhaustion goal").await;
        let mut rx = harness.events.subscribe(&goal_id);

        let goal = harness.orchestrator.process_goal(&goal_id).await.unwrap();
        assert_eq!(goal.status, GoalStatus::Failed);
        assert!(goal.message.unwrap().contains("Replanning budget exhausted"));

        let events = drain_events(&mut rx);
        let failed = event_positions(&events, |e| matches!(e, GoalEvent::GoalFailed { .. }));
        assert_eq!(failed.len(), 1);

        // Two replans were attempted before giving up.
        let replans = event_positions(&events, |e| matches!(e, GoalEvent::Replanning { .. }));
        assert_eq!(replans.len(), 2);

        // Partial progress stays queryable after failure.
        let history = {
            let id = goal_id.clone();
            harness
                .store
                .call(move |s| s.plan_history(&id))
                .await
                .unwrap()
        };
        let v1_id = history[0].id.clone();
        let v1_steps = harness
            .store
            .call(move |s| s.get_steps(&v1_id))
            .await
            .unwrap();
        assert!(
            v1_steps
                .iter()
                .any(|s| s.status == StepStatus::Completed && s.result.is_some())
        );
    }

    #[tokio::test]
    async fn planning_failure_fails_the_goal() {
        let provider = ScriptedProvider::new()
            .with_plan_response("not a plan")
            .with_plan_response("{\"steps\": []}")
            .with_plan_response("still not a plan");
        let harness = harness_with(provider, EngineConfig::default(), Duration::ZERO);

        let goal_id = create_goal(&harness, "unplannable goal").await;
        let mut rx = harness.events.subscribe(&goal_id);

        let goal = harness.orchestrator.process_goal(&goal_id).await.unwrap();
        assert_eq!(goal.status, GoalStatus::Failed);
        assert!(goal.message.is_some());

        let events = drain_events(&mut rx);
        assert!(
            events
                .iter()
                .any(|e| matches!(e.event, GoalEvent::GoalFailed { .. }))
        );
    }
}

// =============================================================================
// Pause: in-flight steps finish, the rest are skipped
// =============================================================================

mod pausing {
    use super::*;

    #[tokio::test]
    async fn pause_stops_dispatch_and_skips_remaining_steps() {
        let provider = ScriptedProvider::new()
            .with_plan_response(&diamond_plan("probe"))
            .with_default(r#"{"confidence": 0.9, "rationale": "fine"}"#);
        // Slow probe so the pause lands while step a is still running.
        let harness = harness_with(
            provider,
            EngineConfig::default(),
            Duration::from_millis(300),
        );

        let goal_id = create_goal(&harness, "pause scenario goal").await;
        harness.orchestrator.clone().spawn_goal(&goal_id);

        // Pause once step a is actually in flight, so the request lands
        // mid-execution rather than mid-planning.
        let mut in_flight = false;
        for _ in 0..100 {
            tokio::time::sleep(Duration::from_millis(10)).await;
            let id = goal_id.clone();
            let started = harness
                .store
                .call(move |s| {
                    match s.get_active_plan(&id)? {
                        Some(plan) => Ok(s
                            .get_steps(&plan.id)?
                            .iter()
                            .any(|step| step.status == StepStatus::InProgress)),
                        None => Ok(false),
                    }
                })
                .await
                .unwrap();
            if started {
                in_flight = true;
                break;
            }
        }
        assert!(in_flight, "step a never started");
        assert!(harness.orchestrator.pause_goal(&goal_id));

        // Wait for the workflow to settle into paused.
        let mut paused_goal = None;
        for _ in 0..50 {
            tokio::time::sleep(Duration::from_millis(100)).await;
            let id = goal_id.clone();
            let goal = harness
                .store
                .call(move |s| s.get_goal(&id))
                .await
                .unwrap()
                .unwrap();
            if goal.status == GoalStatus::Paused {
                paused_goal = Some(goal);
                break;
            }
        }
        let goal = paused_goal.expect("goal never reached paused");
        assert_eq!(goal.status, GoalStatus::Paused);

        // The in-flight step finished normally; downstream steps were
        // skipped, none left in_progress.
        let plan = {
            let id = goal_id.clone();
            harness
                .store
                .call(move |s| s.get_active_plan(&id))
                .await
                .unwrap()
                .unwrap()
        };
        let steps = harness
            .store
            .call(move |s| s.get_steps(&plan.id))
            .await
            .unwrap();
        let a = steps.iter().find(|s| s.key == "a").unwrap();
        assert_eq!(a.status, StepStatus::Completed);
        for key in ["b", "c", "d"] {
            let step = steps.iter().find(|s| s.key == key).unwrap();
            assert_eq!(step.status, StepStatus::Skipped, "step {} not skipped", key);
        }
    }
}

// =============================================================================
// Scenario E: observer reconnect backoff
// =============================================================================

mod reconnect {
    use super::*;

    #[test]
    fn backoff_schedule_matches_the_spec_formula() {
        let backoff = ReconnectBackoff::default();
        // ~1.5s, ~3s, ~6s, then capped at 15s.
        assert_eq!(backoff.delay(1).as_millis(), 1500);
        assert_eq!(backoff.delay(2).as_millis(), 3000);
        assert_eq!(backoff.delay(3).as_millis(), 6000);
        assert_eq!(backoff.delay(10).as_secs(), 15);
    }
}

// =============================================================================
// Concurrent goals stay independent
// =============================================================================

mod isolation {
    use super::*;

    #[tokio::test]
    async fn two_goals_run_independent_workflows() {
        let provider = ScriptedProvider::new()
            .with_plan_response(&diamond_plan("probe"))
            .with_plan_response(&diamond_plan("probe"))
            .with_default(r#"{"confidence": 0.9, "rationale": "fine"}"#);
        let harness = harness_with(provider, EngineConfig::default(), Duration::ZERO);

        let goal_a = create_goal(&harness, "first independent goal").await;
        let goal_b = create_goal(&harness, "second independent goal").await;

        let (ra, rb) = tokio::join!(
            harness.orchestrator.process_goal(&goal_a),
            harness.orchestrator.process_goal(&goal_b),
        );
        assert_eq!(ra.unwrap().status, GoalStatus::Completed);
        assert_eq!(rb.unwrap().status, GoalStatus::Completed);

        // Each goal has its own plan chain.
        for goal_id in [goal_a, goal_b] {
            let history = harness
                .store
                .call(move |s| s.plan_history(&goal_id))
                .await
                .unwrap();
            assert_eq!(history.len(), 1);
            assert_eq!(history[0].version, 1);
        }
    }

    #[tokio::test]
    async fn duplicate_workflow_for_one_goal_is_rejected() {
        let provider = ScriptedProvider::new()
            .with_plan_response(&diamond_plan("probe"))
            .with_default(r#"{"confidence": 0.9, "rationale": "fine"}"#);
        // Slow steps keep the first workflow alive while the second starts.
        let harness = harness_with(
            provider,
            EngineConfig::default(),
            Duration::from_millis(200),
        );

        let goal_id = create_goal(&harness, "exclusive workflow goal").await;
        harness.orchestrator.clone().spawn_goal(&goal_id);
        tokio::time::sleep(Duration::from_millis(50)).await;

        let err = harness.orchestrator.process_goal(&goal_id).await;
        assert!(matches!(err, Err(OrchestrateError::Other(_))));
    }
}

// =============================================================================
// CLI smoke tests
// =============================================================================

mod cli {
    use assert_cmd::Command;
    use predicates::prelude::*;

    fn waypoint() -> Command {
        Command::cargo_bin("waypoint").unwrap()
    }

    #[test]
    fn help_and_version() {
        waypoint().arg("--help").assert().success();
        waypoint().arg("--version").assert().success();
    }

    #[test]
    fn run_completes_a_goal_offline() {
        // No providers configured: the offline scripted provider plans and
        // every evaluation passes.
        waypoint()
            .env_remove("WAYPOINT_PRIMARY_URL")
            .env_remove("WAYPOINT_SECONDARY_URL")
            .env_remove("WAYPOINT_TERTIARY_URL")
            .args(["run", "draft a study schedule for my certification exam"])
            .assert()
            .success()
            .stdout(predicate::str::contains("goal_completed"))
            .stdout(predicate::str::contains("completed"));
    }

    #[test]
    fn run_with_db_writes_durable_records() {
        let dir = tempfile::TempDir::new().unwrap();
        let db = dir.path().join("waypoint.db");

        waypoint()
            .env_remove("WAYPOINT_PRIMARY_URL")
            .env_remove("WAYPOINT_SECONDARY_URL")
            .env_remove("WAYPOINT_TERTIARY_URL")
            .args(["run", "outline a migration plan for the billing service"])
            .arg("--db")
            .arg(&db)
            .assert()
            .success();

        assert!(db.exists());
    }
}

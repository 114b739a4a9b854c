//! REST + SSE surface for goal management.
//!
//! The read endpoints are plain CRUD over the store; the stream endpoint
//! exposes the per-goal event sequence as Server-Sent Events, filling idle
//! periods with heartbeats. The stream is non-authoritative: a reconnecting
//! observer re-fetches goal/plan/step state to reconcile missed events.

use std::convert::Infallible;
use std::sync::Arc;
use std::time::Duration;

use axum::{
    Json, Router,
    extract::{Path, State},
    http::StatusCode,
    response::{
        IntoResponse, Response,
        sse::{Event as SseEvent, Sse},
    },
    routing::{get, post},
};
use futures_util::Stream;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

use crate::events::EventBus;
use crate::model::{AgentLog, Goal, GoalStatus, Plan, Step};
use crate::orchestrator::Orchestrator;
use crate::store::StoreHandle;

/// Minimum length of a goal's input text.
const MIN_GOAL_INPUT_CHARS: usize = 5;

// ── Shared application state ──────────────────────────────────────────

pub struct AppState {
    pub store: StoreHandle,
    pub orchestrator: Arc<Orchestrator>,
    pub events: Arc<EventBus>,
    pub heartbeat_interval: Duration,
}

pub type SharedState = Arc<AppState>;

// ── Request / response payload types ──────────────────────────────────

#[derive(Deserialize)]
pub struct CreateGoalRequest {
    pub input: String,
}

#[derive(Serialize)]
pub struct GoalAccepted {
    pub goal_id: String,
    pub status: GoalStatus,
    pub message: String,
}

#[derive(Serialize)]
pub struct PlanView {
    #[serde(flatten)]
    pub plan: Plan,
    pub steps: Vec<Step>,
}

#[derive(Serialize)]
pub struct GoalDetail {
    pub goal: Goal,
    pub plan: Option<PlanView>,
    pub log_count: i64,
}

#[derive(Serialize)]
pub struct PauseResult {
    pub paused: bool,
}

// ── Error handling ────────────────────────────────────────────────────

pub enum ApiError {
    NotFound(String),
    BadRequest(String),
    Internal(String),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, message) = match self {
            ApiError::NotFound(msg) => (StatusCode::NOT_FOUND, msg),
            ApiError::BadRequest(msg) => (StatusCode::BAD_REQUEST, msg),
            ApiError::Internal(msg) => (StatusCode::INTERNAL_SERVER_ERROR, msg),
        };
        (status, Json(serde_json::json!({"error": message}))).into_response()
    }
}

impl From<anyhow::Error> for ApiError {
    fn from(err: anyhow::Error) -> Self {
        ApiError::Internal(err.to_string())
    }
}

// ── Router ────────────────────────────────────────────────────────────

pub fn api_router() -> Router<SharedState> {
    Router::new()
        .route("/api/goals", get(list_goals).post(create_goal))
        .route("/api/goals/{id}", get(get_goal))
        .route("/api/goals/{id}/plan", get(get_active_plan))
        .route("/api/goals/{id}/plan/history", get(get_plan_history))
        .route("/api/goals/{id}/logs", get(get_goal_logs))
        .route("/api/goals/{id}/pause", post(pause_goal))
        .route("/api/goals/{id}/stream", get(stream_goal))
        .route("/health", get(health_check))
}

// ── Handlers ──────────────────────────────────────────────────────────

async fn health_check() -> impl IntoResponse {
    Json(serde_json::json!({"status": "ok"}))
}

/// Accept a goal and begin async processing. Returns 202 immediately;
/// progress arrives on the stream endpoint.
async fn create_goal(
    State(state): State<SharedState>,
    Json(request): Json<CreateGoalRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let input = request.input.trim().to_string();
    if input.chars().count() < MIN_GOAL_INPUT_CHARS {
        return Err(ApiError::BadRequest(format!(
            "goal input must be at least {} characters",
            MIN_GOAL_INPUT_CHARS
        )));
    }

    let goal = Goal::new(&input);
    let goal_id = goal.id.clone();
    state
        .store
        .call(move |store| store.create_goal(&goal))
        .await?;

    state.orchestrator.clone().spawn_goal(&goal_id);

    Ok((
        StatusCode::ACCEPTED,
        Json(GoalAccepted {
            goal_id: goal_id.clone(),
            status: GoalStatus::Received,
            message: format!(
                "Goal received; processing started. Stream updates at /api/goals/{}/stream",
                goal_id
            ),
        }),
    ))
}

async fn list_goals(State(state): State<SharedState>) -> Result<Json<Vec<Goal>>, ApiError> {
    let goals = state.store.call(|store| store.list_goals()).await?;
    Ok(Json(goals))
}

async fn get_goal(
    State(state): State<SharedState>,
    Path(goal_id): Path<String>,
) -> Result<Json<GoalDetail>, ApiError> {
    let detail = {
        let id = goal_id.clone();
        state
            .store
            .call(move |store| {
                let Some(goal) = store.get_goal(&id)? else {
                    return Ok(None);
                };
                let plan = match store.get_active_plan(&id)? {
                    Some(plan) => {
                        let steps = store.get_steps(&plan.id)?;
                        Some(PlanView { plan, steps })
                    }
                    None => None,
                };
                let log_count = store.count_logs_for_goal(&id)?;
                Ok(Some(GoalDetail {
                    goal,
                    plan,
                    log_count,
                }))
            })
            .await?
    };

    detail
        .map(Json)
        .ok_or_else(|| ApiError::NotFound(format!("Goal {} not found", goal_id)))
}

async fn get_active_plan(
    State(state): State<SharedState>,
    Path(goal_id): Path<String>,
) -> Result<Json<PlanView>, ApiError> {
    let plan = {
        let id = goal_id.clone();
        state
            .store
            .call(move |store| {
                match store.get_active_plan(&id)? {
                    Some(plan) => {
                        let steps = store.get_steps(&plan.id)?;
                        Ok(Some(PlanView { plan, steps }))
                    }
                    None => Ok(None),
                }
            })
            .await?
    };

    plan.map(Json)
        .ok_or_else(|| ApiError::NotFound(format!("No active plan for goal {}", goal_id)))
}

/// All plan versions, oldest first: the immutable audit trail.
async fn get_plan_history(
    State(state): State<SharedState>,
    Path(goal_id): Path<String>,
) -> Result<Json<Vec<PlanView>>, ApiError> {
    let history = state
        .store
        .call(move |store| {
            store
                .plan_history(&goal_id)?
                .into_iter()
                .map(|plan| {
                    let steps = store.get_steps(&plan.id)?;
                    Ok(PlanView { plan, steps })
                })
                .collect::<anyhow::Result<Vec<_>>>()
        })
        .await?;
    Ok(Json(history))
}

async fn get_goal_logs(
    State(state): State<SharedState>,
    Path(goal_id): Path<String>,
) -> Result<Json<Vec<AgentLog>>, ApiError> {
    let logs = state
        .store
        .call(move |store| store.logs_for_goal(&goal_id))
        .await?;
    Ok(Json(logs))
}

async fn pause_goal(
    State(state): State<SharedState>,
    Path(goal_id): Path<String>,
) -> Result<Json<PauseResult>, ApiError> {
    let exists = {
        let id = goal_id.clone();
        state
            .store
            .call(move |store| store.get_goal(&id))
            .await?
            .is_some()
    };
    if !exists {
        return Err(ApiError::NotFound(format!("Goal {} not found", goal_id)));
    }

    let paused = state.orchestrator.pause_goal(&goal_id);
    Ok(Json(PauseResult { paused }))
}

/// Server-Sent Events stream of a goal's events. Heartbeats fill idle
/// periods; the stream ends after a terminal event. Delivery is
/// at-most-once: a lagged observer is told to reconnect and re-fetch.
async fn stream_goal(
    State(state): State<SharedState>,
    Path(goal_id): Path<String>,
) -> Result<Sse<impl Stream<Item = Result<SseEvent, Infallible>>>, ApiError> {
    let exists = {
        let id = goal_id.clone();
        state
            .store
            .call(move |store| store.get_goal(&id))
            .await?
            .is_some()
    };
    if !exists {
        return Err(ApiError::NotFound(format!("Goal {} not found", goal_id)));
    }

    let rx = state.events.subscribe(&goal_id);
    let heartbeat = state.heartbeat_interval;

    let stream = futures_util::stream::unfold((rx, false), move |(mut rx, done)| async move {
        if done {
            return None;
        }
        match tokio::time::timeout(heartbeat, rx.recv()).await {
            Ok(Ok(envelope)) => {
                let terminal = envelope.event.is_terminal();
                let data = serde_json::to_string(&envelope)
                    .unwrap_or_else(|_| "{}".to_string());
                let event = SseEvent::default().event(envelope.event.kind()).data(data);
                Some((Ok(event), (rx, terminal)))
            }
            Ok(Err(broadcast::error::RecvError::Lagged(missed))) => {
                // This observer fell behind; end its stream so it
                // reconnects and re-fetches authoritative state.
                let event = SseEvent::default().event("error").data(format!(
                    "{{\"message\":\"stream lagged; {} events dropped, re-fetch goal state\"}}",
                    missed
                ));
                Some((Ok(event), (rx, true)))
            }
            Ok(Err(broadcast::error::RecvError::Closed)) => None,
            Err(_elapsed) => {
                let event = SseEvent::default().event("heartbeat").data("{}");
                Some((Ok(event), (rx, false)))
            }
        }
    });

    Ok(Sse::new(stream))
}

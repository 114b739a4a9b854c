//! Per-goal event stream: typed events, ordered publication, and the
//! observer reconnect backoff schedule.
//!
//! Events are published in the exact order the orchestrator applies the
//! corresponding transitions, with a monotonic per-goal sequence number
//! assigned under the bus lock. Delivery to any observer is at-most-once
//! best-effort over a broadcast channel: a lagged or disconnected observer
//! misses events and must re-fetch goal/plan/step state to reconcile.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

use crate::model::{GoalStatus, Step, StepPriority, StepStatus};

/// Broadcast buffer per goal; slow observers past this lag miss events.
const CHANNEL_CAPACITY: usize = 256;

/// Compact step view carried in `plan_created` events.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepSummary {
    pub key: String,
    pub title: String,
    pub status: StepStatus,
    pub priority: StepPriority,
    pub depends_on: Vec<String>,
}

impl From<&Step> for StepSummary {
    fn from(step: &Step) -> Self {
        Self {
            key: step.key.clone(),
            title: step.title.clone(),
            status: step.status,
            priority: step.priority,
            depends_on: step.depends_on.clone(),
        }
    }
}

/// Typed events published per goal.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "snake_case")]
pub enum GoalEvent {
    GoalStatus {
        status: GoalStatus,
        message: String,
    },
    PlanCreated {
        plan_id: String,
        version: i64,
        steps: Vec<StepSummary>,
        #[serde(skip_serializing_if = "Option::is_none")]
        message: Option<String>,
    },
    StepUpdate {
        step_id: String,
        title: String,
        status: StepStatus,
        #[serde(skip_serializing_if = "Option::is_none")]
        error: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        retry_count: Option<u32>,
    },
    Replanning {
        message: String,
        triggering_step_id: String,
    },
    GoalCompleted {},
    GoalFailed {
        message: String,
    },
    Error {
        message: String,
    },
    Heartbeat {},
}

impl GoalEvent {
    /// SSE event name; matches the serialized `type` tag.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::GoalStatus { .. } => "goal_status",
            Self::PlanCreated { .. } => "plan_created",
            Self::StepUpdate { .. } => "step_update",
            Self::Replanning { .. } => "replanning",
            Self::GoalCompleted {} => "goal_completed",
            Self::GoalFailed { .. } => "goal_failed",
            Self::Error { .. } => "error",
            Self::Heartbeat {} => "heartbeat",
        }
    }

    /// Terminal events end the goal's stream.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::GoalCompleted {} | Self::GoalFailed { .. } | Self::Error { .. }
        )
    }
}

/// One published event with its ordering metadata.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventEnvelope {
    pub goal_id: String,
    pub seq: u64,
    pub timestamp: DateTime<Utc>,
    #[serde(flatten)]
    pub event: GoalEvent,
}

struct GoalChannel {
    tx: broadcast::Sender<EventEnvelope>,
    next_seq: u64,
}

/// Per-goal broadcast bus. The orchestrator publishes; API streams
/// subscribe. Sequence numbers are assigned under the bus lock so the
/// published order is the applied order.
pub struct EventBus {
    channels: Mutex<HashMap<String, GoalChannel>>,
}

impl EventBus {
    pub fn new() -> Self {
        Self {
            channels: Mutex::new(HashMap::new()),
        }
    }

    /// Publish an event for a goal, assigning the next sequence number.
    /// Returns the assigned number. Absent observers are not an error.
    pub fn publish(&self, goal_id: &str, event: GoalEvent) -> u64 {
        let mut channels = self.channels.lock().unwrap();
        let channel = channels
            .entry(goal_id.to_string())
            .or_insert_with(|| GoalChannel {
                tx: broadcast::channel(CHANNEL_CAPACITY).0,
                next_seq: 1,
            });

        let envelope = EventEnvelope {
            goal_id: goal_id.to_string(),
            seq: channel.next_seq,
            timestamp: Utc::now(),
            event,
        };
        channel.next_seq += 1;
        let _ = channel.tx.send(envelope.clone());
        envelope.seq
    }

    /// Subscribe to a goal's events from now on. There is no replay: the
    /// stream is non-authoritative and state is re-derivable from the
    /// read surface.
    pub fn subscribe(&self, goal_id: &str) -> broadcast::Receiver<EventEnvelope> {
        let mut channels = self.channels.lock().unwrap();
        channels
            .entry(goal_id.to_string())
            .or_insert_with(|| GoalChannel {
                tx: broadcast::channel(CHANNEL_CAPACITY).0,
                next_seq: 1,
            })
            .tx
            .subscribe()
    }

    /// Drop a finished goal's channel once observers are gone.
    pub fn forget(&self, goal_id: &str) {
        let mut channels = self.channels.lock().unwrap();
        if let Some(channel) = channels.get(goal_id)
            && channel.tx.receiver_count() == 0
        {
            channels.remove(goal_id);
        }
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

/// Capped exponential backoff schedule observers use between reconnect
/// attempts: `min(base * 2^(n-1), cap)`.
#[derive(Debug, Clone, Copy)]
pub struct ReconnectBackoff {
    pub base: Duration,
    pub cap: Duration,
}

impl Default for ReconnectBackoff {
    fn default() -> Self {
        Self {
            base: Duration::from_millis(1500),
            cap: Duration::from_secs(15),
        }
    }
}

impl ReconnectBackoff {
    /// Delay before reconnect attempt `n` (1-based).
    pub fn delay(&self, attempt: u32) -> Duration {
        let exp = attempt.saturating_sub(1).min(32);
        let millis = (self.base.as_millis() as u64).saturating_mul(1u64 << exp);
        Duration::from_millis(millis).min(self.cap)
    }
}

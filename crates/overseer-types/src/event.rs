// Append-only per-run event records: the trajectory.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::prefixed_id;

/// Well-known event types. Payloads are open maps; these constants are the
/// only coupling between producers and replay.
pub mod kind {
    pub const RUN_STARTED: &str = "run.started";
    pub const RUN_TOOLCALL: &str = "run.toolcall";
    pub const RUN_OUTPUT: &str = "run.output";
    pub const RUN_COMPLETED: &str = "run.completed";
    pub const RUN_FAILED: &str = "run.failed";
    pub const RUN_CANCELLED: &str = "run.cancelled";
    pub const RUN_TIMEOUT: &str = "run.timeout";
    pub const RUN_CHECKPOINT: &str = "run.checkpoint";
    pub const RUN_DELIVERED: &str = "run.delivered";
    pub const RUN_GATE: &str = "run.gate";
    pub const RUN_RESUMED: &str = "run.resumed";
}

/// Phase tag carried in `run.toolcall` payloads
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ToolCallPhase {
    Requested,
    Approved,
    Denied,
    Ask,
    Result,
}

impl ToolCallPhase {
    pub fn as_str(&self) -> &'static str {
        match self {
            ToolCallPhase::Requested => "requested",
            ToolCallPhase::Approved => "approved",
            ToolCallPhase::Denied => "denied",
            ToolCallPhase::Ask => "ask",
            ToolCallPhase::Result => "result",
        }
    }
}

/// One record of a run's trajectory.
///
/// `version` is assigned by the event store: dense, strictly increasing,
/// starting at 1 within a run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    pub id: String,
    pub run_id: String,
    pub task_id: String,
    pub agent_id: String,
    #[serde(rename = "type")]
    pub event_type: String,
    pub payload: Value,
    pub version: u64,
    pub created_at: DateTime<Utc>,
}

impl Event {
    /// Build an unsequenced event; the store assigns `version` on append.
    pub fn new(
        run_id: impl Into<String>,
        task_id: impl Into<String>,
        agent_id: impl Into<String>,
        event_type: impl Into<String>,
        payload: Value,
    ) -> Self {
        Self {
            id: prefixed_id("evt"),
            run_id: run_id.into(),
            task_id: task_id.into(),
            agent_id: agent_id.into(),
            event_type: event_type.into(),
            payload,
            version: 0,
            created_at: Utc::now(),
        }
    }
}

/// Filter for trajectory queries
#[derive(Debug, Clone, Default)]
pub struct TrajectoryFilter {
    /// Keep only these event types; empty keeps everything
    pub types: Vec<String>,
    pub after: Option<DateTime<Utc>>,
    pub before: Option<DateTime<Utc>>,
}

/// One page of a trajectory query
#[derive(Debug, Clone, Serialize)]
pub struct TrajectoryPage {
    pub events: Vec<Event>,
    /// Opaque cursor for the next page; absent on the last page
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cursor: Option<String>,
    pub has_more: bool,
    pub total: u64,
}

/// Aggregate statistics over a run's trajectory
#[derive(Debug, Clone, Default, Serialize)]
pub struct TrajectoryStats {
    pub total_events: u64,
    pub counts_by_type: std::collections::HashMap<String, u64>,
    pub duration_ms: u64,
    pub tool_call_count: u64,
    pub error_count: u64,
}

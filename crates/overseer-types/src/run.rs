// Run entity: one execution of one step by one agent.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::prefixed_id;

// ============================================================================
// Run status
// ============================================================================

/// Status of a run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    /// Created, start not yet published
    Pending,
    Running,
    Completed,
    Failed,
    Cancelled,
    /// Wall-clock bound exceeded
    Timeout,
}

impl RunStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            RunStatus::Completed | RunStatus::Failed | RunStatus::Cancelled | RunStatus::Timeout
        )
    }
}

/// Reason code attached to every failed or force-terminated run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureReason {
    HeartbeatLost,
    MaxSteps,
    MaxCost,
    Timeout,
    Stall,
    QualityGate,
    WorkerError,
    CancelledByUser,
    CancelledByPlan,
    Fatal,
}

impl FailureReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            FailureReason::HeartbeatLost => "heartbeat_lost",
            FailureReason::MaxSteps => "max_steps",
            FailureReason::MaxCost => "max_cost",
            FailureReason::Timeout => "timeout",
            FailureReason::Stall => "stall",
            FailureReason::QualityGate => "quality_gate",
            FailureReason::WorkerError => "worker_error",
            FailureReason::CancelledByUser => "cancelled_by_user",
            FailureReason::CancelledByPlan => "cancelled_by_plan",
            FailureReason::Fatal => "fatal",
        }
    }
}

/// Reason code plus free-text detail for a terminated run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunError {
    pub reason: FailureReason,
    pub detail: String,
}

impl RunError {
    pub fn new(reason: FailureReason, detail: impl Into<String>) -> Self {
        Self {
            reason,
            detail: detail.into(),
        }
    }
}

// ============================================================================
// Run
// ============================================================================

/// One execution of one step by one agent
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Run {
    pub id: String,
    /// Owning step; absent for ad-hoc runs started via a session
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub step_id: Option<String>,
    pub task_id: String,
    pub project_id: String,
    pub status: RunStatus,
    /// Tool calls observed so far; monotone while running
    pub step_count: u64,
    /// Accumulated spend; monotone while running
    pub cost_usd: f64,
    pub tokens_in: u64,
    pub tokens_out: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    /// Set iff the run is terminal
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ended_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_heartbeat_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<RunError>,
    pub tenant_id: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Run {
    pub fn new(
        tenant_id: impl Into<String>,
        project_id: impl Into<String>,
        task_id: impl Into<String>,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: prefixed_id("run"),
            step_id: None,
            task_id: task_id.into(),
            project_id: project_id.into(),
            status: RunStatus::Pending,
            step_count: 0,
            cost_usd: 0.0,
            tokens_in: 0,
            tokens_out: 0,
            model: None,
            started_at: None,
            ended_at: None,
            last_heartbeat_at: None,
            session_id: None,
            error: None,
            tenant_id: tenant_id.into(),
            created_at: now,
            updated_at: now,
        }
    }
}

// ============================================================================
// Checkpoints
// ============================================================================

/// A shadow-repository snapshot taken at an event sequence within a run
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Checkpoint {
    pub run_id: String,
    /// Event version the snapshot was taken at
    pub sequence: u64,
    pub commit_hash: String,
    pub created_at: DateTime<Utc>,
}

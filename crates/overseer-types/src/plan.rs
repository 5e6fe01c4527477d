// Plan and step entities for the DAG executor.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::prefixed_id;

// ============================================================================
// Protocols
// ============================================================================

/// Scheduling strategy for a plan
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PlanProtocol {
    /// One step at a time, dependency order
    Sequential,
    /// Up to `max_parallel` concurrent steps
    Parallel,
    /// Exactly two steps alternating until convergence or max rounds
    PingPong,
    /// N steps over the same task; majority output wins
    Consensus,
}

/// Status of a plan
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PlanStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl PlanStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            PlanStatus::Completed | PlanStatus::Failed | PlanStatus::Cancelled
        )
    }
}

// ============================================================================
// Steps
// ============================================================================

/// State of a step in the DAG
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    /// Waiting for dependencies
    Pending,
    /// Owning run is live
    Running,
    Completed,
    Failed,
    /// Dependency failed; never started
    Skipped,
    Cancelled,
}

impl StepStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            StepStatus::Completed
                | StepStatus::Failed
                | StepStatus::Skipped
                | StepStatus::Cancelled
        )
    }
}

/// How a step's artifact is materialised on completion
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeliverMode {
    Patch,
    Commit,
    Branch,
    PullRequest,
}

impl Default for DeliverMode {
    fn default() -> Self {
        DeliverMode::Patch
    }
}

/// A single step in a plan's DAG
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Step {
    pub id: String,
    pub plan_id: String,
    /// Task this step executes
    pub task_id: String,
    /// Agent backend the step is bound to
    pub agent_id: String,
    /// Policy profile name applied to the step's run
    pub policy_profile: String,
    #[serde(default)]
    pub deliver_mode: DeliverMode,
    /// IDs of steps that must complete before this one
    #[serde(default)]
    pub depends_on: Vec<String>,
    pub status: StepStatus,
    /// Owning run, set while running and kept for the last round
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub run_id: Option<String>,
    /// Ping-pong round counter
    #[serde(default)]
    pub round: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Final artifact content, used for consensus grouping and
    /// ping-pong convergence tags
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output: Option<String>,
}

impl Step {
    pub fn new(
        plan_id: impl Into<String>,
        task_id: impl Into<String>,
        agent_id: impl Into<String>,
        policy_profile: impl Into<String>,
    ) -> Self {
        Self {
            id: prefixed_id("step"),
            plan_id: plan_id.into(),
            task_id: task_id.into(),
            agent_id: agent_id.into(),
            policy_profile: policy_profile.into(),
            deliver_mode: DeliverMode::default(),
            depends_on: Vec::new(),
            status: StepStatus::Pending,
            run_id: None,
            round: 0,
            error: None,
            output: None,
        }
    }

    pub fn with_depends_on(mut self, deps: Vec<String>) -> Self {
        self.depends_on = deps;
        self
    }
}

// ============================================================================
// Plans
// ============================================================================

/// A complete orchestration plan: an acyclic step graph plus protocol
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Plan {
    pub id: String,
    pub project_id: String,
    pub protocol: PlanProtocol,
    /// Fan-out cap for the `parallel` protocol; 0 means the global default
    #[serde(default)]
    pub max_parallel: u32,
    pub status: PlanStatus,
    pub steps: Vec<Step>,
    /// Monotonic, bumped on every mutation
    pub version: u64,
    /// Keep scheduling unaffected branches after a step fails
    #[serde(default)]
    pub continue_on_failure: bool,
    /// Consensus quorum; 0 means strict majority
    #[serde(default)]
    pub consensus_quorum: u32,
    /// Ping-pong round cap; 0 means the configured default
    #[serde(default)]
    pub max_rounds: u32,
    pub tenant_id: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Plan {
    pub fn new(
        tenant_id: impl Into<String>,
        project_id: impl Into<String>,
        protocol: PlanProtocol,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: prefixed_id("plan"),
            project_id: project_id.into(),
            protocol,
            max_parallel: 0,
            status: PlanStatus::Pending,
            steps: Vec::new(),
            version: 1,
            continue_on_failure: false,
            consensus_quorum: 0,
            max_rounds: 0,
            tenant_id: tenant_id.into(),
            created_at: now,
            updated_at: now,
        }
    }

    pub fn step(&self, step_id: &str) -> Option<&Step> {
        self.steps.iter().find(|s| s.id == step_id)
    }

    pub fn step_mut(&mut self, step_id: &str) -> Option<&mut Step> {
        self.steps.iter_mut().find(|s| s.id == step_id)
    }

    pub fn running_count(&self) -> usize {
        self.steps
            .iter()
            .filter(|s| s.status == StepStatus::Running)
            .count()
    }

    pub fn all_steps_terminal(&self) -> bool {
        self.steps.iter().all(|s| s.status.is_terminal())
    }
}

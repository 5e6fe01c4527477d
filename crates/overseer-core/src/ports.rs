// Collaborator ports
// Capability traits crossing the core boundary. Adapters (relational store,
// git, LLM gateway, webhooks) live outside the core and are selected at
// startup.

use async_trait::async_trait;
use serde_json::Value;

use overseer_types::{Checkpoint, Plan, PolicyProfile, RequestContext, Run, Session};

use crate::error::Result;

// ============================================================================
// Persistence
// ============================================================================

/// Persistence port for domain entities. Missing entities surface as
/// `OverseerError::NotFound`.
#[async_trait]
pub trait Repository: Send + Sync {
    async fn save_run(&self, ctx: &RequestContext, run: &Run) -> Result<()>;
    async fn load_run(&self, ctx: &RequestContext, run_id: &str) -> Result<Run>;
    async fn list_runs(&self, ctx: &RequestContext, project_id: &str) -> Result<Vec<Run>>;
    async fn delete_run(&self, ctx: &RequestContext, run_id: &str) -> Result<()>;

    async fn save_plan(&self, ctx: &RequestContext, plan: &Plan) -> Result<()>;
    async fn load_plan(&self, ctx: &RequestContext, plan_id: &str) -> Result<Plan>;
    async fn list_plans(&self, ctx: &RequestContext, project_id: &str) -> Result<Vec<Plan>>;

    async fn save_session(&self, ctx: &RequestContext, session: &Session) -> Result<()>;
    async fn load_session(&self, ctx: &RequestContext, session_id: &str) -> Result<Session>;

    async fn save_checkpoint(&self, ctx: &RequestContext, checkpoint: &Checkpoint) -> Result<()>;
    async fn list_checkpoints(&self, ctx: &RequestContext, run_id: &str) -> Result<Vec<Checkpoint>>;
    async fn delete_checkpoints(&self, ctx: &RequestContext, run_id: &str) -> Result<()>;

    async fn save_profile(&self, ctx: &RequestContext, profile: &PolicyProfile) -> Result<()>;
    async fn load_profile(&self, ctx: &RequestContext, name: &str) -> Result<PolicyProfile>;
    async fn list_profiles(&self, ctx: &RequestContext) -> Result<Vec<PolicyProfile>>;
}

// ============================================================================
// Language model gateway
// ============================================================================

#[derive(Debug, Clone)]
pub struct ChatMessage {
    pub role: String,
    pub content: String,
}

impl ChatMessage {
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: "system".to_string(),
            content: content.into(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: "user".to_string(),
            content: content.into(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct ChatCompletion {
    pub content: String,
    pub tool_calls: Vec<Value>,
    pub tokens_in: u64,
    pub tokens_out: u64,
    pub cost_usd: f64,
}

/// Chat-completion interface; the plan decomposer is its only core caller.
#[async_trait]
pub trait LLMGateway: Send + Sync {
    async fn chat_completion(
        &self,
        ctx: &RequestContext,
        messages: &[ChatMessage],
        model: &str,
        max_tokens: u32,
        tools: Option<&Value>,
    ) -> Result<ChatCompletion>;
}

// ============================================================================
// Version control
// ============================================================================

/// Version-control capability set, used by the checkpoint service and the
/// delivery module. Variants (git, svn, in-memory shadow) are selected at
/// startup.
#[async_trait]
pub trait VersionControl: Send + Sync {
    async fn clone_repo(&self, ctx: &RequestContext, source: &str, workspace: &str) -> Result<()>;
    async fn status(&self, ctx: &RequestContext, workspace: &str) -> Result<String>;
    async fn diff(&self, ctx: &RequestContext, workspace: &str) -> Result<String>;
    /// Commit the working tree; returns the commit hash.
    async fn commit(&self, ctx: &RequestContext, workspace: &str, message: &str) -> Result<String>;
    async fn push(&self, ctx: &RequestContext, workspace: &str, branch: &str) -> Result<()>;
    async fn create_branch(&self, ctx: &RequestContext, workspace: &str, name: &str) -> Result<()>;
    /// Open a pull request; returns its URL.
    async fn open_pull_request(
        &self,
        ctx: &RequestContext,
        workspace: &str,
        branch: &str,
        title: &str,
        body: &str,
    ) -> Result<String>;
    /// Reset the working tree to a known commit; the rewind primitive.
    async fn reset_hard(&self, ctx: &RequestContext, workspace: &str, commit: &str) -> Result<()>;
}

// ============================================================================
// Notifier
// ============================================================================

/// Fan-out to external observers (websockets, webhooks).
#[async_trait]
pub trait Notifier: Send + Sync {
    async fn publish(&self, ctx: &RequestContext, event_type: &str, payload: Value) -> Result<()>;
}

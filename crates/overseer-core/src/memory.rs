// In-memory port implementations: the compiled-in defaults for tests and
// single-process deployments.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::RwLock;

use overseer_types::{Checkpoint, Plan, PolicyProfile, RequestContext, Run, Session};

use crate::error::{OverseerError, Result};
use crate::policy_presets;
use crate::ports::{Notifier, Repository, VersionControl};

// ============================================================================
// Repository
// ============================================================================

#[derive(Default)]
struct MemoryState {
    runs: HashMap<String, Run>,
    plans: HashMap<String, Plan>,
    sessions: HashMap<String, Session>,
    checkpoints: HashMap<String, Vec<Checkpoint>>,
    profiles: HashMap<String, PolicyProfile>,
}

/// HashMap-backed repository guarded by one RwLock.
#[derive(Clone, Default)]
pub struct MemoryRepository {
    state: Arc<RwLock<MemoryState>>,
}

impl MemoryRepository {
    pub fn new() -> Self {
        Self::default()
    }

    /// A repository pre-seeded with the compiled-in policy presets.
    pub async fn with_builtin_profiles() -> Self {
        let repo = Self::new();
        {
            let mut state = repo.state.write().await;
            for profile in policy_presets::builtin_profiles() {
                state.profiles.insert(profile.name.clone(), profile);
            }
        }
        repo
    }
}

#[async_trait]
impl Repository for MemoryRepository {
    async fn save_run(&self, _ctx: &RequestContext, run: &Run) -> Result<()> {
        let mut state = self.state.write().await;
        state.runs.insert(run.id.clone(), run.clone());
        Ok(())
    }

    async fn load_run(&self, _ctx: &RequestContext, run_id: &str) -> Result<Run> {
        let state = self.state.read().await;
        state
            .runs
            .get(run_id)
            .cloned()
            .ok_or_else(|| OverseerError::NotFound(format!("run {}", run_id)))
    }

    async fn list_runs(&self, _ctx: &RequestContext, project_id: &str) -> Result<Vec<Run>> {
        let state = self.state.read().await;
        let mut runs: Vec<Run> = state
            .runs
            .values()
            .filter(|r| r.project_id == project_id)
            .cloned()
            .collect();
        runs.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        Ok(runs)
    }

    async fn delete_run(&self, _ctx: &RequestContext, run_id: &str) -> Result<()> {
        let mut state = self.state.write().await;
        state.runs.remove(run_id);
        Ok(())
    }

    async fn save_plan(&self, _ctx: &RequestContext, plan: &Plan) -> Result<()> {
        let mut state = self.state.write().await;
        state.plans.insert(plan.id.clone(), plan.clone());
        Ok(())
    }

    async fn load_plan(&self, _ctx: &RequestContext, plan_id: &str) -> Result<Plan> {
        let state = self.state.read().await;
        state
            .plans
            .get(plan_id)
            .cloned()
            .ok_or_else(|| OverseerError::NotFound(format!("plan {}", plan_id)))
    }

    async fn list_plans(&self, _ctx: &RequestContext, project_id: &str) -> Result<Vec<Plan>> {
        let state = self.state.read().await;
        let mut plans: Vec<Plan> = state
            .plans
            .values()
            .filter(|p| p.project_id == project_id)
            .cloned()
            .collect();
        plans.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        Ok(plans)
    }

    async fn save_session(&self, _ctx: &RequestContext, session: &Session) -> Result<()> {
        let mut state = self.state.write().await;
        state.sessions.insert(session.id.clone(), session.clone());
        Ok(())
    }

    async fn load_session(&self, _ctx: &RequestContext, session_id: &str) -> Result<Session> {
        let state = self.state.read().await;
        state
            .sessions
            .get(session_id)
            .cloned()
            .ok_or_else(|| OverseerError::NotFound(format!("session {}", session_id)))
    }

    async fn save_checkpoint(&self, _ctx: &RequestContext, checkpoint: &Checkpoint) -> Result<()> {
        let mut state = self.state.write().await;
        state
            .checkpoints
            .entry(checkpoint.run_id.clone())
            .or_default()
            .push(checkpoint.clone());
        Ok(())
    }

    async fn list_checkpoints(
        &self,
        _ctx: &RequestContext,
        run_id: &str,
    ) -> Result<Vec<Checkpoint>> {
        let state = self.state.read().await;
        let mut checkpoints = state.checkpoints.get(run_id).cloned().unwrap_or_default();
        checkpoints.sort_by_key(|c| c.sequence);
        Ok(checkpoints)
    }

    async fn delete_checkpoints(&self, _ctx: &RequestContext, run_id: &str) -> Result<()> {
        let mut state = self.state.write().await;
        state.checkpoints.remove(run_id);
        Ok(())
    }

    async fn save_profile(&self, _ctx: &RequestContext, profile: &PolicyProfile) -> Result<()> {
        profile.validate().map_err(OverseerError::from)?;
        let mut state = self.state.write().await;
        state.profiles.insert(profile.name.clone(), profile.clone());
        Ok(())
    }

    async fn load_profile(&self, _ctx: &RequestContext, name: &str) -> Result<PolicyProfile> {
        let state = self.state.read().await;
        state
            .profiles
            .get(name)
            .cloned()
            .ok_or_else(|| OverseerError::NotFound(format!("profile {}", name)))
    }

    async fn list_profiles(&self, _ctx: &RequestContext) -> Result<Vec<PolicyProfile>> {
        let state = self.state.read().await;
        let mut profiles: Vec<PolicyProfile> = state.profiles.values().cloned().collect();
        profiles.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(profiles)
    }
}

// ============================================================================
// Shadow version control
// ============================================================================

#[derive(Default)]
struct ShadowWorkspace {
    commits: Vec<String>,
    head: Option<String>,
    branches: Vec<String>,
    pending_diff: String,
}

/// In-memory version control: records commits and branch operations without
/// touching a real repository. The checkpoint service's shadow variant, and
/// the delivery target in tests.
#[derive(Clone, Default)]
pub struct ShadowVersionControl {
    workspaces: Arc<RwLock<HashMap<String, ShadowWorkspace>>>,
}

impl ShadowVersionControl {
    pub fn new() -> Self {
        Self::default()
    }

    /// Stage content that the next `diff` call reports.
    pub async fn set_pending_diff(&self, workspace: &str, diff: impl Into<String>) {
        let mut workspaces = self.workspaces.write().await;
        workspaces.entry(workspace.to_string()).or_default().pending_diff = diff.into();
    }

    pub async fn head(&self, workspace: &str) -> Option<String> {
        let workspaces = self.workspaces.read().await;
        workspaces.get(workspace).and_then(|w| w.head.clone())
    }

    pub async fn commit_count(&self, workspace: &str) -> usize {
        let workspaces = self.workspaces.read().await;
        workspaces.get(workspace).map(|w| w.commits.len()).unwrap_or(0)
    }
}

#[async_trait]
impl VersionControl for ShadowVersionControl {
    async fn clone_repo(&self, _ctx: &RequestContext, _source: &str, workspace: &str) -> Result<()> {
        let mut workspaces = self.workspaces.write().await;
        workspaces.entry(workspace.to_string()).or_default();
        Ok(())
    }

    async fn status(&self, _ctx: &RequestContext, workspace: &str) -> Result<String> {
        let workspaces = self.workspaces.read().await;
        let head = workspaces
            .get(workspace)
            .and_then(|w| w.head.as_deref())
            .unwrap_or("(empty)");
        Ok(format!("HEAD {}", head))
    }

    async fn diff(&self, _ctx: &RequestContext, workspace: &str) -> Result<String> {
        let workspaces = self.workspaces.read().await;
        Ok(workspaces
            .get(workspace)
            .map(|w| w.pending_diff.clone())
            .unwrap_or_default())
    }

    async fn commit(&self, _ctx: &RequestContext, workspace: &str, message: &str) -> Result<String> {
        let mut workspaces = self.workspaces.write().await;
        let ws = workspaces.entry(workspace.to_string()).or_default();
        let hash = format!("shadow-{}-{}", ws.commits.len() + 1, short_digest(message));
        ws.commits.push(hash.clone());
        ws.head = Some(hash.clone());
        ws.pending_diff.clear();
        Ok(hash)
    }

    async fn push(&self, _ctx: &RequestContext, workspace: &str, _branch: &str) -> Result<()> {
        let workspaces = self.workspaces.read().await;
        if workspaces.contains_key(workspace) {
            Ok(())
        } else {
            Err(OverseerError::NotFound(format!("workspace {}", workspace)))
        }
    }

    async fn create_branch(&self, _ctx: &RequestContext, workspace: &str, name: &str) -> Result<()> {
        let mut workspaces = self.workspaces.write().await;
        workspaces
            .entry(workspace.to_string())
            .or_default()
            .branches
            .push(name.to_string());
        Ok(())
    }

    async fn open_pull_request(
        &self,
        _ctx: &RequestContext,
        workspace: &str,
        branch: &str,
        _title: &str,
        _body: &str,
    ) -> Result<String> {
        Ok(format!("https://example.invalid/{}/pull/{}", workspace, branch))
    }

    async fn reset_hard(&self, _ctx: &RequestContext, workspace: &str, commit: &str) -> Result<()> {
        let mut workspaces = self.workspaces.write().await;
        let ws = workspaces
            .get_mut(workspace)
            .ok_or_else(|| OverseerError::NotFound(format!("workspace {}", workspace)))?;
        if !ws.commits.iter().any(|c| c == commit) {
            return Err(OverseerError::NotFound(format!("commit {}", commit)));
        }
        ws.head = Some(commit.to_string());
        Ok(())
    }
}

fn short_digest(input: &str) -> String {
    use std::hash::{Hash, Hasher};
    let mut hasher = std::collections::hash_map::DefaultHasher::new();
    input.hash(&mut hasher);
    format!("{:08x}", hasher.finish() as u32)
}

// ============================================================================
// Notifiers
// ============================================================================

/// Discards every notification.
#[derive(Clone, Default)]
pub struct NullNotifier;

#[async_trait]
impl Notifier for NullNotifier {
    async fn publish(&self, _ctx: &RequestContext, _event_type: &str, _payload: Value) -> Result<()> {
        Ok(())
    }
}

/// Records notifications for assertions.
#[derive(Clone, Default)]
pub struct RecordingNotifier {
    published: Arc<RwLock<Vec<(String, Value)>>>,
}

impl RecordingNotifier {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn published(&self) -> Vec<(String, Value)> {
        self.published.read().await.clone()
    }
}

#[async_trait]
impl Notifier for RecordingNotifier {
    async fn publish(&self, _ctx: &RequestContext, event_type: &str, payload: Value) -> Result<()> {
        let mut published = self.published.write().await;
        published.push((event_type.to_string(), payload));
        Ok(())
    }
}

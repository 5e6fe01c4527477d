// Delivery module
// Materialise a completed run's outcome as a patch, commit, branch, or
// pull request via the version-control port.

use std::sync::Arc;

use serde::Serialize;

use overseer_core::{shadow_workspace, Result, VersionControl};
use overseer_types::{DeliverMode, RequestContext, Run};

#[derive(Debug, Clone, Serialize)]
pub struct DeliveryOutcome {
    pub mode: DeliverMode,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub patch: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub commit: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub branch: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pull_request_url: Option<String>,
}

pub struct DeliveryService {
    vcs: Arc<dyn VersionControl>,
}

impl DeliveryService {
    pub fn new(vcs: Arc<dyn VersionControl>) -> Self {
        Self { vcs }
    }

    pub async fn deliver(
        &self,
        ctx: &RequestContext,
        run: &Run,
        mode: DeliverMode,
        final_output: Option<&str>,
    ) -> Result<DeliveryOutcome> {
        let workspace = shadow_workspace(&run.id);
        let mut outcome = DeliveryOutcome {
            mode,
            patch: None,
            commit: None,
            branch: None,
            pull_request_url: None,
        };

        match mode {
            DeliverMode::Patch => {
                let diff = self.vcs.diff(ctx, &workspace).await?;
                outcome.patch = if diff.is_empty() {
                    final_output.map(String::from)
                } else {
                    Some(diff)
                };
            }
            DeliverMode::Commit => {
                let message = commit_message(run);
                outcome.commit = Some(self.vcs.commit(ctx, &workspace, &message).await?);
            }
            DeliverMode::Branch => {
                let branch = branch_name(run);
                self.vcs.create_branch(ctx, &workspace, &branch).await?;
                let message = commit_message(run);
                outcome.commit = Some(self.vcs.commit(ctx, &workspace, &message).await?);
                self.vcs.push(ctx, &workspace, &branch).await?;
                outcome.branch = Some(branch);
            }
            DeliverMode::PullRequest => {
                let branch = branch_name(run);
                self.vcs.create_branch(ctx, &workspace, &branch).await?;
                let message = commit_message(run);
                outcome.commit = Some(self.vcs.commit(ctx, &workspace, &message).await?);
                self.vcs.push(ctx, &workspace, &branch).await?;
                let title = format!("Automated change for {}", run.task_id);
                let body = final_output.unwrap_or("").to_string();
                outcome.pull_request_url = Some(
                    self.vcs
                        .open_pull_request(ctx, &workspace, &branch, &title, &body)
                        .await?,
                );
                outcome.branch = Some(branch);
            }
        }

        tracing::info!(run_id = run.id.as_str(), mode = ?mode, "artifact delivered");
        Ok(outcome)
    }
}

fn branch_name(run: &Run) -> String {
    format!("overseer/{}", run.id)
}

fn commit_message(run: &Run) -> String {
    format!("Apply changes for task {} (run {})", run.task_id, run.id)
}

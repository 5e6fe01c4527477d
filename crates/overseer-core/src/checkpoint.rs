// Checkpoint service
// Shadow version-control snapshots per run; the rewind substrate.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;

use overseer_types::{Checkpoint, RequestContext};

use crate::error::{OverseerError, Result};
use crate::ports::{Repository, VersionControl};

/// Tools whose successful results trigger a checkpoint.
pub const MUTATING_TOOLS: &[&str] = &["Edit", "Write", "Bash", "NotebookEdit", "Patch"];

const SNAPSHOT_DEADLINE: Duration = Duration::from_secs(60);

/// Shadow workspace name for a run. The shadow tree is per-run-exclusive:
/// only the owning engine task writes.
pub fn shadow_workspace(run_id: &str) -> String {
    format!("shadow/{}", run_id)
}

pub struct CheckpointService {
    repo: Arc<dyn Repository>,
    vcs: Arc<dyn VersionControl>,
}

impl CheckpointService {
    pub fn new(repo: Arc<dyn Repository>, vcs: Arc<dyn VersionControl>) -> Self {
        Self { repo, vcs }
    }

    /// Capture the current project state at an event sequence.
    pub async fn snapshot(
        &self,
        ctx: &RequestContext,
        run_id: &str,
        sequence: u64,
    ) -> Result<Checkpoint> {
        let workspace = shadow_workspace(run_id);
        let message = format!("checkpoint {} @ {}", run_id, sequence);

        let commit_hash =
            tokio::time::timeout(SNAPSHOT_DEADLINE, self.vcs.commit(ctx, &workspace, &message))
                .await
                .map_err(|_| {
                    OverseerError::Storage(format!("Checkpoint snapshot timed out for {}", run_id))
                })??;

        let checkpoint = Checkpoint {
            run_id: run_id.to_string(),
            sequence,
            commit_hash,
            created_at: Utc::now(),
        };
        self.repo.save_checkpoint(ctx, &checkpoint).await?;
        tracing::debug!(run_id, sequence, "checkpoint captured");
        Ok(checkpoint)
    }

    /// Reset the live workspace to the most recent checkpoint whose sequence
    /// is at or below `target_sequence`.
    pub async fn rewind(
        &self,
        ctx: &RequestContext,
        run_id: &str,
        target_sequence: u64,
    ) -> Result<Checkpoint> {
        let checkpoints = self.repo.list_checkpoints(ctx, run_id).await?;
        let target = checkpoints
            .into_iter()
            .filter(|c| c.sequence <= target_sequence)
            .max_by_key(|c| c.sequence)
            .ok_or_else(|| {
                OverseerError::NotFound(format!(
                    "No checkpoint at or below sequence {} for run {}",
                    target_sequence, run_id
                ))
            })?;

        let workspace = shadow_workspace(run_id);
        self.vcs
            .reset_hard(ctx, &workspace, &target.commit_hash)
            .await?;
        tracing::info!(
            run_id,
            sequence = target.sequence,
            commit = target.commit_hash.as_str(),
            "workspace rewound"
        );
        Ok(target)
    }

    pub async fn list_checkpoints(
        &self,
        ctx: &RequestContext,
        run_id: &str,
    ) -> Result<Vec<Checkpoint>> {
        self.repo.list_checkpoints(ctx, run_id).await
    }

    /// Drop a run's checkpoints. Called only when the owning run is deleted.
    pub async fn gc_run(&self, ctx: &RequestContext, run_id: &str) -> Result<()> {
        self.repo.delete_checkpoints(ctx, run_id).await
    }
}

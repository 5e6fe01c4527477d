// Session service
// Resume/fork/rewind by branching event history into new runs. Historical
// events are never mutated; every branch is a new run in a new or linked
// session.

use std::sync::Arc;

use chrono::Utc;
use serde_json::{json, Value};

use overseer_types::{Event, RequestContext, Run, Session, SessionStatus};

use crate::checkpoint::CheckpointService;
use crate::error::{OverseerError, Result};
use crate::event_store::EventStore;
use crate::ports::Repository;

/// Above this many events the worker is handed a compacted summary instead
/// of the full replay.
pub const REPLAY_COMPACT_THRESHOLD: usize = 256;

/// How many trailing events a compacted summary retains verbatim.
const SUMMARY_TAIL: usize = 50;

/// A branched run plus the context the worker needs to reconstitute state.
#[derive(Debug, Clone)]
pub struct SessionHandoff {
    pub session: Session,
    pub run: Run,
    /// Replay payload for `runs.start`'s `context` field
    pub context: Value,
}

pub struct SessionService {
    repo: Arc<dyn Repository>,
    events: Arc<EventStore>,
    checkpoints: Arc<CheckpointService>,
}

impl SessionService {
    pub fn new(
        repo: Arc<dyn Repository>,
        events: Arc<EventStore>,
        checkpoints: Arc<CheckpointService>,
    ) -> Self {
        Self {
            repo,
            events,
            checkpoints,
        }
    }

    /// Continue a terminal run in the same session with a fresh run.
    pub async fn resume(
        &self,
        ctx: &RequestContext,
        run_id: &str,
        prompt: Option<&str>,
    ) -> Result<SessionHandoff> {
        let source = self.repo.load_run(ctx, run_id).await?;
        if !source.status.is_terminal() {
            return Err(OverseerError::PreconditionDenied(format!(
                "Run {} is still active; cancel it before resuming",
                run_id
            )));
        }

        let mut session = match source.session_id.as_deref() {
            Some(session_id) => self.repo.load_session(ctx, session_id).await?,
            None => {
                let mut session = Session::new(source.tenant_id.clone());
                session.parent_run_id = Some(source.id.clone());
                session
            }
        };

        let events = self.events.load_by_run(run_id)?;
        let run = self.branch_run(ctx, &source, &session, &events).await?;

        session.status = SessionStatus::Active;
        session.current_run_id = Some(run.id.clone());
        session.updated_at = Utc::now();
        self.repo.save_session(ctx, &session).await?;

        let context = build_replay_context(&events, prompt);
        tracing::info!(
            source_run = run_id,
            new_run = run.id.as_str(),
            session = session.id.as_str(),
            "run resumed"
        );
        Ok(SessionHandoff {
            session,
            run,
            context,
        })
    }

    /// Branch a child session whose run receives events up to the cut point;
    /// the parent is frozen but otherwise unchanged.
    pub async fn fork(
        &self,
        ctx: &RequestContext,
        run_id: &str,
        from_event_id: Option<&str>,
    ) -> Result<SessionHandoff> {
        let source = self.repo.load_run(ctx, run_id).await?;
        let events = self.cut_events(run_id, from_event_id)?;

        let mut parent = self.parent_session(ctx, &source).await?;
        parent.status = SessionStatus::Forked;
        parent.updated_at = Utc::now();
        self.repo.save_session(ctx, &parent).await?;

        let mut child = Session::child_of(&parent, source.id.clone());
        let run = self.branch_run(ctx, &source, &child, &events).await?;
        child.current_run_id = Some(run.id.clone());
        self.repo.save_session(ctx, &child).await?;

        let context = build_replay_context(&events, None);
        tracing::info!(
            source_run = run_id,
            new_run = run.id.as_str(),
            session = child.id.as_str(),
            "run forked"
        );
        Ok(SessionHandoff {
            session: child,
            run,
            context,
        })
    }

    /// Branch a child session from a truncated history, rewinding the
    /// workspace to the matching checkpoint first. The original trajectory
    /// stays immutable.
    pub async fn rewind(
        &self,
        ctx: &RequestContext,
        run_id: &str,
        to_event_id: Option<&str>,
    ) -> Result<SessionHandoff> {
        let source = self.repo.load_run(ctx, run_id).await?;
        let events = self.cut_events(run_id, to_event_id)?;
        let cut_version = events.last().map(|e| e.version).unwrap_or(0);

        match self.checkpoints.rewind(ctx, run_id, cut_version).await {
            Ok(_) => {}
            Err(OverseerError::NotFound(_)) => {
                tracing::warn!(
                    run_id,
                    cut_version,
                    "no checkpoint at or below rewind target; workspace left as-is"
                );
            }
            Err(err) => return Err(err),
        }

        let mut parent = self.parent_session(ctx, &source).await?;
        parent.status = SessionStatus::Forked;
        parent.updated_at = Utc::now();
        self.repo.save_session(ctx, &parent).await?;

        let mut child = Session::child_of(&parent, source.id.clone());
        let run = self.branch_run(ctx, &source, &child, &events).await?;
        child.current_run_id = Some(run.id.clone());
        self.repo.save_session(ctx, &child).await?;

        let context = build_replay_context(&events, None);
        tracing::info!(
            source_run = run_id,
            new_run = run.id.as_str(),
            cut_version,
            "run rewound"
        );
        Ok(SessionHandoff {
            session: child,
            run,
            context,
        })
    }

    async fn parent_session(&self, ctx: &RequestContext, source: &Run) -> Result<Session> {
        match source.session_id.as_deref() {
            Some(session_id) => self.repo.load_session(ctx, session_id).await,
            None => {
                let mut session = Session::new(source.tenant_id.clone());
                session.parent_run_id = Some(source.id.clone());
                self.repo.save_session(ctx, &session).await?;
                Ok(session)
            }
        }
    }

    /// Events up to and including the cut point; the full log when no cut is
    /// given. An unknown event id is a validation error.
    fn cut_events(&self, run_id: &str, cut_event_id: Option<&str>) -> Result<Vec<Event>> {
        let events = self.events.load_by_run(run_id)?;
        let Some(cut_event_id) = cut_event_id else {
            return Ok(events);
        };
        let cut_index = events
            .iter()
            .position(|e| e.id == cut_event_id)
            .ok_or_else(|| {
                OverseerError::Validation(format!(
                    "Event {} not found in run {}",
                    cut_event_id, run_id
                ))
            })?;
        Ok(events.into_iter().take(cut_index + 1).collect())
    }

    /// Create the new pending run and seed its log with copies of the source
    /// events, re-sequenced densely from 1.
    async fn branch_run(
        &self,
        ctx: &RequestContext,
        source: &Run,
        session: &Session,
        events: &[Event],
    ) -> Result<Run> {
        let mut run = Run::new(
            source.tenant_id.clone(),
            source.project_id.clone(),
            source.task_id.clone(),
        );
        run.session_id = Some(session.id.clone());
        run.model = source.model.clone();
        self.repo.save_run(ctx, &run).await?;

        for event in events {
            let copy = Event::new(
                run.id.clone(),
                event.task_id.clone(),
                event.agent_id.clone(),
                event.event_type.clone(),
                event.payload.clone(),
            );
            self.events.append(copy)?;
        }
        Ok(run)
    }
}

/// Build the `runs.start` context payload from branched history.
fn build_replay_context(events: &[Event], prompt: Option<&str>) -> Value {
    let mut context = if events.len() > REPLAY_COMPACT_THRESHOLD {
        let mut counts: std::collections::HashMap<&str, u64> = std::collections::HashMap::new();
        for event in events {
            *counts.entry(event.event_type.as_str()).or_insert(0) += 1;
        }
        let tail: Vec<&Event> = events.iter().rev().take(SUMMARY_TAIL).rev().collect();
        json!({
            "mode": "summary",
            "event_count": events.len(),
            "counts_by_type": counts,
            "tail": tail,
        })
    } else {
        json!({
            "mode": "replay",
            "events": events,
        })
    };

    if let Some(prompt) = prompt {
        context["prompt"] = Value::String(prompt.to_string());
    }
    context
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::{MemoryRepository, ShadowVersionControl};
    use overseer_types::{event::kind, RunStatus};
    use serde_json::json;
    use tempfile::tempdir;

    struct Harness {
        service: SessionService,
        repo: Arc<MemoryRepository>,
        events: Arc<EventStore>,
        _temp: tempfile::TempDir,
    }

    fn ctx() -> RequestContext {
        RequestContext::new("tenant-1", "tester")
    }

    fn make_harness() -> Harness {
        let temp = tempdir().unwrap();
        let repo = Arc::new(MemoryRepository::new());
        let events = Arc::new(EventStore::new(temp.path()).unwrap());
        let vcs = Arc::new(ShadowVersionControl::new());
        let checkpoints = Arc::new(CheckpointService::new(repo.clone(), vcs));
        let service = SessionService::new(repo.clone(), events.clone(), checkpoints);
        Harness {
            service,
            repo,
            events,
            _temp: temp,
        }
    }

    async fn seed_terminal_run(harness: &Harness) -> Run {
        let mut run = Run::new("tenant-1", "proj-1", "task-1");
        run.status = RunStatus::Completed;
        run.ended_at = Some(Utc::now());
        harness.repo.save_run(&ctx(), &run).await.unwrap();

        for (event_type, payload) in [
            (kind::RUN_STARTED, json!({ "project_id": "proj-1" })),
            (kind::RUN_TOOLCALL, json!({ "phase": "requested" })),
            (kind::RUN_COMPLETED, json!({ "step_count": 1 })),
        ] {
            harness
                .events
                .append(Event::new(&run.id, "task-1", "agent-1", event_type, payload))
                .unwrap();
        }
        run
    }

    #[tokio::test]
    async fn resume_creates_new_run_in_session_with_replay() {
        let harness = make_harness();
        let source = seed_terminal_run(&harness).await;

        let handoff = harness
            .service
            .resume(&ctx(), &source.id, Some("keep going"))
            .await
            .unwrap();

        assert_ne!(handoff.run.id, source.id);
        assert_eq!(handoff.run.status, RunStatus::Pending);
        assert_eq!(
            handoff.session.current_run_id.as_deref(),
            Some(handoff.run.id.as_str())
        );
        assert_eq!(handoff.context["mode"], "replay");
        assert_eq!(handoff.context["prompt"], "keep going");

        // History copied and re-sequenced densely.
        let copied = harness.events.load_by_run(&handoff.run.id).unwrap();
        assert_eq!(copied.len(), 3);
        assert_eq!(copied.last().unwrap().version, 3);
    }

    #[tokio::test]
    async fn resume_of_active_run_is_denied() {
        let harness = make_harness();
        let run = Run::new("tenant-1", "proj-1", "task-1");
        harness.repo.save_run(&ctx(), &run).await.unwrap();

        let err = harness.service.resume(&ctx(), &run.id, None).await.unwrap_err();
        assert!(matches!(err, OverseerError::PreconditionDenied(_)));
    }

    #[tokio::test]
    async fn fork_truncates_at_cut_and_freezes_parent() {
        let harness = make_harness();
        let source = seed_terminal_run(&harness).await;
        let history = harness.events.load_by_run(&source.id).unwrap();
        let cut = history[1].id.clone();

        let handoff = harness
            .service
            .fork(&ctx(), &source.id, Some(&cut))
            .await
            .unwrap();

        let copied = harness.events.load_by_run(&handoff.run.id).unwrap();
        assert_eq!(copied.len(), 2);

        // Parent history untouched.
        let original = harness.events.load_by_run(&source.id).unwrap();
        assert_eq!(original.len(), 3);

        let parent = harness
            .repo
            .load_session(&ctx(), handoff.session.parent_session_id.as_deref().unwrap())
            .await
            .unwrap();
        assert_eq!(parent.status, SessionStatus::Forked);
    }

    #[tokio::test]
    async fn fork_with_unknown_cut_is_a_validation_error() {
        let harness = make_harness();
        let source = seed_terminal_run(&harness).await;
        let err = harness
            .service
            .fork(&ctx(), &source.id, Some("evt_ghost"))
            .await
            .unwrap_err();
        assert!(matches!(err, OverseerError::Validation(_)));
    }

    #[tokio::test]
    async fn rewind_without_checkpoints_still_branches() {
        let harness = make_harness();
        let source = seed_terminal_run(&harness).await;
        let history = harness.events.load_by_run(&source.id).unwrap();
        let cut = history[0].id.clone();

        let handoff = harness
            .service
            .rewind(&ctx(), &source.id, Some(&cut))
            .await
            .unwrap();

        let copied = harness.events.load_by_run(&handoff.run.id).unwrap();
        assert_eq!(copied.len(), 1);
        assert_eq!(handoff.run.status, RunStatus::Pending);
    }

    #[tokio::test]
    async fn long_histories_hand_off_a_summary() {
        let harness = make_harness();
        let mut run = Run::new("tenant-1", "proj-1", "task-1");
        run.status = RunStatus::Completed;
        harness.repo.save_run(&ctx(), &run).await.unwrap();
        for idx in 0..(REPLAY_COMPACT_THRESHOLD + 10) {
            harness
                .events
                .append(Event::new(
                    &run.id,
                    "task-1",
                    "agent-1",
                    kind::RUN_OUTPUT,
                    json!({ "idx": idx }),
                ))
                .unwrap();
        }

        let handoff = harness.service.resume(&ctx(), &run.id, None).await.unwrap();
        assert_eq!(handoff.context["mode"], "summary");
        assert_eq!(
            handoff.context["event_count"].as_u64().unwrap() as usize,
            REPLAY_COMPACT_THRESHOLD + 10
        );
    }
}

// Plan scheduler
// DAG executor over the run engine: readiness, protocol parallelism,
// failure propagation, cancellation.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use serde_json::json;
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;

use overseer_core::{Notifier, OverseerConfig, OverseerError, Repository, Result};
use overseer_types::{
    event::kind, Event, FailureReason, Plan, PlanProtocol, PlanStatus, RequestContext, StepStatus,
};

use crate::engine::{RunEngine, StartSpec};

/// Poll fallback so a lagged broadcast subscription cannot wedge a plan.
const RESYNC_TICK: Duration = Duration::from_millis(200);

/// Marker a worker attaches to an artifact to end a ping-pong exchange.
const CONVERGED_TAG: &str = "converged";

/// Final state of a driven plan.
#[derive(Debug, Clone)]
pub struct PlanOutcome {
    pub plan: Plan,
    /// Winning artifact: majority output for consensus, last completed
    /// output otherwise
    pub artifact: Option<String>,
}

// ============================================================================
// Validation
// ============================================================================

/// Structural validation applied at plan creation: non-empty, unique step
/// ids, known dependencies, acyclic, protocol shape.
pub fn validate_plan(plan: &Plan) -> Result<()> {
    if plan.steps.is_empty() {
        return Err(OverseerError::Validation("Plan has no steps".to_string()));
    }

    let step_ids: HashSet<&str> = plan.steps.iter().map(|s| s.id.as_str()).collect();
    if step_ids.len() != plan.steps.len() {
        return Err(OverseerError::Validation(
            "Duplicate step id in plan".to_string(),
        ));
    }

    for step in &plan.steps {
        for dep in &step.depends_on {
            if !step_ids.contains(dep.as_str()) {
                return Err(OverseerError::Validation(format!(
                    "Step '{}' depends on unknown step '{}'",
                    step.id, dep
                )));
            }
        }
    }

    if let Some(path) = detect_cycle(plan) {
        return Err(OverseerError::Validation(format!(
            "Cycle in step graph: {}",
            path.join(" -> ")
        )));
    }

    match plan.protocol {
        PlanProtocol::PingPong if plan.steps.len() != 2 => {
            return Err(OverseerError::Validation(
                "Ping-pong plans need exactly two steps".to_string(),
            ));
        }
        PlanProtocol::Consensus => {
            if plan.steps.len() < 2 {
                return Err(OverseerError::Validation(
                    "Consensus plans need at least two steps".to_string(),
                ));
            }
            let task_id = &plan.steps[0].task_id;
            if plan.steps.iter().any(|s| &s.task_id != task_id) {
                return Err(OverseerError::Validation(
                    "Consensus steps must share one task".to_string(),
                ));
            }
        }
        _ => {}
    }
    Ok(())
}

/// Depth-first cycle detection over `depends_on` edges.
pub fn detect_cycle(plan: &Plan) -> Option<Vec<String>> {
    let step_map: HashMap<&str, &overseer_types::Step> =
        plan.steps.iter().map(|s| (s.id.as_str(), s)).collect();

    for step in &plan.steps {
        let mut visited = HashSet::new();
        let mut path = Vec::new();
        if dfs_cycle(&step.id, &step_map, &mut visited, &mut path) {
            return Some(path);
        }
    }
    None
}

fn dfs_cycle(
    step_id: &str,
    step_map: &HashMap<&str, &overseer_types::Step>,
    visited: &mut HashSet<String>,
    path: &mut Vec<String>,
) -> bool {
    if path.contains(&step_id.to_string()) {
        path.push(step_id.to_string());
        return true;
    }
    if visited.contains(step_id) {
        return false;
    }
    visited.insert(step_id.to_string());
    path.push(step_id.to_string());

    if let Some(step) = step_map.get(step_id) {
        for dep in &step.depends_on {
            if dfs_cycle(dep, step_map, visited, path) {
                return true;
            }
        }
    }
    path.pop();
    false
}

// ============================================================================
// Readiness and parallelism
// ============================================================================

/// Steps that may start now: pending with every dependency completed.
/// Ping-pong alternation ignores dependencies by construction.
pub fn compute_ready(plan: &Plan) -> Vec<String> {
    let completed: HashSet<&str> = plan
        .steps
        .iter()
        .filter(|s| s.status == StepStatus::Completed)
        .map(|s| s.id.as_str())
        .collect();

    plan.steps
        .iter()
        .filter(|step| {
            step.status == StepStatus::Pending
                && (plan.protocol == PlanProtocol::PingPong
                    || step
                        .depends_on
                        .iter()
                        .all(|dep| completed.contains(dep.as_str())))
        })
        .map(|s| s.id.clone())
        .collect()
}

/// Concurrency budget for the plan's protocol.
pub fn protocol_parallelism(plan: &Plan, config: &OverseerConfig) -> usize {
    match plan.protocol {
        PlanProtocol::Sequential | PlanProtocol::PingPong => 1,
        PlanProtocol::Parallel => {
            if plan.max_parallel > 0 {
                plan.max_parallel as usize
            } else {
                config.orchestrator.max_parallel.max(1) as usize
            }
        }
        PlanProtocol::Consensus => {
            let cap = if plan.max_parallel > 0 {
                plan.max_parallel as usize
            } else {
                plan.steps.len()
            };
            cap.min(plan.steps.len()).max(1)
        }
    }
}

/// Transitively skip pending steps below failed, skipped or cancelled ones.
pub fn skip_descendants(plan: &mut Plan) {
    loop {
        let dead: HashSet<String> = plan
            .steps
            .iter()
            .filter(|s| {
                matches!(
                    s.status,
                    StepStatus::Failed | StepStatus::Skipped | StepStatus::Cancelled
                )
            })
            .map(|s| s.id.clone())
            .collect();

        let mut changed = false;
        for step in plan.steps.iter_mut() {
            if step.status == StepStatus::Pending
                && step.depends_on.iter().any(|dep| dead.contains(dep))
            {
                step.status = StepStatus::Skipped;
                step.error = Some("Dependency did not complete".to_string());
                changed = true;
            }
        }
        if !changed {
            break;
        }
    }
}

fn is_converged(output: Option<&str>) -> bool {
    output.is_some_and(|o| o.contains(CONVERGED_TAG))
}

// ============================================================================
// Scheduler
// ============================================================================

/// One logical scheduler task per plan; plans are independent of each other.
#[derive(Clone)]
pub struct PlanScheduler {
    config: Arc<OverseerConfig>,
    repo: Arc<dyn Repository>,
    engine: RunEngine,
    notifier: Arc<dyn Notifier>,
    cancels: Arc<RwLock<HashMap<String, CancellationToken>>>,
}

impl PlanScheduler {
    pub fn new(
        config: Arc<OverseerConfig>,
        repo: Arc<dyn Repository>,
        engine: RunEngine,
        notifier: Arc<dyn Notifier>,
    ) -> Self {
        Self {
            config,
            repo,
            engine,
            notifier,
            cancels: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    /// Request cancellation of a driven plan. Pending plans are finalised
    /// directly; running ones drain through the executor loop.
    pub async fn cancel(&self, ctx: &RequestContext, plan_id: &str) -> Result<()> {
        if let Some(token) = self.cancels.read().await.get(plan_id) {
            token.cancel();
            return Ok(());
        }
        let mut plan = self.repo.load_plan(ctx, plan_id).await?;
        if plan.status.is_terminal() {
            return Ok(());
        }
        for step in plan.steps.iter_mut() {
            if !step.status.is_terminal() {
                step.status = StepStatus::Cancelled;
            }
        }
        plan.status = PlanStatus::Cancelled;
        plan.version += 1;
        plan.updated_at = Utc::now();
        self.repo.save_plan(ctx, &plan).await
    }

    /// Drive a plan to a terminal status and return its outcome.
    pub async fn execute(&self, ctx: &RequestContext, plan_id: &str) -> Result<PlanOutcome> {
        let mut plan = self.repo.load_plan(ctx, plan_id).await?;
        if plan.status != PlanStatus::Pending {
            return Err(OverseerError::PreconditionDenied(format!(
                "Plan {} is not pending",
                plan_id
            )));
        }
        validate_plan(&plan)?;

        let cancel = CancellationToken::new();
        self.cancels
            .write()
            .await
            .insert(plan.id.clone(), cancel.clone());

        // Subscribe before the first start so no terminal event is missed.
        let mut events_rx = self.engine.events().subscribe();

        plan.status = PlanStatus::Running;
        plan.version += 1;
        plan.updated_at = Utc::now();
        self.repo.save_plan(ctx, &plan).await?;
        self.notify(ctx, "plan.started", &plan, None).await;

        let mut round: u32 = 1;
        let mut completion_order: Vec<String> = Vec::new();
        // draining stops new starts; user_cancelled also flips the final
        // status to cancelled.
        let mut draining = false;
        let mut user_cancelled = false;
        let mut ping_pong_done = false;

        let outcome = loop {
            if cancel.is_cancelled() && !draining {
                draining = true;
                user_cancelled = true;
                self.cancel_running_steps(ctx, &plan).await;
                for step in plan.steps.iter_mut() {
                    if step.status == StepStatus::Pending {
                        step.status = StepStatus::Cancelled;
                    }
                }
                self.save(ctx, &mut plan).await;
            }

            if !draining && !ping_pong_done {
                self.schedule_ready(ctx, &mut plan, round).await;
            }

            if plan.all_steps_terminal() {
                break self.finalize(ctx, &mut plan, &completion_order, user_cancelled).await?;
            }

            tokio::select! {
                _ = cancel.cancelled(), if !draining => {}
                received = events_rx.recv() => {
                    match received {
                        Ok(event) => {
                            self.apply_event(
                                ctx,
                                &mut plan,
                                &event,
                                &mut round,
                                &mut completion_order,
                                &mut draining,
                                &mut ping_pong_done,
                            )
                            .await;
                        }
                        Err(tokio::sync::broadcast::error::RecvError::Lagged(skipped)) => {
                            tracing::warn!(plan_id, skipped, "event stream lagged; resyncing");
                            self.resync_running_steps(
                                ctx,
                                &mut plan,
                                &mut round,
                                &mut completion_order,
                                &mut draining,
                                &mut ping_pong_done,
                            )
                            .await;
                        }
                        Err(tokio::sync::broadcast::error::RecvError::Closed) => {
                            tokio::time::sleep(RESYNC_TICK).await;
                        }
                    }
                }
                _ = tokio::time::sleep(RESYNC_TICK) => {
                    self.resync_running_steps(
                        ctx,
                        &mut plan,
                        &mut round,
                        &mut completion_order,
                        &mut draining,
                        &mut ping_pong_done,
                    )
                    .await;
                }
            }
        };

        self.cancels.write().await.remove(plan_id);
        Ok(outcome)
    }

    async fn schedule_ready(&self, ctx: &RequestContext, plan: &mut Plan, round: u32) {
        let budget =
            protocol_parallelism(plan, &self.config).saturating_sub(plan.running_count());
        if budget == 0 {
            return;
        }

        let ready = compute_ready(plan);
        let mut changed = false;
        for step_id in ready.into_iter().take(budget) {
            let spec = {
                let Some(step) = plan.step(&step_id) else { continue };
                let profile_name = if step.policy_profile.trim().is_empty() {
                    self.config.policy.default_profile.clone()
                } else {
                    step.policy_profile.clone()
                };
                StartSpec {
                    step_id: Some(step.id.clone()),
                    task_id: step.task_id.clone(),
                    project_id: plan.project_id.clone(),
                    agent_id: step.agent_id.clone(),
                    profile_name,
                    prompt: format!("task:{}", step.task_id),
                    deliver_mode: step.deliver_mode,
                    session_id: None,
                    context: json!({}),
                }
            };

            match self.engine.start(ctx, spec).await {
                Ok(run_id) => {
                    let is_ping_pong = plan.protocol == PlanProtocol::PingPong;
                    if let Some(step) = plan.step_mut(&step_id) {
                        step.status = StepStatus::Running;
                        step.run_id = Some(run_id);
                        if is_ping_pong {
                            step.round = round;
                        }
                        changed = true;
                    }
                }
                Err(err) => {
                    tracing::error!(step_id = step_id.as_str(), error = %err, "step start failed");
                    if let Some(step) = plan.step_mut(&step_id) {
                        step.status = StepStatus::Failed;
                        step.error = Some(err.to_string());
                        changed = true;
                    }
                    skip_descendants(plan);
                }
            }
        }
        if changed {
            self.save(ctx, plan).await;
        }
    }

    /// Fold one terminal run event into the plan state.
    #[allow(clippy::too_many_arguments)]
    async fn apply_event(
        &self,
        ctx: &RequestContext,
        plan: &mut Plan,
        event: &Event,
        round: &mut u32,
        completion_order: &mut Vec<String>,
        draining: &mut bool,
        ping_pong_done: &mut bool,
    ) {
        let outcome = match event.event_type.as_str() {
            kind::RUN_COMPLETED => StepStatus::Completed,
            kind::RUN_FAILED | kind::RUN_TIMEOUT => StepStatus::Failed,
            kind::RUN_CANCELLED => StepStatus::Cancelled,
            _ => return,
        };
        let final_output = event
            .payload
            .get("final_output")
            .and_then(|v| v.as_str())
            .map(String::from);
        let detail = event
            .payload
            .get("detail")
            .and_then(|v| v.as_str())
            .map(String::from);

        let Some(step_id) = plan
            .steps
            .iter()
            .find(|s| s.status == StepStatus::Running && s.run_id.as_deref() == Some(&event.run_id))
            .map(|s| s.id.clone())
        else {
            return;
        };

        self.apply_step_outcome(
            ctx,
            plan,
            &step_id,
            outcome,
            final_output,
            detail,
            round,
            completion_order,
            draining,
            ping_pong_done,
        )
        .await;
    }

    #[allow(clippy::too_many_arguments)]
    async fn apply_step_outcome(
        &self,
        ctx: &RequestContext,
        plan: &mut Plan,
        step_id: &str,
        outcome: StepStatus,
        final_output: Option<String>,
        detail: Option<String>,
        round: &mut u32,
        completion_order: &mut Vec<String>,
        draining: &mut bool,
        ping_pong_done: &mut bool,
    ) {
        {
            let Some(step) = plan.step_mut(step_id) else { return };
            step.status = outcome;
            step.output = final_output.clone();
            step.error = detail;
        }

        match outcome {
            StepStatus::Completed => {
                completion_order.push(step_id.to_string());
                if plan.protocol == PlanProtocol::PingPong && !*ping_pong_done {
                    self.advance_ping_pong(plan, step_id, final_output.as_deref(), round, ping_pong_done);
                }
            }
            StepStatus::Failed => {
                skip_descendants(plan);
                if !plan.continue_on_failure && !*draining {
                    *draining = true;
                    self.cancel_running_steps(ctx, plan).await;
                    for step in plan.steps.iter_mut() {
                        if step.status == StepStatus::Pending {
                            step.status = StepStatus::Skipped;
                            step.error = Some("Sibling step failed".to_string());
                        }
                    }
                }
            }
            _ => {}
        }

        self.save(ctx, plan).await;
    }

    /// Ping-pong alternation: convergence or round cap ends the exchange,
    /// otherwise the other step is reset to pending for the next round.
    fn advance_ping_pong(
        &self,
        plan: &mut Plan,
        completed_step_id: &str,
        output: Option<&str>,
        round: &mut u32,
        ping_pong_done: &mut bool,
    ) {
        let max_rounds = if plan.max_rounds > 0 {
            plan.max_rounds
        } else {
            self.config.orchestrator.ping_pong_max_rounds
        };

        let other_id = plan
            .steps
            .iter()
            .find(|s| s.id != completed_step_id)
            .map(|s| s.id.clone());
        let Some(other_id) = other_id else { return };

        if is_converged(output) || *round >= max_rounds {
            *ping_pong_done = true;
            if let Some(other) = plan.step_mut(&other_id) {
                if !other.status.is_terminal() {
                    other.status = StepStatus::Skipped;
                }
            }
            return;
        }

        *round += 1;
        if let Some(other) = plan.step_mut(&other_id) {
            other.status = StepStatus::Pending;
            other.run_id = None;
            other.output = None;
            other.error = None;
        }
    }

    /// Poll-based fallback: reconcile running steps against persisted runs.
    #[allow(clippy::too_many_arguments)]
    async fn resync_running_steps(
        &self,
        ctx: &RequestContext,
        plan: &mut Plan,
        round: &mut u32,
        completion_order: &mut Vec<String>,
        draining: &mut bool,
        ping_pong_done: &mut bool,
    ) {
        let running: Vec<(String, String)> = plan
            .steps
            .iter()
            .filter(|s| s.status == StepStatus::Running)
            .filter_map(|s| s.run_id.clone().map(|r| (s.id.clone(), r)))
            .collect();

        for (step_id, run_id) in running {
            let Ok(run) = self.repo.load_run(ctx, &run_id).await else { continue };
            if !run.status.is_terminal() {
                continue;
            }
            let outcome = match run.status {
                overseer_types::RunStatus::Completed => StepStatus::Completed,
                overseer_types::RunStatus::Cancelled => StepStatus::Cancelled,
                _ => StepStatus::Failed,
            };
            // The terminal event carries the artifact; the persisted row
            // does not, so recover it from the run's trajectory.
            let final_output = self
                .engine
                .events()
                .load_by_run(&run_id)
                .ok()
                .and_then(|events| {
                    events.iter().rev().find_map(|e| {
                        e.payload
                            .get("final_output")
                            .and_then(|v| v.as_str())
                            .map(String::from)
                    })
                });
            let detail = run.error.as_ref().map(|e| e.detail.clone());
            self.apply_step_outcome(
                ctx,
                plan,
                &step_id,
                outcome,
                final_output,
                detail,
                round,
                completion_order,
                draining,
                ping_pong_done,
            )
            .await;
        }
    }

    async fn cancel_running_steps(&self, ctx: &RequestContext, plan: &Plan) {
        for step in &plan.steps {
            if step.status == StepStatus::Running {
                if let Some(run_id) = step.run_id.as_deref() {
                    if let Err(err) = self
                        .engine
                        .cancel(ctx, run_id, FailureReason::CancelledByPlan, "Plan cancelled")
                        .await
                    {
                        tracing::warn!(run_id, error = %err, "step cancel failed");
                    }
                }
            }
        }
    }

    /// All steps terminal: decide the plan's status and artifact.
    async fn finalize(
        &self,
        ctx: &RequestContext,
        plan: &mut Plan,
        completion_order: &[String],
        cancelled: bool,
    ) -> Result<PlanOutcome> {
        let (status, artifact) = if cancelled {
            (PlanStatus::Cancelled, None)
        } else {
            match plan.protocol {
                PlanProtocol::Consensus => {
                    let quorum = if plan.consensus_quorum > 0 {
                        plan.consensus_quorum as usize
                    } else if self.config.orchestrator.consensus_quorum > 0 {
                        self.config.orchestrator.consensus_quorum as usize
                    } else {
                        plan.steps.len() / 2 + 1
                    };
                    match consensus_outcome(plan, completion_order, quorum) {
                        Some(artifact) => (PlanStatus::Completed, Some(artifact)),
                        None => (PlanStatus::Failed, None),
                    }
                }
                PlanProtocol::PingPong => {
                    let artifact = completion_order
                        .last()
                        .and_then(|id| plan.step(id))
                        .and_then(|s| s.output.clone());
                    if plan.steps.iter().any(|s| s.status == StepStatus::Failed) {
                        (PlanStatus::Failed, None)
                    } else {
                        (PlanStatus::Completed, artifact)
                    }
                }
                _ => {
                    let all_completed = plan
                        .steps
                        .iter()
                        .all(|s| s.status == StepStatus::Completed);
                    if all_completed {
                        let artifact = completion_order
                            .last()
                            .and_then(|id| plan.step(id))
                            .and_then(|s| s.output.clone());
                        (PlanStatus::Completed, artifact)
                    } else {
                        (PlanStatus::Failed, None)
                    }
                }
            }
        };

        plan.status = status;
        plan.version += 1;
        plan.updated_at = Utc::now();
        self.repo.save_plan(ctx, plan).await?;

        let event_type = match status {
            PlanStatus::Completed => "plan.completed",
            PlanStatus::Cancelled => "plan.cancelled",
            _ => "plan.failed",
        };
        self.notify(ctx, event_type, plan, artifact.as_deref()).await;

        Ok(PlanOutcome {
            plan: plan.clone(),
            artifact,
        })
    }

    async fn save(&self, ctx: &RequestContext, plan: &mut Plan) {
        plan.version += 1;
        plan.updated_at = Utc::now();
        if let Err(err) = self.repo.save_plan(ctx, plan).await {
            tracing::error!(plan_id = plan.id.as_str(), error = %err, "failed to persist plan");
        }
    }

    async fn notify(&self, ctx: &RequestContext, event_type: &str, plan: &Plan, artifact: Option<&str>) {
        let payload = json!({
            "plan_id": plan.id,
            "project_id": plan.project_id,
            "status": plan.status,
            "artifact": artifact,
        });
        if let Err(err) = self.notifier.publish(ctx, event_type, payload).await {
            tracing::warn!(error = %err, "notifier publish failed");
        }
    }
}

/// Majority artifact among completed steps, or `None` when quorum is not
/// reached. Byte-equal outputs group together; ties break toward the group
/// containing the earliest completion.
pub fn consensus_outcome(
    plan: &Plan,
    completion_order: &[String],
    quorum: usize,
) -> Option<String> {
    let completed: Vec<&overseer_types::Step> = plan
        .steps
        .iter()
        .filter(|s| s.status == StepStatus::Completed)
        .collect();
    if completed.len() < quorum {
        return None;
    }

    let mut groups: HashMap<&str, Vec<&str>> = HashMap::new();
    for step in &completed {
        let output = step.output.as_deref().unwrap_or("");
        groups.entry(output).or_default().push(step.id.as_str());
    }

    let rank = |step_id: &str| {
        completion_order
            .iter()
            .position(|id| id == step_id)
            .unwrap_or(usize::MAX)
    };

    groups
        .into_iter()
        .min_by_key(|(_, members)| {
            let earliest = members.iter().map(|id| rank(id)).min().unwrap_or(usize::MAX);
            // Larger groups first, then earliest completion.
            (std::cmp::Reverse(members.len()), earliest)
        })
        .map(|(output, _)| output.to_string())
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use overseer_types::Step;

    fn make_step(plan_id: &str, id: &str, deps: Vec<&str>) -> Step {
        let mut step = Step::new(plan_id, format!("task-{}", id), "agent-1", "delegate");
        step.id = id.to_string();
        step.depends_on = deps.into_iter().map(String::from).collect();
        step
    }

    fn make_plan(protocol: PlanProtocol, steps: Vec<Step>) -> Plan {
        let mut plan = Plan::new("tenant-1", "proj-1", protocol);
        plan.steps = steps;
        plan
    }

    #[test]
    fn validate_accepts_a_linear_chain() {
        let plan = make_plan(
            PlanProtocol::Sequential,
            vec![
                make_step("p", "a", vec![]),
                make_step("p", "b", vec!["a"]),
                make_step("p", "c", vec!["b"]),
            ],
        );
        assert!(validate_plan(&plan).is_ok());
    }

    #[test]
    fn validate_rejects_cycles() {
        let plan = make_plan(
            PlanProtocol::Sequential,
            vec![
                make_step("p", "a", vec!["c"]),
                make_step("p", "b", vec!["a"]),
                make_step("p", "c", vec!["b"]),
            ],
        );
        assert!(matches!(
            validate_plan(&plan),
            Err(OverseerError::Validation(_))
        ));
    }

    #[test]
    fn validate_rejects_unknown_dependency_and_empty_plan() {
        let plan = make_plan(
            PlanProtocol::Sequential,
            vec![make_step("p", "a", vec!["ghost"])],
        );
        assert!(validate_plan(&plan).is_err());

        let empty = make_plan(PlanProtocol::Sequential, vec![]);
        assert!(validate_plan(&empty).is_err());
    }

    #[test]
    fn validate_enforces_protocol_shapes() {
        let one_step = make_plan(PlanProtocol::PingPong, vec![make_step("p", "a", vec![])]);
        assert!(validate_plan(&one_step).is_err());

        let mut mixed = make_plan(
            PlanProtocol::Consensus,
            vec![make_step("p", "a", vec![]), make_step("p", "b", vec![])],
        );
        mixed.steps[1].task_id = "task-other".to_string();
        assert!(validate_plan(&mixed).is_err());

        let mut shared = make_plan(
            PlanProtocol::Consensus,
            vec![make_step("p", "a", vec![]), make_step("p", "b", vec![])],
        );
        shared.steps[1].task_id = shared.steps[0].task_id.clone();
        assert!(validate_plan(&shared).is_ok());
    }

    #[test]
    fn ready_respects_dependencies() {
        let mut plan = make_plan(
            PlanProtocol::Parallel,
            vec![
                make_step("p", "a", vec![]),
                make_step("p", "b", vec!["a"]),
                make_step("p", "c", vec![]),
            ],
        );
        assert_eq!(compute_ready(&plan), vec!["a".to_string(), "c".to_string()]);

        plan.step_mut("a").unwrap().status = StepStatus::Completed;
        assert_eq!(compute_ready(&plan), vec!["b".to_string(), "c".to_string()]);
    }

    #[test]
    fn parallelism_budgets_per_protocol() {
        let config = OverseerConfig::default();

        let sequential = make_plan(
            PlanProtocol::Sequential,
            vec![make_step("p", "a", vec![]), make_step("p", "b", vec![])],
        );
        assert_eq!(protocol_parallelism(&sequential, &config), 1);

        let mut parallel = make_plan(
            PlanProtocol::Parallel,
            vec![
                make_step("p", "a", vec![]),
                make_step("p", "b", vec![]),
                make_step("p", "c", vec![]),
            ],
        );
        parallel.max_parallel = 2;
        assert_eq!(protocol_parallelism(&parallel, &config), 2);
        parallel.max_parallel = 0;
        assert_eq!(protocol_parallelism(&parallel, &config), 4);

        let consensus = make_plan(
            PlanProtocol::Consensus,
            vec![
                make_step("p", "a", vec![]),
                make_step("p", "b", vec![]),
                make_step("p", "c", vec![]),
            ],
        );
        assert_eq!(protocol_parallelism(&consensus, &config), 3);
    }

    #[test]
    fn skip_descendants_cascades() {
        let mut plan = make_plan(
            PlanProtocol::Sequential,
            vec![
                make_step("p", "a", vec![]),
                make_step("p", "b", vec!["a"]),
                make_step("p", "c", vec!["b"]),
                make_step("p", "d", vec![]),
            ],
        );
        plan.step_mut("a").unwrap().status = StepStatus::Failed;

        skip_descendants(&mut plan);
        assert_eq!(plan.step("b").unwrap().status, StepStatus::Skipped);
        assert_eq!(plan.step("c").unwrap().status, StepStatus::Skipped);
        assert_eq!(plan.step("d").unwrap().status, StepStatus::Pending);
    }

    #[test]
    fn consensus_majority_wins() {
        let mut plan = make_plan(
            PlanProtocol::Consensus,
            vec![
                make_step("p", "a", vec![]),
                make_step("p", "b", vec![]),
                make_step("p", "c", vec![]),
            ],
        );
        for (id, output) in [("a", "X"), ("b", "Y"), ("c", "X")] {
            let step = plan.step_mut(id).unwrap();
            step.status = StepStatus::Completed;
            step.output = Some(output.to_string());
        }
        let order = vec!["a".to_string(), "b".to_string(), "c".to_string()];

        assert_eq!(consensus_outcome(&plan, &order, 2), Some("X".to_string()));
    }

    #[test]
    fn consensus_tie_breaks_toward_earliest_completion() {
        let mut plan = make_plan(
            PlanProtocol::Consensus,
            vec![make_step("p", "a", vec![]), make_step("p", "b", vec![])],
        );
        for (id, output) in [("a", "X"), ("b", "Y")] {
            let step = plan.step_mut(id).unwrap();
            step.status = StepStatus::Completed;
            step.output = Some(output.to_string());
        }
        let order = vec!["b".to_string(), "a".to_string()];

        assert_eq!(consensus_outcome(&plan, &order, 1), Some("Y".to_string()));
    }

    #[test]
    fn consensus_below_quorum_fails() {
        let mut plan = make_plan(
            PlanProtocol::Consensus,
            vec![
                make_step("p", "a", vec![]),
                make_step("p", "b", vec![]),
                make_step("p", "c", vec![]),
            ],
        );
        plan.step_mut("a").unwrap().status = StepStatus::Completed;
        plan.step_mut("a").unwrap().output = Some("X".to_string());
        plan.step_mut("b").unwrap().status = StepStatus::Failed;
        plan.step_mut("c").unwrap().status = StepStatus::Failed;

        assert_eq!(consensus_outcome(&plan, &["a".to_string()], 2), None);
    }
}

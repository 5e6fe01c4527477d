// Run engine
// Per-run state machine: lifecycle, heartbeat, stall detection, termination
// enforcement, quality gate, delivery.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use serde_json::{json, Value};
use tokio::sync::{Mutex, RwLock};
use tokio_util::sync::CancellationToken;

use overseer_core::{
    retry_transient, BudgetCheck, BudgetTracker, CheckpointService, CompiledProfile, EventStore,
    OverseerConfig, OverseerError, Repository, Result, StallTracker, MUTATING_TOOLS,
};
use overseer_types::{
    event::kind, prefixed_id, DeliverMode, Event, FailureReason, RequestContext, Run, RunError,
    RunStatus, ToolCall, ToolCallPhase,
};
use overseer_transport::{DedupWindow, MessageBus, ReplyWaiters};
use overseer_wire::{
    subject, CancelPayload, CompletePayload, Envelope, GateKind, GateRequest, GateResult,
    OutputPayload, StartPayload, ToolCallResult, WorkerRunStatus,
};

use crate::delivery::{DeliveryOutcome, DeliveryService};

/// Watchdog poll interval for heartbeat and wall-clock enforcement.
const WATCHDOG_TICK: Duration = Duration::from_millis(200);

/// Output preview retained in `run.toolcall` result events.
const OUTPUT_PREVIEW_BYTES: usize = 512;

// ============================================================================
// Start bindings
// ============================================================================

/// Everything the engine needs to launch one run.
#[derive(Debug, Clone)]
pub struct StartSpec {
    pub step_id: Option<String>,
    pub task_id: String,
    pub project_id: String,
    pub agent_id: String,
    pub profile_name: String,
    pub prompt: String,
    pub deliver_mode: DeliverMode,
    pub session_id: Option<String>,
    /// Worker bootstrap state; replay context on resume
    pub context: Value,
}

/// Live state of a run the engine currently owns.
struct ActiveRun {
    run: Run,
    ctx: RequestContext,
    agent_id: String,
    profile: Arc<CompiledProfile>,
    deliver_mode: DeliverMode,
    budget: BudgetTracker,
    stall: Option<StallTracker>,
    cancel: CancellationToken,
    /// Reason recorded when a cancel is in flight
    pending_cancel: Option<FailureReason>,
    /// Tool calls awaiting their result, keyed by call id
    pending_calls: HashMap<String, ToolCall>,
    final_output: Option<String>,
}

// ============================================================================
// Run engine
// ============================================================================

/// Drives individual runs from `pending` to a terminal state. Cheap to
/// clone; all clones share state.
#[derive(Clone)]
pub struct RunEngine {
    config: Arc<OverseerConfig>,
    repo: Arc<dyn Repository>,
    events: Arc<EventStore>,
    bus: MessageBus,
    checkpoints: Arc<CheckpointService>,
    delivery: Arc<DeliveryService>,
    runs: Arc<RwLock<HashMap<String, Arc<Mutex<ActiveRun>>>>>,
    gate_waiters: ReplyWaiters<GateResult>,
}

impl RunEngine {
    pub fn new(
        config: Arc<OverseerConfig>,
        repo: Arc<dyn Repository>,
        events: Arc<EventStore>,
        bus: MessageBus,
        checkpoints: Arc<CheckpointService>,
        delivery: Arc<DeliveryService>,
    ) -> Self {
        Self {
            config,
            repo,
            events,
            bus,
            checkpoints,
            delivery,
            runs: Arc::new(RwLock::new(HashMap::new())),
            gate_waiters: ReplyWaiters::new(),
        }
    }

    pub fn events(&self) -> Arc<EventStore> {
        self.events.clone()
    }

    pub fn bus(&self) -> MessageBus {
        self.bus.clone()
    }

    // ========================================================================
    // Public contract
    // ========================================================================

    /// Create and launch a run for the given bindings.
    pub async fn start(&self, ctx: &RequestContext, spec: StartSpec) -> Result<String> {
        let mut run = Run::new(
            ctx.tenant_id.clone(),
            spec.project_id.clone(),
            spec.task_id.clone(),
        );
        run.step_id = spec.step_id.clone();
        run.session_id = spec.session_id.clone();
        self.start_run(ctx, run, spec).await
    }

    /// Launch a pre-built run (the resume/fork/rewind path hands one in).
    /// Duplicate starts are rejected with no side effect.
    pub async fn start_run(
        &self,
        ctx: &RequestContext,
        mut run: Run,
        spec: StartSpec,
    ) -> Result<String> {
        if spec.agent_id.trim().is_empty() {
            return Err(OverseerError::PreconditionDenied(
                "No agent bound to this run".to_string(),
            ));
        }

        let profile = match self.repo.load_profile(ctx, &spec.profile_name).await {
            Ok(profile) => profile,
            Err(OverseerError::NotFound(_)) => overseer_core::policy_presets::builtin(
                &spec.profile_name,
            )
            .ok_or_else(|| {
                OverseerError::PreconditionDenied(format!(
                    "Unknown policy profile '{}'",
                    spec.profile_name
                ))
            })?,
            Err(err) => return Err(err),
        };
        let compiled = CompiledProfile::compile(&profile).map_err(|e| {
            OverseerError::PreconditionDenied(format!("Invalid policy profile: {}", e))
        })?;

        // Duplicate start: already live, or persisted beyond pending.
        if self.runs.read().await.contains_key(&run.id) {
            return Err(OverseerError::PreconditionDenied(format!(
                "Run {} already started",
                run.id
            )));
        }
        match self.repo.load_run(ctx, &run.id).await {
            Ok(existing) if existing.status != RunStatus::Pending => {
                return Err(OverseerError::PreconditionDenied(format!(
                    "Run {} already started",
                    run.id
                )));
            }
            Ok(_) | Err(OverseerError::NotFound(_)) => {}
            Err(err) => return Err(err),
        }

        self.repo.save_run(ctx, &run).await?;

        let payload = StartPayload {
            run_id: run.id.clone(),
            task_id: run.task_id.clone(),
            agent_id: spec.agent_id.clone(),
            prompt: spec.prompt.clone(),
            profile_name: profile.name.clone(),
            context: spec.context.clone(),
        };
        let envelope = Envelope::new(subject::RUNS_START, &payload)?
            .with_request_id(ctx.request_id.clone());

        let publish = {
            let bus = self.bus.clone();
            move || {
                let bus = bus.clone();
                let envelope = envelope.clone();
                async move {
                    bus.publish(envelope)
                        .await
                        .map_err(|e| OverseerError::Transport(e.to_string()))
                }
            }
        };
        if let Err(err) = retry_transient(publish).await {
            run.status = RunStatus::Failed;
            run.ended_at = Some(Utc::now());
            run.error = Some(RunError::new(
                FailureReason::WorkerError,
                format!("Start publish failed: {}", err),
            ));
            run.updated_at = Utc::now();
            let _ = self.repo.save_run(ctx, &run).await;
            return Err(err);
        }

        // pending -> running
        let now = Utc::now();
        run.status = RunStatus::Running;
        run.started_at = Some(now);
        run.last_heartbeat_at = Some(now);
        run.updated_at = now;
        self.repo.save_run(ctx, &run).await?;

        let started = Event::new(
            run.id.clone(),
            run.task_id.clone(),
            spec.agent_id.clone(),
            kind::RUN_STARTED,
            json!({
                "project_id": run.project_id,
                "tenant_id": run.tenant_id,
                "step_id": run.step_id,
                "session_id": run.session_id,
                "model": run.model,
                "profile": profile.name,
                "started_at": now.to_rfc3339(),
            }),
        );
        self.events.append(started)?;

        let termination = compiled.profile().termination.clone();
        let stall = if termination.stall_detection {
            let threshold = if termination.stall_threshold > 0 {
                termination.stall_threshold
            } else {
                self.config.runtime.stall_threshold
            };
            Some(StallTracker::new(threshold))
        } else {
            None
        };

        let active = ActiveRun {
            run: run.clone(),
            ctx: ctx.clone(),
            agent_id: spec.agent_id.clone(),
            profile: Arc::new(compiled),
            deliver_mode: spec.deliver_mode,
            budget: BudgetTracker::new(termination, now),
            stall,
            cancel: CancellationToken::new(),
            pending_cancel: None,
            pending_calls: HashMap::new(),
            final_output: None,
        };
        self.runs
            .write()
            .await
            .insert(run.id.clone(), Arc::new(Mutex::new(active)));

        self.spawn_watchdog(run.id.clone());
        tracing::info!(run_id = run.id.as_str(), task_id = run.task_id.as_str(), "run started");
        Ok(run.id)
    }

    /// Request cancellation. Idempotent; the run is force-terminated after
    /// the grace period if the worker does not acknowledge.
    pub async fn cancel(
        &self,
        ctx: &RequestContext,
        run_id: &str,
        reason: FailureReason,
        detail: &str,
    ) -> Result<()> {
        let handle = { self.runs.read().await.get(run_id).cloned() };
        let Some(handle) = handle else {
            // Not live: a pending run is finalised directly, a terminal run
            // makes this a no-op.
            return match self.repo.load_run(ctx, run_id).await {
                Ok(run) if run.status.is_terminal() => Ok(()),
                Ok(mut run) => {
                    run.status = RunStatus::Cancelled;
                    run.ended_at = Some(Utc::now());
                    run.error = Some(RunError::new(reason, detail.to_string()));
                    run.updated_at = Utc::now();
                    self.repo.save_run(ctx, &run).await
                }
                Err(err) => Err(err),
            };
        };

        {
            let mut active = handle.lock().await;
            if active.run.status.is_terminal() || active.pending_cancel.is_some() {
                return Ok(());
            }
            active.pending_cancel = Some(reason);
        }

        let payload = CancelPayload {
            run_id: run_id.to_string(),
            reason: reason.as_str().to_string(),
        };
        let envelope =
            Envelope::new(subject::RUNS_CANCEL, &payload)?.with_request_id(ctx.request_id.clone());
        if let Err(err) = self.bus.publish(envelope).await {
            tracing::warn!(run_id, error = %err, "cancel publish failed; grace timer still runs");
        }

        // Force-mark cancelled after the grace window if the worker never
        // acknowledges; pending responses are discarded with the handle.
        let engine = self.clone();
        let run_id = run_id.to_string();
        let detail = detail.to_string();
        let grace = Duration::from_secs(self.config.runtime.cancel_grace_secs);
        tokio::spawn(async move {
            tokio::time::sleep(grace).await;
            if engine.is_active(&run_id).await {
                tracing::warn!(run_id = run_id.as_str(), "cancel grace expired; force-terminating");
                engine
                    .finish_run(&run_id, RunStatus::Cancelled, Some(RunError::new(reason, detail)))
                    .await;
            }
        });
        Ok(())
    }

    /// Latest persisted snapshot of a run.
    pub async fn observe(&self, ctx: &RequestContext, run_id: &str) -> Result<Run> {
        self.repo.load_run(ctx, run_id).await
    }

    pub async fn is_active(&self, run_id: &str) -> bool {
        self.runs.read().await.contains_key(run_id)
    }

    // ========================================================================
    // Worker message handling
    // ========================================================================

    /// Spawn the engine's consumer loops. The arbitrator owns the tool-call
    /// subjects; everything else lands here.
    pub async fn spawn_consumers(&self, shutdown: CancellationToken) -> Result<()> {
        let mut complete = self
            .bus
            .subscribe(subject::RUNS_COMPLETE, "engine")
            .await
            .map_err(|e| OverseerError::Transport(e.to_string()))?;
        let mut output = self
            .bus
            .subscribe(subject::RUNS_OUTPUT, "engine")
            .await
            .map_err(|e| OverseerError::Transport(e.to_string()))?;
        let mut gate = self
            .bus
            .subscribe(subject::RUNS_GATE_RESULT, "engine")
            .await
            .map_err(|e| OverseerError::Transport(e.to_string()))?;

        let engine = self.clone();
        let stop = shutdown.clone();
        tokio::spawn(async move {
            let mut dedup = DedupWindow::default();
            loop {
                tokio::select! {
                    _ = stop.cancelled() => break,
                    maybe = complete.recv() => {
                        let Some(envelope) = maybe else { break };
                        engine.handle_complete_envelope(envelope, &mut dedup).await;
                    }
                }
            }
        });

        let engine = self.clone();
        let stop = shutdown.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = stop.cancelled() => break,
                    maybe = output.recv() => {
                        let Some(envelope) = maybe else { break };
                        engine.handle_output_envelope(envelope).await;
                    }
                }
            }
        });

        let engine = self.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    maybe = gate.recv() => {
                        let Some(envelope) = maybe else { break };
                        engine.handle_gate_envelope(envelope).await;
                    }
                }
            }
        });

        Ok(())
    }

    async fn handle_output_envelope(&self, envelope: Envelope) {
        let payload: OutputPayload = match envelope.decode() {
            Ok(payload) => payload,
            Err(err) => {
                tracing::warn!(error = %err, "undecodable runs.output message dropped");
                return;
            }
        };
        self.touch_heartbeat(&payload.run_id).await;

        let handle = { self.runs.read().await.get(&payload.run_id).cloned() };
        let Some(handle) = handle else { return };
        let active = handle.lock().await;
        let event = Event::new(
            payload.run_id.clone(),
            active.run.task_id.clone(),
            active.agent_id.clone(),
            kind::RUN_OUTPUT,
            json!({ "stream": payload.stream, "line": payload.line }),
        );
        drop(active);
        if let Err(err) = self.events.append(event) {
            tracing::error!(run_id = payload.run_id.as_str(), error = %err, "failed to append output event");
        }
    }

    async fn handle_gate_envelope(&self, envelope: Envelope) {
        let payload: GateResult = match envelope.decode() {
            Ok(payload) => payload,
            Err(err) => {
                tracing::warn!(error = %err, "undecodable runs.gate.result message dropped");
                return;
            }
        };
        self.touch_heartbeat(&payload.run_id).await;
        let gate_id = payload.gate_id.clone();
        if !self.gate_waiters.resolve(&gate_id, payload).await {
            tracing::warn!(gate_id = gate_id.as_str(), "gate result for untracked gate dropped");
        }
    }

    async fn handle_complete_envelope(&self, envelope: Envelope, dedup: &mut DedupWindow) {
        let payload: CompletePayload = match envelope.decode() {
            Ok(payload) => payload,
            Err(err) => {
                tracing::warn!(error = %err, "undecodable runs.complete message dropped");
                return;
            }
        };
        if dedup.check_and_insert(format!("complete:{}", payload.run_id)) {
            return;
        }
        self.touch_heartbeat(&payload.run_id).await;
        if let Err(err) = self.handle_complete(payload).await {
            tracing::error!(error = %err, "failed to process completion");
        }
    }

    async fn handle_complete(&self, payload: CompletePayload) -> Result<()> {
        let handle = { self.runs.read().await.get(&payload.run_id).cloned() };
        let Some(handle) = handle else {
            tracing::warn!(run_id = payload.run_id.as_str(), "completion for unknown run dropped");
            return Ok(());
        };

        let (ctx, pending_cancel, gate, deliver_mode, final_output, run_snapshot) = {
            let mut active = handle.lock().await;
            active.budget.record_tokens(payload.tokens_in, payload.tokens_out);
            let current_cost_usd = active.budget.cost_usd();
            if payload.cost_usd > current_cost_usd {
                active.budget.record_cost(payload.cost_usd - current_cost_usd);
            }
            let (tokens_in, tokens_out) = active.budget.tokens();
            active.run.tokens_in = tokens_in;
            active.run.tokens_out = tokens_out;
            active.run.cost_usd = active.budget.cost_usd();
            active.final_output = payload.final_output.clone();
            (
                active.ctx.clone(),
                active.pending_cancel,
                active.profile.profile().quality_gate.clone(),
                active.deliver_mode,
                payload.final_output.clone(),
                active.run.clone(),
            )
        };

        match payload.status {
            WorkerRunStatus::Cancelled => {
                let reason = pending_cancel.unwrap_or(FailureReason::CancelledByUser);
                self.finish_run(
                    &payload.run_id,
                    RunStatus::Cancelled,
                    Some(RunError::new(reason, "Worker acknowledged cancel")),
                )
                .await;
            }
            WorkerRunStatus::Failed => {
                let detail = final_output.unwrap_or_else(|| "Worker reported failure".to_string());
                self.finish_run(
                    &payload.run_id,
                    RunStatus::Failed,
                    Some(RunError::new(FailureReason::WorkerError, detail)),
                )
                .await;
            }
            WorkerRunStatus::Completed => {
                if gate.require_tests_pass || gate.require_lint_pass {
                    match self.run_quality_gate(&ctx, &handle, &payload.run_id).await {
                        Ok(true) => {}
                        Ok(false) | Err(_) => {
                            if gate.rollback_on_gate_fail {
                                match self.checkpoints.rewind(&ctx, &payload.run_id, u64::MAX).await
                                {
                                    Ok(_) | Err(OverseerError::NotFound(_)) => {}
                                    Err(err) => {
                                        tracing::error!(error = %err, "gate rollback failed")
                                    }
                                }
                            }
                            self.finish_run(
                                &payload.run_id,
                                RunStatus::Failed,
                                Some(RunError::new(
                                    FailureReason::QualityGate,
                                    "Quality gate failed",
                                )),
                            )
                            .await;
                            return Ok(());
                        }
                    }
                }

                self.deliver(&ctx, &run_snapshot, deliver_mode, final_output.as_deref())
                    .await;
                self.finish_run(&payload.run_id, RunStatus::Completed, None).await;
            }
        }
        Ok(())
    }

    async fn deliver(
        &self,
        ctx: &RequestContext,
        run: &Run,
        mode: DeliverMode,
        final_output: Option<&str>,
    ) {
        match self.delivery.deliver(ctx, run, mode, final_output).await {
            Ok(outcome) => {
                self.append_for_run(run, kind::RUN_DELIVERED, delivery_payload(&outcome)).await;
            }
            Err(err) => {
                tracing::error!(run_id = run.id.as_str(), error = %err, "delivery failed");
                self.append_for_run(
                    run,
                    kind::RUN_DELIVERED,
                    json!({ "mode": mode, "success": false, "error": err.to_string() }),
                )
                .await;
            }
        }
    }

    // ========================================================================
    // Quality gate
    // ========================================================================

    /// Run the configured gate commands through the worker. Gate commands go
    /// through policy like any tool call, flagged `gate: true` in the log.
    async fn run_quality_gate(
        &self,
        ctx: &RequestContext,
        handle: &Arc<Mutex<ActiveRun>>,
        run_id: &str,
    ) -> Result<bool> {
        let (gate, profile, cancel) = {
            let active = handle.lock().await;
            (
                active.profile.profile().quality_gate.clone(),
                active.profile.clone(),
                active.cancel.clone(),
            )
        };

        let mut commands = Vec::new();
        if gate.require_tests_pass {
            commands.push((GateKind::Test, gate.test_command.clone()));
        }
        if gate.require_lint_pass {
            commands.push((GateKind::Lint, gate.lint_command.clone()));
        }

        for (kind_tag, command) in commands {
            if command.trim().is_empty() {
                tracing::warn!(run_id, kind = ?kind_tag, "gate enabled without a command; skipped");
                continue;
            }

            let call = ToolCall::named("Bash").with_command(command.clone());
            let evaluation = profile.evaluate(&call);
            self.append_toolcall_event(
                handle,
                ToolCallPhase::Requested,
                json!({ "tool": "Bash", "command": command, "gate": true }),
            )
            .await;
            let phase = match evaluation.decision {
                overseer_types::Decision::Allow => ToolCallPhase::Approved,
                overseer_types::Decision::Deny => ToolCallPhase::Denied,
                overseer_types::Decision::Ask => ToolCallPhase::Ask,
            };
            self.append_toolcall_event(
                handle,
                phase,
                json!({
                    "tool": "Bash",
                    "command": command,
                    "gate": true,
                    "rule_index": evaluation.rule_index,
                }),
            )
            .await;
            if evaluation.decision == overseer_types::Decision::Deny {
                tracing::warn!(run_id, "gate command denied by policy");
                return Ok(false);
            }

            let gate_id = prefixed_id("gate");
            self.gate_waiters.register(gate_id.clone()).await;

            let timeout = Duration::from_secs(self.config.runtime.quality_gate_timeout_secs);
            let request = GateRequest {
                run_id: run_id.to_string(),
                gate_id: gate_id.clone(),
                kind: kind_tag,
                command: command.clone(),
                timeout_ms: timeout.as_millis() as u64,
            };
            let envelope = Envelope::new(subject::RUNS_GATE_REQUEST, &request)?
                .with_request_id(ctx.request_id.clone());
            self.bus
                .publish(envelope)
                .await
                .map_err(|e| OverseerError::Transport(e.to_string()))?;

            let result = tokio::time::timeout(
                timeout,
                self.gate_waiters.wait(&gate_id, cancel.child_token()),
            )
            .await;

            let passed = match result {
                Ok(Some(result)) => {
                    self.append_for_active(
                        handle,
                        kind::RUN_GATE,
                        json!({
                            "gate_id": gate_id,
                            "kind": kind_tag,
                            "success": result.success,
                            "gate": true,
                        }),
                    )
                    .await;
                    result.success
                }
                Ok(None) => false,
                Err(_) => {
                    self.gate_waiters.forget(&gate_id).await;
                    tracing::warn!(run_id, gate_id = gate_id.as_str(), "gate timed out");
                    false
                }
            };
            if !passed {
                return Ok(false);
            }
        }
        Ok(true)
    }

    // ========================================================================
    // Tool-call ingestion (called by the arbitrator)
    // ========================================================================

    /// Remember a tool call between its request and its result.
    pub async fn track_tool_call(&self, run_id: &str, call_id: &str, call: ToolCall) {
        let handle = { self.runs.read().await.get(run_id).cloned() };
        if let Some(handle) = handle {
            let mut active = handle.lock().await;
            active.pending_calls.insert(call_id.to_string(), call);
        }
    }

    /// Active profile for arbitration; `None` means the run is not live.
    pub async fn active_profile(&self, run_id: &str) -> Option<Arc<CompiledProfile>> {
        let handle = { self.runs.read().await.get(run_id).cloned() }?;
        let active = handle.lock().await;
        if active.run.status.is_terminal() {
            return None;
        }
        Some(active.profile.clone())
    }

    /// Append a `run.toolcall` event for a live run.
    pub async fn record_toolcall_phase(&self, run_id: &str, phase: ToolCallPhase, detail: Value) {
        let handle = { self.runs.read().await.get(run_id).cloned() };
        if let Some(handle) = handle {
            self.append_toolcall_event(&handle, phase, detail).await;
        }
    }

    /// Ingest a tool result: update counters, stall state, checkpoints, and
    /// re-evaluate the termination predicate.
    pub async fn ingest_tool_result(&self, result: ToolCallResult) -> Result<()> {
        self.touch_heartbeat(&result.run_id).await;

        let handle = { self.runs.read().await.get(&result.run_id).cloned() };
        let Some(handle) = handle else {
            tracing::warn!(run_id = result.run_id.as_str(), "tool result for inactive run dropped");
            return Ok(());
        };

        let (ctx, call, event, stalled, budget_check) = {
            let mut active = handle.lock().await;
            if active.run.status.is_terminal() {
                return Ok(());
            }
            let call = active.pending_calls.remove(&result.call_id);
            let tool = call
                .as_ref()
                .map(|c| c.tool.clone())
                .unwrap_or_else(|| "unknown".to_string());

            active.budget.record_tool_call(result.cost_usd);
            active.run.step_count = active.budget.step_count();
            active.run.cost_usd = active.budget.cost_usd();
            active.run.updated_at = Utc::now();

            let output = result.output.clone().unwrap_or_default();
            let stalled = match active.stall.as_mut() {
                Some(stall) => {
                    stall.record(&tool, result.success, &output);
                    stall.is_stalled()
                }
                None => false,
            };
            let budget_check = active.budget.check(Utc::now());

            let mut preview = output;
            preview.truncate(OUTPUT_PREVIEW_BYTES);
            let event = Event::new(
                active.run.id.clone(),
                active.run.task_id.clone(),
                active.agent_id.clone(),
                kind::RUN_TOOLCALL,
                json!({
                    "phase": ToolCallPhase::Result.as_str(),
                    "call_id": result.call_id,
                    "tool": tool,
                    "success": result.success,
                    "output": preview,
                    "duration_ms": result.duration_ms,
                    "step_count": active.run.step_count,
                    "cost_usd": active.run.cost_usd,
                }),
            );
            (active.ctx.clone(), call, event, stalled, budget_check)
        };

        self.persist_active(&handle).await;
        let appended = self.events.append(event)?;

        // Mutating success snapshots the shadow workspace at this sequence.
        let is_mutating = call
            .as_ref()
            .map(|c| MUTATING_TOOLS.contains(&c.tool.as_str()))
            .unwrap_or(false);
        if result.success && is_mutating {
            match self
                .checkpoints
                .snapshot(&ctx, &result.run_id, appended.version)
                .await
            {
                Ok(checkpoint) => {
                    self.append_for_active(
                        &handle,
                        kind::RUN_CHECKPOINT,
                        json!({
                            "sequence": checkpoint.sequence,
                            "commit_hash": checkpoint.commit_hash,
                        }),
                    )
                    .await;
                }
                Err(err) => {
                    tracing::error!(run_id = result.run_id.as_str(), error = %err, "checkpoint failed");
                }
            }
        }

        // Termination predicate, evaluated after every state-changing event.
        match budget_check {
            BudgetCheck::Exceeded { dimension, reason } => {
                let status = if reason == FailureReason::Timeout {
                    RunStatus::Timeout
                } else {
                    RunStatus::Failed
                };
                self.finish_run(
                    &result.run_id,
                    status,
                    Some(RunError::new(reason, format!("Budget exceeded: {}", dimension))),
                )
                .await;
                return Ok(());
            }
            BudgetCheck::Warning { dimension, percentage } => {
                tracing::warn!(
                    run_id = result.run_id.as_str(),
                    dimension,
                    "budget at {:.0}%",
                    percentage * 100.0
                );
            }
            BudgetCheck::Ok => {}
        }
        if stalled {
            self.finish_run(
                &result.run_id,
                RunStatus::Failed,
                Some(RunError::new(
                    FailureReason::Stall,
                    "No progress within the stall window",
                )),
            )
            .await;
        }
        Ok(())
    }

    /// Every worker message bumps the heartbeat.
    pub async fn touch_heartbeat(&self, run_id: &str) {
        let handle = { self.runs.read().await.get(run_id).cloned() };
        if let Some(handle) = handle {
            let mut active = handle.lock().await;
            active.run.last_heartbeat_at = Some(Utc::now());
        }
    }

    // ========================================================================
    // Watchdog and termination
    // ========================================================================

    fn spawn_watchdog(&self, run_id: String) {
        let engine = self.clone();
        tokio::spawn(async move {
            let tick = Duration::from_secs(engine.config.runtime.heartbeat_tick_secs);
            loop {
                tokio::time::sleep(WATCHDOG_TICK).await;

                let handle = { engine.runs.read().await.get(&run_id).cloned() };
                let Some(handle) = handle else { break };

                let (cancelled, heartbeat_lost, budget_check) = {
                    let mut active = handle.lock().await;
                    if active.run.status.is_terminal() {
                        break;
                    }
                    let now = Utc::now();
                    let loss_bound = chrono::Duration::seconds((tick.as_secs() as i64) * 2);
                    let heartbeat_lost = active
                        .run
                        .last_heartbeat_at
                        .map(|last| now - last > loss_bound)
                        .unwrap_or(false);
                    (
                        active.cancel.is_cancelled(),
                        heartbeat_lost,
                        active.budget.check(now),
                    )
                };

                if cancelled {
                    break;
                }
                if let BudgetCheck::Exceeded { dimension, reason } = budget_check {
                    let status = if reason == FailureReason::Timeout {
                        RunStatus::Timeout
                    } else {
                        RunStatus::Failed
                    };
                    engine
                        .finish_run(
                            &run_id,
                            status,
                            Some(RunError::new(reason, format!("Budget exceeded: {}", dimension))),
                        )
                        .await;
                    break;
                }
                if heartbeat_lost {
                    engine
                        .finish_run(
                            &run_id,
                            RunStatus::Failed,
                            Some(RunError::new(
                                FailureReason::HeartbeatLost,
                                "No worker heartbeat within twice the expected tick",
                            )),
                        )
                        .await;
                    break;
                }
            }
        });
    }

    /// Transition a run to a terminal state: persist, emit the terminal
    /// event, drop the handle. Terminal states are absorbing; repeat calls
    /// are no-ops.
    pub(crate) async fn finish_run(
        &self,
        run_id: &str,
        status: RunStatus,
        error: Option<RunError>,
    ) {
        let handle = { self.runs.write().await.remove(run_id) };
        let Some(handle) = handle else { return };

        let mut active = handle.lock().await;
        if active.run.status.is_terminal() {
            return;
        }

        let now = Utc::now();
        active.run.status = status;
        active.run.ended_at = Some(now);
        active.run.error = error.clone();
        active.run.updated_at = now;
        active.cancel.cancel();

        let ctx = active.ctx.clone();
        let run = active.run.clone();
        let agent_id = active.agent_id.clone();
        let final_output = active.final_output.clone();
        drop(active);

        let save = {
            let repo = self.repo.clone();
            let ctx = ctx.clone();
            let run = run.clone();
            move || {
                let repo = repo.clone();
                let ctx = ctx.clone();
                let run = run.clone();
                async move { repo.save_run(&ctx, &run).await }
            }
        };
        if let Err(err) = retry_transient(save).await {
            tracing::error!(run_id, error = %err, "failed to persist terminal run state");
        }

        let event_type = match status {
            RunStatus::Completed => kind::RUN_COMPLETED,
            RunStatus::Cancelled => kind::RUN_CANCELLED,
            RunStatus::Timeout => kind::RUN_TIMEOUT,
            _ => kind::RUN_FAILED,
        };
        let mut payload = json!({
            "step_count": run.step_count,
            "cost_usd": run.cost_usd,
            "tokens_in": run.tokens_in,
            "tokens_out": run.tokens_out,
            "ended_at": now.to_rfc3339(),
        });
        if let Some(error) = &error {
            payload["reason"] = json!(error.reason.as_str());
            payload["detail"] = json!(error.detail);
        }
        if status == RunStatus::Completed {
            payload["final_output"] = json!(final_output);
        }
        let event = Event::new(run.id.clone(), run.task_id.clone(), agent_id, event_type, payload);
        if let Err(err) = self.events.append(event) {
            tracing::error!(run_id, error = %err, "failed to append terminal event");
        }
        tracing::info!(run_id, status = ?status, "run finished");
    }

    // ========================================================================
    // Helpers
    // ========================================================================

    async fn persist_active(&self, handle: &Arc<Mutex<ActiveRun>>) {
        let (ctx, run) = {
            let active = handle.lock().await;
            (active.ctx.clone(), active.run.clone())
        };
        if let Err(err) = self.repo.save_run(&ctx, &run).await {
            tracing::error!(run_id = run.id.as_str(), error = %err, "failed to persist run");
        }
    }

    async fn append_toolcall_event(
        &self,
        handle: &Arc<Mutex<ActiveRun>>,
        phase: ToolCallPhase,
        mut detail: Value,
    ) {
        detail["phase"] = json!(phase.as_str());
        self.append_for_active(handle, kind::RUN_TOOLCALL, detail).await;
    }

    async fn append_for_active(&self, handle: &Arc<Mutex<ActiveRun>>, event_type: &str, payload: Value) {
        let event = {
            let active = handle.lock().await;
            Event::new(
                active.run.id.clone(),
                active.run.task_id.clone(),
                active.agent_id.clone(),
                event_type,
                payload,
            )
        };
        if let Err(err) = self.events.append(event) {
            tracing::error!(error = %err, "failed to append event");
        }
    }

    async fn append_for_run(&self, run: &Run, event_type: &str, payload: Value) {
        let event = Event::new(
            run.id.clone(),
            run.task_id.clone(),
            "control-plane".to_string(),
            event_type,
            payload,
        );
        if let Err(err) = self.events.append(event) {
            tracing::error!(error = %err, "failed to append event");
        }
    }
}

fn delivery_payload(outcome: &DeliveryOutcome) -> Value {
    json!({
        "mode": outcome.mode,
        "success": true,
        "patch": outcome.patch,
        "commit": outcome.commit,
        "branch": outcome.branch,
        "pull_request_url": outcome.pull_request_url,
    })
}

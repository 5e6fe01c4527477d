// End-to-end scenarios with a scripted in-process worker on the bus.

use std::collections::HashSet;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{Mutex, RwLock};
use tokio_util::sync::CancellationToken;

use overseer_core::{
    CheckpointService, EventStore, MemoryRepository, NullNotifier, OverseerConfig, OverseerError,
    Repository, ShadowVersionControl,
};
use overseer_types::{
    Decision, DeliverMode, FailureReason, Plan, PlanProtocol, PlanStatus, PolicyMode,
    PolicyProfile, RequestContext, Run, RunStatus, Step, StepStatus, Termination,
};
use overseer_transport::{MessageBus, ReplyWaiters};
use overseer_wire::{
    subject, CancelPayload, CompletePayload, Envelope, GateRequest, GateResult, StartPayload,
    ToolCallRequest, ToolCallResponse, ToolCallResult, WorkerRunStatus,
};

use crate::arbitrator::Arbitrator;
use crate::delivery::DeliveryService;
use crate::engine::{RunEngine, StartSpec};
use crate::scheduler::PlanScheduler;

// ============================================================================
// Scripted worker
// ============================================================================

#[derive(Clone)]
enum WorkerAction {
    Call {
        tool: &'static str,
        command: Option<String>,
        path: Option<String>,
        success: bool,
        output: String,
        cost_usd: Option<f64>,
    },
    Sleep(Duration),
    Complete {
        status: WorkerRunStatus,
        final_output: Option<String>,
        cost_usd: f64,
    },
}

fn call(tool: &'static str, output: &str, cost_usd: Option<f64>) -> WorkerAction {
    WorkerAction::Call {
        tool,
        command: None,
        path: None,
        success: true,
        output: output.to_string(),
        cost_usd,
    }
}

fn complete(output: &str) -> WorkerAction {
    WorkerAction::Complete {
        status: WorkerRunStatus::Completed,
        final_output: Some(output.to_string()),
        cost_usd: 0.0,
    }
}

type ScriptFn = dyn Fn(&StartPayload) -> Vec<WorkerAction> + Send + Sync;

/// Plays scripted worker behavior against the control plane over the bus.
struct FakeWorker {
    responses: Arc<Mutex<Vec<ToolCallResponse>>>,
    max_running: Arc<AtomicUsize>,
}

impl FakeWorker {
    async fn spawn(
        bus: MessageBus,
        script: Arc<ScriptFn>,
        gate_success: bool,
        shutdown: CancellationToken,
    ) -> FakeWorker {
        let responses: Arc<Mutex<Vec<ToolCallResponse>>> = Arc::new(Mutex::new(Vec::new()));
        let waiters: ReplyWaiters<ToolCallResponse> = ReplyWaiters::new();
        let cancelled: Arc<RwLock<HashSet<String>>> = Arc::new(RwLock::new(HashSet::new()));
        let running = Arc::new(AtomicUsize::new(0));
        let max_running = Arc::new(AtomicUsize::new(0));

        let mut start_sub = bus.subscribe(subject::RUNS_START, "worker").await.unwrap();
        let mut cancel_sub = bus.subscribe(subject::RUNS_CANCEL, "worker").await.unwrap();
        let mut response_sub = bus
            .subscribe(subject::RUNS_TOOLCALL_RESPONSE, "worker")
            .await
            .unwrap();
        let mut gate_sub = bus
            .subscribe(subject::RUNS_GATE_REQUEST, "worker")
            .await
            .unwrap();

        {
            let responses = responses.clone();
            let waiters = waiters.clone();
            let stop = shutdown.clone();
            tokio::spawn(async move {
                loop {
                    tokio::select! {
                        _ = stop.cancelled() => break,
                        maybe = response_sub.recv() => {
                            let Some(envelope) = maybe else { break };
                            let Ok(response) = envelope.decode::<ToolCallResponse>() else { continue };
                            responses.lock().await.push(response.clone());
                            let call_id = response.call_id.clone();
                            let _ = waiters.resolve(&call_id, response).await;
                        }
                    }
                }
            });
        }

        {
            let bus = bus.clone();
            let cancelled = cancelled.clone();
            let stop = shutdown.clone();
            tokio::spawn(async move {
                loop {
                    tokio::select! {
                        _ = stop.cancelled() => break,
                        maybe = cancel_sub.recv() => {
                            let Some(envelope) = maybe else { break };
                            let Ok(payload) = envelope.decode::<CancelPayload>() else { continue };
                            cancelled.write().await.insert(payload.run_id.clone());
                            let ack = CompletePayload {
                                run_id: payload.run_id,
                                status: WorkerRunStatus::Cancelled,
                                final_output: None,
                                tokens_in: 0,
                                tokens_out: 0,
                                cost_usd: 0.0,
                            };
                            let envelope = Envelope::new(subject::RUNS_COMPLETE, &ack).unwrap();
                            let _ = bus.publish(envelope).await;
                        }
                    }
                }
            });
        }

        {
            let bus = bus.clone();
            let stop = shutdown.clone();
            tokio::spawn(async move {
                loop {
                    tokio::select! {
                        _ = stop.cancelled() => break,
                        maybe = gate_sub.recv() => {
                            let Some(envelope) = maybe else { break };
                            let Ok(request) = envelope.decode::<GateRequest>() else { continue };
                            let result = GateResult {
                                run_id: request.run_id,
                                gate_id: request.gate_id,
                                success: gate_success,
                                output: None,
                            };
                            let envelope = Envelope::new(subject::RUNS_GATE_RESULT, &result).unwrap();
                            let _ = bus.publish(envelope).await;
                        }
                    }
                }
            });
        }

        {
            let bus = bus.clone();
            let waiters = waiters.clone();
            let cancelled = cancelled.clone();
            let running = running.clone();
            let max_running = max_running.clone();
            let stop = shutdown.clone();
            tokio::spawn(async move {
                loop {
                    let envelope = tokio::select! {
                        _ = stop.cancelled() => break,
                        maybe = start_sub.recv() => {
                            let Some(envelope) = maybe else { break };
                            envelope
                        }
                    };
                    let Ok(payload) = envelope.decode::<StartPayload>() else { continue };
                    let actions = script(&payload);

                    let bus = bus.clone();
                    let waiters = waiters.clone();
                    let cancelled = cancelled.clone();
                    let running = running.clone();
                    let max_running = max_running.clone();
                    let stop = stop.clone();
                    tokio::spawn(async move {
                        let now = running.fetch_add(1, Ordering::SeqCst) + 1;
                        max_running.fetch_max(now, Ordering::SeqCst);

                        for action in actions {
                            if cancelled.read().await.contains(&payload.run_id) {
                                break;
                            }
                            match action {
                                WorkerAction::Sleep(duration) => tokio::time::sleep(duration).await,
                                WorkerAction::Call {
                                    tool,
                                    command,
                                    path,
                                    success,
                                    output,
                                    cost_usd,
                                } => {
                                    let call_id = uuid::Uuid::new_v4().to_string();
                                    waiters.register(call_id.clone()).await;
                                    let request = ToolCallRequest {
                                        run_id: payload.run_id.clone(),
                                        call_id: call_id.clone(),
                                        tool: tool.to_string(),
                                        command,
                                        path,
                                        args: None,
                                    };
                                    let envelope =
                                        Envelope::new(subject::RUNS_TOOLCALL_REQUEST, &request)
                                            .unwrap();
                                    if bus.publish(envelope).await.is_err() {
                                        break;
                                    }
                                    let response = tokio::time::timeout(
                                        Duration::from_secs(2),
                                        waiters.wait(&call_id, stop.child_token()),
                                    )
                                    .await
                                    .ok()
                                    .flatten();

                                    if response.map(|r| r.decision) == Some(Decision::Allow) {
                                        let result = ToolCallResult {
                                            run_id: payload.run_id.clone(),
                                            call_id,
                                            success,
                                            output: Some(output),
                                            error: None,
                                            cost_usd,
                                            duration_ms: Some(5),
                                        };
                                        let envelope = Envelope::new(
                                            subject::RUNS_TOOLCALL_RESULT,
                                            &result,
                                        )
                                        .unwrap();
                                        let _ = bus.publish(envelope).await;
                                        // Let the result land before the next request.
                                        tokio::time::sleep(Duration::from_millis(20)).await;
                                    }
                                }
                                WorkerAction::Complete {
                                    status,
                                    final_output,
                                    cost_usd,
                                } => {
                                    let complete = CompletePayload {
                                        run_id: payload.run_id.clone(),
                                        status,
                                        final_output,
                                        tokens_in: 100,
                                        tokens_out: 40,
                                        cost_usd,
                                    };
                                    let envelope =
                                        Envelope::new(subject::RUNS_COMPLETE, &complete).unwrap();
                                    let _ = bus.publish(envelope).await;
                                    break;
                                }
                            }
                        }
                        running.fetch_sub(1, Ordering::SeqCst);
                    });
                }
            });
        }

        FakeWorker {
            responses,
            max_running,
        }
    }

    async fn responses(&self) -> Vec<ToolCallResponse> {
        self.responses.lock().await.clone()
    }
}

// ============================================================================
// Harness
// ============================================================================

struct Harness {
    ctx: RequestContext,
    repo: Arc<MemoryRepository>,
    engine: RunEngine,
    scheduler: PlanScheduler,
    shutdown: CancellationToken,
    _temp: tempfile::TempDir,
}

impl Drop for Harness {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

async fn make_harness(config: OverseerConfig) -> Harness {
    let temp = tempfile::tempdir().unwrap();
    let config = Arc::new(config);
    let repo = Arc::new(MemoryRepository::with_builtin_profiles().await);
    let events = Arc::new(EventStore::new(temp.path()).unwrap());
    let bus = MessageBus::default();
    let vcs = Arc::new(ShadowVersionControl::new());
    let checkpoints = Arc::new(CheckpointService::new(repo.clone(), vcs.clone()));
    let delivery = Arc::new(DeliveryService::new(vcs));

    let engine = RunEngine::new(
        config.clone(),
        repo.clone(),
        events,
        bus,
        checkpoints,
        delivery,
    );

    let shutdown = CancellationToken::new();
    engine.spawn_consumers(shutdown.child_token()).await.unwrap();
    Arbitrator::new(engine.clone()).spawn(shutdown.child_token());

    let scheduler = PlanScheduler::new(
        config,
        repo.clone(),
        engine.clone(),
        Arc::new(NullNotifier),
    );

    Harness {
        ctx: RequestContext::new("tenant-1", "tester"),
        repo,
        engine,
        scheduler,
        shutdown,
        _temp: temp,
    }
}

async fn spawn_worker(harness: &Harness, script: Arc<ScriptFn>) -> FakeWorker {
    FakeWorker::spawn(
        harness.engine.bus(),
        script,
        true,
        harness.shutdown.child_token(),
    )
    .await
}

fn spec(task_id: &str, profile: &str) -> StartSpec {
    StartSpec {
        step_id: None,
        task_id: task_id.to_string(),
        project_id: "proj-1".to_string(),
        agent_id: "agent-1".to_string(),
        profile_name: profile.to_string(),
        prompt: format!("task:{}", task_id),
        deliver_mode: DeliverMode::Patch,
        session_id: None,
        context: serde_json::json!({}),
    }
}

async fn wait_for_terminal(harness: &Harness, run_id: &str, deadline: Duration) -> Run {
    let started = tokio::time::Instant::now();
    loop {
        let run = harness.engine.observe(&harness.ctx, run_id).await.unwrap();
        if run.status.is_terminal() {
            return run;
        }
        assert!(
            started.elapsed() < deadline,
            "run {} did not reach a terminal state in time",
            run_id
        );
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
}

fn make_plan_with_steps(protocol: PlanProtocol, tasks: Vec<(&str, Vec<&str>)>) -> Plan {
    let mut plan = Plan::new("tenant-1", "proj-1", protocol);
    let mut steps = Vec::new();
    for (task_id, deps) in tasks {
        let mut step = Step::new(plan.id.clone(), task_id, "agent-1", "delegate");
        step.id = format!("step-{}", task_id);
        step.depends_on = deps.into_iter().map(|d| format!("step-{}", d)).collect();
        steps.push(step);
    }
    plan.steps = steps;
    plan
}

fn unrestricted_profile(name: &str, termination: Termination) -> PolicyProfile {
    let mut profile = PolicyProfile::new(name, PolicyMode::Delegate);
    profile.termination = termination;
    profile
}

// ============================================================================
// Single-run scenarios
// ============================================================================

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn run_completes_and_delivers_patch() {
    let harness = make_harness(OverseerConfig::default()).await;
    let script: Arc<ScriptFn> = Arc::new(|_start| {
        vec![
            call("Read", "fn main() {}", None),
            complete("final artifact"),
        ]
    });
    let _worker = spawn_worker(&harness, script).await;

    let run_id = harness
        .engine
        .start(&harness.ctx, spec("task-1", "delegate"))
        .await
        .unwrap();
    let run = wait_for_terminal(&harness, &run_id, Duration::from_secs(5)).await;

    assert_eq!(run.status, RunStatus::Completed);
    assert_eq!(run.step_count, 1);
    assert!(run.ended_at.is_some());

    let events = harness.engine.events().load_by_run(&run_id).unwrap();
    let types: Vec<&str> = events.iter().map(|e| e.event_type.as_str()).collect();
    assert!(types.contains(&"run.started"));
    assert!(types.contains(&"run.delivered"));
    assert_eq!(*types.last().unwrap(), "run.completed");

    // P2: versions are dense from 1.
    let versions: Vec<u64> = events.iter().map(|e| e.version).collect();
    assert_eq!(versions, (1..=versions.len() as u64).collect::<Vec<_>>());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn stalled_run_fails_with_stall_reason() {
    let harness = make_harness(OverseerConfig::default()).await;
    let profile = unrestricted_profile(
        "stall-test",
        Termination {
            max_steps: 100,
            timeout_seconds: 600,
            max_cost: 100.0,
            stall_detection: true,
            stall_threshold: 3,
        },
    );
    harness.repo.save_profile(&harness.ctx, &profile).await.unwrap();

    let script: Arc<ScriptFn> = Arc::new(|_start| {
        vec![
            call("Read", "identical bytes", None),
            call("Read", "identical bytes", None),
            call("Read", "identical bytes", None),
            // The run is failed by now; this call must be denied.
            call("Read", "identical bytes", None),
            complete("never reached"),
        ]
    });
    let worker = spawn_worker(&harness, script).await;

    let run_id = harness
        .engine
        .start(&harness.ctx, spec("task-stall", "stall-test"))
        .await
        .unwrap();
    let run = wait_for_terminal(&harness, &run_id, Duration::from_secs(5)).await;

    assert_eq!(run.status, RunStatus::Failed);
    assert_eq!(run.error.as_ref().unwrap().reason, FailureReason::Stall);

    // Give the trailing request time to be arbitrated.
    tokio::time::sleep(Duration::from_millis(200)).await;
    let responses = worker.responses().await;
    let last = responses.last().unwrap();
    assert_eq!(last.decision, Decision::Deny);
    assert_eq!(last.reason.as_deref(), Some("run_terminated"));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn cost_budget_terminates_the_run() {
    let harness = make_harness(OverseerConfig::default()).await;
    let profile = unrestricted_profile(
        "budget-test",
        Termination {
            max_steps: 100,
            timeout_seconds: 600,
            max_cost: 1.0,
            stall_detection: false,
            stall_threshold: 0,
        },
    );
    harness.repo.save_profile(&harness.ctx, &profile).await.unwrap();

    let script: Arc<ScriptFn> = Arc::new(|_start| {
        vec![
            call("Edit", "patch one", Some(0.4)),
            call("Edit", "patch two", Some(0.5)),
            call("Edit", "patch three", Some(0.2)),
            call("Edit", "patch four", Some(0.1)),
            complete("never reached"),
        ]
    });
    let worker = spawn_worker(&harness, script).await;

    let run_id = harness
        .engine
        .start(&harness.ctx, spec("task-budget", "budget-test"))
        .await
        .unwrap();
    let run = wait_for_terminal(&harness, &run_id, Duration::from_secs(5)).await;

    assert_eq!(run.status, RunStatus::Failed);
    assert_eq!(run.error.as_ref().unwrap().reason, FailureReason::MaxCost);
    assert!(run.cost_usd >= 1.0);
    assert_eq!(run.step_count, 3);

    tokio::time::sleep(Duration::from_millis(200)).await;
    let responses = worker.responses().await;
    let last = responses.last().unwrap();
    assert_eq!(last.decision, Decision::Deny);
    assert_eq!(last.reason.as_deref(), Some("run_terminated"));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn heartbeat_silence_fails_the_run() {
    let mut config = OverseerConfig::default();
    config.runtime.heartbeat_tick_secs = 1;
    let harness = make_harness(config).await;

    // A worker that acknowledges nothing: no heartbeat ever arrives.
    let script: Arc<ScriptFn> = Arc::new(|_start| vec![WorkerAction::Sleep(Duration::from_secs(30))]);
    let _worker = spawn_worker(&harness, script).await;

    let run_id = harness
        .engine
        .start(&harness.ctx, spec("task-quiet", "delegate"))
        .await
        .unwrap();
    let run = wait_for_terminal(&harness, &run_id, Duration::from_secs(6)).await;

    assert_eq!(run.status, RunStatus::Failed);
    assert_eq!(
        run.error.as_ref().unwrap().reason,
        FailureReason::HeartbeatLost
    );
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn wall_clock_timeout_produces_timeout_status() {
    let harness = make_harness(OverseerConfig::default()).await;
    let profile = unrestricted_profile(
        "timeout-test",
        Termination {
            max_steps: 100,
            timeout_seconds: 1,
            max_cost: 100.0,
            stall_detection: false,
            stall_threshold: 0,
        },
    );
    harness.repo.save_profile(&harness.ctx, &profile).await.unwrap();

    // Keep heartbeats flowing so only the wall clock can fire.
    let script: Arc<ScriptFn> = Arc::new(|_start| {
        let mut actions = Vec::new();
        for idx in 0..20 {
            actions.push(call("Read", &format!("tick {}", idx), None));
            actions.push(WorkerAction::Sleep(Duration::from_millis(150)));
        }
        actions.push(complete("too late"));
        actions
    });
    let _worker = spawn_worker(&harness, script).await;

    let run_id = harness
        .engine
        .start(&harness.ctx, spec("task-slow", "timeout-test"))
        .await
        .unwrap();
    let run = wait_for_terminal(&harness, &run_id, Duration::from_secs(6)).await;

    assert_eq!(run.status, RunStatus::Timeout);
    assert_eq!(run.error.as_ref().unwrap().reason, FailureReason::Timeout);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn cancel_reaches_terminal_within_grace() {
    let harness = make_harness(OverseerConfig::default()).await;
    let script: Arc<ScriptFn> = Arc::new(|_start| {
        vec![WorkerAction::Sleep(Duration::from_secs(30)), complete("unused")]
    });
    let _worker = spawn_worker(&harness, script).await;

    let run_id = harness
        .engine
        .start(&harness.ctx, spec("task-cancel", "delegate"))
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_millis(100)).await;

    harness
        .engine
        .cancel(&harness.ctx, &run_id, FailureReason::CancelledByUser, "user asked")
        .await
        .unwrap();
    let run = wait_for_terminal(&harness, &run_id, Duration::from_secs(3)).await;
    assert_eq!(run.status, RunStatus::Cancelled);

    // Duplicate cancel is a no-op.
    harness
        .engine
        .cancel(&harness.ctx, &run_id, FailureReason::CancelledByUser, "again")
        .await
        .unwrap();
    let run = harness.engine.observe(&harness.ctx, &run_id).await.unwrap();
    assert_eq!(run.status, RunStatus::Cancelled);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn duplicate_start_is_rejected_without_side_effect() {
    let harness = make_harness(OverseerConfig::default()).await;
    let script: Arc<ScriptFn> = Arc::new(|_start| vec![WorkerAction::Sleep(Duration::from_secs(5))]);
    let _worker = spawn_worker(&harness, script).await;

    let run_id = harness
        .engine
        .start(&harness.ctx, spec("task-dup", "delegate"))
        .await
        .unwrap();

    let run = harness.engine.observe(&harness.ctx, &run_id).await.unwrap();
    let err = harness
        .engine
        .start_run(&harness.ctx, run, spec("task-dup", "delegate"))
        .await
        .unwrap_err();
    assert!(matches!(err, OverseerError::PreconditionDenied(_)));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn failing_quality_gate_fails_the_run() {
    let harness = make_harness(OverseerConfig::default()).await;
    let mut profile = unrestricted_profile("gated", Termination::default());
    profile.quality_gate.require_tests_pass = true;
    profile.quality_gate.test_command = "cargo test".to_string();
    harness.repo.save_profile(&harness.ctx, &profile).await.unwrap();

    let script: Arc<ScriptFn> = Arc::new(|_start| vec![complete("gated artifact")]);
    let _worker = FakeWorker::spawn(
        harness.engine.bus(),
        script,
        false, // gate commands fail
        harness.shutdown.child_token(),
    )
    .await;

    let run_id = harness
        .engine
        .start(&harness.ctx, spec("task-gate", "gated"))
        .await
        .unwrap();
    let run = wait_for_terminal(&harness, &run_id, Duration::from_secs(5)).await;

    assert_eq!(run.status, RunStatus::Failed);
    assert_eq!(
        run.error.as_ref().unwrap().reason,
        FailureReason::QualityGate
    );
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn passing_quality_gate_completes_with_gate_events() {
    let harness = make_harness(OverseerConfig::default()).await;
    let mut profile = unrestricted_profile("gated-ok", Termination::default());
    profile.quality_gate.require_tests_pass = true;
    profile.quality_gate.test_command = "cargo test".to_string();
    harness.repo.save_profile(&harness.ctx, &profile).await.unwrap();

    let script: Arc<ScriptFn> = Arc::new(|_start| vec![complete("gated artifact")]);
    let _worker = spawn_worker(&harness, script).await;

    let run_id = harness
        .engine
        .start(&harness.ctx, spec("task-gate-ok", "gated-ok"))
        .await
        .unwrap();
    let run = wait_for_terminal(&harness, &run_id, Duration::from_secs(5)).await;
    assert_eq!(run.status, RunStatus::Completed);

    let events = harness.engine.events().load_by_run(&run_id).unwrap();
    let gate_event = events
        .iter()
        .find(|e| e.event_type == "run.gate")
        .expect("gate event");
    assert_eq!(gate_event.payload["gate"], true);
    assert_eq!(gate_event.payload["success"], true);
}

// ============================================================================
// Plan scenarios
// ============================================================================

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn parallel_plan_respects_fanout_cap() {
    let harness = make_harness(OverseerConfig::default()).await;
    let script: Arc<ScriptFn> = Arc::new(|start| {
        vec![
            WorkerAction::Sleep(Duration::from_millis(150)),
            complete(&format!("done:{}", start.task_id)),
        ]
    });
    let worker = spawn_worker(&harness, script).await;

    let mut plan = make_plan_with_steps(
        PlanProtocol::Parallel,
        vec![
            ("t1", vec![]),
            ("t2", vec![]),
            ("t3", vec![]),
            ("t4", vec![]),
            ("t5", vec![]),
        ],
    );
    plan.max_parallel = 2;
    harness.repo.save_plan(&harness.ctx, &plan).await.unwrap();

    let outcome = harness.scheduler.execute(&harness.ctx, &plan.id).await.unwrap();

    assert_eq!(outcome.plan.status, PlanStatus::Completed);
    assert!(outcome
        .plan
        .steps
        .iter()
        .all(|s| s.status == StepStatus::Completed));
    assert!(
        worker.max_running.load(Ordering::SeqCst) <= 2,
        "observed fan-out above the cap"
    );
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn sequential_plan_runs_one_at_a_time_in_order() {
    let harness = make_harness(OverseerConfig::default()).await;
    let script: Arc<ScriptFn> = Arc::new(|start| {
        vec![
            WorkerAction::Sleep(Duration::from_millis(50)),
            complete(&format!("done:{}", start.task_id)),
        ]
    });
    let worker = spawn_worker(&harness, script).await;

    let plan = make_plan_with_steps(
        PlanProtocol::Sequential,
        vec![("t1", vec![]), ("t2", vec!["t1"]), ("t3", vec!["t2"])],
    );
    harness.repo.save_plan(&harness.ctx, &plan).await.unwrap();

    let outcome = harness.scheduler.execute(&harness.ctx, &plan.id).await.unwrap();
    assert_eq!(outcome.plan.status, PlanStatus::Completed);
    assert_eq!(worker.max_running.load(Ordering::SeqCst), 1);
    assert_eq!(outcome.artifact.as_deref(), Some("done:t3"));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn failed_step_skips_descendants_and_fails_plan() {
    let harness = make_harness(OverseerConfig::default()).await;
    let script: Arc<ScriptFn> = Arc::new(|start| {
        if start.task_id == "t2" {
            vec![WorkerAction::Complete {
                status: WorkerRunStatus::Failed,
                final_output: Some("worker exploded".to_string()),
                cost_usd: 0.0,
            }]
        } else {
            vec![complete(&format!("done:{}", start.task_id))]
        }
    });
    let _worker = spawn_worker(&harness, script).await;

    let plan = make_plan_with_steps(
        PlanProtocol::Sequential,
        vec![("t1", vec![]), ("t2", vec!["t1"]), ("t3", vec!["t2"])],
    );
    harness.repo.save_plan(&harness.ctx, &plan).await.unwrap();

    let outcome = harness.scheduler.execute(&harness.ctx, &plan.id).await.unwrap();

    assert_eq!(outcome.plan.status, PlanStatus::Failed);
    assert_eq!(
        outcome.plan.step("step-t2").unwrap().status,
        StepStatus::Failed
    );
    assert_eq!(
        outcome.plan.step("step-t3").unwrap().status,
        StepStatus::Skipped
    );
    assert_eq!(
        outcome.plan.step("step-t1").unwrap().status,
        StepStatus::Completed
    );
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn ping_pong_converges_on_round_two() {
    let harness = make_harness(OverseerConfig::default()).await;
    let turns = Arc::new(AtomicUsize::new(0));
    let script: Arc<ScriptFn> = {
        let turns = turns.clone();
        Arc::new(move |_start| {
            let turn = turns.fetch_add(1, Ordering::SeqCst);
            if turn == 0 {
                vec![complete("draft v1")]
            } else {
                vec![complete("converged: draft accepted")]
            }
        })
    };
    let _worker = spawn_worker(&harness, script).await;

    let plan = make_plan_with_steps(PlanProtocol::PingPong, vec![("author", vec![]), ("critic", vec![])]);
    harness.repo.save_plan(&harness.ctx, &plan).await.unwrap();

    let outcome = harness.scheduler.execute(&harness.ctx, &plan.id).await.unwrap();

    assert_eq!(outcome.plan.status, PlanStatus::Completed);
    assert!(outcome.artifact.as_deref().unwrap().contains("converged"));
    let rounds: Vec<u32> = outcome.plan.steps.iter().map(|s| s.round).collect();
    assert!(rounds.contains(&1));
    assert!(rounds.contains(&2));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn ping_pong_stops_at_round_cap() {
    let mut config = OverseerConfig::default();
    config.orchestrator.ping_pong_max_rounds = 3;
    let harness = make_harness(config).await;

    let turns = Arc::new(AtomicUsize::new(0));
    let script: Arc<ScriptFn> = {
        let turns = turns.clone();
        Arc::new(move |_start| {
            let turn = turns.fetch_add(1, Ordering::SeqCst);
            vec![complete(&format!("revision {}", turn + 1))]
        })
    };
    let _worker = spawn_worker(&harness, script).await;

    let plan = make_plan_with_steps(PlanProtocol::PingPong, vec![("a", vec![]), ("b", vec![])]);
    harness.repo.save_plan(&harness.ctx, &plan).await.unwrap();

    let outcome = harness.scheduler.execute(&harness.ctx, &plan.id).await.unwrap();

    // Completed with the last non-convergent result after three rounds.
    assert_eq!(outcome.plan.status, PlanStatus::Completed);
    assert_eq!(outcome.artifact.as_deref(), Some("revision 3"));
    assert_eq!(turns.load(Ordering::SeqCst), 3);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn consensus_majority_artifact_wins() {
    let harness = make_harness(OverseerConfig::default()).await;
    let votes = Arc::new(AtomicUsize::new(0));
    let script: Arc<ScriptFn> = {
        let votes = votes.clone();
        Arc::new(move |_start| {
            let vote = votes.fetch_add(1, Ordering::SeqCst);
            let output = if vote == 1 { "Y" } else { "X" };
            vec![complete(output)]
        })
    };
    let _worker = spawn_worker(&harness, script).await;

    let mut plan = make_plan_with_steps(
        PlanProtocol::Consensus,
        vec![("vote", vec![]), ("vote2", vec![]), ("vote3", vec![])],
    );
    // Consensus steps share one task.
    for step in plan.steps.iter_mut() {
        step.task_id = "vote".to_string();
    }
    harness.repo.save_plan(&harness.ctx, &plan).await.unwrap();

    let outcome = harness.scheduler.execute(&harness.ctx, &plan.id).await.unwrap();

    assert_eq!(outcome.plan.status, PlanStatus::Completed);
    assert_eq!(outcome.artifact.as_deref(), Some("X"));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn consensus_below_quorum_fails_plan() {
    let harness = make_harness(OverseerConfig::default()).await;
    let votes = Arc::new(AtomicUsize::new(0));
    let script: Arc<ScriptFn> = {
        let votes = votes.clone();
        Arc::new(move |_start| {
            let vote = votes.fetch_add(1, Ordering::SeqCst);
            if vote == 0 {
                vec![complete("X")]
            } else {
                vec![WorkerAction::Complete {
                    status: WorkerRunStatus::Failed,
                    final_output: None,
                    cost_usd: 0.0,
                }]
            }
        })
    };
    let _worker = spawn_worker(&harness, script).await;

    let mut plan = make_plan_with_steps(
        PlanProtocol::Consensus,
        vec![("vote", vec![]), ("vote2", vec![]), ("vote3", vec![])],
    );
    for step in plan.steps.iter_mut() {
        step.task_id = "vote".to_string();
    }
    plan.continue_on_failure = true;
    harness.repo.save_plan(&harness.ctx, &plan).await.unwrap();

    let outcome = harness.scheduler.execute(&harness.ctx, &plan.id).await.unwrap();
    assert_eq!(outcome.plan.status, PlanStatus::Failed);
    assert!(outcome.artifact.is_none());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn replaying_the_trajectory_matches_the_persisted_run() {
    let harness = make_harness(OverseerConfig::default()).await;
    let script: Arc<ScriptFn> = Arc::new(|_start| {
        vec![
            call("Edit", "patch applied", Some(0.25)),
            call("Read", "source listing", None),
            complete("all done"),
        ]
    });
    let _worker = spawn_worker(&harness, script).await;

    let run_id = harness
        .engine
        .start(&harness.ctx, spec("task-replay", "delegate"))
        .await
        .unwrap();
    let persisted = wait_for_terminal(&harness, &run_id, Duration::from_secs(5)).await;

    let events = harness.engine.events().load_by_run(&run_id).unwrap();
    let replayed = overseer_core::replay_run(&run_id, &events);

    assert_eq!(replayed.status, persisted.status);
    assert_eq!(replayed.step_count, persisted.step_count);
    assert_eq!(replayed.cost_usd, persisted.cost_usd);
    assert_eq!(replayed.tokens_in, persisted.tokens_in);
    assert_eq!(replayed.tokens_out, persisted.tokens_out);
    assert_eq!(replayed.project_id, persisted.project_id);
    assert_eq!(replayed.error, persisted.error);
    assert!(replayed.ended_at.is_some());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn resumed_run_replays_history_and_completes() {
    let harness = make_harness(OverseerConfig::default()).await;
    let script: Arc<ScriptFn> = Arc::new(|start| {
        let suffix = if start.context.get("mode").is_some() {
            "resumed"
        } else {
            "fresh"
        };
        vec![complete(&format!("artifact:{}", suffix))]
    });
    let _worker = spawn_worker(&harness, script).await;

    let run_id = harness
        .engine
        .start(&harness.ctx, spec("task-resume", "delegate"))
        .await
        .unwrap();
    wait_for_terminal(&harness, &run_id, Duration::from_secs(5)).await;

    let events = harness.engine.events();
    let vcs = Arc::new(ShadowVersionControl::new());
    let checkpoints = Arc::new(CheckpointService::new(harness.repo.clone(), vcs));
    let sessions = overseer_core::SessionService::new(harness.repo.clone(), events, checkpoints);

    let handoff = sessions
        .resume(&harness.ctx, &run_id, Some("pick it back up"))
        .await
        .unwrap();
    let mut resume_spec = spec("task-resume", "delegate");
    resume_spec.context = handoff.context.clone();
    resume_spec.session_id = Some(handoff.session.id.clone());

    let new_run_id = harness
        .engine
        .start_run(&harness.ctx, handoff.run, resume_spec)
        .await
        .unwrap();
    assert_ne!(new_run_id, run_id);

    let resumed = wait_for_terminal(&harness, &new_run_id, Duration::from_secs(5)).await;
    assert_eq!(resumed.status, RunStatus::Completed);

    // The worker saw the replay context, not a fresh start.
    let final_output = harness
        .engine
        .events()
        .load_by_run(&new_run_id)
        .unwrap()
        .iter()
        .rev()
        .find_map(|e| {
            e.payload
                .get("final_output")
                .and_then(|v| v.as_str())
                .map(String::from)
        });
    assert_eq!(final_output.as_deref(), Some("artifact:resumed"));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn plan_cancellation_drains_running_steps() {
    let harness = make_harness(OverseerConfig::default()).await;
    let script: Arc<ScriptFn> = Arc::new(|_start| {
        vec![WorkerAction::Sleep(Duration::from_secs(30)), complete("unused")]
    });
    let _worker = spawn_worker(&harness, script).await;

    let plan = make_plan_with_steps(PlanProtocol::Parallel, vec![("t1", vec![]), ("t2", vec![])]);
    harness.repo.save_plan(&harness.ctx, &plan).await.unwrap();

    let scheduler = harness.scheduler.clone();
    let ctx = harness.ctx.clone();
    let plan_id = plan.id.clone();
    let exec = tokio::spawn(async move { scheduler.execute(&ctx, &plan_id).await });

    tokio::time::sleep(Duration::from_millis(200)).await;
    harness.scheduler.cancel(&harness.ctx, &plan.id).await.unwrap();

    let outcome = tokio::time::timeout(Duration::from_secs(8), exec)
        .await
        .expect("scheduler did not drain after cancel")
        .unwrap()
        .unwrap();

    assert_eq!(outcome.plan.status, PlanStatus::Cancelled);
    assert!(outcome
        .plan
        .steps
        .iter()
        .all(|s| s.status.is_terminal()));
}

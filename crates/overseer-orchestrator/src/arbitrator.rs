// Tool-call arbitrator
// Synchronous request/response between worker and policy evaluator; the
// policy decision sits in the worker's critical path.

use serde_json::json;
use tokio_util::sync::CancellationToken;

use overseer_core::{OverseerError, Result};
use overseer_types::{Decision, ToolCall, ToolCallPhase};
use overseer_transport::{DedupWindow, MessageBus};
use overseer_wire::{subject, Envelope, ToolCallRequest, ToolCallResponse, ToolCallResult};

use crate::engine::RunEngine;

/// Consumes `runs.toolcall.request` and `runs.toolcall.result`. One
/// sequential loop: per-run FIFO falls out of per-subject ordering plus
/// in-order processing here.
pub struct Arbitrator {
    engine: RunEngine,
    bus: MessageBus,
}

impl Arbitrator {
    pub fn new(engine: RunEngine) -> Self {
        let bus = engine.bus();
        Self { engine, bus }
    }

    /// Run the arbitration loop until shutdown.
    pub async fn run(self, shutdown: CancellationToken) -> Result<()> {
        let mut requests = self
            .bus
            .subscribe(subject::RUNS_TOOLCALL_REQUEST, "arbitrator")
            .await
            .map_err(|e| OverseerError::Transport(e.to_string()))?;
        let mut results = self
            .bus
            .subscribe(subject::RUNS_TOOLCALL_RESULT, "arbitrator")
            .await
            .map_err(|e| OverseerError::Transport(e.to_string()))?;

        let mut request_dedup = DedupWindow::default();
        let mut result_dedup = DedupWindow::default();

        loop {
            // Results drain ahead of new requests so a result that trips
            // termination is applied before the next call is arbitrated.
            tokio::select! {
                biased;
                _ = shutdown.cancelled() => break,
                maybe = results.recv() => {
                    let Some(envelope) = maybe else { break };
                    self.handle_result(envelope, &mut result_dedup).await;
                }
                maybe = requests.recv() => {
                    let Some(envelope) = maybe else { break };
                    self.handle_request(envelope, &mut request_dedup).await;
                }
            }
        }
        Ok(())
    }

    /// Spawn the loop on the runtime.
    pub fn spawn(self, shutdown: CancellationToken) {
        tokio::spawn(async move {
            if let Err(err) = self.run(shutdown).await {
                tracing::error!(error = %err, "arbitrator loop exited with error");
            }
        });
    }

    async fn handle_request(&self, envelope: Envelope, dedup: &mut DedupWindow) {
        let request: ToolCallRequest = match envelope.decode() {
            Ok(request) => request,
            Err(err) => {
                tracing::warn!(error = %err, "undecodable tool-call request dropped");
                return;
            }
        };
        if dedup.check_and_insert(format!("{}:{}", request.run_id, request.call_id)) {
            return;
        }
        self.engine.touch_heartbeat(&request.run_id).await;

        let call = ToolCall {
            tool: request.tool.clone(),
            command: request.command.clone(),
            path: request.path.clone(),
            args: request.args.clone(),
        };

        // A request against a run the engine no longer owns is answered
        // deny/run_terminated; no events are written for it.
        let Some(profile) = self.engine.active_profile(&request.run_id).await else {
            self.respond(
                &envelope,
                &request,
                Decision::Deny,
                Some("run_terminated".to_string()),
            )
            .await;
            return;
        };

        self.engine
            .record_toolcall_phase(
                &request.run_id,
                ToolCallPhase::Requested,
                json!({
                    "call_id": request.call_id,
                    "tool": request.tool,
                    "command": request.command,
                    "path": request.path,
                    "gate": false,
                }),
            )
            .await;

        let evaluation = profile.evaluate(&call);
        self.engine
            .track_tool_call(&request.run_id, &request.call_id, call)
            .await;

        self.respond(&envelope, &request, evaluation.decision, evaluation.reason.clone())
            .await;

        let phase = match evaluation.decision {
            Decision::Allow => ToolCallPhase::Approved,
            Decision::Deny => ToolCallPhase::Denied,
            Decision::Ask => ToolCallPhase::Ask,
        };
        self.engine
            .record_toolcall_phase(
                &request.run_id,
                phase,
                json!({
                    "call_id": request.call_id,
                    "tool": request.tool,
                    "rule_index": evaluation.rule_index,
                    "gate": false,
                }),
            )
            .await;
    }

    async fn respond(
        &self,
        request_envelope: &Envelope,
        request: &ToolCallRequest,
        decision: Decision,
        reason: Option<String>,
    ) {
        let response = ToolCallResponse {
            run_id: request.run_id.clone(),
            call_id: request.call_id.clone(),
            decision,
            reason,
        };
        let envelope = match request_envelope.reply(subject::RUNS_TOOLCALL_RESPONSE, &response) {
            Ok(envelope) => envelope,
            Err(err) => {
                tracing::error!(error = %err, "failed to build tool-call response");
                return;
            }
        };
        if let Err(err) = self.bus.publish(envelope).await {
            tracing::error!(
                run_id = request.run_id.as_str(),
                call_id = request.call_id.as_str(),
                error = %err,
                "failed to publish tool-call response"
            );
        }
    }

    async fn handle_result(&self, envelope: Envelope, dedup: &mut DedupWindow) {
        let result: ToolCallResult = match envelope.decode() {
            Ok(result) => result,
            Err(err) => {
                tracing::warn!(error = %err, "undecodable tool-call result dropped");
                return;
            }
        };
        if dedup.check_and_insert(format!("result:{}:{}", result.run_id, result.call_id)) {
            return;
        }
        if let Err(err) = self.engine.ingest_tool_result(result).await {
            tracing::error!(error = %err, "failed to ingest tool result");
        }
    }
}

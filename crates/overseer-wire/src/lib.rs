// Wire-format models for the control plane <-> worker protocol.
//
// Every message is a JSON envelope on a named subject. The `X-Request-ID`
// header is propagated end-to-end; consumers deduplicate by
// `(run_id, call_id)` for tool calls and `(run_id, version)` for events.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use serde_json::Value;

use overseer_types::Decision;

/// Header carrying the end-to-end correlation id
pub const HEADER_REQUEST_ID: &str = "X-Request-ID";

// ============================================================================
// Subjects
// ============================================================================

pub mod subject {
    /// CP -> worker: begin executing a run
    pub const RUNS_START: &str = "runs.start";
    /// CP -> worker: stop a run
    pub const RUNS_CANCEL: &str = "runs.cancel";
    /// worker -> CP: request permission for a tool call
    pub const RUNS_TOOLCALL_REQUEST: &str = "runs.toolcall.request";
    /// CP -> worker: arbitration decision
    pub const RUNS_TOOLCALL_RESPONSE: &str = "runs.toolcall.response";
    /// worker -> CP: outcome of an executed tool call
    pub const RUNS_TOOLCALL_RESULT: &str = "runs.toolcall.result";
    /// worker -> CP: stdout/stderr line
    pub const RUNS_OUTPUT: &str = "runs.output";
    /// worker -> CP: terminal completion report
    pub const RUNS_COMPLETE: &str = "runs.complete";
    /// CP -> worker: run a quality-gate command
    pub const RUNS_GATE_REQUEST: &str = "runs.gate.request";
    /// worker -> CP: quality-gate command outcome
    pub const RUNS_GATE_RESULT: &str = "runs.gate.result";
}

// ============================================================================
// Envelope
// ============================================================================

/// A subject-routed message with headers and a JSON payload
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Envelope {
    pub id: String,
    pub subject: String,
    #[serde(default)]
    pub headers: HashMap<String, String>,
    pub payload: Value,
    pub published_at: DateTime<Utc>,
}

impl Envelope {
    pub fn new<T: Serialize>(subject: &str, payload: &T) -> serde_json::Result<Self> {
        Ok(Self {
            id: uuid::Uuid::new_v4().to_string(),
            subject: subject.to_string(),
            headers: HashMap::new(),
            payload: serde_json::to_value(payload)?,
            published_at: Utc::now(),
        })
    }

    pub fn with_request_id(mut self, request_id: impl Into<String>) -> Self {
        self.headers
            .insert(HEADER_REQUEST_ID.to_string(), request_id.into());
        self
    }

    pub fn request_id(&self) -> Option<&str> {
        self.headers.get(HEADER_REQUEST_ID).map(String::as_str)
    }

    /// Build a reply on another subject, carrying the request id forward.
    pub fn reply<T: Serialize>(&self, subject: &str, payload: &T) -> serde_json::Result<Self> {
        let mut reply = Envelope::new(subject, payload)?;
        if let Some(request_id) = self.request_id() {
            reply = reply.with_request_id(request_id.to_string());
        }
        Ok(reply)
    }

    pub fn decode<T: DeserializeOwned>(&self) -> serde_json::Result<T> {
        serde_json::from_value(self.payload.clone())
    }
}

// ============================================================================
// Payloads
// ============================================================================

/// `runs.start`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StartPayload {
    pub run_id: String,
    pub task_id: String,
    pub agent_id: String,
    pub prompt: String,
    pub profile_name: String,
    /// Replay context, resume summary, or other worker bootstrap state
    #[serde(default)]
    pub context: Value,
}

/// `runs.cancel`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CancelPayload {
    pub run_id: String,
    pub reason: String,
}

/// `runs.toolcall.request`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolCallRequest {
    pub run_id: String,
    pub call_id: String,
    pub tool: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub command: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub args: Option<Value>,
}

/// `runs.toolcall.response`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolCallResponse {
    pub run_id: String,
    pub call_id: String,
    pub decision: Decision,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

/// `runs.toolcall.result`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolCallResult {
    pub run_id: String,
    pub call_id: String,
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cost_usd: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration_ms: Option<u64>,
}

/// `runs.output`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OutputPayload {
    pub run_id: String,
    pub stream: OutputStream,
    pub line: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OutputStream {
    Stdout,
    Stderr,
}

/// `runs.complete`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompletePayload {
    pub run_id: String,
    pub status: WorkerRunStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub final_output: Option<String>,
    pub tokens_in: u64,
    pub tokens_out: u64,
    pub cost_usd: f64,
}

/// Terminal status as reported by the worker
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkerRunStatus {
    Completed,
    Failed,
    Cancelled,
}

/// `runs.gate.request`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GateRequest {
    pub run_id: String,
    pub gate_id: String,
    pub kind: GateKind,
    pub command: String,
    pub timeout_ms: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GateKind {
    Test,
    Lint,
}

/// `runs.gate.result`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GateResult {
    pub run_id: String,
    pub gate_id: String,
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output: Option<String>,
}

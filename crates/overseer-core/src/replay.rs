// Trajectory replay: rebuild a run snapshot from its event log.
//
// State-changing events carry cumulative counters in their payloads, so a
// fold over the log reproduces the persisted run's observable fields.

use chrono::{DateTime, Utc};
use serde_json::Value;

use overseer_types::{event::kind, Event, FailureReason, Run, RunError, RunStatus};

fn get_str(payload: &Value, key: &str) -> Option<String> {
    payload.get(key).and_then(|v| v.as_str()).map(String::from)
}

fn get_u64(payload: &Value, key: &str) -> Option<u64> {
    payload.get(key).and_then(|v| v.as_u64())
}

fn get_f64(payload: &Value, key: &str) -> Option<f64> {
    payload.get(key).and_then(|v| v.as_f64())
}

fn get_time(payload: &Value, key: &str) -> Option<DateTime<Utc>> {
    get_str(payload, key).and_then(|raw| raw.parse().ok())
}

fn apply_counters(run: &mut Run, payload: &Value) {
    if let Some(step_count) = get_u64(payload, "step_count") {
        run.step_count = run.step_count.max(step_count);
    }
    if let Some(cost) = get_f64(payload, "cost_usd") {
        if cost > run.cost_usd {
            run.cost_usd = cost;
        }
    }
    if let Some(tokens_in) = get_u64(payload, "tokens_in") {
        run.tokens_in = run.tokens_in.max(tokens_in);
    }
    if let Some(tokens_out) = get_u64(payload, "tokens_out") {
        run.tokens_out = run.tokens_out.max(tokens_out);
    }
}

fn failure_reason(payload: &Value) -> FailureReason {
    get_str(payload, "reason")
        .and_then(|raw| serde_json::from_value(Value::String(raw)).ok())
        .unwrap_or(FailureReason::Fatal)
}

/// Fold a run's events, in order, into a run snapshot. Events must be the
/// complete trajectory; versions are assumed dense and ascending.
pub fn replay_run(run_id: &str, events: &[Event]) -> Run {
    let mut run = Run::new("", "", "");
    run.id = run_id.to_string();

    if let Some(first) = events.first() {
        run.created_at = first.created_at;
        run.updated_at = first.created_at;
        run.task_id = first.task_id.clone();
    }

    for event in events {
        run.updated_at = event.created_at;
        match event.event_type.as_str() {
            kind::RUN_STARTED => {
                run.status = RunStatus::Running;
                run.task_id = event.task_id.clone();
                run.project_id = get_str(&event.payload, "project_id").unwrap_or_default();
                run.tenant_id = get_str(&event.payload, "tenant_id").unwrap_or_default();
                run.step_id = get_str(&event.payload, "step_id");
                run.session_id = get_str(&event.payload, "session_id");
                run.model = get_str(&event.payload, "model");
                run.started_at = get_time(&event.payload, "started_at").or(Some(event.created_at));
            }
            kind::RUN_TOOLCALL => {
                apply_counters(&mut run, &event.payload);
            }
            kind::RUN_COMPLETED => {
                apply_counters(&mut run, &event.payload);
                run.status = RunStatus::Completed;
                run.ended_at = get_time(&event.payload, "ended_at").or(Some(event.created_at));
            }
            kind::RUN_FAILED => {
                apply_counters(&mut run, &event.payload);
                run.status = RunStatus::Failed;
                run.ended_at = get_time(&event.payload, "ended_at").or(Some(event.created_at));
                run.error = Some(RunError::new(
                    failure_reason(&event.payload),
                    get_str(&event.payload, "detail").unwrap_or_default(),
                ));
            }
            kind::RUN_TIMEOUT => {
                apply_counters(&mut run, &event.payload);
                run.status = RunStatus::Timeout;
                run.ended_at = get_time(&event.payload, "ended_at").or(Some(event.created_at));
                run.error = Some(RunError::new(
                    FailureReason::Timeout,
                    get_str(&event.payload, "detail").unwrap_or_default(),
                ));
            }
            kind::RUN_CANCELLED => {
                apply_counters(&mut run, &event.payload);
                run.status = RunStatus::Cancelled;
                run.ended_at = get_time(&event.payload, "ended_at").or(Some(event.created_at));
                run.error = Some(RunError::new(
                    failure_reason(&event.payload),
                    get_str(&event.payload, "detail").unwrap_or_default(),
                ));
            }
            _ => {}
        }
    }

    run
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn event(run_id: &str, event_type: &str, payload: Value) -> Event {
        Event::new(run_id, "task-1", "agent-1", event_type, payload)
    }

    #[test]
    fn replays_a_completed_run() {
        let started_at = Utc::now();
        let events = vec![
            event(
                "run_1",
                kind::RUN_STARTED,
                json!({
                    "project_id": "proj-1",
                    "tenant_id": "tenant-1",
                    "started_at": started_at.to_rfc3339(),
                }),
            ),
            event(
                "run_1",
                kind::RUN_TOOLCALL,
                json!({ "phase": "result", "step_count": 1, "cost_usd": 0.25 }),
            ),
            event(
                "run_1",
                kind::RUN_COMPLETED,
                json!({
                    "step_count": 2,
                    "cost_usd": 0.4,
                    "tokens_in": 100,
                    "tokens_out": 40,
                }),
            ),
        ];

        let run = replay_run("run_1", &events);
        assert_eq!(run.status, RunStatus::Completed);
        assert_eq!(run.step_count, 2);
        assert_eq!(run.cost_usd, 0.4);
        assert_eq!(run.tokens_in, 100);
        assert!(run.started_at.is_some());
        assert!(run.ended_at.is_some());
    }

    #[test]
    fn replays_a_failed_run_with_reason() {
        let events = vec![
            event("run_1", kind::RUN_STARTED, json!({ "project_id": "p" })),
            event(
                "run_1",
                kind::RUN_FAILED,
                json!({ "reason": "stall", "detail": "5 non-progress steps" }),
            ),
        ];

        let run = replay_run("run_1", &events);
        assert_eq!(run.status, RunStatus::Failed);
        let error = run.error.unwrap();
        assert_eq!(error.reason, FailureReason::Stall);
        assert_eq!(error.detail, "5 non-progress steps");
    }

    #[test]
    fn counters_never_regress_during_replay() {
        let events = vec![
            event("run_1", kind::RUN_STARTED, json!({})),
            event(
                "run_1",
                kind::RUN_TOOLCALL,
                json!({ "phase": "result", "step_count": 3, "cost_usd": 0.9 }),
            ),
            event(
                "run_1",
                kind::RUN_TOOLCALL,
                json!({ "phase": "requested" }),
            ),
        ];

        let run = replay_run("run_1", &events);
        assert_eq!(run.step_count, 3);
        assert_eq!(run.cost_usd, 0.9);
        assert_eq!(run.status, RunStatus::Running);
    }
}

// Plan decomposer
// Turns a feature objective into a step DAG via the language-model gateway.
// The only LLM call site in the control plane.

use std::sync::Arc;

use serde::Deserialize;

use overseer_core::{ChatMessage, LLMGateway, OverseerError, Result};
use overseer_types::{DeliverMode, Plan, PlanProtocol, RequestContext, Step};

use crate::scheduler::validate_plan;

const DECOMPOSER_MAX_TOKENS: u32 = 4096;
const MAX_TASKS: usize = 12;

const SYSTEM_PROMPT: &str = "You are a planning agent for a coding orchestrator. \
Decompose the user's objective into a small list of independent or dependent tasks. \
Respond with a JSON array only: \
[{\"id\": \"t1\", \"title\": \"...\", \"description\": \"...\", \"depends_on\": []}]";

/// One task row as emitted by the model
#[derive(Debug, Clone, Deserialize)]
struct ParsedTask {
    id: String,
    #[allow(dead_code)]
    title: String,
    #[serde(default)]
    #[allow(dead_code)]
    description: String,
    #[serde(default)]
    depends_on: Vec<String>,
}

/// Bindings applied uniformly to decomposed steps.
#[derive(Debug, Clone)]
pub struct DecomposeBindings {
    pub agent_id: String,
    pub policy_profile: String,
    pub deliver_mode: DeliverMode,
}

pub struct PlanDecomposer {
    llm: Arc<dyn LLMGateway>,
    model: String,
}

impl PlanDecomposer {
    pub fn new(llm: Arc<dyn LLMGateway>, model: impl Into<String>) -> Self {
        Self {
            llm,
            model: model.into(),
        }
    }

    /// Decompose an objective into a validated plan. The returned plan is
    /// pending; the caller persists and schedules it.
    pub async fn decompose(
        &self,
        ctx: &RequestContext,
        project_id: &str,
        objective: &str,
        protocol: PlanProtocol,
        bindings: &DecomposeBindings,
    ) -> Result<Plan> {
        let messages = [
            ChatMessage::system(SYSTEM_PROMPT),
            ChatMessage::user(format!(
                "Objective: {}\n\nProduce at most {} tasks.",
                objective, MAX_TASKS
            )),
        ];

        let completion = self
            .llm
            .chat_completion(ctx, &messages, &self.model, DECOMPOSER_MAX_TOKENS, None)
            .await?;
        tracing::debug!(
            tokens_in = completion.tokens_in,
            tokens_out = completion.tokens_out,
            "decomposer completion received"
        );

        let tasks = parse_task_list(&completion.content).ok_or_else(|| {
            OverseerError::Validation("Planner output contained no task list".to_string())
        })?;
        if tasks.is_empty() {
            return Err(OverseerError::Validation(
                "Planner produced an empty task list".to_string(),
            ));
        }

        let mut plan = Plan::new(ctx.tenant_id.clone(), project_id, protocol);
        let mut steps = Vec::with_capacity(tasks.len());
        for task in tasks.into_iter().take(MAX_TASKS) {
            let mut step = Step::new(
                plan.id.clone(),
                task.id.clone(),
                bindings.agent_id.clone(),
                bindings.policy_profile.clone(),
            );
            step.id = task.id.clone();
            step.deliver_mode = bindings.deliver_mode;
            step.depends_on = task.depends_on;
            steps.push(step);
        }
        plan.steps = steps;

        validate_plan(&plan)?;
        Ok(plan)
    }
}

/// Extract the first JSON array from a model response, tolerating code
/// fences and prose around it.
fn parse_task_list(response: &str) -> Option<Vec<ParsedTask>> {
    let start = response.find('[')?;
    let mut depth = 0usize;
    let mut end = None;
    for (offset, ch) in response[start..].char_indices() {
        match ch {
            '[' => depth += 1,
            ']' => {
                depth = depth.saturating_sub(1);
                if depth == 0 {
                    end = Some(start + offset + 1);
                    break;
                }
            }
            _ => {}
        }
    }
    let raw = &response[start..end?];
    serde_json::from_str(raw).ok()
}

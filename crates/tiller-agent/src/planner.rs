//! Advisory pre-planning and mid-turn replanning.
//!
//! Planning is strictly best-effort: a provider failure or an unparsable
//! reply yields "no plan" and the turn proceeds unconstrained. The one error
//! that does propagate is an abort, which must never be swallowed.

use serde::Deserialize;
use tiller_core::{
    CancelToken, ChatMessage, ChatRequest, LlmConfig, Plan, Result, ToolChoice, is_abort_error,
};
use tiller_llm::Provider;

use crate::action;

pub const DEFAULT_TOOL_BUDGET: u32 = 4;

const PLANNING_SYSTEM_PROMPT: &str = "You plan work for a coding agent. Respond with a single JSON object and nothing else: {\"summary\": string, \"steps\": [string], \"toolBudget\": integer}. Use at most 8 steps. toolBudget is the number of tool calls the work should need, between 1 and 12.";

#[derive(Debug, Deserialize)]
struct PlanShape {
    #[serde(default)]
    summary: String,
    #[serde(default)]
    steps: Vec<String>,
    #[serde(default, alias = "toolBudget")]
    tool_budget: Option<u32>,
}

/// One-shot planning call at turn start. `Ok(None)` on any failure that is
/// not an abort.
pub fn plan_turn(
    provider: &dyn Provider,
    llm: &LlmConfig,
    user_message: &str,
    cancel: &CancelToken,
) -> Result<Option<Plan>> {
    let prompt = format!("Plan this request:\n{user_message}");
    request_plan(provider, llm, &prompt, user_message, cancel)
}

/// Revision call once the active plan's tool budget is spent. The adopted
/// budget is `max(parsed, previous + 1)` so a replan can only ever grow the
/// budget; a shrinking replan would just re-trigger itself.
pub fn replan_turn(
    provider: &dyn Provider,
    llm: &LlmConfig,
    user_message: &str,
    previous: &Plan,
    tools_used: &[String],
    cancel: &CancelToken,
) -> Result<Option<Plan>> {
    let prompt = format!(
        "The plan's tool budget is spent and the task is not finished.\n\n\
         Original request:\n{user_message}\n\n\
         Prior plan: {}\nPrior steps:\n{}\n\n\
         Tool calls already made: {}.\n\n\
         Revise the remaining steps and give a realistic toolBudget for what is left.",
        previous.summary,
        numbered(&previous.steps),
        if tools_used.is_empty() {
            "none".to_string()
        } else {
            tools_used.join(", ")
        },
    );
    let revised = request_plan(provider, llm, &prompt, user_message, cancel)?;
    Ok(revised.map(|plan| {
        let tool_budget = plan.tool_budget.max(previous.tool_budget + 1);
        Plan {
            tool_budget,
            ..plan
        }
    }))
}

fn request_plan(
    provider: &dyn Provider,
    llm: &LlmConfig,
    prompt: &str,
    fallback_summary: &str,
    cancel: &CancelToken,
) -> Result<Option<Plan>> {
    let request = ChatRequest {
        model: llm.model.clone(),
        messages: vec![
            ChatMessage::System {
                content: PLANNING_SYSTEM_PROMPT.to_string(),
            },
            ChatMessage::User {
                content: prompt.to_string(),
            },
        ],
        tools: Vec::new(),
        tool_choice: ToolChoice::none(),
        max_tokens: llm.max_tokens,
        temperature: llm.temperature,
    };
    let response = match provider.complete(&request, cancel) {
        Ok(response) => response,
        Err(err) if is_abort_error(&err) => return Err(err),
        Err(_) => return Ok(None),
    };
    cancel.check()?;
    Ok(parse_plan(&response.text, fallback_summary))
}

fn parse_plan(text: &str, fallback_summary: &str) -> Option<Plan> {
    let value = action::extract_json_value(text)?;
    let shape: PlanShape = serde_json::from_value(value).ok()?;
    let steps: Vec<String> = shape
        .steps
        .into_iter()
        .map(|step| step.trim().to_string())
        .filter(|step| !step.is_empty())
        .collect();
    if steps.is_empty() {
        return None;
    }
    let summary = shape.summary.trim().to_string();
    let summary = if summary.is_empty() {
        crate::truncate_chars(fallback_summary, 80)
    } else {
        summary
    };
    Some(
        Plan {
            summary,
            steps,
            tool_budget: shape.tool_budget.unwrap_or(DEFAULT_TOOL_BUDGET),
        }
        .clamped(),
    )
}

fn numbered(steps: &[String]) -> String {
    steps
        .iter()
        .enumerate()
        .map(|(idx, step)| format!("{}. {step}", idx + 1))
        .collect::<Vec<_>>()
        .join("\n")
}

//! System prompt assembly. The prompt is layered: base persona, action
//! protocol (legacy mode only), environment, project instructions, active
//! plan, and any turn policy note.

use std::path::Path;

use tiller_core::{Plan, ToolDefinition};

use crate::policy::TurnPolicy;

pub const BASE_SYSTEM_PROMPT: &str = r#"You are Tiller, a coding assistant that works inside the user's repository.

Rules:
- Prefer reading files and running commands over guessing. Cite real paths.
- Keep every shell command non-interactive. Never start editors, pagers, or watch modes.
- Make the smallest change that solves the problem. Do not reformat code you are not changing.
- When the task is done, reply with a short final answer. Do not pad it with restated plans.
- If you are blocked on missing information only the user has, ask instead of inventing it."#;

pub const LEGACY_ACTION_PROTOCOL: &str = r#"Respond with exactly one JSON object per reply, nothing else. The accepted shapes are:

{"type": "tool_use", "tool": "<tool name>", "input": {...}, "reason": "<one line>"}
{"type": "thought", "content": "<your reasoning so far>"}
{"type": "final", "message": "<your answer to the user>"}

Use "tool_use" to act, "thought" to note intermediate reasoning, and "final" when you are done. The tool result arrives in the next user message."#;

/// Everything the prompt builder needs about the current turn.
pub struct PromptContext<'a> {
    pub workspace: &'a Path,
    pub auto_approve: bool,
    pub native_tools: bool,
    pub tools: &'a [ToolDefinition],
    pub plan: Option<&'a Plan>,
    pub policy: Option<&'a TurnPolicy>,
    pub project_instructions: Option<&'a str>,
    pub mcp_servers: &'a [String],
}

pub fn build_system_prompt(ctx: &PromptContext<'_>) -> String {
    let mut parts = vec![BASE_SYSTEM_PROMPT.to_string()];

    if !ctx.native_tools {
        parts.push(LEGACY_ACTION_PROTOCOL.to_string());
        parts.push(format_tool_catalog(ctx.tools));
    }

    parts.push(format_environment_section(ctx.workspace, ctx.auto_approve));

    if let Some(instructions) = ctx.project_instructions {
        let trimmed = instructions.trim();
        if !trimmed.is_empty() {
            parts.push(format!("## Project instructions (TILLER.md)\n{trimmed}"));
        }
    }

    if let Some(plan) = ctx.plan {
        parts.push(format_plan_section(plan));
    }

    if let Some(policy) = ctx.policy {
        parts.push(format_policy_section(policy));
    }

    if !ctx.mcp_servers.is_empty() {
        parts.push(format!(
            "## Connected MCP servers\n{}\nUse mcp_list_tools to discover what they offer before calling mcp_call_tool.",
            ctx.mcp_servers
                .iter()
                .map(|name| format!("- {name}"))
                .collect::<Vec<_>>()
                .join("\n")
        ));
    }

    parts.join("\n\n")
}

fn format_tool_catalog(tools: &[ToolDefinition]) -> String {
    let mut lines = vec!["## Available tools".to_string()];
    for def in tools {
        lines.push(format!(
            "- {}: {}",
            def.function.name, def.function.description
        ));
    }
    lines.join("\n")
}

fn format_environment_section(workspace: &Path, auto_approve: bool) -> String {
    let approvals = if auto_approve {
        "tool calls run without asking"
    } else {
        "mutating tool calls need the user's approval"
    };
    format!(
        "## Environment\nWorkspace: {}\nApprovals: {}\nShell commands run from the workspace root unless the input says otherwise.",
        workspace.display(),
        approvals
    )
}

fn format_plan_section(plan: &Plan) -> String {
    let mut lines = vec!["## Active plan".to_string(), plan.summary.clone()];
    for (idx, step) in plan.steps.iter().enumerate() {
        lines.push(format!("{}. {}", idx + 1, step));
    }
    lines.push(format!(
        "Tool budget for this turn: {} call(s).",
        plan.tool_budget
    ));
    lines.join("\n")
}

fn format_policy_section(policy: &TurnPolicy) -> String {
    let mut lines = vec!["## This turn".to_string(), policy.note.to_string()];
    if let Some(allowed) = policy.allowed_tools {
        lines.push(format!("Only these tools are available: {}.", allowed.join(", ")));
    }
    if let Some(max) = policy.max_tool_calls {
        lines.push(format!("Use at most {max} tool call(s)."));
    }
    if policy.require_commit_message {
        lines.push("End with the commit message itself, ready to paste.".to_string());
    }
    lines.join("\n")
}

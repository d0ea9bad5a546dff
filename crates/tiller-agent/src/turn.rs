//! The turn loop: an explicit state machine that runs one user request to a
//! final assistant message.
//!
//! Every terminal state appends exactly one final assistant message to the
//! history before the outcome is returned. The single exception is an abort:
//! a fired cancel token propagates as an error and appends nothing, so a
//! cancelled turn leaves no partial tail behind the cancellation point.

use std::collections::VecDeque;
use std::path::Path;
use std::time::Instant;

use serde_json::Value;
use tiller_core::{
    AgentConfig, ApprovedToolCall, CancelToken, ChatMessage, ChatRequest, EventKind, LlmConfig,
    LlmResponse, Message, Plan, Result, StreamCallback, StreamChunk, TokenUsage, ToolCall,
    ToolChoice, ToolDefinition, ToolHost, ToolName,
};
use tiller_llm::Provider;
use uuid::Uuid;

use crate::action::{self, Action, ToolUse};
use crate::compact;
use crate::guard::{self, GuardVerdict, LoopGuard};
use crate::planner;
use crate::policy::{self, TurnPolicy};
use crate::prompts::{self, PromptContext};
use crate::{ApprovalCallback, ApprovalRequest, EventCallback, truncate_chars};

/// Auto-compaction kicks in once the history holds this many times the
/// preserved-recent window.
const COMPACT_TRIGGER_FACTOR: usize = 3;

/// Bounded attempts to coax a final answer out of the model once a policy's
/// tool budget is spent.
const MAX_SYNTHESIS_ATTEMPTS: u32 = 2;

const DENIED_RESULT: &str =
    "Tool call not approved by the user. Try a different approach or ask for guidance.";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FinishReason {
    /// The model produced a final answer.
    Final,
    /// The loop guard stopped a repeating call pattern.
    LoopDetected,
    /// The model asked for a tool that does not exist.
    UnknownTool,
    /// The model broke a turn policy constraint.
    PolicyViolation,
    /// The user declined to continue at an iteration checkpoint.
    CheckpointDeclined,
    /// The hard iteration limit was reached.
    IterationCap,
    /// A spent tool budget could not be synthesized into a model answer.
    ToolBudget,
    /// The todo list stopped changing.
    TodoStall,
}

impl FinishReason {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Final => "final",
            Self::LoopDetected => "loop_detected",
            Self::UnknownTool => "unknown_tool",
            Self::PolicyViolation => "policy_violation",
            Self::CheckpointDeclined => "checkpoint_declined",
            Self::IterationCap => "iteration_cap",
            Self::ToolBudget => "tool_budget",
            Self::TodoStall => "todo_stall",
        }
    }
}

#[derive(Debug, Clone)]
pub struct TurnOutcome {
    pub final_text: String,
    pub finish_reason: FinishReason,
    /// Model calls made during this turn, planning and summarization
    /// included.
    pub iterations: u64,
    pub tool_calls: u64,
    pub usage: TokenUsage,
}

/// Borrowed view of everything a turn needs from the agent.
pub(crate) struct TurnContext<'a> {
    pub provider: &'a dyn Provider,
    pub host: &'a (dyn ToolHost + Send + Sync),
    pub llm: &'a LlmConfig,
    pub agent: &'a AgentConfig,
    pub tools: &'a [ToolDefinition],
    pub workspace: &'a Path,
    pub auto_approve: bool,
    pub project_instructions: Option<&'a str>,
    pub mcp_servers: &'a [String],
    pub approval_cb: Option<&'a ApprovalCallback>,
    pub event_cb: Option<&'a EventCallback>,
    pub stream_cb: Option<&'a StreamCallback>,
    pub cancel: &'a CancelToken,
}

enum TurnState {
    Start,
    /// Ask the model what to do next, or drain a buffered batch call first.
    RequestModel,
    Dispatch(Action),
    /// Request the final answer with tools withheld (policy force-finalize).
    ForceFinalize,
    /// Tool budget spent without a force-finalize policy: push the model to
    /// answer from evidence, with a deterministic fallback.
    Synthesize,
    Finished { text: String, reason: FinishReason },
}

pub(crate) struct TurnRunner<'a> {
    ctx: TurnContext<'a>,
    history: &'a mut Vec<Message>,
    user_message: String,
    policy: Option<TurnPolicy>,
    plan: Option<Plan>,
    replanned: bool,
    guard: LoopGuard,
    /// Remaining calls of a multi-call batch, dispatched before the next
    /// model request.
    pending: VecDeque<ToolUse>,
    iterations: u64,
    tool_calls_made: u64,
    tools_used: Vec<String>,
    /// (tool, result) pairs from successful calls, for synthesis fallback.
    evidence: Vec<(String, String)>,
    synthesis_attempts: u32,
    last_checkpoint: u64,
    usage: TokenUsage,
}

impl<'a> TurnRunner<'a> {
    pub(crate) fn new(ctx: TurnContext<'a>, history: &'a mut Vec<Message>) -> Self {
        Self {
            ctx,
            history,
            user_message: String::new(),
            policy: None,
            plan: None,
            replanned: false,
            guard: LoopGuard::new(),
            pending: VecDeque::new(),
            iterations: 0,
            tool_calls_made: 0,
            tools_used: Vec::new(),
            evidence: Vec::new(),
            synthesis_attempts: 0,
            last_checkpoint: 0,
            usage: TokenUsage::default(),
        }
    }

    pub(crate) fn run(mut self, user_message: &str) -> Result<TurnOutcome> {
        let mut state = TurnState::Start;
        loop {
            self.ctx.cancel.check()?;
            state = match state {
                TurnState::Start => self.enter(user_message)?,
                TurnState::RequestModel => self.request_model()?,
                TurnState::Dispatch(action) => self.dispatch(action)?,
                TurnState::ForceFinalize => self.force_finalize()?,
                TurnState::Synthesize => self.synthesize()?,
                TurnState::Finished { text, reason } => return Ok(self.finish(text, reason)),
            };
        }
    }

    fn enter(&mut self, user_message: &str) -> Result<TurnState> {
        self.user_message = user_message.to_string();
        self.history.push(Message::user(user_message));
        self.policy = policy::detect(user_message);
        self.emit(EventKind::TurnStartedV1 {
            prompt: user_message.to_string(),
        });
        // A matched policy already constrains the turn; planning on top of
        // it would just fight the policy's budget.
        if self.ctx.agent.pre_plan && self.policy.is_none() {
            let plan =
                planner::plan_turn(self.ctx.provider, self.ctx.llm, user_message, self.ctx.cancel)?;
            self.iterations += 1;
            if let Some(plan) = plan {
                self.emit(EventKind::PlanCreatedV1 { plan: plan.clone() });
                self.plan = Some(plan);
            }
        }
        Ok(TurnState::RequestModel)
    }

    fn request_model(&mut self) -> Result<TurnState> {
        if let Some(tool_use) = self.pending.pop_front() {
            return Ok(TurnState::Dispatch(Action::ToolUse(tool_use)));
        }
        if self.iterations >= self.ctx.agent.max_iterations {
            return Ok(TurnState::Finished {
                text: format!(
                    "I hit the iteration limit ({}) before finishing. I made {} tool call(s) so \
                     far. Narrow the task or raise the limit to let me continue.",
                    self.ctx.agent.max_iterations, self.tool_calls_made
                ),
                reason: FinishReason::IterationCap,
            });
        }
        if self.checkpoint_due() {
            self.last_checkpoint = self.iterations;
            let proceed = match self.ctx.approval_cb {
                Some(cb) => {
                    let verdict = cb(ApprovalRequest::Checkpoint {
                        iterations: self.iterations,
                    })?;
                    self.ctx.cancel.check()?;
                    verdict
                }
                // Without anyone to ask, a checkpoint is a no-op.
                None => true,
            };
            if !proceed {
                return Ok(TurnState::Finished {
                    text: format!(
                        "Stopping at your request after {} iterations.",
                        self.iterations
                    ),
                    reason: FinishReason::CheckpointDeclined,
                });
            }
        }
        if self.history.len() >= self.ctx.agent.preserve_recent * COMPACT_TRIGGER_FACTOR {
            let report = compact::compact_history(
                self.ctx.provider,
                self.ctx.llm,
                self.history,
                self.ctx.agent.preserve_recent,
                self.ctx.cancel,
            )?;
            if report.compacted {
                self.iterations += 1;
                self.emit(EventKind::CompactionV1 {
                    before: report.before,
                    after: report.after,
                });
            }
        }
        let request = self.build_request(ToolChoice::auto(), true);
        let response = self.call_provider(&request)?;
        Ok(TurnState::Dispatch(self.parse_response(&response)))
    }

    fn parse_response(&self, response: &LlmResponse) -> Action {
        if self.ctx.agent.native_tools {
            action::parse_native_response(response)
        } else {
            action::parse_model_action(&response.text)
        }
    }

    fn call_provider(&mut self, request: &ChatRequest) -> Result<LlmResponse> {
        self.iterations += 1;
        let response = match self.ctx.stream_cb {
            Some(cb) => self
                .ctx
                .provider
                .complete_streaming(request, self.ctx.cancel, cb.clone())?,
            None => self.ctx.provider.complete(request, self.ctx.cancel)?,
        };
        self.ctx.cancel.check()?;
        if response.usage.total() > 0 {
            self.usage.add(&response.usage);
            self.emit(EventKind::UsageUpdatedV1 { usage: self.usage });
        }
        Ok(response)
    }

    fn dispatch(&mut self, action: Action) -> Result<TurnState> {
        match action {
            Action::Final { message } => Ok(TurnState::Finished {
                text: message,
                reason: FinishReason::Final,
            }),
            Action::Thought { content } => {
                self.emit(EventKind::ThoughtV1 {
                    content: content.clone(),
                });
                self.history.push(Message::assistant(content));
                Ok(TurnState::RequestModel)
            }
            Action::ToolUses { mut calls } => {
                if calls.is_empty() {
                    return self.handle_unknown();
                }
                let first = calls.remove(0);
                self.pending.extend(calls);
                self.dispatch_tool_use(first)
            }
            Action::ToolUse(tool_use) => self.dispatch_tool_use(tool_use),
            Action::Unknown => self.handle_unknown(),
        }
    }

    fn handle_unknown(&mut self) -> Result<TurnState> {
        self.history.push(Message::user(
            "That reply was not a recognized action. Use a tool, or answer the user directly.",
        ));
        Ok(TurnState::RequestModel)
    }

    fn dispatch_tool_use(&mut self, tool_use: ToolUse) -> Result<TurnState> {
        if !self
            .ctx
            .tools
            .iter()
            .any(|def| def.function.name == tool_use.tool)
        {
            let available = self
                .ctx
                .tools
                .iter()
                .map(|def| def.function.name.as_str())
                .collect::<Vec<_>>()
                .join(", ");
            return Ok(TurnState::Finished {
                text: format!(
                    "Unknown tool: {}. Available tools: {available}.",
                    tool_use.tool
                ),
                reason: FinishReason::UnknownTool,
            });
        }

        if let Some(policy) = &self.policy {
            if policy.disable_todos
                && ToolName::from_api_name(&tool_use.tool).is_some_and(|name| name.is_todo())
            {
                return Ok(TurnState::Finished {
                    text: format!(
                        "The todo list is off for this request ({}), so I am answering directly \
                         instead of planning further.",
                        policy.name
                    ),
                    reason: FinishReason::PolicyViolation,
                });
            }
            if let Some(allowed) = policy.allowed_tools
                && !allowed.contains(&tool_use.tool.as_str())
            {
                return Ok(TurnState::Finished {
                    text: format!(
                        "This request only allows these tools: {}. The model asked for {} \
                         instead, so I stopped here.",
                        allowed.join(", "),
                        tool_use.tool
                    ),
                    reason: FinishReason::PolicyViolation,
                });
            }
            if let Some(max) = policy.max_tool_calls
                && self.tool_calls_made >= max
            {
                self.pending.clear();
                if policy.force_finalize_after_tool {
                    return Ok(TurnState::ForceFinalize);
                }
                return Ok(TurnState::Synthesize);
            }
        }

        let signature = guard::tool_signature(&tool_use.tool, &tool_use.input, self.ctx.workspace);
        if self.guard.classify(&signature) == GuardVerdict::DefiniteLoop {
            return Ok(TurnState::Finished {
                text: format!(
                    "I stopped because I kept repeating the same call without progress: \
                     {signature}. Tell me what to try differently."
                ),
                reason: FinishReason::LoopDetected,
            });
        }

        self.execute_tool(tool_use, signature)
    }

    fn execute_tool(&mut self, tool_use: ToolUse, signature: String) -> Result<TurnState> {
        let call_id = tool_use
            .call_id
            .clone()
            .unwrap_or_else(|| format!("call_{}", Uuid::now_v7().simple()));
        let proposal = self.ctx.host.propose(ToolCall {
            name: tool_use.tool.clone(),
            args: tool_use.input.clone(),
        });
        let invocation_id = proposal.invocation_id;

        let mut approved = proposal.approved;
        if !approved {
            approved = match self.ctx.approval_cb {
                Some(cb) => cb(ApprovalRequest::Tool(&proposal.call))?,
                None => false,
            };
            self.ctx.cancel.check()?;
        }

        let args_summary = summarize_args(&tool_use.input);
        self.stream(StreamChunk::ToolCallStart {
            id: call_id.clone(),
            name: tool_use.tool.clone(),
            args_summary: args_summary.clone(),
        });
        self.emit(EventKind::ToolStartedV1 {
            invocation_id,
            name: tool_use.tool.clone(),
            args_summary,
        });

        let started = Instant::now();
        let mut todo_noop = false;
        let (success, result_text) = if approved {
            let result = self.ctx.host.execute(
                ApprovedToolCall {
                    invocation_id,
                    call: proposal.call,
                },
                self.ctx.cancel,
            );
            // Nothing lands in history once an abort has fired.
            self.ctx.cancel.check()?;
            todo_noop = ToolName::from_api_name(&tool_use.tool).is_some_and(|name| name.is_todo())
                && result.success
                && result.output.get("changed").and_then(Value::as_bool) == Some(false);
            if result.success {
                let rendered = serde_json::to_string(&result.output)
                    .unwrap_or_else(|_| result.output.to_string());
                (
                    true,
                    truncate_chars(&rendered, self.ctx.agent.max_tool_output_chars),
                )
            } else {
                let detail = result
                    .output
                    .get("error")
                    .and_then(Value::as_str)
                    .map(str::to_string)
                    .unwrap_or_else(|| result.output.to_string());
                (false, format!("Tool error: {detail}"))
            }
        } else {
            (false, DENIED_RESULT.to_string())
        };

        self.emit(EventKind::ToolFinishedV1 {
            invocation_id,
            name: tool_use.tool.clone(),
            success,
            duration_ms: started.elapsed().as_millis() as u64,
        });
        self.stream(StreamChunk::ToolCallEnd {
            id: call_id.clone(),
            name: tool_use.tool.clone(),
            success,
        });

        let note = tool_use
            .reason
            .clone()
            .or_else(|| tool_use.thought.clone())
            .unwrap_or_default();
        self.history.push(Message::tool_call(
            call_id.clone(),
            tool_use.tool.clone(),
            tool_use.input.clone(),
            note,
        ));
        self.history.push(Message::tool_result(
            call_id,
            tool_use.tool.clone(),
            result_text.clone(),
        ));

        self.tool_calls_made += 1;
        self.tools_used.push(tool_use.tool.clone());
        if success {
            self.evidence.push((tool_use.tool.clone(), result_text.clone()));
        }

        if self.guard.record_outcome(&signature, &result_text) {
            return Ok(TurnState::Finished {
                text: "I detected a loop: the same call produced the same result twice, so \
                       continuing would not make progress. Tell me what to try differently."
                    .to_string(),
                reason: FinishReason::LoopDetected,
            });
        }
        if todo_noop && self.guard.note_todo_noop() {
            return Ok(TurnState::Finished {
                text: "The todo list has stopped changing, which usually means I am stuck. Tell \
                       me the concrete next step you want."
                    .to_string(),
                reason: FinishReason::TodoStall,
            });
        }

        if let Some(policy) = &self.policy
            && let Some(max) = policy.max_tool_calls
            && self.tool_calls_made >= max
        {
            if policy.force_finalize_after_tool {
                self.pending.clear();
                return Ok(TurnState::ForceFinalize);
            }
            if self.tool_calls_made == max {
                let nudge = if policy.require_commit_message {
                    "You have the output you need. Reply with a final answer now; end with the \
                     commit message itself."
                } else {
                    "You have the output you need. Reply with a final answer now, without \
                     further tool calls."
                };
                self.history.push(Message::user(nudge));
            }
        }

        if !self.replanned
            && let Some(plan) = self.plan.clone()
            && self.tool_calls_made >= u64::from(plan.tool_budget)
        {
            self.replanned = true;
            let revised = planner::replan_turn(
                self.ctx.provider,
                self.ctx.llm,
                &self.user_message,
                &plan,
                &self.tools_used,
                self.ctx.cancel,
            )?;
            self.iterations += 1;
            if let Some(revised) = revised {
                self.emit(EventKind::PlanRevisedV1 {
                    plan: revised.clone(),
                });
                self.plan = Some(revised);
            }
        }

        Ok(TurnState::RequestModel)
    }

    fn synthesize(&mut self) -> Result<TurnState> {
        self.pending.clear();
        if self.synthesis_attempts >= MAX_SYNTHESIS_ATTEMPTS {
            return Ok(TurnState::Finished {
                text: self.fallback_synthesis(),
                reason: FinishReason::ToolBudget,
            });
        }
        self.synthesis_attempts += 1;
        self.history.push(Message::user(
            "The tool budget for this request is spent. Answer now from the results you already \
             have; do not request more tools.",
        ));
        let request = self.build_request(ToolChoice::none(), false);
        let response = self.call_provider(&request)?;
        match self.parse_response(&response) {
            Action::Final { message } => Ok(TurnState::Finished {
                text: message,
                reason: FinishReason::Final,
            }),
            Action::Thought { content } => {
                self.history.push(Message::assistant(content));
                Ok(TurnState::Synthesize)
            }
            _ => Ok(TurnState::Synthesize),
        }
    }

    fn fallback_synthesis(&self) -> String {
        let mut text = format!(
            "I ran {} tool call(s) but could not fit a final answer into this request's budget.",
            self.tool_calls_made
        );
        if let Some((tool, result)) = self.evidence.last() {
            text.push_str(&format!(
                " Last result from {tool}: {}",
                truncate_chars(result, 400)
            ));
        }
        text
    }

    fn force_finalize(&mut self) -> Result<TurnState> {
        self.pending.clear();
        let request = self.build_request(ToolChoice::none(), false);
        let response = self.call_provider(&request)?;
        let message = match action::parse_model_action(&response.text) {
            Action::Final { message } => message,
            _ => response.text.trim().to_string(),
        };
        let text = if message.is_empty() {
            self.fallback_synthesis()
        } else {
            message
        };
        Ok(TurnState::Finished {
            text,
            reason: FinishReason::Final,
        })
    }

    fn finish(self, text: String, reason: FinishReason) -> TurnOutcome {
        self.history.push(Message::assistant(text.clone()));
        self.emit(EventKind::TurnFinishedV1 {
            finish_reason: reason.as_str().to_string(),
            iterations: self.iterations,
            tool_calls: self.tool_calls_made,
        });
        self.stream(StreamChunk::Done);
        TurnOutcome {
            final_text: text,
            finish_reason: reason,
            iterations: self.iterations,
            tool_calls: self.tool_calls_made,
            usage: self.usage,
        }
    }

    fn checkpoint_due(&self) -> bool {
        let interval = self.ctx.agent.checkpoint_interval;
        interval > 0
            && self.iterations > 0
            && self.iterations % interval == 0
            && self.last_checkpoint != self.iterations
    }

    fn build_request(&self, tool_choice: ToolChoice, include_tools: bool) -> ChatRequest {
        let offered = self.offered_tools();
        let prompt_ctx = PromptContext {
            workspace: self.ctx.workspace,
            auto_approve: self.ctx.auto_approve,
            native_tools: self.ctx.agent.native_tools,
            tools: &offered,
            plan: self.plan.as_ref(),
            policy: self.policy.as_ref(),
            project_instructions: self.ctx.project_instructions,
            mcp_servers: self.ctx.mcp_servers,
        };
        let mut messages = vec![ChatMessage::System {
            content: prompts::build_system_prompt(&prompt_ctx),
        }];
        messages.extend(action::build_messages(
            self.history,
            self.ctx.agent.native_tools,
        ));
        let tools = if include_tools && self.ctx.agent.native_tools {
            offered
        } else {
            Vec::new()
        };
        ChatRequest {
            model: self.ctx.llm.model.clone(),
            messages,
            tools,
            tool_choice,
            max_tokens: self.ctx.llm.max_tokens,
            temperature: self.ctx.llm.temperature,
        }
    }

    /// The registered tools minus whatever the active policy withholds.
    fn offered_tools(&self) -> Vec<ToolDefinition> {
        self.ctx
            .tools
            .iter()
            .filter(|def| {
                if let Some(policy) = &self.policy {
                    if policy.disable_todos
                        && ToolName::from_api_name(&def.function.name)
                            .is_some_and(|name| name.is_todo())
                    {
                        return false;
                    }
                    if let Some(allowed) = policy.allowed_tools {
                        return allowed.contains(&def.function.name.as_str());
                    }
                }
                true
            })
            .cloned()
            .collect()
    }

    fn emit(&self, kind: EventKind) {
        if let Some(cb) = self.ctx.event_cb {
            cb(kind);
        }
    }

    fn stream(&self, chunk: StreamChunk) {
        if let Some(cb) = self.ctx.stream_cb {
            cb(chunk);
        }
    }
}

fn summarize_args(input: &Value) -> String {
    let Some(obj) = input.as_object() else {
        return truncate_chars(&input.to_string(), 60);
    };
    if obj.is_empty() {
        return "()".to_string();
    }
    obj.iter()
        .map(|(key, value)| {
            let rendered = match value {
                Value::String(s) => format!("\"{}\"", truncate_chars(s, 60)),
                other => truncate_chars(&other.to_string(), 60),
            };
            format!("{key}={rendered}")
        })
        .collect::<Vec<_>>()
        .join(", ")
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::anyhow;
    use serde_json::json;
    use std::path::PathBuf;
    use std::sync::{Arc, Mutex};
    use tiller_core::{
        FunctionDefinition, LlmToolCall, ToolProposal, ToolResult, is_abort_error,
    };

    struct ScriptedProvider {
        responses: Mutex<VecDeque<LlmResponse>>,
        requests: Mutex<Vec<ChatRequest>>,
    }

    impl ScriptedProvider {
        fn new(responses: Vec<LlmResponse>) -> Self {
            Self {
                responses: Mutex::new(VecDeque::from(responses)),
                requests: Mutex::new(Vec::new()),
            }
        }

        fn requests(&self) -> Vec<ChatRequest> {
            self.requests.lock().expect("requests lock").clone()
        }
    }

    impl Provider for ScriptedProvider {
        fn kind(&self) -> &str {
            "scripted"
        }
        fn model(&self) -> &str {
            "scripted-model"
        }
        fn complete(&self, req: &ChatRequest, _cancel: &CancelToken) -> Result<LlmResponse> {
            self.requests.lock().expect("requests lock").push(req.clone());
            self.responses
                .lock()
                .expect("responses lock")
                .pop_front()
                .ok_or_else(|| anyhow!("script exhausted"))
        }
        fn complete_streaming(
            &self,
            req: &ChatRequest,
            cancel: &CancelToken,
            _cb: StreamCallback,
        ) -> Result<LlmResponse> {
            self.complete(req, cancel)
        }
    }

    struct MockToolHost {
        outputs: Mutex<VecDeque<(bool, Value)>>,
        executed: Mutex<Vec<String>>,
        approve: bool,
    }

    impl MockToolHost {
        fn new(outputs: Vec<(bool, Value)>) -> Self {
            Self {
                outputs: Mutex::new(VecDeque::from(outputs)),
                executed: Mutex::new(Vec::new()),
                approve: true,
            }
        }

        fn denying() -> Self {
            Self {
                outputs: Mutex::new(VecDeque::new()),
                executed: Mutex::new(Vec::new()),
                approve: false,
            }
        }

        fn executed(&self) -> Vec<String> {
            self.executed.lock().expect("executed lock").clone()
        }
    }

    impl ToolHost for MockToolHost {
        fn propose(&self, call: ToolCall) -> ToolProposal {
            ToolProposal {
                invocation_id: Uuid::now_v7(),
                call,
                approved: self.approve,
            }
        }
        fn execute(&self, approved: ApprovedToolCall, _cancel: &CancelToken) -> ToolResult {
            self.executed
                .lock()
                .expect("executed lock")
                .push(approved.call.name.clone());
            let (success, output) = self
                .outputs
                .lock()
                .expect("outputs lock")
                .pop_front()
                .unwrap_or((true, json!({"ok": true})));
            ToolResult {
                invocation_id: approved.invocation_id,
                success,
                output,
            }
        }
    }

    /// Fires the turn's own cancel token from inside a tool, the way a
    /// Ctrl-C arriving mid-command does.
    struct AbortingToolHost {
        cancel: CancelToken,
    }

    impl ToolHost for AbortingToolHost {
        fn propose(&self, call: ToolCall) -> ToolProposal {
            ToolProposal {
                invocation_id: Uuid::now_v7(),
                call,
                approved: true,
            }
        }
        fn execute(&self, approved: ApprovedToolCall, _cancel: &CancelToken) -> ToolResult {
            self.cancel.request_abort();
            ToolResult {
                invocation_id: approved.invocation_id,
                success: true,
                output: json!({"stdout": "partial"}),
            }
        }
    }

    fn test_tools() -> Vec<ToolDefinition> {
        ["shell", "list_files", "read_file", "todo_write"]
            .iter()
            .map(|name| ToolDefinition {
                tool_type: "function".to_string(),
                function: FunctionDefinition {
                    name: (*name).to_string(),
                    description: format!("{name} tool"),
                    parameters: json!({"type": "object"}),
                },
            })
            .collect()
    }

    fn text(text: &str) -> LlmResponse {
        LlmResponse::text_only(text)
    }

    fn tool_response(id: &str, name: &str, args: Value) -> LlmResponse {
        LlmResponse {
            text: String::new(),
            finish_reason: "tool_calls".to_string(),
            reasoning_content: String::new(),
            tool_calls: vec![LlmToolCall {
                id: id.to_string(),
                name: name.to_string(),
                arguments: args.to_string(),
            }],
            usage: TokenUsage::default(),
        }
    }

    fn quick_cfg(native_tools: bool) -> AgentConfig {
        AgentConfig {
            pre_plan: false,
            native_tools,
            ..AgentConfig::default()
        }
    }

    fn run_turn(
        provider: &ScriptedProvider,
        host: &(dyn ToolHost + Send + Sync),
        cfg: &AgentConfig,
        approval_cb: Option<&ApprovalCallback>,
        history: &mut Vec<Message>,
        cancel: &CancelToken,
        message: &str,
    ) -> Result<TurnOutcome> {
        let llm = LlmConfig::default();
        let tools = test_tools();
        let workspace = PathBuf::from("/tmp/ws");
        let servers: Vec<String> = Vec::new();
        let ctx = TurnContext {
            provider,
            host,
            llm: &llm,
            agent: cfg,
            tools: &tools,
            workspace: &workspace,
            auto_approve: false,
            project_instructions: None,
            mcp_servers: &servers,
            approval_cb,
            event_cb: None,
            stream_cb: None,
            cancel,
        };
        TurnRunner::new(ctx, history).run(message)
    }

    #[test]
    fn plain_question_gets_a_direct_final_answer() {
        let provider =
            ScriptedProvider::new(vec![text(r#"{"type":"final","message":"Hello!"}"#)]);
        let host = MockToolHost::new(vec![]);
        let mut history = Vec::new();

        let outcome = run_turn(
            &provider,
            &host,
            &quick_cfg(false),
            None,
            &mut history,
            &CancelToken::new(),
            "Hi",
        )
        .expect("turn");

        assert_eq!(outcome.final_text, "Hello!");
        assert_eq!(outcome.finish_reason, FinishReason::Final);
        assert_eq!(outcome.iterations, 1);
        assert_eq!(provider.requests().len(), 1);
        let last = history.last().expect("final message");
        assert_eq!(last.role, tiller_core::Role::Assistant);
        assert_eq!(last.content, "Hello!");
    }

    #[test]
    fn tool_call_and_result_share_a_correlation_id() {
        let provider = ScriptedProvider::new(vec![
            tool_response("call_1", "list_files", json!({"dir": "."})),
            text("done"),
        ]);
        let host = MockToolHost::new(vec![(true, json!({"entries": []}))]);
        let mut history = Vec::new();

        let outcome = run_turn(
            &provider,
            &host,
            &quick_cfg(true),
            None,
            &mut history,
            &CancelToken::new(),
            "list the project root",
        )
        .expect("turn");

        assert_eq!(outcome.final_text, "done");
        assert_eq!(outcome.tool_calls, 1);
        assert_eq!(provider.requests().len(), 2);
        assert_eq!(host.executed(), vec!["list_files".to_string()]);

        let call = history
            .iter()
            .find_map(|m| m.tool_call.as_ref())
            .expect("tool call message");
        let result = history
            .iter()
            .find_map(|m| m.tool_result.as_ref())
            .expect("tool result message");
        assert_eq!(call.id, "call_1");
        assert_eq!(result.tool_call_id, "call_1");
        assert!(result.result.contains("entries"));
    }

    #[test]
    fn policy_violation_names_the_allowed_tools_and_executes_nothing() {
        let provider = ScriptedProvider::new(vec![tool_response(
            "c1",
            "read_file",
            json!({"path": "x.txt"}),
        )]);
        let host = MockToolHost::new(vec![]);
        let mut history = Vec::new();

        let outcome = run_turn(
            &provider,
            &host,
            &quick_cfg(true),
            None,
            &mut history,
            &CancelToken::new(),
            "summarize the diff",
        )
        .expect("turn");

        assert_eq!(outcome.finish_reason, FinishReason::PolicyViolation);
        assert!(outcome.final_text.contains("shell"));
        assert!(host.executed().is_empty());
        // A matched policy also suppresses pre-planning, so the one request
        // is the conversational one, with only the allowed tool offered.
        let requests = provider.requests();
        assert_eq!(requests.len(), 1);
        assert_eq!(requests[0].tools.len(), 1);
        assert_eq!(requests[0].tools[0].function.name, "shell");
    }

    #[test]
    fn repeating_call_with_identical_results_is_stopped() {
        let provider = ScriptedProvider::new(vec![
            tool_response("c1", "shell", json!({"cmd": "ls"})),
            tool_response("c2", "shell", json!({"cmd": "ls"})),
        ]);
        let host = MockToolHost::new(vec![
            (true, json!({"stdout": "same output"})),
            (true, json!({"stdout": "same output"})),
        ]);
        let mut history = Vec::new();

        let outcome = run_turn(
            &provider,
            &host,
            &quick_cfg(true),
            None,
            &mut history,
            &CancelToken::new(),
            "poke around",
        )
        .expect("turn");

        assert_eq!(outcome.finish_reason, FinishReason::LoopDetected);
        assert_eq!(host.executed().len(), 2);
        assert_eq!(provider.requests().len(), 2);
    }

    #[test]
    fn unknown_tool_name_ends_the_turn() {
        let provider =
            ScriptedProvider::new(vec![tool_response("c1", "frobnicate", json!({}))]);
        let host = MockToolHost::new(vec![]);
        let mut history = Vec::new();

        let outcome = run_turn(
            &provider,
            &host,
            &quick_cfg(true),
            None,
            &mut history,
            &CancelToken::new(),
            "do the thing",
        )
        .expect("turn");

        assert_eq!(outcome.finish_reason, FinishReason::UnknownTool);
        assert!(outcome.final_text.starts_with("Unknown tool: frobnicate"));
        assert!(outcome.final_text.contains("shell"));
        assert!(host.executed().is_empty());
    }

    #[test]
    fn abort_during_tool_execution_leaves_no_partial_history() {
        let cancel = CancelToken::new();
        let provider = ScriptedProvider::new(vec![tool_response(
            "c1",
            "shell",
            json!({"cmd": "sleep 100"}),
        )]);
        let host = AbortingToolHost {
            cancel: cancel.clone(),
        };
        let mut history = Vec::new();

        let err = run_turn(
            &provider,
            &host,
            &quick_cfg(true),
            None,
            &mut history,
            &cancel,
            "run something slow",
        )
        .expect_err("abort propagates");

        assert!(is_abort_error(&err));
        // Only the user message made it in; the interrupted call appended
        // neither its call record nor a final message.
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].role, tiller_core::Role::User);
    }

    #[test]
    fn checkpoint_decline_stops_the_turn() {
        let provider = ScriptedProvider::new(vec![
            text(r#"{"type":"thought","content":"still thinking"}"#),
            text(r#"{"type":"thought","content":"more thinking"}"#),
        ]);
        let host = MockToolHost::new(vec![]);
        let mut history = Vec::new();
        let cfg = AgentConfig {
            pre_plan: false,
            native_tools: false,
            max_iterations: 10,
            checkpoint_interval: 2,
            ..AgentConfig::default()
        };
        let cb: ApprovalCallback = Arc::new(|req: ApprovalRequest<'_>| match req {
            ApprovalRequest::Checkpoint { .. } => Ok(false),
            ApprovalRequest::Tool(_) => Ok(true),
        });

        let outcome = run_turn(
            &provider,
            &host,
            &cfg,
            Some(&cb),
            &mut history,
            &CancelToken::new(),
            "ponder forever",
        )
        .expect("turn");

        assert_eq!(outcome.finish_reason, FinishReason::CheckpointDeclined);
        assert_eq!(provider.requests().len(), 2);
        assert!(outcome.final_text.contains("Stopping"));
    }

    #[test]
    fn iteration_cap_produces_an_explanatory_final() {
        let provider = ScriptedProvider::new(vec![
            text(r#"{"type":"thought","content":"one"}"#),
            text(r#"{"type":"thought","content":"two"}"#),
        ]);
        let host = MockToolHost::new(vec![]);
        let mut history = Vec::new();
        let cfg = AgentConfig {
            pre_plan: false,
            native_tools: false,
            max_iterations: 2,
            ..AgentConfig::default()
        };

        let outcome = run_turn(
            &provider,
            &host,
            &cfg,
            None,
            &mut history,
            &CancelToken::new(),
            "ponder forever",
        )
        .expect("turn");

        assert_eq!(outcome.finish_reason, FinishReason::IterationCap);
        assert!(outcome.final_text.contains("iteration limit (2)"));
        assert_eq!(provider.requests().len(), 2);
    }

    #[test]
    fn second_todo_noop_ends_the_turn() {
        // Distinct inputs so the repeat detector does not fire first; the
        // host reports both writes as no-ops.
        let provider = ScriptedProvider::new(vec![
            tool_response("c1", "todo_write", json!({"todos": [{"content": "a"}]})),
            tool_response("c2", "todo_write", json!({"todos": [{"content": "b"}]})),
        ]);
        let host = MockToolHost::new(vec![
            (true, json!({"changed": false, "count": 1})),
            (true, json!({"changed": false, "count": 1})),
        ]);
        let mut history = Vec::new();

        let outcome = run_turn(
            &provider,
            &host,
            &quick_cfg(true),
            None,
            &mut history,
            &CancelToken::new(),
            "keep the list tidy",
        )
        .expect("turn");

        assert_eq!(outcome.finish_reason, FinishReason::TodoStall);
        assert_eq!(host.executed().len(), 2);
        assert!(outcome.final_text.contains("next step"));
    }

    #[test]
    fn multi_call_batch_drains_before_the_next_model_request() {
        let batch = LlmResponse {
            text: String::new(),
            finish_reason: "tool_calls".to_string(),
            reasoning_content: String::new(),
            tool_calls: vec![
                LlmToolCall {
                    id: "c1".to_string(),
                    name: "shell".to_string(),
                    arguments: json!({"cmd": "ls"}).to_string(),
                },
                LlmToolCall {
                    id: "c2".to_string(),
                    name: "read_file".to_string(),
                    arguments: json!({"path": "a.txt"}).to_string(),
                },
            ],
            usage: TokenUsage::default(),
        };
        let provider = ScriptedProvider::new(vec![batch, text("done")]);
        let host = MockToolHost::new(vec![
            (true, json!({"stdout": "a.txt"})),
            (true, json!({"content": "hi"})),
        ]);
        let mut history = Vec::new();

        let outcome = run_turn(
            &provider,
            &host,
            &quick_cfg(true),
            None,
            &mut history,
            &CancelToken::new(),
            "look around",
        )
        .expect("turn");

        assert_eq!(outcome.final_text, "done");
        assert_eq!(outcome.tool_calls, 2);
        // One model response covered both calls; only the final answer
        // needed a second request.
        assert_eq!(provider.requests().len(), 2);
        assert_eq!(
            host.executed(),
            vec!["shell".to_string(), "read_file".to_string()]
        );
    }

    #[test]
    fn forced_finalize_withholds_tools_on_the_closing_request() {
        let provider = ScriptedProvider::new(vec![
            tool_response("c1", "shell", json!({"cmd": "git status --short"})),
            text("The working tree is clean."),
        ]);
        let host = MockToolHost::new(vec![(true, json!({"stdout": ""}))]);
        let mut history = Vec::new();

        let outcome = run_turn(
            &provider,
            &host,
            &quick_cfg(true),
            None,
            &mut history,
            &CancelToken::new(),
            "what's the git status?",
        )
        .expect("turn");

        assert_eq!(outcome.finish_reason, FinishReason::Final);
        assert_eq!(outcome.final_text, "The working tree is clean.");
        assert_eq!(host.executed().len(), 1);
        let requests = provider.requests();
        assert_eq!(requests.len(), 2);
        assert!(requests[1].tools.is_empty());
        assert_eq!(requests[1].tool_choice, ToolChoice::none());
    }

    #[test]
    fn spent_budget_triggers_evidence_synthesis() {
        // "write a commit message" allows two shell calls; the model keeps
        // asking for a third, so the loop pivots to a no-tools synthesis
        // request.
        let provider = ScriptedProvider::new(vec![
            tool_response("c1", "shell", json!({"cmd": "git diff --staged"})),
            tool_response("c2", "shell", json!({"cmd": "git log --oneline -5"})),
            tool_response("c3", "shell", json!({"cmd": "git status"})),
            text("fix: handle empty diffs in the summary command"),
        ]);
        let host = MockToolHost::new(vec![
            (true, json!({"stdout": "diff body"})),
            (true, json!({"stdout": "log body"})),
        ]);
        let mut history = Vec::new();

        let outcome = run_turn(
            &provider,
            &host,
            &quick_cfg(true),
            None,
            &mut history,
            &CancelToken::new(),
            "write a commit message",
        )
        .expect("turn");

        assert_eq!(outcome.finish_reason, FinishReason::Final);
        assert_eq!(
            outcome.final_text,
            "fix: handle empty diffs in the summary command"
        );
        assert_eq!(host.executed().len(), 2);
        let requests = provider.requests();
        assert_eq!(requests.len(), 4);
        assert!(requests[3].tools.is_empty());
    }

    #[test]
    fn plan_budget_exhaustion_replans_once() {
        let provider = ScriptedProvider::new(vec![
            // Planning call.
            text(r#"{"summary":"inspect then fix","steps":["look"],"toolBudget":1}"#),
            tool_response("c1", "shell", json!({"cmd": "ls"})),
            // Replanning call after the budget is spent.
            text(r#"{"summary":"keep going","steps":["fix"],"toolBudget":3}"#),
            tool_response("c2", "shell", json!({"cmd": "pwd"})),
            text("all sorted"),
        ]);
        let host = MockToolHost::new(vec![
            (true, json!({"stdout": "src"})),
            (true, json!({"stdout": "/tmp/ws"})),
        ]);
        let mut history = Vec::new();
        let cfg = AgentConfig {
            pre_plan: true,
            native_tools: true,
            ..AgentConfig::default()
        };

        let outcome = run_turn(
            &provider,
            &host,
            &cfg,
            None,
            &mut history,
            &CancelToken::new(),
            "tidy up the build scripts",
        )
        .expect("turn");

        assert_eq!(outcome.final_text, "all sorted");
        assert_eq!(outcome.tool_calls, 2);
        let requests = provider.requests();
        assert_eq!(requests.len(), 5);
        // Planning and replanning requests carry no tool definitions.
        assert!(requests[0].tools.is_empty());
        assert!(requests[2].tools.is_empty());
    }

    #[test]
    fn unapproved_call_feeds_a_denial_back_to_the_model() {
        let provider = ScriptedProvider::new(vec![
            tool_response("c1", "shell", json!({"cmd": "rm -rf build"})),
            text("Understood, I will leave the build directory alone."),
        ]);
        let host = MockToolHost::denying();
        let mut history = Vec::new();

        let outcome = run_turn(
            &provider,
            &host,
            &quick_cfg(true),
            None,
            &mut history,
            &CancelToken::new(),
            "clean out the build directory",
        )
        .expect("turn");

        assert_eq!(outcome.finish_reason, FinishReason::Final);
        assert!(host.executed().is_empty());
        let denial = history
            .iter()
            .find_map(|m| m.tool_result.as_ref())
            .expect("denial result");
        assert!(denial.result.contains("not approved"));
    }

    #[test]
    fn long_histories_are_compacted_mid_turn() {
        let provider = ScriptedProvider::new(vec![
            text(r#"{"type":"thought","content":"t1"}"#),
            text(r#"{"type":"thought","content":"t2"}"#),
            text(r#"{"type":"thought","content":"t3"}"#),
            text(r#"{"type":"thought","content":"t4"}"#),
            text(r#"{"type":"thought","content":"t5"}"#),
            // Summarization call.
            text("Earlier thinking condensed."),
            text(r#"{"type":"final","message":"done"}"#),
        ]);
        let host = MockToolHost::new(vec![]);
        let mut history = Vec::new();
        let cfg = AgentConfig {
            pre_plan: false,
            native_tools: false,
            preserve_recent: 2,
            ..AgentConfig::default()
        };

        let outcome = run_turn(
            &provider,
            &host,
            &cfg,
            None,
            &mut history,
            &CancelToken::new(),
            "think out loud a lot",
        )
        .expect("turn");

        assert_eq!(outcome.final_text, "done");
        assert_eq!(provider.requests().len(), 7);
        // Summary message plus the two preserved messages plus the final.
        assert_eq!(history.len(), 4);
        assert!(history[0].summary);
    }

    #[test]
    fn unparsable_plan_still_runs_the_turn() {
        let provider = ScriptedProvider::new(vec![
            text("I cannot plan this."),
            text(r#"{"type":"final","message":"answered anyway"}"#),
        ]);
        let host = MockToolHost::new(vec![]);
        let mut history = Vec::new();
        let cfg = AgentConfig {
            pre_plan: true,
            native_tools: false,
            ..AgentConfig::default()
        };

        let outcome = run_turn(
            &provider,
            &host,
            &cfg,
            None,
            &mut history,
            &CancelToken::new(),
            "please do a moderately sized task",
        )
        .expect("turn");

        assert_eq!(outcome.final_text, "answered anyway");
        assert_eq!(provider.requests().len(), 2);
    }

    #[test]
    fn unrecognized_action_json_gets_a_nudge() {
        let provider = ScriptedProvider::new(vec![
            text(r#"{"type":"mystery","payload":1}"#),
            text(r#"{"type":"final","message":"ok"}"#),
        ]);
        let host = MockToolHost::new(vec![]);
        let mut history = Vec::new();

        let outcome = run_turn(
            &provider,
            &host,
            &quick_cfg(false),
            None,
            &mut history,
            &CancelToken::new(),
            "hello",
        )
        .expect("turn");

        assert_eq!(outcome.final_text, "ok");
        assert_eq!(provider.requests().len(), 2);
        assert!(
            history
                .iter()
                .any(|m| m.content.contains("not a recognized action"))
        );
    }
}

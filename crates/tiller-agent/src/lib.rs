//! The agent loop: turn orchestration, model-output normalization, advisory
//! planning, loop protection, and history compaction.
//!
//! The entry point is [`Agent`]: construct it with a provider and a tool
//! host, then call [`Agent::run_turn`] once per user message. Each turn runs
//! to exactly one final assistant message unless it is aborted.

mod action;
mod compact;
mod guard;
mod planner;
mod policy;
mod prompts;
mod turn;

pub use action::{Action, ToolUse, build_messages, parse_model_action, parse_native_response};
pub use compact::{CompactionReport, SUMMARY_PREFIX};
pub use policy::TurnPolicy;
pub use prompts::{BASE_SYSTEM_PROMPT, PromptContext, build_system_prompt};
pub use turn::{FinishReason, TurnOutcome};

use std::path::PathBuf;
use std::sync::Arc;

use tiller_core::{
    AppConfig, CancelToken, EventKind, Message, Result, StreamCallback, ToolCall, ToolDefinition,
    ToolHost,
};
use tiller_llm::Provider;

/// What the agent is asking the user to approve mid-turn.
pub enum ApprovalRequest<'a> {
    /// A tool call that policy did not pre-approve.
    Tool(&'a ToolCall),
    /// An iteration checkpoint: should the turn keep going?
    Checkpoint { iterations: u64 },
}

/// Answers approval requests. Returning an error (for example on a closed
/// stdin) aborts the turn; without a callback, tool calls are denied and
/// checkpoints continue.
pub type ApprovalCallback = Arc<dyn Fn(ApprovalRequest<'_>) -> Result<bool> + Send + Sync>;

/// Receives loop events as they happen. The agent emits bare [`EventKind`]s;
/// wrapping them in envelopes with sequence numbers is the caller's job.
pub type EventCallback = Arc<dyn Fn(EventKind) + Send + Sync>;

/// A stateful conversation: one provider, one tool host, an append-only
/// message history, and one cancel token that outlives individual turns.
pub struct Agent {
    provider: Arc<dyn Provider>,
    host: Arc<dyn ToolHost + Send + Sync>,
    cfg: AppConfig,
    workspace: PathBuf,
    tools: Vec<ToolDefinition>,
    history: Vec<Message>,
    project_instructions: Option<String>,
    mcp_servers: Vec<String>,
    approval_cb: Option<ApprovalCallback>,
    event_cb: Option<EventCallback>,
    stream_cb: Option<StreamCallback>,
    cancel: CancelToken,
}

impl Agent {
    pub fn new(
        provider: Arc<dyn Provider>,
        host: Arc<dyn ToolHost + Send + Sync>,
        cfg: AppConfig,
        workspace: impl Into<PathBuf>,
        tools: Vec<ToolDefinition>,
    ) -> Self {
        Self {
            provider,
            host,
            cfg,
            workspace: workspace.into(),
            tools,
            history: Vec::new(),
            project_instructions: None,
            mcp_servers: Vec::new(),
            approval_cb: None,
            event_cb: None,
            stream_cb: None,
            cancel: CancelToken::new(),
        }
    }

    /// Repository guidance (TILLER.md) folded into the system prompt.
    pub fn set_project_instructions(&mut self, instructions: Option<String>) {
        self.project_instructions = instructions;
    }

    pub fn set_mcp_servers(&mut self, servers: Vec<String>) {
        self.mcp_servers = servers;
    }

    pub fn set_approval_callback(&mut self, cb: ApprovalCallback) {
        self.approval_cb = Some(cb);
    }

    pub fn set_event_callback(&mut self, cb: EventCallback) {
        self.event_cb = Some(cb);
    }

    pub fn set_stream_callback(&mut self, cb: StreamCallback) {
        self.stream_cb = Some(cb);
    }

    /// A clone of the agent's cancel token, for signal handlers. The token
    /// is re-armed at the start of every turn, so one handle stays valid
    /// across the whole session.
    pub fn cancel_token(&self) -> CancelToken {
        self.cancel.clone()
    }

    pub fn request_abort(&self) {
        self.cancel.request_abort();
    }

    pub fn history(&self) -> &[Message] {
        &self.history
    }

    pub fn config(&self) -> &AppConfig {
        &self.cfg
    }

    /// Run one turn to its final assistant text.
    pub fn run_turn(&mut self, user_message: &str) -> Result<String> {
        Ok(self.run_turn_detailed(user_message)?.final_text)
    }

    pub fn run_turn_detailed(&mut self, user_message: &str) -> Result<TurnOutcome> {
        self.cancel.reset();
        let ctx = turn::TurnContext {
            provider: self.provider.as_ref(),
            host: self.host.as_ref(),
            llm: &self.cfg.llm,
            agent: &self.cfg.agent,
            tools: &self.tools,
            workspace: &self.workspace,
            auto_approve: self.cfg.approvals.mode == "auto",
            project_instructions: self.project_instructions.as_deref(),
            mcp_servers: &self.mcp_servers,
            approval_cb: self.approval_cb.as_ref(),
            event_cb: self.event_cb.as_ref(),
            stream_cb: self.stream_cb.as_ref(),
            cancel: &self.cancel,
        };
        turn::TurnRunner::new(ctx, &mut self.history).run(user_message)
    }

    /// Compact the history now, regardless of the automatic threshold.
    pub fn compact_history(&mut self, preserve_recent: Option<usize>) -> Result<CompactionReport> {
        let preserve = preserve_recent.unwrap_or(self.cfg.agent.preserve_recent);
        let report = compact::compact_history(
            self.provider.as_ref(),
            &self.cfg.llm,
            &mut self.history,
            preserve,
            &self.cancel,
        )?;
        if report.compacted
            && let Some(cb) = &self.event_cb
        {
            cb(EventKind::CompactionV1 {
                before: report.before,
                after: report.after,
            });
        }
        Ok(report)
    }
}

/// Char-boundary-safe truncation with a trailing marker.
pub(crate) fn truncate_chars(s: &str, max: usize) -> String {
    if s.chars().count() <= max {
        s.to_string()
    } else {
        let cut: String = s.chars().take(max).collect();
        format!("{cut}...")
    }
}

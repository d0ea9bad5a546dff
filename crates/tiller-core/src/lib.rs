use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use uuid::Uuid;

pub type Result<T> = anyhow::Result<T>;

/// Directory under the workspace root where tiller keeps its runtime files
/// (settings, logs, todo state).
pub fn runtime_dir(workspace: &Path) -> PathBuf {
    workspace.join(".tiller")
}

// ---------------------------------------------------------------------------
// Cancellation
// ---------------------------------------------------------------------------

/// Raised when the current turn was aborted by the user. This is the one
/// error that must propagate unmodified through every layer; check for it
/// with [`is_abort_error`] rather than string matching.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("task aborted")]
pub struct TaskAborted;

/// Returns whether `err` is (or wraps) a [`TaskAborted`].
pub fn is_abort_error(err: &anyhow::Error) -> bool {
    err.downcast_ref::<TaskAborted>().is_some()
}

/// Cooperative cancellation token. One token is minted per turn; the turn
/// loop checks it at the top of every iteration and immediately after every
/// provider call, tool execution, and approval prompt.
#[derive(Debug, Clone, Default)]
pub struct CancelToken {
    aborted: Arc<AtomicBool>,
}

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    /// Signal the token. Idempotent after the first call.
    pub fn request_abort(&self) {
        self.aborted.store(true, Ordering::SeqCst);
    }

    /// Re-arm the token for a new turn. Existing clones stay valid, so a
    /// long-lived signal handler can keep one handle across turns.
    pub fn reset(&self) {
        self.aborted.store(false, Ordering::SeqCst);
    }

    /// The flag behind the token, for handlers that set an `AtomicBool`
    /// directly (`signal_hook::flag::register`). Setting it is equivalent
    /// to calling [`request_abort`](Self::request_abort).
    pub fn abort_flag(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.aborted)
    }

    pub fn is_aborted(&self) -> bool {
        self.aborted.load(Ordering::SeqCst)
    }

    /// Err([`TaskAborted`]) once the token has fired, Ok(()) otherwise.
    pub fn check(&self) -> Result<()> {
        if self.is_aborted() {
            Err(TaskAborted.into())
        } else {
            Ok(())
        }
    }
}

// ---------------------------------------------------------------------------
// Tool registry
// ---------------------------------------------------------------------------

/// Closed set of built-in tools. Tool dispatch is keyed on this enum so an
/// unknown model-supplied name is a typed lookup failure, never a stringly
/// miss deep inside the host.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ToolName {
    Shell,
    ReadFile,
    WriteFile,
    EditFile,
    ListFiles,
    SearchFiles,
    Glob,
    TodoWrite,
    McpListTools,
    McpListResources,
    McpListResourceTemplates,
    McpReadResource,
    McpCallTool,
}

impl ToolName {
    pub const ALL: &'static [ToolName] = &[
        Self::Shell,
        Self::ReadFile,
        Self::WriteFile,
        Self::EditFile,
        Self::ListFiles,
        Self::SearchFiles,
        Self::Glob,
        Self::TodoWrite,
        Self::McpListTools,
        Self::McpListResources,
        Self::McpListResourceTemplates,
        Self::McpReadResource,
        Self::McpCallTool,
    ];

    /// Parse the wire name. `todowrite` is accepted as an alias of
    /// `todo_write` here so nothing downstream has to special-case it.
    pub fn from_api_name(s: &str) -> Option<Self> {
        Some(match s {
            "shell" => Self::Shell,
            "read_file" => Self::ReadFile,
            "write_file" => Self::WriteFile,
            "edit_file" => Self::EditFile,
            "list_files" => Self::ListFiles,
            "search_files" => Self::SearchFiles,
            "glob" => Self::Glob,
            "todo_write" | "todowrite" => Self::TodoWrite,
            "mcp_list_tools" => Self::McpListTools,
            "mcp_list_resources" => Self::McpListResources,
            "mcp_list_resource_templates" => Self::McpListResourceTemplates,
            "mcp_read_resource" => Self::McpReadResource,
            "mcp_call_tool" => Self::McpCallTool,
            _ => return None,
        })
    }

    pub fn as_api_name(&self) -> &'static str {
        match self {
            Self::Shell => "shell",
            Self::ReadFile => "read_file",
            Self::WriteFile => "write_file",
            Self::EditFile => "edit_file",
            Self::ListFiles => "list_files",
            Self::SearchFiles => "search_files",
            Self::Glob => "glob",
            Self::TodoWrite => "todo_write",
            Self::McpListTools => "mcp_list_tools",
            Self::McpListResources => "mcp_list_resources",
            Self::McpListResourceTemplates => "mcp_list_resource_templates",
            Self::McpReadResource => "mcp_read_resource",
            Self::McpCallTool => "mcp_call_tool",
        }
    }

    /// Tools with no workspace side effects. These skip the approval gate
    /// when `approvals.allow_read_only` is set.
    pub fn is_read_only(&self) -> bool {
        matches!(
            self,
            Self::ReadFile
                | Self::ListFiles
                | Self::SearchFiles
                | Self::Glob
                | Self::McpListTools
                | Self::McpListResources
                | Self::McpListResourceTemplates
                | Self::McpReadResource
        )
    }

    /// Tools that only mutate in-session state (the todo list), never the
    /// workspace. Always auto-approved.
    pub fn is_session_local(&self) -> bool {
        matches!(self, Self::TodoWrite)
    }

    pub fn is_todo(&self) -> bool {
        matches!(self, Self::TodoWrite)
    }
}

// ---------------------------------------------------------------------------
// Conversation history
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
}

/// A tool invocation attached to an assistant message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolCallRef {
    pub id: String,
    pub name: String,
    pub input: serde_json::Value,
}

/// A tool result attached to the user-role message that answers a call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolResultRef {
    pub tool_call_id: String,
    pub name: String,
    pub result: String,
}

/// Canonical in-memory history entry. Structured call/result data is attached
/// here exactly once, at append time; nothing downstream re-parses `content`
/// to figure out what a message was.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub role: Role,
    pub content: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_call: Option<ToolCallRef>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_result: Option<ToolResultRef>,
    /// Marks a synthetic compaction summary so it is never summarized again
    /// in the same pass.
    #[serde(default)]
    pub summary: bool,
}

impl Message {
    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            content: content.into(),
            tool_call: None,
            tool_result: None,
            summary: false,
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: Role::Assistant,
            content: content.into(),
            tool_call: None,
            tool_result: None,
            summary: false,
        }
    }

    pub fn tool_call(
        id: impl Into<String>,
        name: impl Into<String>,
        input: serde_json::Value,
        content: impl Into<String>,
    ) -> Self {
        Self {
            role: Role::Assistant,
            content: content.into(),
            tool_call: Some(ToolCallRef {
                id: id.into(),
                name: name.into(),
                input,
            }),
            tool_result: None,
            summary: false,
        }
    }

    pub fn tool_result(
        tool_call_id: impl Into<String>,
        name: impl Into<String>,
        result: impl Into<String>,
    ) -> Self {
        let result = result.into();
        Self {
            role: Role::User,
            content: result.clone(),
            tool_call: None,
            tool_result: Some(ToolResultRef {
                tool_call_id: tool_call_id.into(),
                name: name.into(),
                result,
            }),
            summary: false,
        }
    }

    pub fn summary(content: impl Into<String>) -> Self {
        Self {
            role: Role::Assistant,
            content: content.into(),
            tool_call: None,
            tool_result: None,
            summary: true,
        }
    }
}

// ---------------------------------------------------------------------------
// Provider wire types
// ---------------------------------------------------------------------------

/// One chat message in the provider's native array, tagged by role.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "role", rename_all = "lowercase")]
pub enum ChatMessage {
    System {
        content: String,
    },
    User {
        content: String,
    },
    Assistant {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        content: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        reasoning_content: Option<String>,
        #[serde(default, skip_serializing_if = "Vec::is_empty")]
        tool_calls: Vec<LlmToolCall>,
    },
    Tool {
        tool_call_id: String,
        content: String,
    },
}

/// A structured function call as reported by the provider. `arguments` is the
/// raw JSON string from the wire; parsing it is the normalizer's job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LlmToolCall {
    pub id: String,
    pub name: String,
    pub arguments: String,
}

fn default_finish_reason() -> String {
    "stop".to_string()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LlmResponse {
    pub text: String,
    #[serde(default = "default_finish_reason")]
    pub finish_reason: String,
    #[serde(default)]
    pub reasoning_content: String,
    #[serde(default)]
    pub tool_calls: Vec<LlmToolCall>,
    #[serde(default)]
    pub usage: TokenUsage,
}

impl LlmResponse {
    pub fn text_only(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            finish_reason: default_finish_reason(),
            reasoning_content: String::new(),
            tool_calls: Vec::new(),
            usage: TokenUsage::default(),
        }
    }
}

/// A single chunk emitted during streaming.
#[derive(Debug, Clone)]
pub enum StreamChunk {
    /// A content text delta.
    ContentDelta(String),
    /// A reasoning/thinking text delta.
    ReasoningDelta(String),
    /// A tool call is about to execute.
    ToolCallStart {
        id: String,
        name: String,
        args_summary: String,
    },
    /// A tool call finished.
    ToolCallEnd {
        id: String,
        name: String,
        success: bool,
    },
    /// The stream (or turn) is complete.
    Done,
}

pub type StreamCallback = Arc<dyn Fn(StreamChunk) + Send + Sync>;

/// Approximate token accounting, summed across the provider calls of a turn.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenUsage {
    pub input_tokens: u64,
    pub output_tokens: u64,
}

impl TokenUsage {
    pub fn add(&mut self, other: &TokenUsage) {
        self.input_tokens = self.input_tokens.saturating_add(other.input_tokens);
        self.output_tokens = self.output_tokens.saturating_add(other.output_tokens);
    }

    pub fn total(&self) -> u64 {
        self.input_tokens.saturating_add(self.output_tokens)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolDefinition {
    #[serde(rename = "type")]
    pub tool_type: String,
    pub function: FunctionDefinition,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FunctionDefinition {
    pub name: String,
    pub description: String,
    pub parameters: serde_json::Value,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolChoiceFunction {
    pub name: String,
}

/// `tool_choice` request field: either a mode string or a forced function.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ToolChoice {
    Mode(String),
    Function {
        #[serde(rename = "type")]
        choice_type: String,
        function: ToolChoiceFunction,
    },
}

impl ToolChoice {
    pub fn auto() -> Self {
        Self::Mode("auto".to_string())
    }

    pub fn none() -> Self {
        Self::Mode("none".to_string())
    }

    pub fn required() -> Self {
        Self::Mode("required".to_string())
    }
}

impl Default for ToolChoice {
    fn default() -> Self {
        Self::auto()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatRequest {
    pub model: String,
    pub messages: Vec<ChatMessage>,
    #[serde(default)]
    pub tools: Vec<ToolDefinition>,
    #[serde(default)]
    pub tool_choice: ToolChoice,
    pub max_tokens: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f32>,
}

// ---------------------------------------------------------------------------
// Tool host
// ---------------------------------------------------------------------------

/// A concrete tool invocation as dispatched to the host.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolCall {
    pub name: String,
    pub args: serde_json::Value,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolProposal {
    pub invocation_id: Uuid,
    pub call: ToolCall,
    /// Pre-approved by policy (read-only or session-local tool, or
    /// auto-approve mode). When false the caller must obtain approval.
    pub approved: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApprovedToolCall {
    pub invocation_id: Uuid,
    pub call: ToolCall,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolResult {
    pub invocation_id: Uuid,
    pub success: bool,
    pub output: serde_json::Value,
}

/// Side-effecting tool dispatcher. `execute` never panics the turn: failures
/// come back as `success: false` with an `error` field in the output. The
/// cancel token must be honored by long-running tools (shell commands); a
/// fired token surfaces as [`TaskAborted`] from the turn loop, not from here.
pub trait ToolHost {
    fn propose(&self, call: ToolCall) -> ToolProposal;
    fn execute(&self, approved: ApprovedToolCall, cancel: &CancelToken) -> ToolResult;
}

// ---------------------------------------------------------------------------
// Plans
// ---------------------------------------------------------------------------

pub const PLAN_MAX_STEPS: usize = 8;
pub const TOOL_BUDGET_MIN: u32 = 1;
pub const TOOL_BUDGET_MAX: u32 = 12;

/// Advisory turn-scoped plan. Replaced at most once per turn by a revision.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Plan {
    pub summary: String,
    pub steps: Vec<String>,
    pub tool_budget: u32,
}

impl Plan {
    /// Enforce the structural bounds: at most [`PLAN_MAX_STEPS`] steps and a
    /// budget inside `[TOOL_BUDGET_MIN, TOOL_BUDGET_MAX]`.
    pub fn clamped(mut self) -> Self {
        self.steps.truncate(PLAN_MAX_STEPS);
        self.tool_budget = self.tool_budget.clamp(TOOL_BUDGET_MIN, TOOL_BUDGET_MAX);
        self
    }
}

// ---------------------------------------------------------------------------
// Events
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventEnvelope {
    pub seq_no: u64,
    pub at: DateTime<Utc>,
    pub session_id: Uuid,
    pub kind: EventKind,
}

/// Versioned event payloads for the observer/UI. Fire-and-forget; consumers
/// must tolerate unknown variants from newer writers.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload")]
pub enum EventKind {
    TurnStartedV1 {
        prompt: String,
    },
    PlanCreatedV1 {
        plan: Plan,
    },
    PlanRevisedV1 {
        plan: Plan,
    },
    ThoughtV1 {
        content: String,
    },
    ToolStartedV1 {
        invocation_id: Uuid,
        name: String,
        args_summary: String,
    },
    ToolFinishedV1 {
        invocation_id: Uuid,
        name: String,
        success: bool,
        duration_ms: u64,
    },
    CompactionV1 {
        before: usize,
        after: usize,
    },
    UsageUpdatedV1 {
        usage: TokenUsage,
    },
    TurnFinishedV1 {
        finish_reason: String,
        iterations: u64,
        tool_calls: u64,
    },
}

// ---------------------------------------------------------------------------
// Configuration
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub llm: LlmConfig,
    pub agent: AgentConfig,
    pub approvals: ApprovalConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LlmConfig {
    pub provider: String,
    pub model: String,
    pub endpoint: String,
    pub api_key_env: String,
    pub timeout_seconds: u64,
    pub max_retries: u8,
    pub retry_base_ms: u64,
    pub stream: bool,
    pub max_tokens: u32,
    pub temperature: Option<f32>,
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            provider: "openai-compat".to_string(),
            model: "gpt-4o-mini".to_string(),
            endpoint: "https://api.openai.com/v1/chat/completions".to_string(),
            api_key_env: "TILLER_API_KEY".to_string(),
            timeout_seconds: 60,
            max_retries: 3,
            retry_base_ms: 400,
            stream: true,
            max_tokens: 8192,
            temperature: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AgentConfig {
    /// Run a one-shot planning call before the first model iteration.
    pub pre_plan: bool,
    /// Send function-calling tool definitions and read structured tool
    /// calls. When false the model is expected to answer with action JSON
    /// in free text.
    pub native_tools: bool,
    /// Hard stop after this many loop iterations.
    pub max_iterations: u64,
    /// Every N-th iteration, ask the approval callback whether to continue.
    pub checkpoint_interval: u64,
    /// Messages kept verbatim when compacting history.
    pub preserve_recent: usize,
    /// Tool output is truncated to this many characters before being fed
    /// back to the model.
    pub max_tool_output_chars: usize,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            pre_plan: true,
            native_tools: true,
            max_iterations: 20,
            checkpoint_interval: 20,
            preserve_recent: 12,
            max_tool_output_chars: 30_000,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ApprovalConfig {
    /// "ask" prompts via the approval callback; "auto" approves everything.
    pub mode: String,
    /// Skip the approval gate for read-only tools.
    pub allow_read_only: bool,
}

impl Default for ApprovalConfig {
    fn default() -> Self {
        Self {
            mode: "ask".to_string(),
            allow_read_only: true,
        }
    }
}

impl AppConfig {
    pub fn user_settings_path() -> Option<PathBuf> {
        let home = std::env::var("HOME")
            .ok()
            .or_else(|| std::env::var("USERPROFILE").ok())?;
        Some(Path::new(&home).join(".tiller/settings.json"))
    }

    pub fn project_settings_path(workspace: &Path) -> PathBuf {
        runtime_dir(workspace).join("settings.json")
    }

    pub fn project_local_settings_path(workspace: &Path) -> PathBuf {
        runtime_dir(workspace).join("settings.local.json")
    }

    /// Layered load: defaults, then the user file (or the file named by
    /// `TILLER_SETTINGS_FILE`), then project settings, then project-local
    /// settings. Later layers win key-by-key via recursive merge.
    pub fn load(workspace: &Path) -> Result<Self> {
        let mut merged = serde_json::to_value(Self::default())?;

        let mut paths = Vec::new();
        if let Ok(env_path) = std::env::var("TILLER_SETTINGS_FILE") {
            paths.push(PathBuf::from(env_path));
        } else if let Some(user) = Self::user_settings_path() {
            paths.push(user);
        }
        paths.push(Self::project_settings_path(workspace));
        paths.push(Self::project_local_settings_path(workspace));

        for path in paths {
            if !path.exists() {
                continue;
            }
            let raw = fs::read_to_string(path)?;
            let value: serde_json::Value = serde_json::from_str(&raw)?;
            merge_json_value(&mut merged, &value);
        }

        Ok(serde_json::from_value(merged)?)
    }

    pub fn save(&self, workspace: &Path) -> Result<()> {
        let path = Self::project_settings_path(workspace);
        fs::create_dir_all(
            path.parent()
                .ok_or_else(|| anyhow::anyhow!("invalid config path"))?,
        )?;
        fs::write(path, serde_json::to_vec_pretty(self)?)?;
        Ok(())
    }
}

fn merge_json_value(base: &mut serde_json::Value, overlay: &serde_json::Value) {
    match (base, overlay) {
        (serde_json::Value::Object(base_obj), serde_json::Value::Object(overlay_obj)) => {
            for (key, overlay_value) in overlay_obj {
                if let Some(base_value) = base_obj.get_mut(key) {
                    merge_json_value(base_value, overlay_value);
                } else {
                    base_obj.insert(key.clone(), overlay_value.clone());
                }
            }
        }
        (base_slot, overlay_value) => {
            *base_slot = overlay_value.clone();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tool_names_round_trip() {
        for name in ToolName::ALL {
            assert_eq!(ToolName::from_api_name(name.as_api_name()), Some(*name));
        }
    }

    #[test]
    fn todowrite_is_an_alias_of_todo_write() {
        assert_eq!(ToolName::from_api_name("todowrite"), Some(ToolName::TodoWrite));
        assert_eq!(ToolName::from_api_name("todo_write"), Some(ToolName::TodoWrite));
    }

    #[test]
    fn unknown_tool_name_is_none() {
        assert_eq!(ToolName::from_api_name("frobnicate"), None);
        assert_eq!(ToolName::from_api_name("READ_FILE"), None);
    }

    #[test]
    fn read_only_set_excludes_mutating_tools() {
        assert!(ToolName::ReadFile.is_read_only());
        assert!(ToolName::McpReadResource.is_read_only());
        assert!(!ToolName::Shell.is_read_only());
        assert!(!ToolName::WriteFile.is_read_only());
        assert!(!ToolName::TodoWrite.is_read_only());
        assert!(ToolName::TodoWrite.is_session_local());
    }

    #[test]
    fn cancel_token_is_idempotent_and_resettable() {
        let token = CancelToken::new();
        assert!(token.check().is_ok());
        token.request_abort();
        token.request_abort();
        let err = token.check().expect_err("fired token must error");
        assert!(is_abort_error(&err));

        let clone = token.clone();
        token.reset();
        assert!(clone.check().is_ok());
    }

    #[test]
    fn plan_clamp_enforces_bounds() {
        let plan = Plan {
            summary: "s".to_string(),
            steps: (0..20).map(|i| format!("step {i}")).collect(),
            tool_budget: 99,
        }
        .clamped();
        assert_eq!(plan.steps.len(), PLAN_MAX_STEPS);
        assert_eq!(plan.tool_budget, TOOL_BUDGET_MAX);

        let low = Plan {
            summary: "s".to_string(),
            steps: vec![],
            tool_budget: 0,
        }
        .clamped();
        assert_eq!(low.tool_budget, TOOL_BUDGET_MIN);
    }

    #[test]
    fn chat_message_serializes_with_role_tag() {
        let msg = ChatMessage::Assistant {
            content: Some("hi".to_string()),
            reasoning_content: None,
            tool_calls: vec![LlmToolCall {
                id: "call_1".to_string(),
                name: "read_file".to_string(),
                arguments: "{\"path\":\"a.rs\"}".to_string(),
            }],
        };
        let value = serde_json::to_value(&msg).expect("serialize");
        assert_eq!(value["role"], "assistant");
        assert_eq!(value["tool_calls"][0]["name"], "read_file");

        let back: ChatMessage = serde_json::from_value(value).expect("deserialize");
        assert_eq!(back, msg);
    }

    #[test]
    fn message_deserializes_without_optional_fields() {
        let raw = r#"{"role":"user","content":"hello"}"#;
        let msg: Message = serde_json::from_str(raw).expect("deserialize");
        assert_eq!(msg.role, Role::User);
        assert!(msg.tool_call.is_none());
        assert!(msg.tool_result.is_none());
        assert!(!msg.summary);
    }

    #[test]
    fn event_kind_uses_versioned_tag_and_payload() {
        let kind = EventKind::TurnFinishedV1 {
            finish_reason: "final".to_string(),
            iterations: 3,
            tool_calls: 2,
        };
        let value = serde_json::to_value(&kind).expect("serialize");
        assert_eq!(value["type"], "TurnFinishedV1");
        assert_eq!(value["payload"]["iterations"], 3);
    }

    #[test]
    fn config_layers_merge_recursively() {
        let dir = tempfile::tempdir().expect("tempdir");
        let workspace = dir.path();
        fs::create_dir_all(runtime_dir(workspace)).expect("runtime dir");
        fs::write(
            AppConfig::project_settings_path(workspace),
            r#"{"llm": {"model": "project-model"}, "agent": {"max_iterations": 7}}"#,
        )
        .expect("project settings");
        fs::write(
            AppConfig::project_local_settings_path(workspace),
            r#"{"agent": {"max_iterations": 9}}"#,
        )
        .expect("local settings");

        let cfg = AppConfig::load(workspace).expect("load");
        assert_eq!(cfg.llm.model, "project-model");
        assert_eq!(cfg.agent.max_iterations, 9);
        // Untouched keys keep their defaults.
        assert_eq!(cfg.agent.preserve_recent, 12);
        assert_eq!(cfg.llm.max_retries, 3);
    }

    #[test]
    fn usage_accumulates_saturating() {
        let mut usage = TokenUsage {
            input_tokens: 10,
            output_tokens: 5,
        };
        usage.add(&TokenUsage {
            input_tokens: 3,
            output_tokens: u64::MAX,
        });
        assert_eq!(usage.input_tokens, 13);
        assert_eq!(usage.output_tokens, u64::MAX);
    }
}

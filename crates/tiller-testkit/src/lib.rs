//! Scripted test doubles for driving the agent loop end to end without a
//! network or a real toolset, plus a smoke helper over the public
//! [`Agent`] API.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use anyhow::anyhow;
use serde_json::{Value, json};
use tiller_agent::Agent;
use tiller_core::{
    AppConfig, ApprovedToolCall, CancelToken, ChatRequest, FunctionDefinition, LlmResponse,
    LlmToolCall, Result, StreamCallback, TokenUsage, ToolCall, ToolDefinition, ToolHost,
    ToolProposal, ToolResult,
};
use tiller_llm::Provider;
use uuid::Uuid;

/// Replays canned responses in order and records every request it saw.
pub struct ScriptedProvider {
    responses: Mutex<VecDeque<LlmResponse>>,
    requests: Mutex<Vec<ChatRequest>>,
}

impl ScriptedProvider {
    pub fn new(responses: Vec<LlmResponse>) -> Self {
        Self {
            responses: Mutex::new(VecDeque::from(responses)),
            requests: Mutex::new(Vec::new()),
        }
    }

    pub fn requests(&self) -> Vec<ChatRequest> {
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
            .ok_or_else(|| anyhow!("scripted provider ran out of responses"))
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

/// Replays canned `(success, output)` tool results and records the tool
/// names it executed. Approves everything.
pub struct ScriptedToolHost {
    outputs: Mutex<VecDeque<(bool, Value)>>,
    executed: Mutex<Vec<String>>,
}

impl ScriptedToolHost {
    pub fn new(outputs: Vec<(bool, Value)>) -> Self {
        Self {
            outputs: Mutex::new(VecDeque::from(outputs)),
            executed: Mutex::new(Vec::new()),
        }
    }

    pub fn executed(&self) -> Vec<String> {
        self.executed.lock().expect("executed lock").clone()
    }
}

impl ToolHost for ScriptedToolHost {
    fn propose(&self, call: ToolCall) -> ToolProposal {
        ToolProposal {
            invocation_id: Uuid::now_v7(),
            call,
            approved: true,
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

/// A native-mode tool-call response carrying a single call.
pub fn make_tool_response(id: &str, name: &str, args: Value) -> LlmResponse {
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

/// Minimal schemas for the core tools, enough for loop tests that never
/// execute anything real.
pub fn stub_tool_definitions() -> Vec<ToolDefinition> {
    ["shell", "list_files", "read_file", "write_file", "todo_write"]
        .iter()
        .map(|name| ToolDefinition {
            tool_type: "function".to_string(),
            function: FunctionDefinition {
                name: (*name).to_string(),
                description: format!("stub {name}"),
                parameters: json!({"type": "object", "properties": {}}),
            },
        })
        .collect()
}

/// Drive one whole turn through the public [`Agent`] API with scripted
/// doubles. Returns the final text and the tools that actually executed.
pub fn run_scripted_turn(
    responses: Vec<LlmResponse>,
    outputs: Vec<(bool, Value)>,
    user_message: &str,
) -> Result<(String, Vec<String>)> {
    let provider = Arc::new(ScriptedProvider::new(responses));
    let host = Arc::new(ScriptedToolHost::new(outputs));
    let workspace = tempfile::tempdir()?;

    let mut cfg = AppConfig::default();
    cfg.agent.pre_plan = false;

    let mut agent = Agent::new(
        provider,
        host.clone(),
        cfg,
        workspace.path(),
        stub_tool_definitions(),
    );
    let final_text = agent.run_turn(user_message)?;
    Ok((final_text, host.executed()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn scripted_tool_turn_smoke() {
        let (final_text, executed) = run_scripted_turn(
            vec![
                make_tool_response("call_1", "list_files", json!({"dir": "."})),
                LlmResponse::text_only("two entries at the top level"),
            ],
            vec![(true, json!({"entries": ["src", "Cargo.toml"]}))],
            "what is in this project?",
        )
        .expect("scripted turn");

        assert_eq!(final_text, "two entries at the top level");
        assert_eq!(executed, vec!["list_files".to_string()]);
    }

    #[test]
    fn scripted_text_turn_smoke() {
        let (final_text, executed) =
            run_scripted_turn(vec![LlmResponse::text_only("Hello!")], vec![], "Hi")
                .expect("scripted turn");

        assert_eq!(final_text, "Hello!");
        assert!(executed.is_empty());
    }
}

mod shell;

use anyhow::{Result, anyhow};
use ignore::WalkBuilder;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use sha2::Digest;
pub use shell::{PlatformShellRunner, ShellRunResult, ShellRunner};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tiller_core::{
    ApprovalConfig, ApprovedToolCall, CancelToken, FunctionDefinition, ToolCall, ToolDefinition,
    ToolHost, ToolName, ToolProposal, ToolResult,
};
use tiller_mcp::McpHub;
use uuid::Uuid;

const DEFAULT_TIMEOUT_SECONDS: u64 = 120;
const READ_MAX_BYTES_DEFAULT: usize = 1_000_000;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TodoStatus {
    Pending,
    InProgress,
    Completed,
}

fn default_todo_status() -> TodoStatus {
    TodoStatus::Pending
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TodoItem {
    pub content: String,
    #[serde(default = "default_todo_status")]
    pub status: TodoStatus,
}

/// Workspace-local tool dispatcher. Failures come back as `success: false`
/// with an `error` field; only the shell runner observes the cancel token,
/// and a fired token is reported by the turn loop, not from here.
pub struct LocalToolHost {
    workspace: PathBuf,
    approvals: ApprovalConfig,
    runner: Arc<dyn ShellRunner + Send + Sync>,
    hub: McpHub,
    todos: Mutex<Vec<TodoItem>>,
}

impl LocalToolHost {
    pub fn new(workspace: &Path, approvals: ApprovalConfig) -> Result<Self> {
        Self::with_runner(workspace, approvals, Arc::new(PlatformShellRunner))
    }

    pub fn with_runner(
        workspace: &Path,
        approvals: ApprovalConfig,
        runner: Arc<dyn ShellRunner + Send + Sync>,
    ) -> Result<Self> {
        Ok(Self {
            workspace: workspace.to_path_buf(),
            approvals,
            runner,
            hub: McpHub::new(workspace)?,
            todos: Mutex::new(Vec::new()),
        })
    }

    pub fn hub(&self) -> &McpHub {
        &self.hub
    }

    /// Current todo list, rendered for display.
    pub fn todos_rendered(&self) -> String {
        render_todos(&self.todos.lock().expect("todos lock"))
    }

    fn run_tool(&self, call: &ToolCall, cancel: &CancelToken) -> Result<Value> {
        let Some(name) = ToolName::from_api_name(&call.name) else {
            return Err(anyhow!("unknown tool: {}", call.name));
        };
        match name {
            ToolName::ListFiles => {
                let dir = call.args.get("dir").and_then(|v| v.as_str()).unwrap_or(".");
                let path = self.workspace.join(dir);
                let mut out = Vec::new();
                for entry in fs::read_dir(path)? {
                    let e = entry?;
                    out.push(e.file_name().to_string_lossy().to_string());
                }
                out.sort();
                Ok(json!({"entries": out}))
            }
            ToolName::ReadFile => {
                let path = call
                    .args
                    .get("path")
                    .and_then(|v| v.as_str())
                    .ok_or_else(|| anyhow!("path missing"))?;
                let full = self.workspace.join(path);
                let bytes = fs::read(&full)?;
                let sha = format!("{:x}", sha2::Sha256::digest(&bytes));
                let mime = guess_mime(&full);
                let max_bytes = call
                    .args
                    .get("max_bytes")
                    .and_then(|v| v.as_u64())
                    .map(|v| v as usize)
                    .unwrap_or(READ_MAX_BYTES_DEFAULT);
                let start_line = call
                    .args
                    .get("start_line")
                    .and_then(|v| v.as_u64())
                    .map(|v| v as usize);
                let end_line = call
                    .args
                    .get("end_line")
                    .and_then(|v| v.as_u64())
                    .map(|v| v as usize);

                if is_binary(&bytes) {
                    return Ok(json!({
                        "path": path,
                        "mime": mime,
                        "binary": true,
                        "size_bytes": bytes.len(),
                        "sha256": sha
                    }));
                }

                let truncated = if bytes.len() > max_bytes {
                    bytes[..max_bytes].to_vec()
                } else {
                    bytes.clone()
                };
                let content = String::from_utf8(truncated)?;
                let lines = collect_lines(&content, start_line, end_line);
                Ok(json!({
                    "path": path,
                    "mime": mime,
                    "binary": false,
                    "size_bytes": bytes.len(),
                    "truncated": bytes.len() > max_bytes,
                    "sha256": sha,
                    "content": content,
                    "lines": lines
                }))
            }
            ToolName::Glob => {
                let pattern = call
                    .args
                    .get("pattern")
                    .and_then(|v| v.as_str())
                    .ok_or_else(|| anyhow!("pattern missing"))?;
                let limit = call
                    .args
                    .get("limit")
                    .and_then(|v| v.as_u64())
                    .unwrap_or(200) as usize;
                let respect_gitignore = call
                    .args
                    .get("respectGitignore")
                    .and_then(|v| v.as_bool())
                    .unwrap_or(true);
                let base = call
                    .args
                    .get("base")
                    .and_then(|v| v.as_str())
                    .unwrap_or(".");
                let base_path = self.workspace.join(base);
                let compiled = glob::Pattern::new(pattern)
                    .map_err(|err| anyhow!("invalid glob pattern '{pattern}': {err}"))?;
                let mut matches = Vec::new();
                for path in walk_paths(&base_path, &self.workspace, respect_gitignore) {
                    let rel_path = match path.strip_prefix(&self.workspace) {
                        Ok(rel) => rel,
                        Err(_) => continue,
                    };
                    let rel = normalize_rel_path(rel_path);
                    if compiled.matches(&rel) {
                        matches.push(json!({
                            "path": rel,
                            "is_dir": path.is_dir()
                        }));
                        if matches.len() >= limit {
                            break;
                        }
                    }
                }
                Ok(json!({
                    "pattern": pattern,
                    "matches": matches
                }))
            }
            ToolName::SearchFiles => {
                let pattern = call
                    .args
                    .get("pattern")
                    .and_then(|v| v.as_str())
                    .ok_or_else(|| anyhow!("pattern missing"))?;
                let limit = call
                    .args
                    .get("limit")
                    .and_then(|v| v.as_u64())
                    .unwrap_or(200) as usize;
                let glob_pattern = call
                    .args
                    .get("glob")
                    .and_then(|v| v.as_str())
                    .unwrap_or("**/*");
                let respect_gitignore = call
                    .args
                    .get("respectGitignore")
                    .and_then(|v| v.as_bool())
                    .unwrap_or(true);
                let case_sensitive = call
                    .args
                    .get("case_sensitive")
                    .and_then(|v| v.as_bool())
                    .unwrap_or(true);
                let compiled_glob = glob::Pattern::new(glob_pattern)
                    .map_err(|err| anyhow!("invalid glob pattern '{glob_pattern}': {err}"))?;
                let regex = regex::RegexBuilder::new(pattern)
                    .case_insensitive(!case_sensitive)
                    .build()?;
                let mut matches = Vec::new();
                for path in walk_paths(&self.workspace, &self.workspace, respect_gitignore) {
                    if !path.is_file() {
                        continue;
                    }
                    let rel_path = match path.strip_prefix(&self.workspace) {
                        Ok(rel) => rel,
                        Err(_) => continue,
                    };
                    let rel = normalize_rel_path(rel_path);
                    if !compiled_glob.matches(&rel) {
                        continue;
                    }
                    let bytes = match fs::read(&path) {
                        Ok(bytes) => bytes,
                        Err(_) => continue,
                    };
                    if is_binary(&bytes) {
                        continue;
                    }
                    let content = match String::from_utf8(bytes) {
                        Ok(content) => content,
                        Err(_) => continue,
                    };
                    for (idx, line) in content.lines().enumerate() {
                        if regex.is_match(line) {
                            matches.push(json!({
                                "path": rel,
                                "line": idx + 1,
                                "text": line
                            }));
                            if matches.len() >= limit {
                                return Ok(json!({
                                    "pattern": pattern,
                                    "glob": glob_pattern,
                                    "matches": matches
                                }));
                            }
                        }
                    }
                }
                Ok(json!({
                    "pattern": pattern,
                    "glob": glob_pattern,
                    "matches": matches
                }))
            }
            ToolName::EditFile => {
                let path = call
                    .args
                    .get("path")
                    .and_then(|v| v.as_str())
                    .ok_or_else(|| anyhow!("path missing"))?;
                let full = self.workspace.join(path);
                let before = fs::read_to_string(&full)?;
                let mut after = before.clone();
                let mut replacements = 0usize;

                if let Some(edits) = call.args.get("edits").and_then(|v| v.as_array()) {
                    for edit in edits {
                        replacements += apply_single_edit(&mut after, edit)?;
                    }
                } else {
                    replacements += apply_single_edit(&mut after, &call.args)?;
                }

                if after == before {
                    return Ok(json!({
                        "path": path,
                        "edited": false,
                        "replacements": 0
                    }));
                }

                fs::write(&full, &after)?;
                let before_sha = format!("{:x}", sha2::Sha256::digest(before.as_bytes()));
                let after_sha = format!("{:x}", sha2::Sha256::digest(after.as_bytes()));
                Ok(json!({
                    "path": path,
                    "edited": true,
                    "replacements": replacements,
                    "before_sha256": before_sha,
                    "after_sha256": after_sha
                }))
            }
            ToolName::WriteFile => {
                let path = call
                    .args
                    .get("path")
                    .and_then(|v| v.as_str())
                    .ok_or_else(|| anyhow!("path missing"))?;
                let content = call
                    .args
                    .get("content")
                    .and_then(|v| v.as_str())
                    .ok_or_else(|| anyhow!("content missing"))?;
                let full = self.workspace.join(path);
                if let Some(parent) = full.parent() {
                    fs::create_dir_all(parent)?;
                }
                fs::write(full, content)?;
                Ok(json!({
                    "written": true,
                    "path": path,
                    "bytes": content.len()
                }))
            }
            ToolName::Shell => {
                let cmd = call
                    .args
                    .get("cmd")
                    .and_then(|v| v.as_str())
                    .ok_or_else(|| anyhow!("cmd missing"))?;
                let timeout = call
                    .args
                    .get("timeout")
                    .and_then(|v| v.as_u64())
                    .unwrap_or(DEFAULT_TIMEOUT_SECONDS);
                self.run_cmd(cmd, timeout, cancel)
            }
            ToolName::TodoWrite => self.write_todos(&call.args),
            ToolName::McpListTools => {
                let server = call.args.get("server").and_then(|v| v.as_str());
                Ok(serde_json::to_value(self.hub.list_tools(server)?)?)
            }
            ToolName::McpListResources => {
                let server = call.args.get("server").and_then(|v| v.as_str());
                Ok(serde_json::to_value(self.hub.list_resources(server)?)?)
            }
            ToolName::McpListResourceTemplates => {
                let server = call.args.get("server").and_then(|v| v.as_str());
                Ok(serde_json::to_value(self.hub.list_resource_templates(server)?)?)
            }
            ToolName::McpReadResource => {
                let server = call
                    .args
                    .get("server")
                    .and_then(|v| v.as_str())
                    .ok_or_else(|| anyhow!("server missing"))?;
                let uri = call
                    .args
                    .get("uri")
                    .and_then(|v| v.as_str())
                    .ok_or_else(|| anyhow!("uri missing"))?;
                Ok(json!({"contents": self.hub.read_resource(server, uri)?}))
            }
            ToolName::McpCallTool => {
                let server = call
                    .args
                    .get("server")
                    .and_then(|v| v.as_str())
                    .ok_or_else(|| anyhow!("server missing"))?;
                let tool = call
                    .args
                    .get("tool")
                    .and_then(|v| v.as_str())
                    .ok_or_else(|| anyhow!("tool missing"))?;
                let input = call.args.get("input").cloned().unwrap_or_else(|| json!({}));
                Ok(json!({"result": self.hub.call_tool(server, tool, input)?}))
            }
        }
    }

    fn run_cmd(&self, cmd: &str, timeout_secs: u64, cancel: &CancelToken) -> Result<Value> {
        let result = self.runner.run(
            cmd,
            &self.workspace,
            Duration::from_secs(timeout_secs),
            cancel,
        )?;
        Ok(json!({
            "status": result.status,
            "stdout": result.stdout,
            "stderr": result.stderr,
            "timed_out": result.timed_out,
        }))
    }

    fn write_todos(&self, args: &Value) -> Result<Value> {
        let items: Vec<TodoItem> = match args.get("todos") {
            Some(value) => serde_json::from_value(value.clone())?,
            None => return Err(anyhow!("todos missing")),
        };
        let mut todos = self.todos.lock().expect("todos lock");
        let changed = *todos != items;
        *todos = items;
        Ok(json!({
            "changed": changed,
            "count": todos.len(),
            "rendered": render_todos(&todos),
        }))
    }
}

impl ToolHost for LocalToolHost {
    fn propose(&self, call: ToolCall) -> ToolProposal {
        let auto = self.approvals.mode == "auto"
            || ToolName::from_api_name(&call.name).is_some_and(|name| {
                name.is_session_local() || (self.approvals.allow_read_only && name.is_read_only())
            });
        ToolProposal {
            invocation_id: Uuid::now_v7(),
            approved: auto,
            call,
        }
    }

    fn execute(&self, approved: ApprovedToolCall, cancel: &CancelToken) -> ToolResult {
        let call = approved.call;
        let (success, output) = match self.run_tool(&call, cancel) {
            Ok(output) => (true, output),
            Err(err) => (false, json!({"error": err.to_string()})),
        };
        ToolResult {
            invocation_id: approved.invocation_id,
            success,
            output,
        }
    }
}

fn should_skip_rel_path(path: &Path) -> bool {
    path.components().any(|c| {
        c.as_os_str() == ".git" || c.as_os_str() == ".tiller" || c.as_os_str() == "target"
    })
}

fn walk_paths(root: &Path, workspace: &Path, respect_gitignore: bool) -> Vec<PathBuf> {
    let mut builder = WalkBuilder::new(root);
    builder.hidden(false);
    builder.follow_links(false);
    builder.parents(respect_gitignore);
    builder.git_ignore(respect_gitignore);
    builder.git_global(respect_gitignore);
    builder.git_exclude(respect_gitignore);
    builder.require_git(false);

    let mut paths = Vec::new();
    for entry in builder.build() {
        let Ok(entry) = entry else {
            continue;
        };
        let path = entry.path();
        let Ok(rel) = path.strip_prefix(workspace) else {
            continue;
        };
        if should_skip_rel_path(rel) {
            continue;
        }
        paths.push(path.to_path_buf());
    }
    paths
}

fn normalize_rel_path(path: &Path) -> String {
    path.to_string_lossy().replace('\\', "/")
}

fn is_binary(bytes: &[u8]) -> bool {
    if bytes.is_empty() {
        return false;
    }
    if bytes.contains(&0) {
        return true;
    }
    let sample = bytes.iter().take(8192);
    let non_text = sample
        .filter(|b| !(b.is_ascii() || **b == b'\n' || **b == b'\r' || **b == b'\t'))
        .count();
    non_text > 64
}

fn guess_mime(path: &Path) -> &'static str {
    match path
        .extension()
        .and_then(|ext| ext.to_str())
        .unwrap_or_default()
        .to_ascii_lowercase()
        .as_str()
    {
        "md" => "text/markdown",
        "txt" | "log" | "rs" | "toml" | "json" | "yaml" | "yml" | "js" | "ts" | "tsx" | "jsx"
        | "py" | "go" | "java" | "c" | "h" | "cpp" | "hpp" | "cs" | "sh" | "ps1" => "text/plain",
        "pdf" => "application/pdf",
        "png" => "image/png",
        "jpg" | "jpeg" => "image/jpeg",
        "gif" => "image/gif",
        "webp" => "image/webp",
        "svg" => "image/svg+xml",
        _ => "application/octet-stream",
    }
}

fn collect_lines(content: &str, start_line: Option<usize>, end_line: Option<usize>) -> Vec<Value> {
    let start = start_line.unwrap_or(1).max(1);
    let end = end_line.unwrap_or(usize::MAX).max(start);
    content
        .lines()
        .enumerate()
        .filter_map(|(idx, text)| {
            let line = idx + 1;
            if line < start || line > end {
                return None;
            }
            Some(json!({
                "line": line,
                "text": text
            }))
        })
        .collect()
}

fn apply_single_edit(content: &mut String, edit: &Value) -> Result<usize> {
    if let (Some(search), Some(replace)) = (
        edit.get("search").and_then(|v| v.as_str()),
        edit.get("replace").and_then(|v| v.as_str()),
    ) {
        let replace_all = edit.get("all").and_then(|v| v.as_bool()).unwrap_or(true);
        if replace_all {
            let count = content.matches(search).count();
            if count == 0 {
                return Err(anyhow!("search pattern not found: {search}"));
            }
            *content = content.replace(search, replace);
            return Ok(count);
        }
        if let Some(pos) = content.find(search) {
            content.replace_range(pos..pos + search.len(), replace);
            return Ok(1);
        }
        return Err(anyhow!("search pattern not found: {search}"));
    }

    if let (Some(start_line), Some(end_line), Some(replacement)) = (
        edit.get("start_line").and_then(|v| v.as_u64()),
        edit.get("end_line").and_then(|v| v.as_u64()),
        edit.get("replacement").and_then(|v| v.as_str()),
    ) {
        let start = start_line as usize;
        let end = end_line as usize;
        if start == 0 || end < start {
            return Err(anyhow!(
                "invalid line range: start_line={start_line} end_line={end_line}"
            ));
        }

        let had_trailing_newline = content.ends_with('\n');
        let mut lines = content.lines().map(ToString::to_string).collect::<Vec<_>>();
        if end > lines.len() {
            return Err(anyhow!(
                "line range out of bounds: end_line={end_line} file_lines={}",
                lines.len()
            ));
        }
        let replacement_lines = replacement
            .split('\n')
            .map(ToString::to_string)
            .collect::<Vec<_>>();
        lines.splice((start - 1)..end, replacement_lines);
        *content = lines.join("\n");
        if had_trailing_newline {
            content.push('\n');
        }
        return Ok(1);
    }

    Err(anyhow!(
        "edit requires either search+replace or start_line+end_line+replacement"
    ))
}

fn render_todos(todos: &[TodoItem]) -> String {
    if todos.is_empty() {
        return "(no todos)".to_string();
    }
    todos
        .iter()
        .map(|todo| {
            let mark = match todo.status {
                TodoStatus::Pending => " ",
                TodoStatus::InProgress => ">",
                TodoStatus::Completed => "x",
            };
            format!("[{mark}] {}", todo.content)
        })
        .collect::<Vec<_>>()
        .join("\n")
}

fn function_def(name: ToolName, description: &str, parameters: Value) -> ToolDefinition {
    ToolDefinition {
        tool_type: "function".to_string(),
        function: FunctionDefinition {
            name: name.as_api_name().to_string(),
            description: description.to_string(),
            parameters,
        },
    }
}

/// Function-calling definitions for the built-in registry. MCP bridge tools
/// are only offered when at least one server is configured.
pub fn tool_definitions(include_mcp: bool) -> Vec<ToolDefinition> {
    let mut defs = vec![
        function_def(
            ToolName::Shell,
            "Run a shell command in the workspace and return stdout, stderr and exit status.",
            json!({"type": "object", "properties": {
                "cmd": {"type": "string", "description": "Command line to execute"},
                "timeout": {"type": "integer", "description": "Timeout in seconds (default 120)"}
            }, "required": ["cmd"]}),
        ),
        function_def(
            ToolName::ReadFile,
            "Read a file, optionally restricted to a line range.",
            json!({"type": "object", "properties": {
                "path": {"type": "string"},
                "start_line": {"type": "integer"},
                "end_line": {"type": "integer"},
                "max_bytes": {"type": "integer"}
            }, "required": ["path"]}),
        ),
        function_def(
            ToolName::WriteFile,
            "Create or overwrite a file with the given content.",
            json!({"type": "object", "properties": {
                "path": {"type": "string"},
                "content": {"type": "string"}
            }, "required": ["path", "content"]}),
        ),
        function_def(
            ToolName::EditFile,
            "Edit a file by search/replace or by replacing a line range.",
            json!({"type": "object", "properties": {
                "path": {"type": "string"},
                "search": {"type": "string"},
                "replace": {"type": "string"},
                "all": {"type": "boolean", "description": "Replace every occurrence (default true)"},
                "start_line": {"type": "integer"},
                "end_line": {"type": "integer"},
                "replacement": {"type": "string"},
                "edits": {"type": "array", "items": {"type": "object"}}
            }, "required": ["path"]}),
        ),
        function_def(
            ToolName::ListFiles,
            "List the entries of a directory (non-recursive).",
            json!({"type": "object", "properties": {
                "dir": {"type": "string", "description": "Directory relative to the workspace (default .)"}
            }}),
        ),
        function_def(
            ToolName::SearchFiles,
            "Search file contents with a regular expression.",
            json!({"type": "object", "properties": {
                "pattern": {"type": "string", "description": "Regular expression"},
                "glob": {"type": "string", "description": "Restrict to paths matching this glob"},
                "limit": {"type": "integer"},
                "case_sensitive": {"type": "boolean"}
            }, "required": ["pattern"]}),
        ),
        function_def(
            ToolName::Glob,
            "Find files whose path matches a glob pattern.",
            json!({"type": "object", "properties": {
                "pattern": {"type": "string"},
                "base": {"type": "string"},
                "limit": {"type": "integer"}
            }, "required": ["pattern"]}),
        ),
        function_def(
            ToolName::TodoWrite,
            "Replace the session todo list. Each item has content and a status of pending, in_progress or completed.",
            json!({"type": "object", "properties": {
                "todos": {"type": "array", "items": {"type": "object", "properties": {
                    "content": {"type": "string"},
                    "status": {"type": "string", "enum": ["pending", "in_progress", "completed"]}
                }, "required": ["content"]}}
            }, "required": ["todos"]}),
        ),
    ];

    if include_mcp {
        defs.push(function_def(
            ToolName::McpListTools,
            "List tools exposed by the configured MCP servers.",
            json!({"type": "object", "properties": {
                "server": {"type": "string", "description": "Restrict to one server id"}
            }}),
        ));
        defs.push(function_def(
            ToolName::McpListResources,
            "List resources exposed by the configured MCP servers.",
            json!({"type": "object", "properties": {
                "server": {"type": "string"}
            }}),
        ));
        defs.push(function_def(
            ToolName::McpListResourceTemplates,
            "List resource templates exposed by the configured MCP servers.",
            json!({"type": "object", "properties": {
                "server": {"type": "string"}
            }}),
        ));
        defs.push(function_def(
            ToolName::McpReadResource,
            "Read one resource from an MCP server by uri.",
            json!({"type": "object", "properties": {
                "server": {"type": "string"},
                "uri": {"type": "string"}
            }, "required": ["server", "uri"]}),
        ));
        defs.push(function_def(
            ToolName::McpCallTool,
            "Call a tool on an MCP server.",
            json!({"type": "object", "properties": {
                "server": {"type": "string"},
                "tool": {"type": "string"},
                "input": {"type": "object"}
            }, "required": ["server", "tool"]}),
        ));
    }

    defs
}

use anyhow::{Context, Result, anyhow};
use reqwest::blocking::Client;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use std::collections::HashMap;
use std::collections::hash_map::Entry;
use std::fs;
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};
use std::process::{Child, ChildStdin, ChildStdout, Command, Stdio};
use std::sync::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

const MCP_PROTOCOL_VERSION: &str = "2024-11-05";
const HTTP_TIMEOUT_SECS: u64 = 10;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum McpTransport {
    Stdio,
    Http,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct McpServer {
    pub id: String,
    pub name: String,
    pub transport: McpTransport,
    pub command: Option<String>,
    pub args: Vec<String>,
    pub url: Option<String>,
    pub enabled: bool,
    pub metadata: Value,
}

impl Default for McpServer {
    fn default() -> Self {
        Self {
            id: String::new(),
            name: String::new(),
            transport: McpTransport::Stdio,
            command: None,
            args: Vec::new(),
            url: None,
            enabled: true,
            metadata: Value::Null,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct McpConfig {
    pub servers: Vec<McpServer>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct McpToolRow {
    pub server: String,
    pub name: String,
    pub description: String,
    #[serde(default)]
    pub input_schema: Value,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct McpResourceRow {
    pub server: String,
    pub uri: String,
    pub name: String,
    pub mime_type: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct McpResourceTemplateRow {
    pub server: String,
    pub uri_template: String,
    pub name: String,
    pub description: String,
}

// ---------------------------------------------------------------------------
// JSON-RPC wire types (newline-delimited over stdio, POST body over http)
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JsonRpcRequest {
    pub jsonrpc: String,
    pub id: Value,
    pub method: String,
    #[serde(default)]
    pub params: Value,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JsonRpcResponse {
    pub jsonrpc: String,
    #[serde(default)]
    pub id: Value,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<JsonRpcError>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JsonRpcError {
    pub code: i64,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

impl JsonRpcResponse {
    pub fn success(id: Value, result: Value) -> Self {
        Self {
            jsonrpc: "2.0".to_string(),
            id,
            result: Some(result),
            error: None,
        }
    }

    pub fn error(id: Value, code: i64, message: impl Into<String>) -> Self {
        Self {
            jsonrpc: "2.0".to_string(),
            id,
            result: None,
            error: Some(JsonRpcError {
                code,
                message: message.into(),
                data: None,
            }),
        }
    }
}

// ---------------------------------------------------------------------------
// Stdio client
// ---------------------------------------------------------------------------

/// One spawned MCP server child. Requests and responses are newline-delimited
/// JSON; the child is killed when the hub closes.
struct StdioClient {
    child: Child,
    stdin: ChildStdin,
    reader: BufReader<ChildStdout>,
    next_id: u64,
}

impl StdioClient {
    fn spawn(server: &McpServer) -> Result<Self> {
        let command = server
            .command
            .as_deref()
            .ok_or_else(|| anyhow!("stdio transport requires command"))?;
        let mut child = Command::new(command)
            .args(&server.args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .spawn()
            .with_context(|| format!("failed to spawn MCP server {}", server.id))?;
        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| anyhow!("MCP server {} has no stdin pipe", server.id))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| anyhow!("MCP server {} has no stdout pipe", server.id))?;

        let mut client = Self {
            child,
            stdin,
            reader: BufReader::new(stdout),
            next_id: 0,
        };
        client.request(
            "initialize",
            json!({
                "protocolVersion": MCP_PROTOCOL_VERSION,
                "capabilities": {},
                "clientInfo": {"name": "tiller", "version": env!("CARGO_PKG_VERSION")},
            }),
        )?;
        client.notify("notifications/initialized", json!({}))?;
        Ok(client)
    }

    fn request(&mut self, method: &str, params: Value) -> Result<Value> {
        self.next_id += 1;
        let id = self.next_id;
        let req = JsonRpcRequest {
            jsonrpc: "2.0".to_string(),
            id: json!(id),
            method: method.to_string(),
            params,
        };
        writeln!(self.stdin, "{}", serde_json::to_string(&req)?)?;
        self.stdin.flush()?;

        let mut line = String::new();
        loop {
            line.clear();
            if self.reader.read_line(&mut line)? == 0 {
                return Err(anyhow!("MCP server closed its stdout"));
            }
            let trimmed = line.trim();
            if trimmed.is_empty() {
                continue;
            }
            // Server-initiated notifications and unrelated ids are skipped.
            let resp: JsonRpcResponse = match serde_json::from_str(trimmed) {
                Ok(resp) => resp,
                Err(_) => continue,
            };
            if resp.id != json!(id) {
                continue;
            }
            if let Some(err) = resp.error {
                return Err(anyhow!("MCP error {}: {}", err.code, err.message));
            }
            return Ok(resp.result.unwrap_or(Value::Null));
        }
    }

    fn notify(&mut self, method: &str, params: Value) -> Result<()> {
        let msg = json!({"jsonrpc": "2.0", "method": method, "params": params});
        writeln!(self.stdin, "{}", serde_json::to_string(&msg)?)?;
        self.stdin.flush()?;
        Ok(())
    }

    fn shutdown(mut self) {
        let _ = self.child.kill();
        let _ = self.child.wait();
    }
}

// ---------------------------------------------------------------------------
// Hub
// ---------------------------------------------------------------------------

/// Client-side hub over the configured MCP servers. Stdio children are
/// spawned lazily on first use and live until [`McpHub::close`].
pub struct McpHub {
    workspace: PathBuf,
    clients: Mutex<HashMap<String, StdioClient>>,
    http: Client,
    next_http_id: AtomicU64,
}

impl McpHub {
    pub fn new(workspace: &Path) -> Result<Self> {
        Ok(Self {
            workspace: workspace.to_path_buf(),
            clients: Mutex::new(HashMap::new()),
            http: Client::builder()
                .timeout(Duration::from_secs(HTTP_TIMEOUT_SECS))
                .build()?,
            next_http_id: AtomicU64::new(1),
        })
    }

    pub fn project_config_path(&self) -> PathBuf {
        self.workspace.join(".mcp.json")
    }

    pub fn user_config_path() -> Option<PathBuf> {
        let home = std::env::var("HOME")
            .ok()
            .or_else(|| std::env::var("USERPROFILE").ok())?;
        Some(Path::new(&home).join(".tiller/mcp.json"))
    }

    pub fn user_local_config_path() -> Option<PathBuf> {
        let home = std::env::var("HOME")
            .ok()
            .or_else(|| std::env::var("USERPROFILE").ok())?;
        Some(Path::new(&home).join(".tiller/mcp.local.json"))
    }

    pub fn load_project_config(&self) -> Result<McpConfig> {
        load_config_if_exists(&self.project_config_path())
    }

    pub fn save_project_config(&self, config: &McpConfig) -> Result<()> {
        let path = self.project_config_path();
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(path, serde_json::to_vec_pretty(config)?)?;
        Ok(())
    }

    /// User config, then user-local, then project; sorted and deduplicated
    /// by id with the first occurrence winning.
    pub fn list_servers(&self) -> Result<Vec<McpServer>> {
        let mut merged = Vec::new();
        if let Some(path) = Self::user_config_path() {
            merged.extend(load_config_if_exists(&path)?.servers);
        }
        if let Some(path) = Self::user_local_config_path() {
            merged.extend(load_config_if_exists(&path)?.servers);
        }
        merged.extend(self.load_project_config()?.servers);
        merged.sort_by(|a, b| a.id.cmp(&b.id));
        merged.dedup_by(|a, b| a.id == b.id);
        Ok(merged)
    }

    pub fn has_servers(&self) -> bool {
        self.list_servers()
            .map(|servers| servers.iter().any(|s| s.enabled))
            .unwrap_or(false)
    }

    pub fn server_names(&self) -> Vec<String> {
        self.list_servers()
            .map(|servers| {
                servers
                    .into_iter()
                    .filter(|s| s.enabled)
                    .map(|s| s.id)
                    .collect()
            })
            .unwrap_or_default()
    }

    pub fn list_tools(&self, server: Option<&str>) -> Result<Vec<McpToolRow>> {
        let mut rows = Vec::new();
        for srv in self.enabled_servers(server)? {
            if let Some(declared) = metadata_tool_rows(&srv) {
                rows.extend(declared);
                continue;
            }
            let result = self
                .request(&srv, "tools/list", json!({}))
                .with_context(|| format!("failed to list MCP tools for {}", srv.id))?;
            rows.extend(parse_tool_rows(&srv.id, &result));
        }
        Ok(rows)
    }

    pub fn list_resources(&self, server: Option<&str>) -> Result<Vec<McpResourceRow>> {
        let mut rows = Vec::new();
        for srv in self.enabled_servers(server)? {
            let result = self
                .request(&srv, "resources/list", json!({}))
                .with_context(|| format!("failed to list MCP resources for {}", srv.id))?;
            rows.extend(parse_resource_rows(&srv.id, &result));
        }
        Ok(rows)
    }

    pub fn list_resource_templates(
        &self,
        server: Option<&str>,
    ) -> Result<Vec<McpResourceTemplateRow>> {
        let mut rows = Vec::new();
        for srv in self.enabled_servers(server)? {
            let result = self
                .request(&srv, "resources/templates/list", json!({}))
                .with_context(|| format!("failed to list MCP templates for {}", srv.id))?;
            rows.extend(parse_template_rows(&srv.id, &result));
        }
        Ok(rows)
    }

    pub fn call_tool(&self, server: &str, tool: &str, input: Value) -> Result<String> {
        let srv = self.require_server(server)?;
        let result = self
            .request(&srv, "tools/call", json!({"name": tool, "arguments": input}))
            .with_context(|| format!("MCP tool call {server}/{tool} failed"))?;
        let rendered = render_tool_result(&result);
        if result.get("isError").and_then(|v| v.as_bool()) == Some(true) {
            return Err(anyhow!(rendered));
        }
        Ok(rendered)
    }

    pub fn read_resource(&self, server: &str, uri: &str) -> Result<String> {
        let srv = self.require_server(server)?;
        let result = self
            .request(&srv, "resources/read", json!({"uri": uri}))
            .with_context(|| format!("MCP resource read {server} {uri} failed"))?;
        Ok(render_resource_contents(&result))
    }

    /// Kill every spawned stdio child. Idempotent.
    pub fn close(&self) {
        if let Ok(mut clients) = self.clients.lock() {
            for (_, client) in clients.drain() {
                client.shutdown();
            }
        }
    }

    fn enabled_servers(&self, filter: Option<&str>) -> Result<Vec<McpServer>> {
        let servers: Vec<McpServer> = self
            .list_servers()?
            .into_iter()
            .filter(|s| s.enabled)
            .collect();
        match filter {
            None => Ok(servers),
            Some(name) => {
                let found: Vec<McpServer> =
                    servers.into_iter().filter(|s| s.id == name).collect();
                if found.is_empty() {
                    return Err(anyhow!("unknown MCP server: {name}"));
                }
                Ok(found)
            }
        }
    }

    fn require_server(&self, name: &str) -> Result<McpServer> {
        self.enabled_servers(Some(name))?
            .into_iter()
            .next()
            .ok_or_else(|| anyhow!("unknown MCP server: {name}"))
    }

    fn request(&self, server: &McpServer, method: &str, params: Value) -> Result<Value> {
        match server.transport {
            McpTransport::Http => self.http_request(server, method, params),
            McpTransport::Stdio => self.stdio_request(server, method, params),
        }
    }

    fn http_request(&self, server: &McpServer, method: &str, params: Value) -> Result<Value> {
        let url = server
            .url
            .as_deref()
            .ok_or_else(|| anyhow!("http transport requires url"))?;
        let req = JsonRpcRequest {
            jsonrpc: "2.0".to_string(),
            id: json!(self.next_http_id.fetch_add(1, Ordering::Relaxed)),
            method: method.to_string(),
            params,
        };
        let resp: JsonRpcResponse = self
            .http
            .post(url)
            .json(&req)
            .send()?
            .error_for_status()?
            .json()?;
        if let Some(err) = resp.error {
            return Err(anyhow!("MCP error {}: {}", err.code, err.message));
        }
        Ok(resp.result.unwrap_or(Value::Null))
    }

    fn stdio_request(&self, server: &McpServer, method: &str, params: Value) -> Result<Value> {
        let mut clients = self.clients.lock().expect("clients lock");
        let client = match clients.entry(server.id.clone()) {
            Entry::Occupied(entry) => entry.into_mut(),
            Entry::Vacant(slot) => slot.insert(StdioClient::spawn(server)?),
        };
        let result = client.request(method, params);
        if result.is_err() {
            // A failed exchange leaves the pipe in an unknown state.
            if let Some(broken) = clients.remove(&server.id) {
                broken.shutdown();
            }
        }
        result
    }
}

impl Drop for McpHub {
    fn drop(&mut self) {
        self.close();
    }
}

fn load_config_if_exists(path: &Path) -> Result<McpConfig> {
    if !path.exists() {
        return Ok(McpConfig::default());
    }
    Ok(serde_json::from_str(&fs::read_to_string(path)?)?)
}

/// Servers may declare their tools statically under `metadata.tools`;
/// those are listed without touching the transport.
fn metadata_tool_rows(server: &McpServer) -> Option<Vec<McpToolRow>> {
    let list = server.metadata.get("tools")?.as_array()?;
    let rows: Vec<McpToolRow> = list
        .iter()
        .filter_map(|entry| {
            let name = entry.get("name")?.as_str()?.to_string();
            Some(McpToolRow {
                server: server.id.clone(),
                name,
                description: entry
                    .get("description")
                    .and_then(|v| v.as_str())
                    .unwrap_or_default()
                    .to_string(),
                input_schema: entry.get("inputSchema").cloned().unwrap_or(Value::Null),
            })
        })
        .collect();
    if rows.is_empty() { None } else { Some(rows) }
}

fn parse_tool_rows(server: &str, result: &Value) -> Vec<McpToolRow> {
    result
        .get("tools")
        .and_then(|v| v.as_array())
        .map(|items| {
            items
                .iter()
                .filter_map(|entry| {
                    let name = entry.get("name")?.as_str()?.to_string();
                    Some(McpToolRow {
                        server: server.to_string(),
                        name,
                        description: entry
                            .get("description")
                            .and_then(|v| v.as_str())
                            .unwrap_or_default()
                            .to_string(),
                        input_schema: entry.get("inputSchema").cloned().unwrap_or(Value::Null),
                    })
                })
                .collect()
        })
        .unwrap_or_default()
}

fn parse_resource_rows(server: &str, result: &Value) -> Vec<McpResourceRow> {
    result
        .get("resources")
        .and_then(|v| v.as_array())
        .map(|items| {
            items
                .iter()
                .filter_map(|entry| {
                    let uri = entry.get("uri")?.as_str()?.to_string();
                    Some(McpResourceRow {
                        server: server.to_string(),
                        uri,
                        name: entry
                            .get("name")
                            .and_then(|v| v.as_str())
                            .unwrap_or_default()
                            .to_string(),
                        mime_type: entry
                            .get("mimeType")
                            .and_then(|v| v.as_str())
                            .map(|s| s.to_string()),
                    })
                })
                .collect()
        })
        .unwrap_or_default()
}

fn parse_template_rows(server: &str, result: &Value) -> Vec<McpResourceTemplateRow> {
    result
        .get("resourceTemplates")
        .and_then(|v| v.as_array())
        .map(|items| {
            items
                .iter()
                .filter_map(|entry| {
                    let uri_template = entry.get("uriTemplate")?.as_str()?.to_string();
                    Some(McpResourceTemplateRow {
                        server: server.to_string(),
                        uri_template,
                        name: entry
                            .get("name")
                            .and_then(|v| v.as_str())
                            .unwrap_or_default()
                            .to_string(),
                        description: entry
                            .get("description")
                            .and_then(|v| v.as_str())
                            .unwrap_or_default()
                            .to_string(),
                    })
                })
                .collect()
        })
        .unwrap_or_default()
}

/// Text content items joined, or the raw result when there is none.
fn render_tool_result(result: &Value) -> String {
    if let Some(items) = result.get("content").and_then(|v| v.as_array()) {
        let texts: Vec<&str> = items
            .iter()
            .filter_map(|item| item.get("text").and_then(|v| v.as_str()))
            .collect();
        if !texts.is_empty() {
            return texts.join("\n");
        }
    }
    serde_json::to_string_pretty(result).unwrap_or_else(|_| result.to_string())
}

fn render_resource_contents(result: &Value) -> String {
    if let Some(items) = result.get("contents").and_then(|v| v.as_array()) {
        let texts: Vec<&str> = items
            .iter()
            .filter_map(|item| item.get("text").and_then(|v| v.as_str()))
            .collect();
        if !texts.is_empty() {
            return texts.join("\n");
        }
    }
    serde_json::to_string_pretty(result).unwrap_or_else(|_| result.to_string())
}

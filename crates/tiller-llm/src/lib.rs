//! Provider abstraction and the blocking OpenAI-compatible HTTP client.
//!
//! The client retries transient failures with exponential backoff (honoring
//! `Retry-After`), parses both buffered and SSE-streamed chat completions,
//! and observes the turn's cancel token between suspension points.

use anyhow::anyhow;
use chrono::{DateTime, NaiveDateTime, Utc};
use reqwest::StatusCode;
use reqwest::blocking::Client;
use serde_json::{Value, json};
use std::collections::BTreeMap;
use std::io::BufRead;
use std::thread;
use std::time::Duration;
use tiller_core::{
    CancelToken, ChatMessage, ChatRequest, LlmConfig, LlmResponse, LlmToolCall, Result,
    StreamCallback, StreamChunk, TokenUsage,
};

const RETRY_AFTER: &str = "retry-after";
/// Transport failures back off from a full second; HTTP-status retries use
/// the configured base.
const NETWORK_RETRY_BASE_MS: u64 = 1000;

/// A chat-completion provider. Implementations are synchronous; streaming
/// delivers deltas through the callback and still returns the assembled
/// response.
pub trait Provider: Send + Sync {
    fn kind(&self) -> &str;
    fn model(&self) -> &str;
    fn complete(&self, req: &ChatRequest, cancel: &CancelToken) -> Result<LlmResponse>;
    fn complete_streaming(
        &self,
        req: &ChatRequest,
        cancel: &CancelToken,
        cb: StreamCallback,
    ) -> Result<LlmResponse>;
}

/// OpenAI-compatible chat completions over blocking reqwest.
pub struct HttpProvider {
    cfg: LlmConfig,
    client: Client,
}

impl HttpProvider {
    pub fn new(cfg: LlmConfig) -> Result<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(cfg.timeout_seconds.max(1)))
            .build()?;
        Ok(Self { cfg, client })
    }

    pub fn config(&self) -> &LlmConfig {
        &self.cfg
    }

    fn api_key(&self) -> Result<String> {
        std::env::var(&self.cfg.api_key_env).map_err(|_| {
            anyhow!(
                "missing API key: set the {} environment variable",
                self.cfg.api_key_env
            )
        })
    }

    fn complete_inner(&self, req: &ChatRequest, cancel: &CancelToken) -> Result<LlmResponse> {
        let api_key = self.api_key()?;
        let payload = build_chat_payload(req, false);

        let mut last_err: Option<anyhow::Error> = None;
        let mut attempt: u8 = 0;
        while attempt <= self.cfg.max_retries {
            cancel.check()?;
            let response = self
                .client
                .post(&self.cfg.endpoint)
                .bearer_auth(&api_key)
                .json(&payload)
                .send();
            cancel.check()?;

            match response {
                Ok(resp) => {
                    let status = resp.status();
                    let retry_after = parse_retry_after_seconds(resp.headers().get(RETRY_AFTER));
                    let body = resp.text()?;
                    if status.is_success() {
                        return parse_chat_payload(&body);
                    }
                    last_err = Some(format_api_error(
                        status,
                        &body,
                        attempt,
                        self.cfg.max_retries,
                        &self.cfg.api_key_env,
                    ));
                    if should_retry_status(status) && attempt < self.cfg.max_retries {
                        thread::sleep(retry_delay_ms(self.cfg.retry_base_ms, attempt, retry_after));
                        attempt = attempt.saturating_add(1);
                        continue;
                    }
                    break;
                }
                Err(e) => {
                    last_err = Some(format_transport_error(&e));
                    if should_retry_transport_error(&e) && attempt < self.cfg.max_retries {
                        thread::sleep(retry_delay_ms(NETWORK_RETRY_BASE_MS, attempt, None));
                        attempt = attempt.saturating_add(1);
                        continue;
                    }
                    break;
                }
            }
        }

        Err(last_err.unwrap_or_else(|| anyhow!("chat request failed without detailed error")))
    }

    fn complete_streaming_inner(
        &self,
        req: &ChatRequest,
        cancel: &CancelToken,
        cb: StreamCallback,
    ) -> Result<LlmResponse> {
        let api_key = self.api_key()?;
        let payload = build_chat_payload(req, true);

        let mut last_err: Option<anyhow::Error> = None;
        let mut attempt: u8 = 0;
        while attempt <= self.cfg.max_retries {
            cancel.check()?;
            let response = self
                .client
                .post(&self.cfg.endpoint)
                .bearer_auth(&api_key)
                .json(&payload)
                .send();
            cancel.check()?;

            match response {
                Ok(resp) => {
                    let status = resp.status();
                    let retry_after = parse_retry_after_seconds(resp.headers().get(RETRY_AFTER));

                    if status.is_success() {
                        return read_sse_stream(resp, cancel, &cb);
                    }

                    let body = resp.text().unwrap_or_default();
                    last_err = Some(format_api_error(
                        status,
                        &body,
                        attempt,
                        self.cfg.max_retries,
                        &self.cfg.api_key_env,
                    ));
                    if should_retry_status(status) && attempt < self.cfg.max_retries {
                        thread::sleep(retry_delay_ms(self.cfg.retry_base_ms, attempt, retry_after));
                        attempt = attempt.saturating_add(1);
                        continue;
                    }
                    break;
                }
                Err(e) => {
                    last_err = Some(format_transport_error(&e));
                    if should_retry_transport_error(&e) && attempt < self.cfg.max_retries {
                        thread::sleep(retry_delay_ms(NETWORK_RETRY_BASE_MS, attempt, None));
                        attempt = attempt.saturating_add(1);
                        continue;
                    }
                    break;
                }
            }
        }

        Err(last_err.unwrap_or_else(|| anyhow!("streaming chat request failed")))
    }
}

impl Provider for HttpProvider {
    fn kind(&self) -> &str {
        &self.cfg.provider
    }

    fn model(&self) -> &str {
        &self.cfg.model
    }

    fn complete(&self, req: &ChatRequest, cancel: &CancelToken) -> Result<LlmResponse> {
        self.complete_inner(req, cancel)
    }

    fn complete_streaming(
        &self,
        req: &ChatRequest,
        cancel: &CancelToken,
        cb: StreamCallback,
    ) -> Result<LlmResponse> {
        self.complete_streaming_inner(req, cancel, cb)
    }
}

/// Map a [`ChatRequest`] onto the chat-completions JSON body. Assistant tool
/// calls go out as `{id, type: "function", function: {name, arguments}}`;
/// `tools`/`tool_choice` are present only when definitions were supplied.
fn build_chat_payload(req: &ChatRequest, stream: bool) -> Value {
    let messages: Vec<Value> = req
        .messages
        .iter()
        .map(|m| match m {
            ChatMessage::System { content } => json!({"role": "system", "content": content}),
            ChatMessage::User { content } => json!({"role": "user", "content": content}),
            ChatMessage::Assistant {
                content,
                reasoning_content,
                tool_calls,
            } => {
                let mut msg = json!({"role": "assistant"});
                if let Some(c) = content {
                    msg["content"] = json!(c);
                }
                if let Some(rc) = reasoning_content {
                    msg["reasoning_content"] = json!(rc);
                }
                if !tool_calls.is_empty() {
                    let tc: Vec<Value> = tool_calls
                        .iter()
                        .map(|tc| {
                            json!({
                                "id": tc.id,
                                "type": "function",
                                "function": {
                                    "name": tc.name,
                                    "arguments": tc.arguments
                                }
                            })
                        })
                        .collect();
                    msg["tool_calls"] = json!(tc);
                }
                msg
            }
            ChatMessage::Tool {
                tool_call_id,
                content,
            } => json!({"role": "tool", "tool_call_id": tool_call_id, "content": content}),
        })
        .collect();

    let mut payload = json!({
        "model": req.model,
        "messages": messages,
        "max_tokens": req.max_tokens,
        "stream": stream
    });
    if let Some(temp) = req.temperature {
        payload["temperature"] = json!(temp);
    }
    if !req.tools.is_empty() {
        payload["tools"] = serde_json::to_value(&req.tools).unwrap_or(json!([]));
        payload["tool_choice"] = serde_json::to_value(&req.tool_choice).unwrap_or(json!("auto"));
    }
    payload
}

fn read_sse_stream(
    resp: reqwest::blocking::Response,
    cancel: &CancelToken,
    cb: &StreamCallback,
) -> Result<LlmResponse> {
    let mut content_out = String::new();
    let mut reasoning_out = String::new();
    let mut finish_reason: Option<String> = None;
    let mut usage = TokenUsage::default();
    let mut tool_call_parts: BTreeMap<u64, StreamToolCall> = BTreeMap::new();

    let reader = std::io::BufReader::new(resp);
    for line_result in reader.lines() {
        cancel.check()?;
        let line = line_result.map_err(|e| anyhow!("stream read error: {e}"))?;
        let trimmed = line.trim();
        if !trimmed.starts_with("data:") {
            continue;
        }
        let chunk = trimmed.trim_start_matches("data:").trim();
        if chunk == "[DONE]" {
            cb(StreamChunk::Done);
            break;
        }
        let value: Value = match serde_json::from_str(chunk) {
            Ok(v) => v,
            Err(_) => continue,
        };
        if let Some(u) = value.get("usage") {
            usage.add(&parse_usage(u));
        }
        let choice = value
            .get("choices")
            .and_then(|v| v.as_array())
            .and_then(|arr| arr.first());
        let Some(choice) = choice else {
            continue;
        };
        if let Some(reason) = choice.get("finish_reason").and_then(|v| v.as_str()) {
            finish_reason = Some(reason.to_string());
        }
        if let Some(delta) = choice.get("delta") {
            if let Some(content) = delta.get("content").and_then(|v| v.as_str()) {
                content_out.push_str(content);
                cb(StreamChunk::ContentDelta(content.to_string()));
            }
            if let Some(reasoning) = delta.get("reasoning_content").and_then(|v| v.as_str()) {
                reasoning_out.push_str(reasoning);
                cb(StreamChunk::ReasoningDelta(reasoning.to_string()));
            }
            if let Some(tool_calls) = delta.get("tool_calls").and_then(|v| v.as_array()) {
                merge_stream_tool_calls(tool_calls, &mut tool_call_parts);
            }
        }
    }

    let tool_calls: Vec<LlmToolCall> = tool_call_parts
        .into_iter()
        .filter_map(|(index, part)| {
            if part.name.trim().is_empty() {
                return None;
            }
            Some(LlmToolCall {
                id: part
                    .id
                    .unwrap_or_else(|| format!("tool_call_{}", index + 1)),
                name: part.name,
                arguments: part.arguments,
            })
        })
        .collect();

    let text = if !content_out.is_empty() {
        content_out
    } else {
        reasoning_out.clone()
    };

    Ok(LlmResponse {
        text,
        finish_reason: finish_reason.unwrap_or_else(|| "stop".to_string()),
        reasoning_content: reasoning_out,
        tool_calls,
        usage,
    })
}

/// Parse a buffered (non-streaming) chat-completions body.
fn parse_chat_payload(body: &str) -> Result<LlmResponse> {
    let value: Value = serde_json::from_str(body)?;
    let usage = value.get("usage").map(parse_usage).unwrap_or_default();
    let choice = value
        .get("choices")
        .and_then(|v| v.as_array())
        .and_then(|arr| arr.first());
    let Some(choice) = choice else {
        return Err(anyhow!("unexpected chat payload: missing choices[0]"));
    };
    let finish_reason = choice
        .get("finish_reason")
        .and_then(|v| v.as_str())
        .unwrap_or("stop")
        .to_string();
    let message = choice.get("message").cloned().unwrap_or_else(|| json!({}));
    let content = message
        .get("content")
        .and_then(|v| v.as_str())
        .unwrap_or_default()
        .to_string();
    let reasoning_content = message
        .get("reasoning_content")
        .and_then(|v| v.as_str())
        .unwrap_or_default()
        .to_string();
    let tool_calls = message
        .get("tool_calls")
        .map(parse_tool_calls_array)
        .unwrap_or_default();
    if content.is_empty() && reasoning_content.is_empty() && tool_calls.is_empty() {
        return Err(anyhow!(
            "unexpected chat payload: missing message.content/reasoning_content/tool_calls"
        ));
    }
    let text = if content.is_empty() {
        reasoning_content.clone()
    } else {
        content
    };
    Ok(LlmResponse {
        text,
        finish_reason,
        reasoning_content,
        tool_calls,
        usage,
    })
}

fn parse_usage(value: &Value) -> TokenUsage {
    TokenUsage {
        input_tokens: value
            .get("prompt_tokens")
            .and_then(|v| v.as_u64())
            .unwrap_or(0),
        output_tokens: value
            .get("completion_tokens")
            .and_then(|v| v.as_u64())
            .unwrap_or(0),
    }
}

fn parse_tool_calls_array(value: &Value) -> Vec<LlmToolCall> {
    let Some(items) = value.as_array() else {
        return Vec::new();
    };
    items
        .iter()
        .enumerate()
        .filter_map(|(idx, item)| {
            let name = item
                .get("function")
                .and_then(|v| v.get("name"))
                .and_then(|v| v.as_str())
                .unwrap_or_default()
                .to_string();
            if name.trim().is_empty() {
                return None;
            }
            let arguments = item
                .get("function")
                .and_then(|v| v.get("arguments"))
                .and_then(|v| v.as_str())
                .map(ToString::to_string)
                .unwrap_or_else(|| {
                    item.get("function")
                        .and_then(|v| v.get("arguments"))
                        .map(|v| v.to_string())
                        .unwrap_or_else(|| "{}".to_string())
                });
            let id = item
                .get("id")
                .and_then(|v| v.as_str())
                .map(ToString::to_string)
                .unwrap_or_else(|| format!("tool_call_{}", idx + 1));
            Some(LlmToolCall {
                id,
                name,
                arguments,
            })
        })
        .collect()
}

#[derive(Default)]
struct StreamToolCall {
    id: Option<String>,
    name: String,
    arguments: String,
}

/// Streamed tool calls arrive as fragments keyed by `index`; the id and name
/// show up once, the argument string accumulates across deltas.
fn merge_stream_tool_calls(chunks: &[Value], out: &mut BTreeMap<u64, StreamToolCall>) {
    for (idx, item) in chunks.iter().enumerate() {
        let index = item
            .get("index")
            .and_then(|v| v.as_u64())
            .unwrap_or(idx as u64);
        let entry = out.entry(index).or_default();
        if let Some(id) = item.get("id").and_then(|v| v.as_str())
            && !id.trim().is_empty()
        {
            entry.id = Some(id.to_string());
        }
        if let Some(function) = item.get("function") {
            if let Some(name) = function.get("name").and_then(|v| v.as_str())
                && !name.trim().is_empty()
            {
                entry.name = name.to_string();
            }
            if let Some(arguments) = function.get("arguments").and_then(|v| v.as_str()) {
                entry.arguments.push_str(arguments);
            }
        }
    }
}

fn format_api_error(
    status: StatusCode,
    body: &str,
    attempt: u8,
    max_retries: u8,
    api_key_env: &str,
) -> anyhow::Error {
    let detail = serde_json::from_str::<Value>(body)
        .ok()
        .and_then(|v| {
            v.get("error")
                .and_then(|e| e.get("message").or(Some(e)))
                .and_then(|m| m.as_str().map(ToString::to_string))
        })
        .unwrap_or_else(|| body.chars().take(200).collect());

    match status {
        StatusCode::UNAUTHORIZED => anyhow!(
            "Invalid or missing API key (HTTP 401). Set the {api_key_env} environment variable \
             or configure llm.api_key_env in settings."
        ),
        StatusCode::TOO_MANY_REQUESTS => anyhow!(
            "Rate limited (HTTP 429). Exhausted {}/{} retries. Detail: {}",
            attempt + 1,
            max_retries + 1,
            detail
        ),
        StatusCode::INTERNAL_SERVER_ERROR | StatusCode::SERVICE_UNAVAILABLE => anyhow!(
            "Provider server error (HTTP {}). Exhausted {}/{} retries. Detail: {}",
            status.as_u16(),
            attempt + 1,
            max_retries + 1,
            detail
        ),
        _ => anyhow!("Provider API error (HTTP {}): {}", status.as_u16(), detail),
    }
}

fn format_transport_error(err: &reqwest::Error) -> anyhow::Error {
    if err.is_timeout() {
        anyhow!(
            "Request timed out before the provider responded. If this persists, \
             increase llm.timeout_seconds in your settings."
        )
    } else if err.is_connect() {
        anyhow!("Connection failed: could not reach the provider at the configured endpoint.")
    } else {
        anyhow!("Network error: {err}")
    }
}

fn should_retry_status(status: StatusCode) -> bool {
    matches!(
        status,
        StatusCode::TOO_MANY_REQUESTS
            | StatusCode::INTERNAL_SERVER_ERROR
            | StatusCode::SERVICE_UNAVAILABLE
    )
}

fn should_retry_transport_error(err: &reqwest::Error) -> bool {
    err.is_timeout() || err.is_connect() || err.is_request()
}

fn parse_retry_after_seconds(header: Option<&reqwest::header::HeaderValue>) -> Option<u64> {
    let value = header?.to_str().ok()?.trim();
    if let Ok(seconds) = value.parse::<u64>() {
        return Some(seconds);
    }
    parse_retry_after_http_date(value)
}

fn parse_retry_after_http_date(value: &str) -> Option<u64> {
    let retry_at = DateTime::parse_from_rfc2822(value)
        .map(|dt| dt.with_timezone(&Utc))
        .or_else(|_| {
            NaiveDateTime::parse_from_str(value, "%a, %d %b %Y %H:%M:%S GMT")
                .map(|naive| DateTime::<Utc>::from_naive_utc_and_offset(naive, Utc))
        })
        .ok()?;
    let now = Utc::now();
    let delta = retry_at.signed_duration_since(now).num_seconds();
    Some(delta.max(0) as u64)
}

fn retry_delay_ms(base_ms: u64, attempt: u8, retry_after_seconds: Option<u64>) -> Duration {
    if let Some(seconds) = retry_after_seconds {
        return Duration::from_millis(seconds.saturating_mul(1000));
    }
    let exponent = u32::from(attempt);
    let exponential = base_ms.saturating_mul(2_u64.saturating_pow(exponent));
    Duration::from_millis(exponential.max(base_ms.max(100)))
}

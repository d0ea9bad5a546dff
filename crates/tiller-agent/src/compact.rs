//! History compaction: collapse the older prefix of a long conversation into
//! one synthetic summary message, via the provider with a deterministic
//! extractive fallback.

use tiller_core::{
    CancelToken, ChatMessage, ChatRequest, LlmConfig, Message, Result, Role, ToolChoice,
    is_abort_error,
};
use tiller_llm::Provider;

use crate::truncate_chars;

pub const SUMMARY_PREFIX: &str = "[Conversation summary]";

const SUMMARY_SYSTEM_PROMPT: &str = "Summarize the earlier part of this coding-assistant conversation in at most 8 sentences. Keep file paths, command names, decisions, and unresolved questions. Respond with the summary text only.";

/// Per-message cap when rendering the transcript handed to the summarizer.
const TRANSCRIPT_MSG_CHARS: usize = 600;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CompactionReport {
    pub compacted: bool,
    pub before: usize,
    pub after: usize,
}

/// Replace everything but the `preserve_recent` newest messages with a single
/// summary message. Messages that already are summaries are carried into the
/// new summary verbatim, never run through the summarizer again.
pub fn compact_history(
    provider: &dyn Provider,
    llm: &LlmConfig,
    history: &mut Vec<Message>,
    preserve_recent: usize,
    cancel: &CancelToken,
) -> Result<CompactionReport> {
    let before = history.len();
    if before <= preserve_recent {
        return Ok(CompactionReport {
            compacted: false,
            before,
            after: before,
        });
    }

    let split = before - preserve_recent;
    let recent = history.split_off(split);
    let prefix = std::mem::take(history);

    let (old_summaries, fresh): (Vec<&Message>, Vec<&Message>) =
        prefix.iter().partition(|msg| msg.summary);

    let mut parts: Vec<String> = old_summaries
        .iter()
        .map(|msg| msg.content.clone())
        .collect();
    if !fresh.is_empty() {
        let summary = match provider_summary(provider, llm, &fresh, cancel) {
            Ok(text) => text,
            Err(err) if is_abort_error(&err) => {
                // Put the history back together before propagating.
                *history = prefix;
                history.extend(recent);
                return Err(err);
            }
            Err(_) => extractive_summary(&fresh),
        };
        parts.push(format!("{SUMMARY_PREFIX} {summary}"));
    }

    history.push(Message::summary(parts.join("\n")));
    history.extend(recent);

    Ok(CompactionReport {
        compacted: true,
        before,
        after: history.len(),
    })
}

fn provider_summary(
    provider: &dyn Provider,
    llm: &LlmConfig,
    prefix: &[&Message],
    cancel: &CancelToken,
) -> Result<String> {
    let request = ChatRequest {
        model: llm.model.clone(),
        messages: vec![
            ChatMessage::System {
                content: SUMMARY_SYSTEM_PROMPT.to_string(),
            },
            ChatMessage::User {
                content: render_transcript(prefix),
            },
        ],
        tools: Vec::new(),
        tool_choice: ToolChoice::none(),
        max_tokens: llm.max_tokens,
        temperature: llm.temperature,
    };
    let response = provider.complete(&request, cancel)?;
    cancel.check()?;
    let text = response.text.trim().to_string();
    if text.is_empty() {
        return Err(anyhow::anyhow!("empty summary"));
    }
    Ok(text)
}

fn render_transcript(messages: &[&Message]) -> String {
    messages
        .iter()
        .map(|msg| {
            let role = match msg.role {
                Role::User => "user",
                Role::Assistant => "assistant",
            };
            let tag = if msg.tool_call.is_some() {
                " [tool call]"
            } else if msg.tool_result.is_some() {
                " [tool result]"
            } else {
                ""
            };
            format!(
                "{role}{tag}: {}",
                truncate_chars(&msg.content, TRANSCRIPT_MSG_CHARS)
            )
        })
        .collect::<Vec<_>>()
        .join("\n")
}

/// Deterministic fallback when the summarization call fails: the last real
/// user ask, the last real assistant reply, and the message count.
fn extractive_summary(prefix: &[&Message]) -> String {
    let last_user = prefix
        .iter()
        .rev()
        .find(|msg| msg.role == Role::User && msg.tool_result.is_none());
    let last_assistant = prefix
        .iter()
        .rev()
        .find(|msg| msg.role == Role::Assistant && msg.tool_call.is_none());

    let mut text = format!("{} earlier messages were compacted.", prefix.len());
    if let Some(user) = last_user {
        text.push_str(&format!(
            " Last request: {}",
            truncate_chars(&user.content, 200)
        ));
    }
    if let Some(assistant) = last_assistant {
        text.push_str(&format!(
            " Last reply: {}",
            truncate_chars(&assistant.content, 200)
        ));
    }
    text
}

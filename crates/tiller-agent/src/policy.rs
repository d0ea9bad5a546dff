//! Narrow-intent detection over the user's request text.
//!
//! Certain low-risk asks ("summarize this diff", "check the repo status")
//! need one or two read-only commands and a short answer, not an open-ended
//! agentic session. A matched policy caps tool calls, restricts the tool
//! set, and decides whether the turn finalizes the moment the last allowed
//! result arrives. No match means an unconstrained turn.

/// Constrained execution contract for one turn. Computed once at turn start
/// from the user message and immutable afterwards.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TurnPolicy {
    pub name: &'static str,
    pub max_tool_calls: Option<u64>,
    pub allowed_tools: Option<&'static [&'static str]>,
    /// Request a final answer (with tools withheld) as soon as the last
    /// allowed tool result arrives, instead of letting the model decide.
    pub force_finalize_after_tool: bool,
    pub disable_todos: bool,
    pub require_commit_message: bool,
    pub note: &'static str,
}

/// Narrow intents stay narrow: anything longer than this is assumed to be a
/// real task and gets an unconstrained turn.
const MAX_INTENT_LEN: usize = 160;

/// Detect a narrow intent. Pure function; conservative on purpose, a missed
/// match just means the normal budgets apply.
pub fn detect(user_message: &str) -> Option<TurnPolicy> {
    let trimmed = user_message.trim();
    if trimmed.len() > MAX_INTENT_LEN {
        return None;
    }
    let text = trimmed.to_ascii_lowercase();

    if (text.contains("summarize") || text.contains("summarise") || text.contains("explain"))
        && text.contains("diff")
    {
        return Some(TurnPolicy {
            name: "diff_summary",
            max_tool_calls: Some(1),
            allowed_tools: Some(&["shell"]),
            force_finalize_after_tool: true,
            disable_todos: true,
            require_commit_message: false,
            note: "Run `git diff` once, then summarize what changed.",
        });
    }

    if text.contains("status")
        && (text.contains("repo")
            || text.contains("repository")
            || text.contains("git")
            || text.contains("working tree"))
    {
        return Some(TurnPolicy {
            name: "repo_status",
            max_tool_calls: Some(1),
            allowed_tools: Some(&["shell"]),
            force_finalize_after_tool: true,
            disable_todos: true,
            require_commit_message: false,
            note: "Run `git status` once, then report the state of the tree.",
        });
    }

    if text.contains("commit message") {
        return Some(TurnPolicy {
            name: "commit_message",
            max_tool_calls: Some(2),
            allowed_tools: Some(&["shell"]),
            force_finalize_after_tool: false,
            disable_todos: true,
            require_commit_message: true,
            note: "Inspect the staged changes, then reply with a commit message only.",
        });
    }

    if (text.starts_with("show me ")
        || text.starts_with("what's in ")
        || text.starts_with("what is in ")
        || text.starts_with("print "))
        && mentions_path(&text)
    {
        return Some(TurnPolicy {
            name: "file_peek",
            max_tool_calls: Some(1),
            allowed_tools: Some(&["read_file"]),
            force_finalize_after_tool: true,
            disable_todos: true,
            require_commit_message: false,
            note: "Read the named file once and show its relevant content.",
        });
    }

    None
}

fn mentions_path(text: &str) -> bool {
    text.split_whitespace().any(|token| {
        let token = token.trim_matches(|c: char| c.is_ascii_punctuation() && c != '.' && c != '/');
        token.contains('/')
            || token
                .rsplit_once('.')
                .is_some_and(|(stem, ext)| {
                    !stem.is_empty()
                        && (1..=6).contains(&ext.len())
                        && ext.chars().all(|c| c.is_ascii_alphanumeric())
                })
    })
}

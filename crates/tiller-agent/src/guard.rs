//! Repetition and progress bookkeeping for one turn.
//!
//! A proposed tool call is keyed by a deterministic signature (name plus a
//! key-sorted rendering of its input, with shell commands normalized so
//! cosmetic whitespace or a `cd <workspace> &&` prefix does not defeat the
//! match). The guard never influences business logic; it only decides when
//! a turn has stopped making progress and should end.

use serde_json::Value;
use std::collections::HashSet;
use std::path::Path;

/// Result digests compare the first this-many characters of the tool output.
const DIGEST_CHARS: usize = 1000;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GuardVerdict {
    Fresh,
    /// Same call as the previous one, but still making progress (or not yet
    /// proven to be stuck).
    Repeated,
    /// Third consecutive identical call while the first repeat reproduced the
    /// original result. Dispatching it again cannot help.
    DefiniteLoop,
}

#[derive(Debug, Default)]
pub struct LoopGuard {
    last_signature: Option<String>,
    /// How many times `last_signature` has been dispatched back-to-back.
    consecutive: usize,
    /// Result digests of the current consecutive run, oldest first.
    run_digests: Vec<String>,
    /// Every `(signature, digest)` outcome observed anywhere in the turn.
    outcomes: HashSet<(String, String)>,
    todo_noops: usize,
}

impl LoopGuard {
    pub fn new() -> Self {
        Self::default()
    }

    /// Classify a proposed call before dispatching it.
    pub fn classify(&self, signature: &str) -> GuardVerdict {
        if self.last_signature.as_deref() != Some(signature) {
            return GuardVerdict::Fresh;
        }
        if self.consecutive >= 2
            && self.run_digests.len() >= 2
            && self.run_digests[0] == self.run_digests[1]
        {
            return GuardVerdict::DefiniteLoop;
        }
        GuardVerdict::Repeated
    }

    /// Feed an executed call's result back. Returns true when this exact
    /// `(signature, digest)` outcome was already seen earlier in the turn,
    /// which catches interleaved loops (A, B, A, B, ...) the consecutive
    /// rule misses.
    pub fn record_outcome(&mut self, signature: &str, result: &str) -> bool {
        let digest = digest_of(result);
        if self.last_signature.as_deref() == Some(signature) {
            self.consecutive += 1;
            self.run_digests.push(digest.clone());
        } else {
            self.last_signature = Some(signature.to_string());
            self.consecutive = 1;
            self.run_digests = vec![digest.clone()];
        }
        !self.outcomes.insert((signature.to_string(), digest))
    }

    /// A todo update that changed nothing. Tolerated once; returns true on
    /// the second no-op of the turn.
    pub fn note_todo_noop(&mut self) -> bool {
        self.todo_noops += 1;
        self.todo_noops >= 2
    }
}

fn digest_of(result: &str) -> String {
    result.chars().take(DIGEST_CHARS).collect()
}

/// Canonical signature for a tool call. Input keys are rendered in sorted
/// order so two semantically identical calls always produce the same string.
pub fn tool_signature(tool: &str, input: &Value, workspace: &Path) -> String {
    let rendered = if tool == "shell" {
        let mut normalized = input.clone();
        if let Some(obj) = normalized.as_object_mut()
            && let Some(Value::String(cmd)) = obj.get("cmd")
        {
            let cmd = normalize_shell_cmd(cmd, workspace);
            obj.insert("cmd".to_string(), Value::String(cmd));
        }
        canonical_json(&normalized)
    } else {
        canonical_json(input)
    };
    format!("{tool}({rendered})")
}

fn canonical_json(value: &Value) -> String {
    match value {
        Value::Object(map) => {
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();
            let fields = keys
                .iter()
                .map(|key| format!("{}:{}", key, canonical_json(&map[key.as_str()])))
                .collect::<Vec<_>>()
                .join(",");
            format!("{{{fields}}}")
        }
        Value::Array(items) => {
            let rendered = items
                .iter()
                .map(canonical_json)
                .collect::<Vec<_>>()
                .join(",");
            format!("[{rendered}]")
        }
        other => other.to_string(),
    }
}

/// Collapse whitespace and strip a benign `cd <workspace> &&` prefix, so
/// "cd /work && ls -la" and "ls  -la" match when /work is the workspace.
fn normalize_shell_cmd(cmd: &str, workspace: &Path) -> String {
    let collapsed = cmd.split_whitespace().collect::<Vec<_>>().join(" ");
    if let Some(rest) = collapsed.strip_prefix("cd ")
        && let Some((target, tail)) = rest.split_once(" && ")
    {
        let target = shell_words::split(target)
            .ok()
            .and_then(|mut tokens| (tokens.len() == 1).then(|| tokens.remove(0)))
            .unwrap_or_else(|| target.to_string());
        if Path::new(&target) == workspace || target == "." {
            return tail.trim().to_string();
        }
    }
    collapsed
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn ws() -> &'static Path {
        Path::new("/work")
    }

    #[test]
    fn signature_orders_input_keys_deterministically() {
        let a = tool_signature("read_file", &json!({"path":"a.rs","start_line":2}), ws());
        let b = tool_signature("read_file", &json!({"start_line":2,"path":"a.rs"}), ws());
        assert_eq!(a, b);
        assert!(a.starts_with("read_file("));
    }

    #[test]
    fn shell_signatures_collapse_whitespace_and_cd_prefix() {
        let plain = tool_signature("shell", &json!({"cmd":"ls  -la"}), ws());
        let prefixed = tool_signature("shell", &json!({"cmd":"cd /work && ls -la"}), ws());
        assert_eq!(plain, prefixed);

        let elsewhere = tool_signature("shell", &json!({"cmd":"cd /other && ls -la"}), ws());
        assert_ne!(plain, elsewhere);
    }

    #[test]
    fn third_identical_call_with_identical_results_is_a_definite_loop() {
        let mut guard = LoopGuard::new();
        let sig = "shell({cmd:\"git status\"})";
        assert_eq!(guard.classify(sig), GuardVerdict::Fresh);
        guard.record_outcome(sig, "clean");
        assert_eq!(guard.classify(sig), GuardVerdict::Repeated);
        guard.record_outcome(sig, "clean");
        assert_eq!(guard.classify(sig), GuardVerdict::DefiniteLoop);
    }

    #[test]
    fn differing_results_keep_the_repeat_allowed() {
        let mut guard = LoopGuard::new();
        let sig = "shell({cmd:\"tail build.log\"})";
        guard.record_outcome(sig, "compiling 1/10");
        guard.record_outcome(sig, "compiling 7/10");
        // Output is changing, so polling the same command is progress.
        assert_eq!(guard.classify(sig), GuardVerdict::Repeated);
    }

    #[test]
    fn interleaved_repeated_outcome_is_reported() {
        let mut guard = LoopGuard::new();
        assert!(!guard.record_outcome("a", "out-a"));
        assert!(!guard.record_outcome("b", "out-b"));
        // Same signature AND same digest as the first call: stuck.
        assert!(guard.record_outcome("a", "out-a"));
    }

    #[test]
    fn digest_only_compares_the_first_kilochars() {
        let mut guard = LoopGuard::new();
        let long_a = format!("{}tail-one", "x".repeat(DIGEST_CHARS));
        let long_b = format!("{}tail-two", "x".repeat(DIGEST_CHARS));
        assert!(!guard.record_outcome("a", &long_a));
        // Differs only beyond the digest window, so it counts as a repeat.
        assert!(guard.record_outcome("a", &long_b));
    }

    #[test]
    fn second_todo_noop_trips() {
        let mut guard = LoopGuard::new();
        assert!(!guard.note_todo_noop());
        assert!(guard.note_todo_noop());
    }
}
